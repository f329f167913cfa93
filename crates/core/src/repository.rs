//! Repository coordinates.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult, require_non_blank};

/// A provider repository, addressed by owner/name and provider id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub owner: String,
    pub name: String,
    pub id: u64,
}

impl RepositoryRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, id: u64) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            id,
        }
    }

    /// `owner/name`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Split an `owner/name` string.
pub fn split_full_name(full_name: &str) -> DomainResult<(String, String)> {
    let trimmed = full_name.trim();
    let (owner, name) = trimmed
        .split_once('/')
        .ok_or_else(|| DomainError::validation(format!("expected owner/name, got {trimmed:?}")))?;
    require_non_blank("repository owner", owner)?;
    require_non_blank("repository name", name)?;
    if name.contains('/') {
        return Err(DomainError::validation(format!(
            "expected owner/name, got {trimmed:?}"
        )));
    }
    Ok((owner.to_string(), name.to_string()))
}
