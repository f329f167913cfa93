use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Local read-only handle on a cloned repository.
///
/// A repository with zero commits is not a fault: it yields an explicit empty
/// snapshot (empty SHA, no branch) and callers skip all work for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneSnapshot {
    path: PathBuf,
    commit_sha: String,
    branch: Option<String>,
}

impl CloneSnapshot {
    pub fn new(path: impl Into<PathBuf>, commit_sha: impl Into<String>, branch: Option<String>) -> Self {
        Self {
            path: path.into(),
            commit_sha: commit_sha.into(),
            branch,
        }
    }

    /// Terminal snapshot for a repository without commits.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            commit_sha: String::new(),
            branch: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commit_sha.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn commit_sha(&self) -> &str {
        &self.commit_sha
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }
}
