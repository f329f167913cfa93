//! Artifacts and the collaborators that consume them.
//!
//! The engine only ever calls three things with what it fetched: a
//! [`Normalizer`] turning raw items into canonical artifacts, an
//! [`ArtifactStore`] persisting one batch atomically, and an [`IndexTrigger`]
//! handing identifiers to indexing. Real implementations live in infra; the
//! in-memory ones here are for tests/dev.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use backfill_core::{BatchContext, RunId, TenantId};

use crate::retriever::CommitInfo;

/// Kind of content an artifact carries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    GithubFile,
    GithubPullRequest,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::GithubFile => "github_file",
            SourceType::GithubPullRequest => "github_pull_request",
        }
    }
}

impl core::fmt::Display for SourceType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized document. `entity_id` is the stable upsert identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub entity_id: String,
    pub source_type: SourceType,
    pub tenant_id: TenantId,
    pub content: serde_json::Value,
}

/// Raw item as fetched, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawItem {
    File {
        path: String,
        content: String,
        last_commit: Option<CommitInfo>,
    },
    PullRequest {
        number: u64,
        payload: serde_json::Value,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct NormalizeError(pub String);

pub trait Normalizer: Send + Sync {
    fn normalize(
        &self,
        tenant_id: TenantId,
        context: &BatchContext,
        item: RawItem,
    ) -> Result<Artifact, NormalizeError>;
}

/// Keeps the raw payload as content, keyed by repository coordinates.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughNormalizer;

impl PassthroughNormalizer {
    pub fn file_entity_id(context: &BatchContext, path: &str) -> String {
        format!("github:file:{}:{}", context.full_name(), path)
    }

    pub fn pull_request_entity_id(context: &BatchContext, number: u64) -> String {
        format!("github:pull:{}#{}", context.full_name(), number)
    }
}

impl Normalizer for PassthroughNormalizer {
    fn normalize(
        &self,
        tenant_id: TenantId,
        context: &BatchContext,
        item: RawItem,
    ) -> Result<Artifact, NormalizeError> {
        match item {
            RawItem::File {
                path,
                content,
                last_commit,
            } => Ok(Artifact {
                entity_id: Self::file_entity_id(context, &path),
                source_type: SourceType::GithubFile,
                tenant_id,
                content: serde_json::json!({
                    "organization": context.organization,
                    "repository": context.repository,
                    "path": path,
                    "branch": context.branch,
                    "commit_sha": context.commit_sha,
                    "last_commit": last_commit,
                    "content": content,
                }),
            }),
            RawItem::PullRequest { number, payload } => {
                if !payload.is_object() {
                    return Err(NormalizeError(format!(
                        "pull request #{number}: expected a JSON object"
                    )));
                }
                Ok(Artifact {
                    entity_id: Self::pull_request_entity_id(context, number),
                    source_type: SourceType::GithubPullRequest,
                    tenant_id,
                    content: payload,
                })
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Persistence collaborator. One call per batch; atomic and upsert-by-identity.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn store_artifact_batch(&self, artifacts: &[Artifact]) -> Result<(), StorageError>;
}

#[async_trait]
impl<S> ArtifactStore for Arc<S>
where
    S: ArtifactStore + ?Sized,
{
    async fn store_artifact_batch(&self, artifacts: &[Artifact]) -> Result<(), StorageError> {
        (**self).store_artifact_batch(artifacts).await
    }
}

/// In-memory artifact store for tests/dev.
///
/// Records every call so tests can assert "exactly one storage call".
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    inner: Mutex<StoreState>,
}

#[derive(Debug, Default)]
struct StoreState {
    calls: Vec<usize>,
    artifacts: Vec<Artifact>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sizes of every `store_artifact_batch` call, in order.
    pub fn calls(&self) -> Vec<usize> {
        self.inner.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    /// Current contents, one entry per identity.
    pub fn artifacts(&self) -> Vec<Artifact> {
        self.inner
            .lock()
            .map(|s| s.artifacts.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, entity_id: &str) -> Option<Artifact> {
        self.inner
            .lock()
            .ok()?
            .artifacts
            .iter()
            .find(|a| a.entity_id == entity_id)
            .cloned()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn store_artifact_batch(&self, artifacts: &[Artifact]) -> Result<(), StorageError> {
        let mut state = self
            .inner
            .lock()
            .map_err(|_| StorageError::Database("in-memory store lock poisoned".to_string()))?;
        state.calls.push(artifacts.len());
        for artifact in artifacts {
            match state.artifacts.iter_mut().find(|a| {
                a.tenant_id == artifact.tenant_id && a.entity_id == artifact.entity_id
            }) {
                Some(existing) => *existing = artifact.clone(),
                None => state.artifacts.push(artifact.clone()),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct IndexError(pub String);

/// One call into indexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRequest {
    pub entity_ids: Vec<String>,
    pub source_type: SourceType,
    pub tenant_id: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub suppress_notification: bool,
}

/// Host-supplied path into indexing.
#[async_trait]
pub trait IndexTrigger: Send + Sync {
    async fn trigger_indexing(
        &self,
        entity_ids: &[String],
        source_type: SourceType,
        tenant_id: TenantId,
        run_id: Option<RunId>,
        suppress_notification: bool,
    ) -> Result<(), IndexError>;
}

#[async_trait]
impl<T> IndexTrigger for Arc<T>
where
    T: IndexTrigger + ?Sized,
{
    async fn trigger_indexing(
        &self,
        entity_ids: &[String],
        source_type: SourceType,
        tenant_id: TenantId,
        run_id: Option<RunId>,
        suppress_notification: bool,
    ) -> Result<(), IndexError> {
        (**self)
            .trigger_indexing(entity_ids, source_type, tenant_id, run_id, suppress_notification)
            .await
    }
}

/// Records trigger calls (tests/dev).
#[derive(Debug, Default)]
pub struct RecordingIndexTrigger {
    requests: Mutex<Vec<IndexRequest>>,
}

impl RecordingIndexTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<IndexRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl IndexTrigger for RecordingIndexTrigger {
    async fn trigger_indexing(
        &self,
        entity_ids: &[String],
        source_type: SourceType,
        tenant_id: TenantId,
        run_id: Option<RunId>,
        suppress_notification: bool,
    ) -> Result<(), IndexError> {
        self.requests
            .lock()
            .map_err(|_| IndexError("recording trigger lock poisoned".to_string()))?
            .push(IndexRequest {
                entity_ids: entity_ids.to_vec(),
                source_type,
                tenant_id,
                run_id,
                suppress_notification,
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> BatchContext {
        BatchContext::new("acme", "widgets")
    }

    #[tokio::test]
    async fn store_upserts_by_identity() {
        let store = InMemoryArtifactStore::new();
        let tenant = TenantId::new();
        let make = |body: &str| Artifact {
            entity_id: "github:file:acme/widgets:README.md".into(),
            source_type: SourceType::GithubFile,
            tenant_id: tenant,
            content: serde_json::json!({ "content": body }),
        };

        store.store_artifact_batch(&[make("v1")]).await.unwrap();
        store.store_artifact_batch(&[make("v2")]).await.unwrap();

        assert_eq!(store.calls(), vec![1, 1]);
        assert_eq!(store.artifacts().len(), 1);
        assert_eq!(
            store.artifacts()[0].content["content"],
            serde_json::json!("v2")
        );
    }

    #[test]
    fn passthrough_keys_files_by_path() {
        let tenant = TenantId::new();
        let artifact = PassthroughNormalizer
            .normalize(
                tenant,
                &ctx(),
                RawItem::File {
                    path: "src/lib.rs".into(),
                    content: "fn main() {}".into(),
                    last_commit: None,
                },
            )
            .unwrap();
        assert_eq!(artifact.entity_id, "github:file:acme/widgets:src/lib.rs");
        assert_eq!(artifact.source_type, SourceType::GithubFile);
        assert_eq!(artifact.content["path"], "src/lib.rs");
    }

    #[test]
    fn passthrough_rejects_non_object_pull_requests() {
        let err = PassthroughNormalizer
            .normalize(
                TenantId::new(),
                &ctx(),
                RawItem::PullRequest {
                    number: 7,
                    payload: serde_json::json!("nope"),
                },
            )
            .unwrap_err();
        assert!(err.0.contains("#7"));
    }
}
