//! Leaf-level batch processing.
//!
//! Fetch every unit, normalize, persist the whole batch in one storage call,
//! then trigger indexing in sub-batches. Two item policies coexist:
//!
//! - file paths are **tolerant**: an unreadable or missing file is skipped
//!   with a warning and the rest of the batch still persists;
//! - provider work units are **strict**: the first failed fetch aborts the
//!   batch before anything is stored, so redelivery retries all of it.

use futures::{StreamExt, TryStreamExt, stream};
use tracing::{debug, info, warn};

use backfill_core::{CloneSnapshot, RunId, TenantId, WorkBatch};

use crate::artifact::{Artifact, ArtifactStore, IndexTrigger, Normalizer, RawItem, SourceType};
use crate::error::JobError;
use crate::progress::ProgressTracker;
use crate::provider::ProviderClient;
use crate::ratelimit::RateLimitGate;
use crate::retriever::RepositoryRetriever;

/// Default number of entity ids per indexing call.
pub const DEFAULT_INDEX_BATCH_SIZE: usize = 100;

/// Default number of concurrent per-item provider fetches.
pub const DEFAULT_FETCH_CONCURRENCY: usize = 8;

/// Result of fetching one unit.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Fetched(Artifact),
    Skipped { unit: String, reason: String },
}

/// Split outcomes into artifacts to persist and skip reasons, logging each skip.
pub fn partition_outcomes(outcomes: Vec<ItemOutcome>) -> (Vec<Artifact>, Vec<(String, String)>) {
    let mut artifacts = Vec::with_capacity(outcomes.len());
    let mut skipped = Vec::new();
    for outcome in outcomes {
        match outcome {
            ItemOutcome::Fetched(artifact) => artifacts.push(artifact),
            ItemOutcome::Skipped { unit, reason } => {
                warn!(unit = %unit, reason = %reason, "skipping item");
                skipped.push((unit, reason));
            }
        }
    }
    (artifacts, skipped)
}

/// Who the batch belongs to, for indexing and progress.
#[derive(Debug, Clone, Copy)]
pub struct BatchScope {
    pub tenant_id: TenantId,
    pub run_id: Option<RunId>,
    pub suppress_notification: bool,
}

pub struct BatchProcessor<'a> {
    storage: &'a dyn ArtifactStore,
    trigger: &'a dyn IndexTrigger,
    normalizer: &'a dyn Normalizer,
    progress: &'a ProgressTracker,
    scope: BatchScope,
    index_batch_size: usize,
    fetch_concurrency: usize,
}

impl<'a> BatchProcessor<'a> {
    pub fn new(
        storage: &'a dyn ArtifactStore,
        trigger: &'a dyn IndexTrigger,
        normalizer: &'a dyn Normalizer,
        progress: &'a ProgressTracker,
        scope: BatchScope,
    ) -> Self {
        Self {
            storage,
            trigger,
            normalizer,
            progress,
            scope,
            index_batch_size: DEFAULT_INDEX_BATCH_SIZE,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
        }
    }

    pub fn with_index_batch_size(mut self, size: usize) -> Self {
        self.index_batch_size = size.max(1);
        self
    }

    pub fn with_fetch_concurrency(mut self, concurrency: usize) -> Self {
        self.fetch_concurrency = concurrency.max(1);
        self
    }

    async fn read_file(
        &self,
        retriever: &RepositoryRetriever,
        snapshot: &CloneSnapshot,
        batch: &WorkBatch<String>,
        path: &str,
    ) -> ItemOutcome {
        let skipped = |reason: String| ItemOutcome::Skipped {
            unit: path.to_string(),
            reason,
        };

        let bytes = match tokio::fs::read(snapshot.path().join(path)).await {
            Ok(bytes) => bytes,
            Err(err) => return skipped(format!("unreadable: {err}")),
        };
        let content = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => return skipped("not valid UTF-8".to_string()),
        };
        let last_commit = retriever.last_commit(snapshot, path).await;

        match self.normalizer.normalize(
            self.scope.tenant_id,
            batch.context(),
            RawItem::File {
                path: path.to_string(),
                content,
                last_commit,
            },
        ) {
            Ok(artifact) => ItemOutcome::Fetched(artifact),
            Err(err) => skipped(format!("normalize: {err}")),
        }
    }

    /// Tolerant file batch. Returns the persisted entity ids.
    pub async fn process_files(
        &self,
        retriever: &RepositoryRetriever,
        snapshot: &CloneSnapshot,
        batch: &WorkBatch<String>,
    ) -> Result<Vec<String>, JobError> {
        if snapshot.is_empty() {
            info!("empty repository; nothing to fetch");
            return Ok(Vec::new());
        }

        let fetched = retriever.fetch_paths(snapshot, batch.units()).await?;

        let mut outcomes = Vec::with_capacity(batch.len());
        for path in batch.units() {
            if fetched.missing.contains(path) {
                outcomes.push(ItemOutcome::Skipped {
                    unit: path.clone(),
                    reason: "missing at commit".to_string(),
                });
                continue;
            }
            outcomes.push(self.read_file(retriever, snapshot, batch, path).await);
        }

        let (artifacts, skipped) = partition_outcomes(outcomes);
        debug!(
            fetched = artifacts.len(),
            skipped = skipped.len(),
            "file batch fetched"
        );
        self.persist(SourceType::GithubFile, artifacts).await
    }

    /// Strict work-unit batch. Any fetch failure fails the batch unpersisted.
    pub async fn process_work_units(
        &self,
        provider: &dyn ProviderClient,
        gate: RateLimitGate,
        batch: &WorkBatch<u64>,
    ) -> Result<Vec<String>, JobError> {
        let context = batch.context();
        let artifacts: Vec<Artifact> = stream::iter(batch.units().iter().copied())
            .map(|number| async move {
                let payload = gate
                    .call(
                        "get_pull_request",
                        provider.get_pull_request(
                            &context.organization,
                            &context.repository,
                            number,
                        ),
                    )
                    .await?;
                let artifact = self.normalizer.normalize(
                    self.scope.tenant_id,
                    context,
                    RawItem::PullRequest { number, payload },
                )?;
                Ok::<_, JobError>(artifact)
            })
            .buffered(self.fetch_concurrency)
            .try_collect()
            .await?;

        self.persist(SourceType::GithubPullRequest, artifacts).await
    }

    /// One storage call, then indexing in sub-batches.
    pub async fn persist(
        &self,
        source_type: SourceType,
        artifacts: Vec<Artifact>,
    ) -> Result<Vec<String>, JobError> {
        if artifacts.is_empty() {
            debug!(source_type = %source_type, "nothing to persist");
            return Ok(Vec::new());
        }

        let entity_ids: Vec<String> = artifacts.iter().map(|a| a.entity_id.clone()).collect();
        self.storage.store_artifact_batch(&artifacts).await?;

        let BatchScope {
            tenant_id,
            run_id,
            suppress_notification,
        } = self.scope;
        for chunk in entity_ids.chunks(self.index_batch_size) {
            self.progress
                .increment_total_index_jobs(tenant_id, run_id, 1)
                .await?;
            self.trigger
                .trigger_indexing(chunk, source_type, tenant_id, run_id, suppress_notification)
                .await?;
        }

        info!(
            source_type = %source_type,
            stored = entity_ids.len(),
            index_jobs = entity_ids.len().div_ceil(self.index_batch_size),
            "batch persisted"
        );
        Ok(entity_ids)
    }
}
