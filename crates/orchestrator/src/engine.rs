//! Job execution entry point exposed to the queue host.

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use tracing::{Span, field, instrument, warn};

use backfill_core::{JobId, JobRole, RunId};
use backfill_queue::{JobMessage, JobQueue, JobSpec};

use crate::artifact::{ArtifactStore, IndexTrigger, Normalizer, PassthroughNormalizer};
use crate::batch::{
    BatchProcessor, BatchScope, DEFAULT_FETCH_CONCURRENCY, DEFAULT_INDEX_BATCH_SIZE,
};
use crate::dispatcher::{DISPATCH_CONCURRENCY, Dispatcher};
use crate::error::JobError;
use crate::handlers;
use crate::progress::{ProgressStore, ProgressTracker};
use crate::provider::ProviderClient;
use crate::ratelimit::RateLimitGate;
use crate::retriever::{GitRunner, RepositoryRetriever};

/// Long-lived clients, constructed once per process and shared by every job.
#[derive(Clone)]
pub struct ClientRegistry {
    pub provider: Arc<dyn ProviderClient>,
    pub queue: Arc<dyn JobQueue>,
    pub progress: Arc<dyn ProgressStore>,
    pub git: Arc<dyn GitRunner>,
    pub normalizer: Arc<dyn Normalizer>,
}

impl ClientRegistry {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        queue: Arc<dyn JobQueue>,
        progress: Arc<dyn ProgressStore>,
        git: Arc<dyn GitRunner>,
    ) -> Self {
        Self {
            provider,
            queue,
            progress,
            git,
            normalizer: Arc::new(PassthroughNormalizer),
        }
    }

    pub fn with_normalizer(mut self, normalizer: Arc<dyn Normalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }
}

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Parent of the per-job scratch directories clones land in.
    pub work_dir: PathBuf,
    pub fetch_concurrency: usize,
    pub index_batch_size: usize,
    pub dispatch_concurrency: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir(),
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            index_batch_size: DEFAULT_INDEX_BATCH_SIZE,
            dispatch_concurrency: DISPATCH_CONCURRENCY,
        }
    }
}

impl BackfillConfig {
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }
}

/// What one job did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub job_id: JobId,
    pub role: JobRole,
    pub run_id: Option<RunId>,
    pub children_dispatched: usize,
    pub entity_ids: Vec<String>,
}

impl JobReport {
    pub(crate) fn new(message: &JobMessage, run_id: Option<RunId>) -> Self {
        Self {
            job_id: message.job_id,
            role: message.role(),
            run_id,
            children_dispatched: 0,
            entity_ids: Vec::new(),
        }
    }
}

/// The backfill engine.
pub struct Backfill {
    pub(crate) clients: ClientRegistry,
    pub(crate) config: BackfillConfig,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) progress: ProgressTracker,
    pub(crate) retriever: RepositoryRetriever,
    pub(crate) gate: RateLimitGate,
}

impl Backfill {
    pub fn new(clients: ClientRegistry, config: BackfillConfig) -> Self {
        Self {
            dispatcher: Dispatcher::with_concurrency(
                clients.queue.clone(),
                config.dispatch_concurrency,
            ),
            progress: ProgressTracker::new(clients.progress.clone()),
            retriever: RepositoryRetriever::new(clients.git.clone()),
            gate: RateLimitGate::default(),
            clients,
            config,
        }
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Execute one job to completion.
    ///
    /// Never retries in-process: failures are returned classified (see
    /// [`JobError::class`]) and the host decides on redelivery.
    #[instrument(
        skip_all,
        fields(
            job_id = %job_id,
            tenant_id = %message.tenant_id,
            role = message.spec.kind(),
            run_id = field::Empty,
        ),
        err
    )]
    pub async fn process_job(
        &self,
        job_id: JobId,
        message: &JobMessage,
        storage: &dyn ArtifactStore,
        trigger: &dyn IndexTrigger,
    ) -> Result<JobReport, JobError> {
        if job_id != message.job_id {
            warn!(message_job_id = %message.job_id, "job id differs from message");
        }
        if let Some(run_id) = message.run_id {
            Span::current().record("run_id", field::display(run_id));
        }

        match &message.spec {
            JobSpec::Root(spec) => handlers::root::run(self, message, spec).await,
            JobSpec::Intermediate(spec) => handlers::intermediate::run(self, message, spec).await,
            JobSpec::LeafFiles(spec) => {
                handlers::leaf::files(self, message, spec, storage, trigger).await
            }
            JobSpec::LeafWorkUnits(spec) => {
                handlers::leaf::work_units(self, message, spec, storage, trigger).await
            }
        }
    }

    /// Fresh scratch directory for one job; removed on drop.
    pub(crate) async fn job_dir(&self) -> Result<TempDir, JobError> {
        tokio::fs::create_dir_all(&self.config.work_dir).await?;
        Ok(tempfile::Builder::new()
            .prefix("backfill-")
            .tempdir_in(&self.config.work_dir)?)
    }

    pub(crate) fn processor<'a>(
        &'a self,
        storage: &'a dyn ArtifactStore,
        trigger: &'a dyn IndexTrigger,
        message: &JobMessage,
    ) -> BatchProcessor<'a> {
        BatchProcessor::new(
            storage,
            trigger,
            self.clients.normalizer.as_ref(),
            &self.progress,
            BatchScope {
                tenant_id: message.tenant_id,
                run_id: message.run_id,
                suppress_notification: message.suppress_notification,
            },
        )
        .with_index_batch_size(self.config.index_batch_size)
        .with_fetch_concurrency(self.config.fetch_concurrency)
    }
}
