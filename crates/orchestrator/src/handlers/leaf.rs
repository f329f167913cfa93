//! Leaf jobs: fetch and persist one bounded batch.
//!
//! Both bodies run inside [`ProgressTracker::track_leaf`], so validation
//! failures count as attempts too.
//!
//! [`ProgressTracker::track_leaf`]: crate::progress::ProgressTracker::track_leaf

use tracing::info;

use backfill_core::{
    CloneSnapshot, MAX_FILE_PATHS_PER_BATCH, MAX_WORK_UNITS_PER_BATCH, WorkBatch,
};
use backfill_queue::{FileBatchSpec, JobMessage, WorkUnitBatchSpec};

use crate::artifact::{ArtifactStore, IndexTrigger};
use crate::engine::{Backfill, JobReport};
use crate::error::JobError;

pub(crate) async fn files(
    engine: &Backfill,
    message: &JobMessage,
    spec: &FileBatchSpec,
    storage: &dyn ArtifactStore,
    trigger: &dyn IndexTrigger,
) -> Result<JobReport, JobError> {
    let entity_ids = engine
        .progress
        .track_leaf(message.tenant_id, message.run_id, async {
            message.validate()?;
            let provider = engine.clients.provider.as_ref();

            let work = engine.job_dir().await?;
            let credentials = provider.git_credentials();
            let cloned = engine
                .retriever
                .clone_repository(
                    &provider.clone_url(&spec.organization, &spec.repository),
                    credentials.as_ref(),
                    work.path(),
                )
                .await?;
            if cloned.is_empty() {
                info!("repository is empty; nothing to fetch");
                return Ok(Vec::new());
            }

            // Pin to the commit the parent enumerated, when it recorded one.
            let snapshot = CloneSnapshot::new(
                cloned.path(),
                spec.commit_sha
                    .clone()
                    .unwrap_or_else(|| cloned.commit_sha().to_string()),
                spec.branch
                    .clone()
                    .or_else(|| cloned.branch().map(str::to_string)),
            );
            let mut context = spec.context();
            context.commit_sha = Some(snapshot.commit_sha().to_string());
            context.branch = snapshot.branch().map(str::to_string);
            let batch = WorkBatch::new(context, spec.file_paths.clone(), MAX_FILE_PATHS_PER_BATCH)?;

            engine
                .processor(storage, trigger, message)
                .process_files(&engine.retriever, &snapshot, &batch)
                .await
        })
        .await?;

    let mut report = JobReport::new(message, message.run_id);
    report.entity_ids = entity_ids;
    Ok(report)
}

pub(crate) async fn work_units(
    engine: &Backfill,
    message: &JobMessage,
    spec: &WorkUnitBatchSpec,
    storage: &dyn ArtifactStore,
    trigger: &dyn IndexTrigger,
) -> Result<JobReport, JobError> {
    let entity_ids = engine
        .progress
        .track_leaf(message.tenant_id, message.run_id, async {
            message.validate()?;
            let batch = WorkBatch::new(
                spec.context(),
                spec.work_unit_ids.clone(),
                MAX_WORK_UNITS_PER_BATCH,
            )?;
            engine
                .processor(storage, trigger, message)
                .process_work_units(engine.clients.provider.as_ref(), engine.gate, &batch)
                .await
        })
        .await?;

    let mut report = JobReport::new(message, message.run_id);
    report.entity_ids = entity_ids;
    Ok(report)
}
