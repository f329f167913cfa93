//! Intermediate job: clone one repository, enumerate its work, fan out leaves.

use tracing::info;

use backfill_core::{BatchContext, split_full_name};
use backfill_queue::{FileBatchSpec, IntermediateSpec, JobMessage, JobSpec, WorkUnitBatchSpec};

use crate::engine::{Backfill, JobReport};
use crate::enumerator::{FileEnumerator, PullRequestEnumerator, WorkEnumerator};
use crate::error::JobError;

pub(crate) async fn run(
    engine: &Backfill,
    message: &JobMessage,
    spec: &IntermediateSpec,
) -> Result<JobReport, JobError> {
    message.validate()?;
    let (owner, name) = split_full_name(&spec.repository_full_name)?;
    let provider = engine.clients.provider.as_ref();

    let work = engine.job_dir().await?;
    let credentials = provider.git_credentials();
    let snapshot = engine
        .retriever
        .clone_repository(
            &provider.clone_url(&owner, &name),
            credentials.as_ref(),
            work.path(),
        )
        .await?;

    let mut report = JobReport::new(message, message.run_id);
    if snapshot.is_empty() {
        info!(repository = %spec.repository_full_name, "empty repository; no leaf jobs");
        return Ok(report);
    }

    let mut context = BatchContext::new(owner, name);
    context.repository_id = Some(spec.repository_id);
    context.branch = snapshot.branch().map(str::to_string);
    context.commit_sha = Some(snapshot.commit_sha().to_string());

    let file_batches = FileEnumerator::new(&engine.retriever, &snapshot)
        .batches(&context)
        .await?;
    let pull_batches = PullRequestEnumerator::new(provider, engine.gate)
        .batches(&context)
        .await?;
    drop(work);

    let file_jobs = file_batches.len();
    let pull_jobs = pull_batches.len();

    let mut children = Vec::with_capacity(file_jobs + pull_jobs);
    children.extend(file_batches.into_iter().map(|batch| {
        let (ctx, file_paths) = batch.into_parts();
        JobSpec::LeafFiles(FileBatchSpec {
            organization: ctx.organization,
            repository: ctx.repository,
            file_paths,
            branch: ctx.branch,
            commit_sha: ctx.commit_sha,
        })
    }));
    children.extend(pull_batches.into_iter().map(|batch| {
        let (ctx, work_unit_ids) = batch.into_parts();
        JobSpec::LeafWorkUnits(WorkUnitBatchSpec {
            organization: ctx.organization,
            repository: ctx.repository,
            repository_id: spec.repository_id,
            work_unit_ids,
        })
    }));

    // Registered before any child exists, so readers never see attempted > total.
    engine
        .progress
        .increment_total_ingest_jobs(message.tenant_id, message.run_id, children.len() as u64)
        .await?;

    let sent = engine.dispatcher.dispatch(message, None, children).await?;
    info!(
        repository = %spec.repository_full_name,
        file_jobs,
        pull_jobs,
        "leaf fan-out dispatched"
    );

    report.children_dispatched = sent;
    Ok(report)
}
