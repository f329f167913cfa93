//! Root job: account-scope discovery, one intermediate job per repository.

use std::collections::HashSet;

use tracing::{Span, field, info, warn};

use backfill_core::{BackfillRun, RepositoryRef, RunId, split_full_name};
use backfill_queue::{IntermediateSpec, JobMessage, JobSpec, RootSpec};

use crate::engine::{Backfill, JobReport};
use crate::error::{JobError, ProviderError};

pub(crate) async fn run(
    engine: &Backfill,
    message: &JobMessage,
    spec: &RootSpec,
) -> Result<JobReport, JobError> {
    message.validate()?;

    let run_id = message
        .run_id
        .unwrap_or_else(|| RunId::for_root_job(message.job_id));
    let run = BackfillRun::new(run_id, message.tenant_id, message.suppress_notification);
    Span::current().record("run_id", field::display(run.run_id()));

    let repositories = discover(engine, spec).await?;
    if repositories.is_empty() {
        info!("no repositories discovered");
    }

    let children: Vec<JobSpec> = repositories
        .iter()
        .map(|repo| {
            JobSpec::Intermediate(IntermediateSpec {
                repository_full_name: repo.full_name(),
                repository_id: repo.id,
            })
        })
        .collect();

    let sent = engine
        .dispatcher
        .dispatch(message, Some(run.run_id()), children)
        .await?;
    info!(repositories = sent, "root fan-out dispatched");

    let mut report = JobReport::new(message, Some(run.run_id()));
    report.children_dispatched = sent;
    Ok(report)
}

/// Repositories in scope, de-duplicated by provider id, in discovery order.
///
/// Both lists empty means everything the credentials can see. Explicitly named
/// repositories that no longer exist are skipped.
async fn discover(engine: &Backfill, spec: &RootSpec) -> Result<Vec<RepositoryRef>, JobError> {
    let provider = engine.clients.provider.as_ref();
    let gate = engine.gate;
    let mut found = Vec::new();

    if spec.repositories.is_empty() && spec.organizations.is_empty() {
        found.extend(
            gate.call(
                "list_accessible_repositories",
                provider.list_accessible_repositories(),
            )
            .await?,
        );
    } else {
        for organization in &spec.organizations {
            found.extend(
                gate.call(
                    "list_organization_repositories",
                    provider.list_organization_repositories(organization),
                )
                .await?,
            );
        }
        for full_name in &spec.repositories {
            let (owner, name) = split_full_name(full_name)?;
            match gate
                .call("get_repository", provider.get_repository(&owner, &name))
                .await
            {
                Ok(repo) => found.push(repo),
                Err(JobError::Provider(ProviderError::NotFound(_))) => {
                    warn!(repository = %full_name, "repository not found; skipping");
                }
                Err(err) => return Err(err),
            }
        }
    }

    let mut seen = HashSet::new();
    found.retain(|repo| seen.insert(repo.id));
    Ok(found)
}
