use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use backfill_infra::{
    GitHubClient, JobConsumer, JobConsumerConfig, PostgresArtifactStore, PostgresProgressStore,
    ProcessGitRunner, RedisIndexTrigger, RedisJobQueue, RedisStreamsConfig, WorkerConfig,
    ensure_schema,
};
use backfill_orchestrator::{Backfill, ClientRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    backfill_observability::init();

    let config = WorkerConfig::from_env().context("loading worker configuration")?;
    if config.github_token.is_none() {
        warn!("GITHUB_TOKEN not set; only public repositories will be reachable");
    }

    let pool = PgPoolOptions::new()
        .max_connections((config.max_concurrent_jobs as u32).saturating_mul(2).max(4))
        .connect(&config.database_url)
        .await
        .context("connecting to Postgres")?;
    ensure_schema(&pool).await.context("creating schema")?;

    let queue = Arc::new(
        RedisJobQueue::connect(
            &config.redis_url,
            RedisStreamsConfig::new(&config.stream, &config.group, &config.consumer)
                .with_visibility_timeout(config.visibility_timeout),
        )
        .await
        .context("connecting job queue")?,
    );
    let trigger = Arc::new(
        RedisIndexTrigger::connect(&config.redis_url, &config.index_stream)
            .await
            .context("connecting index trigger")?,
    );

    let clients = ClientRegistry::new(
        Arc::new(GitHubClient::new(
            &config.github_api_url,
            config.github_token.clone(),
        )),
        queue.clone(),
        Arc::new(PostgresProgressStore::new(pool.clone())),
        Arc::new(ProcessGitRunner::new(config.git_timeout)),
    );
    let engine = Arc::new(Backfill::new(clients, config.backfill()));

    let handle = JobConsumer::new(
        engine,
        queue,
        Arc::new(PostgresArtifactStore::new(pool)),
        trigger,
    )
    .with_retry_policy(config.retry_policy())
    .with_config(
        JobConsumerConfig::default()
            .with_name(&config.consumer)
            .with_max_concurrent(config.max_concurrent_jobs),
    )
    .spawn();

    info!(
        consumer = %config.consumer,
        stream = %config.stream,
        max_concurrent = config.max_concurrent_jobs,
        "backfill worker running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested; draining in-flight jobs");

    let stats = handle.shutdown().await;
    info!(
        processed = stats.jobs_processed,
        succeeded = stats.jobs_succeeded,
        dead_lettered = stats.jobs_dead_lettered,
        "backfill worker stopped"
    );
    Ok(())
}
