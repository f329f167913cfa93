//! Queue consumer: pulls deliveries, runs them through the engine and settles
//! each one according to how the job failed.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use backfill_orchestrator::{ArtifactStore, Backfill, ErrorClass, IndexTrigger};
use backfill_queue::{Delivery, JobSource};

use super::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct JobConsumerConfig {
    /// Sleep between polls when the queue is idle.
    pub poll_interval: Duration,
    pub max_concurrent: usize,
    pub name: String,
}

impl Default for JobConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_concurrent: 4,
            name: "backfill-consumer".to_string(),
        }
    }
}

impl JobConsumerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsumerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_deferred: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_panicked: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    /// Rate limited: redelivered after the provider's reset, attempt unchanged.
    Deferred { delay: Duration },
    /// Transient failure: redelivered with backoff as attempt `attempt`.
    Retried { delay: Duration, attempt: u32 },
    DeadLettered { reason: String },
    /// Settling itself failed; the delivery comes back after the visibility timeout.
    Unsettled,
}

pub struct JobConsumer {
    engine: Arc<Backfill>,
    source: Arc<dyn JobSource>,
    storage: Arc<dyn ArtifactStore>,
    trigger: Arc<dyn IndexTrigger>,
    retry: RetryPolicy,
    config: JobConsumerConfig,
    stats: Arc<Mutex<ConsumerStats>>,
}

/// Handle to a spawned consumer loop.
#[derive(Debug)]
pub struct JobConsumerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl JobConsumerHandle {
    /// Stop receiving, wait for in-flight jobs to settle. Returns the final stats.
    pub async fn shutdown(self) -> ConsumerStats {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            error!(error = %err, "consumer loop ended abnormally");
        }
        lock_stats(&self.stats).clone()
    }

    pub fn stats(&self) -> ConsumerStats {
        lock_stats(&self.stats).clone()
    }
}

fn lock_stats(stats: &Mutex<ConsumerStats>) -> MutexGuard<'_, ConsumerStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl JobConsumer {
    pub fn new(
        engine: Arc<Backfill>,
        source: Arc<dyn JobSource>,
        storage: Arc<dyn ArtifactStore>,
        trigger: Arc<dyn IndexTrigger>,
    ) -> Self {
        Self {
            engine,
            source,
            storage,
            trigger,
            retry: RetryPolicy::default(),
            config: JobConsumerConfig::default(),
            stats: Arc::new(Mutex::new(ConsumerStats::default())),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_config(mut self, config: JobConsumerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn stats(&self) -> ConsumerStats {
        lock_stats(&self.stats).clone()
    }

    fn record(&self, update: impl FnOnce(&mut ConsumerStats)) {
        let mut stats = lock_stats(&self.stats);
        update(&mut *stats);
    }

    pub fn spawn(self) -> JobConsumerHandle {
        let (shutdown, rx) = watch::channel(false);
        let stats = self.stats.clone();
        let join = tokio::spawn(Arc::new(self).run(rx));
        JobConsumerHandle {
            shutdown,
            join,
            stats,
        }
    }

    /// Receive and process until `shutdown` flips to true, then drain.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(consumer = %self.config.name, "job consumer started");
        let started = Instant::now();
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent));
        let mut tasks = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.record(|s| s.uptime_secs = started.elapsed().as_secs());
            while let Some(done) = tasks.try_join_next() {
                log_join(done);
            }

            let free = permits.available_permits();
            if free == 0 {
                tokio::select! {
                    done = tasks.join_next() => {
                        if let Some(done) = done {
                            log_join(done);
                        }
                    }
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            let deliveries = match self.source.receive(free).await {
                Ok(deliveries) => deliveries,
                Err(err) => {
                    error!(consumer = %self.config.name, error = %err, "receive failed");
                    Vec::new()
                }
            };

            if deliveries.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            for delivery in deliveries {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let consumer = self.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    consumer.handle(delivery).await
                });
            }
        }

        info!(
            consumer = %self.config.name,
            in_flight = tasks.len(),
            "job consumer draining"
        );
        while let Some(done) = tasks.join_next().await {
            log_join(done);
        }
        info!(consumer = %self.config.name, "job consumer stopped");
    }

    /// Process one delivery and settle it.
    pub async fn handle(&self, delivery: Delivery) -> Settlement {
        self.record(|s| s.current_running += 1);
        let settlement = self.process(&delivery).await;
        self.record(|s| {
            s.current_running = s.current_running.saturating_sub(1);
            s.jobs_processed += 1;
            match &settlement {
                Settlement::Acked => s.jobs_succeeded += 1,
                Settlement::Deferred { .. } => s.jobs_deferred += 1,
                Settlement::Retried { .. } => s.jobs_retried += 1,
                Settlement::DeadLettered { .. } => s.jobs_dead_lettered += 1,
                Settlement::Unsettled => {}
            }
        });
        settlement
    }

    async fn process(&self, delivery: &Delivery) -> Settlement {
        let message = match delivery.decode() {
            Ok(message) => message,
            Err(err) => {
                let reason = format!("malformed message: {err}");
                warn!(receipt = %delivery.receipt, error = %err, "dead-lettering malformed message");
                return self.dead_letter(delivery, reason).await;
            }
        };

        let run = self.engine.process_job(
            message.job_id,
            &message,
            self.storage.as_ref(),
            self.trigger.as_ref(),
        );
        let (class, reason, retry_after) = match AssertUnwindSafe(run).catch_unwind().await {
            Ok(Ok(report)) => {
                debug!(
                    job_id = %report.job_id,
                    role = report.role.as_str(),
                    children = report.children_dispatched,
                    entities = report.entity_ids.len(),
                    "job finished"
                );
                return match self.source.ack(delivery).await {
                    Ok(()) => Settlement::Acked,
                    Err(err) => {
                        error!(job_id = %message.job_id, error = %err, "ack failed");
                        Settlement::Unsettled
                    }
                };
            }
            Ok(Err(err)) => (
                err.class(),
                err.to_string(),
                err.rate_limit().map(|s| s.retry_after),
            ),
            Err(_) => {
                self.record(|s| s.jobs_panicked += 1);
                error!(job_id = %message.job_id, "job panicked");
                (ErrorClass::Transient, "job panicked".to_string(), None)
            }
        };

        match (class, retry_after) {
            (ErrorClass::RateLimited, Some(delay)) => {
                info!(
                    job_id = %message.job_id,
                    delay_secs = delay.as_secs(),
                    "rate limited; deferring"
                );
                match self.source.defer(delivery, delay, delivery.attempt).await {
                    Ok(()) => Settlement::Deferred { delay },
                    Err(err) => {
                        error!(job_id = %message.job_id, error = %err, "defer failed");
                        Settlement::Unsettled
                    }
                }
            }
            (ErrorClass::Configuration, _) => {
                error!(job_id = %message.job_id, error = %reason, "configuration error; dead-lettering");
                self.dead_letter(delivery, reason).await
            }
            _ => {
                let failures = delivery.attempt.saturating_add(1);
                if !self.retry.should_retry(failures) {
                    warn!(job_id = %message.job_id, failures, error = %reason, "retries exhausted");
                    return self
                        .dead_letter(delivery, format!("after {failures} attempts: {reason}"))
                        .await;
                }
                let delay = self.retry.delay_for_attempt(failures);
                warn!(
                    job_id = %message.job_id,
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "job failed; redelivering"
                );
                match self.source.defer(delivery, delay, failures).await {
                    Ok(()) => Settlement::Retried {
                        delay,
                        attempt: failures,
                    },
                    Err(err) => {
                        error!(job_id = %message.job_id, error = %err, "defer failed");
                        Settlement::Unsettled
                    }
                }
            }
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: String) -> Settlement {
        match self.source.dead_letter(delivery, &reason).await {
            Ok(()) => Settlement::DeadLettered { reason },
            Err(err) => {
                error!(receipt = %delivery.receipt, error = %err, "dead-letter failed");
                Settlement::Unsettled
            }
        }
    }
}

fn log_join(done: Result<Settlement, tokio::task::JoinError>) {
    if let Err(err) = done {
        error!(error = %err, "consumer task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use async_trait::async_trait;
    use backfill_core::{RateLimitSignal, RepositoryRef, TenantId};
    use backfill_orchestrator::{
        BackfillConfig, ClientRegistry, GitCredentials, GitError, GitRunner,
        InMemoryArtifactStore, InMemoryProgressStore, ProviderClient, ProviderError,
        RecordingIndexTrigger,
    };
    use backfill_queue::{
        InMemoryJobQueue, JobMessage, JobQueue, JobSpec, RootSpec, WorkUnitBatchSpec,
    };

    #[derive(Clone, Copy)]
    enum Listing {
        Empty,
        RateLimited,
        ServerError,
        Panic,
    }

    struct ScriptedProvider(Listing);

    #[async_trait]
    impl ProviderClient for ScriptedProvider {
        async fn list_accessible_repositories(&self) -> Result<Vec<RepositoryRef>, ProviderError> {
            match self.0 {
                Listing::Empty => Ok(vec![]),
                Listing::RateLimited => Err(ProviderError::RateLimited(RateLimitSignal::after(
                    Duration::from_secs(30),
                ))),
                Listing::ServerError => Err(ProviderError::Status {
                    status: 502,
                    message: "bad gateway".into(),
                }),
                Listing::Panic => panic!("provider blew up"),
            }
        }

        async fn list_organization_repositories(
            &self,
            _organization: &str,
        ) -> Result<Vec<RepositoryRef>, ProviderError> {
            Ok(vec![])
        }

        async fn get_repository(
            &self,
            owner: &str,
            name: &str,
        ) -> Result<RepositoryRef, ProviderError> {
            Err(ProviderError::NotFound(format!("{owner}/{name}")))
        }

        async fn list_pull_request_numbers(
            &self,
            _owner: &str,
            _name: &str,
        ) -> Result<Vec<u64>, ProviderError> {
            Ok(vec![])
        }

        async fn get_pull_request(
            &self,
            _owner: &str,
            _name: &str,
            number: u64,
        ) -> Result<serde_json::Value, ProviderError> {
            Ok(serde_json::json!({ "number": number }))
        }

        fn clone_url(&self, owner: &str, name: &str) -> String {
            format!("https://git.test/{owner}/{name}.git")
        }

        fn git_credentials(&self) -> Option<GitCredentials> {
            None
        }
    }

    struct NoGit;

    #[async_trait]
    impl GitRunner for NoGit {
        async fn run(&self, _cwd: &Path, args: &[String]) -> Result<String, GitError> {
            Err(GitError::Spawn(format!("git disabled in tests: {}", args.join(" "))))
        }
    }

    fn consumer(listing: Listing, queue: Arc<InMemoryJobQueue>, retry: RetryPolicy) -> JobConsumer {
        let clients = ClientRegistry::new(
            Arc::new(ScriptedProvider(listing)),
            queue.clone(),
            Arc::new(InMemoryProgressStore::new()),
            Arc::new(NoGit),
        );
        let engine = Arc::new(Backfill::new(clients, BackfillConfig::default()));
        JobConsumer::new(
            engine,
            queue,
            Arc::new(InMemoryArtifactStore::new()),
            Arc::new(RecordingIndexTrigger::new()),
        )
        .with_retry_policy(retry)
    }

    async fn deliver_root(queue: &InMemoryJobQueue) -> Delivery {
        queue
            .send(&JobMessage::root(TenantId::new(), RootSpec::default(), false))
            .await
            .unwrap();
        queue.receive(1).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn success_is_acked() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let c = consumer(Listing::Empty, queue.clone(), RetryPolicy::default());

        let delivery = deliver_root(&queue).await;
        assert_eq!(c.handle(delivery).await, Settlement::Acked);
        assert_eq!(queue.acked(), 1);
        assert_eq!(c.stats().jobs_succeeded, 1);
    }

    #[tokio::test]
    async fn rate_limit_defers_without_consuming_an_attempt() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let c = consumer(Listing::RateLimited, queue.clone(), RetryPolicy::default());

        let mut delivery = deliver_root(&queue).await;
        delivery.attempt = 2;
        let settlement = c.handle(delivery).await;
        assert_eq!(
            settlement,
            Settlement::Deferred {
                delay: Duration::from_secs(30)
            }
        );
        let deferred = queue.deferred();
        assert_eq!(deferred[0].attempt, 2);
        assert_eq!(deferred[0].delay, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn transient_failures_back_off_then_dead_letter() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let retry = RetryPolicy::fixed(2, Duration::from_millis(10));
        let c = consumer(Listing::ServerError, queue.clone(), retry);

        let delivery = deliver_root(&queue).await;
        assert_eq!(
            c.handle(delivery).await,
            Settlement::Retried {
                delay: Duration::from_millis(10),
                attempt: 1
            }
        );

        queue.release_deferred();
        let redelivered = queue.receive(1).await.unwrap().remove(0);
        assert_eq!(redelivered.attempt, 1);
        let settlement = c.handle(redelivered).await;
        assert!(matches!(settlement, Settlement::DeadLettered { ref reason } if reason.contains("after 2 attempts")));
        assert_eq!(queue.dead_letters().len(), 1);
        assert_eq!(c.stats().jobs_dead_lettered, 1);
    }

    #[tokio::test]
    async fn configuration_errors_dead_letter_immediately() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let c = consumer(Listing::Empty, queue.clone(), RetryPolicy::default());

        let root = JobMessage::root(TenantId::new(), RootSpec::default(), false);
        let leaf = root.child(
            0,
            None,
            JobSpec::LeafWorkUnits(WorkUnitBatchSpec {
                organization: "acme".into(),
                repository: "widgets".into(),
                repository_id: 0,
                work_unit_ids: vec![],
            }),
        );
        queue.send(&leaf).await.unwrap();
        let delivery = queue.receive(1).await.unwrap().remove(0);

        assert!(matches!(c.handle(delivery).await, Settlement::DeadLettered { .. }));
        assert!(queue.deferred().is_empty());
    }

    #[tokio::test]
    async fn malformed_payloads_are_dead_lettered() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let c = consumer(Listing::Empty, queue.clone(), RetryPolicy::default());

        queue.push_raw("{not json");
        let delivery = queue.receive(1).await.unwrap().remove(0);
        let settlement = c.handle(delivery).await;

        assert!(matches!(settlement, Settlement::DeadLettered { ref reason } if reason.starts_with("malformed message")));
        assert_eq!(queue.dead_letters()[0].0, "{not json");
    }

    #[tokio::test]
    async fn panics_are_contained_and_retried() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let c = consumer(Listing::Panic, queue.clone(), RetryPolicy::default());

        let delivery = deliver_root(&queue).await;
        assert!(matches!(c.handle(delivery).await, Settlement::Retried { attempt: 1, .. }));
        assert_eq!(c.stats().jobs_panicked, 1);
    }

    #[tokio::test]
    async fn spawned_loop_drains_queue_and_stops() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let c = consumer(Listing::Empty, queue.clone(), RetryPolicy::default()).with_config(
            JobConsumerConfig::default()
                .with_name("test")
                .with_max_concurrent(2)
                .with_poll_interval(Duration::from_millis(5)),
        );
        for _ in 0..5 {
            queue
                .send(&JobMessage::root(TenantId::new(), RootSpec::default(), false))
                .await
                .unwrap();
        }

        let handle = c.spawn();
        for _ in 0..200 {
            if queue.acked() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let stats = handle.shutdown().await;

        assert_eq!(queue.acked(), 5);
        assert_eq!(stats.jobs_succeeded, 5);
        assert_eq!(queue.in_flight_len(), 0);
    }
}
