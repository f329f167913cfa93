//! Per-run progress counters.
//!
//! Four monotonically increasing integers per (tenant, run). Writes are
//! commutative adds, so concurrent leaves need no coordination beyond the
//! store's atomic increment.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, warn};

use backfill_core::{ProgressCounter, ProgressSnapshot, RunId, TenantId};

use crate::error::JobError;

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("progress store error: {0}")]
    Store(String),
}

/// Shared counter store with atomic add.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Add `by` to the counter and return the new value.
    async fn increment(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        counter: ProgressCounter,
        by: u64,
    ) -> Result<u64, ProgressError>;

    async fn snapshot(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
    ) -> Result<ProgressSnapshot, ProgressError>;
}

#[async_trait]
impl<S> ProgressStore for Arc<S>
where
    S: ProgressStore + ?Sized,
{
    async fn increment(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        counter: ProgressCounter,
        by: u64,
    ) -> Result<u64, ProgressError> {
        (**self).increment(tenant_id, run_id, counter, by).await
    }

    async fn snapshot(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
    ) -> Result<ProgressSnapshot, ProgressError> {
        (**self).snapshot(tenant_id, run_id).await
    }
}

/// In-memory progress store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryProgressStore {
    counters: Mutex<HashMap<(TenantId, RunId, ProgressCounter), u64>>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn increment(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        counter: ProgressCounter,
        by: u64,
    ) -> Result<u64, ProgressError> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| ProgressError::Store("in-memory progress lock poisoned".to_string()))?;
        let value = counters.entry((tenant_id, run_id, counter)).or_insert(0);
        *value = value.saturating_add(by);
        Ok(*value)
    }

    async fn snapshot(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
    ) -> Result<ProgressSnapshot, ProgressError> {
        let counters = self
            .counters
            .lock()
            .map_err(|_| ProgressError::Store("in-memory progress lock poisoned".to_string()))?;
        let mut snapshot = ProgressSnapshot::default();
        for counter in ProgressCounter::ALL {
            if let Some(value) = counters.get(&(tenant_id, run_id, counter)) {
                snapshot.set(counter, *value);
            }
        }
        Ok(snapshot)
    }
}

/// Counter facade used by jobs.
///
/// Every method takes an optional run: jobs started outside a backfill run
/// carry no run id and are simply not tracked.
#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn ProgressStore>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn ProgressStore>) -> Self {
        Self { store }
    }

    async fn add(
        &self,
        tenant_id: TenantId,
        run_id: Option<RunId>,
        counter: ProgressCounter,
        by: u64,
    ) -> Result<(), ProgressError> {
        let Some(run_id) = run_id else {
            return Ok(());
        };
        if by == 0 {
            return Ok(());
        }
        let value = self.store.increment(tenant_id, run_id, counter, by).await?;
        debug!(
            tenant_id = %tenant_id,
            run_id = %run_id,
            counter = counter.as_str(),
            by,
            value,
            "progress"
        );
        Ok(())
    }

    /// Register the final fan-out size. Must run before the children are sent.
    pub async fn increment_total_ingest_jobs(
        &self,
        tenant_id: TenantId,
        run_id: Option<RunId>,
        by: u64,
    ) -> Result<(), ProgressError> {
        self.add(tenant_id, run_id, ProgressCounter::TotalIngestJobs, by)
            .await
    }

    pub async fn increment_attempted_ingest_jobs(
        &self,
        tenant_id: TenantId,
        run_id: Option<RunId>,
    ) -> Result<(), ProgressError> {
        self.add(tenant_id, run_id, ProgressCounter::AttemptedIngestJobs, 1)
            .await
    }

    pub async fn increment_done_ingest_jobs(
        &self,
        tenant_id: TenantId,
        run_id: Option<RunId>,
    ) -> Result<(), ProgressError> {
        self.add(tenant_id, run_id, ProgressCounter::DoneIngestJobs, 1)
            .await
    }

    pub async fn increment_total_index_jobs(
        &self,
        tenant_id: TenantId,
        run_id: Option<RunId>,
        by: u64,
    ) -> Result<(), ProgressError> {
        self.add(tenant_id, run_id, ProgressCounter::TotalIndexJobs, by)
            .await
    }

    pub async fn snapshot(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
    ) -> Result<ProgressSnapshot, ProgressError> {
        self.store.snapshot(tenant_id, run_id).await
    }

    /// Run one leaf body with guaranteed attempt accounting.
    ///
    /// `attempted` is incremented whatever the body does: success, error or
    /// panic (the panic is resumed afterwards). `done` only on success, and
    /// only once `attempted` is recorded; otherwise the progress error is
    /// returned so the message is redelivered.
    pub async fn track_leaf<T, F>(
        &self,
        tenant_id: TenantId,
        run_id: Option<RunId>,
        body: F,
    ) -> Result<T, JobError>
    where
        F: Future<Output = Result<T, JobError>>,
    {
        let outcome = AssertUnwindSafe(body).catch_unwind().await;

        let attempted = self.increment_attempted_ingest_jobs(tenant_id, run_id).await;

        match outcome {
            Ok(Ok(value)) => {
                attempted?;
                self.increment_done_ingest_jobs(tenant_id, run_id).await?;
                Ok(value)
            }
            Ok(Err(err)) => {
                if let Err(progress) = attempted {
                    warn!(error = %progress, "failed to record leaf attempt");
                }
                Err(err)
            }
            Err(panic) => {
                if let Err(progress) = attempted {
                    warn!(error = %progress, "failed to record leaf attempt");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backfill_core::DomainError;

    fn tracker() -> (ProgressTracker, Arc<InMemoryProgressStore>) {
        let store = Arc::new(InMemoryProgressStore::new());
        (ProgressTracker::new(store.clone()), store)
    }

    #[tokio::test]
    async fn untracked_jobs_write_nothing() {
        let (tracker, store) = tracker();
        let tenant = TenantId::new();
        tracker
            .increment_total_ingest_jobs(tenant, None, 10)
            .await
            .unwrap();
        assert!(store.counters.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn successful_leaf_counts_attempted_and_done() {
        let (tracker, _) = tracker();
        let (tenant, run) = (TenantId::new(), RunId::new());

        let value = tracker
            .track_leaf(tenant, Some(run), async { Ok::<_, JobError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let snap = tracker.snapshot(tenant, run).await.unwrap();
        assert_eq!(snap.attempted_ingest_jobs, 1);
        assert_eq!(snap.done_ingest_jobs, 1);
    }

    #[tokio::test]
    async fn failing_leaf_still_counts_attempted() {
        let (tracker, _) = tracker();
        let (tenant, run) = (TenantId::new(), RunId::new());

        let err = tracker
            .track_leaf::<(), _>(tenant, Some(run), async {
                Err::<(), JobError>(DomainError::missing("repository").into())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Configuration(_)));

        let snap = tracker.snapshot(tenant, run).await.unwrap();
        assert_eq!(snap.attempted_ingest_jobs, 1);
        assert_eq!(snap.done_ingest_jobs, 0);
    }

    #[tokio::test]
    async fn panicking_leaf_still_counts_attempted() {
        let (tracker, _) = tracker();
        let (tenant, run) = (TenantId::new(), RunId::new());

        let t = tracker.clone();
        let handle = tokio::spawn(async move {
            t.track_leaf::<(), _>(tenant, Some(run), async {
                if run.as_uuid().is_nil() {
                    return Ok::<(), JobError>(());
                }
                panic!("boom")
            })
            .await
        });
        assert!(handle.await.unwrap_err().is_panic());

        let snap = tracker.snapshot(tenant, run).await.unwrap();
        assert_eq!(snap.attempted_ingest_jobs, 1);
        assert_eq!(snap.done_ingest_jobs, 0);
    }

    /// Fails only the attempted counter.
    #[derive(Default)]
    struct AttemptedDown(InMemoryProgressStore);

    #[async_trait]
    impl ProgressStore for AttemptedDown {
        async fn increment(
            &self,
            tenant_id: TenantId,
            run_id: RunId,
            counter: ProgressCounter,
            by: u64,
        ) -> Result<u64, ProgressError> {
            if counter == ProgressCounter::AttemptedIngestJobs {
                return Err(ProgressError::Store("connection reset".into()));
            }
            self.0.increment(tenant_id, run_id, counter, by).await
        }

        async fn snapshot(
            &self,
            tenant_id: TenantId,
            run_id: RunId,
        ) -> Result<ProgressSnapshot, ProgressError> {
            self.0.snapshot(tenant_id, run_id).await
        }
    }

    #[tokio::test]
    async fn unrecorded_attempt_fails_the_leaf_and_skips_done() {
        let tracker = ProgressTracker::new(Arc::new(AttemptedDown::default()));
        let (tenant, run) = (TenantId::new(), RunId::new());

        let err = tracker
            .track_leaf(tenant, Some(run), async { Ok::<_, JobError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Progress(_)));
        assert_eq!(err.class(), crate::error::ErrorClass::Transient);

        let snap = tracker.snapshot(tenant, run).await.unwrap();
        assert_eq!(snap.done_ingest_jobs, 0);

        let err = tracker
            .track_leaf::<(), _>(tenant, Some(run), async {
                Err(JobError::Indexing(crate::artifact::IndexError("down".into())))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Indexing(_)));
    }

    #[tokio::test]
    async fn attempted_is_non_decreasing_across_redeliveries() {
        let (tracker, _) = tracker();
        let (tenant, run) = (TenantId::new(), RunId::new());
        tracker
            .increment_total_ingest_jobs(tenant, Some(run), 2)
            .await
            .unwrap();

        let mut last = 0;
        for attempt in 0..4 {
            let _ = tracker
                .track_leaf(tenant, Some(run), async move {
                    if attempt % 2 == 0 {
                        Err(JobError::Indexing(crate::artifact::IndexError("down".into())))
                    } else {
                        Ok(())
                    }
                })
                .await;
            let snap = tracker.snapshot(tenant, run).await.unwrap();
            assert!(snap.attempted_ingest_jobs > last);
            last = snap.attempted_ingest_jobs;
        }

        let snap = tracker.snapshot(tenant, run).await.unwrap();
        assert_eq!(snap.total_ingest_jobs, 2);
        assert_eq!(snap.attempted_ingest_jobs, 4);
        assert_eq!(snap.done_ingest_jobs, 2);
        assert!(snap.is_complete());
    }
}
