//! Bounded-concurrency fan-out of child jobs.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use backfill_core::RunId;
use backfill_queue::{JobMessage, JobQueue, JobSpec, QueueError};

/// Maximum simultaneous sends per dispatcher.
pub const DISPATCH_CONCURRENCY: usize = 100;

/// Sends one queue message per child.
///
/// Every send is attempted even when some fail. The first failure is returned
/// once all sends have completed, failing the parent so redelivery repeats the
/// whole (deterministic) fan-out.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<dyn JobQueue>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self::with_concurrency(queue, DISPATCH_CONCURRENCY)
    }

    pub fn with_concurrency(queue: Arc<dyn JobQueue>, concurrency: usize) -> Self {
        Self {
            queue,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Fan out `children` under `parent`. Returns the number of messages sent.
    pub async fn dispatch(
        &self,
        parent: &JobMessage,
        run_id: Option<RunId>,
        children: Vec<JobSpec>,
    ) -> Result<usize, QueueError> {
        let messages: Vec<JobMessage> = children
            .into_iter()
            .enumerate()
            .map(|(index, spec)| parent.child(index, run_id, spec))
            .collect();
        let total = messages.len();
        if total == 0 {
            return Ok(0);
        }

        let sends = messages.iter().map(|message| async move {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| QueueError::Connection("dispatcher closed".to_string()))?;
            self.queue.send(message).await
        });
        let results = join_all(sends).await;

        let mut first_error = None;
        let mut failed = 0usize;
        for result in results {
            if let Err(err) = result {
                failed += 1;
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => {
                warn!(
                    parent_job_id = %parent.job_id,
                    total,
                    failed,
                    error = %err,
                    "fan-out incomplete"
                );
                Err(err)
            }
            None => {
                debug!(parent_job_id = %parent.job_id, total, "fan-out complete");
                Ok(total)
            }
        }
    }
}
