//! In-memory job queue for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use crate::message::JobMessage;
use crate::queue::{Delivery, JobQueue, JobSource, QueueError};

#[derive(Debug, Clone)]
struct Entry {
    body: String,
    attempt: u32,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Entry>,
    delayed: Vec<(Instant, Duration, Entry)>,
    in_flight: HashMap<String, Entry>,
    dead: Vec<(String, String)>,
    acked: usize,
}

/// A deferred redelivery, as recorded by [`InMemoryJobQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredEntry {
    pub delay: Duration,
    pub attempt: u32,
    pub body: String,
}

/// In-memory queue implementing both producer and consumer sides.
///
/// - No IO
/// - FIFO for ready messages
/// - Deferred messages become ready once their delay has elapsed (or on
///   [`InMemoryJobQueue::release_deferred`])
/// - Unsettled deliveries stay in flight until [`InMemoryJobQueue::expire_in_flight`]
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    state: Mutex<State>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Command("in-memory queue lock poisoned".to_string()))
    }

    /// Messages currently ready for delivery, decoded.
    pub fn ready_messages(&self) -> Vec<JobMessage> {
        self.state
            .lock()
            .map(|s| {
                s.ready
                    .iter()
                    .filter_map(|e| serde_json::from_str(&e.body).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn ready_len(&self) -> usize {
        self.state.lock().map(|s| s.ready.len()).unwrap_or(0)
    }

    pub fn in_flight_len(&self) -> usize {
        self.state.lock().map(|s| s.in_flight.len()).unwrap_or(0)
    }

    pub fn acked(&self) -> usize {
        self.state.lock().map(|s| s.acked).unwrap_or(0)
    }

    pub fn deferred(&self) -> Vec<DeferredEntry> {
        self.state
            .lock()
            .map(|s| {
                s.delayed
                    .iter()
                    .map(|(_, delay, e)| DeferredEntry {
                        delay: *delay,
                        attempt: e.attempt,
                        body: e.body.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Dead-lettered `(body, reason)` pairs.
    pub fn dead_letters(&self) -> Vec<(String, String)> {
        self.state.lock().map(|s| s.dead.clone()).unwrap_or_default()
    }

    /// Make every deferred message ready now, regardless of its delay.
    pub fn release_deferred(&self) {
        if let Ok(mut s) = self.state.lock() {
            let delayed = std::mem::take(&mut s.delayed);
            s.ready.extend(delayed.into_iter().map(|(_, _, e)| e));
        }
    }

    /// Simulate lease expiry: every unsettled delivery becomes ready again.
    pub fn expire_in_flight(&self) {
        if let Ok(mut s) = self.state.lock() {
            let in_flight: Vec<Entry> = s.in_flight.drain().map(|(_, e)| e).collect();
            s.ready.extend(in_flight);
        }
    }

    /// Enqueue a raw body (e.g. to exercise malformed payload handling).
    pub fn push_raw(&self, body: impl Into<String>) {
        if let Ok(mut s) = self.state.lock() {
            s.ready.push_back(Entry {
                body: body.into(),
                attempt: 0,
            });
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn send(&self, message: &JobMessage) -> Result<(), QueueError> {
        let body =
            serde_json::to_string(message).map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.lock()?.ready.push_back(Entry { body, attempt: 0 });
        Ok(())
    }
}

#[async_trait]
impl JobSource for InMemoryJobQueue {
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let mut s = self.lock()?;
        let now = Instant::now();

        // Promote due deferred entries (in due order).
        s.delayed.sort_by_key(|(due, _, _)| *due);
        while s.delayed.first().is_some_and(|(due, _, _)| *due <= now) {
            let (_, _, entry) = s.delayed.remove(0);
            s.ready.push_back(entry);
        }

        let mut out = Vec::new();
        while out.len() < max {
            let Some(entry) = s.ready.pop_front() else {
                break;
            };
            let receipt = Uuid::now_v7().to_string();
            out.push(Delivery {
                receipt: receipt.clone(),
                attempt: entry.attempt,
                body: entry.body.clone(),
            });
            s.in_flight.insert(receipt, entry);
        }
        Ok(out)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut s = self.lock()?;
        s.in_flight
            .remove(&delivery.receipt)
            .ok_or_else(|| QueueError::UnknownReceipt(delivery.receipt.clone()))?;
        s.acked += 1;
        Ok(())
    }

    async fn defer(
        &self,
        delivery: &Delivery,
        delay: Duration,
        attempt: u32,
    ) -> Result<(), QueueError> {
        let mut s = self.lock()?;
        let mut entry = s
            .in_flight
            .remove(&delivery.receipt)
            .ok_or_else(|| QueueError::UnknownReceipt(delivery.receipt.clone()))?;
        entry.attempt = attempt;
        s.delayed.push((Instant::now() + delay, delay, entry));
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let mut s = self.lock()?;
        let entry = s
            .in_flight
            .remove(&delivery.receipt)
            .ok_or_else(|| QueueError::UnknownReceipt(delivery.receipt.clone()))?;
        s.dead.push((entry.body, reason.to_string()));
        Ok(())
    }
}
