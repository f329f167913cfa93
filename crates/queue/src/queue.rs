//! Durable job queue abstraction (mechanics only).
//!
//! Two sides of the same queue:
//!
//! - [`JobQueue`] is what jobs use to fan out children (send only).
//! - [`JobSource`] is what the host consumer uses to pull deliveries and
//!   settle them (ack, deferred redelivery, dead-letter).
//!
//! Delivery is **at-least-once**: a delivery that is never settled (crash,
//! lease expiry) comes back. Consumers must be idempotent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::JobMessage;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("unknown delivery receipt: {0}")]
    UnknownReceipt(String),
}

/// Producer side: publish job messages.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn send(&self, message: &JobMessage) -> Result<(), QueueError>;
}

#[async_trait]
impl<Q> JobQueue for Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    async fn send(&self, message: &JobMessage) -> Result<(), QueueError> {
        (**self).send(message).await
    }
}

/// One received message, not yet settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Opaque handle used to settle the delivery.
    pub receipt: String,
    /// Failed processing attempts before this delivery (0 on first delivery).
    pub attempt: u32,
    /// Raw message body. Kept raw so malformed payloads can still be dead-lettered.
    pub body: String,
}

impl Delivery {
    pub fn decode(&self) -> Result<JobMessage, QueueError> {
        serde_json::from_str(&self.body).map_err(|e| QueueError::Deserialization(e.to_string()))
    }
}

/// Consumer side: pull and settle deliveries.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Pull up to `max` deliveries. May return fewer (or none).
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError>;

    /// Processing finished; never deliver again.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Settle this delivery and schedule the same body again after `delay`,
    /// recorded as attempt number `attempt`.
    async fn defer(
        &self,
        delivery: &Delivery,
        delay: Duration,
        attempt: u32,
    ) -> Result<(), QueueError>;

    /// Settle this delivery into the dead-letter store.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError>;
}

#[async_trait]
impl<S> JobSource for Arc<S>
where
    S: JobSource + ?Sized,
{
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        (**self).receive(max).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        (**self).ack(delivery).await
    }

    async fn defer(
        &self,
        delivery: &Delivery,
        delay: Duration,
        attempt: u32,
    ) -> Result<(), QueueError> {
        (**self).defer(delivery, delay, attempt).await
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        (**self).dead_letter(delivery, reason).await
    }
}
