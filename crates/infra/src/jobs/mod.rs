//! Queue host: consumes job deliveries and applies the redelivery policy.
//!
//! - Success: ack
//! - Rate limited: defer until the provider's reset, attempt count unchanged
//! - Transient: redeliver with [`RetryPolicy`] backoff, dead-letter when exhausted
//! - Configuration or malformed payload: dead-letter immediately

pub mod consumer;
pub mod retry;

pub use consumer::{ConsumerStats, JobConsumer, JobConsumerConfig, JobConsumerHandle, Settlement};
pub use retry::{BackoffStrategy, RetryPolicy};
