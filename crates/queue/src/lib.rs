//! Job messages and the durable queue they travel through.

pub mod in_memory;
pub mod message;
pub mod queue;

pub use in_memory::{DeferredEntry, InMemoryJobQueue};
pub use message::{
    FileBatchSpec, IntermediateSpec, JobMessage, JobSpec, RootSpec, WorkUnitBatchSpec,
};
pub use queue::{Delivery, JobQueue, JobSource, QueueError};
