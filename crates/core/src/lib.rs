//! `backfill-core`: data model shared by every layer of the backfill tree.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod batch;
pub mod error;
pub mod id;
pub mod progress;
pub mod ratelimit;
pub mod repository;
pub mod run;
pub mod snapshot;

pub use batch::{BatchContext, MAX_FILE_PATHS_PER_BATCH, MAX_WORK_UNITS_PER_BATCH, WorkBatch};
pub use error::{DomainError, DomainResult, require_non_blank};
pub use id::{JobId, RunId, TenantId};
pub use progress::{ProgressCounter, ProgressSnapshot};
pub use ratelimit::{FALLBACK_RETRY_AFTER, MIN_RETRY_AFTER, RateLimitSignal};
pub use repository::{RepositoryRef, split_full_name};
pub use run::{BackfillRun, JobRole};
pub use snapshot::CloneSnapshot;
