//! `backfill-orchestrator`: the backfill job-tree engine.
//!
//! Root jobs discover repositories, intermediate jobs enumerate one
//! repository's work into bounded batches, leaf jobs fetch and persist one
//! batch each. All retry is delegated to the queue host: jobs return
//! classified errors and never sleep or loop in-process.

pub mod artifact;
pub mod batch;
pub mod dispatcher;
pub mod engine;
pub mod enumerator;
pub mod error;
mod handlers;
pub mod progress;
pub mod provider;
pub mod ratelimit;
pub mod retriever;

pub use artifact::{
    Artifact, ArtifactStore, InMemoryArtifactStore, IndexError, IndexRequest, IndexTrigger,
    NormalizeError, Normalizer, PassthroughNormalizer, RawItem, RecordingIndexTrigger,
    SourceType, StorageError,
};
pub use batch::{BatchProcessor, BatchScope, ItemOutcome, partition_outcomes};
pub use dispatcher::{DISPATCH_CONCURRENCY, Dispatcher};
pub use engine::{Backfill, BackfillConfig, ClientRegistry, JobReport};
pub use enumerator::{FileEnumerator, PullRequestEnumerator, WorkEnumerator};
pub use error::{ErrorClass, JobError, ProviderError};
pub use progress::{InMemoryProgressStore, ProgressError, ProgressStore, ProgressTracker};
pub use provider::ProviderClient;
pub use ratelimit::{RateLimitGate, RateLimitHeaders, classify_graphql, classify_response};
pub use retriever::{
    CheckoutMode, CommitInfo, FetchOutcome, GitCredentials, GitError, GitRunner,
    RepositoryRetriever, redact_credentials,
};
