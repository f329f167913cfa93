//! Job-level error model.
//!
//! Every failure a job can raise is classified so the host can apply one
//! uniform redelivery policy:
//!
//! - [`ErrorClass::RateLimited`]: defer redelivery by the signal's delay.
//! - [`ErrorClass::Transient`]: redeliver with backoff until the attempt cap.
//! - [`ErrorClass::Configuration`]: dead-letter now; redelivery cannot heal it.
//!
//! Empty repositories and missing files are not errors at all; they surface as
//! empty snapshots and skipped items.

use thiserror::Error;

use backfill_core::{DomainError, RateLimitSignal};
use backfill_queue::QueueError;

use crate::artifact::{IndexError, NormalizeError, StorageError};
use crate::progress::ProgressError;
use crate::retriever::GitError;

/// Outcome of a failed provider call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider rate limit (retry after {:?})", .0.retry_after)]
    RateLimited(RateLimitSignal),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("provider returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(String),
}

/// How the host should treat a failed job.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    RateLimited,
    Transient,
    Configuration,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Transient => "transient",
            ErrorClass::Configuration => "configuration",
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("rate limited; retry after {:?}", .0.retry_after)]
    RateLimited(RateLimitSignal),

    #[error("invalid job: {0}")]
    Configuration(#[from] DomainError),

    #[error("git: {0}")]
    Git(#[from] GitError),

    #[error("provider: {0}")]
    Provider(ProviderError),

    #[error("queue: {0}")]
    Queue(#[from] QueueError),

    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    #[error("indexing: {0}")]
    Indexing(#[from] IndexError),

    #[error("progress: {0}")]
    Progress(#[from] ProgressError),

    #[error("normalize: {0}")]
    Normalize(#[from] NormalizeError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    pub fn class(&self) -> ErrorClass {
        match self {
            JobError::RateLimited(_) => ErrorClass::RateLimited,
            JobError::Configuration(_) => ErrorClass::Configuration,
            JobError::Git(_)
            | JobError::Provider(_)
            | JobError::Queue(_)
            | JobError::Storage(_)
            | JobError::Indexing(_)
            | JobError::Progress(_)
            | JobError::Normalize(_)
            | JobError::Io(_) => ErrorClass::Transient,
        }
    }

    /// Delay requested by the provider, if this is a rate limit.
    pub fn rate_limit(&self) -> Option<&RateLimitSignal> {
        match self {
            JobError::RateLimited(signal) => Some(signal),
            _ => None,
        }
    }
}

impl From<ProviderError> for JobError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::RateLimited(signal) => JobError::RateLimited(signal),
            other => JobError::Provider(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn classes_follow_the_taxonomy() {
        let limited: JobError =
            ProviderError::RateLimited(RateLimitSignal::after(Duration::from_secs(5))).into();
        assert_eq!(limited.class(), ErrorClass::RateLimited);
        assert_eq!(limited.rate_limit().map(|s| s.retry_after), Some(Duration::from_secs(5)));

        let not_found: JobError = ProviderError::NotFound("acme/widgets".into()).into();
        assert_eq!(not_found.class(), ErrorClass::Transient);

        let invalid: JobError = DomainError::missing("repository_id").into();
        assert_eq!(invalid.class(), ErrorClass::Configuration);
        assert!(invalid.rate_limit().is_none());
    }
}
