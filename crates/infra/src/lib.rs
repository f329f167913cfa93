//! Infrastructure layer: Postgres, Redis, git, GitHub, config and the queue host.

pub mod config;
pub mod git;
pub mod github;
#[cfg(feature = "redis")]
pub mod index;
pub mod jobs;
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use config::{ConfigError, WorkerConfig};
pub use git::ProcessGitRunner;
pub use github::GitHubClient;
pub use jobs::{
    BackoffStrategy, ConsumerStats, JobConsumer, JobConsumerConfig, JobConsumerHandle,
    RetryPolicy, Settlement,
};
pub use postgres::{PostgresArtifactStore, PostgresProgressStore, ensure_schema};
#[cfg(feature = "redis")]
pub use index::RedisIndexTrigger;
#[cfg(feature = "redis")]
pub use redis_streams::{RedisJobQueue, RedisStreamsConfig};
