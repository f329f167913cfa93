//! Worker configuration, read from the environment at startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use backfill_orchestrator::BackfillConfig;

use crate::jobs::RetryPolicy;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_STREAM: &str = "backfill:jobs";
pub const DEFAULT_GROUP: &str = "backfill-workers";
pub const DEFAULT_INDEX_STREAM: &str = "backfill:index";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub redis_url: String,
    pub github_token: Option<String>,
    pub github_api_url: String,
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub index_stream: String,
    pub work_dir: PathBuf,
    pub max_concurrent_jobs: usize,
    pub visibility_timeout: Duration,
    pub max_attempts: u32,
    pub fetch_concurrency: usize,
    pub index_batch_size: usize,
    pub git_timeout: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let consumer = get("BACKFILL_CONSUMER")
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::now_v7()));

        Ok(Self {
            database_url: get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
            redis_url: or("REDIS_URL", DEFAULT_REDIS_URL),
            github_token: get("GITHUB_TOKEN"),
            github_api_url: or("GITHUB_API_URL", DEFAULT_GITHUB_API_URL),
            stream: or("BACKFILL_STREAM", DEFAULT_STREAM),
            group: or("BACKFILL_GROUP", DEFAULT_GROUP),
            consumer,
            index_stream: or("BACKFILL_INDEX_STREAM", DEFAULT_INDEX_STREAM),
            work_dir: get("BACKFILL_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            max_concurrent_jobs: positive(&get, "BACKFILL_MAX_CONCURRENT_JOBS", 4)?,
            visibility_timeout: Duration::from_secs(positive(
                &get,
                "BACKFILL_VISIBILITY_TIMEOUT_SECS",
                900,
            )?),
            max_attempts: parse(&get, "BACKFILL_MAX_ATTEMPTS", 5)?,
            fetch_concurrency: positive(&get, "BACKFILL_FETCH_CONCURRENCY", 8)?,
            index_batch_size: positive(&get, "BACKFILL_INDEX_BATCH_SIZE", 100)?,
            git_timeout: Duration::from_secs(positive(&get, "BACKFILL_GIT_TIMEOUT_SECS", 600)?),
        })
    }

    pub fn backfill(&self) -> BackfillConfig {
        BackfillConfig {
            fetch_concurrency: self.fetch_concurrency,
            index_batch_size: self.index_batch_size,
            ..BackfillConfig::default()
        }
        .with_work_dir(&self.work_dir)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            ..RetryPolicy::default()
        }
    }
}

fn parse<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

fn positive<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default + ToString,
    G: Fn(&str) -> Option<String>,
{
    let value = parse(get, key, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        });
    }
    Ok(value)
}
