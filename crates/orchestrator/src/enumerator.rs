//! Work enumeration: one repository in, ordered bounded batches out.

use async_trait::async_trait;
use tracing::debug;

use backfill_core::{
    BatchContext, CloneSnapshot, MAX_FILE_PATHS_PER_BATCH, MAX_WORK_UNITS_PER_BATCH, WorkBatch,
};

use crate::error::JobError;
use crate::provider::ProviderClient;
use crate::ratelimit::RateLimitGate;
use crate::retriever::RepositoryRetriever;

#[async_trait]
pub trait WorkEnumerator: Send + Sync {
    type Unit: Send;

    /// Ceiling for one batch of this enumerator's units.
    fn max_batch(&self) -> usize;

    /// Ordered, opaque unit identifiers for the repository.
    async fn enumerate(&self, context: &BatchContext) -> Result<Vec<Self::Unit>, JobError>;

    async fn batches(
        &self,
        context: &BatchContext,
    ) -> Result<Vec<WorkBatch<Self::Unit>>, JobError> {
        let units = self.enumerate(context).await?;
        let batches = WorkBatch::slice(context, units, self.max_batch())?;
        debug!(
            repository = %context.full_name(),
            batches = batches.len(),
            "enumerated"
        );
        Ok(batches)
    }
}

/// File paths at the snapshot's commit.
pub struct FileEnumerator<'a> {
    retriever: &'a RepositoryRetriever,
    snapshot: &'a CloneSnapshot,
}

impl<'a> FileEnumerator<'a> {
    pub fn new(retriever: &'a RepositoryRetriever, snapshot: &'a CloneSnapshot) -> Self {
        Self {
            retriever,
            snapshot,
        }
    }
}

#[async_trait]
impl WorkEnumerator for FileEnumerator<'_> {
    type Unit = String;

    fn max_batch(&self) -> usize {
        MAX_FILE_PATHS_PER_BATCH
    }

    async fn enumerate(&self, _context: &BatchContext) -> Result<Vec<String>, JobError> {
        Ok(self.retriever.list_files(self.snapshot).await?)
    }
}

/// Pull-request numbers via the provider API.
pub struct PullRequestEnumerator<'a> {
    provider: &'a dyn ProviderClient,
    gate: RateLimitGate,
}

impl<'a> PullRequestEnumerator<'a> {
    pub fn new(provider: &'a dyn ProviderClient, gate: RateLimitGate) -> Self {
        Self { provider, gate }
    }
}

#[async_trait]
impl WorkEnumerator for PullRequestEnumerator<'_> {
    type Unit = u64;

    fn max_batch(&self) -> usize {
        MAX_WORK_UNITS_PER_BATCH
    }

    async fn enumerate(&self, context: &BatchContext) -> Result<Vec<u64>, JobError> {
        self.gate
            .call(
                "list_pull_requests",
                self.provider
                    .list_pull_request_numbers(&context.organization, &context.repository),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backfill_core::RepositoryRef;

    use crate::error::ProviderError;
    use crate::retriever::GitCredentials;

    struct Pulls(Result<Vec<u64>, ProviderError>);

    #[async_trait]
    impl ProviderClient for Pulls {
        async fn list_accessible_repositories(
            &self,
        ) -> Result<Vec<RepositoryRef>, ProviderError> {
            Ok(vec![])
        }
        async fn list_organization_repositories(
            &self,
            _: &str,
        ) -> Result<Vec<RepositoryRef>, ProviderError> {
            Ok(vec![])
        }
        async fn get_repository(&self, o: &str, n: &str) -> Result<RepositoryRef, ProviderError> {
            Ok(RepositoryRef::new(o, n, 1))
        }
        async fn list_pull_request_numbers(
            &self,
            _: &str,
            _: &str,
        ) -> Result<Vec<u64>, ProviderError> {
            self.0.clone()
        }
        async fn get_pull_request(
            &self,
            _: &str,
            _: &str,
            _: u64,
        ) -> Result<serde_json::Value, ProviderError> {
            Ok(serde_json::json!({}))
        }
        fn clone_url(&self, o: &str, n: &str) -> String {
            format!("https://example.test/{o}/{n}.git")
        }
        fn git_credentials(&self) -> Option<GitCredentials> {
            None
        }
    }

    #[tokio::test]
    async fn pull_requests_are_sliced_by_fifty() {
        let provider = Pulls(Ok((1..=120).collect()));
        let enumerator = PullRequestEnumerator::new(&provider, RateLimitGate::default());

        let batches = enumerator
            .batches(&BatchContext::new("acme", "widgets"))
            .await
            .unwrap();
        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
        assert_eq!(batches[2].units()[0], 101);
    }

    #[tokio::test]
    async fn rate_limited_listing_surfaces_as_rate_limit() {
        let signal = backfill_core::RateLimitSignal::fallback();
        let provider = Pulls(Err(ProviderError::RateLimited(signal)));
        let enumerator = PullRequestEnumerator::new(&provider, RateLimitGate::default());

        let err = enumerator
            .batches(&BatchContext::new("acme", "widgets"))
            .await
            .unwrap_err();
        assert!(err.rate_limit().is_some());
    }
}
