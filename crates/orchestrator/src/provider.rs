//! Source-control provider API, as the engine needs it.

use std::sync::Arc;

use async_trait::async_trait;

use backfill_core::RepositoryRef;

use crate::error::ProviderError;
use crate::retriever::GitCredentials;

/// Provider API client.
///
/// Implementations detect rate limits themselves and report them as
/// [`ProviderError::RateLimited`]; callers wrap calls in a
/// [`RateLimitGate`](crate::ratelimit::RateLimitGate).
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Every repository the credentials can see (account-scope discovery).
    async fn list_accessible_repositories(&self) -> Result<Vec<RepositoryRef>, ProviderError>;

    async fn list_organization_repositories(
        &self,
        organization: &str,
    ) -> Result<Vec<RepositoryRef>, ProviderError>;

    async fn get_repository(&self, owner: &str, name: &str)
    -> Result<RepositoryRef, ProviderError>;

    /// Pull-request numbers, ascending.
    async fn list_pull_request_numbers(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<Vec<u64>, ProviderError>;

    async fn get_pull_request(
        &self,
        owner: &str,
        name: &str,
        number: u64,
    ) -> Result<serde_json::Value, ProviderError>;

    /// HTTPS clone URL without credentials.
    fn clone_url(&self, owner: &str, name: &str) -> String;

    fn git_credentials(&self) -> Option<GitCredentials>;
}

#[async_trait]
impl<P> ProviderClient for Arc<P>
where
    P: ProviderClient + ?Sized,
{
    async fn list_accessible_repositories(&self) -> Result<Vec<RepositoryRef>, ProviderError> {
        (**self).list_accessible_repositories().await
    }

    async fn list_organization_repositories(
        &self,
        organization: &str,
    ) -> Result<Vec<RepositoryRef>, ProviderError> {
        (**self).list_organization_repositories(organization).await
    }

    async fn get_repository(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<RepositoryRef, ProviderError> {
        (**self).get_repository(owner, name).await
    }

    async fn list_pull_request_numbers(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<Vec<u64>, ProviderError> {
        (**self).list_pull_request_numbers(owner, name).await
    }

    async fn get_pull_request(
        &self,
        owner: &str,
        name: &str,
        number: u64,
    ) -> Result<serde_json::Value, ProviderError> {
        (**self).get_pull_request(owner, name, number).await
    }

    fn clone_url(&self, owner: &str, name: &str) -> String {
        (**self).clone_url(owner, name)
    }

    fn git_credentials(&self) -> Option<GitCredentials> {
        (**self).git_credentials()
    }
}
