//! GitHub REST v3 client.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{ACCEPT, HeaderMap, LINK, USER_AGENT};
use serde_json::Value;
use tracing::{debug, instrument};

use backfill_core::RepositoryRef;
use backfill_orchestrator::{
    GitCredentials, ProviderClient, ProviderError, RateLimitHeaders, classify_response,
};

const PER_PAGE: u32 = 100;
const API_VERSION: &str = "2022-11-28";

#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl GitHubClient {
    pub fn new(api_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Host serving git over HTTPS: `api.github.com` maps to `github.com`,
    /// Enterprise `https://host/api/v3` maps to `https://host`.
    pub fn web_url(&self) -> String {
        if let Some(rest) = self.api_url.strip_prefix("https://api.") {
            return format!("https://{rest}");
        }
        self.api_url
            .strip_suffix("/api/v3")
            .unwrap_or(&self.api_url)
            .to_string()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    async fn get(&self, url: &str) -> Result<(Value, Option<String>), ProviderError> {
        let mut request = self
            .http
            .get(url)
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, "backfill-worker")
            .header("X-GitHub-Api-Version", API_VERSION);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.without_url().to_string()))?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transport(e.without_url().to_string()))?;

        check_status(status, &headers, &body, url)?;
        let next = headers
            .get(LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(next_link);
        let value = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Decode(format!("{url}: {e}")))?;
        Ok((value, next))
    }

    /// Follow `Link: rel="next"` until exhausted, concatenating page items.
    async fn paginate(&self, first: String) -> Result<Vec<Value>, ProviderError> {
        let mut items = Vec::new();
        let mut next = Some(first);
        let mut pages = 0usize;
        while let Some(url) = next {
            let (page, following) = self.get(&url).await?;
            items.extend(page_items(page)?);
            next = following;
            pages += 1;
        }
        debug!(pages, items = items.len(), "pagination finished");
        Ok(items)
    }

    async fn repositories(&self, first: String) -> Result<Vec<RepositoryRef>, ProviderError> {
        self.paginate(first)
            .await?
            .iter()
            .map(parse_repository)
            .collect()
    }
}

fn header_pairs(headers: &HeaderMap) -> RateLimitHeaders {
    RateLimitHeaders::from_pairs(
        headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
    )
}

/// Map a non-success response to the provider error taxonomy.
fn check_status(
    status: u16,
    headers: &HeaderMap,
    body: &str,
    url: &str,
) -> Result<(), ProviderError> {
    if (200..300).contains(&status) {
        return Ok(());
    }
    if let Some(signal) = classify_response(status, &header_pairs(headers), body, Utc::now()) {
        return Err(ProviderError::RateLimited(signal));
    }
    if status == 404 {
        return Err(ProviderError::NotFound(url.to_string()));
    }
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect());
    Err(ProviderError::Status { status, message })
}

/// The `rel="next"` target of a `Link` header.
pub fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        let is_next = params
            .split(';')
            .any(|p| p.trim().replace(' ', "") == "rel=\"next\"");
        if !is_next {
            return None;
        }
        let target = target.trim();
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_string)
    })
}

/// List endpoints return a bare array; installation listings wrap it.
fn page_items(page: Value) -> Result<Vec<Value>, ProviderError> {
    match page {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("repositories") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(ProviderError::Decode("expected a list page".to_string())),
        },
        _ => Err(ProviderError::Decode("expected a list page".to_string())),
    }
}

fn parse_repository(value: &Value) -> Result<RepositoryRef, ProviderError> {
    let id = value.get("id").and_then(Value::as_u64);
    let name = value.get("name").and_then(Value::as_str);
    let owner = value
        .get("owner")
        .and_then(|o| o.get("login"))
        .and_then(Value::as_str);
    match (owner, name, id) {
        (Some(owner), Some(name), Some(id)) => Ok(RepositoryRef::new(owner, name, id)),
        _ => Err(ProviderError::Decode(
            "repository without id, name or owner.login".to_string(),
        )),
    }
}

#[async_trait]
impl ProviderClient for GitHubClient {
    #[instrument(skip(self), err)]
    async fn list_accessible_repositories(&self) -> Result<Vec<RepositoryRef>, ProviderError> {
        self.repositories(self.url(&format!("/installation/repositories?per_page={PER_PAGE}")))
            .await
    }

    #[instrument(skip(self), err)]
    async fn list_organization_repositories(
        &self,
        organization: &str,
    ) -> Result<Vec<RepositoryRef>, ProviderError> {
        self.repositories(self.url(&format!(
            "/orgs/{organization}/repos?type=all&per_page={PER_PAGE}"
        )))
        .await
    }

    #[instrument(skip(self), err)]
    async fn get_repository(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<RepositoryRef, ProviderError> {
        let (value, _) = self.get(&self.url(&format!("/repos/{owner}/{name}"))).await?;
        parse_repository(&value)
    }

    #[instrument(skip(self), err)]
    async fn list_pull_request_numbers(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<Vec<u64>, ProviderError> {
        let items = self
            .paginate(self.url(&format!(
                "/repos/{owner}/{name}/pulls?state=all&sort=created&direction=asc&per_page={PER_PAGE}"
            )))
            .await?;
        let mut numbers: Vec<u64> = items
            .iter()
            .filter_map(|pr| pr.get("number").and_then(Value::as_u64))
            .collect();
        numbers.sort_unstable();
        numbers.dedup();
        Ok(numbers)
    }

    async fn get_pull_request(
        &self,
        owner: &str,
        name: &str,
        number: u64,
    ) -> Result<Value, ProviderError> {
        let (value, _) = self
            .get(&self.url(&format!("/repos/{owner}/{name}/pulls/{number}")))
            .await?;
        Ok(value)
    }

    fn clone_url(&self, owner: &str, name: &str) -> String {
        format!("{}/{owner}/{name}.git", self.web_url())
    }

    fn git_credentials(&self) -> Option<GitCredentials> {
        self.token.as_deref().map(GitCredentials::token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use serde_json::json;

    #[test]
    fn next_link_is_found_among_relations() {
        let header = r#"<https://api.github.com/repos/a/b/pulls?page=1>; rel="prev", <https://api.github.com/repos/a/b/pulls?page=3>; rel="next", <https://api.github.com/repos/a/b/pulls?page=9>; rel="last""#;
        assert_eq!(
            next_link(header).as_deref(),
            Some("https://api.github.com/repos/a/b/pulls?page=3")
        );
        assert_eq!(next_link(r#"<https://x/?page=1>; rel="first""#), None);
    }

    #[test]
    fn web_url_follows_api_host() {
        assert_eq!(
            GitHubClient::new("https://api.github.com/", None).clone_url("acme", "w"),
            "https://github.com/acme/w.git"
        );
        assert_eq!(
            GitHubClient::new("https://ghe.corp/api/v3", None).web_url(),
            "https://ghe.corp"
        );
    }

    #[test]
    fn installation_pages_are_unwrapped() {
        let page = json!({ "total_count": 1, "repositories": [
            { "id": 9, "name": "w", "owner": { "login": "acme" } }
        ]});
        let items = page_items(page).unwrap();
        assert_eq!(
            parse_repository(&items[0]).unwrap(),
            RepositoryRef::new("acme", "w", 9)
        );
        assert!(page_items(json!("nope")).is_err());
        assert!(parse_repository(&json!({ "id": 1 })).is_err());
    }

    #[test]
    fn statuses_map_to_provider_errors() {
        let mut headers = HeaderMap::new();
        assert!(check_status(200, &headers, "[]", "u").is_ok());
        assert!(matches!(
            check_status(404, &headers, "{}", "u"),
            Err(ProviderError::NotFound(_))
        ));
        assert_eq!(
            check_status(500, &headers, r#"{"message":"boom"}"#, "u").unwrap_err(),
            ProviderError::Status {
                status: 500,
                message: "boom".into()
            }
        );

        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        assert!(matches!(
            check_status(403, &headers, "{}", "u"),
            Err(ProviderError::RateLimited(_))
        ));
    }

    #[test]
    fn credentials_follow_token() {
        assert!(GitHubClient::new("https://api.github.com", None)
            .git_credentials()
            .is_none());
        assert!(GitHubClient::new("https://api.github.com", Some("t".into()))
            .git_credentials()
            .is_some());
    }
}
