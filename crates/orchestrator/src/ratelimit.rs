//! Rate-limit detection and the gate wrapping provider calls.
//!
//! The gate never sleeps. A rate-limited call becomes
//! [`JobError::RateLimited`], and the host defers redelivery of the whole
//! message by the signal's delay, freeing the worker slot immediately.

use std::future::Future;

use chrono::{DateTime, TimeZone, Utc};
use tracing::warn;

use backfill_core::RateLimitSignal;

use crate::error::{JobError, ProviderError};

/// Rate-limit related response headers, already extracted by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// `x-ratelimit-remaining`
    pub remaining: Option<u64>,
    /// `x-ratelimit-reset`, epoch seconds
    pub reset_epoch: Option<i64>,
    /// `retry-after`, seconds
    pub retry_after_secs: Option<u64>,
}

impl RateLimitHeaders {
    /// Build from raw `(name, value)` pairs. Names are matched case-insensitively.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut out = Self::default();
        for (name, value) in pairs {
            let value = value.trim();
            match name.to_ascii_lowercase().as_str() {
                "x-ratelimit-remaining" => out.remaining = value.parse().ok(),
                "x-ratelimit-reset" => out.reset_epoch = value.parse().ok(),
                "retry-after" => out.retry_after_secs = value.parse().ok(),
                _ => {}
            }
        }
        out
    }

    fn reset_at(&self) -> Option<DateTime<Utc>> {
        self.reset_epoch
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    }

    fn signal(&self, now: DateTime<Utc>) -> RateLimitSignal {
        if let Some(reset) = self.reset_at() {
            return RateLimitSignal::from_reset(Some(reset), now);
        }
        if let Some(secs) = self.retry_after_secs {
            return RateLimitSignal::after(std::time::Duration::from_secs(secs));
        }
        RateLimitSignal::from_reset(None, now)
    }
}

fn body_mentions_rate_limit(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("rate limit") || lower.contains("abuse detection")
}

/// Classify a REST response.
///
/// Rate limited when the status is 403 or 429 and either the body carries a
/// rate-limit marker, `x-ratelimit-remaining` is zero, or `retry-after` is set.
/// Any other status is not a rate limit.
pub fn classify_response(
    status: u16,
    headers: &RateLimitHeaders,
    body: &str,
    now: DateTime<Utc>,
) -> Option<RateLimitSignal> {
    if status != 403 && status != 429 {
        return None;
    }
    let limited = headers.remaining == Some(0)
        || headers.retry_after_secs.is_some()
        || body_mentions_rate_limit(body);
    limited.then(|| headers.signal(now))
}

/// Classify a GraphQL response body (`errors[].type == "RATE_LIMITED"`).
pub fn classify_graphql(
    body: &serde_json::Value,
    headers: &RateLimitHeaders,
    now: DateTime<Utc>,
) -> Option<RateLimitSignal> {
    let errors = body.get("errors")?.as_array()?;
    let limited = errors.iter().any(|e| {
        e.get("type").and_then(|t| t.as_str()) == Some("RATE_LIMITED")
    });
    limited.then(|| headers.signal(now))
}

/// Wraps outbound provider calls and converts backpressure into a deferral.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitGate {
    provider: &'static str,
}

impl Default for RateLimitGate {
    fn default() -> Self {
        Self::new("github")
    }
}

impl RateLimitGate {
    pub fn new(provider: &'static str) -> Self {
        Self { provider }
    }

    pub async fn call<T, F>(&self, operation: &'static str, call: F) -> Result<T, JobError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        match call.await {
            Ok(value) => Ok(value),
            Err(ProviderError::RateLimited(signal)) => {
                warn!(
                    provider = self.provider,
                    operation,
                    retry_after_secs = signal.retry_after.as_secs(),
                    reset_at = ?signal.reset_at,
                    "provider rate limit; deferring job"
                );
                Err(JobError::RateLimited(signal))
            }
            Err(other) => Err(JobError::Provider(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn headers_reset_in(now: DateTime<Utc>, secs: i64) -> RateLimitHeaders {
        RateLimitHeaders {
            remaining: Some(0),
            reset_epoch: Some(now.timestamp() + secs),
            retry_after_secs: None,
        }
    }

    #[test]
    fn exhausted_quota_uses_reset_header() {
        let now = Utc::now();
        let signal = classify_response(403, &headers_reset_in(now, 45), "", now).unwrap();
        let secs = signal.retry_after.as_secs_f64();
        assert!((44.0..=46.0).contains(&secs), "got {secs}");
        assert!(signal.reset_at.is_some());
    }

    #[test]
    fn body_marker_without_reset_falls_back() {
        let now = Utc::now();
        let signal = classify_response(
            403,
            &RateLimitHeaders::default(),
            r#"{"message":"API rate limit exceeded for installation"}"#,
            now,
        )
        .unwrap();
        assert_eq!(signal.retry_after, Duration::from_secs(60));
    }

    #[test]
    fn retry_after_header_is_honored() {
        let now = Utc::now();
        let headers = RateLimitHeaders::from_pairs([("Retry-After", "12")]);
        let signal = classify_response(429, &headers, "", now).unwrap();
        assert_eq!(signal.retry_after, Duration::from_secs(12));
    }

    #[test]
    fn plain_forbidden_and_not_found_are_not_rate_limits() {
        let now = Utc::now();
        let headers = RateLimitHeaders {
            remaining: Some(4000),
            ..Default::default()
        };
        assert!(classify_response(403, &headers, "Resource not accessible", now).is_none());
        assert!(classify_response(404, &headers_reset_in(now, 10), "rate limit", now).is_none());
    }

    #[test]
    fn graphql_rate_limited_error() {
        let now = Utc::now();
        let body = serde_json::json!({
            "errors": [{ "type": "RATE_LIMITED", "message": "API rate limit exceeded" }]
        });
        let signal = classify_graphql(&body, &RateLimitHeaders::default(), now).unwrap();
        assert_eq!(signal.retry_after, Duration::from_secs(60));

        let ok = serde_json::json!({ "data": {} });
        assert!(classify_graphql(&ok, &RateLimitHeaders::default(), now).is_none());
    }

    #[test]
    fn header_names_are_case_insensitive() {
        let headers = RateLimitHeaders::from_pairs([
            ("X-RateLimit-Remaining", "0"),
            ("X-RateLimit-Reset", "1700000000"),
        ]);
        assert_eq!(headers.remaining, Some(0));
        assert_eq!(headers.reset_epoch, Some(1_700_000_000));
    }

    #[tokio::test]
    async fn gate_converts_rate_limits_and_passes_other_errors() {
        let gate = RateLimitGate::default();
        let signal = RateLimitSignal::after(Duration::from_secs(30));

        let err = gate
            .call::<(), _>("list_pulls", async { Err(ProviderError::RateLimited(signal)) })
            .await
            .unwrap_err();
        assert_eq!(err.rate_limit(), Some(&signal));

        let err = gate
            .call::<(), _>("get_repo", async {
                Err(ProviderError::NotFound("acme/gone".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Provider(ProviderError::NotFound(_))));

        let ok = gate.call("get_repo", async { Ok::<_, ProviderError>(5) }).await.unwrap();
        assert_eq!(ok, 5);
    }
}
