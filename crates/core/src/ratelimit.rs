//! Rate-limit signal and retry-after computation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delay used when the provider gives no reset metadata.
pub const FALLBACK_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Lower bound on any computed delay.
pub const MIN_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Provider backpressure, converted into a redelivery delay for the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSignal {
    pub retry_after: Duration,
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitSignal {
    /// Reset timestamp minus `now`, floored at one second; fixed fallback
    /// without a reset.
    pub fn from_reset(reset_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let retry_after = match reset_at {
            Some(reset) => {
                let millis = (reset - now).num_milliseconds().max(0) as u64;
                Duration::from_millis(millis).max(MIN_RETRY_AFTER)
            }
            None => FALLBACK_RETRY_AFTER,
        };
        Self {
            retry_after,
            reset_at,
        }
    }

    /// Explicit delay (e.g. a `Retry-After: <seconds>` header).
    pub fn after(delay: Duration) -> Self {
        Self {
            retry_after: delay.max(MIN_RETRY_AFTER),
            reset_at: None,
        }
    }

    pub fn fallback() -> Self {
        Self::from_reset(None, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn reset_in_45s_yields_45s() {
        let now = Utc::now();
        let signal = RateLimitSignal::from_reset(Some(now + chrono::Duration::seconds(45)), now);
        let secs = signal.retry_after.as_secs_f64();
        assert!((44.0..=46.0).contains(&secs), "got {secs}");
    }

    #[test]
    fn missing_reset_falls_back_to_60s() {
        let signal = RateLimitSignal::from_reset(None, Utc::now());
        assert_eq!(signal.retry_after, Duration::from_secs(60));
    }

    #[test]
    fn reset_in_the_past_is_floored() {
        let now = Utc::now();
        let signal = RateLimitSignal::from_reset(Some(now - chrono::Duration::seconds(30)), now);
        assert_eq!(signal.retry_after, MIN_RETRY_AFTER);
    }

    proptest! {
        #[test]
        fn delay_is_never_below_one_second(offset in -10_000i64..10_000) {
            let now = Utc::now();
            let signal = RateLimitSignal::from_reset(Some(now + chrono::Duration::seconds(offset)), now);
            prop_assert!(signal.retry_after >= MIN_RETRY_AFTER);
        }
    }
}
