//! Retry-with-backoff shared by playlist, key, segment and plain-file fetches.
//!
//! Exponential backoff with a hard delay cap and multiplicative jitter. A
//! server-provided `Retry-After` hint overrides the computed delay, clamped
//! so a hostile header cannot park the job.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::DownloadError;

/// Upper bound applied to any `Retry-After` hint.
pub const RETRY_AFTER_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Base delay. Actual delay = base * 2^retry, capped, then jittered.
    pub base_delay: Duration,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
    /// When true, the delay is scaled by a random factor in [0.8, 1.2).
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-indexed: the wait after the
    /// first failed attempt uses `retry == 0`).
    pub(crate) fn delay_for_retry(&self, retry: u32) -> Duration {
        let multiplier = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        let exp_delay = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);
        let capped = exp_delay.min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        let factor = rand::thread_rng().gen_range(0.8..1.2);
        capped.mul_f64(factor)
    }
}

/// Result of a single attempt.
pub enum RetryAction<T> {
    Success(T),
    /// Transient failure. `after` carries a server `Retry-After` hint, which
    /// takes precedence over the computed backoff.
    Retry {
        error: DownloadError,
        after: Option<Duration>,
    },
    /// Permanent failure, returned immediately.
    Fail(DownloadError),
}

/// Drive `operation` until success, permanent failure, attempt exhaustion or
/// cancellation. The closure receives the 0-indexed attempt number.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, DownloadError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    for attempt in 0..max_attempts {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(error) => return Err(error),
            RetryAction::Retry { error, after } => {
                if attempt + 1 >= max_attempts {
                    return Err(error);
                }
                let delay = after
                    .map(|hint| hint.min(RETRY_AFTER_CAP))
                    .unwrap_or_else(|| policy.delay_for_retry(attempt));
                warn!(
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying after transient error"
                );
                tokio::select! {
                    _ = token.cancelled() => return Err(DownloadError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    unreachable!("final attempt returns on every arm")
}

/// Statuses worth retrying. Everything else fails immediately.
pub fn retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 425 | 429 | 500 | 502 | 503 | 504)
}

/// Transport errors worth retrying: connect failures, timeouts, aborted
/// requests and interrupted body reads. Redirect and builder errors are not.
pub fn transient_transport_error(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout() || error.is_request() || error.is_body()
}

/// `Retry-After` in delta-seconds form, clamped. HTTP-date values are ignored
/// and fall back to the computed backoff.
pub fn retry_after_hint(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let seconds: u64 = raw.trim().parse().ok()?;
    Some(Duration::from_secs(seconds).min(RETRY_AFTER_CAP))
}
