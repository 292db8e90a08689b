//! Retry logic with exponential backoff for transient host system failures.
//!
//! When a source operation fails, the error is classified into a
//! [`FailureType`]:
//! - [`FailureType::Transient`] - Temporary failures that may succeed on retry
//! - [`FailureType::Permanent`] - Failures that won't succeed regardless of retries
//! - [`FailureType::NeedsAuth`] - Credential rejected; the adapter invalidates
//!   its cached credential so the next attempt re-authenticates
//! - [`FailureType::RateLimited`] - Remote throttling (retries honoring
//!   Retry-After when the server supplies one)
//!
//! The [`RetryPolicy`] then determines whether to retry based on failure type
//! and attempt count, calculating exponential backoff delays with jitter.
//! Exhausting the policy does not abort the run; the caller converts the final
//! error into a per-item marker or a resumable run failure.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

use super::error::SourceError;

/// Default maximum retry attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff (2.5 seconds).
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(2500);

/// Default maximum delay cap (60 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Maximum jitter added to delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Maximum Retry-After delay honored from a server (1 hour).
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Classification of source failure types.
///
/// Used to determine whether a failed source operation should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: network timeout, 5xx server errors, connection refused.
    Transient,

    /// Permanent failure that won't succeed regardless of retries.
    ///
    /// Examples: 404 Not Found, 400 Bad Request, malformed response body.
    Permanent,

    /// Credential rejected or expired.
    ///
    /// Retryable: the adapter drops its cached credential on this failure,
    /// so the following attempt authenticates from scratch instead of
    /// replaying the same rejected token.
    NeedsAuth,

    /// Remote throttling (HTTP 429).
    ///
    /// Retries with backoff, stretched to the server's Retry-After value
    /// when one is present.
    RateLimited,
}

/// Decision on whether to retry a failed source operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior with exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `base_delay`: 2.5 seconds
/// - `max_delay`: 60 seconds
/// - `backoff_multiplier`: 2.0
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt - 1), max_delay) + jitter
/// ```
///
/// With defaults, delays are approximately: 2.5s, 5s (before hitting max attempts).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplier applied each attempt (typically 2.0 for doubling).
    backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Maximum attempts including initial (must be >= 1)
    /// * `base_delay` - Base delay for first retry
    /// * `max_delay` - Maximum delay cap
    /// * `backoff_multiplier` - Multiplier for exponential increase
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Creates a policy with a custom `max_attempts`, using defaults otherwise.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Determines whether to retry a failed source operation.
    ///
    /// # Arguments
    ///
    /// * `failure_type` - Classification of the failure
    /// * `attempt` - The attempt number that just failed (1-indexed)
    ///
    /// # Returns
    ///
    /// A [`RetryDecision`] indicating whether to retry and with what delay.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        // Check if failure type is retryable
        match failure_type {
            FailureType::Permanent => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure - retry would not help".to_string(),
                };
            }
            FailureType::Transient | FailureType::RateLimited | FailureType::NeedsAuth => {
                // Retryable, continue to attempt check. NeedsAuth retries
                // after the adapter has invalidated its cached credential.
            }
        }

        // Check if we've exhausted attempts
        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        // Calculate delay with exponential backoff
        let delay = self.calculate_delay(attempt);

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Calculates the delay for a retry attempt with exponential backoff and jitter.
    ///
    /// Formula: `min(base_delay * multiplier^(attempt - 1), max_delay) + jitter`
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);

        // attempt is 0-indexed for the exponent (attempt 1 = multiplier^0 = 1x base)
        let exponent = f64::from(attempt - 1);
        let delay_ms = base_ms * multiplier.powf(exponent);

        // Cap at max_delay
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        // Add jitter
        let jitter = calculate_jitter();

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let capped = Duration::from_millis(capped_ms as u64);
        capped + jitter
    }
}

/// Generates random jitter between 0 and `MAX_JITTER`.
///
/// Jitter prevents a thundering herd when several sources fail
/// simultaneously and retry at the same time.
fn calculate_jitter() -> Duration {
    let mut rng = rand::thread_rng();
    #[allow(clippy::cast_possible_truncation)]
    let max_ms = MAX_JITTER.as_millis() as u64;
    let jitter_ms = rng.gen_range(0..=max_ms);
    Duration::from_millis(jitter_ms)
}

/// Classifies a source error into a failure type for retry decisions.
///
/// # HTTP Status Code Classification
///
/// | Status | Type | Rationale |
/// |--------|------|-----------|
/// | 400 | Permanent | Bad request - won't succeed on retry |
/// | 401 | NeedsAuth | Unauthorized - re-authenticate and retry |
/// | 403 | NeedsAuth | Forbidden - re-authenticate and retry |
/// | 404 | Permanent | Not found - resource doesn't exist |
/// | 408 | Transient | Request timeout - may succeed |
/// | 410 | Permanent | Gone - permanently removed |
/// | 429 | RateLimited | Rate limited - retry with backoff |
/// | 5xx | Transient | Server error - may be temporary |
///
/// # Non-HTTP Errors
///
/// | Error | Type | Rationale |
/// |-------|------|-----------|
/// | Timeout | Transient | Network may recover |
/// | Network | Transient | Remote may come back |
/// | Auth | NeedsAuth | Fresh credential on next attempt |
/// | RateLimited | RateLimited | Honor the remote's pushback |
/// | Decode | Permanent | Same bytes will fail the same way |
/// | Disabled | Permanent | Operator turned the adapter off |
/// | Config | Permanent | Needs a configuration fix |
#[instrument]
#[must_use]
pub fn classify_error(error: &SourceError) -> FailureType {
    match error {
        SourceError::Http { status, .. } => classify_http_status(*status),

        SourceError::Timeout { .. } | SourceError::Network { .. } => FailureType::Transient,

        SourceError::Auth { .. } => FailureType::NeedsAuth,

        SourceError::RateLimited { .. } => FailureType::RateLimited,

        SourceError::Decode { .. } | SourceError::Disabled { .. } | SourceError::Config { .. } => {
            FailureType::Permanent
        }
    }
}

/// Classifies an HTTP status code into a failure type.
///
/// Explicit match arms are used for each status code for documentation purposes,
/// even though some return the same value.
#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureType {
    match status {
        // Client errors - mostly permanent
        400 => FailureType::Permanent,   // Bad Request
        401 => FailureType::NeedsAuth,   // Unauthorized
        403 => FailureType::NeedsAuth,   // Forbidden
        404 => FailureType::Permanent,   // Not Found
        408 => FailureType::Transient,   // Request Timeout
        410 => FailureType::Permanent,   // Gone
        429 => FailureType::RateLimited, // Too Many Requests

        // Server errors - transient
        500..=599 => FailureType::Transient,

        // Everything else client-side - permanent
        _ => FailureType::Permanent,
    }
}

/// Runs a source operation under a retry policy.
///
/// The operation is re-invoked from scratch on every attempt, so adapters
/// that invalidated a cached credential pick up a fresh one on the retry.
/// A `RateLimited` error carrying a server delay stretches the backoff to at
/// least that delay.
///
/// # Errors
///
/// Returns the last error once the policy declines to retry.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    system: &str,
    mut operation: F,
) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let mut attempt: u32 = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let failure_type = classify_error(&error);

                match policy.should_retry(failure_type, attempt) {
                    RetryDecision::Retry {
                        mut delay,
                        attempt: next_attempt,
                    } => {
                        if let SourceError::RateLimited {
                            retry_after: Some(retry_after),
                            ..
                        } = &error
                        {
                            delay = delay.max(*retry_after);
                        }

                        warn!(
                            system,
                            attempt,
                            next_attempt,
                            delay_ms = delay.as_millis(),
                            error = %error,
                            "source operation failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt = next_attempt;
                    }
                    RetryDecision::DoNotRetry { reason } => {
                        debug!(system, attempt, reason, "not retrying source operation");
                        return Err(error);
                    }
                }
            }
        }
    }
}

/// Parses a Retry-After header value into a duration.
///
/// Accepts both integer seconds and HTTP-date forms per RFC 7231. Values are
/// capped at one hour; garbage yields `None`.
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    // Try parsing as integer seconds first (most common)
    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);

        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }

        return Some(duration);
    }

    // Try parsing as HTTP-date
    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        let now = std::time::SystemTime::now();

        if let Ok(duration) = datetime.duration_since(now) {
            if duration > MAX_RETRY_AFTER {
                warn!(
                    delay_secs = duration.as_secs(),
                    max_secs = MAX_RETRY_AFTER.as_secs(),
                    "Retry-After date exceeds maximum, capping at 1 hour"
                );
                return Some(MAX_RETRY_AFTER);
            }
            Some(duration)
        } else {
            // Date is in the past
            debug!(
                header_value,
                "Retry-After date is in the past, returning zero"
            );
            Some(Duration::ZERO)
        }
    } else {
        debug!(header_value, "unparseable Retry-After value");
        None
    }
}
