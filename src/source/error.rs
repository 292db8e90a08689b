//! Source adapter error types.
//!
//! Every failure a host system can produce is folded into [`SourceError`],
//! tagged with the owning system id so batch-level logs stay attributable.
//! Classification into retryable vs. fatal lives in [`super::retry`].

use std::time::Duration;

use thiserror::Error;

/// Errors from host system adapters.
#[derive(Error, Debug)]
pub enum SourceError {
    /// Remote returned a non-success HTTP status.
    #[error("{system}: HTTP {status} from {url}")]
    Http {
        system: String,
        status: u16,
        url: String,
    },

    /// Network-level failure reaching the remote.
    #[error("{system}: network error: {source}")]
    Network {
        system: String,
        #[source]
        source: reqwest::Error,
    },

    /// The remote did not answer within the configured timeout.
    #[error("{system}: request timed out after {seconds}s")]
    Timeout { system: String, seconds: u64 },

    /// Credential was rejected or could not be obtained.
    #[error("{system}: authentication failed: {reason}")]
    Auth { system: String, reason: String },

    /// Remote asked us to back off.
    #[error("{system}: rate limited by remote")]
    RateLimited {
        system: String,
        retry_after: Option<Duration>,
    },

    /// Response body did not match the expected shape.
    #[error("{system}: malformed response: {reason}")]
    Decode { system: String, reason: String },

    /// The adapter is disabled by configuration.
    #[error("{system}: adapter is disabled")]
    Disabled { system: String },

    /// The adapter configuration is incomplete or invalid.
    #[error("{system}: configuration error: {reason}")]
    Config { system: String, reason: String },
}

impl SourceError {
    /// Creates an HTTP status error with the request URL for context.
    #[must_use]
    pub fn http_status(system: &str, url: &str, status: u16) -> Self {
        Self::Http {
            system: system.to_string(),
            status,
            url: url.to_string(),
        }
    }

    /// Wraps a reqwest error, folding timeouts into their own variant.
    #[must_use]
    pub fn from_reqwest(system: &str, timeout: Duration, error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout {
                system: system.to_string(),
                seconds: timeout.as_secs(),
            }
        } else {
            Self::Network {
                system: system.to_string(),
                source: error,
            }
        }
    }

    /// Creates an authentication error.
    #[must_use]
    pub fn auth(system: &str, reason: impl Into<String>) -> Self {
        Self::Auth {
            system: system.to_string(),
            reason: reason.into(),
        }
    }

    /// Creates a rate-limit error with an optional server-requested delay.
    #[must_use]
    pub fn rate_limited(system: &str, retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            system: system.to_string(),
            retry_after,
        }
    }

    /// Creates a malformed-response error.
    #[must_use]
    pub fn decode(system: &str, reason: impl Into<String>) -> Self {
        Self::Decode {
            system: system.to_string(),
            reason: reason.into(),
        }
    }

    /// Creates a disabled-adapter error.
    #[must_use]
    pub fn disabled(system: &str) -> Self {
        Self::Disabled {
            system: system.to_string(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(system: &str, reason: impl Into<String>) -> Self {
        Self::Config {
            system: system.to_string(),
            reason: reason.into(),
        }
    }

    /// The system id this error is attributed to.
    #[must_use]
    pub fn system(&self) -> &str {
        match self {
            Self::Http { system, .. }
            | Self::Network { system, .. }
            | Self::Timeout { system, .. }
            | Self::Auth { system, .. }
            | Self::RateLimited { system, .. }
            | Self::Decode { system, .. }
            | Self::Disabled { system }
            | Self::Config { system, .. } => system,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_error_includes_context() {
        let error = SourceError::http_status("sierra-main", "https://lms.example.com/bibs", 503);
        let message = error.to_string();

        assert!(message.contains("sierra-main"));
        assert!(message.contains("503"));
        assert!(message.contains("https://lms.example.com/bibs"));
    }

    #[test]
    fn test_system_accessor_covers_all_variants() {
        let errors = vec![
            SourceError::http_status("a", "https://x/", 500),
            SourceError::auth("b", "expired"),
            SourceError::rate_limited("c", None),
            SourceError::decode("d", "missing field"),
            SourceError::disabled("e"),
            SourceError::config("f", "no base_url"),
            SourceError::Timeout {
                system: "g".to_string(),
                seconds: 30,
            },
        ];

        let systems: Vec<&str> = errors.iter().map(SourceError::system).collect();
        assert_eq!(systems, vec!["a", "b", "c", "d", "e", "f", "g"]);
    }
}
