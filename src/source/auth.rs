//! Cached credential handling for token-authenticated host systems.
//!
//! A bare "current token" field is unsafe once an adapter is shared across
//! tasks, so the cache is a single mutex-guarded slot with the expiry check
//! and the refresh both performed under the lock. Concurrent callers either
//! reuse the live token or wait for the one in-flight refresh instead of
//! stampeding the token endpoint.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use super::error::SourceError;

/// Tokens within this margin of expiry are treated as already expired, so a
/// token never dies mid-request.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// A credential with its expiry deadline.
#[derive(Debug, Clone)]
pub struct CachedToken {
    secret: String,
    expires_at: Instant,
}

impl CachedToken {
    /// Creates a token valid for `ttl` from now.
    #[must_use]
    pub fn new(secret: impl Into<String>, ttl: Duration) -> Self {
        Self {
            secret: secret.into(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() + EXPIRY_MARGIN < self.expires_at
    }
}

/// Synchronized credential slot for one host system.
#[derive(Debug, Default)]
pub struct TokenCache {
    slot: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live cached token, refreshing through `refresh` when the
    /// slot is empty or the token is at or past its expiry margin.
    ///
    /// # Errors
    ///
    /// Propagates the refresh failure; the slot is left empty so the next
    /// caller tries again.
    pub async fn current_or_refresh<F, Fut>(&self, refresh: F) -> Result<String, SourceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedToken, SourceError>>,
    {
        let mut slot = self.slot.lock().await;

        if let Some(token) = slot.as_ref() {
            if token.is_live() {
                return Ok(token.secret.clone());
            }
            debug!("cached token at expiry margin, refreshing");
        }

        *slot = None;
        let fresh = refresh().await?;
        let secret = fresh.secret.clone();
        *slot = Some(fresh);
        Ok(secret)
    }

    /// Drops the cached token so the next call re-authenticates.
    ///
    /// Adapters call this when the remote rejects the credential; retrying
    /// the same token would only repeat the failure.
    pub async fn invalidate(&self) {
        let mut slot = self.slot.lock().await;
        if slot.take().is_some() {
            debug!("cached token invalidated");
        }
    }
}
