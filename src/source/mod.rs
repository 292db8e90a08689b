//! Host system adapters for paged record retrieval.
//!
//! Every external library system is wrapped in one [`SourceAdapter`]: "fetch
//! one page of records since this watermark, at this offset, with this
//! limit." Pagination conventions, authentication schemes, and failure
//! classification all live behind the trait; the paginator driving it stays
//! transport-agnostic.
//!
//! # Architecture
//!
//! - [`SourceAdapter`] - Async trait each host system implements
//! - [`PageResult`] - One page of records plus an optional adapter-reported
//!   continuation offset and opaque checkpoint state
//! - [`SierraAdapter`] - OAuth-style bearer token host system
//! - [`PolarisAdapter`] - Signed-request host system
//! - [`SyntheticAdapter`] - Deterministic generator for tests and rehearsal
//! - [`TokenCache`] - Synchronized credential slot shared by token adapters

mod auth;
mod error;
mod polaris;
mod retry;
mod sierra;
mod synthetic;

pub use auth::{CachedToken, TokenCache};
pub use error::SourceError;
pub use polaris::PolarisAdapter;
pub use retry::{
    DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error,
    parse_retry_after, with_retry,
};
pub use sierra::SierraAdapter;
pub use synthetic::SyntheticAdapter;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checkpoint::CheckpointFields;
use crate::config::{SourceConfig, SourceKind};

/// User agent presented to host systems.
pub const APP_USER_AGENT: &str = concat!("interlend/", env!("CARGO_PKG_VERSION"));

/// Default connect timeout for adapter HTTP clients.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One raw record as emitted by a host system.
///
/// Only the identity and a couple of display fields are lifted out; the full
/// payload rides along untouched in `raw`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    /// The host system's own identifier for this record.
    pub source_record_id: String,
    pub title: Option<String>,
    pub author: Option<String>,
    /// The record exactly as the host system returned it.
    pub raw: serde_json::Value,
}

/// Current availability of one record at its host system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilitySnapshot {
    pub copies_total: u32,
    pub copies_available: u32,
    pub status: String,
}

impl Default for AvailabilitySnapshot {
    fn default() -> Self {
        Self {
            copies_total: 0,
            copies_available: 0,
            status: "unknown".to_string(),
        }
    }
}

/// One fetched page of records.
#[derive(Debug, Clone, Default)]
pub struct PageResult {
    /// Records in the order the host system emitted them.
    pub records: Vec<SourceRecord>,
    /// Continuation offset reported by the host system, when its paging is
    /// not plain `offset + len` arithmetic.
    pub next_offset: Option<u64>,
    /// Opaque state the adapter wants carried in the checkpoint.
    pub extra_state: CheckpointFields,
}

impl PageResult {
    #[must_use]
    pub fn new(records: Vec<SourceRecord>) -> Self {
        Self {
            records,
            next_offset: None,
            extra_state: CheckpointFields::new(),
        }
    }

    /// Sets the adapter-reported continuation offset.
    #[must_use]
    pub fn with_next_offset(mut self, next_offset: u64) -> Self {
        self.next_offset = Some(next_offset);
        self
    }
}

/// Paged record retrieval for one host system.
///
/// Implementations own their transport entirely: pagination convention,
/// authentication, timeout handling, and the translation of their failures
/// into the retryable-vs-fatal taxonomy. Adapters must be safe to share
/// across tasks; any mutable credential state belongs in a [`TokenCache`],
/// not a bare field.
#[async_trait]
pub trait SourceAdapter: Send + Sync + std::fmt::Debug {
    /// Stable short identifier, e.g. `sierra-main`. Used for work grouping,
    /// per-source throttling, and log attribution.
    fn system_id(&self) -> &str;

    /// Owning context id for this system's checkpoints.
    fn owner_id(&self) -> Uuid;

    /// Whether the operator has ingestion for this system switched on.
    fn is_enabled(&self) -> bool;

    /// Fetches one page of records.
    ///
    /// `since_millis` is absent during a bootstrap pass and carries the delta
    /// watermark afterwards. `offset` is the position within the current
    /// pass; `limit` is the page size.
    async fn fetch_page(
        &self,
        since_millis: Option<i64>,
        offset: u64,
        limit: u32,
    ) -> Result<PageResult, SourceError>;

    /// Looks up current availability for one record.
    async fn fetch_availability(
        &self,
        source_record_id: &str,
    ) -> Result<AvailabilitySnapshot, SourceError>;
}

/// Builds the adapter registry from configuration.
///
/// Disabled sources are skipped at info level; misconfigured sources are
/// skipped at warn level so one broken entry cannot keep the rest of the
/// broker from syncing.
#[must_use]
pub fn build_registry(
    sources: &[SourceConfig],
    request_timeout: Duration,
    retry: &RetryPolicy,
) -> Vec<Arc<dyn SourceAdapter>> {
    let mut adapters: Vec<Arc<dyn SourceAdapter>> = Vec::new();

    for cfg in sources {
        if !cfg.enabled {
            info!(
                system = %cfg.system_id,
                "source disabled by configuration; skipping"
            );
            continue;
        }

        let built: Result<Arc<dyn SourceAdapter>, SourceError> = match cfg.kind {
            SourceKind::Sierra => SierraAdapter::from_config(cfg, request_timeout, retry.clone())
                .map(|adapter| Arc::new(adapter) as Arc<dyn SourceAdapter>),
            SourceKind::Polaris => PolarisAdapter::from_config(cfg, request_timeout, retry.clone())
                .map(|adapter| Arc::new(adapter) as Arc<dyn SourceAdapter>),
            SourceKind::Synthetic => {
                Ok(Arc::new(SyntheticAdapter::from_config(cfg)) as Arc<dyn SourceAdapter>)
            }
        };

        match built {
            Ok(adapter) => {
                debug!(system = %adapter.system_id(), "registered source adapter");
                adapters.push(adapter);
            }
            Err(error) => warn!(
                system = %cfg.system_id,
                error = %error,
                "source adapter unavailable; continuing with remaining sources"
            ),
        }
    }

    adapters
}

/// Builds the HTTP client adapters share their transport settings from.
pub(crate) fn build_http_client(
    system: &str,
    request_timeout: Duration,
) -> Result<reqwest::Client, SourceError> {
    reqwest::Client::builder()
        .timeout(request_timeout)
        .connect_timeout(CONNECT_TIMEOUT)
        .user_agent(APP_USER_AGENT)
        .build()
        .map_err(|e| SourceError::config(system, format!("failed to build HTTP client: {e}")))
}

/// Pulls a record id out of a JSON value, accepting both string and numeric
/// forms since host systems disagree on this.
pub(crate) fn id_from_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
