//! Synthetic in-process source for demos and runs without real host systems.
//!
//! Serves a fixed catalogue of generated bibs through the same adapter
//! contract as the network sources, so the pagination and checkpoint
//! machinery can be exercised end to end with no credentials. Delta fetches
//! always come back empty since the catalogue never changes after bootstrap.

use async_trait::async_trait;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::SourceConfig;

use super::error::SourceError;
use super::{AvailabilitySnapshot, PageResult, SourceAdapter, SourceRecord};

/// Catalogue size when the configuration does not pick one.
const DEFAULT_TOTAL_RECORDS: u64 = 250;

/// Generates a stable fake catalogue of `total_records` bibs.
#[derive(Debug)]
pub struct SyntheticAdapter {
    system_id: String,
    owner_id: Uuid,
    enabled: bool,
    total_records: u64,
}

impl SyntheticAdapter {
    /// Builds the adapter from its configuration entry. Never fails, the
    /// synthetic source needs no URL and no credentials.
    #[must_use]
    pub fn from_config(cfg: &SourceConfig) -> Self {
        Self {
            system_id: cfg.system_id.clone(),
            owner_id: cfg.owner_id,
            enabled: cfg.enabled,
            total_records: cfg.total_records.unwrap_or(DEFAULT_TOTAL_RECORDS),
        }
    }

    /// Direct constructor for tests.
    #[must_use]
    pub fn new(system_id: impl Into<String>, total_records: u64) -> Self {
        Self {
            system_id: system_id.into(),
            owner_id: Uuid::new_v4(),
            enabled: true,
            total_records,
        }
    }

    fn record(&self, n: u64) -> SourceRecord {
        let id = format!("syn-{n:06}");
        SourceRecord {
            raw: serde_json::json!({
                "id": id,
                "title": format!("Synthetic record {n}"),
                "sequence": n,
            }),
            source_record_id: id,
            title: Some(format!("Synthetic record {n}")),
            author: Some("Interlend Generator".to_string()),
        }
    }
}

#[async_trait]
impl SourceAdapter for SyntheticAdapter {
    fn system_id(&self) -> &str {
        &self.system_id
    }

    fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[instrument(skip(self), fields(system = %self.system_id))]
    async fn fetch_page(
        &self,
        since_millis: Option<i64>,
        offset: u64,
        limit: u32,
    ) -> Result<PageResult, SourceError> {
        // The catalogue never changes, so every delta sweep is empty
        if since_millis.is_some() {
            debug!("delta fetch against static catalogue, returning empty page");
            return Ok(PageResult::new(Vec::new()));
        }

        let start = offset.min(self.total_records);
        let end = offset.saturating_add(u64::from(limit)).min(self.total_records);
        let records = (start..end).map(|n| self.record(n)).collect::<Vec<_>>();

        debug!(count = records.len(), offset, "generated synthetic page");
        Ok(PageResult::new(records))
    }

    #[instrument(skip(self), fields(system = %self.system_id))]
    async fn fetch_availability(
        &self,
        source_record_id: &str,
    ) -> Result<AvailabilitySnapshot, SourceError> {
        let n: u64 = source_record_id
            .strip_prefix("syn-")
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| {
                SourceError::decode(
                    &self.system_id,
                    format!("record id {source_record_id} is not a synthetic id"),
                )
            })?;

        let copies_total = 1 + u32::try_from(n % 3).unwrap_or(0);
        let copies_available = u32::try_from(n % 2).unwrap_or(0);
        let status = if copies_available > 0 {
            "available"
        } else {
            "unavailable"
        };

        Ok(AvailabilitySnapshot {
            copies_total,
            copies_available,
            status: status.to_string(),
        })
    }
}
