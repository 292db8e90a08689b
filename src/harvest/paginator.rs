//! Page-by-page walk over one source with checkpointable progress.
//!
//! The paginator owns the two-phase sweep logic: it asks the adapter for one
//! page at a time, decides from the page length whether more data may exist,
//! and hands each page back together with the exact checkpoint fields that
//! make the page durable once consumed. Persisting the checkpoint is the
//! caller's job and must happen strictly after the page is processed, which
//! is what makes resumption at-least-once instead of at-most-once.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::checkpoint::{CURSOR_FIELD, CheckpointFields};
use crate::source::{SourceAdapter, SourceError, SourceRecord};

use super::cursor::Cursor;

/// Errors from driving a sweep.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// Page size must be positive, anything else loops forever.
    #[error("page size must be positive, got {0}")]
    InvalidPageSize(u32),

    /// The source failed after retries were exhausted.
    #[error("source {system} failed during sweep")]
    Source {
        system: String,
        #[source]
        source: SourceError,
    },
}

/// Progress of the sweep in flight.
#[derive(Debug, Clone, Copy)]
pub struct RunState {
    /// Where the next fetch resumes.
    pub cursor: Cursor,
    /// Pages fetched so far in this run.
    pub pages_fetched: u64,
    /// Wall clock captured before the first fetch. Exhaustion hands this to
    /// the next run as its delta watermark, so records changed mid-sweep are
    /// re-read rather than lost.
    pub request_start_millis: i64,
    /// False once a short page proved the source exhausted.
    pub possibly_more: bool,
}

/// One consumed page plus the checkpoint that makes it durable.
#[derive(Debug)]
pub struct HarvestPage {
    pub records: Vec<SourceRecord>,
    /// Full checkpoint fields to persist after this page is processed.
    pub checkpoint: CheckpointFields,
    /// True when this page proved the source exhausted.
    pub is_last: bool,
}

/// Walks one source page by page, yielding checkpointable pages.
pub struct Paginator {
    adapter: Arc<dyn SourceAdapter>,
    page_size: u32,
    state: RunState,
    /// Adapter passthrough state accumulated across pages, persisted
    /// alongside the cursor in every checkpoint.
    base_fields: CheckpointFields,
    finished: bool,
}

impl Paginator {
    /// Starts or resumes a sweep from the given checkpoint fields.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::InvalidPageSize`] when `page_size` is zero.
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        page_size: u32,
        prior: Option<&CheckpointFields>,
    ) -> Result<Self, HarvestError> {
        if page_size == 0 {
            return Err(HarvestError::InvalidPageSize(page_size));
        }

        let cursor = Cursor::from_fields(prior);
        let base_fields = prior.cloned().unwrap_or_default();

        Ok(Self {
            adapter,
            page_size,
            state: RunState {
                cursor,
                pages_fetched: 0,
                request_start_millis: chrono::Utc::now().timestamp_millis(),
                possibly_more: true,
            },
            base_fields,
            finished: false,
        })
    }

    /// Current sweep progress.
    #[must_use]
    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// True once exhaustion has been observed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Fetches the next page, or `None` once the source is exhausted.
    ///
    /// On error the cursor does not move, so the caller can simply call
    /// again and refetch the same page.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Source`] when the adapter fails.
    #[instrument(skip(self), fields(system = %self.adapter.system_id(), cursor = %self.state.cursor))]
    pub async fn next_page(&mut self) -> Result<Option<HarvestPage>, HarvestError> {
        if self.finished {
            return Ok(None);
        }

        let cursor = self.state.cursor;
        let page = self
            .adapter
            .fetch_page(cursor.since_millis(), cursor.offset(), self.page_size)
            .await
            .map_err(|e| HarvestError::Source {
                system: self.adapter.system_id().to_string(),
                source: e,
            })?;

        self.state.pages_fetched += 1;
        for (key, value) in page.extra_state {
            self.base_fields.insert(key, value);
        }

        let fetched = page.records.len();
        let is_last = fetched < self.page_size as usize;

        if is_last {
            // Exhaustion: next run sweeps deltas from this run's start time
            self.finished = true;
            self.state.possibly_more = false;
            self.state.cursor = Cursor::Delta {
                since_millis: self.state.request_start_millis,
                offset: 0,
            };
            info!(
                pages = self.state.pages_fetched,
                next_cursor = %self.state.cursor,
                "source exhausted"
            );
        } else {
            // A full page may hide more behind it. Prefer the offset the
            // adapter reported over plain arithmetic.
            let next_offset = page
                .next_offset
                .unwrap_or_else(|| cursor.offset() + fetched as u64);
            self.state.cursor = cursor.at_offset(next_offset);
            debug!(fetched, next_cursor = %self.state.cursor, "page consumed, more may follow");
        }

        let mut checkpoint = self.base_fields.clone();
        checkpoint.insert(
            CURSOR_FIELD.to_string(),
            serde_json::Value::String(self.state.cursor.encode()),
        );

        Ok(Some(HarvestPage {
            records: page.records,
            checkpoint,
            is_last,
        }))
    }
}
