//! Polaris host system adapter - signed-request bib sync over the Polaris API.
//!
//! Polaris authenticates every request individually: a `PolarisDate` header
//! carries the RFC 7231 request time and the `Authorization` header carries
//! `PWS {access_id}:{signature}` where the signature is a digest over the
//! method, the exact request URL, the date header, and the shared secret.
//! There is no cached credential to invalidate; a rejected signature is
//! retried with a freshly dated signature, which also rides out clock skew.
//!
//! Unlike Sierra, Polaris reports its own continuation offset with each
//! page, which the paginator must prefer over offset arithmetic.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::config::SourceConfig;

use super::error::SourceError;
use super::retry::{RetryPolicy, parse_retry_after, with_retry};
use super::{
    AvailabilitySnapshot, PageResult, SourceAdapter, SourceRecord, build_http_client,
    id_from_value,
};

// ==================== Polaris API Response Types ====================

/// A page from the bib sync endpoint.
#[derive(Debug, Deserialize)]
struct PolarisSyncPage {
    /// Rows stay as raw JSON so one malformed row can be skipped.
    #[serde(default)]
    rows: Vec<serde_json::Value>,
    /// Server-reported continuation offset for the next fetch.
    #[serde(default)]
    continuation: Option<u64>,
}

/// Holdings for one bib.
#[derive(Debug, Deserialize)]
struct PolarisHoldingsResponse {
    #[serde(default)]
    holdings: Vec<PolarisHolding>,
}

#[derive(Debug, Deserialize)]
struct PolarisHolding {
    #[serde(default)]
    available: bool,
}

// ==================== PolarisAdapter ====================

/// Harvests bibs and holdings from a Polaris host system.
pub struct PolarisAdapter {
    system_id: String,
    owner_id: Uuid,
    enabled: bool,
    base_url: String,
    client: Client,
    access_id: String,
    api_secret: String,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl PolarisAdapter {
    /// Builds the adapter from its configuration entry.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Config` when `base_url`, `access_id`, or
    /// `api_secret` are missing or the base URL does not parse.
    pub fn from_config(
        cfg: &SourceConfig,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, SourceError> {
        let base_url = cfg.base_url.as_deref().ok_or_else(|| {
            SourceError::config(&cfg.system_id, "polaris source requires base_url")
        })?;
        Url::parse(base_url)
            .map_err(|e| SourceError::config(&cfg.system_id, format!("invalid base_url: {e}")))?;

        let access_id = cfg.access_id.as_deref().ok_or_else(|| {
            SourceError::config(&cfg.system_id, "polaris source requires access_id")
        })?;
        let api_secret = cfg.api_secret.as_deref().ok_or_else(|| {
            SourceError::config(&cfg.system_id, "polaris source requires api_secret")
        })?;

        let client = build_http_client(&cfg.system_id, request_timeout)?;

        Ok(Self {
            system_id: cfg.system_id.clone(),
            owner_id: cfg.owner_id,
            enabled: cfg.enabled,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            access_id: access_id.to_string(),
            api_secret: api_secret.to_string(),
            retry,
            request_timeout,
        })
    }

    /// Computes the request signature over method, exact URL, and date.
    fn sign(&self, method: &str, url: &str, date: &str) -> String {
        let canonical = format!("{method}{url}{date}{}", self.api_secret);
        let digest = Sha256::digest(canonical.as_bytes());
        format!("{digest:x}")
    }

    /// Signed GET with retry. Each attempt is signed with a fresh date, so a
    /// signature rejected for clock skew heals on the next attempt.
    async fn get_json(&self, url: &str) -> Result<serde_json::Value, SourceError> {
        with_retry(&self.retry, &self.system_id, move || async move {
            // The signature covers the exact URL string sent on the wire
            let date = httpdate::fmt_http_date(SystemTime::now());
            let signature = self.sign("GET", url, &date);
            let authorization = format!("PWS {}:{signature}", self.access_id);

            let response = self
                .client
                .get(url)
                .header("PolarisDate", &date)
                .header(reqwest::header::AUTHORIZATION, authorization)
                .send()
                .await
                .map_err(|e| SourceError::from_reqwest(&self.system_id, self.request_timeout, e))?;
            self.decode_response(response).await
        })
        .await
    }

    async fn decode_response(&self, response: Response) -> Result<serde_json::Value, SourceError> {
        let status = response.status();
        let url = response.url().to_string();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SourceError::auth(
                &self.system_id,
                format!("request signature rejected with HTTP {}", status.as_u16()),
            ));
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            return Err(SourceError::rate_limited(&self.system_id, retry_after));
        }

        if !status.is_success() {
            return Err(SourceError::http_status(
                &self.system_id,
                &url,
                status.as_u16(),
            ));
        }

        response
            .json()
            .await
            .map_err(|e| SourceError::decode(&self.system_id, format!("response body: {e}")))
    }
}

impl std::fmt::Debug for PolarisAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolarisAdapter")
            .field("system_id", &self.system_id)
            .field("base_url", &self.base_url)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SourceAdapter for PolarisAdapter {
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
        let mut url = format!(
            "{}/sync/bibs?offset={offset}&limit={limit}",
            self.base_url
        );
        if let Some(since) = since_millis {
            url.push_str(&format!("&since={since}"));
        }

        let body = self.get_json(&url).await?;
        let page: PolarisSyncPage = serde_json::from_value(body)
            .map_err(|e| SourceError::decode(&self.system_id, format!("sync page: {e}")))?;

        let mut records = Vec::with_capacity(page.rows.len());
        for row in page.rows {
            match bib_record(&row) {
                Some(record) => records.push(record),
                None => warn!(raw = %row, "skipping sync row without a bibId"),
            }
        }

        debug!(
            count = records.len(),
            offset,
            continuation = page.continuation,
            "fetched sync page"
        );

        let result = PageResult::new(records);
        Ok(match page.continuation {
            Some(next_offset) => result.with_next_offset(next_offset),
            None => result,
        })
    }

    #[instrument(skip(self), fields(system = %self.system_id))]
    async fn fetch_availability(
        &self,
        source_record_id: &str,
    ) -> Result<AvailabilitySnapshot, SourceError> {
        let url = format!("{}/bibs/{source_record_id}/holdings", self.base_url);

        let body = self.get_json(&url).await?;
        let response: PolarisHoldingsResponse = serde_json::from_value(body)
            .map_err(|e| SourceError::decode(&self.system_id, format!("holdings: {e}")))?;

        let copies_total = u32::try_from(response.holdings.len()).unwrap_or(u32::MAX);
        let copies_available = u32::try_from(
            response
                .holdings
                .iter()
                .filter(|holding| holding.available)
                .count(),
        )
        .unwrap_or(u32::MAX);

        let status = if copies_available > 0 {
            "available"
        } else if copies_total > 0 {
            "unavailable"
        } else {
            "no-holdings"
        };

        Ok(AvailabilitySnapshot {
            copies_total,
            copies_available,
            status: status.to_string(),
        })
    }
}

/// Lifts one sync row into a [`SourceRecord`], or `None` when the row has no
/// usable bib id.
fn bib_record(row: &serde_json::Value) -> Option<SourceRecord> {
    let id = row.get("bibId").and_then(id_from_value)?;
    let title = row
        .get("title")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);
    let author = row
        .get("author")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);

    Some(SourceRecord {
        source_record_id: id,
        title,
        author,
        raw: row.clone(),
    })
}
