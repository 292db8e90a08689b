//! Sierra host system adapter - paged bib harvesting over the Sierra REST API.
//!
//! Sierra authenticates with an OAuth-style client-credentials token obtained
//! from `POST {base}/token` with HTTP basic auth. The token lives in a
//! [`TokenCache`]; a 401/403 on any call invalidates it so the retry
//! authenticates from scratch. Pagination is plain offset arithmetic, so
//! pages never carry a continuation offset.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::config::SourceConfig;

use super::auth::{CachedToken, TokenCache};
use super::error::SourceError;
use super::retry::{RetryPolicy, parse_retry_after, with_retry};
use super::{
    AvailabilitySnapshot, PageResult, SourceAdapter, SourceRecord, build_http_client,
    id_from_value,
};

/// Fallback token lifetime when the token endpoint omits `expires_in`.
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Sierra item status code for "on shelf".
const STATUS_AVAILABLE: &str = "-";

// ==================== Sierra API Response Types ====================

/// Response from the Sierra token endpoint.
#[derive(Debug, Deserialize)]
struct SierraTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// A page of bib entries. Entries stay as raw JSON so one malformed record
/// can be skipped without poisoning the page.
#[derive(Debug, Deserialize)]
struct SierraBibPage {
    #[serde(default)]
    entries: Vec<serde_json::Value>,
}

/// A page of item entries for an availability lookup.
#[derive(Debug, Deserialize)]
struct SierraItemPage {
    #[serde(default)]
    entries: Vec<SierraItem>,
}

#[derive(Debug, Deserialize)]
struct SierraItem {
    #[serde(default)]
    status: Option<SierraItemStatus>,
}

#[derive(Debug, Deserialize)]
struct SierraItemStatus {
    #[serde(default)]
    code: Option<String>,
}

// ==================== SierraAdapter ====================

/// Harvests bibs and item availability from a Sierra host system.
pub struct SierraAdapter {
    system_id: String,
    owner_id: Uuid,
    enabled: bool,
    base_url: String,
    client: Client,
    api_key: String,
    api_secret: String,
    tokens: TokenCache,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl SierraAdapter {
    /// Builds the adapter from its configuration entry.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Config` when `base_url`, `api_key`, or
    /// `api_secret` are missing or the base URL does not parse.
    pub fn from_config(
        cfg: &SourceConfig,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, SourceError> {
        let base_url = cfg
            .base_url
            .as_deref()
            .ok_or_else(|| SourceError::config(&cfg.system_id, "sierra source requires base_url"))?;
        Url::parse(base_url)
            .map_err(|e| SourceError::config(&cfg.system_id, format!("invalid base_url: {e}")))?;

        let api_key = cfg
            .api_key
            .as_deref()
            .ok_or_else(|| SourceError::config(&cfg.system_id, "sierra source requires api_key"))?;
        let api_secret = cfg.api_secret.as_deref().ok_or_else(|| {
            SourceError::config(&cfg.system_id, "sierra source requires api_secret")
        })?;

        let client = build_http_client(&cfg.system_id, request_timeout)?;

        Ok(Self {
            system_id: cfg.system_id.clone(),
            owner_id: cfg.owner_id,
            enabled: cfg.enabled,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            tokens: TokenCache::new(),
            retry,
            request_timeout,
        })
    }

    async fn bearer_token(&self) -> Result<String, SourceError> {
        self.tokens
            .current_or_refresh(|| self.request_token())
            .await
    }

    #[instrument(skip(self), fields(system = %self.system_id))]
    async fn request_token(&self) -> Result<CachedToken, SourceError> {
        let url = format!("{}/token", self.base_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .send()
            .await
            .map_err(|e| SourceError::from_reqwest(&self.system_id, self.request_timeout, e))?;

        if !response.status().is_success() {
            return Err(SourceError::auth(
                &self.system_id,
                format!(
                    "token endpoint returned HTTP {}",
                    response.status().as_u16()
                ),
            ));
        }

        let token: SierraTokenResponse = response
            .json()
            .await
            .map_err(|e| SourceError::decode(&self.system_id, format!("token response: {e}")))?;

        let ttl = token.expires_in.map_or(DEFAULT_TOKEN_TTL, Duration::from_secs);
        debug!(ttl_secs = ttl.as_secs(), "obtained fresh bearer token");
        Ok(CachedToken::new(token.access_token, ttl))
    }

    /// Authorized GET with retry. Every attempt re-reads the token cache, so
    /// an attempt that invalidated the token is followed by a fresh login.
    async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value, SourceError> {
        with_retry(&self.retry, &self.system_id, move || async move {
            let token = self.bearer_token().await?;
            let url = format!("{}/{path}", self.base_url);
            let response = self
                .client
                .get(&url)
                .bearer_auth(token)
                .query(query)
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
            // The cached token is dead; drop it so the retry logs in again
            self.tokens.invalidate().await;
            return Err(SourceError::auth(
                &self.system_id,
                format!("credential rejected with HTTP {}", status.as_u16()),
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

impl std::fmt::Debug for SierraAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SierraAdapter")
            .field("system_id", &self.system_id)
            .field("base_url", &self.base_url)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SourceAdapter for SierraAdapter {
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
        let mut query: Vec<(&str, String)> = vec![
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
            ("fields", "id,title,author,updatedDate".to_string()),
        ];
        if let Some(since) = since_millis {
            query.push(("updatedDate", updated_date_range(since)));
        }

        let body = self.get_json("bibs", &query).await?;
        let page: SierraBibPage = serde_json::from_value(body)
            .map_err(|e| SourceError::decode(&self.system_id, format!("bib page: {e}")))?;

        let mut records = Vec::with_capacity(page.entries.len());
        for entry in page.entries {
            match bib_record(&entry) {
                Some(record) => records.push(record),
                None => warn!(raw = %entry, "skipping bib entry without an id"),
            }
        }

        debug!(count = records.len(), offset, "fetched bib page");
        Ok(PageResult::new(records))
    }

    #[instrument(skip(self), fields(system = %self.system_id))]
    async fn fetch_availability(
        &self,
        source_record_id: &str,
    ) -> Result<AvailabilitySnapshot, SourceError> {
        let query = vec![
            ("bibIds", source_record_id.to_string()),
            ("fields", "status".to_string()),
            ("limit", "100".to_string()),
        ];

        let body = self.get_json("items", &query).await?;
        let page: SierraItemPage = serde_json::from_value(body)
            .map_err(|e| SourceError::decode(&self.system_id, format!("item page: {e}")))?;

        let copies_total = u32::try_from(page.entries.len()).unwrap_or(u32::MAX);
        let copies_available = u32::try_from(
            page.entries
                .iter()
                .filter(|item| {
                    item.status.as_ref().and_then(|s| s.code.as_deref())
                        == Some(STATUS_AVAILABLE)
                })
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

/// Lifts one bib entry into a [`SourceRecord`], or `None` when the entry has
/// no usable id.
fn bib_record(entry: &serde_json::Value) -> Option<SourceRecord> {
    let id = entry.get("id").and_then(id_from_value)?;
    let title = entry
        .get("title")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);
    let author = entry
        .get("author")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);

    Some(SourceRecord {
        source_record_id: id,
        title,
        author,
        raw: entry.clone(),
    })
}

/// Sierra range filter matching records updated at or after the watermark:
/// `[2024-05-01T12:00:00Z,]`.
fn updated_date_range(since_millis: i64) -> String {
    let since = DateTime::from_timestamp_millis(since_millis).unwrap_or(DateTime::UNIX_EPOCH);
    format!("[{},]", since.to_rfc3339_opts(SecondsFormat::Secs, true))
}
