//! Integration tests for the Sierra and Polaris adapters against a mock
//! host system: authentication flows, retry behavior, and the exact shape
//! of requests on the wire.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{
    basic_auth, bearer_token, header_exists, header_regex, method, path, query_param,
    query_param_is_missing,
};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use interlend_core::config::{SourceConfig, SourceKind};
use interlend_core::source::{PolarisAdapter, SierraAdapter};
use interlend_core::{RetryPolicy, SourceAdapter, SourceError};

mod support;
use support::socket_guard::{socket_skip_return, start_mock_server_or_skip};

macro_rules! require_mock_server {
    () => {{
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return socket_skip_return();
        };
        mock_server
    }};
}

// ==================== Helper Functions ====================

/// Retry policy with near-zero backoff so retrying tests finish quickly.
fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_attempts,
        Duration::from_millis(1),
        Duration::from_millis(20),
        2.0,
    )
}

fn sierra_adapter(server: &MockServer, retry: RetryPolicy) -> SierraAdapter {
    let cfg = SourceConfig {
        kind: SourceKind::Sierra,
        system_id: "sierra-main".to_string(),
        owner_id: Uuid::new_v4(),
        enabled: true,
        base_url: Some(server.uri()),
        api_key: Some("client-key".to_string()),
        api_secret: Some("client-secret".to_string()),
        access_id: None,
        total_records: None,
    };
    SierraAdapter::from_config(&cfg, Duration::from_secs(5), retry).unwrap()
}

fn polaris_adapter(server: &MockServer, retry: RetryPolicy) -> PolarisAdapter {
    let cfg = SourceConfig {
        kind: SourceKind::Polaris,
        system_id: "polaris-east".to_string(),
        owner_id: Uuid::new_v4(),
        enabled: true,
        base_url: Some(server.uri()),
        api_key: None,
        api_secret: Some("shared-secret".to_string()),
        access_id: Some("broker-access".to_string()),
        total_records: None,
    };
    PolarisAdapter::from_config(&cfg, Duration::from_secs(5), retry).unwrap()
}

/// Token endpoint issuing `tok-1`, `tok-2`, ... so tests can observe when
/// the adapter logs in again.
struct RotatingToken {
    issued: AtomicUsize,
}

impl RotatingToken {
    fn new() -> Self {
        Self {
            issued: AtomicUsize::new(0),
        }
    }
}

impl Respond for RotatingToken {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        ResponseTemplate::new(200).set_body_json(json!({
            "access_token": format!("tok-{n}"),
            "expires_in": 3600,
        }))
    }
}

async fn mount_token_endpoint(server: &MockServer, expected_logins: u64) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(basic_auth("client-key", "client-secret"))
        .respond_with(RotatingToken::new())
        .expect(expected_logins)
        .mount(server)
        .await;
}

// ==================== Sierra Tests ====================

#[tokio::test]
async fn test_sierra_bootstrap_page_fetches_token_then_bibs() {
    let mock_server = require_mock_server!();
    mount_token_endpoint(&mock_server, 1).await;

    Mock::given(method("GET"))
        .and(path("/bibs"))
        .and(bearer_token("tok-1"))
        .and(query_param("offset", "0"))
        .and(query_param("limit", "50"))
        .and(query_param("fields", "id,title,author,updatedDate"))
        .and(query_param_is_missing("updatedDate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total": 2,
            "entries": [
                {
                    "id": "1000001",
                    "title": "Treasure Island",
                    "author": "Stevenson, Robert Louis",
                    "updatedDate": "2024-05-01T12:00:00Z",
                },
                { "id": 1000002, "title": "Kidnapped" },
            ],
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let adapter = sierra_adapter(&mock_server, fast_retry(1));
    let page = adapter.fetch_page(None, 0, 50).await.unwrap();

    assert_eq!(page.records.len(), 2);
    assert_eq!(page.records[0].source_record_id, "1000001");
    assert_eq!(page.records[0].title.as_deref(), Some("Treasure Island"));
    assert_eq!(page.records[1].source_record_id, "1000002");
    // Sierra never reports a continuation; pagination is offset arithmetic
    assert_eq!(page.next_offset, None);
}

#[tokio::test]
async fn test_sierra_delta_page_sends_updated_date_range() {
    let mock_server = require_mock_server!();
    mount_token_endpoint(&mock_server, 1).await;

    Mock::given(method("GET"))
        .and(path("/bibs"))
        .and(query_param("offset", "100"))
        .and(query_param("updatedDate", "[2024-05-01T12:00:00Z,]"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "entries": [] })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let adapter = sierra_adapter(&mock_server, fast_retry(1));
    // 2024-05-01T12:00:00Z as epoch millis
    let page = adapter.fetch_page(Some(1_714_564_800_000), 100, 50).await.unwrap();

    assert!(page.records.is_empty());
}

#[tokio::test]
async fn test_sierra_rejected_token_triggers_fresh_login() {
    let mock_server = require_mock_server!();
    // First login yields tok-1; the retry after the 401 logs in for tok-2
    mount_token_endpoint(&mock_server, 2).await;

    Mock::given(method("GET"))
        .and(path("/bibs"))
        .and(bearer_token("tok-1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/bibs"))
        .and(bearer_token("tok-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [{ "id": "2000001", "title": "Catriona" }],
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let adapter = sierra_adapter(&mock_server, fast_retry(2));
    let page = adapter.fetch_page(None, 0, 10).await.unwrap();

    assert_eq!(page.records.len(), 1);
    assert_eq!(page.records[0].source_record_id, "2000001");
}

#[tokio::test]
async fn test_sierra_throttled_page_is_retried_with_same_token() {
    let mock_server = require_mock_server!();
    // A 429 does not invalidate the token, so exactly one login happens
    mount_token_endpoint(&mock_server, 1).await;

    Mock::given(method("GET"))
        .and(path("/bibs"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/bibs"))
        .and(bearer_token("tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [{ "id": "3000001" }],
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let adapter = sierra_adapter(&mock_server, fast_retry(3));
    let page = adapter.fetch_page(None, 0, 10).await.unwrap();

    assert_eq!(page.records.len(), 1);
}

#[tokio::test]
async fn test_sierra_not_found_is_permanent_and_not_retried() {
    let mock_server = require_mock_server!();
    mount_token_endpoint(&mock_server, 1).await;

    Mock::given(method("GET"))
        .and(path("/bibs"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;

    let adapter = sierra_adapter(&mock_server, fast_retry(3));
    let result = adapter.fetch_page(None, 0, 10).await;

    assert!(matches!(result, Err(SourceError::Http { status: 404, .. })));
}

#[tokio::test]
async fn test_sierra_availability_counts_items_on_shelf() {
    let mock_server = require_mock_server!();
    mount_token_endpoint(&mock_server, 1).await;

    Mock::given(method("GET"))
        .and(path("/items"))
        .and(query_param("bibIds", "1000001"))
        .and(query_param("fields", "status"))
        .and(query_param("limit", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [
                { "status": { "code": "-" } },
                { "status": { "code": "t" } },
                { "status": { "code": "-" } },
            ],
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let adapter = sierra_adapter(&mock_server, fast_retry(1));
    let snapshot = adapter.fetch_availability("1000001").await.unwrap();

    assert_eq!(snapshot.copies_total, 3);
    assert_eq!(snapshot.copies_available, 2);
    assert_eq!(snapshot.status, "available");
}

#[tokio::test]
async fn test_sierra_availability_without_items_reports_no_holdings() {
    let mock_server = require_mock_server!();
    mount_token_endpoint(&mock_server, 1).await;

    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "entries": [] })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let adapter = sierra_adapter(&mock_server, fast_retry(1));
    let snapshot = adapter.fetch_availability("9999999").await.unwrap();

    assert_eq!(snapshot.copies_total, 0);
    assert_eq!(snapshot.copies_available, 0);
    assert_eq!(snapshot.status, "no-holdings");
}

// ==================== Polaris Tests ====================

#[tokio::test]
async fn test_polaris_page_is_signed_and_carries_continuation() {
    let mock_server = require_mock_server!();

    Mock::given(method("GET"))
        .and(path("/sync/bibs"))
        .and(query_param("offset", "100"))
        .and(query_param("limit", "50"))
        .and(query_param_is_missing("since"))
        .and(header_exists("PolarisDate"))
        .and(header_regex("authorization", "^PWS broker-access:[0-9a-f]{64}$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rows": [
                { "bibId": 42, "title": "The Master of Ballantrae" },
                { "bibId": "43" },
            ],
            "continuation": 450,
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let adapter = polaris_adapter(&mock_server, fast_retry(1));
    let page = adapter.fetch_page(None, 100, 50).await.unwrap();

    assert_eq!(page.records.len(), 2);
    assert_eq!(page.records[0].source_record_id, "42");
    assert_eq!(page.records[1].source_record_id, "43");
    // The server-reported continuation must override offset arithmetic
    assert_eq!(page.next_offset, Some(450));
}

#[tokio::test]
async fn test_polaris_delta_page_passes_since_watermark() {
    let mock_server = require_mock_server!();

    Mock::given(method("GET"))
        .and(path("/sync/bibs"))
        .and(query_param("since", "1700000000000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "rows": [] })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let adapter = polaris_adapter(&mock_server, fast_retry(1));
    let page = adapter
        .fetch_page(Some(1_700_000_000_000), 0, 25)
        .await
        .unwrap();

    assert!(page.records.is_empty());
    assert_eq!(page.next_offset, None);
}

#[tokio::test]
async fn test_polaris_rejected_signature_heals_on_retry() {
    let mock_server = require_mock_server!();

    // A clock-skewed signature is rejected once, then the freshly dated
    // retry goes through
    Mock::given(method("GET"))
        .and(path("/sync/bibs"))
        .respond_with(ResponseTemplate::new(403))
        .up_to_n_times(1)
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/sync/bibs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rows": [{ "bibId": 7 }],
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let adapter = polaris_adapter(&mock_server, fast_retry(2));
    let page = adapter.fetch_page(None, 0, 10).await.unwrap();

    assert_eq!(page.records.len(), 1);
}

#[tokio::test]
async fn test_polaris_holdings_drive_availability() {
    let mock_server = require_mock_server!();

    Mock::given(method("GET"))
        .and(path("/bibs/42/holdings"))
        .and(header_exists("PolarisDate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "holdings": [
                { "available": true, "branch": "Central" },
                { "available": false, "branch": "East" },
            ],
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let adapter = polaris_adapter(&mock_server, fast_retry(1));
    let snapshot = adapter.fetch_availability("42").await.unwrap();

    assert_eq!(snapshot.copies_total, 2);
    assert_eq!(snapshot.copies_available, 1);
    assert_eq!(snapshot.status, "available");
}

#[tokio::test]
async fn test_polaris_malformed_body_is_a_decode_error() {
    let mock_server = require_mock_server!();

    Mock::given(method("GET"))
        .and(path("/sync/bibs"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .expect(1)
        .mount(&mock_server)
        .await;

    // Decode failures are permanent; the single expected request above
    // verifies no retry was attempted
    let adapter = polaris_adapter(&mock_server, fast_retry(3));
    let result = adapter.fetch_page(None, 0, 10).await;

    assert!(matches!(result, Err(SourceError::Decode { .. })));
}
