//! Integration tests for the backfill providers
//!
//! Each test starts a local axum server standing in for the archive search
//! API, its auth service, or the live API, then drives the real clients
//! against it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Form, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::tempdir;

use archive_merge::backfill::{
    BackfillError, BackfillProvider, FileTokenStore, HistoricalArchiveClient, LiveApiClient,
    MemoryTokenStore, TokenStore,
};
use archive_merge::config::{ArchiveConfig, LiveConfig, LiveCredentials};
use archive_merge::RecordKind;

// ===== HELPERS =====

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn bearer(headers: &HeaderMap) -> String {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string()
}

fn archive_config(addr: SocketAddr) -> ArchiveConfig {
    ArchiveConfig {
        base_url: format!("http://{}", addr),
        auth_url: format!("http://{}/auth", addr),
        max_attempts: 3,
        backoff_step_ms: 0,
        backoff_cap_ms: 0,
        request_timeout_secs: 5,
        still_active_wait_ms: 0,
        lock_wait_secs: 2,
        ..ArchiveConfig::default()
    }
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// ===== ARCHIVE DOUBLE =====

/// Accepts one valid token; `/auth/refresh` hands out `refresh_reply`.
struct ArchiveState {
    valid_token: String,
    refresh_reply: Value,
    searches: AtomicUsize,
    refreshes: AtomicUsize,
    search_status: Option<StatusCode>,
}

impl ArchiveState {
    fn new(valid_token: &str, refresh_reply: Value) -> Arc<Self> {
        Arc::new(Self {
            valid_token: valid_token.to_string(),
            refresh_reply,
            searches: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            search_status: None,
        })
    }
}

async fn archive_search(
    State(state): State<Arc<ArchiveState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    state.searches.fetch_add(1, Ordering::SeqCst);
    if let Some(status) = state.search_status {
        return status.into_response();
    }
    if bearer(&headers) != state.valid_token {
        return StatusCode::FORBIDDEN.into_response();
    }
    let data: Vec<Value> = query
        .get("ids")
        .map(|list| list.split(',').collect::<Vec<_>>())
        .unwrap_or_default()
        .into_iter()
        .filter(|id| *id != "zzz")
        .map(|id| {
            json!({
                "id": id,
                "created_utc": 1_700_000_050,
                "body": format!("body of {}", id),
                "body_html": "<p>x</p>",
                "retrieved_on": 1_700_000_100
            })
        })
        .collect();
    Json(json!({ "data": data })).into_response()
}

async fn archive_refresh(
    State(state): State<Arc<ArchiveState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    state.refreshes.fetch_add(1, Ordering::SeqCst);
    assert!(query.contains_key("access_token"));
    Json(state.refresh_reply.clone())
}

fn archive_app(state: Arc<ArchiveState>) -> Router {
    Router::new()
        .route("/reddit/comment/search", get(archive_search))
        .route("/auth/refresh", post(archive_refresh))
        .with_state(state)
}

// ===== ARCHIVE TESTS =====

#[tokio::test]
async fn test_archive_lookup_strips_html_and_keeps_retrieved_on() {
    let state = ArchiveState::new("good", json!({}));
    let addr = serve(archive_app(state.clone())).await;
    let tokens = Arc::new(MemoryTokenStore::new(Some("good".into())));
    let client = HistoricalArchiveClient::new(archive_config(addr), tokens).unwrap();

    let found = client
        .lookup(RecordKind::Comment, &ids(&["abc", "zzz", "abd"]))
        .await
        .unwrap();

    assert_eq!(found.len(), 2);
    assert_eq!(found[0]["id"], "abc");
    assert!(found[0].get("body_html").is_none());
    assert_eq!(found[0]["retrieved_on"], 1_700_000_100);
    assert_eq!(state.searches.load(Ordering::SeqCst), 1);
    assert_eq!(state.refreshes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_archive_rotates_rejected_token_and_persists_it() {
    let state = ArchiveState::new("fresh", json!({ "access_token": "fresh" }));
    let addr = serve(archive_app(state.clone())).await;
    let dir = tempdir().unwrap();
    let store = Arc::new(FileTokenStore::new(dir.path().join("archive.token")));
    store.save("stale").unwrap();
    let client = HistoricalArchiveClient::new(archive_config(addr), store.clone()).unwrap();

    let found = client.lookup(RecordKind::Comment, &ids(&["abc"])).await.unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(client.token().as_deref(), Some("fresh"));
    assert_eq!(store.load().unwrap().as_deref(), Some("fresh"));
    assert_eq!(state.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(state.searches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_archive_reuses_token_rotated_by_another_run() {
    let state = ArchiveState::new("rotated", json!({ "access_token": "never-used" }));
    let addr = serve(archive_app(state.clone())).await;
    let store = Arc::new(MemoryTokenStore::new(Some("stale".into())));
    let client = HistoricalArchiveClient::new(archive_config(addr), store.clone()).unwrap();

    // Another run rotates after this client has read the stale token.
    store.save("rotated").unwrap();

    let found = client.lookup(RecordKind::Comment, &ids(&["abc"])).await.unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(client.token().as_deref(), Some("rotated"));
    assert_eq!(state.refreshes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_archive_refresh_refused_is_fatal() {
    let state = ArchiveState::new("fresh", json!({ "detail": "Invalid token" }));
    let addr = serve(archive_app(state.clone())).await;
    let store = Arc::new(MemoryTokenStore::new(Some("stale".into())));
    let client = HistoricalArchiveClient::new(archive_config(addr), store).unwrap();

    let err = client
        .lookup(RecordKind::Comment, &ids(&["abc"]))
        .await
        .unwrap_err();

    match err {
        BackfillError::AuthRejected(detail) => assert_eq!(detail, "Invalid token"),
        other => panic!("expected AuthRejected, got {:?}", other),
    }
}

#[tokio::test]
async fn test_archive_still_active_token_is_retried() {
    let state = ArchiveState::new(
        "fresh",
        json!({ "detail": "Access token is still active and can not be refreshed." }),
    );
    let addr = serve(archive_app(state.clone())).await;
    let store = Arc::new(MemoryTokenStore::new(Some("stale".into())));
    let client = HistoricalArchiveClient::new(archive_config(addr), store).unwrap();

    let err = client
        .lookup(RecordKind::Comment, &ids(&["abc"]))
        .await
        .unwrap_err();

    // Every attempt reuses the stale token and asks for a refresh again.
    assert!(matches!(err, BackfillError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(state.searches.load(Ordering::SeqCst), 3);
    assert_eq!(state.refreshes.load(Ordering::SeqCst), 3);
    assert_eq!(client.token().as_deref(), Some("stale"));
}

#[tokio::test]
async fn test_archive_exhausted_retries_end_the_run() {
    let state = Arc::new(ArchiveState {
        valid_token: "good".into(),
        refresh_reply: json!({}),
        searches: AtomicUsize::new(0),
        refreshes: AtomicUsize::new(0),
        search_status: Some(StatusCode::BAD_GATEWAY),
    });
    let addr = serve(archive_app(state.clone())).await;
    let store = Arc::new(MemoryTokenStore::new(Some("good".into())));
    let client = HistoricalArchiveClient::new(archive_config(addr), store).unwrap();

    let err = client
        .lookup(RecordKind::Comment, &ids(&["abc"]))
        .await
        .unwrap_err();

    match err {
        BackfillError::RetriesExhausted {
            provider,
            attempts,
            last,
        } => {
            assert_eq!(provider, "archive");
            assert_eq!(attempts, 3);
            assert!(last.contains("502"));
        }
        other => panic!("expected RetriesExhausted, got {:?}", other),
    }
    assert_eq!(state.searches.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_archive_without_token_fails_fast() {
    let state = ArchiveState::new("good", json!({}));
    let addr = serve(archive_app(state.clone())).await;
    let client =
        HistoricalArchiveClient::new(archive_config(addr), Arc::new(MemoryTokenStore::new(None)))
            .unwrap();

    let err = client
        .lookup(RecordKind::Comment, &ids(&["abc"]))
        .await
        .unwrap_err();

    assert!(matches!(err, BackfillError::MissingToken));
    assert_eq!(state.searches.load(Ordering::SeqCst), 0);
}

// ===== LIVE API DOUBLE =====

/// `/api/info` answers `info_status` for the first `failures` calls, then
/// serves listings.
struct LiveState {
    grants: AtomicUsize,
    info_calls: AtomicUsize,
    info_status: StatusCode,
    failures: usize,
}

async fn live_token(
    State(state): State<Arc<LiveState>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Json<Value> {
    state.grants.fetch_add(1, Ordering::SeqCst);
    assert!(headers.contains_key("authorization"));
    assert_eq!(form.get("grant_type").map(String::as_str), Some("password"));
    assert_eq!(form.get("username").map(String::as_str), Some("collector"));
    Json(json!({ "access_token": "live-token", "expires_in": 3600 }))
}

async fn live_info(
    State(state): State<Arc<LiveState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let call = state.info_calls.fetch_add(1, Ordering::SeqCst);
    if state.info_status != StatusCode::OK && call < state.failures {
        if state.info_status == StatusCode::TOO_MANY_REQUESTS {
            return (state.info_status, [("retry-after", "0")]).into_response();
        }
        return state.info_status.into_response();
    }
    if bearer(&headers) != "live-token" {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let children: Vec<Value> = query
        .get("id")
        .map(|list| list.split(',').collect::<Vec<_>>())
        .unwrap_or_default()
        .into_iter()
        .filter_map(|fullname| fullname.strip_prefix("t1_"))
        .map(|id| {
            json!({
                "kind": "t1",
                "data": {
                    "id": id,
                    "created_utc": 1_700_000_050.0,
                    "body": "[removed]",
                    "body_html": "<p>[removed]</p>",
                    "retrieved_on": 1
                }
            })
        })
        .collect();
    Json(json!({ "kind": "Listing", "data": { "children": children } })).into_response()
}

fn live_setup(info_status: StatusCode) -> (Arc<LiveState>, Router) {
    live_setup_failing(info_status, usize::MAX)
}

fn live_setup_failing(info_status: StatusCode, failures: usize) -> (Arc<LiveState>, Router) {
    let state = Arc::new(LiveState {
        grants: AtomicUsize::new(0),
        info_calls: AtomicUsize::new(0),
        info_status,
        failures,
    });
    let app = Router::new()
        .route("/api/v1/access_token", post(live_token))
        .route("/api/info", get(live_info))
        .with_state(state.clone());
    (state, app)
}

fn live_client(addr: SocketAddr) -> LiveApiClient {
    let config = LiveConfig {
        api_url: format!("http://{}", addr),
        token_url: format!("http://{}/api/v1/access_token", addr),
        max_attempts: 2,
        backoff_step_ms: 0,
        request_timeout_secs: 5,
        ..LiveConfig::default()
    };
    let credentials = LiveCredentials {
        client_id: "client".into(),
        client_secret: "secret".into(),
        username: "collector".into(),
        password: "hunter2".into(),
    };
    LiveApiClient::new(config, credentials).unwrap()
}

// ===== LIVE API TESTS =====

#[tokio::test]
async fn test_live_lookup_uses_fullnames_and_stamps_retrieval() {
    let (state, app) = live_setup(StatusCode::OK);
    let addr = serve(app).await;
    let client = live_client(addr);

    let found = client
        .lookup(RecordKind::Comment, &ids(&["abc", "abd"]))
        .await
        .unwrap();
    let again = client.lookup(RecordKind::Comment, &ids(&["abe"])).await.unwrap();

    assert_eq!(found.len(), 2);
    assert_eq!(found[1]["id"], "abd");
    assert!(found[0].get("body_html").is_none());
    assert!(found[0]["retrieved_on"].as_i64().unwrap() > 1);
    assert_eq!(again.len(), 1);
    // Token is cached across batches.
    assert_eq!(state.grants.load(Ordering::SeqCst), 1);
    assert_eq!(state.info_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_live_refused_batch_degrades_to_empty() {
    let (state, app) = live_setup(StatusCode::NOT_FOUND);
    let addr = serve(app).await;
    let client = live_client(addr);

    let found = client.lookup(RecordKind::Comment, &ids(&["abc"])).await.unwrap();

    assert!(found.is_empty());
    assert_eq!(state.info_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_live_server_errors_exhaust_to_empty() {
    let (state, app) = live_setup(StatusCode::SERVICE_UNAVAILABLE);
    let addr = serve(app).await;
    let client = live_client(addr);

    let found = client.lookup(RecordKind::Comment, &ids(&["abc"])).await.unwrap();

    assert!(found.is_empty());
    assert_eq!(state.info_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_live_rate_limit_is_retried() {
    let (state, app) = live_setup_failing(StatusCode::TOO_MANY_REQUESTS, 1);
    let addr = serve(app).await;
    let client = live_client(addr);

    let found = client.lookup(RecordKind::Comment, &ids(&["abc"])).await.unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["id"], "abc");
    assert_eq!(state.info_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_live_persistent_rate_limit_exhausts_to_empty() {
    let (state, app) = live_setup(StatusCode::TOO_MANY_REQUESTS);
    let addr = serve(app).await;
    let client = live_client(addr);

    let found = client.lookup(RecordKind::Comment, &ids(&["abc"])).await.unwrap();

    assert!(found.is_empty());
    assert_eq!(state.info_calls.load(Ordering::SeqCst), 2);
}
