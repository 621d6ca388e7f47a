//! Shared fixtures: an in-process SSO OIDC mock and test configuration

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Value, json};
use sso_token_broker::config::{OidcConfig, RetryConfig};
use sso_token_broker::{BrokerConfig, LoginCallback, PendingAuthorization};
use tokio::net::TcpListener;

pub const START_URL: &str = "https://d-90670ca891.awsapps.com/start";
pub const REGION: &str = "us-east-1";
pub const CLIENT_ID: &str = "mock-client-id";
pub const CLIENT_SECRET: &str = "mock-client-secret";
pub const USER_CODE: &str = "WDDD-HRQV";

/// How the mock answers device-code polls once `pending_polls` runs out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOutcome {
    Approve,
    Deny,
    Expire,
    NeverApprove,
}

pub struct MockState {
    pub register_calls: AtomicUsize,
    pub device_calls: AtomicUsize,
    pub token_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    /// Polls answered `authorization_pending` before `device_outcome` applies
    pub pending_polls: AtomicUsize,
    pub device_outcome: Mutex<DeviceOutcome>,
    /// Refreshes answered with HTTP 500 before succeeding
    pub refresh_failures: AtomicUsize,
    /// Fixed error answer for every refresh
    pub refresh_error: Mutex<Option<(StatusCode, &'static str)>>,
    pub omit_refresh_token: AtomicBool,
    pub last_token_request: Mutex<Option<Value>>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            register_calls: AtomicUsize::new(0),
            device_calls: AtomicUsize::new(0),
            token_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            pending_polls: AtomicUsize::new(0),
            device_outcome: Mutex::new(DeviceOutcome::Approve),
            refresh_failures: AtomicUsize::new(0),
            refresh_error: Mutex::new(None),
            omit_refresh_token: AtomicBool::new(false),
            last_token_request: Mutex::new(None),
        }
    }
}

impl MockState {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn oauth_error(status: StatusCode, code: &str) -> Response {
    (
        status,
        Json(json!({ "error": code, "error_description": format!("mock {code}") })),
    )
        .into_response()
}

async fn register_client(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    state.register_calls.fetch_add(1, Ordering::SeqCst);
    if body["clientType"] != "public" || body["clientName"].as_str().is_none() {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_request");
    }
    let now = Utc::now().timestamp();
    Json(json!({
        "clientId": CLIENT_ID,
        "clientSecret": CLIENT_SECRET,
        "clientIdIssuedAt": now,
        "clientSecretExpiresAt": now + 90 * 24 * 60 * 60,
    }))
    .into_response()
}

async fn device_authorization(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    state.device_calls.fetch_add(1, Ordering::SeqCst);
    if body["clientId"] != CLIENT_ID || body["startUrl"] != START_URL {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_client");
    }
    Json(json!({
        "deviceCode": "mock-device-code",
        "userCode": USER_CODE,
        "verificationUri": "https://device.sso.us-east-1.amazonaws.com/",
        "verificationUriComplete": format!("https://device.sso.us-east-1.amazonaws.com/?user_code={USER_CODE}"),
        "expiresIn": 600,
        "interval": 0,
    }))
    .into_response()
}

async fn create_token(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    state.token_calls.fetch_add(1, Ordering::SeqCst);
    *state.last_token_request.lock() = Some(body.clone());

    if body["clientId"] != CLIENT_ID || body["clientSecret"] != CLIENT_SECRET {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_client");
    }

    match body["grantType"].as_str() {
        Some("urn:ietf:params:oauth:grant-type:device_code") => device_poll(&state),
        Some("refresh_token") => refresh(&state, &body),
        _ => oauth_error(StatusCode::BAD_REQUEST, "unsupported_grant_type"),
    }
}

fn device_poll(state: &MockState) -> Response {
    let pending = || {
        // Answered through the header only, the way the service does it
        (
            StatusCode::BAD_REQUEST,
            [(
                "x-amzn-ErrorType",
                "AuthorizationPendingException:http://internal.amazon.com/coral/com.amazonaws.ssooidc/",
            )],
            Json(json!({ "message": "Authorization is still pending" })),
        )
            .into_response()
    };

    if take_one(&state.pending_polls) {
        return pending();
    }
    match *state.device_outcome.lock() {
        DeviceOutcome::Approve => Json(json!({
            "accessToken": "device-access-token",
            "tokenType": "Bearer",
            "expiresIn": 28800,
            "refreshToken": "device-refresh-token",
        }))
        .into_response(),
        DeviceOutcome::Deny => oauth_error(StatusCode::BAD_REQUEST, "access_denied"),
        DeviceOutcome::Expire => oauth_error(StatusCode::BAD_REQUEST, "expired_token"),
        DeviceOutcome::NeverApprove => pending(),
    }
}

fn refresh(state: &MockState, body: &Value) -> Response {
    let n = state.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
    if body["refreshToken"].as_str().is_none() {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_request");
    }
    if take_one(&state.refresh_failures) {
        return oauth_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error");
    }
    if let Some((status, code)) = *state.refresh_error.lock() {
        return oauth_error(status, code);
    }

    let mut response = json!({
        "accessToken": format!("refreshed-access-{n}"),
        "tokenType": "Bearer",
        "expiresIn": 3600,
    });
    if !state.omit_refresh_token.load(Ordering::SeqCst) {
        response["refreshToken"] = json!(format!("refresh-token-{n}"));
    }
    Json(response).into_response()
}

/// A running mock SSO OIDC service
pub struct MockOidc {
    pub state: Arc<MockState>,
    pub endpoint: String,
}

impl MockOidc {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/client/register", post(register_client))
            .route("/device_authorization", post(device_authorization))
            .route("/token", post(create_token))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            state,
            endpoint: format!("http://{addr}"),
        }
    }
}

/// Broker configuration pointed at `endpoint` with fast polling and retries
pub fn test_config(endpoint: &str, cache_dir: &Path) -> BrokerConfig {
    BrokerConfig {
        cache_dir: Some(cache_dir.to_path_buf()),
        oidc: OidcConfig {
            endpoint_url: Some(endpoint.to_string()),
            poll_interval_floor: Duration::ZERO,
            http_timeout: Duration::from_secs(5),
            ..OidcConfig::default()
        },
        retry: RetryConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            ..RetryConfig::default()
        },
        ..BrokerConfig::default()
    }
}

/// Records every callback invocation
#[derive(Default)]
pub struct RecordingCallback {
    pub pending: Mutex<Vec<PendingAuthorization>>,
    pub retrieved: AtomicBool,
    pub failure: Mutex<Option<String>>,
}

impl LoginCallback for RecordingCallback {
    fn token_pending(&self, authorization: &PendingAuthorization) {
        self.pending.lock().push(authorization.clone());
    }

    fn token_retrieved(&self) {
        self.retrieved.store(true, Ordering::SeqCst);
    }

    fn token_retrieval_failure(&self, error: &sso_token_broker::Error) {
        *self.failure.lock() = Some(error.to_string());
    }
}
