//! In-process mock of a bearer-authenticated vendor API, used by the bridge test suites.
//!
//! The mock exposes:
//! - `POST /api/auth/login`: issues sequential tokens (`token-1`, `token-2`, ...) and counts logins
//! - `GET /v3/api-docs`: serves the configured spec document (bearer required)
//! - `ANY /locked`: always 401
//! - `ANY /broken`: always 500
//! - `ANY /slow`: sleeps before answering
//! - `GET /image`: a tiny PNG
//! - everything else: echoes the request back as JSON (bearer required)

use anyhow::Context as _;
use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const USERNAME: &str = "operator";
pub const PASSWORD: &str = "hunter2";

/// A request the mock accepted on one of its business routes.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
    pub body: Value,
}

struct MockState {
    spec: Mutex<Value>,
    logins: AtomicU64,
    valid_tokens: Mutex<HashSet<String>>,
    login_delay: Mutex<Duration>,
    login_broken: AtomicBool,
    omit_token: AtomicBool,
    slow_delay: Duration,
    hits: Mutex<HashMap<String, u64>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockState {
    fn record_hit(&self, path: &str) {
        *self.hits.lock().entry(path.to_string()).or_insert(0) += 1;
    }

    fn is_authorized(&self, headers: &HeaderMap) -> bool {
        bearer(headers).is_some_and(|t| self.valid_tokens.lock().contains(&t))
    }
}

/// Handle to a running mock API. The server stops when the handle is dropped.
pub struct MockApi {
    addr: SocketAddr,
    state: Arc<MockState>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockApi {
    /// Start the mock on an ephemeral localhost port, serving `spec` from `/v3/api-docs`.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn start(spec: Value) -> anyhow::Result<Self> {
        let state = Arc::new(MockState {
            spec: Mutex::new(spec),
            logins: AtomicU64::new(0),
            valid_tokens: Mutex::new(HashSet::new()),
            login_delay: Mutex::new(Duration::ZERO),
            login_broken: AtomicBool::new(false),
            omit_token: AtomicBool::new(false),
            slow_delay: Duration::from_secs(3),
            hits: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/api/auth/login", post(login_handler))
            .route("/v3/api-docs", get(spec_handler))
            .route("/locked", any(locked_handler))
            .route("/broken", any(broken_handler))
            .route("/slow", any(slow_handler))
            .route("/image", get(image_handler))
            .fallback(echo_handler)
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind mock api listener")?;
        let addr = listener.local_addr().context("mock api local addr")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        let handle = tokio::spawn(async move {
            let _ = server.await;
        });

        Ok(Self {
            addr,
            state,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Start the mock with [`demo_spec`].
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn start_default() -> anyhow::Result<Self> {
        Self::start(demo_spec()).await
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Number of login exchanges served (successful or not).
    #[must_use]
    pub fn login_count(&self) -> u64 {
        self.state.logins.load(Ordering::SeqCst)
    }

    /// Number of requests that reached `path` (business routes only).
    #[must_use]
    pub fn hits(&self, path: &str) -> u64 {
        self.state.hits.lock().get(path).copied().unwrap_or(0)
    }

    /// Requests accepted by the echo route, in arrival order.
    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }

    /// Invalidate every token issued so far (simulates server-side expiry).
    pub fn revoke_all_tokens(&self) {
        self.state.valid_tokens.lock().clear();
    }

    pub fn set_spec(&self, spec: Value) {
        *self.state.spec.lock() = spec;
    }

    /// Delay every login response; widens the window for concurrent renewal tests.
    pub fn set_login_delay(&self, delay: Duration) {
        *self.state.login_delay.lock() = delay;
    }

    /// Make the login endpoint answer 500.
    pub fn set_login_broken(&self, broken: bool) {
        self.state.login_broken.store(broken, Ordering::SeqCst);
    }

    /// Make the login endpoint answer 200 without a token field.
    pub fn set_omit_token(&self, omit: bool) {
        self.state.omit_token.store(omit, Ordering::SeqCst);
    }
}

impl Drop for MockApi {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn login_handler(State(state): State<Arc<MockState>>, body: Bytes) -> Response {
    let delay = *state.login_delay.lock();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let n = state.logins.fetch_add(1, Ordering::SeqCst) + 1;

    if state.login_broken.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "login backend down").into_response();
    }

    let creds: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let ok = creds.get("username").and_then(Value::as_str) == Some(USERNAME)
        && creds.get("password").and_then(Value::as_str) == Some(PASSWORD);
    if !ok {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "bad credentials" })),
        )
            .into_response();
    }

    if state.omit_token.load(Ordering::SeqCst) {
        return Json(json!({ "token_type": "Bearer" })).into_response();
    }

    let token = format!("token-{n}");
    state.valid_tokens.lock().insert(token.clone());
    Json(json!({ "access_token": token, "token_type": "Bearer" })).into_response()
}

async fn spec_handler(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    if !state.is_authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(state.spec.lock().clone()).into_response()
}

async fn locked_handler(State(state): State<Arc<MockState>>) -> Response {
    state.record_hit("/locked");
    (StatusCode::UNAUTHORIZED, "locked").into_response()
}

async fn broken_handler(State(state): State<Arc<MockState>>) -> Response {
    state.record_hit("/broken");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "boom" })),
    )
        .into_response()
}

async fn slow_handler(State(state): State<Arc<MockState>>) -> Response {
    state.record_hit("/slow");
    tokio::time::sleep(state.slow_delay).await;
    Json(json!({ "slow": true })).into_response()
}

async fn image_handler(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    if !state.is_authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    // 1x1 transparent PNG
    const PNG: &[u8] = &[
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
        0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
        0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
        0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
        0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
    ];
    ([(header::CONTENT_TYPE, "image/png")], PNG).into_response()
}

async fn echo_handler(
    State(state): State<Arc<MockState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    state.record_hit(&path);

    if !state.is_authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "token expired").into_response();
    }

    let body_json: Value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()))
    };

    let recorded = RecordedRequest {
        method: method.to_string(),
        path: path.clone(),
        query: uri.query().map(str::to_string),
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: body_json.clone(),
    };
    state.requests.lock().push(recorded);

    let x_headers: serde_json::Map<String, Value> = headers
        .iter()
        .filter(|(k, _)| k.as_str().starts_with("x-"))
        .filter_map(|(k, v)| {
            v.to_str()
                .ok()
                .map(|s| (k.as_str().to_string(), Value::String(s.to_string())))
        })
        .collect();

    Json(json!({
        "method": method.as_str(),
        "path": path,
        "query": uri.query(),
        "headers": x_headers,
        "body": body_json,
    }))
    .into_response()
}

/// A small vendor-style API description exercising every parameter location.
#[must_use]
pub fn demo_spec() -> Value {
    json!({
        "openapi": "3.0.3",
        "info": { "title": "Demo Vendor API", "version": "4.2.0" },
        "paths": {
            "/hosts": {
                "get": {
                    "operationId": "listHosts",
                    "summary": "List hosts",
                    "parameters": [
                        { "name": "limit", "in": "query", "schema": { "type": "integer" } },
                        { "name": "tag", "in": "query", "schema": { "type": "array", "items": { "type": "string" } } }
                    ],
                    "responses": { "200": { "description": "ok" } }
                },
                "post": {
                    "operationId": "createHost",
                    "summary": "Create a host",
                    "requestBody": {
                        "required": true,
                        "content": { "application/json": { "schema": { "$ref": "#/components/schemas/NewHost" } } }
                    },
                    "responses": { "201": { "description": "created" } }
                }
            },
            "/hosts/{id}": {
                "parameters": [
                    { "name": "id", "in": "path", "required": true, "schema": { "type": "string" } }
                ],
                "get": {
                    "operationId": "getHost",
                    "summary": "Fetch one host",
                    "parameters": [
                        { "name": "X-Trace", "in": "header", "schema": { "type": "string" } }
                    ],
                    "responses": {
                        "200": {
                            "description": "ok",
                            "content": { "application/json": { "schema": { "$ref": "#/components/schemas/Host" } } }
                        }
                    }
                },
                "delete": {
                    "operationId": "deleteHost",
                    "responses": { "204": { "description": "gone" } }
                }
            },
            "/tasks": {
                "put": {
                    "summary": "Replace the task list",
                    "requestBody": {
                        "content": { "application/json": { "schema": { "type": "array", "items": { "type": "string" } } } }
                    },
                    "responses": { "200": { "description": "ok" } }
                }
            },
            "/locked": {
                "get": { "operationId": "lockedResource", "responses": { "200": { "description": "never" } } }
            },
            "/broken": {
                "get": { "operationId": "brokenResource", "responses": { "200": { "description": "never" } } }
            },
            "/slow": {
                "get": { "operationId": "slowResource", "responses": { "200": { "description": "eventually" } } }
            },
            "/image": {
                "get": { "operationId": "screenshot", "responses": { "200": { "description": "png" } } }
            }
        },
        "components": {
            "schemas": {
                "NewHost": {
                    "type": "object",
                    "required": ["hostname"],
                    "properties": {
                        "hostname": { "type": "string" },
                        "port": { "type": "integer" },
                        "labels": { "type": "object" }
                    }
                },
                "Host": {
                    "type": "object",
                    "properties": {
                        "id": { "type": "string" },
                        "hostname": { "type": "string" }
                    }
                }
            }
        }
    })
}
