//! Loopback fixtures shared by the relay integration tests.
//!
//! [`FakeBackend`] stands in for the backend service: an axum server on an
//! ephemeral port that serves area streams, sign-in and identity, and
//! counts every stream request it receives. [`spawn_relay`] starts the real
//! relay router against it.

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cmdrelay_core::SessionCredential;
use cmdrelay_core::config::{RelayConfig, SessionStoreKind};
use cmdrelay_daemon::metrics::RelayMetrics;
use cmdrelay_daemon::session::{CookieDirective, SessionError, SessionStore};
use cmdrelay_daemon::upstream::build_http_client;
use cmdrelay_daemon::{AppState, ShutdownHandle, router};
use futures::{StreamExt, stream};
use serde_json::{Value, json};

/// Chunks served for the `grill` area.
pub const GRILL_CHUNKS: [&str; 3] = [
    "data: {\"order\":1}\n\n",
    "data: {\"order\":2}\n\n",
    "data: {\"order\":3}\n\n",
];

// =============================================================================
// Fake backend
// =============================================================================

/// Observable state of the fake backend.
#[derive(Default)]
pub struct BackendProbe {
    /// Requests to the event stream route.
    pub stream_hits: AtomicUsize,
    /// Requests to the identity route.
    pub identity_hits: AtomicUsize,
    /// Set when the `hold` stream body is dropped by the server.
    pub hold_dropped: AtomicBool,
}

impl BackendProbe {
    pub fn stream_hits(&self) -> usize {
        self.stream_hits.load(Ordering::SeqCst)
    }

    pub fn hold_dropped(&self) -> bool {
        self.hold_dropped.load(Ordering::SeqCst)
    }
}

/// A running fake backend.
pub struct FakeBackend {
    pub addr: SocketAddr,
    pub probe: Arc<BackendProbe>,
}

impl FakeBackend {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

struct DropFlag(Arc<BackendProbe>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.hold_dropped.store(true, Ordering::SeqCst);
    }
}

fn bearer(headers: &HeaderMap) -> &str {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
}

async fn backend_stream(
    State(probe): State<Arc<BackendProbe>>,
    Path(area): Path<String>,
    headers: HeaderMap,
) -> Response {
    probe.stream_hits.fetch_add(1, Ordering::SeqCst);
    if !matches!(bearer(&headers), "good" | "limited") {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "token expired" })))
            .into_response();
    }

    match area.as_str() {
        "grill" => {
            let chunks = stream::iter(GRILL_CHUNKS).then(|chunk| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, Infallible>(Bytes::from_static(chunk.as_bytes()))
            });
            Body::from_stream(chunks).into_response()
        },
        "hold" => {
            let flag = DropFlag(Arc::clone(&probe));
            let body = stream::once(async { Ok::<_, Infallible>(Bytes::from_static(b"data: hello\n\n")) })
                .chain(stream::pending())
                .map(move |item| {
                    let _ = &flag;
                    item
                });
            Body::from_stream(body).into_response()
        },
        "down" => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "maintenance" })),
        )
            .into_response(),
        "empty" => StatusCode::NO_CONTENT.into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn backend_login(Json(body): Json<Value>) -> Response {
    if body["username"] == "ana" && body["password"] == "pw" {
        Json(json!({ "token": "good", "user": { "name": "ana" } })).into_response()
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "bad credentials" })),
        )
            .into_response()
    }
}

async fn backend_me(State(probe): State<Arc<BackendProbe>>, headers: HeaderMap) -> Response {
    probe.identity_hits.fetch_add(1, Ordering::SeqCst);
    match bearer(&headers) {
        "good" => Json(json!({
            "permissions": ["commands:read", "stock:create"],
            "user": { "name": "ana" },
        }))
        .into_response(),
        "limited" => Json(json!({ "permissions": ["orders:read"] })).into_response(),
        _ => (StatusCode::UNAUTHORIZED, Json(json!({ "error": "expired" }))).into_response(),
    }
}

/// Starts the fake backend on an ephemeral port.
pub async fn spawn_backend() -> FakeBackend {
    let probe = Arc::new(BackendProbe::default());
    let app = Router::new()
        .route("/sse/commands/{area}", get(backend_stream))
        .route("/auth/login", post(backend_login))
        .route("/auth/me", get(backend_me))
        .with_state(Arc::clone(&probe));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    FakeBackend { addr, probe }
}

// =============================================================================
// Relay under test
// =============================================================================

/// Session store wrapper that counts invalidations.
pub struct CountingStore {
    inner: Arc<dyn SessionStore>,
    invalidations: AtomicUsize,
}

impl CountingStore {
    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

impl SessionStore for CountingStore {
    fn resolve(&self, headers: &HeaderMap) -> Option<SessionCredential> {
        self.inner.resolve(headers)
    }

    fn invalidate(&self, headers: &HeaderMap) -> CookieDirective {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        self.inner.invalidate(headers)
    }

    fn establish(&self, credential: SessionCredential) -> Result<CookieDirective, SessionError> {
        self.inner.establish(credential)
    }
}

/// A running relay.
pub struct Relay {
    pub addr: SocketAddr,
    pub store: Arc<CountingStore>,
    pub state: AppState,
}

impl Relay {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.state.metrics
    }

    pub fn shutdown(&self) -> &ShutdownHandle {
        &self.state.shutdown
    }
}

/// Relay configuration pointing at `backend`.
pub fn relay_config(backend: &FakeBackend, store: SessionStoreKind) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.upstream.base_url = backend.base_url();
    config.upstream.connect_timeout_secs = 2;
    config.session.store = store;
    config.session.secure_cookie = false;
    config
}

/// Starts the relay router with `config` on an ephemeral port.
pub async fn spawn_relay(config: &RelayConfig) -> Relay {
    spawn_relay_with(config, |state| state).await
}

/// Like [`spawn_relay`], with `customize` applied to the state before the
/// router is built.
pub async fn spawn_relay_with(
    config: &RelayConfig,
    customize: impl FnOnce(AppState) -> AppState,
) -> Relay {
    config.validate().unwrap();
    let http = build_http_client(config.upstream.connect_timeout()).unwrap();
    let state = AppState::from_config(
        config,
        http,
        RelayMetrics::unregistered(),
        ShutdownHandle::new(),
    )
    .unwrap();
    let state = customize(state);

    let store = Arc::new(CountingStore {
        inner: Arc::clone(&state.sessions),
        invalidations: AtomicUsize::new(0),
    });
    let state = state.with_session_store(Arc::clone(&store) as Arc<dyn SessionStore>);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Relay { addr, store, state }
}

// =============================================================================
// Client helpers
// =============================================================================

/// HTTP client for talking to the relay. Cookies are set by hand.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// `Cookie` header value for the default cookie name.
pub fn session_cookie(value: &str) -> String {
    format!("auth_token={value}")
}

/// Extracts `name=value` from a response's `Set-Cookie`.
pub fn set_cookie_pair(response: &reqwest::Response) -> String {
    let raw = response
        .headers()
        .get("set-cookie")
        .expect("set-cookie present")
        .to_str()
        .unwrap();
    raw.split(';').next().unwrap().to_string()
}

/// Returns `true` if the response expires the session cookie.
pub fn clears_cookie(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get_all("set-cookie")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.starts_with("auth_token=;") && v.contains("Max-Age=0"))
}

/// Polls `condition` every 20ms until it holds or `limit` elapses.
pub async fn eventually(limit: Duration, condition: impl Fn() -> bool) -> bool {
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}
