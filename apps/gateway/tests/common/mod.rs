use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::Router;
use axum_test::TestServer;

use bridge_gateway::config::Config;
use bridge_gateway::AppState;

/// One request the mock upstream saw, reduced to the headers the gateway
/// is responsible for.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub cookie: Option<String>,
    pub request_id: Option<String>,
    pub connection: Option<String>,
}

pub struct UpstreamState {
    /// Status codes the data endpoint returns, in order (default 200).
    pub data_plan: Mutex<VecDeque<u16>>,
    pub data_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
    /// Whether refresh succeeds.
    pub refresh_ok: AtomicBool,
    /// Whether refresh carries the new token in a response header (true)
    /// or only in rotated cookies (false).
    pub refresh_header_token: AtomicBool,
    /// Whether refresh rotates the access-token cookie.
    pub refresh_set_at_cookie: AtomicBool,
    /// Artificial refresh latency, to overlap concurrent 401 recoveries.
    pub refresh_delay: Mutex<Duration>,
    pub requests: Mutex<Vec<RecordedRequest>>,
}

pub struct MockUpstream {
    pub base_url: String,
    pub state: Arc<UpstreamState>,
}

impl MockUpstream {
    pub async fn spawn() -> Self {
        let state = Arc::new(UpstreamState {
            data_plan: Mutex::new(VecDeque::new()),
            data_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            refresh_ok: AtomicBool::new(true),
            refresh_header_token: AtomicBool::new(true),
            refresh_set_at_cookie: AtomicBool::new(true),
            refresh_delay: Mutex::new(Duration::ZERO),
            requests: Mutex::new(Vec::new()),
        });

        let router = Router::new()
            .route("/api/v1/auth/refresh", post(refresh))
            .route("/api/v1/auth/logout", post(logout))
            .route("/api/v1/cookie-setter", get(cookie_setter))
            .route("/api/v1/{*rest}", any(data))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    pub fn plan_data(&self, statuses: &[u16]) {
        self.state
            .data_plan
            .lock()
            .unwrap()
            .extend(statuses.iter().copied());
    }

    pub fn data_calls(&self) -> usize {
        self.state.data_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    /// Requests whose path is under the generic data surface.
    pub fn data_requests(&self) -> Vec<RecordedRequest> {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| !r.path.ends_with("/auth/refresh") && !r.path.ends_with("/auth/logout"))
            .cloned()
            .collect()
    }

    pub fn refresh_requests(&self) -> Vec<RecordedRequest> {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path.ends_with("/auth/refresh"))
            .cloned()
            .collect()
    }

    pub fn logout_requests(&self) -> Vec<RecordedRequest> {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path.ends_with("/auth/logout"))
            .cloned()
            .collect()
    }
}

fn record(state: &UpstreamState, method: &Method, uri: &Uri, headers: &HeaderMap) {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    state.requests.lock().unwrap().push(RecordedRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        authorization: header("authorization"),
        cookie: header("cookie"),
        request_id: header("x-req-id"),
        connection: header("connection"),
    });
}

async fn data(
    State(state): State<Arc<UpstreamState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    record(&state, &method, &uri, &headers);
    state.data_calls.fetch_add(1, Ordering::SeqCst);

    let status = state
        .data_plan
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(200);
    match status {
        200 => axum::Json(serde_json::json!({ "ok": true, "path": uri.path() })).into_response(),
        401 => (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({ "message": "unauthorized" })),
        )
            .into_response(),
        other => StatusCode::from_u16(other).unwrap().into_response(),
    }
}

async fn cookie_setter(
    State(state): State<Arc<UpstreamState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    record(&state, &method, &uri, &headers);
    state.data_calls.fetch_add(1, Ordering::SeqCst);
    let mut response_headers = HeaderMap::new();
    response_headers.append(
        header::SET_COOKIE,
        "AT=upstream-token; Domain=api.internal; Secure; SameSite=None; HttpOnly"
            .parse()
            .unwrap(),
    );
    response_headers.append(
        header::SET_COOKIE,
        "pref=1; Domain=api.internal".parse().unwrap(),
    );
    (
        response_headers,
        axum::Json(serde_json::json!({ "ok": true })),
    )
        .into_response()
}

async fn refresh(
    State(state): State<Arc<UpstreamState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    record(&state, &method, &uri, &headers);
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);

    let delay = *state.refresh_delay.lock().unwrap();
    if delay > Duration::ZERO {
        tokio::time::sleep(delay).await;
    }

    if !state.refresh_ok.load(Ordering::SeqCst) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let mut response_headers = HeaderMap::new();
    if state.refresh_header_token.load(Ordering::SeqCst) {
        response_headers.insert(
            header::AUTHORIZATION,
            "Bearer refreshed-token".parse().unwrap(),
        );
    }
    if state.refresh_set_at_cookie.load(Ordering::SeqCst) {
        response_headers.append(
            header::SET_COOKIE,
            "AT=rotated-at; Domain=api.internal; Secure; SameSite=None"
                .parse()
                .unwrap(),
        );
    }
    response_headers.append(
        header::SET_COOKIE,
        "sid=rotated-sid; HttpOnly".parse().unwrap(),
    );

    (response_headers, "{}").into_response()
}

async fn logout(
    State(state): State<Arc<UpstreamState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    record(&state, &method, &uri, &headers);
    state.logout_calls.fetch_add(1, Ordering::SeqCst);
    (
        [(
            header::SET_COOKIE,
            "RT=; Max-Age=0; Domain=api.internal; Secure",
        )],
        "logged out",
    )
        .into_response()
}

/// Gateway test server wired to a fresh mock upstream.
pub async fn test_app() -> (TestServer, MockUpstream) {
    let upstream = MockUpstream::spawn().await;
    let server = server_for(Some(upstream.base_url.clone()));
    (server, upstream)
}

/// Gateway test server with an explicit (possibly missing) upstream base.
pub fn server_for(upstream_base_url: Option<String>) -> TestServer {
    server_with_state(upstream_base_url).0
}

/// Like [`server_for`], also exposing the gateway state for inspection.
pub fn server_with_state(upstream_base_url: Option<String>) -> (TestServer, AppState) {
    let state = AppState::new(Config::for_upstream(upstream_base_url));
    let app = bridge_gateway::routes::router().with_state(state.clone());
    (TestServer::new(app).unwrap(), state)
}
