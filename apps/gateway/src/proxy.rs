//! The reverse-proxy pipeline: header filtering, credential attachment,
//! and the single-attempt unauthorized recovery for GETs.

use axum::body::{Body, Bytes};
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::cookies;
use crate::error::GatewayError;
use crate::refresh::REQUEST_ID_HEADER;
use crate::AppState;

/// Marker header set on responses that went through the refresh+retry
/// path.
pub const REFRESH_MARKER_HEADER: &str = "x-bff-refresh";

/// Headers meaningful for one transport leg only — never forwarded.
const HOP_BY_HOP: [&str; 10] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Reuse the caller's correlation id, or mint one.
pub fn correlation_id(headers: &HeaderMap) -> String {
    for name in ["x-request-id", REQUEST_ID_HEADER] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!(
        "{:x}-{}",
        chrono::Utc::now().timestamp_millis(),
        suffix.to_lowercase()
    )
}

fn build_target_url(base_url: &str, path: &str, query: Option<&str>) -> String {
    match query {
        Some(query) if !query.is_empty() => format!("{base_url}/api/v1/{path}?{query}"),
        _ => format!("{base_url}/api/v1/{path}"),
    }
}

/// Clone the inbound headers minus hop-by-hop ones, stamping the
/// correlation id.
fn filtered_headers(incoming: &HeaderMap, request_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in incoming {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    headers
}

/// Derive a bearer from the access-token cookie when the caller supplied
/// no explicit Authorization header.
fn attach_bearer_from_cookie(upstream_headers: &mut HeaderMap, incoming: &HeaderMap) {
    if upstream_headers.contains_key(header::AUTHORIZATION) {
        return;
    }
    let Some(cookie_header) = incoming.get(header::COOKIE).and_then(|v| v.to_str().ok()) else {
        return;
    };
    let Some(token) = cookies::cookie_value(cookie_header, cookies::ACCESS_TOKEN_COOKIE) else {
        return;
    };
    if token.is_empty() {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
        upstream_headers.insert(header::AUTHORIZATION, value);
    }
}

/// One upstream attempt. The recovery path calls this at most twice,
/// guarded explicitly — no hidden reentrancy.
async fn attempt(
    http: &reqwest::Client,
    method: &Method,
    url: &str,
    headers: HeaderMap,
    body: &Bytes,
) -> reqwest::Result<reqwest::Response> {
    let mut request = http.request(method.clone(), url).headers(headers);
    if method != Method::GET && method != Method::HEAD && !body.is_empty() {
        request = request.body(body.clone());
    }
    request.send().await
}

/// Relay an upstream response to the caller: hop-by-hop headers stripped,
/// every `Set-Cookie` (plus any produced by a refresh) rewritten for this
/// origin and appended, and the no-store trio stamped on.
pub(crate) async fn pass_through(
    upstream: reqwest::Response,
    extra_set_cookies: &[String],
    secure_cookies: bool,
    request_id: &str,
) -> Response {
    let status = upstream.status();

    let mut headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name.as_str()) || name == header::SET_COOKIE {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    let upstream_cookies: Vec<String> = upstream
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect();

    let body = upstream.bytes().await.unwrap_or_default();

    // Append, never overwrite — a response may set several cookies.
    for raw in upstream_cookies.iter().chain(extra_set_cookies.iter()) {
        let normalized = cookies::normalize_set_cookie(raw, secure_cookies);
        match HeaderValue::from_str(&normalized) {
            Ok(value) => {
                headers.append(header::SET_COOKIE, value);
            }
            Err(_) => tracing::warn!("dropping unencodable set-cookie value"),
        }
    }

    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate, proxy-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Generic forward handler for `/api/bff/{*path}`.
pub async fn forward(
    State(state): State<AppState>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(base_url) = state.config.upstream_base_url.clone() else {
        return GatewayError::missing_upstream().into_response();
    };

    let request_id = correlation_id(&headers);
    let target = build_target_url(&base_url, &path, query.as_deref());

    let mut upstream_headers = filtered_headers(&headers, &request_id);
    if !path.starts_with("auth/") {
        attach_bearer_from_cookie(&mut upstream_headers, &headers);
    }

    let first = match attempt(&state.http, &method, &target, upstream_headers.clone(), &body).await
    {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(error = %err, %target, "upstream unreachable");
            return GatewayError::bad_gateway(format!("upstream unreachable: {err}"))
                .into_response();
        }
    };

    // Single-attempt GET 401 recovery: refresh (single-flight per
    // session), then retry exactly once. Never for the refresh endpoint
    // itself, and never for mutations — upstream side effects must not
    // be replayed blindly.
    if method == Method::GET
        && first.status() == StatusCode::UNAUTHORIZED
        && !path.starts_with("auth/refresh")
    {
        let cookie_header = headers.get(header::COOKIE).and_then(|v| v.to_str().ok());
        let outcome = state
            .refresh
            .run(&state.http, &base_url, cookie_header, &request_id)
            .await;

        if outcome.ok {
            let mut retry_headers = upstream_headers;
            if let Some(token) = &outcome.header_token {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                    retry_headers.insert(header::AUTHORIZATION, value);
                }
            } else if !outcome.set_cookies.is_empty() {
                // No header token: merge the rotated cookies so the retry
                // authenticates with them.
                let pairs = cookies::parse_set_cookie_pairs(&outcome.set_cookies);
                let merged = cookies::merge_cookie_header(cookie_header, &pairs);
                if let Ok(value) = HeaderValue::from_str(&merged) {
                    retry_headers.insert(header::COOKIE, value);
                }
            }

            return match attempt(&state.http, &method, &target, retry_headers, &body).await {
                Ok(retry) => {
                    let mut response = pass_through(
                        retry,
                        &outcome.set_cookies,
                        state.config.secure_cookies,
                        &request_id,
                    )
                    .await;
                    response
                        .headers_mut()
                        .insert(REFRESH_MARKER_HEADER, HeaderValue::from_static("attempted"));
                    response
                }
                Err(err) => {
                    tracing::warn!(error = %err, %target, "upstream unreachable on retry");
                    GatewayError::bad_gateway(format!("upstream unreachable: {err}"))
                        .into_response()
                }
            };
        }
        // Refresh failed: the original 401 goes back unmodified.
    }

    pass_through(first, &[], state.config.secure_cookies, &request_id).await
}
