//! Dedicated auth routes: the refresh passthrough and logout.
//!
//! Both live outside the generic proxy because their cookie handling is
//! not a plain relay — refresh responses always rewrite rotated session
//! cookies, and logout additionally deletes the gateway's own session
//! cookie.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;

use crate::cookies;
use crate::error::GatewayError;
use crate::proxy::{correlation_id, pass_through};
use crate::refresh::REQUEST_ID_HEADER;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/bff/auth/refresh", post(refresh))
        .route("/api/bff/logout", post(logout))
}

/// Cookie-authenticated refresh passthrough. The upstream decides the
/// outcome; the gateway only normalizes rotated cookies on the way back.
async fn refresh(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(base_url) = state.config.upstream_base_url.clone() else {
        return GatewayError::missing_upstream().into_response();
    };
    let request_id = correlation_id(&headers);

    let mut request = state
        .http
        .post(format!("{base_url}/api/v1/auth/refresh"))
        .header(REQUEST_ID_HEADER, &request_id);
    if let Some(cookie) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        request = request.header(header::COOKIE, cookie);
    }

    match request.send().await {
        Ok(upstream) => {
            pass_through(upstream, &[], state.config.secure_cookies, &request_id).await
        }
        Err(err) => {
            tracing::warn!(error = %err, "upstream refresh unreachable");
            GatewayError::bad_gateway(format!("upstream unreachable: {err}")).into_response()
        }
    }
}

/// Upstream logout plus local session-cookie deletion.
///
/// The access token is forwarded as a bearer so the upstream can
/// blacklist it; every upstream `Set-Cookie` is propagated alongside the
/// gateway's own removal cookie.
async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(base_url) = state.config.upstream_base_url.clone() else {
        return GatewayError::missing_upstream().into_response();
    };
    let request_id = correlation_id(&headers);
    let cookie_header = headers.get(header::COOKIE).and_then(|v| v.to_str().ok());

    let mut request = state
        .http
        .post(format!("{base_url}/api/v1/auth/logout"))
        .header(REQUEST_ID_HEADER, &request_id);
    if let Some(cookie) = cookie_header {
        request = request.header(header::COOKIE, cookie);
    }
    if let Some(token) = cookie_header
        .and_then(|cookie| cookies::cookie_value(cookie, cookies::ACCESS_TOKEN_COOKIE))
    {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
            request = request.header(header::AUTHORIZATION, value);
        }
    }

    let upstream = match request.send().await {
        Ok(upstream) => upstream,
        Err(err) => {
            tracing::warn!(error = %err, "upstream logout unreachable");
            return GatewayError::bad_gateway(format!("upstream unreachable: {err}"))
                .into_response();
        }
    };

    let ok = upstream.status().is_success();
    let status = if ok { StatusCode::OK } else { upstream.status() };
    let set_cookies: Vec<String> = upstream
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect();
    let body = if ok {
        "OK".to_string()
    } else {
        upstream.text().await.unwrap_or_else(|_| "Logout failed".to_string())
    };

    let mut headers_out = HeaderMap::new();
    for raw in &set_cookies {
        let normalized = cookies::normalize_set_cookie(raw, state.config.secure_cookies);
        if let Ok(value) = HeaderValue::from_str(&normalized) {
            headers_out.append(header::SET_COOKIE, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&cookies::clear_session_cookie()) {
        headers_out.append(header::SET_COOKIE, value);
    }
    headers_out.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers_out.insert(REQUEST_ID_HEADER, value);
    }

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers_out;
    response
}
