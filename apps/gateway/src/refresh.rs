//! Session-scoped single-flight refresh.
//!
//! The gateway serves many sessions concurrently, so refresh flights are
//! keyed by the caller's session cookie rather than process-wide.
//! Concurrent 401s from the same session attach to one upstream refresh
//! call; the lock entry is removed the moment it resolves.

use std::sync::Arc;

use axum::http::header;
use bridge_core::SingleFlight;

use crate::cookies::{self, SESSION_COOKIE};

/// Correlation id header forwarded to the upstream.
pub const REQUEST_ID_HEADER: &str = "x-req-id";

/// What a refresh flight produced, shared by every attached caller.
#[derive(Debug, Clone, Default)]
pub struct RefreshOutcome {
    /// Whether the upstream accepted the refresh.
    pub ok: bool,
    /// Every `Set-Cookie` the refresh response carried (raw, un-normalized).
    pub set_cookies: Vec<String>,
    /// Bearer token extracted from response headers, falling back to the
    /// rotated access-token cookie.
    pub header_token: Option<String>,
}

/// Shared refresh-lock map, the gateway's only cross-request mutable
/// state.
#[derive(Clone, Default)]
pub struct SessionRefresh {
    flights: Arc<SingleFlight<String, RefreshOutcome>>,
}

impl SessionRefresh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a refresh for the session identified by `cookie_header`,
    /// attaching to an in-flight one when present.
    pub async fn run(
        &self,
        http: &reqwest::Client,
        base_url: &str,
        cookie_header: Option<&str>,
        request_id: &str,
    ) -> RefreshOutcome {
        let key = refresh_key(cookie_header);
        let http = http.clone();
        let base_url = base_url.to_string();
        let cookie_header = cookie_header.map(str::to_string);
        let request_id = request_id.to_string();

        self.flights
            .run(key, move || async move {
                refresh_once(&http, &base_url, cookie_header.as_deref(), &request_id).await
            })
            .await
    }

    /// Number of refresh flights currently in progress (test hook).
    pub fn in_flight(&self) -> usize {
        self.flights.in_flight()
    }
}

/// Refresh-lock key for a request: the session cookie value, or a shared
/// anonymous bucket when the caller has none.
fn refresh_key(cookie_header: Option<&str>) -> String {
    cookie_header
        .and_then(|header| cookies::cookie_value(header, SESSION_COOKIE))
        .map(|sid| format!("sid:{sid}"))
        .unwrap_or_else(|| "sid:anonymous".to_string())
}

/// Issue exactly one upstream refresh call.
async fn refresh_once(
    http: &reqwest::Client,
    base_url: &str,
    cookie_header: Option<&str>,
    request_id: &str,
) -> RefreshOutcome {
    let mut request = http
        .post(format!("{base_url}/api/v1/auth/refresh"))
        .header(REQUEST_ID_HEADER, request_id);
    if let Some(cookie) = cookie_header {
        request = request.header(header::COOKIE, cookie);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(error = %err, "upstream refresh unreachable");
            return RefreshOutcome::default();
        }
    };

    let set_cookies: Vec<String> = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect();

    // Prefer a token from response headers; fall back to the rotated
    // access-token cookie so the retry can carry a bearer immediately.
    let mut header_token = response
        .headers()
        .get(header::AUTHORIZATION)
        .or_else(|| response.headers().get("x-access-token"))
        .and_then(|v| v.to_str().ok())
        .map(strip_bearer)
        .filter(|t| !t.is_empty());
    if header_token.is_none() {
        header_token = cookies::parse_set_cookie_pairs(&set_cookies)
            .into_iter()
            .find(|(name, _)| name == cookies::ACCESS_TOKEN_COOKIE)
            .map(|(_, value)| {
                percent_encoding::percent_decode_str(&value)
                    .decode_utf8_lossy()
                    .into_owned()
            });
    }

    let ok = response.status().is_success();
    if !ok {
        tracing::debug!(status = %response.status(), "upstream refresh rejected");
    }

    RefreshOutcome {
        ok,
        set_cookies,
        header_token,
    }
}

fn strip_bearer(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut parts = trimmed.splitn(2, char::is_whitespace);
    match (parts.next(), parts.next()) {
        (Some(scheme), Some(rest)) if scheme.eq_ignore_ascii_case("bearer") => {
            rest.trim().to_string()
        }
        _ => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_key_uses_session_cookie() {
        assert_eq!(refresh_key(Some("theme=dark; sid=abc123")), "sid:abc123");
        assert_eq!(refresh_key(Some("theme=dark")), "sid:anonymous");
        assert_eq!(refresh_key(None), "sid:anonymous");
    }

    #[test]
    fn bearer_scheme_is_optional() {
        assert_eq!(strip_bearer("Bearer tok"), "tok");
        assert_eq!(strip_bearer("tok"), "tok");
    }
}
