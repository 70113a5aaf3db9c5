//! Process-wide credential refresh orchestration.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::AUTHORIZATION;
use serde_json::Value;

use crate::broadcast::{AuthChannel, AuthEvent};
use crate::credentials::{Credential, CredentialStore};
use crate::singleflight::SingleFlight;

/// Header carrying the rotated token when the issuer prefers headers
/// over a JSON body.
const ACCESS_TOKEN_HEADER: &str = "x-access-token";
/// Header carrying the token expiry as epoch milliseconds.
const ACCESS_TOKEN_EXPIRES_HEADER: &str = "x-access-token-expires-at";

/// Single-flight refresh coordinator for one process.
///
/// `ensure_fresh` guarantees at most one refresh call is in flight at a
/// time; concurrent callers attach to the same outcome. A successful
/// refresh updates the [`CredentialStore`] and broadcasts
/// `token-refreshed` so other tabs reconcile instead of refreshing
/// themselves.
#[derive(Clone)]
pub struct RefreshOrchestrator {
    http: reqwest::Client,
    refresh_url: String,
    timeout: Duration,
    store: CredentialStore,
    channel: AuthChannel,
    inflight: Arc<SingleFlight<(), Option<Credential>>>,
}

impl RefreshOrchestrator {
    pub fn new(
        http: reqwest::Client,
        refresh_url: impl Into<String>,
        timeout: Duration,
        store: CredentialStore,
        channel: AuthChannel,
    ) -> Self {
        Self {
            http,
            refresh_url: refresh_url.into(),
            timeout,
            store,
            channel,
            inflight: Arc::new(SingleFlight::new()),
        }
    }

    /// Return a credential whose remaining TTL exceeds `min_ttl`,
    /// refreshing if necessary.
    ///
    /// Returns `None` when refresh fails — callers treat that as "not
    /// authenticated", not as an error to retry. Refresh failures are
    /// never retried here; re-authentication is the UI layer's call.
    pub async fn ensure_fresh(&self, min_ttl: Duration) -> Option<Credential> {
        if let Some(credential) = self.store.fresh(min_ttl) {
            return Some(credential);
        }

        let this = self.clone();
        self.inflight
            .run((), move || async move { this.refresh_once().await })
            .await
    }

    /// Issue exactly one refresh call. Any failure (non-2xx, network
    /// error, timeout, malformed payload) clears the stored credential.
    async fn refresh_once(&self) -> Option<Credential> {
        let response = match self
            .http
            .post(&self.refresh_url)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(error = %err, "credential refresh request failed");
                self.store.clear();
                return None;
            }
        };

        if !response.status().is_success() {
            tracing::debug!(status = %response.status(), "credential refresh rejected");
            self.store.clear();
            return None;
        }

        // Prefer the token from response headers; fall back to the body.
        let mut token = header_token(&response);
        let mut expires_at = header_expiry(&response);

        if token.is_none() {
            if let Ok(body) = response.json::<Value>().await {
                let (body_token, body_expiry) = body_token(&body);
                token = body_token;
                if expires_at.is_none() {
                    expires_at = body_expiry;
                }
            }
        }

        match token {
            Some(token) => {
                let credential = Credential::new(token.clone(), expires_at);
                self.store.set(credential.clone());
                self.channel.publish(AuthEvent::TokenRefreshed {
                    token: Some(token),
                });
                Some(credential)
            }
            None => {
                tracing::warn!("credential refresh returned no usable token");
                self.store.clear();
                None
            }
        }
    }
}

/// Strip an optional `Bearer ` scheme prefix.
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

fn header_token(response: &reqwest::Response) -> Option<String> {
    let headers = response.headers();
    let raw = headers
        .get(AUTHORIZATION)
        .or_else(|| headers.get(ACCESS_TOKEN_HEADER))?;
    let value = raw.to_str().ok()?;
    let token = strip_bearer(value);
    (!token.is_empty()).then_some(token)
}

fn header_expiry(response: &reqwest::Response) -> Option<DateTime<Utc>> {
    let raw = response.headers().get(ACCESS_TOKEN_EXPIRES_HEADER)?;
    let millis: i64 = raw.to_str().ok()?.trim().parse().ok()?;
    DateTime::from_timestamp_millis(millis)
}

/// Pull `accessToken` / `accessTokenExpiresIn` out of a refresh body,
/// unwrapping an optional `data` envelope. `accessTokenExpiresIn` above
/// 1e12 is epoch milliseconds, otherwise seconds from now.
fn body_token(body: &Value) -> (Option<String>, Option<DateTime<Utc>>) {
    let payload = body.get("data").unwrap_or(body);

    let token = payload
        .get("accessToken")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    let expires_at = payload
        .get("accessTokenExpiresIn")
        .and_then(Value::as_i64)
        .and_then(|raw| {
            if raw > 1_000_000_000_000 {
                DateTime::from_timestamp_millis(raw)
            } else {
                Some(Utc::now() + chrono::Duration::seconds(raw))
            }
        });

    (token, expires_at)
}
