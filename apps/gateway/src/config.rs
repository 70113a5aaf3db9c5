use std::time::Duration;

/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Origin of the upstream API (e.g. `http://localhost:9094`).
    ///
    /// Deliberately optional: a missing value is reported per request as
    /// a configuration error rather than crashing the process, so the
    /// gateway can still serve health checks while operators fix it.
    pub upstream_base_url: Option<String>,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Whether responses travel over TLS to the caller. Controls cookie
    /// normalization: on plain HTTP, `Secure` is dropped and `SameSite`
    /// is forced to `Lax` so rewritten cookies are actually settable.
    pub secure_cookies: bool,
    /// Connect/response timeout for upstream calls.
    pub upstream_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            upstream_base_url: std::env::var("UPSTREAM_BASE_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .map(|s| s.trim_end_matches('/').to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            secure_cookies: std::env::var("SECURE_COOKIES")
                .ok()
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            upstream_timeout: Duration::from_millis(
                std::env::var("UPSTREAM_TIMEOUT_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10_000),
            ),
        }
    }

    /// Config with explicit values (used by tests).
    pub fn for_upstream(upstream_base_url: Option<String>) -> Self {
        Self {
            upstream_base_url: upstream_base_url.map(|s| s.trim_end_matches('/').to_string()),
            port: 0,
            secure_cookies: false,
            upstream_timeout: Duration::from_millis(10_000),
        }
    }
}
