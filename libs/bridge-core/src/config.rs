use std::time::Duration;

/// Session bridge configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Absolute URL of the credential refresh endpoint
    /// (e.g. `http://localhost:3000/api/bff/auth/refresh`).
    pub refresh_url: String,
    /// Realtime broker URL (e.g. `ws://localhost:9094/ws`).
    pub realtime_url: String,
    /// Base URL for acknowledgment writes through the gateway
    /// (e.g. `http://localhost:3000/api/bff`).
    pub gateway_base_url: String,
    /// Destination prefix for inbound topic subscriptions.
    pub topic_prefix: String,
    /// Destination prefix for outbound application sends.
    pub app_prefix: String,
    /// Minimum remaining credential TTL before a refresh is forced.
    pub min_ttl: Duration,
    /// Upper bound on a single in-flight refresh call. A refresh that
    /// exceeds this is treated as failed so waiters are never stalled
    /// indefinitely.
    pub refresh_timeout: Duration,
    /// Debounce window for read-acknowledgment coalescing.
    pub ack_debounce: Duration,
}

impl BridgeConfig {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            refresh_url: required_var("BRIDGE_REFRESH_URL"),
            realtime_url: required_var("BRIDGE_REALTIME_URL"),
            gateway_base_url: required_var("BRIDGE_GATEWAY_BASE_URL"),
            topic_prefix: var_or("BRIDGE_TOPIC_PREFIX", "/topic/chat"),
            app_prefix: var_or("BRIDGE_APP_PREFIX", "/app/chat"),
            min_ttl: millis_var("BRIDGE_MIN_TTL_MS", 60_000),
            refresh_timeout: millis_var("BRIDGE_REFRESH_TIMEOUT_MS", 10_000),
            ack_debounce: millis_var("BRIDGE_ACK_DEBOUNCE_MS", 250),
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn millis_var(name: &str, default: u64) -> Duration {
    let millis = std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default);
    Duration::from_millis(millis)
}
