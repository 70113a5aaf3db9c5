pub mod config;
pub mod cookies;
pub mod error;
pub mod proxy;
pub mod refresh;
pub mod routes;

use std::sync::Arc;

use config::Config;
use refresh::SessionRefresh;

/// Shared application state available to all route handlers.
///
/// The session-keyed refresh-lock map inside [`SessionRefresh`] is the
/// only cross-request mutable state the gateway holds.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub http: reqwest::Client,
    pub refresh: SessionRefresh,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        // Redirects are relayed to the caller, never followed here.
        let http = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("failed to build upstream client");

        Self {
            config: Arc::new(config),
            http,
            refresh: SessionRefresh::new(),
        }
    }
}
