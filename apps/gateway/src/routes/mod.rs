pub mod auth;
pub mod health;

use axum::routing::any;
use axum::Router;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(auth::router())
        .route("/api/bff/{*path}", any(crate::proxy::forward))
}
