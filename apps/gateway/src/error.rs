use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Structured gateway error returned to clients.
#[derive(Debug, Serialize)]
pub struct GatewayErrorBody {
    pub error: GatewayErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct GatewayErrorDetail {
    pub code: String,
    pub message: String,
}

/// Gateway-level error that converts into an HTTP response.
///
/// Configuration errors and unreachable upstreams are operator problems,
/// not per-request failures — they are logged loudly and never retried.
#[derive(Debug)]
pub struct GatewayError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl GatewayError {
    /// The upstream base URL is not configured.
    pub fn missing_upstream() -> Self {
        tracing::error!("UPSTREAM_BASE_URL is not set; refusing to proxy");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "MISSING_UPSTREAM".to_string(),
            message: "UPSTREAM_BASE_URL is not set".to_string(),
        }
    }

    /// The upstream could not be reached.
    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            code: "UPSTREAM_UNAVAILABLE".to_string(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR".to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = GatewayErrorBody {
            error: GatewayErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        // Gateway responses are never cacheable, errors included.
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
    }
}
