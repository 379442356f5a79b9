use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use genlb_core::GenlbError;
use serde_json::json;

/// Maps the core error taxonomy to the HTTP status codes in spec.md §7.
/// `UpstreamRejected` defaults to 502 (bad gateway); a future passthrough of
/// the worker's original 400 is allowed by the spec but not required, so we
/// keep the simpler uniform mapping.
pub struct ApiError(pub GenlbError);

impl From<GenlbError> for ApiError {
    fn from(err: GenlbError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GenlbError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GenlbError::NotFound(_) => StatusCode::NOT_FOUND,
            GenlbError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            GenlbError::NoHealthyWorker => StatusCode::SERVICE_UNAVAILABLE,
            GenlbError::UpstreamRejected { .. } => StatusCode::BAD_GATEWAY,
            GenlbError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            GenlbError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GenlbError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "error": error_kind(&self.0),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

fn error_kind(err: &GenlbError) -> &'static str {
    match err {
        GenlbError::InvalidRequest(_) => "invalid_request",
        GenlbError::NotFound(_) => "not_found",
        GenlbError::QueueFull => "queue_full",
        GenlbError::NoHealthyWorker => "no_healthy_worker",
        GenlbError::UpstreamRejected { .. } => "upstream_rejected",
        GenlbError::UpstreamUnreachable(_) => "upstream_unreachable",
        GenlbError::UpstreamTimeout(_) => "upstream_timeout",
        GenlbError::Internal(_) => "internal",
    }
}
