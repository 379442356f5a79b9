use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;

/// Re-streams a worker's `/view` response without buffering the body fully
/// in memory, grounded in the original's `StreamingResponse` usage for the
/// same endpoint (spec.md §4.6 supplement).
pub fn stream_upstream_response(upstream: reqwest::Response) -> Response {
    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        headers.insert(name.clone(), value.clone());
    }
    let body = Body::from_stream(upstream.bytes_stream());

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
