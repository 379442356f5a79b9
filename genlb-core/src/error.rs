use thiserror::Error;

/// The balancer's error taxonomy, surfaced by `genlb`'s HTTP layer as the
/// status codes documented in the worker-compatible and control APIs.
#[derive(Debug, Error, Clone)]
pub enum GenlbError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("queue full")]
    QueueFull,

    #[error("no healthy worker available")]
    NoHealthyWorker,

    #[error("worker rejected request (status {status}): {message}")]
    UpstreamRejected { status: u16, message: String },

    #[error("worker unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("worker timed out: {0}")]
    UpstreamTimeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}
