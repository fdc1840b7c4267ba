//! Error taxonomy for the request path.
//!
//! Kinds, not types: every fallible operation on the hot path resolves to
//! one of these variants so `api::handle_rejection` can map it to an HTTP
//! status (or no response at all, for `Cancelled`) in exactly one place.

use warp::{http::StatusCode, reject::Reject};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Invalid or missing configuration. Fatal at startup; never seen on
    /// the request path.
    #[error("configuration error: {0}")]
    Config(String),

    /// Backing store or Lightning node unreachable. Retry with backoff
    /// upstream of this type; surfaced as 503 if sustained.
    #[error("dependency unavailable: {0}")]
    DependencyDown(String),

    /// Expected control flow for unauthenticated requests. Produces 402,
    /// never logged as an error.
    #[error("payment required")]
    AuthChallenge,

    /// Malformed or forged credentials. 402 with a fresh challenge,
    /// logged at info.
    #[error("credential rejected: {0}")]
    AuthReject(String),

    /// Backend returned 5xx or failed to connect.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Invariant violation (e.g. a caveat list malformed after mint).
    #[error("internal error: {0}")]
    Internal(String),

    /// Client disconnect or shutdown. No response is sent.
    #[error("cancelled")]
    Cancelled,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::DependencyDown(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::AuthChallenge | GatewayError::AuthReject(_) => {
                StatusCode::PAYMENT_REQUIRED
            }
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Cancelled => StatusCode::OK, // never actually sent
        }
    }

    /// Whether `tracing::error!` should fire for this kind, per the taxonomy
    /// in SPEC_FULL.md §7.
    pub fn is_loggable_as_error(&self) -> bool {
        matches!(self, GatewayError::Internal(_))
    }
}

impl Reject for GatewayError {}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}
