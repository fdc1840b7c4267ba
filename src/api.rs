//! HTTP-facing glue: the single boundary (SPEC_FULL.md §7) where a
//! `GatewayError` becomes a wire response, and the logging severity the
//! error taxonomy calls for is applied.
//!
//! The teacher centralizes this in `api::handle_rejection`, converting a
//! `warp::Rejection` to a `warp::reply::json` error body. `router::Router`
//! already resolves every request-path decision to a concrete
//! `Response<Body>` itself (so there is no `warp::Rejection` left to
//! recover from by the time a request reaches the listener); this module
//! keeps the teacher's "exactly one conversion point" shape but aims it at
//! the handful of fallible operations that still produce a `GatewayError`
//! directly (backend dispatch, and any fatal-at-startup configuration
//! error reported the same way a request error would be).

use tracing::{error, info, warn};
use warp::hyper::{Body, Response, StatusCode};

use crate::error::GatewayError;

/// Convert a `GatewayError` into the HTTP response it maps to, logging at
/// the severity SPEC_FULL.md §7 calls for: `AuthChallenge` never logs as
/// an error, `Internal` always does, everything else logs at info/warn.
pub fn gateway_error_response(err: &GatewayError) -> Response<Body> {
    match err {
        GatewayError::AuthChallenge => {}
        GatewayError::AuthReject(_) => info!(error = %err, "credential rejected"),
        GatewayError::Internal(_) => error!(error = %err, "internal invariant violation"),
        GatewayError::Cancelled => {}
        _ if err.is_loggable_as_error() => error!(error = %err, "request failed"),
        _ => warn!(error = %err, "request failed"),
    }

    status_only_response(err.status())
}

pub fn status_only_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .expect("building a status-only response never fails")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_down_maps_to_503() {
        let resp = gateway_error_response(&GatewayError::DependencyDown("lnd unreachable".into()));
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn upstream_error_maps_to_502() {
        let resp = gateway_error_response(&GatewayError::Upstream("connect refused".into()));
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
