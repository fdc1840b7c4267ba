//! Proxy router (SPEC_FULL.md §4.7): host/path service matching,
//! authentication gating, and backend/static dispatch.
//!
//! The teacher's routing is a single `path == backend.path` lookup in
//! `bin/server.rs::protected_path`. This generalizes matching to the
//! dual host+path regex scheme in SPEC_FULL.md §3/§4.7 (first match
//! wins) and adds the static-file fallback the teacher has no
//! counterpart for.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use tracing::{info, instrument};
use warp::hyper::{Body, Request, Response, StatusCode};

use crate::authenticator::{Authenticator, Decision};
use crate::config::Service;
use crate::context::Context;
use crate::upstream::Forwarder;

pub struct Router {
    services: Vec<Service>,
    authenticator: Authenticator,
    forwarder: Forwarder,
    static_root: Option<PathBuf>,
}

impl Router {
    pub fn new(
        services: Vec<Service>,
        authenticator: Authenticator,
        static_root: Option<PathBuf>,
    ) -> Result<Self, crate::error::GatewayError> {
        let forwarder = Forwarder::build(&services)?;
        Ok(Self {
            services,
            authenticator,
            forwarder,
            static_root,
        })
    }

    fn match_service(&self, host: Option<&str>, path: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.matches(host, path))
    }

    #[instrument(skip(self, req, ctx), fields(path = %req.uri().path()))]
    pub async fn route(
        &self,
        req: Request<Body>,
        client_ip: IpAddr,
        ctx: &Context,
    ) -> Response<Body> {
        let host = req
            .headers()
            .get(warp::hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let path = req.uri().path().to_string();

        let service = match self.match_service(host.as_deref(), &path) {
            Some(s) => s,
            None => return self.serve_static_or_404(&path).await,
        };

        let auth_header = req
            .headers()
            .get(warp::hyper::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        match self
            .authenticator
            .accept(auth_header.as_deref(), client_ip, service, ctx)
            .await
        {
            Decision::Allow => match self.forwarder.forward(service, req).await {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::warn!(error = %e, service = %service.name, "upstream dispatch failed");
                    crate::api::gateway_error_response(&e)
                }
            },
            Decision::Challenge {
                macaroon_b64,
                payment_request,
            } => {
                info!(service = %service.name, "issuing payment challenge");
                challenge_response(&macaroon_b64, &payment_request)
            }
            Decision::Unavailable => {
                let mut resp = response_with_status(StatusCode::SERVICE_UNAVAILABLE, "");
                resp.headers_mut().insert(
                    "retry-after",
                    warp::hyper::header::HeaderValue::from_static("5"),
                );
                resp
            }
        }
    }

    async fn serve_static_or_404(&self, request_path: &str) -> Response<Body> {
        let Some(root) = &self.static_root else {
            return response_with_status(StatusCode::NOT_FOUND, "");
        };

        if request_path.split('/').any(|segment| segment == "..") {
            return response_with_status(StatusCode::BAD_REQUEST, "");
        }

        let relative = request_path.trim_start_matches('/');
        let candidate = if relative.is_empty() {
            root.join("index.html")
        } else {
            root.join(relative)
        };

        if escapes_root(root, &candidate) {
            return response_with_status(StatusCode::BAD_REQUEST, "");
        }

        match tokio::fs::read(&candidate).await {
            Ok(bytes) => Response::new(Body::from(bytes)),
            Err(_) => response_with_status(StatusCode::NOT_FOUND, ""),
        }
    }
}

/// Belt-and-suspenders check behind the `..`-segment rejection above:
/// confirms `candidate` cannot resolve (including through a symlinked
/// ancestor) outside `root`, without requiring `candidate` itself to
/// exist. A request for a file that simply isn't there is not a
/// containment violation — it walks up to the nearest ancestor that does
/// exist, canonicalizes *that*, and leaves the "does the leaf exist"
/// question to the subsequent `tokio::fs::read` (404), reserving 400 for
/// an actual escape (SPEC_FULL.md §8 E2E #6).
fn escapes_root(root: &Path, candidate: &Path) -> bool {
    let Ok(root) = root.canonicalize() else {
        return true;
    };
    let mut ancestor = candidate;
    loop {
        match ancestor.canonicalize() {
            Ok(resolved) => return !resolved.starts_with(&root),
            Err(_) => match ancestor.parent() {
                Some(parent) => ancestor = parent,
                None => return true,
            },
        }
    }
}

fn response_with_status(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .expect("building a static-status response never fails")
}

fn challenge_response(macaroon_b64: &str, payment_request: &str) -> Response<Body> {
    let value = format!(r#"LSAT macaroon="{macaroon_b64}", invoice="{payment_request}""#);
    let mut resp = response_with_status(StatusCode::PAYMENT_REQUIRED, "");
    match warp::hyper::header::HeaderValue::from_str(&value) {
        Ok(hv) => {
            resp.headers_mut().insert("www-authenticate", hv);
        }
        Err(e) => tracing::error!(error = %e, "challenge header value was not valid"),
    }
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthLevel, BackendScheme};
    use std::collections::HashMap;

    fn test_service(name: &str, host: Option<&str>, path: &str) -> Service {
        Service {
            name: name.into(),
            backend_addr: "127.0.0.1:9000".into(),
            backend_scheme: BackendScheme::Http,
            backend_tls_cert_path: None,
            host_regex: host.map(|h| regex::Regex::new(h).unwrap()),
            path_regex: Some(regex::Regex::new(path).unwrap()),
            auth: AuthLevel::Off,
            headers: vec![],
            price_msat: 0,
            capabilities: vec![],
            constraints: HashMap::new(),
        }
    }

    #[test]
    fn first_declared_match_wins() {
        let services = vec![
            test_service("a", None, "^/foo"),
            test_service("b", None, "^/foo"),
        ];
        let auth = dummy_authenticator();
        let router = Router::new(services, auth, None).unwrap();
        let matched = router.match_service(None, "/foo/bar").unwrap();
        assert_eq!(matched.name, "a");
    }

    #[test]
    fn host_and_path_must_both_match() {
        let services = vec![test_service("a", Some("^api\\.example\\.com$"), "^/v1")];
        let auth = dummy_authenticator();
        let router = Router::new(services, auth, None).unwrap();
        assert!(router.match_service(Some("api.example.com"), "/v1/things").is_some());
        assert!(router.match_service(Some("other.example.com"), "/v1/things").is_none());
        assert!(router.match_service(Some("api.example.com"), "/v2/things").is_none());
    }

    fn dummy_authenticator() -> Authenticator {
        use crate::challenger::{Challenge, Challenger, ChallengerError};
        use crate::freebie::FreebieStore;
        use crate::lightning::InvoiceStatus;
        use crate::mint::Mint;
        use crate::secretstore::{SecretStore, SecretStoreError};
        use std::sync::Arc;

        struct NoopSecrets;
        impl SecretStore for NoopSecrets {
            fn new_secret(&self, _id_hex: &str) -> Result<[u8; 32], SecretStoreError> {
                Ok([0u8; 32])
            }
            fn get_secret(&self, _id_hex: &str) -> Result<[u8; 32], SecretStoreError> {
                Err(SecretStoreError::NotFound)
            }
            fn revoke_secret(&self, _id_hex: &str) -> Result<(), SecretStoreError> {
                Ok(())
            }
        }

        struct NoopChallenger;
        #[async_trait::async_trait]
        impl Challenger for NoopChallenger {
            async fn new_challenge(&self, _price_msat: u64) -> Result<Challenge, ChallengerError> {
                Ok(Challenge {
                    payment_request: String::new(),
                    payment_hash: vec![0u8; 32],
                })
            }
            async fn verify_invoice_status(
                &self,
                _h: &[u8],
                _e: InvoiceStatus,
                _t: std::time::Duration,
            ) -> Result<bool, ChallengerError> {
                Ok(false)
            }
            async fn start(&self) -> Result<(), ChallengerError> {
                Ok(())
            }
            async fn stop(&self) {}
        }

        let mint = Mint::new(Arc::new(NoopSecrets), Arc::new(NoopChallenger));
        Authenticator::new(mint, FreebieStore::new())
    }

    fn temp_static_root() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("lsat-gateway-static-test-{}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index.html"), b"hello").unwrap();
        dir
    }

    #[tokio::test]
    async fn missing_static_file_is_404_not_400() {
        let root = temp_static_root();
        let router = Router::new(vec![], dummy_authenticator(), Some(root)).unwrap();
        let resp = router.serve_static_or_404("/does-not-exist.html").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn existing_static_file_is_served() {
        let root = temp_static_root();
        let router = Router::new(vec![], dummy_authenticator(), Some(root)).unwrap();
        let resp = router.serve_static_or_404("/index.html").await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn traversal_attempt_is_400() {
        let root = temp_static_root();
        let router = Router::new(vec![], dummy_authenticator(), Some(root)).unwrap();
        let resp = router.serve_static_or_404("/../etc/passwd").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
