//! Backend dispatch (SPEC_FULL.md §4.7 "Forwarding"): byte-passthrough
//! reverse-proxy forwarding over `http` or pinned/system-trust `https`.
//!
//! The teacher's `Upstream` builds a JSON-RPC-shaped POST with a fixed
//! body template and extracts one field from the JSON response — tied
//! to a single backend's API shape. This generalizes it into a generic
//! reverse-proxy hop: the inbound request (method, path, body, headers
//! minus hop-by-hop) is forwarded unchanged, and the backend's response
//! is forwarded back unchanged. The `warp::hyper::Client` + connector
//! pattern is kept from the teacher; `hyper_tls` is swapped for
//! `hyper_rustls` on the https path so per-service pinned certs
//! (contributed by `agora-org-agora`'s TLS stack) are possible.

use std::collections::HashMap;

use rustls::{Certificate, ClientConfig, RootCertStore};
use tracing::{debug, warn};
use warp::hyper::{self, Body, Client, Request, Response, Uri};

use crate::config::{BackendScheme, Service};
use crate::error::GatewayError;

/// Headers that must never be forwarded across a proxy hop (RFC 7230
/// §6.1). Matched case-insensitively against the header name.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    HOP_BY_HOP.contains(&lower.as_str()) || lower.starts_with("proxy-")
}

fn strip_hop_by_hop(headers: &mut hyper::HeaderMap) {
    let to_remove: Vec<_> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str()))
        .cloned()
        .collect();
    for name in to_remove {
        headers.remove(name);
    }
}

type HttpsClient = Client<hyper_rustls::HttpsConnector<hyper::client::HttpConnector>>;

/// Per-service client cache, built once at startup from the immutable
/// service table (SPEC_FULL.md §5: "the service table is read-only
/// after startup").
pub struct Forwarder {
    http_client: Client<hyper::client::HttpConnector>,
    system_trust_client: HttpsClient,
    pinned_clients: HashMap<String, HttpsClient>,
}

impl Forwarder {
    pub fn build(services: &[Service]) -> Result<Self, GatewayError> {
        let mut pinned_clients = HashMap::new();
        for svc in services {
            if svc.backend_scheme == BackendScheme::Https {
                if let Some(cert_path) = &svc.backend_tls_cert_path {
                    let client = build_pinned_client(cert_path)?;
                    pinned_clients.insert(svc.name.clone(), client);
                }
            }
        }

        Ok(Self {
            http_client: Client::builder().build_http(),
            system_trust_client: build_system_trust_client(),
            pinned_clients,
        })
    }

    fn client_for<'a>(&'a self, service: &Service) -> ForwardClient<'a> {
        match service.backend_scheme {
            BackendScheme::Http => ForwardClient::Http(&self.http_client),
            BackendScheme::Https => match self.pinned_clients.get(&service.name) {
                Some(c) => ForwardClient::Https(c),
                None => {
                    warn!(service = %service.name, "https backend with no pinned cert, using system trust store");
                    ForwardClient::Https(&self.system_trust_client)
                }
            },
        }
    }

    /// Forward `req` to `service`'s backend. `req`'s URI must already be
    /// the path+query to send; this function rewrites authority/scheme.
    pub async fn forward(
        &self,
        service: &Service,
        mut req: Request<Body>,
    ) -> Result<Response<Body>, GatewayError> {
        let scheme = match service.backend_scheme {
            BackendScheme::Http => "http",
            BackendScheme::Https => "https",
        };
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let uri: Uri = format!("{scheme}://{}{path_and_query}", service.backend_addr)
            .parse()
            .map_err(|e| GatewayError::Internal(format!("building backend uri: {e}")))?;
        *req.uri_mut() = uri;

        let headers = req.headers_mut();
        strip_hop_by_hop(headers);
        headers.insert(
            hyper::header::HOST,
            hyper::header::HeaderValue::from_str(&service.backend_addr)
                .map_err(|e| GatewayError::Internal(format!("invalid backend host header: {e}")))?,
        );
        for (name, value) in &service.headers {
            if let (Ok(name), Ok(value)) = (
                hyper::header::HeaderName::from_bytes(name.as_bytes()),
                hyper::header::HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }

        debug!(service = %service.name, uri = %req.uri(), "forwarding to backend");

        let mut resp = match self.client_for(service) {
            ForwardClient::Http(c) => c.request(req).await,
            ForwardClient::Https(c) => c.request(req).await,
        }
        .map_err(|e| GatewayError::Upstream(e.to_string()))?;

        strip_hop_by_hop(resp.headers_mut());
        Ok(resp)
    }
}

enum ForwardClient<'a> {
    Http(&'a Client<hyper::client::HttpConnector>),
    Https(&'a HttpsClient),
}

fn build_system_trust_client() -> HttpsClient {
    let mut roots = RootCertStore::empty();
    roots.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(config)
        .https_only()
        .enable_http1()
        .build();
    Client::builder().build(https)
}

fn build_pinned_client(cert_path: &str) -> Result<HttpsClient, GatewayError> {
    let pem = std::fs::read(cert_path)
        .map_err(|e| GatewayError::Config(format!("reading pinned cert {cert_path:?}: {e}")))?;
    let certs: Vec<Certificate> = rustls_pemfile::certs(&mut pem.as_slice())
        .map_err(|e| GatewayError::Config(format!("parsing pinned cert {cert_path:?}: {e}")))?
        .into_iter()
        .map(Certificate)
        .collect();
    let mut roots = RootCertStore::empty();
    for cert in &certs {
        roots
            .add(cert)
            .map_err(|e| GatewayError::Config(format!("adding pinned cert {cert_path:?}: {e}")))?;
    }
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(config)
        .https_only()
        .enable_http1()
        .build();
    Ok(Client::builder().build(https))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_names_are_detected_case_insensitively() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(is_hop_by_hop("Proxy-Custom-Thing"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("X-Auth"));
    }
}
