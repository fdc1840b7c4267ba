//! TLS acquisition for the client-facing listener (SPEC_FULL.md §1, §6,
//! §9 open questions): self-signed generation or ACME, with a TLS 1.2+
//! floor.
//!
//! The teacher serves cleartext HTTP only. Grounded in `agora-org-agora`,
//! the only pack repo that terminates TLS in front of a Lightning-gated
//! HTTP service: `rcgen` for self-signed certs, `rustls-acme` for
//! Let's Encrypt-style issuance, both feeding a `rustls::ServerConfig`
//! that `bin/server.rs` wraps around the raw listener (`warp`'s own
//! `.tls()` builder only accepts a static cert/key pair, which can't
//! express ACME's live-rotating resolver).

use std::path::Path;
use std::sync::Arc;

use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_acme::caches::DirCache;
use rustls_acme::AcmeConfig;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use crate::config::TlsConfig;
use crate::context::Context;
use crate::error::GatewayError;

/// Build a `ServerConfig` per the configured strategy. `insecure` and
/// `autocert` are mutually exclusive (SPEC_FULL.md §3 TLS invariant,
/// enforced by `config::RawServiceConfig`-adjacent validation at load
/// time — see `config.rs`).
pub async fn build_server_config(
    tls: &TlsConfig,
    data_dir: &Path,
    ctx: &Context,
) -> Result<Arc<ServerConfig>, GatewayError> {
    if tls.autocert {
        return acme_server_config(tls, data_dir, ctx).await;
    }
    self_signed_server_config(tls)
}

fn self_signed_server_config(tls: &TlsConfig) -> Result<Arc<ServerConfig>, GatewayError> {
    let servername = tls
        .servername
        .clone()
        .unwrap_or_else(|| "localhost".to_string());
    let cert = rcgen::generate_simple_self_signed(vec![servername.clone()])
        .map_err(|e| GatewayError::Config(format!("generating self-signed cert: {e}")))?;
    let cert_der = cert
        .serialize_der()
        .map_err(|e| GatewayError::Config(format!("serializing self-signed cert: {e}")))?;
    let key_der = cert.serialize_private_key_der();

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![Certificate(cert_der)], PrivateKey(key_der))
        .map_err(|e| GatewayError::Config(format!("building self-signed TLS config: {e}")))?;

    info!(servername = %servername, "using a self-signed TLS certificate");
    Ok(Arc::new(config))
}

/// Provision via ACME. Returns a `ServerConfig` wired to a cert resolver
/// that `rustls-acme` rotates in the background; spawns the task that
/// drives the ACME challenge/renewal protocol for the lifetime of the
/// process, stopping when `ctx`'s shutdown token fires.
async fn acme_server_config(
    tls: &TlsConfig,
    data_dir: &Path,
    ctx: &Context,
) -> Result<Arc<ServerConfig>, GatewayError> {
    let servername = tls.servername.clone().ok_or_else(|| {
        GatewayError::Config("autocert requires server.tls.servername".to_string())
    })?;

    let cache_dir = data_dir.join("acme-cache");
    let mut state = AcmeConfig::new(vec![servername.clone()])
        .cache(DirCache::new(cache_dir))
        .directory_lets_encrypt(true)
        .state();

    let resolver = state.resolver();
    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    let shutdown = ctx.shutdown_token();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("acme driver stopping on shutdown");
                    return;
                }
                event = state.next() => {
                    match event {
                        Some(Ok(ok)) => info!(?ok, "acme event"),
                        Some(Err(e)) => warn!(error = %e, "acme event error"),
                        None => {
                            error!("acme event stream ended unexpectedly");
                            return;
                        }
                    }
                }
            }
        }
    });

    info!(servername = %servername, "provisioning TLS certificate via ACME");
    Ok(Arc::new(config))
}
