//! Authenticator (SPEC_FULL.md §4.6): the request-time accept/challenge
//! decision, orchestrating FreebieStore and Mint.
//!
//! The teacher inlines this directly into `api::handle_protected`
//! (header lookup, `Lsat::verify`, 402 response construction all in one
//! `warp` handler). This pulls the decision logic out into a
//! transport-agnostic `accept` so `api.rs` only has to translate
//! `Decision` into a `warp::Reply`.

use tracing::info;

use crate::config::{AuthLevel, Service};
use crate::context::Context;
use crate::freebie::{Consume, FreebieStore};
use crate::lsat;
use crate::mint::{Mint, MintError};

/// Outcome of `Authenticator::accept`.
pub enum Decision {
    Allow,
    /// 402 Payment Required: a freshly minted macaroon plus the invoice
    /// to pay for it. The *offered* macaroon, if any, is never reused.
    Challenge { macaroon_b64: String, payment_request: String },
    /// The Lightning node (or its backing store) could not service a
    /// fresh invoice request. SPEC_FULL.md §9 open question: surfaced as
    /// 503 with `Retry-After` rather than failing the request silently.
    Unavailable,
}

pub struct Authenticator {
    mint: Mint,
    freebies: FreebieStore,
}

impl Authenticator {
    pub fn new(mint: Mint, freebies: FreebieStore) -> Self {
        Self { mint, freebies }
    }

    /// `auth_header` is the raw `Authorization` header value, if present.
    pub async fn accept(
        &self,
        auth_header: Option<&str>,
        client_ip: std::net::IpAddr,
        target_service: &Service,
        ctx: &Context,
    ) -> Decision {
        match target_service.auth {
            AuthLevel::Off => return Decision::Allow,
            AuthLevel::Freebie(n) => {
                if self.freebies.try_consume(&target_service.name, client_ip, n) == Consume::Granted
                {
                    return Decision::Allow;
                }
            }
            AuthLevel::On => {}
        }

        let credential = match auth_header.map(lsat::parse_credential) {
            Some(Ok(cred)) => cred,
            Some(Err(e)) => {
                info!(error = %e, "malformed LSAT credential, issuing a fresh challenge");
                return self.fresh_challenge(target_service, ctx).await;
            }
            None => return self.fresh_challenge(target_service, ctx).await,
        };

        match self.mint.verify_lsat(&credential, target_service, ctx).await {
            Ok(()) => Decision::Allow,
            Err(e) => {
                info!(error = %e, service = %target_service.name, "credential rejected");
                self.fresh_challenge(target_service, ctx).await
            }
        }
    }

    async fn fresh_challenge(&self, target_service: &Service, ctx: &Context) -> Decision {
        match self.mint.mint_lsat(&[target_service], ctx).await {
            Ok(minted) => Decision::Challenge {
                macaroon_b64: minted.macaroon_b64,
                payment_request: minted.payment_request,
            },
            Err(MintError::Lightning(e)) => {
                tracing::warn!(error = %e, "lightning node unavailable while minting challenge");
                Decision::Unavailable
            }
            Err(MintError::SecretStore(e)) => {
                tracing::warn!(error = %e, "secret store unavailable while minting challenge");
                Decision::Unavailable
            }
            Err(e) => {
                tracing::error!(error = %e, "unexpected error minting challenge token");
                Decision::Unavailable
            }
        }
    }
}
