//! ServiceLimiter (SPEC_FULL.md §4.3): pure functions from service config
//! to the caveats minted into a token and the constraints checked at
//! verify time.
//!
//! The teacher bakes a `path=<...>` and `time<...>` caveat directly into
//! `lsat::Lsat::generate_challange`. This generalizes that into a
//! per-service, config-driven caveat set so multiple services (and their
//! declared `constraints`) can be composed into one token.

use crate::config::Service;

/// A single `condition = value` caveat, matching SPEC_FULL.md §3's wire
/// shape for macaroon first-party caveats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaveatSpec {
    pub condition: String,
    pub value: String,
}

impl CaveatSpec {
    pub fn new(condition: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            value: value.into(),
        }
    }

    pub fn predicate(&self) -> String {
        format!("{}={}", self.condition, self.value)
    }
}

/// Caveats to bake into a minted token for `service`. Always includes
/// `service` and `capabilities`; appends the service's declared
/// constraints verbatim (each becomes a verify-time satisfier too, see
/// `service_constraints`).
pub fn service_caveats(service: &Service) -> Vec<CaveatSpec> {
    let mut caveats = vec![
        CaveatSpec::new("service", &service.name),
        CaveatSpec::new("capabilities", service.capabilities_csv()),
    ];
    for (condition, value) in &service.constraints {
        caveats.push(CaveatSpec::new(condition.clone(), value.clone()));
    }
    caveats
}

/// Constraint conditions whose satisfiers must accept at verify time for
/// `target_service` (SPEC_FULL.md §4.4 step 5), consumed by
/// `mint::build_verifier` to build the verifier's satisfier set. `valid_until`
/// is always present with a constant value computed from the mint-time
/// clock (see `mint::Mint::mint_lsat`, which supplies the concrete
/// deadline).
pub fn service_constraints(service: &Service) -> Vec<String> {
    let mut constraints: Vec<String> = service.constraints.keys().cloned().collect();
    constraints.push("valid_until".to_string());
    constraints
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthLevel, BackendScheme, Service};
    use std::collections::HashMap;

    fn test_service() -> Service {
        Service {
            name: "svc1".into(),
            backend_addr: "127.0.0.1:9000".into(),
            backend_scheme: BackendScheme::Http,
            backend_tls_cert_path: None,
            host_regex: None,
            path_regex: None,
            auth: AuthLevel::On,
            headers: vec![],
            price_msat: 1000,
            capabilities: vec!["read".into(), "write".into()],
            constraints: HashMap::new(),
        }
    }

    #[test]
    fn service_caveats_include_service_and_capabilities() {
        let svc = test_service();
        let caveats = service_caveats(&svc);
        assert!(caveats.contains(&CaveatSpec::new("service", "svc1")));
        assert!(caveats.contains(&CaveatSpec::new("capabilities", "read,write")));
    }

    #[test]
    fn service_constraints_always_includes_valid_until() {
        let svc = test_service();
        assert!(service_constraints(&svc).contains(&"valid_until".to_string()));
    }
}
