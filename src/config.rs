//! Structured configuration (SPEC_FULL.md §3, §6), loaded with the
//! `config` crate exactly as the teacher's `bin/server.rs` already does.
//!
//! This generalizes the teacher's single flat `Backend` struct (path-only
//! matching, a fixed JSON-RPC-shaped upstream call) into the full service
//! schema: dual host/path regex matching, auth levels including the
//! freebie quota, TLS pinning, and header materialization from files.

use std::collections::HashMap;
use std::net::IpAddr;

use regex::Regex;
use serde::Deserialize;

use crate::error::GatewayError;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub lnd: LndConfig,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub tor: Option<TorConfig>,
    #[serde(default)]
    pub static_files: Option<StaticConfig>,
    pub services: Vec<RawServiceConfig>,
}

fn default_data_dir() -> String {
    "lsat-gateway.db".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

/// TLS acquisition strategy for the client-facing listener
/// (SPEC_FULL.md §1, §9 open questions): self-signed generation vs. ACME.
#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    /// Generate and use a self-signed certificate; mutually exclusive
    /// with `autocert`.
    #[serde(default)]
    pub insecure: bool,
    /// Acquire a certificate from an ACME CA (e.g. Let's Encrypt).
    #[serde(default)]
    pub autocert: bool,
    pub servername: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LndConfig {
    pub host: String,
    pub tls_path: String,
    pub mac_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TorConfig {
    pub control_addr: String,
    pub virtual_port: u16,
    pub listen_port: u16,
    #[serde(default)]
    pub v2: bool,
    #[serde(default = "default_true")]
    pub v3: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct StaticConfig {
    pub root: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendScheme {
    Http,
    Https,
}

/// Raw, as-deserialized auth level. `Freebie` carries the free-request
/// quota `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthLevel {
    Off,
    On,
    Freebie(u32),
}

impl<'de> Deserialize<'de> for AuthLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        AuthLevel::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl AuthLevel {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("off") {
            return Ok(AuthLevel::Off);
        }
        if raw.eq_ignore_ascii_case("on") {
            return Ok(AuthLevel::On);
        }
        if let Some(rest) = raw
            .strip_prefix("freebie:")
            .or_else(|| raw.strip_prefix("freebie "))
        {
            let n: u32 = rest
                .trim()
                .parse()
                .map_err(|_| format!("invalid freebie count: {rest}"))?;
            if n == 0 {
                return Err("freebie level requires n > 0".to_string());
            }
            return Ok(AuthLevel::Freebie(n));
        }
        Err(format!("unknown auth level: {raw}"))
    }
}

/// As-deserialized service entry, before regex compilation and header
/// resolution.
#[derive(Debug, Deserialize, Clone)]
pub struct RawServiceConfig {
    pub name: String,
    pub backend_addr: String,
    pub backend_scheme: BackendScheme,
    #[serde(default)]
    pub backend_tls_cert_path: Option<String>,
    #[serde(default)]
    pub host_regex: Option<String>,
    #[serde(default)]
    pub path_regex: Option<String>,
    pub auth: AuthLevel,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub price_msat: u32,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub constraints: HashMap<String, String>,
}

/// Compiled service, ready for use on the request path: regexes
/// precompiled, headers resolved, invariants checked. Immutable after
/// startup (SPEC_FULL.md §5).
#[derive(Debug, Clone)]
pub struct Service {
    pub name: String,
    pub backend_addr: String,
    pub backend_scheme: BackendScheme,
    pub backend_tls_cert_path: Option<String>,
    pub host_regex: Option<Regex>,
    pub path_regex: Option<Regex>,
    pub auth: AuthLevel,
    pub headers: Vec<(String, String)>,
    pub price_msat: u32,
    pub capabilities: Vec<String>,
    pub constraints: HashMap<String, String>,
}

impl Service {
    pub fn matches(&self, host: Option<&str>, path: &str) -> bool {
        let host_ok = match &self.host_regex {
            Some(re) => host.map(|h| re.is_match(h)).unwrap_or(false),
            None => true,
        };
        let path_ok = match &self.path_regex {
            Some(re) => re.is_match(path),
            None => true,
        };
        host_ok && path_ok
    }

    pub fn capabilities_csv(&self) -> String {
        self.capabilities.join(",")
    }
}

fn compile_regex(field: &str, pattern: &Option<String>) -> Result<Option<Regex>, GatewayError> {
    match pattern {
        Some(p) => Regex::new(p)
            .map(Some)
            .map_err(|e| GatewayError::Config(format!("invalid {field} regex {p:?}: {e}"))),
        None => Ok(None),
    }
}

impl RawServiceConfig {
    pub fn compile(self) -> Result<Service, GatewayError> {
        if self.host_regex.is_none() && self.path_regex.is_none() {
            return Err(GatewayError::Config(format!(
                "service {:?} must declare at least one of host_regex/path_regex",
                self.name
            )));
        }
        if self.backend_scheme == BackendScheme::Https && self.backend_tls_cert_path.is_none() {
            tracing::warn!(
                service = %self.name,
                "https backend without a pinned cert; falling back to the system trust store"
            );
        }

        let host_regex = compile_regex("host", &self.host_regex)?;
        let path_regex = compile_regex("path", &self.path_regex)?;
        let headers = resolve_headers(&self.headers)?;

        Ok(Service {
            name: self.name,
            backend_addr: self.backend_addr,
            backend_scheme: self.backend_scheme,
            backend_tls_cert_path: self.backend_tls_cert_path,
            host_regex,
            path_regex,
            auth: self.auth,
            headers,
            price_msat: self.price_msat,
            capabilities: self.capabilities,
            constraints: self.constraints,
        })
    }
}

/// Resolve `!file+hex:<path>` / `!file+base64:<path>` sentinel header
/// values by reading the referenced file once at startup
/// (SPEC_FULL.md §4.7). Any other `!file` prefix is a config error.
/// Idempotent: re-running on the same config and files yields identical
/// output (SPEC_FULL.md §8 invariant 6).
pub fn resolve_headers(
    raw: &HashMap<String, String>,
) -> Result<Vec<(String, String)>, GatewayError> {
    let mut resolved = Vec::with_capacity(raw.len());
    for (name, value) in raw {
        let resolved_value = if let Some(path) = value.strip_prefix("!file+hex:") {
            let bytes = std::fs::read(path)
                .map_err(|e| GatewayError::Config(format!("reading header file {path:?}: {e}")))?;
            hex::encode(bytes)
        } else if let Some(path) = value.strip_prefix("!file+base64:") {
            let bytes = std::fs::read(path)
                .map_err(|e| GatewayError::Config(format!("reading header file {path:?}: {e}")))?;
            base64::encode(bytes)
        } else if value.starts_with("!file") {
            return Err(GatewayError::Config(format!(
                "unknown !file header sentinel for {name:?}: {value:?}"
            )));
        } else {
            value.clone()
        };
        resolved.push((name.clone(), resolved_value));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_level_parses_off_on_freebie() {
        assert_eq!(AuthLevel::parse("off").unwrap(), AuthLevel::Off);
        assert_eq!(AuthLevel::parse("ON").unwrap(), AuthLevel::On);
        assert_eq!(AuthLevel::parse("freebie:3").unwrap(), AuthLevel::Freebie(3));
    }

    #[test]
    fn auth_level_rejects_zero_freebie() {
        assert!(AuthLevel::parse("freebie:0").is_err());
    }

    #[test]
    fn service_requires_host_or_path_regex() {
        let raw = RawServiceConfig {
            name: "svc".into(),
            backend_addr: "127.0.0.1:9000".into(),
            backend_scheme: BackendScheme::Http,
            backend_tls_cert_path: None,
            host_regex: None,
            path_regex: None,
            auth: AuthLevel::On,
            headers: HashMap::new(),
            price_msat: 1000,
            capabilities: vec![],
            constraints: HashMap::new(),
        };
        assert!(raw.compile().is_err());
    }

    #[test]
    fn header_resolution_reads_file_once_and_is_idempotent() {
        let tmp = tempfile_with_bytes(&[0xDE, 0xAD]);
        let mut raw = HashMap::new();
        raw.insert("X-Auth".to_string(), format!("!file+hex:{}", tmp.to_str().unwrap()));
        let first = resolve_headers(&raw).unwrap();
        let second = resolve_headers(&raw).unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0], ("X-Auth".to_string(), "dead".to_string()));
    }

    #[test]
    fn unknown_file_sentinel_is_config_error() {
        let mut raw = HashMap::new();
        raw.insert("X-Auth".to_string(), "!file+rot13:/tmp/x".to_string());
        assert!(resolve_headers(&raw).is_err());
    }

    fn tempfile_with_bytes(bytes: &[u8]) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("lsat-gateway-test-{}", rand::random::<u64>()));
        std::fs::write(&path, bytes).unwrap();
        path
    }
}
