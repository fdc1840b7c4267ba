//! FreebieStore (SPEC_FULL.md §4.5): per-(service, masked-IP) quota of
//! free requests granted before payment is required.
//!
//! Absent from the teacher entirely (it gates every request via LSAT
//! unconditionally); grounded in the teacher's `dashmap` dependency and
//! sharded-map pattern used for `Challenger`'s waiter map, and in
//! SPEC_FULL.md §5's explicit note that a `dashmap`-style sharded map or
//! a per-shard-mutexed `HashMap` both satisfy the concurrency model.

use std::net::IpAddr;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::kvstore::{KVStore, KvError};

/// Decision returned by `try_consume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consume {
    Granted,
    Exhausted,
}

fn masked_key(service: &str, ip: IpAddr) -> String {
    let cidr = match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            format!("{}.{}.{}.0/24", octets[0], octets[1], octets[2])
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            format!(
                "{:x}:{:x}:{:x}:{:x}::/64",
                segments[0], segments[1], segments[2], segments[3]
            )
        }
    };
    format!("{service}/{cidr}")
}

/// In-memory authoritative counters, optionally mirrored to a `KVStore`
/// for cross-restart inspection (SPEC_FULL.md §3: "implementer option,
/// not a requirement" — the fast path never waits on the mirror write).
pub struct FreebieStore {
    counts: DashMap<String, u32>,
    mirror: Option<Box<dyn KVStore>>,
}

impl FreebieStore {
    pub fn new() -> Self {
        Self {
            counts: DashMap::new(),
            mirror: None,
        }
    }

    pub fn with_mirror(mirror: Box<dyn KVStore>) -> Self {
        Self {
            counts: DashMap::new(),
            mirror: Some(mirror),
        }
    }

    /// Decrement-and-test is atomic per key via `DashMap`'s per-shard
    /// locking; lazily seeds the counter at `initial` on first sight of
    /// this `(service, subnet)` pair.
    pub fn try_consume(&self, service: &str, ip: IpAddr, initial: u32) -> Consume {
        let key = masked_key(service, ip);
        let mut entry = self.counts.entry(key.clone()).or_insert(initial);
        if *entry == 0 {
            debug!(key = %key, "freebie quota exhausted");
            return Consume::Exhausted;
        }
        *entry -= 1;
        let remaining = *entry;
        drop(entry);

        if let Some(mirror) = &self.mirror {
            let mirror_key = format!("lsat/proxy/freebies/{key}");
            if let Err(e) = mirror.put(&mirror_key, &remaining.to_le_bytes()) {
                match e {
                    KvError::Unavailable(msg) => {
                        info!(key = %mirror_key, error = %msg, "freebie mirror write failed, continuing")
                    }
                    _ => debug!(key = %mirror_key, "freebie mirror write skipped"),
                }
            }
        }

        info!(key = %key, remaining, "freebie request granted");
        Consume::Granted
    }

    pub fn peek(&self, service: &str, ip: IpAddr, initial: u32) -> u32 {
        let key = masked_key(service, ip);
        *self.counts.get(&key).map(|v| *v).as_ref().unwrap_or(&initial)
    }
}

impl Default for FreebieStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grants_exactly_n_then_exhausts() {
        let store = FreebieStore::new();
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(store.try_consume("svc1", ip, 2), Consume::Granted);
        assert_eq!(store.try_consume("svc1", ip, 2), Consume::Granted);
        assert_eq!(store.try_consume("svc1", ip, 2), Consume::Exhausted);
    }

    #[test]
    fn ipv4_slash_24_is_shared_but_different_subnets_are_not() {
        let store = FreebieStore::new();
        let a: IpAddr = "10.0.0.5".parse().unwrap();
        let b: IpAddr = "10.0.0.250".parse().unwrap();
        let c: IpAddr = "10.0.1.5".parse().unwrap();
        assert_eq!(store.try_consume("svc1", a, 1), Consume::Granted);
        assert_eq!(store.try_consume("svc1", b, 1), Consume::Exhausted);
        assert_eq!(store.try_consume("svc1", c, 1), Consume::Granted);
    }

    #[test]
    fn ipv6_slash_64_is_shared_but_different_prefixes_are_not() {
        let store = FreebieStore::new();
        let a: IpAddr = "2001:db8::1".parse().unwrap();
        let b: IpAddr = "2001:db8::ffff".parse().unwrap();
        let c: IpAddr = "2001:db9::1".parse().unwrap();
        assert_eq!(store.try_consume("svc1", a, 1), Consume::Granted);
        assert_eq!(store.try_consume("svc1", b, 1), Consume::Exhausted);
        assert_eq!(store.try_consume("svc1", c, 1), Consume::Granted);
    }

    #[test]
    fn peek_reports_remaining_without_consuming() {
        let store = FreebieStore::new();
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(store.peek("svc1", ip, 3), 3);
        store.try_consume("svc1", ip, 3);
        assert_eq!(store.peek("svc1", ip, 3), 2);
    }
}
