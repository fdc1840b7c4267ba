//! Generic key-value store SPI (backend SPI, SPEC_FULL.md §6).
//!
//! The core treats persistence as a black box behind `KVStore`; this module
//! also ships the only implementation we carry, a thin wrapper over `sled`
//! (the teacher's `db.rs` already opens a `sled::Db` directly — this
//! generalizes that into the documented `Get`/`Put`/`Delete`/`Watch`
//! contract so `SecretStore`, the onion-key store, and the freebie mirror
//! in SPEC_FULL.md §3 can all share one backing file).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("key not found")]
    NotFound,
    #[error("conflicting write")]
    Conflict,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub trait KVStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Vec<u8>, KvError>;
    fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError>;
    fn delete(&self, key: &str) -> Result<(), KvError>;
    /// Subscribe to all future writes/deletes under `prefix`.
    fn watch(&self, prefix: &str) -> sled::Subscriber;
}

/// `sled`-backed implementation. Cloning is cheap: `sled::Db` is an `Arc`
/// handle internally.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: &str) -> Result<Self, KvError> {
        let db = sled::open(path).map_err(|e| KvError::Unavailable(e.to_string()))?;
        Ok(Self { db })
    }

    #[cfg(test)]
    pub fn temporary() -> Self {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .expect("open temporary sled db");
        Self { db }
    }

    /// Direct access to the backing `sled::Db`, for collaborators (e.g.
    /// `SecretStore`) that share this file under a different key prefix.
    pub fn inner(&self) -> &sled::Db {
        &self.db
    }
}

impl KVStore for SledStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, KvError> {
        match self.db.get(key) {
            Ok(Some(v)) => Ok(v.to_vec()),
            Ok(None) => Err(KvError::NotFound),
            Err(e) => Err(KvError::Unavailable(e.to_string())),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        self.db
            .insert(key, value)
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), KvError> {
        self.db
            .remove(key)
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn watch(&self, prefix: &str) -> sled::Subscriber {
        self.db.watch_prefix(prefix)
    }
}

/// Conditional create used by `SecretStore::NewSecret`: fails with
/// `Conflict` if the key is already bound, matching sled's native CAS.
pub fn put_if_absent(db: &sled::Db, key: &str, value: &[u8]) -> Result<(), KvError> {
    let result = db
        .compare_and_swap(key, None as Option<&[u8]>, Some(value))
        .map_err(|e| KvError::Unavailable(e.to_string()))?;
    result.map_err(|_| KvError::Conflict)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_roundtrip() {
        let store = SledStore::temporary();
        assert!(matches!(store.get("k"), Err(KvError::NotFound)));
        store.put("k", b"v").unwrap();
        assert_eq!(store.get("k").unwrap(), b"v");
        store.delete("k").unwrap();
        assert!(matches!(store.get("k"), Err(KvError::NotFound)));
    }

    #[test]
    fn put_if_absent_detects_conflict() {
        let store = SledStore::temporary();
        put_if_absent(&store.db, "k", b"v1").unwrap();
        let err = put_if_absent(&store.db, "k", b"v2").unwrap_err();
        assert!(matches!(err, KvError::Conflict));
    }
}
