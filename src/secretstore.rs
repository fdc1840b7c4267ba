//! SecretStore (SPEC_FULL.md §4.1): persists per-token root secrets.
//!
//! Grounded in the teacher's `db.rs`, which already keeps LSAT root
//! secrets in a `sled::Db` under a `lsat/proxy/secrets/<...>` key. This
//! module lifts that into the documented `NewSecret`/`GetSecret`/
//! `RevokeSecret` contract, decoupled from the macaroon-specific `Entry`
//! bookkeeping (quota tracking moved to `mint`/`limiter`).

use rand::RngCore;
use thiserror::Error;
use tracing::{debug, info};

use crate::kvstore::{self, KvError, KVStore, SledStore};

pub const SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("secret already exists for this token id")]
    AlreadyExists,
    #[error("no secret bound to this token id")]
    NotFound,
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
}

impl From<KvError> for SecretStoreError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::NotFound => SecretStoreError::NotFound,
            KvError::Conflict => SecretStoreError::AlreadyExists,
            KvError::Unavailable(e) => SecretStoreError::Unavailable(e),
        }
    }
}

pub trait SecretStore: Send + Sync {
    /// Create and persist a fresh random root secret for `id`. Atomic:
    /// fails with `AlreadyExists` rather than overwriting a bound id.
    fn new_secret(&self, id_hex: &str) -> Result<[u8; SECRET_LEN], SecretStoreError>;

    fn get_secret(&self, id_hex: &str) -> Result<[u8; SECRET_LEN], SecretStoreError>;

    /// Idempotent: a second revocation of an already-revoked id still
    /// succeeds.
    fn revoke_secret(&self, id_hex: &str) -> Result<(), SecretStoreError>;
}

fn key_for(id_hex: &str) -> String {
    format!("lsat/proxy/secrets/{id_hex}")
}

pub struct SledSecretStore {
    db: sled::Db,
}

impl SledSecretStore {
    pub fn new(store: &SledStore) -> Self {
        Self { db: store.inner().clone() }
    }
}

impl SecretStore for SledSecretStore {
    fn new_secret(&self, id_hex: &str) -> Result<[u8; SECRET_LEN], SecretStoreError> {
        let mut secret = [0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut secret);
        let key = key_for(id_hex);
        info!(id = %id_hex, "minting new root secret");
        kvstore::put_if_absent(&self.db, &key, &secret)?;
        Ok(secret)
    }

    fn get_secret(&self, id_hex: &str) -> Result<[u8; SECRET_LEN], SecretStoreError> {
        let key = key_for(id_hex);
        let bytes = self
            .db
            .get(&key)
            .map_err(|e| SecretStoreError::Unavailable(e.to_string()))?
            .ok_or(SecretStoreError::NotFound)?;
        debug!(id = %id_hex, "fetched root secret");
        let arr: [u8; SECRET_LEN] = bytes
            .as_ref()
            .try_into()
            .map_err(|_| SecretStoreError::Unavailable("corrupt secret length".into()))?;
        Ok(arr)
    }

    fn revoke_secret(&self, id_hex: &str) -> Result<(), SecretStoreError> {
        let key = key_for(id_hex);
        info!(id = %id_hex, "revoking root secret");
        self.db
            .remove(&key)
            .map_err(|e| SecretStoreError::Unavailable(e.to_string()))?;
        Ok(())
    }
}
