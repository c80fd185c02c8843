use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use syndro_transfer::SecretKey;

/// Looks up the shared chunk key for a peer.
///
/// Key agreement happens elsewhere; the receiver only needs the result.
pub trait KeyProvider: Send + Sync {
    fn key_for(&self, peer_id: &str) -> Option<SecretKey>;
}

/// In-memory key table with an optional fallback key.
#[derive(Default)]
pub struct StaticKeys {
    keys: RwLock<HashMap<String, SecretKey>>,
    fallback: Option<SecretKey>,
}

impl StaticKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `key` for every peer without an explicit entry.
    pub fn with_fallback(key: SecretKey) -> Self {
        Self {
            keys: RwLock::default(),
            fallback: Some(key),
        }
    }

    pub fn insert(&self, peer_id: impl Into<String>, key: SecretKey) {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer_id.into(), key);
    }

    pub fn remove(&self, peer_id: &str) -> bool {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer_id)
            .is_some()
    }
}

impl KeyProvider for StaticKeys {
    fn key_for(&self, peer_id: &str) -> Option<SecretKey> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer_id)
            .cloned()
            .or_else(|| self.fallback.clone())
    }
}
