//! Process-wide asymmetric key pair and the cache of peers' public keys.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{CryptoError, EncryptionOperator, OperatorKind, OperatorRegistry};

struct KeyRingState {
    current: Option<Arc<dyn EncryptionOperator>>,
    previous: Option<Arc<dyn EncryptionOperator>>,
}

/// The local asymmetric key pair: minted on first use, replaced on expiry.
///
/// Readers receive an `Arc` snapshot, so a concurrent rotation is observed
/// either entirely or not at all. The pair replaced by the last rotation is
/// kept for decryption only.
#[derive(Clone)]
pub struct KeyRing {
    registry: OperatorRegistry,
    code: String,
    lifetime_secs: i64,
    state: Arc<RwLock<KeyRingState>>,
}

impl KeyRing {
    /// Create a key ring minting `code` pairs valid for `lifetime_secs`.
    #[must_use]
    pub fn new(registry: OperatorRegistry, code: impl Into<String>, lifetime_secs: i64) -> Self {
        Self {
            registry,
            code: code.into(),
            lifetime_secs,
            state: Arc::new(RwLock::new(KeyRingState {
                current: None,
                previous: None,
            })),
        }
    }

    /// Operator code of the pairs this ring mints.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The current valid key pair, minting or rotating as needed.
    ///
    /// # Errors
    ///
    /// Returns error if the operator cannot be instantiated or is not
    /// asymmetric.
    pub fn current(&self) -> Result<Arc<dyn EncryptionOperator>, CryptoError> {
        {
            let state = self
                .state
                .read()
                .map_err(|_| CryptoError::InvalidKey("key ring lock poisoned".to_string()))?;
            if let Some(current) = state.current.as_ref().filter(|op| op.is_valid()) {
                return Ok(current.clone());
            }
        }

        let mut state = self
            .state
            .write()
            .map_err(|_| CryptoError::InvalidKey("key ring lock poisoned".to_string()))?;
        // Another writer may have rotated while we waited.
        if let Some(current) = state.current.as_ref().filter(|op| op.is_valid()) {
            return Ok(current.clone());
        }

        let fresh: Arc<dyn EncryptionOperator> =
            Arc::from(self.registry.instantiate(&self.code, self.lifetime_secs)?);
        if fresh.kind() != OperatorKind::Asymmetric {
            return Err(CryptoError::WrongKind(self.code.clone()));
        }

        if state.current.is_some() {
            tracing::info!(operator = %self.code, "rotating expired key pair");
        } else {
            tracing::debug!(operator = %self.code, "minted key pair");
        }
        state.previous = state.current.take();
        state.current = Some(fresh.clone());
        Ok(fresh)
    }

    /// Decrypt with the current pair, falling back to the previous one.
    ///
    /// # Errors
    ///
    /// Returns the current pair's error when neither pair decrypts.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (current, previous) = {
            let state = self
                .state
                .read()
                .map_err(|_| CryptoError::InvalidKey("key ring lock poisoned".to_string()))?;
            (state.current.clone(), state.previous.clone())
        };

        let Some(current) = current else {
            return Err(CryptoError::MissingPrivateKey);
        };
        match current.decrypt(ciphertext) {
            Ok(plain) => Ok(plain),
            Err(err) => previous.map_or(Err(err.clone()), |prev| {
                prev.decrypt(ciphertext).map_err(|_| err)
            }),
        }
    }
}

/// Remote public keys by destination.
#[derive(Clone, Default)]
pub struct PeerKeyCache {
    keys: Arc<RwLock<HashMap<String, Arc<dyn EncryptionOperator>>>>,
}

impl PeerKeyCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A cached key that has not expired.
    #[must_use]
    pub fn get_valid(&self, peer: &str) -> Option<Arc<dyn EncryptionOperator>> {
        let keys = self.keys.read().ok()?;
        keys.get(peer).filter(|op| op.is_valid()).cloned()
    }

    /// Store a peer's key.
    pub fn insert(&self, peer: impl Into<String>, key: Arc<dyn EncryptionOperator>) {
        if let Ok(mut keys) = self.keys.write() {
            keys.insert(peer.into(), key);
        }
    }

    /// Forget a peer's key.
    pub fn invalidate(&self, peer: &str) {
        if let Ok(mut keys) = self.keys.write() {
            keys.remove(peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ECIES_CODE;

    #[test]
    fn test_mint_on_first_use_and_reuse() {
        let ring = KeyRing::new(OperatorRegistry::with_defaults(), ECIES_CODE, 60);
        let first = ring.current().unwrap();
        let second = ring.current().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.kind(), OperatorKind::Asymmetric);
    }

    #[test]
    fn test_rotation_on_expiry_keeps_previous_for_decrypt() {
        let ring = KeyRing::new(OperatorRegistry::with_defaults(), ECIES_CODE, 0);
        let old = ring.current().unwrap();
        assert!(!old.is_valid());
        let sealed = old.encrypt(b"sealed before rotation").unwrap();

        let new = ring.current().unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(ring.decrypt(&sealed).unwrap(), b"sealed before rotation");
    }

    #[test]
    fn test_symmetric_code_rejected() {
        let ring = KeyRing::new(OperatorRegistry::with_defaults(), "aes", 60);
        assert_eq!(
            ring.current().unwrap_err(),
            CryptoError::WrongKind("aes".to_string())
        );
    }

    #[test]
    fn test_decrypt_before_mint() {
        let ring = KeyRing::new(OperatorRegistry::with_defaults(), ECIES_CODE, 60);
        assert_eq!(ring.decrypt(b"x"), Err(CryptoError::MissingPrivateKey));
    }

    #[test]
    fn test_peer_cache_skips_expired() {
        let registry = OperatorRegistry::with_defaults();
        let cache = PeerKeyCache::new();
        let fresh: Arc<dyn EncryptionOperator> = Arc::from(registry.instantiate(ECIES_CODE, 60).unwrap());
        let stale: Arc<dyn EncryptionOperator> = Arc::from(registry.instantiate(ECIES_CODE, -5).unwrap());

        cache.insert("./a", fresh);
        cache.insert("./b", stale);
        assert!(cache.get_valid("./a").is_some());
        assert!(cache.get_valid("./b").is_none());

        cache.invalidate("./a");
        assert!(cache.get_valid("./a").is_none());
    }
}
