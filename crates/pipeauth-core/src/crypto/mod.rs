//! Encryption operators and the two-tier handshake.
//!
//! - `EncryptionOperator`: encrypt/decrypt capability with shareable key material
//! - `OperatorRegistry`: maps short codes (`"aes"`, `"ecies"`) to factories
//! - `KeyRing`: the process-wide asymmetric key pair
//! - `PeerKeyCache`: remote public keys by destination
//! - `handshake`: asymmetric-wraps-symmetric sealing of queries

mod aes;
mod ecies;
pub mod handshake;
mod keyring;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub use aes::{AES_CODE, AesOperator};
pub use ecies::{ECIES_CODE, EciesOperator};
pub use keyring::{KeyRing, PeerKeyCache};

/// Errors from encryption operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// No operator registered under this code.
    #[error("Unknown operator: {0}")]
    UnknownOperator(String),

    /// Encryption failed.
    #[error("Encryption failed: {0}")]
    Encrypt(String),

    /// Decryption failed.
    #[error("Decryption failed: {0}")]
    Decrypt(String),

    /// Key material could not be parsed.
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// Operator holds only the public half.
    #[error("Operator has no private key")]
    MissingPrivateKey,

    /// Operator is past its expiry time.
    #[error("Operator '{0}' has expired")]
    Expired(String),

    /// Operator of the wrong kind for this step.
    #[error("Operator '{0}' has the wrong kind for this step")]
    WrongKind(String),

    /// Query could not be encoded or decoded around encryption.
    #[error("Payload error: {0}")]
    Payload(String),
}

/// Operator kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorKind {
    /// Long-lived key pair; only wraps symmetric keys.
    Asymmetric,
    /// Short-lived key; wraps payloads.
    Symmetric,
}

/// An encrypt/decrypt capability with shareable key material.
pub trait EncryptionOperator: Send + Sync {
    /// Registry code.
    fn code(&self) -> &str;

    /// Operator kind.
    fn kind(&self) -> OperatorKind;

    /// Encrypt bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the cipher fails.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the cipher fails or no private key is held.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Key material safe to hand to the peer: the whole key for symmetric
    /// operators, the public half for asymmetric ones.
    fn sharable_data(&self) -> Vec<u8>;

    /// Time after which the operator must not be used for new encryptions.
    fn expiry_time(&self) -> DateTime<Utc>;

    /// Whether the operator may still be used for new encryptions.
    fn is_valid(&self) -> bool {
        Utc::now() < self.expiry_time()
    }
}

impl fmt::Debug for dyn EncryptionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionOperator")
            .field("code", &self.code())
            .field("kind", &self.kind())
            .field("expires", &self.expiry_time())
            .finish()
    }
}

/// Source of key material handed to an operator factory.
#[derive(Debug, Clone, Copy)]
pub enum KeyMaterial<'a> {
    /// Mint a fresh key, valid for the given number of seconds.
    Fresh {
        /// Lifetime in seconds.
        lifetime_secs: i64,
    },
    /// Rebuild from shared material received from a peer.
    Shared {
        /// The peer's sharable data.
        data: &'a [u8],
        /// Expiry announced with it.
        expires: DateTime<Utc>,
    },
}

/// Builds an operator from key material.
pub type OperatorFactory =
    Arc<dyn Fn(KeyMaterial<'_>) -> Result<Box<dyn EncryptionOperator>, CryptoError> + Send + Sync>;

/// Registry of operator factories by code.
#[derive(Clone, Default)]
pub struct OperatorRegistry {
    factories: HashMap<String, OperatorFactory>,
}

impl OperatorRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `aes` and `ecies` operators.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(AES_CODE, |material| {
            AesOperator::from_material(material).map(|op| Box::new(op) as Box<dyn EncryptionOperator>)
        });
        registry.register(ECIES_CODE, |material| {
            EciesOperator::from_material(material)
                .map(|op| Box::new(op) as Box<dyn EncryptionOperator>)
        });
        registry
    }

    /// Register a factory. Codes are case-insensitive; re-registering replaces.
    pub fn register<F>(&mut self, code: &str, factory: F)
    where
        F: Fn(KeyMaterial<'_>) -> Result<Box<dyn EncryptionOperator>, CryptoError>
            + Send
            + Sync
            + 'static,
    {
        self.factories
            .insert(code.to_ascii_lowercase(), Arc::new(factory));
    }

    /// Whether a code is registered.
    #[must_use]
    pub fn contains(&self, code: &str) -> bool {
        self.factories.contains_key(&code.to_ascii_lowercase())
    }

    /// Registered codes.
    #[must_use]
    pub fn codes(&self) -> Vec<&str> {
        let mut codes: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        codes.sort_unstable();
        codes
    }

    /// Mint a fresh operator.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::UnknownOperator` if the code is not registered.
    pub fn instantiate(
        &self,
        code: &str,
        lifetime_secs: i64,
    ) -> Result<Box<dyn EncryptionOperator>, CryptoError> {
        self.build(code, KeyMaterial::Fresh { lifetime_secs })
    }

    /// Rebuild an operator from a peer's sharable data.
    ///
    /// # Errors
    ///
    /// Returns error if the code is unknown or the material is invalid.
    pub fn restore(
        &self,
        code: &str,
        data: &[u8],
        expires: DateTime<Utc>,
    ) -> Result<Box<dyn EncryptionOperator>, CryptoError> {
        self.build(code, KeyMaterial::Shared { data, expires })
    }

    fn build(
        &self,
        code: &str,
        material: KeyMaterial<'_>,
    ) -> Result<Box<dyn EncryptionOperator>, CryptoError> {
        let factory = self
            .factories
            .get(&code.to_ascii_lowercase())
            .ok_or_else(|| CryptoError::UnknownOperator(code.to_string()))?;
        factory(material)
    }
}

impl fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorRegistry")
            .field("codes", &self.codes())
            .finish()
    }
}

pub(crate) fn expiry_after(lifetime_secs: i64) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::seconds(lifetime_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_defaults() {
        let registry = OperatorRegistry::with_defaults();
        assert_eq!(registry.codes(), vec!["aes", "ecies"]);
        assert!(registry.contains("AES"));

        let op = registry.instantiate("aes", 60).unwrap();
        assert_eq!(op.kind(), OperatorKind::Symmetric);
        let op = registry.instantiate("ECIES", 60).unwrap();
        assert_eq!(op.kind(), OperatorKind::Asymmetric);
    }

    #[test]
    fn test_unknown_operator() {
        let registry = OperatorRegistry::with_defaults();
        let err = registry.instantiate("rot13", 60).unwrap_err();
        assert_eq!(err, CryptoError::UnknownOperator("rot13".to_string()));
        // Registry still usable after a miss.
        assert!(registry.instantiate("aes", 60).is_ok());
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = OperatorRegistry::new();
        registry.register("alias", |material| {
            AesOperator::from_material(material).map(|op| Box::new(op) as Box<dyn EncryptionOperator>)
        });
        assert!(registry.instantiate("alias", 60).is_ok());
        assert!(registry.instantiate("aes", 60).is_err());
    }

    #[test]
    fn test_expired_operator_invalid() {
        let registry = OperatorRegistry::with_defaults();
        let op = registry.instantiate("ecies", -1).unwrap();
        assert!(!op.is_valid());
        let op = registry.instantiate("ecies", 60).unwrap();
        assert!(op.is_valid());
    }
}
