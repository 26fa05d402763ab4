//! AES-256-GCM symmetric operator.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretBox};

use super::{CryptoError, EncryptionOperator, KeyMaterial, OperatorKind, expiry_after};

/// Registry code of the AES operator.
pub const AES_CODE: &str = "aes";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Symmetric operator minted per exchange.
///
/// Ciphertext layout: 12-byte random nonce followed by the GCM output.
pub struct AesOperator {
    key: SecretBox<[u8; KEY_LEN]>,
    expires: DateTime<Utc>,
}

impl AesOperator {
    /// Mint a fresh random key.
    #[must_use]
    pub fn generate(lifetime_secs: i64) -> Self {
        Self {
            key: SecretBox::new(Box::new(rand::random())),
            expires: expiry_after(lifetime_secs),
        }
    }

    /// Rebuild from raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if the key is not 32 bytes.
    pub fn from_key(key: &[u8], expires: DateTime<Utc>) -> Result<Self, CryptoError> {
        let key: [u8; KEY_LEN] = key
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("aes key must be {KEY_LEN} bytes, got {}", key.len())))?;
        Ok(Self {
            key: SecretBox::new(Box::new(key)),
            expires,
        })
    }

    pub(super) fn from_material(material: KeyMaterial<'_>) -> Result<Self, CryptoError> {
        match material {
            KeyMaterial::Fresh { lifetime_secs } => Ok(Self::generate(lifetime_secs)),
            KeyMaterial::Shared { data, expires } => Self::from_key(data, expires),
        }
    }

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(self.key.expose_secret())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }
}

impl EncryptionOperator for AesOperator {
    fn code(&self) -> &str {
        AES_CODE
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Symmetric
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        Ok([nonce_bytes.as_slice(), &ciphertext].concat())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < NONCE_LEN {
            return Err(CryptoError::Decrypt("Data too short".to_string()));
        }

        let (nonce_bytes, body) = ciphertext.split_at(NONCE_LEN);
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce_bytes), body)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))
    }

    fn sharable_data(&self) -> Vec<u8> {
        self.key.expose_secret().to_vec()
    }

    fn expiry_time(&self) -> DateTime<Utc> {
        self.expires
    }
}
