//! secp256k1 ECIES asymmetric operator.
//!
//! Encryption runs an ephemeral ECDH against the recipient's public key,
//! hashes the shared secret together with the ephemeral public key into an
//! AES-256-GCM key, and seals the plaintext with it.
//!
//! Ciphertext layout: `[u8 eph_len][ephemeral SEC1 key][12-byte nonce][GCM output]`.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use chrono::{DateTime, Utc};
use k256::ecdh::{EphemeralSecret, SharedSecret, diffie_hellman};
use k256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use super::{CryptoError, EncryptionOperator, KeyMaterial, OperatorKind, expiry_after};

/// Registry code of the ECIES operator.
pub const ECIES_CODE: &str = "ecies";

const NONCE_LEN: usize = 12;
const KDF_LABEL: &[u8] = b"pipeauth-ecies-v1";

/// Long-lived key pair, or a peer's public half.
pub struct EciesOperator {
    secret: Option<SecretKey>,
    public: PublicKey,
    expires: DateTime<Utc>,
}

impl EciesOperator {
    /// Mint a fresh key pair.
    #[must_use]
    pub fn generate(lifetime_secs: i64) -> Self {
        let secret = SecretKey::random(&mut OsRng);
        Self {
            public: secret.public_key(),
            secret: Some(secret),
            expires: expiry_after(lifetime_secs),
        }
    }

    /// Rebuild a public-only operator from SEC1 bytes.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if the bytes are not a valid point.
    pub fn from_public(bytes: &[u8], expires: DateTime<Utc>) -> Result<Self, CryptoError> {
        let public =
            PublicKey::from_sec1_bytes(bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self {
            secret: None,
            public,
            expires,
        })
    }

    pub(super) fn from_material(material: KeyMaterial<'_>) -> Result<Self, CryptoError> {
        match material {
            KeyMaterial::Fresh { lifetime_secs } => Ok(Self::generate(lifetime_secs)),
            KeyMaterial::Shared { data, expires } => Self::from_public(data, expires),
        }
    }

    /// Whether the private half is held.
    #[must_use]
    pub const fn has_private_key(&self) -> bool {
        self.secret.is_some()
    }

    fn derive_cipher(shared: &SharedSecret, ephemeral: &[u8]) -> Result<Aes256Gcm, CryptoError> {
        let mut hasher = Sha256::new();
        hasher.update(KDF_LABEL);
        hasher.update(shared.raw_secret_bytes());
        hasher.update(ephemeral);
        let key = hasher.finalize();
        Aes256Gcm::new_from_slice(&key).map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }
}

impl EncryptionOperator for EciesOperator {
    fn code(&self) -> &str {
        ECIES_CODE
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Asymmetric
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let ephemeral = EphemeralSecret::random(&mut OsRng);
        let ephemeral_public = ephemeral.public_key().to_sec1_bytes();
        let shared = ephemeral.diffie_hellman(&self.public);

        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = Self::derive_cipher(&shared, &ephemeral_public)?
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        let eph_len = u8::try_from(ephemeral_public.len())
            .map_err(|_| CryptoError::Encrypt("ephemeral key too long".to_string()))?;
        let mut out = Vec::with_capacity(1 + ephemeral_public.len() + NONCE_LEN + ciphertext.len());
        out.push(eph_len);
        out.extend_from_slice(&ephemeral_public);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let secret = self.secret.as_ref().ok_or(CryptoError::MissingPrivateKey)?;

        let (&eph_len, rest) = ciphertext
            .split_first()
            .ok_or_else(|| CryptoError::Decrypt("Data too short".to_string()))?;
        let eph_len = usize::from(eph_len);
        if rest.len() < eph_len + NONCE_LEN {
            return Err(CryptoError::Decrypt("Data too short".to_string()));
        }
        let (ephemeral_bytes, rest) = rest.split_at(eph_len);
        let (nonce_bytes, body) = rest.split_at(NONCE_LEN);

        let ephemeral = PublicKey::from_sec1_bytes(ephemeral_bytes)
            .map_err(|e| CryptoError::Decrypt(format!("bad ephemeral key: {e}")))?;
        let shared = diffie_hellman(secret.to_nonzero_scalar(), ephemeral.as_affine());

        Self::derive_cipher(&shared, ephemeral_bytes)?
            .decrypt(Nonce::from_slice(nonce_bytes), body)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))
    }

    fn sharable_data(&self) -> Vec<u8> {
        self.public.to_sec1_bytes().to_vec()
    }

    fn expiry_time(&self) -> DateTime<Utc> {
        self.expires
    }
}
