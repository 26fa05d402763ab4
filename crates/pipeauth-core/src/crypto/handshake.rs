//! Two-tier hybrid handshake.
//!
//! The sender mints a symmetric operator, encrypts the encoded parts with
//! it, wraps the symmetric key with the receiver's public key and attaches
//! both as the envelope. The receiver unwraps the key with its private key,
//! decrypts the parts and strips the envelope. Whoever holds the
//! counterpart's public key decides the direction: a requester that wants a
//! sealed answer sends its own public key along (`rpk`).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use zeroize::Zeroize;

use super::{CryptoError, EncryptionOperator, KeyRing, OperatorKind, OperatorRegistry};
use crate::query::{Envelope, Query, names, verbs};

/// Seal `query` for the holder of `recipient`'s private key.
///
/// A query that is already sealed is left untouched.
///
/// # Errors
///
/// Returns error if `recipient` is expired or not asymmetric, the symmetric
/// code is unknown, or a cipher fails. The query is unchanged on error.
pub fn seal(
    query: &mut Query,
    recipient: &dyn EncryptionOperator,
    registry: &OperatorRegistry,
    symmetric_code: &str,
    symmetric_lifetime_secs: i64,
) -> Result<(), CryptoError> {
    if query.is_sealed() {
        return Ok(());
    }
    if recipient.kind() != OperatorKind::Asymmetric {
        return Err(CryptoError::WrongKind(recipient.code().to_string()));
    }
    if !recipient.is_valid() {
        return Err(CryptoError::Expired(recipient.code().to_string()));
    }

    let symmetric = registry.instantiate(symmetric_code, symmetric_lifetime_secs)?;
    if symmetric.kind() != OperatorKind::Symmetric {
        return Err(CryptoError::WrongKind(symmetric_code.to_string()));
    }

    let payload = Query::from_parts(query.parts().to_vec())
        .encode()
        .map_err(|e| CryptoError::Payload(e.to_string()))?;
    let ciphertext = symmetric.encrypt(&payload)?;

    let mut key = symmetric.sharable_data();
    let encrypted_key = recipient.encrypt(&key);
    key.zeroize();

    query.seal_with(Envelope {
        operator: symmetric.code().to_string(),
        encrypted_key: encrypted_key?,
        ciphertext,
    });
    Ok(())
}

/// Open a sealed query with the local key ring.
///
/// Returns `Ok(false)` for plaintext queries, which are left as received.
///
/// # Errors
///
/// Returns error when an envelope is present but cannot be opened; the
/// query keeps its envelope in that case.
pub fn open(
    query: &mut Query,
    keyring: &KeyRing,
    registry: &OperatorRegistry,
) -> Result<bool, CryptoError> {
    open_using(query, registry, |wrapped| keyring.decrypt(wrapped))
}

/// Open a sealed query with an explicit private key operator.
///
/// # Errors
///
/// See [`open`].
pub fn open_with(
    query: &mut Query,
    private: &dyn EncryptionOperator,
    registry: &OperatorRegistry,
) -> Result<bool, CryptoError> {
    open_using(query, registry, |wrapped| private.decrypt(wrapped))
}

fn open_using<F>(query: &mut Query, registry: &OperatorRegistry, unwrap_key: F) -> Result<bool, CryptoError>
where
    F: Fn(&[u8]) -> Result<Vec<u8>, CryptoError>,
{
    let Some(envelope) = query.envelope() else {
        return Ok(false);
    };

    let mut key = unwrap_key(&envelope.encrypted_key)?;
    let symmetric = registry.restore(&envelope.operator, &key, Utc::now());
    key.zeroize();
    let symmetric = symmetric?;
    if symmetric.kind() != OperatorKind::Symmetric {
        return Err(CryptoError::WrongKind(envelope.operator.clone()));
    }

    let mut plain = symmetric.decrypt(&envelope.ciphertext)?;
    let inner = Query::decode(&plain).map_err(|e| CryptoError::Payload(e.to_string()));
    plain.zeroize();
    let inner = inner?;
    if inner.is_sealed() {
        return Err(CryptoError::Payload("nested envelope".to_string()));
    }

    query.open_with(inner.parts().to_vec());
    Ok(true)
}

/// The well-known public key request `{q=GET, sq=PUBLICKEY}`.
#[must_use]
pub fn public_key_request() -> Query {
    Query::verb(verbs::GET).with(names::SQ, verbs::PUBLICKEY)
}

/// Whether `query` asks for the public key.
#[must_use]
pub fn is_public_key_request(query: &Query) -> bool {
    query.is_verb(verbs::GET)
        && query
            .value(names::SQ)
            .is_some_and(|sq| sq.eq_ignore_ascii_case(verbs::PUBLICKEY))
}

/// Answer `{pk, expire, operator}` announcing `key`'s public half.
#[must_use]
pub fn public_key_answer(key: &dyn EncryptionOperator) -> Query {
    Query::new()
        .with(names::PK, hex::encode(key.sharable_data()))
        .with(names::EXPIRE, key.expiry_time().to_rfc3339())
        .with(names::OPERATOR, key.code())
}

/// Rebuild the peer's public key from a public key answer.
///
/// # Errors
///
/// Returns error if parts are missing or malformed, the operator is
/// unknown, or the announced key has already expired.
pub fn parse_public_key_answer(
    answer: &Query,
    registry: &OperatorRegistry,
) -> Result<Arc<dyn EncryptionOperator>, CryptoError> {
    restore_announced(answer, registry, names::PK, names::OPERATOR, names::EXPIRE)?
        .ok_or_else(|| CryptoError::InvalidKey("answer carries no public key".to_string()))
}

/// Attach `key`'s public half as the reply key of a request.
pub fn attach_reply_key(query: &mut Query, key: &dyn EncryptionOperator) {
    query.set(names::REPLY_KEY, hex::encode(key.sharable_data()));
    query.set(names::REPLY_OPERATOR, key.code());
    query.set(names::REPLY_EXPIRE, key.expiry_time().to_rfc3339());
}

/// The requester's reply key, if the request carried one.
///
/// # Errors
///
/// Returns error if the reply key parts are present but invalid.
pub fn reply_key(
    query: &Query,
    registry: &OperatorRegistry,
) -> Result<Option<Arc<dyn EncryptionOperator>>, CryptoError> {
    restore_announced(
        query,
        registry,
        names::REPLY_KEY,
        names::REPLY_OPERATOR,
        names::REPLY_EXPIRE,
    )
}

/// Remove reply key parts.
pub fn strip_reply_key(query: &mut Query) {
    query.remove(names::REPLY_KEY);
    query.remove(names::REPLY_OPERATOR);
    query.remove(names::REPLY_EXPIRE);
}

fn restore_announced(
    query: &Query,
    registry: &OperatorRegistry,
    key_part: &str,
    operator_part: &str,
    expire_part: &str,
) -> Result<Option<Arc<dyn EncryptionOperator>>, CryptoError> {
    let Some(encoded) = query.value(key_part) else {
        return Ok(None);
    };
    let operator = query
        .value(operator_part)
        .ok_or_else(|| CryptoError::InvalidKey(format!("missing '{operator_part}'")))?;
    let expires = query
        .value(expire_part)
        .ok_or_else(|| CryptoError::InvalidKey(format!("missing '{expire_part}'")))
        .and_then(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| CryptoError::InvalidKey(format!("bad '{expire_part}': {e}")))
        })?;
    let data = hex::decode(encoded)
        .map_err(|e| CryptoError::InvalidKey(format!("bad '{key_part}': {e}")))?;

    let key: Arc<dyn EncryptionOperator> = Arc::from(registry.restore(operator, &data, expires)?);
    if key.kind() != OperatorKind::Asymmetric {
        return Err(CryptoError::WrongKind(operator.to_string()));
    }
    if !key.is_valid() {
        return Err(CryptoError::Expired(operator.to_string()));
    }
    Ok(Some(key))
}
