//! Wire query: an ordered set of named parts with an optional encryption
//! envelope.
//!
//! Part names compare case-insensitively; a part without a value acts as a
//! boolean flag. While a query is sealed its parts live inside the
//! envelope ciphertext and [`Query::parts`] is empty.

mod codec;

use std::fmt;

use thiserror::Error;

use crate::secrets::is_secret_part;

pub use codec::{HEADER_LEN, MAGIC, VERSION};

/// Query errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Bytes did not decode into a query.
    #[error("Malformed query: {0}")]
    Malformed(String),

    /// Serialization failed.
    #[error("Encode error: {0}")]
    Encode(String),
}

/// Well-known part names.
pub mod names {
    /// Primary verb.
    pub const Q: &str = "q";
    /// Secondary verb.
    pub const SQ: &str = "sq";
    /// Public key material (hex).
    pub const PK: &str = "pk";
    /// Expiry timestamp (RFC 3339).
    pub const EXPIRE: &str = "expire";
    /// Operator code accompanying key material.
    pub const OPERATOR: &str = "operator";
    /// Requester's reply public key (hex).
    pub const REPLY_KEY: &str = "rpk";
    /// Operator code of the reply key.
    pub const REPLY_OPERATOR: &str = "rpkop";
    /// Expiry of the reply key (RFC 3339).
    pub const REPLY_EXPIRE: &str = "rpkexp";
    /// Logical name of the original requester.
    pub const FROM: &str = "from";
    /// Exchange correlation identifier.
    pub const EXCHANGE: &str = "exchange";
    /// Number of relays the query has passed through.
    pub const HOPS: &str = "hops";
    /// Pipe name a relayed answer can be collected from.
    pub const PICKUP: &str = "pickup";
    /// Error reason code.
    pub const REASON: &str = "reason";
    /// Human readable error detail.
    pub const DETAIL: &str = "detail";
    /// Logon user name.
    pub const USER: &str = "user";
    /// Logon password.
    pub const PASSWORD: &str = "password";
    /// Logon domain.
    pub const DOMAIN: &str = "domain";
    /// Guest access token.
    pub const TOKEN: &str = "token";
}

/// Well-known verbs.
pub mod verbs {
    /// Fetch something.
    pub const GET: &str = "GET";
    /// Public key sub-verb.
    pub const PUBLICKEY: &str = "PUBLICKEY";
    /// Positive answer without content.
    pub const ACK: &str = "ACK";
    /// Error answer.
    pub const ERROR: &str = "ERROR";
    /// The request was forwarded; collect the answer at `pickup`.
    pub const RELAYED: &str = "RELAYED";
    /// Liveness probe.
    pub const PING: &str = "PING";
    /// Liveness answer.
    pub const PONG: &str = "PONG";
}

/// Error reason codes carried by error answers.
pub mod reasons {
    /// Envelope could not be opened.
    pub const HANDSHAKE: &str = "handshake";
    /// No handler and no route.
    pub const NO_HANDLER: &str = "no-handler";
    /// Handler failed.
    pub const HANDLER: &str = "handler";
    /// Forwarding failed.
    pub const RELAY: &str = "relay";
    /// Too many relay hops.
    pub const HOPS: &str = "hops";
}

/// One named part of a query.
#[derive(Clone, PartialEq, Eq)]
pub struct Part {
    /// Part name (case-insensitive).
    pub name: String,
    /// Optional value; `None` makes the part a flag.
    pub value: Option<String>,
}

impl Part {
    /// Create a part with a value.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    /// Create a flag part.
    #[must_use]
    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    /// Parse `name=value` or a bare `name`.
    #[must_use]
    pub fn parse(token: &str) -> Self {
        match token.split_once('=') {
            Some((name, value)) => Self::new(name.trim(), value),
            None => Self::flag(token.trim()),
        }
    }

    /// Case-insensitive name comparison.
    #[must_use]
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

impl fmt::Display for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(_) if is_secret_part(&self.name) => write!(f, "{}=[REDACTED]", self.name),
            Some(value) => write!(f, "{}={value}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl fmt::Debug for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Encryption metadata attached to a sealed query.
#[derive(Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Code of the symmetric operator that sealed the payload.
    pub operator: String,
    /// Symmetric key material wrapped with the receiver's public key.
    pub encrypted_key: Vec<u8>,
    /// Encrypted, encoded parts.
    pub ciphertext: Vec<u8>,
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("operator", &self.operator)
            .field("encrypted_key_len", &self.encrypted_key.len())
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

/// Correlation identifiers of a duplex exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Correlation {
    /// Logical name of the requester.
    pub from: String,
    /// Exchange identifier.
    pub exchange: String,
}

/// A structured message exchanged between processes.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Query {
    parts: Vec<Part>,
    envelope: Option<Envelope>,
}

impl Query {
    /// Create an empty query.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a query whose primary verb is `verb`.
    #[must_use]
    pub fn verb(verb: impl Into<String>) -> Self {
        Self::new().with(names::Q, verb)
    }

    /// Build a query from `name=value` / `name` tokens.
    #[must_use]
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            parts: tokens
                .into_iter()
                .map(|t| Part::parse(t.as_ref()))
                .filter(|p| !p.name.is_empty())
                .collect(),
            envelope: None,
        }
    }

    /// Build a plain query from parts.
    #[must_use]
    pub fn from_parts(parts: Vec<Part>) -> Self {
        Self {
            parts,
            envelope: None,
        }
    }

    /// Append a valued part.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(Part::new(name, value));
        self
    }

    /// Append a flag part.
    #[must_use]
    pub fn with_flag(mut self, name: impl Into<String>) -> Self {
        self.parts.push(Part::flag(name));
        self
    }

    /// Append a part.
    pub fn push(&mut self, part: Part) {
        self.parts.push(part);
    }

    /// Set the value of the first part named `name`, appending if absent.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.parts.iter_mut().find(|p| p.is_named(name)) {
            Some(part) => part.value = Some(value),
            None => self.parts.push(Part::new(name, value)),
        }
    }

    /// Remove every part named `name`. Returns whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.parts.len();
        self.parts.retain(|p| !p.is_named(name));
        before != self.parts.len()
    }

    /// First part named `name` (case-insensitive).
    #[must_use]
    pub fn try_get_part(&self, name: &str) -> Option<&Part> {
        self.parts.iter().find(|p| p.is_named(name))
    }

    /// Value of the first part named `name`.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&str> {
        self.try_get_part(name).and_then(|p| p.value.as_deref())
    }

    /// Whether a part named `name` exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.try_get_part(name).is_some()
    }

    /// Whether the primary verb equals `verb` (case-insensitive).
    #[must_use]
    pub fn is_verb(&self, verb: &str) -> bool {
        self.value(names::Q)
            .is_some_and(|v| v.eq_ignore_ascii_case(verb))
    }

    /// All parts in order.
    #[must_use]
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Whether the query has no parts and no envelope.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty() && self.envelope.is_none()
    }

    /// The encryption envelope, if sealed.
    #[must_use]
    pub fn envelope(&self) -> Option<&Envelope> {
        self.envelope.as_ref()
    }

    /// Whether the payload is currently encrypted.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.envelope.is_some()
    }

    /// Replace the parts with an envelope.
    pub(crate) fn seal_with(&mut self, envelope: Envelope) {
        self.parts.clear();
        self.envelope = Some(envelope);
    }

    /// Strip the envelope, restoring decrypted parts.
    pub(crate) fn open_with(&mut self, parts: Vec<Part>) {
        self.parts = parts;
        self.envelope = None;
    }

    /// Correlation identifiers, when both `from` and `exchange` are present.
    #[must_use]
    pub fn correlation(&self) -> Option<Correlation> {
        Some(Correlation {
            from: self.value(names::FROM)?.to_string(),
            exchange: self.value(names::EXCHANGE)?.to_string(),
        })
    }

    /// Relay hop count (0 when absent or unparsable).
    #[must_use]
    pub fn hops(&self) -> u32 {
        self.value(names::HOPS)
            .and_then(|h| h.parse().ok())
            .unwrap_or(0)
    }

    /// Positive answer without content.
    #[must_use]
    pub fn ack() -> Self {
        Self::verb(verbs::ACK)
    }

    /// Error answer.
    #[must_use]
    pub fn error(reason: &str, detail: impl Into<String>) -> Self {
        Self::verb(verbs::ERROR)
            .with(names::REASON, reason)
            .with(names::DETAIL, detail)
    }

    /// Whether this is an error answer.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.is_verb(verbs::ERROR)
    }

    /// Serialize to bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the archive serializer fails.
    pub fn encode(&self) -> Result<Vec<u8>, QueryError> {
        codec::encode(self)
    }

    /// Deserialize from bytes.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::Malformed` for unknown or truncated input; no
    /// partial query is ever produced.
    pub fn decode(bytes: &[u8]) -> Result<Self, QueryError> {
        codec::decode(bytes)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(envelope) = &self.envelope {
            return write!(f, "<sealed:{} {} bytes>", envelope.operator, envelope.ciphertext.len());
        }
        let rendered: Vec<String> = self.parts.iter().map(ToString::to_string).collect();
        write!(f, "{{{}}}", rendered.join(", "))
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("parts", &self.parts)
            .field("envelope", &self.envelope)
            .finish()
    }
}

/// Generate a random exchange identifier (UUID v4 layout).
#[must_use]
pub fn new_exchange_id() -> String {
    let bytes: [u8; 16] = rand::random();
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        bytes[0],
        bytes[1],
        bytes[2],
        bytes[3],
        bytes[4],
        bytes[5],
        (bytes[6] & 0x0f) | 0x40,
        bytes[7],
        (bytes[8] & 0x3f) | 0x80,
        bytes[9],
        bytes[10],
        bytes[11],
        bytes[12],
        bytes[13],
        bytes[14],
        bytes[15]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_get_part_case_insensitive() {
        let query = Query::verb("GET").with("SQ", "first").with("sq", "second");

        let part = query.try_get_part("sq").unwrap();
        assert_eq!(part.value.as_deref(), Some("first"));
        assert_eq!(query.value("Q"), Some("GET"));
        assert!(query.try_get_part("missing").is_none());
    }

    #[test]
    fn test_flags_and_tokens() {
        let query = Query::from_tokens(["q=GET", "publickey", "note=a=b", ""]);

        assert_eq!(query.parts().len(), 3);
        assert!(query.contains("PublicKey"));
        assert_eq!(query.value("publickey"), None);
        assert_eq!(query.value("note"), Some("a=b"));
    }

    #[test]
    fn test_set_and_remove() {
        let mut query = Query::verb("PING").with("hops", "1");
        query.set("HOPS", "2");
        assert_eq!(query.hops(), 2);

        query.set("from", "client");
        assert_eq!(query.value("from"), Some("client"));

        assert!(query.remove("hops"));
        assert!(!query.remove("hops"));
        assert_eq!(query.hops(), 0);
    }

    #[test]
    fn test_correlation_requires_both_parts() {
        let query = Query::verb("GET").with(names::FROM, "a");
        assert!(query.correlation().is_none());

        let query = query.with(names::EXCHANGE, "x1");
        let correlation = query.correlation().unwrap();
        assert_eq!(correlation.from, "a");
        assert_eq!(correlation.exchange, "x1");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let query = Query::verb("LOGON").with("user", "alice").with("password", "s3cret");
        let rendered = format!("{query:?} {query}");

        assert!(rendered.contains("user=alice"));
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("password=[REDACTED]"));
    }

    #[test]
    fn test_error_answer() {
        let answer = Query::error(reasons::NO_HANDLER, "nothing here");
        assert!(answer.is_error());
        assert_eq!(answer.value(names::REASON), Some("no-handler"));
        assert!(!Query::ack().is_error());
    }

    #[test]
    fn test_exchange_id_shape() {
        let id = new_exchange_id();
        assert_eq!(id.len(), 36);
        assert_ne!(id, new_exchange_id());
    }
}
