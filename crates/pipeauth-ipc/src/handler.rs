//! Dispatch handler contract and built-in handlers.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use pipeauth_core::KeyRing;
use pipeauth_core::crypto::handshake;
use pipeauth_core::query::{Correlation, Query, verbs};

use crate::transport::PeerInfo;

/// Handler execution errors.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The caller may not run this query.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Query parts are missing or invalid.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Execution failed.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

/// What the receiving endpoint knows about a query's sender.
#[derive(Debug, Clone)]
pub struct SenderInfo {
    /// Endpoint the query arrived on.
    pub endpoint: String,
    /// Peer process identity.
    pub peer: PeerInfo,
    /// Exchange correlation, for duplex requests.
    pub correlation: Option<Correlation>,
    /// Whether the query arrived sealed.
    pub encrypted: bool,
}

/// A handler for one family of queries.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    /// Handler name, for logs.
    fn name(&self) -> &str;

    /// Whether this handler executes `query`.
    fn is_target(&self, query: &Query) -> bool;

    /// Execute a decoded, decrypted query. `Ok(None)` answers duplex
    /// requests with an `ACK`.
    async fn execute(&self, sender: &SenderInfo, query: &Query) -> Result<Option<Query>, HandlerError>;

    /// Human readable description for the given culture key.
    fn description(&self, _culture: &str) -> String {
        self.name().to_string()
    }
}

/// Ordered handler registry; the first target wins.
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: Vec<Arc<dyn QueryHandler>>,
}

impl HandlerSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler after the existing ones.
    pub fn register(&mut self, handler: Arc<dyn QueryHandler>) {
        tracing::debug!(handler = handler.name(), "registered handler");
        self.handlers.push(handler);
    }

    /// The first handler targeting `query`.
    #[must_use]
    pub fn find(&self, query: &Query) -> Option<Arc<dyn QueryHandler>> {
        self.handlers.iter().find(|h| h.is_target(query)).cloned()
    }

    /// Handler names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Number of handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Answers `{q=GET, sq=PUBLICKEY}` with the current public key.
pub struct PublicKeyHandler {
    keyring: KeyRing,
}

impl PublicKeyHandler {
    /// Create a handler announcing keys from `keyring`.
    #[must_use]
    pub const fn new(keyring: KeyRing) -> Self {
        Self { keyring }
    }
}

#[async_trait]
impl QueryHandler for PublicKeyHandler {
    fn name(&self) -> &str {
        "publickey"
    }

    fn is_target(&self, query: &Query) -> bool {
        handshake::is_public_key_request(query)
    }

    async fn execute(&self, _sender: &SenderInfo, _query: &Query) -> Result<Option<Query>, HandlerError> {
        let key = self
            .keyring
            .current()
            .map_err(|e| HandlerError::ExecutionFailed(e.to_string()))?;
        Ok(Some(handshake::public_key_answer(key.as_ref())))
    }

    fn description(&self, _culture: &str) -> String {
        "Announces this endpoint's public key".to_string()
    }
}

/// Answers `{q=PING}` with `{q=PONG}`.
pub struct PingHandler;

#[async_trait]
impl QueryHandler for PingHandler {
    fn name(&self) -> &str {
        "ping"
    }

    fn is_target(&self, query: &Query) -> bool {
        query.is_verb(verbs::PING)
    }

    async fn execute(&self, _sender: &SenderInfo, _query: &Query) -> Result<Option<Query>, HandlerError> {
        Ok(Some(Query::verb(verbs::PONG)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeauth_core::OperatorRegistry;
    use pipeauth_core::crypto::ECIES_CODE;

    fn sender() -> SenderInfo {
        SenderInfo {
            endpoint: "test".to_string(),
            peer: PeerInfo::default(),
            correlation: None,
            encrypted: false,
        }
    }

    #[tokio::test]
    async fn test_first_target_wins() {
        let mut handlers = HandlerSet::new();
        handlers.register(Arc::new(PingHandler));
        handlers.register(Arc::new(PingHandler));
        assert_eq!(handlers.len(), 2);

        let handler = handlers.find(&Query::verb("ping")).unwrap();
        let answer = handler.execute(&sender(), &Query::verb("PING")).await.unwrap();
        assert!(answer.unwrap().is_verb("PONG"));
        assert!(handlers.find(&Query::verb("OTHER")).is_none());
    }

    #[tokio::test]
    async fn test_public_key_handler_announces_current_key() {
        let registry = OperatorRegistry::with_defaults();
        let ring = KeyRing::new(registry.clone(), ECIES_CODE, 3600);
        let handler = PublicKeyHandler::new(ring.clone());

        let request = handshake::public_key_request();
        assert!(handler.is_target(&request));

        let answer = handler.execute(&sender(), &request).await.unwrap().unwrap();
        let key = handshake::parse_public_key_answer(&answer, &registry).unwrap();
        assert_eq!(key.sharable_data(), ring.current().unwrap().sharable_data());
    }

    #[test]
    fn test_default_description_is_name() {
        assert_eq!(PingHandler.description("en-US"), "ping");
        assert!(
            PublicKeyHandler::new(KeyRing::new(OperatorRegistry::with_defaults(), ECIES_CODE, 60))
                .description("en-US")
                .contains("public key")
        );
    }
}
