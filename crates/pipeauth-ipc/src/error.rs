//! Transport errors.

use std::time::Duration;

use pipeauth_core::query::names;
use pipeauth_core::{CryptoError, Query, QueryError};
use thiserror::Error;

/// Transport errors.
///
/// Every variant is scoped to one connection or one exchange; none of them
/// takes down an endpoint's accept loop or another line.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Bytes did not decode into a query.
    #[error("Malformed query: {0}")]
    MalformedQuery(#[from] QueryError),

    /// Envelope names an operator this process does not know.
    #[error("Unknown operator: {0}")]
    UnknownOperator(String),

    /// Sealing or opening failed with a real envelope present.
    #[error("Handshake failed: {0}")]
    Handshake(CryptoError),

    /// The endpoint does not exist yet; retry later.
    #[error("Endpoint unavailable: {0}")]
    EndpointUnavailable(String),

    /// A connection exceeded its session budget.
    #[error("Session exceeded its {0:?} budget")]
    SessionTimeout(Duration),

    /// Pipe I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame header announced more than the frame limit.
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Frame of the wrong kind at this point of the exchange.
    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),

    /// The peer answered with an error query.
    #[error("Remote error ({reason}): {detail}")]
    Remote {
        /// Reason code.
        reason: String,
        /// Human readable detail.
        detail: String,
    },

    /// The peer closed without answering, or the answer timed out.
    #[error("No answer received")]
    NoAnswer,

    /// Shutdown was requested while waiting.
    #[error("Operation cancelled")]
    Cancelled,

    /// The line or endpoint was closed.
    #[error("Closed")]
    Closed,

    /// Another process already serves this endpoint.
    #[error("Endpoint already in use: {0}")]
    EndpointInUse(String),

    /// Host cannot be reached with this platform's pipes.
    #[error("Unsupported host: {0}")]
    UnsupportedHost(String),

    /// A handler failed.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Service could not be built from its configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TransportError {
    /// Whether the operation should be retried after the line's retry
    /// interval.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::EndpointUnavailable(_))
    }

    /// Lift an error answer into [`TransportError::Remote`].
    #[must_use]
    pub fn remote(answer: &Query) -> Self {
        Self::Remote {
            reason: answer.value(names::REASON).unwrap_or_default().to_string(),
            detail: answer.value(names::DETAIL).unwrap_or_default().to_string(),
        }
    }
}

impl From<CryptoError> for TransportError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::UnknownOperator(code) => Self::UnknownOperator(code),
            other => Self::Handshake(other),
        }
    }
}
