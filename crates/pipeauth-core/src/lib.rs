//! # pipeauth Core
//!
//! Core types, encryption and routing for pipeauth.
//!
//! This crate provides:
//! - The wire `Query` and its binary codec
//! - Encryption operators, the process key ring and the hybrid handshake
//! - The routing pattern language, instructions and table
//! - Configuration loading and validation (JSON5 format)
//! - Secret handling that keeps credentials out of logs

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod crypto;
pub mod query;
pub mod routing;
pub mod secrets;
pub mod types;

pub use config::{Config, ConfigError};
pub use crypto::{CryptoError, EncryptionOperator, KeyRing, OperatorRegistry, PeerKeyCache};
pub use query::{Part, Query, QueryError};
pub use routing::{Instruction, RoutingError, RoutingTable};
pub use secrets::Secret;
pub use types::{Destination, SecurityLevel};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::crypto::{EncryptionOperator, KeyRing, OperatorRegistry};
    pub use crate::query::{Part, Query};
    pub use crate::routing::{Instruction, RoutingTable};
    pub use crate::types::*;
}
