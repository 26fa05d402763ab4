//! Configuration loading and validation.
//!
//! JSON5 format. Config location: `~/.pipeauth/pipeauth.json`, or
//! `$PIPEAUTH_STATE_DIR/pipeauth.json` when the variable is set.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::routing::{FullLogon, Instruction, RoutingError, RoutingTable};
use crate::secrets::Secret;
use crate::types::{Destination, LOCAL_HOST, SecurityLevel};

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON5 parsing error.
    #[error("Parse error: {0}")]
    Parse(#[from] json5::Error),

    /// Config validation error.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A route could not be turned into an instruction.
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Local endpoint served by this process.
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Outbound line behaviour.
    #[serde(default)]
    pub client: ClientConfig,

    /// Encryption operators and key lifetimes.
    #[serde(default)]
    pub crypto: CryptoConfig,

    /// Routing instructions, in match order.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    /// Directory holding endpoint socket files.
    #[serde(default)]
    pub runtime_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// # Errors
    ///
    /// Returns error if config cannot be loaded or parsed.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path.
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = json5::from_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), routes = config.routes.len(), "loaded config");
        Ok(config)
    }

    /// Save configuration to a path.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or file write fails.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config file path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        Self::state_dir().join("pipeauth.json")
    }

    /// Get the pipeauth state directory.
    ///
    /// Uses `PIPEAUTH_STATE_DIR` env var if set, otherwise `~/.pipeauth`.
    #[must_use]
    pub fn state_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("PIPEAUTH_STATE_DIR") {
            PathBuf::from(dir)
        } else if let Some(home) = dirs::home_dir() {
            home.join(".pipeauth")
        } else {
            PathBuf::from(".pipeauth")
        }
    }

    /// Directory holding endpoint socket files.
    #[must_use]
    pub fn runtime_dir(&self) -> PathBuf {
        self.runtime_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("pipeauth"))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "Endpoint name cannot be empty".to_string(),
            ));
        }
        if self.endpoint.session_budget_secs == 0 {
            return Err(ConfigError::Validation(
                "Session budget cannot be 0".to_string(),
            ));
        }
        if self.endpoint.answer_ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "Answer TTL cannot be 0".to_string(),
            ));
        }
        self.endpoint.security_level()?;

        if self.client.answer_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "Answer timeout cannot be 0".to_string(),
            ));
        }
        if self.crypto.key_lifetime_secs <= 0 || self.crypto.symmetric_lifetime_secs <= 0 {
            return Err(ConfigError::Validation(
                "Key lifetimes must be positive".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for route in &self.routes {
            if route.pipe.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Route '{}' has empty pipe",
                    route.name
                )));
            }
            if !seen.insert(route.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate route '{}'",
                    route.name
                )));
            }
            route.to_instruction()?;
        }

        Ok(())
    }

    /// Build the routing table from `routes`.
    ///
    /// # Errors
    ///
    /// Returns error if a pattern is invalid or a name is duplicated.
    pub fn routing_table(&self) -> Result<RoutingTable, ConfigError> {
        let mut table = RoutingTable::new();
        for route in &self.routes {
            table.push(route.to_instruction()?)?;
        }
        Ok(table)
    }
}

/// Local endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    /// Pipe name of the endpoint.
    #[serde(default = "default_endpoint_name")]
    pub name: String,

    /// Security level names (`anonymous`, `remote-logon`, `local`,
    /// `administrator`, `internal`).
    #[serde(default = "default_security")]
    pub security: Vec<String>,

    /// Absolute per-connection time ceiling, from accept.
    #[serde(default = "default_session_budget")]
    pub session_budget_secs: u64,

    /// How long a relayed answer waits to be collected.
    #[serde(default = "default_answer_ttl")]
    pub answer_ttl_secs: u64,
}

impl EndpointConfig {
    /// Parsed security level.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` for unknown level names.
    pub fn security_level(&self) -> Result<SecurityLevel, ConfigError> {
        SecurityLevel::from_names(self.security.as_slice())
            .map_err(|name| ConfigError::Validation(format!("Unknown security level '{name}'")))
    }

    /// Session budget as a duration.
    #[must_use]
    pub const fn session_budget(&self) -> Duration {
        Duration::from_secs(self.session_budget_secs)
    }

    /// Answer TTL as a duration.
    #[must_use]
    pub const fn answer_ttl(&self) -> Duration {
        Duration::from_secs(self.answer_ttl_secs)
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: default_endpoint_name(),
            security: default_security(),
            session_budget_secs: default_session_budget(),
            answer_ttl_secs: default_answer_ttl(),
        }
    }
}

fn default_endpoint_name() -> String {
    "pipeauth".to_string()
}

fn default_security() -> Vec<String> {
    vec!["internal".to_string()]
}

const fn default_session_budget() -> u64 {
    30
}

const fn default_answer_ttl() -> u64 {
    60
}

/// Outbound line configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Sleep between connection attempts to an unavailable endpoint.
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,

    /// Attempts before a queued query is failed; 0 retries forever.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// How long a duplex request waits for its answer.
    #[serde(default = "default_answer_timeout")]
    pub answer_timeout_secs: u64,
}

impl ClientConfig {
    /// Retry interval as a duration.
    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Answer timeout as a duration.
    #[must_use]
    pub const fn answer_timeout(&self) -> Duration {
        Duration::from_secs(self.answer_timeout_secs)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_retry_interval(),
            max_attempts: default_max_attempts(),
            answer_timeout_secs: default_answer_timeout(),
        }
    }
}

const fn default_retry_interval() -> u64 {
    500
}

const fn default_max_attempts() -> u32 {
    20
}

const fn default_answer_timeout() -> u64 {
    30
}

/// Encryption configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CryptoConfig {
    /// Operator code of the local key pair.
    #[serde(default = "default_asymmetric")]
    pub asymmetric: String,

    /// Operator code minted per exchange.
    #[serde(default = "default_symmetric")]
    pub symmetric: String,

    /// Lifetime of the local key pair.
    #[serde(default = "default_key_lifetime")]
    pub key_lifetime_secs: i64,

    /// Lifetime of per-exchange symmetric keys.
    #[serde(default = "default_symmetric_lifetime")]
    pub symmetric_lifetime_secs: i64,

    /// Attempts to fetch a peer's public key.
    #[serde(default = "default_key_fetch_retries")]
    pub key_fetch_retries: u32,

    /// Base backoff between public key fetch attempts.
    #[serde(default = "default_key_fetch_backoff")]
    pub key_fetch_backoff_ms: u64,
}

impl CryptoConfig {
    /// Key fetch backoff as a duration.
    #[must_use]
    pub const fn key_fetch_backoff(&self) -> Duration {
        Duration::from_millis(self.key_fetch_backoff_ms)
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            asymmetric: default_asymmetric(),
            symmetric: default_symmetric(),
            key_lifetime_secs: default_key_lifetime(),
            symmetric_lifetime_secs: default_symmetric_lifetime(),
            key_fetch_retries: default_key_fetch_retries(),
            key_fetch_backoff_ms: default_key_fetch_backoff(),
        }
    }
}

fn default_asymmetric() -> String {
    crate::crypto::ECIES_CODE.to_string()
}

fn default_symmetric() -> String {
    crate::crypto::AES_CODE.to_string()
}

const fn default_key_lifetime() -> i64 {
    86_400
}

const fn default_symmetric_lifetime() -> i64 {
    600
}

const fn default_key_fetch_retries() -> u32 {
    5
}

const fn default_key_fetch_backoff() -> u64 {
    200
}

/// One routing instruction as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    /// Unique route name.
    pub name: String,

    /// Destination host (`.` for local).
    #[serde(default = "default_host")]
    pub host: String,

    /// Destination pipe name.
    pub pipe: String,

    /// Patterns; empty means catch-all.
    #[serde(default)]
    pub patterns: Vec<String>,

    /// Seal queries on this route.
    #[serde(default)]
    pub encrypt: bool,

    /// Guest access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_token: Option<Secret>,

    /// User credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logon: Option<LogonConfig>,
}

impl RouteConfig {
    /// Build the routing instruction.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::InvalidPattern` for an unparsable pattern.
    pub fn to_instruction(&self) -> Result<Instruction, RoutingError> {
        let mut instruction = Instruction::new(
            self.name.clone(),
            Destination::new(self.host.clone(), self.pipe.clone()),
        )
        .with_patterns(&self.patterns)?
        .with_encryption(self.encrypt);

        if let Some(token) = &self.guest_token {
            instruction = instruction.with_guest_token(token.expose());
        }
        if let Some(logon) = &self.logon {
            instruction = instruction.with_logon(FullLogon {
                user: logon.user.clone(),
                password: logon.password.clone(),
                domain: logon.domain.clone(),
            });
        }
        Ok(instruction)
    }
}

fn default_host() -> String {
    LOCAL_HOST.to_string()
}

/// Route credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogonConfig {
    /// User name.
    pub user: String,
    /// Password.
    pub password: Secret,
    /// Optional domain.
    #[serde(default)]
    pub domain: Option<String>,
}
