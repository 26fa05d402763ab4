//! Secret values that must never reach logs.
//!
//! - `Secret`: wrapper that prevents accidental logging
//! - `is_secret_part`: which query part names carry credentials

use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Query part names whose values are redacted in debug output.
pub const SECRET_PARTS: &[&str] = &["password", "token", "pk", "rpk"];

/// Whether a part name carries secret or key material.
#[must_use]
pub fn is_secret_part(name: &str) -> bool {
    SECRET_PARTS.iter().any(|p| p.eq_ignore_ascii_case(name))
}

/// Credential wrapper that prevents accidental logging.
///
/// The inner value is wrapped with `secrecy::SecretBox` so it is not
/// printed by `Debug` or `Display`.
pub struct Secret(SecretBox<str>);

impl Secret {
    /// Wrap a secret value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretBox::new(value.into().into_boxed_str()))
    }

    /// Expose the secret.
    ///
    /// Use sparingly - only when writing it into an outbound query.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl Clone for Secret {
    fn clone(&self) -> Self {
        Self::new(self.expose())
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Eq for Secret {}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.expose())
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_redaction() {
        let secret = Secret::new("hunter2");

        assert_eq!(format!("{secret:?}"), "Secret([REDACTED])");
        assert_eq!(format!("{secret}"), "[REDACTED]");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_secret_serde_keeps_value() {
        let secret: Secret = serde_json::from_str("\"hunter2\"").unwrap();
        assert_eq!(secret.expose(), "hunter2");
        assert_eq!(serde_json::to_string(&secret).unwrap(), "\"hunter2\"");
        assert_eq!(secret.clone(), secret);
    }

    #[test]
    fn test_secret_part_names() {
        assert!(is_secret_part("Password"));
        assert!(is_secret_part("token"));
        assert!(!is_secret_part("user"));
    }
}
