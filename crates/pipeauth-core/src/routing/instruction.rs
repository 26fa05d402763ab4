//! Routing instructions.

use super::{Pattern, RoutingError};
use crate::query::{Query, names};
use crate::secrets::Secret;
use crate::types::Destination;

/// Guest access: a bearer token sent with every query on the route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestToken {
    /// The token.
    pub token: Secret,
}

/// Full logon: user credentials sent with every query on the route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullLogon {
    /// User name.
    pub user: String,
    /// Password.
    pub password: Secret,
    /// Optional logon domain.
    pub domain: Option<String>,
}

/// Which logon capability an instruction carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogonPolicy {
    /// No credentials.
    Anonymous,
    /// Guest token only.
    Guest,
    /// User credentials (a guest token, if also set, is sent alongside).
    Full,
}

/// One routing rule: where matching queries go and how they travel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Unique name within a table.
    pub name: String,
    /// Endpoint matching queries are sent to.
    pub destination: Destination,
    /// Whether queries on this route are sealed.
    pub encrypt: bool,
    /// Guest token capability.
    pub guest: Option<GuestToken>,
    /// Full logon capability.
    pub logon: Option<FullLogon>,
    patterns: Vec<Pattern>,
}

impl Instruction {
    /// Create a catch-all, unencrypted, anonymous instruction.
    #[must_use]
    pub fn new(name: impl Into<String>, destination: Destination) -> Self {
        Self {
            name: name.into(),
            destination,
            encrypt: false,
            guest: None,
            logon: None,
            patterns: Vec::new(),
        }
    }

    /// Add patterns; they are OR'd together.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::InvalidPattern` for the first unparsable pattern.
    pub fn with_patterns<I, S>(mut self, patterns: I) -> Result<Self, RoutingError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            self.patterns.push(Pattern::parse(pattern.as_ref())?);
        }
        Ok(self)
    }

    /// Set the encryption flag.
    #[must_use]
    pub const fn with_encryption(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    /// Attach a guest token.
    #[must_use]
    pub fn with_guest_token(mut self, token: impl Into<String>) -> Self {
        self.guest = Some(GuestToken {
            token: Secret::new(token),
        });
        self
    }

    /// Attach user credentials.
    #[must_use]
    pub fn with_logon(mut self, logon: FullLogon) -> Self {
        self.logon = Some(logon);
        self
    }

    /// Patterns in declaration order.
    #[must_use]
    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    /// Whether the instruction targets everything.
    #[must_use]
    pub fn is_catch_all(&self) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(Pattern::is_empty)
    }

    /// Whether `query` is this instruction's target: at least one pattern
    /// holds entirely, or there are no patterns.
    #[must_use]
    pub fn is_target(&self, query: &Query) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.matches(query))
    }

    /// The logon capability selected by the populated fields.
    #[must_use]
    pub const fn logon_policy(&self) -> LogonPolicy {
        match (&self.logon, &self.guest) {
            (Some(_), _) => LogonPolicy::Full,
            (None, Some(_)) => LogonPolicy::Guest,
            (None, None) => LogonPolicy::Anonymous,
        }
    }

    /// Write this route's credentials into an outbound query.
    ///
    /// Existing credential parts are replaced, never duplicated.
    pub fn apply_credentials(&self, query: &mut Query) {
        if let Some(guest) = &self.guest {
            query.set(names::TOKEN, guest.token.expose());
        }
        if let Some(logon) = &self.logon {
            query.set(names::USER, logon.user.clone());
            query.set(names::PASSWORD, logon.password.expose());
            if let Some(domain) = &logon.domain {
                query.set(names::DOMAIN, domain.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_or_of_and_patterns() {
        let instruction = Instruction::new("keys", Destination::local("auth"))
            .with_patterns(["q=GET,sq=PUBLICKEY", "!pk"])
            .unwrap();

        assert!(instruction.is_target(&Query::verb("GET").with("sq", "PUBLICKEY")));
        // Only the second pattern holds.
        assert!(instruction.is_target(&Query::verb("GET")));
        // Neither holds once `pk` is present and the verbs differ.
        assert!(!instruction.is_target(&Query::verb("POST").with("pk", "00")));
    }

    #[test]
    fn test_absent_clause_alone_matches_any_query_without_the_part() {
        let instruction = Instruction::new("keys", Destination::local("auth"))
            .with_patterns(["q=GET,sq=PUBLICKEY", "!pk"])
            .unwrap();
        assert!(instruction.is_target(&Query::verb("POST")));
        assert!(instruction.is_target(&Query::new()));
        assert!(!instruction.is_target(&Query::verb("POST").with("pk", "00")));
    }

    #[test]
    fn test_no_patterns_targets_everything() {
        let instruction = Instruction::new("all", Destination::local("sink"));
        assert!(instruction.is_catch_all());
        assert!(instruction.is_target(&Query::new()));
        assert!(instruction.is_target(&Query::verb("ANYTHING")));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let result = Instruction::new("bad", Destination::local("x")).with_patterns(["$"]);
        assert!(matches!(result, Err(RoutingError::InvalidPattern { .. })));
    }

    #[test]
    fn test_logon_policy_selection() {
        let base = Instruction::new("r", Destination::local("x"));
        assert_eq!(base.logon_policy(), LogonPolicy::Anonymous);

        let guest = base.clone().with_guest_token("t0k");
        assert_eq!(guest.logon_policy(), LogonPolicy::Guest);

        let full = guest.with_logon(FullLogon {
            user: "alice".into(),
            password: Secret::new("pw"),
            domain: None,
        });
        assert_eq!(full.logon_policy(), LogonPolicy::Full);
    }

    #[test]
    fn test_apply_credentials_replaces_parts() {
        let instruction = Instruction::new("r", Destination::local("x"))
            .with_guest_token("t0k")
            .with_logon(FullLogon {
                user: "alice".into(),
                password: Secret::new("pw"),
                domain: Some("corp".into()),
            });

        let mut query = Query::verb("GET").with("user", "mallory");
        instruction.apply_credentials(&mut query);

        assert_eq!(query.value("token"), Some("t0k"));
        assert_eq!(query.value("user"), Some("alice"));
        assert_eq!(query.value("password"), Some("pw"));
        assert_eq!(query.value("domain"), Some("corp"));
        assert_eq!(query.parts().iter().filter(|p| p.is_named("user")).count(), 1);
    }

    #[test]
    fn test_debug_hides_credentials() {
        let instruction = Instruction::new("r", Destination::local("x")).with_guest_token("t0k");
        assert!(!format!("{instruction:?}").contains("t0k"));
    }
}
