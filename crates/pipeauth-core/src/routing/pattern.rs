//! Query pattern language.
//!
//! A pattern is a `,`-separated list of clauses that must all hold:
//!
//! | Clause        | Holds when                                           |
//! |---------------|------------------------------------------------------|
//! | `$name`       | a part `name` exists                                 |
//! | `name`        | same as `$name`                                      |
//! | `!name`       | no part `name` exists                                |
//! | `name=value`  | the first `name` part has a value equal to `value`   |
//! | `name!=value` | the first `name` part is absent, valueless or differs |
//!
//! Names and values compare ASCII case-insensitively. Empty clauses are
//! skipped, so the empty pattern matches every query.

use std::fmt;
use std::str::FromStr;

use super::RoutingError;
use crate::query::Query;

/// One condition on a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clause {
    /// Part must exist.
    Present(String),
    /// Part must not exist.
    Absent(String),
    /// Part value must equal.
    Equals {
        /// Part name.
        name: String,
        /// Expected value.
        value: String,
    },
    /// Part value must not equal.
    NotEquals {
        /// Part name.
        name: String,
        /// Rejected value.
        value: String,
    },
}

impl Clause {
    /// Parse a single clause.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::InvalidPattern` for an empty name.
    pub fn parse(text: &str) -> Result<Self, RoutingError> {
        let text = text.trim();
        let invalid = |reason: &str| RoutingError::InvalidPattern {
            pattern: text.to_string(),
            reason: reason.to_string(),
        };

        // `!=` has to be tried before `=` and before a leading `!`.
        let clause = if let Some((name, value)) = text.split_once("!=") {
            Self::NotEquals {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
            }
        } else if let Some((name, value)) = text.split_once('=') {
            Self::Equals {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
            }
        } else if let Some(name) = text.strip_prefix('$') {
            Self::Present(name.trim().to_string())
        } else if let Some(name) = text.strip_prefix('!') {
            Self::Absent(name.trim().to_string())
        } else {
            Self::Present(text.to_string())
        };

        if clause.name().is_empty() {
            return Err(invalid("missing part name"));
        }
        if clause.name().contains(['$', '!', '=']) {
            return Err(invalid("operator inside part name"));
        }
        Ok(clause)
    }

    /// Name of the part this clause inspects.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Present(name) | Self::Absent(name) => name,
            Self::Equals { name, .. } | Self::NotEquals { name, .. } => name,
        }
    }

    /// Whether the clause holds for `query`.
    #[must_use]
    pub fn matches(&self, query: &Query) -> bool {
        match self {
            Self::Present(name) => query.contains(name),
            Self::Absent(name) => !query.contains(name),
            Self::Equals { name, value } => query
                .value(name)
                .is_some_and(|v| v.eq_ignore_ascii_case(value)),
            Self::NotEquals { name, value } => !query
                .value(name)
                .is_some_and(|v| v.eq_ignore_ascii_case(value)),
        }
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Present(name) => write!(f, "${name}"),
            Self::Absent(name) => write!(f, "!{name}"),
            Self::Equals { name, value } => write!(f, "{name}={value}"),
            Self::NotEquals { name, value } => write!(f, "{name}!={value}"),
        }
    }
}

/// A conjunction of clauses.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pattern {
    clauses: Vec<Clause>,
}

impl Pattern {
    /// Parse `clause,clause,...`.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::InvalidPattern` naming the whole pattern when
    /// any clause is invalid.
    pub fn parse(text: &str) -> Result<Self, RoutingError> {
        let clauses = text
            .split(',')
            .filter(|segment| !segment.trim().is_empty())
            .map(Clause::parse)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| match err {
                RoutingError::InvalidPattern { reason, .. } => RoutingError::InvalidPattern {
                    pattern: text.to_string(),
                    reason,
                },
                other => other,
            })?;
        Ok(Self { clauses })
    }

    /// The clauses, in source order.
    #[must_use]
    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Whether the pattern has no clauses and so matches everything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Whether every clause holds for `query`.
    #[must_use]
    pub fn matches(&self, query: &Query) -> bool {
        self.clauses.iter().all(|clause| clause.matches(query))
    }
}

impl FromStr for Pattern {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.clauses.iter().map(ToString::to_string).collect();
        f.write_str(&rendered.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clause_grammar() {
        assert_eq!(Clause::parse("$x").unwrap(), Clause::Present("x".into()));
        assert_eq!(Clause::parse("x").unwrap(), Clause::Present("x".into()));
        assert_eq!(Clause::parse("!pk").unwrap(), Clause::Absent("pk".into()));
        assert_eq!(
            Clause::parse(" q = GET ").unwrap(),
            Clause::Equals {
                name: "q".into(),
                value: "GET".into()
            }
        );
        assert_eq!(
            Clause::parse("q!=POST").unwrap(),
            Clause::NotEquals {
                name: "q".into(),
                value: "POST".into()
            }
        );
    }

    #[test]
    fn test_invalid_clauses() {
        for text in ["$", "!", "=value", "!=value", "$!x"] {
            assert!(
                matches!(Clause::parse(text), Err(RoutingError::InvalidPattern { .. })),
                "{text} should be rejected"
            );
        }
    }

    #[test]
    fn test_equality_is_case_insensitive() {
        let pattern = Pattern::parse("q=get,SQ=PublicKey").unwrap();
        assert!(pattern.matches(&Query::verb("GET").with("sq", "PUBLICKEY")));
        assert!(!pattern.matches(&Query::verb("GET")));
    }

    #[test]
    fn test_not_equals_holds_for_absent_or_flag() {
        let pattern = Pattern::parse("mode!=debug").unwrap();
        assert!(pattern.matches(&Query::new()));
        assert!(pattern.matches(&Query::new().with_flag("mode")));
        assert!(pattern.matches(&Query::new().with("mode", "release")));
        assert!(!pattern.matches(&Query::new().with("mode", "DEBUG")));
    }

    #[test]
    fn test_equals_needs_value() {
        let pattern = Pattern::parse("mode=debug").unwrap();
        assert!(!pattern.matches(&Query::new().with_flag("mode")));
    }

    #[test]
    fn test_empty_pattern_matches_all() {
        for text in ["", " ", ",,"] {
            let pattern = Pattern::parse(text).unwrap();
            assert!(pattern.is_empty());
            assert!(pattern.matches(&Query::new()));
            assert!(pattern.matches(&Query::verb("ANY")));
        }
    }

    #[test]
    fn test_error_names_whole_pattern() {
        let err = Pattern::parse("q=GET,$").unwrap_err();
        assert_eq!(
            err,
            RoutingError::InvalidPattern {
                pattern: "q=GET,$".into(),
                reason: "missing part name".into()
            }
        );
    }

    #[test]
    fn test_display_normalises() {
        let pattern: Pattern = " q=GET , !pk,$x ".parse().unwrap();
        assert_eq!(pattern.to_string(), "q=GET,!pk,$x");
    }
}
