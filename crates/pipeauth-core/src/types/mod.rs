//! Core types shared by the transport layers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Host token that addresses the local machine.
pub const LOCAL_HOST: &str = ".";

/// Identity of a pipe endpoint: `(host, pipe name)`.
///
/// There are no port numbers; the platform's named-pipe namespace is the
/// addressing space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    /// Host name, or [`LOCAL_HOST`] for loopback.
    pub host: String,
    /// Pipe name within the host's namespace.
    pub pipe: String,
}

impl Destination {
    /// Create a destination on an explicit host.
    #[must_use]
    pub fn new(host: impl Into<String>, pipe: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            pipe: pipe.into(),
        }
    }

    /// Create a destination on the local machine.
    #[must_use]
    pub fn local(pipe: impl Into<String>) -> Self {
        Self::new(LOCAL_HOST, pipe)
    }

    /// Whether this destination lives on the local machine.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.host == LOCAL_HOST
            || self.host.eq_ignore_ascii_case("localhost")
            || self.host.is_empty()
    }

    /// Same host, different pipe.
    #[must_use]
    pub fn sibling(&self, pipe: impl Into<String>) -> Self {
        Self::new(self.host.clone(), pipe)
    }

    /// Parse `host/pipe` or a bare `pipe` (local).
    #[must_use]
    pub fn parse(text: &str) -> Self {
        match text.split_once('/') {
            Some((host, pipe)) if !pipe.is_empty() => Self::new(host, pipe),
            _ => Self::local(text.trim_matches('/')),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.pipe)
    }
}

/// Access level applied to an endpoint when it is created.
///
/// A bit set: levels combine with `|`. [`SecurityLevel::INTERNAL`] always
/// grants the owning user full control regardless of the other flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SecurityLevel(u8);

impl SecurityLevel {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Unauthenticated callers.
    pub const ANONYMOUS: Self = Self(1);
    /// Callers logged on from a remote machine.
    pub const REMOTE_LOGON: Self = Self(1 << 1);
    /// Interactive local users.
    pub const LOCAL: Self = Self(1 << 2);
    /// Administrators.
    pub const ADMINISTRATOR: Self = Self(1 << 3);
    /// The owning process identity and the system.
    pub const INTERNAL: Self = Self(1 << 4);

    const NAMED: [(&'static str, Self); 5] = [
        ("anonymous", Self::ANONYMOUS),
        ("remotelogon", Self::REMOTE_LOGON),
        ("local", Self::LOCAL),
        ("administrator", Self::ADMINISTRATOR),
        ("internal", Self::INTERNAL),
    ];

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether every flag of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any flag of `other` is set in `self`.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Parse a single level name (case-insensitive, `-`/`_` ignored).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        Self::NAMED
            .iter()
            .find(|(n, _)| *n == normalized)
            .map(|(_, level)| *level)
    }

    /// Parse a list of level names into one combined level.
    ///
    /// Returns the first unknown name on failure.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, String> {
        names.iter().try_fold(Self::NONE, |acc, name| {
            Self::from_name(name.as_ref())
                .map(|level| acc | level)
                .ok_or_else(|| name.as_ref().to_string())
        })
    }

    /// Names of the set flags.
    #[must_use]
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(_, level)| self.contains(*level))
            .map(|(n, _)| *n)
            .collect()
    }

    /// Unix permission bits for a socket file created at this level.
    ///
    /// Owner read/write is always present.
    #[must_use]
    pub const fn unix_mode(self) -> u32 {
        let mut mode = 0o600;
        if self.intersects(Self::ADMINISTRATOR) {
            mode |= 0o060;
        }
        if self.intersects(Self(Self::LOCAL.0 | Self::ANONYMOUS.0 | Self::REMOTE_LOGON.0)) {
            mode |= 0o066;
        }
        mode
    }
}

impl BitOr for SecurityLevel {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for SecurityLevel {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.names();
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}
