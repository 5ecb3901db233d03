use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const DEFAULT_USER_SERVER: &str = "s.whatsapp.net";
pub const LEGACY_USER_SERVER: &str = "c.us";
pub const GROUP_SERVER: &str = "g.us";

/// Network identifier of a user, group or device: `user@server`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid {
    pub user: String,
    pub server: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JidError {
    #[error("identifier must not be empty")]
    Empty,

    #[error("unexpected number of '@' in '{0}'")]
    TooManySeparators(String),

    #[error("identifier '{0}' has no user part")]
    MissingUser(String),

    #[error("identifier '{0}' has no server part")]
    MissingServer(String),
}

impl Jid {
    #[must_use]
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
        }
    }

    #[must_use]
    pub fn user(user: impl Into<String>) -> Self {
        Self::new(user, DEFAULT_USER_SERVER)
    }

    #[must_use]
    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }

    /// `user@c.us` form used in outbound webhooks.
    #[must_use]
    pub fn legacy_chat_id(&self) -> String {
        format!("{}@{LEGACY_USER_SERVER}", self.user)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() {
            f.write_str(&self.server)
        } else {
            write!(f, "{}@{}", self.user, self.server)
        }
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut parts = raw.split('@');
        let (Some(user), Some(server), None) = (parts.next(), parts.next(), parts.next()) else {
            if raw.contains('@') {
                return Err(JidError::TooManySeparators(raw.to_string()));
            }
            return Ok(Self::new("", raw));
        };

        if server.is_empty() {
            return Err(JidError::MissingServer(raw.to_string()));
        }

        Ok(Self::new(user, server))
    }
}

impl Serialize for Jid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Jid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Normalizes a caller-supplied phone number or identifier.
///
/// A leading `+` is dropped. Input without `@` is a bare user on the default user
/// server; input with `@` must parse and carry a non-empty user part.
pub fn parse_phone(raw: &str) -> Result<Jid, JidError> {
    let trimmed = raw.trim();
    let value = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if value.is_empty() {
        return Err(JidError::Empty);
    }

    if !value.contains('@') {
        return Ok(Jid::user(value));
    }

    let jid: Jid = value.parse()?;
    if jid.user.is_empty() {
        return Err(JidError::MissingUser(value.to_string()));
    }

    Ok(jid)
}
