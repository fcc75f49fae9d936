//! Instance tokens — how agents name a target Unity project.
//!
//! A token is either a bare project hash (`"1a2b3c"`) or the human-friendly
//! `name@hash` form (`"MyGame@1a2b3c"`). Only the hash suffix is
//! authoritative for matching; the name is cosmetic and carried for
//! display purposes only.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error parsing an instance token.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenParseError {
    /// The token was empty.
    #[error("instance token is empty")]
    Empty,
    /// The hash component was empty (`"name@"`).
    #[error("instance token {0:?} has an empty project hash")]
    EmptyHash(String),
}

/// A parsed instance token naming a target Unity project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceToken {
    /// Cosmetic project name, when the `name@hash` form was used.
    name: Option<String>,
    /// Stable project fingerprint. Authoritative for matching.
    hash: String,
}

impl InstanceToken {
    /// Build a token from a project name and hash.
    #[must_use]
    pub fn new(name: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            hash: hash.into(),
        }
    }

    /// Build a bare-hash token.
    #[must_use]
    pub fn from_hash(hash: impl Into<String>) -> Self {
        Self {
            name: None,
            hash: hash.into(),
        }
    }

    /// The project hash (authoritative part).
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// The cosmetic project name, if one was supplied.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether this token targets the given project hash.
    #[must_use]
    pub fn matches_hash(&self, hash: &str) -> bool {
        self.hash == hash
    }
}

impl FromStr for InstanceToken {
    type Err = TokenParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TokenParseError::Empty);
        }
        // The hash is the suffix after the last '@' so project names
        // containing '@' still parse.
        match s.rsplit_once('@') {
            Some((_, "")) => Err(TokenParseError::EmptyHash(s.to_string())),
            Some(("", hash)) => Ok(Self::from_hash(hash)),
            Some((name, hash)) => Ok(Self::new(name, hash)),
            None => Ok(Self::from_hash(s)),
        }
    }
}

impl fmt::Display for InstanceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name}@{}", self.hash),
            None => write!(f, "{}", self.hash),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_hash() {
        let token: InstanceToken = "1a2b3c".parse().unwrap();
        assert_eq!(token.hash(), "1a2b3c");
        assert!(token.name().is_none());
    }

    #[test]
    fn parses_name_at_hash() {
        let token: InstanceToken = "MyGame@1a2b3c".parse().unwrap();
        assert_eq!(token.hash(), "1a2b3c");
        assert_eq!(token.name(), Some("MyGame"));
    }

    #[test]
    fn name_may_contain_at_sign() {
        let token: InstanceToken = "team@game@deadbeef".parse().unwrap();
        assert_eq!(token.hash(), "deadbeef");
        assert_eq!(token.name(), Some("team@game"));
    }

    #[test]
    fn rejects_empty_and_hashless() {
        assert_eq!("".parse::<InstanceToken>(), Err(TokenParseError::Empty));
        assert_eq!(
            "  ".parse::<InstanceToken>(),
            Err(TokenParseError::Empty)
        );
        assert!(matches!(
            "MyGame@".parse::<InstanceToken>(),
            Err(TokenParseError::EmptyHash(_))
        ));
    }

    #[test]
    fn display_round_trips() {
        for raw in ["deadbeef", "MyGame@deadbeef"] {
            let token: InstanceToken = raw.parse().unwrap();
            assert_eq!(token.to_string(), raw);
        }
    }

    #[test]
    fn matching_ignores_name() {
        let a: InstanceToken = "MyGame@deadbeef".parse().unwrap();
        let b: InstanceToken = "Renamed@deadbeef".parse().unwrap();
        assert!(a.matches_hash("deadbeef"));
        assert!(b.matches_hash("deadbeef"));
        assert!(!a.matches_hash("cafebabe"));
    }
}
