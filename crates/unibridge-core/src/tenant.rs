//! Tenant scoping for multi-user deployments.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Isolation key for session lookups.
///
/// In remote-hosted deployments every session belongs to a user and all
/// lookups are scoped by that user's id. Local single-user deployments use
/// the [`TenantKey::Local`] sentinel so the same index structure serves
/// both modes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantKey {
    /// Single-tenant local deployment — no user isolation.
    Local,
    /// A user id in a remote-hosted deployment.
    User(String),
}

impl TenantKey {
    /// Build a key from an optional user id.
    #[must_use]
    pub fn from_user(user_id: Option<&str>) -> Self {
        match user_id {
            Some(id) => Self::User(id.to_string()),
            None => Self::Local,
        }
    }

    /// The user id, when this is a user-scoped key.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::Local => None,
            Self::User(id) => Some(id),
        }
    }

    /// Whether this is the local single-tenant sentinel.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::User(id) => write!(f, "{id}"),
        }
    }
}
