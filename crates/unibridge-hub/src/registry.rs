//! In-memory directory of active plugin sessions.
//!
//! # Locking design
//!
//! Both maps (sessions by id, and the `(tenant, project_hash)` secondary
//! index) live behind one `Mutex`, because the eviction invariant spans
//! them: registering a new session for an existing key must atomically
//! remove the old session and install the new one — no caller may observe
//! a window where the key maps to neither, or to both. The lock is only
//! held for map operations, never across an await.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use unibridge_core::{BridgeError, BridgeResult, InstanceToken, SessionId, TenantKey};

use crate::protocol::ToolSpec;

/// One registered Unity Editor connection.
#[derive(Debug, Clone)]
pub struct PluginSession {
    /// Opaque id minted at registration. Never reused across reconnects.
    pub session_id: SessionId,
    /// Unity project name (cosmetic).
    pub project_name: String,
    /// Stable project fingerprint. The canonical instance id.
    pub project_hash: String,
    /// Unity Editor version string.
    pub unity_version: String,
    /// Absolute project path, when known.
    pub project_path: Option<PathBuf>,
    /// Owning user in remote-hosted mode; `None` locally.
    pub user_id: Option<String>,
    /// Tools the project exposes. Empty until the manifest arrives;
    /// replaced wholesale on every update, never merged.
    pub tools: HashMap<String, ToolSpec>,
    /// When the registration handshake completed.
    pub registered_at: DateTime<Utc>,
    /// Updated on every heartbeat acknowledgment.
    pub connected_at: DateTime<Utc>,
}

impl PluginSession {
    /// The tenant this session belongs to.
    #[must_use]
    pub fn tenant(&self) -> TenantKey {
        TenantKey::from_user(self.user_id.as_deref())
    }

    /// The `name@hash` token agents use to address this instance.
    #[must_use]
    pub fn token(&self) -> InstanceToken {
        InstanceToken::new(&self.project_name, &self.project_hash)
    }
}

/// Registration request, as carried by the wire `register` message plus the
/// authenticated user (if any).
#[derive(Debug, Clone)]
pub struct Registration {
    /// Unity project name.
    pub project_name: String,
    /// Stable project fingerprint.
    pub project_hash: String,
    /// Unity Editor version.
    pub unity_version: String,
    /// Absolute project path, when known.
    pub project_path: Option<PathBuf>,
    /// Authenticated user in remote-hosted mode.
    pub user_id: Option<String>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, PluginSession>,
    by_project: HashMap<(TenantKey, String), SessionId>,
}

/// Thread-safe directory of active plugin sessions.
pub struct SessionRegistry {
    remote_hosted: bool,
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(remote_hosted: bool) -> Self {
        Self {
            remote_hosted,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Whether the registry scopes lookups by user.
    #[must_use]
    pub fn remote_hosted(&self) -> bool {
        self.remote_hosted
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a session, atomically evicting any previous session for the
    /// same `(tenant, project_hash)` key.
    ///
    /// Returns the stored session and, when an older session was displaced,
    /// its id — the caller owns tearing down that session's connection.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::TenantRequired`] when the registry is
    /// remote-hosted and no user id was supplied.
    pub fn register(
        &self,
        session_id: SessionId,
        registration: Registration,
    ) -> BridgeResult<(PluginSession, Option<SessionId>)> {
        if self.remote_hosted && registration.user_id.is_none() {
            return Err(BridgeError::TenantRequired);
        }

        let now = Utc::now();
        let session = PluginSession {
            session_id,
            project_name: registration.project_name,
            project_hash: registration.project_hash,
            unity_version: registration.unity_version,
            project_path: registration.project_path,
            user_id: registration.user_id,
            tools: HashMap::new(),
            registered_at: now,
            connected_at: now,
        };

        let key = (session.tenant(), session.project_hash.clone());
        let mut inner = self.lock();
        let evicted = inner.by_project.insert(key, session_id);
        if let Some(old_id) = evicted {
            inner.sessions.remove(&old_id);
        }
        inner.sessions.insert(session_id, session.clone());
        Ok((session, evicted))
    }

    /// Remove a session and both index entries. Idempotent.
    pub fn unregister(&self, session_id: SessionId) {
        let mut inner = self.lock();
        if let Some(session) = inner.sessions.remove(&session_id) {
            let key = (session.tenant(), session.project_hash);
            // Only drop the index entry if it still points at this session;
            // a newer registration may already own the key.
            if inner.by_project.get(&key) == Some(&session_id) {
                inner.by_project.remove(&key);
            }
        }
    }

    /// Update `connected_at` for a session. No-op when absent.
    pub fn touch(&self, session_id: SessionId) {
        let mut inner = self.lock();
        if let Some(session) = inner.sessions.get_mut(&session_id) {
            session.connected_at = Utc::now();
        }
    }

    /// Replace a session's tool map wholesale.
    ///
    /// Returns `false` when the session is unknown.
    pub fn set_tools(&self, session_id: SessionId, tools: Vec<ToolSpec>) -> bool {
        let mut inner = self.lock();
        match inner.sessions.get_mut(&session_id) {
            Some(session) => {
                session.tools = tools.into_iter().map(|t| (t.name.clone(), t)).collect();
                true
            },
            None => false,
        }
    }

    /// Look up a session by id.
    #[must_use]
    pub fn get(&self, session_id: SessionId) -> Option<PluginSession> {
        self.lock().sessions.get(&session_id).cloned()
    }

    /// Look up the current session id for a project hash within a tenant.
    #[must_use]
    pub fn get_id_by_hash(&self, project_hash: &str, tenant: &TenantKey) -> Option<SessionId> {
        self.lock()
            .by_project
            .get(&(tenant.clone(), project_hash.to_string()))
            .copied()
    }

    /// List sessions.
    ///
    /// With a tenant, returns only that tenant's sessions. Without one,
    /// returns everything in local mode — and fails loudly in remote-hosted
    /// mode, because an unscoped listing there would be a cross-tenant leak.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::TenantRequired`] for an unscoped listing in
    /// remote-hosted mode.
    pub fn list(&self, tenant: Option<&TenantKey>) -> BridgeResult<Vec<PluginSession>> {
        let inner = self.lock();
        match tenant {
            Some(tenant) => Ok(inner
                .sessions
                .values()
                .filter(|s| &s.tenant() == tenant)
                .cloned()
                .collect()),
            None if self.remote_hosted => Err(BridgeError::TenantRequired),
            None => Ok(inner.sessions.values().cloned().collect()),
        }
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Whether no sessions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().sessions.is_empty()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("remote_hosted", &self.remote_hosted)
            .field("sessions", &self.len())
            .finish()
    }
}
