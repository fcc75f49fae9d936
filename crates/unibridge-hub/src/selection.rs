//! Per-caller instance selection and request-context injection.
//!
//! Every agent conversation gets a stable caller key and may pin one
//! instance under it. The pin survives disconnects on purpose: a domain
//! reload drops the connection but the project comes back under the same
//! token, and forgetting the user's choice on every compile would be
//! maddening.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use unibridge_core::{InstanceToken, TenantKey};

use crate::registry::SessionRegistry;

/// Tools served by the bridge itself rather than a Unity project. Always
/// visible regardless of which instance is selected.
pub const SERVER_TOOLS: &[&str] = &["list_instances", "select_instance", "bridge_status"];

/// Default tool aliases: shorthand name → the project tool it forwards to.
/// An alias is only advertised when its target is in the visible set.
#[must_use]
pub fn default_aliases() -> HashMap<String, String> {
    HashMap::from([
        ("logs".to_string(), "read_logs".to_string()),
        ("menu".to_string(), "execute_menu_item".to_string()),
    ])
}

/// Request-scoped context injected into every routed call, so downstream
/// tool code reads the resolved target instead of re-resolving.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// The pinned or auto-selected instance, when resolution concluded.
    pub instance: Option<InstanceToken>,
    /// The caller's tenant.
    pub tenant: TenantKey,
}

/// Per-caller selection state plus tool-catalog filtering.
pub struct SelectionMiddleware {
    registry: Arc<SessionRegistry>,
    remote_hosted: bool,
    selections: Mutex<HashMap<String, InstanceToken>>,
    server_tools: Vec<String>,
    aliases: HashMap<String, String>,
}

impl SelectionMiddleware {
    /// Create middleware over the given registry.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, remote_hosted: bool) -> Self {
        Self {
            registry,
            remote_hosted,
            selections: Mutex::new(HashMap::new()),
            server_tools: SERVER_TOOLS.iter().map(ToString::to_string).collect(),
            aliases: default_aliases(),
        }
    }

    /// Replace the alias table.
    #[must_use]
    pub fn with_aliases(mut self, aliases: HashMap<String, String>) -> Self {
        self.aliases = aliases;
        self
    }

    /// Derive the stable caller-session key: the client id when the
    /// frontend supplies one, else the tenant user id, else a constant for
    /// single-user local use.
    #[must_use]
    pub fn caller_key(client_id: Option<&str>, tenant: &TenantKey) -> String {
        client_id
            .or_else(|| tenant.user_id())
            .unwrap_or("local")
            .to_string()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, InstanceToken>> {
        self.selections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The instance currently pinned for a caller.
    #[must_use]
    pub fn selected(&self, caller_key: &str) -> Option<InstanceToken> {
        self.lock().get(caller_key).cloned()
    }

    /// Pin an instance for a caller.
    pub fn select(&self, caller_key: &str, token: InstanceToken) {
        debug!(caller = caller_key, instance = %token, "Instance pinned");
        self.lock().insert(caller_key.to_string(), token);
    }

    /// Clear a caller's pin. Returns whether one existed.
    pub fn clear(&self, caller_key: &str) -> bool {
        self.lock().remove(caller_key).is_some()
    }

    /// Build the request context for a routed call, auto-pinning the sole
    /// live instance when nothing is pinned yet (never in remote-hosted
    /// mode, where explicit selection is always required).
    #[must_use]
    pub fn prepare(&self, caller_key: &str, tenant: &TenantKey) -> RequestContext {
        if let Some(token) = self.selected(caller_key) {
            return RequestContext {
                instance: Some(token),
                tenant: tenant.clone(),
            };
        }

        if !self.remote_hosted {
            if let Ok(sessions) = self.registry.list(Some(tenant)) {
                if let [only] = sessions.as_slice() {
                    let token = only.token();
                    self.select(caller_key, token.clone());
                    return RequestContext {
                        instance: Some(token),
                        tenant: tenant.clone(),
                    };
                }
            }
        }

        RequestContext {
            instance: None,
            tenant: tenant.clone(),
        }
    }

    /// List the tool names the caller should see.
    ///
    /// With a resolvable selection: exactly the project's registered tools,
    /// plus the server-only tools, plus aliases whose target is in that
    /// set. When resolution is inconclusive (no sessions, or several with
    /// no pin), the unfiltered catalog is returned rather than guessing.
    #[must_use]
    pub fn list_tools(&self, caller_key: &str, tenant: &TenantKey) -> Vec<String> {
        let context = self.prepare(caller_key, tenant);
        let session = context
            .instance
            .and_then(|token| self.registry.get_id_by_hash(token.hash(), tenant))
            .and_then(|session_id| self.registry.get(session_id));

        let names: BTreeSet<String> = match session {
            Some(session) => {
                let mut names: BTreeSet<String> = session.tools.keys().cloned().collect();
                names.extend(self.server_tools.iter().cloned());
                for (alias, target) in &self.aliases {
                    if session.tools.contains_key(target) {
                        names.insert(alias.clone());
                    }
                }
                names
            },
            None => {
                let mut names: BTreeSet<String> = self.server_tools.iter().cloned().collect();
                if let Ok(sessions) = self.registry.list(Some(tenant)) {
                    for session in sessions {
                        names.extend(session.tools.keys().cloned());
                    }
                }
                names.extend(self.aliases.keys().cloned());
                names
            },
        };
        names.into_iter().collect()
    }
}

impl std::fmt::Debug for SelectionMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectionMiddleware")
            .field("remote_hosted", &self.remote_hosted)
            .field("selections", &self.lock().len())
            .finish_non_exhaustive()
    }
}
