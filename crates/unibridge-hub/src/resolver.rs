//! Instance resolution: map an optional instance token plus tenant context
//! to exactly one live session id.
//!
//! The bounded wait loop exists for one reason: Unity's domain reload tears
//! the plugin connection down and re-establishes it seconds later. Failing
//! on the first missing-session check would surface spurious errors for
//! every routine compile, so the resolver keeps polling until the target
//! shows up or the ceiling elapses. Ambiguity is different — more sessions
//! will not make a missing token choice appear — so it fails immediately.

use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

use unibridge_core::{BridgeError, BridgeResult, InstanceToken, SessionId, TenantKey};

use crate::config::ResolverConfig;
use crate::registry::SessionRegistry;

/// Resolves instance tokens to live session ids.
#[derive(Clone)]
pub struct InstanceResolver {
    registry: Arc<SessionRegistry>,
    config: ResolverConfig,
}

impl InstanceResolver {
    /// Create a resolver over the given registry.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, config: ResolverConfig) -> Self {
        Self { registry, config }
    }

    /// Resolve to exactly one session id.
    ///
    /// With a token, only the hash is matched (scoped to the tenant). With
    /// no token: a single live session is auto-selected when `allow_auto`
    /// permits; several candidates (or forbidden auto-selection) fail
    /// immediately with [`BridgeError::SelectionRequired`]. An unresolved
    /// lookup polls until the configured ceiling (hard-capped at 20s)
    /// elapses, bridging Unity's domain-reload window.
    ///
    /// # Errors
    ///
    /// [`BridgeError::SelectionRequired`] for ambiguity,
    /// [`BridgeError::NoSessionAvailable`] after the full wait, or a
    /// registry error.
    pub async fn resolve(
        &self,
        token: Option<&InstanceToken>,
        tenant: &TenantKey,
        allow_auto: bool,
    ) -> BridgeResult<SessionId> {
        let ceiling = self.config.ceiling();
        let poll = self.config.poll_interval();
        let deadline = Instant::now().checked_add(ceiling).unwrap_or_else(Instant::now);

        loop {
            if let Some(session_id) = self.try_resolve(token, tenant, allow_auto)? {
                return Ok(session_id);
            }
            if Instant::now() >= deadline {
                break;
            }
            debug!(
                token = ?token.map(ToString::to_string),
                %tenant,
                "No matching session yet, waiting for reconnect"
            );
            tokio::time::sleep(poll).await;
        }

        Err(BridgeError::NoSessionAvailable {
            token: token.map(ToString::to_string),
        })
    }

    /// One resolution attempt. `Ok(None)` means "nothing yet, keep
    /// waiting"; ambiguity is a hard error and never waits.
    fn try_resolve(
        &self,
        token: Option<&InstanceToken>,
        tenant: &TenantKey,
        allow_auto: bool,
    ) -> BridgeResult<Option<SessionId>> {
        if let Some(token) = token {
            return Ok(self.registry.get_id_by_hash(token.hash(), tenant));
        }

        let sessions = self.registry.list(Some(tenant))?;
        match sessions.as_slice() {
            [] => Ok(None),
            [only] if allow_auto => Ok(Some(only.session_id)),
            candidates => Err(BridgeError::SelectionRequired {
                candidates: candidates.iter().map(|s| s.token().to_string()).collect(),
            }),
        }
    }
}

impl std::fmt::Debug for InstanceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceResolver")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
