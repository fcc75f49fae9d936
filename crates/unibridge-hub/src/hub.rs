//! The connection hub: wire-level lifecycle of every plugin connection and
//! the request/response correlation protocol.
//!
//! # Locking design
//!
//! The connection map and the pending-command table use plain `Mutex`es
//! held only for map operations — never across an await. Dispatch clones
//! the outbound sender out of the map before awaiting anything, and all of
//! disconnect cleanup (remove handle, cancel keepalive, fail pendings,
//! unregister) runs synchronously so no caller can observe a half-dead
//! session.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use unibridge_core::{BridgeError, BridgeResult, CommandId, SessionId};

use crate::auth::AuthGate;
use crate::config::HubConfig;
use crate::connection::{self, CloseReason};
use crate::error::HubResult;
use crate::keepalive::LastPong;
use crate::pending::PendingCommands;
use crate::protocol::{self, ServerMessage};
use crate::registry::{PluginSession, SessionRegistry};

/// Hook fired after a session's tool manifest is replaced.
///
/// Single-project deployments use this to re-export the global tool surface
/// whenever the connected project's manifest changes.
#[async_trait::async_trait]
pub trait ToolsChangedHook: Send + Sync {
    /// Called with a snapshot of the session whose tools changed.
    async fn tools_changed(&self, session: &PluginSession);
}

/// Point-in-time observability snapshot of the hub.
#[derive(Debug, Clone, Serialize)]
pub struct HubStatus {
    /// Registered sessions.
    pub sessions: usize,
    /// Live transports.
    pub connections: usize,
    /// Commands currently awaiting a result.
    pub pending_commands: usize,
    /// Seconds since the hub was created.
    pub uptime_secs: u64,
}

/// Live transport state for one connected plugin.
pub(crate) struct ConnectionHandle {
    /// Outbound frames to the writer task.
    pub(crate) outbound: mpsc::Sender<ServerMessage>,
    /// Signals the read loop to close (eviction, keepalive death).
    pub(crate) close: mpsc::Sender<CloseReason>,
    /// Shared last-pong timestamp for the keepalive supervisor.
    pub(crate) last_pong: LastPong,
    /// The keepalive supervisor task; aborted on disconnect.
    pub(crate) keepalive: JoinHandle<()>,
}

/// Owns every plugin connection and dispatches commands over them.
pub struct ConnectionHub {
    config: HubConfig,
    registry: Arc<SessionRegistry>,
    auth: Option<Arc<AuthGate>>,
    connections: Mutex<HashMap<SessionId, ConnectionHandle>>,
    pending: PendingCommands,
    tools_hook: Option<Arc<dyn ToolsChangedHook>>,
    shutdown_tx: broadcast::Sender<()>,
    started_at: Instant,
}

impl ConnectionHub {
    /// Create a hub over the given registry.
    #[must_use]
    pub fn new(config: HubConfig, registry: Arc<SessionRegistry>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            config,
            registry,
            auth: None,
            connections: Mutex::new(HashMap::new()),
            pending: PendingCommands::new(),
            tools_hook: None,
            shutdown_tx,
            started_at: Instant::now(),
        }
    }

    /// Attach the auth gate used for remote-hosted connects.
    #[must_use]
    pub fn with_auth(mut self, auth: AuthGate) -> Self {
        self.auth = Some(Arc::new(auth));
        self
    }

    /// Attach the tools-changed propagation hook.
    #[must_use]
    pub fn with_tools_hook(mut self, hook: Arc<dyn ToolsChangedHook>) -> Self {
        self.tools_hook = Some(hook);
        self
    }

    /// The hub configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// The session registry this hub feeds.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub(crate) fn auth(&self) -> Option<&Arc<AuthGate>> {
        self.auth.as_ref()
    }

    pub(crate) fn tools_hook(&self) -> Option<&Arc<dyn ToolsChangedHook>> {
        self.tools_hook.as_ref()
    }

    pub(crate) fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Broadcast shutdown: the accept loop stops and every connection's
    /// read loop and keepalive supervisor exits.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Accept plugin connections until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error only if the listener's local address cannot be
    /// read; individual accept failures are logged and survived.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> HubResult<()> {
        let addr = listener.local_addr()?;
        info!(%addr, remote_hosted = self.config.remote_hosted, "Bridge listening");
        let mut shutdown = self.subscribe_shutdown();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Accept loop stopping");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let hub = Arc::clone(&self);
                        tokio::spawn(async move {
                            connection::handle_connection(hub, stream, peer).await;
                        });
                    },
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                    },
                },
            }
        }
    }

    /// Dispatch a command to a session and await its correlated result.
    ///
    /// Fast-fail commands (see [`protocol::FAST_FAIL_COMMANDS`]) always run
    /// under the short fast-fail timeout regardless of `timeout_secs`; on
    /// expiry they surface [`BridgeError::EditorBusy`], a retryable
    /// outcome. All other commands use the caller timeout clamped into the
    /// configured range, with a small server-side grace on top of the value
    /// told to the plugin.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotConnected`] when the session has no live
    /// transport; [`BridgeError::Disconnected`] when the connection drops
    /// mid-command; [`BridgeError::Timeout`] / [`BridgeError::EditorBusy`]
    /// on expiry; or whatever error the plugin's result carries.
    pub async fn send_command(
        &self,
        session_id: SessionId,
        command: &str,
        params: Value,
        timeout_secs: Option<u64>,
    ) -> BridgeResult<Value> {
        let outbound = self
            .connections_lock()
            .get(&session_id)
            .map(|handle| handle.outbound.clone())
            .ok_or(BridgeError::NotConnected { session_id })?;

        let fast_fail = protocol::is_fast_fail(command);
        let plugin_timeout_secs = if fast_fail {
            self.config.command.fast_fail_timeout_secs
        } else {
            self.config.command.clamp_timeout(timeout_secs)
        };
        // Fast-fail commands get no grace: the whole point is a hard bound
        // on how long a status poll can stall the caller.
        let budget = if fast_fail {
            self.config.command.fast_fail_timeout()
        } else {
            self.config.command.wait_budget(plugin_timeout_secs)
        };

        let id = CommandId::new();
        let rx = self.pending.insert(id, session_id);

        // Disconnect cleanup fails every pending entry it can see; an entry
        // inserted after cleanup ran would dangle until its timeout. Re-check
        // the connection under the lock now that the entry is visible.
        if !self.connections_lock().contains_key(&session_id) {
            self.pending.remove(id);
            return Err(BridgeError::Disconnected { session_id });
        }

        debug!(
            session = %session_id,
            command,
            command_id = %id,
            timeout_secs = plugin_timeout_secs,
            "Dispatching command"
        );

        let frame = ServerMessage::ExecuteCommand {
            id,
            name: command.to_string(),
            params,
            timeout_secs: plugin_timeout_secs,
        };
        if outbound.send(frame).await.is_err() {
            // Writer gone: the connection is mid-teardown. Resolve our own
            // entry rather than leaving it for disconnect cleanup.
            self.pending.remove(id);
            return Err(BridgeError::Disconnected { session_id });
        }

        match tokio::time::timeout(budget, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_recv_dropped)) => {
                // The sender vanished without resolving — treat exactly
                // like a disconnect.
                self.pending.remove(id);
                Err(BridgeError::Disconnected { session_id })
            },
            Err(_elapsed) => {
                self.pending.remove(id);
                if fast_fail {
                    Err(BridgeError::EditorBusy {
                        command: command.to_string(),
                    })
                } else {
                    Err(BridgeError::Timeout {
                        command: command.to_string(),
                        timeout_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
                    })
                }
            },
        }
    }

    /// Observability snapshot.
    #[must_use]
    pub fn status(&self) -> HubStatus {
        HubStatus {
            sessions: self.registry.len(),
            connections: self.connections_lock().len(),
            pending_commands: self.pending.len(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    fn connections_lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, ConnectionHandle>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Install the transport handle for a freshly registered session.
    pub(crate) fn install_connection(&self, session_id: SessionId, handle: ConnectionHandle) {
        self.connections_lock().insert(session_id, handle);
    }

    /// Deliver a `command_result` frame to its waiting dispatcher.
    pub(crate) fn deliver_result(&self, id: CommandId, result: Value) {
        if !self.pending.resolve(id, Ok(result)) {
            debug!(command_id = %id, "Dropping result for unknown command id");
        }
    }

    /// Record a keepalive acknowledgment.
    pub(crate) fn record_pong(&self, session_id: SessionId) {
        if let Some(handle) = self.connections_lock().get(&session_id) {
            crate::keepalive::touch_last_pong(&handle.last_pong);
        }
        self.registry.touch(session_id);
    }

    /// Tear down a session: remove the transport record, cancel its
    /// keepalive supervisor, resolve every owned pending command with
    /// `Disconnected`, and unregister it. Idempotent — safe to run from
    /// both the eviction path and the read loop's exit path.
    pub(crate) fn cleanup_session(&self, session_id: SessionId, reason: &str) {
        let handle = self.connections_lock().remove(&session_id);
        if let Some(handle) = &handle {
            handle.keepalive.abort();
        }
        let cancelled = self.pending.fail_session(session_id);
        self.registry.unregister(session_id);
        if handle.is_some() {
            info!(session = %session_id, cancelled, reason, "Session disconnected");
        }
    }

    /// Tear down a session that was displaced by a newer registration for
    /// the same `(tenant, project_hash)` key, and tell its read loop to
    /// close the socket.
    pub(crate) fn evict_superseded(&self, old_id: SessionId) {
        let close = self
            .connections_lock()
            .get(&old_id)
            .map(|handle| handle.close.clone());
        if let Some(close) = close {
            let _ = close.try_send(CloseReason::Superseded);
        }
        self.cleanup_session(old_id, "superseded by newer registration");
    }
}

impl std::fmt::Debug for ConnectionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHub")
            .field("remote_hosted", &self.config.remote_hosted)
            .field("connections", &self.connections_lock().len())
            .finish_non_exhaustive()
    }
}
