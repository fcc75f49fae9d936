//! Pending-command correlation table.
//!
//! Every dispatched command parks a one-shot completion channel here keyed
//! by its `CommandId`. A `command_result` frame, a timeout, or the owning
//! connection's death resolves the entry; whichever path wins removes it,
//! so the table always returns to its pre-dispatch size.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::oneshot;

use unibridge_core::{BridgeError, BridgeResult, CommandId, SessionId};

/// The outcome delivered to a waiting dispatcher.
pub(crate) type CommandReply = BridgeResult<Value>;

struct Pending {
    session_id: SessionId,
    tx: oneshot::Sender<CommandReply>,
}

/// Table of in-flight commands, shared between the dispatch path and the
/// per-connection read loops.
#[derive(Default)]
pub(crate) struct PendingCommands {
    inner: Mutex<HashMap<CommandId, Pending>>,
}

impl PendingCommands {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CommandId, Pending>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park a new pending command and hand back the receiver the dispatcher
    /// awaits. Random ids make collisions impossible in practice; an
    /// existing entry under the same id would be a bug upstream.
    pub(crate) fn insert(
        &self,
        id: CommandId,
        session_id: SessionId,
    ) -> oneshot::Receiver<CommandReply> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, Pending { session_id, tx });
        rx
    }

    /// Resolve one pending command. Returns `false` when the id is unknown
    /// (already resolved, timed out, or never ours).
    pub(crate) fn resolve(&self, id: CommandId, reply: CommandReply) -> bool {
        match self.lock().remove(&id) {
            Some(pending) => {
                // The dispatcher may have given up (timeout) between our
                // removal and this send; that is fine, the entry is gone
                // either way.
                let _ = pending.tx.send(reply);
                true
            },
            None => false,
        }
    }

    /// Resolve every command owned by a session with `Disconnected`.
    ///
    /// Called synchronously from disconnect handling so no caller is left
    /// to ride out its full timeout against a dead connection.
    pub(crate) fn fail_session(&self, session_id: SessionId) -> usize {
        let drained: Vec<Pending> = {
            let mut map = self.lock();
            let ids: Vec<CommandId> = map
                .iter()
                .filter(|(_, p)| p.session_id == session_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| map.remove(&id)).collect()
        };
        let count = drained.len();
        for pending in drained {
            let _ = pending
                .tx
                .send(Err(BridgeError::Disconnected { session_id }));
        }
        count
    }

    /// Drop an entry without resolving it (dispatcher-side cleanup after a
    /// timeout). Returns `false` when the entry was already resolved.
    pub(crate) fn remove(&self, id: CommandId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Number of commands currently in flight.
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_to_waiter() {
        let pending = PendingCommands::new();
        let id = CommandId::new();
        let rx = pending.insert(id, SessionId::new());

        assert!(pending.resolve(id, Ok(serde_json::json!({"ok": true}))));
        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply["ok"], true);
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn resolve_unknown_id_is_reported() {
        let pending = PendingCommands::new();
        assert!(!pending.resolve(CommandId::new(), Ok(Value::Null)));
    }

    #[tokio::test]
    async fn fail_session_only_hits_that_session() {
        let pending = PendingCommands::new();
        let victim = SessionId::new();
        let bystander = SessionId::new();

        let rx_victim = pending.insert(CommandId::new(), victim);
        let rx_victim2 = pending.insert(CommandId::new(), victim);
        let rx_bystander = pending.insert(CommandId::new(), bystander);

        assert_eq!(pending.fail_session(victim), 2);
        assert_eq!(pending.len(), 1);

        for rx in [rx_victim, rx_victim2] {
            let err = rx.await.unwrap().unwrap_err();
            assert!(matches!(
                err,
                BridgeError::Disconnected { session_id } if session_id == victim
            ));
        }

        // The bystander's command is untouched.
        assert!(pending.resolve(
            {
                let map = pending.lock();
                *map.keys().next().unwrap()
            },
            Ok(Value::Null)
        ));
        assert!(rx_bystander.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn remove_after_timeout_leaves_no_trace() {
        let pending = PendingCommands::new();
        let id = CommandId::new();
        let rx = pending.insert(id, SessionId::new());
        drop(rx);

        assert!(pending.remove(id));
        assert!(!pending.remove(id));
        assert_eq!(pending.len(), 0);
    }
}
