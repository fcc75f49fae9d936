//! Caller-facing error taxonomy for the routing layer.

use thiserror::Error;

use crate::ids::SessionId;

/// Result alias for routing-layer operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors surfaced to the agent-facing layer by the routing core.
///
/// The distinction between [`NotConnected`](BridgeError::NotConnected) and
/// [`Disconnected`](BridgeError::Disconnected) matters: the former means
/// dispatch found no live transport at all, the latter means the transport
/// dropped while the command was outstanding. Only the latter is worth an
/// automatic retry — the plugin is probably mid domain-reload and will be
/// back shortly.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Target session has no live transport.
    #[error("no Unity connection for session {session_id}")]
    NotConnected {
        /// The session that had no transport.
        session_id: SessionId,
    },

    /// The owning connection dropped while the command was outstanding.
    #[error("Unity connection for session {session_id} dropped mid-command")]
    Disconnected {
        /// The session that dropped.
        session_id: SessionId,
    },

    /// The command did not complete within its wait budget.
    #[error("command {command} timed out after {timeout_ms}ms")]
    Timeout {
        /// The command type that timed out.
        command: String,
        /// The wait budget that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// A fast-fail command timed out — the Editor is busy or reloading.
    /// Retry shortly instead of treating this as a failure.
    #[error("editor busy: {command} did not answer within the fast-fail window")]
    EditorBusy {
        /// The command type that was throttled.
        command: String,
    },

    /// No plugin session was available after the full bounded wait.
    #[error("no Unity plugin connected{}", token_suffix(.token))]
    NoSessionAvailable {
        /// The instance token that failed to match, if one was supplied.
        token: Option<String>,
    },

    /// Multiple candidate instances — the caller must pick one explicitly.
    #[error("multiple Unity instances available, select one of: {}", .candidates.join(", "))]
    SelectionRequired {
        /// Tokens of every known candidate instance.
        candidates: Vec<String>,
    },

    /// Credential missing or invalid. Not retryable.
    #[error("authentication rejected: {reason}")]
    AuthRejected {
        /// Why the credential was rejected.
        reason: String,
    },

    /// The validation service itself failed. Retryable.
    #[error("authentication unavailable: {reason}")]
    AuthUnavailable {
        /// What went wrong with the validation call.
        reason: String,
    },

    /// A tenant-scoped operation was invoked without a tenant id while the
    /// deployment is remote-hosted. This is a programming error.
    #[error("tenant id required in remote-hosted mode")]
    TenantRequired,

    /// The peer violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport-level failure (socket closed, write failed, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration rejected at load or use.
    #[error("config error: {0}")]
    Config(String),

    /// JSON encode/decode failure on the wire.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn token_suffix(token: &Option<String>) -> String {
    match token {
        Some(token) => format!(" matching {token:?}"),
        None => String::new(),
    }
}

impl BridgeError {
    /// Whether the agent-facing layer should advertise this outcome as
    /// retryable rather than a hard failure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Disconnected { .. } | Self::EditorBusy { .. } | Self::AuthUnavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        let id = SessionId::new();
        assert!(BridgeError::Disconnected { session_id: id }.is_retryable());
        assert!(
            BridgeError::EditorBusy {
                command: "status".into()
            }
            .is_retryable()
        );
        assert!(
            BridgeError::AuthUnavailable {
                reason: "timeout".into()
            }
            .is_retryable()
        );

        assert!(!BridgeError::NotConnected { session_id: id }.is_retryable());
        assert!(
            !BridgeError::Timeout {
                command: "create_scene".into(),
                timeout_ms: 30_000
            }
            .is_retryable()
        );
        assert!(!BridgeError::TenantRequired.is_retryable());
    }

    #[test]
    fn selection_required_lists_candidates() {
        let err = BridgeError::SelectionRequired {
            candidates: vec!["A@h1".into(), "B@h2".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("A@h1"));
        assert!(msg.contains("B@h2"));
    }

    #[test]
    fn no_session_mentions_token_when_present() {
        let with = BridgeError::NoSessionAvailable {
            token: Some("MyGame@h1".into()),
        };
        assert!(with.to_string().contains("MyGame@h1"));

        let without = BridgeError::NoSessionAvailable { token: None };
        assert!(!without.to_string().contains('"'));
    }
}
