//! Wire protocol between the daemon and the Unity-side plugin.
//!
//! The envelope is an internally tagged JSON object (`"type"` field). Both
//! directions are closed enums; unknown inbound types deserialize to
//! [`PluginMessage::Unknown`] and are logged and dropped, which keeps the
//! protocol forward-compatible without string dispatch.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use unibridge_core::{CommandId, SessionId};

/// Maximum accepted frame size (10 MB). Oversized frames are a protocol
/// violation and close the connection.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Library-range close codes sent when a connection is refused.
pub mod close_code {
    /// No credential presented in remote-hosted mode.
    pub const AUTH_MISSING: u16 = 4401;
    /// Credential presented but rejected. Not retryable.
    pub const AUTH_REJECTED: u16 = 4403;
    /// The validation service itself failed. Retryable — a well-behaved
    /// plugin reconnects instead of giving up.
    pub const AUTH_UNAVAILABLE: u16 = 4503;
    /// The peer violated the wire protocol.
    pub const PROTOCOL_VIOLATION: u16 = 4002;
}

/// Command types that always run under the short fast-fail timeout,
/// regardless of the caller-supplied value. These are status/log-style
/// queries an agent polls with; letting them queue behind a busy or
/// reloading Editor would stall the whole conversation.
pub const FAST_FAIL_COMMANDS: &[&str] = &[
    "ping",
    "status",
    "get_status",
    "read_logs",
    "get_logs",
    "get_compilation_state",
];

/// Whether a command type belongs to the fast-fail set.
#[must_use]
pub fn is_fast_fail(command: &str) -> bool {
    FAST_FAIL_COMMANDS.contains(&command)
}

/// A tool advertised by a connected Unity project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name (unique within a project).
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// JSON Schema for the tool's parameters.
    #[serde(default = "default_schema")]
    pub input_schema: Value,
    /// Whether results arrive via polling rather than inline.
    #[serde(default)]
    pub requires_polling: bool,
    /// The poll action to use when `requires_polling` is set.
    #[serde(default)]
    pub poll_action: Option<String>,
}

fn default_schema() -> Value {
    serde_json::json!({"type": "object"})
}

impl ToolSpec {
    /// Create a minimal tool spec.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: default_schema(),
            requires_polling: false,
            poll_action: None,
        }
    }
}

/// Messages the plugin sends to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginMessage {
    /// Registration handshake. Sent once after connect.
    Register {
        /// Unity project name (cosmetic).
        project_name: String,
        /// Stable project fingerprint. The canonical instance id.
        project_hash: String,
        /// Unity Editor version string.
        unity_version: String,
        /// Absolute project path, when the plugin knows it.
        #[serde(default)]
        project_path: Option<PathBuf>,
    },
    /// Tool manifest. Replaces the session's tool map wholesale.
    RegisterTools {
        /// Every tool the project currently exposes.
        tools: Vec<ToolSpec>,
    },
    /// Result for a previously dispatched command.
    CommandResult {
        /// Correlation id from the `execute_command` frame.
        id: CommandId,
        /// Opaque result payload.
        result: Value,
    },
    /// Keepalive acknowledgment.
    Pong {
        /// The session acknowledging the ping.
        session_id: SessionId,
    },
    /// Any message type this daemon does not know. Ignored and logged.
    #[serde(other)]
    Unknown,
}

/// Messages the daemon sends to the plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame after connect: server timing hints.
    Welcome {
        /// Default per-command timeout the server applies.
        command_timeout_secs: u64,
        /// Interval at which the server pings.
        keepalive_interval_secs: u64,
    },
    /// Registration accepted; carries the assigned session id.
    Registered {
        /// The freshly minted session id.
        session_id: SessionId,
    },
    /// Dispatch a command to the Editor.
    ExecuteCommand {
        /// Correlation id echoed back in `command_result`.
        id: CommandId,
        /// Command type.
        name: String,
        /// Opaque parameter payload, passed through unchanged.
        params: Value,
        /// Deadline the plugin should honor.
        timeout_secs: u64,
    },
    /// Keepalive probe; the plugin answers with `pong`.
    Ping,
}
