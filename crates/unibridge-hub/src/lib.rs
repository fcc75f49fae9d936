//! Unibridge hub - connection and session routing for the Unity bridge.
//!
//! This crate provides:
//! - The `WebSocket` connection hub (handshake, dispatch, keepalive)
//! - The in-memory session registry with tenant-scoped lookups
//! - Instance resolution with a bounded reconnect wait
//! - Per-caller selection state and tool-catalog filtering
//! - The API-key auth gate for remote-hosted deployments
//!
//! # Architecture
//!
//! ```text
//! plugin ──ws──▶ ConnectionHub ──▶ SessionRegistry
//!                    │                   ▲
//!                    ▼                   │
//!               PendingCommands    InstanceResolver ◀── SelectionMiddleware
//! ```
//!
//! A plugin connects, passes the [`auth::AuthGate`] (remote-hosted mode
//! only), and registers; agent calls flow through
//! [`selection::SelectionMiddleware`] and [`resolver::InstanceResolver`]
//! to a session id, which [`hub::ConnectionHub::send_command`] dispatches
//! over the live connection.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod auth;
pub mod config;
mod connection;
pub mod error;
pub mod hub;
mod keepalive;
mod pending;
pub mod protocol;
pub mod registry;
pub mod resolver;
pub mod selection;

pub use auth::{AuthGate, AuthOutcome};
pub use config::{
    AuthConfig, CommandConfig, HubConfig, KeepaliveConfig, RESOLVER_WAIT_HARD_CAP, ResolverConfig,
};
pub use error::{HubError, HubResult};
pub use hub::{ConnectionHub, HubStatus, ToolsChangedHook};
pub use protocol::{PluginMessage, ServerMessage, ToolSpec};
pub use registry::{PluginSession, Registration, SessionRegistry};
pub use resolver::InstanceResolver;
pub use selection::{RequestContext, SelectionMiddleware};
