//! Unibridge core - shared vocabulary for the Unity bridge daemon.
//!
//! This crate provides:
//! - Opaque identifiers ([`SessionId`], [`CommandId`])
//! - Instance token parsing ([`InstanceToken`])
//! - Tenant scoping ([`TenantKey`])
//! - The caller-facing error taxonomy ([`BridgeError`])
//!
//! Everything here is pure data: no network code, no async. The routing
//! layer in `unibridge-hub` builds on these types.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

mod error;
mod ids;
mod instance;
mod tenant;

pub use error::{BridgeError, BridgeResult};
pub use ids::{CommandId, SessionId};
pub use instance::{InstanceToken, TokenParseError};
pub use tenant::TenantKey;
