//! Convenience re-exports for downstream crates.

pub use crate::error::{BridgeError, BridgeResult};
pub use crate::ids::{CommandId, SessionId};
pub use crate::instance::InstanceToken;
pub use crate::tenant::TenantKey;
