//! Hub configuration.
//!
//! Loaded from a TOML file (`unibridge.toml`); every field has a default so
//! a missing file or empty table yields a working local-mode config.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{HubError, HubResult};

/// Hard ceiling on the resolver's reconnect wait, regardless of what the
/// configuration asks for. The wait exists only to bridge Unity's
/// domain-reload disconnect/reconnect window; anything longer just hides a
/// dead Editor from the caller.
pub const RESOLVER_WAIT_HARD_CAP: Duration = Duration::from_secs(20);

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Address the `WebSocket` listener binds to.
    pub listen_addr: Option<String>,
    /// Remote-hosted (multi-tenant) mode: require API keys at connect and
    /// scope every lookup by user.
    pub remote_hosted: bool,
    /// Keepalive supervision settings.
    pub keepalive: KeepaliveConfig,
    /// Command dispatch timeout settings.
    pub command: CommandConfig,
    /// Instance resolver settings.
    pub resolver: ResolverConfig,
    /// API-key validation settings (remote-hosted mode only).
    pub auth: AuthConfig,
}

impl HubConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation rejects the values.
    pub fn load(path: impl AsRef<Path>) -> HubResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde defaults cannot express.
    ///
    /// # Errors
    ///
    /// Returns an error for zero intervals or an inverted timeout clamp.
    pub fn validate(&self) -> HubResult<()> {
        if self.keepalive.interval_secs == 0 {
            return Err(HubError::Config(
                "keepalive.interval_secs must be non-zero".into(),
            ));
        }
        if self.keepalive.dead_after_secs == 0 {
            return Err(HubError::Config(
                "keepalive.dead_after_secs must be non-zero".into(),
            ));
        }
        if self.command.min_timeout_secs > self.command.max_timeout_secs {
            return Err(HubError::Config(
                "command.min_timeout_secs exceeds command.max_timeout_secs".into(),
            ));
        }
        if self.command.fast_fail_timeout_secs == 0 {
            return Err(HubError::Config(
                "command.fast_fail_timeout_secs must be non-zero".into(),
            ));
        }
        if self.resolver.poll_interval_ms == 0 {
            return Err(HubError::Config(
                "resolver.poll_interval_ms must be non-zero".into(),
            ));
        }
        if self.remote_hosted && self.auth.endpoint.is_none() {
            return Err(HubError::Config(
                "auth.endpoint is required in remote-hosted mode".into(),
            ));
        }
        Ok(())
    }

    /// The listen address, defaulting to loopback.
    #[must_use]
    pub fn listen_addr(&self) -> &str {
        self.listen_addr.as_deref().unwrap_or("127.0.0.1:8090")
    }
}

/// Keepalive supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Seconds between pings.
    pub interval_secs: u64,
    /// Seconds without a pong before the connection is declared dead.
    pub dead_after_secs: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            dead_after_secs: 20,
        }
    }
}

impl KeepaliveConfig {
    /// Ping interval as a [`Duration`].
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Dead-connection threshold as a [`Duration`].
    #[must_use]
    pub fn dead_after(&self) -> Duration {
        Duration::from_secs(self.dead_after_secs)
    }
}

/// Command dispatch timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Default timeout when the caller does not supply one.
    pub default_timeout_secs: u64,
    /// Timeout applied to fast-fail (status/log-style) commands regardless
    /// of caller input.
    pub fast_fail_timeout_secs: u64,
    /// Lower clamp for caller-supplied timeouts.
    pub min_timeout_secs: u64,
    /// Upper clamp for caller-supplied timeouts.
    pub max_timeout_secs: u64,
    /// Extra server-side wait on top of the timeout told to the plugin,
    /// absorbing transport overhead.
    pub dispatch_grace_secs: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30,
            fast_fail_timeout_secs: 2,
            min_timeout_secs: 1,
            max_timeout_secs: 3600,
            dispatch_grace_secs: 5,
        }
    }
}

impl CommandConfig {
    /// Clamp a caller-supplied timeout into the allowed range.
    #[must_use]
    pub fn clamp_timeout(&self, requested_secs: Option<u64>) -> u64 {
        requested_secs
            .unwrap_or(self.default_timeout_secs)
            .clamp(self.min_timeout_secs, self.max_timeout_secs)
    }

    /// Fast-fail timeout as a [`Duration`].
    #[must_use]
    pub fn fast_fail_timeout(&self) -> Duration {
        Duration::from_secs(self.fast_fail_timeout_secs)
    }

    /// Server-side wait budget for a command the plugin was told to finish
    /// within `plugin_timeout_secs`.
    #[must_use]
    pub fn wait_budget(&self, plugin_timeout_secs: u64) -> Duration {
        Duration::from_secs(plugin_timeout_secs.saturating_add(self.dispatch_grace_secs))
    }
}

/// Instance resolver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Ceiling on the reconnect wait, in seconds. Hard-capped at
    /// [`RESOLVER_WAIT_HARD_CAP`] no matter what is configured.
    pub wait_ceiling_secs: u64,
    /// Poll interval inside the wait loop, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            wait_ceiling_secs: 20,
            poll_interval_ms: 250,
        }
    }
}

impl ResolverConfig {
    /// The effective wait ceiling (configured value, hard-capped).
    #[must_use]
    pub fn ceiling(&self) -> Duration {
        Duration::from_secs(self.wait_ceiling_secs).min(RESOLVER_WAIT_HARD_CAP)
    }

    /// The poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// API-key validation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Validation endpoint URL. Required in remote-hosted mode.
    pub endpoint: Option<String>,
    /// Seconds a definitive validation outcome stays cached.
    pub cache_ttl_secs: u64,
    /// Per-request timeout for the validation call, in seconds.
    pub request_timeout_secs: u64,
    /// Retries after a transport failure (not after a definitive answer).
    pub max_retries: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            cache_ttl_secs: 300,
            request_timeout_secs: 5,
            max_retries: 1,
        }
    }
}

impl AuthConfig {
    /// Cache TTL as a [`Duration`].
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Request timeout as a [`Duration`].
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
