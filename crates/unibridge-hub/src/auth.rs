//! API-key validation gate for remote-hosted deployments.
//!
//! Outcomes are three-way, not boolean: a key is valid, rejected, or the
//! validation service itself could not answer. Only the first two are
//! definitive and cacheable; service failures fail closed but are never
//! cached, so the caller can retry immediately instead of being locked out
//! for the cache TTL.
//!
//! Raw keys never reach the logs — only the redacted form.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::error::{HubError, HubResult};

/// Result of validating one API key.
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    /// The key is valid and owned by `user_id`.
    Valid {
        /// The authenticated user.
        user_id: String,
    },
    /// The key was definitively rejected. Not retryable.
    Rejected {
        /// Why the key was rejected.
        reason: String,
    },
    /// The validation service could not answer. Retryable, never cached.
    Unavailable {
        /// What went wrong.
        reason: String,
    },
}

impl AuthOutcome {
    /// Whether this outcome is a definitive answer about the key (as
    /// opposed to a service failure).
    #[must_use]
    pub fn is_definitive(&self) -> bool {
        !matches!(self, Self::Unavailable { .. })
    }
}

/// Wire shape of the validation endpoint's 200 response.
#[derive(Debug, Deserialize)]
struct ValidationResponse {
    valid: bool,
    #[serde(default)]
    user_id: Option<String>,
}

struct CacheEntry {
    outcome: AuthOutcome,
    expires_at: Instant,
}

/// Validates API keys against an external endpoint, with a bounded TTL
/// cache for definitive outcomes.
pub struct AuthGate {
    http: reqwest::Client,
    endpoint: String,
    cache_ttl: Duration,
    max_retries: u32,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl AuthGate {
    /// Build a gate from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if no endpoint is configured or the HTTP client
    /// cannot be built.
    pub fn new(config: &AuthConfig) -> HubResult<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| HubError::Config("auth.endpoint is required".into()))?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| HubError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint,
            cache_ttl: config.cache_ttl(),
            max_retries: config.max_retries,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Validate an API key.
    ///
    /// Empty keys are rejected without a network call. Cached definitive
    /// outcomes are served until their TTL expires. Service failures are
    /// retried up to the configured count, then surfaced as
    /// [`AuthOutcome::Unavailable`].
    pub async fn validate(&self, api_key: &str) -> AuthOutcome {
        if api_key.trim().is_empty() {
            return AuthOutcome::Rejected {
                reason: "empty API key".into(),
            };
        }

        if let Some(outcome) = self.cached(api_key) {
            debug!(key = %redact(api_key), "Validation cache hit");
            return outcome;
        }

        let mut attempt: u32 = 0;
        let outcome = loop {
            let outcome = self.call_endpoint(api_key).await;
            if outcome.is_definitive() || attempt >= self.max_retries {
                break outcome;
            }
            attempt = attempt.saturating_add(1);
            debug!(key = %redact(api_key), attempt, "Retrying key validation");
        };

        match &outcome {
            AuthOutcome::Valid { user_id } => {
                info!(key = %redact(api_key), user = %user_id, "API key validated");
            },
            AuthOutcome::Rejected { reason } => {
                info!(key = %redact(api_key), reason, "API key rejected");
            },
            AuthOutcome::Unavailable { reason } => {
                warn!(key = %redact(api_key), reason, "Key validation unavailable");
            },
        }

        if outcome.is_definitive() {
            self.store(api_key, outcome.clone());
        }
        outcome
    }

    /// One call to the validation endpoint, mapped to an outcome.
    async fn call_endpoint(&self, api_key: &str) -> AuthOutcome {
        let response = match self
            .http
            .post(&self.endpoint)
            .json(&serde_json::json!({ "api_key": api_key }))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return AuthOutcome::Unavailable {
                    reason: format!("validation request failed: {e}"),
                };
            },
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return AuthOutcome::Rejected {
                reason: "validation endpoint returned 401".into(),
            };
        }
        if status != reqwest::StatusCode::OK {
            return AuthOutcome::Unavailable {
                reason: format!("validation endpoint returned {status}"),
            };
        }

        let body: ValidationResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                return AuthOutcome::Unavailable {
                    reason: format!("malformed validation response: {e}"),
                };
            },
        };

        if !body.valid {
            return AuthOutcome::Rejected {
                reason: "key marked invalid".into(),
            };
        }
        match body.user_id.filter(|user_id| !user_id.is_empty()) {
            Some(user_id) => AuthOutcome::Valid { user_id },
            None => AuthOutcome::Unavailable {
                reason: "validation response missing user id".into(),
            },
        }
    }

    fn cached(&self, api_key: &str) -> Option<AuthOutcome> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        match cache.get(api_key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.outcome.clone()),
            Some(_) => {
                cache.remove(api_key);
                None
            },
            None => None,
        }
    }

    fn store(&self, api_key: &str, outcome: AuthOutcome) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.insert(
            api_key.to_owned(),
            CacheEntry {
                outcome,
                expires_at: Instant::now() + self.cache_ttl,
            },
        );
    }
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("endpoint", &self.endpoint)
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}

/// Redact an API key for logging: a short prefix, never the full value.
#[must_use]
pub fn redact(api_key: &str) -> String {
    if api_key.len() > 8 {
        format!("{}…", &api_key[..4])
    } else {
        "***".to_string()
    }
}
