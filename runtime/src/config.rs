//! Endpoint and dispatcher configuration.
//!
//! Values come from code (builders) or from environment variables with sensible defaults.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Operation a component calls to resolve a channel endpoint
pub const DEFAULT_RESOLVE_OPERATION: &str = "mosaic-component:get-channel-data";

/// Component endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Session name of the endpoint's channel
    pub session: String,
    /// Group the endpoint joins once initialized, if any
    pub self_group: Option<String>,
    /// Operation called by channel resolution
    pub resolve_operation: String,
    /// Maximum number of protocol violations kept for inspection
    pub violation_log_capacity: usize,
    /// Default timeout applied by `call`, in milliseconds (none when unset)
    pub call_timeout_ms: Option<u64>,
}

impl EndpointConfig {
    /// Configuration for `session` with defaults everywhere else
    #[must_use]
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            ..Self::default()
        }
    }

    /// Load configuration from `SWITCHYARD_*` environment variables
    ///
    /// - `SWITCHYARD_SESSION` (default: `"default"`)
    /// - `SWITCHYARD_SELF_GROUP` (default: unset)
    /// - `SWITCHYARD_RESOLVE_OPERATION` (default: [`DEFAULT_RESOLVE_OPERATION`])
    /// - `SWITCHYARD_VIOLATION_LOG_CAPACITY` (default: 1000)
    /// - `SWITCHYARD_CALL_TIMEOUT_MS` (default: unset)
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            session: env::var("SWITCHYARD_SESSION").unwrap_or(defaults.session),
            self_group: env::var("SWITCHYARD_SELF_GROUP")
                .ok()
                .filter(|group| !group.is_empty())
                .or(defaults.self_group),
            resolve_operation: env::var("SWITCHYARD_RESOLVE_OPERATION")
                .unwrap_or(defaults.resolve_operation),
            violation_log_capacity: env::var("SWITCHYARD_VIOLATION_LOG_CAPACITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.violation_log_capacity),
            call_timeout_ms: env::var("SWITCHYARD_CALL_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .or(defaults.call_timeout_ms),
        }
    }

    /// Join `group` after initialization
    #[must_use]
    pub fn with_self_group(mut self, group: impl Into<String>) -> Self {
        self.self_group = Some(group.into());
        self
    }

    /// Use `operation` for channel resolution
    #[must_use]
    pub fn with_resolve_operation(mut self, operation: impl Into<String>) -> Self {
        self.resolve_operation = operation.into();
        self
    }

    /// Keep at most `capacity` protocol violations
    #[must_use]
    pub const fn with_violation_log_capacity(mut self, capacity: usize) -> Self {
        self.violation_log_capacity = capacity;
        self
    }

    /// Apply `timeout` to every `call`
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Timeouts beyond u64 milliseconds are not meaningful
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Default call timeout
    #[must_use]
    pub const fn call_timeout(&self) -> Option<Duration> {
        match self.call_timeout_ms {
            Some(millis) => Some(Duration::from_millis(millis)),
            None => None,
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            session: "default".to_string(),
            self_group: None,
            resolve_operation: DEFAULT_RESOLVE_OPERATION.to_string(),
            violation_log_capacity: 1000,
            call_timeout_ms: None,
        }
    }
}

/// Driver dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Identifies the dispatcher in logs
    pub name: String,
    /// Maximum number of operations in flight before requests are refused
    pub max_pending_operations: usize,
}

impl DispatcherConfig {
    /// Configuration named `name` with defaults everywhere else
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Refuse requests once `limit` operations are in flight
    #[must_use]
    pub const fn with_max_pending_operations(mut self, limit: usize) -> Self {
        self.max_pending_operations = limit;
        self
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "driver".to_string(),
            max_pending_operations: 1024,
        }
    }
}
