//! # Switchyard Runtime
//!
//! Runtime machinery for Switchyard component endpoints.
//!
//! ## Core Components
//!
//! - **Reactor**: serial execution contexts (isolates) and reassignable callback proxies
//! - **State Machine**: transactional lifecycle transitions over a declared graph
//! - **Component Endpoint**: the call protocol: correlation, lifecycle, teardown
//! - **Channel Controller**: envelope codec between an endpoint and its transport
//! - **Driver Dispatch**: token-correlated operation execution for resource drivers
//!
//! ## Example
//!
//! ```ignore
//! use switchyard_runtime::{ComponentEndpoint, EndpointConfig, Reactor};
//!
//! let reactor = Reactor::new()?;
//! let endpoint = ComponentEndpoint::create(&reactor, transport, EndpointConfig::from_env(), None)?;
//!
//! // The host initializes the endpoint once its channel is up
//! endpoint.channel().initialize();
//!
//! let outputs = endpoint.call("kv-store".into(), "get", json!({"key": "a"})).await?;
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Envelope codec over a transport
pub mod channel;

/// Component endpoints and the call protocol
pub mod component;

/// Endpoint and dispatcher configuration
pub mod config;

/// Driver operation dispatch
pub mod driver;

/// Health derived from endpoint, dispatcher and reactor state
pub mod health;

/// Lifecycle transactions
pub mod fsm;

/// Metric names and recorders
pub mod metrics;

/// Isolates and callback proxies
pub mod reactor;

/// Error types for endpoints and dispatchers
pub mod error {
    use crate::channel::ChannelError;
    use crate::fsm::FsmError;
    use crate::reactor::ReactorError;
    use switchyard_core::correlation::CorrelationError;
    use switchyard_core::driver::BackendError;
    use switchyard_core::transport::TransportError;
    use thiserror::Error;

    /// Errors raised while building or driving a component endpoint
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum EndpointError {
        /// The reactor refused an isolate or proxy operation
        #[error(transparent)]
        Reactor(#[from] ReactorError),

        /// A lifecycle transaction was rejected
        #[error(transparent)]
        Lifecycle(#[from] FsmError),

        /// The channel refused an envelope
        #[error(transparent)]
        Channel(#[from] ChannelError),

        /// The endpoint has been cleaned up
        #[error("component endpoint is shut down")]
        ShutDown,
    }

    /// Errors raised by driver dispatch
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum DispatchError {
        /// No tokio runtime to run operations on
        #[error("no tokio runtime available")]
        NoRuntime,

        /// The dispatcher was destroyed
        #[error("dispatcher is destroyed")]
        Destroyed,

        /// The request names a client that never registered
        #[error("unknown client `{0}`")]
        UnknownClient(String),

        /// The client is already registered
        #[error("client `{0}` is already registered")]
        DuplicateClient(String),

        /// Too many operations in flight
        #[error("{limit} operations already in flight")]
        Overloaded {
            /// Configured limit
            limit: usize,
        },

        /// The backend for a bucket could not be created
        #[error("backend unavailable: {0}")]
        Backend(#[from] BackendError),

        /// The request could not be handed to the driver
        #[error(transparent)]
        Transport(#[from] TransportError),

        /// The request's token is already in flight
        #[error(transparent)]
        Correlation(#[from] CorrelationError),
    }
}

/// A reply or token that matched no outstanding request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolViolation {
    /// The unmatched reference or token
    pub reference: String,

    /// Reply kind (`"call"`, `"acquire"`, `"register"`, `"driver"`)
    pub kind: &'static str,

    /// What was wrong
    pub message: String,

    /// When the violation was recorded
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

/// Bounded log of protocol violations
///
/// Violations are logged, counted and dropped; the log keeps the most recent ones for inspection.
/// When full, the oldest entry is dropped.
///
/// # Example
///
/// ```ignore
/// use switchyard_runtime::ViolationLog;
///
/// let log = ViolationLog::new(100);
/// log.record("3f2c...", "call", "no outstanding request");
///
/// for violation in log.drain() {
///     println!("{violation:?}");
/// }
/// ```
#[derive(Debug)]
pub struct ViolationLog {
    entries: Arc<Mutex<VecDeque<ProtocolViolation>>>,
    capacity: usize,
}

impl ViolationLog {
    /// Create a log keeping at most `capacity` entries
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ProtocolViolation>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a violation
    pub fn record(&self, reference: impl fmt::Display, kind: &'static str, message: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.lock();

        // Drop oldest if at capacity
        if entries.len() >= self.capacity {
            entries.pop_front();
            tracing::debug!(capacity = self.capacity, "violation log at capacity, dropping oldest entry");
        }

        entries.push_back(ProtocolViolation {
            reference: reference.to_string(),
            kind,
            message: message.into(),
            recorded_at: chrono::Utc::now(),
        });

        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("switchyard_violation_log_size").set(entries.len() as f64);
    }

    /// Number of entries held
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the held entries, oldest first
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProtocolViolation> {
        self.lock().iter().cloned().collect()
    }

    /// Remove and return every entry
    pub fn drain(&self) -> Vec<ProtocolViolation> {
        let entries: Vec<_> = self.lock().drain(..).collect();
        metrics::gauge!("switchyard_violation_log_size").set(0.0);
        entries
    }

    /// Maximum number of entries held
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Clone for ViolationLog {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            capacity: self.capacity,
        }
    }
}

impl Default for ViolationLog {
    fn default() -> Self {
        Self::new(1000)
    }
}

pub use channel::{ChannelController, ChannelError};
pub use component::{CallHandler, ComponentEndpoint, ContainedComponent};
pub use config::{DispatcherConfig, EndpointConfig};
pub use driver::{DriverClient, OperationDispatcher, RequestSink};
pub use error::{DispatchError, EndpointError};
pub use fsm::{FsmError, StateMachine};
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use reactor::{Proxy, Reactor, ReactorError};

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn test_violation_log_drops_oldest() {
        let log = ViolationLog::new(2);
        log.record("r1", "call", "unexpected");
        log.record("r2", "call", "unexpected");
        log.record("r3", "acquire", "unexpected");

        let held: Vec<_> = log.snapshot().into_iter().map(|v| v.reference).collect();
        assert_eq!(held, vec!["r2", "r3"]);
        assert_eq!(log.drain().len(), 2);
        assert!(log.is_empty());
    }

    #[test]
    fn test_violation_log_with_zero_capacity_keeps_nothing() {
        let log = ViolationLog::new(0);
        log.record("r1", "call", "unexpected");
        assert!(log.is_empty());
    }
}
