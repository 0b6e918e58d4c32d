//! # Switchyard Testing
//!
//! Testing utilities and helpers for Switchyard endpoints and drivers.
//!
//! This crate provides:
//! - A recording transport standing in for the real channel
//! - An endpoint harness that plays the peer of a component endpoint
//! - Scripted call handlers and contained components
//! - In-memory driver backends and request sinks
//! - Property-based testing strategies
//!
//! ## Example
//!
//! ```ignore
//! use switchyard_testing::EndpointHarness;
//!
//! #[tokio::test]
//! async fn test_call_round_trip() {
//!     let harness = EndpointHarness::active(EndpointConfig::new("s1"), None).await.unwrap();
//!
//!     let reply = harness.endpoint().call("kv".into(), "get", json!({"key": "a"}));
//!     harness.flush().await;
//!
//!     let request = harness.sent_calls().remove(0);
//!     harness.reply(&CallReply::succeeded(request.reference, json!("va"))).unwrap();
//!     assert_eq!(reply.await.unwrap(), json!("va"));
//! }
//! ```

/// In-memory driver backends and request sinks
pub mod driver_mocks;

/// Endpoint harness playing the peer
pub mod endpoint_harness;

/// Recording transport
pub mod transport_mocks;

/// Mock call handlers and contained components.
pub mod mocks {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, MutexGuard, PoisonError};
    use switchyard_core::completion::{DeferredCompletion, Failure, Trigger};
    use switchyard_core::identity::CallReference;
    use switchyard_core::message::{CallRequest, CastRequest, Payload};
    use switchyard_runtime::{CallHandler, ContainedComponent};

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[derive(Debug, Clone)]
    enum Behavior {
        Respond(Payload),
        Fail(Failure),
        Defer,
        Panic,
    }

    /// Call handler answering each operation the way the test scripted it
    ///
    /// Operations without a script echo their inputs.
    ///
    /// # Example
    ///
    /// ```
    /// use serde_json::json;
    /// use switchyard_core::message::CallRequest;
    /// use switchyard_runtime::CallHandler;
    /// use switchyard_testing::ScriptedCallHandler;
    ///
    /// let handler = ScriptedCallHandler::new().respond("ping", json!("pong"));
    ///
    /// let reply = handler.called(&CallRequest::new("ping", json!(null)));
    /// assert_eq!(reply.value().unwrap(), json!("pong"));
    ///
    /// let echoed = handler.called(&CallRequest::new("echo", json!(7)));
    /// assert_eq!(echoed.value().unwrap(), json!(7));
    /// assert_eq!(handler.calls().len(), 2);
    /// ```
    #[derive(Debug, Default)]
    pub struct ScriptedCallHandler {
        script: HashMap<String, Behavior>,
        calls: Mutex<Vec<CallRequest>>,
        casts: Mutex<Vec<CastRequest>>,
        deferred: Mutex<Vec<(CallReference, Trigger<Payload>)>>,
    }

    impl ScriptedCallHandler {
        /// Create a handler that echoes every call
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Answer `operation` with `outputs`
        #[must_use]
        pub fn respond(mut self, operation: impl Into<String>, outputs: Payload) -> Self {
            self.script.insert(operation.into(), Behavior::Respond(outputs));
            self
        }

        /// Fail `operation` with `cause`
        #[must_use]
        pub fn fail(mut self, operation: impl Into<String>, cause: Failure) -> Self {
            self.script.insert(operation.into(), Behavior::Fail(cause));
            self
        }

        /// Leave `operation` pending until the test resolves it through
        /// [`ScriptedCallHandler::take_deferred`]
        #[must_use]
        pub fn defer(mut self, operation: impl Into<String>) -> Self {
            self.script.insert(operation.into(), Behavior::Defer);
            self
        }

        /// Panic on `operation`
        #[must_use]
        pub fn panic_on(mut self, operation: impl Into<String>) -> Self {
            self.script.insert(operation.into(), Behavior::Panic);
            self
        }

        /// Calls received so far
        #[must_use]
        pub fn calls(&self) -> Vec<CallRequest> {
            lock(&self.calls).clone()
        }

        /// Casts received so far
        #[must_use]
        pub fn casts(&self) -> Vec<CastRequest> {
            lock(&self.casts).clone()
        }

        /// Take the triggers of deferred calls, oldest first
        #[must_use]
        pub fn take_deferred(&self) -> Vec<(CallReference, Trigger<Payload>)> {
            std::mem::take(&mut *lock(&self.deferred))
        }
    }

    impl CallHandler for ScriptedCallHandler {
        #[allow(clippy::panic)] // Scripted panics exercise handler failure paths
        fn called(&self, request: &CallRequest) -> DeferredCompletion<Payload> {
            lock(&self.calls).push(request.clone());
            match self.script.get(&request.operation).cloned() {
                Some(Behavior::Respond(outputs)) => DeferredCompletion::succeeded(outputs),
                Some(Behavior::Fail(cause)) => DeferredCompletion::failed(cause),
                Some(Behavior::Defer) => {
                    let (reply, trigger) = DeferredCompletion::pending();
                    lock(&self.deferred).push((request.reference, trigger));
                    reply
                },
                Some(Behavior::Panic) => panic!("scripted panic in `{}`", request.operation),
                None => DeferredCompletion::succeeded(request.inputs.clone()),
            }
        }

        fn casted(&self, request: &CastRequest) {
            lock(&self.casts).push(request.clone());
        }
    }

    /// Contained component that counts how often it was destroyed
    #[derive(Debug)]
    pub struct RecordingContained {
        name: String,
        failing: bool,
        destroyed: AtomicUsize,
    }

    impl RecordingContained {
        /// A component whose destruction succeeds
        #[must_use]
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                failing: false,
                destroyed: AtomicUsize::new(0),
            }
        }

        /// A component whose destruction fails
        #[must_use]
        pub fn failing(name: impl Into<String>) -> Self {
            Self {
                failing: true,
                ..Self::new(name)
            }
        }

        /// How many times destruction was attempted
        #[must_use]
        pub fn destroyed(&self) -> usize {
            self.destroyed.load(Ordering::SeqCst)
        }
    }

    impl ContainedComponent for RecordingContained {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn destroy(&self) -> Result<(), Failure> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            if self.failing {
                Err(Failure::handler(format!("{} refused to stop", self.name)))
            } else {
                Ok(())
            }
        }
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use tracing_subscriber::EnvFilter;

    /// Install a test log subscriber honoring `RUST_LOG`; later calls do nothing
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;
    use serde_json::{Value, json};
    use switchyard_core::lifecycle::FsmTransition;

    /// Any lifecycle transition
    pub fn transition() -> impl Strategy<Value = FsmTransition> {
        prop_oneof![
            Just(FsmTransition::CreateCompleted),
            Just(FsmTransition::RegisterCompleted),
            Just(FsmTransition::InitializeCompleted),
            Just(FsmTransition::ExternalDestroy),
            Just(FsmTransition::UnregisterCompleted),
            Just(FsmTransition::InternalFailure),
        ]
    }

    /// Sequences of up to 32 lifecycle transitions
    pub fn transitions() -> impl Strategy<Value = Vec<FsmTransition>> {
        prop::collection::vec(transition(), 0..32)
    }

    /// Small JSON payloads
    pub fn payload() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-z0-9]{0,12}".prop_map(Value::String),
            ("[a-z]{1,6}", any::<i32>())
                .prop_map(|(key, n)| Value::Object(std::iter::once((key, json!(n))).collect())),
        ]
    }

    /// An arrival order for `len` replies
    pub fn arrival_order(len: usize) -> impl Strategy<Value = Vec<usize>> {
        Just((0..len).collect::<Vec<_>>()).prop_shuffle()
    }
}

// Re-export commonly used items
pub use driver_mocks::{MemoryKvBackend, MemoryKvFactory, QueuedRequests};
pub use endpoint_harness::{EndpointHarness, HarnessError};
pub use helpers::init_tracing;
pub use mocks::{RecordingContained, ScriptedCallHandler};
pub use transport_mocks::RecordingTransport;

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use serde_json::json;
    use switchyard_core::completion::FailureKind;
    use switchyard_core::message::CallRequest;
    use switchyard_runtime::{CallHandler, ContainedComponent};

    #[test]
    fn test_scripted_failure_and_deferral() {
        let handler = ScriptedCallHandler::new()
            .fail("boom", switchyard_core::Failure::handler("nope"))
            .defer("slow");

        let failed = handler.called(&CallRequest::new("boom", json!(null)));
        assert_eq!(failed.cause().unwrap().unwrap().kind(), FailureKind::Handler);

        let slow = handler.called(&CallRequest::new("slow", json!(null)));
        assert!(!slow.is_resolved());
        let (_, trigger) = handler.take_deferred().remove(0);
        trigger.succeed(json!(1)).unwrap();
        assert_eq!(slow.value().unwrap(), json!(1));
    }

    #[test]
    fn test_recording_contained() {
        let ok = RecordingContained::new("cache");
        let failing = RecordingContained::failing("pool");

        assert!(ok.destroy().is_ok());
        assert!(failing.destroy().is_err());
        assert_eq!(ok.destroyed(), 1);
        assert_eq!(failing.destroyed(), 1);
    }
}
