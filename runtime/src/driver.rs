//! Driver operation dispatch.
//!
//! Two halves of the driver protocol:
//!
//! - [`OperationDispatcher`] runs on the driver. It keeps one backend per bucket, shared by every
//!   client registered on that bucket, executes each operation on the blocking pool and answers
//!   with a [`DriverResponse`] echoing the request's token.
//! - [`DriverClient`] runs on the requester. It correlates responses with requests by
//!   [`CompletionToken`], exactly as a component endpoint correlates calls by reference.
//!
//! Neither side ever blocks a caller while an operation runs.

use crate::config::DispatcherConfig;
use crate::error::DispatchError;
use crate::metrics::{CallMetrics, DriverMetrics};
use crate::ViolationLog;
use crate::health::{HealthCheck, HealthStatus};
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use switchyard_core::completion::{DeferredCompletion, Failure, FailureKind, Trigger};
use switchyard_core::correlation::{CorrelationError, CorrelationTable};
use switchyard_core::driver::{
    CompletionToken, DriverReply, DriverRequest, DriverResponse, Operation, OperationBackend,
    OperationBackendFactory, OperationOutcome,
};
use switchyard_core::transport::TransportError;
use tokio::runtime::Handle;

/// Executes driver requests against per-bucket backends.
///
/// Cloning yields another handle onto the same dispatcher.
#[derive(Clone)]
pub struct OperationDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    config: DispatcherConfig,
    factory: Arc<dyn OperationBackendFactory>,
    registry: Mutex<Registry>,
    pending: CorrelationTable<CompletionToken, Trigger<DriverResponse>>,
    destroyed: AtomicBool,
    runtime: Handle,
}

#[derive(Default)]
struct Registry {
    /// client id → bucket
    clients: HashMap<String, String>,
    /// bucket → shared backend
    buckets: HashMap<String, SharedBackend>,
}

struct SharedBackend {
    backend: Arc<dyn OperationBackend>,
    clients: usize,
}

impl OperationDispatcher {
    /// Create a dispatcher running operations on the current tokio runtime
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NoRuntime`] when called outside a tokio runtime.
    pub fn new(
        factory: Arc<dyn OperationBackendFactory>,
        config: DispatcherConfig,
    ) -> Result<Self, DispatchError> {
        let runtime = Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;
        Ok(Self::with_handle(factory, config, runtime))
    }

    /// Create a dispatcher running operations on `runtime`
    #[must_use]
    pub fn with_handle(
        factory: Arc<dyn OperationBackendFactory>,
        config: DispatcherConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                factory,
                registry: Mutex::new(Registry::default()),
                pending: CorrelationTable::new(),
                destroyed: AtomicBool::new(false),
                runtime,
            }),
        }
    }

    /// Register `client_id` on `bucket`
    ///
    /// The first client of a bucket creates its backend; later clients share it.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Destroyed`], [`DispatchError::DuplicateClient`], or
    /// [`DispatchError::Backend`] if the backend cannot be created.
    #[tracing::instrument(skip(self), fields(dispatcher = %self.inner.config.name))]
    pub fn register_client(&self, client_id: &str, bucket: &str) -> Result<(), DispatchError> {
        self.ensure_live()?;
        {
            let mut registry = self.inner.lock();
            if registry.clients.contains_key(client_id) {
                return Err(DispatchError::DuplicateClient(client_id.to_string()));
            }
            if registry.join(client_id, bucket) {
                tracing::debug!("client registered");
                return Ok(());
            }
        }

        // Backends may be slow to open; build one without holding the registry
        let backend = self.inner.factory.create(bucket)?;

        let surplus = {
            let mut registry = self.inner.lock();
            if registry.clients.contains_key(client_id) {
                drop(registry);
                backend.close();
                return Err(DispatchError::DuplicateClient(client_id.to_string()));
            }
            if registry.join(client_id, bucket) {
                Some(backend)
            } else {
                tracing::info!(bucket, "created backend");
                registry.buckets.insert(
                    bucket.to_string(),
                    SharedBackend {
                        backend,
                        clients: 1,
                    },
                );
                registry
                    .clients
                    .insert(client_id.to_string(), bucket.to_string());
                DriverMetrics::record_backends(registry.buckets.len());
                None
            }
        };

        // Another registration opened the bucket first
        if let Some(backend) = surplus {
            backend.close();
            tracing::debug!(bucket, "closed surplus backend");
        }
        tracing::debug!("client registered");
        Ok(())
    }

    /// Remove `client_id`; the last client of a bucket closes its backend
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownClient`] if the client is not registered.
    #[tracing::instrument(skip(self), fields(dispatcher = %self.inner.config.name))]
    pub fn unregister_client(&self, client_id: &str) -> Result<(), DispatchError> {
        let released = {
            let mut registry = self.inner.lock();
            let bucket = registry
                .clients
                .remove(client_id)
                .ok_or_else(|| DispatchError::UnknownClient(client_id.to_string()))?;

            let last = registry.buckets.get_mut(&bucket).is_some_and(|shared| {
                shared.clients = shared.clients.saturating_sub(1);
                shared.clients == 0
            });
            let released = if last {
                registry
                    .buckets
                    .remove(&bucket)
                    .map(|shared| (bucket, shared.backend))
            } else {
                None
            };
            DriverMetrics::record_backends(registry.buckets.len());
            released
        };

        if let Some((bucket, backend)) = released {
            backend.close();
            tracing::info!(%bucket, "closed backend");
        }
        tracing::debug!("client unregistered");
        Ok(())
    }

    /// Execute `request` against its client's backend
    ///
    /// The returned completion resolves with a response echoing the request's token once the
    /// operation has run on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Destroyed`], [`DispatchError::UnknownClient`],
    /// [`DispatchError::Overloaded`] or [`DispatchError::Correlation`] for a token already in
    /// flight. Backend failures are not errors here; they become [`DriverReply::Error`].
    pub fn dispatch(
        &self,
        request: DriverRequest,
    ) -> Result<DeferredCompletion<DriverResponse>, DispatchError> {
        self.ensure_live()?;
        let DriverRequest { token, operation } = request;

        let backend = {
            let registry = self.inner.lock();
            registry
                .clients
                .get(&token.client_id)
                .and_then(|bucket| registry.buckets.get(bucket))
                .map(|shared| Arc::clone(&shared.backend))
                .ok_or_else(|| DispatchError::UnknownClient(token.client_id.clone()))?
        };

        let limit = self.inner.config.max_pending_operations;
        let (response, trigger) = DeferredCompletion::pending();
        match self.inner.pending.put_bounded(token.clone(), trigger, limit) {
            Ok(()) => {},
            Err(CorrelationError::Full { limit }) => {
                tracing::warn!(%token, limit, "too many operations in flight; refusing");
                return Err(DispatchError::Overloaded { limit });
            },
            Err(error) => return Err(error.into()),
        }
        tracing::debug!(%token, operation = %operation.name, "dispatching operation");

        let inner = Arc::clone(&self.inner);
        drop(self.inner.runtime.spawn_blocking(move || {
            let reply = execute(backend.as_ref(), &operation);
            let response = DriverResponse {
                token: token.clone(),
                reply,
            };
            if inner.pending.complete(&token, Ok(response)).is_err() {
                tracing::debug!(%token, "dispatcher destroyed before operation finished");
            }
        }));
        Ok(response)
    }

    /// Execute `request`, answering refusals with an error reply
    ///
    /// Unlike [`OperationDispatcher::dispatch`] this always produces a response echoing the
    /// request's token, which is what a driver sends back over the wire.
    pub fn handle(&self, request: DriverRequest) -> DeferredCompletion<DriverResponse> {
        let token = request.token.clone();
        match self.dispatch(request) {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(%token, %error, "refusing driver request");
                DriverMetrics::record_error();
                DeferredCompletion::succeeded(DriverResponse {
                    token,
                    reply: DriverReply::Error {
                        message: error.to_string(),
                    },
                })
            },
        }
    }

    /// Fail pending operations and close every backend
    ///
    /// Idempotent. Operations still running finish on the blocking pool but their results are
    /// discarded.
    #[tracing::instrument(skip(self), fields(dispatcher = %self.inner.config.name))]
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        let failed = self
            .inner
            .pending
            .fail_all(&Failure::channel_closed("driver dispatcher destroyed"));

        let backends: Vec<_> = {
            let mut registry = self.inner.lock();
            registry.clients.clear();
            registry.buckets.drain().collect()
        };
        DriverMetrics::record_backends(0);
        for (bucket, shared) in backends {
            shared.backend.close();
            tracing::debug!(%bucket, "closed backend");
        }
        tracing::info!(failed, "driver dispatcher destroyed");
    }

    /// Number of operations in flight
    #[must_use]
    pub fn pending_operations(&self) -> usize {
        self.inner.pending.len()
    }

    /// Number of registered clients
    #[must_use]
    pub fn clients(&self) -> usize {
        self.inner.lock().clients.len()
    }

    /// Number of live backends
    #[must_use]
    pub fn backends(&self) -> usize {
        self.inner.lock().buckets.len()
    }

    /// Health of this dispatcher
    ///
    /// Degraded once in-flight operations reach [`DEGRADED_LOAD_PERCENT`] of the configured
    /// limit; unhealthy once destroyed.
    ///
    /// [`DEGRADED_LOAD_PERCENT`]: crate::health::DEGRADED_LOAD_PERCENT
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        let subject = format!("driver:{}", self.inner.config.name);
        let pending = self.pending_operations();
        let limit = self.inner.config.max_pending_operations;

        let check = if self.inner.destroyed.load(Ordering::SeqCst) {
            HealthCheck::new(subject, HealthStatus::Unhealthy).because("dispatcher destroyed")
        } else {
            let status = HealthStatus::of_load(pending, limit);
            let check = HealthCheck::new(subject, status);
            if status.is_degraded() {
                check.because(format!("{pending} operations in flight (limit {limit})"))
            } else {
                check
            }
        };

        check
            .with_figure("pending_operations", pending)
            .with_figure("clients", self.clients())
            .with_figure("backends", self.backends())
    }

    fn ensure_live(&self) -> Result<(), DispatchError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            Err(DispatchError::Destroyed)
        } else {
            Ok(())
        }
    }
}

impl DispatcherInner {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Registry {
    /// Add `client_id` to `bucket` if its backend is already open
    fn join(&mut self, client_id: &str, bucket: &str) -> bool {
        let Some(shared) = self.buckets.get_mut(bucket) else {
            return false;
        };
        shared.clients += 1;
        self.clients
            .insert(client_id.to_string(), bucket.to_string());
        true
    }
}

impl fmt::Debug for OperationDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationDispatcher")
            .field("name", &self.inner.config.name)
            .field("pending_operations", &self.pending_operations())
            .field("clients", &self.clients())
            .finish_non_exhaustive()
    }
}

fn execute(backend: &dyn OperationBackend, operation: &Operation) -> DriverReply {
    let started = Instant::now();
    let result = catch_unwind(AssertUnwindSafe(|| backend.execute(operation)));
    DriverMetrics::record_operation(started.elapsed());

    match result {
        Ok(Ok(outcome)) => outcome.into(),
        Ok(Err(error)) => {
            DriverMetrics::record_error();
            tracing::warn!(operation = %operation.name, %error, "operation failed");
            DriverReply::Error {
                message: error.to_string(),
            }
        },
        Err(_) => {
            DriverMetrics::record_error();
            tracing::error!(operation = %operation.name, "operation panicked");
            DriverReply::Error {
                message: format!("operation `{}` panicked", operation.name),
            }
        },
    }
}

/// Hands driver requests to the driver, typically over a transport.
pub trait RequestSink: Send + Sync {
    /// Send `request`
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the request could not be handed over.
    fn submit(&self, request: DriverRequest) -> Result<(), TransportError>;
}

/// Requester side of the driver protocol.
pub struct DriverClient {
    client_id: String,
    sink: Arc<dyn RequestSink>,
    pending: CorrelationTable<CompletionToken, Trigger<OperationOutcome>>,
    violations: ViolationLog,
}

impl DriverClient {
    /// Create a client identified as `client_id`
    #[must_use]
    pub fn new(client_id: impl Into<String>, sink: Arc<dyn RequestSink>) -> Self {
        Self {
            client_id: client_id.into(),
            sink,
            pending: CorrelationTable::new(),
            violations: ViolationLog::default(),
        }
    }

    /// Keep at most `capacity` protocol violations
    #[must_use]
    pub fn with_violation_log_capacity(mut self, capacity: usize) -> Self {
        self.violations = ViolationLog::new(capacity);
        self
    }

    /// Client identifier stamped on every token
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Send `operation` to the driver
    ///
    /// The token is registered before the request is submitted. A refused submission fails the
    /// completion with a `Transport` failure.
    pub fn request(&self, operation: Operation) -> DeferredCompletion<OperationOutcome> {
        let token = CompletionToken::mint(&self.client_id);
        let (outcome, trigger) = DeferredCompletion::pending();
        if let Err(error) = self.pending.put(token.clone(), trigger) {
            return DeferredCompletion::failed(Failure::new(FailureKind::Internal, error.to_string()));
        }
        CallMetrics::record_issued("driver");
        tracing::debug!(%token, operation = %operation.name, "submitting driver request");

        let request = DriverRequest {
            token: token.clone(),
            operation,
        };
        if let Err(error) = self.sink.submit(request) {
            tracing::warn!(%token, %error, "failed to submit driver request");
            if let Ok(trigger) = self.pending.remove(&token) {
                let _ = trigger.fail(Failure::transport(error.to_string()));
            }
        }
        outcome
    }

    /// Resolve the request `response` answers
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::UnexpectedReference`] for a token with no outstanding
    /// request; the response is recorded as a protocol violation and dropped.
    pub fn handle_response(&self, response: DriverResponse) -> Result<(), CorrelationError> {
        let DriverResponse { token, reply } = response;
        let outcome = match reply {
            DriverReply::Ok => Ok(OperationOutcome::Done),
            DriverReply::NotOk => Ok(OperationOutcome::Rejected),
            DriverReply::Value(value) => Ok(OperationOutcome::Value(value)),
            DriverReply::Error { message } => Err(Failure::remote(message)),
        };

        match self.pending.complete(&token, outcome) {
            Ok(()) => {
                CallMetrics::record_completed("driver");
                Ok(())
            },
            Err(error) => {
                CallMetrics::record_violation("driver");
                tracing::warn!(%token, "unexpected completion token; ignoring");
                self.violations.record(&token, "driver", error.to_string());
                Err(error)
            },
        }
    }

    /// Number of requests awaiting a response
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Protocol violations recorded so far
    #[must_use]
    pub const fn violations(&self) -> &ViolationLog {
        &self.violations
    }

    /// Fail every outstanding request with a `ChannelClosed` failure
    ///
    /// Returns how many requests were failed.
    pub fn close(&self) -> usize {
        let failed = self
            .pending
            .fail_all(&Failure::channel_closed("driver client closed"));
        if failed > 0 {
            CallMetrics::record_orphaned(failed);
        }
        failed
    }
}

impl fmt::Debug for DriverClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverClient")
            .field("client_id", &self.client_id)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;
    use switchyard_core::driver::BackendError;

    #[derive(Default)]
    struct Counter {
        value: Mutex<i64>,
        closed: AtomicUsize,
    }

    impl OperationBackend for Counter {
        fn execute(&self, operation: &Operation) -> Result<OperationOutcome, BackendError> {
            if operation.name == "explode" {
                panic!("backend exploded");
            }
            let mut value = self.value.lock().unwrap();
            match operation.name.as_str() {
                "add" => {
                    *value += operation.arguments.as_i64().unwrap_or(0);
                    Ok(OperationOutcome::Done)
                },
                "read" => Ok(OperationOutcome::Value(json!(*value))),
                "is-zero" if *value == 0 => Ok(OperationOutcome::Done),
                "is-zero" => Ok(OperationOutcome::Rejected),
                other => Err(BackendError::new(format!("unknown operation `{other}`"))),
            }
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CounterFactory {
        created: Mutex<Vec<Arc<Counter>>>,
    }

    impl OperationBackendFactory for CounterFactory {
        fn create(&self, bucket: &str) -> Result<Arc<dyn OperationBackend>, BackendError> {
            if bucket == "missing" {
                return Err(BackendError::new("no such bucket"));
            }
            let backend = Arc::new(Counter::default());
            self.created.lock().unwrap().push(Arc::clone(&backend));
            Ok(backend)
        }
    }

    fn dispatcher() -> (OperationDispatcher, Arc<CounterFactory>) {
        let factory = Arc::new(CounterFactory::default());
        let dispatcher =
            OperationDispatcher::new(Arc::clone(&factory) as _, DispatcherConfig::new("counters"))
                .unwrap();
        (dispatcher, factory)
    }

    fn request(client: &str, name: &str, arguments: serde_json::Value) -> DriverRequest {
        DriverRequest {
            token: CompletionToken::mint(client),
            operation: Operation::new(name, arguments),
        }
    }

    #[tokio::test]
    async fn test_response_echoes_token() {
        let (dispatcher, _) = dispatcher();
        dispatcher.register_client("c1", "b1").unwrap();

        let add = request("c1", "add", json!(5));
        let token = add.token.clone();
        let response = dispatcher.dispatch(add).unwrap().await.unwrap();
        assert_eq!(response.token, token);
        assert_eq!(response.reply, DriverReply::Ok);

        let read = dispatcher.dispatch(request("c1", "read", json!(null))).unwrap().await.unwrap();
        assert_eq!(read.reply, DriverReply::Value(json!(5)));

        let check = dispatcher.dispatch(request("c1", "is-zero", json!(null))).unwrap().await.unwrap();
        assert_eq!(check.reply, DriverReply::NotOk);
        assert_eq!(dispatcher.pending_operations(), 0);
    }

    #[tokio::test]
    async fn test_backend_failures_become_error_replies() {
        let (dispatcher, _) = dispatcher();
        dispatcher.register_client("c1", "b1").unwrap();

        let unknown = dispatcher.dispatch(request("c1", "frobnicate", json!(null))).unwrap().await.unwrap();
        assert!(matches!(unknown.reply, DriverReply::Error { message } if message.contains("frobnicate")));

        let panicked = dispatcher.dispatch(request("c1", "explode", json!(null))).unwrap().await.unwrap();
        assert!(matches!(panicked.reply, DriverReply::Error { .. }));

        // The backend keeps serving after a panic
        let read = dispatcher.dispatch(request("c1", "read", json!(null))).unwrap().await.unwrap();
        assert_eq!(read.reply, DriverReply::Value(json!(0)));
    }

    #[tokio::test]
    async fn test_clients_share_bucket_backend() {
        let (dispatcher, factory) = dispatcher();
        dispatcher.register_client("c1", "b1").unwrap();
        dispatcher.register_client("c2", "b1").unwrap();
        dispatcher.register_client("c3", "b2").unwrap();
        assert_eq!(factory.created.lock().unwrap().len(), 2);
        assert_eq!(dispatcher.backends(), 2);

        dispatcher.dispatch(request("c1", "add", json!(2))).unwrap().await.unwrap();
        let read = dispatcher.dispatch(request("c2", "read", json!(null))).unwrap().await.unwrap();
        assert_eq!(read.reply, DriverReply::Value(json!(2)));

        dispatcher.unregister_client("c1").unwrap();
        let first = Arc::clone(&factory.created.lock().unwrap()[0]);
        assert_eq!(first.closed.load(Ordering::SeqCst), 0);

        dispatcher.unregister_client("c2").unwrap();
        assert_eq!(first.closed.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.backends(), 1);
    }

    /// Holds `create` for the `slow` bucket until the test releases it
    struct GatedFactory {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
        counters: CounterFactory,
    }

    impl OperationBackendFactory for GatedFactory {
        fn create(&self, bucket: &str) -> Result<Arc<dyn OperationBackend>, BackendError> {
            if bucket == "slow" {
                self.entered.lock().unwrap().send(()).unwrap();
                self.release.lock().unwrap().recv().unwrap();
            }
            self.counters.create(bucket)
        }
    }

    fn gated() -> (OperationDispatcher, Arc<GatedFactory>, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered, entered_rx) = mpsc::channel();
        let (release_tx, release) = mpsc::channel();
        let factory = Arc::new(GatedFactory {
            entered: Mutex::new(entered),
            release: Mutex::new(release),
            counters: CounterFactory::default(),
        });
        let dispatcher =
            OperationDispatcher::new(Arc::clone(&factory) as _, DispatcherConfig::new("gated"))
                .unwrap();
        (dispatcher, factory, entered_rx, release_tx)
    }

    #[tokio::test]
    async fn test_slow_backend_does_not_block_other_registrations() {
        let (dispatcher, _factory, entered, release) = gated();
        let slow = {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || dispatcher.register_client("c1", "slow"))
        };
        entered.recv().unwrap();

        dispatcher.register_client("c2", "fast").unwrap();
        dispatcher.unregister_client("c2").unwrap();
        assert_eq!(dispatcher.clients(), 0);

        release.send(()).unwrap();
        slow.join().unwrap().unwrap();
        assert_eq!(dispatcher.clients(), 1);
        assert_eq!(dispatcher.backends(), 1);
    }

    #[tokio::test]
    async fn test_racing_first_clients_share_one_backend() {
        let (dispatcher, factory, entered, release) = gated();
        let racers: Vec<_> = ["c1", "c2"]
            .into_iter()
            .map(|client| {
                let dispatcher = dispatcher.clone();
                thread::spawn(move || dispatcher.register_client(client, "slow"))
            })
            .collect();
        entered.recv().unwrap();
        entered.recv().unwrap();
        release.send(()).unwrap();
        release.send(()).unwrap();
        for racer in racers {
            racer.join().unwrap().unwrap();
        }

        assert_eq!(dispatcher.clients(), 2);
        assert_eq!(dispatcher.backends(), 1);
        let created = factory.counters.created.lock().unwrap();
        assert_eq!(created.len(), 2);
        let closed: usize = created.iter().map(|backend| backend.closed.load(Ordering::SeqCst)).sum();
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn test_client_registered_while_backend_opened_is_duplicate() {
        let (dispatcher, factory, entered, release) = gated();
        let slow = {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || dispatcher.register_client("c1", "slow"))
        };
        entered.recv().unwrap();
        dispatcher.register_client("c1", "fast").unwrap();
        release.send(()).unwrap();

        assert_eq!(
            slow.join().unwrap(),
            Err(DispatchError::DuplicateClient("c1".to_string()))
        );
        assert_eq!(dispatcher.backends(), 1);
        let created = factory.counters.created.lock().unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(created[1].closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_health_reports_registry_figures() {
        let (dispatcher, _) = dispatcher();
        dispatcher.register_client("c1", "b1").unwrap();
        dispatcher.register_client("c2", "b1").unwrap();

        let check = dispatcher.health();
        assert_eq!(check.subject, "driver:counters");
        assert!(check.status.is_healthy());
        assert_eq!(check.reason, None);
        assert_eq!(check.figure("pending_operations"), Some(0));
        assert_eq!(check.figure("clients"), Some(2));
        assert_eq!(check.figure("backends"), Some(1));
    }

    #[tokio::test]
    async fn test_registration_errors() {
        let (dispatcher, _) = dispatcher();
        dispatcher.register_client("c1", "b1").unwrap();

        assert_eq!(
            dispatcher.register_client("c1", "b2"),
            Err(DispatchError::DuplicateClient("c1".to_string()))
        );
        assert!(matches!(
            dispatcher.register_client("c2", "missing"),
            Err(DispatchError::Backend(_))
        ));
        assert_eq!(
            dispatcher.unregister_client("nobody"),
            Err(DispatchError::UnknownClient("nobody".to_string()))
        );
        assert!(matches!(
            dispatcher.dispatch(request("nobody", "read", json!(null))),
            Err(DispatchError::UnknownClient(_))
        ));
    }

    #[tokio::test]
    async fn test_handle_answers_refusals() {
        let (dispatcher, _) = dispatcher();
        let refused = request("nobody", "read", json!(null));
        let token = refused.token.clone();

        let response = dispatcher.handle(refused).await.unwrap();
        assert_eq!(response.token, token);
        assert!(matches!(response.reply, DriverReply::Error { .. }));
    }

    #[tokio::test]
    async fn test_overloaded_dispatcher_refuses() {
        let factory = Arc::new(CounterFactory::default());
        let dispatcher = OperationDispatcher::new(
            factory,
            DispatcherConfig::new("tiny").with_max_pending_operations(0),
        )
        .unwrap();
        dispatcher.register_client("c1", "b1").unwrap();

        assert_eq!(
            dispatcher.dispatch(request("c1", "read", json!(null))).err(),
            Some(DispatchError::Overloaded { limit: 0 })
        );
        let check = dispatcher.health();
        assert!(check.status.is_degraded());
        assert!(check.reason.unwrap().contains("limit 0"));
    }

    #[tokio::test]
    async fn test_destroy_closes_backends() {
        let (dispatcher, factory) = dispatcher();
        dispatcher.register_client("c1", "b1").unwrap();
        dispatcher.destroy();
        dispatcher.destroy();

        assert_eq!(factory.created.lock().unwrap()[0].closed.load(Ordering::SeqCst), 1);
        assert_eq!(
            dispatcher.dispatch(request("c1", "read", json!(null))).err(),
            Some(DispatchError::Destroyed)
        );
        assert!(dispatcher.health().status.is_unhealthy());
    }

    #[test]
    fn test_dispatcher_needs_runtime() {
        let result = OperationDispatcher::new(
            Arc::new(CounterFactory::default()),
            DispatcherConfig::default(),
        );
        assert_eq!(result.err(), Some(DispatchError::NoRuntime));
    }

    #[derive(Default)]
    struct Outbox {
        requests: Mutex<Vec<DriverRequest>>,
        closed: AtomicBool,
    }

    impl RequestSink for Outbox {
        fn submit(&self, request: DriverRequest) -> Result<(), TransportError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            self.requests.lock().unwrap().push(request);
            Ok(())
        }
    }

    #[test]
    fn test_client_resolves_by_token() {
        let outbox = Arc::new(Outbox::default());
        let client = DriverClient::new("c1", Arc::clone(&outbox) as _);

        let first = client.request(Operation::new("get", json!({"key": "a"})));
        let second = client.request(Operation::new("delete", json!({"key": "b"})));
        let third = client.request(Operation::new("set", json!({"key": "c"})));
        let sent = outbox.requests.lock().unwrap().clone();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|request| request.token.client_id == "c1"));

        // Answered out of order
        client
            .handle_response(DriverResponse {
                token: sent[2].token.clone(),
                reply: DriverReply::Error {
                    message: "read-only bucket".to_string(),
                },
            })
            .unwrap();
        client
            .handle_response(DriverResponse {
                token: sent[0].token.clone(),
                reply: DriverReply::Value(json!("va")),
            })
            .unwrap();
        client
            .handle_response(DriverResponse {
                token: sent[1].token.clone(),
                reply: DriverReply::NotOk,
            })
            .unwrap();

        assert_eq!(first.value().unwrap(), OperationOutcome::Value(json!("va")));
        assert_eq!(second.value().unwrap(), OperationOutcome::Rejected);
        let cause = third.cause().unwrap().unwrap();
        assert_eq!(cause.kind(), FailureKind::Remote);
        assert_eq!(client.pending(), 0);
    }

    #[test]
    fn test_client_records_unexpected_tokens() {
        let client = DriverClient::new("c1", Arc::new(Outbox::default()));
        let stray = DriverResponse {
            token: CompletionToken::mint("c1"),
            reply: DriverReply::Ok,
        };

        assert!(matches!(
            client.handle_response(stray),
            Err(CorrelationError::UnexpectedReference(_))
        ));
        assert_eq!(client.violations().len(), 1);
        assert_eq!(client.violations().snapshot()[0].kind, "driver");
    }

    #[test]
    fn test_client_fails_on_refused_submit() {
        let outbox = Arc::new(Outbox::default());
        outbox.closed.store(true, Ordering::SeqCst);
        let client = DriverClient::new("c1", outbox);

        let outcome = client.request(Operation::new("get", json!({"key": "a"})));
        assert_eq!(outcome.cause().unwrap().unwrap().kind(), FailureKind::Transport);
        assert_eq!(client.pending(), 0);
    }

    #[test]
    fn test_client_close_fails_outstanding() {
        let client = DriverClient::new("c1", Arc::new(Outbox::default()));
        let outcome = client.request(Operation::new("get", json!({"key": "a"})));

        assert_eq!(client.close(), 1);
        assert_eq!(outcome.cause().unwrap().unwrap().kind(), FailureKind::ChannelClosed);
    }
}
