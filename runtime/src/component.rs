//! Component endpoints: the call protocol and its lifecycle.
//!
//! A [`ComponentEndpoint`] owns one isolate and four proxies:
//!
//! | Proxy                   | Bound to                      | Purpose                          |
//! |-------------------------|-------------------------------|----------------------------------|
//! | component callbacks     | endpoint handler              | inbound events from the channel  |
//! | component controller    | the live [`ChannelController`]| outbound requests                |
//! | component connector     | endpoint handler              | application-facing calls         |
//! | channel resolver        | endpoint handler              | channel endpoint resolution      |
//!
//! Its lifecycle is a [`StateMachine`] over [`ComponentLifecycle`]: the three handlers each
//! acknowledge registration (`RegisterPending3 → … → InitializePending`), the channel
//! initializes the endpoint (`Active`), and termination unregisters the handlers one by one down
//! to `Destroyed`. Any internal failure lands in `Failed` and forces cleanup.
//!
//! # Correlation
//!
//! Calls, acquires and registrations share one [`PendingCallTable`]. The entry for a request is
//! inserted **before** the request is sent; it is removed exactly once: by its reply, by a timer
//! ([`ComponentEndpoint::call_with_timeout`]), by a failed send, or by cleanup.
//!
//! # Cleanup
//!
//! Cleanup runs once and never inside a lifecycle transaction. Every step is best-effort: a step
//! that fails is logged and the next one still runs.

use crate::channel::ChannelController;
use crate::config::EndpointConfig;
use crate::error::EndpointError;
use crate::fsm::{FsmError, StateMachine};
use crate::metrics::CallMetrics;
use crate::reactor::{Proxy, Reactor, ReactorError};
use crate::ViolationLog;
use crate::health::{HealthCheck, HealthReport, HealthStatus};
use serde_json::Value;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use switchyard_core::callbacks::{
    CallbackHandler, Callbacks, ChannelResolver, ComponentCallbacks, ComponentConnector,
    ComponentController, ComponentEvent, ConnectorOutput, ConnectorRequest, ControllerRequest,
    HandlerError, Reply, ResolveRequest, ResolvedEndpoint,
};
use switchyard_core::completion::{DeferredCompletion, Failure, FailureKind};
use switchyard_core::correlation::PendingCallTable;
use switchyard_core::identity::{CallReference, ComponentIdentifier, IsolateId, ProxyId};
use switchyard_core::lifecycle::{ComponentLifecycle, FsmState, FsmTransition};
use switchyard_core::message::{
    AcquireRequest, CallReply, CallRequest, CastRequest, Payload, RegisterRequest,
    ResourceDescriptor, ResourceSpecification, ReturnMessage,
};
use switchyard_core::transport::Transport;

/// Error payload of calls the endpoint cannot serve
pub const UNSUPPORTED_CALL: &str = "unsupported-call";

/// Output key carrying the resolved channel owner
pub const RESOLVED_IDENTIFIER_KEY: &str = "identifier";

/// Output key carrying the resolved channel endpoint
pub const RESOLVED_ENDPOINT_KEY: &str = "endpoint";

/// Application logic answering calls made to this component.
pub trait CallHandler: Send + Sync {
    /// Answer `request`; the endpoint replies once the completion resolves
    fn called(&self, request: &CallRequest) -> DeferredCompletion<Payload>;

    /// React to a cast
    fn casted(&self, request: &CastRequest) {
        tracing::debug!(operation = %request.operation, "ignoring cast");
    }
}

/// Something an endpoint owns and destroys during cleanup.
pub trait ContainedComponent: Send + Sync {
    /// Name used in logs
    fn name(&self) -> String;

    /// Release the component
    ///
    /// # Errors
    ///
    /// A failure is logged and ignored; cleanup continues.
    fn destroy(&self) -> Result<(), Failure>;
}

/// A component endpoint.
///
/// Cloning yields another handle onto the same endpoint.
#[derive(Clone)]
pub struct ComponentEndpoint {
    shared: Arc<EndpointShared>,
}

struct EndpointShared {
    config: EndpointConfig,
    reactor: Reactor,
    isolate: IsolateId,
    callbacks: Proxy<ComponentCallbacks>,
    controller: Proxy<ComponentController>,
    connector: Proxy<ComponentConnector>,
    resolver: Proxy<ChannelResolver>,
    channel: Arc<ChannelController>,
    pending: PendingCallTable,
    fsm: StateMachine<ComponentLifecycle>,
    application: Option<Arc<dyn CallHandler>>,
    violations: ViolationLog,
    contained: Mutex<Vec<Arc<dyn ContainedComponent>>>,
    cleaned_up: AtomicBool,
    termination_requested: AtomicBool,
    self_registration: Mutex<Option<DeferredCompletion<bool>>>,
}

impl ComponentEndpoint {
    /// Build an endpoint over `transport`
    ///
    /// The endpoint starts registering its handlers immediately; it becomes `Active` once the
    /// host calls [`ChannelController::initialize`] on [`ComponentEndpoint::channel`].
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError`] if the handlers cannot be bound; the endpoint is cleaned up.
    #[tracing::instrument(skip_all, fields(session = %config.session))]
    pub fn create(
        reactor: &Reactor,
        transport: Arc<dyn Transport>,
        config: EndpointConfig,
        application: Option<Arc<dyn CallHandler>>,
    ) -> Result<Self, EndpointError> {
        let isolate = reactor.create_isolate();
        let callbacks = reactor.create_proxy::<ComponentCallbacks>();
        let controller = reactor.create_proxy::<ComponentController>();
        let connector = reactor.create_proxy::<ComponentConnector>();
        let resolver = reactor.create_proxy::<ChannelResolver>();
        let channel = ChannelController::new(
            config.session.clone(),
            transport,
            Arc::new(callbacks.clone()),
        );

        let shared = Arc::new(EndpointShared {
            fsm: StateMachine::new(config.session.clone()),
            violations: ViolationLog::new(config.violation_log_capacity),
            config,
            reactor: reactor.clone(),
            isolate,
            callbacks,
            controller,
            connector,
            resolver,
            channel,
            pending: PendingCallTable::new(),
            application,
            contained: Mutex::new(Vec::new()),
            cleaned_up: AtomicBool::new(false),
            termination_requested: AtomicBool::new(false),
            self_registration: Mutex::new(None),
        });

        let endpoint = Self { shared };
        if let Err(error) = endpoint.bind() {
            tracing::error!(%error, "failed to bind component endpoint");
            endpoint
                .shared
                .handle_internal_failure(&Failure::new(FailureKind::Internal, error.to_string()));
            return Err(error);
        }
        Ok(endpoint)
    }

    fn bind(&self) -> Result<(), EndpointError> {
        let shared = &self.shared;
        shared.fsm.advance(FsmTransition::CreateCompleted)?;

        let endpoint = Arc::downgrade(shared);
        shared.reactor.assign_handler(
            &shared.callbacks,
            CallbacksHandler(Weak::clone(&endpoint)),
            shared.isolate,
        )?;
        shared.reactor.assign_handler(
            &shared.connector,
            ConnectorHandler(Weak::clone(&endpoint)),
            shared.isolate,
        )?;
        shared
            .reactor
            .assign_handler(&shared.resolver, ResolverHandler(endpoint), shared.isolate)?;
        Ok(())
    }

    /// Call `operation` on `target`
    ///
    /// Applies the configured default timeout, if any.
    pub fn call(
        &self,
        target: ComponentIdentifier,
        operation: impl Into<String>,
        inputs: Payload,
    ) -> DeferredCompletion<Payload> {
        match self.shared.config.call_timeout() {
            Some(timeout) => self.call_with_timeout(target, operation, inputs, timeout),
            None => self
                .shared
                .call(target, operation.into(), inputs, CallReference::mint()),
        }
    }

    /// Call `operation` on `target`, giving up after `timeout`
    ///
    /// On expiry the pending entry is orphaned and the completion fails with a `Timeout`
    /// failure; a reply arriving later is treated as unexpected.
    pub fn call_with_timeout(
        &self,
        target: ComponentIdentifier,
        operation: impl Into<String>,
        inputs: Payload,
        timeout: Duration,
    ) -> DeferredCompletion<Payload> {
        let reference = CallReference::mint();
        let reply = self.shared.call(target, operation.into(), inputs, reference);

        let endpoint = Arc::downgrade(&self.shared);
        let timer = self.shared.reactor.runtime().spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(shared) = endpoint.upgrade() else {
                return;
            };
            // Orphaning runs on the isolate, after the connector has registered the call
            let orphaner = Arc::downgrade(&shared);
            let scheduled = shared.reactor.spawn_on(shared.isolate, move || {
                if let Some(shared) = orphaner.upgrade() {
                    shared.orphan(reference, timeout);
                }
            });
            if let Err(error) = scheduled {
                tracing::debug!(%reference, %error, "endpoint gone before call timed out");
            }
        });
        reply.observe(move |_| timer.abort());
        reply
    }

    /// Cast `operation` to `target`; resolves once the request has left
    pub fn cast(
        &self,
        target: ComponentIdentifier,
        operation: impl Into<String>,
        inputs: Payload,
    ) -> DeferredCompletion<()> {
        self.shared
            .connector
            .invoke(ConnectorRequest::Cast {
                target,
                operation: operation.into(),
                inputs,
            })
            .try_map(|output| match output {
                ConnectorOutput::Sent => Ok(()),
                other => Err(unexpected_output("cast", other)),
            })
    }

    /// Acquire a resource
    pub fn acquire(&self, resource: ResourceSpecification) -> DeferredCompletion<ResourceDescriptor> {
        self.shared
            .connector
            .invoke(ConnectorRequest::Acquire(resource))
            .try_map(|output| match output {
                ConnectorOutput::Resource(descriptor) => Ok(descriptor.clone()),
                other => Err(unexpected_output("acquire", other)),
            })
    }

    /// Join `group`; resolves with whether the peer accepted
    pub fn register(&self, group: ComponentIdentifier) -> DeferredCompletion<bool> {
        self.shared.register(group)
    }

    /// Resolve the channel endpoint of `target`
    pub fn resolve_channel(&self, target: impl Into<String>) -> DeferredCompletion<ResolvedEndpoint> {
        self.shared.resolver.invoke(ResolveRequest {
            target: target.into(),
        })
    }

    /// Ask the peer for an orderly shutdown
    pub fn terminate(&self) -> DeferredCompletion<()> {
        self.shared.controller.invoke(ControllerRequest::Terminate)
    }

    /// Hand `component` to the endpoint; it is destroyed during cleanup
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::ShutDown`] once cleanup has started.
    pub fn contain(&self, component: Arc<dyn ContainedComponent>) -> Result<(), EndpointError> {
        let mut contained = lock(&self.shared.contained);
        if self.shared.cleaned_up.load(Ordering::SeqCst) {
            return Err(EndpointError::ShutDown);
        }
        tracing::debug!(component = %component.name(), "containing component");
        contained.push(component);
        Ok(())
    }

    /// The channel controller; hosts feed inbound envelopes through it
    #[must_use]
    pub fn channel(&self) -> &Arc<ChannelController> {
        &self.shared.channel
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> FsmState {
        self.shared.fsm.state()
    }

    /// The endpoint's isolate
    #[must_use]
    pub fn isolate(&self) -> IsolateId {
        self.shared.isolate
    }

    /// Number of calls, acquires and registrations awaiting a reply
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    /// Protocol violations recorded so far
    #[must_use]
    pub fn violations(&self) -> &ViolationLog {
        &self.shared.violations
    }

    /// Outcome of the self-group registration, once issued
    #[must_use]
    pub fn self_registration(&self) -> Option<DeferredCompletion<bool>> {
        lock(&self.shared.self_registration).clone()
    }

    /// Health of this endpoint
    ///
    /// Unhealthy once the lifecycle is terminal, degraded while starting up, stopping, or after
    /// protocol violations.
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        let state = self.state();
        let violations = self.shared.violations.len();
        let status = HealthStatus::of_endpoint(state, violations);

        let check = HealthCheck::new(format!("component:{}", self.shared.config.session), status)
            .with_figure("pending_calls", self.pending_calls())
            .with_figure("violations", violations);
        match status {
            HealthStatus::Healthy => check,
            HealthStatus::Degraded if state == FsmState::Active => {
                check.because(format!("{violations} protocol violations recorded"))
            },
            _ => check.because(format!("endpoint is {state}")),
        }
    }

    /// Health of this endpoint together with the reactor it runs on
    #[must_use]
    pub fn health_report(&self) -> HealthReport {
        HealthReport::new(vec![self.health(), self.shared.reactor.health()])
    }
}

impl fmt::Debug for ComponentEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentEndpoint")
            .field("session", &self.shared.config.session)
            .field("state", &self.state())
            .field("pending_calls", &self.pending_calls())
            .finish_non_exhaustive()
    }
}

impl EndpointShared {
    fn call(
        &self,
        target: ComponentIdentifier,
        operation: String,
        inputs: Payload,
        reference: CallReference,
    ) -> DeferredCompletion<Payload> {
        self.connector
            .invoke(ConnectorRequest::Call {
                target,
                operation,
                inputs,
                reference,
            })
            .try_map(|output| match output {
                ConnectorOutput::Outputs(outputs) => Ok(outputs.clone()),
                other => Err(unexpected_output("call", other)),
            })
    }

    fn register(self: &Arc<Self>, group: ComponentIdentifier) -> DeferredCompletion<bool> {
        let reference = CallReference::mint();
        self.issue(
            reference,
            ControllerRequest::Register(RegisterRequest { group, reference }),
        )
        .try_map(|message| match message {
            ReturnMessage::Register(reply) => Ok(reply.ok),
            other => Err(mismatched_reply("register", other)),
        })
    }

    /// Register `reference`, then send `request` through the controller
    fn issue(
        self: &Arc<Self>,
        reference: CallReference,
        request: ControllerRequest,
    ) -> DeferredCompletion<ReturnMessage> {
        let kind = request.name();
        if self.cleaned_up.load(Ordering::SeqCst) {
            return DeferredCompletion::failed(Failure::channel_closed("component endpoint is shut down"));
        }

        let (reply, trigger) = DeferredCompletion::pending();
        if let Err(error) = self.pending.put(reference, trigger) {
            return DeferredCompletion::failed(Failure::new(FailureKind::Internal, error.to_string()));
        }
        CallMetrics::record_issued(kind);
        tracing::debug!(%reference, request = kind, "issuing request");

        let sent = self.controller.invoke(request);
        let endpoint = Arc::downgrade(self);
        sent.observe(move |outcome| {
            let Err(cause) = outcome else {
                return;
            };
            let Some(shared) = endpoint.upgrade() else {
                return;
            };
            if let Ok(trigger) = shared.pending.remove(&reference) {
                tracing::warn!(%reference, request = kind, error = %cause, "send failed; failing request");
                let _ = trigger.fail(cause.clone());
            }
            shared.escalate(cause);
        });
        reply
    }

    /// Send a reply to a call this endpoint received
    fn reply(self: &Arc<Self>, reply: CallReply) {
        let reference = reply.reference;
        tracing::debug!(%reference, ok = reply.ok, "replying to call");
        let sent = self.controller.invoke(ControllerRequest::CallReturn(reply));
        let endpoint = Arc::downgrade(self);
        sent.observe(move |outcome| {
            if let (Err(cause), Some(shared)) = (outcome, endpoint.upgrade()) {
                tracing::warn!(%reference, error = %cause, "failed to send call reply");
                shared.escalate(cause);
            }
        });
    }

    /// Schedule an internal failure for transport failures
    ///
    /// Runs on the isolate so it never executes inside a transaction.
    fn escalate(self: &Arc<Self>, cause: &Failure) {
        if !cause.is(FailureKind::Transport) {
            return;
        }
        let endpoint = Arc::downgrade(self);
        let failure = cause.clone();
        let scheduled = self.reactor.spawn_on(self.isolate, move || {
            if let Some(shared) = endpoint.upgrade() {
                shared.handle_internal_failure(&failure);
            }
        });
        if let Err(error) = scheduled {
            tracing::debug!(%error, cause = %cause, "endpoint already released; not escalating");
        }
    }

    fn orphan(&self, reference: CallReference, timeout: Duration) {
        if let Ok(trigger) = self.pending.remove(&reference) {
            CallMetrics::record_timed_out();
            tracing::warn!(%reference, ?timeout, "call timed out; orphaning");
            let _ = trigger.fail(Failure::timeout(format!("no reply within {timeout:?}")));
        }
    }

    fn route_return(&self, message: ReturnMessage) {
        let reference = message.reference();
        let kind = message.kind();
        match self.pending.complete(&reference, Ok(message)) {
            Ok(()) => CallMetrics::record_completed(kind),
            Err(error) => {
                CallMetrics::record_violation(kind);
                tracing::warn!(%reference, kind, "unexpected reference; ignoring");
                self.violations.record(reference, kind, error.to_string());
            },
        }
    }

    fn active_application(&self) -> Option<Arc<dyn CallHandler>> {
        if self.fsm.state() == FsmState::Active {
            self.application.clone()
        } else {
            None
        }
    }

    fn on_called(self: &Arc<Self>, request: &CallRequest) {
        let reference = request.reference;
        let Some(application) = self.active_application() else {
            tracing::debug!(%reference, operation = %request.operation, "no call handler; rejecting call");
            self.reply(CallReply::failed(reference, Value::String(UNSUPPORTED_CALL.to_string())));
            return;
        };

        let outputs = application.called(request);
        let endpoint = Arc::downgrade(self);
        self.reactor.observe_on(self.isolate, &outputs, move |outcome| {
            let Some(shared) = endpoint.upgrade() else {
                return;
            };
            let reply = match outcome {
                Ok(outputs) => CallReply::succeeded(reference, outputs),
                Err(cause) => CallReply::failed(reference, Value::String(cause.to_string())),
            };
            shared.reply(reply);
        });
    }

    fn on_casted(&self, request: &CastRequest) {
        match self.active_application() {
            Some(application) => application.casted(request),
            None => tracing::debug!(operation = %request.operation, "no call handler; ignoring cast"),
        }
    }

    fn on_registered(&self, handler: &'static str) {
        match self.fsm.advance(FsmTransition::RegisterCompleted) {
            Ok(FsmState::InitializePending) => {
                if self.termination_requested.swap(false, Ordering::SeqCst) {
                    tracing::info!(session = %self.config.session, "handlers registered; honoring deferred termination");
                    self.on_terminated();
                } else {
                    tracing::info!(session = %self.config.session, "handlers registered; awaiting initialization");
                }
            },
            Ok(state) => tracing::debug!(handler, %state, "handler registered"),
            Err(error) => self.on_rejected(&error),
        }
    }

    fn on_initialized(self: &Arc<Self>, controller: Arc<dyn Callbacks<ComponentController>>) {
        if let Err(error) = self.fsm.advance(FsmTransition::InitializeCompleted) {
            self.on_rejected(&error);
            return;
        }
        if let Err(error) = self.reactor.assign_delegate(&self.controller, controller) {
            self.handle_internal_failure(&Failure::new(FailureKind::Internal, error.to_string()));
            return;
        }
        tracing::info!(session = %self.config.session, "component endpoint active");

        if let Some(group) = &self.config.self_group {
            let group = ComponentIdentifier::resolve(group);
            let registration = self.register(group.clone());
            registration.observe(move |outcome| match outcome {
                Ok(true) => tracing::info!(%group, "registered into self-group"),
                Ok(false) => tracing::warn!(%group, "self-group registration refused"),
                Err(cause) => tracing::warn!(%group, error = %cause, "self-group registration failed"),
            });
            *lock(&self.self_registration) = Some(registration);
        }
    }

    /// Termination during registration waits until every handler is registered
    fn on_terminated(&self) {
        let registering = self.fsm.access(|state| {
            matches!(
                state,
                FsmState::Created
                    | FsmState::RegisterPending3
                    | FsmState::RegisterPending2
                    | FsmState::RegisterPending1
            )
        });
        if registering {
            tracing::info!(session = %self.config.session, "termination requested while registering; deferring");
            self.termination_requested.store(true, Ordering::SeqCst);
            return;
        }
        if self.fsm.is_terminal() {
            tracing::debug!(session = %self.config.session, "endpoint already stopped; ignoring termination");
            return;
        }
        if let Err(error) = self.fsm.advance(FsmTransition::ExternalDestroy) {
            self.on_rejected(&error);
            return;
        }
        tracing::info!(session = %self.config.session, "terminating component endpoint");
        if let Err(error) = self.destroy_proxies() {
            self.handle_internal_failure(&Failure::new(FailureKind::Internal, error.to_string()));
        }
    }

    fn on_unregistered(&self, handler: &'static str) {
        match self.fsm.advance(FsmTransition::UnregisterCompleted) {
            Ok(FsmState::Destroyed) => self.cleanup(true),
            Ok(state) => tracing::debug!(handler, %state, "handler unregistered"),
            Err(error) => self.on_rejected(&error),
        }
    }

    fn on_rejected(&self, error: &FsmError) {
        match error {
            FsmError::AlreadyFailed { .. } => tracing::debug!(%error, "endpoint failed; ignoring event"),
            error if error.is_fatal() => self.cleanup(false),
            error => tracing::warn!(%error, "ignoring lifecycle event"),
        }
    }

    fn handle_internal_failure(&self, cause: &Failure) {
        match self.fsm.advance(FsmTransition::InternalFailure) {
            Ok(_) => {
                tracing::error!(session = %self.config.session, error = %cause, "component endpoint failed; forcing cleanup");
                self.cleanup(false);
            },
            Err(FsmError::AlreadyFailed { .. }) => {
                tracing::debug!(error = %cause, "endpoint already failed; ignoring");
            },
            Err(error) => {
                tracing::error!(%error, cause = %cause, "failure transition rejected; forcing cleanup");
                self.cleanup(false);
            },
        }
    }

    fn destroy_proxies(&self) -> Result<(), ReactorError> {
        let results = [
            self.reactor.destroy_proxy(&self.controller),
            self.reactor.destroy_proxy(&self.callbacks),
            self.reactor.destroy_proxy(&self.connector),
            self.reactor.destroy_proxy(&self.resolver),
        ];
        results.into_iter().collect()
    }

    fn cleanup(&self, gracefully: bool) {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(session = %self.config.session, gracefully, "cleaning up component endpoint");

        if !gracefully {
            let results = [
                ("controller", self.reactor.destroy_proxy(&self.controller)),
                ("callbacks", self.reactor.destroy_proxy(&self.callbacks)),
                ("connector", self.reactor.destroy_proxy(&self.connector)),
                ("resolver", self.reactor.destroy_proxy(&self.resolver)),
            ];
            for (proxy, result) in results {
                match result {
                    Ok(()) | Err(ReactorError::ProxyDestroyed(_)) => {},
                    Err(error) => tracing::warn!(proxy, %error, "destroying proxy failed; ignoring"),
                }
            }
        }

        let contained = std::mem::take(&mut *lock(&self.contained));
        for component in contained {
            match catch_unwind(AssertUnwindSafe(|| component.destroy())) {
                Ok(Ok(())) => tracing::debug!(component = %component.name(), "destroyed contained component"),
                Ok(Err(cause)) => {
                    tracing::warn!(component = %component.name(), error = %cause, "destroying contained component failed; ignoring");
                },
                Err(_) => {
                    tracing::warn!(component = %component.name(), "destroying contained component panicked; ignoring");
                },
            }
        }

        self.channel.close();

        let orphaned = self
            .pending
            .fail_all(&Failure::channel_closed("component endpoint shut down"));
        if orphaned > 0 {
            CallMetrics::record_orphaned(orphaned);
            tracing::warn!(orphaned, "failed outstanding requests");
        }

        if let Err(error) = self.reactor.destroy_isolate(self.isolate) {
            tracing::warn!(isolate = %self.isolate, %error, "releasing isolate failed; ignoring");
        }
        tracing::info!(session = %self.config.session, gracefully, "component endpoint cleaned up");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn upgrade(endpoint: &Weak<EndpointShared>) -> Result<Arc<EndpointShared>, HandlerError> {
    endpoint
        .upgrade()
        .ok_or_else(|| HandlerError::new("component endpoint dropped"))
}

fn mismatched_reply(expected: &str, message: &ReturnMessage) -> Failure {
    Failure::new(
        FailureKind::Protocol,
        format!("expected a {expected} reply, received a {} reply", message.kind()),
    )
}

fn unexpected_output(expected: &str, output: &ConnectorOutput) -> Failure {
    Failure::new(
        FailureKind::Protocol,
        format!("unexpected connector output for {expected}: {output:?}"),
    )
}

fn resolved_endpoint(outputs: &Payload) -> Option<ResolvedEndpoint> {
    let identifier = outputs.get(RESOLVED_IDENTIFIER_KEY)?.as_str()?;
    let endpoint = outputs.get(RESOLVED_ENDPOINT_KEY)?.as_str()?;
    Some(ResolvedEndpoint {
        identifier: identifier.to_string(),
        endpoint: endpoint.to_string(),
    })
}

// ============================================================================
// Handlers
// ============================================================================

struct CallbacksHandler(Weak<EndpointShared>);

impl CallbackHandler<ComponentCallbacks> for CallbacksHandler {
    fn handle(&mut self, _proxy: ProxyId, event: ComponentEvent) -> Result<Reply<()>, HandlerError> {
        let shared = upgrade(&self.0)?;
        tracing::trace!(event = event.name(), "component event");
        match event {
            ComponentEvent::Called(request) => shared.on_called(&request),
            ComponentEvent::CallReturned(reply) => shared.route_return(ReturnMessage::Call(reply)),
            ComponentEvent::Casted(request) => shared.on_casted(&request),
            ComponentEvent::AcquireReturned(reply) => {
                shared.route_return(ReturnMessage::Acquire(reply));
            },
            ComponentEvent::RegisterReturned(reply) => {
                shared.route_return(ReturnMessage::Register(reply));
            },
            ComponentEvent::Initialized(controller) => shared.on_initialized(controller),
            ComponentEvent::Terminated => shared.on_terminated(),
            ComponentEvent::Failed(cause) => shared.handle_internal_failure(&cause),
        }
        Ok(Reply::Ready(()))
    }

    fn registered_callbacks(&mut self, _proxy: ProxyId, _isolate: IsolateId) {
        if let Some(shared) = self.0.upgrade() {
            shared.on_registered("callbacks");
        }
    }

    fn unregistered_callbacks(&mut self, _proxy: ProxyId) {
        if let Some(shared) = self.0.upgrade() {
            shared.on_unregistered("callbacks");
        }
    }

    fn failed_callbacks(&mut self, _proxy: ProxyId, cause: &Failure) {
        if let Some(shared) = self.0.upgrade() {
            shared.handle_internal_failure(cause);
        }
    }
}

struct ConnectorHandler(Weak<EndpointShared>);

impl CallbackHandler<ComponentConnector> for ConnectorHandler {
    fn handle(
        &mut self,
        _proxy: ProxyId,
        request: ConnectorRequest,
    ) -> Result<Reply<ConnectorOutput>, HandlerError> {
        let shared = upgrade(&self.0)?;
        let output = match request {
            ConnectorRequest::Call {
                target,
                operation,
                inputs,
                reference,
            } => {
                let request = CallRequest {
                    operation,
                    inputs,
                    reference,
                };
                shared
                    .issue(reference, ControllerRequest::Call { target, request })
                    .try_map(|message| match message {
                        ReturnMessage::Call(reply) => {
                            reply.clone().into_outputs().map(ConnectorOutput::Outputs)
                        },
                        other => Err(mismatched_reply("call", other)),
                    })
            },
            ConnectorRequest::Cast {
                target,
                operation,
                inputs,
            } => shared
                .controller
                .invoke(ControllerRequest::Cast {
                    target,
                    request: CastRequest { operation, inputs },
                })
                .map(|_| ConnectorOutput::Sent),
            ConnectorRequest::Acquire(resource) => {
                let reference = CallReference::mint();
                shared
                    .issue(
                        reference,
                        ControllerRequest::Acquire(AcquireRequest {
                            resource,
                            reference,
                        }),
                    )
                    .try_map(|message| match message {
                        ReturnMessage::Acquire(reply) => {
                            reply.clone().into_descriptor().map(ConnectorOutput::Resource)
                        },
                        other => Err(mismatched_reply("acquire", other)),
                    })
            },
        };
        Ok(Reply::Deferred(output))
    }

    fn registered_callbacks(&mut self, _proxy: ProxyId, _isolate: IsolateId) {
        if let Some(shared) = self.0.upgrade() {
            shared.on_registered("connector");
        }
    }

    fn unregistered_callbacks(&mut self, _proxy: ProxyId) {
        if let Some(shared) = self.0.upgrade() {
            shared.on_unregistered("connector");
        }
    }

    fn failed_callbacks(&mut self, _proxy: ProxyId, cause: &Failure) {
        if let Some(shared) = self.0.upgrade() {
            shared.handle_internal_failure(cause);
        }
    }
}

struct ResolverHandler(Weak<EndpointShared>);

impl CallbackHandler<ChannelResolver> for ResolverHandler {
    fn handle(
        &mut self,
        _proxy: ProxyId,
        request: ResolveRequest,
    ) -> Result<Reply<ResolvedEndpoint>, HandlerError> {
        let shared = upgrade(&self.0)?;
        let ResolveRequest { target } = request;
        tracing::debug!(%target, "resolving channel endpoint");

        let reference = CallReference::mint();
        let call = CallRequest {
            operation: shared.config.resolve_operation.clone(),
            inputs: Value::Null,
            reference,
        };
        let resolved = shared
            .issue(
                reference,
                ControllerRequest::Call {
                    target: ComponentIdentifier::resolve(&target),
                    request: call,
                },
            )
            .try_map(move |message| {
                let ReturnMessage::Call(reply) = message else {
                    return Err(mismatched_reply("call", message));
                };
                let outputs = reply.clone().into_outputs()?;
                let resolved = resolved_endpoint(&outputs).ok_or_else(|| {
                    Failure::new(
                        FailureKind::Protocol,
                        format!(
                            "resolution of `{target}` returned no `{RESOLVED_IDENTIFIER_KEY}` and `{RESOLVED_ENDPOINT_KEY}`"
                        ),
                    )
                })?;
                tracing::debug!(%target, endpoint = %resolved.endpoint, identifier = %resolved.identifier, "resolved channel endpoint");
                Ok(resolved)
            });
        Ok(Reply::Deferred(resolved))
    }

    fn registered_callbacks(&mut self, _proxy: ProxyId, _isolate: IsolateId) {
        if let Some(shared) = self.0.upgrade() {
            shared.on_registered("resolver");
        }
    }

    fn unregistered_callbacks(&mut self, _proxy: ProxyId) {
        if let Some(shared) = self.0.upgrade() {
            shared.on_unregistered("resolver");
        }
    }

    fn failed_callbacks(&mut self, _proxy: ProxyId, cause: &Failure) {
        if let Some(shared) = self.0.upgrade() {
            shared.handle_internal_failure(cause);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use serde_json::json;
    use switchyard_testing::RecordingTransport;

    /// Wait for the endpoint's isolate to run what is queued, a few rounds deep
    async fn drain(endpoint: &ComponentEndpoint) {
        for _ in 0..4 {
            let (done, trigger) = DeferredCompletion::pending();
            let queued = endpoint.shared.reactor.spawn_on(endpoint.isolate(), move || {
                let _ = trigger.succeed(());
            });
            if queued.is_err() {
                return;
            }
            let _ = done.await;
        }
    }

    #[tokio::test]
    async fn test_termination_while_registering_is_honored_once_registered() {
        let reactor = Reactor::new().unwrap();
        let transport = Arc::new(RecordingTransport::new());
        let endpoint =
            ComponentEndpoint::create(&reactor, transport.clone(), EndpointConfig::new("s1"), None)
                .unwrap();
        assert_eq!(endpoint.state(), FsmState::RegisterPending3);

        // No registration acknowledgement has run yet
        endpoint.shared.on_terminated();
        assert_eq!(endpoint.state(), FsmState::RegisterPending3);

        drain(&endpoint).await;
        assert_eq!(endpoint.state(), FsmState::Destroyed);
        assert!(transport.is_closed());
        assert_eq!(reactor.live_isolates(), 0);
        assert!(endpoint.health().status.is_unhealthy());
    }

    #[tokio::test]
    async fn test_termination_after_stop_is_ignored() {
        let reactor = Reactor::new().unwrap();
        let endpoint = ComponentEndpoint::create(
            &reactor,
            Arc::new(RecordingTransport::new()),
            EndpointConfig::new("s1"),
            None,
        )
        .unwrap();
        drain(&endpoint).await;
        endpoint.shared.handle_internal_failure(&Failure::transport("connection reset"));
        assert!(endpoint.shared.fsm.is_terminal());

        endpoint.shared.on_terminated();
        assert_eq!(endpoint.state(), FsmState::Failed);
        assert!(!endpoint.shared.termination_requested.load(Ordering::SeqCst));
    }

    #[test]
    fn test_resolved_endpoint_requires_both_keys() {
        let complete = json!({"identifier": "peer-1", "endpoint": "tcp://10.0.0.1:9000"});
        assert_eq!(
            resolved_endpoint(&complete),
            Some(ResolvedEndpoint {
                identifier: "peer-1".to_string(),
                endpoint: "tcp://10.0.0.1:9000".to_string(),
            })
        );
        assert_eq!(resolved_endpoint(&json!({"identifier": "peer-1"})), None);
        assert_eq!(resolved_endpoint(&json!({"identifier": 3, "endpoint": "x"})), None);
        assert_eq!(resolved_endpoint(&Value::Null), None);
    }

    #[test]
    fn test_mismatched_reply_is_a_protocol_failure() {
        let message = ReturnMessage::Register(switchyard_core::message::RegisterReturn {
            reference: CallReference::mint(),
            ok: true,
        });
        let failure = mismatched_reply("call", &message);
        assert_eq!(failure.kind(), FailureKind::Protocol);
        assert!(failure.message().contains("register"));
    }
}
