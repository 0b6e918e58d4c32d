//! Callback reactor: serial execution contexts for callback handlers.
//!
//! The reactor owns two id-keyed tables: **isolates** (serial execution contexts) and
//! **proxies** (facades through which callbacks of one kind are invoked). Components keep only
//! the [`IsolateId`] and [`Proxy`] handles.
//!
//! # Execution model
//!
//! Each isolate is a FIFO queue drained by a single tokio task, so the jobs of one isolate run
//! strictly one at a time and in submission order while different isolates run concurrently on
//! the worker pool. Nothing the reactor runs ever blocks waiting for a reply: suspension is
//! expressed by [`Reactor::observe_on`], which re-enqueues a continuation once a completion
//! resolves.
//!
//! # Failure handling
//!
//! A handler that returns an error or panics fails the invocation's completion with a
//! `Handler` failure and receives exactly one `failed_callbacks` notification. A panic inside
//! that notification is logged and dropped. The isolate keeps running either way.
//!
//! # Example
//!
//! ```ignore
//! let reactor = Reactor::new()?;
//! let isolate = reactor.create_isolate();
//! let proxy = reactor.create_proxy::<ComponentConnector>();
//!
//! // Invocations issued before a handler is assigned are buffered
//! let pending = proxy.invoke(request);
//!
//! reactor.assign_handler(&proxy, MyConnectorHandler::new(), isolate)?;
//! let output = pending.await?;
//! ```

use crate::health::{HealthCheck, HealthStatus};
use crate::metrics::ReactorMetrics;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use switchyard_core::callbacks::{CallbackHandler, CallbackKind, Callbacks, Reply};
use switchyard_core::completion::{DeferredCompletion, Failure, FailureKind, Outcome, Trigger};
use switchyard_core::identity::{IsolateId, ProxyId};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// Reactor misuse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReactorError {
    /// No tokio runtime was available when the reactor was created
    #[error("no tokio runtime is available to run isolates")]
    NoRuntime,

    /// The reactor behind a proxy handle has been dropped
    #[error("the reactor has been dropped")]
    ReactorGone,

    /// The isolate does not exist or was already destroyed
    #[error("unknown isolate {0}")]
    UnknownIsolate(IsolateId),

    /// The proxy does not exist
    #[error("unknown proxy {0}")]
    UnknownProxy(ProxyId),

    /// The proxy was destroyed; invocations fail fast
    #[error("proxy {0} has been destroyed")]
    ProxyDestroyed(ProxyId),

    /// The isolate is still referenced by live proxies
    #[error("isolate {isolate} is still referenced by {proxies} live proxies")]
    IsolateInUse {
        /// The isolate
        isolate: IsolateId,
        /// How many proxies still reference it
        proxies: usize,
    },

    /// The proxy handle names a proxy of another callback kind
    #[error("proxy {proxy} is not a `{expected}` proxy")]
    KindMismatch {
        /// The proxy
        proxy: ProxyId,
        /// Kind the caller expected
        expected: &'static str,
    },
}

impl From<ReactorError> for Failure {
    fn from(error: ReactorError) -> Self {
        let kind = match error {
            ReactorError::ProxyDestroyed(_) | ReactorError::ReactorGone => FailureKind::ChannelClosed,
            _ => FailureKind::Internal,
        };
        Self::new(kind, error.to_string())
    }
}

type Job = Box<dyn FnOnce() + Send>;

type SharedHandler<K> = Arc<Mutex<Box<dyn CallbackHandler<K>>>>;

/// A job the isolate queue refused; dropped only once the arena lock is released.
struct Rejected {
    error: ReactorError,
    job: Job,
}

struct IsolateRecord {
    queue: mpsc::UnboundedSender<Job>,
    drained: DeferredCompletion<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxyStatus {
    Unassigned,
    Bound,
    Destroyed,
}

struct ProxyRecord {
    kind: &'static str,
    status: ProxyStatus,
    isolate: Option<IsolateId>,
    slot: Box<dyn Any + Send>,
}

enum Binding<K: CallbackKind> {
    Unassigned,
    Handler {
        handler: SharedHandler<K>,
        isolate: IsolateId,
    },
    Delegate(Arc<dyn Callbacks<K>>),
    Destroyed,
}

struct ProxySlot<K: CallbackKind> {
    binding: Binding<K>,
    buffered: VecDeque<(K::Invocation, Trigger<K::Output>)>,
}

#[derive(Default)]
struct Arena {
    isolates: HashMap<IsolateId, IsolateRecord>,
    proxies: HashMap<ProxyId, ProxyRecord>,
}

struct ReactorInner {
    arena: Mutex<Arena>,
    next_id: AtomicU64,
    runtime: Handle,
}

/// Owner of isolates and proxy bindings.
///
/// Cloning yields another handle onto the same reactor.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<ReactorInner>,
}

impl Reactor {
    /// Create a reactor running its isolates on the current tokio runtime
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::NoRuntime`] when called outside a tokio runtime.
    pub fn new() -> Result<Self, ReactorError> {
        Handle::try_current()
            .map(Self::with_handle)
            .map_err(|_| ReactorError::NoRuntime)
    }

    /// Create a reactor running its isolates on `runtime`
    #[must_use]
    pub fn with_handle(runtime: Handle) -> Self {
        Self {
            inner: Arc::new(ReactorInner {
                arena: Mutex::new(Arena::default()),
                next_id: AtomicU64::new(1),
                runtime,
            }),
        }
    }

    /// Runtime the isolates run on
    #[must_use]
    pub fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    /// Allocate a new serial execution context
    #[tracing::instrument(skip(self))]
    pub fn create_isolate(&self) -> IsolateId {
        let isolate = IsolateId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (queue, mut jobs) = mpsc::unbounded_channel::<Job>();
        let (drained, drained_trigger) = DeferredCompletion::pending();

        self.inner.runtime.spawn(async move {
            while let Some(job) = jobs.recv().await {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!(%isolate, "isolate job panicked; continuing with the next job");
                }
            }
            tracing::debug!(%isolate, "isolate drained");
            let _ = drained_trigger.succeed(());
        });

        let live = {
            let mut arena = self.inner.lock();
            arena
                .isolates
                .insert(isolate, IsolateRecord { queue, drained });
            arena.isolates.len()
        };
        ReactorMetrics::record_isolates(live);
        tracing::debug!(%isolate, "created isolate");
        isolate
    }

    /// Create an unassigned proxy of kind `K`
    ///
    /// Invocations issued before a handler or delegate is assigned are buffered.
    #[must_use]
    pub fn create_proxy<K: CallbackKind>(&self) -> Proxy<K> {
        let id = ProxyId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let slot: ProxySlot<K> = ProxySlot {
            binding: Binding::Unassigned,
            buffered: VecDeque::new(),
        };
        self.inner.lock().proxies.insert(
            id,
            ProxyRecord {
                kind: K::NAME,
                status: ProxyStatus::Unassigned,
                isolate: None,
                slot: Box::new(slot),
            },
        );
        tracing::debug!(proxy = %id, kind = K::NAME, "created proxy");
        Proxy {
            id,
            reactor: Arc::downgrade(&self.inner),
            kind: PhantomData,
        }
    }

    /// Bind `handler` to `proxy`, running it on `isolate`
    ///
    /// `registered_callbacks` fires on the isolate before any buffered invocation is delivered.
    /// A previously bound handler first receives `unregistered_callbacks` on its own isolate.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::UnknownIsolate`], [`ReactorError::UnknownProxy`],
    /// [`ReactorError::KindMismatch`] or [`ReactorError::ProxyDestroyed`].
    pub fn assign_handler<K, H>(
        &self,
        proxy: &Proxy<K>,
        handler: H,
        isolate: IsolateId,
    ) -> Result<(), ReactorError>
    where
        K: CallbackKind,
        H: CallbackHandler<K> + 'static,
    {
        let id = proxy.id;
        let boxed: Box<dyn CallbackHandler<K>> = Box::new(handler);
        let handler: SharedHandler<K> = Arc::new(Mutex::new(boxed));
        let mut refused = Vec::new();
        let result = {
            let mut arena = self.inner.lock();
            let Arena { isolates, proxies } = &mut *arena;
            if !isolates.contains_key(&isolate) {
                return Err(ReactorError::UnknownIsolate(isolate));
            }
            let record = proxies.get_mut(&id).ok_or(ReactorError::UnknownProxy(id))?;
            let slot = slot_mut::<K>(&mut record.slot, id)?;
            if matches!(slot.binding, Binding::Destroyed) {
                return Err(ReactorError::ProxyDestroyed(id));
            }

            let previous = std::mem::replace(
                &mut slot.binding,
                Binding::Handler {
                    handler: Arc::clone(&handler),
                    isolate,
                },
            );
            record.status = ProxyStatus::Bound;
            record.isolate = Some(isolate);

            if let Binding::Handler {
                handler: old,
                isolate: old_isolate,
            } = previous
            {
                let job = lifecycle_job(old, id, Lifecycle::Unregistered);
                if let Err(rejected) = enqueue(isolates, old_isolate, job) {
                    refused.push(rejected);
                }
            }

            let mut result = Ok(());
            let registered = lifecycle_job(Arc::clone(&handler), id, Lifecycle::Registered(isolate));
            if let Err(rejected) = enqueue(isolates, isolate, registered) {
                result = Err(rejected.error.clone());
                refused.push(rejected);
            }
            for (invocation, trigger) in slot.buffered.drain(..) {
                let job = invocation_job(id, Arc::clone(&handler), invocation, trigger);
                if let Err(rejected) = enqueue(isolates, isolate, job) {
                    refused.push(rejected);
                }
            }
            result
        };

        for rejected in refused {
            tracing::warn!(proxy = %id, error = %rejected.error, "dropping job for a released isolate");
            drop(rejected.job);
        }
        tracing::debug!(proxy = %id, %isolate, kind = K::NAME, "assigned handler");
        result
    }

    /// Redirect `proxy` to forward every invocation to `delegate`
    ///
    /// Buffered invocations are forwarded in issue order. A previously bound handler receives
    /// `unregistered_callbacks`.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::UnknownProxy`], [`ReactorError::KindMismatch`] or
    /// [`ReactorError::ProxyDestroyed`].
    pub fn assign_delegate<K: CallbackKind>(
        &self,
        proxy: &Proxy<K>,
        delegate: Arc<dyn Callbacks<K>>,
    ) -> Result<(), ReactorError> {
        let id = proxy.id;
        let mut refused = Vec::new();
        let buffered: Vec<_> = {
            let mut arena = self.inner.lock();
            let Arena { isolates, proxies } = &mut *arena;
            let record = proxies.get_mut(&id).ok_or(ReactorError::UnknownProxy(id))?;
            let slot = slot_mut::<K>(&mut record.slot, id)?;
            if matches!(slot.binding, Binding::Destroyed) {
                return Err(ReactorError::ProxyDestroyed(id));
            }

            let previous = std::mem::replace(&mut slot.binding, Binding::Delegate(Arc::clone(&delegate)));
            record.status = ProxyStatus::Bound;
            record.isolate = None;

            if let Binding::Handler { handler, isolate } = previous {
                if let Err(rejected) = enqueue(isolates, isolate, lifecycle_job(handler, id, Lifecycle::Unregistered)) {
                    refused.push(rejected);
                }
            }
            slot.buffered.drain(..).collect()
        };

        drop(refused);
        tracing::debug!(proxy = %id, kind = K::NAME, flushed = buffered.len(), "assigned delegate");
        for (invocation, trigger) in buffered {
            delegate.invoke(invocation).link(trigger);
        }
        Ok(())
    }

    /// Detach `proxy` for good
    ///
    /// A bound handler receives `unregistered_callbacks`; buffered and future invocations fail
    /// with [`ReactorError::ProxyDestroyed`].
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::UnknownProxy`], [`ReactorError::KindMismatch`], or
    /// [`ReactorError::ProxyDestroyed`] if the proxy was already destroyed.
    pub fn destroy_proxy<K: CallbackKind>(&self, proxy: &Proxy<K>) -> Result<(), ReactorError> {
        let id = proxy.id;
        let mut refused = Vec::new();
        let buffered: Vec<_> = {
            let mut arena = self.inner.lock();
            let Arena { isolates, proxies } = &mut *arena;
            let record = proxies.get_mut(&id).ok_or(ReactorError::UnknownProxy(id))?;
            let slot = slot_mut::<K>(&mut record.slot, id)?;
            if matches!(slot.binding, Binding::Destroyed) {
                return Err(ReactorError::ProxyDestroyed(id));
            }

            let previous = std::mem::replace(&mut slot.binding, Binding::Destroyed);
            record.status = ProxyStatus::Destroyed;
            record.isolate = None;

            if let Binding::Handler { handler, isolate } = previous {
                if let Err(rejected) = enqueue(isolates, isolate, lifecycle_job(handler, id, Lifecycle::Unregistered)) {
                    refused.push(rejected);
                }
            }
            slot.buffered.drain(..).collect()
        };

        drop(refused);
        for (_, trigger) in buffered {
            let _ = trigger.fail(ReactorError::ProxyDestroyed(id).into());
        }
        tracing::debug!(proxy = %id, kind = K::NAME, "destroyed proxy");
        Ok(())
    }

    /// Release `isolate` once its queue is drained
    ///
    /// Jobs already queued still run; the returned completion resolves after the last one.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::IsolateInUse`] while a live proxy is bound to the isolate, or
    /// [`ReactorError::UnknownIsolate`].
    #[tracing::instrument(skip(self))]
    pub fn destroy_isolate(&self, isolate: IsolateId) -> Result<DeferredCompletion<()>, ReactorError> {
        let (record, live) = {
            let mut arena = self.inner.lock();
            if !arena.isolates.contains_key(&isolate) {
                return Err(ReactorError::UnknownIsolate(isolate));
            }
            let users = arena
                .proxies
                .values()
                .filter(|record| record.isolate == Some(isolate))
                .count();
            if users > 0 {
                return Err(ReactorError::IsolateInUse {
                    isolate,
                    proxies: users,
                });
            }
            let record = arena
                .isolates
                .remove(&isolate)
                .ok_or(ReactorError::UnknownIsolate(isolate))?;
            (record, arena.isolates.len())
        };

        ReactorMetrics::record_isolates(live);
        tracing::debug!(%isolate, "releasing isolate");
        let IsolateRecord { queue, drained } = record;
        drop(queue);
        Ok(drained)
    }

    /// Run `continuation` on `isolate` once `completion` resolves
    ///
    /// This is the non-blocking way to wait: the isolate is free to run other jobs meanwhile.
    /// If the isolate is gone by then the continuation is dropped with a warning.
    pub fn observe_on<T, F>(&self, isolate: IsolateId, completion: &DeferredCompletion<T>, continuation: F)
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let reactor = Arc::downgrade(&self.inner);
        completion.observe(move |outcome| {
            let outcome = outcome.clone();
            let Some(inner) = reactor.upgrade() else {
                tracing::debug!(%isolate, "reactor dropped before continuation could run");
                return;
            };
            if let Err(error) = inner.submit(isolate, Box::new(move || continuation(outcome))) {
                tracing::warn!(%isolate, %error, "dropping continuation");
            }
        });
    }

    /// Enqueue an arbitrary job on `isolate`
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::UnknownIsolate`] if the isolate is gone.
    pub fn spawn_on<F>(&self, isolate: IsolateId, job: F) -> Result<(), ReactorError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.submit(isolate, Box::new(job))
    }

    /// Whether `proxy` currently has a handler or delegate
    #[must_use]
    pub fn is_bound(&self, proxy: ProxyId) -> bool {
        self.inner
            .lock()
            .proxies
            .get(&proxy)
            .is_some_and(|record| record.status == ProxyStatus::Bound)
    }

    /// Number of proxies that currently have a handler or delegate
    #[must_use]
    pub fn bound_proxies(&self) -> usize {
        self.inner
            .lock()
            .proxies
            .values()
            .filter(|record| record.status == ProxyStatus::Bound)
            .count()
    }

    /// Number of isolates not yet released
    #[must_use]
    pub fn live_isolates(&self) -> usize {
        self.inner.lock().isolates.len()
    }

    /// Isolate and proxy counts; a reactor itself is always healthy
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        HealthCheck::new("reactor", HealthStatus::Healthy)
            .with_figure("live_isolates", self.live_isolates())
            .with_figure("bound_proxies", self.bound_proxies())
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arena = self.inner.lock();
        let mut kinds: Vec<_> = arena.proxies.values().map(|record| record.kind).collect();
        kinds.sort_unstable();
        f.debug_struct("Reactor")
            .field("isolates", &arena.isolates.len())
            .field("proxies", &kinds)
            .finish()
    }
}

impl ReactorInner {
    fn lock(&self) -> MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(&self, isolate: IsolateId, job: Job) -> Result<(), ReactorError> {
        let result = enqueue(&self.lock().isolates, isolate, job);
        result.map_err(|rejected| rejected.error)
    }

    fn dispatch<K: CallbackKind>(
        &self,
        proxy: ProxyId,
        invocation: K::Invocation,
    ) -> Result<DeferredCompletion<K::Output>, ReactorError> {
        enum Route<K: CallbackKind> {
            Queued,
            Forward(Arc<dyn Callbacks<K>>, K::Invocation, Trigger<K::Output>),
            Refused(Rejected),
        }

        let (completion, trigger) = DeferredCompletion::pending();
        let route = {
            let mut arena = self.lock();
            let Arena { isolates, proxies } = &mut *arena;
            let record = proxies.get_mut(&proxy).ok_or(ReactorError::UnknownProxy(proxy))?;
            let slot = slot_mut::<K>(&mut record.slot, proxy)?;
            match &slot.binding {
                Binding::Unassigned => {
                    slot.buffered.push_back((invocation, trigger));
                    Route::Queued
                },
                Binding::Destroyed => return Err(ReactorError::ProxyDestroyed(proxy)),
                Binding::Handler { handler, isolate } => {
                    let job = invocation_job(proxy, Arc::clone(handler), invocation, trigger);
                    match enqueue(isolates, *isolate, job) {
                        Ok(()) => Route::Queued,
                        Err(rejected) => Route::Refused(rejected),
                    }
                },
                Binding::Delegate(delegate) => Route::Forward(Arc::clone(delegate), invocation, trigger),
            }
        };

        match route {
            Route::Queued => Ok(completion),
            Route::Forward(delegate, invocation, trigger) => {
                delegate.invoke(invocation).link(trigger);
                Ok(completion)
            },
            Route::Refused(Rejected { error, job }) => {
                drop(job);
                Err(error)
            },
        }
    }
}

fn enqueue(
    isolates: &HashMap<IsolateId, IsolateRecord>,
    isolate: IsolateId,
    job: Job,
) -> Result<(), Rejected> {
    let Some(record) = isolates.get(&isolate) else {
        return Err(Rejected {
            error: ReactorError::UnknownIsolate(isolate),
            job,
        });
    };
    record.queue.send(job).map_err(|refused| Rejected {
        error: ReactorError::UnknownIsolate(isolate),
        job: refused.0,
    })
}

fn slot_mut<K: CallbackKind>(
    slot: &mut Box<dyn Any + Send>,
    proxy: ProxyId,
) -> Result<&mut ProxySlot<K>, ReactorError> {
    slot.downcast_mut::<ProxySlot<K>>()
        .ok_or(ReactorError::KindMismatch {
            proxy,
            expected: K::NAME,
        })
}

fn lock_handler<K: CallbackKind>(
    handler: &SharedHandler<K>,
) -> MutexGuard<'_, Box<dyn CallbackHandler<K>>> {
    handler.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Lifecycle {
    Registered(IsolateId),
    Unregistered,
}

fn lifecycle_job<K: CallbackKind>(handler: SharedHandler<K>, proxy: ProxyId, event: Lifecycle) -> Job {
    Box::new(move || {
        let mut guard = lock_handler(&handler);
        let outcome = catch_unwind(AssertUnwindSafe(|| match event {
            Lifecycle::Registered(isolate) => guard.registered_callbacks(proxy, isolate),
            Lifecycle::Unregistered => guard.unregistered_callbacks(proxy),
        }));
        if outcome.is_err() {
            ReactorMetrics::record_handler_failure(K::NAME);
            tracing::error!(%proxy, kind = K::NAME, "lifecycle notification panicked; ignoring");
        }
    })
}

fn invocation_job<K: CallbackKind>(
    proxy: ProxyId,
    handler: SharedHandler<K>,
    invocation: K::Invocation,
    trigger: Trigger<K::Output>,
) -> Job {
    Box::new(move || {
        ReactorMetrics::record_invocation(K::NAME);
        let mut guard = lock_handler(&handler);
        let result = catch_unwind(AssertUnwindSafe(|| guard.handle(proxy, invocation)));
        match result {
            Ok(Ok(Reply::Ready(output))) => {
                let _ = trigger.succeed(output);
            },
            Ok(Ok(Reply::Deferred(pending))) => pending.link(trigger),
            Ok(Err(error)) => {
                report_failure(&mut **guard, proxy, &trigger, Failure::handler(error.to_string()));
            },
            Err(panic) => {
                let cause = Failure::handler(format!("handler panicked: {}", panic_message(panic.as_ref())));
                report_failure(&mut **guard, proxy, &trigger, cause);
            },
        }
    })
}

fn report_failure<K: CallbackKind>(
    handler: &mut dyn CallbackHandler<K>,
    proxy: ProxyId,
    trigger: &Trigger<K::Output>,
    cause: Failure,
) {
    ReactorMetrics::record_handler_failure(K::NAME);
    tracing::warn!(%proxy, kind = K::NAME, error = %cause, "callback handler failed");
    let _ = trigger.fail(cause.clone());
    if catch_unwind(AssertUnwindSafe(|| handler.failed_callbacks(proxy, &cause))).is_err() {
        tracing::error!(%proxy, kind = K::NAME, "failed_callbacks panicked; ignoring");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Facade for callbacks of kind `K`.
///
/// Every invocation is forwarded to whatever the proxy is currently bound to. Proxies are cheap
/// handles; cloning does not create a new proxy and dropping does not destroy it.
pub struct Proxy<K: CallbackKind> {
    id: ProxyId,
    reactor: Weak<ReactorInner>,
    kind: PhantomData<fn() -> K>,
}

impl<K: CallbackKind> Proxy<K> {
    /// The proxy id
    #[must_use]
    pub const fn id(&self) -> ProxyId {
        self.id
    }

    /// Deliver an invocation, reporting misuse synchronously
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::ProxyDestroyed`] after [`Reactor::destroy_proxy`], or
    /// [`ReactorError::ReactorGone`] once the reactor has been dropped.
    pub fn try_invoke(
        &self,
        invocation: K::Invocation,
    ) -> Result<DeferredCompletion<K::Output>, ReactorError> {
        let reactor = self.reactor.upgrade().ok_or(ReactorError::ReactorGone)?;
        reactor.dispatch::<K>(self.id, invocation)
    }
}

impl<K: CallbackKind> Callbacks<K> for Proxy<K> {
    fn invoke(&self, invocation: K::Invocation) -> DeferredCompletion<K::Output> {
        self.try_invoke(invocation).unwrap_or_else(|error| {
            tracing::debug!(proxy = %self.id, kind = K::NAME, %error, "invocation refused");
            DeferredCompletion::failed(error.into())
        })
    }
}

impl<K: CallbackKind> Clone for Proxy<K> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            reactor: Weak::clone(&self.reactor),
            kind: PhantomData,
        }
    }
}

impl<K: CallbackKind> fmt::Debug for Proxy<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("id", &self.id)
            .field("kind", &K::NAME)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use switchyard_core::callbacks::HandlerError;

    // ========================================================================
    // Test fixtures
    // ========================================================================

    struct Echo;

    impl CallbackKind for Echo {
        type Invocation = EchoCall;
        type Output = String;
        const NAME: &'static str = "echo";
    }

    #[derive(Debug)]
    enum EchoCall {
        Say(String),
        Refuse,
        Explode,
        Later(DeferredCompletion<String>),
    }

    #[derive(Clone, Default)]
    struct Journal(Arc<Mutex<Vec<String>>>);

    impl Journal {
        fn push(&self, entry: impl Into<String>) {
            self.0.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct EchoHandler {
        name: &'static str,
        journal: Journal,
    }

    impl CallbackHandler<Echo> for EchoHandler {
        fn handle(&mut self, _proxy: ProxyId, invocation: EchoCall) -> Result<Reply<String>, HandlerError> {
            match invocation {
                EchoCall::Say(text) => {
                    self.journal.push(format!("{}:{text}", self.name));
                    Ok(Reply::Ready(text))
                },
                EchoCall::Refuse => Err(HandlerError::new("refused")),
                EchoCall::Explode => panic!("handler exploded"),
                EchoCall::Later(pending) => Ok(Reply::Deferred(pending)),
            }
        }

        fn registered_callbacks(&mut self, _proxy: ProxyId, _isolate: IsolateId) {
            self.journal.push(format!("{}:registered", self.name));
        }

        fn unregistered_callbacks(&mut self, _proxy: ProxyId) {
            self.journal.push(format!("{}:unregistered", self.name));
        }

        fn failed_callbacks(&mut self, _proxy: ProxyId, cause: &Failure) {
            self.journal.push(format!("{}:failed:{}", self.name, cause.kind()));
        }
    }

    fn handler(name: &'static str, journal: &Journal) -> EchoHandler {
        EchoHandler {
            name,
            journal: journal.clone(),
        }
    }

    // ========================================================================
    // Tests
    // ========================================================================

    #[tokio::test]
    async fn test_buffered_invocations_flush_after_registration() {
        let reactor = Reactor::new().unwrap();
        let isolate = reactor.create_isolate();
        let proxy = reactor.create_proxy::<Echo>();
        let journal = Journal::default();

        let first = proxy.invoke(EchoCall::Say("one".into()));
        let second = proxy.invoke(EchoCall::Say("two".into()));
        assert!(!first.is_resolved());

        reactor.assign_handler(&proxy, handler("a", &journal), isolate).unwrap();
        assert_eq!(second.await.unwrap(), "two");
        assert_eq!(first.await.unwrap(), "one");
        assert_eq!(journal.entries(), vec!["a:registered", "a:one", "a:two"]);
    }

    #[tokio::test]
    async fn test_handler_error_fails_invocation_and_notifies_once() {
        let reactor = Reactor::new().unwrap();
        let isolate = reactor.create_isolate();
        let proxy = reactor.create_proxy::<Echo>();
        let journal = Journal::default();
        reactor.assign_handler(&proxy, handler("a", &journal), isolate).unwrap();

        let refused = proxy.invoke(EchoCall::Refuse).await.unwrap_err();
        assert_eq!(refused.kind(), FailureKind::Handler);
        assert_eq!(proxy.invoke(EchoCall::Say("after".into())).await.unwrap(), "after");

        let failures = journal
            .entries()
            .into_iter()
            .filter(|entry| entry.starts_with("a:failed"))
            .count();
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_isolate() {
        let reactor = Reactor::new().unwrap();
        let isolate = reactor.create_isolate();
        let proxy = reactor.create_proxy::<Echo>();
        let journal = Journal::default();
        reactor.assign_handler(&proxy, handler("a", &journal), isolate).unwrap();

        let exploded = proxy.invoke(EchoCall::Explode);
        let next = proxy.invoke(EchoCall::Say("still alive".into()));

        assert!(exploded.await.unwrap_err().message().contains("handler exploded"));
        assert_eq!(next.await.unwrap(), "still alive");
        assert!(journal.entries().contains(&"a:failed:handler".to_string()));
    }

    #[tokio::test]
    async fn test_deferred_reply_does_not_block_isolate() {
        let reactor = Reactor::new().unwrap();
        let isolate = reactor.create_isolate();
        let proxy = reactor.create_proxy::<Echo>();
        let journal = Journal::default();
        reactor.assign_handler(&proxy, handler("a", &journal), isolate).unwrap();

        let (later, trigger) = DeferredCompletion::pending();
        let deferred = proxy.invoke(EchoCall::Later(later));
        assert_eq!(proxy.invoke(EchoCall::Say("meanwhile".into())).await.unwrap(), "meanwhile");
        assert!(!deferred.is_resolved());

        trigger.succeed("eventually".to_string()).unwrap();
        assert_eq!(deferred.await.unwrap(), "eventually");
    }

    #[tokio::test]
    async fn test_reassignment_unregisters_previous_handler() {
        let reactor = Reactor::new().unwrap();
        let isolate = reactor.create_isolate();
        let proxy = reactor.create_proxy::<Echo>();
        let journal = Journal::default();

        reactor.assign_handler(&proxy, handler("a", &journal), isolate).unwrap();
        reactor.assign_handler(&proxy, handler("b", &journal), isolate).unwrap();
        proxy.invoke(EchoCall::Say("hi".into())).await.unwrap();

        assert_eq!(
            journal.entries(),
            vec!["a:registered", "a:unregistered", "b:registered", "b:hi"]
        );
    }

    #[tokio::test]
    async fn test_destroyed_proxy_fails_fast() {
        let reactor = Reactor::new().unwrap();
        let isolate = reactor.create_isolate();
        let proxy = reactor.create_proxy::<Echo>();
        let journal = Journal::default();
        reactor.assign_handler(&proxy, handler("a", &journal), isolate).unwrap();

        reactor.destroy_proxy(&proxy).unwrap();
        assert_eq!(
            proxy.try_invoke(EchoCall::Say("late".into())).unwrap_err(),
            ReactorError::ProxyDestroyed(proxy.id())
        );
        assert_eq!(
            reactor.destroy_proxy(&proxy).unwrap_err(),
            ReactorError::ProxyDestroyed(proxy.id())
        );
        assert!(!reactor.is_bound(proxy.id()));

        reactor.destroy_isolate(isolate).unwrap().await.unwrap();
        assert!(journal.entries().contains(&"a:unregistered".to_string()));
    }

    #[tokio::test]
    async fn test_isolate_in_use_cannot_be_destroyed() {
        let reactor = Reactor::new().unwrap();
        let isolate = reactor.create_isolate();
        let proxy = reactor.create_proxy::<Echo>();
        reactor
            .assign_handler(&proxy, handler("a", &Journal::default()), isolate)
            .unwrap();

        assert_eq!(
            reactor.destroy_isolate(isolate).unwrap_err(),
            ReactorError::IsolateInUse {
                isolate,
                proxies: 1
            }
        );
        assert_eq!(reactor.live_isolates(), 1);
    }

    #[tokio::test]
    async fn test_delegate_forwards_invocations() {
        let reactor = Reactor::new().unwrap();
        let isolate = reactor.create_isolate();
        let journal = Journal::default();

        let target = reactor.create_proxy::<Echo>();
        reactor.assign_handler(&target, handler("target", &journal), isolate).unwrap();

        let front = reactor.create_proxy::<Echo>();
        let buffered = front.invoke(EchoCall::Say("early".into()));
        reactor.assign_delegate(&front, Arc::new(target.clone())).unwrap();

        assert_eq!(buffered.await.unwrap(), "early");
        assert_eq!(front.invoke(EchoCall::Say("late".into())).await.unwrap(), "late");
        assert!(reactor.is_bound(front.id()));
    }

    #[tokio::test]
    async fn test_observe_on_runs_continuation_on_isolate() {
        let reactor = Reactor::new().unwrap();
        let isolate = reactor.create_isolate();
        let (source, trigger) = DeferredCompletion::<u32>::pending();
        let (done, done_trigger) = DeferredCompletion::<u32>::pending();

        reactor.observe_on(isolate, &source, move |outcome| {
            done_trigger.succeed(outcome.unwrap() + 1).unwrap();
        });
        trigger.succeed(41).unwrap();

        assert_eq!(done.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_spawn_on_unknown_isolate_is_rejected() {
        let reactor = Reactor::new().unwrap();
        let isolate = reactor.create_isolate();
        reactor.destroy_isolate(isolate).unwrap().await.unwrap();

        assert_eq!(
            reactor.spawn_on(isolate, || {}).unwrap_err(),
            ReactorError::UnknownIsolate(isolate)
        );
    }

    #[tokio::test]
    async fn test_health_counts_isolates_and_bound_proxies() {
        let reactor = Reactor::new().unwrap();
        let isolate = reactor.create_isolate();
        let proxy = reactor.create_proxy::<Echo>();
        let _unbound = reactor.create_proxy::<Echo>();
        reactor
            .assign_handler(&proxy, handler("a", &Journal::default()), isolate)
            .unwrap();

        let check = reactor.health();
        assert_eq!(check.subject, "reactor");
        assert!(check.status.is_healthy());
        assert_eq!(check.figure("live_isolates"), Some(1));
        assert_eq!(check.figure("bound_proxies"), Some(1));

        reactor.destroy_proxy(&proxy).unwrap();
        reactor.destroy_isolate(isolate).unwrap().await.unwrap();
        let check = reactor.health();
        assert_eq!(check.figure("live_isolates"), Some(0));
        assert_eq!(check.figure("bound_proxies"), Some(0));
    }

    #[test]
    fn test_reactor_requires_runtime() {
        assert_eq!(Reactor::new().unwrap_err(), ReactorError::NoRuntime);
    }
}
