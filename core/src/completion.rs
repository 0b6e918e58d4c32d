//! Single-resolution asynchronous results.
//!
//! A [`DeferredCompletion`] is the read side of an asynchronous outcome and a [`Trigger`] is the
//! write side. The pair is created together by whoever starts the asynchronous work:
//!
//! ```
//! use switchyard_core::completion::DeferredCompletion;
//!
//! let (completion, trigger) = DeferredCompletion::<u32>::pending();
//! completion.observe(|outcome| assert_eq!(outcome.as_ref().ok(), Some(&7)));
//! trigger.succeed(7).unwrap();
//! assert_eq!(completion.value().unwrap(), 7);
//! ```
//!
//! # Guarantees
//!
//! - A completion resolves **at most once**. Any further attempt returns
//!   [`CompletionError::AlreadyResolved`] and leaves the first outcome untouched.
//! - Every observer runs exactly once: immediately if the completion is already resolved,
//!   otherwise on the thread that resolves it. Observers run outside the internal lock.
//! - A trigger dropped without resolving fails its completion with [`FailureKind::Abandoned`],
//!   so a forgotten trigger never leaves a waiter pending forever.
//! - Completions are also `Future`s, so async callers can simply `.await` them.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use thiserror::Error;

/// Classification of a failed outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The channel carrying the request was torn down before a reply arrived
    ChannelClosed,
    /// An external timer expired before a reply arrived
    Timeout,
    /// The transport refused or lost the message
    Transport,
    /// A callback handler returned an error or panicked
    Handler,
    /// The remote peer answered with a negative outcome
    Remote,
    /// A reply had the wrong shape for the request it answered
    Protocol,
    /// The trigger was dropped without ever being resolved
    Abandoned,
    /// The owning component failed internally
    Internal,
}

impl FailureKind {
    /// Stable lowercase name, used in logs and metric labels
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ChannelClosed => "channel-closed",
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::Handler => "handler",
            Self::Remote => "remote",
            Self::Protocol => "protocol",
            Self::Abandoned => "abandoned",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The cause carried by a failed completion.
///
/// Failures are cheap to clone so every observer of a completion sees the same cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct Failure {
    kind: FailureKind,
    message: String,
}

impl Failure {
    /// Create a failure of the given kind
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The channel was closed while the request was outstanding
    #[must_use]
    pub fn channel_closed(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ChannelClosed, message)
    }

    /// An external timer expired
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    /// A handler invocation failed
    #[must_use]
    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Handler, message)
    }

    /// The remote peer reported a negative outcome
    #[must_use]
    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Remote, message)
    }

    /// The transport failed
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transport, message)
    }

    /// The failure classification
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        self.kind
    }

    /// Human readable detail
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this failure is of the given kind
    #[must_use]
    pub fn is(&self, kind: FailureKind) -> bool {
        self.kind == kind
    }
}

/// Misuse of a completion or trigger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    /// The outcome was read before the completion resolved
    #[error("completion is not resolved yet")]
    NotResolved,

    /// A second resolution was attempted
    ///
    /// This is a programming error; the first outcome is kept.
    #[error("completion has already been resolved")]
    AlreadyResolved,

    /// The value was requested but the completion resolved as a failure
    #[error("completion resolved with failure: {0}")]
    Failed(Failure),
}

/// The final outcome of a completion.
pub type Outcome<T> = Result<T, Failure>;

type Observer<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

enum Slot<T> {
    Pending {
        observers: SmallVec<[Observer<T>; 2]>,
        wakers: SmallVec<[Waker; 1]>,
    },
    Resolved(Arc<Outcome<T>>),
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
}

impl<T> Shared<T> {
    fn new(slot: Slot<T>) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(slot),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_resolved(&self) -> bool {
        matches!(*self.lock(), Slot::Resolved(_))
    }

    fn resolve(&self, outcome: Outcome<T>) -> Result<(), CompletionError> {
        let outcome = Arc::new(outcome);
        let (observers, wakers) = {
            let mut slot = self.lock();
            if matches!(*slot, Slot::Resolved(_)) {
                return Err(CompletionError::AlreadyResolved);
            }
            match std::mem::replace(&mut *slot, Slot::Resolved(Arc::clone(&outcome))) {
                Slot::Pending { observers, wakers } => (observers, wakers),
                Slot::Resolved(_) => return Err(CompletionError::AlreadyResolved),
            }
        };

        for waker in wakers {
            waker.wake();
        }
        for observer in observers {
            notify(observer, &outcome);
        }
        Ok(())
    }
}

/// Run one observer, containing a panic so the remaining observers still run.
fn notify<T>(observer: Observer<T>, outcome: &Outcome<T>) {
    if catch_unwind(AssertUnwindSafe(|| observer(outcome))).is_err() {
        tracing::error!("completion observer panicked; remaining observers still run");
    }
}

/// Read side of a single-resolution asynchronous outcome.
///
/// Cloning yields another handle onto the same outcome.
pub struct DeferredCompletion<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for DeferredCompletion<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + Sync + 'static> DeferredCompletion<T> {
    /// Create an unresolved completion and the trigger that resolves it
    #[must_use]
    pub fn pending() -> (Self, Trigger<T>) {
        let shared = Shared::new(Slot::Pending {
            observers: SmallVec::new(),
            wakers: SmallVec::new(),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            Trigger { shared },
        )
    }

    /// Create a completion that already succeeded
    #[must_use]
    pub fn succeeded(value: T) -> Self {
        Self {
            shared: Shared::new(Slot::Resolved(Arc::new(Ok(value)))),
        }
    }

    /// Create a completion that already failed
    #[must_use]
    pub fn failed(cause: Failure) -> Self {
        Self {
            shared: Shared::new(Slot::Resolved(Arc::new(Err(cause)))),
        }
    }

    /// Whether the outcome is known
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.shared.is_resolved()
    }

    /// Register a reaction to the outcome
    ///
    /// The observer runs exactly once: right now on the calling thread if the completion is
    /// already resolved, otherwise on whichever thread resolves it.
    pub fn observe<F>(&self, observer: F)
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let outcome = {
            let mut slot = self.shared.lock();
            match &mut *slot {
                Slot::Pending { observers, .. } => {
                    observers.push(Box::new(observer));
                    return;
                },
                Slot::Resolved(outcome) => Arc::clone(outcome),
            }
        };
        notify(Box::new(observer), &outcome);
    }

    /// Inspect the failure cause, if any
    ///
    /// Returns `Ok(None)` for a successful completion.
    ///
    /// # Errors
    ///
    /// Returns [`CompletionError::NotResolved`] if the completion is still pending.
    pub fn cause(&self) -> Result<Option<Failure>, CompletionError> {
        match &*self.shared.lock() {
            Slot::Pending { .. } => Err(CompletionError::NotResolved),
            Slot::Resolved(outcome) => Ok((**outcome).as_ref().err().cloned()),
        }
    }

    /// Transform the successful value once it is available
    #[must_use]
    pub fn map<U, F>(&self, transform: F) -> DeferredCompletion<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        let (mapped, trigger) = DeferredCompletion::pending();
        self.observe(move |outcome| {
            let next = match outcome {
                Ok(value) => Ok(transform(value)),
                Err(cause) => Err(cause.clone()),
            };
            settle(&trigger, next);
        });
        mapped
    }

    /// Transform the successful value with a step that may itself fail
    #[must_use]
    pub fn try_map<U, F>(&self, transform: F) -> DeferredCompletion<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> Result<U, Failure> + Send + 'static,
    {
        let (mapped, trigger) = DeferredCompletion::pending();
        self.observe(move |outcome| {
            let next = match outcome {
                Ok(value) => transform(value),
                Err(cause) => Err(cause.clone()),
            };
            settle(&trigger, next);
        });
        mapped
    }

    /// Chain follow-on asynchronous work
    ///
    /// The continuation receives the successful value and returns another completion; the
    /// returned completion resolves with that inner outcome. Nothing blocks while waiting.
    #[must_use]
    pub fn and_then<U, F>(&self, continuation: F) -> DeferredCompletion<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> DeferredCompletion<U> + Send + 'static,
    {
        let (chained, trigger) = DeferredCompletion::pending();
        self.observe(move |outcome| match outcome {
            Ok(value) => continuation(value).link(trigger),
            Err(cause) => settle(&trigger, Err(cause.clone())),
        });
        chained
    }
}

impl<T: Clone + Send + Sync + 'static> DeferredCompletion<T> {
    /// Read the outcome
    ///
    /// # Errors
    ///
    /// Returns [`CompletionError::NotResolved`] if the completion is still pending.
    pub fn outcome(&self) -> Result<Outcome<T>, CompletionError> {
        match &*self.shared.lock() {
            Slot::Pending { .. } => Err(CompletionError::NotResolved),
            Slot::Resolved(outcome) => Ok(Outcome::clone(outcome)),
        }
    }

    /// Read the successful value
    ///
    /// # Errors
    ///
    /// Returns [`CompletionError::NotResolved`] if still pending, or
    /// [`CompletionError::Failed`] carrying the cause if the completion failed.
    pub fn value(&self) -> Result<T, CompletionError> {
        self.outcome()?.map_err(CompletionError::Failed)
    }

    /// Forward this completion's outcome into another trigger
    pub fn link(&self, trigger: Trigger<T>) {
        self.observe(move |outcome| settle(&trigger, outcome.clone()));
    }
}

impl<T: Clone> Future for DeferredCompletion<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.shared.lock();
        match &mut *slot {
            Slot::Resolved(outcome) => Poll::Ready(Outcome::clone(outcome)),
            Slot::Pending { wakers, .. } => {
                if !wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            },
        }
    }
}

impl<T> fmt::Debug for DeferredCompletion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.shared.lock() {
            Slot::Pending { .. } => "pending",
            Slot::Resolved(outcome) if outcome.is_ok() => "succeeded",
            Slot::Resolved(_) => "failed",
        };
        f.debug_struct("DeferredCompletion")
            .field("state", &state)
            .finish()
    }
}

/// Write side of a [`DeferredCompletion`].
///
/// Held privately by whoever initiated the asynchronous work. Not cloneable.
pub struct Trigger<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Trigger<T> {
    /// Resolve the paired completion with a value
    ///
    /// # Errors
    ///
    /// Returns [`CompletionError::AlreadyResolved`] if the completion already has an outcome.
    pub fn succeed(&self, value: T) -> Result<(), CompletionError> {
        self.resolve(Ok(value))
    }

    /// Resolve the paired completion with a failure
    ///
    /// # Errors
    ///
    /// Returns [`CompletionError::AlreadyResolved`] if the completion already has an outcome.
    pub fn fail(&self, cause: Failure) -> Result<(), CompletionError> {
        self.resolve(Err(cause))
    }

    /// Resolve the paired completion with an outcome
    ///
    /// # Errors
    ///
    /// Returns [`CompletionError::AlreadyResolved`] if the completion already has an outcome.
    pub fn resolve(&self, outcome: Outcome<T>) -> Result<(), CompletionError> {
        self.shared.resolve(outcome).inspect_err(|_| {
            tracing::error!("rejected a second resolution of a deferred completion");
        })
    }

    /// Whether the paired completion already has an outcome
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.shared.is_resolved()
    }

    /// Another read handle onto the paired completion
    #[must_use]
    pub fn completion(&self) -> DeferredCompletion<T> {
        DeferredCompletion {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for Trigger<T> {
    fn drop(&mut self) {
        if !self.shared.is_resolved() {
            let _ = self.shared.resolve(Err(Failure::new(
                FailureKind::Abandoned,
                "trigger dropped without resolving its completion",
            )));
        }
    }
}

impl<T> fmt::Debug for Trigger<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Resolve a trigger that is exclusively owned by the caller.
///
/// Used by internal chaining where a duplicate resolution would indicate a bug in this module;
/// [`Trigger::resolve`] already logs that case.
pub(crate) fn settle<T>(trigger: &Trigger<T>, outcome: Outcome<T>) {
    let _ = trigger.resolve(outcome);
}
