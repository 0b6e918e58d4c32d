//! Callback kinds, invocation records and handler contracts.
//!
//! Every callback interface is described by a [`CallbackKind`]: a marker type naming the enum
//! of invocation records a proxy of that kind accepts and the output each invocation completes
//! with. A [`Callbacks`] object accepts invocations and hands back a [`DeferredCompletion`]; a
//! [`CallbackHandler`] is the concrete logic the reactor runs on an isolate.
//!
//! # Kinds
//!
//! | Kind                    | Invocation           | Output              |
//! |-------------------------|----------------------|---------------------|
//! | [`ComponentCallbacks`]  | [`ComponentEvent`]   | `()`                |
//! | [`ComponentController`] | [`ControllerRequest`]| `()`                |
//! | [`ComponentConnector`]  | [`ConnectorRequest`] | [`ConnectorOutput`] |
//! | [`ChannelResolver`]     | [`ResolveRequest`]   | [`ResolvedEndpoint`]|

use crate::completion::{DeferredCompletion, Failure};
use crate::identity::{CallReference, ComponentIdentifier, IsolateId, ProxyId};
use crate::message::{
    AcquireReply, AcquireRequest, CallReply, CallRequest, CastRequest, Payload, RegisterRequest,
    RegisterReturn, ResourceDescriptor, ResourceSpecification,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Describes one callback interface.
pub trait CallbackKind: Send + Sync + 'static {
    /// Invocation record: a method tag plus its arguments
    type Invocation: fmt::Debug + Send + 'static;

    /// Value each invocation completes with
    type Output: Clone + Send + Sync + 'static;

    /// Name used in logs
    const NAME: &'static str;
}

/// Anything that accepts invocations of kind `K`.
pub trait Callbacks<K: CallbackKind>: Send + Sync {
    /// Deliver an invocation; the completion resolves once it has been handled
    fn invoke(&self, invocation: K::Invocation) -> DeferredCompletion<K::Output>;
}

/// What a handler produces for one invocation.
pub enum Reply<T> {
    /// The output is available now
    Ready(T),
    /// The output arrives later; the isolate is not blocked while waiting
    Deferred(DeferredCompletion<T>),
}

impl<T> fmt::Debug for Reply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(_) => f.write_str("Reply::Ready"),
            Self::Deferred(completion) => write!(f, "Reply::Deferred({completion:?})"),
        }
    }
}

/// Error returned by a handler invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    /// Create a handler error
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<Failure> for HandlerError {
    fn from(failure: Failure) -> Self {
        Self(failure.to_string())
    }
}

/// Concrete callback logic, bound to a proxy and run on an isolate.
///
/// The reactor never runs two methods of the same isolate concurrently, so handlers take
/// `&mut self` and need no internal locking.
pub trait CallbackHandler<K: CallbackKind>: Send {
    /// Handle one invocation
    ///
    /// # Errors
    ///
    /// An error fails the invocation's completion and is reported back through
    /// [`CallbackHandler::failed_callbacks`].
    fn handle(
        &mut self,
        proxy: ProxyId,
        invocation: K::Invocation,
    ) -> Result<Reply<K::Output>, HandlerError>;

    /// The handler was bound to `proxy` on `isolate`
    fn registered_callbacks(&mut self, _proxy: ProxyId, _isolate: IsolateId) {}

    /// The handler was detached from `proxy`
    fn unregistered_callbacks(&mut self, _proxy: ProxyId) {}

    /// An invocation on `proxy` failed with `cause`
    fn failed_callbacks(&mut self, _proxy: ProxyId, _cause: &Failure) {}
}

// ============================================================================
// Component callbacks (inbound)
// ============================================================================

/// Inbound notifications delivered to a component endpoint.
pub struct ComponentCallbacks;

impl CallbackKind for ComponentCallbacks {
    type Invocation = ComponentEvent;
    type Output = ();
    const NAME: &'static str = "component-callbacks";
}

/// Invocation records of [`ComponentCallbacks`].
pub enum ComponentEvent {
    /// A peer called this component
    Called(CallRequest),
    /// A reply to one of this component's calls
    CallReturned(CallReply),
    /// A peer cast to this component
    Casted(CastRequest),
    /// A reply to one of this component's acquires
    AcquireReturned(AcquireReply),
    /// A reply to one of this component's registrations
    RegisterReturned(RegisterReturn),
    /// The channel is up; outbound requests go through `controller`
    Initialized(Arc<dyn Callbacks<ComponentController>>),
    /// The peer asked this component to shut down
    Terminated,
    /// The channel failed
    Failed(Failure),
}

impl ComponentEvent {
    /// Short method tag
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Called(_) => "called",
            Self::CallReturned(_) => "call-returned",
            Self::Casted(_) => "casted",
            Self::AcquireReturned(_) => "acquire-returned",
            Self::RegisterReturned(_) => "register-returned",
            Self::Initialized(_) => "initialized",
            Self::Terminated => "terminated",
            Self::Failed(_) => "failed",
        }
    }
}

impl fmt::Debug for ComponentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Called(request) => f.debug_tuple("Called").field(request).finish(),
            Self::CallReturned(reply) => f.debug_tuple("CallReturned").field(reply).finish(),
            Self::Casted(request) => f.debug_tuple("Casted").field(request).finish(),
            Self::AcquireReturned(reply) => f.debug_tuple("AcquireReturned").field(reply).finish(),
            Self::RegisterReturned(reply) => {
                f.debug_tuple("RegisterReturned").field(reply).finish()
            },
            Self::Initialized(_) => f.write_str("Initialized(..)"),
            Self::Terminated => f.write_str("Terminated"),
            Self::Failed(cause) => f.debug_tuple("Failed").field(cause).finish(),
        }
    }
}

// ============================================================================
// Component controller (outbound)
// ============================================================================

/// Outbound requests a component sends through its channel.
///
/// Each output only confirms the request left; replies arrive later as [`ComponentEvent`]s.
pub struct ComponentController;

impl CallbackKind for ComponentController {
    type Invocation = ControllerRequest;
    type Output = ();
    const NAME: &'static str = "component-controller";
}

/// Invocation records of [`ComponentController`].
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerRequest {
    /// Join a named group
    Register(RegisterRequest),
    /// Call another component
    Call {
        /// Target component or group
        target: ComponentIdentifier,
        /// The request
        request: CallRequest,
    },
    /// Answer a call this component received
    CallReturn(CallReply),
    /// Cast to another component
    Cast {
        /// Target component or group
        target: ComponentIdentifier,
        /// The request
        request: CastRequest,
    },
    /// Acquire a resource
    Acquire(AcquireRequest),
    /// Ask the peer for an orderly shutdown
    Terminate,
}

impl ControllerRequest {
    /// Short method tag
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::Call { .. } => "call",
            Self::CallReturn(_) => "call-return",
            Self::Cast { .. } => "cast",
            Self::Acquire(_) => "acquire",
            Self::Terminate => "terminate",
        }
    }
}

// ============================================================================
// Component connector (application-facing)
// ============================================================================

/// Application-facing requests to other components and resources.
pub struct ComponentConnector;

impl CallbackKind for ComponentConnector {
    type Invocation = ConnectorRequest;
    type Output = ConnectorOutput;
    const NAME: &'static str = "component-connector";
}

/// Invocation records of [`ComponentConnector`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorRequest {
    /// Call `operation` on `target` and wait for its outputs
    Call {
        /// Target component or group
        target: ComponentIdentifier,
        /// Operation name
        operation: String,
        /// Operation arguments
        inputs: Payload,
        /// Reference the call is correlated under, minted by the caller
        reference: CallReference,
    },
    /// Cast `operation` to `target`
    Cast {
        /// Target component or group
        target: ComponentIdentifier,
        /// Operation name
        operation: String,
        /// Operation arguments
        inputs: Payload,
    },
    /// Acquire a resource
    Acquire(ResourceSpecification),
}

/// Outputs of [`ComponentConnector`] invocations.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorOutput {
    /// Outputs of a successful call
    Outputs(Payload),
    /// A cast was handed to the channel
    Sent,
    /// Descriptor of an acquired resource
    Resource(ResourceDescriptor),
}

// ============================================================================
// Channel resolver
// ============================================================================

/// Resolves the channel endpoint of a named target.
pub struct ChannelResolver;

impl CallbackKind for ChannelResolver {
    type Invocation = ResolveRequest;
    type Output = ResolvedEndpoint;
    const NAME: &'static str = "channel-resolver";
}

/// Invocation record of [`ChannelResolver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveRequest {
    /// Name of the channel to resolve
    pub target: String,
}

/// Where a resolved channel lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEndpoint {
    /// Identifier of the channel owner
    pub identifier: String,
    /// Endpoint address
    pub endpoint: String,
}
