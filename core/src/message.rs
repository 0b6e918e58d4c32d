//! Messages exchanged between component endpoints.
//!
//! Requests that expect an answer carry a [`CallReference`]; every reply echoes that reference,
//! an outcome flag and either an output payload or error information. Payloads are arbitrary
//! JSON values so resource protocols stay opaque to the runtime.

use crate::completion::Failure;
use crate::identity::{CallReference, ComponentIdentifier};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque request or reply payload
pub type Payload = serde_json::Value;

/// Point-to-point request expecting exactly one [`CallReply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    /// Operation name understood by the target component
    pub operation: String,
    /// Operation arguments
    pub inputs: Payload,
    /// Correlation reference echoed by the reply
    pub reference: CallReference,
}

impl CallRequest {
    /// Build a request under a freshly minted reference
    #[must_use]
    pub fn new(operation: impl Into<String>, inputs: Payload) -> Self {
        Self {
            operation: operation.into(),
            inputs,
            reference: CallReference::mint(),
        }
    }
}

/// Answer to a [`CallRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallReply {
    /// Whether the operation succeeded
    pub ok: bool,
    /// Outputs when `ok`, error information otherwise
    pub outputs_or_error: Payload,
    /// Reference of the request being answered
    pub reference: CallReference,
}

impl CallReply {
    /// Positive reply carrying `outputs`
    #[must_use]
    pub const fn succeeded(reference: CallReference, outputs: Payload) -> Self {
        Self {
            ok: true,
            outputs_or_error: outputs,
            reference,
        }
    }

    /// Negative reply carrying `error`
    #[must_use]
    pub const fn failed(reference: CallReference, error: Payload) -> Self {
        Self {
            ok: false,
            outputs_or_error: error,
            reference,
        }
    }

    /// Convert into the outputs, or a remote failure describing the error payload
    ///
    /// # Errors
    ///
    /// Returns a [`Failure`] of kind `Remote` when the reply is negative.
    pub fn into_outputs(self) -> Result<Payload, Failure> {
        if self.ok {
            Ok(self.outputs_or_error)
        } else {
            Err(Failure::remote(describe_error(&self.outputs_or_error)))
        }
    }
}

/// Fire-and-forget request; no reference, no reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CastRequest {
    /// Operation name understood by the target component
    pub operation: String,
    /// Operation arguments
    pub inputs: Payload,
}

impl CastRequest {
    /// Build a cast request
    #[must_use]
    pub fn new(operation: impl Into<String>, inputs: Payload) -> Self {
        Self {
            operation: operation.into(),
            inputs,
        }
    }
}

/// Names an externally managed resource to acquire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceSpecification {
    /// Resource identifier, unique within the deployment
    pub identifier: String,
    /// Resource kind, e.g. `"queue"` or `"kv-store"`
    pub kind: String,
}

impl ResourceSpecification {
    /// Build a specification
    #[must_use]
    pub fn new(identifier: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            kind: kind.into(),
        }
    }
}

/// Connection parameters returned by a successful acquire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Identifier of the acquired resource
    pub identifier: String,
    /// Connection parameters
    pub parameters: Payload,
}

/// Request to acquire a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquireRequest {
    /// What to acquire
    pub resource: ResourceSpecification,
    /// Correlation reference echoed by the reply
    pub reference: CallReference,
}

/// Answer to an [`AcquireRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquireReply {
    /// Whether the resource was acquired
    pub ok: bool,
    /// Descriptor when `ok`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<ResourceDescriptor>,
    /// Error information when not `ok`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Payload>,
    /// Reference of the request being answered
    pub reference: CallReference,
}

impl AcquireReply {
    /// Positive reply carrying the descriptor
    #[must_use]
    pub const fn succeeded(reference: CallReference, descriptor: ResourceDescriptor) -> Self {
        Self {
            ok: true,
            descriptor: Some(descriptor),
            error: None,
            reference,
        }
    }

    /// Negative reply carrying `error`
    #[must_use]
    pub const fn failed(reference: CallReference, error: Payload) -> Self {
        Self {
            ok: false,
            descriptor: None,
            error: Some(error),
            reference,
        }
    }

    /// Convert into the descriptor, or a failure
    ///
    /// # Errors
    ///
    /// Returns a `Remote` failure for a negative reply and a `Protocol` failure for a positive
    /// reply without a descriptor.
    pub fn into_descriptor(self) -> Result<ResourceDescriptor, Failure> {
        match (self.ok, self.descriptor) {
            (true, Some(descriptor)) => Ok(descriptor),
            (true, None) => Err(Failure::new(
                crate::completion::FailureKind::Protocol,
                "positive acquire reply without a descriptor",
            )),
            (false, _) => Err(Failure::remote(
                self.error
                    .as_ref()
                    .map_or_else(|| "acquire refused".to_string(), describe_error),
            )),
        }
    }
}

/// Request to join a named group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Group to join
    pub group: ComponentIdentifier,
    /// Correlation reference echoed by the reply
    pub reference: CallReference,
}

/// Answer to a [`RegisterRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterReturn {
    /// Reference of the request being answered
    pub reference: CallReference,
    /// Whether the registration was accepted
    pub ok: bool,
}

/// Any reply that is routed back through the pending call table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReturnMessage {
    /// Reply to a call
    Call(CallReply),
    /// Reply to an acquire
    Acquire(AcquireReply),
    /// Reply to a registration
    Register(RegisterReturn),
}

impl ReturnMessage {
    /// The reference this reply answers
    #[must_use]
    pub const fn reference(&self) -> CallReference {
        match self {
            Self::Call(reply) => reply.reference,
            Self::Acquire(reply) => reply.reference,
            Self::Register(reply) => reply.reference,
        }
    }

    /// Short name of the reply kind
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Call(_) => "call",
            Self::Acquire(_) => "acquire",
            Self::Register(_) => "register",
        }
    }
}

/// Wire name of an envelope body, selecting its decode routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageSpec {
    /// [`CallRequest`]
    Call,
    /// [`CallReply`]
    CallReturn,
    /// [`CastRequest`]
    Cast,
    /// [`AcquireRequest`]
    Acquire,
    /// [`AcquireReply`]
    AcquireReturn,
    /// [`RegisterRequest`]
    Register,
    /// [`RegisterReturn`]
    RegisterReturn,
    /// Empty body; orderly shutdown
    Terminate,
}

impl MessageSpec {
    /// Every known spec
    pub const ALL: [Self; 8] = [
        Self::Call,
        Self::CallReturn,
        Self::Cast,
        Self::Acquire,
        Self::AcquireReturn,
        Self::Register,
        Self::RegisterReturn,
        Self::Terminate,
    ];

    /// Name carried in [`crate::transport::Envelope::message`]
    #[must_use]
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::Call => "component:call",
            Self::CallReturn => "component:call-return",
            Self::Cast => "component:cast",
            Self::Acquire => "component:acquire",
            Self::AcquireReturn => "component:acquire-return",
            Self::Register => "component:register",
            Self::RegisterReturn => "component:register-return",
            Self::Terminate => "component:terminate",
        }
    }
}

impl fmt::Display for MessageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl FromStr for MessageSpec {
    type Err = String;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|spec| spec.wire_name() == name)
            .ok_or_else(|| name.to_string())
    }
}

/// Render an error payload as a message: strings verbatim, anything else as JSON.
fn describe_error(error: &Payload) -> String {
    match error {
        Payload::String(message) => message.clone(),
        other => other.to_string(),
    }
}
