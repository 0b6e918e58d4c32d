//! Envelope codec between a component endpoint and its transport.
//!
//! [`ChannelController`] is the live [`ComponentController`]: outbound requests are encoded as
//! JSON envelope bodies and handed to the [`Transport`]. Inbound envelopes go through
//! [`ChannelController::receive`], which picks the decode routine from the envelope's message
//! name and delivers the decoded [`ComponentEvent`] to the endpoint's callbacks. Unknown or
//! unexpected messages are rejected here and never reach the endpoint.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::{Arc, Weak};
use switchyard_core::callbacks::{
    Callbacks, ComponentCallbacks, ComponentController, ComponentEvent, ControllerRequest,
};
use switchyard_core::completion::{DeferredCompletion, Failure, FailureKind};
use switchyard_core::message::MessageSpec;
use switchyard_core::transport::{Destination, Envelope, Transport, TransportError};
use thiserror::Error;

/// Channel-level errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The envelope names no known message
    #[error("unknown message `{0}`")]
    UnknownMessage(String),

    /// The message is only ever sent by endpoints, never received
    #[error("message {0} is not accepted inbound")]
    UnsupportedInbound(MessageSpec),

    /// The envelope belongs to another session
    #[error("envelope for session `{actual}` arrived on session `{expected}`")]
    SessionMismatch {
        /// This channel's session
        expected: String,
        /// Session named by the envelope
        actual: String,
    },

    /// The body does not match the message
    #[error("failed to decode {spec}: {reason}")]
    Decode {
        /// Message being decoded
        spec: MessageSpec,
        /// Decoder error
        reason: String,
    },

    /// The body could not be encoded
    #[error("failed to encode {spec}: {reason}")]
    Encode {
        /// Message being encoded
        spec: MessageSpec,
        /// Encoder error
        reason: String,
    },

    /// The transport refused the envelope
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ChannelError {
    /// The failure a caller sees when its request hits this error
    ///
    /// Only transport refusals carry [`FailureKind::Transport`]; codec and routing errors concern
    /// one message and are [`FailureKind::Protocol`].
    #[must_use]
    pub fn failure(&self) -> Failure {
        let kind = match self {
            Self::Transport(_) => FailureKind::Transport,
            Self::UnknownMessage(_)
            | Self::UnsupportedInbound(_)
            | Self::SessionMismatch { .. }
            | Self::Decode { .. }
            | Self::Encode { .. } => FailureKind::Protocol,
        };
        Failure::new(kind, self.to_string())
    }
}

/// Encode `body` into an envelope for `session`
///
/// # Errors
///
/// Returns [`ChannelError::Encode`] if `body` cannot be serialized.
pub fn encode_envelope<T: Serialize>(
    session: &str,
    spec: MessageSpec,
    body: &T,
) -> Result<Envelope, ChannelError> {
    let payload = serde_json::to_vec(body).map_err(|error| ChannelError::Encode {
        spec,
        reason: error.to_string(),
    })?;
    Ok(Envelope::new(session, spec, payload))
}

/// Decode the body of an envelope carrying `spec`
///
/// # Errors
///
/// Returns [`ChannelError::Decode`] if the body does not match.
pub fn decode_body<T: DeserializeOwned>(spec: MessageSpec, payload: &[u8]) -> Result<T, ChannelError> {
    serde_json::from_slice(payload).map_err(|error| ChannelError::Decode {
        spec,
        reason: error.to_string(),
    })
}

/// The transport-backed [`ComponentController`].
pub struct ChannelController {
    session: String,
    transport: Arc<dyn Transport>,
    callbacks: Arc<dyn Callbacks<ComponentCallbacks>>,
    this: Weak<ChannelController>,
}

impl ChannelController {
    /// Create a controller sending over `transport` and delivering inbound events to `callbacks`
    #[must_use]
    pub fn new(
        session: impl Into<String>,
        transport: Arc<dyn Transport>,
        callbacks: Arc<dyn Callbacks<ComponentCallbacks>>,
    ) -> Arc<Self> {
        let session = session.into();
        Arc::new_cyclic(|this| Self {
            session,
            transport,
            callbacks,
            this: Weak::clone(this),
        })
    }

    /// Session this channel serves
    #[must_use]
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Whether the underlying transport is closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Hand this controller to the endpoint, completing its initialization
    pub fn initialize(&self) -> DeferredCompletion<()> {
        let Some(this) = self.this.upgrade() else {
            return DeferredCompletion::failed(Failure::channel_closed("channel controller dropped"));
        };
        let controller: Arc<dyn Callbacks<ComponentController>> = this;
        tracing::debug!(session = %self.session, "initializing endpoint");
        self.callbacks.invoke(ComponentEvent::Initialized(controller))
    }

    /// Decode an inbound envelope and deliver it to the endpoint
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::UnknownMessage`], [`ChannelError::UnsupportedInbound`],
    /// [`ChannelError::SessionMismatch`] or [`ChannelError::Decode`]; nothing is delivered.
    pub fn receive(&self, envelope: &Envelope) -> Result<DeferredCompletion<()>, ChannelError> {
        if envelope.session != self.session {
            return Err(ChannelError::SessionMismatch {
                expected: self.session.clone(),
                actual: envelope.session.clone(),
            });
        }
        let spec: MessageSpec = envelope
            .message
            .parse()
            .map_err(ChannelError::UnknownMessage)?;
        let payload = envelope.payload.as_slice();

        let event = match spec {
            MessageSpec::Call => ComponentEvent::Called(decode_body(spec, payload)?),
            MessageSpec::CallReturn => ComponentEvent::CallReturned(decode_body(spec, payload)?),
            MessageSpec::Cast => ComponentEvent::Casted(decode_body(spec, payload)?),
            MessageSpec::AcquireReturn => ComponentEvent::AcquireReturned(decode_body(spec, payload)?),
            MessageSpec::RegisterReturn => {
                ComponentEvent::RegisterReturned(decode_body(spec, payload)?)
            },
            MessageSpec::Terminate => ComponentEvent::Terminated,
            MessageSpec::Acquire | MessageSpec::Register => {
                return Err(ChannelError::UnsupportedInbound(spec));
            },
        };

        tracing::debug!(session = %self.session, message = %spec, "delivering inbound message");
        Ok(self.callbacks.invoke(event))
    }

    /// Report an inbound transport failure; the endpoint fails
    pub fn receive_failed(&self, error: &TransportError) -> DeferredCompletion<()> {
        tracing::error!(session = %self.session, %error, "transport receive failed");
        self.callbacks
            .invoke(ComponentEvent::Failed(Failure::transport(error.to_string())))
    }

    /// Close the transport; later sends fail
    pub fn close(&self) {
        tracing::debug!(session = %self.session, "closing channel");
        self.transport.close();
    }

    fn send(&self, request: ControllerRequest) -> Result<(), ChannelError> {
        let envelope = match &request {
            ControllerRequest::Register(body) => {
                (Destination::Peer, self.encode(MessageSpec::Register, body)?)
            },
            ControllerRequest::Call { target, request } => (
                Destination::Component(target.clone()),
                self.encode(MessageSpec::Call, request)?,
            ),
            ControllerRequest::CallReturn(body) => {
                (Destination::Peer, self.encode(MessageSpec::CallReturn, body)?)
            },
            ControllerRequest::Cast { target, request } => (
                Destination::Component(target.clone()),
                self.encode(MessageSpec::Cast, request)?,
            ),
            ControllerRequest::Acquire(body) => {
                (Destination::Peer, self.encode(MessageSpec::Acquire, body)?)
            },
            ControllerRequest::Terminate => (
                Destination::Peer,
                Envelope::new(self.session.as_str(), MessageSpec::Terminate, Vec::new()),
            ),
        };
        let (destination, envelope) = envelope;
        tracing::trace!(session = %self.session, %destination, message = %envelope.message, "sending");
        self.transport.send(&destination, envelope)?;
        Ok(())
    }

    fn encode<T: Serialize>(&self, spec: MessageSpec, body: &T) -> Result<Envelope, ChannelError> {
        encode_envelope(&self.session, spec, body)
    }
}

impl Callbacks<ComponentController> for ChannelController {
    fn invoke(&self, request: ControllerRequest) -> DeferredCompletion<()> {
        let name = request.name();
        match self.send(request) {
            Ok(()) => DeferredCompletion::succeeded(()),
            Err(error) => {
                tracing::warn!(session = %self.session, request = name, %error, "outbound request failed");
                DeferredCompletion::failed(error.failure())
            },
        }
    }
}

impl fmt::Debug for ChannelController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelController")
            .field("session", &self.session)
            .field("closed", &self.transport.is_closed())
            .finish_non_exhaustive()
    }
}
