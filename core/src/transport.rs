//! Transport channel abstraction.
//!
//! The runtime never touches sockets or queues. It hands [`Envelope`]s to a [`Transport`] and
//! is handed inbound envelopes in return. Implementations guarantee per-sender FIFO delivery
//! only; nothing is promised across senders.

use crate::identity::ComponentIdentifier;
use crate::message::MessageSpec;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Transport frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Session the frame belongs to
    pub session: String,
    /// Wire name of the body, see [`MessageSpec::wire_name`]
    pub message: String,
    /// JSON-encoded message body
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Build an envelope for a known message spec
    #[must_use]
    pub fn new(session: impl Into<String>, spec: MessageSpec, payload: Vec<u8>) -> Self {
        Self {
            session: session.into(),
            message: spec.wire_name().to_string(),
            payload,
        }
    }
}

/// Where an outbound envelope goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// The peer hosting this endpoint, for replies, registrations, acquires and termination
    Peer,
    /// A named component or group
    Component(ComponentIdentifier),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Peer => f.write_str("peer"),
            Self::Component(identifier) => write!(f, "component `{identifier}`"),
        }
    }
}

/// Transport failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The transport was closed
    #[error("transport is closed")]
    Closed,

    /// The transport refused the envelope
    #[error("failed to send to {destination}: {reason}")]
    SendFailed {
        /// Intended destination
        destination: String,
        /// Why it failed
        reason: String,
    },

    /// Inbound delivery failed
    #[error("failed to receive: {0}")]
    ReceiveFailed(String),
}

/// Outbound side of a transport channel.
pub trait Transport: Send + Sync {
    /// Queue `envelope` for delivery to `destination`
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the transport has been closed, or
    /// [`TransportError::SendFailed`] if the envelope could not be queued.
    fn send(&self, destination: &Destination, envelope: Envelope) -> Result<(), TransportError>;

    /// Close the transport; later sends fail
    fn close(&self);

    /// Whether [`Transport::close`] has been called
    fn is_closed(&self) -> bool;
}
