//! In-memory transport for endpoint tests
//!
//! [`RecordingTransport`] keeps every envelope an endpoint sends so tests can decode and answer
//! them, and can be closed or made to refuse sends to exercise failure paths.

#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use switchyard_core::message::MessageSpec;
use switchyard_core::transport::{Destination, Envelope, Transport, TransportError};
use switchyard_runtime::channel::decode_body;

#[derive(Debug, Default)]
struct Recorded {
    sent: Vec<(Destination, Envelope)>,
    closed: bool,
    refuse_sends: bool,
}

/// Transport that records outbound envelopes instead of delivering them.
///
/// Clones share the same recording.
///
/// # Example
///
/// ```
/// use switchyard_core::message::MessageSpec;
/// use switchyard_core::transport::{Destination, Envelope, Transport};
/// use switchyard_testing::RecordingTransport;
///
/// let transport = RecordingTransport::new();
/// transport
///     .send(&Destination::Peer, Envelope::new("s1", MessageSpec::Terminate, Vec::new()))
///     .unwrap();
///
/// assert_eq!(transport.sent_count(), 1);
/// assert_eq!(transport.envelopes(MessageSpec::Terminate).len(), 1);
///
/// transport.close();
/// assert!(transport.send(&Destination::Peer, Envelope::new("s1", MessageSpec::Terminate, Vec::new())).is_err());
/// ```
#[derive(Clone, Debug, Default)]
pub struct RecordingTransport {
    recorded: Arc<Mutex<Recorded>>,
}

impl RecordingTransport {
    /// Create an open transport with nothing recorded
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Everything sent so far, in send order
    #[must_use]
    pub fn sent(&self) -> Vec<(Destination, Envelope)> {
        self.lock().sent.clone()
    }

    /// Take everything sent so far, leaving the recording empty
    #[must_use]
    pub fn take_sent(&self) -> Vec<(Destination, Envelope)> {
        std::mem::take(&mut self.lock().sent)
    }

    /// Number of envelopes sent so far
    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.lock().sent.len()
    }

    /// Envelopes carrying `spec`, with their destinations
    #[must_use]
    pub fn envelopes(&self, spec: MessageSpec) -> Vec<(Destination, Envelope)> {
        self.lock()
            .sent
            .iter()
            .filter(|(_, envelope)| envelope.message == spec.wire_name())
            .cloned()
            .collect()
    }

    /// Decode the bodies of every envelope carrying `spec`
    ///
    /// # Panics
    ///
    /// Panics if a body does not decode as `T`.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn bodies<T: DeserializeOwned>(&self, spec: MessageSpec) -> Vec<T> {
        self.envelopes(spec)
            .iter()
            .map(|(_, envelope)| {
                decode_body(spec, &envelope.payload).expect("recorded envelope should decode")
            })
            .collect()
    }

    /// Make every later send fail with [`TransportError::SendFailed`], or stop doing so
    pub fn refuse_sends(&self, refuse: bool) {
        self.lock().refuse_sends = refuse;
    }

    /// Forget everything recorded
    pub fn clear(&self) {
        self.lock().sent.clear();
    }
}

impl Transport for RecordingTransport {
    fn send(&self, destination: &Destination, envelope: Envelope) -> Result<(), TransportError> {
        let mut recorded = self.lock();
        if recorded.closed {
            return Err(TransportError::Closed);
        }
        if recorded.refuse_sends {
            return Err(TransportError::SendFailed {
                destination: destination.to_string(),
                reason: "sends refused by test".to_string(),
            });
        }
        recorded.sent.push((destination.clone(), envelope));
        Ok(())
    }

    fn close(&self) {
        self.lock().closed = true;
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
