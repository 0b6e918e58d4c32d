//! Drive a component endpoint from a test
//!
//! [`EndpointHarness`] wires a [`ComponentEndpoint`] to a [`RecordingTransport`] and plays the
//! peer: it initializes the endpoint, decodes what the endpoint sent and feeds replies back
//! through the channel controller.

#![allow(clippy::module_name_repetitions)] // EndpointHarness is the natural name

use crate::transport_mocks::RecordingTransport;
use serde::Serialize;
use std::sync::Arc;
use switchyard_core::completion::{DeferredCompletion, Failure};
use switchyard_core::message::{CallReply, CallRequest, MessageSpec};
use switchyard_runtime::channel::{ChannelError, encode_envelope};
use switchyard_runtime::reactor::{Reactor, ReactorError};
use switchyard_runtime::{CallHandler, ComponentEndpoint, EndpointConfig, EndpointError};
use thiserror::Error;

/// How many isolate round trips [`EndpointHarness::flush`] waits for
const FLUSH_ROUNDS: usize = 4;

/// Errors raised while driving an endpoint
#[derive(Error, Debug)]
pub enum HarnessError {
    /// No reactor could be created
    #[error(transparent)]
    Reactor(#[from] ReactorError),

    /// The endpoint refused to start
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    /// The channel refused an envelope
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The endpoint failed to handle a delivered message
    #[error("delivery failed: {0}")]
    Delivery(Failure),
}

/// A component endpoint with the test playing its peer
///
/// # Example
///
/// ```ignore
/// use switchyard_testing::EndpointHarness;
///
/// let harness = EndpointHarness::active(EndpointConfig::new("s1"), None).await?;
/// let reply = harness.endpoint().call("kv".into(), "get", json!({"key": "a"}));
/// harness.flush().await;
///
/// let request = harness.sent_calls().remove(0);
/// harness.reply(&CallReply::succeeded(request.reference, json!("va")))?;
/// assert_eq!(reply.await?, json!("va"));
/// ```
pub struct EndpointHarness {
    reactor: Reactor,
    transport: RecordingTransport,
    endpoint: ComponentEndpoint,
}

impl EndpointHarness {
    /// Create an endpoint that has not been initialized yet
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError`] outside a tokio runtime or if the endpoint cannot be built.
    pub fn new(
        config: EndpointConfig,
        application: Option<Arc<dyn CallHandler>>,
    ) -> Result<Self, HarnessError> {
        let reactor = Reactor::new()?;
        let transport = RecordingTransport::new();
        let endpoint =
            ComponentEndpoint::create(&reactor, Arc::new(transport.clone()), config, application)?;
        Ok(Self {
            reactor,
            transport,
            endpoint,
        })
    }

    /// Create an endpoint and initialize it
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError`] if the endpoint cannot be built or initialized.
    pub async fn active(
        config: EndpointConfig,
        application: Option<Arc<dyn CallHandler>>,
    ) -> Result<Self, HarnessError> {
        let harness = Self::new(config, application)?;
        harness.activate().await?;
        Ok(harness)
    }

    /// Initialize the endpoint, as the host does once the channel is up
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Delivery`] if initialization was not handled.
    pub async fn activate(&self) -> Result<(), HarnessError> {
        self.endpoint
            .channel()
            .initialize()
            .await
            .map_err(HarnessError::Delivery)
    }

    /// The reactor the endpoint runs on
    #[must_use]
    pub const fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// The transport the endpoint sends through
    #[must_use]
    pub const fn transport(&self) -> &RecordingTransport {
        &self.transport
    }

    /// The endpoint under test
    #[must_use]
    pub const fn endpoint(&self) -> &ComponentEndpoint {
        &self.endpoint
    }

    /// Wait until the endpoint's isolate has run everything queued so far
    ///
    /// Jobs queued by those jobs are covered too, a few rounds deep. Returns immediately once
    /// the isolate is gone.
    pub async fn flush(&self) {
        for _ in 0..FLUSH_ROUNDS {
            let (done, trigger) = DeferredCompletion::pending();
            let queued = self.reactor.spawn_on(self.endpoint.isolate(), move || {
                let _ = trigger.succeed(());
            });
            if queued.is_err() {
                return;
            }
            let _ = done.await;
        }
    }

    /// Calls the endpoint sent so far
    #[must_use]
    pub fn sent_calls(&self) -> Vec<CallRequest> {
        self.transport.bodies(MessageSpec::Call)
    }

    /// Replies the endpoint sent to calls it received
    #[must_use]
    pub fn sent_replies(&self) -> Vec<CallReply> {
        self.transport.bodies(MessageSpec::CallReturn)
    }

    /// Deliver `body` to the endpoint as an inbound `spec` message
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Channel`] if the channel refuses the envelope.
    pub fn deliver<T: Serialize>(
        &self,
        spec: MessageSpec,
        body: &T,
    ) -> Result<DeferredCompletion<()>, HarnessError> {
        let envelope = encode_envelope(self.endpoint.channel().session(), spec, body)?;
        Ok(self.endpoint.channel().receive(&envelope)?)
    }

    /// Deliver a reply to one of the endpoint's calls
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Channel`] if the channel refuses the envelope.
    pub fn reply(&self, reply: &CallReply) -> Result<DeferredCompletion<()>, HarnessError> {
        self.deliver(MessageSpec::CallReturn, reply)
    }

    /// Call the endpoint as a peer would
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Channel`] if the channel refuses the envelope.
    pub fn call(&self, request: &CallRequest) -> Result<DeferredCompletion<()>, HarnessError> {
        self.deliver(MessageSpec::Call, request)
    }

    /// Ask the endpoint to shut down, as the peer does
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Channel`] if the channel refuses the envelope.
    pub fn terminate(&self) -> Result<DeferredCompletion<()>, HarnessError> {
        let envelope = switchyard_core::transport::Envelope::new(
            self.endpoint.channel().session(),
            MessageSpec::Terminate,
            Vec::new(),
        );
        Ok(self.endpoint.channel().receive(&envelope)?)
    }
}

impl std::fmt::Debug for EndpointHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHarness")
            .field("endpoint", &self.endpoint)
            .field("sent", &self.transport.sent_count())
            .finish_non_exhaustive()
    }
}
