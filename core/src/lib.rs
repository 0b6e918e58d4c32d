//! # Switchyard Core
//!
//! Core types for the Switchyard component runtime.
//!
//! Switchyard connects independently deployed components (resource drivers, connectors and
//! application containers) through asynchronous request/reply messaging. This crate holds the
//! data model and the primitives every endpoint shares. Execution (reactor, lifecycle
//! transactions, endpoints, drivers) lives in `switchyard-runtime`.
//!
//! ## Core Concepts
//!
//! - **Deferred Completion**: single-resolution asynchronous outcome, resolved through its
//!   [`Trigger`](completion::Trigger)
//! - **Correlation Table**: outstanding requests keyed by reference, resolved by their replies
//! - **Callback Kinds**: explicit callback interfaces described by invocation record enums
//! - **Lifecycle Graph**: declared states and transitions of a component endpoint
//! - **Transport**: the outbound channel, consumed as a trait
//!
//! ## Architecture Principles
//!
//! - No thread ever blocks on a remote reply
//! - Every request admitted into a correlation table eventually resolves
//! - Collaborators are injected, never global
//!
//! ## Example
//!
//! ```
//! use switchyard_core::completion::DeferredCompletion;
//! use switchyard_core::correlation::CorrelationTable;
//! use switchyard_core::identity::CallReference;
//!
//! let table = CorrelationTable::new();
//! let (completion, trigger) = DeferredCompletion::<String>::pending();
//! let reference = CallReference::mint();
//!
//! table.put(reference, trigger).unwrap();
//! table.complete(&reference, Ok("pong".to_string())).unwrap();
//!
//! assert_eq!(completion.value().unwrap(), "pong");
//! ```

pub use serde::{Deserialize, Serialize};

/// Callback kinds, invocation records and handler contracts
pub mod callbacks;

/// Single-resolution asynchronous results
pub mod completion;

/// Correlation of outbound requests with their replies
pub mod correlation;

/// Driver request/reply protocol and backend contract
pub mod driver;

/// Component and call identifiers
pub mod identity;

/// Declared lifecycle graphs
pub mod lifecycle;

/// Messages exchanged between endpoints
pub mod message;

/// Transport channel abstraction
pub mod transport;

pub use callbacks::{CallbackHandler, CallbackKind, Callbacks, HandlerError, Reply};
pub use completion::{CompletionError, DeferredCompletion, Failure, FailureKind, Outcome, Trigger};
pub use correlation::{CorrelationError, CorrelationTable, PendingCallTable};
pub use identity::{CallReference, ComponentIdentifier, IsolateId, ProxyId};
pub use lifecycle::{ComponentLifecycle, FsmState, FsmTransition, StateAndOutput, StateGraph};
pub use message::Payload;
pub use transport::{Destination, Envelope, Transport, TransportError};
