//! Driver request/reply protocol and the backend contract.
//!
//! Drivers expose an externally managed resource (a key-value bucket, a queue) to components.
//! Every request carries a [`CompletionToken`]; the driver executes the operation against an
//! [`OperationBackend`] and answers with a [`DriverResponse`] echoing the token. What an
//! operation *means* is entirely up to the backend.

use crate::message::Payload;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Wire-level correlation identifier of a driver request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompletionToken {
    /// Unique per request
    pub message_id: String,
    /// Identifies the requesting client
    pub client_id: String,
}

impl CompletionToken {
    /// Mint a token for `client_id`
    #[must_use]
    pub fn mint(client_id: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            client_id: client_id.into(),
        }
    }
}

impl fmt::Display for CompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client_id, self.message_id)
    }
}

/// A unit of backend work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation name, interpreted by the backend (e.g. `"get"`, `"set"`)
    pub name: String,
    /// Operation arguments
    pub arguments: Payload,
}

impl Operation {
    /// Build an operation
    #[must_use]
    pub fn new(name: impl Into<String>, arguments: Payload) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// A driver request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverRequest {
    /// Echoed by the response
    pub token: CompletionToken,
    /// The work
    pub operation: Operation,
}

/// Outcome reported to the requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriverReply {
    /// The operation succeeded with no value
    Ok,
    /// The operation ran but reported a negative result (e.g. key absent)
    NotOk,
    /// The operation could not run
    Error {
        /// What went wrong
        message: String,
    },
    /// The operation succeeded with a value
    Value(Payload),
}

/// A driver response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverResponse {
    /// Token of the request being answered
    pub token: CompletionToken,
    /// The outcome
    pub reply: DriverReply,
}

/// What a backend produced for one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    /// Done, nothing to return
    Done,
    /// Ran, negative result
    Rejected,
    /// Done, with a value
    Value(Payload),
}

impl From<OperationOutcome> for DriverReply {
    fn from(outcome: OperationOutcome) -> Self {
        match outcome {
            OperationOutcome::Done => Self::Ok,
            OperationOutcome::Rejected => Self::NotOk,
            OperationOutcome::Value(value) => Self::Value(value),
        }
    }
}

/// Backend failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct BackendError(String);

impl BackendError {
    /// Create a backend error
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Executes operations against one bucket of a resource.
///
/// Calls may block; the dispatcher always runs them on the blocking pool.
pub trait OperationBackend: Send + Sync {
    /// Run one operation
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when the operation could not run; the requester receives
    /// [`DriverReply::Error`].
    fn execute(&self, operation: &Operation) -> Result<OperationOutcome, BackendError>;

    /// Release backend resources; called once when the last client leaves
    fn close(&self) {}
}

/// Creates backends per bucket.
pub trait OperationBackendFactory: Send + Sync {
    /// Create the backend serving `bucket`
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the bucket cannot be opened.
    fn create(&self, bucket: &str) -> Result<Arc<dyn OperationBackend>, BackendError>;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn test_backend_outcome_maps_to_driver_reply() {
        assert_eq!(DriverReply::from(OperationOutcome::Done), DriverReply::Ok);
        assert_eq!(DriverReply::from(OperationOutcome::Rejected), DriverReply::NotOk);
        assert_eq!(
            DriverReply::from(OperationOutcome::Value(json!(3))),
            DriverReply::Value(json!(3))
        );
    }

    #[test]
    fn test_response_echoes_token_on_the_wire() {
        let token = CompletionToken::mint("client-a");
        let response = DriverResponse {
            token: token.clone(),
            reply: DriverReply::Error {
                message: "bucket offline".to_string(),
            },
        };
        let decoded: DriverResponse =
            serde_json::from_str(&serde_json::to_string(&response).unwrap()).unwrap();
        assert_eq!(decoded.token, token);
        assert_eq!(decoded, response);
    }
}
