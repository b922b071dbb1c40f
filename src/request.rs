//! External requests: the suspend/resume mechanism for out-of-band input.
//!
//! An executor that needs input the graph cannot produce (a human decision,
//! an external system callback) issues an [`ExternalRequest`] through its
//! context. The scheduler surfaces it as a `RequestInput` event and, once no
//! deliverable messages remain, the run blocks until a matching
//! [`ExternalResponse`] is supplied.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::executor::ExecutorId;
use crate::message::AnyMessage;

/// Unique identifier for an external request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An outstanding request for out-of-band input.
///
/// The response type is tracked by name so the expectation survives the
/// checkpoint boundary; [`crate::runner::WorkflowRun::supply_response`]
/// validates supplied payloads against it. Forward progress along the
/// issuing path is blocked until a response arrives or the run is abandoned.
#[derive(Debug, Clone)]
pub struct ExternalRequest {
    pub id: RequestId,
    /// Caller-chosen port name identifying what kind of input is wanted.
    pub port: String,
    /// Optional data shown to whoever answers the request.
    pub payload: Option<AnyMessage>,
    /// Type name the response payload must carry.
    pub response_type: String,
    /// Executor that receives the response as its next message.
    pub sink: ExecutorId,
}

impl ExternalRequest {
    /// Create a request expecting a response of type `R`, delivered to `sink`.
    pub fn expecting<R: Any + Send + Sync>(
        port: impl Into<String>,
        payload: Option<AnyMessage>,
        sink: ExecutorId,
    ) -> Self {
        Self {
            id: RequestId::new(),
            port: port.into(),
            payload,
            response_type: std::any::type_name::<R>().to_string(),
            sink,
        }
    }

    /// Whether `message` satisfies the declared response type.
    pub fn accepts(&self, message: &AnyMessage) -> bool {
        self.response_type == message.type_name()
    }
}

/// The answer to an [`ExternalRequest`].
#[derive(Debug, Clone)]
pub struct ExternalResponse {
    pub request_id: RequestId,
    pub payload: AnyMessage,
}

impl ExternalResponse {
    pub fn new<T: Any + Send + Sync>(request_id: RequestId, value: T) -> Self {
        Self {
            request_id,
            payload: AnyMessage::new(value),
        }
    }
}
