//! Error types for the workflow engine.

use std::time::Duration;

use thiserror::Error;

use crate::behavior::BehaviorError;
use crate::executor::ExecutorId;
use crate::request::RequestId;

/// Errors that can occur while routing messages or driving a run.
///
/// Topology errors raised by `WorkflowBuilder::build()` live in
/// [`crate::workflow::BuildError`]; everything at run time funnels through
/// this enum.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A delivered message matched no handler and no catch-all was registered
    #[error("no handler for message type {message_type} on executor {executor}")]
    NoHandlerFound {
        executor: ExecutorId,
        message_type: String,
    },

    /// A handler returned an error
    #[error("handler failed on executor {executor}: {message}")]
    HandlerFailed {
        executor: ExecutorId,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An explicit downcast failed
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    /// A runtime reference to an executor id not present in the workflow
    #[error("unknown executor: {0}")]
    UnknownExecutor(ExecutorId),

    /// The run exceeded the configured superstep limit
    #[error("max supersteps exceeded: {0}")]
    MaxSuperstepsExceeded(usize),

    /// A single superstep exceeded the configured timeout
    #[error("superstep timed out after {0:?}")]
    SuperstepTimeout(Duration),

    /// A response was supplied for a request that is not outstanding
    #[error("unknown external request: {0}")]
    UnknownRequest(RequestId),

    /// A supplied response payload does not match the expected type
    #[error("response type mismatch for request {request}: expected {expected}, found {found}")]
    ResponseTypeMismatch {
        request: RequestId,
        expected: String,
        found: String,
    },

    /// Error while saving, loading, or encoding a checkpoint
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// A message type crossed the checkpoint boundary without a codec
    #[error("message type {0} is not registered for serialization")]
    UnregisteredMessageType(String),

    /// The run was cancelled
    #[error("run cancelled")]
    Cancelled,

    /// A behavior in the pipeline failed (already wrapped with its stage)
    #[error(transparent)]
    Behavior(#[from] BehaviorError),
}

impl WorkflowError {
    pub fn no_handler(executor: impl Into<ExecutorId>, message_type: impl Into<String>) -> Self {
        Self::NoHandlerFound {
            executor: executor.into(),
            message_type: message_type.into(),
        }
    }

    pub fn handler_failed(executor: impl Into<ExecutorId>, message: impl Into<String>) -> Self {
        Self::HandlerFailed {
            executor: executor.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn handler_failed_with_source(
        executor: impl Into<ExecutorId>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::HandlerFailed {
            executor: executor.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }

    /// True for per-delivery failures that are contained at the executor
    /// boundary and reported as events without ending the run.
    pub fn is_delivery_failure(&self) -> bool {
        matches!(
            self,
            WorkflowError::NoHandlerFound { .. }
                | WorkflowError::HandlerFailed { .. }
                | WorkflowError::TypeMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    // Ensure errors are Send + Sync (compile-time check)
    static_assertions::assert_impl_all!(super::WorkflowError: Send, Sync);
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WorkflowError::MaxSuperstepsExceeded(100);
        assert_eq!(format!("{}", err), "max supersteps exceeded: 100");
    }

    #[test]
    fn test_no_handler() {
        let err = WorkflowError::no_handler("upper", "alloc::string::String");
        match err {
            WorkflowError::NoHandlerFound {
                executor,
                message_type,
            } => {
                assert_eq!(executor.as_str(), "upper");
                assert_eq!(message_type, "alloc::string::String");
            }
            _ => panic!("Wrong error type"),
        }
    }

    #[test]
    fn test_handler_failed_with_source() {
        let io = std::io::Error::other("disk gone");
        let err = WorkflowError::handler_failed_with_source("writer", "write failed", io);
        assert!(format!("{}", err).contains("writer"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_is_delivery_failure() {
        assert!(WorkflowError::no_handler("a", "T").is_delivery_failure());
        assert!(WorkflowError::handler_failed("a", "boom").is_delivery_failure());
        assert!(WorkflowError::type_mismatch("A", "B").is_delivery_failure());

        assert!(!WorkflowError::MaxSuperstepsExceeded(10).is_delivery_failure());
        assert!(!WorkflowError::Cancelled.is_delivery_failure());
    }
}
