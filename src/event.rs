//! Workflow events.
//!
//! A run's observable history is an append-only, ordered sequence of events.
//! Callers see every failure here without the run silently stopping; the
//! same values are optionally streamed live over an mpsc channel attached to
//! the runner.

use std::sync::Arc;

use crate::error::WorkflowError;
use crate::executor::ExecutorId;
use crate::message::AnyMessage;
use crate::request::ExternalRequest;

/// One entry in a run's event log.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// The run started.
    Started,
    /// An executor explicitly yielded the workflow's result.
    Completed { result: Option<AnyMessage> },
    /// A workflow-fatal condition; the run transitions to `Failed`.
    Error { cause: Arc<WorkflowError> },
    /// A non-fatal anomaly (dropped message, fan-in mismatch).
    Warning { message: String },
    /// A message was delivered to an executor.
    ExecutorInvoked { id: ExecutorId },
    /// An executor handled a delivery successfully.
    ExecutorCompleted {
        id: ExecutorId,
        result: Option<AnyMessage>,
    },
    /// A delivery failed; the superstep continues.
    ExecutorFailed {
        id: ExecutorId,
        cause: Arc<WorkflowError>,
    },
    /// An executor asked for out-of-band input.
    RequestInput { request: ExternalRequest },
}

impl WorkflowEvent {
    pub fn warning(message: impl Into<String>) -> Self {
        Self::Warning {
            message: message.into(),
        }
    }

    pub fn error(cause: WorkflowError) -> Self {
        Self::Error {
            cause: Arc::new(cause),
        }
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, WorkflowEvent::Warning { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::Error { .. } | WorkflowEvent::ExecutorFailed { .. }
        )
    }

    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowEvent::Started => "started",
            WorkflowEvent::Completed { .. } => "completed",
            WorkflowEvent::Error { .. } => "error",
            WorkflowEvent::Warning { .. } => "warning",
            WorkflowEvent::ExecutorInvoked { .. } => "executor_invoked",
            WorkflowEvent::ExecutorCompleted { .. } => "executor_completed",
            WorkflowEvent::ExecutorFailed { .. } => "executor_failed",
            WorkflowEvent::RequestInput { .. } => "request_input",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kinds() {
        assert_eq!(WorkflowEvent::Started.kind(), "started");
        assert_eq!(WorkflowEvent::warning("dropped").kind(), "warning");
        assert_eq!(
            WorkflowEvent::error(WorkflowError::Cancelled).kind(),
            "error"
        );
    }

    #[test]
    fn test_failure_classification() {
        assert!(WorkflowEvent::error(WorkflowError::Cancelled).is_failure());
        assert!(WorkflowEvent::ExecutorFailed {
            id: ExecutorId::new("x"),
            cause: Arc::new(WorkflowError::handler_failed("x", "boom")),
        }
        .is_failure());
        assert!(!WorkflowEvent::Started.is_failure());
        assert!(WorkflowEvent::warning("w").is_warning());
    }
}
