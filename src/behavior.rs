//! Cross-cutting behaviors wrapping executor and workflow execution.
//!
//! Behaviors form an ordered chain of continuations: behavior one wraps
//! behavior two wraps the final handler. A behavior may call its
//! continuation zero times (short-circuit), once (pass-through), or many
//! times (retry). With no behaviors registered the pipeline skips chain
//! construction entirely and invokes the final handler directly; the
//! default configuration pays nothing.
//!
//! Errors escaping a behavior are wrapped exactly once into
//! [`BehaviorError`], carrying the behavior's name and the execution stage;
//! already-wrapped errors pass through nested pipelines untouched.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::error::WorkflowError;
use crate::executor::ExecutorId;
use crate::router::CallResult;

/// Stage of an executor-level behavior invocation.
///
/// There is deliberately no `PostExecution` value: "post" behavior is
/// whatever code a behavior runs after its continuation call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorStage {
    PreExecution,
}

impl fmt::Display for ExecutorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorStage::PreExecution => write!(f, "PreExecution"),
        }
    }
}

/// Stage of a workflow-level behavior invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStage {
    Starting,
    Ending,
}

impl fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStage::Starting => write!(f, "Starting"),
            WorkflowStage::Ending => write!(f, "Ending"),
        }
    }
}

/// Stage recorded on a wrapped behavior failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Executor(ExecutorStage),
    Workflow(WorkflowStage),
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::Executor(stage) => write!(f, "{}", stage),
            PipelineStage::Workflow(stage) => write!(f, "{}", stage),
        }
    }
}

/// A behavior failure, wrapped with the failing behavior's name and stage.
#[derive(Debug, Error)]
#[error("behavior {behavior} failed during {stage}: {source}")]
pub struct BehaviorError {
    pub behavior: String,
    pub stage: PipelineStage,
    #[source]
    pub source: Box<WorkflowError>,
}

/// Wrap `error` unless it already carries behavior metadata.
fn wrap_once(behavior: &str, stage: PipelineStage, error: WorkflowError) -> WorkflowError {
    if matches!(error, WorkflowError::Behavior(_)) {
        return error;
    }
    WorkflowError::Behavior(BehaviorError {
        behavior: behavior.to_string(),
        stage,
        source: Box::new(error),
    })
}

/// Context for one executor-level pipeline invocation.
#[derive(Debug, Clone)]
pub struct ExecutorInvocation {
    pub executor: ExecutorId,
    pub message_type: &'static str,
    pub superstep: usize,
}

impl ExecutorInvocation {
    pub fn new(executor: ExecutorId, message_type: &'static str, superstep: usize) -> Self {
        Self {
            executor,
            message_type,
            superstep,
        }
    }

    pub fn stage(&self) -> ExecutorStage {
        ExecutorStage::PreExecution
    }
}

/// Context for one workflow-level pipeline invocation.
///
/// The stage starts at `Starting` and flips to `Ending` once the workflow
/// body completes, so behaviors (and wrapped errors) observe which side of
/// the body they are on.
#[derive(Debug)]
pub struct WorkflowInvocation {
    workflow: String,
    run_id: String,
    stage: Mutex<WorkflowStage>,
}

impl WorkflowInvocation {
    pub fn new(workflow: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            run_id: run_id.into(),
            stage: Mutex::new(WorkflowStage::Starting),
        }
    }

    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn stage(&self) -> WorkflowStage {
        *self.stage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn enter_ending(&self) {
        *self.stage.lock().unwrap_or_else(PoisonError::into_inner) = WorkflowStage::Ending;
    }
}

/// Final handler invoked at the end of an executor pipeline.
pub type ExecutorTerminal<'t> =
    Box<dyn Fn() -> BoxFuture<'t, Result<CallResult, WorkflowError>> + Send + Sync + 't>;

/// Final handler invoked at the end of a workflow pipeline.
pub type WorkflowTerminal<'t> =
    Box<dyn Fn() -> BoxFuture<'t, Result<(), WorkflowError>> + Send + Sync + 't>;

/// A behavior wrapping individual executor invocations.
#[async_trait]
pub trait ExecutorBehavior: Send + Sync {
    /// Name used in wrapped failures and logs.
    fn name(&self) -> &str;

    /// Wrap the invocation. Call `next.run()` to continue down the chain.
    async fn invoke(
        &self,
        ctx: &ExecutorInvocation,
        next: &ExecutorContinuation<'_, '_>,
    ) -> Result<CallResult, WorkflowError>;
}

/// A behavior wrapping a whole workflow run.
#[async_trait]
pub trait WorkflowBehavior: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(
        &self,
        ctx: &WorkflowInvocation,
        next: &WorkflowContinuation<'_, '_>,
    ) -> Result<(), WorkflowError>;
}

/// The remainder of an executor pipeline, callable any number of times.
pub struct ExecutorContinuation<'a, 't> {
    ctx: &'a ExecutorInvocation,
    rest: &'a [Arc<dyn ExecutorBehavior>],
    terminal: &'a ExecutorTerminal<'t>,
}

impl ExecutorContinuation<'_, '_> {
    /// Run the rest of the chain down to the final handler.
    pub fn run(&self) -> BoxFuture<'_, Result<CallResult, WorkflowError>> {
        Box::pin(async move {
            match self.rest.split_first() {
                None => (self.terminal)().await,
                Some((head, tail)) => {
                    let next = ExecutorContinuation {
                        ctx: self.ctx,
                        rest: tail,
                        terminal: self.terminal,
                    };
                    head.invoke(self.ctx, &next).await.map_err(|error| {
                        wrap_once(
                            head.name(),
                            PipelineStage::Executor(self.ctx.stage()),
                            error,
                        )
                    })
                }
            }
        })
    }
}

/// The remainder of a workflow pipeline, callable any number of times.
pub struct WorkflowContinuation<'a, 't> {
    ctx: &'a WorkflowInvocation,
    rest: &'a [Arc<dyn WorkflowBehavior>],
    terminal: &'a WorkflowTerminal<'t>,
}

impl WorkflowContinuation<'_, '_> {
    pub fn run(&self) -> BoxFuture<'_, Result<(), WorkflowError>> {
        Box::pin(async move {
            match self.rest.split_first() {
                None => (self.terminal)().await,
                Some((head, tail)) => {
                    let next = WorkflowContinuation {
                        ctx: self.ctx,
                        rest: tail,
                        terminal: self.terminal,
                    };
                    head.invoke(self.ctx, &next).await.map_err(|error| {
                        wrap_once(
                            head.name(),
                            PipelineStage::Workflow(self.ctx.stage()),
                            error,
                        )
                    })
                }
            }
        })
    }
}

/// The ordered behavior chains for a runner.
///
/// The behavior lists are immutable once built; no synchronization is
/// needed to share the pipeline across deliveries.
#[derive(Default)]
pub struct BehaviorPipeline {
    executor_behaviors: Vec<Arc<dyn ExecutorBehavior>>,
    workflow_behaviors: Vec<Arc<dyn WorkflowBehavior>>,
}

impl BehaviorPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_executor_behavior(mut self, behavior: impl ExecutorBehavior + 'static) -> Self {
        self.executor_behaviors.push(Arc::new(behavior));
        self
    }

    pub fn with_workflow_behavior(mut self, behavior: impl WorkflowBehavior + 'static) -> Self {
        self.workflow_behaviors.push(Arc::new(behavior));
        self
    }

    pub fn executor_behavior_count(&self) -> usize {
        self.executor_behaviors.len()
    }

    pub fn workflow_behavior_count(&self) -> usize {
        self.workflow_behaviors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executor_behaviors.is_empty() && self.workflow_behaviors.is_empty()
    }

    /// Run `terminal` through the executor behavior chain.
    pub async fn execute_executor_pipeline(
        &self,
        ctx: &ExecutorInvocation,
        terminal: ExecutorTerminal<'_>,
    ) -> Result<CallResult, WorkflowError> {
        // Fast path: no behaviors, no chain.
        if self.executor_behaviors.is_empty() {
            return terminal().await;
        }
        let continuation = ExecutorContinuation {
            ctx,
            rest: &self.executor_behaviors,
            terminal: &terminal,
        };
        continuation.run().await
    }

    /// Run `terminal` (the workflow body) through the workflow behavior
    /// chain. The invocation's stage flips to `Ending` when the body
    /// completes successfully.
    pub async fn execute_workflow_pipeline(
        &self,
        ctx: &WorkflowInvocation,
        terminal: WorkflowTerminal<'_>,
    ) -> Result<(), WorkflowError> {
        if self.workflow_behaviors.is_empty() {
            return terminal().await;
        }
        // The stage flip happens inside the chain so behaviors on the unwind
        // side observe Ending.
        let body: WorkflowTerminal<'_> = Box::new(move || {
            let fut = terminal();
            Box::pin(async move {
                let result = fut.await;
                if result.is_ok() {
                    ctx.enter_ending();
                }
                result
            })
        });
        let continuation = WorkflowContinuation {
            ctx,
            rest: &self.workflow_behaviors,
            terminal: &body,
        };
        continuation.run().await
    }
}

impl fmt::Debug for BehaviorPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviorPipeline")
            .field("executor_behaviors", &self.executor_behaviors.len())
            .field("workflow_behaviors", &self.workflow_behaviors.len())
            .finish()
    }
}
