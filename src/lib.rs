//! flowstep: a superstep-based workflow execution engine.
//!
//! A workflow is a graph of independently addressable **executors**
//! exchanging type-erased messages over declared **edges** (direct,
//! fan-out, fan-in, switch). A **runner** drives the graph in synchronized
//! rounds:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkflowRun                          │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐                      │
//! │  │Superstep│→ │Superstep│→ │Superstep│→ ...                 │
//! │  │    0    │  │    1    │  │    2    │                      │
//! │  └─────────┘  └─────────┘  └─────────┘                      │
//! │       │            │            │                           │
//! │       ▼            ▼            ▼                           │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │ Per-superstep: Deliver → Compute → Collect → Route  │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Messages find handlers by runtime type through each executor's lazily
//! built [`router::MessageRouter`]; cross-cutting [`behavior`]s wrap both
//! individual invocations and whole runs; a run that needs out-of-band
//! input suspends on an [`request::ExternalRequest`] and can be
//! checkpointed and resumed via [`checkpoint`].

pub mod behavior;
pub mod checkpoint;
pub mod config;
pub mod edge;
pub mod error;
pub mod event;
pub mod executor;
pub mod message;
pub mod request;
pub mod router;
pub mod runner;
pub mod workflow;

// Re-exports for convenience
pub use behavior::{
    BehaviorError, BehaviorPipeline, ExecutorBehavior, ExecutorContinuation, ExecutorInvocation,
    ExecutorStage, PipelineStage, WorkflowBehavior, WorkflowContinuation, WorkflowInvocation,
    WorkflowStage,
};
pub use checkpoint::{
    Checkpointer, FileCheckpointer, MemoryCheckpointer, PortableRequest, RunCheckpoint,
};
pub use config::RunnerConfig;
pub use edge::{Edge, FanInBundle, FanInTrigger, SwitchBuilder, SwitchCase};
pub use error::WorkflowError;
pub use event::WorkflowEvent;
pub use executor::{BoxedExecutor, Executor, ExecutorContext, ExecutorId, ExecutorNode};
pub use message::{AnyMessage, MessageCodecs, PortableMessage};
pub use request::{ExternalRequest, ExternalResponse, RequestId};
pub use router::{CallResult, MessageRouter, RouterBuilder, TypeKey};
pub use runner::{ResponseInbox, RunStatus, Runner, WorkflowRun};
pub use workflow::{BuildError, Workflow, WorkflowBuilder};
