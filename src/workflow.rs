//! Workflow graphs and their builder.
//!
//! A [`Workflow`] is the immutable graph: executors, edges, the start
//! executor, and the codec registry for messages that cross the checkpoint
//! boundary. Topology mistakes (edges naming unknown executors, a missing
//! start) are caught by [`WorkflowBuilder::build`], never deferred to run
//! time.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::edge::{Edge, FanInTrigger, SwitchBuilder};
use crate::executor::{BoxedExecutor, Executor, ExecutorId, ExecutorNode};
use crate::message::{AnyMessage, MessageCodecs};

/// Errors raised while building a workflow graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("workflow start executor not set")]
    NoStartExecutor,
    #[error("unknown executor id: {0}")]
    UnknownExecutor(String),
    #[error("duplicate executor id: {0}")]
    DuplicateExecutor(String),
    #[error("fan-in edge into {0} declares no sources")]
    EmptyFanIn(String),
    #[error("switch from {0} declares no cases")]
    EmptySwitch(String),
}

/// The immutable workflow graph.
pub struct Workflow {
    name: String,
    executors: HashMap<ExecutorId, Arc<ExecutorNode>>,
    edges: Vec<Edge>,
    start: ExecutorId,
    codecs: MessageCodecs,
}

impl Workflow {
    pub fn builder() -> WorkflowBuilder {
        WorkflowBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> &ExecutorId {
        &self.start
    }

    pub fn executor(&self, id: &ExecutorId) -> Option<&Arc<ExecutorNode>> {
        self.executors.get(id)
    }

    pub fn executor_ids(&self) -> impl Iterator<Item = &ExecutorId> {
        self.executors.keys()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn codecs(&self) -> &MessageCodecs {
        &self.codecs
    }

    /// Declared input types of the workflow: the start executor's inputs.
    pub fn input_types(&self) -> Vec<String> {
        self.executors
            .get(&self.start)
            .map(|node| node.input_types())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("executors", &self.executors.len())
            .field("edges", &self.edges.len())
            .field("start", &self.start)
            .finish()
    }
}

/// Fluent builder for workflow graphs.
#[derive(Default)]
pub struct WorkflowBuilder {
    name: String,
    executors: Vec<BoxedExecutor>,
    edges: Vec<Edge>,
    start: Option<ExecutorId>,
    codecs: MessageCodecs,
}

impl WorkflowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn add_executor(mut self, executor: impl Executor) -> Self {
        self.executors.push(Arc::new(executor));
        self
    }

    pub fn add_boxed_executor(mut self, executor: BoxedExecutor) -> Self {
        self.executors.push(executor);
        self
    }

    /// Designate the executor that receives the run's initial message.
    pub fn start_with(mut self, id: impl Into<ExecutorId>) -> Self {
        self.start = Some(id.into());
        self
    }

    /// Direct 1:1 edge.
    pub fn add_edge(mut self, source: impl Into<ExecutorId>, sink: impl Into<ExecutorId>) -> Self {
        self.edges.push(Edge::direct(source, sink));
        self
    }

    /// Direct edge gated by a predicate on the message.
    pub fn add_edge_when<P>(
        mut self,
        source: impl Into<ExecutorId>,
        sink: impl Into<ExecutorId>,
        predicate: P,
    ) -> Self
    where
        P: Fn(&AnyMessage) -> bool + Send + Sync + 'static,
    {
        self.edges.push(Edge::direct_when(source, sink, predicate));
        self
    }

    /// Broadcast fan-out edge.
    pub fn add_fan_out(
        mut self,
        source: impl Into<ExecutorId>,
        sinks: impl IntoIterator<Item = impl Into<ExecutorId>>,
    ) -> Self {
        self.edges.push(Edge::fan_out(source, sinks));
        self
    }

    /// Fan-out with a partition function selecting sink indices.
    pub fn add_fan_out_partitioned<P>(
        mut self,
        source: impl Into<ExecutorId>,
        sinks: impl IntoIterator<Item = impl Into<ExecutorId>>,
        partitioner: P,
    ) -> Self
    where
        P: Fn(&AnyMessage, usize) -> Vec<usize> + Send + Sync + 'static,
    {
        self.edges
            .push(Edge::fan_out_partitioned(source, sinks, partitioner));
        self
    }

    /// Fan-in edge gathering the named sources into one sink.
    pub fn add_fan_in(
        mut self,
        sources: impl IntoIterator<Item = impl Into<ExecutorId>>,
        sink: impl Into<ExecutorId>,
        trigger: FanInTrigger,
    ) -> Self {
        self.edges.push(Edge::fan_in(sources, sink, trigger));
        self
    }

    /// Switch edge: ordered cases from one source, with an optional default.
    ///
    /// ```ignore
    /// builder.add_switch("router", |s| {
    ///     s.case(|m| m.is::<High>(), "fast")
    ///         .case(|m| m.is::<Low>(), "slow")
    ///         .otherwise("fallback")
    /// })
    /// ```
    pub fn add_switch<F>(mut self, source: impl Into<ExecutorId>, build: F) -> Self
    where
        F: FnOnce(SwitchBuilder) -> SwitchBuilder,
    {
        let switch = build(SwitchBuilder::new());
        self.edges.push(switch.into_edge(source.into()));
        self
    }

    /// Register `T` so it can cross the checkpoint boundary.
    pub fn register_message<T>(mut self) -> Self
    where
        T: Any + Send + Sync + Serialize + DeserializeOwned,
    {
        self.codecs.register::<T>();
        self
    }

    /// Validate and build the workflow.
    pub fn build(self) -> Result<Workflow, BuildError> {
        let start = self.start.ok_or(BuildError::NoStartExecutor)?;

        let mut executors: HashMap<ExecutorId, Arc<ExecutorNode>> = HashMap::new();
        for executor in self.executors {
            let id = executor.id().clone();
            if executors.contains_key(&id) {
                return Err(BuildError::DuplicateExecutor(id.0));
            }
            executors.insert(id, Arc::new(ExecutorNode::new(executor)));
        }

        if !executors.contains_key(&start) {
            return Err(BuildError::UnknownExecutor(start.0));
        }

        for edge in &self.edges {
            for id in edge.referenced_ids() {
                if !executors.contains_key(id) {
                    return Err(BuildError::UnknownExecutor(id.0.clone()));
                }
            }
            match edge {
                Edge::FanIn { sources, sink, .. } if sources.is_empty() => {
                    return Err(BuildError::EmptyFanIn(sink.0.clone()));
                }
                Edge::Switch { source, cases, .. } if cases.is_empty() => {
                    return Err(BuildError::EmptySwitch(source.0.clone()));
                }
                _ => {}
            }
        }

        Ok(Workflow {
            name: self.name,
            executors,
            edges: self.edges,
            start,
            codecs: self.codecs,
        })
    }
}
