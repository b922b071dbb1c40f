//! The superstep scheduler.
//!
//! A run advances in synchronized rounds. Each superstep drains the queued
//! deliveries, executes them (distinct executors concurrently, deliveries to
//! the same executor serialized in arrival order), collects everything the
//! handlers emitted through their contexts, and resolves those emissions
//! against the edge set into the next round's queue. The loop ends when no
//! deliverable work remains: `Blocked` if external requests are outstanding,
//! otherwise a terminal state.
//!
//! Per-delivery failures are contained: they become `ExecutorFailed` events
//! and the round continues. Only workflow-fatal conditions (superstep limit,
//! superstep timeout) fail the run, and cancellation is its own terminal
//! state, checked at superstep boundaries.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::behavior::{
    BehaviorPipeline, ExecutorInvocation, ExecutorTerminal, WorkflowInvocation, WorkflowTerminal,
};
use crate::checkpoint::{FanInSnapshot, PortableRequest, RunCheckpoint};
use crate::config::RunnerConfig;
use crate::edge::{Edge, FanInBundle, FanInTrigger};
use crate::error::WorkflowError;
use crate::event::WorkflowEvent;
use crate::executor::{ExecutorContext, ExecutorId};
use crate::message::AnyMessage;
use crate::request::{ExternalRequest, ExternalResponse, RequestId};
use crate::workflow::Workflow;

/// Where a run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Supersteps are being executed.
    Running,
    /// Quiescent, but outstanding external requests block forward progress.
    Blocked,
    /// An executor yielded a result and the run reached quiescence.
    Completed,
    /// Ran to quiescence without an explicit result. Not implicit success.
    Idle,
    /// A workflow-fatal condition ended the run; see the `Error` event.
    Failed,
    /// The run was cancelled at a superstep boundary.
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running | RunStatus::Blocked)
    }
}

/// Single-owner wakeup point between the scheduler and response producers.
///
/// At most one release point is armed at a time: arming while armed returns
/// the existing handle, and each signal releases exactly one armed waiter.
pub(crate) struct ProgressBarrier {
    armed: Mutex<Option<Arc<Notify>>>,
}

impl ProgressBarrier {
    pub(crate) fn new() -> Self {
        Self {
            armed: Mutex::new(None),
        }
    }

    pub(crate) fn arm(&self) -> Arc<Notify> {
        let mut slot = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(notify) => Arc::clone(notify),
            None => {
                let notify = Arc::new(Notify::new());
                *slot = Some(Arc::clone(&notify));
                notify
            }
        }
    }

    pub(crate) fn signal(&self) {
        let taken = self
            .armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(notify) = taken {
            notify.notify_one();
        }
    }

    #[cfg(test)]
    fn is_armed(&self) -> bool {
        self.armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Handle other tasks use to answer a blocked run's external requests.
///
/// Pushing a response wakes a waiter parked in
/// [`WorkflowRun::run_to_completion`].
pub struct ResponseInbox {
    responses: Mutex<Vec<ExternalResponse>>,
    barrier: ProgressBarrier,
}

impl ResponseInbox {
    fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            barrier: ProgressBarrier::new(),
        }
    }

    pub fn push(&self, response: ExternalResponse) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(response);
        self.barrier.signal();
    }

    fn drain(&self) -> Vec<ExternalResponse> {
        std::mem::take(
            &mut self
                .responses
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

#[derive(Default)]
struct FanInState {
    /// Per-source buffers for `All` triggers, accumulated across supersteps.
    pending: BTreeMap<ExecutorId, VecDeque<AnyMessage>>,
    /// Sources that have arrived in the current `Any` generation.
    seen: BTreeSet<ExecutorId>,
}

/// Drives workflow runs.
pub struct Runner {
    workflow: Arc<Workflow>,
    pipeline: Arc<BehaviorPipeline>,
    config: RunnerConfig,
    cancellation: CancellationToken,
    event_tx: Option<mpsc::UnboundedSender<WorkflowEvent>>,
}

impl Runner {
    pub fn new(workflow: Workflow) -> Self {
        Self {
            workflow: Arc::new(workflow),
            pipeline: Arc::new(BehaviorPipeline::new()),
            config: RunnerConfig::default(),
            cancellation: CancellationToken::new(),
            event_tx: None,
        }
    }

    pub fn with_pipeline(mut self, pipeline: BehaviorPipeline) -> Self {
        self.pipeline = Arc::new(pipeline);
        self
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Attach a live event stream; every recorded event is also sent here.
    pub fn event_stream(&mut self) -> mpsc::UnboundedReceiver<WorkflowEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.event_tx = Some(tx);
        rx
    }

    pub fn workflow(&self) -> &Arc<Workflow> {
        &self.workflow
    }

    fn new_run(&self) -> WorkflowRun {
        WorkflowRun {
            workflow: Arc::clone(&self.workflow),
            pipeline: Arc::clone(&self.pipeline),
            config: self.config.clone(),
            cancellation: self.cancellation.clone(),
            event_tx: self.event_tx.clone(),
            run_id: Uuid::new_v4().to_string(),
            superstep: 0,
            queue: BTreeMap::new(),
            fan_in: BTreeMap::new(),
            fan_out_seq: HashMap::new(),
            outstanding: BTreeMap::new(),
            events: Vec::new(),
            status: RunStatus::Running,
            output: None,
            completed: false,
            started: false,
            inbox: Arc::new(ResponseInbox::new()),
        }
    }

    /// Seed the start executor with `input` and drive until the run blocks
    /// or reaches a terminal state.
    pub async fn run<T: Any + Send + Sync>(&self, input: T) -> Result<WorkflowRun, WorkflowError> {
        self.run_message(AnyMessage::new(input)).await
    }

    pub async fn run_message(&self, input: AnyMessage) -> Result<WorkflowRun, WorkflowError> {
        let mut run = self.new_run();
        run.enqueue(self.workflow.start().clone(), input);
        run.resume().await?;
        Ok(run)
    }

    /// Rebuild a run from a checkpoint. The restored run holds exactly the
    /// checkpoint's next-superstep queue and outstanding requests; call
    /// [`WorkflowRun::resume`] to continue it.
    pub fn restore(&self, checkpoint: RunCheckpoint) -> Result<WorkflowRun, WorkflowError> {
        let codecs = self.workflow.codecs();
        let mut run = self.new_run();
        run.run_id = checkpoint.run_id;
        run.superstep = checkpoint.superstep;
        run.started = true;

        for (id, messages) in checkpoint.pending {
            let decoded = messages
                .iter()
                .map(|portable| codecs.decode(portable))
                .collect::<Result<Vec<_>, _>>()?;
            run.queue.insert(ExecutorId::new(id), decoded);
        }

        let edge_count = self.workflow.edges().len();
        for snapshot in checkpoint.fan_in {
            if snapshot.edge_index >= edge_count {
                return Err(WorkflowError::checkpoint(format!(
                    "fan-in snapshot references edge {} but workflow has {} edges",
                    snapshot.edge_index, edge_count
                )));
            }
            let mut state = FanInState::default();
            for (source, messages) in snapshot.pending {
                let decoded = messages
                    .iter()
                    .map(|portable| codecs.decode(portable))
                    .collect::<Result<VecDeque<_>, _>>()?;
                state.pending.insert(ExecutorId::new(source), decoded);
            }
            state.seen = snapshot.seen.into_iter().map(ExecutorId::new).collect();
            run.fan_in.insert(snapshot.edge_index, state);
        }

        for request in checkpoint.outstanding {
            let payload = request
                .payload
                .as_ref()
                .map(|portable| codecs.decode(portable))
                .transpose()?;
            let restored = ExternalRequest {
                id: request.id,
                port: request.port,
                payload,
                response_type: request.response_type,
                sink: ExecutorId::new(request.sink),
            };
            run.outstanding.insert(restored.id, restored);
        }

        run.status = if run.queue.is_empty() && !run.outstanding.is_empty() {
            RunStatus::Blocked
        } else {
            RunStatus::Running
        };
        tracing::info!(
            run_id = %run.run_id,
            superstep = run.superstep,
            "restored run from checkpoint"
        );
        Ok(run)
    }
}

/// One execution of a workflow: the mutable per-run state.
pub struct WorkflowRun {
    workflow: Arc<Workflow>,
    pipeline: Arc<BehaviorPipeline>,
    config: RunnerConfig,
    cancellation: CancellationToken,
    event_tx: Option<mpsc::UnboundedSender<WorkflowEvent>>,
    run_id: String,
    superstep: usize,
    /// Next-superstep deliveries, keyed by target. Ordered so collection and
    /// the event log are deterministic.
    queue: BTreeMap<ExecutorId, Vec<AnyMessage>>,
    fan_in: BTreeMap<usize, FanInState>,
    fan_out_seq: HashMap<usize, usize>,
    outstanding: BTreeMap<RequestId, ExternalRequest>,
    events: Vec<WorkflowEvent>,
    status: RunStatus,
    output: Option<AnyMessage>,
    completed: bool,
    started: bool,
    inbox: Arc<ResponseInbox>,
}

impl WorkflowRun {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn superstep(&self) -> usize {
        self.superstep
    }

    /// The full ordered event log so far.
    pub fn events(&self) -> &[WorkflowEvent] {
        &self.events
    }

    /// The yielded result, if any executor completed the workflow.
    pub fn output(&self) -> Option<&AnyMessage> {
        self.output.as_ref()
    }

    pub fn outstanding_requests(&self) -> Vec<&ExternalRequest> {
        self.outstanding.values().collect()
    }

    /// Handle for answering requests from other tasks; pairs with
    /// [`run_to_completion`](Self::run_to_completion).
    pub fn response_inbox(&self) -> Arc<ResponseInbox> {
        Arc::clone(&self.inbox)
    }

    pub(crate) fn enqueue(&mut self, target: ExecutorId, message: AnyMessage) {
        self.queue.entry(target).or_default().push(message);
    }

    /// Answer an outstanding request: validates the payload type, then
    /// queues it to the request's sink for the next superstep.
    pub fn supply_response(&mut self, response: ExternalResponse) -> Result<(), WorkflowError> {
        let request = self
            .outstanding
            .get(&response.request_id)
            .ok_or(WorkflowError::UnknownRequest(response.request_id))?;
        if !request.accepts(&response.payload) {
            return Err(WorkflowError::ResponseTypeMismatch {
                request: response.request_id,
                expected: request.response_type.clone(),
                found: response.payload.type_name().to_string(),
            });
        }
        let request = self
            .outstanding
            .remove(&response.request_id)
            .ok_or(WorkflowError::UnknownRequest(response.request_id))?;
        tracing::debug!(
            run_id = %self.run_id,
            request = %request.id,
            sink = %request.sink,
            "external response accepted"
        );
        self.enqueue(request.sink, response.payload);
        if self.status == RunStatus::Blocked {
            self.status = RunStatus::Running;
        }
        Ok(())
    }

    /// Drive queued supersteps until the run blocks or terminates, passing
    /// the session through the workflow behavior pipeline.
    pub async fn resume(&mut self) -> Result<RunStatus, WorkflowError> {
        let pipeline = Arc::clone(&self.pipeline);
        let invocation =
            WorkflowInvocation::new(self.workflow.name().to_string(), self.run_id.clone());
        {
            // Workflow behaviors may retry the body, so the run state sits
            // behind a lock the terminal can re-enter.
            let cell = tokio::sync::Mutex::new(&mut *self);
            let cell = &cell;
            let terminal: WorkflowTerminal<'_> =
                Box::new(move || Box::pin(async move { cell.lock().await.drive().await }));
            pipeline
                .execute_workflow_pipeline(&invocation, terminal)
                .await?;
        }
        Ok(self.status)
    }

    /// Drive to a terminal state, parking on the response inbox whenever the
    /// run blocks on external requests.
    pub async fn run_to_completion(&mut self) -> Result<RunStatus, WorkflowError> {
        loop {
            let status = self.resume().await?;
            if status != RunStatus::Blocked {
                return Ok(status);
            }
            loop {
                let notified = self.inbox.barrier.arm();
                let responses = self.inbox.drain();
                if !responses.is_empty() {
                    for response in responses {
                        self.supply_response(response)?;
                    }
                    break;
                }
                notified.notified().await;
            }
        }
    }

    /// Snapshot the run's suspend/resume state in portable form.
    ///
    /// Every queued message (including fan-in buffers and request payloads)
    /// must have a registered codec.
    pub fn checkpoint(&self) -> Result<RunCheckpoint, WorkflowError> {
        let codecs = self.workflow.codecs();

        let mut pending = BTreeMap::new();
        for (id, messages) in &self.queue {
            let portable = messages
                .iter()
                .map(|message| codecs.encode(message))
                .collect::<Result<Vec<_>, _>>()?;
            pending.insert(id.0.clone(), portable);
        }

        let mut fan_in = Vec::new();
        for (index, state) in &self.fan_in {
            let buffered_empty = state.pending.values().all(VecDeque::is_empty);
            if buffered_empty && state.seen.is_empty() {
                continue;
            }
            let mut buffered = BTreeMap::new();
            for (source, queue) in &state.pending {
                if queue.is_empty() {
                    continue;
                }
                let portable = queue
                    .iter()
                    .map(|message| codecs.encode(message))
                    .collect::<Result<Vec<_>, _>>()?;
                buffered.insert(source.0.clone(), portable);
            }
            fan_in.push(FanInSnapshot {
                edge_index: *index,
                pending: buffered,
                seen: state.seen.iter().map(|id| id.0.clone()).collect(),
            });
        }

        let mut outstanding = Vec::new();
        for request in self.outstanding.values() {
            let payload = request
                .payload
                .as_ref()
                .map(|message| codecs.encode(message))
                .transpose()?;
            outstanding.push(PortableRequest {
                id: request.id,
                port: request.port.clone(),
                sink: request.sink.0.clone(),
                response_type: request.response_type.clone(),
                payload,
            });
        }

        Ok(RunCheckpoint {
            run_id: self.run_id.clone(),
            superstep: self.superstep,
            pending,
            fan_in,
            outstanding,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        })
    }

    fn record_event(&mut self, event: WorkflowEvent) {
        tracing::debug!(run_id = %self.run_id, kind = event.kind(), "workflow event");
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event.clone());
        }
        self.events.push(event);
    }

    fn fail(&mut self, error: WorkflowError) {
        tracing::warn!(run_id = %self.run_id, error = %error, "run failed");
        self.record_event(WorkflowEvent::error(error));
        self.status = RunStatus::Failed;
    }

    pub(crate) async fn drive(&mut self) -> Result<(), WorkflowError> {
        if !self.started {
            self.started = true;
            self.record_event(WorkflowEvent::Started);
        }
        self.status = RunStatus::Running;
        loop {
            if self.cancellation.is_cancelled() {
                tracing::info!(run_id = %self.run_id, "run cancelled at superstep boundary");
                self.status = RunStatus::Cancelled;
                return Ok(());
            }
            if self.queue.is_empty() {
                self.status = if !self.outstanding.is_empty() {
                    RunStatus::Blocked
                } else if self.completed {
                    RunStatus::Completed
                } else {
                    RunStatus::Idle
                };
                return Ok(());
            }
            if self.superstep >= self.config.max_supersteps {
                self.fail(WorkflowError::MaxSuperstepsExceeded(self.superstep));
                return Ok(());
            }

            match self.config.superstep_timeout {
                Some(limit) => {
                    if timeout(limit, self.execute_superstep()).await.is_err() {
                        self.fail(WorkflowError::SuperstepTimeout(limit));
                        return Ok(());
                    }
                }
                None => self.execute_superstep().await,
            }
            self.superstep += 1;
        }
    }

    /// One round: deliver, compute, collect, route.
    async fn execute_superstep(&mut self) {
        let deliveries = std::mem::take(&mut self.queue);
        let superstep = self.superstep;
        tracing::debug!(
            run_id = %self.run_id,
            superstep,
            executors = deliveries.len(),
            "superstep begin"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.parallelism));
        let mut tasks = Vec::new();

        for (id, messages) in deliveries {
            let node = match self.workflow.executor(&id) {
                Some(node) => Arc::clone(node),
                None => {
                    self.record_event(WorkflowEvent::warning(format!(
                        "delivery to unknown executor {}; {} message(s) dropped",
                        id,
                        messages.len()
                    )));
                    continue;
                }
            };
            let ctx = ExecutorContext::new(id.clone(), superstep, self.cancellation.clone());
            let pipeline = Arc::clone(&self.pipeline);
            let semaphore = Arc::clone(&semaphore);
            let task_ctx = ctx.clone();

            // Deliveries to distinct executors run concurrently; deliveries
            // to the same executor stay serialized on its task.
            let task = tokio::spawn(async move {
                let _permit = semaphore.acquire().await.unwrap();
                for message in messages {
                    let invocation =
                        ExecutorInvocation::new(id.clone(), message.type_name(), superstep);
                    let node_ref = Arc::clone(&node);
                    let ctx_ref = task_ctx.clone();
                    let terminal: ExecutorTerminal<'static> = Box::new(move || {
                        let node = Arc::clone(&node_ref);
                        let ctx = ctx_ref.clone();
                        let message = message.clone();
                        Box::pin(async move { Ok(node.execute(message, ctx).await) })
                    });
                    if let Err(error) = pipeline
                        .execute_executor_pipeline(&invocation, terminal)
                        .await
                    {
                        // Executor-level behavior failure: contained like any
                        // other delivery failure.
                        task_ctx.add_event(WorkflowEvent::ExecutorFailed {
                            id: id.clone(),
                            cause: Arc::new(error),
                        });
                    }
                }
            });
            tasks.push((ctx, task));
        }

        // Collect in spawn order (sorted by executor id) so the event log
        // and routing are deterministic.
        for (ctx, task) in tasks {
            if let Err(join_error) = task.await {
                let id = ctx.executor_id().clone();
                let cause = WorkflowError::handler_failed_with_source(
                    id.clone(),
                    "executor task join error",
                    join_error,
                );
                self.record_event(WorkflowEvent::ExecutorFailed {
                    id,
                    cause: Arc::new(cause),
                });
            }

            for event in ctx.take_events() {
                if matches!(event, WorkflowEvent::Completed { .. }) {
                    self.completed = true;
                }
                self.record_event(event);
            }
            if let Some(output) = ctx.take_output() {
                self.output = Some(output);
                self.completed = true;
            }
            for request in ctx.take_requests() {
                self.record_event(WorkflowEvent::RequestInput {
                    request: request.clone(),
                });
                self.outstanding.insert(request.id, request);
            }
            let source = ctx.executor_id().clone();
            for message in ctx.take_sent() {
                self.route_emitted(&source, message);
            }
        }
    }

    /// Resolve one emitted message against every edge leaving `source`.
    fn route_emitted(&mut self, source: &ExecutorId, message: AnyMessage) {
        let workflow = Arc::clone(&self.workflow);
        for (index, edge) in workflow.edges().iter().enumerate() {
            if !edge.routes_from(source) {
                continue;
            }
            match edge {
                Edge::Direct {
                    sink, predicate, ..
                } => {
                    if predicate.as_ref().map_or(true, |p| p(&message)) {
                        self.enqueue(sink.clone(), message.clone());
                    }
                }
                Edge::FanOut {
                    sinks, partitioner, ..
                } => {
                    let ordinal = {
                        let counter = self.fan_out_seq.entry(index).or_insert(0);
                        let current = *counter;
                        *counter += 1;
                        current
                    };
                    match partitioner {
                        Some(partition) => {
                            for sink_index in partition(&message, ordinal) {
                                match sinks.get(sink_index) {
                                    Some(sink) => self.enqueue(sink.clone(), message.clone()),
                                    None => self.record_event(WorkflowEvent::warning(format!(
                                        "fan-out partition index {} out of range ({} sinks); message dropped",
                                        sink_index,
                                        sinks.len()
                                    ))),
                                }
                            }
                        }
                        None => {
                            for sink in sinks {
                                self.enqueue(sink.clone(), message.clone());
                            }
                        }
                    }
                }
                Edge::FanIn {
                    sources,
                    sink,
                    trigger,
                } => {
                    self.fan_in_arrival(index, sources, sink, *trigger, source, message.clone());
                }
                Edge::Switch { cases, default, .. } => {
                    match cases.iter().find(|case| (case.predicate)(&message)) {
                        Some(case) => self.enqueue(case.sink.clone(), message.clone()),
                        None => match default {
                            Some(sink) => self.enqueue(sink.clone(), message.clone()),
                            None => self.record_event(WorkflowEvent::warning(format!(
                                "switch from {} matched no case and has no default; {} dropped",
                                source,
                                message.type_name()
                            ))),
                        },
                    }
                }
            }
        }
    }

    fn fan_in_arrival(
        &mut self,
        index: usize,
        sources: &[ExecutorId],
        sink: &ExecutorId,
        trigger: FanInTrigger,
        source: &ExecutorId,
        message: AnyMessage,
    ) {
        match trigger {
            FanInTrigger::All => {
                let mut bundles = Vec::new();
                {
                    let state = self.fan_in.entry(index).or_default();
                    state
                        .pending
                        .entry(source.clone())
                        .or_default()
                        .push_back(message);
                    // A generation completes once every source has a value;
                    // pop one per source, in declared order.
                    while sources
                        .iter()
                        .all(|s| state.pending.get(s).is_some_and(|q| !q.is_empty()))
                    {
                        let mut items = Vec::with_capacity(sources.len());
                        for s in sources {
                            if let Some(item) =
                                state.pending.get_mut(s).and_then(VecDeque::pop_front)
                            {
                                items.push(item);
                            }
                        }
                        bundles.push(FanInBundle { items });
                    }
                }
                for bundle in bundles {
                    self.enqueue(sink.clone(), AnyMessage::new(bundle));
                }
            }
            FanInTrigger::Any => {
                let fire;
                {
                    let state = self.fan_in.entry(index).or_default();
                    fire = state.seen.is_empty();
                    state.seen.insert(source.clone());
                    if sources.iter().all(|s| state.seen.contains(s)) {
                        // Generation complete; the next arrival fires again.
                        state.seen.clear();
                    }
                }
                if fire {
                    self.enqueue(sink.clone(), message);
                } else {
                    self.record_event(WorkflowEvent::warning(format!(
                        "fan-in into {} already fired this generation; {} from {} dropped",
                        sink,
                        message.type_name(),
                        source
                    )));
                }
            }
        }
    }
}

impl std::fmt::Debug for WorkflowRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRun")
            .field("run_id", &self.run_id)
            .field("superstep", &self.superstep)
            .field("status", &self.status)
            .field("pending", &self.queue.len())
            .field("outstanding", &self.outstanding.len())
            .finish()
    }
}
