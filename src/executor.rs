//! Executors: the addressable units of computation.
//!
//! An [`Executor`] registers handlers for the message types it accepts; the
//! runtime wraps each one in an [`ExecutorNode`] that owns the lazily built
//! router and emits the invocation lifecycle events. Handlers receive an
//! [`ExecutorContext`], the explicit, cloneable channel back to the
//! scheduler for emitting messages, events, and external requests. Executor
//! state is the executor's own business; the runtime never inspects it.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::event::WorkflowEvent;
use crate::message::AnyMessage;
use crate::request::{ExternalRequest, RequestId};
use crate::router::{CallResult, MessageRouter, RouterBuilder};

/// Unique identifier for an executor within a workflow.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExecutorId(pub String);

impl ExecutorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ExecutorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ExecutorId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An addressable unit of computation in the workflow graph.
///
/// Implementors register their handlers explicitly; handlers that need the
/// executor's state clone the `Arc` they are given. Internal mutable state
/// (counters accumulated across fan-in, loop bounds) belongs to the
/// executor alone, behind its own synchronization.
pub trait Executor: Send + Sync + 'static {
    /// Stable identifier, unique within the owning workflow.
    fn id(&self) -> &ExecutorId;

    /// Register this executor's handlers. Called once, lazily, on first
    /// delivery (or again after [`ExecutorNode::reset`]).
    fn register_handlers(self: Arc<Self>, routes: &mut RouterBuilder);

    /// Message types this executor accepts. `None` derives the set from the
    /// registered handlers.
    fn input_types(&self) -> Option<Vec<&'static str>> {
        None
    }

    /// Message types this executor may emit. `None` means anything.
    fn output_types(&self) -> Option<Vec<&'static str>> {
        None
    }
}

/// Boxed executor for dynamic dispatch.
pub type BoxedExecutor = Arc<dyn Executor>;

/// Per-invocation channel from a handler back to the scheduler.
///
/// Appends land in buffers the scheduler drains after the delivery; there is
/// no ambient state. Cloning shares the same buffers.
#[derive(Clone)]
pub struct ExecutorContext {
    executor: ExecutorId,
    superstep: usize,
    cancellation: CancellationToken,
    inner: Arc<ContextInner>,
}

#[derive(Default)]
struct ContextInner {
    sent: Mutex<Vec<AnyMessage>>,
    events: Mutex<Vec<WorkflowEvent>>,
    requests: Mutex<Vec<ExternalRequest>>,
    output: Mutex<Option<AnyMessage>>,
}

impl ExecutorContext {
    pub(crate) fn new(
        executor: ExecutorId,
        superstep: usize,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            executor,
            superstep,
            cancellation,
            inner: Arc::new(ContextInner::default()),
        }
    }

    /// The executor this context belongs to.
    pub fn executor_id(&self) -> &ExecutorId {
        &self.executor
    }

    /// Current superstep number (0-indexed).
    pub fn superstep(&self) -> usize {
        self.superstep
    }

    pub fn is_first_superstep(&self) -> bool {
        self.superstep == 0
    }

    /// Emit a message into the graph; edge resolution happens after the
    /// current superstep's deliveries complete.
    pub fn send<T: Any + Send + Sync>(&self, message: T) {
        self.send_message(AnyMessage::new(message));
    }

    /// Emit an already-wrapped message.
    pub fn send_message(&self, message: AnyMessage) {
        self.inner
            .sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }

    /// Append an event to the run's log.
    pub fn add_event(&self, event: WorkflowEvent) {
        self.inner
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    /// Yield the workflow's result. Raises a `Completed` event; the run's
    /// terminal status becomes `Completed` once it reaches quiescence.
    pub fn yield_output<T: Any + Send + Sync>(&self, value: T) {
        let message = AnyMessage::new(value);
        self.add_event(WorkflowEvent::Completed {
            result: Some(message.clone()),
        });
        *self
            .inner
            .output
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(message);
    }

    /// Ask for out-of-band input of type `R` on the named port. The response
    /// is delivered back to this executor as its next message.
    pub fn request_input<R: Any + Send + Sync>(
        &self,
        port: impl Into<String>,
        payload: Option<AnyMessage>,
    ) -> RequestId {
        let request = ExternalRequest::expecting::<R>(port, payload, self.executor.clone());
        let id = request.id;
        self.inner
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        id
    }

    /// Cancellation signal for the owning run.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub(crate) fn take_sent(&self) -> Vec<AnyMessage> {
        std::mem::take(
            &mut self
                .inner
                .sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub(crate) fn take_events(&self) -> Vec<WorkflowEvent> {
        std::mem::take(
            &mut self
                .inner
                .events
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub(crate) fn take_requests(&self) -> Vec<ExternalRequest> {
        std::mem::take(
            &mut self
                .inner
                .requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub(crate) fn take_output(&self) -> Option<AnyMessage> {
        self.inner
            .output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl fmt::Debug for ExecutorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorContext")
            .field("executor", &self.executor)
            .field("superstep", &self.superstep)
            .finish()
    }
}

/// Runtime wrapper pairing an executor with its lazily built router.
///
/// The router is built exactly once per node (double-checked under the
/// lock); `reset` is idempotent and clears the built state so a reused
/// executor rebuilds on next delivery.
pub struct ExecutorNode {
    executor: BoxedExecutor,
    router: RwLock<Option<Arc<MessageRouter>>>,
}

impl ExecutorNode {
    pub fn new(executor: BoxedExecutor) -> Self {
        Self {
            executor,
            router: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &ExecutorId {
        self.executor.id()
    }

    /// The built router, building it on first use.
    pub fn router(&self) -> Arc<MessageRouter> {
        if let Some(router) = self
            .router
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return Arc::clone(router);
        }

        let mut slot = self.router.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(router) = slot.as_ref() {
            // Another delivery built it while we waited for the write lock.
            return Arc::clone(router);
        }
        let mut builder = RouterBuilder::new();
        Arc::clone(&self.executor).register_handlers(&mut builder);
        let router = Arc::new(builder.build(self.executor.id().clone()));
        *slot = Some(Arc::clone(&router));
        router
    }

    /// Drop the built router so the next delivery rebuilds it.
    pub fn reset(&self) {
        *self.router.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn can_handle(&self, type_id: TypeId) -> bool {
        self.router().can_handle(type_id)
    }

    /// Declared input types, falling back to the registered handler set.
    pub fn input_types(&self) -> Vec<String> {
        if let Some(declared) = self.executor.input_types() {
            return declared.into_iter().map(str::to_string).collect();
        }
        let mut builder = RouterBuilder::new();
        Arc::clone(&self.executor).register_handlers(&mut builder);
        builder.handled_types().into_iter().map(str::to_string).collect()
    }

    /// Declared output types; `None` means the executor may emit anything.
    pub fn output_types(&self) -> Option<Vec<&'static str>> {
        self.executor.output_types()
    }

    /// Deliver one message: emit `ExecutorInvoked`, route with a required
    /// route, and emit `ExecutorCompleted`/`ExecutorFailed` for the outcome.
    /// An unresolved route is an unsupported-operation failure naming the
    /// message type and executor, reported like any other delivery failure.
    pub async fn execute(&self, message: AnyMessage, ctx: ExecutorContext) -> CallResult {
        let id = self.id().clone();
        ctx.add_event(WorkflowEvent::ExecutorInvoked { id: id.clone() });

        let routed = self.router().route(message, ctx.clone(), true).await;
        let result = match routed {
            Ok(Some(result)) => result,
            Ok(None) => CallResult::failure(crate::error::WorkflowError::no_handler(
                id.clone(),
                "unknown",
            )),
            Err(error) => CallResult::failure(error),
        };

        match &result {
            CallResult::Success(output) => {
                ctx.add_event(WorkflowEvent::ExecutorCompleted {
                    id,
                    result: output.clone(),
                });
            }
            CallResult::Failure(cause) => {
                tracing::debug!(executor = %id, error = %cause, "delivery failed");
                ctx.add_event(WorkflowEvent::ExecutorFailed {
                    id,
                    cause: Arc::clone(cause),
                });
            }
        }
        result
    }
}

impl fmt::Debug for ExecutorNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorNode")
            .field("id", self.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_ctx(id: &str) -> ExecutorContext {
        ExecutorContext::new(ExecutorId::new(id), 0, CancellationToken::new())
    }

    #[derive(Debug)]
    struct Echo(String);

    struct EchoExecutor {
        id: ExecutorId,
        registrations: AtomicUsize,
    }

    impl EchoExecutor {
        fn new() -> Self {
            Self {
                id: ExecutorId::new("echo"),
                registrations: AtomicUsize::new(0),
            }
        }
    }

    impl Executor for EchoExecutor {
        fn id(&self) -> &ExecutorId {
            &self.id
        }

        fn register_handlers(self: Arc<Self>, routes: &mut RouterBuilder) {
            self.registrations.fetch_add(1, Ordering::SeqCst);
            routes.on::<Echo, _, _>(|message, ctx| async move {
                ctx.send(Echo(message.0.clone()));
                Ok(Some(AnyMessage::new(message.0.clone())))
            });
        }
    }

    #[test]
    fn test_executor_id_conversions() {
        let id: ExecutorId = "upper".into();
        assert_eq!(id.as_str(), "upper");
        assert_eq!(format!("{}", id), "upper");
        assert_eq!(ExecutorId::from(String::from("upper")), id);
    }

    #[test]
    fn test_router_built_once_and_reset_rebuilds() {
        let executor = Arc::new(EchoExecutor::new());
        let node = ExecutorNode::new(Arc::clone(&executor) as BoxedExecutor);

        let first = node.router();
        let second = node.router();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(executor.registrations.load(Ordering::SeqCst), 1);

        // Reset is idempotent; the next access rebuilds.
        node.reset();
        node.reset();
        let rebuilt = node.router();
        assert!(!Arc::ptr_eq(&first, &rebuilt));
        assert_eq!(executor.registrations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_execute_emits_lifecycle_events() {
        let node = ExecutorNode::new(Arc::new(EchoExecutor::new()) as BoxedExecutor);
        let ctx = test_ctx("echo");

        let result = node
            .execute(AnyMessage::new(Echo("hi".into())), ctx.clone())
            .await;
        assert!(result.is_success());

        let events = ctx.take_events();
        assert_eq!(events[0].kind(), "executor_invoked");
        assert_eq!(events[1].kind(), "executor_completed");

        let sent = ctx.take_sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is::<Echo>());
    }

    #[tokio::test]
    async fn test_execute_unroutable_message_fails_with_type_names() {
        let node = ExecutorNode::new(Arc::new(EchoExecutor::new()) as BoxedExecutor);
        let ctx = test_ctx("echo");

        let result = node.execute(AnyMessage::new(99u64), ctx.clone()).await;
        assert!(!result.is_success());
        let message = result.error().unwrap().to_string();
        assert!(message.contains("u64"));
        assert!(message.contains("echo"));

        let events = ctx.take_events();
        assert_eq!(events[1].kind(), "executor_failed");
    }

    #[test]
    fn test_input_types_derived_from_handlers() {
        let node = ExecutorNode::new(Arc::new(EchoExecutor::new()) as BoxedExecutor);
        let inputs = node.input_types();
        assert_eq!(inputs.len(), 1);
        assert!(inputs[0].contains("Echo"));
    }

    #[test]
    fn test_context_buffers_drain_once() {
        let ctx = test_ctx("any");
        ctx.send(1u8);
        ctx.send(2u8);
        ctx.add_event(WorkflowEvent::warning("w"));
        ctx.yield_output("done");

        assert_eq!(ctx.take_sent().len(), 2);
        assert!(ctx.take_sent().is_empty());
        // yield_output records both the event and the output value.
        assert_eq!(ctx.take_events().len(), 2);
        assert!(ctx.take_output().is_some());
        assert!(ctx.take_output().is_none());
    }

    #[test]
    fn test_request_input_targets_issuing_executor() {
        let ctx = test_ctx("asker");
        let id = ctx.request_input::<String>("question", None);
        let requests = ctx.take_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].id, id);
        assert_eq!(requests[0].sink.as_str(), "asker");
    }
}
