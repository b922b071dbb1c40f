//! Per-executor message dispatch.
//!
//! Each executor owns a [`MessageRouter`]: an ordered dispatch table mapping
//! a message's runtime type to a handler. Registration is explicit: typed
//! handlers for exact types, group handlers that declare the set of concrete
//! types they accept (the stand-in for base-type and interface fallback),
//! and at most one catch-all. Resolution is memoized per concrete type, so
//! repeat deliveries of the same type skip the scan.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;

use crate::error::WorkflowError;
use crate::executor::{ExecutorContext, ExecutorId};
use crate::message::AnyMessage;

/// A runtime type key: id plus the name used in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeKey {
    pub id: TypeId,
    pub name: &'static str,
}

impl TypeKey {
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }
}

/// Future returned by a registered handler.
pub type HandlerFuture = BoxFuture<'static, Result<Option<AnyMessage>, WorkflowError>>;

/// Type-erased handler stored in the dispatch table.
pub type HandlerFn = Arc<dyn Fn(AnyMessage, ExecutorContext) -> HandlerFuture + Send + Sync>;

/// Outcome of routing one message into one handler.
///
/// Handler errors are captured here at the routing boundary rather than
/// propagated; the scheduler decides whether a failure is fatal.
#[derive(Debug, Clone)]
pub enum CallResult {
    Success(Option<AnyMessage>),
    Failure(Arc<WorkflowError>),
}

impl CallResult {
    pub fn success(output: Option<AnyMessage>) -> Self {
        Self::Success(output)
    }

    pub fn failure(error: WorkflowError) -> Self {
        Self::Failure(Arc::new(error))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CallResult::Success(_))
    }

    pub fn output(&self) -> Option<&AnyMessage> {
        match self {
            CallResult::Success(output) => output.as_ref(),
            CallResult::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&Arc<WorkflowError>> {
        match self {
            CallResult::Success(_) => None,
            CallResult::Failure(error) => Some(error),
        }
    }
}

struct TypedEntry {
    key: TypeKey,
    handler: HandlerFn,
}

struct GroupEntry {
    accepts: Vec<TypeKey>,
    handler: HandlerFn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Typed(usize),
    Group(usize),
    CatchAll,
}

/// Registration surface for an executor's handlers.
#[derive(Default)]
pub struct RouterBuilder {
    typed: Vec<TypedEntry>,
    groups: Vec<GroupEntry>,
    catch_all: Option<HandlerFn>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler for messages of exactly type `T`.
    ///
    /// The first handler registered for a type wins ties.
    pub fn on<T, F, Fut>(&mut self, handler: F) -> &mut Self
    where
        T: Any + Send + Sync,
        F: Fn(Arc<T>, ExecutorContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<AnyMessage>, WorkflowError>> + Send + 'static,
    {
        let erased: HandlerFn = Arc::new(move |message: AnyMessage, ctx: ExecutorContext| {
            match message.downcast::<T>() {
                Some(typed) => Box::pin(handler(typed, ctx)) as HandlerFuture,
                None => {
                    let found = message.type_name();
                    Box::pin(async move {
                        Err(WorkflowError::type_mismatch(
                            std::any::type_name::<T>(),
                            found,
                        ))
                    })
                }
            }
        });
        self.typed.push(TypedEntry {
            key: TypeKey::of::<T>(),
            handler: erased,
        });
        self
    }

    /// Register a group handler accepting every concrete type in `accepts`.
    ///
    /// This is the explicit form of interface dispatch: the handler receives
    /// the untyped envelope and downcasts itself. When a type appears in
    /// several groups, the group registered first wins.
    pub fn on_types<F, Fut>(&mut self, accepts: Vec<TypeKey>, handler: F) -> &mut Self
    where
        F: Fn(AnyMessage, ExecutorContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<AnyMessage>, WorkflowError>> + Send + 'static,
    {
        let erased: HandlerFn = Arc::new(move |message, ctx| Box::pin(handler(message, ctx)));
        self.groups.push(GroupEntry {
            accepts,
            handler: erased,
        });
        self
    }

    /// Register the single catch-all handler, invoked when nothing else
    /// matches. Registering twice replaces the previous one.
    pub fn catch_all<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(AnyMessage, ExecutorContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<AnyMessage>, WorkflowError>> + Send + 'static,
    {
        self.catch_all = Some(Arc::new(move |message, ctx| Box::pin(handler(message, ctx))));
        self
    }

    /// Names of every explicitly handled type, in registration order.
    pub fn handled_types(&self) -> Vec<&'static str> {
        self.typed
            .iter()
            .map(|e| e.key.name)
            .chain(self.groups.iter().flat_map(|g| g.accepts.iter().map(|k| k.name)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.typed.is_empty() && self.groups.is_empty() && self.catch_all.is_none()
    }

    pub(crate) fn build(self, executor: ExecutorId) -> MessageRouter {
        MessageRouter {
            executor,
            typed: self.typed,
            groups: self.groups,
            catch_all: self.catch_all,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

impl fmt::Debug for RouterBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterBuilder")
            .field("typed", &self.typed.len())
            .field("groups", &self.groups.len())
            .field("catch_all", &self.catch_all.is_some())
            .finish()
    }
}

/// The built, immutable dispatch table plus its resolution cache.
pub struct MessageRouter {
    executor: ExecutorId,
    typed: Vec<TypedEntry>,
    groups: Vec<GroupEntry>,
    catch_all: Option<HandlerFn>,
    // Memoized type -> handler resolution. Concurrent first-time dispatches
    // of the same type race benignly: both compute the same resolution.
    cache: RwLock<HashMap<TypeId, Resolution>>,
}

impl MessageRouter {
    /// Whether a message of this runtime type would find a handler.
    pub fn can_handle(&self, type_id: TypeId) -> bool {
        self.resolve(type_id).is_some()
    }

    fn resolve(&self, type_id: TypeId) -> Option<Resolution> {
        if let Some(resolution) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&type_id)
        {
            return Some(*resolution);
        }

        let resolution = self
            .typed
            .iter()
            .position(|entry| entry.key.id == type_id)
            .map(Resolution::Typed)
            .or_else(|| {
                self.groups
                    .iter()
                    .position(|group| group.accepts.iter().any(|key| key.id == type_id))
                    .map(Resolution::Group)
            })
            .or_else(|| self.catch_all.is_some().then_some(Resolution::CatchAll));

        if let Some(resolution) = resolution {
            self.cache
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(type_id, resolution);
        }
        resolution
    }

    /// Route one message to its resolved handler.
    ///
    /// Returns `Ok(None)` when nothing matches and `require_route` is false
    /// (speculative probing); `Err(NoHandlerFound)` when it is true. A
    /// handler's own error is captured in the returned [`CallResult`].
    pub async fn route(
        &self,
        message: AnyMessage,
        ctx: ExecutorContext,
        require_route: bool,
    ) -> Result<Option<CallResult>, WorkflowError> {
        let resolution = match self.resolve(message.type_id()) {
            Some(resolution) => resolution,
            None => {
                if require_route {
                    return Err(WorkflowError::no_handler(
                        self.executor.clone(),
                        message.type_name(),
                    ));
                }
                tracing::debug!(
                    executor = %self.executor,
                    message_type = message.type_name(),
                    "no route for message; probe returned empty"
                );
                return Ok(None);
            }
        };

        let handler = match resolution {
            Resolution::Typed(index) => &self.typed[index].handler,
            Resolution::Group(index) => &self.groups[index].handler,
            Resolution::CatchAll => match &self.catch_all {
                Some(handler) => handler,
                None => {
                    return Err(WorkflowError::no_handler(
                        self.executor.clone(),
                        message.type_name(),
                    ))
                }
            },
        };

        let result = match handler(message, ctx).await {
            Ok(output) => CallResult::Success(output),
            Err(error) => CallResult::Failure(Arc::new(error)),
        };
        Ok(Some(result))
    }

    #[cfg(test)]
    fn cached_resolution(&self, type_id: TypeId) -> Option<Resolution> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&type_id)
            .copied()
    }
}

impl fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRouter")
            .field("executor", &self.executor)
            .field("typed", &self.typed.len())
            .field("groups", &self.groups.len())
            .field("catch_all", &self.catch_all.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx() -> ExecutorContext {
        ExecutorContext::new(
            ExecutorId::new("test"),
            0,
            tokio_util::sync::CancellationToken::new(),
        )
    }

    #[derive(Debug)]
    struct Ping;
    #[derive(Debug)]
    struct Pong;
    #[derive(Debug)]
    struct Unhandled;

    fn router_with_ping() -> MessageRouter {
        let mut builder = RouterBuilder::new();
        builder.on::<Ping, _, _>(|_msg, _ctx| async { Ok(Some(AnyMessage::new("ping"))) });
        builder.build(ExecutorId::new("test"))
    }

    #[tokio::test]
    async fn test_typed_dispatch() {
        let router = router_with_ping();
        let result = router
            .route(AnyMessage::new(Ping), test_ctx(), true)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_success());
        assert_eq!(
            *result.output().unwrap().downcast::<&str>().unwrap(),
            "ping"
        );
    }

    #[tokio::test]
    async fn test_no_handler_when_required() {
        let router = router_with_ping();
        let err = router
            .route(AnyMessage::new(Unhandled), test_ctx(), true)
            .await
            .unwrap_err();
        match err {
            WorkflowError::NoHandlerFound {
                executor,
                message_type,
            } => {
                assert_eq!(executor.as_str(), "test");
                assert!(message_type.contains("Unhandled"));
            }
            _ => panic!("Wrong error type"),
        }
    }

    #[tokio::test]
    async fn test_probe_returns_none_when_not_required() {
        let router = router_with_ping();
        let result = router
            .route(AnyMessage::new(Unhandled), test_ctx(), false)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_handler_error_captured_as_failed_result() {
        let mut builder = RouterBuilder::new();
        builder.on::<Ping, _, _>(|_msg, _ctx| async {
            Err(WorkflowError::handler_failed("test", "deliberate"))
        });
        let router = builder.build(ExecutorId::new("test"));

        let result = router
            .route(AnyMessage::new(Ping), test_ctx(), true)
            .await
            .unwrap()
            .unwrap();
        assert!(!result.is_success());
        assert!(result.error().unwrap().to_string().contains("deliberate"));
    }

    #[tokio::test]
    async fn test_group_handler_first_registered_wins() {
        let mut builder = RouterBuilder::new();
        builder.on_types(vec![TypeKey::of::<Ping>(), TypeKey::of::<Pong>()], |_m, _c| async {
            Ok(Some(AnyMessage::new("group_one")))
        });
        builder.on_types(vec![TypeKey::of::<Pong>()], |_m, _c| async {
            Ok(Some(AnyMessage::new("group_two")))
        });
        let router = builder.build(ExecutorId::new("test"));

        // Pong is accepted by both groups; registration order decides.
        let result = router
            .route(AnyMessage::new(Pong), test_ctx(), true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            *result.output().unwrap().downcast::<&str>().unwrap(),
            "group_one"
        );
    }

    #[tokio::test]
    async fn test_typed_entry_beats_group_entry() {
        let mut builder = RouterBuilder::new();
        builder.on_types(vec![TypeKey::of::<Ping>()], |_m, _c| async {
            Ok(Some(AnyMessage::new("group")))
        });
        builder.on::<Ping, _, _>(|_m, _c| async { Ok(Some(AnyMessage::new("typed"))) });
        let router = builder.build(ExecutorId::new("test"));

        let result = router
            .route(AnyMessage::new(Ping), test_ctx(), true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            *result.output().unwrap().downcast::<&str>().unwrap(),
            "typed"
        );
    }

    #[tokio::test]
    async fn test_catch_all_receives_unmatched() {
        let mut builder = RouterBuilder::new();
        builder.on::<Ping, _, _>(|_m, _c| async { Ok(None) });
        builder.catch_all(|message, _ctx| async move {
            Ok(Some(AnyMessage::new(format!("caught {}", message.type_name()))))
        });
        let router = builder.build(ExecutorId::new("test"));

        let result = router
            .route(AnyMessage::new(Unhandled), test_ctx(), true)
            .await
            .unwrap()
            .unwrap();
        let text = result.output().unwrap().downcast::<String>().unwrap();
        assert!(text.contains("Unhandled"));
    }

    #[tokio::test]
    async fn test_resolution_is_cached_and_stable() {
        let router = router_with_ping();
        let ping_type = TypeId::of::<Ping>();
        assert!(router.cached_resolution(ping_type).is_none());

        let first = router
            .route(AnyMessage::new(Ping), test_ctx(), true)
            .await
            .unwrap()
            .unwrap();
        let cached = router.cached_resolution(ping_type).unwrap();
        assert_eq!(cached, Resolution::Typed(0));

        // Repeat dispatches resolve identically through the cache.
        for _ in 0..3 {
            let next = router
                .route(AnyMessage::new(Ping), test_ctx(), true)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(
                next.output().unwrap().downcast::<&str>().unwrap(),
                first.output().unwrap().downcast::<&str>().unwrap()
            );
            assert_eq!(router.cached_resolution(ping_type).unwrap(), cached);
        }
    }

    #[test]
    fn test_can_handle() {
        let router = router_with_ping();
        assert!(router.can_handle(TypeId::of::<Ping>()));
        assert!(!router.can_handle(TypeId::of::<Unhandled>()));
    }

    #[test]
    fn test_handled_types_in_registration_order() {
        let mut builder = RouterBuilder::new();
        builder.on::<Ping, _, _>(|_m, _c| async { Ok(None) });
        builder.on_types(vec![TypeKey::of::<Pong>()], |_m, _c| async { Ok(None) });
        let names = builder.handled_types();
        assert!(names[0].contains("Ping"));
        assert!(names[1].contains("Pong"));
    }
}
