//! Suspend/resume integration tests.
//!
//! A run that blocks on an external request is checkpointed, restored, and
//! resumed; the restored run must hold exactly the same next-superstep
//! queue, fan-in buffers, and outstanding requests as the live run, and
//! both must produce the same result once the response arrives.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use flowstep::{
    AnyMessage, Checkpointer, Executor, ExecutorId, ExternalResponse, FanInBundle, FanInTrigger,
    FileCheckpointer, MemoryCheckpointer, RouterBuilder, RunStatus, Runner, Workflow,
    WorkflowEvent,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ask {
    question: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Approval {
    approved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuditNote(String);

/// Asks for approval and, in the same round, files an audit note into a
/// fan-in edge that never completes (so a partial buffer exists at suspend).
struct Gate {
    id: ExecutorId,
}

impl Executor for Gate {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn register_handlers(self: Arc<Self>, routes: &mut RouterBuilder) {
        routes.on::<Ask, _, _>(|ask, ctx| async move {
            ctx.send(AuditNote(format!("asked: {}", ask.question)));
            ctx.request_input::<Approval>("approval", Some(AnyMessage::new((*ask).clone())));
            Ok(None)
        });
        routes.on::<Approval, _, _>(|approval, ctx| async move {
            ctx.yield_output(format!("approved={}", approval.approved));
            Ok(None)
        });
    }
}

/// Second fan-in source that never produces anything.
struct Silent {
    id: ExecutorId,
}

impl Executor for Silent {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn register_handlers(self: Arc<Self>, routes: &mut RouterBuilder) {
        routes.on::<AuditNote, _, _>(|_note, _ctx| async move { Ok(None) });
    }
}

struct Archive {
    id: ExecutorId,
}

impl Executor for Archive {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn register_handlers(self: Arc<Self>, routes: &mut RouterBuilder) {
        routes.on::<FanInBundle, _, _>(|_bundle, _ctx| async move { Ok(None) });
    }
}

fn approval_workflow() -> Workflow {
    Workflow::builder()
        .name("approval")
        .add_executor(Gate {
            id: ExecutorId::new("gate"),
        })
        .add_executor(Silent {
            id: ExecutorId::new("silent"),
        })
        .add_executor(Archive {
            id: ExecutorId::new("archive"),
        })
        .start_with("gate")
        .add_fan_in(["gate", "silent"], "archive", FanInTrigger::All)
        .register_message::<Ask>()
        .register_message::<Approval>()
        .register_message::<AuditNote>()
        .build()
        .unwrap()
}

fn ask() -> Ask {
    Ask {
        question: "ship it?".into(),
    }
}

#[tokio::test]
async fn run_blocks_on_external_request() {
    let runner = Runner::new(approval_workflow());
    let run = runner.run(ask()).await.unwrap();

    assert_eq!(run.status(), RunStatus::Blocked);
    let requests = run.outstanding_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].port, "approval");
    assert!(run
        .events()
        .iter()
        .any(|event| matches!(event, WorkflowEvent::RequestInput { .. })));
}

#[tokio::test]
async fn checkpoint_roundtrip_reproduces_suspend_state() {
    let runner = Runner::new(approval_workflow());
    let live = runner.run(ask()).await.unwrap();
    assert_eq!(live.status(), RunStatus::Blocked);

    let checkpoint = live.checkpoint().unwrap();
    // The audit note is parked in the fan-in buffer at suspend time.
    assert_eq!(checkpoint.fan_in.len(), 1);
    assert_eq!(checkpoint.outstanding.len(), 1);

    let restored = runner.restore(checkpoint.clone()).unwrap();
    assert_eq!(restored.status(), RunStatus::Blocked);
    assert_eq!(restored.run_id(), live.run_id());
    assert_eq!(restored.superstep(), live.superstep());

    // Re-encoding the restored run yields the identical snapshot.
    let recheck = restored.checkpoint().unwrap();
    assert_eq!(recheck.pending, checkpoint.pending);
    assert_eq!(recheck.fan_in, checkpoint.fan_in);
    assert_eq!(recheck.outstanding, checkpoint.outstanding);
    assert_eq!(recheck.superstep, checkpoint.superstep);
}

#[tokio::test]
async fn live_and_restored_runs_agree_after_response() {
    let runner = Runner::new(approval_workflow());
    let mut live = runner.run(ask()).await.unwrap();
    let checkpoint = live.checkpoint().unwrap();
    let mut restored = runner.restore(checkpoint).unwrap();

    let request_id = live.outstanding_requests()[0].id;
    assert_eq!(restored.outstanding_requests()[0].id, request_id);

    for run in [&mut live, &mut restored] {
        run.supply_response(ExternalResponse::new(request_id, Approval { approved: true }))
            .unwrap();
        let status = run.resume().await.unwrap();
        assert_eq!(status, RunStatus::Completed);
        let output = run.output().unwrap().downcast::<String>().unwrap();
        assert_eq!(*output, "approved=true");
    }
}

#[tokio::test]
async fn checkpoint_survives_file_storage() {
    let runner = Runner::new(approval_workflow());
    let live = runner.run(ask()).await.unwrap();
    let checkpoint = live.checkpoint().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointer::new(dir.path(), live.run_id(), true);
    store.save(&checkpoint).await.unwrap();

    let loaded = store.latest().await.unwrap().unwrap();
    assert_eq!(loaded.pending, checkpoint.pending);
    assert_eq!(loaded.fan_in, checkpoint.fan_in);
    assert_eq!(loaded.outstanding, checkpoint.outstanding);

    let mut restored = runner.restore(loaded).unwrap();
    let request_id = restored.outstanding_requests()[0].id;
    restored
        .supply_response(ExternalResponse::new(request_id, Approval { approved: false }))
        .unwrap();
    assert_eq!(restored.resume().await.unwrap(), RunStatus::Completed);
    let output = restored.output().unwrap().downcast::<String>().unwrap();
    assert_eq!(*output, "approved=false");
}

#[tokio::test]
async fn checkpoint_fails_for_unregistered_payload_type() {
    #[derive(Debug, Clone)]
    struct Opaque;

    struct OpaqueAsker {
        id: ExecutorId,
    }

    impl Executor for OpaqueAsker {
        fn id(&self) -> &ExecutorId {
            &self.id
        }

        fn register_handlers(self: Arc<Self>, routes: &mut RouterBuilder) {
            routes.on::<Ask, _, _>(|_ask, ctx| async move {
                ctx.request_input::<Approval>("approval", Some(AnyMessage::new(Opaque)));
                Ok(None)
            });
        }
    }

    let workflow = Workflow::builder()
        .name("opaque")
        .add_executor(OpaqueAsker {
            id: ExecutorId::new("gate"),
        })
        .start_with("gate")
        .register_message::<Ask>()
        .register_message::<Approval>()
        .build()
        .unwrap();

    let run = Runner::new(workflow).run(ask()).await.unwrap();
    assert_eq!(run.status(), RunStatus::Blocked);

    let err = run.checkpoint().unwrap_err();
    assert!(matches!(
        err,
        flowstep::WorkflowError::UnregisteredMessageType(_)
    ));
}

#[tokio::test]
async fn run_to_completion_wakes_on_inbox_response() {
    let runner = Runner::new(approval_workflow());
    let mut run = runner.run(ask()).await.unwrap();
    assert_eq!(run.status(), RunStatus::Blocked);

    let request_id = run.outstanding_requests()[0].id;
    let inbox = run.response_inbox();
    let responder = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        inbox.push(ExternalResponse::new(request_id, Approval { approved: true }));
    });

    let status = run.run_to_completion().await.unwrap();
    responder.await.unwrap();

    assert_eq!(status, RunStatus::Completed);
    let output = run.output().unwrap().downcast::<String>().unwrap();
    assert_eq!(*output, "approved=true");
}

#[tokio::test]
async fn memory_checkpointer_stores_run_history() {
    let runner = Runner::new(approval_workflow());
    let live = runner.run(ask()).await.unwrap();

    let store = MemoryCheckpointer::new();
    store.save(&live.checkpoint().unwrap()).await.unwrap();

    let latest = store.latest().await.unwrap().unwrap();
    assert_eq!(latest.run_id, live.run_id());
    assert_eq!(latest.outstanding.len(), 1);
}
