mod common;

use flowsmith_core::error::DecisionError;
use flowsmith_core::types::{NodeStatus, RunStatus};
use flowsmith_test_utils::CallLog;

use common::*;

#[tokio::test]
async fn reject_follows_the_reject_edge() {
    let log = CallLog::new();
    let engine = engine_with(stub_registry(&log));
    let run_id = engine.start(approval_graph(), "x").unwrap();

    let state = engine.wait(&run_id).await.unwrap();
    assert_eq!(state.status, RunStatus::WaitingOnDecision);
    let pending = state.pending_decision.as_ref().unwrap();
    assert_eq!(pending.node_id, "gate");
    assert_eq!(pending.options, vec!["approve", "reject"]);
    assert_eq!(pending.prompt.as_deref(), Some("Proceed?"));
    assert_eq!(state.node_status("gate"), NodeStatus::Waiting);

    engine.resume(&run_id, "gate", "reject").unwrap();
    let state = engine.wait(&run_id).await.unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(log.calls(), vec!["plan", "notes"]);
    assert_eq!(state.node_status("gate"), NodeStatus::Completed);
    assert_eq!(state.node_status("build"), NodeStatus::Idle);
    assert!(state.pending_decision.is_none());

    assert!(matches!(
        engine.resume(&run_id, "gate", "reject"),
        Err(DecisionError::RunNotWaiting { .. })
    ));
}

#[tokio::test]
async fn approve_follows_the_approve_edge() {
    let log = CallLog::new();
    let engine = engine_with(stub_registry(&log));
    let run_id = engine.start(approval_graph(), "x").unwrap();
    engine.wait(&run_id).await.unwrap();

    engine.resume(&run_id, "gate", "approve").unwrap();
    let state = engine.wait(&run_id).await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(log.calls(), vec!["plan", "build"]);
    assert_eq!(state.node_status("notes"), NodeStatus::Idle);
}

#[tokio::test]
async fn unknown_option_leaves_state_unchanged() {
    let log = CallLog::new();
    let engine = engine_with(stub_registry(&log));
    let run_id = engine.start(approval_graph(), "x").unwrap();
    let before = engine.wait(&run_id).await.unwrap();

    let err = engine.resume(&run_id, "gate", "maybe").unwrap_err();
    assert_eq!(
        err,
        DecisionError::UnknownOption {
            option: "maybe".into(),
            expected: vec!["approve".into(), "reject".into()],
        }
    );
    assert_eq!(engine.get_run_state(&run_id).unwrap(), before);

    // Wrong node is rejected the same way.
    assert!(matches!(
        engine.resume(&run_id, "plan", "approve"),
        Err(DecisionError::RunNotWaiting { .. })
    ));
    assert_eq!(engine.get_run_state(&run_id).unwrap(), before);

    // The run still accepts a valid choice afterwards.
    engine.resume(&run_id, "gate", "approve").unwrap();
    assert_eq!(engine.wait(&run_id).await.unwrap().status, RunStatus::Completed);
}

#[tokio::test]
async fn resume_before_suspension_is_rejected() {
    let log = CallLog::new();
    let engine = engine_with(stub_registry(&log));
    let run_id = engine.start(single_agent("coder"), "x").unwrap();
    engine.wait(&run_id).await.unwrap();
    assert!(matches!(
        engine.resume(&run_id, "work", "ok"),
        Err(DecisionError::RunNotWaiting { .. })
    ));
}

#[tokio::test]
async fn concurrent_resumes_only_one_wins() {
    let log = CallLog::new();
    let engine = engine_with(stub_registry(&log));
    let run_id = engine.start(approval_graph(), "x").unwrap();
    engine.wait(&run_id).await.unwrap();

    let mut tasks = Vec::new();
    for option in ["approve", "reject", "approve", "reject"] {
        let engine = engine.clone();
        let run_id = run_id.clone();
        tasks.push(tokio::spawn(async move {
            engine.resume(&run_id, "gate", option).is_ok()
        }));
    }
    let mut wins = 0;
    for task in tasks {
        if task.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);

    let state = engine.wait(&run_id).await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(log.calls().len(), 2);
}

#[tokio::test]
async fn cancel_while_waiting() {
    let log = CallLog::new();
    let engine = engine_with(stub_registry(&log));
    let run_id = engine.start(approval_graph(), "x").unwrap();
    engine.wait(&run_id).await.unwrap();

    engine.cancel(&run_id).unwrap();
    let state = engine.get_run_state(&run_id).unwrap();
    assert_eq!(state.status, RunStatus::Cancelled);
    assert_eq!(state.node_status("gate"), NodeStatus::Idle);
    assert!(state.pending_decision.is_none());
    assert!(matches!(
        engine.resume(&run_id, "gate", "approve"),
        Err(DecisionError::RunNotWaiting { .. })
    ));
}

#[tokio::test]
async fn review_loop_revisits_the_coder() {
    let log = CallLog::new();
    let engine = engine_with(stub_registry(&log));
    let graph = flowsmith_engine::TemplateCatalog::builtin()
        .instantiate("review-loop")
        .unwrap();
    let run_id = engine.start(graph, "x").unwrap();

    engine.wait(&run_id).await.unwrap();
    engine.resume(&run_id, "ship", "revise").unwrap();
    let state = engine.wait(&run_id).await.unwrap();
    assert_eq!(state.status, RunStatus::WaitingOnDecision);

    engine.resume(&run_id, "ship", "ship").unwrap();
    let state = engine.wait(&run_id).await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(log.calls(), vec!["code", "review", "code", "review"]);
}
