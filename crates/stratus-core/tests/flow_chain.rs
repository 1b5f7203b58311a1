use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stratus_core::{ChainState, CoreError, FlowChain, FnFlow};
use stratus_test_utils::{
    init_test_tracing, FailingFlow, FailingRollbackFlow, Journal, RecordingFlow, SuspendingFlow,
};

fn recorded_chain(name: &str, journal: &Journal) -> FlowChain {
    let done = journal.clone();
    let error = journal.clone();
    let finally = journal.clone();
    FlowChain::new(name)
        .done(move |_| done.record("done"))
        .error(move |_, _| error.record("error"))
        .finally(move || finally.record("finally"))
}

#[tokio::test]
async fn failure_compensates_completed_steps_in_reverse() {
    init_test_tracing();
    let journal = Journal::new();

    let result = recorded_chain("create-vm", &journal)
        .then(RecordingFlow::new("A", &journal))
        .then(FailingFlow::new("B", &journal, CoreError::external("no capacity")))
        .then(RecordingFlow::new("C", &journal))
        .start()
        .await;

    journal.assert_entries(&["run:A", "run:B", "rollback:A", "error", "finally"]);
    match result {
        Err(CoreError::StepFailure { step, index, cause }) => {
            assert_eq!(step, "B");
            assert_eq!(index, 1);
            assert_eq!(*cause, CoreError::external("no capacity"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn successful_chain_never_rolls_back() {
    let journal = Journal::new();

    let result = recorded_chain("start-vm", &journal)
        .then(RecordingFlow::new("A", &journal))
        .then(RecordingFlow::new("B", &journal))
        .start()
        .await;

    assert!(result.is_ok());
    journal.assert_entries(&["run:A", "run:B", "done", "finally"]);
}

#[tokio::test]
async fn compensation_failure_halts_rollback() {
    let journal = Journal::new();

    let result = recorded_chain("migrate", &journal)
        .then(RecordingFlow::new("A", &journal))
        .then(FailingRollbackFlow::new("B", &journal, CoreError::external("stuck")))
        .then(FailingFlow::new("C", &journal, CoreError::external("target down")))
        .start()
        .await;

    // A is left untouched once B's compensation fails
    journal.assert_entries(&["run:A", "run:B", "run:C", "rollback:B", "error", "finally"]);
    let err = result.unwrap_err();
    assert!(err.is_compensation_failure());
    assert_eq!(err.root_cause(), &CoreError::external("target down"));
}

#[tokio::test]
async fn suspended_step_resumes_when_trigger_fires() {
    let journal = Journal::new();
    let (waiting, mut triggers) = SuspendingFlow::new("wait-agent", &journal);

    let handle = recorded_chain("async", &journal)
        .then(RecordingFlow::new("A", &journal))
        .then(waiting)
        .then(RecordingFlow::new("C", &journal))
        .spawn();

    let trigger = triggers.recv().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    journal.assert_entries(&["run:A", "run:wait-agent"]);

    // Reply arrives from another task
    tokio::spawn(async move { trigger.next().unwrap() });

    assert!(handle.await.unwrap().is_ok());
    journal.assert_entries(&["run:A", "run:wait-agent", "run:C", "done", "finally"]);
}

#[tokio::test]
async fn suspended_step_can_fail_later() {
    let journal = Journal::new();
    let (waiting, mut triggers) = SuspendingFlow::new("wait-agent", &journal);

    let handle = recorded_chain("async-fail", &journal)
        .then(RecordingFlow::new("A", &journal))
        .then(waiting)
        .spawn();

    let trigger = triggers.recv().await.unwrap();
    trigger.fail(CoreError::external("agent timeout")).unwrap();
    assert!(trigger.next().is_err(), "trigger fires only once");

    let err = handle.await.unwrap().unwrap_err();
    assert_eq!(err.root_cause(), &CoreError::external("agent timeout"));
    journal.assert_entries(&["run:A", "run:wait-agent", "rollback:A", "error", "finally"]);
}

#[tokio::test]
async fn exactly_one_terminal_handler_per_run() {
    let done = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));

    for fail in [false, true] {
        let d = done.clone();
        let f = failed.clone();
        let _ = FlowChain::new("once")
            .then(FnFlow::new("maybe", move |_| {
                if fail {
                    Err(CoreError::external("requested"))
                } else {
                    Ok(())
                }
            }))
            .done(move |_| {
                d.fetch_add(1, Ordering::SeqCst);
            })
            .error(move |_, _| {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .start()
            .await;
    }

    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(failed.load(Ordering::SeqCst), 1);
}

#[test]
fn chain_state_terminal_flags() {
    assert!(ChainState::Completed.is_terminal());
    assert!(ChainState::Failed.is_terminal());
    assert!(!ChainState::Forward { cursor: 0 }.is_terminal());
}
