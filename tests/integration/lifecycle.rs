//! Worker lifecycle tests: start, idempotence, crash visibility, stop.

use std::time::{Duration, Instant};

use pipevisor::supervisor::LaunchOutcome;
use pipevisor::{Error, WorkerState};
use tokio_test::{assert_err, assert_ok};

use crate::fixtures::{endpoints, models, params, Harness, POLL_INTERVAL};

/// Single model lands on the base port and is running once start returns.
#[tokio::test]
async fn test_start_single_model_on_base_port() {
    let h = Harness::new(&["modelA"]);

    let outcomes = assert_ok!(h.orchestrator.start(&models(&["modelA"]), &endpoints(), &params()));
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], LaunchOutcome::Launched { port: 8888, .. }));

    let worker = h.orchestrator.worker("modelA").expect("modelA should be tracked");
    assert_eq!(worker.port, 8888);
    assert_eq!(worker.state, WorkerState::Running);
    assert!(worker.pid.is_some());
    assert!(h.orchestrator.is_running("modelA"));

    h.orchestrator.shutdown().await.unwrap();
}

/// Each model gets base_port + its index in the request.
#[tokio::test]
async fn test_start_assigns_distinct_ports() {
    let h = Harness::new(&["modelA", "modelB", "modelC"]);

    assert_ok!(h.orchestrator.start_list("modelA,modelB,modelC", &endpoints(), &params()));

    let workers = h.orchestrator.workers();
    let assigned: Vec<(String, u16)> = workers.iter().map(|w| (w.model.clone(), w.port)).collect();
    assert_eq!(
        assigned,
        vec![
            ("modelA".to_string(), 8888),
            ("modelB".to_string(), 8889),
            ("modelC".to_string(), 8890),
        ]
    );

    assert_eq!(h.orchestrator.stop_all().await.unwrap(), 3);
}

/// A second start for a running model does not spawn another process.
#[tokio::test]
async fn test_start_is_idempotent_for_running_model() {
    let h = Harness::new(&["modelA"]);

    h.orchestrator
        .start(&models(&["modelA"]), &endpoints(), &params())
        .unwrap();
    let first = h.orchestrator.worker("modelA").unwrap();

    let outcomes = h
        .orchestrator
        .start(&models(&["modelA"]), &endpoints(), &params())
        .unwrap();
    assert!(matches!(&outcomes[0], LaunchOutcome::AlreadyRunning(w) if w.id == first.id));

    let again = h.orchestrator.worker("modelA").unwrap();
    assert_eq!(again.id, first.id);
    assert_eq!(again.pid, first.pid);
    assert_eq!(h.orchestrator.registry().len(), 1);

    h.orchestrator.stop_all().await.unwrap();
}

/// Unknown model fails before anything is spawned or tracked.
#[tokio::test]
async fn test_unknown_model_fails_without_entry() {
    let h = Harness::new(&["modelA"]);

    let err = assert_err!(h.orchestrator.start(
        &models(&["unknownModel"]),
        &endpoints(),
        &params()
    ));
    assert!(matches!(err, Error::AggregateStart(_)));
    assert!(matches!(
        &err.failures()[0].error,
        Error::Configuration { model } if model == "unknownModel"
    ));
    assert!(h.orchestrator.registry().is_empty());
}

/// A failure for one model does not roll back the others.
#[tokio::test]
async fn test_partial_failure_keeps_started_workers() {
    let h = Harness::new(&["modelA", "modelC"]);

    let err = h
        .orchestrator
        .start(&models(&["modelA", "missing", "modelC"]), &endpoints(), &params())
        .unwrap_err();

    assert_eq!(err.failures().len(), 1);
    assert_eq!(err.failures()[0].model, "missing");
    assert!(h.orchestrator.is_running("modelA"));
    assert_eq!(h.orchestrator.worker("modelC").unwrap().port, 8890);
    assert!(h.orchestrator.worker("missing").is_none());

    h.orchestrator.stop_all().await.unwrap();
}

/// Missing executable surfaces as a launch error and leaves no entry.
#[tokio::test]
async fn test_missing_executable_is_launch_error() {
    use pipevisor::supervisor::{EnvironmentDescriptor, EnvironmentResolver};
    use pipevisor::{Orchestrator, OrchestratorSettings};

    let dir = tempfile::tempdir().unwrap();
    let mut resolver = EnvironmentResolver::new();
    // No bin/python under this root.
    resolver
        .register("ghost", EnvironmentDescriptor::new(dir.path(), None, dir.path()))
        .unwrap();
    let orchestrator = Orchestrator::new(resolver, OrchestratorSettings::default());

    let err = orchestrator
        .start(&models(&["ghost"]), &endpoints(), &params())
        .unwrap_err();
    assert!(matches!(err.failures()[0].error, Error::Launch { .. }));
    assert!(orchestrator.registry().is_empty());
}

/// Stopping a running worker terminates it, joins its tasks and removes it.
#[tokio::test]
async fn test_stop_running_worker_removes_entry() {
    let h = Harness::new(&["modelA", "modelB"]);
    h.orchestrator
        .start(&models(&["modelA", "modelB"]), &endpoints(), &params())
        .unwrap();

    assert!(h.orchestrator.stop("modelA").await.unwrap());

    assert!(h.orchestrator.worker("modelA").is_none());
    assert!(h.orchestrator.is_running("modelB"));

    h.orchestrator.stop_all().await.unwrap();
}

/// Stop on an untracked model is a no-op.
#[tokio::test]
async fn test_stop_untracked_model_is_noop() {
    let h = Harness::new(&["modelA"]);
    h.orchestrator
        .start(&models(&["modelA"]), &endpoints(), &params())
        .unwrap();

    assert!(!h.orchestrator.stop("nobody").await.unwrap());
    assert_eq!(h.orchestrator.registry().len(), 1);

    h.orchestrator.stop_all().await.unwrap();
}

/// A crashed worker records Failed(137) and stays visible until stopped.
#[tokio::test]
async fn test_crashed_worker_stays_until_stop() {
    let h = Harness::new(&["crashX"]);
    h.orchestrator
        .start(&models(&["crashX"]), &endpoints(), &params())
        .unwrap();

    let state = h.wait_for_state("crashX", |s| s.is_terminal()).await;
    assert!(matches!(state, WorkerState::Failed { code: Some(137), .. }));
    assert!(!h.orchestrator.is_running("crashX"));

    // Still tracked well after the exit was observed.
    tokio::time::sleep(POLL_INTERVAL * 3).await;
    assert!(h.orchestrator.worker("crashX").is_some());

    // The relay delivered the stderr line through the merged stream.
    h.wait_for_line("crashX", "fatal: out of memory").await;

    assert!(h.orchestrator.stop("crashX").await.unwrap());
    assert!(h.orchestrator.worker("crashX").is_none());
}

/// A clean exit is recorded as Exited(0).
#[tokio::test]
async fn test_clean_exit_recorded() {
    let h = Harness::new(&["ok1"]);
    h.orchestrator
        .start(&models(&["ok1"]), &endpoints(), &params())
        .unwrap();

    let state = h.wait_for_state("ok1", |s| s.is_terminal()).await;
    assert_eq!(state, WorkerState::Exited { code: 0 });
}

/// A crashed model can be started again and gets a fresh launch.
#[tokio::test]
async fn test_restart_after_crash_is_explicit() {
    let h = Harness::new(&["crashY"]);
    h.orchestrator
        .start(&models(&["crashY"]), &endpoints(), &params())
        .unwrap();
    h.wait_for_state("crashY", |s| s.is_terminal()).await;
    let first = h.orchestrator.worker("crashY").unwrap();

    // No automatic restart happens.
    tokio::time::sleep(POLL_INTERVAL * 3).await;
    assert_eq!(h.orchestrator.worker("crashY").unwrap().id, first.id);

    let outcomes = h
        .orchestrator
        .start(&models(&["crashY"]), &endpoints(), &params())
        .unwrap();
    match &outcomes[0] {
        LaunchOutcome::Launched { id, .. } => assert_ne!(*id, first.id),
        other => panic!("Expected Launched, got {:?}", other),
    }

    h.orchestrator.stop_all().await.unwrap();
}

/// Monitor notices an exit within about one polling interval.
#[tokio::test]
async fn test_exit_detected_within_poll_interval() {
    let h = Harness::new(&["ok2"]);
    let started = Instant::now();
    h.orchestrator
        .start(&models(&["ok2"]), &endpoints(), &params())
        .unwrap();

    h.wait_for_state("ok2", |s| s.is_terminal()).await;
    // Process startup plus one interval, with generous slack for CI.
    assert!(
        started.elapsed() < POLL_INTERVAL + Duration::from_secs(2),
        "exit took {:?} to observe",
        started.elapsed()
    );
}

/// stop_all empties the registry whatever state the workers are in.
#[tokio::test]
async fn test_stop_all_empties_registry() {
    let h = Harness::new(&["modelA", "modelB", "crashZ", "ok3"]);
    let _ = h
        .orchestrator
        .start_list("modelA,modelB,crashZ,ok3", &endpoints(), &params());
    h.wait_for_state("crashZ", |s| s.is_terminal()).await;

    assert_eq!(h.orchestrator.stop_all().await.unwrap(), 4);
    assert!(h.orchestrator.registry().is_empty());
    assert!(h.orchestrator.workers().is_empty());
}

/// A worker that exited but left a descendant holding its output still
/// stops promptly; the descendant is terminated with it.
#[tokio::test]
async fn test_stop_reaches_forked_descendants() {
    let h = Harness::new(&["orphanA"]);
    h.orchestrator
        .start(&models(&["orphanA"]), &endpoints(), &params())
        .unwrap();

    let state = h.wait_for_state("orphanA", |s| s.is_terminal()).await;
    assert!(matches!(state, WorkerState::Failed { code: Some(1), .. }));
    h.wait_for_line("orphanA", "forked").await;

    let stopped = tokio::time::timeout(Duration::from_secs(10), h.orchestrator.stop("orphanA"))
        .await
        .expect("stop should not wait out the descendant's sleep");
    assert!(stopped.unwrap());
    assert!(h.orchestrator.worker("orphanA").is_none());
}
