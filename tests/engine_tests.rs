//! End-to-end engine behavior over the in-memory and SQLite stores.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, json};
use tokio::sync::Notify;
use uuid::Uuid;

use flowmaster::engine::{
    OutcomeKind, PhaseContext, PhaseDecision, PhaseExecutionEngine, PhaseHandler, PhaseHandlers,
    RetryPolicy, handler_fn,
};
use flowmaster::errors::{EngineError, HandlerError, RegistryError};
use flowmaster::flow::{FlowFilter, LifecycleStatus, NewFlow};
use flowmaster::errors::LockError;
use flowmaster::flow::RunOutcome;
use flowmaster::lock::memory::MemoryPhaseLockManager;
use flowmaster::lock::{PhaseLockManager, SqlitePhaseLockManager};
use flowmaster::pool::TenantWorkerPool;
use flowmaster::registry::{FlowTypeConfig, FlowTypeRegistry, PhaseDefinition};
use flowmaster::store::{FlowStore, MemoryFlowStore, SqliteFlowStore};

// =========================================
// Harness
// =========================================

fn discovery_type() -> FlowTypeConfig {
    FlowTypeConfig::from_phase_names("discovery", &["init", "map", "complete"])
        .with_transition("complete", "complete")
}

fn intake_type() -> FlowTypeConfig {
    FlowTypeConfig::sequential(
        "intake",
        "Intake",
        vec![
            PhaseDefinition::new("load", "Load").produces(&["rows"]),
            PhaseDefinition::new("map", "Map")
                .requires(&["rows"])
                .produces(&["mapping"]),
            PhaseDefinition::new("done", "Done"),
        ],
    )
}

fn registry() -> Arc<FlowTypeRegistry> {
    let mut registry = FlowTypeRegistry::new();
    registry.register(discovery_type()).unwrap();
    registry.register(intake_type()).unwrap();
    Arc::new(registry)
}

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    }
}

struct Harness {
    engine: Arc<PhaseExecutionEngine>,
    store: Arc<dyn FlowStore>,
    locks: Arc<MemoryPhaseLockManager>,
    pool: Arc<TenantWorkerPool>,
}

fn harness_with_store(store: Arc<dyn FlowStore>, handlers: PhaseHandlers) -> Harness {
    harness_with_retry(store, handlers, fast_retry(2))
}

fn harness_with_retry(
    store: Arc<dyn FlowStore>,
    handlers: PhaseHandlers,
    retry: RetryPolicy,
) -> Harness {
    let locks = Arc::new(MemoryPhaseLockManager::with_holder(
        "test-orchestrator",
        Duration::from_secs(60),
    ));
    let pool = Arc::new(TenantWorkerPool::new(Duration::from_secs(60)));
    let engine = PhaseExecutionEngine::new(
        registry(),
        Arc::clone(&store),
        locks.clone(),
        Arc::clone(&pool),
        handlers,
    )
    .with_retry_policy(retry);
    Harness {
        engine: Arc::new(engine),
        store,
        locks,
        pool,
    }
}

fn harness(handlers: PhaseHandlers) -> Harness {
    harness_with_store(Arc::new(MemoryFlowStore::new()), handlers)
}

fn default_harness() -> Harness {
    harness(PhaseHandlers::with_default_transitions())
}

fn sqlite_store() -> Arc<dyn FlowStore> {
    Arc::new(SqliteFlowStore::open_in_memory(&registry()).unwrap())
}

async fn create(h: &Harness, flow_type: &str, client: &str, engagement: &str) -> Uuid {
    h.engine
        .create_flow(&NewFlow::new(flow_type, client, engagement, "user-1"))
        .await
        .unwrap()
        .master
        .flow_id
}

/// Handler that parks until released, so tests can act while a phase runs.
struct GatedHandler {
    started: Arc<Notify>,
    release: Arc<Notify>,
}

impl GatedHandler {
    fn new() -> (Arc<Self>, Arc<Notify>, Arc<Notify>) {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let handler = Arc::new(Self {
            started: Arc::clone(&started),
            release: Arc::clone(&release),
        });
        (handler, started, release)
    }
}

#[async_trait]
impl PhaseHandler for GatedHandler {
    async fn handle(&self, _ctx: PhaseContext<'_>) -> Result<PhaseDecision, HandlerError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(PhaseDecision::proceed())
    }
}

/// Handler that sleeps before continuing and counts its invocations.
struct SlowHandler {
    delay: Duration,
    runs: Arc<AtomicU32>,
}

#[async_trait]
impl PhaseHandler for SlowHandler {
    async fn handle(&self, _ctx: PhaseContext<'_>) -> Result<PhaseDecision, HandlerError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(PhaseDecision::proceed())
    }
}

/// Handler whose first attempt fails recoverably; later attempts continue.
/// Signals after the first attempt so a test can act during the backoff.
struct FlakyOnceHandler {
    first_attempt: Arc<Notify>,
}

#[async_trait]
impl PhaseHandler for FlakyOnceHandler {
    async fn handle(&self, ctx: PhaseContext<'_>) -> Result<PhaseDecision, HandlerError> {
        if ctx.attempt == 1 {
            self.first_attempt.notify_one();
            return Err(HandlerError::Recoverable("connection reset".to_string()));
        }
        Ok(PhaseDecision::proceed())
    }
}

/// Retry once, late enough for another call to run in between.
fn slow_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 1,
        base_delay: Duration::from_millis(150),
        max_delay: Duration::from_millis(150),
    }
}

// =========================================
// Scenarios
// =========================================

#[tokio::test]
async fn test_continue_moves_child_to_next_phase() {
    let h = default_harness();
    let flow_id = create(&h, "discovery", "c1", "e1").await;

    let outcome = h.engine.advance(flow_id).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Advanced);
    assert_eq!(outcome.executed_phase, "init");
    assert_eq!(outcome.current_phase, "map");
    assert_eq!(outcome.lifecycle_status, LifecycleStatus::Running);
    assert_eq!(outcome.attempts, 1);

    let child = h.store.load_child(flow_id).await.unwrap().unwrap();
    assert_eq!(child.current_phase(), "map");
    assert_eq!(child.phase_state().current_phase(), "map");
    assert_eq!(child.phase_state().completed_phases(), ["init".to_string()]);

    let status = h.engine.get_status(flow_id).await.unwrap();
    assert_eq!(status.lifecycle_status, LifecycleStatus::Running);
    assert_eq!(status.current_phase, "map");
}

#[tokio::test]
async fn test_terminal_self_loop_completes_flow() {
    let h = default_harness();
    let flow_id = create(&h, "discovery", "c1", "e1").await;

    h.engine.advance(flow_id).await.unwrap();
    h.engine.advance(flow_id).await.unwrap();
    let outcome = h.engine.advance(flow_id).await.unwrap();
    assert_eq!(outcome.executed_phase, "complete");
    assert_eq!(outcome.kind, OutcomeKind::Completed);
    assert_eq!(outcome.current_phase, "complete");
    assert_eq!(outcome.lifecycle_status, LifecycleStatus::Completed);

    let master = h.store.load_master(flow_id).await.unwrap().unwrap();
    assert!(master.execution_metadata.completed_at.is_some());
    assert_eq!(master.execution_metadata.phase_runs.len(), 3);
}

#[tokio::test]
async fn test_terminal_flows_are_immutable() {
    let h = default_harness();
    let completed = create(&h, "discovery", "c1", "e1").await;
    for _ in 0..3 {
        h.engine.advance(completed).await.unwrap();
    }
    let cancelled = create(&h, "discovery", "c1", "e1").await;
    h.engine.cancel(cancelled).await.unwrap();

    for flow_id in [completed, cancelled] {
        let before = h.engine.get_flow(flow_id).await.unwrap();

        let err = h.engine.advance(flow_id).await.unwrap_err();
        assert!(matches!(err, EngineError::FlowTerminal { .. }), "got {err:?}");
        let err = h
            .engine
            .advance_phase(flow_id, Some("map"), Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::FlowTerminal { .. }), "got {err:?}");
        for result in [
            h.engine.pause(flow_id).await,
            h.engine.resume(flow_id).await,
            h.engine.cancel(flow_id).await,
            h.engine.recover(flow_id).await,
        ] {
            assert!(matches!(result, Err(EngineError::FlowTerminal { .. })));
        }

        let after = h.engine.get_flow(flow_id).await.unwrap();
        assert_eq!(before, after);
    }
}

#[tokio::test]
async fn test_held_lock_reports_already_running_then_succeeds_after_release() {
    let h = default_harness();
    let flow_id = create(&h, "discovery", "c1", "e1").await;
    h.engine.advance(flow_id).await.unwrap();

    let token = h.locks.try_acquire(flow_id, "map").await.unwrap().unwrap();
    let err = h.engine.advance(flow_id).await.unwrap_err();
    match &err {
        EngineError::PhaseAlreadyRunning { flow_id: id, phase } => {
            assert_eq!(*id, flow_id);
            assert_eq!(phase, "map");
        }
        other => panic!("Expected PhaseAlreadyRunning, got {other:?}"),
    }
    assert!(err.is_retryable());
    assert_eq!(
        h.engine.get_status(flow_id).await.unwrap().current_phase,
        "map"
    );

    assert!(h.locks.release(flow_id, "map", token).await.unwrap());
    let outcome = h.engine.advance(flow_id).await.unwrap();
    assert_eq!(outcome.executed_phase, "map");
    assert_eq!(outcome.current_phase, "complete");
    assert_eq!(h.locks.active_leases(), 0);
}

#[tokio::test]
async fn test_concurrent_advances_are_mutually_exclusive() {
    let (gated, started, release) = GatedHandler::new();
    let mut handlers = PhaseHandlers::with_default_transitions();
    handlers.register_phase("discovery", "init", gated);
    let h = harness(handlers);
    let flow_id = create(&h, "discovery", "c1", "e1").await;

    let engine = Arc::clone(&h.engine);
    let first = tokio::spawn(async move { engine.advance(flow_id).await });
    started.notified().await;

    let second = h.engine.advance(flow_id).await;
    assert!(matches!(
        second,
        Err(EngineError::PhaseAlreadyRunning { .. })
    ));

    release.notify_one();
    let outcome = first.await.unwrap().unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Advanced);
    assert_eq!(outcome.current_phase, "map");

    let master = h.store.load_master(flow_id).await.unwrap().unwrap();
    assert_eq!(master.execution_metadata.phase_runs.len(), 1);
    assert_eq!(h.locks.active_leases(), 0);
}

#[tokio::test]
async fn test_cancel_while_handler_runs_keeps_flow_cancelled() {
    let (gated, started, release) = GatedHandler::new();
    let mut handlers = PhaseHandlers::with_default_transitions();
    handlers.register_phase("discovery", "init", gated);
    let h = harness(handlers);
    let flow_id = create(&h, "discovery", "c1", "e1").await;

    let engine = Arc::clone(&h.engine);
    let running = tokio::spawn(async move { engine.advance(flow_id).await });
    started.notified().await;

    let status = h.engine.cancel(flow_id).await.unwrap();
    assert_eq!(status.lifecycle_status, LifecycleStatus::Cancelled);

    release.notify_one();
    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome.lifecycle_status, LifecycleStatus::Cancelled);
    assert_eq!(outcome.current_phase, "map");

    let status = h.engine.get_status(flow_id).await.unwrap();
    assert_eq!(status.lifecycle_status, LifecycleStatus::Cancelled);
    assert!(matches!(
        h.engine.advance(flow_id).await,
        Err(EngineError::FlowTerminal { .. })
    ));
}

#[tokio::test]
async fn test_explicit_skip_target_wins_over_default() {
    let mut handlers = PhaseHandlers::with_default_transitions();
    handlers.register_phase(
        "discovery",
        "init",
        handler_fn(|_| {
            Ok(PhaseDecision::Skip {
                next_phase: Some("complete".to_string()),
                reason: "nothing to map".to_string(),
            })
        }),
    );
    let h = harness(handlers);
    let flow_id = create(&h, "discovery", "c1", "e1").await;

    let outcome = h.engine.advance(flow_id).await.unwrap();
    assert_eq!(
        outcome.kind,
        OutcomeKind::Skipped {
            reason: "nothing to map".to_string()
        }
    );
    assert_eq!(outcome.current_phase, "complete");

    let child = h.store.load_child(flow_id).await.unwrap().unwrap();
    assert_eq!(child.phase_state().skipped_phases()[0].phase, "init");
    assert!(child.phase_state().completed_phases().is_empty());
}

#[tokio::test]
async fn test_next_phase_outside_flow_type_fails_flow() {
    let mut handlers = PhaseHandlers::new();
    handlers.register_type(
        "discovery",
        handler_fn(|_| Ok(PhaseDecision::continue_to("nowhere"))),
    );
    let h = harness(handlers);
    let flow_id = create(&h, "discovery", "c1", "e1").await;

    let outcome = h.engine.advance(flow_id).await.unwrap();
    match &outcome.kind {
        OutcomeKind::Failed { error } => assert!(error.contains("nowhere")),
        other => panic!("Expected Failed, got {other:?}"),
    }
    assert_eq!(outcome.current_phase, "init");
    assert_eq!(outcome.lifecycle_status, LifecycleStatus::Failed);
}

#[tokio::test]
async fn test_handler_artifacts_are_merged_and_visible_to_next_phase() {
    let seen = Arc::new(AtomicBool::new(false));
    let seen_in_handler = Arc::clone(&seen);
    let mut handlers = PhaseHandlers::new();
    handlers
        .register_phase(
            "discovery",
            "init",
            handler_fn(|_| {
                let mut artifacts = Map::new();
                artifacts.insert("inventory".to_string(), json!({"servers": 3}));
                Ok(PhaseDecision::with_artifacts(artifacts))
            }),
        )
        .register_phase(
            "discovery",
            "map",
            handler_fn(move |ctx| {
                if ctx.input["inventory"]["servers"] == json!(3) {
                    seen_in_handler.store(true, Ordering::SeqCst);
                }
                let mut artifacts = Map::new();
                artifacts.insert("inventory".to_string(), json!({"apps": 2}));
                Ok(PhaseDecision::with_artifacts(artifacts))
            }),
        );
    let h = harness(handlers);
    let flow_id = create(&h, "discovery", "c1", "e1").await;

    h.engine.advance(flow_id).await.unwrap();
    h.engine.advance(flow_id).await.unwrap();
    assert!(seen.load(Ordering::SeqCst));

    let child = h.store.load_child(flow_id).await.unwrap().unwrap();
    assert_eq!(
        child.phase_state().artifacts()["inventory"],
        json!({"servers": 3, "apps": 2})
    );
}

// =========================================
// Failure handling
// =========================================

#[tokio::test]
async fn test_recoverable_failures_are_retried_in_call() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let mut handlers = PhaseHandlers::with_default_transitions();
    handlers.register_phase(
        "discovery",
        "init",
        handler_fn(move |ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            if ctx.attempt < 3 {
                Err(HandlerError::Recoverable("connection reset".to_string()))
            } else {
                Ok(PhaseDecision::proceed())
            }
        }),
    );
    let h = harness(handlers);
    let flow_id = create(&h, "discovery", "c1", "e1").await;

    let outcome = h.engine.advance(flow_id).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Advanced);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let master = h.store.load_master(flow_id).await.unwrap().unwrap();
    assert_eq!(master.execution_metadata.retry_counts["init"], 2);
    assert!(master.execution_metadata.last_error.is_none());
}

#[tokio::test]
async fn test_exhausted_retries_leave_phase_for_a_later_advance() {
    let mut handlers = PhaseHandlers::with_default_transitions();
    handlers.register_phase(
        "discovery",
        "init",
        handler_fn(|_| Ok(PhaseDecision::fail("upstream timed out"))),
    );
    let h = harness(handlers);
    let flow_id = create(&h, "discovery", "c1", "e1").await;

    let outcome = h.engine.advance(flow_id).await.unwrap();
    assert_eq!(
        outcome.kind,
        OutcomeKind::RetryScheduled {
            reason: "upstream timed out".to_string()
        }
    );
    assert!(!outcome.is_success());
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.current_phase, "init");
    assert_eq!(outcome.lifecycle_status, LifecycleStatus::Running);

    let master = h.store.load_master(flow_id).await.unwrap().unwrap();
    let last_error = master.execution_metadata.last_error.unwrap();
    assert!(last_error.recoverable);
    assert_eq!(last_error.phase, "init");

    let status = h.engine.get_status(flow_id).await.unwrap();
    assert_eq!(status.last_error.as_deref(), Some("upstream timed out"));
}

#[tokio::test]
async fn test_retry_decision_counts_as_recoverable() {
    let mut handlers = PhaseHandlers::with_default_transitions();
    handlers.register_phase(
        "discovery",
        "init",
        handler_fn(|ctx| {
            if ctx.attempt == 1 {
                Ok(PhaseDecision::Retry {
                    reason: "source busy".to_string(),
                })
            } else {
                Ok(PhaseDecision::proceed())
            }
        }),
    );
    let h = harness(handlers);
    let flow_id = create(&h, "discovery", "c1", "e1").await;

    let outcome = h.engine.advance(flow_id).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Advanced);
    assert_eq!(outcome.attempts, 2);
}

#[tokio::test]
async fn test_fatal_failure_fails_flow_until_recovered() {
    let broken = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&broken);
    let mut handlers = PhaseHandlers::with_default_transitions();
    handlers.register_phase(
        "discovery",
        "init",
        handler_fn(move |_| {
            if flag.load(Ordering::SeqCst) {
                Ok(PhaseDecision::fail("invalid field mapping"))
            } else {
                Ok(PhaseDecision::proceed())
            }
        }),
    );
    let h = harness(handlers);
    let flow_id = create(&h, "discovery", "c1", "e1").await;

    let outcome = h.engine.advance(flow_id).await.unwrap();
    assert_eq!(
        outcome.kind,
        OutcomeKind::Failed {
            error: "invalid field mapping".to_string()
        }
    );
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.lifecycle_status, LifecycleStatus::Failed);

    assert!(matches!(
        h.engine.advance(flow_id).await,
        Err(EngineError::FlowNotRunnable {
            status: LifecycleStatus::Failed,
            ..
        })
    ));

    broken.store(false, Ordering::SeqCst);
    let status = h.engine.recover(flow_id).await.unwrap();
    assert_eq!(status.lifecycle_status, LifecycleStatus::Running);
    assert_eq!(status.current_phase, "init");

    let outcome = h.engine.advance(flow_id).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Advanced);
}

#[tokio::test]
async fn test_handler_panic_is_contained() {
    let mut handlers = PhaseHandlers::with_default_transitions();
    handlers.register_phase(
        "discovery",
        "init",
        handler_fn(|_| -> Result<PhaseDecision, HandlerError> { panic!("boom") }),
    );
    let h = harness(handlers);
    let flow_id = create(&h, "discovery", "c1", "e1").await;

    let outcome = h.engine.advance(flow_id).await.unwrap();
    match &outcome.kind {
        OutcomeKind::Failed { error } => {
            assert!(error.contains("handler panicked"));
            assert!(error.contains("boom"));
        }
        other => panic!("Expected Failed, got {other:?}"),
    }
    assert_eq!(h.locks.active_leases(), 0);

    // The worker survives the panic.
    h.engine.recover(flow_id).await.unwrap();
    let worker = h.pool.acquire("c1", "e1", "discovery");
    assert!(!worker.is_busy());
}

// =========================================
// Requests rejected before any mutation
// =========================================

#[tokio::test]
async fn test_missing_required_input_is_rejected_without_mutation() {
    let mut handlers = PhaseHandlers::with_default_transitions();
    handlers.register_phase(
        "intake",
        "load",
        handler_fn(|_| Ok(PhaseDecision::proceed())),
    );
    let h = harness(handlers);
    let flow_id = create(&h, "intake", "c1", "e1").await;
    h.engine.advance(flow_id).await.unwrap();

    let before = h.engine.get_flow(flow_id).await.unwrap();
    let err = h.engine.advance(flow_id).await.unwrap_err();
    match err {
        EngineError::MissingPhaseInput { phase, missing } => {
            assert_eq!(phase, "map");
            assert_eq!(missing, vec!["rows".to_string()]);
        }
        other => panic!("Expected MissingPhaseInput, got {other:?}"),
    }
    assert_eq!(h.engine.get_flow(flow_id).await.unwrap(), before);
    assert_eq!(h.locks.active_leases(), 0);

    let mut overrides = Map::new();
    overrides.insert("rows".to_string(), json!([1, 2, 3]));
    let outcome = h
        .engine
        .advance_phase(flow_id, None, overrides)
        .await
        .unwrap();
    assert_eq!(outcome.current_phase, "done");

    // Overrides feed one run only; they are not persisted as artifacts.
    let child = h.store.load_child(flow_id).await.unwrap().unwrap();
    assert!(!child.phase_state().artifacts().contains_key("rows"));
    assert!(child.phase_state().artifacts().contains_key("mapping"));
}

#[tokio::test]
async fn test_unknown_type_and_phase_are_rejected() {
    let h = default_harness();
    let err = h
        .engine
        .create_flow(&NewFlow::new("bogus", "c1", "e1", "u1"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Registry(RegistryError::UnknownType(_))
    ));

    let flow_id = create(&h, "discovery", "c1", "e1").await;
    let err = h
        .engine
        .advance_phase(flow_id, Some("data_import"), Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownPhase { .. }));

    let err = h.engine.advance(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, EngineError::FlowNotFound { .. }));
}

#[tokio::test]
async fn test_no_handler_leaves_flow_and_locks_untouched() {
    let h = harness(PhaseHandlers::new());
    let flow_id = create(&h, "discovery", "c1", "e1").await;
    let before = h.engine.get_flow(flow_id).await.unwrap();

    let err = h.engine.advance(flow_id).await.unwrap_err();
    assert!(matches!(err, EngineError::NoHandler { .. }));
    assert_eq!(h.engine.get_flow(flow_id).await.unwrap(), before);
    assert_eq!(h.locks.active_leases(), 0);
    assert!(h.pool.is_empty());
}

#[tokio::test]
async fn test_create_flow_validates_request() {
    let h = default_harness();
    let err = h
        .engine
        .create_flow(&NewFlow::new("discovery", "", "e1", "u1"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    let err = h
        .engine
        .create_flow(
            &NewFlow::new("discovery", "c1", "e1", "u1").with_configuration(json!([1, 2])),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    let record = h
        .engine
        .create_flow(
            &NewFlow::new("discovery", "c1", "e1", "u1")
                .with_configuration(json!({"source": "cmdb"})),
        )
        .await
        .unwrap();
    assert_eq!(record.master.lifecycle_status, LifecycleStatus::Initialized);
    assert_eq!(record.master.configuration["source"], "cmdb");
    assert_eq!(record.child.current_phase(), "init");
}

// =========================================
// Lifecycle operations
// =========================================

#[tokio::test]
async fn test_pause_blocks_advance_until_resume() {
    let h = default_harness();
    let flow_id = create(&h, "discovery", "c1", "e1").await;
    h.engine.advance(flow_id).await.unwrap();

    let status = h.engine.pause(flow_id).await.unwrap();
    assert_eq!(status.lifecycle_status, LifecycleStatus::Paused);
    assert!(matches!(
        h.engine.advance(flow_id).await,
        Err(EngineError::FlowNotRunnable {
            status: LifecycleStatus::Paused,
            ..
        })
    ));

    let status = h.engine.resume(flow_id).await.unwrap();
    assert_eq!(status.lifecycle_status, LifecycleStatus::Running);
    assert_eq!(status.current_phase, "map");
    h.engine.advance(flow_id).await.unwrap();
}

#[tokio::test]
async fn test_lifecycle_operations_validate_current_state() {
    let h = default_harness();
    let flow_id = create(&h, "discovery", "c1", "e1").await;
    h.engine.advance(flow_id).await.unwrap();

    assert!(matches!(
        h.engine.resume(flow_id).await,
        Err(EngineError::InvalidTransition {
            from: LifecycleStatus::Running,
            to: LifecycleStatus::Running,
            ..
        })
    ));
    assert!(matches!(
        h.engine.recover(flow_id).await,
        Err(EngineError::InvalidTransition { .. })
    ));

    h.engine.pause(flow_id).await.unwrap();
    assert!(matches!(
        h.engine.pause(flow_id).await,
        Err(EngineError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_soft_delete_hides_flow_and_purge_removes_it() {
    let h = default_harness();
    let flow_id = create(&h, "discovery", "c1", "e1").await;

    h.engine.soft_delete(flow_id).await.unwrap();
    assert!(matches!(
        h.engine.get_status(flow_id).await,
        Err(EngineError::FlowNotFound { .. })
    ));
    assert!(matches!(
        h.engine.advance(flow_id).await,
        Err(EngineError::FlowNotFound { .. })
    ));
    assert!(
        h.engine
            .list_flows(&FlowFilter::for_tenant("c1", "e1"))
            .await
            .unwrap()
            .is_empty()
    );

    h.engine.purge(flow_id).await.unwrap();
    assert!(matches!(
        h.engine.purge(flow_id).await,
        Err(EngineError::FlowNotFound { .. })
    ));
}

// =========================================
// Tenancy
// =========================================

#[tokio::test]
async fn test_tenants_are_isolated() {
    let h = default_harness();
    let a1 = create(&h, "discovery", "client-a", "eng-1").await;
    let a2 = create(&h, "discovery", "client-a", "eng-1").await;
    let b1 = create(&h, "discovery", "client-b", "eng-1").await;
    let a_intake = create(&h, "intake", "client-a", "eng-1").await;

    let worker_a1 = h.engine.advance(a1).await.unwrap().worker_id;
    let worker_a2 = h.engine.advance(a2).await.unwrap().worker_id;
    let worker_b1 = h.engine.advance(b1).await.unwrap().worker_id;
    let worker_intake = h.engine.advance(a_intake).await.unwrap().worker_id;
    assert_eq!(worker_a1, worker_a2);
    assert_ne!(worker_a1, worker_b1);
    assert_ne!(worker_a1, worker_intake);
    assert_eq!(h.pool.len(), 3);

    let listed = h
        .engine
        .list_flows(&FlowFilter::for_tenant("client-a", "eng-1"))
        .await
        .unwrap();
    let ids: Vec<Uuid> = listed.iter().map(|s| s.flow_id).collect();
    assert_eq!(ids.len(), 3);
    assert!(!ids.contains(&b1));

    let mut filter = FlowFilter::for_tenant("client-a", "eng-1");
    filter.flow_type = Some("intake".to_string());
    let listed = h.engine.list_flows(&filter).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].flow_id, a_intake);

    let err = h
        .engine
        .list_flows(&FlowFilter::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_worker_session_persists_across_phases() {
    let mut handlers = PhaseHandlers::new();
    handlers.register_type(
        "discovery",
        handler_fn(|ctx| {
            let seen = ctx
                .session
                .memory
                .get("phases_seen")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            ctx.session
                .memory
                .insert("phases_seen".to_string(), json!(seen + 1));
            Ok(PhaseDecision::proceed())
        }),
    );
    let h = harness(handlers);
    let flow_id = create(&h, "discovery", "c1", "e1").await;
    h.engine.advance(flow_id).await.unwrap();
    h.engine.advance(flow_id).await.unwrap();

    let worker = h.pool.acquire("c1", "e1", "discovery");
    let session = worker.session().await;
    assert_eq!(session.memory["phases_seen"], json!(2));
}

// =========================================
// Invariant under random operation sequences
// =========================================

/// Deterministic xorshift so failures reproduce.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

async fn check_invariant_under_random_operations(store: Arc<dyn FlowStore>, seed: u64) {
    let decisions = Arc::new(AtomicU64::new(seed));
    let source = Arc::clone(&decisions);
    let mut handlers = PhaseHandlers::new();
    handlers.register_type(
        "discovery",
        handler_fn(move |_| {
            let n = source.fetch_add(1, Ordering::SeqCst);
            match n % 7 {
                0 => Ok(PhaseDecision::skip("not applicable")),
                1 => Ok(PhaseDecision::fail("invalid payload")),
                2 => Err(HandlerError::Recoverable("rate limit".to_string())),
                _ => Ok(PhaseDecision::proceed()),
            }
        }),
    );
    let h = harness_with_store(store, handlers);
    let phases = ["init", "map", "complete"];

    let mut flows = Vec::new();
    for i in 0..4 {
        flows.push(create(&h, "discovery", "c1", &format!("e{}", i % 2)).await);
    }

    let mut rng = Rng(seed | 1);
    for _ in 0..120 {
        let flow_id = flows[rng.below(flows.len() as u64) as usize];
        let result = match rng.below(10) {
            0..=4 => h.engine.advance(flow_id).await.map(|_| ()),
            5 => {
                let target = phases[rng.below(3) as usize];
                h.engine
                    .advance_phase(flow_id, Some(target), Map::new())
                    .await
                    .map(|_| ())
            }
            6 => h.engine.pause(flow_id).await.map(|_| ()),
            7 => h.engine.resume(flow_id).await.map(|_| ()),
            8 => h.engine.recover(flow_id).await.map(|_| ()),
            _ => {
                if rng.below(4) == 0 {
                    h.engine.cancel(flow_id).await.map(|_| ())
                } else {
                    Ok(())
                }
            }
        };
        if let Err(err) = result {
            assert!(
                matches!(
                    err,
                    EngineError::FlowTerminal { .. }
                        | EngineError::FlowNotRunnable { .. }
                        | EngineError::InvalidTransition { .. }
                ),
                "unexpected error: {err:?}"
            );
        }

        for &id in &flows {
            let master = h.store.load_master(id).await.unwrap().unwrap();
            let child = h.store.load_child(id).await.unwrap().unwrap();
            assert_eq!(child.current_phase(), child.phase_state().current_phase());
            assert!(phases.contains(&child.current_phase()));
            if master.lifecycle_status == LifecycleStatus::Completed {
                assert_eq!(child.current_phase(), "complete");
            }
        }
        assert_eq!(h.locks.active_leases(), 0);
    }
}

#[tokio::test]
async fn test_invariant_holds_with_memory_store() {
    for seed in [3, 17, 9001] {
        check_invariant_under_random_operations(Arc::new(MemoryFlowStore::new()), seed).await;
    }
}

#[tokio::test]
async fn test_invariant_holds_with_sqlite_store() {
    for seed in [5, 42] {
        check_invariant_under_random_operations(sqlite_store(), seed).await;
    }
}

#[tokio::test]
async fn test_sqlite_store_runs_full_flow() {
    let h = harness_with_store(sqlite_store(), PhaseHandlers::with_default_transitions());
    let flow_id = create(&h, "intake", "c1", "e1").await;

    let mut last = None;
    for _ in 0..3 {
        last = Some(h.engine.advance(flow_id).await.unwrap());
    }
    let last = last.unwrap();
    assert_eq!(last.kind, OutcomeKind::Completed);
    assert_eq!(last.current_phase, "done");

    let record = h.engine.get_flow(flow_id).await.unwrap();
    assert_eq!(record.master.lifecycle_status, LifecycleStatus::Completed);
    assert_eq!(
        record.child.phase_state().completed_phases(),
        ["load", "map", "done"].map(String::from)
    );
    assert_eq!(record.master.execution_metadata.worker_ids().len(), 1);
}

// =========================================
// Lease expiry and overlapping runs
// =========================================

async fn check_handler_outliving_ttl_keeps_phase_exclusive(
    store: Arc<dyn FlowStore>,
    locks: Arc<dyn PhaseLockManager>,
) {
    let runs = Arc::new(AtomicU32::new(0));
    let mut handlers = PhaseHandlers::with_default_transitions();
    handlers.register_phase(
        "discovery",
        "init",
        Arc::new(SlowHandler {
            delay: Duration::from_millis(150),
            runs: Arc::clone(&runs),
        }),
    );
    let engine = Arc::new(
        PhaseExecutionEngine::new(
            registry(),
            Arc::clone(&store),
            locks,
            Arc::new(TenantWorkerPool::new(Duration::from_secs(60))),
            handlers,
        )
        .with_retry_policy(fast_retry(0)),
    );
    let flow_id = engine
        .create_flow(&NewFlow::new("discovery", "c1", "e1", "u1"))
        .await
        .unwrap()
        .master
        .flow_id;

    let first = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.advance_phase(flow_id, Some("init"), Map::new()).await })
    };

    // Well past the 50ms TTL, while the first handler still sleeps.
    tokio::time::sleep(Duration::from_millis(80)).await;
    let second = engine.advance_phase(flow_id, Some("init"), Map::new()).await;
    assert!(
        matches!(second, Err(EngineError::PhaseAlreadyRunning { .. })),
        "got {second:?}"
    );

    let outcome = first.await.unwrap().unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Advanced);
    assert_eq!(outcome.current_phase, "map");
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let master = store.load_master(flow_id).await.unwrap().unwrap();
    assert_eq!(master.execution_metadata.phase_runs.len(), 1);
}

#[tokio::test]
async fn test_handler_outliving_memory_lease_ttl_keeps_phase_exclusive() {
    let locks: Arc<dyn PhaseLockManager> =
        Arc::new(MemoryPhaseLockManager::new(Duration::from_millis(50)));
    check_handler_outliving_ttl_keeps_phase_exclusive(Arc::new(MemoryFlowStore::new()), locks)
        .await;
}

#[tokio::test]
async fn test_handler_outliving_sqlite_lease_ttl_keeps_phase_exclusive() {
    let store = SqliteFlowStore::open_in_memory(&registry()).unwrap();
    let locks: Arc<dyn PhaseLockManager> = Arc::new(SqlitePhaseLockManager::new(
        store.handle(),
        Duration::from_millis(50),
    ));
    check_handler_outliving_ttl_keeps_phase_exclusive(Arc::new(store), locks).await;
}

#[tokio::test]
async fn test_stale_lease_holder_neither_commits_nor_releases_successor() {
    let (gated, started, release) = GatedHandler::new();
    let mut handlers = PhaseHandlers::with_default_transitions();
    handlers.register_phase("discovery", "init", gated);
    let h = harness(handlers);
    let flow_id = create(&h, "discovery", "c1", "e1").await;

    let engine = Arc::clone(&h.engine);
    let stale = tokio::spawn(async move { engine.advance(flow_id).await });
    started.notified().await;

    // The running call stalls past its TTL and another orchestrator takes over.
    h.locks.force_expire(flow_id, "init");
    let successor = h.locks.try_acquire(flow_id, "init").await.unwrap().unwrap();

    release.notify_one();
    let err = stale.await.unwrap().unwrap_err();
    assert!(
        matches!(err, EngineError::Lock(LockError::LeaseLost { .. })),
        "got {err:?}"
    );
    assert!(err.is_retryable());

    // Nothing was committed.
    let record = h.engine.get_flow(flow_id).await.unwrap();
    assert_eq!(record.child.current_phase(), "init");
    assert!(record.master.execution_metadata.phase_runs.is_empty());

    // The successor's lease survived the stale release.
    assert_eq!(h.locks.lease(flow_id, "init").unwrap().token, successor);
    assert!(matches!(
        h.engine.advance(flow_id).await,
        Err(EngineError::PhaseAlreadyRunning { .. })
    ));
    assert!(h.locks.release(flow_id, "init", successor).await.unwrap());
    release.notify_one();
    assert_eq!(h.engine.advance(flow_id).await.unwrap().current_phase, "map");
}

#[tokio::test]
async fn test_failed_target_phase_does_not_roll_back_concurrent_advance() {
    let attempted = Arc::new(Notify::new());
    let signal = Arc::clone(&attempted);
    let mut handlers = PhaseHandlers::with_default_transitions();
    handlers.register_phase(
        "discovery",
        "complete",
        handler_fn(move |_| {
            signal.notify_one();
            Err(HandlerError::Recoverable("connection reset".to_string()))
        }),
    );
    let h = harness_with_retry(Arc::new(MemoryFlowStore::new()), handlers, slow_retry());
    let flow_id = create(&h, "discovery", "c1", "e1").await;

    let engine = Arc::clone(&h.engine);
    let targeted =
        tokio::spawn(async move { engine.advance_phase(flow_id, Some("complete"), Map::new()).await });
    attempted.notified().await;

    // Runs during the targeted call's backoff.
    let advanced = h.engine.advance(flow_id).await.unwrap();
    assert_eq!(advanced.executed_phase, "init");
    assert_eq!(advanced.current_phase, "map");

    let outcome = targeted.await.unwrap().unwrap();
    assert!(matches!(outcome.kind, OutcomeKind::RetryScheduled { .. }));
    assert_eq!(outcome.current_phase, "map");
    assert_eq!(outcome.lifecycle_status, LifecycleStatus::Running);

    let record = h.engine.get_flow(flow_id).await.unwrap();
    assert_eq!(record.child.current_phase(), "map");
    assert_eq!(record.child.phase_state().current_phase(), "map");
    let last = record.master.execution_metadata.last_run().unwrap();
    assert_eq!(last.phase, "complete");
    assert_eq!(last.next_phase, "map");
}

#[tokio::test]
async fn test_continue_from_stale_read_is_recorded_without_moving_flow() {
    let first_attempt = Arc::new(Notify::new());
    let mut handlers = PhaseHandlers::with_default_transitions();
    handlers.register_phase(
        "discovery",
        "complete",
        Arc::new(FlakyOnceHandler {
            first_attempt: Arc::clone(&first_attempt),
        }),
    );
    let h = harness_with_retry(Arc::new(MemoryFlowStore::new()), handlers, slow_retry());
    let flow_id = create(&h, "discovery", "c1", "e1").await;

    let engine = Arc::clone(&h.engine);
    let targeted =
        tokio::spawn(async move { engine.advance_phase(flow_id, Some("complete"), Map::new()).await });
    first_attempt.notified().await;

    assert_eq!(h.engine.advance(flow_id).await.unwrap().current_phase, "map");

    let outcome = targeted.await.unwrap().unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Superseded);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.current_phase, "map");
    assert_eq!(outcome.lifecycle_status, LifecycleStatus::Running);

    let record = h.engine.get_flow(flow_id).await.unwrap();
    assert_eq!(record.child.current_phase(), "map");
    assert!(
        record
            .child
            .phase_state()
            .completed_phases()
            .contains(&"complete".to_string())
    );
    let last = record.master.execution_metadata.last_run().unwrap();
    assert_eq!(last.outcome, RunOutcome::Superseded);
    assert!(record.master.execution_metadata.completed_at.is_none());

    // The flow carries on from where the other call left it.
    let next = h.engine.advance(flow_id).await.unwrap();
    assert_eq!(next.executed_phase, "map");
    assert_eq!(next.current_phase, "complete");
}

#[tokio::test]
async fn test_concurrent_failure_is_not_undone_by_later_commit() {
    let first_attempt = Arc::new(Notify::new());
    let mut handlers = PhaseHandlers::with_default_transitions();
    handlers.register_phase(
        "discovery",
        "map",
        Arc::new(FlakyOnceHandler {
            first_attempt: Arc::clone(&first_attempt),
        }),
    );
    handlers.register_phase(
        "discovery",
        "init",
        handler_fn(|_| Ok(PhaseDecision::fail("schema invalid"))),
    );
    let h = harness_with_retry(Arc::new(MemoryFlowStore::new()), handlers, slow_retry());
    let flow_id = create(&h, "discovery", "c1", "e1").await;

    let engine = Arc::clone(&h.engine);
    let targeted =
        tokio::spawn(async move { engine.advance_phase(flow_id, Some("map"), Map::new()).await });
    first_attempt.notified().await;

    let failed = h.engine.advance(flow_id).await.unwrap();
    assert!(matches!(failed.kind, OutcomeKind::Failed { .. }));
    assert_eq!(failed.lifecycle_status, LifecycleStatus::Failed);

    let outcome = targeted.await.unwrap().unwrap();
    assert_eq!(outcome.lifecycle_status, LifecycleStatus::Failed);

    let status = h.engine.get_status(flow_id).await.unwrap();
    assert_eq!(status.lifecycle_status, LifecycleStatus::Failed);
    assert!(matches!(
        h.engine.advance(flow_id).await,
        Err(EngineError::FlowNotRunnable { .. })
    ));
    assert_eq!(
        h.engine.recover(flow_id).await.unwrap().lifecycle_status,
        LifecycleStatus::Running
    );
}
