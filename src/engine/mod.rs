//! Phase execution engine.
//!
//! `advance_phase` runs the orchestration algorithm: load the flow, check the
//! registry, take the `(flow_id, phase)` lease, borrow a tenant worker, invoke
//! the phase handler with bounded retries, commit the result in one store
//! transaction, release the lease. Handler failures never escape as errors;
//! they are committed and reported through [`PhaseOutcome`].

pub mod handler;
pub mod outcome;
pub mod retry;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use serde_json::{Map, Value};
use tracing::instrument;
use uuid::Uuid;

pub use handler::{
    DefaultTransitionHandler, FnHandler, PhaseContext, PhaseDecision, PhaseHandler, PhaseHandlers,
    handler_fn,
};
pub use outcome::{FlowRecord, OutcomeKind, PhaseOutcome};
pub use retry::RetryPolicy;

use crate::errors::{EngineError, HandlerError};
use crate::flow::{
    ChildFlow, FlowFilter, FlowStatus, LifecycleStatus, MasterFlow, NewFlow, PhaseRunRecord,
    PhaseTransition, RunOutcome, TransitionKind,
};
use crate::lock::{PhaseLockGuard, PhaseLockManager};
use crate::pool::{TenantWorkerPool, Worker};
use crate::registry::{FlowTypeConfig, FlowTypeRegistry, PhaseDefinition};
use crate::store::{FlowStore, PhaseCommit};

pub struct PhaseExecutionEngine {
    registry: Arc<FlowTypeRegistry>,
    store: Arc<dyn FlowStore>,
    locks: Arc<dyn PhaseLockManager>,
    pool: Arc<TenantWorkerPool>,
    handlers: PhaseHandlers,
    retry: RetryPolicy,
}

/// What a finished handler run commits.
struct Resolution {
    transition: PhaseTransition,
    run_outcome: RunOutcome,
    lifecycle: LifecycleStatus,
    kind: OutcomeKind,
    reason: Option<String>,
    error: Option<String>,
}

impl PhaseExecutionEngine {
    pub fn new(
        registry: Arc<FlowTypeRegistry>,
        store: Arc<dyn FlowStore>,
        locks: Arc<dyn PhaseLockManager>,
        pool: Arc<TenantWorkerPool>,
        handlers: PhaseHandlers,
    ) -> Self {
        Self {
            registry,
            store,
            locks,
            pool,
            handlers,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &FlowTypeRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<TenantWorkerPool> {
        &self.pool
    }

    pub fn locks(&self) -> &Arc<dyn PhaseLockManager> {
        &self.locks
    }

    // ── Flow records ────────────────────────────────────────────────────

    /// Create the master and child records of a new flow, positioned on the
    /// flow type's initial phase.
    pub async fn create_flow(&self, request: &NewFlow) -> Result<FlowRecord, EngineError> {
        for (field, value) in [
            ("client_account_id", &request.client_account_id),
            ("engagement_id", &request.engagement_id),
            ("user_id", &request.user_id),
        ] {
            if value.trim().is_empty() {
                return Err(EngineError::InvalidRequest(format!("{} is required", field)));
            }
        }
        if !(request.configuration.is_object() || request.configuration.is_null()) {
            return Err(EngineError::InvalidRequest(
                "configuration must be a JSON object".to_string(),
            ));
        }

        let config = self.registry.get(&request.flow_type)?;
        let initial = config.initial_phase().ok_or_else(|| {
            EngineError::InvalidRequest(format!("flow type '{}' has no phases", config.name))
        })?;

        let mut request = request.clone();
        if request.configuration.is_null() {
            request.configuration = Value::Object(Map::new());
        }
        let master = MasterFlow::new(&request);
        let child = self
            .store
            .create_flow(&master, &ChildFlow::new(&master, initial))
            .await?;

        tracing::info!(
            flow_id = %master.flow_id,
            flow_type = %master.flow_type,
            client_account_id = %master.client_account_id,
            engagement_id = %master.engagement_id,
            initial_phase = initial,
            "flow created"
        );
        Ok(FlowRecord { master, child })
    }

    pub async fn get_status(&self, flow_id: Uuid) -> Result<FlowStatus, EngineError> {
        let master = self.load_master(flow_id).await?;
        let child = self.load_child(flow_id).await?;
        Ok(FlowStatus::from_records(&master, &child))
    }

    pub async fn get_flow(&self, flow_id: Uuid) -> Result<FlowRecord, EngineError> {
        let master = self.load_master(flow_id).await?;
        let child = self.load_child(flow_id).await?;
        Ok(FlowRecord { master, child })
    }

    /// Flows of one tenant. The filter must name both the client account and
    /// the engagement.
    pub async fn list_flows(&self, filter: &FlowFilter) -> Result<Vec<FlowStatus>, EngineError> {
        if filter.client_account_id.is_none() || filter.engagement_id.is_none() {
            return Err(EngineError::InvalidRequest(
                "listing flows requires client_account_id and engagement_id".to_string(),
            ));
        }
        let masters = self.store.list_masters(filter).await?;
        let mut statuses = Vec::with_capacity(masters.len());
        for master in masters {
            // A flow deleted between the two reads is skipped.
            if let Some(child) = self.store.load_child(master.flow_id).await? {
                statuses.push(FlowStatus::from_records(&master, &child));
            }
        }
        Ok(statuses)
    }

    // ── Lifecycle operations ───────────────────────────────────────────

    pub async fn pause(&self, flow_id: Uuid) -> Result<FlowStatus, EngineError> {
        self.transition_lifecycle(flow_id, &[], LifecycleStatus::Paused)
            .await
    }

    /// Paused flows only.
    pub async fn resume(&self, flow_id: Uuid) -> Result<FlowStatus, EngineError> {
        self.transition_lifecycle(flow_id, &[LifecycleStatus::Paused], LifecycleStatus::Running)
            .await
    }

    /// Stops future advances. An in-flight handler is not interrupted; its
    /// commit still lands and the flow stays cancelled.
    pub async fn cancel(&self, flow_id: Uuid) -> Result<FlowStatus, EngineError> {
        self.transition_lifecycle(flow_id, &[], LifecycleStatus::Cancelled)
            .await
    }

    /// Put a failed flow back to running on its current phase.
    pub async fn recover(&self, flow_id: Uuid) -> Result<FlowStatus, EngineError> {
        self.transition_lifecycle(flow_id, &[LifecycleStatus::Failed], LifecycleStatus::Running)
            .await
    }

    async fn transition_lifecycle(
        &self,
        flow_id: Uuid,
        required: &[LifecycleStatus],
        next: LifecycleStatus,
    ) -> Result<FlowStatus, EngineError> {
        let current = self.load_master(flow_id).await?;
        if current.lifecycle_status.is_terminal() {
            return Err(EngineError::FlowTerminal {
                flow_id,
                status: current.lifecycle_status,
            });
        }
        if !required.is_empty() && !required.contains(&current.lifecycle_status) {
            return Err(EngineError::InvalidTransition {
                flow_id,
                from: current.lifecycle_status,
                to: next,
            });
        }
        let master = self.store.update_lifecycle(flow_id, next).await?;
        let child = self.load_child(flow_id).await?;
        tracing::info!(
            %flow_id,
            from = %current.lifecycle_status,
            to = %master.lifecycle_status,
            "lifecycle changed"
        );
        Ok(FlowStatus::from_records(&master, &child))
    }

    /// Hide a flow from every engine operation. The records stay in storage.
    pub async fn soft_delete(&self, flow_id: Uuid) -> Result<(), EngineError> {
        if !self.store.soft_delete(flow_id).await? {
            return Err(EngineError::FlowNotFound { flow_id });
        }
        tracing::info!(%flow_id, "flow soft-deleted");
        Ok(())
    }

    /// Remove both records permanently.
    pub async fn purge(&self, flow_id: Uuid) -> Result<(), EngineError> {
        if !self.store.purge(flow_id).await? {
            return Err(EngineError::FlowNotFound { flow_id });
        }
        tracing::info!(%flow_id, "flow purged");
        Ok(())
    }

    // ── Phase execution ────────────────────────────────────────────────

    /// Advance from the flow's current phase with no input overrides.
    pub async fn advance(&self, flow_id: Uuid) -> Result<PhaseOutcome, EngineError> {
        self.advance_phase(flow_id, None, Map::new()).await
    }

    /// Execute one phase of a flow and commit the result.
    ///
    /// `target_phase` defaults to the child's current phase. `overrides` are
    /// layered over the persisted artifacts for this run only.
    ///
    /// Errors are returned only for requests that could not run (unknown flow,
    /// terminal or paused lifecycle, contention, missing input, store or lock
    /// failures, a lease lost before commit); none of them mutate persisted
    /// state. Handler failures are committed and reported in the outcome.
    ///
    /// The lease is renewed while the handler runs. A failed run never moves
    /// the flow, and a run that would move it is recorded without moving when
    /// another call moved the flow first ([`OutcomeKind::Superseded`]).
    #[instrument(skip(self, overrides))]
    pub async fn advance_phase(
        &self,
        flow_id: Uuid,
        target_phase: Option<&str>,
        overrides: Map<String, Value>,
    ) -> Result<PhaseOutcome, EngineError> {
        let master = self.load_master(flow_id).await?;
        ensure_runnable(&master)?;
        let config = self.registry.get(&master.flow_type)?;

        let child = self.load_child(flow_id).await?;
        let phase = target_phase.unwrap_or(child.current_phase()).to_string();
        if !config.contains_phase(&phase) {
            return Err(EngineError::UnknownPhase {
                flow_type: config.name.clone(),
                phase,
            });
        }
        let handler =
            self.handlers
                .resolve(&config.name, &phase)
                .ok_or_else(|| EngineError::NoHandler {
                    flow_type: config.name.clone(),
                    phase: phase.clone(),
                })?;

        let Some(guard) = PhaseLockGuard::acquire(Arc::clone(&self.locks), flow_id, &phase).await?
        else {
            tracing::warn!(%flow_id, phase = %phase, "phase already running");
            return Err(EngineError::PhaseAlreadyRunning { flow_id, phase });
        };

        let result = self
            .run_locked(&guard, flow_id, &config, &phase, handler, &overrides)
            .await;

        if let Err(e) = guard.release().await {
            tracing::error!(%flow_id, phase = %phase, error = %e, "failed to release phase lock; lease will expire");
        }
        result
    }

    async fn run_locked(
        &self,
        guard: &PhaseLockGuard,
        flow_id: Uuid,
        config: &FlowTypeConfig,
        phase: &str,
        handler: Arc<dyn PhaseHandler>,
        overrides: &Map<String, Value>,
    ) -> Result<PhaseOutcome, EngineError> {
        // Reload under the lease: a call that held it before us may have
        // committed since the first read.
        let master = self.load_master(flow_id).await?;
        ensure_runnable(&master)?;
        let child = self.load_child(flow_id).await?;
        let definition = config
            .phase(phase)
            .ok_or_else(|| EngineError::UnknownPhase {
                flow_type: config.name.clone(),
                phase: phase.to_string(),
            })?;

        let input = child.phase_state().build_input(overrides);
        let missing = definition.missing_inputs(&input);
        if !missing.is_empty() {
            return Err(EngineError::MissingPhaseInput {
                phase: phase.to_string(),
                missing,
            });
        }

        let worker = self.pool.acquire(
            &master.client_account_id,
            &master.engagement_id,
            &master.flow_type,
        );
        let started_at = Utc::now();
        let clock = Instant::now();

        let (result, attempts) = self
            .invoke_with_retry(handler.as_ref(), &worker, &master, definition, &input)
            .await;
        let resolution = resolve(config, phase, result);

        let finished_at = Utc::now();
        let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
        let run = PhaseRunRecord {
            phase: phase.to_string(),
            next_phase: resolution.transition.next_phase.clone(),
            outcome: resolution.run_outcome,
            attempts,
            worker_id: worker.id(),
            started_at,
            finished_at,
            duration_ms,
            reason: resolution.reason.clone(),
            error: resolution.error.clone(),
        };

        // Commit only while the lease is still ours; a caller that took it
        // over after expiry may already be running this phase.
        guard.ensure_held().await?;

        let committed = self
            .store
            .commit_phase(PhaseCommit {
                flow_id,
                expected_phase: child.current_phase().to_string(),
                transition: resolution.transition,
                run,
                lifecycle: resolution.lifecycle,
            })
            .await?;

        let lifecycle_status = committed.master.lifecycle_status;
        if lifecycle_status != resolution.lifecycle {
            tracing::info!(
                %flow_id,
                phase,
                computed = %resolution.lifecycle,
                committed = %lifecycle_status,
                "lifecycle changed while the handler ran"
            );
        }

        let kind = if committed.superseded {
            OutcomeKind::Superseded
        } else {
            resolution.kind
        };
        let outcome = PhaseOutcome {
            flow_id,
            executed_phase: phase.to_string(),
            current_phase: committed.child.current_phase().to_string(),
            lifecycle_status,
            kind,
            attempts,
            worker_id: worker.id(),
            duration_ms,
        };
        log_outcome(&outcome);
        Ok(outcome)
    }

    /// Invoke the handler until it returns a usable decision, a fatal error,
    /// or the retry budget runs out. Returns the final result and the number
    /// of attempts made.
    async fn invoke_with_retry(
        &self,
        handler: &dyn PhaseHandler,
        worker: &Worker,
        master: &MasterFlow,
        definition: &PhaseDefinition,
        input: &Map<String, Value>,
    ) -> (Result<PhaseDecision, HandlerError>, u32) {
        let tenant = master.tenant();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = {
                let mut session = worker.session().await;
                let ctx = PhaseContext {
                    flow_id: master.flow_id,
                    flow_type: &master.flow_type,
                    phase: definition,
                    tenant: &tenant,
                    user_id: &master.user_id,
                    configuration: &master.configuration,
                    input,
                    attempt,
                    worker_id: worker.id(),
                    session: &mut session,
                };
                match AssertUnwindSafe(handler.handle(ctx)).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => Err(HandlerError::Fatal(format!(
                        "handler panicked: {}",
                        panic_message(panic.as_ref())
                    ))),
                }
            };

            let error = match result {
                Ok(PhaseDecision::Retry { reason }) => HandlerError::Recoverable(reason),
                Ok(PhaseDecision::Fail { error }) => HandlerError::classify(error),
                Ok(decision) => return (Ok(decision), attempt),
                Err(error) => error,
            };
            if !error.is_recoverable() || attempt >= self.retry.total_attempts() {
                return (Err(error), attempt);
            }

            let delay = self.retry.delay_for(attempt);
            tracing::warn!(
                flow_id = %master.flow_id,
                phase = %definition.name,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = error.message(),
                "recoverable handler failure; retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn load_master(&self, flow_id: Uuid) -> Result<MasterFlow, EngineError> {
        self.store
            .load_master(flow_id)
            .await?
            .ok_or(EngineError::FlowNotFound { flow_id })
    }

    async fn load_child(&self, flow_id: Uuid) -> Result<ChildFlow, EngineError> {
        self.store
            .load_child(flow_id)
            .await?
            .ok_or(EngineError::FlowNotFound { flow_id })
    }
}

fn ensure_runnable(master: &MasterFlow) -> Result<(), EngineError> {
    let status = master.lifecycle_status;
    if status.is_terminal() {
        return Err(EngineError::FlowTerminal {
            flow_id: master.flow_id,
            status,
        });
    }
    if !status.is_runnable() {
        return Err(EngineError::FlowNotRunnable {
            flow_id: master.flow_id,
            status,
        });
    }
    Ok(())
}

/// Turn the handler result into the transition, lifecycle and outcome to
/// commit.
///
/// An explicit `next_phase` wins over the registry default. No successor, or
/// a terminal phase pointing at itself, completes the flow. A successor
/// outside the flow type's phase list is a fatal handler error.
fn resolve(
    config: &FlowTypeConfig,
    phase: &str,
    result: Result<PhaseDecision, HandlerError>,
) -> Resolution {
    let (explicit_next, artifacts, skip_reason) = match result {
        Ok(PhaseDecision::Continue {
            next_phase,
            artifacts,
        }) => (next_phase, artifacts, None),
        Ok(PhaseDecision::Skip { next_phase, reason }) => (next_phase, Map::new(), Some(reason)),
        // Retry and Fail never reach here; invoke_with_retry converts them.
        Ok(PhaseDecision::Retry { reason }) => return stay(phase, HandlerError::Recoverable(reason)),
        Ok(PhaseDecision::Fail { error }) => return stay(phase, HandlerError::classify(error)),
        Err(error) => return stay(phase, error),
    };

    let next = explicit_next.or_else(|| config.default_next(phase).map(String::from));
    if let Some(next) = &next
        && !config.contains_phase(next)
    {
        return stay(
            phase,
            HandlerError::Fatal(format!(
                "next phase '{}' is not part of flow type '{}'",
                next, config.name
            )),
        );
    }

    if skip_reason.is_none()
        && let Some(definition) = config.phase(phase)
    {
        let missing = definition.missing_outputs(&artifacts);
        if !missing.is_empty() {
            tracing::warn!(phase, ?missing, "phase finished without declared outputs");
        }
    }

    let is_terminal = match &next {
        None => true,
        Some(next) => next == phase && config.is_terminal(phase),
    };

    if is_terminal {
        return Resolution {
            transition: PhaseTransition {
                executed_phase: phase.to_string(),
                next_phase: phase.to_string(),
                kind: if skip_reason.is_some() {
                    TransitionKind::Skip
                } else {
                    TransitionKind::Complete
                },
                artifacts,
                reason: skip_reason.clone(),
            },
            run_outcome: RunOutcome::Completed,
            lifecycle: LifecycleStatus::Completed,
            kind: OutcomeKind::Completed,
            reason: skip_reason,
            error: None,
        };
    }

    let next = next.unwrap_or_else(|| phase.to_string());
    match skip_reason {
        Some(reason) => Resolution {
            transition: PhaseTransition {
                executed_phase: phase.to_string(),
                next_phase: next,
                kind: TransitionKind::Skip,
                artifacts,
                reason: Some(reason.clone()),
            },
            run_outcome: RunOutcome::Skipped,
            lifecycle: LifecycleStatus::Running,
            kind: OutcomeKind::Skipped {
                reason: reason.clone(),
            },
            reason: Some(reason),
            error: None,
        },
        None => Resolution {
            transition: PhaseTransition {
                executed_phase: phase.to_string(),
                next_phase: next,
                kind: TransitionKind::Continue,
                artifacts,
                reason: None,
            },
            run_outcome: RunOutcome::Continued,
            lifecycle: LifecycleStatus::Running,
            kind: OutcomeKind::Advanced,
            reason: None,
            error: None,
        },
    }
}

/// Failed run: the flow stays on whatever phase is stored when the commit
/// lands, which is not necessarily the executed phase.
fn stay(phase: &str, error: HandlerError) -> Resolution {
    let transition = PhaseTransition {
        executed_phase: phase.to_string(),
        next_phase: phase.to_string(),
        kind: TransitionKind::Stay,
        artifacts: Map::new(),
        reason: None,
    };
    let message = error.message().to_string();
    if error.is_recoverable() {
        Resolution {
            transition,
            run_outcome: RunOutcome::RetryScheduled,
            lifecycle: LifecycleStatus::Running,
            kind: OutcomeKind::RetryScheduled {
                reason: message.clone(),
            },
            reason: None,
            error: Some(message),
        }
    } else {
        Resolution {
            transition,
            run_outcome: RunOutcome::Failed,
            lifecycle: LifecycleStatus::Failed,
            kind: OutcomeKind::Failed {
                error: message.clone(),
            },
            reason: None,
            error: Some(message),
        }
    }
}

fn log_outcome(outcome: &PhaseOutcome) {
    let flow_id = outcome.flow_id;
    let phase = outcome.executed_phase.as_str();
    match &outcome.kind {
        OutcomeKind::Advanced => tracing::info!(
            %flow_id, phase, next = %outcome.current_phase, attempts = outcome.attempts,
            duration_ms = outcome.duration_ms, "phase advanced"
        ),
        OutcomeKind::Skipped { reason } => tracing::info!(
            %flow_id, phase, next = %outcome.current_phase, reason = %reason, "phase skipped"
        ),
        OutcomeKind::Completed => tracing::info!(%flow_id, phase, "flow completed"),
        OutcomeKind::RetryScheduled { reason } => tracing::warn!(
            %flow_id, phase, attempts = outcome.attempts, reason = %reason,
            "phase retries exhausted; flow left on its current phase"
        ),
        OutcomeKind::Failed { error } => tracing::error!(
            %flow_id, phase, attempts = outcome.attempts, error = %error, "phase failed"
        ),
        OutcomeKind::Superseded => tracing::warn!(
            %flow_id, phase, current = %outcome.current_phase,
            "flow moved while the phase ran; result recorded in place"
        ),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
