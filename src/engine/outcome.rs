use serde::Serialize;
use uuid::Uuid;

use crate::flow::{ChildFlow, LifecycleStatus, MasterFlow};

/// How an advance call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomeKind {
    /// The flow moved to another phase.
    Advanced,
    Skipped { reason: String },
    /// The executed phase resolved to terminal; the flow is completed.
    Completed,
    /// Recoverable failure after exhausting in-call retries. The phase is
    /// unchanged and the flow can be advanced again later.
    RetryScheduled { reason: String },
    /// Non-recoverable failure; the flow is failed until recovered.
    Failed { error: String },
    /// Another call moved the flow while this phase ran. The run's artifacts
    /// were recorded; the flow stays on the phase the other call chose.
    Superseded,
}

/// Structured result of [`advance_phase`](super::PhaseExecutionEngine::advance_phase).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseOutcome {
    pub flow_id: Uuid,
    pub executed_phase: String,
    /// Phase the flow rests on after the commit.
    pub current_phase: String,
    /// Lifecycle as committed, which may be a cancel or pause requested while
    /// the handler ran.
    pub lifecycle_status: LifecycleStatus,
    #[serde(flatten)]
    pub kind: OutcomeKind,
    pub attempts: u32,
    pub worker_id: Uuid,
    pub duration_ms: u64,
}

impl PhaseOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self.kind,
            OutcomeKind::Advanced | OutcomeKind::Skipped { .. } | OutcomeKind::Completed
        )
    }
}

/// Both records of a flow, as returned by `get_flow` and `create_flow`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowRecord {
    pub master: MasterFlow,
    pub child: ChildFlow,
}
