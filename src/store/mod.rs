//! Master/child flow persistence.
//!
//! The engine talks to persistence only through [`FlowStore`]. Both
//! implementations make `commit_phase` the single writer of a child's
//! `current_phase` column and its `phase_state` document.

pub mod db;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use uuid::Uuid;

pub use db::{DbHandle, FlowDb};
pub use memory::MemoryFlowStore;
pub use sqlite::SqliteFlowStore;

use crate::errors::StoreError;
use crate::flow::{
    ChildFlow, FlowFilter, LifecycleStatus, MasterFlow, PhaseRunRecord, PhaseTransition, RunOutcome,
    TransitionKind,
};

/// Everything a finished phase run writes, applied in one transaction.
#[derive(Debug, Clone)]
pub struct PhaseCommit {
    pub flow_id: Uuid,
    /// Phase the flow was on when the run read it, before the handler ran.
    /// A moving transition only lands if the stored phase still matches.
    pub expected_phase: String,
    pub transition: PhaseTransition,
    pub run: PhaseRunRecord,
    /// Lifecycle computed by the engine. The stored value may override it
    /// (see [`LifecycleStatus::resolve_commit`]).
    pub lifecycle: LifecycleStatus,
}

/// Both records as they stand after a commit.
#[derive(Debug, Clone)]
pub struct CommitResult {
    pub master: MasterFlow,
    pub child: ChildFlow,
    /// Another commit moved the flow while this run was in flight; the run
    /// was recorded but the flow was not moved.
    pub superseded: bool,
}

#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Insert the master and child records together. Returns the child with
    /// its surrogate id assigned.
    async fn create_flow(&self, master: &MasterFlow, child: &ChildFlow)
    -> Result<ChildFlow, StoreError>;

    /// Soft-deleted flows are reported as absent.
    async fn load_master(&self, flow_id: Uuid) -> Result<Option<MasterFlow>, StoreError>;

    async fn load_child(&self, flow_id: Uuid) -> Result<Option<ChildFlow>, StoreError>;

    /// Apply a phase transition, append the run record and set the lifecycle,
    /// atomically.
    async fn commit_phase(&self, commit: PhaseCommit) -> Result<CommitResult, StoreError>;

    /// Move the lifecycle, rejecting transitions the state machine forbids.
    async fn update_lifecycle(
        &self,
        flow_id: Uuid,
        next: LifecycleStatus,
    ) -> Result<MasterFlow, StoreError>;

    /// Non-deleted master flows matching `filter`, oldest first.
    async fn list_masters(&self, filter: &FlowFilter) -> Result<Vec<MasterFlow>, StoreError>;

    /// Flag both records deleted. Returns false if the flow was absent.
    async fn soft_delete(&self, flow_id: Uuid) -> Result<bool, StoreError>;

    /// Remove the master record; the child goes with it.
    async fn purge(&self, flow_id: Uuid) -> Result<bool, StoreError>;
}

/// Apply a commit to loaded records. Shared by both store implementations so
/// the write path is identical. Returns whether the commit was superseded.
///
/// `Stay` keeps whatever phase is stored. A moving transition whose
/// `expected_phase` no longer matches the stored phase is superseded: its
/// artifacts and run record land, the flow stays where the newer commit put
/// it, and a computed completion falls back to `Running`.
///
/// The lifecycle goes through [`LifecycleStatus::resolve_commit`] rather than
/// the transition table: a flow paused or cancelled while its handler ran
/// still records the run.
pub(crate) fn apply_commit(
    master: &mut MasterFlow,
    child: &mut ChildFlow,
    mut commit: PhaseCommit,
) -> bool {
    let now = commit.run.finished_at;
    let superseded = commit.transition.kind != TransitionKind::Stay
        && child.current_phase() != commit.expected_phase;
    let mut lifecycle = commit.lifecycle;

    if superseded {
        tracing::warn!(
            flow_id = %commit.flow_id,
            phase = %commit.transition.executed_phase,
            expected = %commit.expected_phase,
            stored = child.current_phase(),
            "flow moved while the phase ran; recording without moving"
        );
        child.record_superseded(&commit.transition, now);
        commit.run.outcome = RunOutcome::Superseded;
        if lifecycle == LifecycleStatus::Completed {
            lifecycle = LifecycleStatus::Running;
        }
    } else {
        child.apply(&commit.transition, now);
    }

    commit.run.next_phase = child.current_phase().to_string();
    master.execution_metadata.record(commit.run);
    master.lifecycle_status = LifecycleStatus::resolve_commit(master.lifecycle_status, lifecycle);
    master.updated_at = now;
    superseded
}

/// Validate and apply a lifecycle change to a loaded master record.
pub(crate) fn apply_lifecycle(
    master: &mut MasterFlow,
    next: LifecycleStatus,
) -> Result<(), StoreError> {
    if !master.lifecycle_status.can_transition_to(next) {
        return Err(StoreError::InvalidTransition {
            flow_id: master.flow_id,
            from: master.lifecycle_status,
            to: next,
        });
    }
    master.lifecycle_status = next;
    master.updated_at = chrono::Utc::now();
    Ok(())
}
