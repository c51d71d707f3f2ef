use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::lifecycle::LifecycleStatus;
use super::state::{PhaseState, PhaseTransition};
use crate::errors::StoreError;

/// The `(client_account_id, engagement_id)` pair isolating tenant data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantScope {
    pub client_account_id: String,
    pub engagement_id: String,
}

impl TenantScope {
    pub fn new(client_account_id: &str, engagement_id: &str) -> Self {
        Self {
            client_account_id: client_account_id.to_string(),
            engagement_id: engagement_id.to_string(),
        }
    }
}

/// Request to start a new workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFlow {
    pub flow_type: String,
    pub client_account_id: String,
    pub engagement_id: String,
    pub user_id: String,
    #[serde(default)]
    pub configuration: Value,
}

impl NewFlow {
    pub fn new(flow_type: &str, client_account_id: &str, engagement_id: &str, user_id: &str) -> Self {
        Self {
            flow_type: flow_type.to_string(),
            client_account_id: client_account_id.to_string(),
            engagement_id: engagement_id.to_string(),
            user_id: user_id.to_string(),
            configuration: Value::Object(Default::default()),
        }
    }

    pub fn with_configuration(mut self, configuration: Value) -> Self {
        self.configuration = configuration;
        self
    }
}

/// How a single phase run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Continued,
    Skipped,
    Completed,
    RetryScheduled,
    Failed,
    /// The run finished after another commit had moved the flow; its result
    /// was recorded without moving the flow again.
    Superseded,
}

/// Timing and outcome of one phase run, appended to execution metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRunRecord {
    pub phase: String,
    pub next_phase: String,
    pub outcome: RunOutcome,
    pub attempts: u32,
    pub worker_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Last error recorded against a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub phase: String,
    pub message: String,
    pub recoverable: bool,
    pub at: DateTime<Utc>,
}

/// Execution metadata accumulated on the master flow as phases run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    #[serde(default)]
    pub phase_runs: Vec<PhaseRunRecord>,
    /// Extra handler attempts per phase beyond the first.
    #[serde(default)]
    pub retry_counts: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionMetadata {
    pub fn record(&mut self, run: PhaseRunRecord) {
        if self.started_at.is_none() {
            self.started_at = Some(run.started_at);
        }
        if run.attempts > 1 {
            *self.retry_counts.entry(run.phase.clone()).or_insert(0) += run.attempts - 1;
        }
        if let Some(message) = &run.error {
            self.last_error = Some(ErrorRecord {
                phase: run.phase.clone(),
                message: message.clone(),
                recoverable: run.outcome == RunOutcome::RetryScheduled,
                at: run.finished_at,
            });
        }
        if run.outcome == RunOutcome::Completed {
            self.completed_at = Some(run.finished_at);
        }
        self.phase_runs.push(run);
    }

    pub fn last_run(&self) -> Option<&PhaseRunRecord> {
        self.phase_runs.last()
    }

    pub fn runs_for<'a>(&'a self, phase: &'a str) -> impl Iterator<Item = &'a PhaseRunRecord> {
        self.phase_runs.iter().filter(move |r| r.phase == phase)
    }

    pub fn worker_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = Vec::new();
        for run in &self.phase_runs {
            if !ids.contains(&run.worker_id) {
                ids.push(run.worker_id);
            }
        }
        ids
    }
}

/// Tenant-scoped, type-agnostic envelope of a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterFlow {
    pub flow_id: Uuid,
    pub flow_type: String,
    pub lifecycle_status: LifecycleStatus,
    pub configuration: Value,
    pub execution_metadata: ExecutionMetadata,
    pub client_account_id: String,
    pub engagement_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MasterFlow {
    pub fn new(request: &NewFlow) -> Self {
        let now = Utc::now();
        Self {
            flow_id: Uuid::new_v4(),
            flow_type: request.flow_type.clone(),
            lifecycle_status: LifecycleStatus::Initialized,
            configuration: request.configuration.clone(),
            execution_metadata: ExecutionMetadata::default(),
            client_account_id: request.client_account_id.clone(),
            engagement_id: request.engagement_id.clone(),
            user_id: request.user_id.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn tenant(&self) -> TenantScope {
        TenantScope::new(&self.client_account_id, &self.engagement_id)
    }
}

/// Type-specific operational record of a workflow run.
///
/// `current_phase` and `phase_state.current_phase` are private and only move
/// together through [`ChildFlow::apply`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChildFlow {
    id: i64,
    flow_id: Uuid,
    flow_type: String,
    client_account_id: String,
    engagement_id: String,
    current_phase: String,
    phase_state: PhaseState,
    deleted: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ChildFlow {
    /// Fresh child record positioned on the flow type's initial phase.
    pub fn new(master: &MasterFlow, initial_phase: &str) -> Self {
        Self {
            id: 0,
            flow_id: master.flow_id,
            flow_type: master.flow_type.clone(),
            client_account_id: master.client_account_id.clone(),
            engagement_id: master.engagement_id.clone(),
            current_phase: initial_phase.to_string(),
            phase_state: PhaseState::new(initial_phase),
            deleted: false,
            created_at: master.created_at,
            updated_at: master.created_at,
        }
    }

    /// Rebuild a child record from persisted columns, rejecting rows whose two
    /// phase fields disagree.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        id: i64,
        flow_id: Uuid,
        flow_type: String,
        client_account_id: String,
        engagement_id: String,
        current_phase: String,
        phase_state: PhaseState,
        deleted: bool,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        if current_phase != phase_state.current_phase() {
            return Err(StoreError::PhaseStateDiverged {
                flow_id,
                column: current_phase,
                document: phase_state.current_phase().to_string(),
            });
        }
        Ok(Self {
            id,
            flow_id,
            flow_type,
            client_account_id,
            engagement_id,
            current_phase,
            phase_state,
            deleted,
            created_at,
            updated_at,
        })
    }

    /// The single writer of both phase fields.
    pub(crate) fn apply(&mut self, transition: &PhaseTransition, at: DateTime<Utc>) {
        self.phase_state.apply(transition);
        self.current_phase = self.phase_state.current_phase().to_string();
        self.updated_at = at;
    }

    /// Record a run whose move was overtaken by another commit: artifacts and
    /// phase bookkeeping land, both phase fields stay put.
    pub(crate) fn record_superseded(&mut self, transition: &PhaseTransition, at: DateTime<Utc>) {
        self.phase_state.record(transition);
        self.updated_at = at;
    }

    pub(crate) fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    pub(crate) fn mark_deleted(&mut self, at: DateTime<Utc>) {
        self.deleted = true;
        self.updated_at = at;
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn flow_id(&self) -> Uuid {
        self.flow_id
    }

    pub fn flow_type(&self) -> &str {
        &self.flow_type
    }

    pub fn tenant(&self) -> TenantScope {
        TenantScope::new(&self.client_account_id, &self.engagement_id)
    }

    pub fn current_phase(&self) -> &str {
        &self.current_phase
    }

    pub fn phase_state(&self) -> &PhaseState {
        &self.phase_state
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

/// Compact view returned by `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStatus {
    pub flow_id: Uuid,
    pub flow_type: String,
    pub lifecycle_status: LifecycleStatus,
    pub current_phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl FlowStatus {
    pub fn from_records(master: &MasterFlow, child: &ChildFlow) -> Self {
        Self {
            flow_id: master.flow_id,
            flow_type: master.flow_type.clone(),
            lifecycle_status: master.lifecycle_status,
            current_phase: child.current_phase().to_string(),
            last_error: master
                .execution_metadata
                .last_error
                .as_ref()
                .map(|e| e.message.clone()),
        }
    }
}

/// Tenant-scoped listing filter. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowFilter {
    pub client_account_id: Option<String>,
    pub engagement_id: Option<String>,
    pub flow_type: Option<String>,
    pub lifecycle_status: Option<LifecycleStatus>,
}

impl FlowFilter {
    pub fn for_tenant(client_account_id: &str, engagement_id: &str) -> Self {
        Self {
            client_account_id: Some(client_account_id.to_string()),
            engagement_id: Some(engagement_id.to_string()),
            ..Default::default()
        }
    }

    pub fn matches(&self, master: &MasterFlow) -> bool {
        self.client_account_id
            .as_deref()
            .is_none_or(|c| c == master.client_account_id)
            && self
                .engagement_id
                .as_deref()
                .is_none_or(|e| e == master.engagement_id)
            && self.flow_type.as_deref().is_none_or(|t| t == master.flow_type)
            && self
                .lifecycle_status
                .is_none_or(|s| s == master.lifecycle_status)
    }
}
