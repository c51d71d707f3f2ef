//! The `phase_state` document carried by every child flow.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How a committed phase run moved the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// The phase produced artifacts and handed over to the next phase.
    Continue,
    /// The phase was skipped; no artifacts were produced.
    Skip,
    /// The flow stays on the executed phase (deferred retry or failure).
    Stay,
    /// The executed phase was terminal; the flow rests on it.
    Complete,
}

/// A single phase movement, applied to `PhaseState` by the commit path only.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseTransition {
    pub executed_phase: String,
    pub next_phase: String,
    pub kind: TransitionKind,
    pub artifacts: Map<String, Value>,
    pub reason: Option<String>,
}

/// Structured phase state. Its `current_phase` duplicates the child flow's
/// flat column; both are only ever written together by `ChildFlow::apply`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    current_phase: String,
    #[serde(default)]
    artifacts: Map<String, Value>,
    #[serde(default)]
    completed_phases: Vec<String>,
    #[serde(default)]
    skipped_phases: Vec<SkippedPhase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedPhase {
    pub phase: String,
    pub reason: String,
}

impl PhaseState {
    pub(crate) fn new(initial_phase: &str) -> Self {
        Self {
            current_phase: initial_phase.to_string(),
            artifacts: Map::new(),
            completed_phases: Vec::new(),
            skipped_phases: Vec::new(),
        }
    }

    pub fn current_phase(&self) -> &str {
        &self.current_phase
    }

    pub fn artifacts(&self) -> &Map<String, Value> {
        &self.artifacts
    }

    pub fn completed_phases(&self) -> &[String] {
        &self.completed_phases
    }

    pub fn skipped_phases(&self) -> &[SkippedPhase] {
        &self.skipped_phases
    }

    /// Handler input: persisted artifacts with caller overrides layered on top.
    pub fn build_input(&self, overrides: &Map<String, Value>) -> Map<String, Value> {
        let mut input = self.artifacts.clone();
        merge_json(&mut input, overrides);
        input
    }

    /// Record the run and move to `next_phase`. A `Stay` transition never
    /// moves the flow: the phase stored at commit time is kept, whatever the
    /// run saw when it started.
    pub(crate) fn apply(&mut self, transition: &PhaseTransition) {
        self.record(transition);
        if transition.kind != TransitionKind::Stay {
            self.current_phase = transition.next_phase.clone();
        }
    }

    /// Merge the run's artifacts and note the phase as completed or skipped,
    /// leaving `current_phase` alone.
    pub(crate) fn record(&mut self, transition: &PhaseTransition) {
        merge_json(&mut self.artifacts, &transition.artifacts);
        match transition.kind {
            TransitionKind::Continue | TransitionKind::Complete => {
                if !self.completed_phases.contains(&transition.executed_phase) {
                    self.completed_phases.push(transition.executed_phase.clone());
                }
            }
            TransitionKind::Skip => self.skipped_phases.push(SkippedPhase {
                phase: transition.executed_phase.clone(),
                reason: transition.reason.clone().unwrap_or_default(),
            }),
            TransitionKind::Stay => {}
        }
    }
}

/// Deep-merge `delta` into `target`: nested objects merge key by key, any
/// other value replaces what was there.
pub fn merge_json(target: &mut Map<String, Value>, delta: &Map<String, Value>) {
    for (key, value) in delta {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_json(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}
