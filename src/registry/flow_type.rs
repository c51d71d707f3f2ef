//! Flow type definitions: ordered phases, default transitions and per-phase
//! input/output contracts.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

use crate::errors::RegistryError;

/// Contract for a single phase of a flow type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    /// Phase identifier (e.g., "field_mapping")
    pub name: String,
    /// Human-readable name of the phase
    #[serde(default)]
    pub display_name: String,
    /// Artifact keys that must be present in the handler input
    #[serde(default)]
    pub required_inputs: Vec<String>,
    /// Artifact keys the phase is expected to produce
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl PhaseDefinition {
    pub fn new(name: &str, display_name: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            required_inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn requires(mut self, inputs: &[&str]) -> Self {
        self.required_inputs = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn produces(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Required inputs absent from `input`.
    pub fn missing_inputs(&self, input: &Map<String, Value>) -> Vec<String> {
        self.required_inputs
            .iter()
            .filter(|key| !input.contains_key(key.as_str()))
            .cloned()
            .collect()
    }

    /// Declared outputs absent from `artifacts`.
    pub fn missing_outputs(&self, artifacts: &Map<String, Value>) -> Vec<String> {
        self.outputs
            .iter()
            .filter(|key| !artifacts.contains_key(key.as_str()))
            .cloned()
            .collect()
    }
}

/// Static registry entry for one flow type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowTypeConfig {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// Ordered phase list; the first phase is where new flows start.
    pub phases: Vec<PhaseDefinition>,
    /// Default next phase for each phase.
    #[serde(default)]
    pub transitions: BTreeMap<String, String>,
    /// Phase whose completion completes the flow.
    pub terminal_phase: String,
    /// Table holding this type's child records.
    pub child_table: String,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl FlowTypeConfig {
    /// Linear flow type: each phase hands over to the next one in order and
    /// the last phase is terminal.
    pub fn sequential(name: &str, display_name: &str, phases: Vec<PhaseDefinition>) -> Self {
        let transitions = phases
            .windows(2)
            .map(|pair| (pair[0].name.clone(), pair[1].name.clone()))
            .collect();
        let terminal_phase = phases.last().map(|p| p.name.clone()).unwrap_or_default();
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            version: default_version(),
            phases,
            transitions,
            terminal_phase,
            child_table: format!("{}_flows", name),
        }
    }

    /// Linear flow type from bare phase names.
    pub fn from_phase_names(name: &str, phases: &[&str]) -> Self {
        let defs = phases
            .iter()
            .map(|p| PhaseDefinition::new(p, p))
            .collect();
        Self::sequential(name, name, defs)
    }

    pub fn with_transition(mut self, from: &str, to: &str) -> Self {
        self.transitions.insert(from.to_string(), to.to_string());
        self
    }

    pub fn initial_phase(&self) -> Option<&str> {
        self.phases.first().map(|p| p.name.as_str())
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn contains_phase(&self, name: &str) -> bool {
        self.phase(name).is_some()
    }

    pub fn is_terminal(&self, phase: &str) -> bool {
        self.terminal_phase == phase
    }

    /// Registry default successor, ignoring a terminal self-loop.
    pub fn default_next(&self, phase: &str) -> Option<&str> {
        self.transitions
            .get(phase)
            .map(String::as_str)
            .filter(|next| !(self.is_terminal(phase) && *next == phase))
    }

    pub fn phase_names(&self) -> Vec<&str> {
        self.phases.iter().map(|p| p.name.as_str()).collect()
    }

    /// Validate the phase graph.
    ///
    /// Rejects empty or duplicate phase lists, transitions that reference
    /// unknown phases, non-terminal phases without a successor, a terminal
    /// phase that hands over elsewhere, and phases that cannot reach the
    /// terminal phase by following default transitions.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let invalid = |message: String| RegistryError::InvalidPhaseGraph {
            flow_type: self.name.clone(),
            message,
        };

        if self.name.is_empty() || !is_identifier(&self.name) {
            return Err(invalid(format!(
                "flow type name '{}' must be lowercase alphanumeric or '_'",
                self.name
            )));
        }
        if !is_identifier(&self.child_table) {
            return Err(invalid(format!(
                "child table '{}' must be lowercase alphanumeric or '_'",
                self.child_table
            )));
        }
        if self.phases.is_empty() {
            return Err(invalid("no phases defined".to_string()));
        }

        let mut seen = HashSet::new();
        for phase in &self.phases {
            if phase.name.is_empty() {
                return Err(invalid("phase with empty name".to_string()));
            }
            if !seen.insert(phase.name.as_str()) {
                return Err(invalid(format!("duplicate phase '{}'", phase.name)));
            }
        }

        if !seen.contains(self.terminal_phase.as_str()) {
            return Err(invalid(format!(
                "terminal phase '{}' is not in the phase list",
                self.terminal_phase
            )));
        }

        for (from, to) in &self.transitions {
            if !seen.contains(from.as_str()) {
                return Err(invalid(format!("transition from unknown phase '{}'", from)));
            }
            if !seen.contains(to.as_str()) {
                return Err(invalid(format!(
                    "transition from '{}' to unknown phase '{}'",
                    from, to
                )));
            }
        }

        if let Some(next) = self.transitions.get(&self.terminal_phase)
            && next != &self.terminal_phase
        {
            return Err(invalid(format!(
                "terminal phase '{}' transitions to '{}'",
                self.terminal_phase, next
            )));
        }

        for phase in &self.phases {
            if self.is_terminal(&phase.name) {
                continue;
            }
            if !self.transitions.contains_key(&phase.name) {
                return Err(invalid(format!(
                    "non-terminal phase '{}' has no successor",
                    phase.name
                )));
            }
            if !self.reaches_terminal(&phase.name) {
                return Err(invalid(format!(
                    "phase '{}' cannot reach terminal phase '{}'",
                    phase.name, self.terminal_phase
                )));
            }
        }

        Ok(())
    }

    fn reaches_terminal(&self, start: &str) -> bool {
        let mut current = start;
        // Following at most one edge per phase; more steps means a cycle.
        for _ in 0..=self.phases.len() {
            if self.is_terminal(current) {
                return true;
            }
            match self.transitions.get(current) {
                Some(next) => current = next,
                None => return false,
            }
        }
        false
    }
}

pub(crate) fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !s.starts_with(|c: char| c.is_ascii_digit())
}
