//! Flow type registry.
//!
//! Built once at process start (usually via [`FlowTypeRegistry::with_builtin_types`])
//! and shared read-only behind an `Arc` afterwards. Registration takes
//! `&mut self`, so nothing can add types once the registry has been handed to
//! the engine.

pub mod builtin;
pub mod flow_type;

use std::collections::BTreeMap;
use std::sync::Arc;

pub use flow_type::{FlowTypeConfig, PhaseDefinition};

use crate::errors::RegistryError;

#[derive(Debug, Default, Clone)]
pub struct FlowTypeRegistry {
    types: BTreeMap<String, Arc<FlowTypeConfig>>,
}

impl FlowTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in migration flow types.
    pub fn with_builtin_types() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for config in builtin::builtin_flow_types() {
            registry.register(config)?;
        }
        Ok(registry)
    }

    /// Register a flow type. Fails if the name is taken or the phase graph is
    /// malformed; a failed registration leaves the registry unchanged.
    pub fn register(&mut self, config: FlowTypeConfig) -> Result<(), RegistryError> {
        if self.types.contains_key(&config.name) {
            return Err(RegistryError::DuplicateType(config.name));
        }
        config.validate()?;
        if let Some(existing) = self
            .types
            .values()
            .find(|t| t.child_table == config.child_table)
        {
            return Err(RegistryError::InvalidPhaseGraph {
                flow_type: config.name.clone(),
                message: format!(
                    "child table '{}' already used by flow type '{}'",
                    config.child_table, existing.name
                ),
            });
        }
        tracing::debug!(flow_type = %config.name, phases = config.phases.len(), "registered flow type");
        self.types.insert(config.name.clone(), Arc::new(config));
        Ok(())
    }

    pub fn get(&self, flow_type: &str) -> Result<Arc<FlowTypeConfig>, RegistryError> {
        self.types
            .get(flow_type)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownType(flow_type.to_string()))
    }

    pub fn is_registered(&self, flow_type: &str) -> bool {
        self.types.contains_key(flow_type)
    }

    /// All registered flow types, sorted by name.
    pub fn list_all(&self) -> Vec<Arc<FlowTypeConfig>> {
        self.types.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Flow type name to child table name, for every registered type.
    pub fn child_tables(&self) -> BTreeMap<String, String> {
        self.types
            .values()
            .map(|t| (t.name.clone(), t.child_table.clone()))
            .collect()
    }
}
