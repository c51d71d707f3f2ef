//! Phase handler seam.
//!
//! The engine never knows what a phase does. It hands a [`PhaseContext`] to
//! the [`PhaseHandler`] resolved for `(flow_type, phase)` and interprets the
//! returned [`PhaseDecision`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::errors::HandlerError;
use crate::flow::TenantScope;
use crate::pool::WorkerSession;
use crate::registry::PhaseDefinition;

/// Everything a handler gets for one attempt.
pub struct PhaseContext<'a> {
    pub flow_id: Uuid,
    pub flow_type: &'a str,
    /// Contract of the phase being executed.
    pub phase: &'a PhaseDefinition,
    pub tenant: &'a TenantScope,
    pub user_id: &'a str,
    /// Master flow configuration, read-only.
    pub configuration: &'a Value,
    /// Persisted artifacts merged with caller overrides.
    pub input: &'a Map<String, Value>,
    /// 1-based attempt number within this advance call.
    pub attempt: u32,
    pub worker_id: Uuid,
    pub session: &'a mut WorkerSession,
}

/// What a handler wants the engine to do next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PhaseDecision {
    /// Phase done. `next_phase` overrides the registry default.
    Continue {
        #[serde(default)]
        next_phase: Option<String>,
        #[serde(default)]
        artifacts: Map<String, Value>,
    },
    /// Phase not applicable; move on without artifacts.
    Skip {
        #[serde(default)]
        next_phase: Option<String>,
        reason: String,
    },
    /// Transient problem; run the phase again.
    Retry { reason: String },
    /// Phase failed. The error text is classified recoverable or fatal.
    Fail { error: String },
}

impl PhaseDecision {
    /// Continue to the registry default with no artifacts.
    pub fn proceed() -> Self {
        Self::Continue {
            next_phase: None,
            artifacts: Map::new(),
        }
    }

    pub fn continue_to(next_phase: &str) -> Self {
        Self::Continue {
            next_phase: Some(next_phase.to_string()),
            artifacts: Map::new(),
        }
    }

    pub fn with_artifacts(artifacts: Map<String, Value>) -> Self {
        Self::Continue {
            next_phase: None,
            artifacts,
        }
    }

    pub fn skip(reason: &str) -> Self {
        Self::Skip {
            next_phase: None,
            reason: reason.to_string(),
        }
    }

    pub fn fail(error: &str) -> Self {
        Self::Fail {
            error: error.to_string(),
        }
    }
}

/// Handler contract. Implementations must be idempotent with respect to their
/// own artifacts: the engine re-invokes them on recoverable failures.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    async fn handle(&self, ctx: PhaseContext<'_>) -> Result<PhaseDecision, HandlerError>;
}

/// Adapter turning a synchronous closure into a handler.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> PhaseHandler for FnHandler<F>
where
    F: Fn(&mut PhaseContext<'_>) -> Result<PhaseDecision, HandlerError> + Send + Sync,
{
    async fn handle(&self, mut ctx: PhaseContext<'_>) -> Result<PhaseDecision, HandlerError> {
        (self.0)(&mut ctx)
    }
}

pub fn handler_fn<F>(f: F) -> Arc<dyn PhaseHandler>
where
    F: Fn(&mut PhaseContext<'_>) -> Result<PhaseDecision, HandlerError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handler that accepts the registry default transition and records each
/// declared output as a completion marker. Lets a flow be walked end to end
/// without real phase logic.
pub struct DefaultTransitionHandler;

#[async_trait]
impl PhaseHandler for DefaultTransitionHandler {
    async fn handle(&self, ctx: PhaseContext<'_>) -> Result<PhaseDecision, HandlerError> {
        let mut artifacts = Map::new();
        for output in &ctx.phase.outputs {
            artifacts.insert(
                output.clone(),
                json!({
                    "produced_by": ctx.phase.name,
                    "worker_id": ctx.worker_id.to_string(),
                }),
            );
        }
        Ok(PhaseDecision::Continue {
            next_phase: None,
            artifacts,
        })
    }
}

/// Handler lookup: an exact `(flow_type, phase)` entry wins over a per-type
/// handler, which wins over the fallback.
#[derive(Clone, Default)]
pub struct PhaseHandlers {
    by_phase: HashMap<(String, String), Arc<dyn PhaseHandler>>,
    by_type: HashMap<String, Arc<dyn PhaseHandler>>,
    fallback: Option<Arc<dyn PhaseHandler>>,
}

impl PhaseHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler set that walks every flow with [`DefaultTransitionHandler`].
    pub fn with_default_transitions() -> Self {
        Self::new().with_fallback(Arc::new(DefaultTransitionHandler))
    }

    pub fn register_phase(
        &mut self,
        flow_type: &str,
        phase: &str,
        handler: Arc<dyn PhaseHandler>,
    ) -> &mut Self {
        self.by_phase
            .insert((flow_type.to_string(), phase.to_string()), handler);
        self
    }

    pub fn register_type(&mut self, flow_type: &str, handler: Arc<dyn PhaseHandler>) -> &mut Self {
        self.by_type.insert(flow_type.to_string(), handler);
        self
    }

    pub fn with_fallback(mut self, handler: Arc<dyn PhaseHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn resolve(&self, flow_type: &str, phase: &str) -> Option<Arc<dyn PhaseHandler>> {
        self.by_phase
            .get(&(flow_type.to_string(), phase.to_string()))
            .or_else(|| self.by_type.get(flow_type))
            .or(self.fallback.as_ref())
            .cloned()
    }
}
