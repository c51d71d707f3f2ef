//! Typed error hierarchy for the flow orchestrator.
//!
//! Four enums cover the subsystems:
//! - `RegistryError`: flow type registration and lookup
//! - `StoreError`: master/child persistence
//! - `LockError`: phase lease backends
//! - `EngineError`: everything the engine API hands back to callers
//!
//! Handler failures are not part of this hierarchy's propagation path: the
//! engine catches `HandlerError`, classifies it and turns it into a
//! `PhaseOutcome` after committing.

use thiserror::Error;
use uuid::Uuid;

use crate::flow::LifecycleStatus;

/// Errors from the flow type registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Flow type '{0}' is already registered")]
    DuplicateType(String),

    #[error("Flow type '{0}' is not registered")]
    UnknownType(String),

    #[error("Invalid phase graph for flow type '{flow_type}': {message}")]
    InvalidPhaseGraph { flow_type: String, message: String },
}

/// Errors from the master/child flow stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Flow {0} not found")]
    FlowNotFound(Uuid),

    #[error("Flow {0} already exists")]
    DuplicateFlow(Uuid),

    #[error(
        "Phase state diverged for flow {flow_id}: column '{column}' vs document '{document}'"
    )]
    PhaseStateDiverged {
        flow_id: Uuid,
        column: String,
        document: String,
    },

    #[error("Invalid lifecycle transition for flow {flow_id}: {from} -> {to}")]
    InvalidTransition {
        flow_id: Uuid,
        from: LifecycleStatus,
        to: LifecycleStatus,
    },

    #[error("No child table configured for flow type '{0}'")]
    UnknownChildTable(String),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Database error: {0}")]
    Database(#[from] anyhow::Error),
}

/// Errors from a phase lock backend.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock backend error: {0}")]
    Backend(#[source] anyhow::Error),

    /// The lease expired and was taken by another caller before the run
    /// could commit. Nothing was written.
    #[error("Lease on phase '{phase}' of flow {flow_id} was lost before commit")]
    LeaseLost { flow_id: Uuid, phase: String },
}

/// Failure reported by (or on behalf of) a phase handler.
///
/// Recoverable errors are transient (connection drops, timeouts, rate limits)
/// and are retried by the engine; everything else is fatal for the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("Recoverable handler error: {0}")]
    Recoverable(String),

    #[error("Fatal handler error: {0}")]
    Fatal(String),
}

const RECOVERABLE_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "rate limit",
    "rate-limit",
    "too many requests",
    "429",
    "503",
    "temporarily unavailable",
    "try again",
];

impl HandlerError {
    /// Classify a free-form error message as recoverable or fatal.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if RECOVERABLE_MARKERS.iter().any(|m| lower.contains(m)) {
            Self::Recoverable(message)
        } else {
            Self::Fatal(message)
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Recoverable(m) | Self::Fatal(m) => m,
        }
    }
}

/// Errors returned by the phase execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Flow {flow_id} not found")]
    FlowNotFound { flow_id: Uuid },

    #[error("Flow {flow_id} is {status} and cannot advance")]
    FlowTerminal {
        flow_id: Uuid,
        status: LifecycleStatus,
    },

    #[error("Flow {flow_id} is {status}; resume or recover it before advancing")]
    FlowNotRunnable {
        flow_id: Uuid,
        status: LifecycleStatus,
    },

    #[error("Phase '{phase}' is not part of flow type '{flow_type}'")]
    UnknownPhase { flow_type: String, phase: String },

    #[error("Phase '{phase}' of flow {flow_id} is already running")]
    PhaseAlreadyRunning { flow_id: Uuid, phase: String },

    #[error("No handler registered for phase '{phase}' of flow type '{flow_type}'")]
    NoHandler { flow_type: String, phase: String },

    #[error("Phase '{phase}' is missing required inputs: {missing:?}")]
    MissingPhaseInput { phase: String, missing: Vec<String> },

    #[error("Invalid lifecycle transition for flow {flow_id}: {from} -> {to}")]
    InvalidTransition {
        flow_id: Uuid,
        from: LifecycleStatus,
        to: LifecycleStatus,
    },

    #[error("Invalid flow request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::FlowNotFound(flow_id) => Self::FlowNotFound { flow_id },
            StoreError::InvalidTransition { flow_id, from, to } => {
                Self::InvalidTransition { flow_id, from, to }
            }
            other => Self::Store(other),
        }
    }
}

impl EngineError {
    /// Lock contention is not a flow failure; callers may poll and retry.
    /// A lost lease committed nothing, so the phase can be advanced again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PhaseAlreadyRunning { .. } | Self::Lock(LockError::LeaseLost { .. })
        )
    }
}
