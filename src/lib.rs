//! Master flow orchestration engine.
//!
//! Flows are typed, tenant-scoped state machines. Each flow has a master
//! record (lifecycle, configuration, execution metadata) and a child record
//! (phase position, artifacts) in a per-type table. The
//! [`PhaseExecutionEngine`](engine::PhaseExecutionEngine) advances one phase
//! at a time under a per-`(flow, phase)` lease and commits both records
//! together.

pub mod config;
pub mod engine;
pub mod errors;
pub mod flow;
pub mod lock;
pub mod logging;
pub mod pool;
pub mod registry;
pub mod store;

pub use config::OrchestratorConfig;
pub use engine::{PhaseExecutionEngine, PhaseOutcome};
pub use errors::{EngineError, HandlerError, LockError, RegistryError, StoreError};
pub use flow::{FlowFilter, FlowStatus, LifecycleStatus, NewFlow};
pub use registry::FlowTypeRegistry;
