//! Master and child flow records.
//!
//! A workflow run is persisted as two records: a tenant-scoped, type-agnostic
//! `MasterFlow` envelope (identity, lifecycle, configuration, execution
//! metadata) and a type-specific `ChildFlow` holding the current phase and the
//! accumulated `PhaseState`.

pub mod lifecycle;
pub mod models;
pub mod state;

pub use lifecycle::LifecycleStatus;
pub use models::{
    ChildFlow, ExecutionMetadata, FlowFilter, FlowStatus, MasterFlow, NewFlow, PhaseRunRecord,
    RunOutcome, TenantScope,
};
pub use state::{PhaseState, PhaseTransition, TransitionKind, merge_json};
