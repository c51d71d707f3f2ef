//! CLI command implementations.
//!
//! | Module    | Commands handled                                              |
//! |-----------|---------------------------------------------------------------|
//! | `flow`    | `Create`, `Advance`, `Status`, `List`, lifecycle ops, `Delete` |
//! | `types`   | `Types`                                                       |
//! | `config`  | `Config`                                                      |

pub mod config;
pub mod flow;
pub mod types;

use std::sync::Arc;

use anyhow::{Context, Result};

use flowmaster::config::{LockBackend, OrchestratorConfig};
use flowmaster::engine::{PhaseExecutionEngine, PhaseHandlers};
use flowmaster::lock::PhaseLockManager;
use flowmaster::lock::memory::MemoryPhaseLockManager;
use flowmaster::lock::sqlite::SqlitePhaseLockManager;
use flowmaster::pool::TenantWorkerPool;
use flowmaster::registry::FlowTypeRegistry;
use flowmaster::store::SqliteFlowStore;

pub use config::cmd_config;
pub use flow::{
    LifecycleAction, cmd_advance, cmd_create, cmd_delete, cmd_lifecycle, cmd_list, cmd_status,
};
pub use types::cmd_types;

use super::Cli;

/// Layer configuration: file, then `FLOWMASTER_*` environment, then flags.
pub fn load_config(cli: &Cli) -> Result<OrchestratorConfig> {
    let mut config = OrchestratorConfig::load_or_default(&cli.config)?;
    config.apply_env()?;
    if let Some(database) = &cli.database {
        config.store.database_path = database.clone();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    Ok(config)
}

/// Engine wired to the configured database and lock backend.
pub struct App {
    pub engine: PhaseExecutionEngine,
}

impl App {
    pub fn open(config: &OrchestratorConfig) -> Result<Self> {
        for problem in config.validate() {
            tracing::warn!(problem = %problem, "configuration problem");
        }

        let registry = FlowTypeRegistry::with_builtin_types()?;
        let db_path = &config.store.database_path;
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let store = SqliteFlowStore::open(db_path, &registry)
            .with_context(|| format!("Failed to open flow database {}", db_path.display()))?;

        let locks: Arc<dyn PhaseLockManager> = match config.lock.backend {
            LockBackend::Memory => Arc::new(MemoryPhaseLockManager::new(config.lease_ttl())),
            LockBackend::Sqlite => Arc::new(SqlitePhaseLockManager::new(
                store.handle(),
                config.lease_ttl(),
            )),
        };
        tracing::debug!(
            database = %db_path.display(),
            lock_backend = %config.lock.backend,
            holder = locks.holder_id(),
            "engine opened"
        );

        let engine = PhaseExecutionEngine::new(
            Arc::new(registry),
            Arc::new(store),
            locks,
            Arc::new(TenantWorkerPool::new(config.pool_idle_timeout())),
            PhaseHandlers::with_default_transitions(),
        )
        .with_retry_policy(config.retry_policy());

        Ok(Self { engine })
    }
}

/// Print a serializable value as pretty JSON.
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}

pub fn parse_flow_id(raw: &str) -> Result<uuid::Uuid> {
    uuid::Uuid::parse_str(raw.trim()).with_context(|| format!("Invalid flow id '{}'", raw))
}

/// Parse a JSON object argument.
pub fn parse_object(flag: &str, raw: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    match serde_json::from_str(raw).with_context(|| format!("{} is not valid JSON", flag))? {
        serde_json::Value::Object(map) => Ok(map),
        _ => anyhow::bail!("{} must be a JSON object", flag),
    }
}
