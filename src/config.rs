//! Orchestrator configuration.
//!
//! Read from `flowmaster.toml` and layered: file → environment
//! (`FLOWMASTER_*`, optionally from `.env`) → CLI flags.
//!
//! ```toml
//! [engine]
//! max_retries = 3
//! backoff_base_ms = 200
//! backoff_max_ms = 5000
//!
//! [lock]
//! backend = "sqlite"        # or "memory"
//! lease_ttl_secs = 300
//! reaper_interval_secs = 30
//!
//! [pool]
//! idle_timeout_secs = 1800
//! reaper_interval_secs = 60
//!
//! [store]
//! database_path = "flowmaster.db"
//!
//! [logging]
//! level = "info"
//! json = false
//! dir = "logs"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "flowmaster.toml";

/// Where phase leases live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    /// Process-local leases.
    Memory,
    /// Leases in the flow database, shared by every process using it.
    #[default]
    Sqlite,
}

impl std::fmt::Display for LockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockBackend::Memory => write!(f, "memory"),
            LockBackend::Sqlite => write!(f, "sqlite"),
        }
    }
}

impl std::str::FromStr for LockBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(LockBackend::Memory),
            "sqlite" => Ok(LockBackend::Sqlite),
            _ => anyhow::bail!("Invalid lock backend '{}'. Valid values: memory, sqlite", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSection {
    /// Extra handler attempts on recoverable failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockSection {
    #[serde(default)]
    pub backend: LockBackend,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_lock_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
}

fn default_lease_ttl_secs() -> u64 {
    300
}

fn default_lock_reaper_interval_secs() -> u64 {
    30
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            backend: LockBackend::default(),
            lease_ttl_secs: default_lease_ttl_secs(),
            reaper_interval_secs: default_lock_reaper_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_pool_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
}

fn default_idle_timeout_secs() -> u64 {
    1_800
}

fn default_pool_reaper_interval_secs() -> u64 {
    60
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            reaper_interval_secs: default_pool_reaper_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("flowmaster.db")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default filter directive; `RUST_LOG` wins when set
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Directory for daily-rolling log files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub lock: LockSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse flowmaster.toml")
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize flowmaster.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `FLOWMASTER_*` environment variables on top of the file values.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup using the environment variable
    /// names. Unset keys leave the current value alone.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("FLOWMASTER_DATABASE") {
            self.store.database_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FLOWMASTER_LOCK_BACKEND") {
            self.lock.backend = v.parse()?;
        }
        if let Some(v) = lookup("FLOWMASTER_LEASE_TTL_SECS") {
            self.lock.lease_ttl_secs = parse_number("FLOWMASTER_LEASE_TTL_SECS", &v)?;
        }
        if let Some(v) = lookup("FLOWMASTER_MAX_RETRIES") {
            self.engine.max_retries = parse_number("FLOWMASTER_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("FLOWMASTER_BACKOFF_BASE_MS") {
            self.engine.backoff_base_ms = parse_number("FLOWMASTER_BACKOFF_BASE_MS", &v)?;
        }
        if let Some(v) = lookup("FLOWMASTER_POOL_IDLE_TIMEOUT_SECS") {
            self.pool.idle_timeout_secs = parse_number("FLOWMASTER_POOL_IDLE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("FLOWMASTER_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("FLOWMASTER_LOG_JSON") {
            self.logging.json = v != "false" && v != "0";
        }
        if let Some(v) = lookup("FLOWMASTER_LOG_DIR") {
            self.logging.dir = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// Validate the configuration and return any problems found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.lock.lease_ttl_secs == 0 {
            problems.push("lock.lease_ttl_secs must be greater than 0".to_string());
        }
        if self.lock.reaper_interval_secs == 0 {
            problems.push("lock.reaper_interval_secs must be greater than 0".to_string());
        }
        if self.pool.reaper_interval_secs == 0 {
            problems.push("pool.reaper_interval_secs must be greater than 0".to_string());
        }
        if self.engine.backoff_base_ms > self.engine.backoff_max_ms {
            problems.push(format!(
                "engine.backoff_base_ms ({}) exceeds engine.backoff_max_ms ({})",
                self.engine.backoff_base_ms, self.engine.backoff_max_ms
            ));
        }
        if self.store.database_path.as_os_str().is_empty() {
            problems.push("store.database_path must not be empty".to_string());
        }
        if self.logging.level.trim().is_empty() {
            problems.push("logging.level must not be empty".to_string());
        }

        problems
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.engine.max_retries,
            base_delay: Duration::from_millis(self.engine.backoff_base_ms),
            max_delay: Duration::from_millis(self.engine.backoff_max_ms),
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lock.lease_ttl_secs)
    }

    pub fn lock_reaper_interval(&self) -> Duration {
        Duration::from_secs(self.lock.reaper_interval_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool.idle_timeout_secs)
    }

    pub fn pool_reaper_interval(&self) -> Duration {
        Duration::from_secs(self.pool.reaper_interval_secs)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer, got '{}'", key, value))
}
