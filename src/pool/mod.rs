//! Tenant-scoped worker pool.
//!
//! Workers are cached per `(client_account_id, engagement_id, flow_type)` and
//! reused across phase invocations of that tenant and type. The key always
//! includes both tenant fields, so two tenants can never be handed the same
//! worker. The pool is a plain value owned by the engine; tests build a fresh
//! one each.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use uuid::Uuid;

use crate::flow::TenantScope;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub client_account_id: String,
    pub engagement_id: String,
    pub flow_type: String,
}

impl PoolKey {
    pub fn new(client_account_id: &str, engagement_id: &str, flow_type: &str) -> Self {
        Self {
            client_account_id: client_account_id.to_string(),
            engagement_id: engagement_id.to_string(),
            flow_type: flow_type.to_string(),
        }
    }

    pub fn tenant(&self) -> TenantScope {
        TenantScope::new(&self.client_account_id, &self.engagement_id)
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.client_account_id, self.engagement_id, self.flow_type
        )
    }
}

/// Mutable execution context a handler works in. Survives across phase runs
/// of the same tenant and flow type.
#[derive(Debug, Default)]
pub struct WorkerSession {
    /// Scratch memory the handler may use to carry state between runs.
    pub memory: Map<String, Value>,
    pub invocations: u64,
}

pub struct Worker {
    id: Uuid,
    key: PoolKey,
    created_at: DateTime<Utc>,
    last_used: Mutex<Instant>,
    session: AsyncMutex<WorkerSession>,
}

impl Worker {
    fn new(key: PoolKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            created_at: Utc::now(),
            last_used: Mutex::new(Instant::now()),
            session: AsyncMutex::new(WorkerSession::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Lock the session for one handler invocation. Waits while another
    /// invocation holds it.
    pub async fn session(&self) -> AsyncMutexGuard<'_, WorkerSession> {
        let mut guard = self.session.lock().await;
        guard.invocations += 1;
        self.touch();
        guard
    }

    /// Whether a handler is currently running on this worker.
    pub fn is_busy(&self) -> bool {
        self.session.try_lock().is_err()
    }

    fn touch(&self) {
        if let Ok(mut last_used) = self.last_used.lock() {
            *last_used = Instant::now();
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        self.last_used
            .lock()
            .map(|last_used| now.saturating_duration_since(*last_used))
            .unwrap_or_default()
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}

pub struct TenantWorkerPool {
    entries: DashMap<PoolKey, Arc<Worker>>,
    idle_timeout: Duration,
}

impl TenantWorkerPool {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            idle_timeout,
        }
    }

    /// Return the worker for this tenant and flow type, creating it on first
    /// use.
    pub fn acquire(&self, client_account_id: &str, engagement_id: &str, flow_type: &str) -> Arc<Worker> {
        let key = PoolKey::new(client_account_id, engagement_id, flow_type);
        let worker = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::debug!(pool_key = %key, "creating pool worker");
                Arc::new(Worker::new(key.clone()))
            })
            .clone();
        worker.touch();
        worker
    }

    /// Evict every entry. Workers still referenced by an in-flight run stay
    /// alive until that run drops them.
    pub fn clear(&self) {
        let evicted = self.entries.len();
        self.entries.clear();
        tracing::debug!(evicted, "worker pool cleared");
    }

    /// Evict entries idle longer than the idle timeout. Busy workers are kept.
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, worker| worker.is_busy() || worker.idle_for(now) < self.idle_timeout);
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            tracing::debug!(evicted, "evicted idle pool workers");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

impl Default for TenantWorkerPool {
    fn default() -> Self {
        Self::new(Duration::from_secs(30 * 60))
    }
}

/// Periodically evict idle workers until the returned handle is aborted.
pub fn spawn_reaper(pool: Arc<TenantWorkerPool>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            pool.evict_idle();
        }
    })
}
