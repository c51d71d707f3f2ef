//! Phase execution locks.
//!
//! A lease-based mutex keyed by `(flow_id, phase)`. Acquisition is a
//! non-blocking check-and-set: the first caller gets the lease and its
//! [`LeaseToken`], everyone else gets `None` until the lease is released or
//! expires. Expired leases are reclaimed on acquire and swept by
//! [`spawn_reaper`]. A holder keeps its lease alive by renewing it, which
//! [`PhaseLockGuard`] does on a heartbeat.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

pub use memory::MemoryPhaseLockManager;
pub use sqlite::SqlitePhaseLockManager;

use crate::errors::LockError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub flow_id: Uuid,
    pub phase: String,
}

impl LockKey {
    pub fn new(flow_id: Uuid, phase: &str) -> Self {
        Self {
            flow_id,
            phase: phase.to_string(),
        }
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.flow_id, self.phase)
    }
}

/// Identifies one acquisition of a lease. Renewing and releasing only act on
/// the lease the token was issued for, so a caller whose lease expired and was
/// taken over cannot touch the new holder's lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

#[async_trait]
pub trait PhaseLockManager: Send + Sync {
    /// Record a lease for `(flow_id, phase)` unless a live one exists. Returns
    /// the token of the new lease, or `None` when the key is held.
    async fn try_acquire(&self, flow_id: Uuid, phase: &str)
    -> Result<Option<LeaseToken>, LockError>;

    /// Push the expiry of the lease one TTL into the future. Returns false
    /// when `token` no longer holds the key.
    async fn renew(&self, flow_id: Uuid, phase: &str, token: LeaseToken)
    -> Result<bool, LockError>;

    /// Drop the lease if `token` still holds it. Releasing a free key, or a
    /// key since taken by another acquisition, is a no-op returning false.
    async fn release(&self, flow_id: Uuid, phase: &str, token: LeaseToken)
    -> Result<bool, LockError>;

    /// Remove expired leases; returns how many were removed.
    async fn purge_expired(&self) -> Result<usize, LockError>;

    /// Identifier recorded as the lease holder.
    fn holder_id(&self) -> &str;

    fn lease_ttl(&self) -> Duration;
}

/// Periodically purge expired leases until the returned handle is aborted.
pub fn spawn_reaper(
    manager: Arc<dyn PhaseLockManager>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match manager.purge_expired().await {
                Ok(0) => {}
                Ok(n) => tracing::info!(purged = n, "reclaimed expired phase leases"),
                Err(e) => tracing::warn!(error = %e, "phase lease reaper failed"),
            }
        }
    })
}

/// Renew a held lease every third of its TTL until aborted or the lease is
/// lost.
fn spawn_heartbeat(
    manager: Arc<dyn PhaseLockManager>,
    key: LockKey,
    token: LeaseToken,
) -> tokio::task::JoinHandle<()> {
    let period = (manager.lease_ttl() / 3).max(Duration::from_millis(1));
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(period).await;
            match manager.renew(key.flow_id, &key.phase, token).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(lock = %key, "phase lease lost; heartbeat stopped");
                    return;
                }
                Err(e) => tracing::warn!(lock = %key, error = %e, "phase lease renewal failed"),
            }
        }
    })
}

/// Owned lease on a phase lock.
///
/// While the guard lives, a heartbeat task keeps the lease from expiring.
/// Call [`PhaseLockGuard::release`] on the normal path. If the guard is
/// dropped without it (the advancing future was cancelled or panicked) the
/// release is handed to the runtime instead.
pub struct PhaseLockGuard {
    manager: Arc<dyn PhaseLockManager>,
    key: LockKey,
    token: LeaseToken,
    heartbeat: Option<tokio::task::JoinHandle<()>>,
    released: bool,
}

impl PhaseLockGuard {
    /// Try to take the lock; `None` when another holder has it.
    pub async fn acquire(
        manager: Arc<dyn PhaseLockManager>,
        flow_id: Uuid,
        phase: &str,
    ) -> Result<Option<Self>, LockError> {
        let Some(token) = manager.try_acquire(flow_id, phase).await? else {
            return Ok(None);
        };
        let key = LockKey::new(flow_id, phase);
        let heartbeat = spawn_heartbeat(Arc::clone(&manager), key.clone(), token);
        Ok(Some(Self {
            manager,
            key,
            token,
            heartbeat: Some(heartbeat),
            released: false,
        }))
    }

    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub fn token(&self) -> LeaseToken {
        self.token
    }

    /// Renew the lease now, failing with [`LockError::LeaseLost`] if another
    /// acquisition holds the key.
    pub async fn ensure_held(&self) -> Result<(), LockError> {
        if self
            .manager
            .renew(self.key.flow_id, &self.key.phase, self.token)
            .await?
        {
            return Ok(());
        }
        Err(LockError::LeaseLost {
            flow_id: self.key.flow_id,
            phase: self.key.phase.clone(),
        })
    }

    pub async fn release(mut self) -> Result<(), LockError> {
        self.stop_heartbeat();
        self.released = true;
        let released = self
            .manager
            .release(self.key.flow_id, &self.key.phase, self.token)
            .await?;
        if !released {
            tracing::warn!(lock = %self.key, "phase lease was already gone at release");
        }
        Ok(())
    }

    fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

impl Drop for PhaseLockGuard {
    fn drop(&mut self) {
        self.stop_heartbeat();
        if self.released {
            return;
        }
        let manager = Arc::clone(&self.manager);
        let key = self.key.clone();
        let token = self.token;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = manager.release(key.flow_id, &key.phase, token).await {
                        tracing::error!(lock = %key, error = %e, "failed to release dropped phase lock");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(lock = %key, "phase lock dropped outside a runtime; lease will expire");
            }
        }
    }
}
