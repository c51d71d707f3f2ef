//! In-process phase lock manager.
//!
//! Suitable for a single orchestrator process; leases vanish on restart.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use super::{LeaseToken, LockKey, PhaseLockManager};
use crate::errors::LockError;

#[derive(Debug, Clone)]
pub struct Lease {
    pub holder_id: String,
    pub token: LeaseToken,
    pub acquired_at: DateTime<Utc>,
    expires_at: Instant,
}

impl Lease {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

pub struct MemoryPhaseLockManager {
    leases: DashMap<LockKey, Lease>,
    holder_id: String,
    ttl: Duration,
}

impl MemoryPhaseLockManager {
    pub fn new(ttl: Duration) -> Self {
        Self::with_holder(&format!("orchestrator-{}", Uuid::new_v4()), ttl)
    }

    pub fn with_holder(holder_id: &str, ttl: Duration) -> Self {
        Self {
            leases: DashMap::new(),
            holder_id: holder_id.to_string(),
            ttl,
        }
    }

    /// Number of leases currently held and not expired.
    pub fn active_leases(&self) -> usize {
        let now = Instant::now();
        self.leases.iter().filter(|l| !l.is_expired(now)).count()
    }

    pub fn lease(&self, flow_id: Uuid, phase: &str) -> Option<Lease> {
        self.leases
            .get(&LockKey::new(flow_id, phase))
            .map(|l| l.value().clone())
    }

    /// Expire a lease immediately, as if its holder stalled past the TTL.
    pub fn force_expire(&self, flow_id: Uuid, phase: &str) {
        if let Some(mut lease) = self.leases.get_mut(&LockKey::new(flow_id, phase)) {
            lease.expires_at = Instant::now();
        }
    }

    fn new_lease(&self, token: LeaseToken, now: Instant) -> Lease {
        Lease {
            holder_id: self.holder_id.clone(),
            token,
            acquired_at: Utc::now(),
            expires_at: now + self.ttl,
        }
    }
}

#[async_trait]
impl PhaseLockManager for MemoryPhaseLockManager {
    async fn try_acquire(
        &self,
        flow_id: Uuid,
        phase: &str,
    ) -> Result<Option<LeaseToken>, LockError> {
        let key = LockKey::new(flow_id, phase);
        let now = Instant::now();
        let token = LeaseToken::new();
        // The entry guard holds the shard lock, so check-and-set is atomic.
        match self.leases.entry(key) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_expired(now) {
                    tracing::debug!(lock = %entry.key(), holder = %entry.get().holder_id, "phase lock contended");
                    return Ok(None);
                }
                tracing::warn!(lock = %entry.key(), previous_holder = %entry.get().holder_id, "reclaiming expired phase lease");
                entry.insert(self.new_lease(token, now));
                Ok(Some(token))
            }
            Entry::Vacant(entry) => {
                tracing::debug!(lock = %entry.key(), %token, "phase lock acquired");
                entry.insert(self.new_lease(token, now));
                Ok(Some(token))
            }
        }
    }

    async fn renew(&self, flow_id: Uuid, phase: &str, token: LeaseToken) -> Result<bool, LockError> {
        if let Some(mut lease) = self.leases.get_mut(&LockKey::new(flow_id, phase))
            && lease.token == token
        {
            lease.expires_at = Instant::now() + self.ttl;
            return Ok(true);
        }
        Ok(false)
    }

    async fn release(&self, flow_id: Uuid, phase: &str, token: LeaseToken) -> Result<bool, LockError> {
        let removed = self
            .leases
            .remove_if(&LockKey::new(flow_id, phase), |_, lease| lease.token == token)
            .is_some();
        if removed {
            tracing::debug!(%flow_id, phase, "phase lock released");
        }
        Ok(removed)
    }

    async fn purge_expired(&self) -> Result<usize, LockError> {
        let now = Instant::now();
        let before = self.leases.len();
        self.leases.retain(|_, lease| !lease.is_expired(now));
        Ok(before.saturating_sub(self.leases.len()))
    }

    fn holder_id(&self) -> &str {
        &self.holder_id
    }

    fn lease_ttl(&self) -> Duration {
        self.ttl
    }
}
