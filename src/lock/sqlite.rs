//! Phase locks in a shared SQLite database.
//!
//! Several orchestrator processes pointed at the same database file see each
//! other's leases. Acquisition is a single upsert that only overwrites an
//! expired row, so the check-and-set is atomic in SQLite.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{LeaseToken, PhaseLockManager};
use crate::errors::LockError;
use crate::store::DbHandle;

pub struct SqlitePhaseLockManager {
    db: DbHandle,
    holder_id: String,
    ttl: Duration,
}

impl SqlitePhaseLockManager {
    pub fn new(db: DbHandle, ttl: Duration) -> Self {
        Self::with_holder(db, &format!("orchestrator-{}", Uuid::new_v4()), ttl)
    }

    pub fn with_holder(db: DbHandle, holder_id: &str, ttl: Duration) -> Self {
        Self {
            db,
            holder_id: holder_id.to_string(),
            ttl,
        }
    }

    fn ttl_ms(&self) -> i64 {
        i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX / 2)
    }
}

#[async_trait]
impl PhaseLockManager for SqlitePhaseLockManager {
    async fn try_acquire(
        &self,
        flow_id: Uuid,
        phase: &str,
    ) -> Result<Option<LeaseToken>, LockError> {
        let phase_owned = phase.to_string();
        let holder = self.holder_id.clone();
        let token = LeaseToken::new();
        let ttl_ms = self.ttl_ms();
        let acquired = self
            .db
            .call(move |db| {
                db.try_acquire_lease(
                    flow_id,
                    &phase_owned,
                    &holder,
                    &token.to_string(),
                    Utc::now().timestamp_millis(),
                    ttl_ms,
                )
            })
            .await
            .map_err(|e| LockError::Backend(e.into()))?;
        if acquired {
            tracing::debug!(%flow_id, phase, holder = %self.holder_id, %token, "phase lease acquired");
            Ok(Some(token))
        } else {
            tracing::debug!(%flow_id, phase, "phase lease contended");
            Ok(None)
        }
    }

    async fn renew(&self, flow_id: Uuid, phase: &str, token: LeaseToken) -> Result<bool, LockError> {
        let phase = phase.to_string();
        let ttl_ms = self.ttl_ms();
        self.db
            .call(move |db| {
                db.renew_lease(
                    flow_id,
                    &phase,
                    &token.to_string(),
                    Utc::now().timestamp_millis(),
                    ttl_ms,
                )
            })
            .await
            .map_err(|e| LockError::Backend(e.into()))
    }

    async fn release(&self, flow_id: Uuid, phase: &str, token: LeaseToken) -> Result<bool, LockError> {
        let phase = phase.to_string();
        self.db
            .call(move |db| db.release_lease(flow_id, &phase, &token.to_string()))
            .await
            .map_err(|e| LockError::Backend(e.into()))
    }

    async fn purge_expired(&self) -> Result<usize, LockError> {
        self.db
            .call(|db| db.purge_expired_leases(Utc::now().timestamp_millis()))
            .await
            .map_err(|e| LockError::Backend(e.into()))
    }

    fn holder_id(&self) -> &str {
        &self.holder_id
    }

    fn lease_ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FlowDb;
    use std::collections::BTreeMap;

    fn handle() -> DbHandle {
        DbHandle::new(FlowDb::new_in_memory(BTreeMap::new()).unwrap())
    }

    #[tokio::test]
    async fn test_two_managers_share_leases() {
        let db = handle();
        let a = SqlitePhaseLockManager::with_holder(db.clone(), "node-a", Duration::from_secs(30));
        let b = SqlitePhaseLockManager::with_holder(db, "node-b", Duration::from_secs(30));
        let flow_id = Uuid::new_v4();

        let token = a.try_acquire(flow_id, "map").await.unwrap().unwrap();
        assert!(b.try_acquire(flow_id, "map").await.unwrap().is_none());
        assert!(a.try_acquire(flow_id, "map").await.unwrap().is_none());

        assert!(a.release(flow_id, "map", token).await.unwrap());
        assert!(b.try_acquire(flow_id, "map").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let manager = SqlitePhaseLockManager::new(handle(), Duration::from_secs(30));
        let flow_id = Uuid::new_v4();
        assert!(!manager.release(flow_id, "map", LeaseToken::new()).await.unwrap());
        let token = manager.try_acquire(flow_id, "map").await.unwrap().unwrap();
        assert!(manager.release(flow_id, "map", token).await.unwrap());
        assert!(!manager.release(flow_id, "map", token).await.unwrap());
        assert!(manager.try_acquire(flow_id, "map").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_crashed_holder_lease_expires() {
        let db = handle();
        let crashed =
            SqlitePhaseLockManager::with_holder(db.clone(), "crashed", Duration::from_millis(20));
        let survivor = SqlitePhaseLockManager::with_holder(db, "survivor", Duration::from_secs(30));
        let flow_id = Uuid::new_v4();

        assert!(crashed.try_acquire(flow_id, "map").await.unwrap().is_some());
        assert!(survivor.try_acquire(flow_id, "map").await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(survivor.try_acquire(flow_id, "map").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_same_holder_stale_token_cannot_release_successor() {
        // One process, one holder id: only the token tells the two leases apart.
        let manager = SqlitePhaseLockManager::with_holder(handle(), "node-a", Duration::from_millis(20));
        let flow_id = Uuid::new_v4();

        let stale = manager.try_acquire(flow_id, "map").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let current = manager.try_acquire(flow_id, "map").await.unwrap().unwrap();

        assert!(!manager.release(flow_id, "map", stale).await.unwrap());
        assert!(!manager.renew(flow_id, "map", stale).await.unwrap());
        assert!(manager.renew(flow_id, "map", current).await.unwrap());
        assert!(manager.try_acquire(flow_id, "map").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_renew_keeps_lease_alive() {
        let manager = SqlitePhaseLockManager::new(handle(), Duration::from_millis(40));
        let flow_id = Uuid::new_v4();
        let token = manager.try_acquire(flow_id, "map").await.unwrap().unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(manager.renew(flow_id, "map", token).await.unwrap());
        }
        assert!(manager.try_acquire(flow_id, "map").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let manager = SqlitePhaseLockManager::new(handle(), Duration::from_millis(10));
        manager.try_acquire(Uuid::new_v4(), "a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.purge_expired().await.unwrap(), 1);
    }
}
