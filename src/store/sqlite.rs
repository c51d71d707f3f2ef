//! SQLite-backed [`FlowStore`].

use std::path::Path;

use async_trait::async_trait;
use uuid::Uuid;

use super::db::{DbHandle, FlowDb};
use super::{CommitResult, FlowStore, PhaseCommit};
use crate::errors::StoreError;
use crate::flow::{ChildFlow, FlowFilter, LifecycleStatus, MasterFlow};
use crate::registry::FlowTypeRegistry;

#[derive(Clone)]
pub struct SqliteFlowStore {
    db: DbHandle,
}

impl SqliteFlowStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Open the database at `path` with a child table for every registered
    /// flow type.
    pub fn open(path: &Path, registry: &FlowTypeRegistry) -> Result<Self, StoreError> {
        let db = FlowDb::new(path, registry.child_tables())?;
        Ok(Self::new(DbHandle::new(db)))
    }

    pub fn open_in_memory(registry: &FlowTypeRegistry) -> Result<Self, StoreError> {
        let db = FlowDb::new_in_memory(registry.child_tables())?;
        Ok(Self::new(DbHandle::new(db)))
    }

    /// Handle to the underlying database, shared with the SQLite lock manager.
    pub fn handle(&self) -> DbHandle {
        self.db.clone()
    }
}

#[async_trait]
impl FlowStore for SqliteFlowStore {
    async fn create_flow(
        &self,
        master: &MasterFlow,
        child: &ChildFlow,
    ) -> Result<ChildFlow, StoreError> {
        let master = master.clone();
        let child = child.clone();
        self.db.call(move |db| db.insert_flow(&master, &child)).await
    }

    async fn load_master(&self, flow_id: Uuid) -> Result<Option<MasterFlow>, StoreError> {
        self.db.call(move |db| db.get_master(flow_id)).await
    }

    async fn load_child(&self, flow_id: Uuid) -> Result<Option<ChildFlow>, StoreError> {
        self.db.call(move |db| db.get_child(flow_id)).await
    }

    async fn commit_phase(&self, commit: PhaseCommit) -> Result<CommitResult, StoreError> {
        self.db.call(move |db| db.commit_phase(commit)).await
    }

    async fn update_lifecycle(
        &self,
        flow_id: Uuid,
        next: LifecycleStatus,
    ) -> Result<MasterFlow, StoreError> {
        self.db
            .call(move |db| db.update_lifecycle(flow_id, next))
            .await
    }

    async fn list_masters(&self, filter: &FlowFilter) -> Result<Vec<MasterFlow>, StoreError> {
        let filter = filter.clone();
        self.db.call(move |db| db.list_masters(&filter)).await
    }

    async fn soft_delete(&self, flow_id: Uuid) -> Result<bool, StoreError> {
        self.db.call(move |db| db.soft_delete(flow_id)).await
    }

    async fn purge(&self, flow_id: Uuid) -> Result<bool, StoreError> {
        self.db.call(move |db| db.purge(flow_id)).await
    }
}
