//! In-memory flow store for tests and embedding.
//!
//! One mutex guards both record maps, so every operation is atomic across the
//! master and child records.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{CommitResult, FlowStore, PhaseCommit, apply_commit, apply_lifecycle};
use crate::errors::StoreError;
use crate::flow::{ChildFlow, FlowFilter, LifecycleStatus, MasterFlow};

#[derive(Default)]
struct Records {
    masters: HashMap<Uuid, MasterFlow>,
    children: HashMap<Uuid, ChildFlow>,
    deleted: HashSet<Uuid>,
    next_child_id: i64,
}

#[derive(Default)]
pub struct MemoryFlowStore {
    records: Mutex<Records>,
}

impl MemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Records>, StoreError> {
        self.records.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

#[async_trait]
impl FlowStore for MemoryFlowStore {
    async fn create_flow(
        &self,
        master: &MasterFlow,
        child: &ChildFlow,
    ) -> Result<ChildFlow, StoreError> {
        let mut records = self.lock()?;
        if records.masters.contains_key(&master.flow_id) {
            return Err(StoreError::DuplicateFlow(master.flow_id));
        }
        records.next_child_id += 1;
        let mut child = child.clone();
        child.set_id(records.next_child_id);
        records.masters.insert(master.flow_id, master.clone());
        records.children.insert(master.flow_id, child.clone());
        Ok(child)
    }

    async fn load_master(&self, flow_id: Uuid) -> Result<Option<MasterFlow>, StoreError> {
        let records = self.lock()?;
        if records.deleted.contains(&flow_id) {
            return Ok(None);
        }
        Ok(records.masters.get(&flow_id).cloned())
    }

    async fn load_child(&self, flow_id: Uuid) -> Result<Option<ChildFlow>, StoreError> {
        let records = self.lock()?;
        Ok(records
            .children
            .get(&flow_id)
            .filter(|c| !c.is_deleted())
            .cloned())
    }

    async fn commit_phase(&self, commit: PhaseCommit) -> Result<CommitResult, StoreError> {
        let mut records = self.lock()?;
        let flow_id = commit.flow_id;
        if records.deleted.contains(&flow_id) {
            return Err(StoreError::FlowNotFound(flow_id));
        }
        let mut master = records
            .masters
            .get(&flow_id)
            .cloned()
            .ok_or(StoreError::FlowNotFound(flow_id))?;
        let mut child = records
            .children
            .get(&flow_id)
            .cloned()
            .ok_or(StoreError::FlowNotFound(flow_id))?;

        let superseded = apply_commit(&mut master, &mut child, commit);

        records.masters.insert(flow_id, master.clone());
        records.children.insert(flow_id, child.clone());
        Ok(CommitResult {
            master,
            child,
            superseded,
        })
    }

    async fn update_lifecycle(
        &self,
        flow_id: Uuid,
        next: LifecycleStatus,
    ) -> Result<MasterFlow, StoreError> {
        let mut records = self.lock()?;
        if records.deleted.contains(&flow_id) {
            return Err(StoreError::FlowNotFound(flow_id));
        }
        let master = records
            .masters
            .get_mut(&flow_id)
            .ok_or(StoreError::FlowNotFound(flow_id))?;
        apply_lifecycle(master, next)?;
        Ok(master.clone())
    }

    async fn list_masters(&self, filter: &FlowFilter) -> Result<Vec<MasterFlow>, StoreError> {
        let records = self.lock()?;
        let mut masters: Vec<MasterFlow> = records
            .masters
            .values()
            .filter(|m| !records.deleted.contains(&m.flow_id) && filter.matches(m))
            .cloned()
            .collect();
        masters.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.flow_id.cmp(&b.flow_id))
        });
        Ok(masters)
    }

    async fn soft_delete(&self, flow_id: Uuid) -> Result<bool, StoreError> {
        let mut records = self.lock()?;
        if !records.masters.contains_key(&flow_id) || records.deleted.contains(&flow_id) {
            return Ok(false);
        }
        if let Some(child) = records.children.get_mut(&flow_id) {
            child.mark_deleted(Utc::now());
        }
        records.deleted.insert(flow_id);
        Ok(true)
    }

    async fn purge(&self, flow_id: Uuid) -> Result<bool, StoreError> {
        let mut records = self.lock()?;
        let removed = records.masters.remove(&flow_id).is_some();
        records.children.remove(&flow_id);
        records.deleted.remove(&flow_id);
        Ok(removed)
    }
}
