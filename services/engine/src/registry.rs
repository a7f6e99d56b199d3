//! Resource registry.
//!
//! The registry owns the current view of every resource, the group
//! definitions and the per-resource health history. Readers get cloned
//! snapshots; writers are limited to the health monitor (status and health
//! fields) and the reservation manager (capacity fields), which is why the
//! mutators are `pub(crate)`.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use testfarm_events::ResourceKind;
use testfarm_id::{GroupId, ResourceId};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::EngineError;
use crate::model::{HealthRecord, HealthTrend, Resource, ResourceGroup};

#[derive(Debug, Default)]
struct RegistryState {
    resources: BTreeMap<ResourceId, Resource>,
    groups: BTreeMap<GroupId, ResourceGroup>,
    history: HashMap<ResourceId, VecDeque<HealthRecord>>,
}

/// Shared resource state.
#[derive(Debug)]
pub struct Registry {
    state: RwLock<RegistryState>,
    history_limit: usize,
}

impl Registry {
    pub fn new(history_limit: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            history_limit: history_limit.max(1),
        }
    }

    /// Add a resource. Ids are unique across kinds.
    pub(crate) async fn insert(&self, resource: Resource) -> Result<(), EngineError> {
        let mut state = self.state.write().await;

        if state.resources.contains_key(&resource.id) {
            return Err(EngineError::Conflict(format!(
                "resource {} is already registered",
                resource.id
            )));
        }
        if let Some(group_id) = &resource.group_id {
            if !state.groups.contains_key(group_id) {
                return Err(EngineError::GroupNotFound(group_id.clone()));
            }
        }

        state.resources.insert(resource.id.clone(), resource);
        Ok(())
    }

    pub(crate) async fn remove(&self, id: &ResourceId) -> Option<Resource> {
        let mut state = self.state.write().await;
        state.history.remove(id);
        state.resources.remove(id)
    }

    pub async fn get(&self, id: &ResourceId) -> Option<Resource> {
        self.state.read().await.resources.get(id).cloned()
    }

    pub async fn contains(&self, id: &ResourceId) -> bool {
        self.state.read().await.resources.contains_key(id)
    }

    /// All resources, ordered by id.
    pub async fn snapshot(&self) -> Vec<Resource> {
        self.state.read().await.resources.values().cloned().collect()
    }

    /// Resources of one kind, ordered by id.
    pub async fn snapshot_of(&self, kind: ResourceKind) -> Vec<Resource> {
        self.state
            .read()
            .await
            .resources
            .values()
            .filter(|r| r.kind() == kind)
            .cloned()
            .collect()
    }

    pub async fn ids_of(&self, kind: ResourceKind) -> Vec<ResourceId> {
        self.state
            .read()
            .await
            .resources
            .values()
            .filter(|r| r.kind() == kind)
            .map(|r| r.id.clone())
            .collect()
    }

    /// Apply `f` to one resource under the write lock.
    pub(crate) async fn update<R>(
        &self,
        id: &ResourceId,
        f: impl FnOnce(&mut Resource) -> R,
    ) -> Option<R> {
        let mut state = self.state.write().await;
        state.resources.get_mut(id).map(f)
    }

    // -------------------------------------------------------------------------
    // Groups
    // -------------------------------------------------------------------------

    pub(crate) async fn upsert_group(&self, group: ResourceGroup) -> Option<ResourceGroup> {
        let mut state = self.state.write().await;
        state.groups.insert(group.id.clone(), group)
    }

    pub async fn group(&self, id: &GroupId) -> Option<ResourceGroup> {
        self.state.read().await.groups.get(id).cloned()
    }

    pub async fn groups(&self) -> Vec<ResourceGroup> {
        self.state.read().await.groups.values().cloned().collect()
    }

    /// Move a resource into `group_id` (or out of any group with `None`).
    pub(crate) async fn assign_group(
        &self,
        id: &ResourceId,
        group_id: Option<GroupId>,
    ) -> Result<Resource, EngineError> {
        let mut state = self.state.write().await;

        if let Some(group_id) = &group_id {
            if !state.groups.contains_key(group_id) {
                return Err(EngineError::GroupNotFound(group_id.clone()));
            }
        }

        let resource = state
            .resources
            .get_mut(id)
            .ok_or_else(|| EngineError::ResourceNotFound(id.clone()))?;
        resource.group_id = group_id;
        Ok(resource.clone())
    }

    /// Member ids of a group, derived from resource ownership.
    pub async fn group_members(&self, id: &GroupId) -> Vec<ResourceId> {
        self.state
            .read()
            .await
            .resources
            .values()
            .filter(|r| r.group_id.as_ref() == Some(id))
            .map(|r| r.id.clone())
            .collect()
    }

    // -------------------------------------------------------------------------
    // Health history
    // -------------------------------------------------------------------------

    /// Append a record, dropping the oldest past the limit.
    pub(crate) async fn append_health(&self, record: HealthRecord) {
        let mut state = self.state.write().await;
        if !state.resources.contains_key(&record.resource_id) {
            return;
        }

        let limit = self.history_limit;
        let history = state.history.entry(record.resource_id.clone()).or_default();
        history.push_back(record);
        while history.len() > limit {
            history.pop_front();
        }
    }

    /// Newest-last health history, at most `limit` records.
    pub async fn health_history(&self, id: &ResourceId, limit: usize) -> Vec<HealthRecord> {
        let state = self.state.read().await;
        let Some(history) = state.history.get(id) else {
            return Vec::new();
        };

        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub async fn health_trend(&self, id: &ResourceId, since: DateTime<Utc>) -> HealthTrend {
        let state = self.state.read().await;
        let records = state.history.get(id).into_iter().flatten();
        let trend = HealthTrend::from_records(id.clone(), since, records);
        debug!(resource_id = %id, samples = trend.samples, "Computed health trend");
        trend
    }
}
