//! In-memory storage backend.
//!
//! The reference implementation of the storage contracts: plain maps, with
//! transactionality provided by snapshotting the whole state at `begin` and
//! restoring it on `rollback`. State is small (task records and update rows),
//! so the snapshot is cheap relative to the store I/O it stands in for.

use std::collections::{BTreeMap, BTreeSet};

use super::{
    AttributeStore, HostAttributes, SchedulerStore, ShardUpdateConfiguration, Storage,
    StorageResult, StoreProvider, TaskStore, UpdateStore,
};
use crate::query::TaskQuery;
use crate::task::ScheduledTask;

#[derive(Debug, Clone, Default)]
struct MemState {
    tasks: BTreeMap<String, ScheduledTask>,
    framework_id: Option<String>,
    updates: BTreeMap<(String, String), Vec<ShardUpdateConfiguration>>,
    host_attributes: BTreeMap<String, HostAttributes>,
}

/// Map-backed [`Storage`].
#[derive(Debug, Default)]
pub struct MemStorage {
    state: MemState,
    snapshot: Option<MemState>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemStorage {
    fn fetch_tasks(&self, query: &TaskQuery) -> StorageResult<Vec<ScheduledTask>> {
        Ok(self
            .state
            .tasks
            .values()
            .filter(|task| query.matches(task))
            .cloned()
            .collect())
    }

    fn fetch_task_ids(&self, query: &TaskQuery) -> StorageResult<BTreeSet<String>> {
        Ok(self
            .state
            .tasks
            .values()
            .filter(|task| query.matches(task))
            .map(|task| task.id().to_string())
            .collect())
    }

    fn save_tasks(&mut self, tasks: &[ScheduledTask]) -> StorageResult<()> {
        for task in tasks {
            self.state.tasks.insert(task.id().to_string(), task.clone());
        }
        Ok(())
    }

    fn mutate_tasks(
        &mut self,
        query: &TaskQuery,
        mutator: &mut dyn FnMut(&mut ScheduledTask),
    ) -> StorageResult<Vec<ScheduledTask>> {
        let mut mutated = Vec::new();
        for task in self.state.tasks.values_mut() {
            if query.matches(task) {
                mutator(task);
                mutated.push(task.clone());
            }
        }
        Ok(mutated)
    }

    fn remove_tasks(&mut self, task_ids: &BTreeSet<String>) -> StorageResult<()> {
        for id in task_ids {
            self.state.tasks.remove(id);
        }
        Ok(())
    }
}

impl SchedulerStore for MemStorage {
    fn fetch_framework_id(&self) -> StorageResult<Option<String>> {
        Ok(self.state.framework_id.clone())
    }

    fn save_framework_id(&mut self, framework_id: &str) -> StorageResult<()> {
        self.state.framework_id = Some(framework_id.to_string());
        Ok(())
    }
}

impl UpdateStore for MemStorage {
    fn fetch_shard_update_config(
        &self,
        role: &str,
        job: &str,
        shard_id: u32,
    ) -> StorageResult<Option<ShardUpdateConfiguration>> {
        Ok(self
            .state
            .updates
            .get(&(role.to_string(), job.to_string()))
            .and_then(|configs| {
                configs
                    .iter()
                    .find(|config| config.shard_id() == Some(shard_id))
                    .cloned()
            }))
    }

    fn fetch_shard_update_configs(
        &self,
        role: &str,
        job: &str,
    ) -> StorageResult<Vec<ShardUpdateConfiguration>> {
        Ok(self
            .state
            .updates
            .get(&(role.to_string(), job.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn fetch_shard_update_configs_for(
        &self,
        role: &str,
        job: &str,
        shard_ids: &BTreeSet<u32>,
    ) -> StorageResult<Vec<ShardUpdateConfiguration>> {
        Ok(self
            .fetch_shard_update_configs(role, job)?
            .into_iter()
            .filter(|config| config.shard_id().is_some_and(|id| shard_ids.contains(&id)))
            .collect())
    }

    fn save_shard_update_configs(
        &mut self,
        role: &str,
        job: &str,
        configs: &[ShardUpdateConfiguration],
    ) -> StorageResult<()> {
        self.state
            .updates
            .entry((role.to_string(), job.to_string()))
            .or_default()
            .extend(configs.iter().cloned());
        Ok(())
    }

    fn remove_shard_update_configs(&mut self, role: &str, job: &str) -> StorageResult<()> {
        self.state
            .updates
            .remove(&(role.to_string(), job.to_string()));
        Ok(())
    }
}

impl AttributeStore for MemStorage {
    fn host_attributes(&self, host: &str) -> StorageResult<Option<HostAttributes>> {
        Ok(self.state.host_attributes.get(host).cloned())
    }

    fn save_host_attributes(&mut self, attributes: HostAttributes) -> StorageResult<()> {
        self.state
            .host_attributes
            .insert(attributes.host.clone(), attributes);
        Ok(())
    }
}

impl StoreProvider for MemStorage {
    fn task_store(&mut self) -> &mut dyn TaskStore {
        self
    }

    fn scheduler_store(&mut self) -> &mut dyn SchedulerStore {
        self
    }

    fn update_store(&mut self) -> &mut dyn UpdateStore {
        self
    }

    fn attribute_store(&self) -> &dyn AttributeStore {
        self
    }
}

impl Storage for MemStorage {
    fn prepare(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn begin(&mut self) -> StorageResult<()> {
        debug_assert!(self.snapshot.is_none(), "transaction already open");
        self.snapshot = Some(self.state.clone());
        Ok(())
    }

    fn commit(&mut self) -> StorageResult<()> {
        self.snapshot = None;
        Ok(())
    }

    fn rollback(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.state = snapshot;
        }
    }

    fn provider(&mut self) -> &mut dyn StoreProvider {
        self
    }

    fn stop(&mut self) {}
}
