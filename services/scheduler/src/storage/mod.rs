//! Storage contracts for the scheduler core.
//!
//! The core persists nothing itself; it drives a pluggable [`Storage`]
//! through these interfaces. A backend supplies sub-stores via
//! [`StoreProvider`] and transaction primitives the transactional envelope
//! composes into atomic operations.
//!
//! Two backends ship with the crate: [`MemStorage`] (the reference
//! implementation, also used throughout the test suite) and
//! [`SqliteStorage`] for durable single-node deployments.

mod mem;
mod sqlite;

pub use mem::MemStorage;
pub use sqlite::SqliteStorage;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::query::TaskQuery;
use crate::task::{ScheduledTask, TaskConfig};

/// Errors surfaced by storage backends. The core propagates these verbatim.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Attributes advertised by a slave, keyed by attribute name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAttributes {
    pub host: String,
    pub slave_id: String,
    pub attributes: BTreeMap<String, BTreeSet<String>>,
}

/// Per-shard record of an in-progress rolling update.
///
/// An absent `old_config` means the update adds the shard; an absent
/// `new_config` means the update removes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardUpdateConfiguration {
    pub update_token: String,
    pub old_config: Option<TaskConfig>,
    pub new_config: Option<TaskConfig>,
}

impl ShardUpdateConfiguration {
    /// The shard this row describes, from whichever side is present.
    pub fn shard_id(&self) -> Option<u32> {
        self.new_config
            .as_ref()
            .or(self.old_config.as_ref())
            .map(|config| config.shard_id)
    }
}

/// Store of scheduled task records.
pub trait TaskStore {
    fn fetch_tasks(&self, query: &TaskQuery) -> StorageResult<Vec<ScheduledTask>>;

    fn fetch_task_ids(&self, query: &TaskQuery) -> StorageResult<BTreeSet<String>>;

    fn save_tasks(&mut self, tasks: &[ScheduledTask]) -> StorageResult<()>;

    /// Applies `mutator` to every matching row and returns the mutated rows.
    fn mutate_tasks(
        &mut self,
        query: &TaskQuery,
        mutator: &mut dyn FnMut(&mut ScheduledTask),
    ) -> StorageResult<Vec<ScheduledTask>>;

    fn remove_tasks(&mut self, task_ids: &BTreeSet<String>) -> StorageResult<()>;
}

/// Store of scheduler-level singletons.
pub trait SchedulerStore {
    fn fetch_framework_id(&self) -> StorageResult<Option<String>>;

    fn save_framework_id(&mut self, framework_id: &str) -> StorageResult<()>;
}

/// Store of in-progress rolling updates, one row per shard.
pub trait UpdateStore {
    fn fetch_shard_update_config(
        &self,
        role: &str,
        job: &str,
        shard_id: u32,
    ) -> StorageResult<Option<ShardUpdateConfiguration>>;

    fn fetch_shard_update_configs(
        &self,
        role: &str,
        job: &str,
    ) -> StorageResult<Vec<ShardUpdateConfiguration>>;

    fn fetch_shard_update_configs_for(
        &self,
        role: &str,
        job: &str,
        shard_ids: &BTreeSet<u32>,
    ) -> StorageResult<Vec<ShardUpdateConfiguration>>;

    fn save_shard_update_configs(
        &mut self,
        role: &str,
        job: &str,
        configs: &[ShardUpdateConfiguration],
    ) -> StorageResult<()>;

    fn remove_shard_update_configs(&mut self, role: &str, job: &str) -> StorageResult<()>;
}

/// Read-mostly store of slave attributes.
pub trait AttributeStore {
    fn host_attributes(&self, host: &str) -> StorageResult<Option<HostAttributes>>;

    fn save_host_attributes(&mut self, attributes: HostAttributes) -> StorageResult<()>;
}

/// Hands out the sub-stores inside a transaction.
pub trait StoreProvider {
    fn task_store(&mut self) -> &mut dyn TaskStore;

    fn scheduler_store(&mut self) -> &mut dyn SchedulerStore;

    fn update_store(&mut self) -> &mut dyn UpdateStore;

    fn attribute_store(&self) -> &dyn AttributeStore;
}

/// A pluggable storage backend.
///
/// The transactional envelope owns the call discipline: `begin` is always
/// paired with exactly one `commit` or `rollback`, and `provider` is only
/// used between the two.
pub trait Storage: Send {
    /// Boots the backend. Idempotent.
    fn prepare(&mut self) -> StorageResult<()>;

    fn begin(&mut self) -> StorageResult<()>;

    fn commit(&mut self) -> StorageResult<()>;

    fn rollback(&mut self);

    fn provider(&mut self) -> &mut dyn StoreProvider;

    /// Shuts the backend down. No calls may follow.
    fn stop(&mut self);
}
