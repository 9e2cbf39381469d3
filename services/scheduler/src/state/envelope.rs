//! Transactional envelope over the pluggable store.
//!
//! [`TransactionalStorage`] serialises mutation, carries the per-transaction
//! work queue and side-effect list, and defers in-memory side effects until
//! the transaction commits. Side effects mutate process-wide state (the
//! per-job status counters and the task → host map) and are only visible
//! outside after a successful commit; on rollback they are discarded together
//! with any undrained work.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use tracing::debug;

use super::machine::WorkEntry;
use crate::storage::{Storage, StorageError, StorageResult, StoreProvider};
use crate::task::{JobKey, ScheduleStatus};

/// Deferred mutation of [`MutableState`], applied after commit in enqueue
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    AdjustCount {
        job: JobKey,
        from: ScheduleStatus,
        to: ScheduleStatus,
    },
    IncrementCount {
        job: JobKey,
        status: ScheduleStatus,
    },
    DecrementCount {
        job: JobKey,
        status: ScheduleStatus,
    },
    AddHost {
        task_id: String,
        host: String,
    },
    RemoveHosts {
        task_ids: Vec<String>,
    },
}

/// Process-wide mutable state: the exact histogram of live task statuses per
/// job, and the assignment map. Mutated only by committed side effects;
/// readers get snapshots.
#[derive(Debug, Default)]
pub struct MutableState {
    counters: BTreeMap<(JobKey, ScheduleStatus), i64>,
    task_hosts: HashMap<String, String>,
}

impl MutableState {
    fn apply(&mut self, effect: SideEffect) {
        match effect {
            SideEffect::AdjustCount { job, from, to } => {
                self.bump(job.clone(), from, -1);
                self.bump(job, to, 1);
            }
            SideEffect::IncrementCount { job, status } => self.bump(job, status, 1),
            SideEffect::DecrementCount { job, status } => self.bump(job, status, -1),
            SideEffect::AddHost { task_id, host } => {
                self.task_hosts.insert(task_id, host);
            }
            SideEffect::RemoveHosts { task_ids } => {
                for task_id in task_ids {
                    self.task_hosts.remove(&task_id);
                }
            }
        }
    }

    fn bump(&mut self, job: JobKey, status: ScheduleStatus, delta: i64) {
        let key = (job, status);
        let slot = self.counters.entry(key.clone()).or_insert(0);
        *slot += delta;
        if *slot == 0 {
            self.counters.remove(&key);
        }
    }

    /// Per `(job, status)` population counters.
    pub fn counters(&self) -> BTreeMap<(JobKey, ScheduleStatus), i64> {
        self.counters.clone()
    }

    pub fn count(&self, job: &JobKey, status: ScheduleStatus) -> i64 {
        self.counters
            .get(&(job.clone(), status))
            .copied()
            .unwrap_or(0)
    }

    pub fn host_of(&self, task_id: &str) -> Option<&str> {
        self.task_hosts.get(task_id).map(String::as_str)
    }

    /// The inverse view: hostname → ids of tasks assigned there.
    pub fn host_assigned_tasks(&self) -> HashMap<String, BTreeSet<String>> {
        let mut by_host: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (task_id, host) in &self.task_hosts {
            by_host.entry(host.clone()).or_default().insert(task_id.clone());
        }
        by_host
    }
}

/// Everything a transaction body may touch: the store, the work queue, and
/// the pending side effects.
pub struct TxContext<'a> {
    pub provider: &'a mut dyn StoreProvider,
    pub work: &'a mut VecDeque<WorkEntry>,
    side_effects: &'a mut Vec<SideEffect>,
}

impl TxContext<'_> {
    pub fn add_side_effect(&mut self, effect: SideEffect) {
        self.side_effects.push(effect);
    }
}

/// Transactional wrapper around the persistent storage and mutable state.
pub struct TransactionalStorage {
    storage: Box<dyn Storage>,
    in_transaction: bool,
    work_queue: VecDeque<WorkEntry>,
    side_effects: Vec<SideEffect>,
    mutable_state: MutableState,
}

impl TransactionalStorage {
    pub fn new(storage: Box<dyn Storage>) -> Self {
        Self {
            storage,
            in_transaction: false,
            work_queue: VecDeque::new(),
            side_effects: Vec::new(),
            mutable_state: MutableState::default(),
        }
    }

    pub fn prepare(&mut self) -> StorageResult<()> {
        assert!(!self.in_transaction, "prepare called inside a transaction");
        self.storage.prepare()
    }

    pub fn stop(&mut self) {
        assert!(!self.in_transaction, "stop called inside a transaction");
        self.storage.stop();
    }

    pub fn mutable_state(&self) -> &MutableState {
        &self.mutable_state
    }

    /// Depth of the work queue; zero at every transaction boundary.
    pub fn work_queue_depth(&self) -> usize {
        self.work_queue.len()
    }

    /// Runs `work` inside a storage transaction.
    ///
    /// The body is responsible for draining the work queue before it returns
    /// (the manager appends its drain loop to every operation); an undrained
    /// queue on success is a logic error. On failure the store is rolled back
    /// and pending work and side effects are discarded.
    pub fn transact<T, E>(&mut self, work: impl FnOnce(&mut TxContext<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        assert!(!self.in_transaction, "transaction already in progress");
        debug_assert!(self.work_queue.is_empty());
        debug_assert!(self.side_effects.is_empty());

        self.in_transaction = true;
        if let Err(e) = self.storage.begin() {
            self.in_transaction = false;
            return Err(e.into());
        }

        let result = {
            let mut ctx = TxContext {
                provider: self.storage.provider(),
                work: &mut self.work_queue,
                side_effects: &mut self.side_effects,
            };
            work(&mut ctx)
        };

        let result = match result {
            Ok(value) => {
                assert!(
                    self.work_queue.is_empty(),
                    "work queue not drained before commit"
                );
                match self.storage.commit() {
                    Ok(()) => {
                        let effects = std::mem::take(&mut self.side_effects);
                        debug!(side_effects = effects.len(), "transaction committed");
                        for effect in effects {
                            self.mutable_state.apply(effect);
                        }
                        Ok(value)
                    }
                    Err(e) => {
                        self.storage.rollback();
                        Err(e.into())
                    }
                }
            }
            Err(e) => {
                self.storage.rollback();
                Err(e)
            }
        };

        self.work_queue.clear();
        self.side_effects.clear();
        self.in_transaction = false;
        result
    }
}
