//! Manager of all persistence-related operations for the scheduler.
//!
//! The [`StateManager`] is the single authority for task-record mutation: it
//! owns task creation, assignment, status changes and rollbacks, rolling
//! updates, timeout scanning, and abandonment. Operations run inside the
//! transactional envelope; state machines emit work commands that are drained
//! before commit, and in-memory side effects are applied after it.
//!
//! Every public operation takes `&mut self`: single-writer, multi-reader is
//! enforced by ownership, with callers free to wrap the manager in a lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::envelope::{SideEffect, TransactionalStorage, TxContext};
use super::machine::{TaskMutation, TaskStateMachine, WorkCommand, WorkEntry};
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::query::TaskQuery;
use crate::storage::{ShardUpdateConfiguration, Storage, StorageError, StorageResult};
use crate::task::{
    expand_command, generate_task_id, AssignedTask, JobKey, ScheduleStatus, ScheduledTask,
    TaskConfig, TaskEvent,
};

/// External callback used to kill a task by id.
pub type KillSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Outcome of a rolling update, reported by the updater.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    Success,
    Failed,
}

/// User-visible failures of the update operations. Everything else the
/// manager surfaces is either a propagated store failure or a programmer
/// error.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("No active tasks found for job {job}")]
    NoActiveTasks { job: JobKey },

    #[error("Update already in progress for {job}")]
    InProgress { job: JobKey },

    #[error("Update does not exist for {job}")]
    NotFound { job: JobKey },

    #[error("Invalid update token for {job}")]
    InvalidToken { job: JobKey },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Lifecycle of the manager instance itself: linear and non-repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Created,
    Initialized,
    Started,
    Stopped,
}

#[derive(Debug)]
struct Lifecycle {
    state: ManagerState,
}

impl Lifecycle {
    fn transition(&mut self, to: ManagerState) {
        use ManagerState::*;
        let legal = matches!(
            (self.state, to),
            (Created, Initialized) | (Initialized, Started) | (Started, Stopped)
        );
        assert!(
            legal,
            "illegal manager lifecycle transition {:?} -> {to:?}",
            self.state
        );
        self.state = to;
    }

    fn check(&self, allowed: &[ManagerState]) {
        assert!(
            allowed.contains(&self.state),
            "operation not permitted in manager state {:?} (allowed: {allowed:?})",
            self.state
        );
    }
}

/// Immutable per-transaction environment handed to the drain loop and the
/// in-transaction helpers.
struct TxEnv<'a> {
    clock: &'a Arc<dyn Clock>,
    config: &'a SchedulerConfig,
    kill_task: Option<&'a KillSink>,
}

/// Controller for persisted state-machine transitions and their
/// side effects.
pub struct StateManager {
    txn: TransactionalStorage,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    kill_task: Option<KillSink>,
    lifecycle: Lifecycle,
}

impl StateManager {
    pub fn new(storage: Box<dyn Storage>, clock: Arc<dyn Clock>, config: SchedulerConfig) -> Self {
        Self {
            txn: TransactionalStorage::new(storage),
            clock,
            config,
            kill_task: None,
            lifecycle: Lifecycle {
                state: ManagerState::Created,
            },
        }
    }

    /// Prepares the backing store for possible activation. Idempotent.
    pub fn prepare(&mut self) -> StorageResult<()> {
        self.txn.prepare()
    }

    /// Loads persisted tasks, applies config defaults, and seeds the
    /// in-memory counters and host map. Returns the persisted framework id.
    pub fn initialize(&mut self) -> StorageResult<Option<String>> {
        self.lifecycle.transition(ManagerState::Initialized);

        let framework_id = self.in_transaction(|env, ctx| {
            let default_max_failures = env.config.max_task_failures_default;
            let tasks = ctx.provider.task_store().mutate_tasks(
                &TaskQuery::all(),
                &mut |task| apply_defaults(&mut task.assigned_task.task, default_max_failures),
            )?;

            for task in &tasks {
                ctx.add_side_effect(SideEffect::IncrementCount {
                    job: task.job_key(),
                    status: task.status,
                });
                if task.status.is_assigned_live() {
                    if let Some(host) = &task.assigned_task.slave_host {
                        ctx.add_side_effect(SideEffect::AddHost {
                            task_id: task.id().to_string(),
                            host: host.clone(),
                        });
                    }
                }
            }

            info!(tasks = tasks.len(), "storage initialization complete");
            ctx.provider.scheduler_store().fetch_framework_id()
        })?;

        Ok(framework_id)
    }

    /// Persists the framework id assigned by the cluster core.
    pub fn set_framework_id(&mut self, framework_id: &str) -> StorageResult<()> {
        assert!(!framework_id.is_empty(), "framework id must not be blank");
        self.lifecycle
            .check(&[ManagerState::Initialized, ManagerState::Started]);

        self.in_transaction(|_env, ctx| {
            ctx.provider.scheduler_store().save_framework_id(framework_id)
        })
    }

    /// Registers the kill callback and enables runtime operations.
    pub fn start(&mut self, kill_task: KillSink) {
        self.lifecycle.transition(ManagerState::Started);
        self.kill_task = Some(kill_task);
    }

    /// Stops the manager and shuts down the backing store.
    pub fn stop(&mut self) {
        self.lifecycle.transition(ManagerState::Stopped);
        self.txn.stop();
    }

    /// Creates records in INIT, persists them, and drives each to PENDING.
    /// Returns the generated task ids.
    pub fn insert_tasks(
        &mut self,
        configs: impl IntoIterator<Item = TaskConfig>,
    ) -> StorageResult<BTreeSet<String>> {
        self.lifecycle
            .check(&[ManagerState::Initialized, ManagerState::Started]);

        let now = self.clock.now_ms();
        let tasks: Vec<ScheduledTask> = configs
            .into_iter()
            .map(|config| {
                let task_id = generate_task_id(now, &config);
                ScheduledTask::new(AssignedTask::unassigned(task_id, config))
            })
            .collect();
        let ids: BTreeSet<String> = tasks.iter().map(|task| task.id().to_string()).collect();

        self.in_transaction(|env, ctx| {
            ctx.provider.task_store().save_tasks(&tasks)?;
            for task in &tasks {
                let mut machine = create_state_machine(env, ctx, task, ScheduleStatus::Init)?;
                machine.update_state(ScheduleStatus::Pending, ctx.work);
            }
            Ok::<(), StorageError>(())
        })?;

        Ok(ids)
    }

    /// Transitions all tasks matching the query to `status`. Returns the
    /// number of successful transitions.
    pub fn change_state(
        &mut self,
        query: &TaskQuery,
        status: ScheduleStatus,
    ) -> StorageResult<usize> {
        self.change_state_with_audit(query, status, None)
    }

    pub fn change_state_with_audit(
        &mut self,
        query: &TaskQuery,
        status: ScheduleStatus,
        audit: Option<&str>,
    ) -> StorageResult<usize> {
        self.lifecycle
            .check(&[ManagerState::Initialized, ManagerState::Started]);

        let audit = audit.map(String::from);
        self.in_transaction(|env, ctx| {
            let ids = ctx.provider.task_store().fetch_task_ids(query)?;
            change_state_in_tx(env, ctx, &ids, &mut |machine, ctx| {
                machine.update_state_with_audit(status, audit.clone(), ctx.work)
            })
        })
    }

    /// Assigns a task to a slave: advances PENDING → ASSIGNED with a mutation
    /// stamping the host, slave id, and allocated ports, and expanding the
    /// command template. Returns the updated assignment, or `None` when the
    /// task was not found or not in PENDING.
    pub fn assign_task(
        &mut self,
        task_id: &str,
        slave_host: &str,
        slave_id: &str,
        ports: &[u16],
    ) -> StorageResult<Option<AssignedTask>> {
        assert!(!task_id.is_empty(), "task id must not be blank");
        assert!(!slave_host.is_empty(), "slave host must not be blank");
        self.lifecycle
            .check(&[ManagerState::Initialized, ManagerState::Started]);

        let result: Arc<OnceLock<AssignedTask>> = Arc::new(OnceLock::new());
        let cell = Arc::clone(&result);
        let slave_host = slave_host.to_string();
        let slave_id = slave_id.to_string();
        let ports = ports.to_vec();

        self.in_transaction(move |env, ctx| {
            let ids = ctx
                .provider
                .task_store()
                .fetch_task_ids(&TaskQuery::by_id(task_id))?;
            change_state_in_tx(env, ctx, &ids, &mut |machine, ctx| {
                let cell = Arc::clone(&cell);
                let slave_host = slave_host.clone();
                let slave_id = slave_id.clone();
                let ports = ports.clone();
                let host_for_effect = slave_host.clone();

                let mutation: TaskMutation = Box::new(move |task| {
                    let assigned = &mut task.assigned_task;
                    assigned.slave_host = Some(slave_host);
                    assigned.slave_id = Some(slave_id);
                    assigned.assigned_ports = assigned
                        .task
                        .requested_ports
                        .iter()
                        .cloned()
                        .zip(ports.iter().copied())
                        .collect();
                    assigned.expanded_command = expand_command(assigned);
                    // Single-slot result: a second write means the identity
                    // query matched more than one row.
                    assert!(
                        cell.set(assigned.clone()).is_ok(),
                        "more than one result was found for an identity query"
                    );
                });

                if machine.update_state_full(ScheduleStatus::Assigned, None, Some(mutation), ctx.work)
                {
                    ctx.add_side_effect(SideEffect::AddHost {
                        task_id: machine.task_id().to_string(),
                        host: host_for_effect,
                    });
                    true
                } else {
                    false
                }
            })?;
            Ok::<(), StorageError>(())
        })?;

        Ok(result.get().cloned())
    }

    /// Fetches all tasks matching a query. Read-only snapshot.
    pub fn fetch_tasks(&mut self, query: &TaskQuery) -> StorageResult<Vec<ScheduledTask>> {
        self.lifecycle
            .check(&[ManagerState::Initialized, ManagerState::Started]);
        self.in_transaction(|_env, ctx| ctx.provider.task_store().fetch_tasks(query))
    }

    /// Fetches the ids of all tasks matching a query.
    pub fn fetch_task_ids(&mut self, query: &TaskQuery) -> StorageResult<BTreeSet<String>> {
        self.lifecycle
            .check(&[ManagerState::Initialized, ManagerState::Started]);
        self.in_transaction(|_env, ctx| ctx.provider.task_store().fetch_task_ids(query))
    }

    /// Registers a rolling update for a job. Fails when the job has no active
    /// tasks or an update is already in progress. Returns the update token.
    pub fn register_update(
        &mut self,
        role: &str,
        job: &str,
        updated_tasks: Vec<TaskConfig>,
    ) -> Result<String, UpdateError> {
        assert!(!role.is_empty(), "role must not be blank");
        assert!(!job.is_empty(), "job must not be blank");
        assert!(!updated_tasks.is_empty(), "updated tasks must not be empty");
        self.lifecycle
            .check(&[ManagerState::Initialized, ManagerState::Started]);

        let job_key = JobKey::new(role, job);
        let role = role.to_string();
        let job = job.to_string();

        self.in_transaction(move |_env, ctx| {
            let existing = ctx
                .provider
                .task_store()
                .fetch_tasks(&TaskQuery::active_for(&job_key))?;
            if existing.is_empty() {
                return Err(UpdateError::NoActiveTasks { job: job_key });
            }

            if ctx
                .provider
                .update_store()
                .fetch_shard_update_config(&role, &job, 0)?
                .is_some()
            {
                return Err(UpdateError::InProgress { job: job_key });
            }

            let old_shards: BTreeMap<u32, TaskConfig> = existing
                .iter()
                .map(|task| (task.config().shard_id, task.config().clone()))
                .collect();
            let new_shards: BTreeMap<u32, TaskConfig> = updated_tasks
                .into_iter()
                .map(|config| (config.shard_id, config))
                .collect();

            let update_token = Uuid::new_v4().to_string();
            let shards: BTreeSet<u32> =
                old_shards.keys().chain(new_shards.keys()).copied().collect();
            let rows: Vec<ShardUpdateConfiguration> = shards
                .into_iter()
                .map(|shard| ShardUpdateConfiguration {
                    update_token: update_token.clone(),
                    old_config: old_shards.get(&shard).cloned(),
                    new_config: new_shards.get(&shard).cloned(),
                })
                .collect();

            ctx.provider
                .update_store()
                .save_shard_update_configs(&role, &job, &rows)?;
            info!(job = %job_key, shards = rows.len(), "registered update");
            Ok(update_token)
        })
    }

    /// Terminates an in-progress update. On SUCCESS, live shards the update
    /// removed are killed. The update rows are cleared in every case.
    pub fn finish_update(
        &mut self,
        role: &str,
        job: &str,
        update_token: Option<&str>,
        result: UpdateResult,
    ) -> Result<(), UpdateError> {
        assert!(!role.is_empty(), "role must not be blank");
        assert!(!job.is_empty(), "job must not be blank");
        self.lifecycle
            .check(&[ManagerState::Initialized, ManagerState::Started]);

        let job_key = JobKey::new(role, job);

        self.in_transaction(move |env, ctx| {
            // All shards of a job share one token, so shard 0, which always
            // exists for a registered update, is enough to check.
            let Some(shard_zero) = ctx
                .provider
                .update_store()
                .fetch_shard_update_config(role, job, 0)?
            else {
                return Err(UpdateError::NotFound { job: job_key });
            };

            if let Some(token) = update_token {
                if token != shard_zero.update_token {
                    return Err(UpdateError::InvalidToken { job: job_key });
                }
            }

            if result == UpdateResult::Success {
                let rows = ctx
                    .provider
                    .update_store()
                    .fetch_shard_update_configs(role, job)?;
                let removed_shards: Vec<u32> = rows
                    .iter()
                    .filter(|row| row.new_config.is_none())
                    .filter_map(|row| row.old_config.as_ref().map(|config| config.shard_id))
                    .collect();

                for shard in removed_shards {
                    let ids = ctx
                        .provider
                        .task_store()
                        .fetch_task_ids(&TaskQuery::live_shard(&job_key, shard))?;
                    change_state_in_tx(env, ctx, &ids, &mut |machine, ctx| {
                        machine.update_state_with_audit(
                            ScheduleStatus::Killing,
                            Some("Removed during update.".to_string()),
                            ctx.work,
                        )
                    })?;
                }
            }

            ctx.provider
                .update_store()
                .remove_shard_update_configs(role, job)?;
            info!(job = %job_key, ?result, "finished update");
            Ok(())
        })
    }

    /// The updated configurations of the requested shards.
    pub fn fetch_updated_task_configs(
        &mut self,
        role: &str,
        job: &str,
        shards: &BTreeSet<u32>,
    ) -> StorageResult<Vec<TaskConfig>> {
        assert!(!shards.is_empty(), "shards must not be empty");
        self.lifecycle
            .check(&[ManagerState::Initialized, ManagerState::Started]);

        self.in_transaction(|_env, ctx| {
            let configs = ctx
                .provider
                .update_store()
                .fetch_shard_update_configs_for(role, job, shards)?;
            Ok(configs
                .into_iter()
                .filter_map(|config| config.new_config)
                .collect())
        })
    }

    /// Abandons records of the given tasks, simulating an executor reporting
    /// them missing. The rows are deleted after the state machines have run
    /// their DELETE work against them.
    pub fn abandon_tasks(&mut self, task_ids: &BTreeSet<String>) -> StorageResult<()> {
        assert!(!task_ids.is_empty(), "task ids must not be empty");
        self.lifecycle.check(&[ManagerState::Started]);

        self.in_transaction(|env, ctx| {
            let mut machines = state_machines_for(env, ctx, task_ids)?;
            for machine in &mut machines {
                machine.update_state_with_audit(
                    ScheduleStatus::Unknown,
                    Some("Dead executor.".to_string()),
                    ctx.work,
                );
            }

            // The DELETE work needs the rows in place; drain before removing
            // whatever is left.
            drain_work_queue(env, ctx)?;
            delete_tasks_in_tx(ctx, task_ids)
        })
    }

    /// Kills outstanding tasks whose last event is older than the
    /// missing-task grace period. The cluster core is expected to answer each
    /// kill of a task it no longer knows with a TASK_LOST callback.
    pub fn scan_outstanding_tasks(&mut self) -> StorageResult<()> {
        self.lifecycle.check(&[ManagerState::Started]);

        let outstanding = self.fetch_tasks(&TaskQuery::outstanding())?;
        if outstanding.is_empty() {
            return Ok(());
        }
        info!(count = outstanding.len(), "checking outstanding tasks");

        for task in outstanding {
            let machine = TaskStateMachine::new(
                task.id().to_string(),
                Some(task.job_key()),
                Some(task.clone()),
                false,
                self.config.missing_task_grace_ms,
                Arc::clone(&self.clock),
                task.status,
            );
            if machine.appears_missing() {
                info!(task_id = %machine.task_id(), "attempting to kill missing task");
                match &self.kill_task {
                    Some(kill) => kill(machine.task_id()),
                    None => error!(
                        task_id = %machine.task_id(),
                        "attempted to kill task before kill callback registered"
                    ),
                }
            }
        }
        Ok(())
    }

    /// Hostname → ids of the tasks currently assigned there. Snapshot.
    pub fn get_host_assigned_tasks(&self) -> HashMap<String, BTreeSet<String>> {
        self.txn.mutable_state().host_assigned_tasks()
    }

    /// The per `(job, status)` task population counters. Snapshot.
    pub fn task_counters(&self) -> BTreeMap<(JobKey, ScheduleStatus), i64> {
        self.txn.mutable_state().counters()
    }

    /// Depth of the state-machine work queue; zero between transactions.
    pub fn work_queue_depth(&self) -> usize {
        self.txn.work_queue_depth()
    }

    /// Runs `work` in a transaction and drains the work queue before commit.
    fn in_transaction<T, E>(
        &mut self,
        work: impl FnOnce(&TxEnv<'_>, &mut TxContext<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let Self {
            txn,
            clock,
            config,
            kill_task,
            ..
        } = self;
        let env = TxEnv {
            clock: &*clock,
            config: &*config,
            kill_task: kill_task.as_ref(),
        };

        txn.transact(|ctx| {
            let value = work(&env, ctx)?;
            drain_work_queue(&env, ctx)?;
            Ok(value)
        })
    }
}

fn apply_defaults(config: &mut TaskConfig, default_max_failures: i32) {
    if config.max_task_failures == 0 {
        config.max_task_failures = default_max_failures;
    }
}

fn update_in_progress(ctx: &mut TxContext<'_>, job: &JobKey) -> StorageResult<bool> {
    // Shard 0 always exists for a registered update.
    Ok(ctx
        .provider
        .update_store()
        .fetch_shard_update_config(&job.role, &job.name, 0)?
        .is_some())
}

/// Builds the machine for a brand-new record and registers its side effects:
/// the counter slot for the initial status, and the host mapping when the
/// record is already assigned.
fn create_state_machine(
    env: &TxEnv<'_>,
    ctx: &mut TxContext<'_>,
    task: &ScheduledTask,
    initial_state: ScheduleStatus,
) -> StorageResult<TaskStateMachine> {
    let job_key = task.job_key();
    let updating = update_in_progress(ctx, &job_key)?;

    ctx.add_side_effect(SideEffect::IncrementCount {
        job: job_key.clone(),
        status: initial_state,
    });
    if initial_state.is_assigned_live() {
        if let Some(host) = &task.assigned_task.slave_host {
            ctx.add_side_effect(SideEffect::AddHost {
                task_id: task.id().to_string(),
                host: host.clone(),
            });
        }
    }

    Ok(TaskStateMachine::new(
        task.id().to_string(),
        Some(job_key),
        Some(task.clone()),
        updating,
        env.config.missing_task_grace_ms,
        Arc::clone(env.clock),
        initial_state,
    ))
}

/// Machines for a set of ids. Existing rows get a machine at their persisted
/// status; unknown ids get a machine driven straight to UNKNOWN, which queues
/// the deletion of whatever the id refers to.
fn state_machines_for(
    env: &TxEnv<'_>,
    ctx: &mut TxContext<'_>,
    task_ids: &BTreeSet<String>,
) -> StorageResult<Vec<TaskStateMachine>> {
    let tasks = ctx
        .provider
        .task_store()
        .fetch_tasks(&TaskQuery::by_ids(task_ids.iter().cloned()))?;
    let mut by_id: HashMap<String, ScheduledTask> = tasks
        .into_iter()
        .map(|task| (task.id().to_string(), task))
        .collect();

    let mut machines = Vec::with_capacity(task_ids.len());
    for task_id in task_ids {
        match by_id.remove(task_id) {
            Some(task) => {
                let job_key = task.job_key();
                let updating = update_in_progress(ctx, &job_key)?;
                machines.push(TaskStateMachine::new(
                    task_id.clone(),
                    Some(job_key),
                    Some(task.clone()),
                    updating,
                    env.config.missing_task_grace_ms,
                    Arc::clone(env.clock),
                    task.status,
                ));
            }
            None => {
                debug!(task_id = %task_id, "no record for task id, marking unknown");
                let mut machine = TaskStateMachine::unknown(
                    task_id.clone(),
                    env.config.missing_task_grace_ms,
                    Arc::clone(env.clock),
                );
                machine.update_state(ScheduleStatus::Unknown, ctx.work);
                machines.push(machine);
            }
        }
    }
    Ok(machines)
}

/// Applies a state change to every machine for `task_ids`, returning how many
/// transitions succeeded.
fn change_state_in_tx(
    env: &TxEnv<'_>,
    ctx: &mut TxContext<'_>,
    task_ids: &BTreeSet<String>,
    change: &mut dyn FnMut(&mut TaskStateMachine, &mut TxContext<'_>) -> bool,
) -> StorageResult<usize> {
    let mut machines = state_machines_for(env, ctx, task_ids)?;
    let mut count = 0;
    for machine in &mut machines {
        if change(machine, ctx) {
            count += 1;
        }
    }
    Ok(count)
}

/// Drains the work queue inside the open transaction. Work may enqueue
/// further work (a reschedule drives its clone to PENDING); the loop runs
/// until the queue is empty.
fn drain_work_queue(env: &TxEnv<'_>, ctx: &mut TxContext<'_>) -> StorageResult<()> {
    while let Some(entry) = ctx.work.pop_front() {
        let WorkEntry {
            command,
            task_id,
            job_key,
            prev_status,
            status,
            audit,
            mutation,
        } = entry;

        match command {
            WorkCommand::Kill => match env.kill_task {
                Some(kill) => kill(&task_id),
                None => error!(
                    task_id = %task_id,
                    "attempted to kill task before kill callback registered"
                ),
            },

            WorkCommand::UpdateState => {
                let now = env.clock.now_ms();
                let mut mutation = mutation;
                ctx.provider
                    .task_store()
                    .mutate_tasks(&TaskQuery::by_id(&task_id), &mut |task| {
                        task.status = status;
                        task.task_events.push(TaskEvent {
                            timestamp_ms: now,
                            status,
                            message: audit.clone(),
                        });
                        if let Some(mutate) = mutation.take() {
                            mutate(task);
                        }
                    })?;
                if let Some(job) = job_key {
                    ctx.add_side_effect(SideEffect::AdjustCount {
                        job,
                        from: prev_status,
                        to: status,
                    });
                }
                // A task only occupies a host slot while assigned-live.
                if prev_status.is_assigned_live() && !status.is_assigned_live() {
                    ctx.add_side_effect(SideEffect::RemoveHosts {
                        task_ids: vec![task_id],
                    });
                }
            }

            WorkCommand::Reschedule => {
                let rows = ctx
                    .provider
                    .task_store()
                    .fetch_tasks(&TaskQuery::by_id(&task_id))?;
                let Some(old) = rows.into_iter().next() else {
                    warn!(task_id = %task_id, "task to reschedule no longer exists");
                    continue;
                };

                let mut task = old;
                task.assigned_task.slave_id = None;
                task.assigned_task.slave_host = None;
                task.assigned_task.assigned_ports.clear();
                task.assigned_task.expanded_command = None;
                task.task_events.clear();
                task.ancestor_id = Some(task_id.clone());
                task.status = ScheduleStatus::Init;
                let new_task_id = generate_task_id(env.clock.now_ms(), task.config());
                task.assigned_task.task_id = new_task_id;

                info!(task_id = %task_id, new_task_id = %task.id(), "task being rescheduled");
                ctx.provider
                    .task_store()
                    .save_tasks(std::slice::from_ref(&task))?;
                let mut machine = create_state_machine(env, ctx, &task, ScheduleStatus::Init)?;
                machine.update_state_with_audit(
                    ScheduleStatus::Pending,
                    Some("Rescheduled".to_string()),
                    ctx.work,
                );
            }

            WorkCommand::Update => maybe_reschedule_for_update(env, ctx, &task_id, false)?,
            WorkCommand::Rollback => maybe_reschedule_for_update(env, ctx, &task_id, true)?,

            WorkCommand::Delete => {
                delete_tasks_in_tx(ctx, &BTreeSet::from([task_id]))?;
            }

            WorkCommand::IncrementFailures => {
                ctx.provider
                    .task_store()
                    .mutate_tasks(&TaskQuery::by_id(&task_id), &mut |task| {
                        task.failure_count += 1;
                    })?;
            }
        }
    }
    Ok(())
}

/// Reschedules a shard under its update's target configuration: the new
/// config when rolling forward, the old one when rolling back. An absent
/// update row means the update finished underneath us; an absent target
/// config means the update removed the shard.
fn maybe_reschedule_for_update(
    env: &TxEnv<'_>,
    ctx: &mut TxContext<'_>,
    task_id: &str,
    rolling_back: bool,
) -> StorageResult<()> {
    let rows = ctx
        .provider
        .task_store()
        .fetch_tasks(&TaskQuery::by_id(task_id))?;
    let Some(old_task) = rows.into_iter().next() else {
        warn!(task_id = %task_id, "task to update no longer exists");
        return Ok(());
    };

    let old_config = old_task.config();
    let update_config = ctx.provider.update_store().fetch_shard_update_config(
        &old_config.role,
        &old_config.job_name,
        old_config.shard_id,
    )?;

    let Some(update_config) = update_config else {
        warn!(
            job = %old_config.job_key(),
            shard = old_config.shard_id,
            "no update configuration found, assuming update has finished"
        );
        return Ok(());
    };

    let target = if rolling_back {
        update_config.old_config
    } else {
        update_config.new_config
    };
    let Some(target) = target else {
        // The updated configuration removed the shard, nothing to reschedule.
        return Ok(());
    };

    let new_task_id = generate_task_id(env.clock.now_ms(), &target);
    let mut task = ScheduledTask::new(AssignedTask::unassigned(new_task_id, target));
    task.ancestor_id = Some(task_id.to_string());

    ctx.provider
        .task_store()
        .save_tasks(std::slice::from_ref(&task))?;
    let mut machine = create_state_machine(env, ctx, &task, ScheduleStatus::Init)?;
    machine.update_state_with_audit(
        ScheduleStatus::Pending,
        Some(format!(
            "Rescheduled after {}",
            if rolling_back { "rollback." } else { "update." }
        )),
        ctx.work,
    );
    Ok(())
}

/// Removes rows and registers the matching counter and host-map side
/// effects.
fn delete_tasks_in_tx(ctx: &mut TxContext<'_>, task_ids: &BTreeSet<String>) -> StorageResult<()> {
    let tasks = ctx
        .provider
        .task_store()
        .fetch_tasks(&TaskQuery::by_ids(task_ids.iter().cloned()))?;
    for task in &tasks {
        ctx.add_side_effect(SideEffect::DecrementCount {
            job: task.job_key(),
            status: task.status,
        });
    }

    ctx.provider.task_store().remove_tasks(task_ids)?;
    ctx.add_side_effect(SideEffect::RemoveHosts {
        task_ids: task_ids.iter().cloned().collect(),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemStorage;
    use muster_resources::ResourceBag;

    fn manager() -> StateManager {
        StateManager::new(
            Box::new(MemStorage::new()),
            Arc::new(ManualClock::new(1_000)),
            SchedulerConfig::default(),
        )
    }

    fn config(shard: u32) -> TaskConfig {
        TaskConfig {
            role: "www".into(),
            job_name: "frontend".into(),
            shard_id: shard,
            priority: 0,
            tier: None,
            resources: ResourceBag::empty(),
            max_task_failures: 1,
            requested_ports: Vec::new(),
            command: None,
        }
    }

    #[test]
    #[should_panic(expected = "illegal manager lifecycle transition")]
    fn lifecycle_cannot_skip_initialize() {
        let mut m = manager();
        m.start(Arc::new(|_| {}));
    }

    #[test]
    #[should_panic(expected = "operation not permitted in manager state")]
    fn operations_require_initialize() {
        let mut m = manager();
        let _ = m.insert_tasks(vec![config(0)]);
    }

    #[test]
    #[should_panic(expected = "operation not permitted in manager state")]
    fn abandon_requires_started() {
        let mut m = manager();
        m.initialize().unwrap();
        let _ = m.abandon_tasks(&BTreeSet::from(["t".to_string()]));
    }

    #[test]
    fn insert_drives_tasks_to_pending() {
        let mut m = manager();
        m.prepare().unwrap();
        assert_eq!(m.initialize().unwrap(), None);

        let ids = m.insert_tasks(vec![config(0), config(1)]).unwrap();
        assert_eq!(ids.len(), 2);

        let tasks = m.fetch_tasks(&TaskQuery::all()).unwrap();
        assert_eq!(tasks.len(), 2);
        for task in &tasks {
            assert_eq!(task.status, ScheduleStatus::Pending);
            assert_eq!(task.task_events.len(), 1);
            assert_eq!(task.config().max_task_failures, 1);
        }

        let job = JobKey::new("www", "frontend");
        assert_eq!(
            m.task_counters().get(&(job, ScheduleStatus::Pending)),
            Some(&2)
        );
        assert_eq!(m.work_queue_depth(), 0);
    }

    #[test]
    fn change_state_to_current_status_is_a_no_op() {
        let mut m = manager();
        m.initialize().unwrap();
        let ids = m.insert_tasks(vec![config(0)]).unwrap();
        let query = TaskQuery::by_ids(ids.iter().cloned());

        let count = m.change_state(&query, ScheduleStatus::Pending).unwrap();
        assert_eq!(count, 0);

        let job = JobKey::new("www", "frontend");
        assert_eq!(m.task_counters().get(&(job, ScheduleStatus::Pending)), Some(&1));
    }

    #[test]
    #[should_panic(expected = "framework id must not be blank")]
    fn blank_framework_id_is_a_programmer_error() {
        let mut m = manager();
        m.initialize().unwrap();
        let _ = m.set_framework_id("");
    }
}
