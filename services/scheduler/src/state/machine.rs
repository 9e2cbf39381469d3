//! Per-task finite state machine.
//!
//! A [`TaskStateMachine`] enforces the legal transitions of a schedule status
//! and emits [`WorkCommand`]s as side effects of transitions. It holds no
//! reference to the manager or the store: work is pushed into an explicit
//! [`WorkSink`] capability and drained by the transactional envelope inside
//! the same transaction.
//!
//! Machines are transient: the manager builds one per task per transaction,
//! seeded with the persisted record and whether the task's job has an update
//! in progress.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::task::{JobKey, ScheduleStatus, ScheduledTask};

/// Row mutation applied when an `UpdateState` command is drained.
pub type TaskMutation = Box<dyn FnOnce(&mut ScheduledTask) + Send>;

/// Deferred action emitted by a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkCommand {
    /// Persist the machine's current status and run the entry's mutation on
    /// the task row.
    UpdateState,
    /// Clone the task, strip its assignment, link the ancestor, and drive the
    /// clone to PENDING under a fresh id.
    Reschedule,
    /// Invoke the externally supplied kill callback.
    Kill,
    /// Reschedule the shard under the update's new configuration.
    Update,
    /// Reschedule the shard under the update's old configuration.
    Rollback,
    /// Remove the row and clear its host mapping.
    Delete,
    /// Bump the row's failure counter.
    IncrementFailures,
}

/// One item of deferred work: a command plus the machine state it captured.
pub struct WorkEntry {
    pub command: WorkCommand,
    pub task_id: String,
    pub job_key: Option<JobKey>,
    pub prev_status: ScheduleStatus,
    pub status: ScheduleStatus,
    pub audit: Option<String>,
    pub mutation: Option<TaskMutation>,
}

impl std::fmt::Debug for WorkEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkEntry")
            .field("command", &self.command)
            .field("task_id", &self.task_id)
            .field("prev_status", &self.prev_status)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Receives work emitted by state machines.
pub trait WorkSink {
    fn add_work(&mut self, entry: WorkEntry);
}

impl WorkSink for VecDeque<WorkEntry> {
    fn add_work(&mut self, entry: WorkEntry) {
        self.push_back(entry);
    }
}

/// State machine for a single task record.
pub struct TaskStateMachine {
    task_id: String,
    job_key: Option<JobKey>,
    task: Option<ScheduledTask>,
    /// Whether the task's job had an update in progress when this machine was
    /// built (evaluated inside the same transaction).
    update_in_progress: bool,
    missing_grace_ms: i64,
    clock: Arc<dyn Clock>,
    state: ScheduleStatus,
    previous_state: Option<ScheduleStatus>,
}

impl TaskStateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: impl Into<String>,
        job_key: Option<JobKey>,
        task: Option<ScheduledTask>,
        update_in_progress: bool,
        missing_grace_ms: i64,
        clock: Arc<dyn Clock>,
        initial_state: ScheduleStatus,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            job_key,
            task,
            update_in_progress,
            missing_grace_ms,
            clock,
            state: initial_state,
            previous_state: None,
        }
    }

    /// Machine for an id with no backing record.
    pub fn unknown(task_id: impl Into<String>, missing_grace_ms: i64, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            task_id,
            None,
            None,
            // A task that does not exist cannot have an updating job.
            false,
            missing_grace_ms,
            clock,
            ScheduleStatus::Init,
        )
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn job_key(&self) -> Option<&JobKey> {
        self.job_key.as_ref()
    }

    pub fn state(&self) -> ScheduleStatus {
        self.state
    }

    pub fn previous_state(&self) -> Option<ScheduleStatus> {
        self.previous_state
    }

    /// True when the task's last recorded event is older than the
    /// missing-task grace period (a record with no events at all counts as
    /// missing).
    pub fn appears_missing(&self) -> bool {
        let Some(task) = &self.task else {
            return true;
        };
        match task.latest_event() {
            Some(event) => self.clock.now_ms() - event.timestamp_ms > self.missing_grace_ms,
            None => true,
        }
    }

    pub fn update_state(&mut self, status: ScheduleStatus, sink: &mut dyn WorkSink) -> bool {
        self.update_state_full(status, None, None, sink)
    }

    pub fn update_state_with_audit(
        &mut self,
        status: ScheduleStatus,
        audit: Option<String>,
        sink: &mut dyn WorkSink,
    ) -> bool {
        self.update_state_full(status, audit, None, sink)
    }

    /// Attempts a transition to `status`, emitting the transition's work
    /// commands into `sink`. Returns false without touching anything when the
    /// transition is not legal from the current state; terminal states absorb
    /// further callbacks idempotently.
    pub fn update_state_full(
        &mut self,
        status: ScheduleStatus,
        audit: Option<String>,
        mutation: Option<TaskMutation>,
        sink: &mut dyn WorkSink,
    ) -> bool {
        if status == self.state {
            debug!(task_id = %self.task_id, status = %status, "ignoring same-state transition");
            return false;
        }
        if !legal_transition(self.state, status) {
            if self.state.is_terminal() {
                debug!(
                    task_id = %self.task_id,
                    from = %self.state,
                    to = %status,
                    "terminal task absorbed status callback"
                );
            } else {
                warn!(
                    task_id = %self.task_id,
                    from = %self.state,
                    to = %status,
                    "illegal task state transition"
                );
            }
            return false;
        }

        let prev = self.state;
        self.previous_state = Some(prev);
        self.state = status;

        for command in self.commands_for(prev, status) {
            self.emit(command, None, None, sink);
        }
        // UNKNOWN is the delete path: the row is going away, there is no
        // status left to persist.
        if status != ScheduleStatus::Unknown {
            self.emit(WorkCommand::UpdateState, audit, mutation, sink);
        }
        true
    }

    fn emit(
        &self,
        command: WorkCommand,
        audit: Option<String>,
        mutation: Option<TaskMutation>,
        sink: &mut dyn WorkSink,
    ) {
        sink.add_work(WorkEntry {
            command,
            task_id: self.task_id.clone(),
            job_key: self.job_key.clone(),
            prev_status: self.previous_state.unwrap_or(self.state),
            status: self.state,
            audit,
            mutation,
        });
    }

    /// Auxiliary commands a transition emits ahead of its `UpdateState`.
    fn commands_for(&self, prev: ScheduleStatus, next: ScheduleStatus) -> Vec<WorkCommand> {
        use ScheduleStatus::*;

        match next {
            Killing | Preempting | Restarting => vec![WorkCommand::Kill],
            Finished => {
                if self.update_in_progress {
                    vec![WorkCommand::Update]
                } else {
                    Vec::new()
                }
            }
            Failed => {
                let mut commands = vec![WorkCommand::IncrementFailures];
                if self.update_in_progress {
                    // A shard that fails mid-update rolls back to its old
                    // configuration.
                    commands.push(WorkCommand::Rollback);
                } else if self.failure_budget_remains() {
                    commands.push(WorkCommand::Reschedule);
                }
                commands
            }
            Killed => {
                if matches!(prev, Preempting | Restarting) {
                    // The kill was issued to move or restart the task, not to
                    // retire it.
                    vec![WorkCommand::Reschedule]
                } else if self.update_in_progress {
                    vec![WorkCommand::Update]
                } else {
                    Vec::new()
                }
            }
            Lost => vec![WorkCommand::Reschedule],
            Unknown => vec![WorkCommand::Delete],
            _ => Vec::new(),
        }
    }

    fn failure_budget_remains(&self) -> bool {
        let Some(task) = &self.task else {
            return false;
        };
        let max_failures = task.config().max_task_failures;
        // Negative means unlimited retries.
        max_failures < 0 || task.failure_count + 1 < max_failures
    }
}

/// The authoritative edge matrix.
fn legal_transition(from: ScheduleStatus, to: ScheduleStatus) -> bool {
    use ScheduleStatus::*;

    match from {
        Init => matches!(to, Pending | Unknown),
        Pending => matches!(to, Assigned | Killing | Lost | Unknown),
        Assigned => matches!(
            to,
            Starting | Running | Killing | Preempting | Restarting | Failed | Finished | Lost | Unknown
        ),
        Starting => matches!(
            to,
            Running | Killing | Preempting | Restarting | Failed | Finished | Lost | Unknown
        ),
        Running => matches!(
            to,
            Finished | Failed | Killing | Preempting | Restarting | Lost | Unknown
        ),
        // Kill-in-flight states: waiting for the executor's terminal
        // callback.
        Preempting | Restarting | Killing => matches!(to, Killed | Finished | Failed | Lost | Unknown),
        Failed | Finished | Killed | Lost => matches!(to, Unknown),
        Unknown => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::task::{AssignedTask, TaskConfig, TaskEvent};
    use muster_resources::ResourceBag;

    fn config(max_failures: i32) -> TaskConfig {
        TaskConfig {
            role: "r".into(),
            job_name: "j".into(),
            shard_id: 0,
            priority: 0,
            tier: None,
            resources: ResourceBag::empty(),
            max_task_failures: max_failures,
            requested_ports: Vec::new(),
            command: None,
        }
    }

    fn task(status: ScheduleStatus, failure_count: i32, max_failures: i32) -> ScheduledTask {
        let mut t = ScheduledTask::new(AssignedTask::unassigned("t-1".into(), config(max_failures)));
        t.status = status;
        t.failure_count = failure_count;
        t
    }

    fn machine(status: ScheduleStatus, updating: bool, task: Option<ScheduledTask>) -> TaskStateMachine {
        TaskStateMachine::new(
            "t-1",
            Some(JobKey::new("r", "j")),
            task,
            updating,
            60_000,
            Arc::new(ManualClock::new(0)),
            status,
        )
    }

    fn commands(sink: &VecDeque<WorkEntry>) -> Vec<WorkCommand> {
        sink.iter().map(|entry| entry.command).collect()
    }

    #[test]
    fn insert_path_emits_update_state() {
        let mut sink = VecDeque::new();
        let mut m = machine(ScheduleStatus::Init, false, Some(task(ScheduleStatus::Init, 0, 1)));
        assert!(m.update_state(ScheduleStatus::Pending, &mut sink));
        assert_eq!(commands(&sink), vec![WorkCommand::UpdateState]);
        assert_eq!(m.state(), ScheduleStatus::Pending);
        assert_eq!(m.previous_state(), Some(ScheduleStatus::Init));
    }

    #[test]
    fn same_state_is_rejected_without_work() {
        let mut sink = VecDeque::new();
        let mut m = machine(ScheduleStatus::Running, false, Some(task(ScheduleStatus::Running, 0, 1)));
        assert!(!m.update_state(ScheduleStatus::Running, &mut sink));
        assert!(sink.is_empty());
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut sink = VecDeque::new();
        let mut m = machine(ScheduleStatus::Pending, false, Some(task(ScheduleStatus::Pending, 0, 1)));
        assert!(!m.update_state(ScheduleStatus::Running, &mut sink));
        assert!(sink.is_empty());
        assert_eq!(m.state(), ScheduleStatus::Pending);
    }

    #[test]
    fn terminal_states_absorb_callbacks() {
        let mut sink = VecDeque::new();
        let mut m = machine(ScheduleStatus::Finished, false, Some(task(ScheduleStatus::Finished, 0, 1)));
        assert!(!m.update_state(ScheduleStatus::Running, &mut sink));
        assert!(!m.update_state(ScheduleStatus::Killed, &mut sink));
        assert!(sink.is_empty());
    }

    #[test]
    fn kill_states_emit_kill_then_update_state() {
        for target in [
            ScheduleStatus::Killing,
            ScheduleStatus::Preempting,
            ScheduleStatus::Restarting,
        ] {
            let mut sink = VecDeque::new();
            let mut m = machine(ScheduleStatus::Running, false, Some(task(ScheduleStatus::Running, 0, 1)));
            assert!(m.update_state(target, &mut sink), "{target}");
            assert_eq!(commands(&sink), vec![WorkCommand::Kill, WorkCommand::UpdateState]);
        }
    }

    #[test]
    fn failure_within_budget_reschedules() {
        let mut sink = VecDeque::new();
        let mut m = machine(ScheduleStatus::Running, false, Some(task(ScheduleStatus::Running, 0, 3)));
        assert!(m.update_state(ScheduleStatus::Failed, &mut sink));
        assert_eq!(
            commands(&sink),
            vec![
                WorkCommand::IncrementFailures,
                WorkCommand::Reschedule,
                WorkCommand::UpdateState
            ]
        );
    }

    #[test]
    fn failure_at_budget_does_not_reschedule() {
        let mut sink = VecDeque::new();
        let mut m = machine(ScheduleStatus::Running, false, Some(task(ScheduleStatus::Running, 0, 1)));
        assert!(m.update_state(ScheduleStatus::Failed, &mut sink));
        assert_eq!(
            commands(&sink),
            vec![WorkCommand::IncrementFailures, WorkCommand::UpdateState]
        );
    }

    #[test]
    fn unlimited_failures_always_reschedule() {
        let mut sink = VecDeque::new();
        let mut m = machine(ScheduleStatus::Running, false, Some(task(ScheduleStatus::Running, 100, -1)));
        assert!(m.update_state(ScheduleStatus::Failed, &mut sink));
        assert!(commands(&sink).contains(&WorkCommand::Reschedule));
    }

    #[test]
    fn failure_during_update_rolls_back() {
        let mut sink = VecDeque::new();
        let mut m = machine(ScheduleStatus::Running, true, Some(task(ScheduleStatus::Running, 0, 3)));
        assert!(m.update_state(ScheduleStatus::Failed, &mut sink));
        assert_eq!(
            commands(&sink),
            vec![
                WorkCommand::IncrementFailures,
                WorkCommand::Rollback,
                WorkCommand::UpdateState
            ]
        );
    }

    #[test]
    fn finished_during_update_rolls_forward() {
        let mut sink = VecDeque::new();
        let mut m = machine(ScheduleStatus::Running, true, Some(task(ScheduleStatus::Running, 0, 1)));
        assert!(m.update_state(ScheduleStatus::Finished, &mut sink));
        assert_eq!(commands(&sink), vec![WorkCommand::Update, WorkCommand::UpdateState]);
    }

    #[test]
    fn killed_after_preempting_reschedules() {
        let mut sink = VecDeque::new();
        let mut m = machine(ScheduleStatus::Preempting, false, Some(task(ScheduleStatus::Preempting, 0, 1)));
        assert!(m.update_state(ScheduleStatus::Killed, &mut sink));
        assert_eq!(commands(&sink), vec![WorkCommand::Reschedule, WorkCommand::UpdateState]);
    }

    #[test]
    fn killed_after_killing_just_records() {
        let mut sink = VecDeque::new();
        let mut m = machine(ScheduleStatus::Killing, false, Some(task(ScheduleStatus::Killing, 0, 1)));
        assert!(m.update_state(ScheduleStatus::Killed, &mut sink));
        assert_eq!(commands(&sink), vec![WorkCommand::UpdateState]);
    }

    #[test]
    fn lost_reschedules() {
        let mut sink = VecDeque::new();
        let mut m = machine(ScheduleStatus::Assigned, false, Some(task(ScheduleStatus::Assigned, 0, 1)));
        assert!(m.update_state(ScheduleStatus::Lost, &mut sink));
        assert_eq!(commands(&sink), vec![WorkCommand::Reschedule, WorkCommand::UpdateState]);
    }

    #[test]
    fn unknown_emits_delete_only() {
        let mut sink = VecDeque::new();
        let mut m = machine(ScheduleStatus::Running, false, Some(task(ScheduleStatus::Running, 0, 1)));
        assert!(m.update_state(ScheduleStatus::Unknown, &mut sink));
        assert_eq!(commands(&sink), vec![WorkCommand::Delete]);
    }

    #[test]
    fn appears_missing_uses_last_event_age() {
        let clock = Arc::new(ManualClock::new(100_000));
        let mut t = task(ScheduleStatus::Assigned, 0, 1);
        t.task_events.push(TaskEvent {
            timestamp_ms: 50_000,
            status: ScheduleStatus::Assigned,
            message: None,
        });
        let m = TaskStateMachine::new(
            "t-1",
            Some(JobKey::new("r", "j")),
            Some(t.clone()),
            false,
            60_000,
            clock.clone(),
            ScheduleStatus::Assigned,
        );
        assert!(!m.appears_missing());

        clock.advance(20_000);
        assert!(m.appears_missing());
    }

    #[test]
    fn task_without_events_appears_missing() {
        let m = machine(ScheduleStatus::Assigned, false, Some(task(ScheduleStatus::Assigned, 0, 1)));
        assert!(m.appears_missing());
    }
}
