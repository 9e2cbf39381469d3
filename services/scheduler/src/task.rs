//! Task data model: configurations, scheduled task records, and statuses.
//!
//! A [`TaskConfig`] is the immutable description of one shard of a job. A
//! [`ScheduledTask`] wraps a config with identity and runtime metadata and is
//! the unit persisted in the task store. Records are only ever mutated
//! through state-machine transitions driven by the state manager.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use muster_resources::ResourceBag;

/// Canonical `role/name` identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub role: String,
    pub name: String,
}

impl JobKey {
    pub fn new(role: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.role, self.name)
    }
}

/// Schedule status of a task record.
///
/// `Init` is the pre-persistence state and `Unknown` marks ids with no
/// backing record; everything else is the runtime lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Init,
    Pending,
    Assigned,
    Starting,
    Running,
    Failed,
    Finished,
    Preempting,
    Restarting,
    Killing,
    Killed,
    Lost,
    Unknown,
}

impl ScheduleStatus {
    /// Statuses from which a task can still make progress.
    pub const ACTIVE: &'static [ScheduleStatus] = &[
        Self::Pending,
        Self::Assigned,
        Self::Starting,
        Self::Running,
        Self::Preempting,
        Self::Restarting,
        Self::Killing,
    ];

    /// Statuses in which the task occupies a slot on a slave. A record is in
    /// `task_hosts` iff its status is in this set.
    pub const ASSIGNED_LIVE: &'static [ScheduleStatus] = &[
        Self::Assigned,
        Self::Starting,
        Self::Running,
        Self::Preempting,
        Self::Restarting,
        Self::Killing,
    ];

    /// Transient statuses subject to the missing-task grace period.
    pub const OUTSTANDING: &'static [ScheduleStatus] = &[
        Self::Assigned,
        Self::Starting,
        Self::Preempting,
        Self::Restarting,
        Self::Killing,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Finished | Self::Killed | Self::Lost)
    }

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    pub fn is_assigned_live(self) -> bool {
        Self::ASSIGNED_LIVE.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Finished => "finished",
            Self::Preempting => "preempting",
            Self::Restarting => "restarting",
            Self::Killing => "killing",
            Self::Killed => "killed",
            Self::Lost => "lost",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "init" => Some(Self::Init),
            "pending" => Some(Self::Pending),
            "assigned" => Some(Self::Assigned),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "failed" => Some(Self::Failed),
            "finished" => Some(Self::Finished),
            "preempting" => Some(Self::Preempting),
            "restarting" => Some(Self::Restarting),
            "killing" => Some(Self::Killing),
            "killed" => Some(Self::Killed),
            "lost" => Some(Self::Lost),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One historical transition of a task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub timestamp_ms: i64,
    pub status: ScheduleStatus,
    pub message: Option<String>,
}

/// Immutable description of a workload unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub role: String,
    pub job_name: String,
    pub shard_id: u32,
    pub priority: i32,
    /// Tier name resolved through the tier manager; `None` falls back to the
    /// default tier.
    pub tier: Option<String>,
    pub resources: ResourceBag,
    /// Reschedule budget: how many failures this shard tolerates before it is
    /// left in `Failed`. Zero means the default is applied at initialize.
    pub max_task_failures: i32,
    /// Named ports the task wants allocated from the slave at assignment.
    pub requested_ports: Vec<String>,
    /// Command template. `%port:NAME%`, `%shard_id%` and `%task_id%` are
    /// expanded when the task is assigned to a slave.
    pub command: Option<String>,
}

impl TaskConfig {
    pub fn job_key(&self) -> JobKey {
        JobKey::new(self.role.clone(), self.job_name.clone())
    }
}

/// A task together with its assignment metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedTask {
    pub task_id: String,
    pub task: TaskConfig,
    pub slave_id: Option<String>,
    pub slave_host: Option<String>,
    pub assigned_ports: BTreeMap<String, u16>,
    /// The command with placeholders expanded, populated at assignment.
    pub expanded_command: Option<String>,
}

impl AssignedTask {
    pub fn unassigned(task_id: String, task: TaskConfig) -> Self {
        Self {
            task_id,
            task,
            slave_id: None,
            slave_host: None,
            assigned_ports: BTreeMap::new(),
            expanded_command: None,
        }
    }
}

/// Mutable record wrapping a [`TaskConfig`] with identity and runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub assigned_task: AssignedTask,
    pub status: ScheduleStatus,
    pub failure_count: i32,
    /// Reschedule lineage: the id of the task this one replaced.
    pub ancestor_id: Option<String>,
    pub task_events: Vec<TaskEvent>,
}

impl ScheduledTask {
    pub fn new(assigned_task: AssignedTask) -> Self {
        Self {
            assigned_task,
            status: ScheduleStatus::Init,
            failure_count: 0,
            ancestor_id: None,
            task_events: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.assigned_task.task_id
    }

    pub fn config(&self) -> &TaskConfig {
        &self.assigned_task.task
    }

    pub fn job_key(&self) -> JobKey {
        self.config().job_key()
    }

    pub fn latest_event(&self) -> Option<&TaskEvent> {
        self.task_events.last()
    }
}

/// Generates a task id that is permanently unique (not guaranteed, but highly
/// confident) and sorts chronologically by default:
/// `<epoch_ms>-<role>/<job>-<shard>-<uuid>`, with any character outside
/// `[A-Za-z0-9_-]` collapsed to `-`.
pub fn generate_task_id(now_ms: i64, task: &TaskConfig) -> String {
    let raw = format!(
        "{}-{}-{}-{}",
        now_ms,
        task.job_key(),
        task.shard_id,
        uuid::Uuid::new_v4()
    );
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Expands the command template of an assigned task.
///
/// Substitutes `%port:NAME%` with the port number allocated for `NAME`,
/// `%shard_id%` and `%task_id%` with their values. Unknown port names are
/// left in place so a misconfigured template stays visible.
pub fn expand_command(assigned: &AssignedTask) -> Option<String> {
    let template = assigned.task.command.as_deref()?;

    let mut expanded = template
        .replace("%shard_id%", &assigned.task.shard_id.to_string())
        .replace("%task_id%", &assigned.task_id);
    for (name, port) in &assigned.assigned_ports {
        expanded = expanded.replace(&format!("%port:{name}%"), &port.to_string());
    }
    Some(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use muster_resources::ResourceKind;

    fn config() -> TaskConfig {
        TaskConfig {
            role: "www".into(),
            job_name: "frontend".into(),
            shard_id: 3,
            priority: 10,
            tier: None,
            resources: ResourceBag::from([(ResourceKind::Cpus, 1.0)]),
            max_task_failures: 1,
            requested_ports: vec!["http".into()],
            command: Some("serve --port=%port:http% --shard=%shard_id%".into()),
        }
    }

    #[test]
    fn job_key_display() {
        assert_eq!(config().job_key().to_string(), "www/frontend");
    }

    #[test]
    fn task_id_is_sanitized_and_sortable() {
        let id = generate_task_id(1_700_000_000_000, &config());
        assert!(id.starts_with("1700000000000-www-frontend-3-"));
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    }

    #[test]
    fn expand_command_substitutes_ports_and_shard() {
        let mut assigned = AssignedTask::unassigned("t-1".into(), config());
        assigned.assigned_ports.insert("http".into(), 31_337);
        assert_eq!(
            expand_command(&assigned).unwrap(),
            "serve --port=31337 --shard=3"
        );
    }

    #[test]
    fn expand_command_without_template_is_none() {
        let mut cfg = config();
        cfg.command = None;
        let assigned = AssignedTask::unassigned("t-1".into(), cfg);
        assert_eq!(expand_command(&assigned), None);
    }

    #[test]
    fn status_sets_are_consistent() {
        for status in ScheduleStatus::ASSIGNED_LIVE {
            assert!(status.is_active(), "{status} should be active");
        }
        for status in ScheduleStatus::OUTSTANDING {
            assert!(status.is_assigned_live(), "{status} should be assigned-live");
        }
        assert!(!ScheduleStatus::Pending.is_assigned_live());
        assert!(ScheduleStatus::Failed.is_terminal());
        assert!(!ScheduleStatus::Killing.is_terminal());
    }
}
