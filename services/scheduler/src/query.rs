//! Immutable task queries.
//!
//! A [`TaskQuery`] is a conjunction of optional predicates over task records.
//! Store backends evaluate queries with [`TaskQuery::matches`]; a backend
//! with indexes is free to satisfy them some other way.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::task::{JobKey, ScheduleStatus, ScheduledTask};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskQuery {
    task_ids: Option<BTreeSet<String>>,
    statuses: Option<BTreeSet<ScheduleStatus>>,
    role: Option<String>,
    job_name: Option<String>,
    shard_ids: Option<BTreeSet<u32>>,
}

impl TaskQuery {
    /// Matches every task.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(task_id: impl Into<String>) -> Self {
        Self::by_ids([task_id.into()])
    }

    pub fn by_ids(task_ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            task_ids: Some(task_ids.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn by_statuses(statuses: impl IntoIterator<Item = ScheduleStatus>) -> Self {
        Self {
            statuses: Some(statuses.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn by_job(job: &JobKey) -> Self {
        Self {
            role: Some(job.role.clone()),
            job_name: Some(job.name.clone()),
            ..Self::default()
        }
    }

    /// Rows of a job in a non-terminal runtime status.
    pub fn active_for(job: &JobKey) -> Self {
        Self {
            statuses: Some(ScheduleStatus::ACTIVE.iter().copied().collect()),
            ..Self::by_job(job)
        }
    }

    /// The active rows of a single shard of a job.
    pub fn live_shard(job: &JobKey, shard_id: u32) -> Self {
        Self {
            shard_ids: Some([shard_id].into()),
            ..Self::active_for(job)
        }
    }

    /// Transient rows subject to the missing-task grace period.
    pub fn outstanding() -> Self {
        Self::by_statuses(ScheduleStatus::OUTSTANDING.iter().copied())
    }

    pub fn matches(&self, task: &ScheduledTask) -> bool {
        if let Some(ids) = &self.task_ids {
            if !ids.contains(task.id()) {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(role) = &self.role {
            if task.config().role != *role {
                return false;
            }
        }
        if let Some(job_name) = &self.job_name {
            if task.config().job_name != *job_name {
                return false;
            }
        }
        if let Some(shard_ids) = &self.shard_ids {
            if !shard_ids.contains(&task.config().shard_id) {
                return false;
            }
        }
        true
    }
}
