//! Preemption engine.
//!
//! The preemptor decides which active tasks on a host may be evicted to make
//! room for a pending task. Victim selection is single-host: the caller
//! iterates hosts and hands this module the candidates on each.
//!
//! A task may preempt another if the resources freed by a set of victims
//! (plus any free slack on the host) satisfy the pending task under the
//! scheduling filter, and every victim is individually eligible: a
//! non-preemptible task may evict preemptible ones, and within a role a
//! higher priority evicts a lower one.

mod victim_filter;

pub use victim_filter::PreemptionVictimFilter;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use muster_resources::ResourceBag;

use crate::task::{ScheduledTask, TaskConfig};

/// Projection of an active task sufficient for victim selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreemptionVictim {
    pub task_id: String,
    pub slave_host: String,
    /// Resources the task currently holds; may include revocable components.
    pub resources: ResourceBag,
    pub config: TaskConfig,
}

impl PreemptionVictim {
    /// Projects an assigned task record; `None` for unassigned records.
    pub fn from_task(task: &ScheduledTask) -> Option<Self> {
        let slave_host = task.assigned_task.slave_host.clone()?;
        Some(Self {
            task_id: task.id().to_string(),
            slave_host,
            resources: task.config().resources.clone(),
            config: task.config().clone(),
        })
    }

    pub fn role(&self) -> &str {
        &self.config.role
    }

    pub fn priority(&self) -> i32 {
        self.config.priority
    }
}

/// An on-host resource envelope: the free resources a slave currently offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostOffer {
    pub hostname: String,
    pub slave_id: String,
    pub resources: ResourceBag,
}

/// Counters exported by the preemption engine.
#[derive(Debug, Default, Clone)]
pub struct PreemptorMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    missing_attributes: AtomicU64,
}

impl PreemptorMetrics {
    pub fn record_missing_attributes(&self) {
        self.inner.missing_attributes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn missing_attributes(&self) -> u64 {
        self.inner.missing_attributes.load(Ordering::Relaxed)
    }
}
