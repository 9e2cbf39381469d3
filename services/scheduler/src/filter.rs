//! Scheduling feasibility filter contract.
//!
//! The concrete veto engine (constraint matching, limits, maintenance) is an
//! external collaborator; the core only depends on this interface. An empty
//! veto set means the request fits the offered resources on that host.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use muster_resources::ResourceBag;

use crate::storage::HostAttributes;
use crate::task::TaskConfig;

/// A reason a task cannot be placed on a host.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Veto {
    pub reason: String,
    /// Relative severity, used by callers to rank near-misses.
    pub score: i32,
}

impl Veto {
    pub fn insufficient_resources(kind: impl Into<String>, score: i32) -> Self {
        Self {
            reason: format!("insufficient {}", kind.into()),
            score,
        }
    }
}

/// Resources currently unclaimed on a host, together with its attributes.
#[derive(Debug, Clone)]
pub struct UnusedResource {
    pub resources: ResourceBag,
    pub attributes: HostAttributes,
}

/// The pending task's demand: its config, the full resource footprint
/// (declared resources plus executor overhead), and the aggregate placement
/// state of its job.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub task: TaskConfig,
    pub resources: ResourceBag,
    pub job_state: AttributeAggregate,
}

/// Aggregate of host-attribute values across a job's active tasks, consumed
/// by constraint-checking filters. Opaque to the core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeAggregate {
    counts: std::collections::BTreeMap<(String, String), u64>,
}

impl AttributeAggregate {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = ((String, String), u64)>) -> Self {
        Self {
            counts: pairs.into_iter().collect(),
        }
    }

    /// How many active tasks of the job run on hosts where `name` has
    /// `value`.
    pub fn count(&self, name: &str, value: &str) -> u64 {
        self.counts
            .get(&(name.to_string(), value.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

/// Decides whether a resource request fits an unused resource envelope.
pub trait SchedulingFilter: Send + Sync {
    /// Returns the vetoes preventing placement; empty means admissible.
    fn filter(&self, unused: &UnusedResource, request: &ResourceRequest) -> BTreeSet<Veto>;
}

/// The capacity dimension of feasibility: one veto per resource kind the
/// host cannot cover. Constraint and limit checking live in the full veto
/// engine outside the core; this filter is what embedded deployments and the
/// preemption tests run against.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResourceCapacityFilter;

impl SchedulingFilter for ResourceCapacityFilter {
    fn filter(&self, unused: &UnusedResource, request: &ResourceRequest) -> BTreeSet<Veto> {
        request
            .resources
            .iter()
            .filter(|(kind, wanted)| unused.resources.value_of(*kind) < *wanted)
            .map(|(kind, wanted)| {
                let available = unused.resources.value_of(kind);
                let shortfall = ((wanted - available) / wanted.max(1.0) * 100.0) as i32;
                Veto::insufficient_resources(kind.as_str(), shortfall.clamp(1, 100))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muster_resources::ResourceKind;

    fn request(resources: ResourceBag) -> ResourceRequest {
        ResourceRequest {
            task: TaskConfig {
                role: "r".into(),
                job_name: "j".into(),
                shard_id: 0,
                priority: 0,
                tier: None,
                resources: resources.clone(),
                max_task_failures: 1,
                requested_ports: Vec::new(),
                command: None,
            },
            resources,
            job_state: AttributeAggregate::empty(),
        }
    }

    fn unused(resources: ResourceBag) -> UnusedResource {
        UnusedResource {
            resources,
            attributes: HostAttributes::default(),
        }
    }

    #[test]
    fn sufficient_resources_produce_no_vetoes() {
        let vetoes = ResourceCapacityFilter.filter(
            &unused(ResourceBag::from([
                (ResourceKind::Cpus, 4.0),
                (ResourceKind::RamMb, 4096.0),
            ])),
            &request(ResourceBag::from([
                (ResourceKind::Cpus, 2.0),
                (ResourceKind::RamMb, 2048.0),
            ])),
        );
        assert!(vetoes.is_empty());
    }

    #[test]
    fn each_missing_kind_vetoes_separately() {
        let vetoes = ResourceCapacityFilter.filter(
            &unused(ResourceBag::from([(ResourceKind::Cpus, 1.0)])),
            &request(ResourceBag::from([
                (ResourceKind::Cpus, 2.0),
                (ResourceKind::RamMb, 512.0),
            ])),
        );
        let reasons: Vec<_> = vetoes.iter().map(|v| v.reason.as_str()).collect();
        assert!(reasons.contains(&"insufficient cpus"));
        assert!(reasons.contains(&"insufficient ram_mb"));
        assert_eq!(vetoes.len(), 2);
    }
}
