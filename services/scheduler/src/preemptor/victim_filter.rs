//! Victim selection: a minimal set of on-host evictions admitting a pending
//! task.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use muster_resources::{dominance_compare, ResourceBag};

use super::{HostOffer, PreemptionVictim, PreemptorMetrics};
use crate::filter::{AttributeAggregate, ResourceRequest, SchedulingFilter, UnusedResource};
use crate::storage::AttributeStore;
use crate::task::TaskConfig;
use crate::tier::TierManager;

/// Selects preemption victims for pending tasks.
pub struct PreemptionVictimFilter {
    scheduling_filter: Arc<dyn SchedulingFilter>,
    tier_manager: Arc<dyn TierManager>,
    executor_overhead: ResourceBag,
    metrics: PreemptorMetrics,
}

impl PreemptionVictimFilter {
    pub fn new(
        scheduling_filter: Arc<dyn SchedulingFilter>,
        tier_manager: Arc<dyn TierManager>,
        executor_overhead: ResourceBag,
        metrics: PreemptorMetrics,
    ) -> Self {
        Self {
            scheduling_filter,
            tier_manager,
            executor_overhead,
            metrics,
        }
    }

    /// Returns a set of victims that can accommodate `pending_task` if
    /// preempted, or `None` when no such set exists on this host.
    ///
    /// All victims and the offer must name the same host. Candidates are
    /// ranked by the resources they would free, largest first under the
    /// dominance ordering, and accumulated greedily on top of the offer's
    /// slack until the scheduling filter stops vetoing. Missing host
    /// attributes are counted and collapse to no-solution.
    pub fn filter_preemption_victims(
        &self,
        pending_task: &TaskConfig,
        victims: &[PreemptionVictim],
        job_state: &AttributeAggregate,
        offer: Option<&HostOffer>,
        attribute_store: &dyn AttributeStore,
    ) -> Option<Vec<PreemptionVictim>> {
        let hosts: BTreeSet<&str> = victims
            .iter()
            .map(|victim| victim.slave_host.as_str())
            .chain(offer.map(|offer| offer.hostname.as_str()))
            .collect();

        // Revocable offer CPU is compressible and cannot back the pending
        // task's claim.
        let slack = offer
            .map(|offer| offer.resources.non_revocable())
            .unwrap_or_else(ResourceBag::empty);

        let mut ranked: Vec<(PreemptionVictim, ResourceBag)> = victims
            .iter()
            .filter(|victim| self.eligible(pending_task, victim))
            .map(|victim| (victim.clone(), self.freeable_resources(victim)))
            .collect();
        // Stable sort, largest freeable bag first; incomparable bags tie and
        // keep their input order.
        ranked.sort_by(|(_, left), (_, right)| dominance_compare(right, left));

        if ranked.is_empty() {
            return None;
        }

        assert_eq!(
            hosts.len(),
            1,
            "preemption victims and offer must share a single host, got {hosts:?}"
        );
        let host = hosts.iter().next().copied()?;

        let attributes = match attribute_store.host_attributes(host) {
            Ok(Some(attributes)) => attributes,
            Ok(None) => {
                self.metrics.record_missing_attributes();
                debug!(host, "no attributes found for host, cannot preempt");
                return None;
            }
            Err(e) => {
                self.metrics.record_missing_attributes();
                warn!(host, error = %e, "attribute lookup failed, cannot preempt");
                return None;
            }
        };

        let request = ResourceRequest {
            task: pending_task.clone(),
            resources: pending_task.resources.add(&self.executor_overhead),
            job_state: job_state.clone(),
        };

        let mut to_preempt = Vec::new();
        let mut total = slack;
        for (victim, freeable) in ranked {
            total = total.add(&freeable);
            to_preempt.push(victim);

            let vetoes = self.scheduling_filter.filter(
                &UnusedResource {
                    resources: total.clone(),
                    attributes: attributes.clone(),
                },
                &request,
            );

            if vetoes.is_empty() {
                debug!(
                    host,
                    victims = to_preempt.len(),
                    "found preemption slot"
                );
                return Some(to_preempt);
            }
        }

        None
    }

    /// The resources evicting a victim would free for the pending task: its
    /// own bag, with revocable components stripped when the victim runs on a
    /// revocable tier, plus the fixed executor overhead.
    fn freeable_resources(&self, victim: &PreemptionVictim) -> ResourceBag {
        let bag = if self.tier_manager.tier(&victim.config).revocable {
            victim.resources.strip_revocable()
        } else {
            victim.resources.clone()
        };
        bag.add(&self.executor_overhead)
    }

    /// Preemption eligibility of a single victim against the pending task.
    fn eligible(&self, pending_task: &TaskConfig, victim: &PreemptionVictim) -> bool {
        let pending_preemptible = self.tier_manager.tier(pending_task).preemptible;
        let victim_preemptible = self.tier_manager.tier(&victim.config).preemptible;

        if !pending_preemptible && victim_preemptible {
            true
        } else if pending_preemptible == victim_preemptible {
            // Equal tiers: preemption is by priority within the same role.
            pending_task.role == victim.role() && pending_task.priority > victim.priority()
        } else {
            false
        }
    }
}
