//! Scenario tests of the preemption victim filter.

use std::collections::BTreeSet;
use std::sync::Arc;

use muster_resources::ResourceKind::*;
use muster_resources::{ResourceBag, ResourceKind};
use muster_scheduler::filter::{AttributeAggregate, ResourceCapacityFilter};
use muster_scheduler::preemptor::{HostOffer, PreemptionVictim, PreemptionVictimFilter, PreemptorMetrics};
use muster_scheduler::storage::{AttributeStore, HostAttributes, MemStorage, StoreProvider};
use muster_scheduler::task::TaskConfig;
use muster_scheduler::tier::StaticTierManager;

const HOST: &str = "slave1";

fn overhead() -> ResourceBag {
    ResourceBag::from([(Cpus, 0.25), (RamMb, 128.0)])
}

fn filter_with_metrics() -> (PreemptionVictimFilter, PreemptorMetrics) {
    let metrics = PreemptorMetrics::default();
    let filter = PreemptionVictimFilter::new(
        Arc::new(ResourceCapacityFilter),
        Arc::new(StaticTierManager::standard()),
        overhead(),
        metrics.clone(),
    );
    (filter, metrics)
}

fn store_with_host() -> MemStorage {
    let mut storage = MemStorage::new();
    AttributeStore::save_host_attributes(
        &mut storage,
        HostAttributes {
            host: HOST.into(),
            slave_id: "slave1-id".into(),
            attributes: Default::default(),
        },
    )
    .unwrap();
    storage
}

fn config(
    role: &str,
    priority: i32,
    tier: Option<&str>,
    resources: &[(ResourceKind, f64)],
) -> TaskConfig {
    TaskConfig {
        role: role.into(),
        job_name: "job".into(),
        shard_id: 0,
        priority,
        tier: tier.map(String::from),
        resources: resources.iter().copied().collect(),
        max_task_failures: 1,
        requested_ports: Vec::new(),
        command: None,
    }
}

fn victim(
    id: &str,
    role: &str,
    priority: i32,
    tier: Option<&str>,
    resources: &[(ResourceKind, f64)],
) -> PreemptionVictim {
    PreemptionVictim {
        task_id: id.into(),
        slave_host: HOST.into(),
        resources: resources.iter().copied().collect(),
        config: config(role, priority, tier, resources),
    }
}

fn offer(resources: &[(ResourceKind, f64)]) -> HostOffer {
    HostOffer {
        hostname: HOST.into(),
        slave_id: "slave1-id".into(),
        resources: resources.iter().copied().collect(),
    }
}

#[test]
fn slack_plus_single_victim_admits_pending_task() {
    let (filter, metrics) = filter_with_metrics();
    let storage = store_with_host();

    let pending = config(
        "www",
        10,
        Some("preemptible"),
        &[(Cpus, 2.0), (RamMb, 2048.0)],
    );
    let v = victim(
        "victim-1",
        "www",
        5,
        Some("preemptible"),
        &[(Cpus, 2.0), (RamMb, 2048.0)],
    );

    let result = filter
        .filter_preemption_victims(
            &pending,
            &[v],
            &AttributeAggregate::empty(),
            Some(&offer(&[(Cpus, 0.5), (RamMb, 256.0)])),
            storage.attribute_store(),
        )
        .expect("one victim plus slack should fit the pending task");

    assert_eq!(result.len(), 1);
    assert_eq!(result[0].task_id, "victim-1");
    assert_eq!(metrics.missing_attributes(), 0);
}

#[test]
fn insufficient_victims_even_in_total_is_no_solution() {
    let (filter, metrics) = filter_with_metrics();
    let storage = store_with_host();

    let pending = config(
        "www",
        10,
        Some("preemptible"),
        &[(Cpus, 4.0), (RamMb, 4096.0)],
    );
    let victims = [
        victim("a", "www", 1, Some("preemptible"), &[(Cpus, 0.5), (RamMb, 256.0)]),
        victim("b", "www", 1, Some("preemptible"), &[(Cpus, 0.5), (RamMb, 256.0)]),
    ];

    let result = filter.filter_preemption_victims(
        &pending,
        &victims,
        &AttributeAggregate::empty(),
        None,
        storage.attribute_store(),
    );

    assert!(result.is_none());
    assert_eq!(metrics.missing_attributes(), 0);
}

#[test]
fn revocable_victim_frees_only_non_revocable_resources() {
    let (filter, _) = filter_with_metrics();
    let storage = store_with_host();

    // The victim's raw bag is dominated by revocable CPU; after stripping,
    // only the executor overhead CPU remains freeable.
    let pending = config("www", 0, None, &[(Cpus, 1.0)]);
    let v = victim(
        "revocable-heavy",
        "batch",
        0,
        Some("revocable"),
        &[(RevocableCpus, 8.0), (RamMb, 2048.0)],
    );

    let result = filter.filter_preemption_victims(
        &pending,
        &[v],
        &AttributeAggregate::empty(),
        None,
        storage.attribute_store(),
    );
    assert!(result.is_none(), "revocable CPU must not back a non-revocable claim");
}

#[test]
fn sorting_uses_post_strip_bags() {
    let (filter, _) = filter_with_metrics();
    let storage = store_with_host();

    // Raw bags would rank the revocable victim first (8 CPUs); post-strip it
    // frees nothing but overhead, so the guaranteed victim must win.
    let pending = config("www", 0, None, &[(Cpus, 2.0)]);
    let revocable_heavy = victim(
        "revocable-heavy",
        "batch",
        0,
        Some("revocable"),
        &[(RevocableCpus, 8.0)],
    );
    let guaranteed = victim("guaranteed", "batch", 0, Some("preemptible"), &[(Cpus, 4.0)]);

    let result = filter
        .filter_preemption_victims(
            &pending,
            &[revocable_heavy, guaranteed],
            &AttributeAggregate::empty(),
            None,
            storage.attribute_store(),
        )
        .expect("the guaranteed victim alone should satisfy the claim");

    assert_eq!(result.len(), 1);
    assert_eq!(result[0].task_id, "guaranteed");
}

#[test]
fn greedy_prefix_is_minimal() {
    let (filter, _) = filter_with_metrics();
    let storage = store_with_host();

    let pending = config("www", 10, Some("preemptible"), &[(Cpus, 4.0)]);
    let victims = [
        victim("a", "www", 1, Some("preemptible"), &[(Cpus, 2.5)]),
        victim("b", "www", 1, Some("preemptible"), &[(Cpus, 2.0)]),
    ];

    let result = filter
        .filter_preemption_victims(
            &pending,
            &victims,
            &AttributeAggregate::empty(),
            None,
            storage.attribute_store(),
        )
        .expect("both victims together cover the claim");

    // One victim alone is vetoed; the full pair is the first admissible
    // prefix.
    assert_eq!(result.len(), 2);
}

#[test]
fn absent_offer_means_zero_slack() {
    let (filter, _) = filter_with_metrics();
    let storage = store_with_host();

    let pending = config("www", 10, Some("preemptible"), &[(Cpus, 1.0)]);
    let v = victim("a", "www", 1, Some("preemptible"), &[(Cpus, 2.0), (RamMb, 256.0)]);

    let result = filter.filter_preemption_victims(
        &pending,
        &[v],
        &AttributeAggregate::empty(),
        None,
        storage.attribute_store(),
    );
    assert!(result.is_some());
}

#[test]
fn revocable_offer_resources_are_excluded_from_slack() {
    let (filter, _) = filter_with_metrics();
    let storage = store_with_host();

    // The offer's CPU is revocable, so only victims can cover the claim; a
    // single small victim is not enough.
    let pending = config("www", 10, Some("preemptible"), &[(Cpus, 4.0)]);
    let v = victim("a", "www", 1, Some("preemptible"), &[(Cpus, 1.0)]);

    let result = filter.filter_preemption_victims(
        &pending,
        &[v],
        &AttributeAggregate::empty(),
        Some(&offer(&[(RevocableCpus, 8.0), (RamMb, 4096.0)])),
        storage.attribute_store(),
    );
    assert!(result.is_none());
}

#[test]
fn ineligible_victims_are_never_returned() {
    let (filter, _) = filter_with_metrics();
    let storage = store_with_host();

    // Same tier, other role: ineligible regardless of size.
    let pending = config("www", 10, Some("preemptible"), &[(Cpus, 1.0)]);
    let v = victim("other-role", "batch", 1, Some("preemptible"), &[(Cpus, 16.0)]);

    let result = filter.filter_preemption_victims(
        &pending,
        &[v],
        &AttributeAggregate::empty(),
        None,
        storage.attribute_store(),
    );
    assert!(result.is_none());
}

#[test]
fn missing_attributes_bumps_metric() {
    let (filter, metrics) = filter_with_metrics();
    let storage = MemStorage::new();

    let pending = config("www", 10, Some("preemptible"), &[(Cpus, 1.0)]);
    let v = victim("a", "www", 1, Some("preemptible"), &[(Cpus, 2.0)]);

    let result = filter.filter_preemption_victims(
        &pending,
        &[v],
        &AttributeAggregate::empty(),
        None,
        storage.attribute_store(),
    );
    assert!(result.is_none());
    assert_eq!(metrics.missing_attributes(), 1);
}

#[test]
fn victims_project_from_assigned_task_records() {
    use muster_scheduler::clock::ManualClock;
    use muster_scheduler::config::SchedulerConfig;
    use muster_scheduler::query::TaskQuery;
    use muster_scheduler::state::StateManager;

    let mut manager = StateManager::new(
        Box::new(MemStorage::new()),
        Arc::new(ManualClock::new(1_000)),
        SchedulerConfig::default(),
    );
    manager.initialize().unwrap();
    manager.start(Arc::new(|_| {}));

    let low_priority = config("www", 1, Some("preemptible"), &[(Cpus, 4.0), (RamMb, 4096.0)]);
    let ids = manager.insert_tasks(vec![low_priority]).unwrap();
    let task_id = ids.iter().next().unwrap().clone();
    manager.assign_task(&task_id, HOST, "slave1-id", &[]).unwrap();

    let victims: Vec<PreemptionVictim> = manager
        .fetch_tasks(&TaskQuery::all())
        .unwrap()
        .iter()
        .filter_map(PreemptionVictim::from_task)
        .collect();
    assert_eq!(victims.len(), 1);
    assert_eq!(victims[0].slave_host, HOST);

    let (filter, _) = filter_with_metrics();
    let storage = store_with_host();
    let pending = config("www", 10, Some("preemptible"), &[(Cpus, 2.0), (RamMb, 1024.0)]);

    let result = filter
        .filter_preemption_victims(
            &pending,
            &victims,
            &AttributeAggregate::empty(),
            None,
            storage.attribute_store(),
        )
        .expect("the running shard should be evictable for the higher-priority task");
    assert_eq!(result[0].task_id, task_id);

    let preempt_ids: BTreeSet<String> = result.iter().map(|v| v.task_id.clone()).collect();
    let count = manager
        .change_state_with_audit(
            &TaskQuery::by_ids(preempt_ids.iter().cloned()),
            muster_scheduler::task::ScheduleStatus::Preempting,
            Some("Preempting in favor of a higher-priority task."),
        )
        .unwrap();
    assert_eq!(count, 1);
}
