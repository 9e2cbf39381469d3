//! Resource algebra for the muster scheduler.
//!
//! A [`ResourceBag`] is a semantic vector of named resource scalars (CPU,
//! RAM, disk, ports). Bags support componentwise addition, filtering by
//! predicate, and the dominance ordering used to rank preemption victims.
//!
//! # Invariants
//!
//! - All operations are pure; a bag is never mutated in place by the algebra.
//! - Missing components are treated as zero everywhere.
//! - [`dominance_compare`] is a total preorder: incomparable vectors (mixed
//!   signs) report as equal, which keeps stable sorts stable.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A kind of schedulable resource.
///
/// Revocable CPU is tracked as its own kind: it is compressible and cannot
/// back a non-revocable claim, so consumers routinely filter it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cpus,
    RevocableCpus,
    RamMb,
    DiskMb,
    Ports,
}

impl ResourceKind {
    /// Returns true for kinds the cluster may reclaim at any time.
    pub fn is_revocable(self) -> bool {
        matches!(self, Self::RevocableCpus)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpus => "cpus",
            Self::RevocableCpus => "revocable_cpus",
            Self::RamMb => "ram_mb",
            Self::DiskMb => "disk_mb",
            Self::Ports => "ports",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "cpus" => Some(Self::Cpus),
            "revocable_cpus" => Some(Self::RevocableCpus),
            "ram_mb" => Some(Self::RamMb),
            "disk_mb" => Some(Self::DiskMb),
            "ports" => Some(Self::Ports),
            _ => None,
        }
    }
}

/// A vector of resource amounts keyed by [`ResourceKind`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceBag(BTreeMap<ResourceKind, f64>);

impl ResourceBag {
    /// The empty bag: every component is zero.
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    /// Returns true when no component is present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The amount of a single resource kind, zero when absent.
    pub fn value_of(&self, kind: ResourceKind) -> f64 {
        self.0.get(&kind).copied().unwrap_or(0.0)
    }

    /// Componentwise sum of two bags.
    pub fn add(&self, other: &ResourceBag) -> ResourceBag {
        let mut sum = self.0.clone();
        for (kind, amount) in &other.0 {
            *sum.entry(*kind).or_insert(0.0) += amount;
        }
        ResourceBag(sum)
    }

    /// A bag containing only the components matching the predicate.
    pub fn filter(&self, mut predicate: impl FnMut(ResourceKind) -> bool) -> ResourceBag {
        ResourceBag(
            self.0
                .iter()
                .filter(|(kind, _)| predicate(**kind))
                .map(|(kind, amount)| (*kind, *amount))
                .collect(),
        )
    }

    /// Drops revocable components, keeping the keys with a zero amount so the
    /// bag still spans the same dimensions.
    pub fn strip_revocable(&self) -> ResourceBag {
        ResourceBag(
            self.0
                .iter()
                .map(|(kind, amount)| {
                    let amount = if kind.is_revocable() { 0.0 } else { *amount };
                    (*kind, amount)
                })
                .collect(),
        )
    }

    /// Only the components the cluster will not reclaim.
    pub fn non_revocable(&self) -> ResourceBag {
        self.filter(|kind| !kind.is_revocable())
    }

    /// Iterates over `(kind, amount)` pairs in kind order.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, f64)> + '_ {
        self.0.iter().map(|(kind, amount)| (*kind, *amount))
    }
}

impl<const N: usize> From<[(ResourceKind, f64); N]> for ResourceBag {
    fn from(entries: [(ResourceKind, f64); N]) -> Self {
        Self(entries.into_iter().collect())
    }
}

impl FromIterator<(ResourceKind, f64)> for ResourceBag {
    fn from_iter<I: IntoIterator<Item = (ResourceKind, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Componentwise dominance ordering over the union of both key sets.
///
/// A bag is greater than another iff every component is greater or equal and
/// at least one is strictly greater. Bags with mixed componentwise signs are
/// incomparable and report as [`Ordering::Equal`], so the relation is a total
/// preorder usable with a stable sort: ties preserve input order.
///
/// Callers that want a different ranking (dominant-resource fairness, say)
/// can substitute any `fn(&ResourceBag, &ResourceBag) -> Ordering`.
pub fn dominance_compare(left: &ResourceBag, right: &ResourceBag) -> Ordering {
    let mut saw_greater = false;
    let mut saw_less = false;

    let keys = left.0.keys().chain(right.0.keys());
    for kind in keys {
        match left
            .value_of(*kind)
            .partial_cmp(&right.value_of(*kind))
            .unwrap_or(Ordering::Equal)
        {
            Ordering::Greater => saw_greater = true,
            Ordering::Less => saw_less = true,
            Ordering::Equal => {}
        }
    }

    match (saw_greater, saw_less) {
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        // All equal, or incomparable: both collapse to a tie.
        _ => Ordering::Equal,
    }
}
