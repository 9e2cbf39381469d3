//! Tier catalogue contract.
//!
//! A tier decides two facets of a task: whether it may be preempted by a
//! higher-priority task, and whether its resources are revocable (reclaimable
//! by the cluster at any time). The concrete catalogue lives outside the
//! core; [`StaticTierManager`] is the embedded resolution used by tests and
//! single-process deployments.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::task::TaskConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub preemptible: bool,
    pub revocable: bool,
}

impl Tier {
    /// The tier applied when a config names no tier: guaranteed resources,
    /// not preemptible.
    pub const PREFERRED: Tier = Tier {
        preemptible: false,
        revocable: false,
    };

    /// Preemptible but non-revocable resources.
    pub const PREEMPTIBLE: Tier = Tier {
        preemptible: true,
        revocable: false,
    };

    /// Best-effort: preemptible, running on revocable resources.
    pub const REVOCABLE: Tier = Tier {
        preemptible: true,
        revocable: true,
    };
}

/// Resolves the tier of a task configuration.
pub trait TierManager: Send + Sync {
    fn tier(&self, config: &TaskConfig) -> Tier;
}

/// Fixed name → tier mapping with a default for unnamed or unknown tiers.
#[derive(Debug, Clone)]
pub struct StaticTierManager {
    tiers: HashMap<String, Tier>,
    default: Tier,
}

impl StaticTierManager {
    pub fn new(tiers: HashMap<String, Tier>, default: Tier) -> Self {
        Self { tiers, default }
    }

    /// The standard three-tier catalogue: `preferred`, `preemptible`,
    /// `revocable`.
    pub fn standard() -> Self {
        Self::new(
            HashMap::from([
                ("preferred".to_string(), Tier::PREFERRED),
                ("preemptible".to_string(), Tier::PREEMPTIBLE),
                ("revocable".to_string(), Tier::REVOCABLE),
            ]),
            Tier::PREFERRED,
        )
    }
}

impl TierManager for StaticTierManager {
    fn tier(&self, config: &TaskConfig) -> Tier {
        config
            .tier
            .as_deref()
            .and_then(|name| self.tiers.get(name).copied())
            .unwrap_or(self.default)
    }
}
