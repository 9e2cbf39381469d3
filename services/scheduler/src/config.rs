//! Configuration for the scheduler core.

use anyhow::{Context, Result};

use muster_resources::{ResourceBag, ResourceKind};

/// Tunables for the state core and preemption engine.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long a task may sit in a transient status without a new event
    /// before it is treated as lost.
    pub missing_task_grace_ms: i64,

    /// Fixed per-task resource addend covering the executor itself.
    pub executor_overhead: ResourceBag,

    /// Applied to configs that leave their failure limit unset.
    pub max_task_failures_default: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            missing_task_grace_ms: 60_000,
            executor_overhead: ResourceBag::from([
                (ResourceKind::Cpus, 0.25),
                (ResourceKind::RamMb, 128.0),
            ]),
            max_task_failures_default: 1,
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults above for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let missing_task_grace_ms = env_parse("MUSTER_MISSING_TASK_GRACE_MS")?
            .unwrap_or(defaults.missing_task_grace_ms);

        let overhead_cpus: f64 = env_parse("MUSTER_EXECUTOR_OVERHEAD_CPUS")?
            .unwrap_or_else(|| defaults.executor_overhead.value_of(ResourceKind::Cpus));
        let overhead_ram_mb: f64 = env_parse("MUSTER_EXECUTOR_OVERHEAD_RAM_MB")?
            .unwrap_or_else(|| defaults.executor_overhead.value_of(ResourceKind::RamMb));

        let max_task_failures_default =
            env_parse("MUSTER_MAX_TASK_FAILURES")?.unwrap_or(defaults.max_task_failures_default);

        Ok(Self {
            missing_task_grace_ms,
            executor_overhead: ResourceBag::from([
                (ResourceKind::Cpus, overhead_cpus),
                (ResourceKind::RamMb, overhead_ram_mb),
            ]),
            max_task_failures_default,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => {
            let value = raw
                .parse()
                .with_context(|| format!("invalid value for {key}: {raw:?}"))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}
