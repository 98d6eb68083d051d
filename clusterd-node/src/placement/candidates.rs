use std::collections::BTreeSet;

use crate::model::{ClusterDataEntry, NodeStats, ServiceStatus};
use crate::placement::{ClusterSnapshot, ServiceConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The minimum available memory and swap percentages of a healthy node.
pub struct MemoryLimits {
    pub min_avail_mem: u64,
    pub min_avail_swap: u64,
}

/// A node is overloaded when its available memory or swap is below the
/// minimum, as long as it reports a positive total for it.
pub fn is_overloaded(stats: &NodeStats, limits: &MemoryLimits) -> bool {
    let mem = stats.mem_total > 0 && stats.mem_avail < limits.min_avail_mem;
    let swap = stats.swap_total > 0 && stats.swap_avail < limits.min_avail_swap;
    mem || swap
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Which reasons disqualify a node from candidacy.
///
/// Every check is enabled by default.
pub struct CandidateFilter {
    pub discard_frozen: bool,
    pub discard_overloaded: bool,
    /// Nodes in maintenance, upgrade, init or shutting state.
    pub discard_preserved: bool,
    pub discard_unprovisioned: bool,
    pub discard_constraints_violation: bool,
    /// Instances whose monitor reports `start failed` or `place failed`.
    pub discard_start_failed: bool,
}

impl Default for CandidateFilter {
    fn default() -> Self {
        Self {
            discard_frozen: true,
            discard_overloaded: true,
            discard_preserved: true,
            discard_unprovisioned: true,
            discard_constraints_violation: true,
            discard_start_failed: true,
        }
    }
}

/// The peers of the service currently able to run it.
pub fn candidates(
    svc: &ServiceConfig,
    snapshot: &ClusterSnapshot,
    limits: &MemoryLimits,
    filter: &CandidateFilter,
) -> BTreeSet<String> {
    svc.peers
        .iter()
        .filter(|nodename| {
            snapshot
                .get(nodename.as_str())
                .map(|entry| qualifies(svc, entry, limits, filter))
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

fn qualifies(
    svc: &ServiceConfig,
    entry: &ClusterDataEntry,
    limits: &MemoryLimits,
    filter: &CandidateFilter,
) -> bool {
    if entry.is_unknown() {
        return false;
    }

    if filter.discard_preserved && entry.monitor.status.excludes_placement() {
        return false;
    }

    if filter.discard_frozen && entry.frozen.is_frozen() {
        return false;
    }

    let Some(instance) = entry.instance(&svc.name) else {
        return false;
    };

    // An instance without `avail` is being deleted.
    if instance.avail.is_none() {
        return false;
    }

    if filter.discard_frozen && instance.frozen.is_frozen() {
        return false;
    }

    if filter.discard_unprovisioned && instance.provisioned.is_unprovisioned() {
        return false;
    }

    if filter.discard_start_failed
        && matches!(
            instance.monitor.status,
            ServiceStatus::StartFailed | ServiceStatus::PlaceFailed
        )
    {
        return false;
    }

    if filter.discard_constraints_violation && !instance.constraints {
        return false;
    }

    if filter.discard_overloaded && is_overloaded(&entry.stats, limits) {
        return false;
    }

    true
}
