//! Deterministic placement of service instances.
//!
//! Every function here is a pure function of the service topology and a
//! cluster snapshot. Nodes observing the same snapshot therefore reach the
//! same decision without talking to each other.

mod candidates;
mod ranks;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

pub use candidates::{candidates, is_overloaded, CandidateFilter, MemoryLimits};
pub use ranks::ranks;
use serde::{Deserialize, Serialize};

use crate::model::ClusterDataEntry;

/// The status snapshots of every known node.
///
/// Entries are replaced wholesale, so a snapshot is a cheap map of shared pointers.
pub type ClusterSnapshot = BTreeMap<String, Arc<ClusterDataEntry>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
/// The algorithm ranking the candidate nodes of a service.
pub enum PlacementPolicy {
    /// No node is ever ranked.
    None,
    /// The configured peer order.
    #[default]
    NodesOrder,
    /// A per service hash order, spreading leaders of unrelated services.
    Spread,
    /// Highest reported score first.
    Score,
    /// Lowest 15 minutes load average first.
    LoadAvg,
    /// The configured peer order, rotated by the slave number.
    Shift,
}

impl PlacementPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::NodesOrder => "nodes order",
            Self::Spread => "spread",
            Self::Score => "score",
            Self::LoadAvg => "load avg",
            Self::Shift => "shift",
        }
    }
}

impl From<String> for PlacementPolicy {
    fn from(s: String) -> Self {
        match s.as_str() {
            "none" => Self::None,
            "spread" => Self::Spread,
            "score" => Self::Score,
            "load avg" => Self::LoadAvg,
            "shift" => Self::Shift,
            _ => Self::NodesOrder,
        }
    }
}

impl From<PlacementPolicy> for String {
    fn from(policy: PlacementPolicy) -> Self {
        policy.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// One active instance.
    #[default]
    Failover,
    /// At least `flex_min_nodes` active instances.
    Flex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// The placement relevant configuration of a service.
pub struct ServiceConfig {
    pub name: String,
    /// The nodes the service may run on, in preference order.
    pub peers: Vec<String>,
    #[serde(default)]
    pub placement: PlacementPolicy,
    #[serde(default)]
    pub topology: Topology,
    #[serde(default = "flex_min_nodes_default")]
    pub flex_min_nodes: usize,
    /// The index of this instance among services sharing a topology.
    #[serde(default)]
    pub slave_num: usize,
}

fn flex_min_nodes_default() -> usize {
    1
}

impl ServiceConfig {
    pub fn failover(
        name: impl Into<String>,
        peers: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Self {
        Self {
            name: name.into(),
            peers: peers.into_iter().map(|p| p.as_ref().to_string()).collect(),
            placement: PlacementPolicy::default(),
            topology: Topology::Failover,
            flex_min_nodes: 1,
            slave_num: 0,
        }
    }

    pub fn flex(
        name: impl Into<String>,
        peers: impl IntoIterator<Item = impl AsRef<str>>,
        flex_min_nodes: usize,
    ) -> Self {
        Self {
            topology: Topology::Flex,
            flex_min_nodes,
            ..Self::failover(name, peers)
        }
    }

    pub fn with_placement(mut self, placement: PlacementPolicy) -> Self {
        self.placement = placement;
        self
    }

    pub fn with_slave_num(mut self, slave_num: usize) -> Self {
        self.slave_num = slave_num;
        self
    }
}

/// The ranked nodes authorized to run the service.
///
/// One node for failover services, `flex_min_nodes` for flex services.
pub fn leaders(svc: &ServiceConfig, ranks: &[String]) -> Vec<String> {
    let n = match svc.topology {
        Topology::Failover => 1,
        Topology::Flex => svc.flex_min_nodes,
    };
    ranks.iter().take(n).cloned().collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Why the local node is, or is not, a placement leader.
pub enum LeaderDecision {
    NoCandidate,
    NotCandidate,
    OnlyCandidate,
    Leader,
    NotLeader { leaders: Vec<String> },
}

impl LeaderDecision {
    #[inline]
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::OnlyCandidate | Self::Leader)
    }
}

impl fmt::Display for LeaderDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCandidate => f.write_str("no candidate"),
            Self::NotCandidate => f.write_str("not a candidate"),
            Self::OnlyCandidate => f.write_str("only candidate"),
            Self::Leader => f.write_str("leader"),
            Self::NotLeader { leaders } => {
                write!(f, "not leader, leaders are {}", leaders.join(", "))
            },
        }
    }
}

/// Decides if `local` is a placement leader among `candidates`.
pub fn decide_leader(
    svc: &ServiceConfig,
    local: &str,
    candidates: &BTreeSet<String>,
    snapshot: &ClusterSnapshot,
) -> LeaderDecision {
    if candidates.is_empty() {
        return LeaderDecision::NoCandidate;
    }

    if !candidates.contains(local) {
        return LeaderDecision::NotCandidate;
    }

    if candidates.len() == 1 {
        return LeaderDecision::OnlyCandidate;
    }

    let ranked = ranks(svc, candidates, snapshot);
    let leaders = leaders(svc, &ranked);
    if leaders.iter().any(|n| n == local) {
        LeaderDecision::Leader
    } else {
        LeaderDecision::NotLeader { leaders }
    }
}
