use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::model::{ClusterDataEntry, Provisioned, ServiceInstance};
use crate::placement::{ClusterSnapshot, ServiceConfig, Topology};

#[derive(Default)]
/// The latest known status snapshot of every cluster member, and the cached
/// per service aggregates.
///
/// Each map has its own lock and no method ever holds both.
pub struct DataStore {
    cluster_data: Mutex<ClusterSnapshot>,
    agg: Mutex<BTreeMap<String, ServiceAgg>>,
}

impl DataStore {
    /// A consistent copy of every node entry.
    pub fn snapshot(&self) -> ClusterSnapshot {
        self.cluster_data.lock().clone()
    }

    pub fn entry(&self, nodename: &str) -> Option<Arc<ClusterDataEntry>> {
        self.cluster_data.lock().get(nodename).cloned()
    }

    /// Replaces the entry of a node wholesale, returning the previous one.
    pub fn replace(
        &self,
        nodename: impl Into<String>,
        entry: ClusterDataEntry,
    ) -> Option<Arc<ClusterDataEntry>> {
        self.cluster_data
            .lock()
            .insert(nodename.into(), Arc::new(entry))
    }

    pub fn remove(&self, nodename: &str) -> Option<Arc<ClusterDataEntry>> {
        self.cluster_data.lock().remove(nodename)
    }

    pub fn contains(&self, nodename: &str) -> bool {
        self.cluster_data.lock().contains_key(nodename)
    }

    pub fn len(&self) -> usize {
        self.cluster_data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cluster_data.lock().is_empty()
    }

    pub fn nodenames(&self) -> BTreeSet<String> {
        self.cluster_data.lock().keys().cloned().collect()
    }

    /// The instance of a service on a node.
    ///
    /// Absent nodes, absent services and foreign shapes all yield `None`.
    pub fn service_instance(&self, svcname: &str, nodename: &str) -> Option<ServiceInstance> {
        let entry = self.entry(nodename)?;
        entry.instance(svcname).cloned()
    }

    /// The instances of a service keyed by node name, skipping foreign shapes.
    pub fn service_instances(
        &self,
        svcname: &str,
        discard_empty: bool,
    ) -> BTreeMap<String, ServiceInstance> {
        let snapshot = self.snapshot();
        snapshot
            .iter()
            .filter_map(|(nodename, entry)| {
                let instance = entry.instance(svcname)?;
                if discard_empty && instance.is_empty() {
                    return None;
                }
                Some((nodename.clone(), instance.clone()))
            })
            .collect()
    }

    pub fn agg(&self, svcname: &str) -> Option<ServiceAgg> {
        self.agg.lock().get(svcname).cloned()
    }

    pub fn set_agg(&self, svcname: impl Into<String>, agg: ServiceAgg) {
        self.agg.lock().insert(svcname.into(), agg);
    }

    pub fn drop_agg(&self, svcname: &str) -> Option<ServiceAgg> {
        self.agg.lock().remove(svcname)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Avail {
    #[serde(rename = "up")]
    Up,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "down")]
    Down,
    #[serde(rename = "n/a")]
    NotApplicable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrozenAgg {
    #[serde(rename = "frozen")]
    Frozen,
    #[serde(rename = "thawed")]
    Thawed,
    #[serde(rename = "mixed")]
    Mixed,
    #[serde(rename = "n/a")]
    NotApplicable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisionedAgg {
    #[serde(rename = "true")]
    True,
    #[serde(rename = "false")]
    False,
    #[serde(rename = "mixed")]
    Mixed,
    #[serde(rename = "n/a")]
    NotApplicable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementAgg {
    #[serde(rename = "optimal")]
    Optimal,
    #[serde(rename = "non-optimal")]
    NonOptimal,
    #[serde(rename = "n/a")]
    NotApplicable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// The cluster wide status of a service, folded from its instances.
pub struct ServiceAgg {
    pub avail: Avail,
    pub overall: Avail,
    pub frozen: FrozenAgg,
    pub provisioned: ProvisionedAgg,
    pub placement: PlacementAgg,
}

impl ServiceAgg {
    pub fn compute(
        svc: &ServiceConfig,
        instances: &BTreeMap<String, ServiceInstance>,
        leaders: &[String],
    ) -> Self {
        let up = instances
            .iter()
            .filter(|(_, instance)| instance.avail.as_deref() == Some("up"))
            .map(|(nodename, _)| nodename.as_str())
            .collect::<BTreeSet<_>>();

        let avail = if instances.is_empty() {
            Avail::NotApplicable
        } else if up.is_empty() {
            Avail::Down
        } else {
            match svc.topology {
                Topology::Failover if up.len() == 1 => Avail::Up,
                Topology::Failover => Avail::Warn,
                Topology::Flex if up.len() >= svc.flex_min_nodes => Avail::Up,
                Topology::Flex => Avail::Warn,
            }
        };

        let any_warn = instances
            .values()
            .any(|instance| instance.overall.as_deref() == Some("warn"));
        let overall = if any_warn && avail != Avail::NotApplicable {
            Avail::Warn
        } else {
            avail
        };

        let num_frozen = instances.values().filter(|i| i.frozen.is_frozen()).count();
        let frozen = match num_frozen {
            _ if instances.is_empty() => FrozenAgg::NotApplicable,
            0 => FrozenAgg::Thawed,
            n if n == instances.len() => FrozenAgg::Frozen,
            _ => FrozenAgg::Mixed,
        };

        let provisioned = fold_provisioned(instances.values().map(|i| &i.provisioned));

        let placement = if leaders.is_empty() {
            PlacementAgg::NotApplicable
        } else if leaders.iter().map(String::as_str).collect::<BTreeSet<_>>() == up {
            PlacementAgg::Optimal
        } else {
            PlacementAgg::NonOptimal
        };

        Self {
            avail,
            overall,
            frozen,
            provisioned,
            placement,
        }
    }
}

fn fold_provisioned<'a>(states: impl Iterator<Item = &'a Provisioned>) -> ProvisionedAgg {
    let mut agg = ProvisionedAgg::NotApplicable;
    for state in states {
        let this = match state {
            Provisioned::Flag(true) => ProvisionedAgg::True,
            Provisioned::Flag(false) => ProvisionedAgg::False,
            Provisioned::Text(_) => ProvisionedAgg::Mixed,
        };
        agg = match agg {
            ProvisionedAgg::NotApplicable => this,
            current if current == this => current,
            _ => ProvisionedAgg::Mixed,
        };
    }
    agg
}
