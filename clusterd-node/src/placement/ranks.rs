use std::collections::BTreeSet;

use itertools::Itertools;

use crate::placement::{ClusterSnapshot, PlacementPolicy, ServiceConfig};

/// Orders the candidates of a service by preference.
pub fn ranks(
    svc: &ServiceConfig,
    candidates: &BTreeSet<String>,
    snapshot: &ClusterSnapshot,
) -> Vec<String> {
    match svc.placement {
        PlacementPolicy::None => Vec::new(),
        PlacementPolicy::NodesOrder => nodes_order(svc, candidates),
        PlacementPolicy::Spread => spread(svc, candidates),
        PlacementPolicy::Score => score(candidates, snapshot),
        PlacementPolicy::LoadAvg => load_avg(candidates, snapshot),
        PlacementPolicy::Shift => shift(svc, candidates),
    }
}

fn nodes_order(svc: &ServiceConfig, candidates: &BTreeSet<String>) -> Vec<String> {
    svc.peers
        .iter()
        .filter(|nodename| candidates.contains(nodename.as_str()))
        .cloned()
        .collect()
}

fn spread(svc: &ServiceConfig, candidates: &BTreeSet<String>) -> Vec<String> {
    candidates
        .iter()
        .map(|nodename| {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(svc.name.as_bytes());
            hasher.update(nodename.as_bytes());
            (hasher.finalize(), nodename)
        })
        .sorted()
        .map(|(_, nodename)| nodename.clone())
        .collect()
}

fn score(candidates: &BTreeSet<String>, snapshot: &ClusterSnapshot) -> Vec<String> {
    candidates
        .iter()
        .filter_map(|nodename| {
            let score = snapshot.get(nodename.as_str())?.stats.score?;
            Some((score, nodename))
        })
        .sorted_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)))
        .map(|(_, nodename)| nodename.clone())
        .collect()
}

fn load_avg(candidates: &BTreeSet<String>, snapshot: &ClusterSnapshot) -> Vec<String> {
    candidates
        .iter()
        .filter_map(|nodename| {
            let load = snapshot.get(nodename.as_str())?.stats.load_15m?;
            Some((load, nodename))
        })
        .sorted_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)))
        .map(|(_, nodename)| nodename.clone())
        .collect()
}

fn shift(svc: &ServiceConfig, candidates: &BTreeSet<String>) -> Vec<String> {
    let n = candidates.len();
    if n == 0 {
        return Vec::new();
    }

    let order = nodes_order(svc, candidates);
    let idx = svc.slave_num % n;
    order
        .iter()
        .chain(order.iter())
        .skip(idx)
        .take(n)
        .cloned()
        .collect()
}
