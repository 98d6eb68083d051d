use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Counter = AtomicU64;

#[derive(Debug, Clone, Default)]
/// Live metrics around the cluster state.
pub struct ClusterStatistics(Arc<ClusterStatisticsInner>);

impl Deref for ClusterStatistics {
    type Target = ClusterStatisticsInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct ClusterStatisticsInner {
    /// The number of nodes with a status snapshot in the data store.
    pub(crate) num_live_members: Counter,
    /// The number of peers whose data has been forgotten.
    pub(crate) num_forgotten_peers: Counter,
    /// The current local generation.
    pub(crate) current_gen: Counter,
    /// The number of generation diffs retained for peers.
    pub(crate) num_retained_diffs: Counter,
    /// The number of events emitted.
    pub(crate) num_events: Counter,
    /// The number of times self-fencing has been triggered.
    pub(crate) num_fencing: Counter,
}

impl ClusterStatisticsInner {
    /// The number of nodes with a status snapshot in the data store.
    pub fn num_live_members(&self) -> u64 {
        self.num_live_members.load(Ordering::Relaxed)
    }

    /// The number of peers whose data has been forgotten.
    pub fn num_forgotten_peers(&self) -> u64 {
        self.num_forgotten_peers.load(Ordering::Relaxed)
    }

    /// The current local generation.
    pub fn current_gen(&self) -> u64 {
        self.current_gen.load(Ordering::Relaxed)
    }

    /// The number of generation diffs retained for peers.
    pub fn num_retained_diffs(&self) -> u64 {
        self.num_retained_diffs.load(Ordering::Relaxed)
    }

    /// The number of events emitted.
    pub fn num_events(&self) -> u64 {
        self.num_events.load(Ordering::Relaxed)
    }

    /// The number of times self-fencing has been triggered.
    pub fn num_fencing(&self) -> u64 {
        self.num_fencing.load(Ordering::Relaxed)
    }
}
