use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::model::{
    ClusterDataEntry,
    DataStatus,
    Frozen,
    GenMap,
    InstanceSlot,
    NodeMonitor,
    NodeStats,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// The sections of a status snapshot which changed between two generations.
///
/// Sections are replaced, never merged, so applying a delta twice is harmless.
pub struct EntryDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DataStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frozen: Option<Frozen>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor: Option<NodeMonitor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<NodeStats>,
    /// `None` removes the service instance.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, Option<InstanceSlot>>,
}

impl EntryDelta {
    /// Computes the delta turning `old` into `new`.
    pub fn between(old: Option<&ClusterDataEntry>, new: &ClusterDataEntry) -> Self {
        let Some(old) = old else {
            return Self::full(new);
        };

        let changed = |differs: bool| differs.then_some(());
        let mut delta = Self {
            status: changed(old.status != new.status).map(|_| new.status),
            frozen: changed(old.frozen != new.frozen).map(|_| new.frozen),
            monitor: changed(old.monitor != new.monitor).map(|_| new.monitor.clone()),
            stats: changed(old.stats != new.stats).map(|_| new.stats.clone()),
            services: BTreeMap::new(),
        };

        for (svcname, slot) in new.services.status.iter() {
            if old.services.status.get(svcname) != Some(slot) {
                delta.services.insert(svcname.clone(), Some(slot.clone()));
            }
        }

        for svcname in old.services.status.keys() {
            if !new.services.status.contains_key(svcname) {
                delta.services.insert(svcname.clone(), None);
            }
        }

        delta
    }

    fn full(entry: &ClusterDataEntry) -> Self {
        Self {
            status: Some(entry.status),
            frozen: Some(entry.frozen),
            monitor: Some(entry.monitor.clone()),
            stats: Some(entry.stats.clone()),
            services: entry
                .services
                .status
                .iter()
                .map(|(k, v)| (k.clone(), Some(v.clone())))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.frozen.is_none()
            && self.monitor.is_none()
            && self.stats.is_none()
            && self.services.is_empty()
    }

    pub fn apply(&self, entry: &mut ClusterDataEntry) {
        if let Some(status) = self.status {
            entry.status = status;
        }
        if let Some(frozen) = self.frozen {
            entry.frozen = frozen;
        }
        if let Some(monitor) = &self.monitor {
            entry.monitor = monitor.clone();
        }
        if let Some(stats) = &self.stats {
            entry.stats = stats.clone();
        }
        for (svcname, slot) in self.services.iter() {
            match slot {
                Some(slot) => {
                    entry.services.status.insert(svcname.clone(), slot.clone());
                },
                None => {
                    entry.services.status.remove(svcname);
                },
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenDelta {
    pub gen: u64,
    pub delta: EntryDelta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
/// The status payload carried by a heartbeat.
///
/// Every variant embeds the sender's epoch and generation map. The epoch
/// identifies the run of the sending daemon, the map tells the receiver
/// which generation of its own data the sender holds.
pub enum HeartbeatMessage {
    /// The complete snapshot of the sender.
    Full {
        #[serde(default)]
        epoch: u64,
        gen: GenMap,
        entry: ClusterDataEntry,
    },
    /// Consecutive deltas on top of what the receivers already merged.
    Patch {
        #[serde(default)]
        epoch: u64,
        gen: GenMap,
        deltas: Vec<GenDelta>,
    },
    /// Nothing changed since the generation every peer acknowledged.
    Ping {
        #[serde(default)]
        epoch: u64,
        gen: GenMap,
    },
}

impl HeartbeatMessage {
    #[inline]
    pub fn gen(&self) -> &GenMap {
        match self {
            Self::Full { gen, .. } => gen,
            Self::Patch { gen, .. } => gen,
            Self::Ping { gen, .. } => gen,
        }
    }

    #[inline]
    pub fn epoch(&self) -> u64 {
        match self {
            Self::Full { epoch, .. } => *epoch,
            Self::Patch { epoch, .. } => *epoch,
            Self::Ping { epoch, .. } => *epoch,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(buf: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(buf)
    }
}

/// Generation counters and the retained diffs used for anti-entropy.
///
/// - `gen`: the local generation, it never decreases.
/// - `local_gen[peer]`: the generation of our data the peer acknowledged.
/// - `remote_gen[peer]`: the generation of the peer's data we merged.
/// - `diffs[gen]`: the delta produced by each local generation.
/// - `remote_epoch[peer]`: the run of the peer daemon `remote_gen` refers to.
///
/// Generations restart from 0 with every run of a daemon, so they are only
/// comparable between payloads carrying the same epoch.
pub struct GenerationTracker {
    local: String,
    epoch: u64,
    gen: AtomicU64,
    local_gen: Mutex<GenMap>,
    remote_gen: Mutex<GenMap>,
    remote_epoch: Mutex<BTreeMap<String, u64>>,
    diffs: Mutex<BTreeMap<u64, EntryDelta>>,
}

impl GenerationTracker {
    pub fn new(local: impl Into<String>, epoch: u64) -> Self {
        Self {
            local: local.into(),
            epoch,
            gen: AtomicU64::new(0),
            local_gen: Mutex::new(GenMap::new()),
            remote_gen: Mutex::new(GenMap::new()),
            remote_epoch: Mutex::new(BTreeMap::new()),
            diffs: Mutex::new(BTreeMap::new()),
        }
    }

    #[inline]
    pub fn current(&self) -> u64 {
        self.gen.load(Ordering::SeqCst)
    }

    #[inline]
    /// The run of this daemon embedded in outgoing payloads.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Records the epoch a peer advertised.
    ///
    /// Returns `true` when it differs from the previously recorded one, in
    /// which case the merged generation of that peer is reset to 0.
    pub fn observe_epoch(&self, peer: &str, epoch: u64) -> bool {
        let previous = self.remote_epoch.lock().insert(peer.to_string(), epoch);
        let restarted = matches!(previous, Some(previous) if previous != epoch);
        if restarted {
            self.set_remote(peer, 0);
        }
        restarted
    }

    /// The generation map embedded in outgoing payloads: our own generation
    /// plus every peer generation we merged.
    ///
    /// Incrementing records an empty diff, so the generation sequence never has gaps.
    pub fn get_gen(&self, increment: bool) -> GenMap {
        let gen = if increment {
            self.record(EntryDelta::default())
        } else {
            self.current()
        };

        let mut map = self.remote_gen.lock().clone();
        map.insert(self.local.clone(), gen);
        map
    }

    /// Retains a delta under a new generation and returns that generation.
    pub fn record(&self, delta: EntryDelta) -> u64 {
        let mut diffs = self.diffs.lock();
        let gen = self.gen.fetch_add(1, Ordering::SeqCst) + 1;
        diffs.insert(gen, delta);
        gen
    }

    /// Without a node, the lowest acknowledged generation and the number of
    /// tracked peers. With a node, that peer's acknowledged generation.
    pub fn get_oldest_gen(&self, nodename: Option<&str>) -> (u64, usize) {
        let local_gen = self.local_gen.lock();
        let count = local_gen.len();
        let gen = match nodename {
            Some(nodename) => local_gen.get(nodename).copied().unwrap_or(0),
            None => local_gen.values().min().copied().unwrap_or(0),
        };
        (gen, count)
    }

    /// Drops the diffs every tracked peer has moved past.
    ///
    /// Without tracked peers every diff is dropped, a peer joining later
    /// receives a full snapshot. Returns the number of dropped diffs.
    pub fn purge_log(&self) -> usize {
        let (oldest, count) = self.get_oldest_gen(None);
        let mut diffs = self.diffs.lock();
        let before = diffs.len();

        if count == 0 {
            diffs.clear();
        } else {
            *diffs = diffs.split_off(&oldest);
        }

        before - diffs.len()
    }

    /// The generations currently retained.
    pub fn retained(&self) -> Vec<u64> {
        self.diffs.lock().keys().copied().collect()
    }

    /// Every delta after `level`, or `None` when one of them was purged and
    /// the peer needs a full snapshot instead.
    pub fn deltas_since(&self, level: u64) -> Option<Vec<GenDelta>> {
        let diffs = self.diffs.lock();
        let current = self.current();

        let mut deltas = Vec::new();
        for gen in (level + 1)..=current {
            let delta = diffs.get(&gen)?;
            deltas.push(GenDelta {
                gen,
                delta: delta.clone(),
            });
        }

        Some(deltas)
    }

    /// Records the generation of our data a peer holds.
    pub fn ack(&self, peer: &str, gen: u64) {
        self.local_gen.lock().insert(peer.to_string(), gen);
    }

    pub fn acked(&self, peer: &str) -> Option<u64> {
        self.local_gen.lock().get(peer).copied()
    }

    pub fn tracked_peers(&self) -> Vec<String> {
        self.local_gen.lock().keys().cloned().collect()
    }

    pub fn remote(&self, peer: &str) -> Option<u64> {
        self.remote_gen.lock().get(peer).copied()
    }

    pub fn set_remote(&self, peer: &str, gen: u64) {
        self.remote_gen.lock().insert(peer.to_string(), gen);
    }

    /// Stops tracking a peer in both generation maps.
    pub fn forget(&self, peer: &str) {
        self.local_gen.lock().remove(peer);
        self.remote_gen.lock().remove(peer);
        self.remote_epoch.lock().remove(peer);
    }

    #[cfg(test)]
    pub(crate) fn insert_diff(&self, gen: u64, delta: EntryDelta) {
        self.diffs.lock().insert(gen, delta);
        self.gen.fetch_max(gen, Ordering::SeqCst);
    }
}
