use crate::generation::{EntryDelta, GenDelta, HeartbeatMessage};
use crate::model::{ClusterDataEntry, GenMap};
use crate::ClusterState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The result of merging a peer payload.
pub enum MergeOutcome {
    /// The peer entry was replaced.
    Applied,
    /// The payload carried nothing new.
    Unchanged,
    /// The payload could not be applied on top of our copy. Our generation
    /// map now advertises level 0 for the peer, which answers with a full
    /// snapshot.
    NeedFull,
}

impl ClusterState {
    /// Stores the freshly computed local snapshot.
    ///
    /// The local node monitor always overrides the monitor of the snapshot.
    /// When the snapshot differs from the previous one its delta is retained
    /// under a new generation. Returns the current generation.
    ///
    /// The local entry has a single writer, the orchestration task.
    pub fn publish_local(&self, mut entry: ClusterDataEntry) -> u64 {
        entry.monitor = self.inner.monitors.nmon();

        let previous = self
            .inner
            .store
            .replace(self.inner.nodename.clone(), entry.clone());
        let delta = EntryDelta::between(previous.as_deref(), &entry);
        if delta.is_empty() {
            return self.inner.generations.current();
        }

        let gen = self.inner.generations.record(delta);
        self.refresh_statistics();
        self.wake("local data change");
        gen
    }

    /// The generation map embedded in outgoing payloads.
    pub fn get_gen(&self, increment: bool) -> GenMap {
        let gen = self.inner.generations.get_gen(increment);
        if increment {
            self.refresh_statistics();
        }
        gen
    }

    /// Builds the payload broadcast to every peer.
    ///
    /// A full snapshot is sent when no peer is tracked yet, when a peer holds
    /// none of our data, or when a delta it needs was already purged.
    pub fn build_heartbeat(&self) -> HeartbeatMessage {
        let (oldest, count) = self.inner.generations.get_oldest_gen(None);
        if count == 0 {
            return self.full_heartbeat();
        }
        self.heartbeat_since(oldest)
    }

    /// Builds the payload for a single peer, from the level it acknowledged.
    pub fn build_heartbeat_for(&self, peer: &str) -> HeartbeatMessage {
        match self.inner.generations.acked(peer) {
            Some(level) => self.heartbeat_since(level),
            None => self.full_heartbeat(),
        }
    }

    fn heartbeat_since(&self, level: u64) -> HeartbeatMessage {
        if level == 0 {
            return self.full_heartbeat();
        }

        let epoch = self.inner.generations.epoch();
        let gen = self.inner.generations.get_gen(false);
        match self.inner.generations.deltas_since(level) {
            None => {
                debug!(level = level, "Generation already purged, sending a full snapshot.");
                self.full_heartbeat()
            },
            Some(deltas) if deltas.is_empty() => HeartbeatMessage::Ping { epoch, gen },
            Some(deltas) => HeartbeatMessage::Patch { epoch, gen, deltas },
        }
    }

    fn full_heartbeat(&self) -> HeartbeatMessage {
        // The generation is read first, a newer entry is harmless as deltas are idempotent.
        let gen = self.inner.generations.get_gen(false);
        let entry = match self.inner.store.entry(&self.inner.nodename) {
            Some(entry) => entry.as_ref().clone(),
            None => ClusterDataEntry {
                monitor: self.inner.monitors.nmon(),
                ..Default::default()
            },
        };
        HeartbeatMessage::Full {
            epoch: self.inner.generations.epoch(),
            gen,
            entry,
        }
    }

    /// Merges a payload received from a peer.
    ///
    /// A payload from a new run of the peer daemon is only merged when it is
    /// a full snapshot, its generations say nothing about our copy.
    pub fn merge_heartbeat(&self, peer: &str, msg: HeartbeatMessage) -> MergeOutcome {
        if self.inner.generations.observe_epoch(peer, msg.epoch()) {
            info!(peer = %peer, epoch = msg.epoch(), "Peer restarted, resyncing its data.");
        }

        let acked = msg
            .gen()
            .get(&self.inner.nodename)
            .copied()
            .unwrap_or(0);
        self.inner.generations.ack(peer, acked);
        self.inner.generations.purge_log();

        let peer_gen = msg.gen().get(peer).copied().unwrap_or(0);
        let outcome = match msg {
            HeartbeatMessage::Full { entry, .. } => {
                let previous = self.inner.store.replace(peer, entry.clone());
                self.inner.generations.set_remote(peer, peer_gen);
                if previous.as_deref() == Some(&entry) {
                    MergeOutcome::Unchanged
                } else {
                    MergeOutcome::Applied
                }
            },
            HeartbeatMessage::Ping { .. } => {
                let in_sync = self.inner.generations.remote(peer) == Some(peer_gen)
                    && peer_gen > 0
                    && self.inner.store.contains(peer);
                if in_sync {
                    MergeOutcome::Unchanged
                } else {
                    self.request_full(peer, "ping ahead of our copy")
                }
            },
            HeartbeatMessage::Patch { deltas, .. } => self.apply_patch(peer, deltas),
        };

        self.refresh_statistics();
        if outcome == MergeOutcome::Applied {
            self.wake(format!("node {peer} data change"));
        }
        outcome
    }

    fn apply_patch(&self, peer: &str, deltas: Vec<GenDelta>) -> MergeOutcome {
        let Some(base) = self.inner.store.entry(peer) else {
            return self.request_full(peer, "patch without a base");
        };
        let mut level = match self.inner.generations.remote(peer) {
            Some(level) if level > 0 => level,
            _ => return self.request_full(peer, "patch without a base generation"),
        };

        let mut entry = base.as_ref().clone();
        let mut applied = false;
        for GenDelta { gen, delta } in deltas {
            if gen <= level {
                continue;
            }
            if gen != level + 1 {
                return self.request_full(peer, "generation gap");
            }
            delta.apply(&mut entry);
            level = gen;
            applied = true;
        }

        if !applied {
            return MergeOutcome::Unchanged;
        }

        self.inner.store.replace(peer, entry);
        self.inner.generations.set_remote(peer, level);
        MergeOutcome::Applied
    }

    fn request_full(&self, peer: &str, reason: &str) -> MergeOutcome {
        debug!(peer = %peer, reason = %reason, "Requesting a full snapshot.");
        self.inner.generations.set_remote(peer, 0);
        MergeOutcome::NeedFull
    }

    /// Stores the unknown placeholder for a peer whose payload could not be decoded.
    pub fn mark_peer_unknown(&self, peer: &str) {
        self.inner.store.replace(peer, ClusterDataEntry::unknown());
        self.inner.generations.set_remote(peer, 0);
        self.refresh_statistics();
        self.wake(format!("node {peer} data unknown"));
    }
}
