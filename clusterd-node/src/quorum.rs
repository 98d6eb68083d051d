use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clusterd_events::{CommandExecutor, EventData};
use serde::Serialize;
use tracing::Level;

use crate::config::ArbitratorConfig;
use crate::model::NodeStatus;
use crate::placement::is_overloaded;
use crate::ClusterState;

/// How long to wait for logs and events to flush before self-fencing.
pub const FENCING_FLUSH_DELAY: Duration = Duration::from_secs(2);

static QUORUM_LOG_KEY: &str = "quorum";

#[async_trait]
/// Asks an external arbitrator for its vote.
pub trait ArbitratorProbe: Send + Sync + 'static {
    /// Returns `true` if the arbitrator answered.
    ///
    /// The caller bounds every probe by the arbitrator timeout.
    async fn probe(&self, arbitrator: &ArbitratorConfig) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
/// Votes for any arbitrator accepting a TCP connection on its address.
pub struct TcpArbitratorProbe;

#[async_trait]
impl ArbitratorProbe for TcpArbitratorProbe {
    async fn probe(&self, arbitrator: &ArbitratorConfig) -> bool {
        let addr = arbitrator.probe_address();
        match tokio::net::TcpStream::connect(addr.as_str()).await {
            Ok(_) => true,
            Err(e) => {
                debug!(
                    arbitrator = %arbitrator.name,
                    addr = %addr,
                    error = %e,
                    "Arbitrator probe failed.",
                );
                false
            },
        }
    }
}

/// Terminates the local node when it is in the minority partition.
pub trait Fencer: Send + Sync + 'static {
    /// Not expected to return.
    fn fence(&self, crash_command: Option<&[String]>);
}

/// Runs the configured crash command, then aborts the process.
pub struct ExecFencer {
    executor: Arc<dyn CommandExecutor>,
}

impl ExecFencer {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }
}

impl Fencer for ExecFencer {
    fn fence(&self, crash_command: Option<&[String]>) {
        if let Some(argv) = crash_command {
            if let Err(e) = self.executor.spawn(argv, None) {
                error!(error = %e, "Failed to run the crash command.");
            }
        }

        error!("Self-fencing, aborting the process.");
        std::process::abort();
    }
}

#[inline]
/// If `live` nodes and `votes` arbitrators form a strict majority of `total` voters.
pub fn has_quorum(live: usize, votes: usize, total: usize) -> bool {
    2 * (live + votes) > total
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuorumTally {
    /// The nodes with a status snapshot, including the local node.
    pub live: usize,
    pub arbitrator_votes: usize,
    /// Configured nodes plus arbitrators.
    pub voting: usize,
    /// The nodes and arbitrators on our side of the split.
    pub pro_voters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuorumState {
    Disabled,
    /// The local node is frozen, splits are ignored.
    Frozen,
    Held(QuorumTally),
    /// Fencing was triggered.
    Lost(QuorumTally),
}

impl ClusterState {
    /// If the node reports less available memory or swap than the configured minimum.
    ///
    /// `None` checks the local node. Nodes without stats are not overloaded.
    pub fn node_overloaded(&self, nodename: Option<&str>) -> bool {
        let nodename = nodename.unwrap_or(&self.inner.nodename);
        match self.inner.store.entry(nodename) {
            Some(entry) => is_overloaded(&entry.stats, &self.memory_limits()),
            None => false,
        }
    }

    /// A peer is down when no running heartbeat transport sees it beating.
    pub fn peer_down(&self, nodename: &str) -> bool {
        self.inner.heartbeats.peer_down(nodename)
    }

    /// Re-evaluates the quorum after a peer loss, fencing the local node
    /// when it is in the minority.
    pub async fn split_handler(&self) -> QuorumState {
        let config = self.config();
        if !config.quorum {
            self.inner.duplog.log(
                Level::DEBUG,
                QUORUM_LOG_KEY,
                "Cluster split ignored, quorum is disabled.".to_string(),
            );
            return QuorumState::Disabled;
        }

        let local_frozen = self
            .inner
            .store
            .entry(&self.inner.nodename)
            .map(|entry| entry.frozen.is_frozen())
            .unwrap_or(false);
        if local_frozen {
            self.inner.duplog.log(
                Level::WARN,
                QUORUM_LOG_KEY,
                "Cluster split ignored, the local node is frozen.".to_string(),
            );
            return QuorumState::Frozen;
        }

        let mut live_nodes = self.inner.store.nodenames();
        live_nodes.insert(self.inner.nodename.clone());

        let voters = self.arbitrator_votes(&config.arbitrators).await;
        let tally = QuorumTally {
            live: live_nodes.len(),
            arbitrator_votes: voters.len(),
            voting: config.total_votes(),
            pro_voters: live_nodes.into_iter().chain(voters).collect(),
        };

        if has_quorum(tally.live, tally.arbitrator_votes, tally.voting) {
            self.inner.duplog.log(
                Level::INFO,
                QUORUM_LOG_KEY,
                format!(
                    "Cluster split, quorum held with {}+{} out of {} votes ({}).",
                    tally.live,
                    tally.arbitrator_votes,
                    tally.voting,
                    tally.pro_voters.join(", "),
                ),
            );
            return QuorumState::Held(tally);
        }

        self.inner.duplog.reset(QUORUM_LOG_KEY);
        self.inner
            .statistics
            .num_fencing
            .fetch_add(1, Ordering::Relaxed);
        self.event(
            EventData::new("crash")
                .with_reason("split")
                .with("live", tally.live)
                .with("arbitrator_votes", tally.arbitrator_votes)
                .with("voting", tally.voting)
                .with("pro_voters", tally.pro_voters.clone()),
        );

        tokio::time::sleep(FENCING_FLUSH_DELAY).await;
        self.inner.fencer.fence(config.crash_command.as_deref());

        QuorumState::Lost(tally)
    }

    /// Probes every arbitrator concurrently, returning the names of those who voted.
    async fn arbitrator_votes(&self, arbitrators: &[ArbitratorConfig]) -> Vec<String> {
        let probes = arbitrators.iter().map(|arbitrator| {
            let probe = self.inner.arbitrator_probe.clone();
            async move {
                if !arbitrator.is_valid() {
                    warn!(
                        arbitrator = %arbitrator.name,
                        "Malformed arbitrator definition, it will not vote.",
                    );
                    return None;
                }

                match tokio::time::timeout(arbitrator.timeout(), probe.probe(arbitrator)).await {
                    Ok(true) => Some(arbitrator.name.clone()),
                    Ok(false) => None,
                    Err(_) => {
                        debug!(arbitrator = %arbitrator.name, "Arbitrator probe timed out.");
                        None
                    },
                }
            }
        });

        futures::future::join_all(probes)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Forgets the data of a peer which stopped beating on every transport.
    ///
    /// The data of a peer in `upgrade` or `init` state is preserved, and so is
    /// the data of a peer in `maintenance` until the grace period elapses.
    /// Returns `true` if the data was forgotten.
    pub async fn forget_peer_data(&self, nodename: &str, change: bool) -> bool {
        let Some(entry) = self.inner.store.entry(nodename) else {
            return false;
        };

        if !self.peer_down(nodename) {
            return false;
        }

        let status = entry.monitor.status;
        let grace_period = self.config().maintenance_grace_period_secs as f64;
        let preserve = match status {
            NodeStatus::Upgrade | NodeStatus::Init => true,
            NodeStatus::Maintenance => self.now() - entry.monitor.status_updated < grace_period,
            _ => false,
        };
        if preserve {
            if change {
                self.inner.duplog.log(
                    Level::DEBUG,
                    &format!("forget {nodename}"),
                    format!("Preserving node {nodename} data in {status} state."),
                );
            }
            return false;
        }

        self.event(
            EventData::new("forget_peer")
                .with_reason("no_rx")
                .with("peer", nodename),
        );

        self.inner.store.remove(nodename);
        self.inner.generations.forget(nodename);
        self.inner.duplog.reset(&format!("forget {nodename}"));
        self.refresh_statistics();
        self.inner
            .statistics
            .num_forgotten_peers
            .fetch_add(1, Ordering::Relaxed);
        self.wake(format!("forget node {nodename} data"));

        if status != NodeStatus::Shutting {
            self.split_handler().await;
        }

        true
    }

    /// Tries to forget every peer, returning how many were forgotten.
    pub async fn reap_lost_peers(&self) -> usize {
        let mut forgotten = 0;
        for nodename in self.inner.store.nodenames() {
            if nodename == self.inner.nodename {
                continue;
            }
            if self.forget_peer_data(&nodename, false).await {
                forgotten += 1;
            }
        }
        forgotten
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_arithmetic() {
        assert!(has_quorum(3, 0, 5));
        assert!(!has_quorum(2, 0, 5));
        assert!(has_quorum(2, 1, 5));

        assert!(has_quorum(2, 0, 3));
        assert!(!has_quorum(1, 0, 3));
        assert!(!has_quorum(2, 0, 4), "A tie is not a majority.");
        assert!(has_quorum(1, 0, 1));
    }

    #[tokio::test]
    async fn test_tcp_probe() -> anyhow::Result<()> {
        let (listener, addr) = test_helper::bind_unused_listener();
        let arbitrator = ArbitratorConfig::new("arb1", addr.to_string());
        assert!(TcpArbitratorProbe.probe(&arbitrator).await);

        drop(listener);
        assert!(!TcpArbitratorProbe.probe(&arbitrator).await);
        Ok(())
    }
}
