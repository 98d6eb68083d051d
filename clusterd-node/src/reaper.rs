use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};

use crate::ClusterState;

#[derive(Clone, Debug)]
pub struct PeerReaperHandle(Arc<AtomicBool>);

impl PeerReaperHandle {
    /// Kill's the reaper which this handle belongs to.
    ///
    /// The task exits on its next tick or wake.
    pub fn kill(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Spawns a task forgetting the data of lost peers every `period`, and
/// whenever the orchestration is woken.
pub fn start_peer_reaper(state: ClusterState, period: Duration) -> PeerReaperHandle {
    let stop = Arc::new(AtomicBool::new(false));
    tokio::spawn(peer_reaper_task(state, period, stop.clone()));
    PeerReaperHandle(stop)
}

async fn peer_reaper_task(state: ClusterState, period: Duration, stop: Arc<AtomicBool>) {
    let mut interval = interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut wake = state.subscribe_wake();

    while !stop.load(Ordering::Relaxed) {
        tokio::select! {
            _ = interval.tick() => {},
            changed = wake.changed() => {
                if changed.is_err() {
                    break;
                }
            },
        }

        if stop.load(Ordering::Relaxed) {
            break;
        }

        let num_forgotten = state.reap_lost_peers().await;
        if num_forgotten > 0 {
            info!(
                nodename = %state.nodename(),
                num_forgotten = num_forgotten,
                "Forgot the data of lost peers.",
            );
        }
    }

    debug!(nodename = %state.nodename(), "Peer reaper stopped.");
}
