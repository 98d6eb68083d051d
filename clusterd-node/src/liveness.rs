use std::sync::Arc;

use parking_lot::RwLock;

/// The liveness view of one heartbeat-receive transport.
///
/// Implemented by the heartbeat layer, one per configured transport.
pub trait PeerLiveness: Send + Sync + 'static {
    /// A name for diagnostics, like `hb#1.rx`.
    fn name(&self) -> &str;

    /// If the receive task of this transport is currently running.
    fn is_running(&self) -> bool;

    /// If this transport currently sees the peer beating.
    fn is_beating(&self, nodename: &str) -> bool;
}

#[derive(Default)]
/// The set of heartbeat-receive transports.
pub struct HeartbeatRegistry {
    transports: RwLock<Vec<Arc<dyn PeerLiveness>>>,
}

impl HeartbeatRegistry {
    pub fn register(&self, transport: Arc<dyn PeerLiveness>) {
        info!(transport = %transport.name(), "Registered heartbeat transport.");
        self.transports.write().push(transport);
    }

    /// Removes every transport with the given name.
    pub fn unregister(&self, name: &str) {
        self.transports.write().retain(|t| t.name() != name);
    }

    pub fn len(&self) -> usize {
        self.transports.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.read().is_empty()
    }

    /// A peer is down only when no running transport sees it beating.
    pub fn peer_down(&self, nodename: &str) -> bool {
        !self
            .transports
            .read()
            .iter()
            .any(|t| t.is_running() && t.is_beating(nodename))
    }
}
