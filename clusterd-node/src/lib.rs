//! # Clusterd Node
//! The shared cluster state of the cluster daemon.
//!
//! Every node keeps a replica of the status of every member. Replicas are
//! kept in sync by exchanging generation counted deltas over the heartbeats,
//! falling back to full snapshots whenever a delta is missing.
//!
//! On top of this replica the node decides, without talking to its peers,
//! which nodes are authorized to run each service, and whether it is still
//! part of the majority partition. A node in the minority fences itself.
//!
//! ## Basic Example
//!
//! ```rust
//! use clusterd_node::{ClusterConfig, ClusterStateBuilder, NmonUpdate, NodeStatus};
//!
//! let config = ClusterConfig {
//!     nodes: vec!["n1".to_string(), "n2".to_string()],
//!     ..Default::default()
//! };
//! let state = ClusterStateBuilder::new("n1", config).build();
//!
//! state.set_nmon(NmonUpdate::status(NodeStatus::Idle));
//! assert_eq!(state.get_node_monitor(None).unwrap().status, NodeStatus::Idle);
//! ```

#[macro_use]
extern crate tracing;

mod clock;
mod command;
mod config;
mod duplog;
mod error;
mod generation;
mod liveness;
mod model;
mod monitor;
mod placement;
mod quorum;
mod reaper;
mod replication;
mod statistics;
mod store;
mod wake;

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub use clock::Clock;
use clusterd_events::{CommandExecutor, Event, EventData, EventSink, ProcessExecutor};
pub use config::{
    ArbitratorConfig,
    ClusterConfig,
    ConfigSource,
    StaticConfig,
    TomlFileConfig,
    DEFAULT_ARBITRATOR_PORT,
    DEFAULT_MAINTENANCE_GRACE_PERIOD_SECS,
    DEFAULT_MIN_AVAIL_MEM,
    DEFAULT_MIN_AVAIL_SWAP,
};
pub use duplog::DupLog;
pub use error::NodeError;
pub use generation::{EntryDelta, GenDelta, GenerationTracker, HeartbeatMessage};
pub use liveness::{HeartbeatRegistry, PeerLiveness};
pub use model::{
    ClusterDataEntry,
    DataStatus,
    FieldUpdate,
    Frozen,
    GenMap,
    InstanceMonitor,
    InstanceSlot,
    NodeMonitor,
    NodeStats,
    NodeStatus,
    Provisioned,
    ServiceInstance,
    ServiceMonitor,
    ServiceStatus,
    ServicesData,
    Timestamp,
    UNSET,
};
pub use monitor::{MonitorState, NmonUpdate, SmonUpdate};
use parking_lot::RwLock;
pub use placement::{
    candidates,
    decide_leader,
    is_overloaded,
    leaders,
    ranks,
    CandidateFilter,
    ClusterSnapshot,
    LeaderDecision,
    MemoryLimits,
    PlacementPolicy,
    ServiceConfig,
    Topology,
};
pub use quorum::{
    has_quorum,
    ArbitratorProbe,
    ExecFencer,
    Fencer,
    QuorumState,
    QuorumTally,
    TcpArbitratorProbe,
    FENCING_FLUSH_DELAY,
};
pub use reaper::{start_peer_reaper, PeerReaperHandle};
pub use replication::MergeOutcome;
pub use statistics::ClusterStatistics;
pub use store::{Avail, DataStore, FrozenAgg, PlacementAgg, ProvisionedAgg, ServiceAgg};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::Level;
pub use wake::{wait_for_wake, Wake, WakeSignal};

/// Build a cluster state using provided settings.
pub struct ClusterStateBuilder {
    nodename: String,
    config: ClusterConfig,
    clock: Clock,
    epoch: Option<u64>,
    executor: Option<Arc<dyn CommandExecutor>>,
    arbitrator_probe: Option<Arc<dyn ArbitratorProbe>>,
    fencer: Option<Arc<dyn Fencer>>,
}

impl ClusterStateBuilder {
    /// Create a new cluster state builder.
    ///
    /// The `nodename` **must be unique** within the cluster.
    pub fn new(nodename: impl Into<String>, config: ClusterConfig) -> Self {
        Self {
            nodename: nodename.into(),
            config,
            clock: Clock::system(),
            epoch: None,
            executor: None,
            arbitrator_probe: None,
            fencer: None,
        }
    }

    /// Set the clock used for every timestamp.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Set the identity of this run of the daemon.
    ///
    /// Peers resync our data in full whenever it changes. Defaults to the
    /// start time in nanoseconds.
    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = Some(epoch);
        self
    }

    /// Set the executor running hooks and the crash command.
    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Set how arbitrators are asked for their vote.
    pub fn with_arbitrator_probe(mut self, probe: Arc<dyn ArbitratorProbe>) -> Self {
        self.arbitrator_probe = Some(probe);
        self
    }

    /// Set how the node terminates itself on quorum loss.
    pub fn with_fencer(mut self, fencer: Arc<dyn Fencer>) -> Self {
        self.fencer = Some(fencer);
        self
    }

    pub fn build(self) -> ClusterState {
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(ProcessExecutor) as Arc<dyn CommandExecutor>);
        let fencer = self
            .fencer
            .unwrap_or_else(|| Arc::new(ExecFencer::new(executor.clone())) as Arc<dyn Fencer>);
        let arbitrator_probe = self
            .arbitrator_probe
            .unwrap_or_else(|| Arc::new(TcpArbitratorProbe) as Arc<dyn ArbitratorProbe>);

        let events = EventSink::new(self.nodename.clone(), executor);
        events.hooks().set_hooks(self.config.hooks.clone());

        let epoch = self.epoch.unwrap_or_else(start_epoch);
        info!(
            nodename = %self.nodename,
            epoch = epoch,
            nodes = ?self.config.nodes,
            quorum = self.config.quorum,
            num_arbitrators = self.config.arbitrators.len(),
            "Cluster state initialised.",
        );

        let now = self.clock.now();
        let inner = ClusterStateInner {
            generations: GenerationTracker::new(self.nodename.clone(), epoch),
            monitors: MonitorState::new(now),
            nodename: self.nodename,
            clock: self.clock,
            config: RwLock::new(self.config),
            services: RwLock::new(BTreeMap::new()),
            store: DataStore::default(),
            heartbeats: HeartbeatRegistry::default(),
            wake: WakeSignal::default(),
            duplog: DupLog::default(),
            events,
            statistics: ClusterStatistics::default(),
            arbitrator_probe,
            fencer,
        };

        ClusterState {
            inner: Arc::new(inner),
        }
    }
}

fn start_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default()
}

pub(crate) struct ClusterStateInner {
    pub(crate) nodename: String,
    pub(crate) clock: Clock,
    pub(crate) config: RwLock<ClusterConfig>,
    pub(crate) services: RwLock<BTreeMap<String, Arc<ServiceConfig>>>,
    pub(crate) store: DataStore,
    pub(crate) generations: GenerationTracker,
    pub(crate) monitors: MonitorState,
    pub(crate) heartbeats: HeartbeatRegistry,
    pub(crate) wake: WakeSignal,
    pub(crate) duplog: DupLog,
    pub(crate) events: EventSink,
    pub(crate) statistics: ClusterStatistics,
    pub(crate) arbitrator_probe: Arc<dyn ArbitratorProbe>,
    pub(crate) fencer: Arc<dyn Fencer>,
}

#[derive(Clone)]
/// A cheap to clone handle to the shared cluster state.
///
/// Heartbeat tasks, the orchestration task and the command interface all
/// hold a handle to the same state.
pub struct ClusterState {
    pub(crate) inner: Arc<ClusterStateInner>,
}

impl ClusterState {
    #[inline]
    /// The name of the local node.
    pub fn nodename(&self) -> &str {
        &self.inner.nodename
    }

    #[inline]
    /// Get access to the cluster clock.
    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    #[inline]
    pub fn now(&self) -> Timestamp {
        self.inner.clock.now()
    }

    #[inline]
    /// Gets the live cluster statistics.
    pub fn statistics(&self) -> ClusterStatistics {
        self.inner.statistics.clone()
    }

    #[inline]
    /// Get access to the status snapshots of every node.
    pub fn store(&self) -> &DataStore {
        &self.inner.store
    }

    #[inline]
    /// Get access to the generation counters.
    pub fn generations(&self) -> &GenerationTracker {
        &self.inner.generations
    }

    #[inline]
    /// Get access to the event queue and hooks.
    pub fn events(&self) -> &EventSink {
        &self.inner.events
    }

    #[inline]
    /// Subscribe to orchestration wake requests.
    pub fn subscribe_wake(&self) -> watch::Receiver<Wake> {
        self.inner.wake.subscribe()
    }

    #[inline]
    /// Get a stream of orchestration wake requests.
    pub fn wake_stream(&self) -> WatchStream<Wake> {
        self.inner.wake.stream()
    }

    #[inline]
    /// Requests an orchestration pass.
    pub fn wake(&self, reason: impl Into<Cow<'static, str>>) {
        self.inner.wake.wake(reason)
    }

    /// The current cluster configuration.
    pub fn config(&self) -> ClusterConfig {
        self.inner.config.read().clone()
    }

    /// Replaces the cluster configuration.
    pub fn reconfigure(&self, config: ClusterConfig) {
        self.inner.events.hooks().set_hooks(config.hooks.clone());
        info!(
            nodename = %self.inner.nodename,
            nodes = ?config.nodes,
            quorum = config.quorum,
            num_arbitrators = config.arbitrators.len(),
            "Cluster configuration changed.",
        );
        *self.inner.config.write() = config;
        self.wake("cluster config change");
    }

    /// Reloads the configuration from its source.
    ///
    /// On failure the previous configuration is kept.
    pub fn reload_config(&self, source: &dyn ConfigSource) -> Result<(), NodeError> {
        match source.load() {
            Ok(config) => {
                self.reconfigure(config);
                Ok(())
            },
            Err(e) => {
                warn!(
                    error = ?e,
                    "Failed to reload the cluster configuration, keeping the previous one.",
                );
                Err(NodeError::ConfigSource(e))
            },
        }
    }

    /// The memory thresholds of an overloaded node.
    pub fn memory_limits(&self) -> MemoryLimits {
        let config = self.inner.config.read();
        MemoryLimits {
            min_avail_mem: config.min_avail_mem,
            min_avail_swap: config.min_avail_swap,
        }
    }

    /// Adds a heartbeat-receive transport to the peer liveness checks.
    pub fn register_heartbeat(&self, transport: Arc<dyn PeerLiveness>) {
        self.inner.heartbeats.register(transport);
    }

    pub fn unregister_heartbeat(&self, name: &str) {
        self.inner.heartbeats.unregister(name);
    }

    /// Registers, or replaces, the placement configuration of a service.
    pub fn register_service(&self, svc: ServiceConfig) {
        let svcname = svc.name.clone();
        self.inner
            .services
            .write()
            .insert(svcname.clone(), Arc::new(svc));
        self.wake(format!("service {svcname} config change"));
    }

    /// Forgets a service, its monitor and its aggregate.
    pub fn unregister_service(&self, svcname: &str) {
        let removed = self.inner.services.write().remove(svcname);
        self.inner.monitors.drop_smon(svcname);
        self.inner.store.drop_agg(svcname);
        self.inner.duplog.reset(svcname);
        if removed.is_some() {
            self.wake(format!("service {svcname} removed"));
        }
    }

    pub fn service(&self, svcname: &str) -> Option<Arc<ServiceConfig>> {
        self.inner.services.read().get(svcname).cloned()
    }

    pub fn get_service_instance(
        &self,
        svcname: &str,
        nodename: &str,
    ) -> Option<ServiceInstance> {
        self.inner.store.service_instance(svcname, nodename)
    }

    pub fn get_service_instances(
        &self,
        svcname: &str,
        discard_empty: bool,
    ) -> BTreeMap<String, ServiceInstance> {
        self.inner.store.service_instances(svcname, discard_empty)
    }

    /// The cached aggregate of a service, see [ClusterState::refresh_service_agg].
    pub fn get_service_agg(&self, svcname: &str) -> Option<ServiceAgg> {
        self.inner.store.agg(svcname)
    }

    /// Recomputes and caches the aggregate of a registered service.
    pub fn refresh_service_agg(&self, svcname: &str) -> Option<ServiceAgg> {
        let Some(svc) = self.service(svcname) else {
            self.inner.store.drop_agg(svcname);
            return None;
        };

        let instances = self.inner.store.service_instances(svcname, false);
        let leaders = self.placement_leaders(&svc, None);
        let agg = ServiceAgg::compute(&svc, &instances, &leaders);

        if self.inner.store.agg(svcname).as_ref() != Some(&agg) {
            self.inner.store.set_agg(svcname, agg.clone());
            self.wake(format!("service {svcname} agg change"));
        }
        Some(agg)
    }

    /// The nodes currently able to run the service.
    pub fn placement_candidates(
        &self,
        svc: &ServiceConfig,
        filter: CandidateFilter,
    ) -> BTreeSet<String> {
        let snapshot = self.inner.store.snapshot();
        candidates(svc, &snapshot, &self.memory_limits(), &filter)
    }

    /// The candidates of the service ordered by preference.
    ///
    /// Without explicit candidates, every check of [CandidateFilter] applies.
    pub fn placement_ranks(
        &self,
        svc: &ServiceConfig,
        candidates: Option<&BTreeSet<String>>,
    ) -> Vec<String> {
        let snapshot = self.inner.store.snapshot();
        let candidates = self.resolve_candidates(svc, candidates, &snapshot);
        ranks(svc, &candidates, &snapshot)
    }

    /// The nodes authorized to run the service.
    pub fn placement_leaders(
        &self,
        svc: &ServiceConfig,
        candidates: Option<&BTreeSet<String>>,
    ) -> Vec<String> {
        leaders(svc, &self.placement_ranks(svc, candidates))
    }

    /// If the local node is authorized to run the service.
    ///
    /// Unless `silent`, the reasoning is logged each time it changes.
    pub fn placement_leader(
        &self,
        svc: &ServiceConfig,
        candidates: Option<&BTreeSet<String>>,
        silent: bool,
    ) -> bool {
        let snapshot = self.inner.store.snapshot();
        let candidates = self.resolve_candidates(svc, candidates, &snapshot);
        let decision = decide_leader(svc, &self.inner.nodename, &candidates, &snapshot);

        if !silent {
            self.inner.duplog.log(
                Level::INFO,
                &svc.name,
                format!("Service {} placement: {}.", svc.name, decision),
            );
        }

        decision.is_leader()
    }

    fn resolve_candidates(
        &self,
        svc: &ServiceConfig,
        candidates: Option<&BTreeSet<String>>,
        snapshot: &ClusterSnapshot,
    ) -> BTreeSet<String> {
        match candidates {
            Some(candidates) => candidates.clone(),
            None => placement::candidates(
                svc,
                snapshot,
                &self.memory_limits(),
                &CandidateFilter::default(),
            ),
        }
    }

    /// Emits an event, attaching the relevant monitor.
    ///
    /// Service events carry the service monitor and the local instance,
    /// other events carry the node monitor.
    pub fn event(&self, mut data: EventData) -> Event {
        match data.svcname.clone() {
            Some(svcname) => {
                if data.monitor.is_none() {
                    data.monitor = self
                        .inner
                        .monitors
                        .smon(&svcname)
                        .and_then(|smon| serde_json::to_value(smon).ok());
                }
                if data.instance.is_none() {
                    data.instance = self
                        .inner
                        .store
                        .service_instance(&svcname, &self.inner.nodename)
                        .and_then(|instance| serde_json::to_value(instance).ok());
                }
            },
            None => {
                if data.monitor.is_none() {
                    data.monitor = serde_json::to_value(self.inner.monitors.nmon()).ok();
                }
            },
        }

        self.inner
            .statistics
            .num_events
            .fetch_add(1, Ordering::Relaxed);
        self.inner.events.emit(self.now(), data)
    }

    pub(crate) fn refresh_statistics(&self) {
        let stats = &self.inner.statistics;
        stats
            .num_live_members
            .store(self.inner.store.len() as u64, Ordering::Relaxed);
        stats
            .current_gen
            .store(self.inner.generations.current(), Ordering::Relaxed);
        stats.num_retained_diffs.store(
            self.inner.generations.retained().len() as u64,
            Ordering::Relaxed,
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;

    use clusterd_events::EventError;

    use super::*;
    use crate::placement::tests::{idle_entry, up_instance};

    pub const START: Timestamp = 1_000.0;

    pub struct NoopExecutor;

    impl CommandExecutor for NoopExecutor {
        fn spawn(&self, _argv: &[String], _input: Option<Vec<u8>>) -> Result<(), EventError> {
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingFencer {
        pub calls: AtomicUsize,
    }

    impl Fencer for RecordingFencer {
        fn fence(&self, _crash_command: Option<&[String]>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn test_state(local: &str, nodes: &[&str]) -> ClusterState {
        let config = ClusterConfig {
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        };
        ClusterStateBuilder::new(local, config)
            .with_clock(Clock::manual(START))
            .with_executor(Arc::new(NoopExecutor))
            .with_fencer(Arc::new(RecordingFencer::default()))
            .build()
    }

    #[test]
    fn test_placement_wrappers() {
        let state = test_state("n2", &["n1", "n2", "n3"]);
        let svc = ServiceConfig::failover("web", ["n1", "n2", "n3"]);
        for nodename in ["n1", "n2", "n3"] {
            state.store().replace(nodename, idle_entry("web"));
        }

        let all = state.placement_candidates(&svc, CandidateFilter::default());
        assert_eq!(all.len(), 3);
        assert_eq!(state.placement_ranks(&svc, None), vec!["n1", "n2", "n3"]);
        assert_eq!(state.placement_leaders(&svc, None), vec!["n1"]);
        assert!(!state.placement_leader(&svc, None, false));

        let mut entry = idle_entry("web");
        entry.monitor.status = NodeStatus::Maintenance;
        state.store().replace("n1", entry);
        assert!(state.placement_leader(&svc, None, false));

        let only_me: BTreeSet<String> = ["n2".to_string()].into_iter().collect();
        assert!(state.placement_leader(&svc, Some(&only_me), true));
        let not_me: BTreeSet<String> = ["n3".to_string()].into_iter().collect();
        assert!(!state.placement_leader(&svc, Some(&not_me), true));
    }

    #[test]
    fn test_placement_is_deterministic_across_nodes() {
        let svc = ServiceConfig::flex("web", ["n1", "n2", "n3", "n4"], 2)
            .with_placement(PlacementPolicy::Spread);
        let states = ["n1", "n2", "n3", "n4"]
            .map(|local| test_state(local, &["n1", "n2", "n3", "n4"]));
        for state in states.iter() {
            for nodename in ["n1", "n2", "n3", "n4"] {
                state.store().replace(nodename, idle_entry("web"));
            }
        }

        let leaders = states[0].placement_leaders(&svc, None);
        assert_eq!(leaders.len(), 2);
        for state in states.iter() {
            assert_eq!(state.placement_leaders(&svc, None), leaders);
            assert_eq!(
                state.placement_leader(&svc, None, true),
                leaders.iter().any(|n| n == state.nodename()),
            );
        }
    }

    #[test]
    fn test_refresh_service_agg() {
        let state = test_state("n1", &["n1", "n2"]);
        assert!(state.refresh_service_agg("web").is_none());

        state.register_service(ServiceConfig::failover("web", ["n1", "n2"]));
        state.store().replace("n1", idle_entry("web"));
        let mut down = up_instance();
        down.avail = Some("down".to_string());
        state
            .store()
            .replace("n2", ClusterDataEntry::default().with_instance("web", down));

        let agg = state.refresh_service_agg("web").expect("Service is registered.");
        assert_eq!(agg.avail, Avail::Up);
        assert_eq!(agg.placement, PlacementAgg::Optimal);
        assert_eq!(state.get_service_agg("web"), Some(agg));

        state.unregister_service("web");
        assert!(state.get_service_agg("web").is_none());
        assert!(state.service("web").is_none());
    }

    #[test]
    fn test_event_attaches_monitors() {
        let state = test_state("n1", &["n1"]);
        state.store().replace("n1", idle_entry("web"));
        state.set_smon("web", SmonUpdate::status(ServiceStatus::Ready));
        let rx = state.events().subscribe();
        rx.drain().for_each(drop);

        let event = state.event(EventData::new("instance_start").with_svcname("web"));
        let monitor = event.data.monitor.expect("Service monitor attached.");
        assert_eq!(monitor["status"], "ready");
        let instance = event.data.instance.expect("Local instance attached.");
        assert_eq!(instance["avail"], "up");

        let event = state.event(EventData::new("node_config_change"));
        assert_eq!(event.data.monitor.expect("Node monitor attached.")["status"], "init");
        assert_eq!(event.ts, START);
        assert_eq!(rx.len(), 2);
        assert!(state.statistics().num_events() >= 3);
    }

    #[test]
    fn test_reload_config_keeps_previous_on_failure() {
        let state = test_state("n1", &["n1"]);
        let mut wake = state.subscribe_wake();

        let mut config = state.config();
        config.quorum = true;
        config.nodes.push("n2".to_string());
        state
            .reload_config(&StaticConfig(config.clone()))
            .expect("Static config loads.");
        assert_eq!(state.config(), config);
        assert!(wake.has_changed().unwrap());

        let missing = TomlFileConfig::new("/nonexistent/clusterd/cluster.toml");
        let err = state.reload_config(&missing).unwrap_err();
        assert!(matches!(err, NodeError::ConfigSource(_)));
        assert_eq!(state.config(), config);
        assert_eq!(state.memory_limits().min_avail_mem, DEFAULT_MIN_AVAIL_MEM);
    }
}
