use std::collections::BTreeMap;

use clusterd_events::EventData;
use parking_lot::Mutex;

use crate::model::{
    FieldUpdate,
    NodeMonitor,
    NodeStatus,
    ServiceMonitor,
    ServiceStatus,
    Timestamp,
    UNSET,
};
use crate::ClusterState;

/// Global expectations accepted on instances without any resource.
///
/// Placeholder, slave and scaler instances have nothing to start or stop,
/// every other target is ignored for them.
static EMPTY_INSTANCE_GLOBAL_EXPECT: &[&str] =
    &["frozen", "thawed", "aborted", "deleted", "purged"];

static LEADER: &str = "leader";

/// The local node monitor (NMON) and the service monitors (SMON).
pub struct MonitorState {
    nmon: Mutex<NodeMonitor>,
    smon: Mutex<BTreeMap<String, ServiceMonitor>>,
}

impl MonitorState {
    pub fn new(now: Timestamp) -> Self {
        Self {
            nmon: Mutex::new(NodeMonitor::starting(now)),
            smon: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn nmon(&self) -> NodeMonitor {
        self.nmon.lock().clone()
    }

    /// The service monitor, without initializing it.
    pub fn smon(&self, svcname: &str) -> Option<ServiceMonitor> {
        self.smon.lock().get(svcname).cloned()
    }

    pub fn svcnames(&self) -> Vec<String> {
        self.smon.lock().keys().cloned().collect()
    }

    pub(crate) fn drop_smon(&self, svcname: &str) -> Option<ServiceMonitor> {
        self.smon.lock().remove(svcname)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// A partial node monitor update, `None` fields are left untouched.
pub struct NmonUpdate {
    pub status: Option<NodeStatus>,
    pub local_expect: Option<FieldUpdate<String>>,
    pub global_expect: Option<FieldUpdate<String>>,
}

impl NmonUpdate {
    pub fn status(status: NodeStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// A partial service monitor update, `None` fields are left untouched.
pub struct SmonUpdate {
    pub status: Option<ServiceStatus>,
    pub local_expect: Option<FieldUpdate<String>>,
    pub global_expect: Option<FieldUpdate<String>>,
    /// Clears every resource restart counter.
    pub reset_retries: bool,
    pub stonith: Option<FieldUpdate<String>>,
}

impl SmonUpdate {
    pub fn status(status: ServiceStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn global_expect(value: &str) -> Self {
        Self {
            global_expect: Some(FieldUpdate::parse(value)),
            ..Default::default()
        }
    }

    /// An update which only confirms the instance is idle, or which clears
    /// the local expectation, is always accepted.
    fn is_benign(&self) -> bool {
        self.status == Some(ServiceStatus::Idle)
            || self.local_expect == Some(FieldUpdate::Unset)
    }
}

struct Change {
    field: &'static str,
    from: String,
    to: String,
}

impl Change {
    fn event(&self, id: &str) -> EventData {
        EventData::new(id)
            .with("field", self.field)
            .with("from", self.from.as_str())
            .with("to", self.to.as_str())
    }
}

fn display(value: &Option<String>) -> String {
    value.as_deref().unwrap_or(UNSET).to_string()
}

fn update_field(
    field: &'static str,
    current: &mut Option<String>,
    update: Option<FieldUpdate<String>>,
    changes: &mut Vec<Change>,
) -> bool {
    let Some(update) = update else {
        return false;
    };
    let value = update.into_option();
    if *current == value {
        return false;
    }

    changes.push(Change {
        field,
        from: display(current),
        to: display(&value),
    });
    *current = value;
    true
}

impl ClusterState {
    /// The monitor of a node: the local NMON for the local node or `None`,
    /// the last merged monitor for a peer.
    pub fn get_node_monitor(&self, nodename: Option<&str>) -> Option<NodeMonitor> {
        match nodename {
            None => Some(self.inner.monitors.nmon()),
            Some(nodename) if nodename == self.inner.nodename => {
                Some(self.inner.monitors.nmon())
            },
            Some(nodename) => {
                let entry = self.inner.store.entry(nodename)?;
                Some(entry.monitor.clone())
            },
        }
    }

    /// Applies a partial update to the local node monitor.
    ///
    /// Returns `true` if any field changed.
    pub fn set_nmon(&self, update: NmonUpdate) -> bool {
        let now = self.now();
        let mut changes = Vec::new();

        {
            let mut nmon = self.inner.monitors.nmon.lock();
            if let Some(status) = update.status {
                if nmon.status != status {
                    changes.push(Change {
                        field: "status",
                        from: nmon.status.to_string(),
                        to: status.to_string(),
                    });
                    nmon.status = status;
                    nmon.status_updated = now;
                }
            }
            update_field(
                "local_expect",
                &mut nmon.local_expect,
                update.local_expect,
                &mut changes,
            );
            update_field(
                "global_expect",
                &mut nmon.global_expect,
                update.global_expect,
                &mut changes,
            );
        }

        if changes.is_empty() {
            return false;
        }

        for change in changes.iter() {
            self.event(change.event("node_monitor_change"));
        }
        self.wake("node mon change");
        true
    }

    /// Applies a partial update to a service monitor, creating it if needed.
    ///
    /// Instances without resources only accept freeze, thaw, abort, delete
    /// and purge targets, other updates are silently dropped.
    /// Returns `true` if any field changed.
    pub fn set_smon(&self, svcname: &str, update: SmonUpdate) -> bool {
        if self.rejects_global_expect(svcname, &update) {
            debug!(
                svcname = %svcname,
                global_expect = ?update.global_expect,
                "Ignoring global expect on an instance without resources.",
            );
            return false;
        }

        let now = self.now();
        let mut changes = Vec::new();
        let mut left_failure = false;

        {
            let mut smon = self.inner.monitors.smon.lock();
            let smon = smon
                .entry(svcname.to_string())
                .or_insert_with(|| ServiceMonitor::idle(now));

            if let Some(status) = update.status {
                if smon.status != status {
                    left_failure = smon.status.is_failed() && !status.is_failed();
                    changes.push(Change {
                        field: "status",
                        from: smon.status.to_string(),
                        to: status.to_string(),
                    });
                    smon.status = status;
                    smon.status_updated = now;
                }
            }

            update_field(
                "local_expect",
                &mut smon.local_expect,
                update.local_expect,
                &mut changes,
            );

            if update_field(
                "global_expect",
                &mut smon.global_expect,
                update.global_expect,
                &mut changes,
            ) {
                smon.global_expect_updated = now;
            }

            if update.reset_retries && !smon.restart.is_empty() {
                changes.push(Change {
                    field: "restart",
                    from: smon.restart.values().sum::<u32>().to_string(),
                    to: "0".to_string(),
                });
                smon.restart.clear();
            }

            update_field("stonith", &mut smon.stonith, update.stonith, &mut changes);

            if left_failure {
                smon.placement.clear();
            }
        }

        if left_failure {
            self.refresh_smon_placement(svcname);
        }

        if changes.is_empty() {
            return false;
        }

        for change in changes.iter() {
            self.event(change.event("service_monitor_change").with_svcname(svcname));
        }
        self.wake(format!("service {svcname} mon change"));
        true
    }

    fn rejects_global_expect(&self, svcname: &str, update: &SmonUpdate) -> bool {
        let Some(FieldUpdate::Set(global_expect)) = &update.global_expect else {
            return false;
        };

        if update.is_benign() || EMPTY_INSTANCE_GLOBAL_EXPECT.contains(&global_expect.as_str()) {
            return false;
        }

        match self.inner.store.service_instance(svcname, &self.inner.nodename) {
            Some(instance) => instance.resources.is_empty(),
            None => false,
        }
    }

    /// Increments the restart counter of a resource and returns the new count.
    pub fn inc_smon_restart(&self, svcname: &str, rid: &str) -> u32 {
        let now = self.now();
        let count = {
            let mut smon = self.inner.monitors.smon.lock();
            let smon = smon
                .entry(svcname.to_string())
                .or_insert_with(|| ServiceMonitor::idle(now));
            let count = smon.restart.entry(rid.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        self.wake(format!("service {svcname} restart count change"));
        count
    }

    /// The service monitor, initialized to idle if absent, with its
    /// placement role freshly computed.
    pub fn get_service_monitor(&self, svcname: &str) -> ServiceMonitor {
        let now = self.now();
        {
            let mut smon = self.inner.monitors.smon.lock();
            smon.entry(svcname.to_string())
                .or_insert_with(|| ServiceMonitor::idle(now));
        }

        self.refresh_smon_placement(svcname);
        self.inner
            .monitors
            .smon(svcname)
            .unwrap_or_else(|| ServiceMonitor::idle(now))
    }

    /// Recomputes the placement role outside of the SMON lock, then stores it.
    fn refresh_smon_placement(&self, svcname: &str) {
        let is_leader = match self.service(svcname) {
            Some(svc) => self.placement_leader(&svc, None, true),
            None => false,
        };
        let role = if is_leader { LEADER } else { "" };

        if let Some(smon) = self.inner.monitors.smon.lock().get_mut(svcname) {
            if smon.placement != role {
                smon.placement = role.to_string();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClusterDataEntry;
    use crate::placement::tests::up_instance;
    use crate::placement::ServiceConfig;
    use crate::tests::test_state;

    #[test]
    fn test_set_nmon_is_idempotent() {
        let state = test_state("n1", &["n1"]);
        let events = state.events().subscribe();
        let mut wake = state.subscribe_wake();

        assert_eq!(state.get_node_monitor(None).unwrap().status, NodeStatus::Init);

        assert!(state.set_nmon(NmonUpdate::status(NodeStatus::Idle)));
        assert!(wake.has_changed().unwrap());
        wake.borrow_and_update();
        assert!(!state.set_nmon(NmonUpdate::status(NodeStatus::Idle)));
        assert!(!wake.has_changed().unwrap(), "No change means no wake.");

        assert!(state.set_nmon(NmonUpdate {
            global_expect: Some(FieldUpdate::parse("frozen")),
            ..Default::default()
        }));
        let nmon = state.get_node_monitor(Some("n1")).unwrap();
        assert_eq!(nmon.status, NodeStatus::Idle);
        assert_eq!(nmon.global_expect.as_deref(), Some("frozen"));

        assert!(state.set_nmon(NmonUpdate {
            global_expect: Some(FieldUpdate::Unset),
            ..Default::default()
        }));
        assert!(state.get_node_monitor(None).unwrap().global_expect.is_none());

        let ids = events.drain().map(|e| e.data.id).collect::<Vec<_>>();
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|id| id == "node_monitor_change"));
    }

    #[test]
    fn test_status_updated_only_on_change() {
        let state = test_state("n1", &["n1"]);
        state.set_nmon(NmonUpdate::status(NodeStatus::Idle));
        let first = state.get_node_monitor(None).unwrap().status_updated;

        state.inner.clock.advance(10.0);
        state.set_nmon(NmonUpdate::status(NodeStatus::Idle));
        assert_eq!(state.get_node_monitor(None).unwrap().status_updated, first);

        state.set_nmon(NmonUpdate::status(NodeStatus::Maintenance));
        assert_eq!(
            state.get_node_monitor(None).unwrap().status_updated,
            first + 10.0
        );
    }

    #[test]
    fn test_peer_node_monitor() {
        let state = test_state("n1", &["n1", "n2"]);
        assert!(state.get_node_monitor(Some("n2")).is_none());

        let mut entry = ClusterDataEntry::default();
        entry.monitor.status = NodeStatus::Upgrade;
        state.store().replace("n2", entry);
        assert_eq!(
            state.get_node_monitor(Some("n2")).unwrap().status,
            NodeStatus::Upgrade
        );
    }

    #[test]
    fn test_set_smon_fields() {
        let state = test_state("n1", &["n1"]);
        let mut wake = state.subscribe_wake();

        assert!(state.set_smon(
            "web",
            SmonUpdate {
                status: Some(ServiceStatus::Starting),
                local_expect: Some(FieldUpdate::parse("started")),
                stonith: Some(FieldUpdate::parse("n2")),
                ..Default::default()
            }
        ));
        let smon = state.get_service_monitor("web");
        assert_eq!(smon.status, ServiceStatus::Starting);
        assert_eq!(smon.local_expect.as_deref(), Some("started"));
        assert_eq!(smon.stonith.as_deref(), Some("n2"));
        assert!(wake.has_changed().unwrap());
        assert_eq!(wake.borrow_and_update().reason, "service web mon change");

        assert!(!state.set_smon("web", SmonUpdate::status(ServiceStatus::Starting)));
        assert!(!wake.has_changed().unwrap(), "No change means no wake.");

        assert_eq!(state.inc_smon_restart("web", "app#1"), 1);
        assert_eq!(
            wake.borrow_and_update().reason,
            "service web restart count change"
        );
        assert_eq!(state.inc_smon_restart("web", "app#1"), 2);
        assert_eq!(
            state.get_service_monitor("web").restart.get("app#1"),
            Some(&2)
        );
        assert!(state.set_smon(
            "web",
            SmonUpdate {
                reset_retries: true,
                ..Default::default()
            }
        ));
        assert!(state.get_service_monitor("web").restart.is_empty());
    }

    #[test]
    fn test_global_expect_updated() {
        let state = test_state("n1", &["n1"]);
        state.inner.clock.advance(5.0);
        let now = state.now();

        assert!(state.set_smon("web", SmonUpdate::global_expect("started")));
        let smon = state.get_service_monitor("web");
        assert_eq!(smon.global_expect.as_deref(), Some("started"));
        assert_eq!(smon.global_expect_updated, now);

        assert!(state.set_smon("web", SmonUpdate::global_expect("unset")));
        assert!(state.get_service_monitor("web").global_expect.is_none());
    }

    #[test]
    fn test_empty_instance_accepts_only_some_targets() {
        let state = test_state("n1", &["n1"]);
        state
            .store()
            .replace("n1", ClusterDataEntry::default().with_instance("scaler", up_instance()));

        let mut wake = state.subscribe_wake();
        assert!(state.set_smon("scaler", SmonUpdate::global_expect("frozen")));
        let before = state.get_service_monitor("scaler");
        wake.borrow_and_update();

        assert!(!state.set_smon("scaler", SmonUpdate::global_expect("started")));
        assert_eq!(state.get_service_monitor("scaler"), before);
        assert!(!wake.has_changed().unwrap(), "A rejected update does not wake.");

        let mut benign = SmonUpdate::global_expect("started");
        benign.status = Some(ServiceStatus::Idle);
        assert!(state.set_smon("scaler", benign));
    }

    #[test]
    fn test_instance_with_resources_accepts_any_target() {
        let state = test_state("n1", &["n1"]);
        let mut instance = up_instance();
        instance
            .resources
            .insert("app#1".to_string(), serde_json::json!({"status": "up"}));
        state
            .store()
            .replace("n1", ClusterDataEntry::default().with_instance("web", instance));

        assert!(state.set_smon("web", SmonUpdate::global_expect("started")));
    }

    #[test]
    fn test_leaving_failure_restores_leadership() {
        let state = test_state("n1", &["n1", "n2"]);
        state.register_service(ServiceConfig::failover("web", ["n1", "n2"]));

        let mut instance = up_instance();
        instance.monitor.status = ServiceStatus::StartFailed;
        state
            .store()
            .replace("n1", ClusterDataEntry::default().with_instance("web", instance.clone()));
        state.store().replace(
            "n2",
            ClusterDataEntry::default().with_instance("web", up_instance()),
        );

        state.set_smon("web", SmonUpdate::status(ServiceStatus::StartFailed));
        assert_eq!(state.get_service_monitor("web").placement, "");

        instance.monitor.status = ServiceStatus::Idle;
        state
            .store()
            .replace("n1", ClusterDataEntry::default().with_instance("web", instance));
        assert!(state.set_smon("web", SmonUpdate::status(ServiceStatus::Idle)));
        assert_eq!(
            state.inner.monitors.smon("web").unwrap().placement,
            LEADER,
            "The role is recomputed as soon as the failure is cleared."
        );
    }

    #[test]
    fn test_get_service_monitor_initializes_idle() {
        let state = test_state("n1", &["n1"]);
        assert!(state.inner.monitors.smon("db").is_none());
        let smon = state.get_service_monitor("db");
        assert_eq!(smon.status, ServiceStatus::Idle);
        assert_eq!(smon.placement, "");
        assert_eq!(state.inner.monitors.svcnames(), vec!["db"]);
    }
}
