use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Seconds since the unix epoch.
pub type Timestamp = f64;

/// Generation levels keyed by node name.
pub type GenMap = BTreeMap<String, u64>;

/// The wire sentinel clearing an optional monitor field.
pub static UNSET: &str = "unset";

#[derive(Debug, Clone, PartialEq, Eq)]
/// An explicit update of an optional field.
///
/// Callers pass `Option<FieldUpdate<T>>`, where `None` leaves the field
/// untouched.
pub enum FieldUpdate<T> {
    Set(T),
    Unset,
}

impl<T> FieldUpdate<T> {
    #[inline]
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Set(value) => Some(value),
            Self::Unset => None,
        }
    }
}

impl FieldUpdate<String> {
    /// Maps the `"unset"` wire sentinel to [FieldUpdate::Unset].
    pub fn parse(value: &str) -> Self {
        if value == UNSET {
            Self::Unset
        } else {
            Self::Set(value.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
/// The daemon level state of a node.
pub enum NodeStatus {
    Init,
    #[default]
    Idle,
    Maintenance,
    Upgrade,
    Shutting,
    Rejoin,
    Draining,
    DrainFailed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Idle => "idle",
            Self::Maintenance => "maintenance",
            Self::Upgrade => "upgrade",
            Self::Shutting => "shutting",
            Self::Rejoin => "rejoin",
            Self::Draining => "draining",
            Self::DrainFailed => "drain failed",
        }
    }

    /// Parses a status, mapping anything unknown to [NodeStatus::Idle].
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "init" => Self::Init,
            "maintenance" => Self::Maintenance,
            "upgrade" => Self::Upgrade,
            "shutting" => Self::Shutting,
            "rejoin" => Self::Rejoin,
            "draining" => Self::Draining,
            "drain failed" => Self::DrainFailed,
            _ => Self::Idle,
        }
    }

    #[inline]
    /// Nodes in these states never host a placement candidate.
    pub fn excludes_placement(&self) -> bool {
        matches!(
            self,
            Self::Maintenance | Self::Upgrade | Self::Init | Self::Shutting
        )
    }
}

impl From<String> for NodeStatus {
    fn from(s: String) -> Self {
        Self::from_str_lossy(&s)
    }
}

impl From<NodeStatus> for String {
    fn from(status: NodeStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
/// The orchestration state of a service instance.
pub enum ServiceStatus {
    #[default]
    Idle,
    Starting,
    StartFailed,
    Stopping,
    StopFailed,
    PlaceFailed,
    Ready,
    Restarting,
    Freezing,
    Thawing,
    Provisioning,
    Deleting,
    Purging,
    WaitParents,
    Other(String),
}

impl ServiceStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::StartFailed => "start failed",
            Self::Stopping => "stopping",
            Self::StopFailed => "stop failed",
            Self::PlaceFailed => "place failed",
            Self::Ready => "ready",
            Self::Restarting => "restarting",
            Self::Freezing => "freezing",
            Self::Thawing => "thawing",
            Self::Provisioning => "provisioning",
            Self::Deleting => "deleting",
            Self::Purging => "purging",
            Self::WaitParents => "wait parents",
            Self::Other(s) => s,
        }
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        self.as_str().contains("failed")
    }
}

impl From<&str> for ServiceStatus {
    fn from(s: &str) -> Self {
        match s {
            "idle" => Self::Idle,
            "starting" => Self::Starting,
            "start failed" => Self::StartFailed,
            "stopping" => Self::Stopping,
            "stop failed" => Self::StopFailed,
            "place failed" => Self::PlaceFailed,
            "ready" => Self::Ready,
            "restarting" => Self::Restarting,
            "freezing" => Self::Freezing,
            "thawing" => Self::Thawing,
            "provisioning" => Self::Provisioning,
            "deleting" => Self::Deleting,
            "purging" => Self::Purging,
            "wait parents" => Self::WaitParents,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for ServiceStatus {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<ServiceStatus> for String {
    fn from(status: ServiceStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// The node monitor record.
pub struct NodeMonitor {
    pub status: NodeStatus,
    pub status_updated: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_expect: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_expect: Option<String>,
}

impl Default for NodeMonitor {
    fn default() -> Self {
        Self {
            status: NodeStatus::Idle,
            status_updated: 0.0,
            local_expect: None,
            global_expect: None,
        }
    }
}

impl NodeMonitor {
    /// The record of a daemon which has just started.
    pub fn starting(now: Timestamp) -> Self {
        Self {
            status: NodeStatus::Init,
            status_updated: now,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// The per service monitor record (SMON).
pub struct ServiceMonitor {
    pub status: ServiceStatus,
    pub status_updated: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_expect: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_expect: Option<String>,
    pub global_expect_updated: Timestamp,
    /// Restart counts keyed by resource id.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub restart: BTreeMap<String, u32>,
    /// `"leader"` when the local node is a placement leader, else empty.
    pub placement: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stonith: Option<String>,
}

impl Default for ServiceMonitor {
    fn default() -> Self {
        Self::idle(0.0)
    }
}

impl ServiceMonitor {
    pub fn idle(now: Timestamp) -> Self {
        Self {
            status: ServiceStatus::Idle,
            status_updated: now,
            local_expect: None,
            global_expect: None,
            global_expect_updated: 0.0,
            restart: BTreeMap::new(),
            placement: String::new(),
            stonith: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
/// A frozen flag, or the timestamp the object was frozen at.
pub enum Frozen {
    Flag(bool),
    Since(Timestamp),
}

impl Default for Frozen {
    fn default() -> Self {
        Self::Flag(false)
    }
}

impl Frozen {
    #[inline]
    pub fn is_frozen(&self) -> bool {
        match self {
            Self::Flag(frozen) => *frozen,
            Self::Since(ts) => *ts > 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
/// The provisioned state reported by an instance: a flag, or text like `mixed`.
pub enum Provisioned {
    Flag(bool),
    Text(String),
}

impl Default for Provisioned {
    fn default() -> Self {
        Self::Flag(false)
    }
}

impl Provisioned {
    #[inline]
    /// Only an explicit `false` marks an instance unprovisioned.
    pub fn is_unprovisioned(&self) -> bool {
        matches!(self, Self::Flag(false))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceMonitor {
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub placement: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The status of a service instance as published by its node.
///
/// This is computed by the resource layer and only read here.
pub struct ServiceInstance {
    /// Missing while the instance is being deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall: Option<String>,
    #[serde(default)]
    pub provisioned: Provisioned,
    #[serde(default)]
    pub frozen: Frozen,
    #[serde(default = "constraints_default")]
    pub constraints: bool,
    #[serde(default)]
    pub monitor: InstanceMonitor,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, Value>,
}

fn constraints_default() -> bool {
    true
}

impl Default for ServiceInstance {
    fn default() -> Self {
        Self {
            avail: None,
            overall: None,
            provisioned: Provisioned::default(),
            frozen: Frozen::default(),
            constraints: true,
            monitor: InstanceMonitor::default(),
            resources: BTreeMap::new(),
        }
    }
}

impl ServiceInstance {
    #[inline]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
/// A slot of the per node service status map.
///
/// Peers running other daemon versions may publish shapes this node does
/// not understand, those are kept verbatim and ignored by every accessor.
pub enum InstanceSlot {
    Instance(ServiceInstance),
    Foreign(Value),
}

impl InstanceSlot {
    #[inline]
    pub fn instance(&self) -> Option<&ServiceInstance> {
        match self {
            Self::Instance(instance) => Some(instance),
            Self::Foreign(_) => None,
        }
    }
}

impl From<ServiceInstance> for InstanceSlot {
    fn from(instance: ServiceInstance) -> Self {
        Self::Instance(instance)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesData {
    pub status: BTreeMap<String, InstanceSlot>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// Resource usage reported by a node.
///
/// Totals are in MB, `*_avail` values are percentages of the total.
pub struct NodeStats {
    pub mem_total: u64,
    pub mem_avail: u64,
    pub swap_total: u64,
    pub swap_avail: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_15m: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataStatus {
    #[default]
    Ok,
    /// A payload was received but could not be decoded.
    Unknown,
}

impl DataStatus {
    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// The latest known status snapshot of a cluster member.
pub struct ClusterDataEntry {
    #[serde(skip_serializing_if = "DataStatus::is_ok")]
    pub status: DataStatus,
    pub frozen: Frozen,
    pub monitor: NodeMonitor,
    pub services: ServicesData,
    pub stats: NodeStats,
}

impl ClusterDataEntry {
    /// The placeholder stored for a peer whose payload could not be decoded.
    pub fn unknown() -> Self {
        Self {
            status: DataStatus::Unknown,
            ..Default::default()
        }
    }

    #[inline]
    pub fn is_unknown(&self) -> bool {
        self.status == DataStatus::Unknown
    }

    #[inline]
    /// The instance of a service, if its shape is understood.
    pub fn instance(&self, svcname: &str) -> Option<&ServiceInstance> {
        self.services.status.get(svcname)?.instance()
    }

    pub fn set_instance(&mut self, svcname: impl Into<String>, instance: ServiceInstance) {
        self.services
            .status
            .insert(svcname.into(), InstanceSlot::Instance(instance));
    }

    pub fn with_instance(
        mut self,
        svcname: impl Into<String>,
        instance: ServiceInstance,
    ) -> Self {
        self.set_instance(svcname, instance);
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_unknown_node_status_is_idle() {
        let monitor: NodeMonitor =
            serde_json::from_value(json!({"status": "levitating", "status_updated": 3.0}))
                .unwrap();
        assert_eq!(monitor.status, NodeStatus::Idle);
        assert_eq!(monitor.status_updated, 3.0);

        let monitor: NodeMonitor =
            serde_json::from_value(json!({"status": "drain failed"})).unwrap();
        assert_eq!(monitor.status, NodeStatus::DrainFailed);
    }

    #[test]
    fn test_service_status_failed() {
        assert!(ServiceStatus::StartFailed.is_failed());
        assert!(ServiceStatus::from("unprovision failed").is_failed());
        assert!(!ServiceStatus::Ready.is_failed());
        assert_eq!(ServiceStatus::from("wait parents"), ServiceStatus::WaitParents);
    }

    #[test]
    fn test_instance_slot_shapes() {
        let data: ServicesData = serde_json::from_value(json!({
            "status": {
                "web": {"avail": "up", "provisioned": true, "monitor": {"status": "idle"}},
                "legacy": "not-an-instance",
                "odd": {"avail": 5},
            }
        }))
        .unwrap();

        let web = data.status["web"].instance().expect("web is an instance");
        assert_eq!(web.avail.as_deref(), Some("up"));
        assert!(web.constraints, "Constraints default to satisfied.");
        assert!(data.status["legacy"].instance().is_none());
        assert!(data.status["odd"].instance().is_none());
    }

    #[test]
    fn test_frozen_and_provisioned_variants() {
        let instance: ServiceInstance =
            serde_json::from_value(json!({"frozen": 1234.5, "provisioned": "mixed"}))
                .unwrap();
        assert!(instance.frozen.is_frozen());
        assert!(!instance.provisioned.is_unprovisioned());

        let instance: ServiceInstance = serde_json::from_value(json!({})).unwrap();
        assert!(!instance.frozen.is_frozen());
        assert!(instance.provisioned.is_unprovisioned());
        assert!(instance.is_empty());
    }

    #[test]
    fn test_field_update_parse() {
        assert_eq!(FieldUpdate::parse("unset"), FieldUpdate::Unset);
        assert_eq!(
            FieldUpdate::parse("frozen"),
            FieldUpdate::Set("frozen".to_string())
        );
    }
}
