use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub static EVENT_KIND: &str = "event";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A write-once cluster event record.
pub struct Event {
    /// The node which produced the event.
    pub nodename: String,
    /// Seconds since the unix epoch.
    pub ts: f64,
    /// Always [EVENT_KIND].
    pub kind: String,
    pub data: EventData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// The payload of an [Event].
///
/// Besides the well known fields, any additional key is kept in `extra`
/// and serialized inline, so `{"id": "forget_peer", "peer": "n2"}` round
/// trips without losing `peer`.
pub struct EventData {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub svcname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EventData {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_svcname(mut self, svcname: impl Into<String>) -> Self {
        self.svcname = Some(svcname.into());
        self
    }

    pub fn with_rid(mut self, rid: impl Into<String>) -> Self {
        self.rid = Some(rid.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_monitor(mut self, monitor: Value) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_instance(mut self, instance: Value) -> Self {
        self.instance = Some(instance);
        self
    }

    /// Adds an arbitrary field to the event payload.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Resolves a top level field by name.
    pub fn field(&self, key: &str) -> Option<Value> {
        let text = |v: &Option<String>| v.clone().map(Value::String);
        match key {
            "id" => Some(Value::String(self.id.clone())),
            "svcname" => text(&self.svcname),
            "rid" => text(&self.rid),
            "reason" => text(&self.reason),
            _ => self.extra.get(key).cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_extra_fields_are_inlined() -> anyhow::Result<()> {
        let data = EventData::new("forget_peer")
            .with_reason("no_rx")
            .with("peer", "n2");

        let value = serde_json::to_value(&data)?;
        assert_eq!(
            value,
            json!({"id": "forget_peer", "reason": "no_rx", "peer": "n2"})
        );

        let decoded: EventData = serde_json::from_value(value)?;
        assert_eq!(decoded, data);
        assert_eq!(decoded.field("peer"), Some(json!("n2")));
        assert_eq!(decoded.field("svcname"), None);
        Ok(())
    }
}
