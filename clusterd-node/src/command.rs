use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::NodeError;
use crate::model::{FieldUpdate, NodeStatus, ServiceStatus};
use crate::monitor::{NmonUpdate, SmonUpdate};
use crate::ClusterState;

#[derive(Debug, Deserialize)]
struct Request {
    action: String,
    #[serde(default)]
    options: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NodeMonitorOptions {
    status: Option<String>,
    local_expect: Option<String>,
    global_expect: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServiceMonitorOptions {
    svcname: Option<String>,
    status: Option<String>,
    local_expect: Option<String>,
    global_expect: Option<String>,
    reset_retries: bool,
    stonith: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NodeOptions {
    nodename: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GenOptions {
    increment: bool,
}

fn options<T>(options: Value) -> Result<T, NodeError>
where
    T: for<'de> Deserialize<'de>,
{
    let options = match options {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    Ok(serde_json::from_value(options)?)
}

fn parse_update(value: Option<String>) -> Option<FieldUpdate<String>> {
    value.map(|v| FieldUpdate::parse(&v))
}

fn ok(mut data: Map<String, Value>) -> Value {
    data.insert("status".to_string(), json!(0));
    Value::Object(data)
}

impl ClusterState {
    /// Handles a request of the in-process command interface.
    ///
    /// Requests are `{"action": ..., "options": {...}}` JSON documents, replies
    /// always carry `"status": 0`. Failures are returned as errors.
    pub fn dispatch(&self, request: impl AsRef<[u8]>) -> Result<Value, NodeError> {
        let request: Request = serde_json::from_slice(request.as_ref())?;
        debug!(action = %request.action, "Dispatching command.");

        match request.action.as_str() {
            "set_node_monitor" => {
                let opts: NodeMonitorOptions = options(request.options)?;
                let changed = self.set_nmon(NmonUpdate {
                    status: opts.status.as_deref().map(NodeStatus::from_str_lossy),
                    local_expect: parse_update(opts.local_expect),
                    global_expect: parse_update(opts.global_expect),
                });
                Ok(ok(Map::from_iter([("changed".to_string(), json!(changed))])))
            },
            "set_service_monitor" => {
                let opts: ServiceMonitorOptions = options(request.options)?;
                let svcname = opts.svcname.ok_or(NodeError::MissingOption("svcname"))?;
                let changed = self.set_smon(
                    &svcname,
                    SmonUpdate {
                        status: opts.status.as_deref().map(ServiceStatus::from),
                        local_expect: parse_update(opts.local_expect),
                        global_expect: parse_update(opts.global_expect),
                        reset_retries: opts.reset_retries,
                        stonith: parse_update(opts.stonith),
                    },
                );
                Ok(ok(Map::from_iter([("changed".to_string(), json!(changed))])))
            },
            "get_node_monitor" => {
                let opts: NodeOptions = options(request.options)?;
                let monitor = self.get_node_monitor(opts.nodename.as_deref());
                Ok(ok(Map::from_iter([(
                    "data".to_string(),
                    serde_json::to_value(monitor)?,
                )])))
            },
            "get_service_monitor" => {
                let opts: ServiceMonitorOptions = options(request.options)?;
                let svcname = opts.svcname.ok_or(NodeError::MissingOption("svcname"))?;
                let monitor = self.get_service_monitor(&svcname);
                Ok(ok(Map::from_iter([(
                    "data".to_string(),
                    serde_json::to_value(monitor)?,
                )])))
            },
            "get_gen" => {
                let opts: GenOptions = options(request.options)?;
                let gen = self.get_gen(opts.increment);
                Ok(ok(Map::from_iter([(
                    "data".to_string(),
                    serde_json::to_value(gen)?,
                )])))
            },
            other => Err(NodeError::UnknownAction(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tests::test_state;

    #[test]
    fn test_set_and_get_node_monitor() {
        let state = test_state("n1", &["n1"]);

        let reply = state
            .dispatch(
                json!({
                    "action": "set_node_monitor",
                    "options": {"status": "maintenance", "global_expect": "frozen"},
                })
                .to_string(),
            )
            .unwrap();
        assert_eq!(reply["status"], 0);
        assert_eq!(reply["changed"], true);

        let reply = state.dispatch(r#"{"action": "get_node_monitor"}"#).unwrap();
        assert_eq!(reply["data"]["status"], "maintenance");
        assert_eq!(reply["data"]["global_expect"], "frozen");

        state
            .dispatch(r#"{"action": "set_node_monitor", "options": {"global_expect": "unset"}}"#)
            .unwrap();
        let reply = state
            .dispatch(r#"{"action": "get_node_monitor", "options": {"nodename": "n1"}}"#)
            .unwrap();
        assert!(reply["data"].get("global_expect").is_none());

        let reply = state
            .dispatch(r#"{"action": "get_node_monitor", "options": {"nodename": "n7"}}"#)
            .unwrap();
        assert!(reply["data"].is_null());
    }

    #[test]
    fn test_set_service_monitor() {
        let state = test_state("n1", &["n1"]);
        let reply = state
            .dispatch(
                json!({
                    "action": "set_service_monitor",
                    "options": {
                        "svcname": "web",
                        "status": "starting",
                        "local_expect": "started",
                    },
                })
                .to_string(),
            )
            .unwrap();
        assert_eq!(reply["changed"], true);

        let reply = state
            .dispatch(r#"{"action": "get_service_monitor", "options": {"svcname": "web"}}"#)
            .unwrap();
        assert_eq!(reply["data"]["status"], "starting");
        assert_eq!(reply["data"]["local_expect"], "started");
    }

    #[test]
    fn test_get_gen() {
        let state = test_state("n1", &["n1"]);
        let reply = state.dispatch(r#"{"action": "get_gen"}"#).unwrap();
        assert_eq!(reply["data"], json!({"n1": 0}));

        let reply = state
            .dispatch(r#"{"action": "get_gen", "options": {"increment": true}}"#)
            .unwrap();
        assert_eq!(reply["data"], json!({"n1": 1}));
    }

    #[test]
    fn test_errors() {
        let state = test_state("n1", &["n1"]);

        let err = state.dispatch(r#"{"action": "reboot"}"#).unwrap_err();
        assert!(matches!(err, NodeError::UnknownAction(action) if action == "reboot"));

        let err = state
            .dispatch(r#"{"action": "set_service_monitor", "options": {"status": "idle"}}"#)
            .unwrap_err();
        assert!(matches!(err, NodeError::MissingOption("svcname")));

        let err = state.dispatch("not json").unwrap_err();
        assert!(matches!(err, NodeError::Command(_)));

        let err = state
            .dispatch(r#"{"action": "get_gen", "options": {"increment": "yes"}}"#)
            .unwrap_err();
        assert!(matches!(err, NodeError::Command(_)));
    }
}
