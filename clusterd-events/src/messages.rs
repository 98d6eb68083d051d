use serde_json::Value;

use crate::event::EventData;

/// Log templates keyed by `(event id, reason)`.
///
/// `{name}` placeholders are resolved against the event payload.
static MESSAGES: &[(&str, Option<&str>, &str)] = &[
    ("forget_peer", Some("no_rx"), "no rx from {peer}, forget its data"),
    (
        "crash",
        Some("split"),
        "cluster split, quorum lost with {live}+{arbitrator_votes} out of {voting} votes, self-fencing",
    ),
    (
        "node_monitor_change",
        None,
        "node monitor {field} change: {from} => {to}",
    ),
    (
        "service_monitor_change",
        None,
        "service {svcname} monitor {field} change: {from} => {to}",
    ),
    (
        "node_freeze",
        Some("target"),
        "freeze node to satisfy the cluster frozen target",
    ),
    (
        "node_thaw",
        Some("target"),
        "thaw node to satisfy the cluster thawed target",
    ),
    ("node_config_change", None, "node configuration changed"),
    (
        "instance_stop",
        Some("target"),
        "stop instance {svcname} to satisfy the {target} target",
    ),
    (
        "instance_start",
        Some("from_ready"),
        "start instance {svcname}, ready for {since} seconds",
    ),
    (
        "resource_restart",
        None,
        "restart resource {svcname}.{rid}, try {try}/{restart}",
    ),
    (
        "max_resource_restart",
        None,
        "max restart ({restart}) reached for resource {svcname}.{rid}",
    ),
    (
        "service_config_installed",
        None,
        "service {svcname} configuration installed",
    ),
];

/// Finds the template for an event, falling back to the reason-less
/// entry of the same id.
pub fn lookup_template(id: &str, reason: Option<&str>) -> Option<&'static str> {
    let find = |reason: Option<&str>| {
        MESSAGES
            .iter()
            .find(|(eid, ereason, _)| *eid == id && *ereason == reason)
            .map(|(_, _, template)| *template)
    };

    match reason {
        Some(_) => find(reason).or_else(|| find(None)),
        None => find(None),
    }
}

/// Renders the log line of an event, or `None` if no template matches.
pub fn format_event(data: &EventData) -> Option<String> {
    let template = lookup_template(&data.id, data.reason.as_deref())?;
    Some(render(template, data))
}

fn render(template: &str, data: &EventData) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };

        let key = &after[..end];
        match data.field(key) {
            Some(Value::String(s)) => out.push_str(&s),
            Some(Value::Null) | None => out.push('?'),
            Some(other) => out.push_str(&other.to_string()),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}
