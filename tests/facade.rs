use std::time::Duration;

use clusterd::node::{
    start_peer_reaper,
    ClusterConfig,
    ClusterDataEntry,
    ClusterStateBuilder,
    HeartbeatMessage,
};

#[tokio::test]
async fn test_single_node_state() -> anyhow::Result<()> {
    let state = ClusterStateBuilder::new("n1", ClusterConfig::default()).build();
    let reaper = start_peer_reaper(state.clone(), Duration::from_millis(50));

    assert_eq!(state.publish_local(ClusterDataEntry::default()), 1);
    assert!(matches!(state.build_heartbeat(), HeartbeatMessage::Full { .. }));

    let reply = state.dispatch(r#"{"action": "get_gen"}"#)?;
    assert_eq!(reply["data"]["n1"], 1);

    let reply = state.dispatch(
        r#"{"action": "set_node_monitor", "options": {"status": "maintenance"}}"#,
    )?;
    assert_eq!(reply["changed"], true);

    let events = state.events().subscribe();
    let event = events.try_recv()?;
    assert_eq!(event.data.id, "node_monitor_change");
    assert_eq!(event.nodename, "n1");

    reaper.kill();
    Ok(())
}
