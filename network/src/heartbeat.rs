//! Periodic liveness beacons.
//!
//! The beacon direction follows the local role: the coordinator
//! beacons every other member, everyone else beacons the coordinator.
//! Beacon receipts feed the failure detector's freshness map.

use {
  crate::{membership::Role, node::Node, wire::Frame},
  tokio::time::sleep,
};

pub(crate) async fn run(node: Node) {
  let period = node.config().heartbeat_interval;
  loop {
    sleep(period).await;
    let (beacon, targets) = {
      let state = node.state().read();
      let beacon = Frame::Heartbeat(state.self_addr.clone());
      let targets = match state.role {
        Role::Coordinator => state.other_members(),
        Role::Joining => Vec::new(),
        _ => state
          .coordinator
          .iter()
          .filter(|coordinator| **coordinator != state.self_addr)
          .cloned()
          .collect(),
      };
      (beacon, targets)
    };
    for peer in targets {
      node.send(peer, beacon.clone());
    }
  }
}
