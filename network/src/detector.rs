//! Coordinator failure detector.
//!
//! Periodically checks how long ago the coordinator's last beacon
//! arrived. Silence beyond the failure timeout drops the coordinator
//! from the local member list, advises the remaining members to do the
//! same and starts an election. The freshness map is the only input:
//! an individual failed send never counts as evidence of death.

use {
  crate::{
    election,
    events::SystemEvent,
    membership::Role,
    node::Node,
    wire::Frame,
  },
  metrics::increment_counter,
  tokio::time::sleep,
  tracing::warn,
};

pub(crate) async fn run(node: Node) {
  let config = node.config().clone();
  loop {
    sleep(config.probe_interval).await;

    let suspect = {
      let state = node.state().read();
      if state.role == Role::Coordinator || state.role == Role::Joining {
        None
      } else {
        match &state.coordinator {
          Some(coordinator) if *coordinator != state.self_addr => {
            match state.last_seen.get(coordinator) {
              // bootstrap grace: no beacon recorded yet
              None => None,
              Some(seen) if seen.elapsed() > config.failure_timeout => {
                Some(coordinator.clone())
              }
              Some(_) => None,
            }
          }
          _ => None,
        }
      }
    };
    let Some(coordinator) = suspect else { continue };

    increment_counter!("coordinator_suspected");
    warn!("coordinator {coordinator} went silent, starting recovery");
    node.emit(SystemEvent::CoordinatorInactive(coordinator.clone()));

    let targets = {
      let mut state = node.state().write();
      // drop the membership entry only: the beacon timestamp must
      // survive so a stalled election round can be suspected again
      state.members.retain(|peer| *peer != coordinator);
      // a fresh suspicion window abandons any stale election round
      if state.role == Role::Electing {
        state.role = Role::Member;
      }
      state.other_members()
    };
    for peer in targets {
      node.send(peer, Frame::RemoveCoordinator(coordinator.clone()));
    }
    election::start(node.clone());

    // damp retrigger storms while the election settles
    sleep(config.election_backoff).await;
  }
}
