//! Bully leader election.
//!
//! A peer suspecting the coordinator challenges every member with a
//! higher identifier. One successfully delivered challenge means a
//! higher candidate is alive and will announce itself eventually; a
//! peer whose challenges all fail is the highest survivor and
//! self-declares. No acknowledgements and no explicit round timeout:
//! if the awaited higher candidate dies too, the failure detector
//! opens a fresh suspicion window and abandons the stale round.

use {
  crate::{
    events::SystemEvent,
    membership::Role,
    node::Node,
    transport,
    wire::Frame,
  },
  futures::future::join_all,
  metrics::increment_counter,
  tracing::{debug, info},
};

/// Runs an election round in the background. A round already in
/// progress makes the new one a no-op, so callers never check first.
pub(crate) fn start(node: Node) {
  tokio::spawn(run(node));
}

async fn run(node: Node) {
  // arm the round and collect the challenge set under the lock
  let (self_id, higher) = {
    let mut state = node.state().write();
    if state.role == Role::Electing {
      return;
    }
    let Some(self_id) = state.self_id else {
      // not admitted yet, ineligible to coordinate
      return;
    };
    state.role = Role::Electing;
    (self_id, state.higher_peers())
  };
  increment_counter!("elections_started");
  info!("starting an election with id {self_id}");
  node.emit(SystemEvent::ElectionStarted);

  // challenge the higher candidates without holding the lock; a
  // delivered challenge counts as "someone higher is alive"
  let challenge = Frame::Election { id: self_id };
  let connect_timeout = node.config().connect_timeout;
  let any_higher_alive = join_all(
    higher
      .iter()
      .map(|peer| transport::send_frame(peer, &challenge, connect_timeout)),
  )
  .await
  .into_iter()
  .any(|delivery| delivery.is_ok());

  let (targets, announcement, addr, name) = {
    let mut state = node.state().write();
    if state.role != Role::Electing {
      // a coordinator announced itself while we were probing
      return;
    }
    if any_higher_alive {
      debug!("a higher candidate is alive, waiting passively");
      node.emit(SystemEvent::ElectionDeferred);
      return;
    }
    state.role = Role::Coordinator;
    state.coordinator = Some(state.self_addr.clone());
    state.recalculate_ids();
    let announcement = Frame::Coordinator {
      addr: state.self_addr.clone(),
      name: state.self_name.clone(),
    };
    (
      state.other_members(),
      announcement,
      state.self_addr.clone(),
      state.self_name.clone(),
    )
  };

  increment_counter!("elections_won");
  info!("no higher candidate answered, {name} ({addr}) takes over");
  node.emit(SystemEvent::CoordinatorElected {
    addr,
    name,
    is_self: true,
  });
  for peer in targets {
    node.send(peer, announcement.clone());
  }
}
