use {
  anyhow::Result,
  futures::StreamExt,
  parley_network::{Config, Node, PeerAddr, Role, SystemEvent},
  std::time::{Duration, Instant},
  tokio::time::{sleep, timeout},
};

// All scenarios run on loopback with ephemeral ports and shrunk
// timings, so a full crash-recovery cycle fits in a couple of seconds.
fn config(name: &str) -> Config {
  Config {
    name: name.into(),
    heartbeat_interval: Duration::from_millis(50),
    probe_interval: Duration::from_millis(20),
    failure_timeout: Duration::from_millis(250),
    election_backoff: Duration::from_millis(100),
    connect_timeout: Duration::from_millis(500),
    reply_timeout: Duration::from_millis(500),
    ..Config::default()
  }
}

fn bootstrapped(name: &str, coordinator: &Node) -> Config {
  Config {
    bootstrap: Some(coordinator.addr()),
    ..config(name)
  }
}

async fn converged(what: &str, mut check: impl FnMut() -> bool) {
  let deadline = Instant::now() + Duration::from_secs(5);
  while !check() {
    if Instant::now() > deadline {
      panic!("timed out waiting for {what}");
    }
    sleep(Duration::from_millis(10)).await;
  }
}

fn knows_id(node: &Node, peer: &PeerAddr, id: u64) -> bool {
  node
    .member_infos()
    .iter()
    .any(|m| m.addr == *peer && m.id == Some(id))
}

#[tokio::test]
async fn founding_peer_bootstraps_alone() -> Result<()> {
  let (a, _a_events) = Node::spawn(config("alice")).await?;

  assert_eq!(a.role(), Role::Coordinator);
  assert_eq!(a.id(), Some(0));
  assert_eq!(a.members(), vec![a.addr()]);
  assert_eq!(a.coordinator(), Some(a.addr()));

  a.halt();
  Ok(())
}

#[tokio::test]
async fn join_assigns_sequential_ids() -> Result<()> {
  let (a, _a_events) = Node::spawn(config("alice")).await?;
  let (b, _b_events) = Node::spawn(bootstrapped("bob", &a)).await?;

  // the admission reply already carried the id and the member list
  assert_eq!(b.id(), Some(1));
  assert_eq!(b.coordinator(), Some(a.addr()));
  assert!(b.members().contains(&a.addr()));
  assert!(b.members().contains(&b.addr()));

  // the coordinator admitted bob before replying
  assert_eq!(a.members().len(), 2);

  // the admission fan-out delivers the name and id maps
  converged("bob to learn alice's name", || {
    b.member_infos()
      .iter()
      .any(|m| m.addr == a.addr() && m.name.as_deref() == Some("alice"))
  })
  .await;

  a.halt();
  b.halt();
  Ok(())
}

#[tokio::test]
async fn admission_fan_out_reaches_existing_members() -> Result<()> {
  let (a, _a_events) = Node::spawn(config("alice")).await?;
  let (b, _b_events) = Node::spawn(bootstrapped("bob", &a)).await?;
  let (c, _c_events) = Node::spawn(bootstrapped("carol", &a)).await?;

  assert_eq!(c.id(), Some(2));

  // bob never contacted carol: he learns about her from the
  // coordinator's UPDATE and MAP_UPDATE alone
  converged("all three peers to share the member list", || {
    [&a, &b, &c]
      .iter()
      .all(|node| node.members().len() == 3)
  })
  .await;
  converged("bob to learn carol's id", || {
    knows_id(&b, &c.addr(), 2)
  })
  .await;

  a.halt();
  b.halt();
  c.halt();
  Ok(())
}

#[tokio::test]
async fn crashed_coordinator_is_replaced_by_highest_id() -> Result<()> {
  let (a, _a_events) = Node::spawn(config("alice")).await?;
  let (b, mut b_events) = Node::spawn(bootstrapped("bob", &a)).await?;
  let (c, _c_events) = Node::spawn(bootstrapped("carol", &a)).await?;

  // bob must know carol outranks him before the coordinator dies,
  // otherwise he cannot defer to her
  converged("membership and maps to converge", || {
    [&a, &b, &c].iter().all(|node| node.members().len() == 3)
      && knows_id(&b, &c.addr(), 2)
      && knows_id(&c, &b.addr(), 1)
  })
  .await;

  a.halt();

  converged("carol to win the election", || {
    c.role() == Role::Coordinator && c.coordinator() == Some(c.addr())
  })
  .await;
  converged("bob to adopt carol as coordinator", || {
    b.coordinator() == Some(c.addr()) && b.role() == Role::Member
  })
  .await;
  converged("the dead coordinator to be dropped", || {
    !b.members().contains(&a.addr()) && !c.members().contains(&a.addr())
  })
  .await;

  // the survivors printed an inactivity alert before recovering
  let mut saw_alert = false;
  while let Ok(Some(event)) =
    timeout(Duration::from_millis(200), b_events.next()).await
  {
    if matches!(event, SystemEvent::CoordinatorInactive(_)) {
      saw_alert = true;
      break;
    }
  }
  assert!(saw_alert, "bob never reported the coordinator as inactive");

  // admissions keep working under the new coordinator, with an
  // identifier above everything assigned so far
  let (d, _d_events) = Node::spawn(bootstrapped("dave", &c)).await?;
  assert_eq!(d.id(), Some(3));

  b.halt();
  c.halt();
  d.halt();
  Ok(())
}

#[tokio::test]
async fn departing_coordinator_hands_over_without_detector_wait() -> Result<()> {
  let (a, _a_events) = Node::spawn(config("alice")).await?;
  let (b, _b_events) = Node::spawn(bootstrapped("bob", &a)).await?;
  let (c, _c_events) = Node::spawn(bootstrapped("carol", &a)).await?;

  converged("membership and maps to converge", || {
    [&a, &b, &c].iter().all(|node| node.members().len() == 3)
      && knows_id(&b, &c.addr(), 2)
  })
  .await;

  a.leave().await;

  converged("carol to take over", || {
    c.role() == Role::Coordinator && b.coordinator() == Some(c.addr())
  })
  .await;
  assert!(!b.members().contains(&a.addr()));
  assert!(!c.members().contains(&a.addr()));

  b.halt();
  c.halt();
  Ok(())
}

#[tokio::test]
async fn member_exit_is_broadcast() -> Result<()> {
  let (a, _a_events) = Node::spawn(config("alice")).await?;
  let (b, _b_events) = Node::spawn(bootstrapped("bob", &a)).await?;
  let (c, _c_events) = Node::spawn(bootstrapped("carol", &a)).await?;

  converged("all three peers to share the member list", || {
    [&a, &b, &c].iter().all(|node| node.members().len() == 3)
  })
  .await;

  b.leave().await;

  converged("the survivors to drop bob", || {
    a.members().len() == 2 && c.members().len() == 2
  })
  .await;
  assert_eq!(a.role(), Role::Coordinator);

  a.halt();
  c.halt();
  Ok(())
}

#[tokio::test]
async fn unreachable_bootstrap_falls_back_to_founding() -> Result<()> {
  let unreachable = PeerAddr::new("127.0.0.1", 9);
  let (d, _d_events) = Node::spawn(Config {
    bootstrap: Some(unreachable),
    ..config("dana")
  })
  .await?;

  assert_eq!(d.role(), Role::Coordinator);
  assert_eq!(d.id(), Some(0));
  assert_eq!(d.members(), vec![d.addr()]);

  d.halt();
  Ok(())
}

#[tokio::test]
async fn chat_lines_are_delivered_verbatim() -> Result<()> {
  let (a, mut a_events) = Node::spawn(config("alice")).await?;
  let (b, _b_events) = Node::spawn(bootstrapped("bob", &a)).await?;

  b.chat("hello there");

  let deadline = Instant::now() + Duration::from_secs(5);
  loop {
    let remaining = deadline
      .checked_duration_since(Instant::now())
      .expect("timed out waiting for the chat line");
    match timeout(remaining, a_events.next()).await {
      Ok(Some(SystemEvent::Chat(line))) => {
        assert_eq!(line, "bob [1]: hello there");
        break;
      }
      Ok(Some(_)) => continue,
      _ => panic!("the event stream ended before the chat line arrived"),
    }
  }

  a.halt();
  b.halt();
  Ok(())
}
