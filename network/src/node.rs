use {
  crate::{
    channel::Channel,
    config::Config,
    detector,
    election,
    events::{Events, SystemEvent},
    heartbeat,
    membership::{MemberInfo, Membership, Role},
    transport::{self, Command, Inbound},
    wire::{Frame, JoinReply, PeerAddr},
  },
  futures::future::join_all,
  metrics::{gauge, increment_counter},
  parking_lot::{Mutex, RwLock},
  std::{collections::HashMap, sync::Arc, time::Instant},
  thiserror::Error,
  tokio::{
    sync::{
      mpsc::{UnboundedReceiver, UnboundedSender},
      oneshot,
    },
    task::JoinHandle,
  },
  tracing::{debug, info, warn},
};

#[derive(Debug, Error)]
pub enum Error {
  /// Binding the listener is the only unrecoverable startup failure;
  /// everything else degrades.
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
}

struct Shared {
  config: Config,
  state: RwLock<Membership>,
  commands: UnboundedSender<Command>,
  events: Arc<Mutex<Channel<SystemEvent>>>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running chat peer.
///
/// This type is the entrypoint to the crate: spawning it binds the
/// listener, performs the join handshake (or founds a new network) and
/// starts the beacon and failure-detector loops. The handle is cheap
/// to clone and can be moved freely across tasks; all clones share the
/// same underlying peer.
#[derive(Clone)]
pub struct Node {
  inner: Arc<Shared>,
}

impl Node {
  /// Binds the listener, spawns the background loops and joins the
  /// configured bootstrap coordinator (or founds a fresh network when
  /// there is none). Returns the node handle together with the stream
  /// of system events for the console front-end.
  pub async fn spawn(config: Config) -> Result<(Node, Events), Error> {
    let listener = transport::bind(&config).await?;
    let port = listener.local_addr()?.port();
    let self_addr = PeerAddr::new(config.host.clone(), port);
    info!("{} listening on {self_addr}", config.name);

    let (cmdtx, cmdrx) = Channel::new().split();
    let (intx, inrx) = Channel::new().split();
    let events = Arc::new(Mutex::new(Channel::new()));

    let state = Membership::new(self_addr.clone(), config.name.clone());
    let node = Node {
      inner: Arc::new(Shared {
        state: RwLock::new(state),
        commands: cmdtx,
        events: events.clone(),
        tasks: Mutex::new(Vec::new()),
        config,
      }),
    };

    let mut tasks = transport::spawn_senders(&node.inner.config, cmdrx);
    tasks.push(tokio::spawn(transport::listen(
      listener,
      Arc::new(node.inner.config.clone()),
      intx,
    )));
    tasks.push(tokio::spawn(node.clone().route(inrx)));

    node.emit(SystemEvent::Listening(self_addr));

    match node.inner.config.bootstrap.clone() {
      Some(coordinator) => node.join(coordinator).await,
      None => node.found_network(),
    }

    // beacons and the detector start only once the handshake settled
    tasks.push(tokio::spawn(heartbeat::run(node.clone())));
    tasks.push(tokio::spawn(detector::run(node.clone())));
    *node.inner.tasks.lock() = tasks;

    Ok((node.clone(), Events::new(events)))
  }

  /// Formats a chat line as `<name> [<id>]: <text>` and broadcasts it
  /// to every other member. The local echo is the front-end's job.
  pub fn chat(&self, text: &str) {
    let (line, targets) = {
      let state = self.inner.state.read();
      let id = state
        .self_id
        .map_or_else(|| "?".into(), |id| id.to_string());
      let line = format!("{} [{}]: {}", state.self_name, id, text);
      (line, state.other_members())
    };
    for peer in targets {
      self.send(peer, Frame::Chat(line.clone()));
    }
  }

  /// Leaves the network voluntarily and tears the node down.
  ///
  /// A departing coordinator pushes the post-departure membership and
  /// maps to every survivor and then asks each of them to elect
  /// immediately, so nobody waits out the failure detector. Ordinary
  /// members just announce their exit. Departure frames are written
  /// directly (not queued) so they are on the wire before this
  /// returns.
  pub async fn leave(&self) {
    enum Plan {
      Coordinator {
        targets: Vec<PeerAddr>,
        update: Frame,
        maps: Frame,
      },
      Member {
        targets: Vec<PeerAddr>,
        exit: Frame,
      },
      Silent,
    }

    let plan = {
      let mut state = self.inner.state.write();
      match state.role {
        Role::Coordinator => {
          let self_addr = state.self_addr.clone();
          state.remove_peer(&self_addr);
          state.role = Role::Member;
          state.coordinator = None;
          Plan::Coordinator {
            targets: state.members.clone(),
            update: Frame::Update(state.members.clone()),
            maps: Frame::MapUpdate {
              ids: state.ids.clone(),
              names: state.names.clone(),
            },
          }
        }
        Role::Joining => Plan::Silent,
        _ => Plan::Member {
          targets: state.other_members(),
          exit: Frame::Exit {
            addr: state.self_addr.clone(),
            name: state.self_name.clone(),
          },
        },
      }
    };

    let connect_timeout = self.inner.config.connect_timeout;
    match plan {
      Plan::Coordinator {
        targets,
        update,
        maps,
      } => {
        info!("coordinator leaving, handing the network over");
        join_all(targets.iter().map(|peer| {
          let update = update.clone();
          let maps = maps.clone();
          async move {
            let _ = transport::send_frame(peer, &update, connect_timeout).await;
            let _ = transport::send_frame(peer, &maps, connect_timeout).await;
          }
        }))
        .await;
        join_all(targets.iter().map(|peer| async move {
          let _ =
            transport::send_frame(peer, &Frame::StartElection, connect_timeout)
              .await;
        }))
        .await;
      }
      Plan::Member { targets, exit } => {
        info!("leaving the network");
        join_all(targets.iter().map(|peer| {
          let exit = exit.clone();
          async move {
            let _ = transport::send_frame(peer, &exit, connect_timeout).await;
          }
        }))
        .await;
      }
      Plan::Silent => {}
    }
    self.halt();
  }

  /// Aborts every background task without announcing anything: the
  /// crash-stop path. The failure detector of the surviving peers is
  /// what discovers a halted coordinator.
  pub fn halt(&self) {
    for task in self.inner.tasks.lock().drain(..) {
      task.abort();
    }
  }

  pub fn addr(&self) -> PeerAddr {
    self.inner.state.read().self_addr.clone()
  }

  pub fn name(&self) -> String {
    self.inner.config.name.clone()
  }

  pub fn id(&self) -> Option<u64> {
    self.inner.state.read().self_id
  }

  pub fn role(&self) -> Role {
    self.inner.state.read().role
  }

  pub fn coordinator(&self) -> Option<PeerAddr> {
    self.inner.state.read().coordinator.clone()
  }

  pub fn members(&self) -> Vec<PeerAddr> {
    self.inner.state.read().members.clone()
  }

  /// The member list as rendered by the console front-end's LIST
  /// command.
  pub fn member_infos(&self) -> Vec<MemberInfo> {
    self.inner.state.read().member_infos()
  }
}

// crate-internal surface used by the background loops
impl Node {
  pub(crate) fn state(&self) -> &RwLock<Membership> {
    &self.inner.state
  }

  pub(crate) fn config(&self) -> &Config {
    &self.inner.config
  }

  /// Queues a fire-and-forget frame on the outbound worker pool.
  /// Non-blocking, safe to call while holding the state lock.
  pub(crate) fn send(&self, to: PeerAddr, frame: Frame) {
    if self.inner.commands.send(Command::Send { to, frame }).is_err() {
      debug!("transport is gone, dropping an outbound frame");
    }
  }

  pub(crate) fn emit(&self, event: SystemEvent) {
    self.inner.events.lock().send(event);
  }
}

// startup paths
impl Node {
  fn found_network(&self) {
    {
      let mut state = self.inner.state.write();
      state.become_founder();
      gauge!("members", state.members.len() as f64);
    }
    info!(
      "{} founded a new network as its coordinator (id 0)",
      self.inner.config.name
    );
    self.emit(SystemEvent::NetworkFounded);
  }

  async fn join(&self, coordinator: PeerAddr) {
    let frame = {
      let state = self.inner.state.read();
      Frame::Join {
        addr: state.self_addr.clone(),
        name: state.self_name.clone(),
      }
    };
    let config = &self.inner.config;
    let body = match transport::request(
      &coordinator,
      &frame,
      config.connect_timeout,
      config.reply_timeout,
    )
    .await
    {
      Ok(body) => body,
      Err(err) => {
        debug!("bootstrap coordinator {coordinator} unreachable: {err}");
        self.emit(SystemEvent::BootstrapUnreachable(coordinator));
        self.found_network();
        return;
      }
    };

    match serde_json::from_str::<JoinReply>(&body) {
      Ok(JoinReply { id, peers }) => {
        {
          let mut state = self.inner.state.write();
          state.adopt_admission(id, peers, coordinator.clone());
          gauge!("members", state.members.len() as f64);
        }
        info!("joined the network with id {id}, coordinator {coordinator}");
        self.emit(SystemEvent::JoinCompleted { id, coordinator });
      }
      Err(err) => {
        warn!("invalid admission reply from {coordinator}: {err}");
        self.emit(SystemEvent::BootstrapUnreachable(coordinator));
        self.found_network();
      }
    }
  }
}

// the message router
impl Node {
  async fn route(self, mut inbound: UnboundedReceiver<Inbound>) {
    while let Some(Inbound { frame, reply }) = inbound.recv().await {
      increment_counter!("frames_received", "verb" => frame.verb());
      match frame {
        Frame::Join { addr, name } => self.consume_join(addr, name, reply),
        Frame::Update(peers) => self.consume_update(peers),
        Frame::MapUpdate { ids, names } => self.consume_map_update(ids, names),
        Frame::Heartbeat(addr) => self.consume_heartbeat(addr),
        Frame::Election { id } => self.consume_election(id),
        Frame::Coordinator { addr, name } => {
          self.consume_coordinator(addr, name)
        }
        Frame::StartElection => {
          info!("asked to start an election");
          election::start(self.clone());
        }
        Frame::RemoveCoordinator(addr) => self.consume_remove_coordinator(addr),
        Frame::Exit { addr, name } => self.consume_exit(addr, name),
        Frame::Chat(text) => self.emit(SystemEvent::Chat(text)),
      }
    }
  }

  /// Admission: assign first, reply second, fan out last. The reply
  /// travels back over the connection the JOIN arrived on; the fan-out
  /// pushes the fresh membership and maps to every other peer.
  fn consume_join(
    &self,
    addr: PeerAddr,
    name: String,
    reply: Option<oneshot::Sender<String>>,
  ) {
    let (body, targets, update, maps, announce) = {
      let mut state = self.inner.state.write();
      let (id, added) = state.add_peer(addr.clone(), name.clone());
      if added {
        info!("admitted {name} ({addr}) with id {id}");
        self.emit(SystemEvent::PeerAdmitted {
          addr: addr.clone(),
          name: name.clone(),
          id,
        });
      }
      gauge!("members", state.members.len() as f64);
      let body = serde_json::to_string(&JoinReply {
        id,
        peers: state.members.clone(),
      })
      .expect("membership snapshots are serializable");
      let update = Frame::Update(state.members.clone());
      let maps = Frame::MapUpdate {
        ids: state.ids.clone(),
        names: state.names.clone(),
      };
      let announce = added
        .then(|| Frame::Chat(format!("*** {name} ({addr}) joined the chat")));
      (body, state.other_members(), update, maps, announce)
    };

    if let Some(reply) = reply {
      // the connection may have died while we were assigning the id
      let _ = reply.send(body);
    }
    for peer in &targets {
      self.send(peer.clone(), update.clone());
      self.send(peer.clone(), maps.clone());
      if let Some(announce) = &announce {
        self.send(peer.clone(), announce.clone());
      }
    }
  }

  fn consume_update(&self, peers: Vec<PeerAddr>) {
    let removed = {
      let mut state = self.inner.state.write();
      let removed = state.apply_snapshot(peers);
      gauge!("members", state.members.len() as f64);
      removed
    };
    if removed.is_empty() {
      debug!("membership snapshot applied");
      self.emit(SystemEvent::MembersUpdated);
    } else {
      for (addr, name) in removed {
        info!("peer removed by snapshot: {addr}");
        self.emit(SystemEvent::PeerRemoved { addr, name });
      }
    }
  }

  fn consume_map_update(
    &self,
    ids: HashMap<PeerAddr, u64>,
    names: HashMap<PeerAddr, String>,
  ) {
    {
      // the sender is trusted to hold the latest view, including our
      // own identifier after a post-election recalculation
      let mut state = self.inner.state.write();
      state.ids = ids;
      state.names = names;
      if let Some(id) = state.ids.get(&state.self_addr).copied() {
        state.self_id = Some(id);
      }
    }
    debug!("identifier and name maps replaced");
    self.emit(SystemEvent::MapsUpdated);
  }

  fn consume_heartbeat(&self, addr: PeerAddr) {
    // beacons from non-members are recorded too; snapshots correct
    // the member list later
    let mut state = self.inner.state.write();
    state.last_seen.insert(addr, Instant::now());
  }

  fn consume_election(&self, sender_id: u64) {
    let outranked = {
      let state = self.inner.state.read();
      debug_assert!(
        state.self_id != Some(sender_id),
        "two reachable peers share identifier {sender_id}"
      );
      state.self_id.map_or(false, |my_id| my_id > sender_id)
    };
    if outranked {
      info!("challenged by a lower id ({sender_id}), running our own election");
      election::start(self.clone());
    }
  }

  fn consume_coordinator(&self, addr: PeerAddr, name: String) {
    enum Outcome {
      Adopted,
      Reassert,
      Ignored,
    }

    let outcome = {
      let mut state = self.inner.state.write();
      if addr == state.self_addr {
        Outcome::Ignored
      } else if state.role == Role::Coordinator
        && matches!(
          (state.self_id, state.ids.get(&addr)),
          (Some(my_id), Some(their_id)) if my_id > *their_id
        )
      {
        Outcome::Reassert
      } else {
        state.coordinator = Some(addr.clone());
        state.role = Role::Member;
        state.names.insert(addr.clone(), name.clone());
        if !state.contains(&addr) {
          state.members.push(addr.clone());
        }
        Outcome::Adopted
      }
    };

    match outcome {
      Outcome::Adopted => {
        info!("new coordinator: {name} ({addr})");
        self.emit(SystemEvent::CoordinatorElected {
          addr,
          name,
          is_self: false,
        });
      }
      Outcome::Reassert => {
        // a lower id claimed the role; the bully answer is to run our
        // own election and out-announce it
        info!("lower-id coordinator claim from {addr}, re-asserting");
        election::start(self.clone());
      }
      Outcome::Ignored => {}
    }
  }

  fn consume_remove_coordinator(&self, addr: PeerAddr) {
    let removed = {
      let mut state = self.inner.state.write();
      if state.contains(&addr) {
        let name = state.remove_peer(&addr);
        gauge!("members", state.members.len() as f64);
        Some(name)
      } else {
        None
      }
    };
    if let Some(name) = removed {
      info!("dropped suspected coordinator {addr}");
      self.emit(SystemEvent::PeerRemoved { addr, name });
    }
  }

  fn consume_exit(&self, addr: PeerAddr, name: String) {
    let refan = {
      let mut state = self.inner.state.write();
      if addr == state.self_addr || !state.contains(&addr) {
        return;
      }
      state.remove_peer(&addr);
      gauge!("members", state.members.len() as f64);
      (state.role == Role::Coordinator)
        .then(|| (state.other_members(), Frame::Update(state.members.clone())))
    };

    info!("{name} ({addr}) left the network");
    self.emit(SystemEvent::PeerLeft { addr, name });

    if let Some((targets, update)) = refan {
      for peer in targets {
        self.send(peer, update.clone());
      }
    }
  }
}
