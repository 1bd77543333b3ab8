use {crate::wire::PeerAddr, std::time::Duration};

/// Node-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
  /// Display name of this peer. Not unique across the network,
  /// purely informational.
  pub name: String,

  /// Host address this node binds on and advertises to other peers.
  /// The reference deployment keeps everything on the loopback
  /// interface, but nothing in the protocol forbids routing.
  pub host: String,

  /// Local TCP port to listen on. Port 0 binds an ephemeral port and
  /// the actually bound port is advertised instead.
  pub port: u16,

  /// Address of a known coordinator to join. When absent this node
  /// founds a brand new network and becomes its coordinator.
  pub bootstrap: Option<PeerAddr>,

  /// How often liveness beacons are emitted. The coordinator beacons
  /// every other member, members beacon the coordinator.
  pub heartbeat_interval: Duration,

  /// How often the failure detector checks coordinator freshness.
  pub probe_interval: Duration,

  /// Beacon silence after which the coordinator is suspected dead.
  /// Must be larger than [`heartbeat_interval`] so a single lost
  /// beacon does not trigger an election.
  pub failure_timeout: Duration,

  /// Pause after triggering an election before the detector resumes
  /// probing. Damps retrigger storms while the election settles.
  pub election_backoff: Duration,

  /// Connect timeout for outbound sends.
  pub connect_timeout: Duration,

  /// How long to wait for the admission reply during the join
  /// handshake, and for a single inbound frame to arrive.
  pub reply_timeout: Duration,

  /// Maximum size of a single wire frame. Connections delivering
  /// more than this are dropped without dispatching anything.
  pub max_frame_size: usize,

  /// Number of outbound sender workers. Fan-outs are distributed over
  /// this pool so one unresponsive peer cannot stall the others.
  pub send_concurrency: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      name: "peer".into(),
      host: "127.0.0.1".into(),
      port: 0,
      bootstrap: None,
      heartbeat_interval: Duration::from_secs(5),
      probe_interval: Duration::from_secs(2),
      failure_timeout: Duration::from_secs(10),
      election_backoff: Duration::from_secs(5),
      connect_timeout: Duration::from_secs(5),
      reply_timeout: Duration::from_secs(5),
      max_frame_size: 4096,
      send_concurrency: 16,
    }
  }
}
