use {
  crate::{channel::Channel, wire::PeerAddr},
  futures::Stream,
  parking_lot::Mutex,
  std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
  },
};

/// Notifications emitted by the membership core towards the console
/// front-end. The front-end renders these as system lines; chat lines
/// are passed through verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum SystemEvent {
  /// The local listener is bound and accepting connections at the
  /// carried (possibly ephemeral) address.
  Listening(PeerAddr),

  /// This node founded a fresh network and is its coordinator with
  /// identifier 0.
  NetworkFounded,

  /// The join handshake against the bootstrap coordinator completed.
  JoinCompleted { id: u64, coordinator: PeerAddr },

  /// The configured bootstrap coordinator did not answer the join
  /// handshake; degrading to a standalone network.
  BootstrapUnreachable(PeerAddr),

  /// The local coordinator admitted a new peer.
  PeerAdmitted {
    addr: PeerAddr,
    name: String,
    id: u64,
  },

  /// An authoritative membership snapshot arrived without removing
  /// anybody.
  MembersUpdated,

  /// A peer disappeared from an authoritative snapshot or was dropped
  /// on request.
  PeerRemoved {
    addr: PeerAddr,
    name: Option<String>,
  },

  /// A peer announced its voluntary departure.
  PeerLeft { addr: PeerAddr, name: String },

  /// Fresh identifier and name maps were installed.
  MapsUpdated,

  /// A bully election started locally.
  ElectionStarted,

  /// A higher-identifier candidate answered the election challenge;
  /// waiting passively for its announcement.
  ElectionDeferred,

  /// A coordinator announcement was accepted, or this node won the
  /// election itself.
  CoordinatorElected {
    addr: PeerAddr,
    name: String,
    is_self: bool,
  },

  /// The coordinator stopped beaconing and is suspected dead.
  CoordinatorInactive(PeerAddr),

  /// A chat line from another peer, already formatted by its sender.
  Chat(String),
}

/// Stream of [`SystemEvent`]s, handed out once by `Node::spawn`. The
/// channel behind it is shared with the node, which keeps feeding it
/// for as long as the peer runs.
pub struct Events {
  inner: Arc<Mutex<Channel<SystemEvent>>>,
}

impl Events {
  pub(crate) fn new(inner: Arc<Mutex<Channel<SystemEvent>>>) -> Self {
    Self { inner }
  }
}

impl Stream for Events {
  type Item = SystemEvent;

  fn poll_next(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<Option<Self::Item>> {
    self.inner.lock().poll_recv(cx)
  }
}
