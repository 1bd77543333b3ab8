use {
  std::task::{Context, Poll},
  tokio::sync::mpsc::{
    unbounded_channel,
    UnboundedReceiver,
    UnboundedSender,
  },
};

/// A thin wrapper around an unbounded mpsc channel that keeps both
/// halves together until a component decides to split them.
///
/// The command and inbound-frame queues are split between producers
/// and their worker loops; the event channel stays whole and is polled
/// in place through the node's shared handle.
pub struct Channel<T> {
  tx: UnboundedSender<T>,
  rx: UnboundedReceiver<T>,
}

impl<T> Channel<T> {
  pub fn new() -> Self {
    let (tx, rx) = unbounded_channel();
    Self { tx, rx }
  }

  pub fn send(&self, value: T) {
    self.tx.send(value).expect("channel holds its own receiver");
  }

  pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
    self.rx.poll_recv(cx)
  }

  /// Consumes the channel and hands out its two halves.
  pub fn split(self) -> (UnboundedSender<T>, UnboundedReceiver<T>) {
    (self.tx, self.rx)
  }
}
