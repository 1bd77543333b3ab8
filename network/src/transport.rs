//! One-frame-per-connection TCP transport.
//!
//! Inbound: an accept loop hands every connection to a short-lived
//! handler task that reads one bounded frame, decodes it and forwards
//! it to the router. Outbound: a bounded pool of sender workers drains
//! a command queue, so a fan-out never blocks behind one unresponsive
//! peer and task count stays capped.
//!
//! Send failures are swallowed here by design. The failure detector is
//! the single arbiter of liveness; no other component may draw
//! conclusions from an individual failed send.

use {
  crate::{
    config::Config,
    wire::{Frame, PeerAddr},
  },
  metrics::increment_counter,
  std::{io, sync::Arc, time::Duration},
  tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{
      mpsc::{UnboundedReceiver, UnboundedSender},
      oneshot,
      Mutex,
    },
    task::JoinHandle,
    time::timeout,
  },
  tracing::{debug, warn},
};

/// Commands issued to the outbound worker pool by the membership,
/// heartbeat, election and departure components.
#[derive(Debug)]
pub(crate) enum Command {
  /// Fire-and-forget delivery of one frame to one peer.
  Send { to: PeerAddr, frame: Frame },
}

/// A decoded inbound frame on its way to the router.
pub(crate) struct Inbound {
  pub frame: Frame,

  /// Present only for JOIN frames: carries the JSON admission reply
  /// back to the connection the frame arrived on.
  pub reply: Option<oneshot::Sender<String>>,
}

/// Binds the listener socket. A bind failure is the only fatal startup
/// error of the whole node.
pub(crate) async fn bind(config: &Config) -> io::Result<TcpListener> {
  TcpListener::bind((config.host.as_str(), config.port)).await
}

/// Accept loop. Runs until the owning node is torn down.
pub(crate) async fn listen(
  listener: TcpListener,
  config: Arc<Config>,
  inbound: UnboundedSender<Inbound>,
) {
  loop {
    match listener.accept().await {
      Ok((stream, from)) => {
        debug!("inbound connection from {from}");
        let config = config.clone();
        let inbound = inbound.clone();
        tokio::spawn(async move {
          handle_connection(stream, config, inbound).await;
        });
      }
      Err(err) => {
        // a failed accept never brings the loop down
        warn!("failed to accept a connection: {err}");
      }
    }
  }
}

async fn handle_connection(
  mut stream: TcpStream,
  config: Arc<Config>,
  inbound: UnboundedSender<Inbound>,
) {
  // Frames are written in one piece, so one bounded read captures the
  // whole frame. Waiting for EOF instead would stall on JOIN senders,
  // which keep their connection open until they read the reply.
  let mut buf = vec![0u8; config.max_frame_size + 1];
  let n = match timeout(config.reply_timeout, stream.read(&mut buf)).await {
    Ok(Ok(n)) => n,
    Ok(Err(err)) => {
      debug!("failed to read an inbound frame: {err}");
      return;
    }
    Err(_) => {
      debug!("inbound connection timed out before sending a frame");
      return;
    }
  };
  if n == 0 {
    return;
  }
  if n > config.max_frame_size {
    increment_counter!("frames_oversized");
    warn!("dropping oversized inbound frame ({n} bytes)");
    return;
  }
  buf.truncate(n);

  let text = match String::from_utf8(buf) {
    Ok(text) => text,
    Err(_) => {
      increment_counter!("frames_malformed");
      debug!("dropping non UTF-8 inbound frame");
      return;
    }
  };
  let frame = match Frame::parse(&text) {
    Ok(frame) => frame,
    Err(err) => {
      increment_counter!("frames_malformed");
      debug!("dropping malformed inbound frame: {err}");
      return;
    }
  };

  if let Frame::Join { .. } = frame {
    // JOIN is the one frame answered on its own connection: hand the
    // write half to the router through a oneshot and relay its reply.
    let (tx, rx) = oneshot::channel();
    if inbound
      .send(Inbound {
        frame,
        reply: Some(tx),
      })
      .is_err()
    {
      return;
    }
    if let Ok(Ok(body)) = timeout(config.reply_timeout, rx).await {
      if let Err(err) = stream.write_all(body.as_bytes()).await {
        debug!("failed to write admission reply: {err}");
        return;
      }
      let _ = stream.shutdown().await;
    }
  } else {
    let _ = inbound.send(Inbound { frame, reply: None });
  }
}

/// Spawns the bounded outbound worker pool. Workers race for the next
/// queued command and terminate when the queue closes.
pub(crate) fn spawn_senders(
  config: &Config,
  commands: UnboundedReceiver<Command>,
) -> Vec<JoinHandle<()>> {
  let commands = Arc::new(Mutex::new(commands));
  let connect_timeout = config.connect_timeout;
  (0..config.send_concurrency.max(1))
    .map(|_| {
      let commands = commands.clone();
      tokio::spawn(async move {
        loop {
          let command = { commands.lock().await.recv().await };
          let Some(Command::Send { to, frame }) = command else {
            break;
          };
          match send_frame(&to, &frame, connect_timeout).await {
            Ok(()) => {
              increment_counter!("frames_sent", "verb" => frame.verb());
            }
            Err(err) => {
              increment_counter!("frames_send_failed", "verb" => frame.verb());
              debug!("sending {} to {to} failed: {err}", frame.verb());
            }
          }
        }
      })
    })
    .collect()
}

/// Opens a connection, writes one frame and closes. Used by the worker
/// pool and by the fan-outs that must be flushed before process exit.
pub(crate) async fn send_frame(
  addr: &PeerAddr,
  frame: &Frame,
  connect_timeout: Duration,
) -> io::Result<()> {
  let mut stream = connect(addr, connect_timeout).await?;
  stream.write_all(frame.encode().as_bytes()).await?;
  stream.shutdown().await?;
  Ok(())
}

/// Like [`send_frame`] but half-closes the connection and reads one
/// reply. Only the join handshake awaits replies.
pub(crate) async fn request(
  addr: &PeerAddr,
  frame: &Frame,
  connect_timeout: Duration,
  reply_timeout: Duration,
) -> io::Result<String> {
  let mut stream = connect(addr, connect_timeout).await?;
  stream.write_all(frame.encode().as_bytes()).await?;
  stream.shutdown().await?;

  let mut buf = Vec::new();
  match timeout(reply_timeout, stream.read_to_end(&mut buf)).await {
    Ok(read) => {
      read?;
    }
    Err(_) => return Err(io::ErrorKind::TimedOut.into()),
  }
  String::from_utf8(buf).map_err(|_| io::ErrorKind::InvalidData.into())
}

async fn connect(
  addr: &PeerAddr,
  connect_timeout: Duration,
) -> io::Result<TcpStream> {
  match timeout(
    connect_timeout,
    TcpStream::connect((addr.host.as_str(), addr.port)),
  )
  .await
  {
    Ok(stream) => stream,
    Err(_) => Err(io::ErrorKind::TimedOut.into()),
  }
}
