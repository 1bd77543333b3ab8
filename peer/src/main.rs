use {
  crate::cli::CliOptions,
  anyhow::Context,
  clap::Parser,
  futures::StreamExt,
  metrics_exporter_prometheus::PrometheusBuilder,
  parley_network::{MemberInfo, Node, SystemEvent, UserCommand},
  std::net::Ipv4Addr,
  tokio::io::{AsyncBufReadExt, BufReader},
  tracing::debug,
  tracing_subscriber::{EnvFilter, FmtSubscriber},
};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing::subscriber::set_global_default(
    FmtSubscriber::builder()
      .with_env_filter(EnvFilter::from_default_env())
      .finish(),
  )?;

  let opts = CliOptions::parse();
  debug!("peer options: {opts:?}");

  // several peers share one host, so the exporter port is explicit
  if let Some(port) = opts.metrics_port {
    PrometheusBuilder::new()
      .with_http_listener((Ipv4Addr::LOCALHOST, port))
      .install()
      .expect("failed to install metrics exporter");
  }

  let config = opts.into_config()?;
  let (node, mut events) = Node::spawn(config)
    .await
    .context("failed to start the local peer")?;

  println!("[system] chat started, type LIST to see members or EXIT to leave");

  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  loop {
    tokio::select! {
      line = lines.next_line() => {
        let Some(line) = line? else { break };
        let line = line.trim();
        if line.is_empty() {
          continue;
        }
        match UserCommand::parse(line) {
          Ok(UserCommand::Chat(text)) => {
            node.chat(&text);
            println!("you [{}]: {text}", render_id(node.id()));
          }
          Ok(UserCommand::List) => {
            for member in node.member_infos() {
              println!("{}", render_member(&member));
            }
          }
          Ok(UserCommand::Exit) => break,
          Err(err) => println!("[system] {err}"),
        }
      }

      event = events.next() => {
        let Some(event) = event else { break };
        render_event(event);
      }
    }
  }

  node.leave().await;
  println!("[system] disconnected");
  Ok(())
}

fn render_id(id: Option<u64>) -> String {
  id.map_or_else(|| "?".into(), |id| id.to_string())
}

fn render_member(member: &MemberInfo) -> String {
  format!(
    "{} [{}] -> {}",
    member.name.as_deref().unwrap_or("unknown"),
    render_id(member.id),
    member.addr
  )
}

fn render_event(event: SystemEvent) {
  match event {
    SystemEvent::Listening(addr) => {
      println!("[system] listening on {addr}");
    }
    SystemEvent::NetworkFounded => {
      println!("[system] acting as network coordinator (id 0)");
    }
    SystemEvent::JoinCompleted { id, coordinator } => {
      println!("[system] joined the network with id {id} (coordinator {coordinator})");
    }
    SystemEvent::BootstrapUnreachable(addr) => {
      println!("[alert] coordinator {addr} did not answer, starting a standalone network");
    }
    SystemEvent::PeerAdmitted { addr, name, id } => {
      println!("[system] {name} ({addr}) joined with id {id}");
    }
    SystemEvent::MembersUpdated => {
      println!("[system] member list updated");
    }
    SystemEvent::PeerRemoved { addr, name } => {
      println!(
        "[system] peer removed: {} ({addr})",
        name.as_deref().unwrap_or("unknown")
      );
    }
    SystemEvent::PeerLeft { addr, name } => {
      println!("[system] {name} ({addr}) left the chat");
    }
    SystemEvent::MapsUpdated => {
      println!("[system] id and name maps updated");
    }
    SystemEvent::ElectionStarted => {
      println!("[election] coordinator unreachable, starting an election");
    }
    SystemEvent::ElectionDeferred => {
      println!("[election] a higher id is alive, waiting for its announcement");
    }
    SystemEvent::CoordinatorElected { addr, name, is_self } => {
      if is_self {
        println!("[election] this node is the new coordinator");
      } else {
        println!("[election] new coordinator: {name} ({addr})");
      }
    }
    SystemEvent::CoordinatorInactive(addr) => {
      println!("[alert] coordinator {addr} inactive, starting recovery");
    }
    SystemEvent::Chat(line) => println!("{line}"),
  }
}
