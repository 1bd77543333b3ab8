use {
  anyhow::Result,
  clap::Parser,
  parley_network::{Config, PeerAddr},
  std::io::{self, Write},
};

#[derive(Debug, Parser)]
#[clap(
  name = "parley",
  about = "Decentralized peer-to-peer chat with an elected coordinator"
)]
pub struct CliOptions {
  #[clap(long, short, help = "display name used in the chat")]
  name: Option<String>,

  #[clap(long, short, help = "local port to listen on (0 picks a free one)")]
  port: Option<u16>,

  #[clap(
    long,
    short,
    help = "port of a known coordinator to join on the chat network"
  )]
  bootstrap: Option<u16>,

  #[clap(
    long,
    default_value = "127.0.0.1",
    help = "host address to bind and advertise"
  )]
  host: String,

  #[clap(long, help = "port to expose prometheus metrics on")]
  pub metrics_port: Option<u16>,
}

impl CliOptions {
  /// Turns the parsed flags into a node configuration, prompting on
  /// stdin for identity values that were not given. The bootstrap
  /// question is only asked in fully interactive invocations; with
  /// flags the node starts standalone unless `--bootstrap` is passed.
  pub fn into_config(self) -> Result<Config> {
    let interactive = self.name.is_none() && self.port.is_none();

    let name = match self.name {
      Some(name) => name,
      None => loop {
        let name = prompt("your display name: ")?;
        if !name.is_empty() && name.split_whitespace().count() == 1 {
          break name;
        }
        println!("the name must be a single non-empty word");
      },
    };
    anyhow::ensure!(
      !name.is_empty() && name.split_whitespace().count() == 1,
      "the display name must be a single non-empty word"
    );

    let port = match self.port {
      Some(port) => port,
      None => prompt_port("local port to listen on: ")?,
    };

    let bootstrap = match self.bootstrap {
      Some(port) => Some(PeerAddr::new(self.host.clone(), port)),
      None if interactive => {
        let answer = prompt("join an existing coordinator? [y/N]: ")?;
        if answer.eq_ignore_ascii_case("y") {
          let port = prompt_port("coordinator port: ")?;
          Some(PeerAddr::new(self.host.clone(), port))
        } else {
          None
        }
      }
      None => None,
    };

    Ok(Config {
      name,
      host: self.host,
      port,
      bootstrap,
      ..Config::default()
    })
  }
}

fn prompt(message: &str) -> Result<String> {
  print!("{message}");
  io::stdout().flush()?;
  let mut line = String::new();
  io::stdin().read_line(&mut line)?;
  Ok(line.trim().to_string())
}

fn prompt_port(message: &str) -> Result<u16> {
  loop {
    match prompt(message)?.parse() {
      Ok(port) => return Ok(port),
      Err(_) => println!("the port must be an integer between 0 and 65535"),
    }
  }
}
