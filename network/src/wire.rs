//! Defines the line-oriented wire protocol spoken between peers.
//!
//! Every frame is a whitespace-tokenized UTF-8 line carried on its own
//! short-lived TCP connection. A frame starts with one of the closed-set
//! verbs below; any line that does not is a user chat message and is
//! surfaced verbatim to the console front-end.

use {
  serde::{Deserialize, Deserializer, Serialize, Serializer},
  std::{
    collections::HashMap,
    fmt::{self, Display},
  },
  thiserror::Error,
};

#[derive(Debug, Error)]
pub enum Error {
  #[error("{0} frame is missing an argument")]
  MissingArgument(&'static str),

  #[error("{0} frame has trailing tokens")]
  TrailingTokens(&'static str),

  #[error("invalid port number: {0}")]
  InvalidPort(String),

  #[error("invalid election id: {0}")]
  InvalidId(String),

  #[error("malformed address key: {0}")]
  MalformedAddressKey(String),

  #[error("malformed JSON payload: {0}")]
  Json(#[from] serde_json::Error),
}

/// Network identity of a peer. Two peers are the same exactly when
/// their host and port are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddr {
  pub host: String,
  pub port: u16,
}

impl PeerAddr {
  pub fn new(host: impl Into<String>, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
    }
  }

  /// The stringified-tuple form used as map keys in MAP_UPDATE
  /// payloads, e.g. `('127.0.0.1', 5001)`.
  pub(crate) fn map_key(&self) -> String {
    format!("('{}', {})", self.host, self.port)
  }

  /// Strict tokenizer for MAP_UPDATE map keys. Refuses any input that
  /// does not match the `('host', port)` shape; the key format comes
  /// from the wire protocol, never from evaluating the string.
  pub(crate) fn from_map_key(key: &str) -> Result<Self, Error> {
    let malformed = || Error::MalformedAddressKey(key.into());
    let inner = key
      .strip_prefix('(')
      .and_then(|k| k.strip_suffix(')'))
      .ok_or_else(malformed)?;
    let (host, port) = inner.split_once(',').ok_or_else(malformed)?;
    let host = host
      .trim()
      .strip_prefix('\'')
      .and_then(|h| h.strip_suffix('\''))
      .ok_or_else(malformed)?;
    let forbidden = |c: char| c.is_whitespace() || "'(),".contains(c);
    if host.is_empty() || host.contains(forbidden) {
      return Err(malformed());
    }
    let port = port.trim().parse().map_err(|_| malformed())?;
    Ok(Self::new(host, port))
  }
}

impl Display for PeerAddr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.host, self.port)
  }
}

// On the wire an address is a two element JSON array `[host, port]`,
// matching the shape used by UPDATE payloads and JOIN replies.
impl Serialize for PeerAddr {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    (self.host.as_str(), self.port).serialize(serializer)
  }
}

impl<'de> Deserialize<'de> for PeerAddr {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let (host, port) = <(String, u16)>::deserialize(deserializer)?;
    Ok(Self { host, port })
  }
}

/// Body of the JSON reply sent on the JOIN connection: the identifier
/// assigned to the joining peer and the full membership snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinReply {
  pub id: u64,
  pub peers: Vec<PeerAddr>,
}

/// JSON body of a MAP_UPDATE frame. The `nomes` wire key is kept for
/// compatibility with the original protocol.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RawPeerMaps {
  #[serde(default)]
  ids: HashMap<String, u64>,

  #[serde(rename = "nomes", default)]
  names: HashMap<String, String>,
}

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
  /// Admission request from a peer that wants to enter the network.
  /// The only frame that is answered on its own connection.
  Join { addr: PeerAddr, name: String },

  /// Authoritative membership snapshot pushed by the coordinator.
  Update(Vec<PeerAddr>),

  /// Full identifier and display-name maps pushed by the coordinator.
  MapUpdate {
    ids: HashMap<PeerAddr, u64>,
    names: HashMap<PeerAddr, String>,
  },

  /// Liveness beacon: the sender is alive at the carried address.
  Heartbeat(PeerAddr),

  /// The sender is running a bully election with the carried id.
  Election { id: u64 },

  /// Announces the election winner to the rest of the network.
  Coordinator { addr: PeerAddr, name: String },

  /// Asks the recipient to run its own election immediately instead
  /// of waiting for the failure detector.
  StartElection,

  /// Advisory request to drop a suspected coordinator from the
  /// recipient's member list.
  RemoveCoordinator(PeerAddr),

  /// The sender is leaving the network voluntarily.
  Exit { addr: PeerAddr, name: String },

  /// Anything that does not start with a known verb: a user chat line
  /// already formatted by the sender, displayed verbatim.
  Chat(String),
}

impl Frame {
  /// Decodes one frame from its wire representation.
  ///
  /// An unknown leading token makes the whole line a [`Frame::Chat`];
  /// a known verb with malformed arguments is an error and the frame
  /// is dropped by the caller.
  pub fn parse(line: &str) -> Result<Self, Error> {
    let mut tokens = line.split_whitespace();
    let verb = match tokens.next() {
      Some(verb) => verb,
      None => return Ok(Self::Chat(line.into())),
    };
    match verb {
      "JOIN" => {
        let addr = take_addr(&mut tokens, "JOIN")?;
        let name = take_name(&mut tokens, "JOIN")?;
        finish(tokens, "JOIN")?;
        Ok(Self::Join { addr, name })
      }
      "UPDATE" => {
        let peers = serde_json::from_str(payload(line, "UPDATE")?)?;
        Ok(Self::Update(peers))
      }
      "MAP_UPDATE" => {
        let raw: RawPeerMaps = serde_json::from_str(payload(line, "MAP_UPDATE")?)?;
        let mut ids = HashMap::with_capacity(raw.ids.len());
        for (key, id) in raw.ids {
          ids.insert(PeerAddr::from_map_key(&key)?, id);
        }
        let mut names = HashMap::with_capacity(raw.names.len());
        for (key, name) in raw.names {
          names.insert(PeerAddr::from_map_key(&key)?, name);
        }
        Ok(Self::MapUpdate { ids, names })
      }
      "HEARTBEAT" => {
        let addr = take_addr(&mut tokens, "HEARTBEAT")?;
        finish(tokens, "HEARTBEAT")?;
        Ok(Self::Heartbeat(addr))
      }
      "ELECTION" => {
        let id = tokens.next().ok_or(Error::MissingArgument("ELECTION"))?;
        let id = id.parse().map_err(|_| Error::InvalidId(id.into()))?;
        finish(tokens, "ELECTION")?;
        Ok(Self::Election { id })
      }
      "COORDINATOR" => {
        let addr = take_addr(&mut tokens, "COORDINATOR")?;
        let name = take_name(&mut tokens, "COORDINATOR")?;
        finish(tokens, "COORDINATOR")?;
        Ok(Self::Coordinator { addr, name })
      }
      "START_ELECTION" => {
        finish(tokens, "START_ELECTION")?;
        Ok(Self::StartElection)
      }
      "REMOVE_COORDINATOR" => {
        let addr = take_addr(&mut tokens, "REMOVE_COORDINATOR")?;
        finish(tokens, "REMOVE_COORDINATOR")?;
        Ok(Self::RemoveCoordinator(addr))
      }
      "EXIT" => {
        let addr = take_addr(&mut tokens, "EXIT")?;
        let name = take_name(&mut tokens, "EXIT")?;
        finish(tokens, "EXIT")?;
        Ok(Self::Exit { addr, name })
      }
      _ => Ok(Self::Chat(line.into())),
    }
  }

  /// Encodes the frame into its wire representation.
  pub fn encode(&self) -> String {
    match self {
      Self::Join { addr, name } => {
        format!("JOIN {} {} {name}", addr.host, addr.port)
      }
      Self::Update(peers) => format!(
        "UPDATE {}",
        serde_json::to_string(peers).expect("peer lists are serializable")
      ),
      Self::MapUpdate { ids, names } => {
        let raw = RawPeerMaps {
          ids: ids.iter().map(|(a, id)| (a.map_key(), *id)).collect(),
          names: names
            .iter()
            .map(|(a, name)| (a.map_key(), name.clone()))
            .collect(),
        };
        format!(
          "MAP_UPDATE {}",
          serde_json::to_string(&raw).expect("string maps are serializable")
        )
      }
      Self::Heartbeat(addr) => {
        format!("HEARTBEAT {} {}", addr.host, addr.port)
      }
      Self::Election { id } => format!("ELECTION {id}"),
      Self::Coordinator { addr, name } => {
        format!("COORDINATOR {} {} {name}", addr.host, addr.port)
      }
      Self::StartElection => "START_ELECTION".into(),
      Self::RemoveCoordinator(addr) => {
        format!("REMOVE_COORDINATOR {} {}", addr.host, addr.port)
      }
      Self::Exit { addr, name } => {
        format!("EXIT {} {} {name}", addr.host, addr.port)
      }
      Self::Chat(text) => text.clone(),
    }
  }

  /// Wire verb of this frame, used as a metrics and log label.
  pub(crate) fn verb(&self) -> &'static str {
    match self {
      Self::Join { .. } => "JOIN",
      Self::Update(_) => "UPDATE",
      Self::MapUpdate { .. } => "MAP_UPDATE",
      Self::Heartbeat(_) => "HEARTBEAT",
      Self::Election { .. } => "ELECTION",
      Self::Coordinator { .. } => "COORDINATOR",
      Self::StartElection => "START_ELECTION",
      Self::RemoveCoordinator(_) => "REMOVE_COORDINATOR",
      Self::Exit { .. } => "EXIT",
      Self::Chat(_) => "CHAT",
    }
  }
}

fn take_addr<'a>(
  tokens: &mut impl Iterator<Item = &'a str>,
  verb: &'static str,
) -> Result<PeerAddr, Error> {
  let host = tokens.next().ok_or(Error::MissingArgument(verb))?;
  let port = tokens.next().ok_or(Error::MissingArgument(verb))?;
  let port = port.parse().map_err(|_| Error::InvalidPort(port.into()))?;
  Ok(PeerAddr::new(host, port))
}

fn take_name<'a>(
  tokens: &mut impl Iterator<Item = &'a str>,
  verb: &'static str,
) -> Result<String, Error> {
  Ok(tokens.next().ok_or(Error::MissingArgument(verb))?.into())
}

fn finish<'a>(
  mut tokens: impl Iterator<Item = &'a str>,
  verb: &'static str,
) -> Result<(), Error> {
  match tokens.next() {
    Some(_) => Err(Error::TrailingTokens(verb)),
    None => Ok(()),
  }
}

/// Everything after the leading verb, for frames carrying one JSON
/// payload argument.
fn payload<'a>(line: &'a str, verb: &'static str) -> Result<&'a str, Error> {
  line
    .split_once(char::is_whitespace)
    .map(|(_, rest)| rest.trim_start())
    .ok_or(Error::MissingArgument(verb))
}

#[cfg(test)]
mod tests {
  use {
    super::{Error, Frame, PeerAddr},
    std::collections::HashMap,
  };

  fn addr(port: u16) -> PeerAddr {
    PeerAddr::new("127.0.0.1", port)
  }

  #[test]
  fn parses_join() {
    assert_eq!(
      Frame::parse("JOIN 127.0.0.1 5001 alice").unwrap(),
      Frame::Join {
        addr: addr(5001),
        name: "alice".into()
      }
    );
  }

  #[test]
  fn parses_update_snapshot() {
    let frame =
      Frame::parse(r#"UPDATE [["127.0.0.1", 5001], ["127.0.0.1", 5002]]"#)
        .unwrap();
    assert_eq!(frame, Frame::Update(vec![addr(5001), addr(5002)]));
  }

  #[test]
  fn parses_map_update() {
    let frame = Frame::parse(concat!(
      r#"MAP_UPDATE {"ids": {"('127.0.0.1', 5001)": 0}, "#,
      r#""nomes": {"('127.0.0.1', 5001)": "alice"}}"#
    ))
    .unwrap();
    let Frame::MapUpdate { ids, names } = frame else {
      panic!("expected a MAP_UPDATE frame");
    };
    assert_eq!(ids.get(&addr(5001)), Some(&0));
    assert_eq!(names.get(&addr(5001)), Some(&"alice".to_string()));
  }

  #[test]
  fn map_update_roundtrip() {
    let ids: HashMap<_, _> = [(addr(5001), 0), (addr(5002), 1)].into();
    let names: HashMap<_, _> = [
      (addr(5001), "alice".to_string()),
      (addr(5002), "bob".to_string()),
    ]
    .into();
    let encoded = Frame::MapUpdate {
      ids: ids.clone(),
      names: names.clone(),
    }
    .encode();
    assert_eq!(
      Frame::parse(&encoded).unwrap(),
      Frame::MapUpdate { ids, names }
    );
  }

  #[test]
  fn unknown_verb_is_chat() {
    assert_eq!(
      Frame::parse("alice [0]: hello there").unwrap(),
      Frame::Chat("alice [0]: hello there".into())
    );
    // casing matters: verbs are upper-case only
    assert_eq!(
      Frame::parse("join me later").unwrap(),
      Frame::Chat("join me later".into())
    );
  }

  #[test]
  fn known_verb_with_bad_arguments_is_malformed() {
    assert!(matches!(
      Frame::parse("JOIN 127.0.0.1"),
      Err(Error::MissingArgument("JOIN"))
    ));
    assert!(matches!(
      Frame::parse("HEARTBEAT 127.0.0.1 notaport"),
      Err(Error::InvalidPort(_))
    ));
    assert!(matches!(
      Frame::parse("ELECTION -3"),
      Err(Error::InvalidId(_))
    ));
    assert!(matches!(
      Frame::parse("START_ELECTION now"),
      Err(Error::TrailingTokens("START_ELECTION"))
    ));
  }

  #[test]
  fn map_keys_are_tokenized_never_evaluated() {
    assert_eq!(
      PeerAddr::from_map_key("('127.0.0.1', 5001)").unwrap(),
      addr(5001)
    );
    for key in [
      "127.0.0.1:5001",
      "('127.0.0.1', 5001",
      "(127.0.0.1, 5001)",
      "('127.0.0.1', 5001, 7)",
      "('127.0.0.1', 99999)",
      "('', 5001)",
      "__import__('os')",
    ] {
      assert!(
        matches!(
          PeerAddr::from_map_key(key),
          Err(Error::MalformedAddressKey(_))
        ),
        "key {key:?} must be refused"
      );
    }
  }

  #[test]
  fn join_reply_matches_wire_shape() {
    let reply: super::JoinReply =
      serde_json::from_str(r#"{"id": 2, "peers": [["127.0.0.1", 5001]]}"#)
        .unwrap();
    assert_eq!(reply.id, 2);
    assert_eq!(reply.peers, vec![addr(5001)]);
  }
}
