use thiserror::Error;

/// Protocol verbs may never start a user line: such a line would be
/// indistinguishable from a forged control frame on the wire.
const RESERVED: [&str; 9] = [
  "JOIN",
  "UPDATE",
  "MAP_UPDATE",
  "HEARTBEAT",
  "ELECTION",
  "COORDINATOR",
  "START_ELECTION",
  "REMOVE_COORDINATOR",
  "EXIT",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{0}' is a reserved protocol word")]
pub struct ReservedWord(pub String);

/// Input contract consumed from the console front-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
  /// Broadcast the line as a chat message.
  Chat(String),

  /// Render the member list.
  List,

  /// Leave the network and terminate.
  Exit,
}

impl UserCommand {
  /// Classifies one line typed at the console. `LIST` and `EXIT` must
  /// be the entire line; any other line starting with a reserved verb
  /// is rejected before a frame could be forged from it.
  pub fn parse(line: &str) -> Result<Self, ReservedWord> {
    let line = line.trim();
    if line == "LIST" {
      return Ok(Self::List);
    }
    if line == "EXIT" {
      return Ok(Self::Exit);
    }
    if let Some(first) = line.split_whitespace().next() {
      if RESERVED.contains(&first) {
        return Err(ReservedWord(first.into()));
      }
    }
    Ok(Self::Chat(line.into()))
  }
}
