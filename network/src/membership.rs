use {
  crate::wire::PeerAddr,
  std::{
    collections::{HashMap, HashSet},
    time::Instant,
  },
};

/// Role of the local peer within the membership protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
  /// The join handshake has not completed yet. The member list does
  /// not contain the local peer while in this state.
  Joining,

  /// An ordinary member: beacons the coordinator and watches its
  /// freshness.
  Member,

  /// A bully election is running locally. Cleared by the next
  /// COORDINATOR announcement.
  Electing,

  /// This peer is the membership authority: admits joiners, assigns
  /// identifiers and beacons every other member.
  Coordinator,
}

/// A row of the member list as rendered by the console front-end.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberInfo {
  pub addr: PeerAddr,
  pub id: Option<u64>,
  pub name: Option<String>,
}

/// Authoritative in-memory state of a single peer.
///
/// There is exactly one instance per process, owned by the node and
/// protected by a single lock. Handlers hold the lock only for the
/// duration of a state mutation, never across network I/O; outbound
/// work is queued on a non-blocking command channel instead.
pub(crate) struct Membership {
  pub self_addr: PeerAddr,
  pub self_name: String,
  pub self_id: Option<u64>,
  pub role: Role,

  /// All known peers including the local one (once joined), in
  /// arrival order. The order is what makes identifier recalculation
  /// after an election deterministic.
  pub members: Vec<PeerAddr>,

  /// Election ordering identifiers, assigned by the coordinator.
  /// Values are unique; higher wins elections.
  pub ids: HashMap<PeerAddr, u64>,

  /// Display names, keyed like [`ids`].
  pub names: HashMap<PeerAddr, String>,

  /// Address currently believed to be the coordinator. Points at the
  /// local peer when this node holds the role itself.
  pub coordinator: Option<PeerAddr>,

  /// Smallest identifier not assigned yet. Only meaningful while the
  /// local peer is the coordinator.
  pub next_id: u64,

  /// Timestamp of the last beacon received from each peer. Populated
  /// lazily; beacons from non-members are recorded too and corrected
  /// by later snapshots.
  pub last_seen: HashMap<PeerAddr, Instant>,
}

impl Membership {
  pub fn new(self_addr: PeerAddr, self_name: String) -> Self {
    Self {
      self_addr,
      self_name,
      self_id: None,
      role: Role::Joining,
      members: Vec::new(),
      ids: HashMap::new(),
      names: HashMap::new(),
      coordinator: None,
      next_id: 1,
      last_seen: HashMap::new(),
    }
  }

  pub fn contains(&self, addr: &PeerAddr) -> bool {
    self.members.contains(addr)
  }

  /// Every member except the local peer, the usual fan-out target set.
  pub fn other_members(&self) -> Vec<PeerAddr> {
    self
      .members
      .iter()
      .filter(|peer| **peer != self.self_addr)
      .cloned()
      .collect()
  }

  /// Members whose identifier is strictly greater than ours, the
  /// candidate set a bully election challenges. Peers with no known
  /// identifier are not candidates.
  pub fn higher_peers(&self) -> Vec<PeerAddr> {
    let Some(my_id) = self.self_id else {
      return Vec::new();
    };
    self
      .members
      .iter()
      .filter(|peer| **peer != self.self_addr)
      .filter(|peer| self.ids.get(peer).map_or(false, |id| *id > my_id))
      .cloned()
      .collect()
  }

  /// Boots this peer as the founding coordinator of a new network.
  pub fn become_founder(&mut self) {
    self.role = Role::Coordinator;
    self.self_id = Some(0);
    self.coordinator = Some(self.self_addr.clone());
    self.ids.insert(self.self_addr.clone(), 0);
    self
      .names
      .insert(self.self_addr.clone(), self.self_name.clone());
    if !self.contains(&self.self_addr) {
      self.members.push(self.self_addr.clone());
    }
    self.next_id = 1;
  }

  /// Applies the coordinator's admission reply on the joining side.
  pub fn adopt_admission(
    &mut self,
    id: u64,
    peers: Vec<PeerAddr>,
    coordinator: PeerAddr,
  ) {
    self.self_id = Some(id);
    self.members = peers;
    if !self.contains(&self.self_addr) {
      self.members.push(self.self_addr.clone());
    }
    self.ids.insert(self.self_addr.clone(), id);
    self
      .names
      .insert(self.self_addr.clone(), self.self_name.clone());
    self.coordinator = Some(coordinator);
    self.role = Role::Member;
  }

  /// Admits a peer on the coordinator side, assigning the next free
  /// identifier to addresses never seen before. Returns the peer's
  /// identifier and whether the address was newly added.
  pub fn add_peer(&mut self, addr: PeerAddr, name: impl Into<String>) -> (u64, bool) {
    let added = !self.contains(&addr);
    if added {
      self.members.push(addr.clone());
    }
    let id = match self.ids.get(&addr) {
      Some(id) => *id,
      None => {
        let id = self.next_id;
        self.ids.insert(addr.clone(), id);
        self.next_id += 1;
        id
      }
    };
    self.names.insert(addr, name.into());
    (id, added)
  }

  /// Drops a peer from the member list and every map. Returns its
  /// display name when one was known.
  pub fn remove_peer(&mut self, addr: &PeerAddr) -> Option<String> {
    self.members.retain(|peer| peer != addr);
    self.ids.remove(addr);
    self.last_seen.remove(addr);
    self.names.remove(addr)
  }

  /// Replaces the member list with an authoritative snapshot and
  /// purges the maps of every peer that disappeared. Returns the
  /// removed peers together with their last known names.
  pub fn apply_snapshot(
    &mut self,
    snapshot: Vec<PeerAddr>,
  ) -> Vec<(PeerAddr, Option<String>)> {
    let previous = std::mem::replace(&mut self.members, snapshot);
    let mut removed = Vec::new();
    for peer in previous {
      if !self.contains(&peer) {
        self.ids.remove(&peer);
        self.last_seen.remove(&peer);
        let name = self.names.remove(&peer);
        removed.push((peer, name));
      }
    }
    removed
  }

  /// Rebuilds the identifier map after winning an election.
  ///
  /// Known identifiers are preserved; every peer lacking one receives
  /// the smallest unused non-negative integer, walking the member
  /// list in order so the result is deterministic. `next_id` lands
  /// strictly above everything assigned.
  pub fn recalculate_ids(&mut self) {
    let mut fresh = HashMap::with_capacity(self.members.len());
    for peer in &self.members {
      if let Some(id) = self.ids.get(peer) {
        fresh.insert(peer.clone(), *id);
      }
    }
    let mut used: HashSet<u64> = fresh.values().copied().collect();
    let mut candidate = 0;
    for peer in &self.members {
      if fresh.contains_key(peer) {
        continue;
      }
      while used.contains(&candidate) {
        candidate += 1;
      }
      fresh.insert(peer.clone(), candidate);
      used.insert(candidate);
    }
    debug_assert_eq!(used.len(), fresh.len(), "identifiers must stay unique");
    self.next_id = fresh.values().max().map_or(0, |max| max + 1);
    self.ids = fresh;
    self.self_id = self.ids.get(&self.self_addr).copied();
  }

  pub fn member_infos(&self) -> Vec<MemberInfo> {
    self
      .members
      .iter()
      .map(|peer| MemberInfo {
        addr: peer.clone(),
        id: self.ids.get(peer).copied(),
        name: self.names.get(peer).cloned(),
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::{Membership, PeerAddr, Role};

  fn addr(port: u16) -> PeerAddr {
    PeerAddr::new("127.0.0.1", port)
  }

  fn coordinator() -> Membership {
    let mut state = Membership::new(addr(5001), "alice".into());
    state.become_founder();
    state
  }

  #[test]
  fn founder_starts_with_id_zero() {
    let state = coordinator();
    assert_eq!(state.role, Role::Coordinator);
    assert_eq!(state.self_id, Some(0));
    assert_eq!(state.members, vec![addr(5001)]);
    assert_eq!(state.coordinator, Some(addr(5001)));
    assert_eq!(state.next_id, 1);
  }

  #[test]
  fn admissions_assign_distinct_monotone_ids() {
    let mut state = coordinator();
    let (bob, bob_new) = state.add_peer(addr(5002), "bob");
    let (carol, carol_new) = state.add_peer(addr(5003), "carol");
    assert!(bob_new && carol_new);
    assert_eq!((bob, carol), (1, 2));

    // re-joining keeps the identifier already assigned
    let (bob_again, added) = state.add_peer(addr(5002), "bob");
    assert_eq!(bob_again, 1);
    assert!(!added);

    // next_id stays strictly above everything handed out
    assert!(state.ids.values().all(|id| *id < state.next_id));
    // map domains track the member list
    for peer in &state.members {
      assert!(state.ids.contains_key(peer));
      assert!(state.names.contains_key(peer));
    }
  }

  #[test]
  fn remove_peer_purges_every_map() {
    let mut state = coordinator();
    state.add_peer(addr(5002), "bob");
    state
      .last_seen
      .insert(addr(5002), std::time::Instant::now());

    assert_eq!(state.remove_peer(&addr(5002)), Some("bob".into()));
    assert!(!state.contains(&addr(5002)));
    assert!(!state.ids.contains_key(&addr(5002)));
    assert!(!state.names.contains_key(&addr(5002)));
    assert!(!state.last_seen.contains_key(&addr(5002)));
  }

  #[test]
  fn snapshot_reports_and_purges_disappeared_peers() {
    let mut state = coordinator();
    state.add_peer(addr(5002), "bob");
    state.add_peer(addr(5003), "carol");

    let removed = state.apply_snapshot(vec![addr(5001), addr(5003)]);
    assert_eq!(removed, vec![(addr(5002), Some("bob".into()))]);
    assert_eq!(state.members, vec![addr(5001), addr(5003)]);
    assert!(!state.ids.contains_key(&addr(5002)));
  }

  #[test]
  fn higher_peers_ignores_unknown_ids() {
    let mut state = Membership::new(addr(5002), "bob".into());
    state.adopt_admission(
      1,
      vec![addr(5001), addr(5002), addr(5003), addr(5004)],
      addr(5001),
    );
    state.ids.insert(addr(5001), 0);
    state.ids.insert(addr(5003), 2);
    // 5004 has no known identifier and must not be challenged

    assert_eq!(state.higher_peers(), vec![addr(5003)]);
  }

  #[test]
  fn recalculation_preserves_known_ids_and_stays_unique() {
    let mut state = Membership::new(addr(5003), "carol".into());
    state.adopt_admission(2, vec![addr(5002), addr(5003), addr(5004)], addr(5001));
    state.ids.insert(addr(5002), 1);
    // 5004 joined moments before the coordinator died; its id is unknown

    state.recalculate_ids();

    assert_eq!(state.ids.get(&addr(5002)), Some(&1));
    assert_eq!(state.ids.get(&addr(5003)), Some(&2));
    // the unknown peer gets the smallest unused id, not a clashing one
    assert_eq!(state.ids.get(&addr(5004)), Some(&0));
    assert_eq!(state.self_id, Some(2));
    assert_eq!(state.next_id, 3);

    let mut seen = std::collections::HashSet::new();
    assert!(state.ids.values().all(|id| seen.insert(*id)));
  }

  #[test]
  fn recalculation_backfills_several_unknowns_in_member_order() {
    let mut state = Membership::new(addr(5004), "dave".into());
    state.adopt_admission(
      3,
      vec![addr(5002), addr(5003), addr(5004), addr(5005)],
      addr(5001),
    );
    state.ids.remove(&addr(5002));
    state.ids.remove(&addr(5003));
    state.ids.remove(&addr(5005));

    state.recalculate_ids();

    assert_eq!(state.ids.get(&addr(5002)), Some(&0));
    assert_eq!(state.ids.get(&addr(5003)), Some(&1));
    assert_eq!(state.ids.get(&addr(5004)), Some(&3));
    assert_eq!(state.ids.get(&addr(5005)), Some(&2));
    assert_eq!(state.next_id, 4);
  }
}
