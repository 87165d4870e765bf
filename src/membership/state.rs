use crate::proto::gossip as pb;
use crate::store::NodeMetadata;
use crate::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Liveness of a member as seen by the local node. Ordered by severity: at
/// equal incarnation the more severe claim wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MemberState {
    Alive,
    Suspect,
    Dead,
    Left,
}

impl From<pb::MemberState> for MemberState {
    fn from(value: pb::MemberState) -> Self {
        match value {
            pb::MemberState::Alive => MemberState::Alive,
            pb::MemberState::Suspect => MemberState::Suspect,
            pb::MemberState::Dead => MemberState::Dead,
            pb::MemberState::Left => MemberState::Left,
        }
    }
}

impl From<MemberState> for pb::MemberState {
    fn from(value: MemberState) -> Self {
        match value {
            MemberState::Alive => pb::MemberState::Alive,
            MemberState::Suspect => pb::MemberState::Suspect,
            MemberState::Dead => pb::MemberState::Dead,
            MemberState::Left => pb::MemberState::Left,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,

    /// Gossip address, `host:port`.
    pub addr: String,

    /// Encoded [`NodeMetadata`] as produced by the node's delegate.
    pub meta: Vec<u8>,

    /// Bumped by the member itself to refute suspicion or announce leaving.
    pub incarnation: u64,
    pub state: MemberState,
}

impl Member {
    /// Decode the advertised metadata, e.g. to find a peer's API port.
    pub fn metadata(&self) -> Result<NodeMetadata> {
        bincode::deserialize(&self.meta).map_err(|source| Error::Decode {
            what: "node metadata",
            source,
        })
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, MemberState::Alive | MemberState::Suspect)
    }
}

impl From<pb::Member> for Member {
    fn from(value: pb::Member) -> Self {
        let state = value.state().into();
        Member {
            name: value.name,
            addr: value.addr,
            meta: value.meta,
            incarnation: value.incarnation,
            state,
        }
    }
}

impl From<Member> for pb::Member {
    fn from(value: Member) -> Self {
        let mut member = pb::Member {
            name: value.name,
            addr: value.addr,
            meta: value.meta,
            incarnation: value.incarnation,
            state: 0,
        };
        member.set_state(value.state.into());
        member
    }
}

#[derive(Debug, Clone)]
struct MemberRecord {
    member: Member,
    /// When the state last changed, used to time out suspects.
    since: Instant,
}

impl MemberRecord {
    fn new(member: Member) -> Self {
        Self {
            member,
            since: Instant::now(),
        }
    }
}

/// Result of applying a gossiped member record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergeOutcome {
    Inserted,
    Updated,
    Ignored,
    /// Someone claimed the local node was not alive; our incarnation was
    /// bumped past the claim.
    Refuted,
}

/// Member table of one node, including the local member itself.
#[derive(Debug)]
pub(crate) struct MemberTable {
    local_name: String,
    members: DashMap<String, MemberRecord>,
}

impl MemberTable {
    pub(crate) fn new(local: Member) -> Self {
        let members = DashMap::new();
        let local_name = local.name.clone();
        members.insert(local_name.clone(), MemberRecord::new(local));
        Self {
            local_name,
            members,
        }
    }

    pub(crate) fn local_name(&self) -> &str {
        &self.local_name
    }

    pub(crate) fn local(&self) -> Member {
        self.get(&self.local_name)
            .unwrap_or_else(|| unreachable!("local member is never removed from the table"))
    }

    pub(crate) fn get(&self, name: &str) -> Option<Member> {
        self.members.get(name).map(|r| r.member.clone())
    }

    /// Every record, including dead and left members, for push/pull.
    pub(crate) fn all(&self) -> Vec<Member> {
        self.members.iter().map(|r| r.member.clone()).collect()
    }

    /// Alive and suspect members, the local node included when it is alive.
    pub(crate) fn active(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self
            .members
            .iter()
            .filter(|r| r.member.is_active())
            .map(|r| r.member.clone())
            .collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    /// Active members other than the local node.
    pub(crate) fn peers(&self) -> Vec<Member> {
        self.active()
            .into_iter()
            .filter(|m| m.name != self.local_name)
            .collect()
    }

    /// Peers believed alive, the targets of push/pull and broadcasts.
    pub(crate) fn alive_peers(&self) -> Vec<Member> {
        self.peers()
            .into_iter()
            .filter(|m| m.state == MemberState::Alive)
            .collect()
    }

    /// Apply a record gossiped by a peer.
    ///
    /// Unknown members are inserted. A known member is replaced by a record
    /// with a higher incarnation, or with the same incarnation and a more
    /// severe state. Records about the local node are never applied; claims
    /// that it is not alive are refuted instead.
    pub(crate) fn merge(&self, remote: Member) -> MergeOutcome {
        if remote.name == self.local_name {
            return self.refute(&remote);
        }

        match self.members.entry(remote.name.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(MemberRecord::new(remote));
                MergeOutcome::Inserted
            }
            Entry::Occupied(mut entry) => {
                let current = &entry.get().member;
                let newer = remote.incarnation > current.incarnation
                    || (remote.incarnation == current.incarnation && remote.state > current.state);
                if !newer {
                    return MergeOutcome::Ignored;
                }
                let state_changed = remote.state != current.state;
                let record = entry.get_mut();
                record.member = remote;
                if state_changed {
                    record.since = Instant::now();
                }
                MergeOutcome::Updated
            }
        }
    }

    /// First-hand evidence that a member is alive: it contacted us itself.
    ///
    /// Revives dead members, but a member that left stays gone unless it
    /// comes back with a higher incarnation.
    pub(crate) fn observe_alive(&self, mut member: Member) {
        if member.name == self.local_name {
            return;
        }
        member.state = MemberState::Alive;
        match self.members.entry(member.name.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(MemberRecord::new(member));
            }
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if record.member.state == MemberState::Left
                    && member.incarnation <= record.member.incarnation
                {
                    return;
                }
                member.incarnation = member.incarnation.max(record.member.incarnation);
                if record.member.state != MemberState::Alive {
                    record.since = Instant::now();
                }
                record.member = member;
            }
        }
    }

    /// A probe to `name` succeeded.
    pub(crate) fn confirm_alive(&self, name: &str) -> bool {
        self.transition(name, MemberState::Suspect, MemberState::Alive)
    }

    /// A probe to `name` failed. Returns true when it was alive until now.
    pub(crate) fn suspect(&self, name: &str) -> bool {
        self.transition(name, MemberState::Alive, MemberState::Suspect)
    }

    /// Declare dead every suspect that has not refuted within `timeout`.
    pub(crate) fn reap_suspects(&self, timeout: Duration) -> Vec<String> {
        let mut reaped = Vec::new();
        for mut record in self.members.iter_mut() {
            if record.member.state == MemberState::Suspect && record.since.elapsed() >= timeout {
                record.member.state = MemberState::Dead;
                record.since = Instant::now();
                reaped.push(record.member.name.clone());
            }
        }
        reaped
    }

    /// A peer announced it is leaving.
    pub(crate) fn mark_left(&self, name: &str, incarnation: u64) -> bool {
        if name == self.local_name {
            return false;
        }
        match self.members.get_mut(name) {
            Some(mut record) if incarnation >= record.member.incarnation => {
                record.member.incarnation = incarnation;
                record.member.state = MemberState::Left;
                record.since = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Mark the local node as leaving, returning its final record.
    pub(crate) fn leave_local(&self) -> Member {
        if let Some(mut record) = self.members.get_mut(&self.local_name) {
            record.member.incarnation += 1;
            record.member.state = MemberState::Left;
            record.since = Instant::now();
        }
        self.local()
    }

    fn refute(&self, claim: &Member) -> MergeOutcome {
        let Some(mut record) = self.members.get_mut(&self.local_name) else {
            return MergeOutcome::Ignored;
        };
        let local = &mut record.member;
        if local.state != MemberState::Alive
            || claim.state == MemberState::Alive
            || claim.incarnation < local.incarnation
        {
            return MergeOutcome::Ignored;
        }
        local.incarnation = claim.incarnation + 1;
        MergeOutcome::Refuted
    }

    fn transition(&self, name: &str, from: MemberState, to: MemberState) -> bool {
        match self.members.get_mut(name) {
            Some(mut record) if record.member.state == from => {
                record.member.state = to;
                record.since = Instant::now();
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn member(name: &str, incarnation: u64, state: MemberState) -> Member {
        Member {
            name: name.to_string(),
            addr: format!("127.0.0.1:{}", 7900 + incarnation),
            meta: Vec::new(),
            incarnation,
            state,
        }
    }

    fn table() -> MemberTable {
        MemberTable::new(member("local", 0, MemberState::Alive))
    }

    #[test]
    fn unknown_members_are_inserted() {
        let table = table();
        assert_eq!(
            table.merge(member("peer", 0, MemberState::Alive)),
            MergeOutcome::Inserted
        );
        assert_eq!(table.peers().len(), 1);
        assert_eq!(table.active().len(), 2);
    }

    #[test]
    fn higher_incarnation_wins() {
        let table = table();
        table.merge(member("peer", 2, MemberState::Suspect));

        assert_eq!(
            table.merge(member("peer", 1, MemberState::Alive)),
            MergeOutcome::Ignored
        );
        assert_eq!(
            table.merge(member("peer", 3, MemberState::Alive)),
            MergeOutcome::Updated
        );
        assert_eq!(table.get("peer").unwrap().state, MemberState::Alive);
        assert_eq!(table.get("peer").unwrap().incarnation, 3);
    }

    #[test]
    fn equal_incarnation_takes_more_severe_state() {
        let table = table();
        table.merge(member("peer", 1, MemberState::Alive));

        assert_eq!(
            table.merge(member("peer", 1, MemberState::Dead)),
            MergeOutcome::Updated
        );
        assert_eq!(
            table.merge(member("peer", 1, MemberState::Suspect)),
            MergeOutcome::Ignored
        );
        assert_eq!(table.get("peer").unwrap().state, MemberState::Dead);
        assert!(table.peers().is_empty(), "dead members are not active");
    }

    #[test]
    fn suspicion_of_local_node_is_refuted() {
        let table = table();

        assert_eq!(
            table.merge(member("local", 4, MemberState::Suspect)),
            MergeOutcome::Refuted
        );
        let local = table.local();
        assert_eq!(local.state, MemberState::Alive);
        assert_eq!(local.incarnation, 5);

        assert_eq!(
            table.merge(member("local", 2, MemberState::Dead)),
            MergeOutcome::Ignored,
            "stale claims are not refuted again"
        );
    }

    #[test]
    fn suspects_are_reaped_after_timeout() {
        let table = table();
        table.merge(member("peer", 0, MemberState::Alive));

        assert!(table.suspect("peer"));
        assert!(!table.suspect("peer"), "already suspect");
        assert_eq!(table.active().len(), 2, "suspects are still members");
        assert!(table.alive_peers().is_empty());
        assert!(table.reap_suspects(Duration::from_secs(60)).is_empty());

        assert_eq!(table.reap_suspects(Duration::ZERO), vec!["peer".to_string()]);
        assert_eq!(table.get("peer").unwrap().state, MemberState::Dead);
        assert!(!table.confirm_alive("peer"), "dead members stay dead");
    }

    #[test]
    fn direct_contact_revives_member() {
        let table = table();
        table.merge(member("peer", 3, MemberState::Dead));

        table.observe_alive(member("peer", 0, MemberState::Alive));
        let peer = table.get("peer").unwrap();
        assert_eq!(peer.state, MemberState::Alive);
        assert_eq!(peer.incarnation, 3);
        assert_eq!(table.alive_peers().len(), 1);
    }

    #[test]
    fn late_contact_does_not_revive_left_member() {
        let table = table();
        table.merge(member("peer", 0, MemberState::Alive));
        assert!(table.mark_left("peer", 1));

        table.observe_alive(member("peer", 0, MemberState::Alive));
        table.observe_alive(member("peer", 1, MemberState::Alive));
        let peer = table.get("peer").unwrap();
        assert_eq!(peer.state, MemberState::Left);
        assert_eq!(peer.incarnation, 1);
        assert!(table.peers().is_empty());

        // Rejoining after a restart comes with a newer incarnation.
        table.observe_alive(member("peer", 2, MemberState::Alive));
        assert_eq!(table.get("peer").unwrap().state, MemberState::Alive);
        assert_eq!(table.alive_peers().len(), 1);
    }

    #[test]
    fn leaving_bumps_incarnation() {
        let table = table();
        table.merge(member("peer", 1, MemberState::Alive));

        assert!(table.mark_left("peer", 2));
        assert_eq!(table.get("peer").unwrap().state, MemberState::Left);

        let local = table.leave_local();
        assert_eq!(local.state, MemberState::Left);
        assert_eq!(local.incarnation, 1);
        assert!(table.active().is_empty());
    }

    #[test]
    fn proto_round_trip_keeps_state() {
        let sent = member("peer", 7, MemberState::Suspect);
        let wire: pb::Member = sent.clone().into();
        assert_eq!(wire.state(), pb::MemberState::Suspect);
        assert_eq!(Member::from(wire), sent);
    }
}
