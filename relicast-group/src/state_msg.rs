//! State messages and the primary-component quorum computation.
//!
//! After every primary view installation each member broadcasts its
//! `StateMessage`; once one message per member is collected, every node
//! independently computes the same quorum decision from the vector.

use crate::GroupError;
use relicast_proto::{ProtoError, Seqno, Uuid, WireRead, WireWrite};
use std::fmt;
use tracing::{info, warn};

/// Replication state of a member. `Donor`, `Joined` and `Synced` imply a
/// complete database state ("joined" in the quorum sense).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum NodeState {
    NonPrim = 0,
    Prim = 1,
    Joiner = 2,
    Donor = 3,
    Joined = 4,
    Synced = 5,
}

impl NodeState {
    pub fn from_u8(value: u8) -> Result<Self, ProtoError> {
        match value {
            0 => Ok(NodeState::NonPrim),
            1 => Ok(NodeState::Prim),
            2 => Ok(NodeState::Joiner),
            3 => Ok(NodeState::Donor),
            4 => Ok(NodeState::Joined),
            5 => Ok(NodeState::Synced),
            _ => Err(ProtoError::InvalidDiscriminant {
                what: "NodeState",
                value: value as u64,
            }),
        }
    }

    /// Has this node ever held complete state?
    pub fn is_joined(&self) -> bool {
        matches!(self, NodeState::Donor | NodeState::Joined | NodeState::Synced)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::NonPrim => "non-prim",
            NodeState::Prim => "prim",
            NodeState::Joiner => "joiner",
            NodeState::Donor => "donor",
            NodeState::Joined => "joined",
            NodeState::Synced => "synced",
        };
        f.write_str(s)
    }
}

/// One member's view of the world, exchanged after each component change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMessage {
    /// Identity of this exchange round.
    pub state_uuid: Uuid,
    /// Identity of the logical cluster history this node carries.
    pub group_uuid: Uuid,
    /// Identity of the last primary component this node was part of.
    pub prim_uuid: Uuid,
    /// Member count of that primary component.
    pub prim_joined: i16,
    /// Seqno of that primary component.
    pub prim_seqno: Seqno,
    /// Highest applied action seqno.
    pub act_seqno: Seqno,
    /// State held while that primary component existed.
    pub prim_state: NodeState,
    pub current_state: NodeState,
    pub name: String,
    pub incoming_addr: String,
    /// Supported protocol range.
    pub proto_min: u8,
    pub proto_max: u8,
    pub flags: u8,
}

const STATE_MSG_VERSION: u8 = 0;

impl StateMessage {
    pub fn write(&self, buf: &mut Vec<u8>) -> Result<(), ProtoError> {
        let mut w = WireWrite::new(buf);
        w.put_u8(STATE_MSG_VERSION);
        w.put_u8(self.flags);
        w.put_u8(self.proto_min);
        w.put_u8(self.proto_max);
        w.put_u8(self.prim_state as u8);
        w.put_u8(self.current_state as u8);
        w.put_i16(self.prim_joined);
        self.state_uuid.write(&mut w);
        self.group_uuid.write(&mut w);
        self.prim_uuid.write(&mut w);
        self.act_seqno.write(&mut w);
        self.prim_seqno.write(&mut w);
        w.put_cstr(&self.name)?;
        w.put_cstr(&self.incoming_addr)?;
        Ok(())
    }

    pub fn read(buf: &[u8]) -> Result<Self, ProtoError> {
        let mut r = WireRead::new(buf);
        let version = r.get_u8()?;
        if version != STATE_MSG_VERSION {
            return Err(ProtoError::UnsupportedVersion(version));
        }
        let flags = r.get_u8()?;
        let proto_min = r.get_u8()?;
        let proto_max = r.get_u8()?;
        let prim_state = NodeState::from_u8(r.get_u8()?)?;
        let current_state = NodeState::from_u8(r.get_u8()?)?;
        let prim_joined = r.get_i16()?;
        let state_uuid = Uuid::read(&mut r)?;
        let group_uuid = Uuid::read(&mut r)?;
        let prim_uuid = Uuid::read(&mut r)?;
        let act_seqno = Seqno::read(&mut r)?;
        let prim_seqno = Seqno::read(&mut r)?;
        let name = r.get_cstr()?.to_owned();
        let incoming_addr = r.get_cstr()?.to_owned();
        Ok(StateMessage {
            state_uuid,
            group_uuid,
            prim_uuid,
            prim_joined,
            prim_seqno,
            act_seqno,
            prim_state,
            current_state,
            name,
            incoming_addr,
            proto_min,
            proto_max,
            flags,
        })
    }
}

impl fmt::Display for StateMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "state(group {:?}, prim {}/{}, act {}, {}/{})",
            self.group_uuid,
            self.prim_uuid,
            self.prim_seqno,
            self.act_seqno,
            self.prim_state,
            self.current_state
        )
    }
}

/// Outcome of the quorum computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quorum {
    pub primary: bool,
    pub group_uuid: Uuid,
    pub act_seqno: Seqno,
    pub prim_seqno: Seqno,
    /// Selected protocol version, meaningful when primary.
    pub proto_ver: u8,
}

impl Quorum {
    pub fn non_primary() -> Self {
        Quorum {
            primary: false,
            group_uuid: Uuid::nil(),
            act_seqno: Seqno::NONE,
            prim_seqno: Seqno::NONE,
            proto_ver: 0,
        }
    }
}

/// Pick the more representative of two states: higher act seqno wins, ties
/// break on prim seqno.
fn more_representative<'a>(a: &'a StateMessage, b: &'a StateMessage) -> &'a StateMessage {
    if a.act_seqno != b.act_seqno {
        if a.act_seqno > b.act_seqno {
            a
        } else {
            b
        }
    } else if a.prim_seqno >= b.prim_seqno {
        a
    } else {
        b
    }
}

/// Inherit rule: find the most advanced state among members that hold
/// complete state. All such members must agree on the group identity.
fn quorum_inherit<'a>(states: &'a [StateMessage]) -> Result<Option<&'a StateMessage>, GroupError> {
    let mut rep: Option<&StateMessage> = None;
    for state in states.iter().filter(|s| s.current_state.is_joined()) {
        match rep {
            None => rep = Some(state),
            Some(prev) => {
                if prev.group_uuid != state.group_uuid {
                    // Two historically distinct clusters have been merged.
                    for s in states {
                        warn!(state = %s, "conflicting group identity");
                    }
                    return Err(GroupError::InvariantViolation(
                        "quorum impossible: conflicting group identities".into(),
                    ));
                }
                rep = Some(more_representative(prev, state));
            }
        }
    }
    if rep.is_none() {
        warn!("quorum: no node with complete state");
    }
    Ok(rep)
}

/// Remerge rule: when no joined node exists, a previous primary component
/// that has fully reassembled may continue as primary.
fn quorum_remerge(states: &[StateMessage]) -> Option<&StateMessage> {
    struct Candidate<'a> {
        prim_uuid: Uuid,
        prim_joined: i16,
        found: i16,
        rep: &'a StateMessage,
    }
    let mut candidates: Vec<Candidate<'_>> = Vec::new();
    for state in states.iter().filter(|s| s.prim_state.is_joined()) {
        debug_assert!(!state.prim_uuid.is_nil());
        match candidates
            .iter_mut()
            .find(|c| c.prim_uuid == state.prim_uuid)
        {
            Some(c) => {
                c.found += 1;
                c.rep = more_representative(c.rep, state);
            }
            None => candidates.push(Candidate {
                prim_uuid: state.prim_uuid,
                prim_joined: state.prim_joined,
                found: 1,
                rep: state,
            }),
        }
    }
    match candidates.len() {
        0 => {
            warn!("no re-merged primary component found");
            None
        }
        1 => {
            let c = &candidates[0];
            if c.found == c.prim_joined {
                info!(prim = %c.prim_uuid, members = c.found, "full re-merge of primary component");
                Some(c.rep)
            } else {
                warn!(
                    prim = %c.prim_uuid,
                    found = c.found,
                    expected = c.prim_joined,
                    "partial re-merge is not sufficient for quorum"
                );
                None
            }
        }
        _ => {
            warn!("more than one re-merge candidate; cannot pick a primary");
            None
        }
    }
}

/// Compute the quorum decision from one state message per member.
/// Rules in order: inherit from a joined node, then full remerge of a
/// previous primary component; otherwise non-primary.
pub fn compute_quorum(states: &[StateMessage]) -> Result<Quorum, GroupError> {
    let rep = match quorum_inherit(states)? {
        Some(rep) => Some(rep),
        None => quorum_remerge(states),
    };
    let rep = match rep {
        Some(rep) => rep,
        None => {
            warn!("failed to establish quorum");
            return Ok(Quorum::non_primary());
        }
    };

    // Highest commonly supported protocol: min over advertised maxima,
    // which every member must reach.
    let proto_ver = states.iter().map(|s| s.proto_max).min().unwrap_or(0);
    let proto_floor = states.iter().map(|s| s.proto_min).max().unwrap_or(0);
    if proto_ver < proto_floor {
        warn!(proto_ver, proto_floor, "no common protocol version; non-primary");
        return Ok(Quorum::non_primary());
    }

    Ok(Quorum {
        primary: true,
        group_uuid: rep.group_uuid,
        act_seqno: rep.act_seqno,
        prim_seqno: rep.prim_seqno,
        proto_ver,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(b: u8) -> Uuid {
        let mut bytes = [0u8; 16];
        bytes[0] = b;
        Uuid::from_bytes(bytes)
    }

    fn state(
        group: u8,
        prim: u8,
        prim_joined: i16,
        prim_seqno: i64,
        act_seqno: i64,
        prim_state: NodeState,
        current_state: NodeState,
    ) -> StateMessage {
        StateMessage {
            state_uuid: uuid(0xaa),
            group_uuid: uuid(group),
            prim_uuid: uuid(prim),
            prim_joined,
            prim_seqno: Seqno(prim_seqno),
            act_seqno: Seqno(act_seqno),
            prim_state,
            current_state,
            name: "n".into(),
            incoming_addr: "127.0.0.1:4567".into(),
            proto_min: 0,
            proto_max: 1,
            flags: 0,
        }
    }

    #[test]
    fn codec_roundtrip() {
        let m = state(1, 2, 3, 10, 100, NodeState::Joined, NodeState::Synced);
        let mut buf = Vec::new();
        m.write(&mut buf).unwrap();
        assert_eq!(StateMessage::read(&buf).unwrap(), m);
    }

    #[test]
    fn inherit_picks_highest_act_seqno() {
        let states = vec![
            state(1, 2, 2, 5, 90, NodeState::Joined, NodeState::Synced),
            state(1, 2, 2, 5, 100, NodeState::Joined, NodeState::Joined),
            state(1, 2, 2, 5, 95, NodeState::NonPrim, NodeState::Joiner),
        ];
        let q = compute_quorum(&states).unwrap();
        assert!(q.primary);
        assert_eq!(q.act_seqno, Seqno(100));
    }

    #[test]
    fn remerge_requires_every_member() {
        // Previous primary had 3 members; only 2 present.
        let states = vec![
            state(1, 7, 3, 5, 90, NodeState::Joined, NodeState::NonPrim),
            state(1, 7, 3, 5, 90, NodeState::Joined, NodeState::NonPrim),
        ];
        let q = compute_quorum(&states).unwrap();
        assert!(!q.primary);

        // All 3 present: remerge succeeds.
        let states = vec![
            state(1, 7, 3, 5, 90, NodeState::Joined, NodeState::NonPrim),
            state(1, 7, 3, 5, 91, NodeState::Joined, NodeState::NonPrim),
            state(1, 7, 3, 5, 90, NodeState::Joined, NodeState::NonPrim),
        ];
        let q = compute_quorum(&states).unwrap();
        assert!(q.primary);
        assert_eq!(q.act_seqno, Seqno(91));
    }

    #[test]
    fn conflicting_groups_fail() {
        let states = vec![
            state(1, 2, 1, 5, 90, NodeState::Joined, NodeState::Synced),
            state(2, 3, 1, 5, 80, NodeState::Joined, NodeState::Synced),
        ];
        assert!(compute_quorum(&states).is_err());
    }

    #[test]
    fn disjoint_proto_ranges_yield_non_primary() {
        let mut a = state(1, 2, 2, 5, 90, NodeState::Joined, NodeState::Synced);
        let mut b = state(1, 2, 2, 5, 91, NodeState::Joined, NodeState::Synced);
        a.proto_min = 0;
        a.proto_max = 1;
        b.proto_min = 2;
        b.proto_max = 3;
        let q = compute_quorum(&[a, b]).unwrap();
        assert!(!q.primary);
    }
}
