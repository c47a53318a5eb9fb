//! Group views: consistent snapshots of membership in the virtually
//! synchronous sequence.

use crate::constants::MAX_NODES;
use crate::{ProtoError, SegmentId, Seqno, Uuid, WireRead, WireWrite};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ViewType {
    None = 0,
    /// Transitional view: agreed cut of the old membership.
    Trans = 1,
    /// Regular view: the new full membership.
    Reg = 2,
    NonPrim = 3,
    Prim = 4,
}

impl ViewType {
    pub fn from_u8(value: u8) -> Result<Self, ProtoError> {
        match value {
            0 => Ok(ViewType::None),
            1 => Ok(ViewType::Trans),
            2 => Ok(ViewType::Reg),
            3 => Ok(ViewType::NonPrim),
            4 => Ok(ViewType::Prim),
            _ => Err(ProtoError::InvalidDiscriminant {
                what: "ViewType",
                value: value as u64,
            }),
        }
    }
}

/// Identity of a view: the representative that installed it, its position in
/// the sequence and the view type. Ordered by seq, then representative, then
/// type (TRANS sorts before REG).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewId {
    view_type: ViewType,
    uuid: Uuid,
    seq: u32,
}

impl ViewId {
    pub fn new(view_type: ViewType, uuid: Uuid, seq: u32) -> Self {
        ViewId {
            view_type,
            uuid,
            seq,
        }
    }

    pub fn nil() -> Self {
        ViewId {
            view_type: ViewType::None,
            uuid: Uuid::nil(),
            seq: 0,
        }
    }

    pub fn view_type(&self) -> ViewType {
        self.view_type
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn write(&self, w: &mut WireWrite<'_>) {
        self.uuid.write(w);
        w.put_u32(self.seq);
        w.put_u8(self.view_type as u8);
    }

    pub fn read(r: &mut WireRead<'_>) -> Result<Self, ProtoError> {
        let uuid = Uuid::read(r)?;
        let seq = r.get_u32()?;
        let view_type = ViewType::from_u8(r.get_u8()?)?;
        Ok(ViewId {
            view_type,
            uuid,
            seq,
        })
    }

    pub const fn wire_size() -> usize {
        Uuid::wire_size() + 4 + 1
    }
}

impl Ord for ViewId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.seq
            .cmp(&other.seq)
            .then(self.uuid.cmp(&other.uuid))
            .then((self.view_type as u8).cmp(&(other.view_type as u8)))
    }
}

impl PartialOrd for ViewId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = match self.view_type {
            ViewType::None => "none",
            ViewType::Trans => "trans",
            ViewType::Reg => "reg",
            ViewType::NonPrim => "non-prim",
            ViewType::Prim => "prim",
        };
        write!(f, "view({t},{},{})", self.uuid, self.seq)
    }
}

impl fmt::Debug for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Per-member payload in a view: the symbolic name and network segment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Member {
    pub name: String,
    pub segment: SegmentId,
}

/// A membership snapshot delivered to the application. `members` is the new
/// membership; `joined`, `left` and `partitioned` describe the delta from
/// the previous view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    id: ViewId,
    members: BTreeMap<Uuid, Member>,
    joined: BTreeMap<Uuid, Member>,
    left: BTreeMap<Uuid, Member>,
    partitioned: BTreeMap<Uuid, Member>,
}

impl View {
    pub fn new(id: ViewId) -> Self {
        View {
            id,
            members: BTreeMap::new(),
            joined: BTreeMap::new(),
            left: BTreeMap::new(),
            partitioned: BTreeMap::new(),
        }
    }

    /// The distinguished final view delivered to a node that left the group.
    pub fn empty() -> Self {
        View::new(ViewId::nil())
    }

    pub fn id(&self) -> ViewId {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn add_member(&mut self, uuid: Uuid, member: Member) {
        self.members.insert(uuid, member);
    }

    pub fn add_joined(&mut self, uuid: Uuid, member: Member) {
        self.joined.insert(uuid, member);
    }

    pub fn add_left(&mut self, uuid: Uuid, member: Member) {
        self.left.insert(uuid, member);
    }

    pub fn add_partitioned(&mut self, uuid: Uuid, member: Member) {
        self.partitioned.insert(uuid, member);
    }

    pub fn members(&self) -> &BTreeMap<Uuid, Member> {
        &self.members
    }

    pub fn joined(&self) -> &BTreeMap<Uuid, Member> {
        &self.joined
    }

    pub fn left(&self) -> &BTreeMap<Uuid, Member> {
        &self.left
    }

    pub fn partitioned(&self) -> &BTreeMap<Uuid, Member> {
        &self.partitioned
    }

    pub fn is_member(&self, uuid: Uuid) -> bool {
        self.members.contains_key(&uuid)
    }

    /// Lowest member identity; the INSTALL sender for this view.
    pub fn representative(&self) -> Option<Uuid> {
        self.members.keys().next().copied()
    }

    fn write_node_map(map: &BTreeMap<Uuid, Member>, w: &mut WireWrite<'_>) -> Result<(), ProtoError> {
        w.put_u16(map.len() as u16);
        for (uuid, member) in map {
            uuid.write(w);
            w.put_u8(member.segment);
            w.put_cstr(&member.name)?;
        }
        Ok(())
    }

    fn read_node_map(r: &mut WireRead<'_>) -> Result<BTreeMap<Uuid, Member>, ProtoError> {
        let n = r.get_u16()? as usize;
        if n > MAX_NODES {
            return Err(ProtoError::InvalidDiscriminant {
                what: "node map length",
                value: n as u64,
            });
        }
        let mut map = BTreeMap::new();
        for _ in 0..n {
            let uuid = Uuid::read(r)?;
            let segment = r.get_u8()?;
            let name = r.get_cstr()?.to_owned();
            map.insert(uuid, Member { name, segment });
        }
        Ok(map)
    }

    pub fn write(&self, w: &mut WireWrite<'_>) -> Result<(), ProtoError> {
        self.id.write(w);
        Self::write_node_map(&self.members, w)?;
        Self::write_node_map(&self.joined, w)?;
        Self::write_node_map(&self.left, w)?;
        Self::write_node_map(&self.partitioned, w)?;
        Ok(())
    }

    pub fn read(r: &mut WireRead<'_>) -> Result<Self, ProtoError> {
        let id = ViewId::read(r)?;
        let members = Self::read_node_map(r)?;
        let joined = Self::read_node_map(r)?;
        let left = Self::read_node_map(r)?;
        let partitioned = Self::read_node_map(r)?;
        Ok(View {
            id,
            members,
            joined,
            left,
            partitioned,
        })
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {{", self.id)?;
        for (i, uuid) in self.members.keys().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{uuid}")?;
        }
        write!(f, "}}")
    }
}

/// A primary-component decision snapshot paired with a view, as handed to
/// the application in a CONF_CHANGE item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub view: View,
    pub primary: bool,
    pub my_index: Option<usize>,
    pub group_uuid: Uuid,
    pub act_seqno: Seqno,
    pub prim_seqno: Seqno,
}
