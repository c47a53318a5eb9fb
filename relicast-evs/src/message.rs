//! Typed EVS messages and their wire codec.
//!
//! Every datagram starts with a 4-byte common header:
//!
//! ```text
//! byte 0: version (low 4 bits) | message type (high 4 bits)
//! byte 1: safety prefix
//! byte 2: seq range (aggregation count, 0 for a single message)
//! byte 3: flags
//! ```
//!
//! followed by the 16-byte source identity when `F_SOURCE` is set, then the
//! per-type body. Multi-byte integers are little-endian.

use crate::EvsError;
use relicast_proto::constants::{EVS_PROTO_VERSION, MAX_NODES};
use relicast_proto::{
    ProtoError, Range, SafetyPrefix, SegmentId, Seqno, Uuid, ViewId, WireRead, WireWrite,
};
use std::collections::BTreeMap;
use std::fmt;

/// Sender has more messages queued right behind this one.
pub const F_MSG_MORE: u8 = 0x1;
/// Message is a retransmission.
pub const F_RETRANS: u8 = 0x2;
/// Source identity embedded in the header (transport did not provide it).
pub const F_SOURCE: u8 = 0x4;
/// Gap message acknowledges commitment to a proposed install.
pub const F_COMMIT: u8 = 0x8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    User = 1,
    Delegate = 2,
    Gap = 3,
    Join = 4,
    Install = 5,
    Leave = 6,
    DelayedList = 7,
}

impl MessageType {
    fn from_u8(value: u8) -> Result<Self, ProtoError> {
        match value {
            1 => Ok(MessageType::User),
            2 => Ok(MessageType::Delegate),
            3 => Ok(MessageType::Gap),
            4 => Ok(MessageType::Join),
            5 => Ok(MessageType::Install),
            6 => Ok(MessageType::Leave),
            7 => Ok(MessageType::DelayedList),
            _ => Err(ProtoError::InvalidDiscriminant {
                what: "MessageType",
                value: value as u64,
            }),
        }
    }
}

/// One entry of a membership message node list: the sender's knowledge of a
/// single peer at the time the message was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageNode {
    pub operational: bool,
    /// Announced a voluntary leave. Kept apart from `leave_seq`: a leaver
    /// that never sent carries a NONE leave seqno but still leaves.
    pub leaving: bool,
    pub suspected: bool,
    pub evicted: bool,
    pub segment: SegmentId,
    /// Seqno from the peer's LEAVE message, NONE unless the peer is leaving.
    pub leave_seq: Seqno,
    /// Current view as seen by the peer.
    pub view_id: ViewId,
    /// Safe seqno of the peer's stream as seen by the sender.
    pub safe_seq: Seqno,
    /// Input map range of the peer's stream as seen by the sender.
    pub im_range: Range,
}

impl MessageNode {
    pub fn leaving(&self) -> bool {
        self.leaving
    }

    /// Equality for consensus purposes: transient local judgements
    /// (suspicion) and static labels (segment) are excluded; two nodes must
    /// agree on status, view and stream position only.
    pub fn consensus_eq(&self, other: &MessageNode) -> bool {
        self.operational == other.operational
            && self.leaving == other.leaving
            && self.leave_seq == other.leave_seq
            && self.view_id == other.view_id
            && self.safe_seq == other.safe_seq
            && self.im_range == other.im_range
    }

    const NF_OPERATIONAL: u8 = 0x1;
    const NF_SUSPECTED: u8 = 0x2;
    const NF_EVICTED: u8 = 0x4;
    const NF_LEAVING: u8 = 0x8;

    fn write(&self, uuid: &Uuid, w: &mut WireWrite<'_>) {
        uuid.write(w);
        let mut flags = 0u8;
        if self.operational {
            flags |= Self::NF_OPERATIONAL;
        }
        if self.suspected {
            flags |= Self::NF_SUSPECTED;
        }
        if self.evicted {
            flags |= Self::NF_EVICTED;
        }
        if self.leaving {
            flags |= Self::NF_LEAVING;
        }
        w.put_u8(flags);
        w.put_u8(self.segment);
        self.leave_seq.write(w);
        self.view_id.write(w);
        self.safe_seq.write(w);
        self.im_range.write(w);
    }

    fn read(r: &mut WireRead<'_>) -> Result<(Uuid, Self), ProtoError> {
        let uuid = Uuid::read(r)?;
        let flags = r.get_u8()?;
        let segment = r.get_u8()?;
        let leave_seq = Seqno::read(r)?;
        let view_id = ViewId::read(r)?;
        let safe_seq = Seqno::read(r)?;
        let im_range = Range::read(r)?;
        Ok((
            uuid,
            MessageNode {
                operational: flags & Self::NF_OPERATIONAL != 0,
                leaving: flags & Self::NF_LEAVING != 0,
                suspected: flags & Self::NF_SUSPECTED != 0,
                evicted: flags & Self::NF_EVICTED != 0,
                segment,
                leave_seq,
                view_id,
                safe_seq,
                im_range,
            },
        ))
    }
}

pub type MessageNodeList = BTreeMap<Uuid, MessageNode>;

fn write_node_list(list: &MessageNodeList, w: &mut WireWrite<'_>) {
    w.put_u16(list.len() as u16);
    for (uuid, node) in list {
        node.write(uuid, w);
    }
}

fn read_node_list(r: &mut WireRead<'_>) -> Result<MessageNodeList, ProtoError> {
    let n = r.get_u16()? as usize;
    if n > MAX_NODES {
        return Err(ProtoError::InvalidDiscriminant {
            what: "node list length",
            value: n as u64,
        });
    }
    let mut list = MessageNodeList::new();
    for _ in 0..n {
        let (uuid, node) = MessageNode::read(r)?;
        list.insert(uuid, node);
    }
    Ok(list)
}

/// User payload carrier. The payload itself travels alongside, not inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserMessage {
    pub source: Uuid,
    pub source_view_id: ViewId,
    pub seq: Seqno,
    pub seq_range: u8,
    pub aru_seq: Seqno,
    pub safety_prefix: SafetyPrefix,
    pub user_type: u8,
    pub flags: u8,
}

/// A message resent on behalf of a third node; the inner bytes are a full
/// serialized message from the original sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegateMessage {
    pub source: Uuid,
    pub source_view_id: ViewId,
    pub flags: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapMessage {
    pub source: Uuid,
    pub source_view_id: ViewId,
    pub seq: Seqno,
    pub aru_seq: Seqno,
    /// Stream whose retransmission is requested, nil when not a request.
    pub range_uuid: Uuid,
    pub range: Range,
    pub flags: u8,
}

impl GapMessage {
    pub fn is_commit(&self) -> bool {
        self.flags & F_COMMIT != 0
    }
}

/// JOIN and INSTALL share this shape; INSTALL additionally proposes the new
/// view identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipMessage {
    pub msg_type: MessageType,
    pub source: Uuid,
    pub source_view_id: ViewId,
    /// Safe seqno of the sender's input map.
    pub seq: Seqno,
    pub aru_seq: Seqno,
    pub fifo_seq: i64,
    /// Proposed view, only meaningful for INSTALL.
    pub install_view_id: ViewId,
    pub node_list: MessageNodeList,
    pub flags: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveMessage {
    pub source: Uuid,
    pub source_view_id: ViewId,
    /// Highest seqno the leaver has sent; messages up to it stay deliverable.
    pub seq: Seqno,
    pub aru_seq: Seqno,
    pub fifo_seq: i64,
    pub flags: u8,
}

/// Periodic report of chronically delayed peers, input of auto-eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedListMessage {
    pub source: Uuid,
    pub source_view_id: ViewId,
    pub fifo_seq: i64,
    pub delayed: BTreeMap<Uuid, u8>,
    pub flags: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    User(UserMessage),
    Delegate(DelegateMessage),
    Gap(GapMessage),
    Join(MembershipMessage),
    Install(MembershipMessage),
    Leave(LeaveMessage),
    DelayedList(DelayedListMessage),
}

impl Message {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::User(_) => MessageType::User,
            Message::Delegate(_) => MessageType::Delegate,
            Message::Gap(_) => MessageType::Gap,
            Message::Join(_) => MessageType::Join,
            Message::Install(_) => MessageType::Install,
            Message::Leave(_) => MessageType::Leave,
            Message::DelayedList(_) => MessageType::DelayedList,
        }
    }

    pub fn is_membership(&self) -> bool {
        matches!(
            self,
            Message::Join(_) | Message::Install(_) | Message::Leave(_) | Message::DelayedList(_)
        )
    }

    pub fn source(&self) -> Uuid {
        match self {
            Message::User(m) => m.source,
            Message::Delegate(m) => m.source,
            Message::Gap(m) => m.source,
            Message::Join(m) | Message::Install(m) => m.source,
            Message::Leave(m) => m.source,
            Message::DelayedList(m) => m.source,
        }
    }

    pub fn source_view_id(&self) -> ViewId {
        match self {
            Message::User(m) => m.source_view_id,
            Message::Delegate(m) => m.source_view_id,
            Message::Gap(m) => m.source_view_id,
            Message::Join(m) | Message::Install(m) => m.source_view_id,
            Message::Leave(m) => m.source_view_id,
            Message::DelayedList(m) => m.source_view_id,
        }
    }

    pub fn fifo_seq(&self) -> Option<i64> {
        match self {
            Message::Join(m) | Message::Install(m) => Some(m.fifo_seq),
            Message::Leave(m) => Some(m.fifo_seq),
            Message::DelayedList(m) => Some(m.fifo_seq),
            _ => None,
        }
    }

    pub fn flags(&self) -> u8 {
        match self {
            Message::User(m) => m.flags,
            Message::Delegate(m) => m.flags,
            Message::Gap(m) => m.flags,
            Message::Join(m) | Message::Install(m) => m.flags,
            Message::Leave(m) => m.flags,
            Message::DelayedList(m) => m.flags,
        }
    }

    /// Serialize header and body. The caller appends the payload (USER and
    /// DELEGATE) right after.
    pub fn write(&self, buf: &mut Vec<u8>) -> Result<(), ProtoError> {
        let mut w = WireWrite::new(buf);
        let (safety, seq_range) = match self {
            Message::User(m) => (m.safety_prefix as u8, m.seq_range),
            _ => (SafetyPrefix::Unreliable as u8, 0),
        };
        w.put_u8(EVS_PROTO_VERSION | (self.msg_type() as u8) << 4);
        w.put_u8(safety);
        w.put_u8(seq_range);
        w.put_u8(self.flags() | F_SOURCE);
        self.source().write(&mut w);

        match self {
            Message::User(m) => {
                w.put_u8(m.user_type);
                m.seq.write(&mut w);
                m.aru_seq.write(&mut w);
                m.source_view_id.write(&mut w);
            }
            Message::Delegate(m) => {
                m.source_view_id.write(&mut w);
            }
            Message::Gap(m) => {
                m.seq.write(&mut w);
                m.aru_seq.write(&mut w);
                m.source_view_id.write(&mut w);
                m.range_uuid.write(&mut w);
                m.range.write(&mut w);
            }
            Message::Join(m) | Message::Install(m) => {
                m.seq.write(&mut w);
                m.aru_seq.write(&mut w);
                w.put_i64(m.fifo_seq);
                m.source_view_id.write(&mut w);
                if m.msg_type == MessageType::Install {
                    m.install_view_id.write(&mut w);
                }
                write_node_list(&m.node_list, &mut w);
            }
            Message::Leave(m) => {
                m.seq.write(&mut w);
                m.aru_seq.write(&mut w);
                w.put_i64(m.fifo_seq);
                m.source_view_id.write(&mut w);
            }
            Message::DelayedList(m) => {
                w.put_i64(m.fifo_seq);
                m.source_view_id.write(&mut w);
                w.put_u16(m.delayed.len() as u16);
                for (uuid, cnt) in &m.delayed {
                    uuid.write(&mut w);
                    w.put_u8(*cnt);
                }
            }
        }
        Ok(())
    }

    /// Parse one message; returns the message and the offset where the
    /// payload begins. `transport_source` supplies the sender identity when
    /// the header does not embed one.
    pub fn read(buf: &[u8], transport_source: Option<Uuid>) -> Result<(Message, usize), EvsError> {
        let mut r = WireRead::new(buf);
        let b0 = r.get_u8().map_err(EvsError::from)?;
        let version = b0 & 0x0f;
        if version != EVS_PROTO_VERSION {
            return Err(EvsError::Codec(ProtoError::UnsupportedVersion(version)));
        }
        let msg_type = MessageType::from_u8(b0 >> 4)?;
        let safety = SafetyPrefix::from_u8(r.get_u8()?)?;
        let seq_range = r.get_u8()?;
        let flags = r.get_u8()?;
        let source = if flags & F_SOURCE != 0 {
            Uuid::read(&mut r)?
        } else {
            transport_source.ok_or_else(|| {
                EvsError::Protocol("message without source and no transport sender".into())
            })?
        };

        let msg = match msg_type {
            MessageType::User => {
                let user_type = r.get_u8()?;
                let seq = Seqno::read(&mut r)?;
                let aru_seq = Seqno::read(&mut r)?;
                let source_view_id = ViewId::read(&mut r)?;
                Message::User(UserMessage {
                    source,
                    source_view_id,
                    seq,
                    seq_range,
                    aru_seq,
                    safety_prefix: safety,
                    user_type,
                    flags,
                })
            }
            MessageType::Delegate => {
                let source_view_id = ViewId::read(&mut r)?;
                Message::Delegate(DelegateMessage {
                    source,
                    source_view_id,
                    flags,
                })
            }
            MessageType::Gap => {
                let seq = Seqno::read(&mut r)?;
                let aru_seq = Seqno::read(&mut r)?;
                let source_view_id = ViewId::read(&mut r)?;
                let range_uuid = Uuid::read(&mut r)?;
                let range = Range::read(&mut r)?;
                Message::Gap(GapMessage {
                    source,
                    source_view_id,
                    seq,
                    aru_seq,
                    range_uuid,
                    range,
                    flags,
                })
            }
            MessageType::Join | MessageType::Install => {
                let seq = Seqno::read(&mut r)?;
                let aru_seq = Seqno::read(&mut r)?;
                let fifo_seq = r.get_i64()?;
                let source_view_id = ViewId::read(&mut r)?;
                let install_view_id = if msg_type == MessageType::Install {
                    ViewId::read(&mut r)?
                } else {
                    ViewId::nil()
                };
                let node_list = read_node_list(&mut r)?;
                let m = MembershipMessage {
                    msg_type,
                    source,
                    source_view_id,
                    seq,
                    aru_seq,
                    fifo_seq,
                    install_view_id,
                    node_list,
                    flags,
                };
                if msg_type == MessageType::Join {
                    Message::Join(m)
                } else {
                    Message::Install(m)
                }
            }
            MessageType::Leave => {
                let seq = Seqno::read(&mut r)?;
                let aru_seq = Seqno::read(&mut r)?;
                let fifo_seq = r.get_i64()?;
                let source_view_id = ViewId::read(&mut r)?;
                Message::Leave(LeaveMessage {
                    source,
                    source_view_id,
                    seq,
                    aru_seq,
                    fifo_seq,
                    flags,
                })
            }
            MessageType::DelayedList => {
                let fifo_seq = r.get_i64()?;
                let source_view_id = ViewId::read(&mut r)?;
                let n = r.get_u16()? as usize;
                if n > MAX_NODES {
                    return Err(EvsError::Protocol(format!("delayed list of {n} entries")));
                }
                let mut delayed = BTreeMap::new();
                for _ in 0..n {
                    let uuid = Uuid::read(&mut r)?;
                    let cnt = r.get_u8()?;
                    delayed.insert(uuid, cnt);
                }
                Message::DelayedList(DelayedListMessage {
                    source,
                    source_view_id,
                    fifo_seq,
                    delayed,
                    flags,
                })
            }
        };
        Ok((msg, r.position()))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::User(m) => write!(
                f,
                "user(src {}, view {}, seq {}, aru {})",
                m.source, m.source_view_id, m.seq, m.aru_seq
            ),
            Message::Delegate(m) => write!(f, "delegate(src {})", m.source),
            Message::Gap(m) => write!(
                f,
                "gap(src {}, aru {}, req {} {}{})",
                m.source,
                m.aru_seq,
                m.range_uuid,
                m.range,
                if m.is_commit() { ", commit" } else { "" }
            ),
            Message::Join(m) => write!(
                f,
                "join(src {}, view {}, seq {}, aru {}, fifo {}, {} nodes)",
                m.source,
                m.source_view_id,
                m.seq,
                m.aru_seq,
                m.fifo_seq,
                m.node_list.len()
            ),
            Message::Install(m) => write!(
                f,
                "install(src {}, view {} -> {}, seq {}, aru {}, {} nodes)",
                m.source,
                m.source_view_id,
                m.install_view_id,
                m.seq,
                m.aru_seq,
                m.node_list.len()
            ),
            Message::Leave(m) => write!(
                f,
                "leave(src {}, view {}, seq {})",
                m.source, m.source_view_id, m.seq
            ),
            Message::DelayedList(m) => {
                write!(f, "delayed-list(src {}, {} entries)", m.source, m.delayed.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relicast_proto::ViewType;

    fn uuid(b: u8) -> Uuid {
        let mut bytes = [0u8; 16];
        bytes[15] = b;
        Uuid::from_bytes(bytes)
    }

    fn view_id(b: u8, seq: u32) -> ViewId {
        ViewId::new(ViewType::Reg, uuid(b), seq)
    }

    #[test]
    fn user_roundtrip_with_payload_offset() {
        let msg = Message::User(UserMessage {
            source: uuid(1),
            source_view_id: view_id(1, 7),
            seq: Seqno(42),
            seq_range: 0,
            aru_seq: Seqno(40),
            safety_prefix: SafetyPrefix::Safe,
            user_type: 3,
            flags: F_MSG_MORE,
        });
        let mut buf = Vec::new();
        msg.write(&mut buf).unwrap();
        buf.extend_from_slice(b"payload");

        let (got, offset) = Message::read(&buf, None).unwrap();
        assert_eq!(&buf[offset..], b"payload");
        match got {
            Message::User(u) => {
                assert_eq!(u.seq, Seqno(42));
                assert_eq!(u.aru_seq, Seqno(40));
                assert_eq!(u.safety_prefix, SafetyPrefix::Safe);
                assert_eq!(u.user_type, 3);
                assert!(u.flags & F_MSG_MORE != 0);
                assert_eq!(u.source, uuid(1));
            }
            other => panic!("wrong type: {other}"),
        }
    }

    #[test]
    fn join_roundtrip_with_node_list() {
        let mut node_list = MessageNodeList::new();
        node_list.insert(
            uuid(1),
            MessageNode {
                operational: true,
                leaving: false,
                suspected: false,
                evicted: false,
                segment: 0,
                leave_seq: Seqno::NONE,
                view_id: view_id(1, 7),
                safe_seq: Seqno(10),
                im_range: Range::new(Seqno(11), Seqno(15)),
            },
        );
        node_list.insert(
            uuid(2),
            MessageNode {
                operational: false,
                leaving: true,
                suspected: true,
                evicted: false,
                segment: 1,
                leave_seq: Seqno(9),
                view_id: view_id(1, 7),
                safe_seq: Seqno(8),
                im_range: Range::new(Seqno(9), Seqno(9)),
            },
        );
        let msg = Message::Join(MembershipMessage {
            msg_type: MessageType::Join,
            source: uuid(1),
            source_view_id: view_id(1, 7),
            seq: Seqno(10),
            aru_seq: Seqno(10),
            fifo_seq: 33,
            install_view_id: ViewId::nil(),
            node_list: node_list.clone(),
            flags: 0,
        });

        let mut buf = Vec::new();
        msg.write(&mut buf).unwrap();
        let (got, offset) = Message::read(&buf, None).unwrap();
        assert_eq!(offset, buf.len());
        match got {
            Message::Join(j) => {
                assert_eq!(j.node_list, node_list);
                assert_eq!(j.fifo_seq, 33);
            }
            other => panic!("wrong type: {other}"),
        }
    }

    #[test]
    fn truncated_message_is_a_codec_error() {
        let msg = Message::Leave(LeaveMessage {
            source: uuid(1),
            source_view_id: view_id(1, 1),
            seq: Seqno(5),
            aru_seq: Seqno(5),
            fifo_seq: 2,
            flags: 0,
        });
        let mut buf = Vec::new();
        msg.write(&mut buf).unwrap();
        for len in 1..buf.len() - 1 {
            assert!(Message::read(&buf[..len], None).is_err());
        }
    }
}
