//! Direct exercises of the consensus rules over constructed state.

use relicast_evs::consensus::Consensus;
use relicast_evs::input_map::InputMap;
use relicast_evs::message::{
    MembershipMessage, MessageNode, MessageNodeList, MessageType, UserMessage,
};
use relicast_evs::node::{Node, NodeMap};
use relicast_proto::{Member, Range, SafetyPrefix, Seqno, Uuid, View, ViewId, ViewType};
use std::time::Instant;

fn uuid(b: u8) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[0] = b;
    Uuid::from_bytes(bytes)
}

fn view_id() -> ViewId {
    ViewId::new(ViewType::Reg, uuid(1), 3)
}

fn user_msg(source: Uuid, seq: i64) -> UserMessage {
    UserMessage {
        source,
        source_view_id: view_id(),
        seq: Seqno(seq),
        seq_range: 0,
        aru_seq: Seqno::NONE,
        safety_prefix: SafetyPrefix::Safe,
        user_type: 0,
        flags: 0,
    }
}

/// Two operational members, fully synchronized streams.
struct Fixture {
    known: NodeMap,
    view: View,
    input_map: InputMap,
}

impl Fixture {
    fn new() -> Self {
        let now = Instant::now();
        let mut view = View::new(view_id());
        let mut input_map = InputMap::new();
        let mut known = NodeMap::new();
        for b in [1u8, 2] {
            view.add_member(uuid(b), Member::default());
            let index = input_map.insert_sender(uuid(b)).unwrap();
            let mut node = Node::new(0, now);
            node.index = index;
            known.insert(uuid(b), node);
        }
        Fixture {
            known,
            view,
            input_map,
        }
    }

    fn node_list(&self) -> MessageNodeList {
        let mut list = MessageNodeList::new();
        for (u, node) in &self.known {
            list.insert(
                *u,
                MessageNode {
                    operational: node.operational,
                    leaving: false,
                    suspected: false,
                    evicted: false,
                    segment: 0,
                    leave_seq: Seqno::NONE,
                    view_id: view_id(),
                    safe_seq: self.input_map.sender_safe_seq(node.index),
                    im_range: self.input_map.range(node.index),
                },
            );
        }
        list
    }

    fn join_from(&self, source: Uuid, fifo_seq: i64) -> MembershipMessage {
        MembershipMessage {
            msg_type: MessageType::Join,
            source,
            source_view_id: view_id(),
            seq: self.input_map.safe_seq(),
            aru_seq: self.input_map.aru_seq(),
            fifo_seq,
            install_view_id: ViewId::nil(),
            node_list: self.node_list(),
            flags: 0,
        }
    }

    fn consensus(&self) -> Consensus<'_> {
        Consensus {
            known: &self.known,
            current_view: &self.view,
            input_map: &self.input_map,
            self_uuid: uuid(1),
        }
    }
}

#[test]
fn matching_joins_reach_consensus() {
    let mut fx = Fixture::new();
    // Both streams at seq 0, both safe.
    for b in [1u8, 2] {
        let index = fx.known[&uuid(b)].index;
        fx.input_map
            .insert(index, user_msg(uuid(b), 0), vec![])
            .unwrap();
    }
    let aru = fx.input_map.aru_seq();
    for b in [1u8, 2] {
        fx.input_map
            .set_safe_seq(fx.known[&uuid(b)].index, aru)
            .unwrap();
    }

    let j1 = fx.join_from(uuid(1), 0);
    let j2 = fx.join_from(uuid(2), 0);
    fx.known.get_mut(&uuid(1)).unwrap().join_message = Some(j1);
    fx.known.get_mut(&uuid(2)).unwrap().join_message = Some(j2);

    assert!(fx.consensus().is_consensus());
}

#[test]
fn missing_peer_join_blocks_consensus() {
    let mut fx = Fixture::new();
    let j1 = fx.join_from(uuid(1), 0);
    fx.known.get_mut(&uuid(1)).unwrap().join_message = Some(j1);

    assert!(!fx.consensus().is_consensus());
}

#[test]
fn diverging_range_claims_block_consensus() {
    let mut fx = Fixture::new();
    let j1 = fx.join_from(uuid(1), 0);
    fx.known.get_mut(&uuid(1)).unwrap().join_message = Some(j1);

    // Peer claims to have seen a message we have no trace of.
    let mut j2 = fx.join_from(uuid(2), 0);
    j2.node_list.get_mut(&uuid(2)).unwrap().im_range = Range::new(Seqno(1), Seqno(5));
    fx.known.get_mut(&uuid(2)).unwrap().join_message = Some(j2);

    assert!(!fx.consensus().is_consensus());
}

#[test]
fn install_equal_to_consistent_join_is_consistent() {
    let mut fx = Fixture::new();
    let j1 = fx.join_from(uuid(1), 0);
    let j2 = fx.join_from(uuid(2), 0);
    fx.known.get_mut(&uuid(1)).unwrap().join_message = Some(j1);
    fx.known.get_mut(&uuid(2)).unwrap().join_message = Some(j2);

    let install = MembershipMessage {
        msg_type: MessageType::Install,
        install_view_id: ViewId::new(ViewType::Reg, uuid(1), 4),
        ..fx.join_from(uuid(1), 1)
    };
    assert!(fx.consensus().is_consistent(&install));
}

#[test]
fn transient_suspicion_does_not_block_consensus() {
    let mut fx = Fixture::new();
    let j1 = fx.join_from(uuid(1), 0);
    // Peer marks us suspected but otherwise agrees.
    let mut j2 = fx.join_from(uuid(2), 0);
    j2.node_list.get_mut(&uuid(1)).unwrap().suspected = true;
    fx.known.get_mut(&uuid(1)).unwrap().join_message = Some(j1);
    fx.known.get_mut(&uuid(2)).unwrap().join_message = Some(j2);

    assert!(fx.consensus().is_consensus());
}
