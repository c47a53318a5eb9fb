//! Properties of the state message codec and the quorum computation.

use proptest::prelude::*;
use relicast_group::state_msg::{compute_quorum, NodeState, StateMessage};
use relicast_proto::{Seqno, Uuid};

fn arb_node_state() -> impl Strategy<Value = NodeState> {
    prop_oneof![
        Just(NodeState::NonPrim),
        Just(NodeState::Prim),
        Just(NodeState::Joiner),
        Just(NodeState::Donor),
        Just(NodeState::Joined),
        Just(NodeState::Synced),
    ]
}

fn arb_state(group: [u8; 16]) -> impl Strategy<Value = StateMessage> {
    (
        any::<[u8; 16]>(),
        any::<[u8; 16]>(),
        1i16..16,
        0i64..1000,
        0i64..100_000,
        arb_node_state(),
        arb_node_state(),
        "[a-z0-9]{1,12}",
    )
        .prop_map(
            move |(state, prim, prim_joined, prim_seqno, act_seqno, prim_state, current_state, name)| {
                StateMessage {
                    state_uuid: Uuid::from_bytes(state),
                    group_uuid: Uuid::from_bytes(group),
                    prim_uuid: Uuid::from_bytes(prim),
                    prim_joined,
                    prim_seqno: Seqno(prim_seqno),
                    act_seqno: Seqno(act_seqno),
                    prim_state,
                    current_state,
                    name,
                    incoming_addr: "10.0.0.1:4567".to_owned(),
                    proto_min: 0,
                    proto_max: 2,
                    flags: 0,
                }
            },
        )
}

proptest! {
    #[test]
    fn codec_is_idempotent(state in arb_state([7u8; 16])) {
        let mut buf = Vec::new();
        state.write(&mut buf).unwrap();
        let decoded = StateMessage::read(&buf).unwrap();
        prop_assert_eq!(decoded, state);
    }

    /// Growing the state set (same group) never lowers an established
    /// primary's inherited seqnos.
    #[test]
    fn quorum_is_monotonic_in_the_state_set(
        states in prop::collection::vec(arb_state([7u8; 16]), 1..8),
        extra in prop::collection::vec(arb_state([7u8; 16]), 0..4),
    ) {
        // The inherit rule drives this property; remerge-only quorums can
        // legitimately dissolve when a second merge candidate appears.
        prop_assume!(states.iter().any(|s| s.current_state.is_joined()));
        let small = compute_quorum(&states).unwrap();
        prop_assume!(small.primary);

        let mut superset = states.clone();
        superset.extend(extra);
        let big = compute_quorum(&superset).unwrap();
        prop_assert!(big.primary, "superset lost the quorum");
        prop_assert!(big.act_seqno >= small.act_seqno);
        if big.act_seqno == small.act_seqno {
            prop_assert!(big.prim_seqno >= small.prim_seqno);
        }
    }
}
