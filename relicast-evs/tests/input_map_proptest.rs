//! Property suite over the input map: whatever the arrival order, the
//! safety bounds and delivery order hold.

use proptest::prelude::*;
use relicast_evs::input_map::InputMap;
use relicast_evs::message::UserMessage;
use relicast_proto::{SafetyPrefix, Seqno, Uuid, ViewId};

fn uuid(b: u8) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[0] = b;
    Uuid::from_bytes(bytes)
}

fn user_msg(source: Uuid, seq: i64, seq_range: u8) -> UserMessage {
    UserMessage {
        source,
        source_view_id: ViewId::nil(),
        seq: Seqno(seq),
        seq_range,
        aru_seq: Seqno::NONE,
        safety_prefix: SafetyPrefix::Safe,
        user_type: 0,
        flags: 0,
    }
}

proptest! {
    /// Inserting any within-window sequence of messages keeps
    /// safe <= aru <= max_hs and delivery order sorted.
    #[test]
    fn safety_bounds_hold(
        ops in prop::collection::vec((0usize..3, 0i64..64, 0u8..4), 1..200),
    ) {
        let mut im = InputMap::new();
        let senders: Vec<usize> = (1..=3u8)
            .map(|i| im.insert_sender(uuid(i)).unwrap())
            .collect();

        for (sender, seq, range) in ops {
            let index = senders[sender];
            let msg = user_msg(im.sender_uuid(index), seq, range);
            // Out-of-window inserts are legitimately rejected; everything
            // else must keep the invariants.
            let _ = im.insert(index, msg, vec![0u8; 4]);

            let aru = im.aru_seq();
            let safe = im.safe_seq();
            prop_assert!(safe <= aru, "safe {safe} > aru {aru}");
            prop_assert!(aru <= im.max_hs(), "aru {aru} > max_hs {}", im.max_hs());
            for index in &senders {
                let r = im.range(*index);
                prop_assert!(r.lu() >= Seqno::ZERO);
                prop_assert!(aru <= r.lu() - 1, "aru {aru} ahead of sender lu {}", r.lu());
            }
            // Keys are sorted by (seq, index).
            let keys = im.keys();
            for pair in keys.windows(2) {
                prop_assert!(pair[0] < pair[1]);
            }
        }
    }

    /// Declaring safe seqnos never exceeds aru and the recovery index
    /// keeps erased-but-unsafe messages reachable.
    #[test]
    fn erase_keeps_unsafe_recoverable(
        count in 1i64..32,
    ) {
        let mut im = InputMap::new();
        let a = im.insert_sender(uuid(1)).unwrap();
        for seq in 0..count {
            im.insert(a, user_msg(uuid(1), seq, 0), vec![seq as u8]).unwrap();
        }
        let aru = im.aru_seq();
        prop_assert_eq!(aru, Seqno(count - 1));

        // Half becomes safe, everything is erased.
        let half = Seqno(count / 2);
        im.set_safe_seq(a, half).unwrap();
        for key in im.keys() {
            im.erase(&key);
        }
        for seq in 0..count {
            let recovered = im.recover(a, Seqno(seq));
            if seq > half.get() {
                prop_assert!(recovered.is_some(), "unsafe seq {seq} lost");
            }
        }
    }
}
