//! Property suite over action framing: split-then-reassemble is identity
//! for any action size and any packet size that fits the header.

use proptest::prelude::*;
use relicast_group::frag::{read_frag, Defrag, FragIter};
use relicast_group::ActionType;
use relicast_proto::constants::ACT_HEADER_SIZE;

proptest! {
    #[test]
    fn split_reassemble_roundtrip(
        action in prop::collection::vec(any::<u8>(), 0..20_000),
        pkt_size in (ACT_HEADER_SIZE + 1)..4096usize,
        act_id in 0u64..0x00ff_ffff_ffff_ffff,
    ) {
        let frags: Vec<Vec<u8>> =
            FragIter::new(act_id, ActionType::Data, &action, pkt_size)
                .unwrap()
                .collect();
        let expected = (action.len().div_ceil(pkt_size - ACT_HEADER_SIZE)).max(1);
        prop_assert_eq!(frags.len(), expected);

        let mut df = Defrag::new();
        let mut out = None;
        for (i, buf) in frags.iter().enumerate() {
            let frag = read_frag(buf).unwrap();
            prop_assert_eq!(frag.act_id, act_id);
            prop_assert_eq!(frag.frag_no, i as u32);
            prop_assert_eq!(frag.act_size as usize, action.len());
            out = df.handle_frag(&frag, false).unwrap();
            if i + 1 < frags.len() {
                prop_assert!(out.is_none(), "completed early at fragment {i}");
            }
        }
        let done = out.expect("action completes on the last fragment");
        prop_assert_eq!(done.buf, action);
    }

    /// Back-to-back actions through the same defragmenter keep their
    /// boundaries.
    #[test]
    fn sequential_actions_stay_separate(
        sizes in prop::collection::vec(1usize..5000, 1..8),
        pkt_size in 200usize..2000,
    ) {
        let mut df = Defrag::new();
        for (id, size) in sizes.iter().enumerate() {
            let action: Vec<u8> = (0..*size).map(|i| (i ^ id) as u8).collect();
            let mut out = None;
            for buf in FragIter::new(id as u64, ActionType::Data, &action, pkt_size).unwrap() {
                let frag = read_frag(&buf).unwrap();
                out = df.handle_frag(&frag, false).unwrap();
            }
            let done = out.expect("complete");
            prop_assert_eq!(done.buf, action);
        }
    }
}
