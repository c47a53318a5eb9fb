//! Codec primitives round-trip for arbitrary values.

use proptest::prelude::*;
use relicast_proto::{Range, Seqno, Uuid, View, ViewId, ViewType, WireRead, WireWrite};

fn arb_view_type() -> impl Strategy<Value = ViewType> {
    prop_oneof![
        Just(ViewType::None),
        Just(ViewType::Trans),
        Just(ViewType::Reg),
        Just(ViewType::NonPrim),
        Just(ViewType::Prim),
    ]
}

proptest! {
    #[test]
    fn integer_roundtrip(a in any::<u16>(), b in any::<u32>(), c in any::<i64>(), d in any::<u64>()) {
        let mut buf = Vec::new();
        let mut w = WireWrite::new(&mut buf);
        w.put_u16(a);
        w.put_u32(b);
        w.put_i64(c);
        w.put_u64_be(d);

        let mut r = WireRead::new(&buf);
        prop_assert_eq!(r.get_u16().unwrap(), a);
        prop_assert_eq!(r.get_u32().unwrap(), b);
        prop_assert_eq!(r.get_i64().unwrap(), c);
        prop_assert_eq!(r.get_u64_be().unwrap(), d);
        prop_assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn uuid_order_matches_byte_order(a in any::<[u8; 16]>(), b in any::<[u8; 16]>()) {
        let ua = Uuid::from_bytes(a);
        let ub = Uuid::from_bytes(b);
        prop_assert_eq!(ua.cmp(&ub), a.cmp(&b));
    }

    #[test]
    fn incarnation_preserves_fixed_part(bytes in any::<[u8; 16]>(), bumps in 1usize..5) {
        let orig = Uuid::from_bytes(bytes);
        let mut u = orig;
        for _ in 0..bumps {
            u.increment_incarnation();
        }
        prop_assert!(u.fixed_part_matches(&orig));
    }

    #[test]
    fn view_id_roundtrip(t in arb_view_type(), bytes in any::<[u8; 16]>(), seq in any::<u32>()) {
        let id = ViewId::new(t, Uuid::from_bytes(bytes), seq);
        let mut buf = Vec::new();
        id.write(&mut WireWrite::new(&mut buf));
        prop_assert_eq!(buf.len(), ViewId::wire_size());
        let got = ViewId::read(&mut WireRead::new(&buf)).unwrap();
        prop_assert_eq!(got, id);
    }

    #[test]
    fn range_roundtrip(lu in any::<i64>(), hs in any::<i64>()) {
        let range = Range::new(Seqno(lu), Seqno(hs));
        let mut buf = Vec::new();
        range.write(&mut WireWrite::new(&mut buf));
        let got = Range::read(&mut WireRead::new(&buf)).unwrap();
        prop_assert_eq!(got, range);
    }

    #[test]
    fn view_roundtrip(
        members in prop::collection::btree_map(any::<[u8; 16]>(), "[a-z]{0,8}", 1..6),
        seq in any::<u32>(),
    ) {
        let mut view = View::new(ViewId::new(ViewType::Reg, Uuid::nil(), seq));
        for (bytes, name) in members {
            view.add_member(
                Uuid::from_bytes(bytes),
                relicast_proto::Member { name, segment: 0 },
            );
        }
        let mut buf = Vec::new();
        view.write(&mut WireWrite::new(&mut buf)).unwrap();
        let got = View::read(&mut WireRead::new(&buf)).unwrap();
        prop_assert_eq!(got, view);
    }
}
