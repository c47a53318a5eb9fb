use criterion::{criterion_group, criterion_main, Criterion};
use relicast_evs::input_map::InputMap;
use relicast_evs::message::UserMessage;
use relicast_proto::{SafetyPrefix, Seqno, Uuid, ViewId};

fn uuid(b: u8) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[0] = b;
    Uuid::from_bytes(bytes)
}

fn user_msg(source: Uuid, seq: i64) -> UserMessage {
    UserMessage {
        source,
        source_view_id: ViewId::nil(),
        seq: Seqno(seq),
        seq_range: 0,
        aru_seq: Seqno(seq - 1),
        safety_prefix: SafetyPrefix::Safe,
        user_type: 0,
        flags: 0,
    }
}

fn insert_drain(c: &mut Criterion) {
    c.bench_function("insert_drain_4_senders_256_msgs", |b| {
        b.iter(|| {
            let mut im = InputMap::new();
            let senders: Vec<(Uuid, usize)> = (1..=4u8)
                .map(|i| {
                    let u = uuid(i);
                    (u, im.insert_sender(u).unwrap())
                })
                .collect();
            for seq in 0..256i64 {
                for (u, idx) in &senders {
                    im.insert(*idx, user_msg(*u, seq), vec![0u8; 64]).unwrap();
                }
            }
            let aru = im.aru_seq();
            for (_, idx) in &senders {
                im.set_safe_seq(*idx, aru).unwrap();
            }
            for key in im.keys() {
                assert!(im.is_safe(&key));
                im.erase(&key);
            }
            assert!(im.is_empty());
        })
    });
}

criterion_group!(benches, insert_drain);
criterion_main!(benches);
