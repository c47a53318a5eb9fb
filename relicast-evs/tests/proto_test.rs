//! Multi-node engine simulations: a set of engines wired to each other
//! directly, with deterministic time and optional packet loss.

use relicast_evs::message::Message;
use relicast_evs::{EvsDelivery, Proto, ProtoConfig, ProtoState};
use relicast_proto::{SafetyPrefix, Seqno, Uuid};
use std::time::{Duration, Instant};

fn uuid(b: u8) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[0] = b;
    Uuid::from_bytes(bytes)
}

fn test_config() -> ProtoConfig {
    ProtoConfig {
        suspect_timeout: Duration::from_secs(2),
        inactive_timeout: Duration::from_secs(4),
        inactive_check_period: Duration::from_millis(200),
        retrans_period: Duration::from_millis(300),
        join_retrans_period: Duration::from_millis(300),
        install_timeout: Duration::from_secs(2),
        ..ProtoConfig::default()
    }
}

/// A delivered user message, as recorded per node.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Delivered {
    source: Uuid,
    seq: Seqno,
    payload: Vec<u8>,
}

struct Sim {
    nodes: Vec<Proto>,
    /// Dead nodes stop receiving and sending, simulating a crash.
    alive: Vec<bool>,
    delivered: Vec<Vec<Delivered>>,
    views: Vec<Vec<EvsDelivery>>,
    now: Instant,
    loss: f64,
    rng_state: u64,
}

impl Sim {
    fn new(n: usize, cfg: ProtoConfig) -> Self {
        let now = Instant::now();
        let nodes: Vec<Proto> = (0..n)
            .map(|i| {
                Proto::new(
                    cfg.clone(),
                    uuid(i as u8 + 1),
                    &format!("n{}", i + 1),
                    0,
                    now,
                )
            })
            .collect();
        Sim {
            alive: vec![true; n],
            delivered: vec![Vec::new(); n],
            views: vec![Vec::new(); n],
            nodes,
            now,
            loss: 0.0,
            rng_state: 0x9e3779b97f4a7c15,
        }
    }

    fn with_loss(mut self, loss: f64, seed: u64) -> Self {
        self.loss = loss;
        self.rng_state = seed | 1;
        self
    }

    fn chance(&mut self) -> f64 {
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state = x;
        (x >> 11) as f64 / (1u64 << 53) as f64
    }

    fn connect_all(&mut self) {
        for i in 0..self.nodes.len() {
            self.nodes[i].connect(self.now);
            self.drain_deliveries(i);
        }
        self.exchange();
    }

    /// Move every pending datagram to every other live node, until the
    /// network is quiet.
    fn exchange(&mut self) {
        loop {
            let mut moved = false;
            for i in 0..self.nodes.len() {
                let mut packets = Vec::new();
                while let Some(pkt) = self.nodes[i].poll_transmit() {
                    packets.push(pkt);
                }
                if !self.alive[i] {
                    continue;
                }
                for pkt in packets {
                    moved = true;
                    for j in 0..self.nodes.len() {
                        if i == j || !self.alive[j] {
                            continue;
                        }
                        if self.loss > 0.0 && self.chance() < self.loss {
                            continue;
                        }
                        match Message::read(&pkt, None) {
                            Ok((msg, offset)) => {
                                let payload = pkt[offset..].to_vec();
                                self.nodes[j].handle_msg(msg, payload, self.now);
                            }
                            Err(err) => panic!("undecodable datagram: {err}"),
                        }
                    }
                }
            }
            for i in 0..self.nodes.len() {
                self.drain_deliveries(i);
            }
            if !moved {
                return;
            }
        }
    }

    fn drain_deliveries(&mut self, i: usize) {
        while let Some(delivery) = self.nodes[i].poll_delivery() {
            match delivery {
                EvsDelivery::Message {
                    source,
                    seq,
                    payload,
                    ..
                } => self.delivered[i].push(Delivered {
                    source,
                    seq,
                    payload,
                }),
                other => self.views[i].push(other),
            }
        }
    }

    fn tick(&mut self, dt: Duration) {
        self.now += dt;
        for i in 0..self.nodes.len() {
            if self.alive[i] {
                self.nodes[i].handle_timers(self.now);
            }
        }
        self.exchange();
    }

    fn tick_until(&mut self, max_ticks: usize, dt: Duration, mut cond: impl FnMut(&Sim) -> bool) {
        for _ in 0..max_ticks {
            if cond(self) {
                return;
            }
            self.tick(dt);
        }
        assert!(cond(self), "condition not reached after {max_ticks} ticks");
    }

    fn all_operational_same_view(&self) -> bool {
        let live: Vec<&Proto> = self
            .nodes
            .iter()
            .zip(&self.alive)
            .filter(|(_, alive)| **alive)
            .map(|(n, _)| n)
            .collect();
        live.iter().all(|n| n.state() == ProtoState::Operational)
            && live
                .windows(2)
                .all(|w| w[0].current_view().id() == w[1].current_view().id())
            && live
                .windows(2)
                .all(|w| w[0].current_view().members() == w[1].current_view().members())
    }

    /// Submit a payload, retrying through ticks while flow control pushes
    /// back.
    fn send(&mut self, i: usize, payload: Vec<u8>) -> Seqno {
        loop {
            match self.nodes[i].send_user(
                payload.clone(),
                0,
                SafetyPrefix::Safe,
                false,
                self.now,
            ) {
                Ok(seq) => {
                    self.drain_deliveries(i);
                    return seq;
                }
                Err(relicast_evs::EvsError::WouldBlock) => {
                    self.tick(Duration::from_millis(50));
                }
                Err(err) => panic!("send failed: {err}"),
            }
        }
    }
}

#[test]
fn single_boot_reaches_operational() {
    let mut sim = Sim::new(1, test_config());
    sim.connect_all();

    assert_eq!(sim.nodes[0].state(), ProtoState::Operational);
    // One trans view (the pre-connect pseudo view) and one regular view
    // containing only ourselves.
    let regs: Vec<_> = sim.views[0]
        .iter()
        .filter_map(|v| match v {
            EvsDelivery::RegView(view) => Some(view.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(regs.len(), 1);
    assert_eq!(regs[0].members().len(), 1);
    assert!(regs[0].members().contains_key(&uuid(1)));
    assert_eq!(regs[0].joined().len(), 1);

    // Nothing further happens while alone.
    let views_before = sim.views[0].len();
    for _ in 0..20 {
        sim.tick(Duration::from_millis(200));
    }
    assert_eq!(sim.views[0].len(), views_before);
    assert_eq!(sim.nodes[0].state(), ProtoState::Operational);
}

#[test]
fn two_nodes_merge_into_one_view() {
    let mut sim = Sim::new(2, test_config());
    sim.connect_all();
    sim.tick_until(100, Duration::from_millis(100), |s| {
        s.all_operational_same_view() && s.nodes[0].current_view().members().len() == 2
    });

    let view = sim.nodes[0].current_view().clone();
    assert!(view.members().contains_key(&uuid(1)));
    assert!(view.members().contains_key(&uuid(2)));
}

#[test]
fn safe_delivery_is_identical_on_both_nodes() {
    let mut sim = Sim::new(2, test_config());
    sim.connect_all();
    sim.tick_until(100, Duration::from_millis(100), |s| {
        s.all_operational_same_view() && s.nodes[0].current_view().members().len() == 2
    });
    let merged_at: Vec<usize> = sim.delivered.iter().map(|d| d.len()).collect();

    for round in 0..10u8 {
        sim.send(0, vec![0xa0, round]);
        sim.send(1, vec![0xb0, round]);
    }
    sim.tick_until(100, Duration::from_millis(100), |s| {
        s.delivered[0].len() >= merged_at[0] + 20 && s.delivered[1].len() >= merged_at[1] + 20
    });

    let a = &sim.delivered[0][merged_at[0]..];
    let b = &sim.delivered[1][merged_at[1]..];
    assert_eq!(a, b, "safe delivery sequences diverged");
}

#[test]
fn double_boot_with_fifty_percent_loss() {
    let mut sim = Sim::new(2, test_config()).with_loss(0.5, 42);
    sim.connect_all();
    sim.tick_until(1000, Duration::from_millis(100), |s| {
        s.all_operational_same_view() && s.nodes[0].current_view().members().len() == 2
    });

    let base: Vec<usize> = sim.delivered.iter().map(|d| d.len()).collect();
    for i in 0..5u8 {
        sim.send(0, vec![i]);
    }
    sim.tick_until(1000, Duration::from_millis(100), |s| {
        s.delivered[0].len() >= base[0] + 5 && s.delivered[1].len() >= base[1] + 5
    });

    let a = &sim.delivered[0][base[0]..base[0] + 5];
    let b = &sim.delivered[1][base[1]..base[1] + 5];
    assert_eq!(a, b, "loss produced duplicate or missing safe deliveries");
}

#[test]
fn four_nodes_total_order_under_window_pressure() {
    let mut cfg = test_config();
    cfg.user_send_window = 2;
    let mut sim = Sim::new(4, cfg);
    sim.connect_all();
    sim.tick_until(200, Duration::from_millis(100), |s| {
        s.all_operational_same_view() && s.nodes[0].current_view().members().len() == 4
    });
    let base: Vec<usize> = sim.delivered.iter().map(|d| d.len()).collect();

    // Interleaved bursts from all four senders.
    for round in 0..25u8 {
        for node in 0..4usize {
            sim.send(node, vec![node as u8, round]);
        }
    }
    sim.tick_until(500, Duration::from_millis(100), |s| {
        (0..4).all(|i| s.delivered[i].len() >= base[i] + 100)
    });

    let reference: Vec<Delivered> = sim.delivered[0][base[0]..base[0] + 100].to_vec();
    for i in 1..4 {
        assert_eq!(
            &sim.delivered[i][base[i]..base[i] + 100],
            &reference[..],
            "node {i} diverged from the total order"
        );
    }
    // FIFO per sender within the total order.
    for sender in 0..4u8 {
        let rounds: Vec<u8> = reference
            .iter()
            .filter(|d| d.payload.first() == Some(&sender))
            .map(|d| d.payload[1])
            .collect();
        let mut sorted = rounds.clone();
        sorted.sort_unstable();
        assert_eq!(rounds, sorted, "sender {sender} violated fifo order");
    }
}

#[test]
fn graceful_leave_of_middle_node() {
    let mut sim = Sim::new(3, test_config());
    sim.connect_all();
    sim.tick_until(200, Duration::from_millis(100), |s| {
        s.all_operational_same_view() && s.nodes[0].current_view().members().len() == 3
    });
    sim.views.iter_mut().for_each(|v| v.clear());

    sim.nodes[1].close(sim.now);
    sim.tick_until(300, Duration::from_millis(100), |s| {
        s.nodes[1].state() == ProtoState::Closed
            && s.nodes[0].state() == ProtoState::Operational
            && s.nodes[2].state() == ProtoState::Operational
            && s.nodes[0].current_view().members().len() == 2
            && s.nodes[2].current_view().members().len() == 2
    });

    // The leaver saw its final empty view.
    assert!(sim.views[1]
        .iter()
        .any(|v| matches!(v, EvsDelivery::EmptyView)));

    // The remaining nodes saw a trans view listing the leaver as left,
    // then the two-member regular view.
    for i in [0usize, 2] {
        let trans = sim.views[i]
            .iter()
            .find_map(|v| match v {
                EvsDelivery::TransView(view) if !view.left().is_empty() => Some(view.clone()),
                _ => None,
            })
            .expect("trans view with a leaver");
        assert!(trans.left().contains_key(&uuid(2)));
        let reg = sim.nodes[i].current_view();
        assert_eq!(reg.members().len(), 2);
        assert!(!reg.members().contains_key(&uuid(2)));
    }
}

#[test]
fn crashed_node_is_partitioned_out() {
    let mut sim = Sim::new(2, test_config());
    sim.connect_all();
    sim.tick_until(100, Duration::from_millis(100), |s| {
        s.all_operational_same_view() && s.nodes[0].current_view().members().len() == 2
    });

    // Node 2 goes dark.
    sim.alive[1] = false;
    sim.tick_until(600, Duration::from_millis(100), |s| {
        s.nodes[0].state() == ProtoState::Operational
            && s.nodes[0].current_view().members().len() == 1
    });
    let view = sim.nodes[0].current_view();
    assert!(view.members().contains_key(&uuid(1)));

    // The vanished peer ends up in the partitioned set of the final view.
    let partitioned = sim.views[0]
        .iter()
        .rev()
        .find_map(|v| match v {
            EvsDelivery::RegView(view) if !view.partitioned().is_empty() => Some(view.clone()),
            _ => None,
        })
        .expect("view with a partitioned node");
    assert!(partitioned.partitioned().contains_key(&uuid(2)));
}

#[test]
fn causal_keepalive_drains_a_stalled_barrier() {
    let mut cfg = test_config();
    cfg.causal_keepalive_period = Duration::from_millis(200);
    let mut sim = Sim::new(2, cfg);
    sim.connect_all();
    sim.tick_until(100, Duration::from_millis(100), |s| {
        s.all_operational_same_view() && s.nodes[0].current_view().members().len() == 2
    });

    // Hand one message from n1 to n2 and drop n2's acknowledgement round:
    // n2's aru now runs ahead of its safe seqno with no traffic left that
    // would ever close the gap on its own.
    while sim.nodes[0].poll_transmit().is_some() {}
    sim.nodes[0]
        .send_user(vec![0x11], 0, SafetyPrefix::Safe, false, sim.now)
        .unwrap();
    let pkt = sim.nodes[0].poll_transmit().expect("user message");
    let (msg, offset) = Message::read(&pkt, None).unwrap();
    sim.nodes[1].handle_msg(msg, pkt[offset..].to_vec(), sim.now);
    while sim.nodes[1].poll_transmit().is_some() {}
    sim.drain_deliveries(0);
    sim.drain_deliveries(1);

    // The barrier cannot complete yet and must queue.
    let delivered_before = sim.delivered[1].len();
    sim.nodes[1].send_causal(vec![0xcc], 9, sim.now);
    sim.drain_deliveries(1);
    assert_eq!(sim.delivered[1].len(), delivered_before);

    // The keepalive round closes the gap and the barrier comes back.
    sim.tick_until(20, Duration::from_millis(100), |s| {
        s.delivered[1]
            .iter()
            .any(|d| d.seq.is_none() && d.payload == vec![0xcc])
    });
}

#[test]
fn flow_control_blocks_beyond_window() {
    let mut cfg = test_config();
    cfg.user_send_window = 2;
    cfg.send_window = 4;
    let mut sim = Sim::new(2, cfg);
    sim.connect_all();
    sim.tick_until(100, Duration::from_millis(100), |s| {
        s.all_operational_same_view() && s.nodes[0].current_view().members().len() == 2
    });

    // Without draining acks, only the window fits.
    let mut accepted = 0;
    loop {
        match sim.nodes[0].send_user(vec![accepted], 0, SafetyPrefix::Safe, false, sim.now) {
            Ok(_) => accepted += 1,
            Err(relicast_evs::EvsError::WouldBlock) => break,
            Err(err) => panic!("unexpected error: {err}"),
        }
        assert!(accepted <= 8, "window never closed");
    }
    assert!(accepted >= 1);
    sim.drain_deliveries(0);

    // Once the group acknowledges, the window opens again.
    sim.tick(Duration::from_millis(400));
    sim.tick(Duration::from_millis(400));
    assert!(sim.nodes[0]
        .send_user(vec![0xff], 0, SafetyPrefix::Safe, false, sim.now)
        .is_ok());
}
