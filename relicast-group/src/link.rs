//! The pluggable datagram multicaster below the engine.
//!
//! The real deployment plugs a TCP/UDP mesh in here; the crate ships an
//! in-memory hub that gives tests a deterministic, optionally lossy
//! network with explicit component signalling.

use crate::GroupError;
use parking_lot::Mutex;
use rand::Rng;
use relicast_proto::{SegmentId, Uuid};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// What the engine consumes from the transport.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A serialized protocol datagram from a peer.
    Packet { sender: Uuid, payload: Vec<u8> },
    /// The transport's membership indication: the set of reachable nodes.
    Component { members: Vec<(Uuid, SegmentId)> },
}

/// Reliable point-to-point datagram multicast, below the protocol headers.
pub trait Link: Send {
    /// Multicast one datagram to every other component member.
    fn send(&mut self, buf: &[u8]) -> Result<usize, GroupError>;

    /// Pull the next event, waiting up to `timeout`. `Ok(None)` on timeout.
    fn recv(&mut self, timeout: Duration) -> Result<Option<LinkEvent>, GroupError>;

    /// Usable payload size for a transport packet of `pkt` bytes.
    fn msg_size_for_packet(&self, pkt: usize) -> usize;
}

#[derive(Debug, Default)]
struct HubState {
    queues: BTreeMap<Uuid, VecDeque<LinkEvent>>,
    segments: BTreeMap<Uuid, SegmentId>,
    /// Packet loss probability in [0, 1), applied per delivery.
    loss: f64,
    rng_state: u64,
}

impl HubState {
    /// Deterministic xorshift so lossy tests are reproducible from a seed.
    fn chance(&mut self) -> f64 {
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state = x;
        (x >> 11) as f64 / (1u64 << 53) as f64
    }

    fn broadcast_component(&mut self) {
        let members: Vec<(Uuid, SegmentId)> = self
            .segments
            .iter()
            .map(|(u, s)| (*u, *s))
            .collect();
        for queue in self.queues.values_mut() {
            queue.push_back(LinkEvent::Component {
                members: members.clone(),
            });
        }
    }
}

/// A process-local multicast domain for tests and single-host setups.
#[derive(Clone, Default)]
pub struct MemHub {
    state: Arc<Mutex<HubState>>,
}

impl MemHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_loss(loss: f64, seed: u64) -> Self {
        let hub = Self::new();
        {
            let mut state = hub.state.lock();
            state.loss = loss;
            state.rng_state = seed | 1;
        }
        hub
    }

    /// Attach a node; every member (including the new one) gets a fresh
    /// component indication.
    pub fn attach(&self, uuid: Uuid, segment: SegmentId) -> MemLink {
        let mut state = self.state.lock();
        state.queues.entry(uuid).or_default();
        state.segments.insert(uuid, segment);
        state.broadcast_component();
        MemLink {
            uuid,
            state: Arc::clone(&self.state),
        }
    }

    /// Detach a node, simulating a crash or partition; the remaining
    /// members get a component indication without it.
    pub fn detach(&self, uuid: Uuid) {
        let mut state = self.state.lock();
        state.queues.remove(&uuid);
        state.segments.remove(&uuid);
        state.broadcast_component();
    }

    pub fn set_loss(&self, loss: f64) {
        self.state.lock().loss = loss;
    }

    /// Total queued events, for quiescence detection in tests.
    pub fn pending(&self) -> usize {
        self.state.lock().queues.values().map(|q| q.len()).sum()
    }
}

/// One node's endpoint on a [`MemHub`].
pub struct MemLink {
    uuid: Uuid,
    state: Arc<Mutex<HubState>>,
}

impl MemLink {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl Link for MemLink {
    fn send(&mut self, buf: &[u8]) -> Result<usize, GroupError> {
        let mut state = self.state.lock();
        if !state.queues.contains_key(&self.uuid) {
            return Err(GroupError::ConnAborted);
        }
        let targets: Vec<Uuid> = state
            .queues
            .keys()
            .filter(|u| **u != self.uuid)
            .copied()
            .collect();
        for target in targets {
            if state.loss > 0.0 && state.chance() < state.loss {
                continue;
            }
            let event = LinkEvent::Packet {
                sender: self.uuid,
                payload: buf.to_vec(),
            };
            state
                .queues
                .get_mut(&target)
                .expect("listed target")
                .push_back(event);
        }
        Ok(buf.len())
    }

    fn recv(&mut self, _timeout: Duration) -> Result<Option<LinkEvent>, GroupError> {
        let mut state = self.state.lock();
        match state.queues.get_mut(&self.uuid) {
            Some(queue) => Ok(queue.pop_front()),
            None => Err(GroupError::ConnAborted),
        }
    }

    fn msg_size_for_packet(&self, pkt: usize) -> usize {
        pkt
    }
}

/// Derive a fresh node identity, convenience for tests and the facade.
pub fn random_uuid(rng: &mut impl Rng) -> Uuid {
    Uuid::random(rng)
}
