//! The group core: glues the EVS engine, action framing, state exchange,
//! commit-cut tracking and the action cache into the one primitive the
//! application sees.
//!
//! Like the engine underneath, the core is sans-io: `step` pumps link
//! events, timers and deliveries; `submit` queues an action; `poll_recv`
//! drains ordered items. The threaded facade in [`crate::replicator`] puts
//! blocking semantics on top.

use crate::config::Config;
use crate::fifo::{ActFifo, FifoEntry};
use crate::frag::{read_frag, write_header, Defrag};
use crate::link::{Link, LinkEvent};
use crate::state_msg::{compute_quorum, NodeState, StateMessage};
use crate::{ActionType, GroupError, MsgType};
use relicast_cache::RingCache;
use relicast_evs::{EvsDelivery, Message, Proto};
use relicast_proto::constants::ACT_HEADER_SIZE;
use relicast_proto::{Configuration, SafetyPrefix, SegmentId, Seqno, Uuid, View};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Capacity of the local action FIFO.
const FIFO_CAP: usize = 1 << 15;

/// An ordered item handed to the application.
#[derive(Debug)]
pub enum RecvItem {
    /// A totally ordered action. For local actions the payload comes back
    /// through the FIFO, never off the wire.
    Action {
        act_type: ActionType,
        global_seqno: Seqno,
        local_seqno: Seqno,
        source: Uuid,
        act_id: u64,
        is_local: bool,
        buf: Vec<u8>,
    },
    /// Membership and quorum decision after a view change.
    ConfChange(Configuration),
    /// Every primary member has applied actions up to this seqno.
    CommitCut(Seqno),
    /// A previously submitted action cannot complete; the caller restarts
    /// it. Fragments already sent were discarded by all peers.
    SendFailed { act_id: u64, error: GroupError },
    /// The node has left the group. Terminal.
    Closed,
}

impl RecvItem {
    fn weight(&self) -> usize {
        match self {
            RecvItem::Action { buf, .. } => buf.len().max(64),
            _ => 64,
        }
    }
}

struct Exchange {
    view: View,
    proposed: Uuid,
    adopted: Option<Uuid>,
    states: BTreeMap<Uuid, StateMessage>,
}

struct PendingAction {
    act_id: u64,
    act_type: ActionType,
    buf: Arc<Vec<u8>>,
}

struct SendProgress {
    act_id: u64,
    act_type: ActionType,
    buf: Arc<Vec<u8>>,
    offset: usize,
    frag_no: u32,
}

pub struct GroupCore {
    cfg: Config,
    my_uuid: Uuid,
    my_name: String,
    evs: Proto,
    link: Box<dyn Link>,
    pkt_size: usize,
    rng: rand::rngs::StdRng,

    node_state: NodeState,
    prim_state: NodeState,
    group_uuid: Uuid,
    prim_uuid: Uuid,
    prim_seqno: Seqno,
    prim_joined: i16,
    global_seqno: Seqno,
    primary: bool,

    current_view: Option<View>,
    exchange: Option<Exchange>,

    send_act_no: u64,
    fifo: ActFifo,
    pending: VecDeque<PendingAction>,
    sending: Option<SendProgress>,
    /// Bytes queued for sending (pending plus in-flight), capped by the
    /// flow control limit.
    pending_bytes: usize,
    defrag: BTreeMap<Uuid, Defrag>,

    last_applied: BTreeMap<Uuid, Seqno>,
    commit_cut: Seqno,

    cache: Option<Arc<RingCache>>,

    recv_q: VecDeque<RecvItem>,
    recv_q_bytes: usize,
    fc_paused: bool,
    closed: bool,
}

impl GroupCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Config,
        my_uuid: Uuid,
        my_name: &str,
        segment: SegmentId,
        link: Box<dyn Link>,
        cache: Option<Arc<RingCache>>,
        bootstrap: bool,
        now: Instant,
    ) -> Self {
        use rand::SeedableRng;
        let mut rng = rand::rngs::StdRng::from_entropy();
        let (group_uuid, node_state) = if bootstrap {
            // A bootstrapped node starts a brand new cluster history and
            // holds its (empty) state by definition.
            (Uuid::random(&mut rng), NodeState::Joined)
        } else {
            (Uuid::nil(), NodeState::Joiner)
        };
        let evs = Proto::new(cfg.evs.clone(), my_uuid, my_name, segment, now);
        GroupCore {
            pkt_size: cfg.max_packet_size,
            cfg,
            my_uuid,
            my_name: my_name.to_owned(),
            evs,
            link,
            rng,
            node_state,
            prim_state: NodeState::NonPrim,
            group_uuid,
            prim_uuid: Uuid::nil(),
            prim_seqno: Seqno::NONE,
            prim_joined: 0,
            global_seqno: Seqno::ZERO,
            primary: false,
            current_view: None,
            exchange: None,
            send_act_no: 0,
            fifo: ActFifo::new(FIFO_CAP),
            pending: VecDeque::new(),
            sending: None,
            pending_bytes: 0,
            defrag: BTreeMap::new(),
            last_applied: BTreeMap::new(),
            commit_cut: Seqno::NONE,
            cache,
            recv_q: VecDeque::new(),
            recv_q_bytes: 0,
            fc_paused: false,
            closed: false,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.my_uuid
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn node_state(&self) -> NodeState {
        self.node_state
    }

    pub fn group_uuid(&self) -> Uuid {
        self.group_uuid
    }

    pub fn global_seqno(&self) -> Seqno {
        self.global_seqno
    }

    pub fn evs_state(&self) -> relicast_evs::ProtoState {
        self.evs.state()
    }

    pub fn cache(&self) -> Option<&Arc<RingCache>> {
        self.cache.as_ref()
    }

    pub fn connect(&mut self, now: Instant) {
        self.evs.connect(now);
    }

    pub fn close(&mut self, now: Instant) {
        self.evs.close(now);
    }

    /// Leave without waiting for the departure to be safely delivered.
    pub fn force_close(&mut self, now: Instant) {
        self.evs.force_close(now);
    }

    /// The application finished receiving a state transfer and holds
    /// complete state.
    pub fn set_joined(&mut self) {
        if matches!(self.node_state, NodeState::Joiner | NodeState::Prim) {
            self.node_state = NodeState::Joined;
        }
    }

    /// The node has caught up with the replication stream.
    pub fn set_synced(&mut self) {
        if self.node_state == NodeState::Joined {
            self.node_state = NodeState::Synced;
        }
    }

    /// Adjust the fragmentation size. Effective from the next action.
    pub fn set_pkt_size(&mut self, bytes: usize) -> usize {
        let usable = self.link.msg_size_for_packet(bytes);
        if usable > ACT_HEADER_SIZE {
            self.pkt_size = usable;
        }
        self.pkt_size
    }

    /// The application has applied all actions up to `seqno`; announce it
    /// so the group commit cut can advance and the cache can shed records.
    pub fn set_last_applied(&mut self, seqno: Seqno, now: Instant) {
        if !self.primary {
            return;
        }
        let payload = seqno.get().to_le_bytes().to_vec();
        match self.evs.send_user(
            payload,
            MsgType::Last as u8,
            SafetyPrefix::Fifo,
            false,
            now,
        ) {
            Ok(_) | Err(relicast_evs::EvsError::WouldBlock) => {}
            Err(err) => debug!(%err, "last-applied announcement failed"),
        }
    }

    /// Queue an action for replication. Returns its local action id; the
    /// global seqno arrives with the action's own ordered delivery.
    pub fn submit(
        &mut self,
        buf: Arc<Vec<u8>>,
        act_type: ActionType,
        now: Instant,
    ) -> Result<u64, GroupError> {
        if self.closed {
            return Err(GroupError::ConnAborted);
        }
        if !self.primary {
            return Err(GroupError::NotConnected);
        }
        if self.fc_paused {
            return Err(GroupError::WouldBlock);
        }
        if self.pending_bytes + buf.len() > self.cfg.fc_limit {
            return Err(GroupError::WouldBlock);
        }
        let act_id = self.send_act_no;
        self.fifo.push(FifoEntry {
            act_id,
            act_type,
            buf: Arc::clone(&buf),
        })?;
        self.send_act_no += 1;
        self.pending_bytes += buf.len();
        self.pending.push_back(PendingAction {
            act_id,
            act_type,
            buf,
        });
        self.progress_send(now);
        Ok(act_id)
    }

    /// Pump the machinery: drain the link, run timers, push fragments,
    /// transmit, process deliveries. Returns the next timer deadline.
    pub fn step(&mut self, now: Instant) -> Result<Option<Instant>, GroupError> {
        while let Some(event) = self.link.recv(Duration::ZERO)? {
            match event {
                LinkEvent::Packet { sender, payload } => {
                    match Message::read(&payload, Some(sender)) {
                        Ok((msg, offset)) => {
                            let body = payload[offset..].to_vec();
                            self.evs.handle_msg(msg, body, now);
                        }
                        Err(err) => {
                            warn!(%sender, %err, "dropping malformed datagram");
                        }
                    }
                }
                LinkEvent::Component { members } => {
                    self.evs.handle_component(&members, now);
                }
            }
        }
        let deadline = self.evs.handle_timers(now);
        self.progress_send(now);
        self.flush_transmit()?;
        while let Some(delivery) = self.evs.poll_delivery() {
            self.handle_delivery(delivery, now)?;
        }
        self.flush_transmit()?;
        Ok(deadline)
    }

    fn flush_transmit(&mut self) -> Result<(), GroupError> {
        while let Some(buf) = self.evs.poll_transmit() {
            self.link.send(&buf)?;
        }
        Ok(())
    }

    /// Push fragments of queued actions through the engine as the send
    /// window allows.
    fn progress_send(&mut self, now: Instant) {
        loop {
            if self.sending.is_none() {
                match self.pending.pop_front() {
                    Some(p) => {
                        self.sending = Some(SendProgress {
                            act_id: p.act_id,
                            act_type: p.act_type,
                            buf: p.buf,
                            offset: 0,
                            frag_no: 0,
                        })
                    }
                    None => return,
                }
            }
            let (frag_buf, more, advance) = {
                let progress = self.sending.as_ref().expect("sending set above");
                let chunk = self.pkt_size - ACT_HEADER_SIZE;
                let take = (progress.buf.len() - progress.offset).min(chunk);
                let mut frag_buf = Vec::with_capacity(ACT_HEADER_SIZE + take);
                // The id counter starts at zero per process; it cannot
                // reach the 56-bit wire limit.
                write_header(
                    &mut frag_buf,
                    progress.act_id,
                    progress.buf.len() as u32,
                    progress.frag_no,
                    progress.act_type,
                )
                .expect("action id within wire limit");
                frag_buf
                    .extend_from_slice(&progress.buf[progress.offset..progress.offset + take]);
                let more = progress.offset + take < progress.buf.len();
                (frag_buf, more, take)
            };
            match self.evs.send_user(
                frag_buf,
                MsgType::Action as u8,
                SafetyPrefix::Safe,
                more,
                now,
            ) {
                Ok(_) => {
                    let done = {
                        let progress = self.sending.as_mut().expect("sending set above");
                        progress.offset += advance;
                        progress.frag_no += 1;
                        !more
                    };
                    if done {
                        if let Some(progress) = self.sending.take() {
                            self.pending_bytes =
                                self.pending_bytes.saturating_sub(progress.buf.len());
                        }
                    }
                }
                Err(relicast_evs::EvsError::WouldBlock) => return,
                Err(_) => {
                    // Not connected: the view changed under us. The view
                    // handler reports the abort; stop pushing.
                    return;
                }
            }
        }
    }

    fn handle_delivery(&mut self, delivery: EvsDelivery, now: Instant) -> Result<(), GroupError> {
        match delivery {
            EvsDelivery::Message {
                source,
                user_type,
                payload,
                seq,
                ..
            } => {
                let msg_type = match MsgType::from_u8(user_type) {
                    Ok(t) => t,
                    Err(err) => {
                        warn!(%source, user_type, %err, "dropping message of unknown type");
                        return Ok(());
                    }
                };
                match msg_type {
                    MsgType::Action => self.handle_action_frag(source, &payload, seq, now)?,
                    MsgType::StateUuid => self.handle_state_uuid(source, &payload, now),
                    MsgType::StateMsg => self.handle_state_msg(source, &payload)?,
                    MsgType::Last => self.handle_last(source, &payload),
                    MsgType::Causal => {
                        // Causal barrier completion: surface as a zero-size
                        // service item so the waiter can proceed.
                        self.push_recv(RecvItem::Action {
                            act_type: ActionType::Service,
                            global_seqno: self.global_seqno,
                            local_seqno: seq,
                            source,
                            act_id: 0,
                            is_local: source == self.my_uuid,
                            buf: payload,
                        });
                    }
                    MsgType::Join | MsgType::Sync | MsgType::Flow | MsgType::Component => {
                        // State transfer signalling rides on the ordered
                        // stream but is interpreted by the application.
                        self.push_recv(RecvItem::Action {
                            act_type: ActionType::Service,
                            global_seqno: self.global_seqno,
                            local_seqno: seq,
                            source,
                            act_id: 0,
                            is_local: source == self.my_uuid,
                            buf: payload,
                        });
                    }
                }
            }
            EvsDelivery::TransView(view) => self.on_trans_view(&view),
            EvsDelivery::RegView(view) => self.on_reg_view(view, now)?,
            EvsDelivery::EmptyView => {
                self.closed = true;
                // Fail whatever was still queued so no sender waits on an
                // action that can never be ordered.
                self.sending = None;
                self.pending.clear();
                self.pending_bytes = 0;
                while let Some(entry) = self.fifo.discard_head() {
                    self.push_recv(RecvItem::SendFailed {
                        act_id: entry.act_id,
                        error: GroupError::ConnAborted,
                    });
                }
                self.push_recv(RecvItem::Closed);
            }
        }
        Ok(())
    }

    fn handle_action_frag(
        &mut self,
        source: Uuid,
        payload: &[u8],
        local_seqno: Seqno,
        now: Instant,
    ) -> Result<(), GroupError> {
        let frag = match read_frag(payload) {
            Ok(frag) => frag,
            Err(err) => {
                warn!(%source, %err, "dropping malformed action fragment");
                return Ok(());
            }
        };
        let local = source == self.my_uuid;
        let defrag = self.defrag.entry(source).or_default();
        let completed = match defrag.handle_frag(&frag, local) {
            Ok(completed) => completed,
            Err(err) => {
                warn!(%source, %err, "defragmentation failed, dropping fragment");
                return Ok(());
            }
        };
        let action = match completed {
            Some(action) => action,
            None => return Ok(()),
        };
        if !self.primary {
            debug!(%source, act_id = frag.act_id, "dropping action outside primary component");
            return Ok(());
        }

        self.global_seqno += 1;
        let global_seqno = self.global_seqno;
        let buf = if local {
            let entry = self.fifo.pop(frag.act_id)?;
            Arc::try_unwrap(entry.buf).unwrap_or_else(|shared| (*shared).clone())
        } else {
            action.buf
        };
        if let Some(cache) = &self.cache {
            cache.put(global_seqno, &buf)?;
        }
        self.push_recv(RecvItem::Action {
            act_type: action.act_type,
            global_seqno,
            local_seqno,
            source,
            act_id: frag.act_id,
            is_local: local,
            buf,
        });
        let _ = now;
        Ok(())
    }

    fn handle_state_uuid(&mut self, source: Uuid, payload: &[u8], now: Instant) {
        let uuid = match payload.try_into().map(Uuid::from_bytes) {
            Ok(uuid) => uuid,
            Err(_) => {
                warn!(%source, "malformed state exchange identity");
                return;
            }
        };
        // First identity in the total order wins for everyone.
        match self.exchange.as_mut() {
            Some(exchange) if exchange.adopted.is_none() => {
                exchange.adopted = Some(uuid);
            }
            _ => return,
        }
        debug!(node = %self.my_uuid, state_uuid = %uuid, "state exchange identity adopted");
        let state = self.create_state_message(uuid);
        let mut buf = Vec::new();
        if state.write(&mut buf).is_err() {
            return;
        }
        if let Err(err) =
            self.evs
                .send_user(buf, MsgType::StateMsg as u8, SafetyPrefix::Safe, false, now)
        {
            warn!(%err, "failed to send state message");
        }
    }

    fn handle_state_msg(&mut self, source: Uuid, payload: &[u8]) -> Result<(), GroupError> {
        let state = match StateMessage::read(payload) {
            Ok(state) => state,
            Err(err) => {
                warn!(%source, %err, "dropping malformed state message");
                return Ok(());
            }
        };
        let (complete, view_size) = {
            let exchange = match self.exchange.as_mut() {
                Some(exchange) => exchange,
                None => return Ok(()),
            };
            if exchange.adopted != Some(state.state_uuid) {
                debug!(%source, "state message from a stale exchange round");
                return Ok(());
            }
            exchange.states.insert(source, state);
            (
                exchange.states.len() == exchange.view.members().len(),
                exchange.view.members().len(),
            )
        };
        debug!(node = %self.my_uuid, collected = view_size, "state message collected");
        if complete {
            self.finish_exchange()?;
        }
        Ok(())
    }

    fn handle_last(&mut self, source: Uuid, payload: &[u8]) {
        let seqno = match payload.try_into().map(i64::from_le_bytes) {
            Ok(v) => Seqno(v),
            Err(_) => {
                warn!(%source, "malformed last-applied report");
                return;
            }
        };
        if !self.primary {
            return;
        }
        let view = match &self.current_view {
            Some(view) => view,
            None => return,
        };
        if !view.is_member(source) {
            return;
        }
        let entry = self.last_applied.entry(source).or_insert(Seqno::NONE);
        if seqno > *entry {
            *entry = seqno;
        }
        // The cut advances only when every member has reported.
        if self.last_applied.len() < view.members().len() {
            return;
        }
        let cut = self
            .last_applied
            .values()
            .copied()
            .min()
            .unwrap_or(Seqno::NONE);
        if cut > self.commit_cut {
            self.commit_cut = cut;
            if let Some(cache) = &self.cache {
                if let Err(err) = cache.release_up_to(cut) {
                    warn!(%err, "cache release failed");
                }
            }
            self.push_recv(RecvItem::CommitCut(cut));
        }
    }

    fn on_trans_view(&mut self, view: &View) {
        debug!(node = %self.my_uuid, %view, "transitional view");
        // Everything delivered under the old configuration is already in
        // the receive queue; whatever is still in flight is lost with it.
        for defrag in self.defrag.values_mut() {
            defrag.reset();
        }
        let keep_unstarted = self.pending.len();
        if let Some(progress) = self.sending.take() {
            self.pending_bytes = self.pending_bytes.saturating_sub(progress.buf.len());
        }
        while self.fifo.len() > keep_unstarted {
            if let Some(entry) = self.fifo.discard_head() {
                self.push_recv(RecvItem::SendFailed {
                    act_id: entry.act_id,
                    error: GroupError::ConnReset,
                });
            }
        }
        self.primary = false;
    }

    fn on_reg_view(&mut self, view: View, now: Instant) -> Result<(), GroupError> {
        info!(node = %self.my_uuid, %view, "regular view installed");
        self.current_view = Some(view.clone());
        self.defrag.clear();
        self.last_applied.retain(|uuid, _| view.is_member(*uuid));

        // Synchronous state exchange: propose an identity; the first one
        // delivered in the total order becomes the round's identity.
        let proposed = Uuid::random(&mut self.rng);
        self.exchange = Some(Exchange {
            view,
            proposed,
            adopted: None,
            states: BTreeMap::new(),
        });
        let payload = proposed.as_bytes().to_vec();
        match self.evs.send_user(
            payload,
            MsgType::StateUuid as u8,
            SafetyPrefix::Safe,
            false,
            now,
        ) {
            Ok(_) => {}
            Err(err) => warn!(%err, "failed to send state exchange identity"),
        }
        Ok(())
    }

    fn create_state_message(&self, state_uuid: Uuid) -> StateMessage {
        StateMessage {
            state_uuid,
            group_uuid: self.group_uuid,
            prim_uuid: self.prim_uuid,
            prim_joined: self.prim_joined,
            prim_seqno: self.prim_seqno,
            act_seqno: self.global_seqno,
            prim_state: self.prim_state,
            current_state: self.node_state,
            name: self.my_name.clone(),
            incoming_addr: String::new(),
            proto_min: 0,
            proto_max: 0,
            flags: 0,
        }
    }

    fn finish_exchange(&mut self) -> Result<(), GroupError> {
        let exchange = self.exchange.take().expect("checked by caller");
        let states: Vec<StateMessage> = exchange.states.values().cloned().collect();
        let quorum = compute_quorum(&states)?;
        let view = exchange.view;
        let adopted = exchange.adopted.unwrap_or(exchange.proposed);

        if quorum.primary {
            self.primary = true;
            self.group_uuid = quorum.group_uuid;
            self.global_seqno = quorum.act_seqno;
            self.prim_seqno = quorum.prim_seqno + 1;
            self.prim_uuid = adopted;
            self.prim_joined = view.members().len() as i16;
            if self.node_state == NodeState::NonPrim {
                self.node_state = NodeState::Prim;
            }
            self.prim_state = self.node_state;
            info!(
                node = %self.my_uuid,
                group = ?self.group_uuid,
                prim_seqno = %self.prim_seqno,
                act_seqno = %self.global_seqno,
                members = view.members().len(),
                "primary component established"
            );
        } else {
            self.primary = false;
            if self.node_state == NodeState::Prim {
                self.node_state = NodeState::NonPrim;
            }
            warn!(node = %self.my_uuid, "non-primary component");
        }

        let my_index = view.members().keys().position(|u| *u == self.my_uuid);
        let conf = Configuration {
            view,
            primary: self.primary,
            my_index,
            group_uuid: self.group_uuid,
            act_seqno: self.global_seqno,
            prim_seqno: self.prim_seqno,
        };
        self.push_recv(RecvItem::ConfChange(conf));
        Ok(())
    }

    fn push_recv(&mut self, item: RecvItem) {
        self.recv_q_bytes += item.weight();
        self.recv_q.push_back(item);
        if !self.fc_paused && self.recv_q_bytes > self.cfg.fc_limit {
            debug!(bytes = self.recv_q_bytes, "receive queue over limit, pausing senders");
            self.fc_paused = true;
        }
    }

    /// Drain the next ordered item.
    pub fn poll_recv(&mut self) -> Option<RecvItem> {
        let item = self.recv_q.pop_front()?;
        self.recv_q_bytes -= item.weight();
        if self.fc_paused
            && (self.recv_q_bytes as f64) < self.cfg.fc_limit as f64 * self.cfg.fc_factor
        {
            self.fc_paused = false;
        }
        Some(item)
    }

    pub fn recv_queue_len(&self) -> usize {
        self.recv_q.len()
    }
}

impl std::fmt::Debug for GroupCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupCore")
            .field("uuid", &self.my_uuid)
            .field("state", &self.node_state)
            .field("primary", &self.primary)
            .field("global_seqno", &self.global_seqno)
            .field("evs", &self.evs)
            .finish()
    }
}
