//! The EVS protocol engine.
//!
//! Sans-io: the engine consumes parsed messages and timer ticks with an
//! explicit `now`, and produces serialized datagrams (`poll_transmit`) and
//! upward deliveries (`poll_delivery`). It owns no sockets, threads or
//! clocks, which is what makes the multi-node simulations in the tests
//! deterministic.

use crate::consensus::Consensus;
use crate::input_map::{InputMap, MsgKey};
use crate::message::{
    DelayedListMessage, GapMessage, LeaveMessage, MembershipMessage, Message, MessageNode,
    MessageNodeList, MessageType, UserMessage, F_COMMIT, F_MSG_MORE, F_RETRANS,
};
use crate::node::{Node, NodeMap, INVALID_INDEX};
use crate::timer::{Timer, TimerList};
use crate::EvsError;
use relicast_proto::{
    Member, Range, SafetyPrefix, SegmentId, Seqno, Uuid, View, ViewId, ViewType,
};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoState {
    Closed,
    Joining,
    Gather,
    Install,
    Operational,
    Leaving,
}

impl ProtoState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtoState::Closed => "CLOSED",
            ProtoState::Joining => "JOINING",
            ProtoState::Gather => "GATHER",
            ProtoState::Install => "INSTALL",
            ProtoState::Operational => "OPERATIONAL",
            ProtoState::Leaving => "LEAVING",
        }
    }
}

/// Upward delivery from the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EvsDelivery {
    /// An ordered user message. `seq` is the EVS seqno within the current
    /// view; the group layer maps it onto the global action seqno.
    Message {
        source: Uuid,
        user_type: u8,
        safety: SafetyPrefix,
        seq: Seqno,
        payload: Vec<u8>,
    },
    /// Agreed cut of the old membership before a new view installs.
    TransView(View),
    /// The new regular view.
    RegView(View),
    /// Final delivery after a voluntary leave completed.
    EmptyView,
}

/// Engine tuning. Defaults match the documented configuration keys.
#[derive(Debug, Clone)]
pub struct ProtoConfig {
    pub send_window: i64,
    pub user_send_window: i64,
    pub suspect_timeout: Duration,
    pub inactive_timeout: Duration,
    pub inactive_check_period: Duration,
    pub retrans_period: Duration,
    pub join_retrans_period: Duration,
    pub install_timeout: Duration,
    pub max_install_timeouts: u32,
    pub stats_report_period: Duration,
    pub view_forget_timeout: Duration,
    pub delay_margin: Duration,
    pub delayed_keep_period: Duration,
    pub auto_evict: u8,
    pub causal_keepalive_period: Duration,
}

impl Default for ProtoConfig {
    fn default() -> Self {
        ProtoConfig {
            send_window: 32,
            user_send_window: 16,
            suspect_timeout: Duration::from_secs(5),
            inactive_timeout: Duration::from_secs(15),
            inactive_check_period: Duration::from_millis(500),
            retrans_period: Duration::from_secs(1),
            join_retrans_period: Duration::from_secs(1),
            install_timeout: Duration::from_millis(7500),
            max_install_timeouts: 3,
            stats_report_period: Duration::from_secs(60),
            view_forget_timeout: Duration::from_secs(300),
            delay_margin: Duration::from_secs(1),
            delayed_keep_period: Duration::from_secs(30),
            auto_evict: 0,
            causal_keepalive_period: Duration::ZERO,
        }
    }
}

/// Delivery and traffic counters, reported on the stats timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoStats {
    pub sent_user: u64,
    pub sent_gap: u64,
    pub sent_join: u64,
    pub sent_install: u64,
    pub sent_leave: u64,
    pub sent_delayed_list: u64,
    pub retransmitted: u64,
    pub recovered: u64,
    pub delivered_safe: u64,
    pub delivered_agreed: u64,
    pub delivered_fifo: u64,
    pub delivered_causal: u64,
}

struct CausalEntry {
    user_type: u8,
    payload: Vec<u8>,
    aru_at_enqueue: Seqno,
}

pub struct Proto {
    cfg: ProtoConfig,
    my_uuid: Uuid,
    my_name: String,
    state: ProtoState,
    known: NodeMap,
    input_map: InputMap,
    current_view: View,
    previous_view: Option<View>,
    /// Views whose traffic is stale and silently dropped, with the time the
    /// view was left behind.
    previous_views: BTreeMap<ViewId, Instant>,
    /// View ids seen during the current gather round.
    gather_views: BTreeSet<ViewId>,
    install_message: Option<MembershipMessage>,
    fifo_seq: i64,
    last_sent: Seqno,
    last_acked_aru: Seqno,
    max_view_id_seq: u32,
    install_timeout_count: u32,
    pending_leave: bool,
    leave_seq: Seqno,
    delivering: bool,
    evicted: BTreeMap<Uuid, Instant>,
    delayed_counts: BTreeMap<Uuid, u8>,
    causal_queue: VecDeque<CausalEntry>,
    last_sent_join: Option<Instant>,
    timers: TimerList,
    transmit: VecDeque<Vec<u8>>,
    delivery: VecDeque<EvsDelivery>,
    stats: ProtoStats,
}

impl Proto {
    pub fn new(
        cfg: ProtoConfig,
        my_uuid: Uuid,
        my_name: &str,
        segment: SegmentId,
        now: Instant,
    ) -> Self {
        let mut known = NodeMap::new();
        let mut self_node = Node::new(segment, now);
        self_node.index = 0;
        known.insert(my_uuid, self_node);

        let mut input_map = InputMap::new();
        // The pre-connect pseudo view contains only ourselves.
        input_map
            .insert_sender(my_uuid)
            .expect("fresh input map accepts the first sender");

        let mut current_view = View::new(ViewId::new(ViewType::Trans, my_uuid, 0));
        current_view.add_member(
            my_uuid,
            Member {
                name: my_name.to_owned(),
                segment,
            },
        );

        Proto {
            cfg,
            my_uuid,
            my_name: my_name.to_owned(),
            state: ProtoState::Closed,
            known,
            input_map,
            current_view,
            previous_view: None,
            previous_views: BTreeMap::new(),
            gather_views: BTreeSet::new(),
            install_message: None,
            fifo_seq: 0,
            last_sent: Seqno::NONE,
            last_acked_aru: Seqno::NONE,
            max_view_id_seq: 0,
            install_timeout_count: 0,
            pending_leave: false,
            leave_seq: Seqno::NONE,
            delivering: false,
            evicted: BTreeMap::new(),
            delayed_counts: BTreeMap::new(),
            causal_queue: VecDeque::new(),
            last_sent_join: None,
            timers: TimerList::new(),
            transmit: VecDeque::new(),
            delivery: VecDeque::new(),
            stats: ProtoStats::default(),
        }
    }

    pub fn state(&self) -> ProtoState {
        self.state
    }

    pub fn uuid(&self) -> Uuid {
        self.my_uuid
    }

    pub fn current_view(&self) -> &View {
        &self.current_view
    }

    /// The last regular view before the current one, if any.
    pub fn previous_view(&self) -> Option<&View> {
        self.previous_view.as_ref()
    }

    pub fn stats(&self) -> ProtoStats {
        self.stats
    }

    pub fn aru_seq(&self) -> Seqno {
        self.input_map.aru_seq()
    }

    pub fn safe_seq(&self) -> Seqno {
        self.input_map.safe_seq()
    }

    /// Pop the next serialized datagram to multicast.
    pub fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        self.transmit.pop_front()
    }

    /// Pop the next upward delivery.
    pub fn poll_delivery(&mut self) -> Option<EvsDelivery> {
        self.delivery.pop_front()
    }

    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    fn next_fifo_seq(&mut self) -> i64 {
        let seq = self.fifo_seq;
        self.fifo_seq += 1;
        seq
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn connect(&mut self, now: Instant) {
        self.shift_to(ProtoState::Joining, now);
        self.send_join(now);
        self.shift_to(ProtoState::Gather, now);
    }

    /// Leave without waiting for the departure to be safely delivered: the
    /// leave is multicast best-effort and the engine closes at once.
    pub fn force_close(&mut self, now: Instant) {
        if self.state == ProtoState::Closed {
            return;
        }
        if self.state == ProtoState::Operational {
            self.shift_to(ProtoState::Leaving, now);
            self.send_leave(now);
        }
        if self.state != ProtoState::Closed {
            self.delivery.push_back(EvsDelivery::EmptyView);
            self.shift_to(ProtoState::Closed, now);
        }
    }

    pub fn close(&mut self, now: Instant) {
        debug!(node = %self.my_uuid, state = self.state.as_str(), "closing");
        match self.state {
            // Shifting to LEAVING out of a gather round would reset timers
            // and could prevent the remaining nodes from forming the new
            // group; postpone until the round settles.
            ProtoState::Gather | ProtoState::Install => {
                self.pending_leave = true;
            }
            ProtoState::Operational => {
                self.shift_to(ProtoState::Leaving, now);
                self.send_leave(now);
                self.check_leave_complete(now);
            }
            ProtoState::Joining => {
                self.delivery.push_back(EvsDelivery::EmptyView);
                self.shift_to(ProtoState::Closed, now);
            }
            ProtoState::Leaving | ProtoState::Closed => {}
        }
    }

    /// Transport indicates a new component: new peers appear, missing ones
    /// are marked non-operational, and a gather round starts.
    pub fn handle_component(&mut self, members: &[(Uuid, SegmentId)], now: Instant) {
        if matches!(self.state, ProtoState::Closed | ProtoState::Leaving) {
            return;
        }
        let listed: BTreeSet<Uuid> = members.iter().map(|(u, _)| *u).collect();
        for (uuid, segment) in members {
            if *uuid == self.my_uuid || self.evicted.contains_key(uuid) {
                continue;
            }
            self.known
                .entry(*uuid)
                .or_insert_with(|| Node::new(*segment, now));
        }
        let vanished: Vec<Uuid> = self
            .known
            .iter()
            .filter(|(u, n)| n.operational && !listed.contains(u) && **u != self.my_uuid)
            .map(|(u, _)| *u)
            .collect();
        for uuid in vanished {
            self.set_inactive(uuid, now);
        }
        match self.state {
            ProtoState::Joining | ProtoState::Operational => {
                self.shift_to(ProtoState::Gather, now);
                self.send_join(now);
            }
            ProtoState::Gather | ProtoState::Install => {
                self.send_join(now);
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    fn is_flow_control(&self, seq: Seqno, win: i64) -> bool {
        seq.get() > self.input_map.aru_seq().get() + win
    }

    /// Multicast a user payload. `more` marks that further fragments of the
    /// same action follow immediately; peers suppress acks until a message
    /// without it.
    pub fn send_user(
        &mut self,
        payload: Vec<u8>,
        user_type: u8,
        safety: SafetyPrefix,
        more: bool,
        now: Instant,
    ) -> Result<Seqno, EvsError> {
        if self.state != ProtoState::Operational {
            return Err(EvsError::NotConnected(self.state.as_str()));
        }
        let seq = self.last_sent + 1;
        let win = std::cmp::min(self.cfg.send_window, self.cfg.user_send_window);
        if self.is_flow_control(seq, win) {
            return Err(EvsError::WouldBlock);
        }
        self.last_sent = seq;
        let msg = UserMessage {
            source: self.my_uuid,
            source_view_id: self.current_view.id(),
            seq,
            seq_range: 0,
            aru_seq: self.input_map.aru_seq(),
            safety_prefix: safety,
            user_type,
            flags: if more { F_MSG_MORE } else { 0 },
        };
        self.transmit_user(&msg, &payload)?;
        self.stats.sent_user += 1;

        let index = self.self_index();
        self.input_map.insert(index, msg, payload)?;
        let aru = self.input_map.aru_seq();
        if !aru.is_none() {
            self.input_map.set_safe_seq(index, aru)?;
        }
        self.deliver(now);
        Ok(seq)
    }

    /// Complete our own stream up to `high_seq` with an empty drop-prefix
    /// message. The seqno space is shared: every member must emit every
    /// seqno for the group ARU to advance, so quiet members fill their
    /// streams with these whenever someone else's traffic runs ahead.
    fn complete_user(&mut self, high_seq: Seqno, now: Instant) {
        // Stream completion keeps running through gather rounds: the group
        // aru must still reach the agreed cut so leavers and installs can
        // make progress.
        if matches!(self.state, ProtoState::Closed | ProtoState::Joining) {
            return;
        }
        let first = self.last_sent + 1;
        if first > high_seq {
            return;
        }
        if self.is_flow_control(high_seq, self.cfg.send_window) {
            return;
        }
        let span = high_seq.get() - first.get();
        let seq_range = std::cmp::min(span, u8::MAX as i64) as u8;
        let msg = UserMessage {
            source: self.my_uuid,
            source_view_id: self.current_view.id(),
            seq: first,
            seq_range,
            aru_seq: self.input_map.aru_seq(),
            safety_prefix: SafetyPrefix::Drop,
            user_type: 0xff,
            flags: 0,
        };
        self.last_sent = first + seq_range as i64;
        if self.transmit_user(&msg, &[]).is_err() {
            return;
        }
        let index = self.self_index();
        if self.input_map.insert(index, msg, Vec::new()).is_ok() {
            let aru = self.input_map.aru_seq();
            if !aru.is_none() {
                let _ = self.input_map.set_safe_seq(index, aru);
            }
        }
        let _ = now;
    }

    /// Local causal read barrier: delivered back to self once every action
    /// that was globally ordered before it has been delivered here.
    pub fn send_causal(&mut self, payload: Vec<u8>, user_type: u8, now: Instant) {
        let aru = self.input_map.aru_seq();
        if self.input_map.safe_seq() >= aru {
            self.stats.delivered_causal += 1;
            self.delivery.push_back(EvsDelivery::Message {
                source: self.my_uuid,
                user_type,
                safety: SafetyPrefix::Fifo,
                seq: Seqno::NONE,
                payload,
            });
        } else {
            self.causal_queue.push_back(CausalEntry {
                user_type,
                payload,
                aru_at_enqueue: aru,
            });
        }
        let _ = now;
    }

    fn transmit_user(&mut self, msg: &UserMessage, payload: &[u8]) -> Result<(), EvsError> {
        let mut buf = Vec::with_capacity(64 + payload.len());
        Message::User(*msg).write(&mut buf)?;
        buf.extend_from_slice(payload);
        self.transmit.push_back(buf);
        Ok(())
    }

    fn transmit_msg(&mut self, msg: &Message) -> Result<(), EvsError> {
        let mut buf = Vec::new();
        msg.write(&mut buf)?;
        self.transmit.push_back(buf);
        Ok(())
    }

    fn self_index(&self) -> usize {
        self.known[&self.my_uuid].index
    }

    fn send_gap(
        &mut self,
        range_uuid: Uuid,
        view_id: ViewId,
        range: Range,
        commit: bool,
        now: Instant,
    ) {
        let msg = Message::Gap(GapMessage {
            source: self.my_uuid,
            source_view_id: view_id,
            seq: self.last_sent,
            aru_seq: self.input_map.aru_seq(),
            range_uuid,
            range,
            flags: if commit { F_COMMIT } else { 0 },
        });
        if self.transmit_msg(&msg).is_ok() {
            self.stats.sent_gap += 1;
            self.last_acked_aru = self.input_map.aru_seq();
        }
        let _ = now;
    }

    fn populate_node_list(&self) -> MessageNodeList {
        let mut list = MessageNodeList::new();
        for (uuid, node) in &self.known {
            let in_view = self.current_view.is_member(*uuid);
            // Members of our view are described from our input map; foreign
            // nodes by their own claims, so that joins from different views
            // can converge on identical node lists.
            let (view_id, safe_seq, im_range) = if in_view && node.index != INVALID_INDEX {
                (
                    self.current_view.id(),
                    self.input_map.sender_safe_seq(node.index),
                    self.input_map.range(node.index),
                )
            } else if let Some(jm) = &node.join_message {
                let claim = jm.node_list.get(uuid);
                (
                    jm.source_view_id,
                    claim.map(|e| e.safe_seq).unwrap_or(Seqno::NONE),
                    claim.map(|e| e.im_range).unwrap_or_default(),
                )
            } else {
                (ViewId::nil(), Seqno::NONE, Range::default())
            };
            list.insert(
                *uuid,
                MessageNode {
                    operational: node.operational,
                    leaving: node.leave_message.is_some(),
                    suspected: node.suspected,
                    evicted: self.evicted.contains_key(uuid),
                    segment: node.segment,
                    leave_seq: node
                        .leave_message
                        .as_ref()
                        .map(|m| m.seq)
                        .unwrap_or(Seqno::NONE),
                    view_id,
                    safe_seq,
                    im_range,
                },
            );
        }
        list
    }

    fn create_join(&mut self) -> MembershipMessage {
        MembershipMessage {
            msg_type: MessageType::Join,
            source: self.my_uuid,
            source_view_id: self.current_view.id(),
            seq: self.input_map.safe_seq(),
            aru_seq: self.input_map.aru_seq(),
            fifo_seq: self.next_fifo_seq(),
            install_view_id: ViewId::nil(),
            node_list: self.populate_node_list(),
            flags: 0,
        }
    }

    fn send_join(&mut self, now: Instant) {
        let join = self.create_join();
        if let Some(node) = self.known.get_mut(&self.my_uuid) {
            node.set_join_message(join.clone());
        }
        if self.transmit_msg(&Message::Join(join.clone())).is_ok() {
            self.stats.sent_join += 1;
            self.last_sent_join = Some(now);
        }
        self.handle_join(&join, now);
    }

    fn send_install(&mut self, now: Instant) {
        let install_view_id = ViewId::new(ViewType::Reg, self.my_uuid, self.max_view_id_seq + 1);
        let install = MembershipMessage {
            msg_type: MessageType::Install,
            source: self.my_uuid,
            source_view_id: self.current_view.id(),
            seq: self.input_map.safe_seq(),
            aru_seq: self.input_map.aru_seq(),
            fifo_seq: self.next_fifo_seq(),
            install_view_id,
            node_list: self.populate_node_list(),
            flags: 0,
        };
        info!(node = %self.my_uuid, view = %install_view_id, "sending install");
        if self.transmit_msg(&Message::Install(install.clone())).is_ok() {
            self.stats.sent_install += 1;
        }
        self.handle_install(&install, now);
    }

    fn send_leave(&mut self, now: Instant) {
        self.leave_seq = self.last_sent;
        let leave = LeaveMessage {
            source: self.my_uuid,
            source_view_id: self.current_view.id(),
            seq: self.last_sent,
            aru_seq: self.input_map.aru_seq(),
            fifo_seq: self.next_fifo_seq(),
            flags: 0,
        };
        if self.transmit_msg(&Message::Leave(leave)).is_ok() {
            self.stats.sent_leave += 1;
        }
        self.handle_leave(&leave, now);
    }

    fn send_delayed_list(&mut self, now: Instant) {
        if self.delayed_counts.is_empty() {
            return;
        }
        let msg = DelayedListMessage {
            source: self.my_uuid,
            source_view_id: self.current_view.id(),
            fifo_seq: self.next_fifo_seq(),
            delayed: self.delayed_counts.clone(),
            flags: 0,
        };
        if self.transmit_msg(&Message::DelayedList(msg.clone())).is_ok() {
            self.stats.sent_delayed_list += 1;
        }
        self.handle_delayed_list(&msg, now);
    }

    // ------------------------------------------------------------------
    // Message handling
    // ------------------------------------------------------------------

    /// Entry point for a parsed datagram.
    pub fn handle_msg(&mut self, msg: Message, payload: Vec<u8>, now: Instant) {
        if self.state == ProtoState::Closed {
            return;
        }
        let source = msg.source();
        if source == self.my_uuid {
            // Own multicast looped back by the transport; everything was
            // already handled at send time.
            return;
        }
        if self.evicted.contains_key(&source) {
            debug!(%source, "dropping message from evicted node");
            return;
        }
        if !self.known.contains_key(&source) {
            self.handle_foreign(&msg, now);
        }
        if let Some(node) = self.known.get_mut(&source) {
            node.seen_tstamp = now;
            if let Some(fifo) = msg.fifo_seq() {
                if fifo <= node.fifo_seq {
                    warn!(%source, fifo, last = node.fifo_seq,
                          "dropping out-of-fifo membership message");
                    return;
                }
                node.fifo_seq = fifo;
            }
        }
        if self.previous_views.contains_key(&msg.source_view_id()) {
            debug!(%source, view = %msg.source_view_id(), "dropping message from forgotten view");
            return;
        }

        match msg {
            Message::User(m) => self.handle_user(&m, payload, now),
            Message::Delegate(_) => self.handle_delegate(payload, now),
            Message::Gap(m) => self.handle_gap(&m, now),
            Message::Join(m) => self.handle_join(&m, now),
            Message::Install(m) => self.handle_install(&m, now),
            Message::Leave(m) => self.handle_leave(&m, now),
            Message::DelayedList(m) => self.handle_delayed_list(&m, now),
        }
    }

    /// First contact with a node outside `known`: track it, and if we are
    /// settled, open a gather round to merge it in.
    fn handle_foreign(&mut self, msg: &Message, now: Instant) {
        if matches!(self.state, ProtoState::Leaving | ProtoState::Closed) {
            return;
        }
        let source = msg.source();
        debug!(node = %self.my_uuid, %source, "foreign node appeared");
        self.known.insert(source, Node::new(0, now));
        if msg.is_membership() && self.state == ProtoState::Operational {
            self.shift_to(ProtoState::Gather, now);
            self.send_join(now);
        }
    }

    fn handle_user(&mut self, msg: &UserMessage, payload: Vec<u8>, now: Instant) {
        if matches!(self.state, ProtoState::Joining | ProtoState::Closed) {
            return;
        }
        if msg.source_view_id != self.current_view.id() {
            if matches!(self.state, ProtoState::Gather | ProtoState::Install) {
                self.gather_views.insert(msg.source_view_id);
            }
            debug!(source = %msg.source, view = %msg.source_view_id,
                   "dropping user message from different view");
            return;
        }
        let index = match self.known.get(&msg.source) {
            Some(node) if node.index != INVALID_INDEX => node.index,
            _ => {
                debug!(source = %msg.source, "user message from node without input map slot");
                return;
            }
        };

        let range_before = self.input_map.range(index);
        match self.input_map.insert(index, *msg, payload) {
            Ok(_) => {}
            Err(EvsError::OutOfRange { seq, low, high }) => {
                warn!(source = %msg.source, seq, low, high, "user message outside window");
                return;
            }
            Err(err) => {
                warn!(source = %msg.source, %err, "input map insert failed");
                return;
            }
        }
        if let Some(node) = self.known.get_mut(&msg.source) {
            node.tstamp = now;
        }

        // Sender's aru declares its safe contribution for its own stream.
        let local_aru = self.input_map.aru_seq();
        let sender_safe = std::cmp::min(msg.aru_seq, local_aru);
        if !sender_safe.is_none() {
            let _ = self.input_map.set_safe_seq(index, sender_safe);
        }
        // And our own acknowledgment rides on our own slot.
        let self_index = self.self_index();
        let own_safe = self.input_map.aru_seq();
        if !own_safe.is_none() {
            let _ = self.input_map.set_safe_seq(self_index, own_safe);
        }

        // Gap in the sender's stream: request a retransmission, rate
        // limited per sender.
        if msg.seq > range_before.hs() + 1 {
            let req = Range::new(range_before.lu(), msg.seq - 1);
            self.request_retrans(msg.source, msg.source, req, now);
        }

        // Keep our own stream abreast of the sender's, unless the sender
        // announced more traffic right behind (mid-action fragments).
        let high = msg.seq + msg.seq_range as i64;
        if msg.flags & F_MSG_MORE == 0 && self.last_sent < high {
            self.complete_user(high, now);
        }

        // Ack when the aru moved and we have nothing of our own to carry it.
        if msg.flags & F_MSG_MORE == 0 && self.input_map.aru_seq() > self.last_acked_aru {
            self.send_gap(Uuid::nil(), self.current_view.id(), Range::default(), false, now);
        }

        self.deliver(now);
        if self.state == ProtoState::Install {
            self.check_install_progress(now);
        }
    }

    /// A delegate datagram embeds a complete message from a third node.
    fn handle_delegate(&mut self, payload: Vec<u8>, now: Instant) {
        match Message::read(&payload, None) {
            Ok((inner, offset)) => {
                if matches!(inner, Message::Delegate(_)) {
                    warn!("nested delegate message dropped");
                    return;
                }
                let inner_payload = payload[offset..].to_vec();
                self.stats.recovered += 1;
                self.handle_msg(inner, inner_payload, now);
            }
            Err(err) => {
                warn!(%err, "malformed delegate payload");
            }
        }
    }

    fn handle_gap(&mut self, msg: &GapMessage, now: Instant) {
        // Commit/installed signalling for a pending install travels as a
        // gap in the *new* view.
        if let Some(install) = self.install_message.clone() {
            if msg.source_view_id == install.install_view_id {
                if let Some(node) = self.known.get_mut(&msg.source) {
                    if msg.is_commit() {
                        node.committed = true;
                    } else {
                        node.installed = true;
                    }
                    node.tstamp = now;
                }
                self.check_install_progress(now);
                return;
            }
        }
        if msg.source_view_id != self.current_view.id() {
            debug!(source = %msg.source, view = %msg.source_view_id,
                   "dropping gap from different view");
            return;
        }
        let index = match self.known.get_mut(&msg.source) {
            Some(node) if node.index != INVALID_INDEX => {
                node.tstamp = now;
                node.index
            }
            _ => return,
        };

        // The gap's aru acknowledges everything the sender holds.
        let local_aru = self.input_map.aru_seq();
        let sender_safe = std::cmp::min(msg.aru_seq, local_aru);
        if !sender_safe.is_none() {
            let _ = self.input_map.set_safe_seq(index, sender_safe);
        }
        if !local_aru.is_none() {
            let self_index = self.self_index();
            let _ = self.input_map.set_safe_seq(self_index, local_aru);
        }

        // Non-empty range: a retransmission request.
        if !msg.range.is_empty() {
            if msg.range_uuid == self.my_uuid {
                self.resend(msg.source, msg.range, now);
            } else {
                self.recover(msg.source, msg.range_uuid, msg.range, now);
            }
        }

        self.deliver(now);
        if self.state == ProtoState::Install {
            self.check_install_progress(now);
        } else if self.state == ProtoState::Leaving {
            self.check_leave_complete(now);
        }
    }

    fn handle_join(&mut self, msg: &MembershipMessage, now: Instant) {
        if matches!(self.state, ProtoState::Leaving | ProtoState::Closed) {
            return;
        }
        debug!(node = %self.my_uuid, source = %msg.source, "handling join");
        self.gather_views.insert(msg.source_view_id);
        self.max_view_id_seq = std::cmp::max(self.max_view_id_seq, msg.source_view_id.seq());

        if let Some(node) = self.known.get_mut(&msg.source) {
            node.set_join_message(msg.clone());
            node.tstamp = now;
            if !node.inactive {
                node.operational = true;
            }
        }

        // Union the sender's world view into ours.
        for (uuid, entry) in &msg.node_list {
            self.max_view_id_seq = std::cmp::max(self.max_view_id_seq, entry.view_id.seq());
            if *uuid == self.my_uuid || self.known.contains_key(uuid) {
                continue;
            }
            if entry.evicted || self.evicted.contains_key(uuid) {
                continue;
            }
            let mut node = Node::new(entry.segment, now);
            node.operational = entry.operational;
            self.known.insert(*uuid, node);
        }

        let from_self = msg.source == self.my_uuid;
        match self.state {
            ProtoState::Joining => {
                self.shift_to(ProtoState::Gather, now);
            }
            ProtoState::Operational => {
                if !from_self {
                    self.shift_to(ProtoState::Gather, now);
                    self.send_join(now);
                    return;
                }
            }
            ProtoState::Install => {
                if !from_self {
                    let consistent = self
                        .install_message
                        .as_ref()
                        .map(|im| Consensus::equal(msg, im))
                        .unwrap_or(false);
                    if !consistent {
                        debug!(source = %msg.source, "inconsistent join during install");
                        self.install_message = None;
                        self.shift_to(ProtoState::Gather, now);
                        self.send_join(now);
                        return;
                    }
                }
            }
            _ => {}
        }

        if !from_self && msg.source_view_id == self.current_view.id() {
            self.update_im_safe_seqs(&msg.node_list);
            self.retrans_missing(&msg.node_list, now);
        }

        // Refresh our own join if the world changed under it.
        if !from_self {
            let needs_refresh = match self.known.get(&self.my_uuid).and_then(|n| n.join_message.as_ref()) {
                Some(my_jm) => {
                    let fresh = self.preview_join(my_jm);
                    !Consensus::equal(&fresh, my_jm)
                }
                None => true,
            };
            if needs_refresh {
                self.send_join(now);
                return;
            }
        }

        if self.state == ProtoState::Gather && self.is_consensus() {
            if self.is_representative(self.my_uuid) {
                self.send_install(now);
            }
        }
    }

    /// A copy of what our join would look like right now, without bumping
    /// the fifo counter.
    fn preview_join(&self, old: &MembershipMessage) -> MembershipMessage {
        MembershipMessage {
            msg_type: MessageType::Join,
            source: self.my_uuid,
            source_view_id: self.current_view.id(),
            seq: self.input_map.safe_seq(),
            aru_seq: self.input_map.aru_seq(),
            fifo_seq: old.fifo_seq,
            install_view_id: ViewId::nil(),
            node_list: self.populate_node_list(),
            flags: 0,
        }
    }

    fn handle_install(&mut self, msg: &MembershipMessage, now: Instant) {
        if matches!(self.state, ProtoState::Leaving | ProtoState::Closed) {
            return;
        }
        if !matches!(self.state, ProtoState::Gather | ProtoState::Install) {
            debug!(state = self.state.as_str(), "install out of gather; restarting round");
            self.shift_to(ProtoState::Gather, now);
            self.send_join(now);
            return;
        }
        if !msg.node_list.contains_key(&self.my_uuid) {
            debug!(node = %self.my_uuid, "install excludes us; waiting out the round");
            return;
        }
        if !self.is_representative(msg.source) {
            warn!(source = %msg.source, "install from non-representative");
            return;
        }
        let consistent = {
            let consensus = Consensus {
                known: &self.known,
                current_view: &self.current_view,
                input_map: &self.input_map,
                self_uuid: self.my_uuid,
            };
            consensus.is_consistent(msg)
        };
        if !consistent && msg.source != self.my_uuid {
            debug!(source = %msg.source, "inconsistent install; pushing own state");
            self.send_join(now);
            return;
        }
        self.max_view_id_seq =
            std::cmp::max(self.max_view_id_seq, msg.install_view_id.seq());
        self.install_message = Some(msg.clone());
        if let Some(node) = self.known.get_mut(&msg.source) {
            node.tstamp = now;
        }
        self.shift_to(ProtoState::Install, now);
        // Commit to the proposal.
        if let Some(node) = self.known.get_mut(&self.my_uuid) {
            node.committed = true;
        }
        self.send_gap(
            Uuid::nil(),
            msg.install_view_id,
            Range::default(),
            true,
            now,
        );
        self.check_install_progress(now);
    }

    fn handle_leave(&mut self, msg: &LeaveMessage, now: Instant) {
        let from_self = msg.source == self.my_uuid;
        if let Some(node) = self.known.get_mut(&msg.source) {
            node.set_leave_message(*msg);
            node.operational = false;
            node.tstamp = now;
        }
        // Unlike an inactive peer, a leaver keeps its input map slot in the
        // aru minimum: its stream is complete up to the leave seqno and must
        // cap the agreed cut there, not vanish from it.
        if from_self {
            return;
        }
        if msg.source_view_id != self.current_view.id() {
            return;
        }
        // The leaver's messages up to its declared seq stay deliverable;
        // acknowledge what we hold so it can finish its shutdown.
        self.send_gap(Uuid::nil(), self.current_view.id(), Range::default(), false, now);
        match self.state {
            ProtoState::Operational => {
                self.shift_to(ProtoState::Gather, now);
                self.send_join(now);
            }
            ProtoState::Gather => {
                self.send_join(now);
            }
            _ => {}
        }
    }

    fn handle_delayed_list(&mut self, msg: &DelayedListMessage, now: Instant) {
        if let Some(node) = self.known.get_mut(&msg.source) {
            node.delayed_list_message = Some(msg.clone());
        }
        if self.cfg.auto_evict == 0 {
            return;
        }
        // Evict when a majority of operational nodes report the same peer
        // at or above the threshold.
        let threshold = self.cfg.auto_evict;
        let operational: Vec<Uuid> = self
            .known
            .iter()
            .filter(|(_, n)| n.operational)
            .map(|(u, _)| *u)
            .collect();
        let majority = operational.len() / 2 + 1;
        let candidates: BTreeSet<Uuid> = msg
            .delayed
            .iter()
            .filter(|(_, cnt)| **cnt >= threshold)
            .map(|(u, _)| *u)
            .collect();
        for target in candidates {
            if target == self.my_uuid || self.evicted.contains_key(&target) {
                continue;
            }
            let mut reports = 0usize;
            for uuid in &operational {
                let reported = if *uuid == self.my_uuid {
                    self.delayed_counts.get(&target).copied().unwrap_or(0) >= threshold
                } else {
                    self.known[uuid]
                        .delayed_list_message
                        .as_ref()
                        .and_then(|m| m.delayed.get(&target))
                        .map(|cnt| *cnt >= threshold)
                        .unwrap_or(false)
                };
                if reported {
                    reports += 1;
                }
            }
            if reports >= majority {
                warn!(node = %self.my_uuid, %target, "auto-evicting chronically delayed node");
                self.evicted.insert(target, now);
                self.set_inactive(target, now);
            }
        }
    }

    // ------------------------------------------------------------------
    // Retransmission
    // ------------------------------------------------------------------

    /// Ask `target` to resend `range` of `origin`'s stream, rate limited
    /// per (target, range).
    fn request_retrans(&mut self, target: Uuid, origin: Uuid, range: Range, now: Instant) {
        if let Some(node) = self.known.get_mut(&target) {
            if let Some((last_range, at)) = node.last_requested_range {
                if last_range == range
                    && now.saturating_duration_since(at) < self.cfg.retrans_period
                {
                    return;
                }
            }
            node.last_requested_range = Some((range, now));
        }
        debug!(node = %self.my_uuid, %target, %origin, %range, "requesting retransmission");
        self.send_gap(origin, self.current_view.id(), range, false, now);
    }

    /// Resend our own messages in `range`.
    fn resend(&mut self, _requestor: Uuid, range: Range, now: Instant) {
        let index = self.self_index();
        let mut seq = std::cmp::max(range.lu(), Seqno::ZERO);
        let hs = std::cmp::min(range.hs(), self.last_sent);
        while seq <= hs {
            if let Some(stored) = self.input_map.recover(index, seq) {
                let mut msg = stored.msg;
                msg.flags |= F_RETRANS;
                msg.aru_seq = self.input_map.aru_seq();
                let payload = stored.payload.clone();
                if self.transmit_user(&msg, &payload).is_ok() {
                    self.stats.retransmitted += 1;
                }
            }
            seq += 1;
        }
        let _ = now;
    }

    /// Forward stored messages of `origin` as delegate datagrams, for a
    /// requestor that can no longer reach the origin.
    fn recover(&mut self, _requestor: Uuid, origin: Uuid, range: Range, now: Instant) {
        let index = match self.known.get(&origin) {
            Some(node) if node.index != INVALID_INDEX => node.index,
            _ => return,
        };
        let mut seq = std::cmp::max(range.lu(), Seqno::ZERO);
        while seq <= range.hs() {
            if let Some(stored) = self.input_map.recover(index, seq) {
                let mut inner = Vec::new();
                let mut msg = stored.msg;
                msg.flags |= F_RETRANS;
                if Message::User(msg).write(&mut inner).is_ok() {
                    inner.extend_from_slice(&stored.payload);
                    let delegate = Message::Delegate(crate::message::DelegateMessage {
                        source: self.my_uuid,
                        source_view_id: self.current_view.id(),
                        flags: 0,
                    });
                    let mut buf = Vec::new();
                    if delegate.write(&mut buf).is_ok() {
                        buf.extend_from_slice(&inner);
                        self.transmit.push_back(buf);
                        self.stats.recovered += 1;
                    }
                }
            }
            seq += 1;
        }
        let _ = now;
    }

    /// On a peer's join: resend what the peer is missing from us, and
    /// recover third-party messages it lacks but we hold.
    fn retrans_missing(&mut self, node_list: &MessageNodeList, now: Instant) {
        let current = self.current_view.id();
        if let Some(entry) = node_list.get(&self.my_uuid) {
            if entry.view_id == current && entry.im_range.hs() < self.last_sent {
                let range = Range::new(entry.im_range.hs() + 1, self.last_sent);
                self.resend(Uuid::nil(), range, now);
            }
        }
        let others: Vec<(Uuid, Range)> = node_list
            .iter()
            .filter(|(u, n)| **u != self.my_uuid && n.view_id == current)
            .filter_map(|(u, n)| {
                let local = self.known.get(u)?;
                if local.index == INVALID_INDEX {
                    return None;
                }
                let have = self.input_map.range(local.index).hs();
                if n.im_range.hs() < have {
                    Some((*u, Range::new(n.im_range.hs() + 1, have)))
                } else {
                    None
                }
            })
            .collect();
        for (origin, range) in others {
            self.recover(Uuid::nil(), origin, range, now);
        }
    }

    /// Lift per-sender safe seqs from a membership node list.
    fn update_im_safe_seqs(&mut self, node_list: &MessageNodeList) {
        let current = self.current_view.id();
        let aru = self.input_map.aru_seq();
        for (uuid, entry) in node_list {
            if entry.view_id != current {
                continue;
            }
            let index = match self.known.get(uuid) {
                Some(n) if n.index != INVALID_INDEX => n.index,
                _ => continue,
            };
            let safe = std::cmp::min(entry.safe_seq, aru);
            if !safe.is_none() {
                let _ = self.input_map.set_safe_seq(index, safe);
            }
        }
    }

    // ------------------------------------------------------------------
    // Consensus helpers
    // ------------------------------------------------------------------

    fn is_consensus(&self) -> bool {
        let consensus = Consensus {
            known: &self.known,
            current_view: &self.current_view,
            input_map: &self.input_map,
            self_uuid: self.my_uuid,
        };
        consensus.is_consensus()
    }

    /// The representative is the smallest operational identity.
    pub fn is_representative(&self, uuid: Uuid) -> bool {
        self.known
            .iter()
            .find(|(u, n)| n.operational && !self.evicted.contains_key(u))
            .map(|(u, _)| *u == uuid)
            .unwrap_or(false)
    }

    fn is_all_committed(&self) -> bool {
        let install = match &self.install_message {
            Some(im) => im,
            None => return false,
        };
        install
            .node_list
            .iter()
            .filter(|(_, n)| n.operational)
            .all(|(u, _)| self.known.get(u).map(|n| n.committed).unwrap_or(false))
    }

    fn is_all_installed(&self) -> bool {
        let install = match &self.install_message {
            Some(im) => im,
            None => return false,
        };
        install
            .node_list
            .iter()
            .filter(|(_, n)| n.operational)
            .all(|(u, _)| self.known.get(u).map(|n| n.installed).unwrap_or(false))
    }

    /// In INSTALL: once everyone committed and our input map has caught up
    /// with the agreed cut, report installed; once everyone reports, the
    /// new view goes live.
    fn check_install_progress(&mut self, now: Instant) {
        if self.state != ProtoState::Install {
            return;
        }
        let install = match self.install_message.clone() {
            Some(im) => im,
            None => return,
        };
        if self.is_all_committed() {
            let self_installed = self.known[&self.my_uuid].installed;
            if !self_installed && self.caught_up_with(&install) {
                if let Some(node) = self.known.get_mut(&self.my_uuid) {
                    node.installed = true;
                }
                self.send_gap(
                    Uuid::nil(),
                    install.install_view_id,
                    Range::default(),
                    false,
                    now,
                );
            }
        }
        if self.is_all_installed() {
            self.finalize_install(now);
        }
    }

    /// We hold every message the install message says was seen in our
    /// view: for each live same-view stream, our lowest unseen seqno is
    /// past the claimed highest seen. Streams of partitioned senders are
    /// excluded; the consensus already pinned their reachable prefix and a
    /// gap in them can never be filled.
    fn caught_up_with(&self, install: &MembershipMessage) -> bool {
        install
            .node_list
            .iter()
            .filter(|(_, entry)| {
                entry.operational && entry.view_id == self.current_view.id()
            })
            .all(|(uuid, entry)| {
                match self.known.get(uuid) {
                    Some(node) if node.index != INVALID_INDEX => {
                        self.input_map.range(node.index).lu() > entry.im_range.hs()
                    }
                    // Not in our view; nothing for us to fetch.
                    _ => true,
                }
            })
    }

    fn finalize_install(&mut self, now: Instant) {
        let install = match self.install_message.take() {
            Some(im) => im,
            None => return,
        };
        let old_view = self.current_view.clone();

        // Flush everything still deliverable under the old configuration.
        self.deliver_trans(now);

        let new_members: BTreeSet<Uuid> = install
            .node_list
            .iter()
            .filter(|(_, n)| n.operational)
            .map(|(u, _)| *u)
            .collect();

        // Transitional view: the agreed cut of the old membership.
        let mut trans = View::new(ViewId::new(
            ViewType::Trans,
            old_view.id().uuid(),
            old_view.id().seq(),
        ));
        for (uuid, member) in old_view.members() {
            if new_members.contains(uuid) {
                trans.add_member(*uuid, member.clone());
            } else if self
                .known
                .get(uuid)
                .map(|n| n.leave_message.is_some())
                .unwrap_or(false)
            {
                trans.add_left(*uuid, member.clone());
            } else {
                trans.add_partitioned(*uuid, member.clone());
            }
        }
        self.delivery.push_back(EvsDelivery::TransView(trans));

        // Regular view. Everything joins on the first real install; later
        // ones diff against the previous membership.
        let first_install =
            old_view.id().view_type() == ViewType::Trans && old_view.id().seq() == 0;
        let mut reg = View::new(install.install_view_id);
        for uuid in &new_members {
            let segment = install.node_list[uuid].segment;
            let name = if *uuid == self.my_uuid {
                self.my_name.clone()
            } else {
                String::new()
            };
            reg.add_member(*uuid, Member { name, segment });
            if first_install || !old_view.is_member(*uuid) {
                reg.add_joined(*uuid, Member { name: String::new(), segment });
            }
        }
        for (uuid, member) in old_view.members() {
            if new_members.contains(uuid) {
                continue;
            }
            if self
                .known
                .get(uuid)
                .map(|n| n.leave_message.is_some())
                .unwrap_or(false)
            {
                reg.add_left(*uuid, member.clone());
            } else {
                reg.add_partitioned(*uuid, member.clone());
            }
        }

        info!(node = %self.my_uuid, view = %reg, "installing view");

        self.previous_views.insert(old_view.id(), now);
        for vid in std::mem::take(&mut self.gather_views) {
            self.previous_views.insert(vid, now);
        }
        // Early traffic in the new view may have been glimpsed during the
        // round; the new view must never be treated as forgotten.
        self.previous_views.remove(&install.install_view_id);
        self.previous_view = Some(old_view);
        self.current_view = reg.clone();

        // Reset the delivery machinery for the new view.
        self.input_map.clear();
        for (uuid, _) in reg.members() {
            let index = self
                .input_map
                .insert_sender(*uuid)
                .expect("cleared input map accepts senders");
            if let Some(node) = self.known.get_mut(uuid) {
                node.index = index;
            }
        }
        let member_uuids: BTreeSet<Uuid> = reg.members().keys().copied().collect();
        for (uuid, node) in self.known.iter_mut() {
            if !member_uuids.contains(uuid) {
                node.index = INVALID_INDEX;
            }
            node.reset_round();
        }
        self.last_sent = Seqno::NONE;
        self.last_acked_aru = Seqno::NONE;
        self.install_timeout_count = 0;

        self.delivery.push_back(EvsDelivery::RegView(reg));
        self.shift_to(ProtoState::Operational, now);

        if self.pending_leave {
            self.pending_leave = false;
            self.close(now);
        }
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    fn deliverable(&self, key: &MsgKey, safety: SafetyPrefix) -> bool {
        match safety {
            SafetyPrefix::Safe => self.input_map.is_safe(key),
            SafetyPrefix::Agreed => self.input_map.is_agreed(key),
            SafetyPrefix::Fifo => self.input_map.is_fifo(key),
            SafetyPrefix::Unreliable => true,
            SafetyPrefix::Drop => true,
        }
    }

    fn deliver(&mut self, now: Instant) {
        if self.delivering {
            return;
        }
        self.delivering = true;
        for key in self.input_map.keys() {
            let (safety, source, user_type, payload) = match self.input_map.get(&key) {
                Some(stored) => (
                    stored.msg.safety_prefix,
                    stored.source,
                    stored.msg.user_type,
                    stored.payload.clone(),
                ),
                None => continue,
            };
            if !self.deliverable(&key, safety) {
                continue;
            }
            self.input_map.erase(&key);
            if safety == SafetyPrefix::Drop {
                continue;
            }
            match safety {
                SafetyPrefix::Safe => self.stats.delivered_safe += 1,
                SafetyPrefix::Agreed => self.stats.delivered_agreed += 1,
                _ => self.stats.delivered_fifo += 1,
            }
            self.delivery.push_back(EvsDelivery::Message {
                source,
                user_type,
                safety,
                seq: key.seq,
                payload,
            });
        }
        self.drain_causal_queue();
        self.delivering = false;
        if self.state == ProtoState::Leaving {
            self.check_leave_complete(now);
        }
    }

    /// Delivery under the transitional configuration. The install consensus
    /// already guarantees every trans-view member holds the same message
    /// set, so gap-freedom per sender is the delivery condition even for
    /// safe and agreed messages; everyone delivers the same cut.
    fn deliver_trans(&mut self, _now: Instant) {
        for key in self.input_map.keys() {
            let (safety, source, user_type, payload) = match self.input_map.get(&key) {
                Some(stored) => (
                    stored.msg.safety_prefix,
                    stored.source,
                    stored.msg.user_type,
                    stored.payload.clone(),
                ),
                None => continue,
            };
            let deliverable = match safety {
                SafetyPrefix::Safe | SafetyPrefix::Agreed | SafetyPrefix::Fifo => {
                    self.input_map.is_fifo(&key)
                }
                SafetyPrefix::Unreliable => true,
                SafetyPrefix::Drop => false,
            };
            if !deliverable {
                continue;
            }
            self.input_map.erase(&key);
            match safety {
                SafetyPrefix::Safe => self.stats.delivered_safe += 1,
                SafetyPrefix::Agreed => self.stats.delivered_agreed += 1,
                _ => self.stats.delivered_fifo += 1,
            }
            self.delivery.push_back(EvsDelivery::Message {
                source,
                user_type,
                safety,
                seq: key.seq,
                payload,
            });
        }
    }

    fn drain_causal_queue(&mut self) {
        let safe = self.input_map.safe_seq();
        while let Some(front) = self.causal_queue.front() {
            if front.aru_at_enqueue > safe {
                break;
            }
            let entry = self.causal_queue.pop_front().expect("non-empty queue");
            self.stats.delivered_causal += 1;
            self.delivery.push_back(EvsDelivery::Message {
                source: self.my_uuid,
                user_type: entry.user_type,
                safety: SafetyPrefix::Fifo,
                seq: Seqno::NONE,
                payload: entry.payload,
            });
        }
    }

    fn check_leave_complete(&mut self, now: Instant) {
        if self.state != ProtoState::Leaving {
            return;
        }
        let done = if self.current_view.members().len() <= 1 {
            true
        } else {
            self.leave_seq.is_none() || self.input_map.safe_seq() >= self.leave_seq
        };
        if done {
            self.delivery.push_back(EvsDelivery::EmptyView);
            self.shift_to(ProtoState::Closed, now);
        }
    }

    // ------------------------------------------------------------------
    // State machine and timers
    // ------------------------------------------------------------------

    fn shift_to(&mut self, state: ProtoState, now: Instant) {
        if self.state == state {
            return;
        }
        debug!(node = %self.my_uuid, from = self.state.as_str(), to = state.as_str(),
               "state shift");
        self.state = state;
        match state {
            ProtoState::Closed => {
                self.timers.cancel(Timer::Inactivity);
                self.timers.cancel(Timer::Retrans);
                self.timers.cancel(Timer::Install);
                self.timers.cancel(Timer::Stats);
                self.timers.cancel(Timer::CausalKeepalive);
            }
            ProtoState::Joining => {
                self.timers.set(Timer::Inactivity, now + self.cfg.inactive_check_period);
                self.timers.set(Timer::Retrans, now + self.cfg.retrans_period);
                self.timers.set(Timer::Stats, now + self.cfg.stats_report_period);
            }
            ProtoState::Gather => {
                for node in self.known.values_mut() {
                    node.committed = false;
                    node.installed = false;
                }
                self.install_message = None;
                self.timers.set(Timer::Install, now + self.cfg.install_timeout);
            }
            ProtoState::Install => {
                self.timers.set(Timer::Install, now + self.cfg.install_timeout);
            }
            ProtoState::Operational => {
                self.timers.cancel(Timer::Install);
                self.install_timeout_count = 0;
                if !self.cfg.causal_keepalive_period.is_zero() {
                    self.timers
                        .set(Timer::CausalKeepalive, now + self.cfg.causal_keepalive_period);
                }
            }
            ProtoState::Leaving => {
                self.timers.cancel(Timer::Install);
            }
        }
    }

    /// Run expired timers. Returns the next deadline, if any.
    pub fn handle_timers(&mut self, now: Instant) -> Option<Instant> {
        for timer in self.timers.expired(now) {
            match timer {
                Timer::Inactivity => self.handle_inactivity_timer(now),
                Timer::Retrans => self.handle_retrans_timer(now),
                Timer::Install => self.handle_install_timer(now),
                Timer::Stats => self.handle_stats_timer(now),
                Timer::CausalKeepalive => self.handle_causal_keepalive_timer(now),
            }
        }
        self.timers.next_deadline()
    }

    fn handle_inactivity_timer(&mut self, now: Instant) {
        let mut any_inactive = false;
        let uuids: Vec<Uuid> = self.known.keys().copied().collect();
        for uuid in uuids {
            if uuid == self.my_uuid {
                continue;
            }
            let (suspected, inactive, delayed, operational) = {
                let node = &self.known[&uuid];
                (
                    node.is_suspected(now, self.cfg.suspect_timeout),
                    node.is_inactive(now, self.cfg.inactive_timeout),
                    node.is_delayed(now, self.cfg.delay_margin),
                    node.operational,
                )
            };
            if delayed && self.cfg.auto_evict > 0 {
                let cnt = self.delayed_counts.entry(uuid).or_insert(0);
                *cnt = cnt.saturating_add(1);
            }
            if inactive && operational {
                warn!(node = %self.my_uuid, peer = %uuid, "peer inactive");
                self.set_inactive(uuid, now);
                any_inactive = true;
            } else if suspected {
                let node = self.known.get_mut(&uuid).expect("known node");
                if !node.suspected {
                    debug!(node = %self.my_uuid, peer = %uuid, "peer suspected");
                    node.suspected = true;
                }
            }
        }
        if any_inactive
            && matches!(self.state, ProtoState::Operational | ProtoState::Gather)
        {
            self.shift_to(ProtoState::Gather, now);
            self.send_join(now);
        }
        if self.cfg.auto_evict > 0 && !self.delayed_counts.is_empty() {
            self.send_delayed_list(now);
        }
        self.cleanup_views(now);
        self.cleanup_evicted(now);
        self.timers
            .set(Timer::Inactivity, now + self.cfg.inactive_check_period);
    }

    fn handle_retrans_timer(&mut self, now: Instant) {
        match self.state {
            ProtoState::Operational | ProtoState::Install | ProtoState::Leaving => {
                self.request_missing(now);
                // Catch our stream up with the group high watermark.
                let max_hs = self.input_map.max_hs();
                if self.last_sent < max_hs {
                    self.complete_user(max_hs, now);
                }
                // Push our aru out if it moved since the last ack; silence
                // from us must not stall safe delivery on peers.
                if self.input_map.aru_seq() > self.last_acked_aru {
                    self.send_gap(
                        Uuid::nil(),
                        self.current_view.id(),
                        Range::default(),
                        false,
                        now,
                    );
                }
                // Resend own tail that nobody acknowledged yet.
                if self.last_sent > self.input_map.aru_seq() {
                    let range = Range::new(self.input_map.aru_seq() + 1, self.last_sent);
                    self.resend(Uuid::nil(), range, now);
                }
                self.deliver(now);
            }
            ProtoState::Gather => {
                let due = self
                    .last_sent_join
                    .map(|at| now.saturating_duration_since(at) >= self.cfg.join_retrans_period)
                    .unwrap_or(true);
                if due {
                    self.send_join(now);
                }
                self.request_missing(now);
                let max_hs = self.input_map.max_hs();
                if self.last_sent < max_hs {
                    self.complete_user(max_hs, now);
                }
                if self.input_map.aru_seq() > self.last_acked_aru {
                    self.send_gap(
                        Uuid::nil(),
                        self.current_view.id(),
                        Range::default(),
                        false,
                        now,
                    );
                }
            }
            _ => {}
        }
        self.timers.set(Timer::Retrans, now + self.cfg.retrans_period);
    }

    /// Request retransmission of every gap in the input map.
    fn request_missing(&mut self, now: Instant) {
        let gaps: SmallVec<[(Uuid, Range); 8]> = self
            .known
            .iter()
            .filter(|(u, n)| **u != self.my_uuid && n.index != INVALID_INDEX)
            .filter_map(|(u, n)| {
                let range = self.input_map.range(n.index);
                if range.lu() <= range.hs() {
                    Some((*u, Range::new(range.lu(), range.hs())))
                } else {
                    None
                }
            })
            .collect();
        for (origin, range) in gaps {
            self.request_retrans(origin, origin, range, now);
        }
    }

    fn handle_install_timer(&mut self, now: Instant) {
        if !matches!(self.state, ProtoState::Gather | ProtoState::Install) {
            return;
        }
        self.install_timeout_count += 1;
        warn!(node = %self.my_uuid, count = self.install_timeout_count, "install timeout");
        if self.install_timeout_count >= self.cfg.max_install_timeouts {
            // Give up on unresponsive peers and regroup without them.
            let stuck: Vec<Uuid> = self
                .known
                .iter()
                .filter(|(u, n)| {
                    **u != self.my_uuid && n.operational && n.join_message.is_none()
                })
                .map(|(u, _)| *u)
                .collect();
            for uuid in stuck {
                self.set_inactive(uuid, now);
            }
            self.install_timeout_count = 0;
        }
        self.shift_to(ProtoState::Gather, now);
        self.send_join(now);
        self.timers.set(Timer::Install, now + self.cfg.install_timeout);
    }

    /// Drive pending causal barriers when the group is otherwise quiet: an
    /// empty keepalive message extends the shared sequence by one, forcing
    /// an acknowledgement round that carries the group safe seqno past the
    /// barriers' enqueue points.
    fn handle_causal_keepalive_timer(&mut self, now: Instant) {
        if self.state == ProtoState::Operational && !self.causal_queue.is_empty() {
            self.complete_user(self.last_sent + 1, now);
            self.deliver(now);
        }
        if self.state != ProtoState::Closed {
            self.timers
                .set(Timer::CausalKeepalive, now + self.cfg.causal_keepalive_period);
        }
    }

    fn handle_stats_timer(&mut self, now: Instant) {
        let s = &self.stats;
        info!(
            node = %self.my_uuid,
            sent_user = s.sent_user,
            sent_gap = s.sent_gap,
            sent_join = s.sent_join,
            retransmitted = s.retransmitted,
            recovered = s.recovered,
            delivered_safe = s.delivered_safe,
            delivered_agreed = s.delivered_agreed,
            delivered_fifo = s.delivered_fifo,
            input_map_inserted = self.input_map.inserted(),
            "evs stats"
        );
        self.timers.set(Timer::Stats, now + self.cfg.stats_report_period);
    }

    fn set_inactive(&mut self, uuid: Uuid, now: Instant) {
        let index = match self.known.get_mut(&uuid) {
            Some(node) => {
                node.operational = false;
                node.suspected = true;
                node.inactive = true;
                node.index
            }
            None => return,
        };
        // A dead sender must not pin the group aru: drop it from the
        // input map minima and flush whatever the live members already
        // hold in full.
        if index != INVALID_INDEX {
            self.input_map.set_operational(index, false);
            self.deliver(now);
        }
    }

    /// Forget views and departed nodes whose bookkeeping has expired.
    fn cleanup_views(&mut self, now: Instant) {
        let timeout = self.cfg.view_forget_timeout;
        self.previous_views
            .retain(|_, at| now.saturating_duration_since(*at) < timeout);
        let current_members: BTreeSet<Uuid> =
            self.current_view.members().keys().copied().collect();
        self.known.retain(|uuid, node| {
            if current_members.contains(uuid) || *uuid == self.my_uuid {
                return true;
            }
            if node.operational || node.join_message.is_some() {
                return true;
            }
            now.saturating_duration_since(node.tstamp) < timeout
        });
    }

    fn cleanup_evicted(&mut self, now: Instant) {
        let keep = self.cfg.delayed_keep_period;
        self.delayed_counts.retain(|uuid, _| {
            self.known
                .get(uuid)
                .map(|n| n.is_delayed(now, self.cfg.delay_margin))
                .unwrap_or(false)
        });
        let forget = self.cfg.view_forget_timeout;
        self.evicted
            .retain(|_, at| now.saturating_duration_since(*at) < std::cmp::max(keep, forget));
    }
}

impl std::fmt::Debug for Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proto")
            .field("uuid", &self.my_uuid)
            .field("state", &self.state)
            .field("view", &self.current_view.id())
            .field("known", &self.known.len())
            .field("aru", &self.input_map.aru_seq())
            .field("safe", &self.input_map.safe_seq())
            .finish()
    }
}
