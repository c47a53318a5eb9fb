//! Per-member bookkeeping for the `known` table.

use crate::message::{DelayedListMessage, LeaveMessage, MembershipMessage};
use relicast_proto::{Range, SegmentId, Uuid};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Index value meaning "no input map slot assigned".
pub const INVALID_INDEX: usize = usize::MAX;

/// Everything the engine knows about one member, live or recently departed.
#[derive(Debug, Clone)]
pub struct Node {
    /// Input map slot, `INVALID_INDEX` outside of an installed view.
    pub index: usize,
    /// Considered alive and participating.
    pub operational: bool,
    pub suspected: bool,
    pub inactive: bool,
    /// Has committed to the pending install message.
    pub committed: bool,
    /// Has reported the pending view installed.
    pub installed: bool,
    /// Last membership messages received from the node. Receiving a newer
    /// one moves it in and drops the old.
    pub join_message: Option<MembershipMessage>,
    pub leave_message: Option<LeaveMessage>,
    pub delayed_list_message: Option<DelayedListMessage>,
    /// Last time a message from this node advanced protocol state. Drives
    /// suspicion and inactivity.
    pub tstamp: Instant,
    /// Last time any message arrived from this node. Drives delay tracking.
    pub seen_tstamp: Instant,
    /// Rate limiting for retransmission requests towards this node.
    pub last_requested_range: Option<(Range, Instant)>,
    /// Highest membership-message fifo seq accepted from this node.
    pub fifo_seq: i64,
    pub segment: SegmentId,
}

impl Node {
    pub fn new(segment: SegmentId, now: Instant) -> Self {
        Node {
            index: INVALID_INDEX,
            operational: true,
            suspected: false,
            inactive: false,
            committed: false,
            installed: false,
            join_message: None,
            leave_message: None,
            delayed_list_message: None,
            tstamp: now,
            seen_tstamp: now,
            last_requested_range: None,
            fifo_seq: -1,
            segment,
        }
    }

    pub fn set_join_message(&mut self, msg: MembershipMessage) {
        self.join_message = Some(msg);
    }

    pub fn set_leave_message(&mut self, msg: LeaveMessage) {
        self.leave_message = Some(msg);
    }

    /// Chronically delayed: messages still arrive but none of them advance
    /// protocol state for longer than the margin allows.
    pub fn is_delayed(&self, now: Instant, delay_margin: Duration) -> bool {
        self.seen_tstamp > self.tstamp
            && now.saturating_duration_since(self.tstamp) > delay_margin
    }

    pub fn is_suspected(&self, now: Instant, suspect_timeout: Duration) -> bool {
        now.saturating_duration_since(self.tstamp) > suspect_timeout
    }

    pub fn is_inactive(&self, now: Instant, inactive_timeout: Duration) -> bool {
        now.saturating_duration_since(self.tstamp) > inactive_timeout
    }

    /// Clear per-view flags when a gather round starts over.
    pub fn reset_round(&mut self) {
        self.committed = false;
        self.installed = false;
        self.join_message = None;
    }
}

pub type NodeMap = BTreeMap<Uuid, Node>;
