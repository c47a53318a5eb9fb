//! Consensus evaluation over JOIN/INSTALL messages.
//!
//! A membership message is *consistent* with local state when its picture
//! of every same-view stream (ranges, leavers, partitioned nodes, and the
//! highest reachable safe seqno) matches what the local input map and node
//! table say. Consensus holds when the local JOIN is consistent with itself
//! and with every operational peer's JOIN on file.

use crate::input_map::InputMap;
use crate::message::{MembershipMessage, MessageNodeList};
use crate::node::{Node, NodeMap, INVALID_INDEX};
use relicast_proto::{Seqno, Uuid, View, ViewId};
use tracing::debug;

/// Borrowed view of the engine state the rules run against.
pub struct Consensus<'a> {
    pub known: &'a NodeMap,
    pub current_view: &'a View,
    pub input_map: &'a InputMap,
    pub self_uuid: Uuid,
}

/// Select entries of a node list by view and operational/leaving status.
/// `view_filter = None` accepts any view.
fn select_nodes(
    list: &MessageNodeList,
    view_filter: Option<ViewId>,
    operational: bool,
    leaving: bool,
) -> MessageNodeList {
    list.iter()
        .filter(|(_, n)| {
            if let Some(vid) = view_filter {
                if n.view_id != vid {
                    return false;
                }
            }
            // Both flags set selects everything in the view; otherwise both
            // status bits must match exactly.
            (operational && leaving)
                || (n.operational == operational && n.leaving() == leaving)
        })
        .map(|(u, n)| (*u, *n))
        .collect()
}

fn node_lists_consensus_eq(a: &MessageNodeList, b: &MessageNodeList) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|((ua, na), (ub, nb))| ua == ub && na.consensus_eq(nb))
}

impl<'a> Consensus<'a> {
    /// True if every operational peer's JOIN on file reports `uuid` as
    /// suspected (and at least one does).
    pub fn is_all_suspected(&self, uuid: Uuid) -> bool {
        let mut seen = false;
        for (peer, node) in self.known.iter().filter(|(_, n)| n.operational) {
            if *peer == uuid {
                continue;
            }
            match &node.join_message {
                Some(jm) => match jm.node_list.get(&uuid) {
                    Some(entry) if entry.suspected => seen = true,
                    _ => return false,
                },
                None => return false,
            }
        }
        seen
    }

    /// Structural equality of two membership messages for consensus
    /// purposes. Seq fields compare only when the messages come from the
    /// same view; node lists compare whole when from the same source,
    /// operational-part only otherwise.
    pub fn equal(m1: &MembershipMessage, m2: &MembershipMessage) -> bool {
        if m1.source_view_id == m2.source_view_id {
            if m1.seq != m2.seq {
                debug!(m1 = %m1.seq, m2 = %m2.seq, "consensus: seq differs");
                return false;
            }
            if m1.aru_seq != m2.aru_seq {
                debug!(m1 = %m1.aru_seq, m2 = %m2.aru_seq, "consensus: aru differs");
                return false;
            }
        }
        let (nl1, nl2) = if m1.source == m2.source {
            (
                select_nodes(&m1.node_list, Some(m1.source_view_id), true, true),
                select_nodes(&m2.node_list, Some(m2.source_view_id), true, true),
            )
        } else {
            (
                select_nodes(&m1.node_list, None, true, false),
                select_nodes(&m2.node_list, None, true, false),
            )
        };
        node_lists_consensus_eq(&nl1, &nl2)
    }

    /// The highest seqno the group can still agree on, from local knowledge:
    /// leavers cap it at their leave seq, partitioned nodes at what we hold
    /// of their stream, operational nodes contribute their highest seen.
    pub fn highest_reachable_safe_seq(&self) -> Seqno {
        let mut seqs: Vec<Seqno> = Vec::with_capacity(self.known.len());
        for (uuid, node) in self.known.iter() {
            let jm_current = node
                .join_message
                .as_ref()
                .is_some_and(|m| m.source_view_id == self.current_view.id());
            let lm_current = node
                .leave_message
                .as_ref()
                .is_some_and(|m| m.source_view_id == self.current_view.id());
            let member_wo_jm =
                node.join_message.is_none() && self.current_view.is_member(*uuid);
            if !(member_wo_jm || jm_current || lm_current) {
                continue;
            }
            if let Some(lm) = &node.leave_message {
                if !self.is_all_suspected(*uuid) {
                    seqs.push(lm.seq);
                }
            } else if !node.operational {
                if node.index != INVALID_INDEX {
                    seqs.push(std::cmp::min(
                        self.input_map.sender_safe_seq(node.index),
                        self.input_map.range(node.index).lu() - 1,
                    ));
                }
            } else if node.index != INVALID_INDEX {
                seqs.push(self.input_map.range(node.index).hs());
            }
        }
        seqs.into_iter().min().unwrap_or(Seqno::NONE)
    }

    /// Minimum per-sender safe seq, skipping leavers that everyone already
    /// suspects (their streams can no longer advance).
    fn safe_seq_wo_all_suspected_leaving(&self) -> Seqno {
        let mut safe: Option<Seqno> = None;
        for (uuid, node) in self.known.iter() {
            if node.index == INVALID_INDEX {
                continue;
            }
            if !node.operational && node.leave_message.is_some() && self.is_all_suspected(*uuid) {
                continue;
            }
            let ss = self.input_map.sender_safe_seq(node.index);
            safe = Some(match safe {
                Some(prev) => std::cmp::min(prev, ss),
                None => ss,
            });
        }
        safe.unwrap_or(Seqno::NONE)
    }

    fn is_consistent_highest_reachable_safe_seq(&self, msg: &MembershipMessage) -> bool {
        let current = self.current_view.id();
        let same_view = select_nodes(&msg.node_list, Some(current), true, false);
        let max_hs = same_view
            .values()
            .map(|n| n.im_range.hs())
            .max()
            .unwrap_or(Seqno::NONE);

        let mut max_reachable = max_hs;

        let leaving: MessageNodeList = select_nodes(&msg.node_list, Some(current), false, true)
            .into_iter()
            .filter(|(u, _)| !self.is_all_suspected(*u))
            .collect();
        if let Some(min_leave) = leaving.values().map(|n| n.leave_seq).min() {
            max_reachable = std::cmp::min(max_reachable, min_leave);
        }

        let partitioning = select_nodes(&msg.node_list, Some(current), false, false);
        if !partitioning.is_empty() {
            let min_safe = partitioning.values().map(|n| n.safe_seq).min().unwrap();
            let min_lu = partitioning
                .values()
                .map(|n| n.im_range.lu() - 1)
                .min()
                .unwrap();
            max_reachable = std::cmp::min(max_reachable, min_safe);
            max_reachable = std::cmp::min(max_reachable, min_lu);
        }

        self.input_map.max_hs() == max_hs
            && self.highest_reachable_safe_seq() == max_reachable
            && self.safe_seq_wo_all_suspected_leaving() == max_reachable
    }

    fn is_consistent_input_map(&self, msg: &MembershipMessage) -> bool {
        if msg.aru_seq != self.input_map.aru_seq() {
            debug!(msg_aru = %msg.aru_seq, local = %self.input_map.aru_seq(),
                   "consensus: aru not consistent");
            return false;
        }
        if msg.seq != self.input_map.safe_seq() {
            debug!(msg_seq = %msg.seq, local = %self.input_map.safe_seq(),
                   "consensus: safe seq not consistent");
            return false;
        }

        let mut local: Vec<(Uuid, relicast_proto::Range)> = Vec::new();
        for (uuid, node) in self.known.iter() {
            if self.current_view.is_member(*uuid) && node.index != INVALID_INDEX {
                local.push((*uuid, self.input_map.range(node.index)));
            }
        }
        let mut from_msg: Vec<(Uuid, relicast_proto::Range)> = msg
            .node_list
            .iter()
            .filter(|(_, n)| n.view_id == self.current_view.id())
            .map(|(u, n)| (*u, n.im_range))
            .collect();
        local.sort_by_key(|(u, _)| *u);
        from_msg.sort_by_key(|(u, _)| *u);
        local == from_msg
    }

    /// Members of the current view that are neither operational nor leaving
    /// must be seen identically by the message source.
    fn is_consistent_partitioning(&self, msg: &MembershipMessage) -> bool {
        let locally_partitioned: Vec<Uuid> = self
            .known
            .iter()
            .filter(|(u, n)| {
                !n.operational && n.leave_message.is_none() && self.current_view.is_member(**u)
            })
            .map(|(u, _)| *u)
            .collect();
        let msg_partitioned: Vec<Uuid> = msg
            .node_list
            .iter()
            .filter(|(_, n)| {
                !n.operational && !n.leaving() && n.view_id == self.current_view.id()
            })
            .map(|(u, _)| *u)
            .collect();
        if locally_partitioned != msg_partitioned {
            return false;
        }
        locally_partitioned.iter().all(|u| {
            let node = &self.known[u];
            node.index != INVALID_INDEX
                && msg.node_list[u].im_range == self.input_map.range(node.index)
        })
    }

    fn is_consistent_leaving(&self, msg: &MembershipMessage) -> bool {
        let is_local_leaver = |node: &Node| -> bool {
            !node.operational
                && node
                    .leave_message
                    .as_ref()
                    .is_some_and(|lm| lm.source_view_id == self.current_view.id())
        };
        let locally_leaving: Vec<Uuid> = self
            .known
            .iter()
            .filter(|(_, n)| is_local_leaver(n))
            .map(|(u, _)| *u)
            .collect();
        let msg_leaving: Vec<Uuid> = msg
            .node_list
            .iter()
            .filter(|(_, n)| !n.operational && n.leaving() && n.view_id == self.current_view.id())
            .map(|(u, _)| *u)
            .collect();
        if locally_leaving != msg_leaving {
            return false;
        }
        locally_leaving.iter().all(|u| {
            let node = &self.known[u];
            node.index != INVALID_INDEX
                && msg.node_list[u].im_range == self.input_map.range(node.index)
        })
    }

    fn is_consistent_same_view(&self, msg: &MembershipMessage) -> bool {
        if !self.is_consistent_highest_reachable_safe_seq(msg) {
            debug!(source = %msg.source, "consensus: highest reachable safe seq inconsistent");
            return false;
        }
        if !self.is_consistent_input_map(msg) {
            debug!(source = %msg.source, "consensus: input map inconsistent");
            return false;
        }
        if !self.is_consistent_partitioning(msg) {
            debug!(source = %msg.source, "consensus: partitioning inconsistent");
            return false;
        }
        if !self.is_consistent_leaving(msg) {
            debug!(source = %msg.source, "consensus: leaving set inconsistent");
            return false;
        }
        true
    }

    /// Is `msg` consistent with our own JOIN?
    pub fn is_consistent(&self, msg: &MembershipMessage) -> bool {
        let my_jm = match self
            .known
            .get(&self.self_uuid)
            .and_then(|n| n.join_message.as_ref())
        {
            Some(jm) => jm,
            None => return false,
        };
        if msg.source_view_id == self.current_view.id() {
            self.is_consistent_same_view(msg) && Self::equal(msg, my_jm)
        } else {
            Self::equal(msg, my_jm)
        }
    }

    /// Full consensus: our JOIN is self-consistent and every operational
    /// node's JOIN on file is consistent with ours.
    pub fn is_consensus(&self) -> bool {
        let my_jm = match self
            .known
            .get(&self.self_uuid)
            .and_then(|n| n.join_message.as_ref())
        {
            Some(jm) => jm.clone(),
            None => {
                debug!("consensus: no own join message");
                return false;
            }
        };
        if my_jm.source_view_id == self.current_view.id()
            && !self.is_consistent_same_view(&my_jm)
        {
            debug!("consensus: own join message not consistent");
            return false;
        }
        for (uuid, node) in self.known.iter().filter(|(_, n)| n.operational) {
            match &node.join_message {
                None => {
                    debug!(%uuid, "consensus: no join message on file");
                    return false;
                }
                // Strict check, not mere equality, for same-view messages.
                Some(jm) => {
                    if !self.is_consistent(jm) {
                        debug!(%uuid, "consensus: join not consistent with ours");
                        return false;
                    }
                }
            }
        }
        true
    }
}
