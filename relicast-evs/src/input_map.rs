//! The delivery buffer: per-sender sliding windows over received user
//! messages, plus the group-wide ARU and safe seqno bookkeeping that drives
//! agreed and safe delivery.
//!
//! Messages are keyed by `(seqno, sender index)`, so in-order iteration is
//! exactly the total delivery order for safe messages. Erased messages that
//! are not yet safe move into a recovery index and stay retransmittable
//! until the whole group has seen them.

use crate::message::UserMessage;
use crate::EvsError;
use relicast_proto::constants::INPUT_MAP_WINDOW;
use relicast_proto::{Range, Seqno, Uuid};
use std::collections::BTreeMap;

/// Iteration/lookup key. Ordered by seqno first, sender index second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MsgKey {
    pub seq: Seqno,
    pub index: usize,
}

/// A stored message with its payload.
#[derive(Debug, Clone)]
pub struct InputMapMsg {
    pub source: Uuid,
    pub msg: UserMessage,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
struct SenderState {
    uuid: Uuid,
    range: Range,
    safe_seq: Seqno,
    /// Dead senders are excluded from the aru/safe minima so they stop
    /// pinning delivery for the live rest of the group.
    operational: bool,
}

#[derive(Debug, Default)]
pub struct InputMap {
    safe_seq: Seqno,
    aru_seq: Seqno,
    senders: Vec<SenderState>,
    msg_index: BTreeMap<MsgKey, InputMapMsg>,
    recovery_index: BTreeMap<MsgKey, InputMapMsg>,
    inserted: u64,
}

impl InputMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn aru_seq(&self) -> Seqno {
        self.aru_seq
    }

    pub fn safe_seq(&self) -> Seqno {
        self.safe_seq
    }

    pub fn n_senders(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msg_index.is_empty()
    }

    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    /// Highest seqno seen from any sender.
    pub fn max_hs(&self) -> Seqno {
        self.senders
            .iter()
            .map(|s| s.range.hs())
            .max()
            .unwrap_or(Seqno::NONE)
    }

    /// Register a sender. Only legal while the map holds no messages, i.e.
    /// right after a view change.
    pub fn insert_sender(&mut self, uuid: Uuid) -> Result<usize, EvsError> {
        if !self.msg_index.is_empty() || !self.recovery_index.is_empty() {
            return Err(EvsError::InvariantViolation(
                "sender insert into non-empty input map".into(),
            ));
        }
        if self.senders.iter().any(|s| s.uuid == uuid) {
            return Err(EvsError::InvariantViolation(format!(
                "duplicate sender {uuid}"
            )));
        }
        let index = self.senders.len();
        self.senders.push(SenderState {
            uuid,
            range: Range::default(),
            safe_seq: Seqno::NONE,
            operational: true,
        });
        // A fresh sender pulls the group aru back to "nothing agreed".
        self.aru_seq = Seqno::NONE;
        self.safe_seq = Seqno::NONE;
        Ok(index)
    }

    pub fn range(&self, index: usize) -> Range {
        self.senders[index].range
    }

    pub fn sender_safe_seq(&self, index: usize) -> Seqno {
        self.senders[index].safe_seq
    }

    pub fn sender_uuid(&self, index: usize) -> Uuid {
        self.senders[index].uuid
    }

    pub fn index_of(&self, uuid: Uuid) -> Option<usize> {
        self.senders.iter().position(|s| s.uuid == uuid)
    }

    /// Insert a message from sender `index`. Duplicates are accepted
    /// idempotently; a seqno at or beyond `lu + WINDOW` is rejected.
    ///
    /// A message with a non-zero `seq_range` claims every seqno in
    /// `[seq, seq + seq_range]`: the payload is stored at `seq`, the tail
    /// positions hold empty copies. The effective seqno of an entry is its
    /// key, not the embedded message field.
    pub fn insert(
        &mut self,
        index: usize,
        msg: UserMessage,
        payload: Vec<u8>,
    ) -> Result<Range, EvsError> {
        if index >= self.senders.len() {
            return Err(EvsError::InvariantViolation(format!(
                "sender index {index} out of bounds"
            )));
        }
        let range = self.senders[index].range;
        let first = msg.seq;
        let last = first + msg.seq_range as i64;

        if last.get() >= range.lu().get() + INPUT_MAP_WINDOW {
            return Err(EvsError::OutOfRange {
                seq: last.get(),
                low: range.lu().get(),
                high: range.lu().get() + INPUT_MAP_WINDOW,
            });
        }
        let source = self.senders[index].uuid;
        let mut payload = Some(payload);
        let mut inserted_any = false;
        let mut seq = first;
        while seq <= last {
            let key = MsgKey { seq, index };
            // Seqnos below lu were seen and advanced past; present keys are
            // duplicates. Both are fine.
            if seq >= range.lu() && !self.msg_index.contains_key(&key) {
                let stored_payload = if seq == first {
                    payload.take().unwrap_or_default()
                } else {
                    Vec::new()
                };
                self.msg_index.insert(
                    key,
                    InputMapMsg {
                        source,
                        msg,
                        payload: stored_payload,
                    },
                );
                self.inserted += 1;
                inserted_any = true;
            }
            seq += 1;
        }
        if !inserted_any {
            return Ok(range);
        }

        let sender = &mut self.senders[index];
        if last > sender.range.hs() {
            sender.range.set_hs(last);
        }
        if first <= sender.range.lu() {
            let mut lu = sender.range.lu();
            while self.msg_index.contains_key(&MsgKey { seq: lu, index }) {
                lu += 1;
            }
            self.senders[index].range.set_lu(lu);
            self.update_aru();
        }
        Ok(self.senders[index].range)
    }

    /// Declare `seq` stable for sender `index`: all of the sender's
    /// messages up to it have been seen by every member.
    pub fn set_safe_seq(&mut self, index: usize, seq: Seqno) -> Result<(), EvsError> {
        if seq > self.aru_seq {
            return Err(EvsError::InvariantViolation(format!(
                "safe seq {seq} ahead of aru {}",
                self.aru_seq
            )));
        }
        let sender = &mut self.senders[index];
        if seq > sender.safe_seq {
            sender.safe_seq = seq;
        }
        self.update_safe();
        Ok(())
    }

    /// Mark a sender's liveness. The group aru and safe seqnos are minima
    /// over operational senders only. Within a view a sender only ever
    /// goes from operational to non-operational; a rejoining node comes
    /// back through a view change and a fresh map.
    pub fn set_operational(&mut self, index: usize, operational: bool) {
        self.senders[index].operational = operational;
        self.update_aru();
        self.update_safe();
    }

    pub fn is_operational(&self, index: usize) -> bool {
        self.senders[index].operational
    }

    fn update_aru(&mut self) {
        let min_lu = self
            .senders
            .iter()
            .filter(|s| s.operational)
            .map(|s| s.range.lu())
            .min();
        if let Some(min_lu) = min_lu {
            let aru = min_lu - 1;
            debug_assert!(aru >= self.aru_seq);
            self.aru_seq = aru;
        }
    }

    fn update_safe(&mut self) {
        let min_safe = self
            .senders
            .iter()
            .filter(|s| s.operational)
            .map(|s| s.safe_seq)
            .min();
        if let Some(min_safe) = min_safe {
            if min_safe > self.safe_seq {
                self.safe_seq = min_safe;
                self.cleanup_recovery_index();
            }
        }
    }

    /// Gap-free up to this message within the sender's own stream.
    pub fn is_fifo(&self, key: &MsgKey) -> bool {
        key.seq < self.senders[key.index].range.lu()
    }

    /// Every known sender has received everything up to this seqno.
    pub fn is_agreed(&self, key: &MsgKey) -> bool {
        key.seq <= self.aru_seq
    }

    /// Everyone has acknowledged everything up to this seqno.
    pub fn is_safe(&self, key: &MsgKey) -> bool {
        key.seq <= self.safe_seq
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MsgKey, &InputMapMsg)> {
        self.msg_index.iter()
    }

    /// Keys in delivery order; a snapshot so the caller may erase while
    /// walking.
    pub fn keys(&self) -> Vec<MsgKey> {
        self.msg_index.keys().copied().collect()
    }

    pub fn get(&self, key: &MsgKey) -> Option<&InputMapMsg> {
        self.msg_index.get(key)
    }

    /// Remove a message from the live index. If it is not yet safe it is
    /// parked in the recovery index for retransmission.
    pub fn erase(&mut self, key: &MsgKey) {
        if let Some(msg) = self.msg_index.remove(key) {
            if !self.is_safe(key) {
                self.recovery_index.insert(*key, msg);
            }
        }
    }

    /// Find a message for retransmission, live or recovered.
    pub fn recover(&self, index: usize, seq: Seqno) -> Option<&InputMapMsg> {
        let key = MsgKey { seq, index };
        self.msg_index
            .get(&key)
            .or_else(|| self.recovery_index.get(&key))
    }

    fn cleanup_recovery_index(&mut self) {
        let safe = self.safe_seq;
        self.recovery_index.retain(|k, _| k.seq > safe);
    }

    /// Drop all state. Used on view change.
    pub fn clear(&mut self) {
        self.safe_seq = Seqno::NONE;
        self.aru_seq = Seqno::NONE;
        self.senders.clear();
        self.msg_index.clear();
        self.recovery_index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relicast_proto::{SafetyPrefix, ViewId};

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
            aru_seq: Seqno::NONE,
            safety_prefix: SafetyPrefix::Safe,
            user_type: 0,
            flags: 0,
        }
    }

    #[test]
    fn sender_insert_after_message_fails() {
        let mut im = InputMap::new();
        let a = im.insert_sender(uuid(1)).unwrap();
        im.insert(a, user_msg(uuid(1), 0), vec![]).unwrap();
        assert!(matches!(
            im.insert_sender(uuid(2)),
            Err(EvsError::InvariantViolation(_))
        ));
    }

    #[test]
    fn aru_is_min_over_senders() {
        let mut im = InputMap::new();
        let a = im.insert_sender(uuid(1)).unwrap();
        let b = im.insert_sender(uuid(2)).unwrap();
        assert_eq!(im.aru_seq(), Seqno::NONE);

        im.insert(a, user_msg(uuid(1), 0), vec![]).unwrap();
        // b has nothing: aru stays none
        assert_eq!(im.aru_seq(), Seqno::NONE);

        im.insert(b, user_msg(uuid(2), 0), vec![]).unwrap();
        assert_eq!(im.aru_seq(), Seqno(0));

        im.insert(a, user_msg(uuid(1), 1), vec![]).unwrap();
        assert_eq!(im.aru_seq(), Seqno(0));
    }

    #[test]
    fn gap_holds_lu_until_filled() {
        let mut im = InputMap::new();
        let a = im.insert_sender(uuid(1)).unwrap();
        im.insert(a, user_msg(uuid(1), 0), vec![]).unwrap();
        im.insert(a, user_msg(uuid(1), 2), vec![]).unwrap();
        assert_eq!(im.range(a).lu(), Seqno(1));
        assert_eq!(im.range(a).hs(), Seqno(2));

        im.insert(a, user_msg(uuid(1), 1), vec![]).unwrap();
        assert_eq!(im.range(a).lu(), Seqno(3));
    }

    #[test]
    fn out_of_window_rejected() {
        let mut im = InputMap::new();
        let a = im.insert_sender(uuid(1)).unwrap();
        let res = im.insert(a, user_msg(uuid(1), INPUT_MAP_WINDOW), vec![]);
        assert!(matches!(res, Err(EvsError::OutOfRange { .. })));
    }

    #[test]
    fn inactive_sender_stops_pinning_aru_and_safe() {
        let mut im = InputMap::new();
        let a = im.insert_sender(uuid(1)).unwrap();
        let b = im.insert_sender(uuid(2)).unwrap();
        for seq in 0..3 {
            im.insert(a, user_msg(uuid(1), seq), vec![]).unwrap();
        }
        // The silent sender holds everything back.
        assert_eq!(im.aru_seq(), Seqno::NONE);

        im.set_operational(b, false);
        assert!(!im.is_operational(b));
        assert_eq!(im.aru_seq(), Seqno(2));

        im.set_safe_seq(a, Seqno(2)).unwrap();
        assert_eq!(im.safe_seq(), Seqno(2));
    }

    #[test]
    fn safe_seq_never_ahead_of_aru() {
        let mut im = InputMap::new();
        let a = im.insert_sender(uuid(1)).unwrap();
        im.insert(a, user_msg(uuid(1), 0), vec![]).unwrap();
        assert!(im.set_safe_seq(a, Seqno(5)).is_err());
        im.set_safe_seq(a, Seqno(0)).unwrap();
        assert_eq!(im.safe_seq(), Seqno(0));
    }

    #[test]
    fn erase_unsafe_goes_to_recovery() {
        let mut im = InputMap::new();
        let a = im.insert_sender(uuid(1)).unwrap();
        im.insert(a, user_msg(uuid(1), 0), vec![1, 2, 3]).unwrap();
        let key = MsgKey {
            seq: Seqno(0),
            index: a,
        };
        assert!(!im.is_safe(&key));
        im.erase(&key);
        assert!(im.get(&key).is_none());
        assert!(im.recover(a, Seqno(0)).is_some());
    }

    #[test]
    fn delivery_order_is_seq_then_index() {
        let mut im = InputMap::new();
        let a = im.insert_sender(uuid(1)).unwrap();
        let b = im.insert_sender(uuid(2)).unwrap();
        im.insert(b, user_msg(uuid(2), 0), vec![]).unwrap();
        im.insert(a, user_msg(uuid(1), 1), vec![]).unwrap();
        im.insert(a, user_msg(uuid(1), 0), vec![]).unwrap();
        im.insert(b, user_msg(uuid(2), 1), vec![]).unwrap();

        let order: Vec<(i64, usize)> = im.keys().iter().map(|k| (k.seq.get(), k.index)).collect();
        assert_eq!(order, vec![(0, a), (0, b), (1, a), (1, b)]);
    }
}
