//! The local action FIFO: the zero-copy return path for a sender's own
//! actions.
//!
//! A submitted action's payload never round-trips through the wire buffers
//! on its own node. The buffer is parked here at send time; when the
//! action's fragments complete the total order, the head entry is popped
//! and delivered by value. A configuration change that aborts a half-sent
//! action discards the head instead.

use crate::{ActionType, GroupError};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug)]
pub struct FifoEntry {
    pub act_id: u64,
    pub act_type: ActionType,
    /// Shared with the send path while fragments are on the wire; sole
    /// owner again by delivery time.
    pub buf: Arc<Vec<u8>>,
}

/// Bounded FIFO of in-flight local actions.
#[derive(Debug)]
pub struct ActFifo {
    entries: VecDeque<FifoEntry>,
    cap: usize,
}

impl ActFifo {
    pub fn new(cap: usize) -> Self {
        ActFifo {
            entries: VecDeque::new(),
            cap,
        }
    }

    pub fn push(&mut self, entry: FifoEntry) -> Result<(), GroupError> {
        if self.entries.len() >= self.cap {
            return Err(GroupError::WouldBlock);
        }
        self.entries.push_back(entry);
        Ok(())
    }

    /// Pop the completed head. The caller matches the action id against the
    /// delivered action to catch FIFO violations.
    pub fn pop(&mut self, act_id: u64) -> Result<FifoEntry, GroupError> {
        match self.entries.pop_front() {
            Some(entry) if entry.act_id == act_id => Ok(entry),
            Some(entry) => Err(GroupError::InvariantViolation(format!(
                "local fifo head {} does not match delivered action {act_id}",
                entry.act_id
            ))),
            None => Err(GroupError::InvariantViolation(format!(
                "local fifo empty for delivered action {act_id}"
            ))),
        }
    }

    /// Discard the head after an aborted send.
    pub fn discard_head(&mut self) -> Option<FifoEntry> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
