//! # Relicast Group
//!
//! The group communication core: action framing over the EVS engine, state
//! exchange and quorum after each view, the action cache hookup, and the
//! threaded application facade.
//!
//! The application-facing primitive is simple (submit an action, receive
//! the same sequence of actions with the same global seqnos on every live
//! member) and everything in this crate exists to keep that primitive true
//! across membership changes, lost fragments and flow control.

pub mod config;
pub mod core;
pub mod fifo;
pub mod frag;
pub mod link;
pub mod replicator;
pub mod state_msg;

pub use config::Config;
pub use core::{GroupCore, RecvItem};
pub use frag::{Action, Defrag, FragIter};
pub use link::{Link, LinkEvent, MemHub, MemLink};
pub use replicator::Replicator;
pub use state_msg::{compute_quorum, NodeState, Quorum, StateMessage};

use relicast_proto::ProtoError;
use thiserror::Error;

/// Error kinds exposed by core operations, the taxonomy applications see.
#[derive(Debug, Error)]
pub enum GroupError {
    /// Flow control rejected the send; retry later.
    #[error("would block")]
    WouldBlock,
    /// No primary component right now; wait for the next CONF_CHANGE.
    #[error("not connected to a primary component")]
    NotConnected,
    /// The primary component changed mid-send; the action must be
    /// restarted, peers have discarded the sent fragments.
    #[error("connection reset: configuration changed mid-send")]
    ConnReset,
    /// This node voluntarily left or was evicted. Terminal.
    #[error("connection aborted")]
    ConnAborted,
    /// Malformed input from the network: dropped and logged, never fatal.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A local invariant does not hold: a bug, not remote input.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// Seqno outside the permitted window.
    #[error("sequence number out of range")]
    OutOfRange,
    /// Allocation failed. The engine shifts to LEAVING if it still can.
    #[error("out of memory")]
    OutOfMemory,
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] ProtoError),
    #[error("cache error: {0}")]
    Cache(#[from] relicast_cache::CacheError),
}

impl From<relicast_evs::EvsError> for GroupError {
    fn from(err: relicast_evs::EvsError) -> Self {
        use relicast_evs::EvsError;
        match err {
            EvsError::WouldBlock => GroupError::WouldBlock,
            EvsError::NotConnected(_) => GroupError::NotConnected,
            EvsError::Protocol(msg) => GroupError::Protocol(msg),
            EvsError::OutOfRange { seq, .. } => {
                tracing::warn!(seq, "seqno out of range");
                GroupError::OutOfRange
            }
            EvsError::InvariantViolation(msg) => GroupError::InvariantViolation(msg),
            EvsError::Codec(e) => GroupError::Codec(e),
        }
    }
}

/// Type of an application action or delivered item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ActionType {
    #[default]
    Data = 0,
    Service = 1,
    CommitCut = 2,
    ConfChange = 3,
    StateReq = 4,
    Sync = 5,
    Flow = 6,
    Error = 7,
}

impl ActionType {
    pub fn from_u8(value: u8) -> Result<Self, GroupError> {
        match value {
            0 => Ok(ActionType::Data),
            1 => Ok(ActionType::Service),
            2 => Ok(ActionType::CommitCut),
            3 => Ok(ActionType::ConfChange),
            4 => Ok(ActionType::StateReq),
            5 => Ok(ActionType::Sync),
            6 => Ok(ActionType::Flow),
            7 => Ok(ActionType::Error),
            _ => Err(GroupError::Protocol(format!(
                "invalid action type {value}"
            ))),
        }
    }
}

/// Multiplexing tag of a group-level message riding on the ordered stream
/// (or, for `Component`, injected by the transport below).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Action = 0,
    Component = 1,
    StateUuid = 2,
    StateMsg = 3,
    Join = 4,
    Sync = 5,
    Flow = 6,
    Last = 7,
    Causal = 8,
}

impl MsgType {
    pub fn from_u8(value: u8) -> Result<Self, GroupError> {
        match value {
            0 => Ok(MsgType::Action),
            1 => Ok(MsgType::Component),
            2 => Ok(MsgType::StateUuid),
            3 => Ok(MsgType::StateMsg),
            4 => Ok(MsgType::Join),
            5 => Ok(MsgType::Sync),
            6 => Ok(MsgType::Flow),
            7 => Ok(MsgType::Last),
            8 => Ok(MsgType::Causal),
            _ => Err(GroupError::Protocol(format!("invalid message type {value}"))),
        }
    }
}
