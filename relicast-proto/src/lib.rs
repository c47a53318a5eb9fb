//! # Relicast Proto
//!
//! Wire primitives shared by every layer of the relicast stack: bounded
//! little-endian codec cursors, the node identity type, sequence number
//! algebra, group views and the time provider abstraction.
//!
//! All multi-byte integers on the wire are little-endian unless a field is
//! explicitly documented as big-endian (node identities and the action id
//! overlay are the two exceptions).

pub mod constants;
pub mod seqno;
pub mod time;
pub mod uuid;
pub mod view;
pub mod wire;

pub use seqno::{Range, Seqno};
pub use time::{SystemTimeProvider, TimeProvider};
pub use uuid::Uuid;
pub use view::{Configuration, Member, View, ViewId, ViewType};
pub use wire::{WireRead, WireWrite};

use thiserror::Error;

/// Errors raised while encoding or decoding wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    #[error("buffer underrun: needed {needed} bytes, {available} available")]
    Underrun { needed: usize, available: usize },
    #[error("buffer overrun: needed {needed} bytes, {available} available")]
    Overrun { needed: usize, available: usize },
    #[error("invalid discriminant {value} for {what}")]
    InvalidDiscriminant { what: &'static str, value: u64 },
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("string field is not valid utf-8")]
    BadString,
    #[error("string field of {len} bytes exceeds limit {limit}")]
    StringTooLong { len: usize, limit: usize },
}

/// Message safety classes, weakest to strongest. The prefix of a user
/// message dictates when it may be delivered to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SafetyPrefix {
    /// Delivery not required at all; the message may be dropped.
    Drop = 0,
    /// Best effort, no ordering obligations.
    Unreliable = 1,
    /// In order relative to the same sender.
    Fifo = 2,
    /// Delivered once every known sender's stream is complete up to it.
    Agreed = 3,
    /// Delivered once every current member has acknowledged reception.
    Safe = 4,
}

impl SafetyPrefix {
    pub fn from_u8(value: u8) -> Result<Self, ProtoError> {
        match value {
            0 => Ok(SafetyPrefix::Drop),
            1 => Ok(SafetyPrefix::Unreliable),
            2 => Ok(SafetyPrefix::Fifo),
            3 => Ok(SafetyPrefix::Agreed),
            4 => Ok(SafetyPrefix::Safe),
            _ => Err(ProtoError::InvalidDiscriminant {
                what: "SafetyPrefix",
                value: value as u64,
            }),
        }
    }
}

/// Network proximity label for a node. Retransmission prefers same-segment
/// peers before crossing to remote ones.
pub type SegmentId = u8;
