use relicast_proto::ProtoError;
use thiserror::Error;

/// Errors surfaced by the EVS engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvsError {
    /// Flow control rejected the send; the caller retries later.
    #[error("would block")]
    WouldBlock,
    /// The engine is not in a state where the operation makes sense.
    #[error("not connected (state {0})")]
    NotConnected(&'static str),
    /// Malformed or out-of-order input from a remote node. Dropped and
    /// logged at the engine boundary, never fatal.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Sequence number outside the permitted window.
    #[error("seqno {seq} outside window [{low}, {high})")]
    OutOfRange { seq: i64, low: i64, high: i64 },
    /// A local invariant does not hold. This is a bug, not remote input;
    /// callers abort.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error(transparent)]
    Codec(#[from] ProtoError),
}
