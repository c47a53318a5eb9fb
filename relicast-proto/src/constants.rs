//! Fundamental and derived constants of the relicast protocol.

/// Size of a node identity on the wire.
pub const UUID_SIZE: usize = 16;

/// Current EVS protocol version carried in the common header (4 bits).
pub const EVS_PROTO_VERSION: u8 = 0;

/// Current action framing protocol version (low nibble of byte 0).
pub const ACT_PROTO_VERSION: u8 = 0;

/// Size of the action fragment header preceding every fragment payload.
pub const ACT_HEADER_SIZE: usize = 20;

/// Upper bound on the action id counter: the top byte of the 64-bit id is
/// overlaid by version/type bits on the wire, so only 56 bits are usable.
pub const ACT_ID_MAX: u64 = 0x00ff_ffff_ffff_ffff;

/// Hard cap on NUL-terminated strings in wire messages (names, addresses).
/// Generous for hostnames, small enough to bound a hostile message.
pub const MAX_WIRE_STRING: usize = 256;

/// Hard cap on the node list length in membership messages. A component
/// larger than this cannot form.
pub const MAX_NODES: usize = 256;

/// Input map window: how far ahead of the lowest unseen seqno a sender may
/// run. Must be at least the largest configurable send window.
pub const INPUT_MAP_WINDOW: i64 = 1024;

/// Default fragmentation size before the application tunes it.
pub const DEFAULT_PACKET_SIZE: usize = 32 * 1024;
