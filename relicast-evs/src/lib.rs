//! # Relicast EVS
//!
//! Extended virtual synchrony: a membership and reliable totally-ordered
//! multicast engine. The engine is sans-io: it consumes parsed messages,
//! component notifications and timer ticks (all with an explicit `now`) and
//! produces serialized datagrams and ordered deliveries through poll
//! queues. The group layer above wires it to a real transport; the tests
//! wire several engines to each other directly.
//!
//! ## Layering
//!
//! - [`input_map`]: per-sender receive windows and the ARU / safe seqno
//!   bookkeeping behind agreed and safe delivery.
//! - [`message`]: the typed message codec (USER, DELEGATE, GAP, JOIN,
//!   INSTALL, LEAVE, DELAYED_LIST).
//! - [`node`]: the `known` table of members and their last membership
//!   messages.
//! - [`consensus`]: consistency rules over JOIN/INSTALL messages.
//! - [`proto`]: the view-change state machine, retransmission, flow
//!   control and delivery.

pub mod consensus;
pub mod error;
pub mod input_map;
pub mod message;
pub mod node;
pub mod proto;
pub mod time;
pub mod timer;

pub use error::EvsError;
pub use input_map::{InputMap, InputMapMsg, MsgKey};
pub use message::{Message, MessageType};
pub use proto::{EvsDelivery, Proto, ProtoConfig, ProtoState, ProtoStats};
