//! Action framing: splitting an application action into fragments that fit
//! the transport MTU, and reassembling them on the receive side.
//!
//! Fragment header, 20 bytes:
//!
//! ```text
//! bytes  0..8   act_id, big-endian u64; byte 0 is overlaid with the
//!               protocol version (low 4 bits) and action type (high 4
//!               bits) on the wire, and restored to zero before the id is
//!               interpreted
//! bytes  8..12  act_size, u32 little-endian
//! bytes 12..16  frag_no, u32 little-endian
//! byte  16      action type
//! bytes 17..20  reserved
//! ```

use crate::{ActionType, GroupError};
use relicast_proto::constants::{ACT_HEADER_SIZE, ACT_ID_MAX, ACT_PROTO_VERSION};
use tracing::{debug, error};

/// One decoded fragment. `(sender, act_id)` identifies the action;
/// `frag_no == 0` is the first fragment; the action is complete when the
/// accumulated payload reaches `act_size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActFrag<'a> {
    pub act_id: u64,
    pub act_size: u32,
    pub frag_no: u32,
    pub act_type: ActionType,
    pub proto_ver: u8,
    pub payload: &'a [u8],
}

/// Write a fragment header into `buf`.
pub fn write_header(
    buf: &mut Vec<u8>,
    act_id: u64,
    act_size: u32,
    frag_no: u32,
    act_type: ActionType,
) -> Result<(), GroupError> {
    if act_id > ACT_ID_MAX {
        return Err(GroupError::Protocol(format!(
            "action id {act_id} exceeds protocol limit"
        )));
    }
    let start = buf.len();
    buf.extend_from_slice(&act_id.to_be_bytes());
    // Byte 0 of the id is always zero within the id limit; overlay the
    // version and type nibbles on it.
    buf[start] = ACT_PROTO_VERSION | (act_type as u8) << 4;
    buf.extend_from_slice(&act_size.to_le_bytes());
    buf.extend_from_slice(&frag_no.to_le_bytes());
    buf.push(act_type as u8);
    buf.extend_from_slice(&[0u8; 3]);
    Ok(())
}

/// Parse a fragment header and borrow the payload behind it.
pub fn read_frag(buf: &[u8]) -> Result<ActFrag<'_>, GroupError> {
    if buf.len() < ACT_HEADER_SIZE {
        return Err(GroupError::Protocol(format!(
            "fragment of {} bytes is shorter than the header",
            buf.len()
        )));
    }
    let proto_ver = buf[0] & 0x0f;
    if proto_ver != ACT_PROTO_VERSION {
        return Err(GroupError::Protocol(format!(
            "unsupported action protocol version {proto_ver}"
        )));
    }
    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&buf[0..8]);
    id_bytes[0] = 0;
    let act_id = u64::from_be_bytes(id_bytes);
    let act_size = u32::from_le_bytes(buf[8..12].try_into().expect("4 bytes"));
    let frag_no = u32::from_le_bytes(buf[12..16].try_into().expect("4 bytes"));
    let act_type = ActionType::from_u8(buf[16])?;
    Ok(ActFrag {
        act_id,
        act_size,
        frag_no,
        act_type,
        proto_ver,
        payload: &buf[ACT_HEADER_SIZE..],
    })
}

/// Sender-side splitter: yields ready-to-send fragment buffers of at most
/// `pkt_size` bytes each, all carrying the same action id.
pub struct FragIter<'a> {
    act_id: u64,
    act_type: ActionType,
    act_size: u32,
    rest: &'a [u8],
    frag_no: u32,
    chunk: usize,
}

impl<'a> FragIter<'a> {
    pub fn new(
        act_id: u64,
        act_type: ActionType,
        action: &'a [u8],
        pkt_size: usize,
    ) -> Result<Self, GroupError> {
        if pkt_size <= ACT_HEADER_SIZE {
            return Err(GroupError::Protocol(format!(
                "packet size {pkt_size} cannot fit the fragment header"
            )));
        }
        Ok(FragIter {
            act_id,
            act_type,
            act_size: action.len() as u32,
            rest: action,
            frag_no: 0,
            chunk: pkt_size - ACT_HEADER_SIZE,
        })
    }

    /// Total number of fragments this action will produce.
    pub fn total(&self) -> u32 {
        (self.act_size as usize).div_ceil(self.chunk).max(1) as u32
    }
}

impl<'a> Iterator for FragIter<'a> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if self.rest.is_empty() && self.frag_no > 0 {
            return None;
        }
        let take = self.rest.len().min(self.chunk);
        let mut buf = Vec::with_capacity(ACT_HEADER_SIZE + take);
        write_header(&mut buf, self.act_id, self.act_size, self.frag_no, self.act_type)
            .expect("action id validated at send entry");
        buf.extend_from_slice(&self.rest[..take]);
        self.rest = &self.rest[take..];
        self.frag_no += 1;
        Some(buf)
    }
}

/// Per-sender reassembly state. Strict FIFO: one action at a time per
/// sender, fragments in order.
#[derive(Debug, Default)]
pub struct Defrag {
    act_id: u64,
    act_type: ActionType,
    size: usize,
    received: usize,
    frag_no: u32,
    head: Vec<u8>,
    in_progress: bool,
    /// Raised on configuration change; the next first fragment quietly
    /// replaces whatever was half-assembled.
    reset: bool,
}

/// A fully reassembled action. For local actions the buffer is empty; the
/// sender FIFO owns the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub act_type: ActionType,
    pub size: usize,
    pub buf: Vec<u8>,
}

impl Defrag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the current action on a configuration change. The local
    /// sender is expected to restart its half-sent action.
    pub fn reset(&mut self) {
        self.reset = true;
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    /// Feed one fragment. `Ok(Some(action))` when the action completed,
    /// `Ok(None)` when more fragments are needed.
    ///
    /// For a local action no buffer is accumulated; the application still
    /// owns the payload and gets it back through the sender FIFO.
    pub fn handle_frag(
        &mut self,
        frag: &ActFrag<'_>,
        local: bool,
    ) -> Result<Option<Action>, GroupError> {
        if self.in_progress {
            self.frag_no += 1;
            if self.act_id != frag.act_id || self.frag_no != frag.frag_no {
                if local && self.reset && self.act_id == frag.act_id && frag.frag_no == 0 {
                    // The half-sent action was aborted by the sender thread;
                    // restart bookkeeping with the fresh attempt.
                    debug!(act_id = frag.act_id, "local action reset");
                    self.act_type = frag.act_type;
                    self.size = frag.act_size as usize;
                    self.frag_no = 0;
                    self.received = 0;
                    self.reset = false;
                    self.head.clear();
                } else {
                    error!(
                        expected_id = self.act_id,
                        expected_frag = self.frag_no,
                        got_id = frag.act_id,
                        got_frag = frag.frag_no,
                        "unordered fragment"
                    );
                    self.frag_no -= 1;
                    return Err(GroupError::Protocol("unordered fragment received".into()));
                }
            }
        } else if frag.frag_no == 0 {
            self.act_id = frag.act_id;
            self.act_type = frag.act_type;
            self.size = frag.act_size as usize;
            self.received = 0;
            self.frag_no = 0;
            self.reset = false;
            self.in_progress = true;
            self.head.clear();
            if !local {
                self.head.reserve(self.size);
            }
        } else if !local && self.reset {
            // Mid-action tail after a configuration change; ignore calmly.
            debug!(
                act_id = frag.act_id,
                frag_no = frag.frag_no,
                "ignoring fragment after action reset"
            );
            return Ok(None);
        } else {
            error!(
                got_id = frag.act_id,
                got_frag = frag.frag_no,
                "fragment does not start an action"
            );
            return Err(GroupError::Protocol(
                "expected first fragment of an action".into(),
            ));
        }

        self.received += frag.payload.len();
        if self.received > self.size {
            self.in_progress = false;
            return Err(GroupError::Protocol(format!(
                "fragments exceed declared action size {}",
                self.size
            )));
        }
        if !local {
            self.head.extend_from_slice(frag.payload);
        }

        if self.received == self.size {
            let action = Action {
                act_type: self.act_type,
                size: self.size,
                buf: std::mem::take(&mut self.head),
            };
            self.in_progress = false;
            self.frag_no = 0;
            self.received = 0;
            self.size = 0;
            Ok(Some(action))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_overlay_restores_act_id() {
        let mut buf = Vec::new();
        write_header(&mut buf, 0x00dead_beef_cafe, 100, 3, ActionType::Data).unwrap();
        assert_eq!(buf.len(), ACT_HEADER_SIZE);
        let frag = read_frag(&buf).unwrap();
        assert_eq!(frag.act_id, 0x00dead_beef_cafe);
        assert_eq!(frag.act_size, 100);
        assert_eq!(frag.frag_no, 3);
        assert_eq!(frag.act_type, ActionType::Data);
        assert_eq!(frag.proto_ver, ACT_PROTO_VERSION);
    }

    #[test]
    fn split_then_reassemble() {
        let action: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        let frags: Vec<Vec<u8>> =
            FragIter::new(7, ActionType::Data, &action, 1400).unwrap().collect();
        assert!(frags.len() > 1);

        let mut df = Defrag::new();
        let mut out = None;
        for (i, frag_buf) in frags.iter().enumerate() {
            let frag = read_frag(frag_buf).unwrap();
            assert_eq!(frag.frag_no, i as u32);
            out = df.handle_frag(&frag, false).unwrap();
        }
        let action_out = out.expect("complete after last fragment");
        assert_eq!(action_out.buf, action);
    }

    #[test]
    fn unordered_fragment_is_protocol_error() {
        let action = vec![1u8; 3000];
        let frags: Vec<Vec<u8>> =
            FragIter::new(1, ActionType::Data, &action, 1400).unwrap().collect();
        let mut df = Defrag::new();
        let f0 = read_frag(&frags[0]).unwrap();
        df.handle_frag(&f0, false).unwrap();
        let f2 = read_frag(&frags[2]).unwrap();
        assert!(matches!(
            df.handle_frag(&f2, false),
            Err(GroupError::Protocol(_))
        ));
    }

    #[test]
    fn tail_after_reset_is_ignored_for_remote() {
        let action = vec![9u8; 3000];
        let frags: Vec<Vec<u8>> =
            FragIter::new(1, ActionType::Data, &action, 1400).unwrap().collect();
        let mut df = Defrag::new();
        df.reset();
        let f1 = read_frag(&frags[1]).unwrap();
        assert_eq!(df.handle_frag(&f1, false).unwrap(), None);
    }

    #[test]
    fn local_restart_after_reset() {
        let frags_a: Vec<Vec<u8>> =
            FragIter::new(5, ActionType::Data, &vec![1u8; 3000], 1400).unwrap().collect();
        let mut df = Defrag::new();
        let f0 = read_frag(&frags_a[0]).unwrap();
        df.handle_frag(&f0, true).unwrap();
        // Configuration change aborts the action midway; the sender retries
        // with the same action id.
        df.reset();
        let frags_b: Vec<Vec<u8>> =
            FragIter::new(5, ActionType::Data, &vec![2u8; 100], 1400).unwrap().collect();
        let fb = read_frag(&frags_b[0]).unwrap();
        let done = df.handle_frag(&fb, true).unwrap();
        assert!(done.is_some());
    }

    #[test]
    fn empty_action_is_a_single_fragment() {
        let frags: Vec<Vec<u8>> =
            FragIter::new(1, ActionType::Service, &[], 1400).unwrap().collect();
        assert_eq!(frags.len(), 1);
        let frag = read_frag(&frags[0]).unwrap();
        let mut df = Defrag::new();
        let done = df.handle_frag(&frag, false).unwrap();
        assert_eq!(done.unwrap().size, 0);
    }
}
