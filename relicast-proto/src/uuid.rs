//! Node identity.

use crate::constants::UUID_SIZE;
use crate::{ProtoError, WireRead, WireWrite};
use std::fmt;

/// 128-bit node identity. Ordered lexicographically over the raw bytes; the
/// group representative is always the operational node with the smallest
/// identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Uuid([u8; UUID_SIZE]);

impl Uuid {
    pub const fn nil() -> Self {
        Uuid([0; UUID_SIZE])
    }

    pub const fn from_bytes(bytes: [u8; UUID_SIZE]) -> Self {
        Uuid(bytes)
    }

    /// Random identity (version 4 layout bits set).
    pub fn random(rng: &mut dyn rand::RngCore) -> Self {
        let mut bytes = [0u8; UUID_SIZE];
        rng.fill_bytes(&mut bytes);
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;
        Uuid(bytes)
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0; UUID_SIZE]
    }

    pub fn as_bytes(&self) -> &[u8; UUID_SIZE] {
        &self.0
    }

    /// Bump the incarnation counter in bytes 8..10, interpreted as a
    /// big-endian u16. A node that rejoins with the same identity but a new
    /// process instance increments this so peers can tell the two apart.
    pub fn increment_incarnation(&mut self) {
        let inc = u16::from_be_bytes([self.0[8], self.0[9]]).wrapping_add(1);
        self.0[8..10].copy_from_slice(&inc.to_be_bytes());
    }

    /// True if the identities differ only in the incarnation counter.
    pub fn fixed_part_matches(&self, other: &Uuid) -> bool {
        self.0[..8] == other.0[..8] && self.0[10..] == other.0[10..]
    }

    pub fn write(&self, w: &mut WireWrite<'_>) {
        w.put_bytes(&self.0);
    }

    pub fn read(r: &mut WireRead<'_>) -> Result<Self, ProtoError> {
        let b = r.get_bytes(UUID_SIZE)?;
        let mut bytes = [0u8; UUID_SIZE];
        bytes.copy_from_slice(b);
        Ok(Uuid(bytes))
    }

    pub const fn wire_size() -> usize {
        UUID_SIZE
    }
}

/// Short form: first four bytes, the same prefix the logs use everywhere.
impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// Full form: canonical 8-4-4-4-12 hex.
impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                write!(f, "-")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incarnation_bump_touches_only_bytes_8_and_9() {
        let mut u = Uuid::from_bytes([
            1, 2, 3, 4, 5, 6, 7, 8, 0x00, 0xff, 11, 12, 13, 14, 15, 16,
        ]);
        let orig = u;
        u.increment_incarnation();
        assert_eq!(u.as_bytes()[8], 0x01);
        assert_eq!(u.as_bytes()[9], 0x00);
        assert!(u.fixed_part_matches(&orig));
        assert_ne!(u, orig);
    }

    #[test]
    fn nil_sorts_first() {
        let a = Uuid::from_bytes([0xff; 16]);
        assert!(Uuid::nil() < a);
    }
}
