//! Sequence number algebra.

use crate::{ProtoError, WireRead, WireWrite};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// Signed 64-bit sequence number. `-1` is the distinguished "none" value,
/// `0` means no activity yet, positive values are live sequence numbers.
/// Arithmetic is ordinary signed arithmetic; no wrapping is assumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seqno(pub i64);

impl Seqno {
    pub const NONE: Seqno = Seqno(-1);
    pub const ZERO: Seqno = Seqno(0);

    pub fn is_none(&self) -> bool {
        self.0 < 0
    }

    pub fn get(&self) -> i64 {
        self.0
    }

    pub fn write(&self, w: &mut WireWrite<'_>) {
        w.put_i64(self.0);
    }

    pub fn read(r: &mut WireRead<'_>) -> Result<Self, ProtoError> {
        Ok(Seqno(r.get_i64()?))
    }
}

impl Default for Seqno {
    fn default() -> Self {
        Seqno::NONE
    }
}

impl From<i64> for Seqno {
    fn from(v: i64) -> Self {
        Seqno(v)
    }
}

impl Add<i64> for Seqno {
    type Output = Seqno;
    fn add(self, rhs: i64) -> Seqno {
        Seqno(self.0 + rhs)
    }
}

impl AddAssign<i64> for Seqno {
    fn add_assign(&mut self, rhs: i64) {
        self.0 += rhs;
    }
}

impl Sub<i64> for Seqno {
    type Output = Seqno;
    fn sub(self, rhs: i64) -> Seqno {
        Seqno(self.0 - rhs)
    }
}

impl fmt::Display for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-sender window of sequence numbers: `lu` is the lowest unseen seqno
/// (the next expected), `hs` the highest seen. Empty when `lu > hs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    lu: Seqno,
    hs: Seqno,
}

impl Range {
    pub fn new(lu: Seqno, hs: Seqno) -> Self {
        Range { lu, hs }
    }

    pub fn lu(&self) -> Seqno {
        self.lu
    }

    pub fn hs(&self) -> Seqno {
        self.hs
    }

    pub fn set_lu(&mut self, s: Seqno) {
        self.lu = s;
    }

    pub fn set_hs(&mut self, s: Seqno) {
        self.hs = s;
    }

    pub fn is_empty(&self) -> bool {
        self.lu > self.hs
    }

    pub fn write(&self, w: &mut WireWrite<'_>) {
        self.lu.write(w);
        self.hs.write(w);
    }

    pub fn read(r: &mut WireRead<'_>) -> Result<Self, ProtoError> {
        let lu = Seqno::read(r)?;
        let hs = Seqno::read(r)?;
        Ok(Range { lu, hs })
    }

    pub const fn wire_size() -> usize {
        16
    }
}

impl Default for Range {
    /// A fresh sender range: next expected is 0, nothing seen yet.
    fn default() -> Self {
        Range {
            lu: Seqno::ZERO,
            hs: Seqno::NONE,
        }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.lu, self.hs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_range_is_empty() {
        let r = Range::default();
        assert!(r.is_empty());
        assert_eq!(r.lu(), Seqno::ZERO);
        assert_eq!(r.hs(), Seqno::NONE);
    }

    #[test]
    fn seqno_arithmetic() {
        let s = Seqno(5);
        assert_eq!(s + 1, Seqno(6));
        assert_eq!(s - 6, Seqno::NONE);
        assert!(Seqno::NONE.is_none());
        assert!(!Seqno::ZERO.is_none());
    }
}
