//! Bounded codec cursors.
//!
//! `WireWrite` appends into a caller-owned `Vec<u8>`; `WireRead` walks a
//! borrowed slice. Both are length-checked: a short read surfaces as
//! [`ProtoError::Underrun`] instead of a panic, since the bytes come off the
//! network.

use crate::ProtoError;

pub struct WireWrite<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> WireWrite<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        Self { buf }
    }

    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64_be(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// NUL-terminated string. The string itself must not contain NUL.
    pub fn put_cstr(&mut self, v: &str) -> Result<(), ProtoError> {
        if v.len() > crate::constants::MAX_WIRE_STRING {
            return Err(ProtoError::StringTooLong {
                len: v.len(),
                limit: crate::constants::MAX_WIRE_STRING,
            });
        }
        debug_assert!(!v.as_bytes().contains(&0));
        self.buf.extend_from_slice(v.as_bytes());
        self.buf.push(0);
        Ok(())
    }
}

pub struct WireRead<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireRead<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtoError> {
        if self.remaining() < n {
            return Err(ProtoError::Underrun {
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, ProtoError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, ProtoError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, ProtoError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64, ProtoError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_i16(&mut self) -> Result<i16, ProtoError> {
        let b = self.take(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_i64(&mut self) -> Result<i64, ProtoError> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_u64_be(&mut self) -> Result<u64, ProtoError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], ProtoError> {
        self.take(n)
    }

    /// Remainder of the buffer, consuming it.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    /// NUL-terminated string.
    pub fn get_cstr(&mut self) -> Result<&'a str, ProtoError> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtoError::Underrun {
                needed: 1,
                available: 0,
            })?;
        if nul > crate::constants::MAX_WIRE_STRING {
            return Err(ProtoError::StringTooLong {
                len: nul,
                limit: crate::constants::MAX_WIRE_STRING,
            });
        }
        let s = std::str::from_utf8(&rest[..nul]).map_err(|_| ProtoError::BadString)?;
        self.pos += nul + 1;
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_integers() {
        let mut buf = Vec::new();
        let mut w = WireWrite::new(&mut buf);
        w.put_u8(0xab);
        w.put_u16(0x1234);
        w.put_u32(0xdeadbeef);
        w.put_i64(-42);
        w.put_u64_be(0x0102030405060708);

        let mut r = WireRead::new(&buf);
        assert_eq!(r.get_u8().unwrap(), 0xab);
        assert_eq!(r.get_u16().unwrap(), 0x1234);
        assert_eq!(r.get_u32().unwrap(), 0xdeadbeef);
        assert_eq!(r.get_i64().unwrap(), -42);
        assert_eq!(r.get_u64_be().unwrap(), 0x0102030405060708);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn underrun_is_an_error() {
        let buf = [0u8; 3];
        let mut r = WireRead::new(&buf);
        assert!(matches!(
            r.get_u32(),
            Err(ProtoError::Underrun {
                needed: 4,
                available: 3
            })
        ));
    }

    #[test]
    fn cstr_roundtrip() {
        let mut buf = Vec::new();
        let mut w = WireWrite::new(&mut buf);
        w.put_cstr("node-1").unwrap();
        w.put_cstr("").unwrap();
        let mut r = WireRead::new(&buf);
        assert_eq!(r.get_cstr().unwrap(), "node-1");
        assert_eq!(r.get_cstr().unwrap(), "");
    }
}
