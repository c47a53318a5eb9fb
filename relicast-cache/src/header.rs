//! On-disk layout: the human-readable preamble, the fixed header record and
//! the per-record buffer headers.

use crate::CacheError;
use relicast_proto::Seqno;

/// Bytes reserved for the ASCII preamble at the start of the file.
pub const PREAMBLE_LEN: usize = 512;

/// Number of u64 slots in the header record.
pub const HEADER_SLOTS: usize = 9;

/// Offset of the header record.
pub const HEADER_OFFSET: usize = PREAMBLE_LEN;

/// Offset of the data region.
pub const DATA_OFFSET: usize = PREAMBLE_LEN + HEADER_SLOTS * 8;

/// Current file format version.
pub const FILE_VERSION: u64 = 1;

/// Size of an inline buffer header.
pub const BH_SIZE: usize = 24;

/// Smallest usable file: preamble, header record and one buffer header.
pub const MIN_FILE_SIZE: usize = DATA_OFFSET + BH_SIZE;

pub const FLAG_RELEASED: u64 = 1 << 0;
pub const FLAG_CANCELED: u64 = 1 << 1;

/// Header record slots, in file order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Slot {
    HeaderLen = 0,
    Version = 1,
    OpenFlag = 2,
    FileSize = 3,
    DataOffset = 4,
    FirstOffset = 5,
    NextOffset = 6,
    SeqnoMin = 7,
    SeqnoMax = 8,
}

fn slot_at(map_len: usize, slot: Slot) -> Result<usize, CacheError> {
    let at = HEADER_OFFSET + (slot as usize) * 8;
    if at + 8 > map_len {
        return Err(CacheError::Corrupt(format!(
            "header slot {slot:?} at {at} past end of file ({map_len} bytes)"
        )));
    }
    Ok(at)
}

pub fn read_slot(map: &[u8], slot: Slot) -> Result<u64, CacheError> {
    let at = slot_at(map.len(), slot)?;
    Ok(u64::from_le_bytes(
        map[at..at + 8].try_into().expect("8-byte slot"),
    ))
}

pub fn write_slot(map: &mut [u8], slot: Slot, value: u64) -> Result<(), CacheError> {
    let at = slot_at(map.len(), slot)?;
    map[at..at + 8].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Inline record header: `size` includes the header itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHeader {
    pub size: i64,
    pub seqno: Seqno,
    pub flags: u64,
}

impl BufferHeader {
    pub fn read(map: &[u8], at: usize) -> Result<Self, CacheError> {
        if at + BH_SIZE > map.len() {
            return Err(CacheError::Corrupt(format!(
                "buffer header at {at} past end of file"
            )));
        }
        let size = i64::from_le_bytes(map[at..at + 8].try_into().expect("8 bytes"));
        let seqno = i64::from_le_bytes(map[at + 8..at + 16].try_into().expect("8 bytes"));
        let flags = u64::from_le_bytes(map[at + 16..at + 24].try_into().expect("8 bytes"));
        Ok(BufferHeader {
            size,
            seqno: Seqno(seqno),
            flags,
        })
    }

    pub fn write(&self, map: &mut [u8], at: usize) {
        map[at..at + 8].copy_from_slice(&self.size.to_le_bytes());
        map[at + 8..at + 16].copy_from_slice(&self.seqno.get().to_le_bytes());
        map[at + 16..at + 24].copy_from_slice(&self.flags.to_le_bytes());
    }

    pub fn is_released(&self) -> bool {
        self.flags & FLAG_RELEASED != 0
    }

    pub fn is_canceled(&self) -> bool {
        self.flags & FLAG_CANCELED != 0
    }
}

/// Render the debugging preamble into the first `PREAMBLE_LEN` bytes.
pub fn write_preamble(map: &mut [u8], file_size: u64, open: bool, first: u64, next: u64,
                      seqno_min: Seqno, seqno_max: Seqno) {
    let text = format!(
        "* relicast cache file *\n\
         -----------------------\n\
         Version      : {FILE_VERSION}\n\
         Size         : {file_size} bytes\n\
         Closed       : {}\n\
         Data offset  : {DATA_OFFSET}\n\
         First buffer : {first}\n\
         Next buffer  : {next}\n\
         Min. seqno   : {seqno_min}\n\
         Max. seqno   : {seqno_max}\n\
         -----------------------\n",
        if open { "no" } else { "yes" },
    );
    let bytes = text.as_bytes();
    let n = bytes.len().min(PREAMBLE_LEN);
    map[..n].copy_from_slice(&bytes[..n]);
    for b in map.iter_mut().take(PREAMBLE_LEN).skip(n) {
        *b = 0;
    }
}
