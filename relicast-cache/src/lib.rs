//! # Relicast Cache
//!
//! An mmap-backed circular buffer of globally ordered actions, addressed by
//! sequence number. The cache is what lets a donor feed a lagging joiner an
//! incremental prefix of the action log instead of a full state snapshot.
//!
//! Layout within a single `MAP_SHARED` file:
//!
//! | region | content |
//! |---|---|
//! | preamble | ASCII dump of the header for debugging |
//! | header record | nine u64 slots (version, open flag, offsets, seqno bounds) |
//! | data region | `BufferHeader` + payload records, wrapping circularly |
//!
//! Records never straddle the file end: a record that does not fit before
//! the end wraps to the start of the data region, leaving an abandoned tail
//! that recovery recognizes by its zeroed header.

pub mod header;

use header::{
    read_slot, write_slot, BufferHeader, Slot, BH_SIZE, DATA_OFFSET, FILE_VERSION, FLAG_CANCELED,
    FLAG_RELEASED,
};
use memmap2::MmapMut;
use parking_lot::Mutex;
use relicast_proto::Seqno;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cache file corrupt: {0}")]
    Corrupt(String),
    #[error("cache file of {size} bytes is below the minimum {min}")]
    FileTooSmall { size: usize, min: usize },
    #[error("buffer of {need} bytes cannot fit a cache of {capacity} data bytes")]
    BufferTooLarge { need: usize, capacity: usize },
    #[error("no reclaimable space for {need} bytes")]
    NoSpace { need: usize },
    #[error("seqno {0} not in cache")]
    SeqnoNotFound(Seqno),
    #[error("seqno {got} breaks continuity, expected {expected}")]
    SeqnoOutOfOrder { got: Seqno, expected: Seqno },
}

struct Inner {
    map: MmapMut,
    path: PathBuf,
    size: usize,
    first: usize,
    next: usize,
    seqno_min: Seqno,
    seqno_max: Seqno,
    /// seqno → offset of the record's `BufferHeader`. Offsets, not
    /// pointers: the mmap base does not survive a remap.
    seqno2ptr: BTreeMap<Seqno, usize>,
}

/// The action cache. All operations serialize on an internal mutex.
pub struct RingCache {
    inner: Mutex<Inner>,
}

impl Inner {
    fn end(&self) -> usize {
        self.size
    }

    fn capacity(&self) -> usize {
        self.size - DATA_OFFSET
    }

    fn write_header(&mut self, open: bool) -> Result<(), CacheError> {
        let map = &mut self.map[..];
        write_slot(map, Slot::HeaderLen, header::HEADER_SLOTS as u64)?;
        write_slot(map, Slot::Version, FILE_VERSION)?;
        write_slot(map, Slot::OpenFlag, open as u64)?;
        write_slot(map, Slot::FileSize, self.size as u64)?;
        write_slot(map, Slot::DataOffset, DATA_OFFSET as u64)?;
        write_slot(map, Slot::FirstOffset, (self.first - DATA_OFFSET) as u64)?;
        write_slot(map, Slot::NextOffset, (self.next - DATA_OFFSET) as u64)?;
        write_slot(map, Slot::SeqnoMin, self.seqno_min.get() as u64)?;
        write_slot(map, Slot::SeqnoMax, self.seqno_max.get() as u64)?;
        header::write_preamble(
            map,
            self.size as u64,
            open,
            (self.first - DATA_OFFSET) as u64,
            (self.next - DATA_OFFSET) as u64,
            self.seqno_min,
            self.seqno_max,
        );
        Ok(())
    }

    fn reset(&mut self) -> Result<(), CacheError> {
        self.first = DATA_OFFSET;
        self.next = DATA_OFFSET;
        self.seqno_min = Seqno::NONE;
        self.seqno_max = Seqno::NONE;
        self.seqno2ptr.clear();
        // Zero the first header so a fresh scan terminates immediately.
        BufferHeader {
            size: 0,
            seqno: Seqno::NONE,
            flags: 0,
        }
        .write(&mut self.map[..], DATA_OFFSET);
        self.write_header(true)
    }

    /// Reclaim released records at `first` until `need` contiguous bytes
    /// are available at `next`.
    fn ensure_space(&mut self, need: usize) -> Result<(), CacheError> {
        if need + BH_SIZE >= self.capacity() {
            return Err(CacheError::BufferTooLarge {
                need,
                capacity: self.capacity(),
            });
        }
        loop {
            // Contiguous room at `next`, honoring the no-straddle rule and
            // never running over `first`.
            let room = if self.seqno2ptr.is_empty() {
                self.next = DATA_OFFSET;
                self.first = DATA_OFFSET;
                self.end() - self.next
            } else if self.next >= self.first {
                let tail = self.end() - self.next;
                if tail >= need {
                    tail
                } else {
                    // Wrap: zero header marks the abandoned tail.
                    if tail >= BH_SIZE {
                        BufferHeader {
                            size: 0,
                            seqno: Seqno::NONE,
                            flags: 0,
                        }
                        .write(&mut self.map[..], self.next);
                    }
                    self.next = DATA_OFFSET;
                    continue;
                }
            } else {
                self.first - self.next
            };
            if room >= need {
                return Ok(());
            }
            self.evict_first(need)?;
        }
    }

    fn evict_first(&mut self, need: usize) -> Result<(), CacheError> {
        let mut at = self.first;
        if at + BH_SIZE > self.end() {
            at = DATA_OFFSET;
        }
        let bh = BufferHeader::read(&self.map[..], at)?;
        if bh.size == 0 {
            // Abandoned tail before the wrap point.
            self.first = DATA_OFFSET;
            return Ok(());
        }
        if !bh.is_released() {
            return Err(CacheError::NoSpace { need });
        }
        self.seqno2ptr.remove(&bh.seqno);
        if self.seqno_min == bh.seqno {
            self.seqno_min = match self.seqno2ptr.keys().next() {
                Some(s) => *s,
                None => Seqno::NONE,
            };
            if self.seqno2ptr.is_empty() {
                self.seqno_max = Seqno::NONE;
            }
        }
        self.first = at + bh.size as usize;
        if self.first + BH_SIZE > self.end() {
            self.first = DATA_OFFSET;
        }
        Ok(())
    }

    fn put(&mut self, seqno: Seqno, payload: &[u8]) -> Result<(), CacheError> {
        if !self.seqno_max.is_none() && seqno != self.seqno_max + 1 {
            return Err(CacheError::SeqnoOutOfOrder {
                got: seqno,
                expected: self.seqno_max + 1,
            });
        }
        let need = BH_SIZE + payload.len();
        self.ensure_space(need)?;
        let at = self.next;
        BufferHeader {
            size: need as i64,
            seqno,
            flags: 0,
        }
        .write(&mut self.map[..], at);
        self.map[at + BH_SIZE..at + need].copy_from_slice(payload);
        self.next = at + need;
        // Keep a terminator for recovery scans when room allows.
        if self.next + BH_SIZE <= self.end() {
            BufferHeader {
                size: 0,
                seqno: Seqno::NONE,
                flags: 0,
            }
            .write(&mut self.map[..], self.next);
        }
        self.seqno2ptr.insert(seqno, at);
        if self.seqno_min.is_none() {
            self.seqno_min = seqno;
        }
        self.seqno_max = seqno;
        self.write_header(true)
    }

    fn set_flag(&mut self, seqno: Seqno, flag: u64) -> Result<(), CacheError> {
        let at = *self
            .seqno2ptr
            .get(&seqno)
            .ok_or(CacheError::SeqnoNotFound(seqno))?;
        let mut bh = BufferHeader::read(&self.map[..], at)?;
        bh.flags |= flag;
        bh.write(&mut self.map[..], at);
        Ok(())
    }

    fn get(&self, seqno: Seqno) -> Result<(Vec<u8>, u64), CacheError> {
        let at = *self
            .seqno2ptr
            .get(&seqno)
            .ok_or(CacheError::SeqnoNotFound(seqno))?;
        let bh = BufferHeader::read(&self.map[..], at)?;
        let payload = self.map[at + BH_SIZE..at + bh.size as usize].to_vec();
        Ok((payload, bh.flags))
    }

    /// Rebuild `seqno2ptr` by walking `[first, next)`; any inconsistency
    /// resets the cache. The walk is anchored exclusively on the recorded
    /// next offset: a zero header wraps or terminates, and termination must
    /// land exactly on `next`.
    fn recover(&mut self) -> Result<(), CacheError> {
        let map_len = self.map.len();
        let version = read_slot(&self.map[..], Slot::Version)?;
        if version != FILE_VERSION {
            return Err(CacheError::Corrupt(format!(
                "unsupported version {version}"
            )));
        }
        let declared_size = read_slot(&self.map[..], Slot::FileSize)?;
        if declared_size != map_len as u64 {
            return Err(CacheError::Corrupt(format!(
                "declared size {declared_size} does not match real size {map_len}"
            )));
        }
        if read_slot(&self.map[..], Slot::DataOffset)? != DATA_OFFSET as u64 {
            return Err(CacheError::Corrupt("data offset mismatch".into()));
        }
        if read_slot(&self.map[..], Slot::OpenFlag)? != 0 {
            warn!("cache file was not closed cleanly, discarding data");
            return self.reset();
        }

        let first = read_slot(&self.map[..], Slot::FirstOffset)? as usize + DATA_OFFSET;
        let next = read_slot(&self.map[..], Slot::NextOffset)? as usize + DATA_OFFSET;
        if first + BH_SIZE > map_len || next + BH_SIZE > map_len {
            warn!("bogus buffer offsets, discarding data");
            return self.reset();
        }
        let seqno_min = Seqno(read_slot(&self.map[..], Slot::SeqnoMin)? as i64);
        let seqno_max = Seqno(read_slot(&self.map[..], Slot::SeqnoMax)? as i64);
        if seqno_min.is_none() != seqno_max.is_none() || seqno_min > seqno_max {
            warn!(%seqno_min, %seqno_max, "inconsistent seqno bounds, discarding data");
            return self.reset();
        }

        self.first = first;
        self.next = next;
        self.seqno_min = seqno_min;
        self.seqno_max = seqno_max;
        self.seqno2ptr.clear();

        info!("validating cached buffers");
        let mut at = self.first;
        let mut walked = 0usize;
        let mut valid = true;
        while at != self.next {
            if walked > self.capacity() {
                valid = false;
                break;
            }
            if at + BH_SIZE > map_len {
                at = DATA_OFFSET;
                continue;
            }
            let bh = match BufferHeader::read(&self.map[..], at) {
                Ok(bh) => bh,
                Err(_) => {
                    valid = false;
                    break;
                }
            };
            if bh.size == 0 {
                // A zero header marks the abandoned tail of a wrapped
                // layout; anywhere else it is corruption, since the walk
                // must land exactly on the recorded next offset.
                if self.next < self.first && at >= self.first {
                    walked += self.end() - at;
                    at = DATA_OFFSET;
                    continue;
                }
                valid = false;
                break;
            }
            if bh.size < BH_SIZE as i64 || at + bh.size as usize > map_len {
                valid = false;
                break;
            }
            if !bh.seqno.is_none() {
                self.seqno2ptr.insert(bh.seqno, at);
            }
            walked += bh.size as usize;
            at += bh.size as usize;
            if at + BH_SIZE > map_len {
                at = DATA_OFFSET;
            }
        }
        if !valid {
            warn!("cache metadata corrupted, failed to validate buffers; discarding data");
            return self.reset();
        }

        if !self.seqno_min.is_none() {
            debug!("checking for gaps in sequence numbers");
            let mut expected = self.seqno_min;
            let mut broken = false;
            for seqno in self.seqno2ptr.keys() {
                if *seqno != expected {
                    warn!(missing = %expected, "discontinuity in sequence numbers; discarding data");
                    broken = true;
                    break;
                }
                expected += 1;
            }
            if broken {
                return self.reset();
            }
            if expected != self.seqno_max + 1 {
                warn!("seqno bounds do not match scanned records; discarding data");
                return self.reset();
            }
        } else if !self.seqno2ptr.is_empty() {
            warn!("records found in a cache declared empty; discarding data");
            return self.reset();
        }

        info!(records = self.seqno2ptr.len(), "validating cached buffers done");
        self.write_header(true)
    }
}

impl RingCache {
    /// Create or recover a cache file of exactly `size` bytes.
    pub fn open(path: &Path, size: usize, page_size: usize) -> Result<Self, CacheError> {
        if size < header::MIN_FILE_SIZE {
            return Err(CacheError::FileTooSmall {
                size,
                min: header::MIN_FILE_SIZE,
            });
        }
        let exists = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let recovering = exists && file.metadata()?.len() == size as u64;
        file.set_len(size as u64)?;
        let map = unsafe { MmapMut::map_mut(&file)? };

        let mut inner = Inner {
            path: path.to_owned(),
            size,
            first: DATA_OFFSET,
            next: DATA_OFFSET,
            seqno_min: Seqno::NONE,
            seqno_max: Seqno::NONE,
            seqno2ptr: BTreeMap::new(),
            map,
        };

        if recovering {
            inner.recover()?;
        } else {
            info!(path = %path.display(), size, "creating cache file");
            // Touch a byte per page so the file is materialized up front.
            let step = page_size.max(1);
            let mut at = 0;
            while at < size {
                inner.map[at] = 0;
                at += step;
            }
            inner.reset()?;
        }
        inner.write_header(true)?;
        inner.map.flush()?;
        Ok(RingCache {
            inner: Mutex::new(inner),
        })
    }

    /// Append an action under the next sequence number.
    pub fn append(&self, payload: &[u8]) -> Result<Seqno, CacheError> {
        let mut inner = self.inner.lock();
        let seqno = if inner.seqno_max.is_none() {
            Seqno(1)
        } else {
            inner.seqno_max + 1
        };
        inner.put(seqno, payload)?;
        Ok(seqno)
    }

    /// Store an action under an explicit sequence number; must extend the
    /// cached range contiguously.
    pub fn put(&self, seqno: Seqno, payload: &[u8]) -> Result<(), CacheError> {
        self.inner.lock().put(seqno, payload)
    }

    /// Copy out an action. Returns the payload and its flags.
    pub fn get(&self, seqno: Seqno) -> Result<(Vec<u8>, u64), CacheError> {
        self.inner.lock().get(seqno)
    }

    pub fn contains(&self, seqno: Seqno) -> bool {
        self.inner.lock().seqno2ptr.contains_key(&seqno)
    }

    pub fn is_canceled(&self, seqno: Seqno) -> Result<bool, CacheError> {
        Ok(self.get(seqno)?.1 & FLAG_CANCELED != 0)
    }

    /// Allow the record to be reclaimed once it reaches the ring head.
    pub fn release(&self, seqno: Seqno) -> Result<(), CacheError> {
        self.inner.lock().set_flag(seqno, FLAG_RELEASED)
    }

    /// Release everything at or below `seqno`.
    pub fn release_up_to(&self, seqno: Seqno) -> Result<(), CacheError> {
        let mut inner = self.inner.lock();
        let targets: Vec<Seqno> = inner
            .seqno2ptr
            .range(..=seqno)
            .map(|(s, _)| *s)
            .collect();
        for s in targets {
            inner.set_flag(s, FLAG_RELEASED)?;
        }
        Ok(())
    }

    /// Mark an aborted action; donors skip it but the slot is not yet
    /// reclaimable.
    pub fn cancel(&self, seqno: Seqno) -> Result<(), CacheError> {
        self.inner.lock().set_flag(seqno, FLAG_CANCELED)
    }

    pub fn seqno_min(&self) -> Seqno {
        self.inner.lock().seqno_min
    }

    pub fn seqno_max(&self) -> Seqno {
        self.inner.lock().seqno_max
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().path.clone()
    }

    /// Flush, clear the open flag and sync. The mapping drops with self.
    pub fn close(self) -> Result<(), CacheError> {
        let mut inner = self.inner.into_inner();
        inner.write_header(false)?;
        inner.map.flush()?;
        info!(path = %inner.path.display(), "cache closed");
        Ok(())
    }
}

impl std::fmt::Debug for RingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("RingCache")
            .field("path", &inner.path)
            .field("size", &inner.size)
            .field("seqno_min", &inner.seqno_min)
            .field("seqno_max", &inner.seqno_max)
            .field("records", &inner.seqno2ptr.len())
            .finish()
    }
}
