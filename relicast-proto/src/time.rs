//! Time provider abstraction.
//!
//! The protocol engines never read a clock themselves; callers pass `now`
//! explicitly. The provider exists for the threaded facade and for code that
//! needs wall-clock timestamps next to monotonic ones.

use std::fmt::Debug;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub trait TimeProvider: Send + Sync + Debug {
    fn now_instant(&self) -> Instant;
    fn now_system_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_instant(&self) -> Instant {
        Instant::now()
    }

    fn now_system_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}
