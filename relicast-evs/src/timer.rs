//! Periodic task bookkeeping for the engine.
//!
//! The engine owns one deadline per timer kind; `expired` pops everything
//! due at `now` and the caller dispatches. A timer that missed its deadline
//! fires once, immediately.

use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Timer {
    Inactivity,
    Retrans,
    Install,
    Stats,
    CausalKeepalive,
}

#[derive(Debug, Default)]
pub struct TimerList {
    deadlines: BTreeMap<Timer, Instant>,
}

impl TimerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, timer: Timer, deadline: Instant) {
        self.deadlines.insert(timer, deadline);
    }

    pub fn cancel(&mut self, timer: Timer) {
        self.deadlines.remove(&timer);
    }

    pub fn is_set(&self, timer: Timer) -> bool {
        self.deadlines.contains_key(&timer)
    }

    /// Pop every timer whose deadline is at or before `now`, soonest first.
    pub fn expired(&mut self, now: Instant) -> SmallVec<[Timer; 5]> {
        let mut due: SmallVec<[(Instant, Timer); 5]> = self
            .deadlines
            .iter()
            .filter(|(_, &at)| at <= now)
            .map(|(&t, &at)| (at, t))
            .collect();
        due.sort();
        for (_, t) in &due {
            self.deadlines.remove(t);
        }
        due.into_iter().map(|(_, t)| t).collect()
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn expired_pops_in_deadline_order() {
        let t0 = Instant::now();
        let mut list = TimerList::new();
        list.set(Timer::Retrans, t0 + Duration::from_secs(1));
        list.set(Timer::Inactivity, t0 + Duration::from_millis(500));
        list.set(Timer::Stats, t0 + Duration::from_secs(60));

        let due = list.expired(t0 + Duration::from_secs(2));
        assert_eq!(due.as_slice(), &[Timer::Inactivity, Timer::Retrans]);
        assert_eq!(list.next_deadline(), Some(t0 + Duration::from_secs(60)));
    }
}
