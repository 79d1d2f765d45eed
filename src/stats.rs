//! Operation counters, maintained with relaxed atomics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

#[derive(Default)]
pub(crate) struct Stats {
    pub push_front: AtomicU64,
    pub push_back: AtomicU64,
    pub pop_front_ok: AtomicU64,
    pub pop_back_ok: AtomicU64,
    pub pop_front_empty: AtomicU64,
    pub pop_back_empty: AtomicU64,
    pub pop_front_contended: AtomicU64,
    pub pop_back_contended: AtomicU64,
    pub delayed_from_insert: AtomicU64,
    pub delayed_from_unlink: AtomicU64,
    pub unlink_refused: AtomicU64,
    pub freed: AtomicU64,
}

impl Stats {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            push_front: self.push_front.load(Relaxed),
            push_back: self.push_back.load(Relaxed),
            pop_front_ok: self.pop_front_ok.load(Relaxed),
            pop_back_ok: self.pop_back_ok.load(Relaxed),
            pop_front_empty: self.pop_front_empty.load(Relaxed),
            pop_back_empty: self.pop_back_empty.load(Relaxed),
            pop_front_contended: self.pop_front_contended.load(Relaxed),
            pop_back_contended: self.pop_back_contended.load(Relaxed),
            delayed_from_insert: self.delayed_from_insert.load(Relaxed),
            delayed_from_unlink: self.delayed_from_unlink.load(Relaxed),
            unlink_refused: self.unlink_refused.load(Relaxed),
            freed: self.freed.load(Relaxed),
        }
    }
}

/// Point-in-time copy of the deque's counters.
///
/// Exact only in quiescence; individual counters are updated independently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub push_front: u64,
    pub push_back: u64,
    pub pop_front_ok: u64,
    pub pop_back_ok: u64,
    pub pop_front_empty: u64,
    pub pop_back_empty: u64,
    pub pop_front_contended: u64,
    pub pop_back_contended: u64,
    pub delayed_from_insert: u64,
    pub delayed_from_unlink: u64,
    pub unlink_refused: u64,
    pub freed: u64,
}

impl StatsSnapshot {
    pub fn pushes(&self) -> u64 {
        self.push_front + self.push_back
    }

    pub fn pops(&self) -> u64 {
        self.pop_front_ok + self.pop_back_ok
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pushes            = {}", self.pushes())?;
        writeln!(f, "successful pops   = {}", self.pops())?;
        writeln!(
            f,
            "empty pops        = {}",
            self.pop_front_empty + self.pop_back_empty
        )?;
        writeln!(
            f,
            "contended pops    = {}",
            self.pop_front_contended + self.pop_back_contended
        )?;
        writeln!(f, "delayed (insert)  = {}", self.delayed_from_insert)?;
        writeln!(f, "delayed (unlink)  = {}", self.delayed_from_unlink)?;
        writeln!(f, "refused unlinks   = {}", self.unlink_refused)?;
        write!(f, "freed nodes       = {}", self.freed)
    }
}
