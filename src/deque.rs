//! Deque coordinator: routes pushes to the caller's buffer, scans every
//! buffer for the best pop candidate, and runs the emptiness protocol.
//!
//! Dodds, Haas, and Kirsch. A Scalable, Correct Time-Stamped Stack.
//! POPL 2015. https://doi.org/10.1145/2676726.2676963
//!
//! Pops at opposite ends are not totally ordered; their relative order is
//! defined by per-item timestamps taken near insertion, with a bias toward
//! candidates pushed at the end being popped.

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::buffer::Peeked;
use crate::clock;
use crate::error::Error;
use crate::node::{prefer, End, Item};
use crate::registry::{self, Registry, Slot, SlotRelease};
use crate::stats::{Stats, StatsSnapshot};

use hazard_rs::Domain;

const DEFAULT_MAX_THREADS: usize = 64;

static NEXT_DEQUE_ID: AtomicUsize = AtomicUsize::new(0);

enum Removal<T> {
    Done(T),
    Empty,
    Contended,
}

struct Inner<T> {
    registry: Registry<T>,
    domain: Domain,
    items: AtomicUsize,
    stats: Stats,
    id: usize,
}

impl<T: Send + 'static> SlotRelease for Inner<T> {
    fn release_slot(&self, index: usize) {
        self.registry.release(index);
    }
}

/// A lock-free timestamped deque.
///
/// Cloning yields another handle to the same deque. Every operation binds
/// the calling thread to a per-thread buffer on first use; the binding is
/// released at thread exit and the buffer reused by later threads.
pub struct Deque<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Deque<T> {
    fn clone(&self) -> Self {
        Deque {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Default for Deque<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Deque<T> {
    pub fn new() -> Self {
        Self::with_max_threads(DEFAULT_MAX_THREADS)
    }

    /// A deque whose hazard domain and registry accommodate at most
    /// `max_threads` concurrently bound threads.
    pub fn with_max_threads(max_threads: usize) -> Self {
        Deque {
            inner: Arc::new(Inner {
                registry: Registry::new(max_threads),
                domain: Domain::new(max_threads),
                items: AtomicUsize::new(0),
                stats: Stats::default(),
                id: NEXT_DEQUE_ID.fetch_add(1, Ordering::Relaxed),
            }),
        }
    }

    fn slot(&self) -> Result<&Slot<T>, Error> {
        let ptr = registry::bind(self.inner.id, &self.inner.registry, &self.inner)?;
        Ok(unsafe { &*(ptr as *const Slot<T>) })
    }

    pub fn push_front(&self, value: T) -> Result<(), Error> {
        self.push(value, End::Left)
    }

    pub fn push_back(&self, value: T) -> Result<(), Error> {
        self.push(value, End::Right)
    }

    /// Pops from the front. `Ok(None)` means the deque was observed
    /// durably empty.
    pub fn pop_front(&self) -> Result<Option<T>, Error> {
        self.pop(End::Left)
    }

    pub fn pop_back(&self) -> Result<Option<T>, Error> {
        self.pop(End::Right)
    }

    fn push(&self, value: T, end: End) -> Result<(), Error> {
        let slot = self.slot()?;
        let inner = &*self.inner;
        let item = Box::into_raw(Box::new(Item::new(value)));
        inner.items.fetch_add(1, Ordering::SeqCst);

        let mut defender = inner.domain.hazard(slot.index);
        slot.buffer
            .insert(end, item, &mut defender, &inner.domain, slot.index, &inner.stats);
        unsafe { (*item).stamp(clock::now()) };

        Stats::bump(match end {
            End::Left => &inner.stats.push_front,
            End::Right => &inner.stats.push_back,
        });
        Ok(())
    }

    fn pop(&self, end: End) -> Result<Option<T>, Error> {
        let slot = self.slot()?;
        let inner = &*self.inner;
        loop {
            match self.try_remove(end, slot) {
                Removal::Done(value) => {
                    inner.items.fetch_sub(1, Ordering::SeqCst);
                    Stats::bump(match end {
                        End::Left => &inner.stats.pop_front_ok,
                        End::Right => &inner.stats.pop_back_ok,
                    });
                    return Ok(Some(value));
                }
                Removal::Empty => {
                    Stats::bump(match end {
                        End::Left => &inner.stats.pop_front_empty,
                        End::Right => &inner.stats.pop_back_empty,
                    });
                    return Ok(None);
                }
                Removal::Contended => {
                    Stats::bump(match end {
                        End::Left => &inner.stats.pop_front_contended,
                        End::Right => &inner.stats.pop_back_contended,
                    });
                }
            }
        }
    }

    /// One scan over every buffer: pick the best candidate under the
    /// ordering predicate, then attempt to claim it.
    fn try_remove(&self, end: End, slot: &Slot<T>) -> Removal<T> {
        let inner = &*self.inner;
        let domain = &inner.domain;
        let thread = slot.index;
        let t0 = clock::now();

        let mut best_h = domain.hazard(thread);
        let mut best_start_h = domain.hazard(thread);
        let mut cand_h = domain.hazard(thread);
        let mut cand_start_h = domain.hazard(thread);

        let buffers: Vec<&Slot<T>> = inner.registry.iter().collect();
        let n = buffers.len();

        let probe = unsafe { slot.buffer.probe_memory() };
        probe.ensure(domain.max_threads());

        let mut best: Option<(Peeked<T>, &Slot<T>)> = None;
        let mut round_empty = true;

        if n > 0 {
            let from = rand::thread_rng().gen_range(0..n);
            for k in 0..n {
                let s = buffers[(from + k) % n];
                let peeked = s.buffer.peek(end, &mut cand_h, &mut cand_start_h);

                let left = s.buffer.border(End::Left);
                let right = s.buffer.border(End::Right);
                let unchanged =
                    probe.lefts[s.index] == left && probe.rights[s.index] == right;
                round_empty &= left == right || (unchanged && peeked.is_none());
                probe.lefts[s.index] = left;
                probe.rights[s.index] = right;

                if let Some(p) = peeked {
                    let adopt = match &best {
                        None => true,
                        Some((current, _)) => prefer(p.node, current.node, end),
                    };
                    if adopt {
                        // An unstamped candidate is younger than anything
                        // stamped; nothing can beat it.
                        let unstamped = unsafe { (*(*p.node).item).timestamp() } == 0;
                        best = Some((p, s));
                        mem::swap(&mut best_h, &mut cand_h);
                        mem::swap(&mut best_start_h, &mut cand_start_h);
                        if unstamped {
                            break;
                        }
                    }
                }
            }
        }

        let durably_empty = best.is_none() && round_empty && probe.was_empty;
        probe.was_empty = best.is_none() && round_empty;

        match best {
            None if durably_empty => Removal::Empty,
            None => Removal::Contended,
            Some((peeked, owner)) => {
                let node = unsafe { &*peeked.node };
                let stamp = unsafe { (*node.item).timestamp() };
                // Never pop an opposite-end push stamped after this scan
                // began.
                let eligible = node.was_added(end) || stamp <= t0;
                if eligible
                    && owner
                        .buffer
                        .try_unlink(&peeked, end, domain, thread, &inner.stats)
                {
                    // The claim won exclusive ownership of the value; the
                    // hazard slots still protect the node itself.
                    Removal::Done(unsafe { Item::take(node.item) })
                } else {
                    Removal::Contended
                }
            }
        }
    }

    /// Best-effort emptiness: the item counter short-circuits, otherwise
    /// two consecutive probe rounds over all buffers must agree.
    ///
    /// May return `false` while a racing pop is about to take the last
    /// item; never returns `true` while an item is durably present.
    pub fn is_empty(&self) -> bool {
        if self.inner.items.load(Ordering::SeqCst) == 0 {
            return true;
        }
        match self.slot() {
            Err(_) => false,
            Ok(slot) => self.probe_round(slot) && self.probe_round(slot),
        }
    }

    fn probe_round(&self, slot: &Slot<T>) -> bool {
        let inner = &*self.inner;
        let domain = &inner.domain;
        let mut found_h = domain.hazard(slot.index);
        let mut start_h = domain.hazard(slot.index);

        let probe = unsafe { slot.buffer.probe_memory() };
        probe.ensure(domain.max_threads());

        let mut round_empty = true;
        for s in inner.registry.iter() {
            let candidate = s
                .buffer
                .peek(End::Left, &mut found_h, &mut start_h)
                .is_some()
                || s.buffer
                    .peek(End::Right, &mut found_h, &mut start_h)
                    .is_some();
            let left = s.buffer.border(End::Left);
            let right = s.buffer.border(End::Right);
            let unchanged = probe.lefts[s.index] == left && probe.rights[s.index] == right;
            round_empty &= left == right || (unchanged && !candidate);
            probe.lefts[s.index] = left;
            probe.rights[s.index] = right;
        }
        round_empty
    }

    /// Approximate number of items; exact only in quiescence.
    pub fn len(&self) -> usize {
        self.inner.items.load(Ordering::SeqCst)
    }

    /// Pops from the back until the deque reports empty.
    pub fn clear(&self) {
        while let Ok(Some(_)) = self.pop_back() {}
    }

    /// Quiescent-point housekeeping: flushes every buffer's delayed-free
    /// table and reclaims everything the hazard domain allows.
    pub fn reclaim(&self) {
        if let Ok(slot) = self.slot() {
            let inner = &*self.inner;
            for s in inner.registry.iter() {
                while !s
                    .buffer
                    .try_clean(&inner.domain, slot.index, false, &inner.stats)
                {}
            }
            inner.domain.reclaim_all();
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_utils::thread::scope;
    use rand::Rng;
    use std::collections::HashSet;

    #[test]
    fn pop_from_never_used_deque() {
        let d: Deque<u64> = Deque::new();
        assert_eq!(d.pop_front().unwrap(), None);
        assert_eq!(d.pop_back().unwrap(), None);
        assert!(d.is_empty());
    }

    #[test]
    fn single_push_pops_from_opposite_side() {
        let d: Deque<u64> = Deque::new();
        d.push_back(9).unwrap();
        assert_eq!(d.pop_front().unwrap(), Some(9));
        assert_eq!(d.pop_front().unwrap(), None);

        d.push_front(11).unwrap();
        assert_eq!(d.pop_back().unwrap(), Some(11));
        assert_eq!(d.pop_back().unwrap(), None);
    }

    #[test]
    fn front_back_interleaving() {
        let d: Deque<u64> = Deque::new();
        d.push_back(1).unwrap();
        d.push_back(2).unwrap();
        d.push_back(3).unwrap();
        assert_eq!(d.pop_front().unwrap(), Some(1));
        assert_eq!(d.pop_back().unwrap(), Some(3));
        assert_eq!(d.pop_front().unwrap(), Some(2));
        assert_eq!(d.len(), 0);
        assert!(d.is_empty());
    }

    #[test]
    fn fifo_through_opposite_end() {
        let d: Deque<&str> = Deque::new();
        d.push_back("a").unwrap();
        d.push_back("b").unwrap();
        assert_eq!(d.pop_front().unwrap(), Some("a"));
        assert_eq!(d.pop_front().unwrap(), Some("b"));
    }

    #[test]
    fn lifo_at_same_end() {
        let d: Deque<&str> = Deque::new();
        d.push_back("a").unwrap();
        d.push_back("b").unwrap();
        assert_eq!(d.pop_back().unwrap(), Some("b"));
        assert_eq!(d.pop_back().unwrap(), Some("a"));
    }

    #[test]
    fn mixed_ends() {
        let d: Deque<u64> = Deque::new();
        d.push_front(1).unwrap();
        d.push_back(2).unwrap();
        assert_eq!(d.pop_front().unwrap(), Some(1));
        assert_eq!(d.pop_back().unwrap(), Some(2));
    }

    #[test]
    fn empty_is_idempotent_in_quiescence() {
        let d: Deque<u64> = Deque::new();
        assert_eq!(d.is_empty(), d.is_empty());
        d.push_back(1).unwrap();
        assert!(!d.is_empty());
        assert_eq!(d.is_empty(), d.is_empty());
        d.pop_front().unwrap();
        assert!(d.is_empty());
        assert_eq!(d.is_empty(), d.is_empty());
    }

    #[test]
    fn clear_drains_everything() {
        let d: Deque<u64> = Deque::new();
        for i in 0..100 {
            d.push_front(i).unwrap();
        }
        d.clear();
        assert!(d.is_empty());
        assert_eq!(d.len(), 0);
    }

    #[test]
    fn two_producers_one_drain() {
        let d: Deque<u64> = Deque::new();
        scope(|s| {
            let odd = d.clone();
            s.spawn(move |_| {
                for i in (1..=999).step_by(2) {
                    odd.push_back(i).unwrap();
                }
            });
            let even = d.clone();
            s.spawn(move |_| {
                for i in (2..=1000).step_by(2) {
                    even.push_back(i).unwrap();
                }
            });
        })
        .unwrap();

        let mut drained = Vec::new();
        while let Some(v) = d.pop_front().unwrap() {
            drained.push(v);
        }
        assert_eq!(drained.len(), 1000);
        drained.sort_unstable();
        assert_eq!(drained, (1..=1000).collect::<Vec<u64>>());
    }

    #[test]
    fn producer_order_survives_opposite_end_drain() {
        const N: u64 = 50_000;
        let d: Deque<u64> = Deque::new();
        scope(|s| {
            let producer = d.clone();
            s.spawn(move |_| {
                for i in 0..N {
                    producer.push_front(i).unwrap();
                }
            });

            let consumer = d.clone();
            s.spawn(move |_| {
                let mut seen = Vec::with_capacity(N as usize);
                while (seen.len() as u64) < N {
                    if let Some(v) = consumer.pop_back().unwrap() {
                        seen.push(v);
                    }
                }
                for pair in seen.windows(2) {
                    assert!(pair[0] < pair[1], "{} popped after {}", pair[1], pair[0]);
                }
            });
        })
        .unwrap();
        assert!(d.is_empty());
    }

    #[test]
    fn random_mpmc_conserves_items() {
        const THREADS: u64 = 4;
        const OPS: u64 = 10_000;
        let d: Deque<u64> = Deque::new();
        let mut all_pushed: Vec<u64> = Vec::new();
        let mut all_popped: Vec<u64> = Vec::new();

        scope(|s| {
            let mut handles = Vec::new();
            for tid in 0..THREADS {
                let d = d.clone();
                handles.push(s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    let mut pushed = Vec::new();
                    let mut popped = Vec::new();
                    let mut n = 0u64;
                    for _ in 0..OPS {
                        if rng.gen_bool(0.5) {
                            let v = (tid << 32) | n;
                            n += 1;
                            d.push_back(v).unwrap();
                            pushed.push(v);
                        } else if let Some(v) = d.pop_back().unwrap() {
                            popped.push(v);
                        }
                    }
                    (pushed, popped)
                }));
            }
            for h in handles {
                let (pushed, popped) = h.join().unwrap();
                all_pushed.extend(pushed);
                all_popped.extend(popped);
            }
        })
        .unwrap();

        while let Some(v) = d.pop_front().unwrap() {
            all_popped.push(v);
        }

        all_pushed.sort_unstable();
        all_popped.sort_unstable();
        assert_eq!(all_pushed, all_popped);
        assert_eq!(all_popped.iter().collect::<HashSet<_>>().len(), all_popped.len());
        assert_eq!(d.len(), 0);

        let stats = d.stats();
        assert_eq!(stats.pushes(), all_pushed.len() as u64);
        assert_eq!(stats.pops(), all_popped.len() as u64);
    }

    #[test]
    fn reclamation_leaves_skeleton_buffers() {
        const N: u64 = 20_000;
        let d: Deque<u64> = Deque::new();
        for i in 0..N {
            d.push_back(i).unwrap();
        }
        for _ in 0..N {
            assert!(d.pop_front().unwrap().is_some());
        }
        d.reclaim();

        assert_eq!(d.inner.domain.retired_count(), 0);
        for slot in d.inner.registry.iter() {
            assert!(slot.buffer.live_nodes() <= 2);
        }
        assert_eq!(d.len(), 0);
    }

    #[test]
    fn emptiness_converges_after_churn() {
        const ROUNDS: u64 = 20_000;
        let d: Deque<u64> = Deque::new();
        scope(|s| {
            for _ in 0..2 {
                let d = d.clone();
                s.spawn(move |_| {
                    for _ in 0..ROUNDS {
                        d.push_back(1).unwrap();
                        while d.pop_front().unwrap().is_none() {}
                    }
                });
            }
            let watcher = d.clone();
            s.spawn(move |_| {
                for _ in 0..1000 {
                    let _ = watcher.is_empty();
                }
            });
        })
        .unwrap();
        assert!(d.is_empty());
        assert_eq!(d.len(), 0);
    }

    #[test]
    fn thread_slots_exhaust_cleanly() {
        let d: Deque<u64> = Deque::with_max_threads(1);
        d.push_back(5).unwrap();
        scope(|s| {
            let d = d.clone();
            s.spawn(move |_| {
                assert_eq!(d.push_back(6).unwrap_err(), Error::ThreadSlotsExhausted);
                assert_eq!(d.pop_front().unwrap_err(), Error::ThreadSlotsExhausted);
            });
        })
        .unwrap();
        assert_eq!(d.pop_front().unwrap(), Some(5));
    }

    #[test]
    fn slot_reuse_after_thread_exit() {
        // A single slot serves any number of threads as long as their
        // lifetimes do not overlap.
        let d: Deque<u64> = Deque::with_max_threads(1);
        let d1 = d.clone();
        std::thread::spawn(move || d1.push_back(1).unwrap())
            .join()
            .unwrap();
        let d2 = d.clone();
        std::thread::spawn(move || assert_eq!(d2.pop_front().unwrap(), Some(1)))
            .join()
            .unwrap();
    }
}
