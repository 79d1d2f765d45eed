//! Hazard-pointer reclamation with a fixed number of thread records.
//!
//! Michael. Hazard Pointers: Safe Memory Reclamation for Lock-Free Objects.
//! TPDS 2004. https://doi.org/10.1109/TPDS.2004.8
//!
//! A [`Domain`] owns `max_threads` records. Each record carries a small
//! array of hazard slots and a retire list touched only by the thread the
//! record is assigned to. Assignment of records to threads is the caller's
//! business; the domain only assumes that `retire` and `scan` for a given
//! record index are never called from two threads at once.

use std::cell::UnsafeCell;
use std::collections::HashSet;
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;

/// Hazard slots per thread record.
///
/// A deque pop holds four protections at once (best candidate, its start
/// snapshot, and the pair for the buffer currently being peeked) and a push
/// holds one; six leaves headroom for nested peeks from `is_empty`.
pub const SLOTS_PER_THREAD: usize = 6;

/// Retire-list length that triggers an automatic scan.
const SCAN_THRESHOLD: usize = 64;

struct Retired {
    ptr: *mut u8,
    free: unsafe fn(*mut u8),
}

struct Record {
    hazards: [AtomicPtr<u8>; SLOTS_PER_THREAD],
    claimed: [AtomicBool; SLOTS_PER_THREAD],
    retired: UnsafeCell<Vec<Retired>>,
}

impl Record {
    fn new() -> Self {
        Record {
            hazards: Default::default(),
            claimed: Default::default(),
            retired: UnsafeCell::new(Vec::new()),
        }
    }
}

/// A shared hazard-pointer domain.
pub struct Domain {
    records: Box<[CachePadded<Record>]>,
}

// `retired` is only ever touched through the record's owning thread; the
// hazard and claim arrays are atomics.
unsafe impl Send for Domain {}
unsafe impl Sync for Domain {}

impl Domain {
    pub fn new(max_threads: usize) -> Self {
        assert!(max_threads > 0, "domain needs at least one thread record");
        let records = (0..max_threads)
            .map(|_| CachePadded::new(Record::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Domain { records }
    }

    pub fn max_threads(&self) -> usize {
        self.records.len()
    }

    /// Claims a free hazard slot of record `thread`.
    ///
    /// Panics when all slots of the record are claimed; callers hold a
    /// bounded number of protections, so exhaustion is a bug.
    pub fn hazard(&self, thread: usize) -> HazardPointer<'_> {
        let record = &self.records[thread];
        for (slot, claimed) in record.claimed.iter().enumerate() {
            if claimed
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return HazardPointer {
                    domain: self,
                    thread,
                    slot,
                };
            }
        }
        panic!("all {} hazard slots of record {} claimed", SLOTS_PER_THREAD, thread);
    }

    /// Queues `ptr` for disposal once no hazard slot protects it.
    ///
    /// # Safety
    ///
    /// `ptr` must be unreachable for new readers, `free` must be safe to
    /// call on it exactly once, and no other thread may retire through the
    /// same record concurrently.
    pub unsafe fn retire(&self, thread: usize, ptr: *mut u8, free: unsafe fn(*mut u8)) {
        let retired = &mut *self.records[thread].retired.get();
        retired.push(Retired { ptr, free });
        if retired.len() >= SCAN_THRESHOLD {
            self.scan(thread);
        }
    }

    /// Frees every retiree of record `thread` that no slot protects.
    ///
    /// Returns the number of nodes freed. Safe to call at any time; the
    /// caller only has to be the record's owner.
    pub fn scan(&self, thread: usize) -> usize {
        fence(Ordering::SeqCst);
        let protected = self.protected_set();
        let retired = unsafe { &mut *self.records[thread].retired.get() };
        let before = retired.len();
        let mut kept = Vec::new();
        for r in retired.drain(..) {
            if protected.contains(&r.ptr) {
                kept.push(r);
            } else {
                unsafe { (r.free)(r.ptr) };
            }
        }
        *retired = kept;
        before - retired.len()
    }

    /// Runs a scan over every record. Retire lists are owner-local, so
    /// this is only for quiescent points: drop paths, tests, explicit
    /// housekeeping.
    pub fn reclaim_all(&self) -> usize {
        let mut freed = 0;
        for thread in 0..self.records.len() {
            freed += self.scan(thread);
        }
        freed
    }

    /// Number of retired-but-not-yet-freed nodes across all records.
    pub fn retired_count(&self) -> usize {
        self.records
            .iter()
            .map(|r| unsafe { &*r.retired.get() }.len())
            .sum()
    }

    fn protected_set(&self) -> HashSet<*mut u8> {
        let mut set = HashSet::new();
        for record in self.records.iter() {
            for hazard in &record.hazards {
                let p = hazard.load(Ordering::SeqCst);
                if !p.is_null() {
                    set.insert(p);
                }
            }
        }
        set
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        // No outstanding `HazardPointer` can borrow the domain here.
        for record in self.records.iter() {
            let retired = unsafe { &mut *record.retired.get() };
            for r in retired.drain(..) {
                unsafe { (r.free)(r.ptr) };
            }
        }
    }
}

/// One claimed hazard slot. Cleared and released on drop.
pub struct HazardPointer<'d> {
    domain: &'d Domain,
    thread: usize,
    slot: usize,
}

impl HazardPointer<'_> {
    #[inline]
    fn cell(&self) -> &AtomicPtr<u8> {
        &self.domain.records[self.thread].hazards[self.slot]
    }

    /// Advertises `ptr` without validation. The caller must re-check the
    /// source after a `light_membarrier` before dereferencing.
    #[inline]
    pub fn protect_raw<T>(&mut self, ptr: *mut T) {
        self.cell().store(ptr as *mut u8, Ordering::SeqCst);
    }

    /// Protects the pointer currently in `src`, looping until the
    /// advertisement is consistent with a reload.
    #[inline]
    pub fn protect<T>(&mut self, src: &AtomicPtr<T>) -> *mut T {
        let mut p = src.load(Ordering::Acquire);
        loop {
            self.protect_raw(p);
            light_membarrier();
            let q = src.load(Ordering::Acquire);
            if q == p {
                return p;
            }
            p = q;
        }
    }

    #[inline]
    pub fn reset(&mut self) {
        self.cell().store(ptr::null_mut(), Ordering::SeqCst);
    }
}

impl Drop for HazardPointer<'_> {
    fn drop(&mut self) {
        let record = &self.domain.records[self.thread];
        record.hazards[self.slot].store(ptr::null_mut(), Ordering::SeqCst);
        record.claimed[self.slot].store(false, Ordering::Release);
    }
}

/// Orders hazard advertisements against the retire-side snapshot.
#[inline]
pub fn light_membarrier() {
    fence(Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    unsafe fn free_counted(p: *mut u8) {
        drop(Box::from_raw(p as *mut Counted));
    }

    #[test]
    fn protect_blocks_reclamation() {
        let drops = Arc::new(AtomicUsize::new(0));
        let domain = Domain::new(2);
        let target = Box::into_raw(Box::new(Counted(drops.clone())));
        let src = AtomicPtr::new(target);

        let mut hp = domain.hazard(0);
        let seen = hp.protect(&src);
        assert_eq!(seen, target);

        unsafe { domain.retire(1, target as *mut u8, free_counted) };
        assert_eq!(domain.scan(1), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(domain.retired_count(), 1);

        hp.reset();
        assert_eq!(domain.scan(1), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(domain.retired_count(), 0);
    }

    #[test]
    fn slot_reuse_after_drop() {
        let domain = Domain::new(1);
        for _ in 0..3 * SLOTS_PER_THREAD {
            let mut hp = domain.hazard(0);
            hp.protect_raw(0x10usize as *mut u8);
        }
        let all: Vec<_> = (0..SLOTS_PER_THREAD).map(|_| domain.hazard(0)).collect();
        drop(all);
        let _again = domain.hazard(0);
    }

    #[test]
    fn drop_drains_retired() {
        let drops = Arc::new(AtomicUsize::new(0));
        let domain = Domain::new(1);
        for _ in 0..5 {
            let p = Box::into_raw(Box::new(Counted(drops.clone())));
            unsafe { domain.retire(0, p as *mut u8, free_counted) };
        }
        drop(domain);
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }
}
