//! Per-thread local buffer: a doubly-linked list with atomic endpoints,
//! lazy unlinking of taken nodes, and a bounded delayed-free table.
//!
//! The owning thread is the only pusher; any thread may peek and claim.
//! Claimed nodes stay linked until an insert or unlink detaches the stale
//! tail chain as one garbage node, which waits in the table until no guest
//! is traversing the buffer and then goes through the hazard domain.

use std::cell::UnsafeCell;
use std::collections::HashSet;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicPtr, Ordering};

use hazard_rs::{light_membarrier, Domain, HazardPointer};

use crate::clock;
use crate::node::{dispose, BufferNode, End, Item};
use crate::stats::Stats;

/// Slots in the delayed-free table.
pub(crate) const GARBAGE_SLOTS: usize = 20;

/// A detached tail chain awaiting disposal.
struct Garbage<T> {
    timestamp: u64,
    nodes: Vec<*mut BufferNode<T>>,
}

/// The occupant's memory of the previous emptiness probe: last observed
/// endpoint pair per peer buffer, and whether the previous full round was
/// empty.
pub(crate) struct ProbeMemory<T> {
    pub lefts: Vec<*mut BufferNode<T>>,
    pub rights: Vec<*mut BufferNode<T>>,
    pub was_empty: bool,
}

impl<T> ProbeMemory<T> {
    fn new() -> Self {
        ProbeMemory {
            lefts: Vec::new(),
            rights: Vec::new(),
            was_empty: false,
        }
    }

    pub fn ensure(&mut self, buffers: usize) {
        while self.lefts.len() < buffers {
            self.lefts.push(ptr::null_mut());
            self.rights.push(ptr::null_mut());
        }
    }
}

/// Result of a successful peek: the candidate and the endpoint snapshot the
/// walk started from. Both are hazard-protected by the caller.
pub(crate) struct Peeked<T> {
    pub node: *mut BufferNode<T>,
    pub start: *mut BufferNode<T>,
}

pub(crate) struct ThreadBuffer<T> {
    left_most: AtomicPtr<BufferNode<T>>,
    right_most: AtomicPtr<BufferNode<T>>,
    guests: AtomicI32,
    inserting: AtomicBool,
    last_index: AtomicI64,
    garbage: [AtomicPtr<Garbage<T>>; GARBAGE_SLOTS],
    pub occupied: AtomicBool,
    probe: UnsafeCell<ProbeMemory<T>>,
}

// Raw node pointers are shared across threads under the guest counter and
// hazard protections; `probe` is occupant-only.
unsafe impl<T: Send> Send for ThreadBuffer<T> {}
unsafe impl<T: Send> Sync for ThreadBuffer<T> {}

struct Guest<'a>(&'a AtomicI32);

impl<'a> Guest<'a> {
    fn enter(counter: &'a AtomicI32) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Guest(counter)
    }
}

impl Drop for Guest<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T> ThreadBuffer<T> {
    pub fn new(occupied: bool) -> Self {
        let sentinel = BufferNode::sentinel();
        let garbage: [AtomicPtr<Garbage<T>>; GARBAGE_SLOTS] = Default::default();
        ThreadBuffer {
            left_most: AtomicPtr::new(sentinel),
            right_most: AtomicPtr::new(sentinel),
            guests: AtomicI32::new(0),
            inserting: AtomicBool::new(false),
            last_index: AtomicI64::new(1),
            garbage,
            occupied: AtomicBool::new(occupied),
            probe: UnsafeCell::new(ProbeMemory::new()),
        }
    }

    /// The occupant's probe memory.
    ///
    /// # Safety
    ///
    /// Only the thread currently occupying this buffer may call this.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn probe_memory(&self) -> &mut ProbeMemory<T> {
        &mut *self.probe.get()
    }

    #[inline]
    fn endpoint(&self, end: End) -> &AtomicPtr<BufferNode<T>> {
        match end {
            End::Left => &self.left_most,
            End::Right => &self.right_most,
        }
    }

    #[inline]
    pub fn border(&self, end: End) -> *mut BufferNode<T> {
        self.endpoint(end).load(Ordering::SeqCst)
    }

    #[inline]
    fn set_border(&self, node: *mut BufferNode<T>, end: End) {
        self.endpoint(end).store(node, Ordering::SeqCst);
    }

    #[inline]
    fn try_set_border(&self, new: *mut BufferNode<T>, old: *mut BufferNode<T>, end: End) -> bool {
        self.endpoint(end)
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Links a fresh node carrying `item` at `end`.
    ///
    /// The caller must keep `defender` protecting the returned node until
    /// the item is stamped. Skips over taken front-runners that have not
    /// been unlinked yet; if that leaves a stale tail behind the insertion
    /// point, the tail chain is detached here and queued for disposal.
    pub fn insert(
        &self,
        end: End,
        item: *mut Item<T>,
        defender: &mut HazardPointer<'_>,
        domain: &Domain,
        thread: usize,
        stats: &Stats,
    ) -> *mut BufferNode<T> {
        let magnitude = self.last_index.fetch_add(1, Ordering::Relaxed);
        let index = match end {
            End::Left => -magnitude,
            End::Right => magnitude,
        };
        let node = BufferNode::alloc(item, index, false, true);
        defender.protect_raw(node);
        light_membarrier();

        let guest = Guest::enter(&self.guests);
        self.inserting.store(true, Ordering::SeqCst);

        let mut place = self.border(end);
        let mut next = unsafe { (*place).neighbor(end.opposite()) };
        while next != place && unsafe { (*place).taken.load(Ordering::SeqCst) } {
            place = next;
            next = unsafe { (*place).neighbor(end.opposite()) };
        }

        let tail = unsafe { (*place).neighbor(end) };

        if unsafe { (*place).neighbor(end.opposite()) } == place {
            self.set_border(place, end.opposite());
        }

        unsafe {
            (*node).set_neighbor(place, end.opposite());
            (*place).set_neighbor(node, end);
        }
        self.set_border(node, end);
        unsafe { (*node).to_insert.store(false, Ordering::Release) };

        self.inserting.store(false, Ordering::SeqCst);

        if tail != place {
            unsafe { (*tail).set_deleted_from(end) };
            if self.chain_clear_for_unlink(tail, end) {
                let garbage = self.collect_garbage(tail);
                Stats::bump(&stats.delayed_from_insert);
                drop(guest);
                self.install_garbage(garbage, domain, thread, stats);
            } else {
                Stats::bump(&stats.unlink_refused);
            }
        }
        node
    }

    /// Finds the outermost unclaimed node from `end`, protecting both the
    /// candidate and the start snapshot under the given hazard slots.
    ///
    /// Panics if the walk revisits a node: the adjacency invariant is
    /// broken and the structure cannot be trusted.
    pub fn peek(
        &self,
        end: End,
        found: &mut HazardPointer<'_>,
        start: &mut HazardPointer<'_>,
    ) -> Option<Peeked<T>> {
        let _guest = Guest::enter(&self.guests);

        let start_node = start.protect(self.endpoint(end));
        let old_end = self.border(end.opposite());

        let mut res = start_node;
        let mut visited = HashSet::new();
        visited.insert(res);

        loop {
            let node = unsafe { &*res };
            let crossed = match end {
                End::Left => node.index > unsafe { (*old_end).index },
                End::Right => node.index < unsafe { (*old_end).index },
            };
            if crossed {
                return None;
            }
            if !node.taken.load(Ordering::SeqCst) {
                found.protect_raw(res);
                light_membarrier();
                return Some(Peeked {
                    node: res,
                    start: start_node,
                });
            }
            let next = node.neighbor(end.opposite());
            if next == res {
                return None;
            }
            res = next;
            if !visited.insert(res) {
                panic!(
                    "cycle in buffer chain after visiting {} nodes",
                    visited.len()
                );
            }
        }
    }

    /// Claims `peeked.node` for a pop at `end`.
    ///
    /// On success the claimed node becomes the new endpoint and, when the
    /// stars align (no concurrent insert, stable borders, fully taken
    /// chain), the stale tail beyond the old start is detached and queued.
    /// `false` means the claim CAS was lost.
    pub fn try_unlink(
        &self,
        peeked: &Peeked<T>,
        end: End,
        domain: &Domain,
        thread: usize,
        stats: &Stats,
    ) -> bool {
        let guest = Guest::enter(&self.guests);

        let node = peeked.node;
        let start = peeked.start;
        let old_tail = unsafe { (*start).neighbor(end) };
        let opposite_border = self.border(end.opposite());

        let claimed = unsafe {
            (*node)
                .taken
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        };
        if !claimed {
            return false;
        }

        if self.try_set_border(node, start, end)
            && old_tail != node
            && !self.inserting.load(Ordering::SeqCst)
            && self.border(end) == node
            && self.border(end.opposite()) == opposite_border
            && self.chain_clear_for_unlink(old_tail, end)
            && unsafe { (*start).try_set_neighbor(start, old_tail, end) }
        {
            unsafe { (*old_tail).set_deleted_from(end) };
            let garbage = self.collect_garbage(old_tail);
            Stats::bump(&stats.delayed_from_unlink);
            drop(guest);
            self.install_garbage(garbage, domain, thread, stats);
            return true;
        }

        drop(guest);
        self.try_clean(domain, thread, false, stats);
        true
    }

    /// The gate on detachment: every node from `head` toward `end` must be
    /// taken, free of insert reservations, and not run into the live
    /// border. Refusing here leaves the chain for a later detachment.
    fn chain_clear_for_unlink(&self, head: *mut BufferNode<T>, end: End) -> bool {
        let _guest = Guest::enter(&self.guests);
        let mut cur = head;
        loop {
            let node = unsafe { &*cur };
            let next = node.neighbor(end);
            if node.taken.load(Ordering::SeqCst)
                && !node.to_insert.load(Ordering::SeqCst)
                && next != self.border(end)
            {
                cur = next;
            } else {
                return false;
            }
            if unsafe { (*cur).neighbor(end) } == cur {
                return true;
            }
        }
    }

    /// Walks the detached chain, reserving each node exactly once.
    fn collect_garbage(&self, head: *mut BufferNode<T>) -> Box<Garbage<T>> {
        let toward = unsafe { (*head).deleted_from() };
        let mut nodes = Vec::new();
        let mut cur = head;
        loop {
            let node = unsafe { &*cur };
            if node.reserve_delayed() {
                nodes.push(cur);
            }
            let next = node.neighbor(toward);
            if next == cur {
                break;
            }
            cur = next;
        }
        Box::new(Garbage {
            timestamp: clock::now(),
            nodes,
        })
    }

    /// Installs a garbage node into the delayed-free table, cleaning
    /// expired slots until one frees up if the table is full.
    fn install_garbage(
        &self,
        garbage: Box<Garbage<T>>,
        domain: &Domain,
        thread: usize,
        stats: &Stats,
    ) {
        let raw = Box::into_raw(garbage);
        loop {
            let mut place = self.free_slot();
            while place.is_none() {
                while !self.try_clean(domain, thread, true, stats) {}
                place = self.free_slot();
            }
            if self.garbage[place.unwrap()]
                .compare_exchange(ptr::null_mut(), raw, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    fn free_slot(&self) -> Option<usize> {
        self.garbage
            .iter()
            .position(|slot| slot.load(Ordering::SeqCst).is_null())
    }

    /// Disposes expired garbage slots through the hazard domain, provided
    /// no guest is traversing the buffer.
    ///
    /// Returns `true` when progress was made or nothing was eligible, so
    /// full-table callers can spin on `false`.
    pub fn try_clean(&self, domain: &Domain, thread: usize, single: bool, stats: &Stats) -> bool {
        let now = clock::now();
        let mut cleaned = false;
        if self.guests.load(Ordering::SeqCst) == 0 {
            let mut candidate_seen = false;
            for slot in &self.garbage {
                let g = slot.load(Ordering::SeqCst);
                if g.is_null() {
                    continue;
                }
                if unsafe { (*g).timestamp } < now {
                    candidate_seen = true;
                    if slot
                        .compare_exchange(g, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        let garbage = unsafe { Box::from_raw(g) };
                        for &node in &garbage.nodes {
                            unsafe { domain.retire(thread, node as *mut u8, dispose::<T>) };
                            Stats::bump(&stats.freed);
                        }
                        cleaned = true;
                        if single {
                            return true;
                        }
                    }
                }
            }
            if !candidate_seen {
                return true;
            }
        }
        cleaned
    }

    /// Live nodes reachable from the right border, sentinel included.
    #[cfg(test)]
    pub fn live_nodes(&self) -> usize {
        let mut count = 1;
        let mut cur = self.border(End::Right);
        loop {
            let next = unsafe { (*cur).neighbor(End::Left) };
            if next == cur {
                return count;
            }
            count += 1;
            cur = next;
        }
    }
}

impl<T> Drop for ThreadBuffer<T> {
    fn drop(&mut self) {
        unsafe {
            // Pending garbage chains are disjoint from the live chain.
            for slot in &self.garbage {
                let g = slot.load(Ordering::Relaxed);
                if !g.is_null() {
                    let garbage = Box::from_raw(g);
                    for &node in &garbage.nodes {
                        dispose::<T>(node as *mut u8);
                    }
                }
            }
            let mut cur = self.right_most.load(Ordering::Relaxed);
            loop {
                let next = (*cur).neighbor(End::Left);
                dispose::<T>(cur as *mut u8);
                if next == cur {
                    break;
                }
                cur = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(v: u32) -> *mut Item<u32> {
        Box::into_raw(Box::new(Item::new(v)))
    }

    fn push(
        buf: &ThreadBuffer<u32>,
        domain: &Domain,
        stats: &Stats,
        end: End,
        v: u32,
    ) -> *mut BufferNode<u32> {
        let it = item(v);
        let mut defender = domain.hazard(0);
        let node = buf.insert(end, it, &mut defender, domain, 0, stats);
        unsafe { (*it).stamp(clock::now()) };
        node
    }

    fn pop(buf: &ThreadBuffer<u32>, domain: &Domain, stats: &Stats, end: End) -> Option<u32> {
        let mut found = domain.hazard(0);
        let mut start = domain.hazard(0);
        let peeked = buf.peek(end, &mut found, &mut start)?;
        if buf.try_unlink(&peeked, end, domain, 0, stats) {
            Some(unsafe { Item::take((*peeked.node).item) })
        } else {
            None
        }
    }

    #[test]
    fn fresh_buffer_has_no_candidate() {
        let domain = Domain::new(1);
        let buf: ThreadBuffer<u32> = ThreadBuffer::new(true);
        let mut found = domain.hazard(0);
        let mut start = domain.hazard(0);
        assert!(buf.peek(End::Left, &mut found, &mut start).is_none());
        assert!(buf.peek(End::Right, &mut found, &mut start).is_none());
        assert_eq!(buf.live_nodes(), 1);
    }

    #[test]
    fn insert_then_peek_both_ends() {
        let domain = Domain::new(1);
        let stats = Stats::default();
        let buf: ThreadBuffer<u32> = ThreadBuffer::new(true);
        let node = push(&buf, &domain, &stats, End::Right, 42);

        let mut found = domain.hazard(0);
        let mut start = domain.hazard(0);
        let from_right = buf.peek(End::Right, &mut found, &mut start).unwrap();
        assert_eq!(from_right.node, node);
        let from_left = buf.peek(End::Left, &mut found, &mut start).unwrap();
        assert_eq!(from_left.node, node);
    }

    #[test]
    fn unlink_claims_once() {
        let domain = Domain::new(1);
        let stats = Stats::default();
        let buf: ThreadBuffer<u32> = ThreadBuffer::new(true);
        push(&buf, &domain, &stats, End::Left, 7);

        assert_eq!(pop(&buf, &domain, &stats, End::Left), Some(7));
        assert_eq!(pop(&buf, &domain, &stats, End::Left), None);
        assert_eq!(pop(&buf, &domain, &stats, End::Right), None);
    }

    #[test]
    fn interleaved_ends_drain_in_order() {
        let domain = Domain::new(1);
        let stats = Stats::default();
        let buf: ThreadBuffer<u32> = ThreadBuffer::new(true);
        for v in 1..=4 {
            push(&buf, &domain, &stats, End::Right, v);
        }
        assert_eq!(pop(&buf, &domain, &stats, End::Left), Some(1));
        assert_eq!(pop(&buf, &domain, &stats, End::Right), Some(4));
        assert_eq!(pop(&buf, &domain, &stats, End::Left), Some(2));
        assert_eq!(pop(&buf, &domain, &stats, End::Right), Some(3));
        assert_eq!(pop(&buf, &domain, &stats, End::Left), None);
    }

    #[test]
    fn drained_buffer_reclaims_to_sentinel() {
        let domain = Domain::new(1);
        let stats = Stats::default();
        let buf: ThreadBuffer<u32> = ThreadBuffer::new(true);
        for v in 0..200 {
            push(&buf, &domain, &stats, End::Right, v);
        }
        for _ in 0..200 {
            assert!(pop(&buf, &domain, &stats, End::Left).is_some());
        }
        while !buf.try_clean(&domain, 0, false, &stats) {}
        domain.reclaim_all();
        // Everything but the current endpoint chain remainder is gone.
        assert!(buf.live_nodes() <= 2);
        assert_eq!(domain.retired_count(), 0);
    }
}
