//! Grow-only registry of local buffers plus the thread-to-buffer binding.
//!
//! The spine is a lock-free linked list that only ever grows, up to the
//! hazard domain's thread capacity. A thread binds to an unoccupied slot
//! (or appends a fresh one) on its first operation, memoizes the binding in
//! thread-local storage, and a TLS destructor clears the occupancy at
//! thread exit so a later thread can take the slot over.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::buffer::ThreadBuffer;
use crate::error::Error;

pub(crate) struct Slot<T> {
    pub buffer: ThreadBuffer<T>,
    pub index: usize,
    next: AtomicPtr<Slot<T>>,
}

impl<T> std::fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot").field("index", &self.index).finish()
    }
}

pub(crate) struct Registry<T> {
    head: AtomicPtr<Slot<T>>,
    count: AtomicUsize,
    capacity: usize,
}

unsafe impl<T: Send> Send for Registry<T> {}
unsafe impl<T: Send> Sync for Registry<T> {}

impl<T> Registry<T> {
    pub fn new(capacity: usize) -> Self {
        Registry {
            head: AtomicPtr::new(ptr::null_mut()),
            count: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            cur: self.head.load(Ordering::Acquire),
            _marker: PhantomData,
        }
    }

    /// Claims an unoccupied slot, growing the spine when none is free.
    pub fn acquire(&self) -> Result<&Slot<T>, Error> {
        for slot in self.iter() {
            if slot
                .buffer
                .occupied
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // Stale probe memory from the previous occupant must not
                // feed the two-probe emptiness test.
                let probe = unsafe { slot.buffer.probe_memory() };
                probe.lefts.clear();
                probe.rights.clear();
                probe.was_empty = false;
                return Ok(slot);
            }
        }

        loop {
            let n = self.count.load(Ordering::Acquire);
            if n >= self.capacity {
                return Err(Error::ThreadSlotsExhausted);
            }
            if self
                .count
                .compare_exchange(n, n + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            let slot = Box::into_raw(Box::new(Slot {
                buffer: ThreadBuffer::new(true),
                index: n,
                next: AtomicPtr::new(ptr::null_mut()),
            }));
            loop {
                let head = self.head.load(Ordering::Acquire);
                unsafe { (*slot).next.store(head, Ordering::Relaxed) };
                if self
                    .head
                    .compare_exchange(head, slot, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    return Ok(unsafe { &*slot });
                }
            }
        }
    }

    pub fn release(&self, index: usize) {
        for slot in self.iter() {
            if slot.index == index {
                slot.buffer.occupied.store(false, Ordering::Release);
                return;
            }
        }
    }
}

impl<T> Drop for Registry<T> {
    fn drop(&mut self) {
        let mut cur = self.head.load(Ordering::Relaxed);
        while !cur.is_null() {
            let slot = unsafe { Box::from_raw(cur) };
            cur = slot.next.load(Ordering::Relaxed);
        }
    }
}

pub(crate) struct Iter<'a, T> {
    cur: *mut Slot<T>,
    _marker: PhantomData<&'a Registry<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a Slot<T>;

    fn next(&mut self) -> Option<&'a Slot<T>> {
        if self.cur.is_null() {
            return None;
        }
        let slot = unsafe { &*self.cur };
        self.cur = slot.next.load(Ordering::Acquire);
        Some(slot)
    }
}

/// Releases a thread's registry slot when the thread goes away.
pub(crate) trait SlotRelease: Send + Sync {
    fn release_slot(&self, index: usize);
}

struct Binding {
    deque_id: usize,
    slot_index: usize,
    slot_ptr: usize,
    owner: Weak<dyn SlotRelease>,
}

struct Bindings(Vec<Binding>);

impl Drop for Bindings {
    fn drop(&mut self) {
        for binding in self.0.drain(..) {
            if let Some(owner) = binding.owner.upgrade() {
                owner.release_slot(binding.slot_index);
            }
        }
    }
}

thread_local! {
    static BINDINGS: RefCell<Bindings> = RefCell::new(Bindings(Vec::new()));
}

/// Looks up or establishes this thread's slot for the given deque.
///
/// Returns the raw slot pointer; the caller keeps the owner alive, so the
/// pointer stays valid for the duration of the borrow it is cast back to.
pub(crate) fn bind<T: Send + 'static, O: SlotRelease + 'static>(
    deque_id: usize,
    registry: &Registry<T>,
    owner: &Arc<O>,
) -> Result<usize, Error> {
    BINDINGS.with(|bindings| {
        let mut bindings = bindings.borrow_mut();
        if let Some(b) = bindings.0.iter().find(|b| b.deque_id == deque_id) {
            return Ok(b.slot_ptr);
        }
        let slot = registry.acquire()?;
        let slot_ptr = slot as *const Slot<T> as usize;
        bindings.0.push(Binding {
            deque_id,
            slot_index: slot.index,
            slot_ptr,
            owner: Arc::downgrade(&(owner.clone() as Arc<dyn SlotRelease>)),
        });
        Ok(slot_ptr)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_until_capacity() {
        let reg: Registry<u32> = Registry::new(2);
        let a = reg.acquire().unwrap();
        let b = reg.acquire().unwrap();
        assert_ne!(a.index, b.index);
        assert_eq!(reg.acquire().unwrap_err(), Error::ThreadSlotsExhausted);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn released_slot_is_reused() {
        let reg: Registry<u32> = Registry::new(1);
        let a = reg.acquire().unwrap();
        let index = a.index;
        reg.release(index);
        let again = reg.acquire().unwrap();
        assert_eq!(again.index, index);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn iter_sees_every_slot() {
        let reg: Registry<u32> = Registry::new(3);
        for _ in 0..3 {
            reg.acquire().unwrap();
        }
        let mut indices: Vec<_> = reg.iter().map(|s| s.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
