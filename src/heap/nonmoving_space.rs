//! The non-moving space.  Objects here are never relocated; the collector
//! marks them, rewrites their outgoing references during the compaction
//! pause, and sweeps the unmarked ones.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::card_table::CardTable;
use super::mark_bitmap::MarkBitmap;
use crate::util::constants::*;
use crate::util::conversions;
use crate::util::memory::{self, MmapProtection};
use crate::util::{Address, ObjectReference};

pub struct NonMovingSpace {
    name: &'static str,
    begin: Address,
    capacity: usize,
    top: AtomicUsize,
    live_bitmap: MarkBitmap,
    mark_bitmap: MarkBitmap,
    // Objects allocated since the last stack swap; drained at the marking
    // pause and again by the layout planner for post-pause (black)
    // allocations.
    alloc_stack: Mutex<Vec<ObjectReference>>,
    cards: CardTable,
}

impl NonMovingSpace {
    pub fn new(name: &'static str, capacity: usize) -> std::io::Result<Self> {
        debug_assert!(conversions::raw_is_aligned(capacity, BYTES_IN_PAGE));
        let begin = memory::mmap_anywhere(capacity, MmapProtection::ReadWrite, name)?;
        Ok(NonMovingSpace {
            name,
            begin,
            capacity,
            top: AtomicUsize::new(begin.as_usize()),
            live_bitmap: MarkBitmap::new(begin, capacity),
            mark_bitmap: MarkBitmap::new(begin, capacity),
            alloc_stack: Mutex::new(vec![]),
            cards: CardTable::new(begin, capacity),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn begin(&self) -> Address {
        self.begin
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn top(&self) -> Address {
        unsafe { Address::from_usize(self.top.load(Ordering::Acquire)) }
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.begin && addr < self.begin + self.capacity
    }

    pub fn live_bitmap(&self) -> &MarkBitmap {
        &self.live_bitmap
    }

    pub fn mark_bitmap(&self) -> &MarkBitmap {
        &self.mark_bitmap
    }

    pub fn cards(&self) -> &CardTable {
        &self.cards
    }

    /// Bump-allocate `size` bytes. The caller formats the object and then
    /// publishes it with [`NonMovingSpace::publish`].
    pub fn alloc(&self, size: usize) -> Option<Address> {
        debug_assert!(conversions::raw_is_aligned(size, BYTES_IN_GRANULE));
        let mut old = self.top.load(Ordering::Relaxed);
        loop {
            if old + size > self.begin.as_usize() + self.capacity {
                return None;
            }
            match self.top.compare_exchange_weak(
                old,
                old + size,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(unsafe { Address::from_usize(old) }),
                Err(v) => old = v,
            }
        }
    }

    /// Record a freshly formatted object on the allocation stack and in the
    /// live bitmap.
    pub fn publish(&self, object: ObjectReference) {
        self.live_bitmap.set(object.to_address());
        self.alloc_stack.lock().unwrap().push(object);
    }

    /// Swap out the allocation stack, returning everything allocated since
    /// the previous swap.
    pub fn swap_alloc_stack(&self) -> Vec<ObjectReference> {
        std::mem::take(&mut *self.alloc_stack.lock().unwrap())
    }

    /// Sweep: unmarked objects die; the mark bitmap becomes the live bitmap
    /// for the next cycle.
    pub fn sweep(&self) {
        self.live_bitmap.copy_from(&self.mark_bitmap);
    }
}

impl Drop for NonMovingSpace {
    fn drop(&mut self) {
        let _ = memory::munmap(self.begin, self.capacity);
    }
}
