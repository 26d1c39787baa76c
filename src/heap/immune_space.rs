//! Immune spaces (image, zygote).  Objects here are not collected this
//! cycle; the collector only traces through them and rewrites their outgoing
//! references.  A persistent mod-union table accumulates every card that has
//! ever been dirty, so the reference-update pause knows which immune objects
//! may point into the collected spaces.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::card_table::CardTable;
use super::mark_bitmap::MarkBitmap;
use crate::util::constants::*;
use crate::util::conversions;
use crate::util::memory::{self, MmapProtection};
use crate::util::{Address, ObjectReference};

pub struct ImmuneSpace {
    name: &'static str,
    begin: Address,
    capacity: usize,
    top: AtomicUsize,
    live_bitmap: MarkBitmap,
    // Scan-once tracking for the tracer; cleared each cycle.
    mark_bitmap: MarkBitmap,
    cards: CardTable,
    mod_union: spin::Mutex<BTreeSet<usize>>,
}

impl ImmuneSpace {
    pub fn new(name: &'static str, capacity: usize) -> std::io::Result<Self> {
        debug_assert!(conversions::raw_is_aligned(capacity, BYTES_IN_PAGE));
        let begin = memory::mmap_anywhere(capacity, MmapProtection::ReadWrite, name)?;
        Ok(ImmuneSpace {
            name,
            begin,
            capacity,
            top: AtomicUsize::new(begin.as_usize()),
            live_bitmap: MarkBitmap::new(begin, capacity),
            mark_bitmap: MarkBitmap::new(begin, capacity),
            cards: CardTable::new(begin, capacity),
            mod_union: spin::Mutex::new(BTreeSet::new()),
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

    pub fn alloc(&self, size: usize) -> Option<Address> {
        debug_assert!(conversions::raw_is_aligned(size, BYTES_IN_GRANULE));
        let old = self.top.fetch_add(size, Ordering::AcqRel);
        if old + size > self.begin.as_usize() + self.capacity {
            self.top.fetch_sub(size, Ordering::AcqRel);
            return None;
        }
        Some(unsafe { Address::from_usize(old) })
    }

    pub fn publish(&self, object: ObjectReference) {
        self.live_bitmap.set(object.to_address());
    }

    /// Fold every non-clean card into the persistent mod-union table.
    pub fn fold_cards_into_mod_union(&self) {
        let mut mu = self.mod_union.lock();
        self.cards.fold_non_clean(|idx| {
            mu.insert(idx);
        });
    }

    /// Visit the address range of every mod-union card.
    pub fn visit_mod_union(&self, mut f: impl FnMut(Address, Address)) {
        let mu = self.mod_union.lock();
        for idx in mu.iter() {
            let (begin, end) = self.cards.card_range(*idx);
            f(begin, end);
        }
    }
}

impl Drop for ImmuneSpace {
    fn drop(&mut self) {
        let _ = memory::munmap(self.begin, self.capacity);
    }
}
