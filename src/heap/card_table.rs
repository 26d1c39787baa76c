//! A byte-per-card table used to find references mutated during concurrent
//! marking, and to approximate a mod-union table for immune spaces.

use atomic::Ordering;
use std::sync::atomic::AtomicU8;

use crate::util::constants::*;
use crate::util::Address;

/// Card has not been written since it was last cleared.
pub const CARD_CLEAN: u8 = 0;
/// Card was written by a mutator since the last scan.
pub const CARD_DIRTY: u8 = 0x70;
/// Card was dirty at pre-clean time; it must be rescanned at the pause.
pub const CARD_AGED: u8 = CARD_DIRTY - 1;

pub struct CardTable {
    begin: Address,
    cards: Box<[AtomicU8]>,
}

impl CardTable {
    pub fn new(begin: Address, bytes: usize) -> Self {
        let ncards = (bytes + BYTES_IN_CARD - 1) >> LOG_BYTES_IN_CARD;
        let cards = (0..ncards).map(|_| AtomicU8::new(CARD_CLEAN)).collect();
        CardTable { begin, cards }
    }

    fn index_of(&self, addr: Address) -> usize {
        debug_assert!(addr >= self.begin);
        (addr - self.begin) >> LOG_BYTES_IN_CARD
    }

    /// The write barrier: dirty the card covering `addr`.
    pub fn dirty(&self, addr: Address) {
        self.cards[self.index_of(addr)].store(CARD_DIRTY, Ordering::Release);
    }

    pub fn get(&self, addr: Address) -> u8 {
        self.cards[self.index_of(addr)].load(Ordering::Acquire)
    }

    /// Age every dirty card (pre-cleaning). Returns how many were aged.
    pub fn age_all(&self) -> usize {
        let mut aged = 0;
        for card in self.cards.iter() {
            if card
                .compare_exchange(CARD_DIRTY, CARD_AGED, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                aged += 1;
            }
        }
        aged
    }

    /// Visit the address range of every card at or above `threshold`
    /// (`CARD_AGED` includes aged and dirty; `CARD_DIRTY` only dirty),
    /// optionally clearing each visited card.
    pub fn scan_cards(
        &self,
        threshold: u8,
        clear: bool,
        mut f: impl FnMut(Address, Address),
    ) -> usize {
        let mut visited = 0;
        for (i, card) in self.cards.iter().enumerate() {
            let state = card.load(Ordering::Acquire);
            if state >= threshold && state != CARD_CLEAN {
                if clear {
                    card.store(CARD_CLEAN, Ordering::Release);
                }
                let card_begin = self.begin + (i << LOG_BYTES_IN_CARD);
                f(card_begin, card_begin + BYTES_IN_CARD);
                visited += 1;
            }
        }
        visited
    }

    /// Visit the index of every non-clean card without clearing. Used to fold
    /// cards into an immune space's mod-union table.
    pub fn fold_non_clean(&self, mut f: impl FnMut(usize)) {
        for (i, card) in self.cards.iter().enumerate() {
            let state = card.swap(CARD_CLEAN, Ordering::AcqRel);
            if state != CARD_CLEAN {
                f(i);
            }
        }
    }

    /// The address range covered by card `index`.
    pub fn card_range(&self, index: usize) -> (Address, Address) {
        let begin = self.begin + (index << LOG_BYTES_IN_CARD);
        (begin, begin + BYTES_IN_CARD)
    }

    pub fn clear_all(&self) {
        for card in self.cards.iter() {
            card.store(CARD_CLEAN, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CardTable {
        CardTable::new(unsafe { Address::from_usize(0x2000_0000) }, 16 * BYTES_IN_CARD)
    }

    #[test]
    fn test_dirty_age_scan() {
        let ct = table();
        let base = unsafe { Address::from_usize(0x2000_0000) };
        ct.dirty(base + 5usize);
        ct.dirty(base + 3 * BYTES_IN_CARD);
        assert_eq!(ct.age_all(), 2);
        assert_eq!(ct.get(base + 5usize), CARD_AGED);

        // Newly dirtied card after aging.
        ct.dirty(base + 7 * BYTES_IN_CARD);

        // Dirty-only scan sees one card.
        let mut dirty_seen = 0;
        ct.scan_cards(CARD_DIRTY, false, |_, _| dirty_seen += 1);
        assert_eq!(dirty_seen, 1);

        // Aged-and-dirty scan sees all three, and clears them.
        let mut all_seen = 0;
        ct.scan_cards(CARD_AGED, true, |_, _| all_seen += 1);
        assert_eq!(all_seen, 3);
        assert_eq!(ct.get(base + 5usize), CARD_CLEAN);
    }
}
