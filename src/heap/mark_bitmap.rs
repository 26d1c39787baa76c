//! A one-bit-per-granule accounting bitmap.
//!
//! Each space carries one of these for marking (and the non-moving space a
//! second one for liveness).  A set bit denotes the first granule of an
//! object.  The storage is allocated once at space creation and cleared, not
//! reallocated, at cycle start.

use atomic::Ordering;
use std::sync::atomic::AtomicUsize;

use crate::util::constants::*;
use crate::util::{Address, ObjectReference};

pub struct MarkBitmap {
    begin: Address,
    words: Box<[AtomicUsize]>,
}

impl MarkBitmap {
    /// Create a bitmap covering `bytes` starting at `begin`.
    pub fn new(begin: Address, bytes: usize) -> Self {
        debug_assert!(begin.is_aligned_to(BYTES_IN_GRANULE));
        let bits = bytes >> LOG_BYTES_IN_GRANULE;
        let nwords = (bits + BITS_IN_WORD - 1) >> LOG_BITS_IN_WORD;
        let words = (0..nwords).map(|_| AtomicUsize::new(0)).collect();
        MarkBitmap { begin, words }
    }

    fn bit_index(&self, addr: Address) -> usize {
        debug_assert!(addr >= self.begin);
        (addr - self.begin) >> LOG_BYTES_IN_GRANULE
    }

    fn addr_of_bit(&self, bit: usize) -> Address {
        self.begin + (bit << LOG_BYTES_IN_GRANULE)
    }

    /// Is the bit for the granule containing `addr` set?
    pub fn test(&self, addr: Address) -> bool {
        let bit = self.bit_index(addr);
        let word = self.words[bit >> LOG_BITS_IN_WORD].load(Ordering::Relaxed);
        word & (1 << (bit & (BITS_IN_WORD - 1))) != 0
    }

    /// Atomically set the bit for `addr`. Returns true if this call newly set
    /// the bit, which is how a double-mark is detected and suppressed.
    pub fn test_and_set(&self, addr: Address) -> bool {
        let bit = self.bit_index(addr);
        let mask = 1 << (bit & (BITS_IN_WORD - 1));
        let old = self.words[bit >> LOG_BITS_IN_WORD].fetch_or(mask, Ordering::SeqCst);
        old & mask == 0
    }

    /// Set the bit for `addr` without returning the previous value.
    pub fn set(&self, addr: Address) {
        self.test_and_set(addr);
    }

    /// Clear every bit.
    pub fn clear_all(&self) {
        for w in self.words.iter() {
            w.store(0, Ordering::Relaxed);
        }
    }

    /// Overwrite this bitmap with the contents of `other`. Both bitmaps must
    /// cover ranges of the same size.
    pub fn copy_from(&self, other: &MarkBitmap) {
        debug_assert_eq!(self.words.len(), other.words.len());
        for (dst, src) in self.words.iter().zip(other.words.iter()) {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    /// Find the object whose start bit is the last one set at or before
    /// `addr`.  Scans backwards; the caller guarantees such an object exists
    /// within the bitmap's range.
    pub fn find_preceding(&self, addr: Address) -> Option<ObjectReference> {
        let bit = self.bit_index(addr);
        let mut word_idx = bit >> LOG_BITS_IN_WORD;
        let in_word = bit & (BITS_IN_WORD - 1);
        // Mask off bits above `addr` in the first word.
        let mut word = self.words[word_idx].load(Ordering::Relaxed);
        word &= (1 << in_word) | ((1 << in_word) - 1);
        loop {
            if word != 0 {
                let top = BITS_IN_WORD - 1 - word.leading_zeros() as usize;
                let found = (word_idx << LOG_BITS_IN_WORD) + top;
                return Some(ObjectReference::from_address(self.addr_of_bit(found)));
            }
            if word_idx == 0 {
                return None;
            }
            word_idx -= 1;
            word = self.words[word_idx].load(Ordering::Relaxed);
        }
    }

    /// Find the first set bit in `[begin, end)`.
    pub fn find_first_in(&self, begin: Address, end: Address) -> Option<ObjectReference> {
        let mut bit = self.bit_index(begin);
        let end_bit = self.bit_index(end);
        while bit < end_bit {
            let word_idx = bit >> LOG_BITS_IN_WORD;
            let mut word = self.words[word_idx].load(Ordering::Relaxed);
            word &= !0 << (bit & (BITS_IN_WORD - 1));
            if word != 0 {
                let found = (word_idx << LOG_BITS_IN_WORD) + word.trailing_zeros() as usize;
                if found >= end_bit {
                    return None;
                }
                return Some(ObjectReference::from_address(self.addr_of_bit(found)));
            }
            bit = (word_idx + 1) << LOG_BITS_IN_WORD;
        }
        None
    }

    /// Visit each marked object start in `[begin, end)`, in address order.
    pub fn visit_marked_range(
        &self,
        begin: Address,
        end: Address,
        mut f: impl FnMut(ObjectReference),
    ) {
        let mut cursor = begin;
        while let Some(object) = self.find_first_in(cursor, end) {
            f(object);
            cursor = object.to_address() + BYTES_IN_GRANULE;
            if cursor >= end {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Address {
        unsafe { Address::from_usize(0x1000_0000) }
    }

    #[test]
    fn test_set_and_test() {
        let bm = MarkBitmap::new(base(), BYTES_IN_PAGE);
        let a = base() + 64usize;
        assert!(!bm.test(a));
        assert!(bm.test_and_set(a));
        assert!(!bm.test_and_set(a), "second set must report already-set");
        assert!(bm.test(a));
    }

    #[test]
    fn test_find_preceding() {
        let bm = MarkBitmap::new(base(), BYTES_IN_PAGE);
        bm.set(base());
        bm.set(base() + 512usize);
        let probe = base() + 600usize;
        assert_eq!(
            bm.find_preceding(probe).unwrap().to_address(),
            base() + 512usize
        );
        let probe = base() + 511usize;
        assert_eq!(bm.find_preceding(probe).unwrap().to_address(), base());
    }

    #[test]
    fn test_visit_marked_range() {
        let bm = MarkBitmap::new(base(), BYTES_IN_PAGE);
        for off in [0usize, 24, 64, 1000 & !7, 4088] {
            bm.set(base() + off);
        }
        let mut seen = vec![];
        bm.visit_marked_range(base(), base() + BYTES_IN_PAGE, |o| {
            seen.push(o.to_address() - base())
        });
        assert_eq!(seen, vec![0, 24, 64, 1000 & !7, 4088]);

        let mut bounded = vec![];
        bm.visit_marked_range(base() + 24usize, base() + 1000usize, |o| {
            bounded.push(o.to_address() - base())
        });
        assert_eq!(bounded, vec![24, 64]);
    }
}
