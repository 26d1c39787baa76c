//! The live-words bitmap: one bit per allocation granule of the moving
//! space.  One bitmap word covers exactly one chunk, so the post-compact
//! offset of any granule is one chunk-info entry plus one popcount.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::util::constants::*;
use crate::util::Address;

pub struct LiveWordsBitmap {
    begin: Address,
    words: Box<[AtomicUsize]>,
}

impl LiveWordsBitmap {
    pub fn new(begin: Address, bytes: usize) -> Self {
        debug_assert!(begin.is_aligned_to(BYTES_IN_CHUNK));
        let bits = bytes >> LOG_BYTES_IN_GRANULE;
        let nwords = (bits + BITS_IN_WORD - 1) >> LOG_BITS_IN_WORD;
        LiveWordsBitmap {
            begin,
            words: (0..nwords).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    fn bit_of(&self, addr: Address) -> usize {
        debug_assert!(addr >= self.begin);
        (addr - self.begin) >> LOG_BYTES_IN_GRANULE
    }

    /// The address of a global granule index.
    pub fn addr_of_bit(&self, bit: usize) -> Address {
        self.begin + (bit << LOG_BYTES_IN_GRANULE)
    }

    /// The bitmap word of one chunk.
    pub fn chunk_word(&self, chunk: usize) -> usize {
        self.words[chunk].load(Ordering::Relaxed)
    }

    /// Is the granule containing `addr` live?
    pub fn test(&self, addr: Address) -> bool {
        let bit = self.bit_of(addr);
        self.chunk_word(bit >> LOG_BITS_IN_WORD) & (1 << (bit & (BITS_IN_WORD - 1))) != 0
    }

    /// Set all bits covering `[begin, begin+size)` and return the first bit
    /// index.  The begin bit must be clear (objects are marked at most once).
    /// Interior words are stored whole, so arbitrarily large objects cost one
    /// store per chunk.
    pub fn set_range(&self, begin: Address, size: usize) -> usize {
        debug_assert!(size > 0 && size % BYTES_IN_GRANULE == 0);
        let first_bit = self.bit_of(begin);
        debug_assert!(!self.test(begin), "live range set twice at {}", begin);
        let end_bit = first_bit + (size >> LOG_BYTES_IN_GRANULE);

        let mut word_idx = first_bit >> LOG_BITS_IN_WORD;
        let last_word = (end_bit - 1) >> LOG_BITS_IN_WORD;
        let lo = first_bit & (BITS_IN_WORD - 1);
        let hi = end_bit - (last_word << LOG_BITS_IN_WORD);

        if word_idx == last_word {
            // Mask with `hi - lo` ones starting at `lo`; hi == W would
            // overflow the shift, but then the range covers the word end and
            // the two-word path below runs instead.
            let mask = if hi == BITS_IN_WORD {
                !0usize << lo
            } else {
                ((1usize << hi) - 1) & (!0usize << lo)
            };
            self.words[word_idx].fetch_or(mask, Ordering::Relaxed);
            return first_bit;
        }

        self.words[word_idx].fetch_or(!0usize << lo, Ordering::Relaxed);
        word_idx += 1;
        while word_idx < last_word {
            self.words[word_idx].store(!0, Ordering::Relaxed);
            word_idx += 1;
        }
        let mask = if hi == BITS_IN_WORD {
            !0usize
        } else {
            (1usize << hi) - 1
        };
        self.words[last_word].fetch_or(mask, Ordering::Relaxed);
        first_bit
    }

    /// The bit position of the `n`th (0-indexed) set bit within one chunk's
    /// word.  Costs O(n) bit-clears, bounded by the popcount.
    pub fn nth_set_bit_in_chunk(&self, chunk: usize, n: usize) -> usize {
        let mut word = self.chunk_word(chunk);
        debug_assert!(word.count_ones() as usize > n);
        for _ in 0..n {
            word &= word - 1;
        }
        word.trailing_zeros() as usize
    }

    fn find_next_set(&self, mut bit: usize, end_bit: usize) -> Option<usize> {
        while bit < end_bit {
            let word_idx = bit >> LOG_BITS_IN_WORD;
            let word = self.chunk_word(word_idx) & (!0usize << (bit & (BITS_IN_WORD - 1)));
            if word != 0 {
                let found = (word_idx << LOG_BITS_IN_WORD) + word.trailing_zeros() as usize;
                return (found < end_bit).then_some(found);
            }
            bit = (word_idx + 1) << LOG_BITS_IN_WORD;
        }
        None
    }

    /// Length of the run of consecutive set bits starting at `bit`, clipped
    /// to `end_bit`.
    fn run_length(&self, bit: usize, end_bit: usize) -> usize {
        let mut len = 0;
        let mut cursor = bit;
        loop {
            let word_idx = cursor >> LOG_BITS_IN_WORD;
            let shift = cursor & (BITS_IN_WORD - 1);
            let run = (!(self.chunk_word(word_idx) >> shift)).trailing_zeros() as usize;
            let in_word = BITS_IN_WORD - shift;
            len += std::cmp::min(run, in_word);
            cursor += std::cmp::min(run, in_word);
            if run < in_word || cursor >= end_bit {
                break;
            }
        }
        std::cmp::min(len, end_bit - bit)
    }

    /// Iterate contiguous runs of set bits starting at `begin_bit`, invoking
    /// `visitor(stride_begin_bit, stride_granules, is_last)` until either
    /// `end_addr` is reached or `max_bytes` of live data have been emitted.
    pub fn visit_live_strides(
        &self,
        begin_bit: usize,
        end_addr: Address,
        max_bytes: usize,
        mut visitor: impl FnMut(usize, usize, bool),
    ) {
        let end_bit = self.bit_of(end_addr);
        let mut budget = max_bytes >> LOG_BYTES_IN_GRANULE;
        let mut cursor = begin_bit;
        let mut pending: Option<(usize, usize)> = None;
        while budget > 0 {
            let Some(start) = self.find_next_set(cursor, end_bit) else {
                break;
            };
            let len = std::cmp::min(self.run_length(start, end_bit), budget);
            budget -= len;
            if let Some((ps, pl)) = pending.take() {
                visitor(ps, pl, false);
            }
            pending = Some((start, len));
            cursor = start + len;
        }
        if let Some((ps, pl)) = pending {
            visitor(ps, pl, true);
        }
    }

    pub fn clear_all(&self) {
        for w in self.words.iter() {
            w.store(0, Ordering::Relaxed);
        }
    }

    /// Total live granules; used by the round-trip checks against the
    /// chunk-info vector.
    pub fn count_ones(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap() -> (Address, LiveWordsBitmap) {
        let begin = unsafe { Address::from_usize(0x6000_0000) };
        (begin, LiveWordsBitmap::new(begin, 4 * BYTES_IN_PAGE))
    }

    #[test]
    fn test_set_range_single_word() {
        let (begin, lw) = bitmap();
        let first = lw.set_range(begin + 64usize, 24);
        assert_eq!(first, 8);
        assert!(lw.test(begin + 64usize));
        assert!(lw.test(begin + 80usize));
        assert!(!lw.test(begin + 88usize));
        assert_eq!(lw.count_ones(), 3);
    }

    #[test]
    fn test_set_range_spanning_words() {
        let (begin, lw) = bitmap();
        // 3 chunks worth of live data starting mid-chunk.
        let first = lw.set_range(begin + (BYTES_IN_CHUNK - 16), 3 * BYTES_IN_CHUNK);
        assert_eq!(first, GRANULES_IN_CHUNK - 2);
        assert_eq!(lw.count_ones(), 3 * GRANULES_IN_CHUNK);
        // Interior chunk is fully set.
        assert_eq!(lw.chunk_word(1), !0);
        assert_eq!(lw.chunk_word(2), !0);
    }

    #[test]
    fn test_nth_set_bit() {
        let (begin, lw) = bitmap();
        lw.set_range(begin, 8);
        lw.set_range(begin + 24usize, 16);
        lw.set_range(begin + 56usize, 8);
        // Chunk word has bits 0, 3, 4, 7.
        assert_eq!(lw.nth_set_bit_in_chunk(0, 0), 0);
        assert_eq!(lw.nth_set_bit_in_chunk(0, 1), 3);
        assert_eq!(lw.nth_set_bit_in_chunk(0, 2), 4);
        assert_eq!(lw.nth_set_bit_in_chunk(0, 3), 7);
    }

    #[test]
    fn test_visit_live_strides() {
        let (begin, lw) = bitmap();
        lw.set_range(begin, 24); // bits 0..3
        lw.set_range(begin + 64usize, 16); // bits 8..10
        lw.set_range(begin + 96usize, 8); // bit 12
        let mut strides = vec![];
        lw.visit_live_strides(0, begin + BYTES_IN_PAGE, BYTES_IN_PAGE, |s, n, last| {
            strides.push((s, n, last))
        });
        assert_eq!(
            strides,
            vec![(0, 3, false), (8, 2, false), (12, 1, true)]
        );
    }

    #[test]
    fn test_visit_live_strides_budget_clips() {
        let (begin, lw) = bitmap();
        lw.set_range(begin, BYTES_IN_CHUNK * 2); // one long run
        let mut strides = vec![];
        lw.visit_live_strides(0, begin + 4 * BYTES_IN_PAGE, 10 * BYTES_IN_GRANULE, |s, n, last| {
            strides.push((s, n, last))
        });
        assert_eq!(strides, vec![(0, 10, true)]);
    }

    #[test]
    fn test_visit_live_strides_from_offset() {
        let (begin, lw) = bitmap();
        lw.set_range(begin, 64); // bits 0..8
        // Start mid-run, as a destination page whose first object straddles
        // the page boundary would.
        let mut strides = vec![];
        lw.visit_live_strides(3, begin + BYTES_IN_PAGE, BYTES_IN_PAGE, |s, n, last| {
            strides.push((s, n, last))
        });
        assert_eq!(strides, vec![(3, 5, true)]);
    }
}
