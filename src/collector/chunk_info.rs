//! The chunk-info vector: one 32-bit live-byte accumulator per chunk.
//!
//! During marking, `add` accumulates the rounded-up size of every newly
//! marked object, splitting across chunks as needed.  `finalize` turns the
//! vector into an exclusive prefix sum, after which entry `i` holds the total
//! live bytes in chunks below `i` and `lookup` can translate any pre-compact
//! live address to its post-compact address with one popcount.

use std::sync::atomic::{AtomicU32, Ordering};

use super::live_words::LiveWordsBitmap;
use crate::util::constants::*;
use crate::util::Address;

pub struct ChunkInfoVec {
    begin: Address,
    // One extra slot carries the grand total past the last scanned chunk.
    counts: Box<[AtomicU32]>,
}

impl ChunkInfoVec {
    pub fn new(begin: Address, bytes: usize) -> Self {
        debug_assert!(begin.is_aligned_to(BYTES_IN_CHUNK));
        let nchunks = (bytes + BYTES_IN_CHUNK - 1) >> LOG_BYTES_IN_CHUNK;
        ChunkInfoVec {
            begin,
            counts: (0..nchunks + 1).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    fn chunk_of(&self, addr: Address) -> usize {
        debug_assert!(addr >= self.begin);
        (addr - self.begin) >> LOG_BYTES_IN_CHUNK
    }

    /// Account `size` live bytes for the object at `addr`, splitting across
    /// chunk boundaries.
    pub fn add(&self, addr: Address, size: usize) {
        debug_assert!(size % BYTES_IN_GRANULE == 0);
        let mut chunk = self.chunk_of(addr);
        let mut remaining = size;
        let first_chunk_room = BYTES_IN_CHUNK - (addr & (BYTES_IN_CHUNK - 1));
        let mut portion = std::cmp::min(remaining, first_chunk_room);
        loop {
            debug_assert!(
                self.counts[chunk].load(Ordering::Relaxed) as usize + portion <= BYTES_IN_CHUNK
            );
            self.counts[chunk].fetch_add(portion as u32, Ordering::Relaxed);
            remaining -= portion;
            if remaining == 0 {
                break;
            }
            chunk += 1;
            portion = std::cmp::min(remaining, BYTES_IN_CHUNK);
        }
    }

    /// Exclusive prefix-sum in place over chunks `[0, nchunks)`, writing the
    /// running total one past the last scanned chunk.  Returns the total live
    /// bytes.  The pre-scan value of the last element is preserved in the
    /// sum, so address computation keeps working for the chunk at the
    /// black-allocations boundary.
    pub fn finalize(&self, nchunks: usize) -> usize {
        let mut running: usize = 0;
        for i in 0..nchunks {
            let v = self.counts[i].load(Ordering::Relaxed) as usize;
            self.counts[i].store(running as u32, Ordering::Relaxed);
            running += v;
        }
        self.counts[nchunks].store(running as u32, Ordering::Relaxed);
        running
    }

    /// Live bytes preceding chunk `i` (valid after `finalize`).
    pub fn offset_of_chunk(&self, chunk: usize) -> usize {
        self.counts[chunk].load(Ordering::Relaxed) as usize
    }

    /// Raw per-chunk live bytes (valid before `finalize`).
    pub fn live_bytes_in_chunk(&self, chunk: usize) -> usize {
        self.counts[chunk].load(Ordering::Relaxed) as usize
    }

    /// Post-compact address of a pre-mark-live `addr`, assuming the space
    /// compacts down to `space_begin`.
    pub fn lookup(&self, addr: Address, live: &LiveWordsBitmap, space_begin: Address) -> Address {
        debug_assert!(live.test(addr));
        let chunk = self.chunk_of(addr);
        let bit = ((addr & (BYTES_IN_CHUNK - 1)) >> LOG_BYTES_IN_GRANULE) as u32;
        let below = live.chunk_word(chunk) & ((1usize << bit) - 1);
        space_begin
            + self.offset_of_chunk(chunk)
            + ((below.count_ones() as usize) << LOG_BYTES_IN_GRANULE)
    }

    pub fn clear_all(&self) {
        for c in self.counts.iter() {
            c.store(0, Ordering::Relaxed);
        }
    }

    /// Total accumulated live bytes (valid before `finalize`); used by the
    /// round-trip checks against the live-words bitmap.
    pub fn sum(&self, nchunks: usize) -> usize {
        (0..nchunks).map(|i| self.live_bytes_in_chunk(i)).sum()
    }
}
