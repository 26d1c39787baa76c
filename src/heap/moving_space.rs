//! The moving bump-pointer space and its from-space shadow.
//!
//! The space is one contiguous mapping `[begin, begin+capacity)`; a second,
//! same-sized reservation is the from-space.  During concurrent compaction
//! the kernel moves the space's page tables into the from-space reservation
//! (`mremap` with dont-unmap), so reads of the space fault while the
//! from-space carries the pre-compaction bytes read-only.
//!
//! Allocation is bump-pointer, either from shared blocks or from per-thread
//! TLABs carved out of the space; the space records the ordered block-size
//! list so the collector can walk black allocations block by block.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use super::card_table::CardTable;
use super::mark_bitmap::MarkBitmap;
use crate::util::constants::*;
use crate::util::conversions;
use crate::util::memory::{self, MmapProtection};
use crate::util::Address;

/// One bump-pointer allocation block: a shared block or a TLAB.
#[derive(Copy, Clone, Debug)]
pub struct Block {
    pub begin: Address,
    pub size: usize,
    /// Shared blocks may grow in place; TLABs and pad blocks may end in an
    /// unused hole, so appending to them would hide objects from the
    /// null-class block walk.
    pub shared: bool,
}

impl Block {
    pub fn end(&self) -> Address {
        self.begin + self.size
    }
}

/// Backing for the moving space.  Minor-fault mode needs memfds: the space
/// maps a front file whose pages become the from-space at the flip, while
/// new pages are produced through a shadow mapping of a back file and
/// installed with `UFFDIO_CONTINUE`; the files swap roles every cycle.
pub enum Backing {
    Anonymous,
    Memfd,
}

struct MemfdBacking {
    /// Backs the moving-space range this cycle; its pages carry the
    /// pre-compaction contents after the flip.
    front: RawFd,
    /// Receives produced pages through the shadow mapping.
    back: RawFd,
    shadow: Address,
}

pub struct MovingSpace {
    name: &'static str,
    begin: Address,
    capacity: usize,
    from_begin: Address,
    memfds: Option<Mutex<MemfdBacking>>,
    top: AtomicUsize,
    blocks: Mutex<Vec<Block>>,
    mark_bitmap: MarkBitmap,
    cards: CardTable,
    // Allocation is held off while a concurrent compaction is repositioning
    // the block list.
    alloc_gate: Mutex<bool>,
    alloc_gate_cv: Condvar,
}

impl MovingSpace {
    pub fn new(name: &'static str, capacity: usize, backing: Backing) -> std::io::Result<Self> {
        debug_assert!(conversions::raw_is_aligned(capacity, BYTES_IN_PAGE));
        let (begin, memfds) = match backing {
            Backing::Anonymous => {
                let begin = memory::mmap_anywhere(capacity, MmapProtection::ReadWrite, name)?;
                (begin, None)
            }
            Backing::Memfd => {
                let front = memory::memfd_create(name, capacity)?;
                let back = memory::memfd_create(name, capacity)?;
                let begin = memory::mmap_memfd(front, capacity, MmapProtection::ReadWrite, name)?;
                let shadow = memory::mmap_memfd(back, capacity, MmapProtection::ReadWrite, name)?;
                (
                    begin,
                    Some(Mutex::new(MemfdBacking {
                        front,
                        back,
                        shadow,
                    })),
                )
            }
        };
        let from_begin = memory::mmap_anywhere(capacity, MmapProtection::ReadWrite, name)?;
        Ok(MovingSpace {
            name,
            begin,
            capacity,
            from_begin,
            memfds,
            top: AtomicUsize::new(begin.as_usize()),
            blocks: Mutex::new(vec![]),
            mark_bitmap: MarkBitmap::new(begin, capacity),
            cards: CardTable::new(begin, capacity),
            alloc_gate: Mutex::new(false),
            alloc_gate_cv: Condvar::new(),
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

    pub fn limit(&self) -> Address {
        self.begin + self.capacity
    }

    /// Current allocation frontier.
    pub fn top(&self) -> Address {
        unsafe { Address::from_usize(self.top.load(Ordering::Acquire)) }
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.begin && addr < self.limit()
    }

    pub fn from_space_begin(&self) -> Address {
        self.from_begin
    }

    /// The fd whose pages carry the from-space contents this cycle, for
    /// hole-punch reclaim.
    pub fn memfd(&self) -> Option<RawFd> {
        self.memfds.as_ref().map(|m| m.lock().unwrap().front)
    }

    /// The shadow mapping pages are produced into (minor-fault mode).
    pub fn shadow_begin(&self) -> Option<Address> {
        self.memfds.as_ref().map(|m| m.lock().unwrap().shadow)
    }

    /// Replace the moving-space range with a fresh mapping of the back file.
    /// Called at the flip, after the front file's page tables have been
    /// moved to the from-space range.
    pub fn remap_to_back_memfd(&self) -> std::io::Result<()> {
        let backing = self.memfds.as_ref().expect("not memfd backed");
        let backing = backing.lock().unwrap();
        memory::mmap_memfd_fixed(
            backing.back,
            self.begin,
            self.capacity,
            MmapProtection::ReadWrite,
            self.name,
        )
    }

    /// Swap the front and back files at cycle end: the back file (holding
    /// the compacted pages) becomes the front, and the shadow is remapped
    /// onto the new back so the next cycle reuses it.
    pub fn swap_memfds(&self) {
        let backing = self.memfds.as_ref().expect("not memfd backed");
        let mut backing = backing.lock().unwrap();
        let backing = &mut *backing;
        std::mem::swap(&mut backing.front, &mut backing.back);
        let _ = memory::munmap(backing.shadow, self.capacity);
        backing.shadow = memory::mmap_memfd(
            backing.back,
            self.capacity,
            MmapProtection::ReadWrite,
            self.name,
        )
        .expect("remapping the shadow after the memfd swap failed");
        // The new back file still holds last cycle's stale pages.
        let _ = memory::punch_hole(backing.back, 0, self.capacity);
    }

    /// Translate a moving-space address to its from-space alias.
    pub fn to_from_space(&self, addr: Address) -> Address {
        debug_assert!(self.contains(addr));
        self.from_begin + (addr - self.begin)
    }

    /// Translate a from-space address back to the moving space.
    pub fn from_from_space(&self, addr: Address) -> Address {
        debug_assert!(addr >= self.from_begin && addr < self.from_begin + self.capacity);
        self.begin + (addr - self.from_begin)
    }

    pub fn mark_bitmap(&self) -> &MarkBitmap {
        &self.mark_bitmap
    }

    pub fn cards(&self) -> &CardTable {
        &self.cards
    }

    fn wait_alloc_open(&self) {
        let mut closed = self.alloc_gate.lock().unwrap();
        while *closed {
            closed = self.alloc_gate_cv.wait(closed).unwrap();
        }
    }

    /// Hold off allocation while the collector repositions the block list.
    pub fn close_alloc_gate(&self) {
        *self.alloc_gate.lock().unwrap() = true;
    }

    pub fn open_alloc_gate(&self) {
        *self.alloc_gate.lock().unwrap() = false;
        self.alloc_gate_cv.notify_all();
    }

    /// Bump-allocate `size` bytes from a shared block.
    pub fn alloc(&self, size: usize) -> Option<Address> {
        debug_assert!(conversions::raw_is_aligned(size, BYTES_IN_GRANULE));
        self.wait_alloc_open();
        let mut blocks = self.blocks.lock().unwrap();
        let top = self.top();
        if top + size > self.limit() {
            return None;
        }
        self.top.store((top + size).as_usize(), Ordering::Release);
        // Grow the trailing shared block when possible; a TLAB or pad block
        // in between forces a fresh block, keeping its trailing hole intact.
        match blocks.last_mut() {
            Some(last) if last.shared && last.end() == top => last.size += size,
            _ => blocks.push(Block {
                begin: top,
                size,
                shared: true,
            }),
        }
        Some(top)
    }

    /// Carve a TLAB of `size` bytes. Returns its `[begin, end)` bounds.
    pub fn carve_tlab(&self, size: usize) -> Option<(Address, Address)> {
        debug_assert!(conversions::raw_is_aligned(size, BYTES_IN_GRANULE));
        self.wait_alloc_open();
        let mut blocks = self.blocks.lock().unwrap();
        let top = self.top();
        if top + size > self.limit() {
            return None;
        }
        self.top.store((top + size).as_usize(), Ordering::Release);
        blocks.push(Block {
            begin: top,
            size,
            shared: false,
        });
        Some((top, top + size))
    }

    /// Pad the allocation frontier to a page boundary (recording the pad as a
    /// block) and return it.  The marking pause calls this to fix the
    /// black-allocations boundary.
    pub fn align_end(&self) -> Address {
        let mut blocks = self.blocks.lock().unwrap();
        let top = self.top();
        let aligned = conversions::page_align_up(top);
        if aligned > top {
            blocks.push(Block {
                begin: top,
                size: aligned - top,
                shared: false,
            });
            self.top.store(aligned.as_usize(), Ordering::Release);
        }
        aligned
    }

    /// Snapshot of the ordered block-size list.
    pub fn get_block_sizes(&self) -> Vec<Block> {
        self.blocks.lock().unwrap().clone()
    }

    /// Blocks intersecting `[from, top)`, clipped to start no earlier than
    /// `from`.
    pub fn blocks_from(&self, from: Address) -> Vec<Block> {
        let blocks = self.blocks.lock().unwrap();
        let mut out = vec![];
        for b in blocks.iter() {
            if b.end() <= from {
                continue;
            }
            let begin = std::cmp::max(b.begin, from);
            out.push(Block {
                begin,
                size: b.end() - begin,
                shared: b.shared,
            });
        }
        out
    }

    /// Reset the block list to one consumed main block after compaction.
    pub fn set_block_sizes(&self, main_size: usize) {
        let mut blocks = self.blocks.lock().unwrap();
        blocks.clear();
        if main_size > 0 {
            blocks.push(Block {
                begin: self.begin,
                size: main_size,
                shared: true,
            });
        }
        self.top
            .store((self.begin + main_size).as_usize(), Ordering::Release);
    }
}

impl Drop for MovingSpace {
    fn drop(&mut self) {
        let _ = memory::munmap(self.begin, self.capacity);
        let _ = memory::munmap(self.from_begin, self.capacity);
        if let Some(backing) = self.memfds.take() {
            let backing = backing.into_inner().unwrap();
            let _ = memory::munmap(backing.shadow, self.capacity);
            unsafe {
                libc::close(backing.front);
                libc::close(backing.back);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_blocks() {
        let space = MovingSpace::new("uffdc:test:moving", 64 * BYTES_IN_PAGE, Backing::Anonymous)
            .unwrap();
        let a = space.alloc(64).unwrap();
        let b = space.alloc(32).unwrap();
        assert_eq!(b, a + 64usize);
        // Contiguous shared allocations coalesce into one block.
        assert_eq!(space.get_block_sizes().len(), 1);

        let (t_begin, t_end) = space.carve_tlab(BYTES_IN_PAGE).unwrap();
        assert_eq!(t_end - t_begin, BYTES_IN_PAGE);
        assert_eq!(space.get_block_sizes().len(), 2);

        // A shared allocation after a TLAB starts a new block.
        space.alloc(16).unwrap();
        assert_eq!(space.get_block_sizes().len(), 3);

        let aligned = space.align_end();
        assert!(aligned.is_aligned_to(BYTES_IN_PAGE));
        assert_eq!(space.top(), aligned);
    }

    #[test]
    fn test_from_space_translation() {
        let space = MovingSpace::new("uffdc:test:moving", 16 * BYTES_IN_PAGE, Backing::Anonymous)
            .unwrap();
        let addr = space.begin() + 123usize * 8;
        let shadow = space.to_from_space(addr);
        assert_eq!(space.from_from_space(shadow), addr);
    }

    #[test]
    fn test_block_clipping() {
        let space = MovingSpace::new("uffdc:test:moving", 16 * BYTES_IN_PAGE, Backing::Anonymous)
            .unwrap();
        space.alloc(3 * BYTES_IN_PAGE).unwrap();
        let mid = space.begin() + BYTES_IN_PAGE;
        let clipped = space.blocks_from(mid);
        assert_eq!(clipped.len(), 1);
        assert_eq!(clipped[0].begin, mid);
        assert_eq!(clipped[0].size, 2 * BYTES_IN_PAGE);
    }
}
