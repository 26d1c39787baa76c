//! The compaction core: per-cycle metadata, address translation, and the
//! shared state the GC thread, uffd workers and faulting mutators all
//! operate on.
//!
//! This type is deliberately not generic over the runtime callbacks so that
//! the SIGBUS fast path can reach it through a plain pointer.

use atomic::Atomic;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::chunk_info::ChunkInfoVec;
use super::live_words::LiveWordsBitmap;
use super::page_state::PageStates;
use crate::heap::HeapLayout;
use crate::object;
use crate::uffd::UserFaultFd;
use crate::util::constants::*;
use crate::util::conversions;
use crate::util::memory::{self, MmapProtection};
use crate::util::options::{CompactorMode, Options, MAX_PARALLEL_WORKERS};
use crate::util::{Address, ObjectReference};

/// Buffer slots mutators may claim while producing a page in a fault
/// handler.
pub(crate) const MUTATOR_BUFFER_SLOTS: usize = 8;

/// Per-thread page buffers: one for the GC thread, one per worker, and a
/// small claimable pool for faulting mutators.
pub(crate) struct BufferPool {
    begin: Address,
    slots: AtomicUsize,
}

impl BufferPool {
    fn new() -> std::io::Result<Self> {
        // One GC buffer, one per worker, the mutator slots, and a page that
        // stays zero for installs into ranges ZEROPAGE cannot serve.
        let pages = 1 + MAX_PARALLEL_WORKERS + MUTATOR_BUFFER_SLOTS + 1;
        let begin = memory::mmap_anywhere(
            pages * BYTES_IN_PAGE,
            MmapProtection::ReadWrite,
            "uffdc:page-buffers",
        )?;
        Ok(BufferPool {
            begin,
            slots: AtomicUsize::new(0),
        })
    }

    pub fn gc_buffer(&self) -> Address {
        self.begin
    }

    /// A page that is never written.
    pub fn zero_page(&self) -> Address {
        self.begin + (1 + MAX_PARALLEL_WORKERS + MUTATOR_BUFFER_SLOTS) * BYTES_IN_PAGE
    }

    pub fn worker_buffer(&self, ordinal: usize) -> Address {
        debug_assert!(ordinal < MAX_PARALLEL_WORKERS);
        self.begin + (1 + ordinal) * BYTES_IN_PAGE
    }

    /// Claim a mutator buffer slot.  Lock-free; spins if all slots are taken,
    /// which only happens with more concurrent in-signal faults than slots.
    pub fn acquire_mutator(&self) -> (usize, Address) {
        loop {
            let taken = self.slots.load(Ordering::Relaxed);
            let free = !taken & ((1 << MUTATOR_BUFFER_SLOTS) - 1);
            if free == 0 {
                std::thread::yield_now();
                continue;
            }
            let idx = free.trailing_zeros() as usize;
            if self
                .slots
                .compare_exchange_weak(
                    taken,
                    taken | (1 << idx),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return (
                    idx,
                    self.begin + (1 + MAX_PARALLEL_WORKERS + idx) * BYTES_IN_PAGE,
                );
            }
        }
    }

    pub fn release_mutator(&self, idx: usize) {
        self.slots.fetch_and(!(1 << idx), Ordering::Release);
    }
}

/// Per-destination-page metadata, allocated once at construction and reset at
/// cycle start.
pub(crate) struct CycleMeta {
    pub first_obj_moving: Box<[Atomic<ObjectReference>]>,
    pub first_offset_moving: Box<[AtomicUsize]>,
    pub first_obj_non_moving: Box<[Atomic<ObjectReference>]>,
    pub page_states: PageStates,
}

impl CycleMeta {
    fn new(moving_pages: usize, non_moving_pages: usize) -> Self {
        CycleMeta {
            first_obj_moving: (0..moving_pages)
                .map(|_| Atomic::new(ObjectReference::NULL))
                .collect(),
            first_offset_moving: (0..moving_pages).map(|_| AtomicUsize::new(0)).collect(),
            first_obj_non_moving: (0..non_moving_pages)
                .map(|_| Atomic::new(ObjectReference::NULL))
                .collect(),
            page_states: PageStates::new(moving_pages),
        }
    }

    pub fn reset(&self) {
        for s in self.first_obj_moving.iter() {
            s.store(ObjectReference::NULL, Ordering::Relaxed);
        }
        for s in self.first_offset_moving.iter() {
            s.store(0, Ordering::Relaxed);
        }
        for s in self.first_obj_non_moving.iter() {
            s.store(ObjectReference::NULL, Ordering::Relaxed);
        }
        self.page_states.reset();
    }
}

/// Progressive from-space reclaim state.
pub(crate) struct ReclaimState {
    /// Space-relative byte offset; from-space above it has been released.
    pub last_reclaimed: AtomicUsize,
    /// Classes living in the moving space above at least one of their
    /// instances, mapped to the lowest such instance.  Their from-space
    /// range must stay resident until that instance has been compacted.
    pub class_after_obj: spin::Mutex<std::collections::BTreeMap<Address, Address>>,
}

pub struct CollectorCore {
    pub(crate) heap: HeapLayout,
    pub(crate) options: Options,
    pub(crate) live_words: LiveWordsBitmap,
    pub(crate) chunk_info: ChunkInfoVec,
    pub(crate) meta: CycleMeta,
    pub(crate) buffers: BufferPool,
    pub(crate) uffd: Option<UserFaultFd>,
    pub(crate) term_page: Address,

    // Cycle scalars, fixed during the pauses that define them.
    black_begin: AtomicUsize,
    moving_top_at_pause: AtomicUsize,
    black_end_aligned: AtomicUsize,
    post_compact_end: AtomicUsize,
    moving_first_objs_count: AtomicUsize,
    black_page_count: AtomicUsize,

    pub(crate) mremap_ok: bool,
    pub(crate) cycle_mode: Atomic<CompactorMode>,
    pub(crate) fallback_cycle: AtomicBool,
    pub(crate) compacting: AtomicBool,
    pub(crate) compaction_in_progress: AtomicUsize,
    pub(crate) reclaim: ReclaimState,
}

impl CollectorCore {
    pub(crate) fn new(options: Options) -> std::io::Result<Self> {
        let heap = HeapLayout::new(&options)?;
        let moving_begin = heap.moving.begin();
        let moving_capacity = heap.moving.capacity();
        let moving_pages = moving_capacity >> LOG_BYTES_IN_PAGE;
        let non_moving_pages = heap.nonmoving.capacity() >> LOG_BYTES_IN_PAGE;

        let requested = match *options.mode {
            CompactorMode::Copy => 0,
            CompactorMode::SigBus => crate::uffd::sys::UFFD_FEATURE_SIGBUS,
            CompactorMode::MinorFault => {
                crate::uffd::sys::UFFD_FEATURE_MINOR_SHMEM
                    | crate::uffd::sys::UFFD_FEATURE_MISSING_SHMEM
            }
        };
        let uffd = match UserFaultFd::try_open(requested) {
            Ok(fd) => Some(fd),
            Err(e) => {
                warn!("userfaultfd unavailable ({e}); compaction will fall back to stop-the-world");
                None
            }
        };
        let term_page =
            memory::mmap_anywhere(BYTES_IN_PAGE, MmapProtection::ReadWrite, "uffdc:term-page")?;

        Ok(CollectorCore {
            live_words: LiveWordsBitmap::new(moving_begin, moving_capacity),
            chunk_info: ChunkInfoVec::new(moving_begin, moving_capacity),
            meta: CycleMeta::new(moving_pages, non_moving_pages),
            buffers: BufferPool::new()?,
            uffd,
            term_page,
            black_begin: AtomicUsize::new(0),
            moving_top_at_pause: AtomicUsize::new(0),
            black_end_aligned: AtomicUsize::new(0),
            post_compact_end: AtomicUsize::new(0),
            moving_first_objs_count: AtomicUsize::new(0),
            black_page_count: AtomicUsize::new(0),
            mremap_ok: memory::has_mremap_dontunmap(),
            cycle_mode: Atomic::new(*options.mode),
            fallback_cycle: AtomicBool::new(false),
            compacting: AtomicBool::new(false),
            compaction_in_progress: AtomicUsize::new(0),
            reclaim: ReclaimState {
                last_reclaimed: AtomicUsize::new(0),
                class_after_obj: spin::Mutex::new(std::collections::BTreeMap::new()),
            },
            heap,
            options,
        })
    }

    /* Scalar accessors */

    pub(crate) fn heap(&self) -> &HeapLayout {
        &self.heap
    }

    pub(crate) fn black_begin(&self) -> Address {
        unsafe { Address::from_usize(self.black_begin.load(Ordering::Acquire)) }
    }

    pub(crate) fn set_black_begin(&self, addr: Address) {
        self.black_begin.store(addr.as_usize(), Ordering::Release);
    }

    pub(crate) fn moving_top_at_pause(&self) -> Address {
        unsafe { Address::from_usize(self.moving_top_at_pause.load(Ordering::Acquire)) }
    }

    pub(crate) fn set_moving_top_at_pause(&self, addr: Address) {
        self.moving_top_at_pause
            .store(addr.as_usize(), Ordering::Release);
    }

    pub(crate) fn black_end_aligned(&self) -> Address {
        unsafe { Address::from_usize(self.black_end_aligned.load(Ordering::Acquire)) }
    }

    pub(crate) fn set_black_end_aligned(&self, addr: Address) {
        self.black_end_aligned
            .store(addr.as_usize(), Ordering::Release);
    }

    pub(crate) fn post_compact_end(&self) -> Address {
        unsafe { Address::from_usize(self.post_compact_end.load(Ordering::Acquire)) }
    }

    pub(crate) fn set_post_compact_end(&self, addr: Address) {
        self.post_compact_end
            .store(addr.as_usize(), Ordering::Release);
    }

    pub(crate) fn moving_first_objs_count(&self) -> usize {
        self.moving_first_objs_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_moving_first_objs_count(&self, count: usize) {
        self.moving_first_objs_count.store(count, Ordering::Release);
    }

    pub(crate) fn black_page_count(&self) -> usize {
        self.black_page_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_black_page_count(&self, count: usize) {
        self.black_page_count.store(count, Ordering::Release);
    }

    /// Total destination pages for this cycle.
    pub(crate) fn total_dest_pages(&self) -> usize {
        self.moving_first_objs_count() + self.black_page_count()
    }

    /// The fault-delivery mode actually in effect this cycle, after any
    /// feature downgrade.
    pub(crate) fn effective_mode(&self) -> CompactorMode {
        self.cycle_mode.load(Ordering::Relaxed)
    }

    /// `PostCompact(o) - o` for black objects; zero or negative.
    pub(crate) fn black_slide_diff(&self) -> isize {
        self.post_compact_end().as_usize() as isize - self.black_begin().as_usize() as isize
    }

    /// Reset all per-cycle metadata.  Called at cycle start; storage is
    /// reused, never reallocated.
    pub(crate) fn reset_cycle(&self) {
        self.live_words.clear_all();
        self.chunk_info.clear_all();
        self.meta.reset();
        self.reclaim.class_after_obj.lock().clear();
        self.fallback_cycle.store(false, Ordering::Relaxed);
        self.compacting.store(false, Ordering::Relaxed);
        // Nothing is black until the marking pause pins the boundary.
        self.set_black_begin(self.heap.moving.limit());
    }

    /// Record that `klass` sits above `instance` in the moving space, so the
    /// class's from-space range cannot be reclaimed until the instance has
    /// been compacted.
    pub(crate) fn record_class_after_obj(&self, instance: ObjectReference, klass: ObjectReference) {
        let mut map = self.reclaim.class_after_obj.lock();
        let entry = map
            .entry(klass.to_address())
            .or_insert_with(|| instance.to_address());
        if instance.to_address() < *entry {
            *entry = instance.to_address();
        }
    }

    /* Address translation */

    /// Post-compact address of `o`:
    /// non-moving and immune objects stay; black objects slide by the black
    /// slide diff; pre-mark live objects translate through the chunk-info
    /// vector.  Translating a dead moving-space address is a fatal invariant
    /// violation.
    pub(crate) fn post_compact(&self, o: ObjectReference) -> ObjectReference {
        if o.is_null() {
            return o;
        }
        let a = o.to_address();
        if !self.heap.moving.contains(a) {
            return o;
        }
        if a >= self.black_begin() {
            return ObjectReference::from_address(a + self.black_slide_diff());
        }
        if !self.live_words.test(a) {
            error!(
                "translating dead moving-space address {}\n{}page states: {:?}",
                a,
                self.heap.summary(),
                self.meta.page_states.histogram()
            );
            panic!("post-compact translation of unmarked address {}", a);
        }
        ObjectReference::from_address(self.chunk_info.lookup(
            a,
            &self.live_words,
            self.heap.moving.begin(),
        ))
    }

    /// Rewrite one reference slot in place.
    pub(crate) fn update_ref(&self, slot: Address) {
        let old = ObjectReference::from_address(unsafe {
            Address::from_usize(slot.load::<usize>())
        });
        let new = self.post_compact(old);
        if new != old {
            unsafe { slot.store::<usize>(new.to_address().as_usize()) };
        }
    }

    /// Is this pre-pause moving-space object marked?  Used by reference
    /// processing and weak-table sweeping.
    pub(crate) fn is_live(&self, o: ObjectReference) -> bool {
        let a = o.to_address();
        if self.heap.moving.contains(a) {
            return a >= self.black_begin() || self.heap.moving.mark_bitmap().test(a);
        }
        if self.heap.nonmoving.contains(a) {
            return self.heap.nonmoving.mark_bitmap().test(a);
        }
        // Immune and unknown spaces are not collected.
        true
    }

    /// Size and readable class-metadata address for an object whose bytes
    /// live at `header_from` (the from-space copy during compaction).  The
    /// class word read there is the pre-compact value, so a moving-space
    /// class is itself redirected into from-space: class metadata only
    /// exists there at this point.
    pub(crate) fn from_space_size(&self, header_from: Address) -> (usize, Address) {
        let klass = unsafe { Address::from_usize(header_from.load::<usize>()) };
        debug_assert!(!klass.is_zero(), "null class under from-space walk at {}", header_from);
        let repr = if self.heap.moving.contains(klass) {
            self.heap.moving.to_from_space(klass)
        } else {
            klass
        };
        (object::size_with_repr(header_from, repr), repr)
    }

    /// Visit and rewrite the reference slots of one object.
    pub(crate) fn update_refs_in(
        &self,
        header_from: Address,
        slot_base: Address,
        klass_repr: Address,
        begin_byte: usize,
        end_byte: usize,
    ) {
        object::visit_reference_slots(header_from, slot_base, klass_repr, begin_byte, end_byte, |slot| {
            self.update_ref(slot)
        });
    }

    /// Release a from-space range back to the kernel.  Offsets are
    /// space-relative bytes.
    ///
    /// After a concurrent flip of a memfd-backed space the from-space pages
    /// live in the file's page cache and only a hole punch frees them.  A
    /// fallback cycle copies into the anonymous from-space reservation
    /// instead (the file still backs the live moving space), so it always
    /// takes the madvise path.
    pub(crate) fn free_from_space_range(&self, begin_off: usize, end_off: usize) {
        debug_assert!(conversions::raw_is_aligned(begin_off, BYTES_IN_PAGE));
        if end_off <= begin_off {
            return;
        }
        let len = end_off - begin_off;
        let fallback = self.fallback_cycle.load(Ordering::Relaxed);
        let result = match self.heap.moving.memfd() {
            Some(fd) if !fallback => memory::punch_hole(fd, begin_off, len),
            _ => memory::madvise_dontneed(self.heap.moving.from_space_begin() + begin_off, len),
        };
        if let Err(e) = result {
            panic!("from-space reclaim of [{begin_off:#x}, {end_off:#x}) failed: {e}");
        }
        trace!("reclaimed from-space [{begin_off:#x}, {end_off:#x})");
    }
}
