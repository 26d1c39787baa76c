//! Concurrent compaction: per-page content production (the page compactor
//! and the black-page slider), fault servicing, the worker read loop, and
//! progressive from-space reclaim.

use atomic::Ordering;
use std::sync::atomic::AtomicPtr;
use std::sync::Arc;

use super::core::CollectorCore;
use super::page_state::PageState;
use crate::util::constants::*;
use crate::util::conversions;
use crate::util::memory::{self, MmapProtection};
use crate::util::options::CompactorMode;
use crate::util::Address;

/// A page's strides alternate live/dead, so a 4 KiB page of 8-byte granules
/// can have at most 256 strides, plus one for a leading partial object.
const MAX_STRIDES: usize = GRANULES_IN_PAGE / 2 + 1;

/// Maps byte offsets within a produced page back to the from-space granule
/// they were copied from.  Fixed-size: fault handling must not allocate.
struct StrideMap {
    // (destination granule offset, source granule index)
    entries: [(u16, u32); MAX_STRIDES],
    len: usize,
}

impl StrideMap {
    fn new() -> Self {
        StrideMap {
            entries: [(0, 0); MAX_STRIDES],
            len: 0,
        }
    }

    fn push(&mut self, dest_granule: usize, src_bit: usize) {
        self.entries[self.len] = (dest_granule as u16, src_bit as u32);
        self.len += 1;
    }

    /// From-space granule index for the given destination byte offset.
    fn source_bit_for(&self, byte_off: usize) -> usize {
        let g = byte_off >> LOG_BYTES_IN_GRANULE;
        let mut i = self.len - 1;
        while self.entries[i].0 as usize > g {
            i -= 1;
        }
        let (dest_g, src_bit) = self.entries[i];
        src_bit as usize + (g - dest_g as usize)
    }
}

impl CollectorCore {
    /// Fill `dest` with the post-compact contents of destination page `idx`
    /// (a pre-mark page), then rewrite every reference in the produced
    /// bytes.
    pub(crate) fn compact_page(&self, idx: usize, dest: Address) {
        let moving = &self.heap.moving;
        let space_begin = moving.begin();
        let first_obj = self.meta.first_obj_moving[idx].load(Ordering::Relaxed);
        debug_assert!(!first_obj.is_null(), "pre-mark page {} without a first object", idx);
        let off_bits = self.meta.first_offset_moving[idx].load(Ordering::Relaxed);
        let black_begin = self.black_begin();

        // Replay live strides into the destination buffer.
        let mut strides = StrideMap::new();
        let mut filled = 0usize;
        self.live_words
            .visit_live_strides(off_bits, black_begin, BYTES_IN_PAGE, |bit, granules, _last| {
                let src = moving.to_from_space(self.live_words.addr_of_bit(bit));
                let bytes = granules << LOG_BYTES_IN_GRANULE;
                memory::copy(dest + filled, src, bytes);
                strides.push(filled >> LOG_BYTES_IN_GRANULE, bit);
                filled += bytes;
            });
        debug_assert!(filled > 0);
        if filled < BYTES_IN_PAGE {
            // Only the final destination page is partial; the kernel install
            // copies whole pages, so the tail must be zeroed.
            memory::zero(dest + filled, BYTES_IN_PAGE - filled);
        }

        // The first object may start on the preceding page; update only the
        // slots that landed here.
        let first_from = moving.to_from_space(first_obj.to_address());
        let offset_within_first =
            (off_bits << LOG_BYTES_IN_GRANULE) - (first_obj.to_address() - space_begin);
        let (first_size, first_repr) = self.from_space_size(first_from);
        let slot_base = dest + (-(offset_within_first as isize));
        self.update_refs_in(
            first_from,
            slot_base,
            first_repr,
            offset_within_first,
            std::cmp::min(first_size, offset_within_first + BYTES_IN_PAGE),
        );

        // Subsequent objects are packed back to back.  Sizes come from the
        // from-space copies: class metadata only exists there at this point,
        // and for the object crossing into the next page the buffer holds
        // only a prefix of its words.
        let mut pos = first_size - offset_within_first;
        while pos < filled {
            let src = moving.to_from_space(
                self.live_words
                    .addr_of_bit(strides.source_bit_for(pos)),
            );
            let (size, repr) = self.from_space_size(src);
            let end = std::cmp::min(size, BYTES_IN_PAGE - pos);
            self.update_refs_in(src, dest + pos, repr, 0, end);
            pos += size;
        }
    }

    /// Fill `dest` with the slid contents of black destination page `idx`:
    /// the pre-compact page shifted by the black slide diff, TLAB holes
    /// preserved as zeroes.
    pub(crate) fn slide_black_page(&self, idx: usize, dest: Address) {
        let moving = &self.heap.moving;
        let j = idx - self.moving_first_objs_count();
        let pre_page = self.black_begin() + (j << LOG_BYTES_IN_PAGE);
        let first_obj = self.meta.first_obj_moving[idx].load(Ordering::Relaxed);
        if first_obj.is_null() {
            memory::zero(dest, BYTES_IN_PAGE);
            return;
        }
        let first_chunk = self.meta.first_offset_moving[idx].load(Ordering::Relaxed);
        debug_assert!(first_chunk <= BYTES_IN_PAGE);
        let src_page = moving.to_from_space(pre_page);

        if first_chunk > 0 {
            memory::copy(dest, src_page, first_chunk);
        }
        if first_chunk < BYTES_IN_PAGE {
            memory::zero(dest + first_chunk, BYTES_IN_PAGE - first_chunk);
        }

        // References in the contiguous head, starting from an object that
        // may spill in from the preceding page.
        if first_chunk > 0 {
            debug_assert!(first_obj.to_address() <= pre_page);
            let head_end = pre_page + first_chunk;
            let mut obj = first_obj.to_address();
            while obj < head_end {
                let src = moving.to_from_space(obj);
                let (size, repr) = self.from_space_size(src);
                let begin = if obj < pre_page { pre_page - obj } else { 0 };
                let end = std::cmp::min(size, (pre_page + BYTES_IN_PAGE) - obj);
                let slot_base =
                    dest + (obj.as_usize() as isize - pre_page.as_usize() as isize);
                self.update_refs_in(src, slot_base, repr, begin, end);
                obj = obj + size;
            }
        }

        // Past the first chunk the page is holes and objects; the black
        // objects carry mark bits, so the bitmap finds them.
        moving.mark_bitmap().visit_marked_range(
            pre_page + first_chunk,
            pre_page + BYTES_IN_PAGE,
            |o| {
                let src = moving.to_from_space(o.to_address());
                let (size, repr) = self.from_space_size(src);
                let covered = std::cmp::min(size, (pre_page + BYTES_IN_PAGE) - o.to_address());
                let dest_off = o.to_address() - pre_page;
                memory::copy(dest + dest_off, src, covered);
                self.update_refs_in(src, dest + dest_off, repr, 0, covered);
            },
        );
    }

    /// Produce the contents of destination page `idx` into `dest`.
    pub(crate) fn produce_page(&self, idx: usize, dest: Address) {
        if idx < self.moving_first_objs_count() {
            self.compact_page(idx, dest);
        } else {
            self.slide_black_page(idx, dest);
        }
    }

    /// Install produced content for page `idx` from `buf` via the kernel.
    fn install_copy(&self, idx: usize, buf: Address) {
        let dest = self.heap.moving.begin() + (idx << LOG_BYTES_IN_PAGE);
        let uffd = self.uffd.as_ref().unwrap();
        if let Err(e) = uffd.copy(dest, buf, BYTES_IN_PAGE) {
            panic!("UFFDIO_COPY for page {} failed: {}\n{}", idx, e, self.heap.summary());
        }
    }

    /// Install a minor-fault page: content was produced into the shadow
    /// mapping; CONTINUE maps the backing page into the faulting range.
    fn install_continue(&self, idx: usize) {
        let dest = self.heap.moving.begin() + (idx << LOG_BYTES_IN_PAGE);
        let uffd = self.uffd.as_ref().unwrap();
        if let Err(e) = uffd.continue_mapping(dest, BYTES_IN_PAGE) {
            panic!("UFFDIO_CONTINUE for page {} failed: {}\n{}", idx, e, self.heap.summary());
        }
    }

    /// Process one page as a worker or mutator would after claiming it.
    /// Returns once the page is `ProcessedAndMapped`.
    fn process_claimed_page(&self, idx: usize, buf: Address, claimed: PageState) {
        self.compaction_in_progress.fetch_add(1, Ordering::AcqRel);
        match claimed {
            PageState::Processing => {
                // Minor-fault mode: produce into the shadow page, publish,
                // then claim the install.
                let shadow = self.heap.moving.shadow_begin().unwrap() + (idx << LOG_BYTES_IN_PAGE);
                self.produce_page(idx, shadow);
                self.meta.page_states.publish(idx, PageState::Processed);
                if self
                    .meta
                    .page_states
                    .try_elevate(idx, PageState::Processed, PageState::ProcessedAndMapping)
                {
                    self.install_continue(idx);
                    self.meta.page_states.publish(idx, PageState::ProcessedAndMapped);
                } else {
                    self.meta.page_states.wait_mapped(idx);
                }
            }
            PageState::ProcessingAndMapping | PageState::MutatorProcessing => {
                self.produce_page(idx, buf);
                self.install_copy(idx, buf);
                self.meta.page_states.publish(idx, PageState::ProcessedAndMapped);
            }
            _ => unreachable!("claimed page {} in state {:?}", idx, claimed),
        }
        self.compaction_in_progress.fetch_sub(1, Ordering::AcqRel);
    }

    /// Dispatch one fault.  `mutator` selects the claim state that blocks
    /// from-space reclaim while the faulting thread produces the page.
    pub(crate) fn service_fault(&self, fault_addr: Address, buf: Address, mutator: bool) {
        let moving = &self.heap.moving;
        let page_addr = fault_addr.align_down(BYTES_IN_PAGE);
        let idx = (page_addr - moving.begin()) >> LOG_BYTES_IN_PAGE;
        let total = self.total_dest_pages();
        if idx >= total {
            // Registered range past the last destination page: nothing will
            // ever be copied here, deliver zeroes.  Shmem-backed ranges may
            // lack ZEROPAGE support, in which case a zero page is copied.
            let uffd = self.uffd.as_ref().unwrap();
            if let Err(e) = uffd.zeropage(page_addr, BYTES_IN_PAGE) {
                if e.raw_os_error() == Some(libc::EINVAL) {
                    if let Err(e) = uffd.copy(page_addr, self.buffers.zero_page(), BYTES_IN_PAGE) {
                        panic!("zero-fill install for gap page {} failed: {}", idx, e);
                    }
                } else {
                    panic!("UFFDIO_ZEROPAGE for gap page {} failed: {}", idx, e);
                }
            }
            return;
        }
        let claim = if mutator {
            PageState::MutatorProcessing
        } else if self.effective_mode() == CompactorMode::MinorFault {
            PageState::Processing
        } else {
            PageState::ProcessingAndMapping
        };
        loop {
            match self.meta.page_states.get(idx) {
                PageState::Unprocessed => {
                    if self.meta.page_states.try_claim(idx, claim).is_ok() {
                        self.process_claimed_page(idx, buf, claim);
                        return;
                    }
                }
                PageState::Processed => {
                    if self.meta.page_states.try_elevate(
                        idx,
                        PageState::Processed,
                        PageState::ProcessedAndMapping,
                    ) {
                        self.install_continue(idx);
                        self.meta.page_states.publish(idx, PageState::ProcessedAndMapped);
                        return;
                    }
                }
                PageState::ProcessedAndMapped => {
                    // The fault raced with completion; make sure the faulting
                    // thread is not left sleeping.
                    let uffd = self.uffd.as_ref().unwrap();
                    let _ = uffd.wake(page_addr, BYTES_IN_PAGE);
                    return;
                }
                PageState::Processing
                | PageState::MutatorProcessing
                | PageState::ProcessingAndMapping
                | PageState::ProcessedAndMapping => {
                    if mutator {
                        // Mid-page cancellation is unsupported; wait out the
                        // other processor.
                        self.meta.page_states.wait_mapped(idx);
                        return;
                    }
                    // A worker can leave the page to its current processor:
                    // the install ioctl wakes the faulting thread.
                    return;
                }
            }
        }
    }

    /// The uffd worker read loop (copy and minor-fault modes).
    pub(crate) fn fault_worker_loop(&self, ordinal: usize) {
        let buf = self.buffers.worker_buffer(ordinal);
        let uffd = self.uffd.as_ref().unwrap();
        loop {
            let event = match uffd.read_event() {
                Ok(ev) => ev,
                Err(e) => panic!("uffd read failed in worker {}: {}", ordinal, e),
            };
            if event.address.align_down(BYTES_IN_PAGE) == self.term_page {
                // Shutdown protocol: resolve the fault so the GC thread's
                // read completes, then exit.
                let _ = uffd.zeropage(self.term_page, BYTES_IN_PAGE);
                trace!("worker {} terminating", ordinal);
                return;
            }
            self.service_fault(event.address, buf, false);
        }
    }

    /// The GC thread's page loop: reverse destination order, claiming each
    /// page not already taken by a fault, reclaiming from-space behind
    /// itself.
    pub(crate) fn compact_moving_space(&self) {
        let buf = self.buffers.gc_buffer();
        let total = self.total_dest_pages();
        let minor = self.effective_mode() == CompactorMode::MinorFault;
        let claim = if minor {
            PageState::Processing
        } else {
            PageState::ProcessingAndMapping
        };
        for idx in (0..total).rev() {
            if self.meta.page_states.try_claim(idx, claim).is_ok() {
                self.process_claimed_page(idx, buf, claim);
            }
            self.maybe_reclaim(idx);
        }
        // Wait for mutators and workers still mid-page.
        while self.compaction_in_progress.load(Ordering::Acquire) != 0 {
            std::thread::yield_now();
        }
        for idx in 0..total {
            self.meta.page_states.wait_mapped(idx);
        }
    }

    /* From-space reclaim */

    /// Lowest from-space offset still needed once every destination page at
    /// or above `idx` has been processed.
    fn source_floor(&self, idx: usize) -> Address {
        if idx >= self.moving_first_objs_count() {
            self.black_begin() + ((idx - self.moving_first_objs_count()) << LOG_BYTES_IN_PAGE)
        } else {
            let bit = self.meta.first_offset_moving[idx].load(Ordering::Relaxed);
            self.live_words.addr_of_bit(bit)
        }
    }

    /// Release consumed from-space whenever at least `madvise_threshold`
    /// bytes have accumulated above the current source floor.  Deferred
    /// entirely while any higher page is still being produced (a mutator may
    /// be reading its sources), and bounded below by classes whose
    /// instances are still waiting to be compacted.
    pub(crate) fn maybe_reclaim(&self, idx: usize) {
        let moving = &self.heap.moving;
        // The source floor never lies below the destination page, so this
        // cheap bound skips the page-state scan until a threshold's worth of
        // from-space can possibly have accumulated.
        let upper_estimate = self.reclaim.last_reclaimed.load(Ordering::Relaxed);
        if upper_estimate < (idx << LOG_BYTES_IN_PAGE) + *self.options.madvise_threshold {
            return;
        }
        let total = self.total_dest_pages();
        for i in idx + 1..total {
            if self.meta.page_states.get(i) != PageState::ProcessedAndMapped {
                return;
            }
        }
        let floor_addr = self.source_floor(idx);
        let mut begin_off = conversions::raw_align_up(
            floor_addr - moving.begin(),
            BYTES_IN_PAGE,
        );
        {
            let map = self.reclaim.class_after_obj.lock();
            for (klass, lowest_instance) in map.iter() {
                if *lowest_instance < floor_addr {
                    // An instance below the floor has not been compacted yet;
                    // keep the class's from-space range resident.
                    let klass_from = moving.to_from_space(*klass);
                    let (size, _) = self.from_space_size(klass_from);
                    let keep_end = conversions::raw_align_up(
                        (*klass + size) - moving.begin(),
                        BYTES_IN_PAGE,
                    );
                    begin_off = std::cmp::max(begin_off, keep_end);
                }
            }
        }
        let end_off = self.reclaim.last_reclaimed.load(Ordering::Acquire);
        if end_off > begin_off && end_off - begin_off >= *self.options.madvise_threshold {
            self.free_from_space_range(begin_off, end_off);
            self.reclaim.last_reclaimed.store(begin_off, Ordering::Release);
        }
    }

    /* Flip and teardown */

    /// Move the moving space's pages to the from-space shadow and register
    /// the (now empty) moving space with userfaultfd.  Runs at the end of
    /// the compaction pause; mutators resume into faults.
    pub(crate) fn flip_to_from_space(&self) {
        let moving = &self.heap.moving;
        let used = self.black_end_aligned() - moving.begin();
        self.reclaim
            .last_reclaimed
            .store(used, Ordering::Release);
        if let Err(e) = memory::mremap_dontunmap(moving.begin(), moving.from_space_begin(), used) {
            panic!("moving-space flip failed: {}\n{}", e, self.heap.summary());
        }
        if let Err(e) = memory::mprotect(moving.from_space_begin(), used, MmapProtection::ReadOnly)
        {
            panic!("from-space protection failed: {}", e);
        }
        let uffd = self.uffd.as_ref().unwrap();
        let register = if self.effective_mode() == CompactorMode::MinorFault {
            moving
                .remap_to_back_memfd()
                .expect("remapping the moving space to its shadow backing failed");
            uffd.register_minor(moving.begin(), used)
        } else {
            uffd.register_missing(moving.begin(), used)
        };
        if let Err(e) = register {
            panic!("uffd registration of the moving space failed: {}", e);
        }
        if let Err(e) = uffd.register_missing(self.term_page, BYTES_IN_PAGE) {
            panic!("uffd registration of the termination page failed: {}", e);
        }
        self.compacting.store(true, Ordering::Release);
    }

    /// Stop the workers via the termination page, unregister the moving
    /// space, and drop whatever from-space is still resident.
    pub(crate) fn finish_concurrent_compaction(&self, workers: Vec<std::thread::JoinHandle<()>>) {
        let moving = &self.heap.moving;
        let uffd = self.uffd.as_ref().unwrap();
        let used = self.black_end_aligned() - moving.begin();

        self.compacting.store(false, Ordering::Release);
        for _ in 0..workers.len() {
            // One madvise+read pair wakes exactly one worker: the read
            // faults, a worker resolves it with a zero page and exits.
            memory::madvise_dontneed(self.term_page, BYTES_IN_PAGE).unwrap();
            unsafe { std::ptr::read_volatile(self.term_page.to_ptr::<u8>()) };
        }
        for handle in workers {
            handle.join().expect("uffd worker panicked");
        }
        if let Err(e) = uffd.unregister(moving.begin(), used) {
            panic!("uffd unregistration failed: {}", e);
        }
        let _ = uffd.unregister(self.term_page, BYTES_IN_PAGE);

        // Everything left of the from-space is now consumed.
        let end_off = self.reclaim.last_reclaimed.load(Ordering::Acquire);
        self.free_from_space_range(0, end_off);
        if let Err(e) =
            memory::mprotect(moving.from_space_begin(), used, MmapProtection::ReadWrite)
        {
            panic!("from-space unprotection failed: {}", e);
        }
        if self.effective_mode() == CompactorMode::MinorFault {
            moving.swap_memfds();
        }
    }

    /// The stop-the-world fallback: copy the used range aside, produce every
    /// destination page directly into the moving space, and zero the gap up
    /// to the old top.  Runs entirely inside the compaction pause.
    pub(crate) fn compact_stop_the_world(&self) {
        let moving = &self.heap.moving;
        let used = self.black_end_aligned() - moving.begin();
        memory::copy(moving.from_space_begin(), moving.begin(), used);
        let total = self.total_dest_pages();
        let buf = self.buffers.gc_buffer();
        for idx in (0..total).rev() {
            self.meta
                .page_states
                .try_claim(idx, PageState::ProcessingAndMapping)
                .unwrap();
            let dest = moving.begin() + (idx << LOG_BYTES_IN_PAGE);
            self.produce_page(idx, buf);
            memory::copy(dest, buf, BYTES_IN_PAGE);
            self.meta
                .page_states
                .publish(idx, PageState::ProcessedAndMapped);
        }
        let new_end = moving.begin() + (total << LOG_BYTES_IN_PAGE);
        if used > total << LOG_BYTES_IN_PAGE {
            memory::zero(new_end, used - (total << LOG_BYTES_IN_PAGE));
        }
        self.free_from_space_range(0, used);
    }

    /// Reposition the bump pointer and block list after compaction.
    pub(crate) fn reposition_allocator(&self) {
        let moving = &self.heap.moving;
        let new_top =
            self.post_compact_end() + (self.moving_top_at_pause() - self.black_begin());
        moving.set_block_sizes(new_top - moving.begin());
    }
}

/* SIGBUS delivery */

static SIGBUS_CORE: AtomicPtr<CollectorCore> = AtomicPtr::new(std::ptr::null_mut());
static SIGBUS_INSTALL: std::sync::Once = std::sync::Once::new();

/// Publish the active core for the in-signal fast path.
pub(crate) fn arm_sigbus(core: &Arc<CollectorCore>) {
    SIGBUS_INSTALL.call_once(|| unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = sigbus_handler as usize;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGBUS, &action, std::ptr::null_mut()) != 0 {
            panic!("installing the SIGBUS handler failed: {}", std::io::Error::last_os_error());
        }
    });
    SIGBUS_CORE.store(Arc::as_ptr(core) as *mut CollectorCore, Ordering::Release);
}

pub(crate) fn disarm_sigbus() {
    SIGBUS_CORE.store(std::ptr::null_mut(), Ordering::Release);
}

/// The in-signal fault path: bounded and lock-free apart from the per-page
/// state; no allocation, no heavyweight locks.
extern "C" fn sigbus_handler(
    _sig: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    let core_ptr = SIGBUS_CORE.load(Ordering::Acquire);
    let fault_addr = unsafe { Address::from_usize((*info).si_addr() as usize) };
    if !core_ptr.is_null() {
        let core = unsafe { &*core_ptr };
        if core.compacting.load(Ordering::Acquire) && core.heap.moving.contains(fault_addr) {
            let (slot, buf) = core.buffers.acquire_mutator();
            core.service_fault(fault_addr, buf, true);
            core.buffers.release_mutator(slot);
            return;
        }
    }
    // Not a compaction fault: restore the default disposition and re-raise.
    unsafe {
        let mut dfl: libc::sigaction = std::mem::zeroed();
        dfl.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(libc::SIGBUS, &dfl, std::ptr::null_mut());
        libc::raise(libc::SIGBUS);
    }
}

/// Spawn the uffd workers for this cycle (copy and minor-fault modes).
pub(crate) fn spawn_workers(core: &Arc<CollectorCore>) -> Vec<std::thread::JoinHandle<()>> {
    let n = *core.options.parallel_workers;
    (0..n)
        .map(|ordinal| {
            let core = core.clone();
            std::thread::Builder::new()
                .name(format!("uffd-worker-{}", ordinal))
                .spawn(move || core.fault_worker_loop(ordinal))
                .expect("spawning a uffd worker failed")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::test_util::{bootstrap_classes, mark_moving, small_core};
    use crate::object;

    #[test]
    fn test_stride_map_lookup() {
        let mut map = StrideMap::new();
        map.push(0, 100); // dest granules 0.. from source bit 100
        map.push(5, 300); // dest granules 5.. from source bit 300
        assert_eq!(map.source_bit_for(0), 100);
        assert_eq!(map.source_bit_for(4 * BYTES_IN_GRANULE), 104);
        assert_eq!(map.source_bit_for(5 * BYTES_IN_GRANULE), 300);
        assert_eq!(map.source_bit_for(9 * BYTES_IN_GRANULE), 304);
    }

    #[test]
    fn test_compact_page_packs_and_rewrites_references() {
        let core = small_core();
        let classes = bootstrap_classes(&core);
        let moving = &core.heap().moving;
        let s = moving.begin();

        let a = object::format_instance(moving.alloc(24).unwrap(), classes.node);
        moving.alloc(40).unwrap(); // dies unmarked
        let c = object::format_instance(moving.alloc(24).unwrap(), classes.node);
        assert_eq!(c.to_address(), s + 64usize);
        object::write_ref_field(a, 1, c);
        object::write_ref_field(c, 1, a);

        mark_moving(&core, a);
        mark_moving(&core, c);
        let black = moving.align_end();
        core.set_black_begin(black);
        core.set_moving_top_at_pause(moving.top());
        core.prepare_for_compaction();

        memory::copy(moving.from_space_begin(), s, black - s);
        let buf = memory::mmap_anywhere(BYTES_IN_PAGE, MmapProtection::ReadWrite, "uffdc:test")
            .unwrap();
        core.compact_page(0, buf);

        unsafe {
            // a lands at offset 0, its reference field now points at c's
            // post-compact address.
            assert_eq!(buf.load::<usize>(), classes.node.to_address().as_usize());
            assert_eq!((buf + 8usize).load::<usize>(), (s + 24usize).as_usize());
            // c packs right behind a.
            assert_eq!(
                (buf + 24usize).load::<usize>(),
                classes.node.to_address().as_usize()
            );
            assert_eq!((buf + 32usize).load::<usize>(), s.as_usize());
            // Tail of the page is zeroed.
            assert_eq!((buf + 48usize).load::<usize>(), 0);
        }
    }

    #[test]
    fn test_slide_black_page_preserves_layout() {
        let core = small_core();
        let classes = bootstrap_classes(&core);
        let moving = &core.heap().moving;
        let s = moving.begin();

        // Two pages of mostly dead pre-mark data with one 24-byte survivor.
        moving.alloc(2 * BYTES_IN_PAGE).unwrap();
        let a = object::format_instance(s + 64usize, classes.node);
        mark_moving(&core, a);
        let black = moving.align_end();
        assert_eq!(black, s + 2 * BYTES_IN_PAGE);
        core.set_black_begin(black);

        // One black object whose field references the survivor.
        let g = object::format_instance(moving.alloc(24).unwrap(), classes.node);
        assert_eq!(g.to_address(), black);
        object::write_ref_field(g, 1, a);

        core.set_moving_top_at_pause(moving.top());
        core.prepare_for_compaction();
        core.update_moving_space_black_allocations();

        assert_eq!(core.moving_first_objs_count(), 1);
        assert_eq!(core.black_page_count(), 1);
        assert_eq!(core.black_slide_diff(), -(BYTES_IN_PAGE as isize));
        assert_eq!(
            core.post_compact(g).to_address(),
            s + BYTES_IN_PAGE,
            "black objects slide by the black slide diff"
        );

        memory::copy(moving.from_space_begin(), s, 3 * BYTES_IN_PAGE);
        let buf = memory::mmap_anywhere(BYTES_IN_PAGE, MmapProtection::ReadWrite, "uffdc:test")
            .unwrap();
        core.slide_black_page(1, buf);

        unsafe {
            assert_eq!(buf.load::<usize>(), classes.node.to_address().as_usize());
            // The field now holds the survivor's packed address.
            assert_eq!((buf + 8usize).load::<usize>(), s.as_usize());
            // The rest of the slid page is zero.
            assert_eq!((buf + 24usize).load::<usize>(), 0);
        }
    }
}
