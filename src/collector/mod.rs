//! The concurrent mark-compact collector.
//!
//! A cycle runs: concurrent marking with a stop-the-world finish, weak
//! reference processing, concurrent compaction layout planning, a brief
//! compaction pause that updates roots and flips the moving space into its
//! userfaultfd-backed from-space shadow, and finally concurrent page-by-page
//! compaction with progressive from-space reclaim.

pub mod chunk_info;
pub(crate) mod compact;
pub(crate) mod core;
pub(crate) mod layout;
pub mod live_words;
pub(crate) mod marker;
pub mod page_state;
#[cfg(test)]
pub(crate) mod test_util;

use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use self::core::CollectorCore;
use crate::heap::{HeapLayout, ImmuneSpace};
use crate::object;
use crate::runtime::thread::MutatorThread;
use crate::runtime::{NoRuntimeCallbacks, ReferenceProcessor, RuntimeCallbacks, ThreadRegistry};
use crate::uffd::sys;
use crate::util::constants::*;
use crate::util::options::{CompactorMode, Options};
use crate::util::{logger, Address, ObjectReference};

/// Default TLAB size handed to mutators.
pub const TLAB_BYTES: usize = 4 * BYTES_IN_PAGE;

pub struct MarkCompact<C: RuntimeCallbacks = NoRuntimeCallbacks> {
    pub(crate) core: Arc<CollectorCore>,
    pub(crate) threads: ThreadRegistry,
    pub(crate) refs: ReferenceProcessor,
    pub(crate) callbacks: C,
    pub(crate) mark_stack: SegQueue<ObjectReference>,
    cycles: AtomicUsize,
}

impl MarkCompact<NoRuntimeCallbacks> {
    /// A collector with no runtime attached; all roots come from mutator
    /// threads.
    pub fn with_options(options: Options) -> std::io::Result<Self> {
        Self::new(options, NoRuntimeCallbacks)
    }
}

impl<C: RuntimeCallbacks> MarkCompact<C> {
    pub fn new(options: Options, callbacks: C) -> std::io::Result<Self> {
        logger::try_init();
        let core = Arc::new(CollectorCore::new(options)?);
        info!(
            "collector ready: moving space [{}, {}), mode {:?}",
            core.heap().moving.begin(),
            core.heap().moving.limit(),
            *core.options.mode
        );
        Ok(MarkCompact {
            core,
            threads: ThreadRegistry::default(),
            refs: ReferenceProcessor::default(),
            callbacks,
            mark_stack: SegQueue::new(),
            cycles: AtomicUsize::new(0),
        })
    }

    pub fn heap(&self) -> &HeapLayout {
        self.core.heap()
    }

    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    pub fn reference_processor(&self) -> &ReferenceProcessor {
        &self.refs
    }

    pub fn callbacks(&self) -> &C {
        &self.callbacks
    }

    /// Completed GC cycles.
    pub fn cycle_count(&self) -> usize {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Where pre-mark survivors of the last cycle end.
    pub fn post_compact_end(&self) -> Address {
        self.core.post_compact_end()
    }

    /// Did the last cycle run the stop-the-world fallback?
    pub fn last_cycle_was_fallback(&self) -> bool {
        self.core.fallback_cycle.load(Ordering::Relaxed)
    }

    /* Allocation interface for the embedding runtime */

    pub fn attach_thread(&self) -> Arc<MutatorThread> {
        self.threads.attach()
    }

    pub fn add_immune_space(&self, name: &'static str, capacity: usize) -> std::io::Result<usize> {
        Ok(self.heap().add_immune(ImmuneSpace::new(name, capacity)?))
    }

    /// TLAB allocation from the moving space.
    pub fn alloc_moving(&self, thread: &MutatorThread, size: usize) -> Option<Address> {
        if let Some(addr) = thread.alloc_in_tlab(size) {
            return Some(addr);
        }
        if size >= TLAB_BYTES {
            return self.heap().moving.alloc(size);
        }
        thread.revoke_tlab();
        let (begin, end) = self.heap().moving.carve_tlab(TLAB_BYTES)?;
        thread.set_tlab(begin, end);
        thread.alloc_in_tlab(size)
    }

    /// Shared-block allocation from the moving space.
    pub fn alloc_moving_shared(&self, size: usize) -> Option<Address> {
        self.heap().moving.alloc(size)
    }

    pub fn alloc_non_moving(&self, size: usize) -> Option<Address> {
        self.heap().nonmoving.alloc(size)
    }

    /// Publish a freshly formatted non-moving object.
    pub fn publish_non_moving(&self, object: ObjectReference) {
        self.heap().nonmoving.publish(object);
    }

    pub fn alloc_immune(&self, idx: usize, size: usize) -> Option<Address> {
        self.heap().with_immune(idx, |s| s.alloc(size))
    }

    pub fn publish_immune(&self, idx: usize, object: ObjectReference) {
        self.heap().with_immune(idx, |s| s.publish(object));
    }

    /// Reference-field store with the card-marking write barrier.
    pub fn write_ref(&self, holder: ObjectReference, word: usize, value: ObjectReference) {
        object::write_ref_field(holder, word, value);
        self.heap().dirty_card(holder.to_address());
    }

    /// Is this object live under the current cycle's marking?
    pub fn is_marked(&self, o: ObjectReference) -> bool {
        self.core.is_live(o)
    }

    /* The cycle */

    /// Run one full collection cycle.  No errors propagate: the cycle either
    /// completes or the process aborts.
    pub fn run_phases(&self) {
        let cycle = self.cycles.load(Ordering::Relaxed) + 1;
        info!("GC cycle {} begin", cycle);
        self.core.reset_cycle();

        self.bind_and_reset_bitmaps();
        self.mark_concurrent();
        self.marking_pause();

        // Weak processing and cache sweeps run concurrently with mutators.
        let cleared = self.refs.process_references(|o| self.core.is_live(o));
        trace!("cleared {} dead weak referents", cleared);
        self.callbacks
            .update_weak_tables(&mut |o| self.core.is_live(o).then_some(o));
        self.callbacks.sweep_caches();

        self.core.prepare_for_compaction();

        let fallback = self.resolve_cycle_mode();
        self.compaction_pause(fallback);

        if !fallback {
            let mode = self.core.effective_mode();
            let workers = if mode == CompactorMode::SigBus {
                compact::arm_sigbus(&self.core);
                vec![]
            } else {
                compact::spawn_workers(&self.core)
            };
            self.core.compact_moving_space();
            self.core.finish_concurrent_compaction(workers);
            if mode == CompactorMode::SigBus {
                compact::disarm_sigbus();
            }
            self.core.reposition_allocator();
            self.heap().moving.open_alloc_gate();
        }

        self.finish_cycle();
        self.cycles.fetch_add(1, Ordering::Relaxed);
        info!(
            "GC cycle {} end: post-compact end {}, {} black pages",
            cycle,
            self.core.post_compact_end(),
            self.core.black_page_count()
        );
    }

    /// Pick between concurrent compaction and the stop-the-world fallback,
    /// and resolve any feature downgrade for the cycle.
    fn resolve_cycle_mode(&self) -> bool {
        let core = &self.core;
        if *core.options.fallback_stw {
            info!("forced stop-the-world fallback");
            core.fallback_cycle.store(true, Ordering::Relaxed);
            return true;
        }
        let Some(uffd) = core.uffd.as_ref() else {
            core.fallback_cycle.store(true, Ordering::Relaxed);
            return true;
        };
        if !core.mremap_ok {
            warn!("kernel lacks MREMAP_DONTUNMAP; using stop-the-world fallback");
            core.fallback_cycle.store(true, Ordering::Relaxed);
            return true;
        }
        let mut mode = *core.options.mode;
        match mode {
            CompactorMode::SigBus if !uffd.supports(sys::UFFD_FEATURE_SIGBUS) => {
                warn!("kernel lacks UFFD_FEATURE_SIGBUS; downgrading to copy mode");
                mode = CompactorMode::Copy;
            }
            CompactorMode::MinorFault
                if !uffd.supports(sys::UFFD_FEATURE_MINOR_SHMEM)
                    || core.heap().moving.shadow_begin().is_none() =>
            {
                warn!("minor-fault mode unavailable; downgrading to copy mode for this cycle");
                mode = CompactorMode::Copy;
            }
            _ => {}
        }
        core.cycle_mode.store(mode, Ordering::Relaxed);
        false
    }

    /// The compaction pause: fix the black region, update every root and
    /// every in-place space, then either flip to concurrent compaction or
    /// compact outright.
    fn compaction_pause(&self, fallback: bool) {
        let _stw = self.threads.stop_the_world();
        let core = &self.core;
        let moving = &self.heap().moving;

        // TLABs grown since the marking pause end the black region here.
        self.threads.for_each(|t| {
            t.revoke_tlab();
        });
        core.set_moving_top_at_pause(moving.top());
        core.update_moving_space_black_allocations();
        core.update_non_moving_space_black_allocations();
        // Unmarked non-moving objects die now that black allocations carry
        // mark bits.
        self.heap().nonmoving.sweep();

        // Roots: no root may hold a from-space address once mutators resume.
        self.threads.for_each(|t| {
            t.visit_roots(|slot| core.update_ref(slot));
        });
        self.callbacks
            .visit_global_roots(&mut |slot| core.update_ref(slot));
        self.refs.update_roots(|o| core.post_compact(o));
        self.callbacks
            .update_weak_tables(&mut |o| Some(core.post_compact(o)));
        self.update_non_moving_space();
        self.update_immune_spaces();

        if fallback {
            core.compact_stop_the_world();
            core.reposition_allocator();
        } else {
            moving.close_alloc_gate();
            core.flip_to_from_space();
        }
    }

    /// Rewrite references held by non-moving objects, page by page, using
    /// the planner's first-object array.  Pages with no marked object are
    /// skipped.
    fn update_non_moving_space(&self) {
        let core = &self.core;
        let nm = &self.heap().nonmoving;
        let begin = nm.begin();
        let top = nm.top();
        let npages = (crate::util::conversions::page_align_up(top) - begin) >> LOG_BYTES_IN_PAGE;
        for p in 0..npages {
            let first = core.meta.first_obj_non_moving[p].load(Ordering::Relaxed);
            if first.is_null() {
                continue;
            }
            let page_begin = begin + (p << LOG_BYTES_IN_PAGE);
            let page_end = page_begin + BYTES_IN_PAGE;
            // Objects overlapping from a previous page were fully updated
            // there; start at the first object in this page.
            let start = if first.to_address() < page_begin {
                match nm.mark_bitmap().find_first_in(page_begin, page_end) {
                    Some(o) => o,
                    None => continue,
                }
            } else {
                first
            };
            nm.mark_bitmap()
                .visit_marked_range(start.to_address(), page_end, |o| {
                    let repr = object::class_of(o).to_address();
                    let size = object::size_with_repr(o.to_address(), repr);
                    core.update_refs_in(o.to_address(), o.to_address(), repr, 0, size);
                });
        }
    }

    /// Rewrite references held by immune-space objects, card by card from
    /// the mod-union table.  The write barrier dirties the card of an
    /// object's header, so visiting objects that start in each card updates
    /// every recorded object exactly once.
    fn update_immune_spaces(&self) {
        let core = &self.core;
        self.heap().immune_each(|space| {
            space.fold_cards_into_mod_union();
            space.visit_mod_union(|card_begin, card_end| {
                space
                    .live_bitmap()
                    .visit_marked_range(card_begin, card_end, |o| {
                        let repr = object::class_of(o).to_address();
                        let size = object::size_with_repr(o.to_address(), repr);
                        core.update_refs_in(o.to_address(), o.to_address(), repr, 0, size);
                    });
            });
        });
    }

    fn finish_cycle(&self) {
        self.refs.release();
        self.heap().moving.cards().clear_all();
        self.heap().nonmoving.cards().clear_all();
    }
}
