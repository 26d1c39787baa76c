//! Tri-color concurrent marking with a stop-the-world finish.
//!
//! Newly marked moving-space objects also feed the live-words bitmap and the
//! chunk-info vector; this is the only step that populates them.

use std::sync::atomic::Ordering;

use super::MarkCompact;
use crate::heap::card_table::{CARD_AGED, CARD_DIRTY};
use crate::heap::SpaceKind;
use crate::object::{self, ObjectKind};
use crate::runtime::RuntimeCallbacks;
use crate::util::constants::*;
use crate::util::{Address, ObjectReference};

/// Roots found during a checkpoint are batched thread-locally and flushed to
/// the shared mark stack in chunks.
const ROOT_BUFFER_FLUSH: usize = 128;

impl<C: RuntimeCallbacks> MarkCompact<C> {
    /// Classify spaces and reset per-cycle marking state: clear the moving
    /// and non-moving mark bitmaps, the immune scan bitmaps, and the cards
    /// of the collected spaces; fold immune cards into their mod-union
    /// tables.
    pub(crate) fn bind_and_reset_bitmaps(&self) {
        let heap = self.heap();
        heap.moving.mark_bitmap().clear_all();
        heap.nonmoving.mark_bitmap().clear_all();
        heap.moving.cards().clear_all();
        heap.nonmoving.cards().clear_all();
        heap.immune_each(|space| {
            space.mark_bitmap().clear_all();
            space.fold_cards_into_mod_union();
        });
    }

    /// Concurrent marking: thread-root checkpoints, non-thread roots, the
    /// immune mod-union scan, a fixpoint, then card pre-cleaning.
    pub(crate) fn mark_concurrent(&self) {
        // Each thread visits its own roots, batching into a local buffer
        // whose flush marks and feeds the shared mark stack.
        let visited = self.threads.run_checkpoint(|t| {
            let mut buffer: Vec<ObjectReference> = Vec::with_capacity(ROOT_BUFFER_FLUSH);
            t.visit_roots(|slot| {
                let target = read_slot(slot);
                if !target.is_null() {
                    buffer.push(target);
                    if buffer.len() == ROOT_BUFFER_FLUSH {
                        for o in buffer.drain(..) {
                            self.mark_object(o);
                        }
                    }
                }
            });
            for o in buffer {
                self.mark_object(o);
            }
        });
        trace!("root checkpoint visited {} threads", visited);
        self.mark_non_thread_roots();
        self.scan_immune_mod_unions();
        self.process_mark_stack();
        self.pre_clean_cards();
    }

    /// Non-thread roots: class tables, interned strings, monitor lists —
    /// whatever the runtime registered.
    pub(crate) fn mark_non_thread_roots(&self) {
        self.callbacks.visit_global_roots(&mut |slot| {
            self.mark_object(read_slot(slot));
        });
    }

    /// Scan every immune object whose card ever went dirty; their references
    /// into the collected spaces are marking roots.
    fn scan_immune_mod_unions(&self) {
        self.heap().immune_each(|space| {
            space.fold_cards_into_mod_union();
            space.visit_mod_union(|card_begin, card_end| {
                space
                    .live_bitmap()
                    .visit_marked_range(card_begin, card_end, |o| {
                        self.scan_object_fields(o);
                    });
            });
        });
    }

    /// Age the collected spaces' dirty cards and rescan what was found; only
    /// cards dirtied after this are left for the marking pause.
    pub(crate) fn pre_clean_cards(&self) {
        let heap = self.heap();
        let aged = heap.moving.cards().age_all() + heap.nonmoving.cards().age_all();
        trace!("pre-cleaning {} cards", aged);
        self.rescan_cards(CARD_AGED);
        self.process_mark_stack();
    }

    /// Rescan non-clean cards at or above `threshold` in the collected
    /// spaces, re-tracing the marked objects that start on them.
    fn rescan_cards(&self, threshold: u8) {
        let heap = self.heap();
        for (cards, bitmap, end) in [
            (
                heap.moving.cards(),
                heap.moving.mark_bitmap(),
                heap.moving.top(),
            ),
            (
                heap.nonmoving.cards(),
                heap.nonmoving.mark_bitmap(),
                heap.nonmoving.top(),
            ),
        ] {
            cards.scan_cards(threshold, true, |card_begin, card_end| {
                let card_end = std::cmp::min(card_end, end);
                if card_begin >= card_end {
                    return;
                }
                bitmap.visit_marked_range(card_begin, card_end, |o| {
                    self.scan_object_fields(o);
                });
            });
        }
    }

    /// The marking pause.  TLABs are revoked first, fixing the
    /// black-allocations boundary; then roots are re-marked, dirty cards
    /// rescanned, allocation stacks swapped, the reference slow path
    /// enabled, and the mark stack drained to fixpoint.
    pub(crate) fn marking_pause(&self) {
        let _stw = self.threads.stop_the_world();
        let heap = self.heap();

        self.threads.for_each(|t| {
            t.revoke_tlab();
        });
        let black_begin = heap.moving.align_end();
        self.core.set_black_begin(black_begin);
        debug!("marking pause: black allocations begin at {}", black_begin);

        self.threads.for_each(|t| {
            t.visit_roots(|slot| self.mark_object(read_slot(slot)));
        });
        self.mark_non_thread_roots();
        self.rescan_cards(CARD_DIRTY);
        // Immune cards dirtied since the concurrent scan hold the last
        // unmarked reachable objects.
        self.scan_immune_mod_unions();

        // Swap stacks: everything the non-moving space allocated during
        // marking is live this cycle and gets traced.
        for o in heap.nonmoving.swap_alloc_stack() {
            self.mark_object(o);
        }

        self.refs.enable_slow_path();
        self.process_mark_stack();
    }

    /// Drain the mark stack to fixpoint.
    pub(crate) fn process_mark_stack(&self) {
        while let Some(o) = self.mark_stack.pop() {
            self.scan_object_fields(o);
        }
    }

    /// Mark one object, feeding the liveness structures on the first mark of
    /// a moving-space object.  Double marks are detected on the bitmap and
    /// suppressed.
    pub(crate) fn mark_object(&self, o: ObjectReference) {
        if o.is_null() {
            return;
        }
        let heap = self.heap();
        let a = o.to_address();
        match heap.classify(a) {
            SpaceKind::Moving => {
                if heap.moving.mark_bitmap().test_and_set(a) {
                    self.update_liveness_info(o);
                    self.mark_stack.push(o);
                }
            }
            SpaceKind::NonMoving => {
                if heap.nonmoving.mark_bitmap().test_and_set(a) {
                    self.mark_stack.push(o);
                }
            }
            SpaceKind::Immune(i) => {
                let newly = heap.with_immune(i, |s| s.mark_bitmap().test_and_set(a));
                if newly {
                    self.mark_stack.push(o);
                }
            }
            // Runtime-internal ranges the collector does not manage.
            SpaceKind::Unknown => {}
        }
    }

    /// Record a newly marked moving-space object in the live-words bitmap
    /// and the chunk-info vector, and note classes that sit above their
    /// instances for from-space reclaim.
    fn update_liveness_info(&self, o: ObjectReference) {
        let size = object::size_of(o);
        let a = o.to_address();
        self.core.live_words.set_range(a, size);
        self.core.chunk_info.add(a, size);
        let klass = object::class_of(o);
        if self.heap().moving.contains(klass.to_address()) && klass.to_address() > a {
            self.core.record_class_after_obj(o, klass);
        }
    }

    /// Trace through one object's fields.  Weak references do not trace
    /// their referent; they are queued for the reference processor.
    pub(crate) fn scan_object_fields(&self, o: ObjectReference) {
        let repr = object::class_of(o).to_address();
        debug_assert!(!repr.is_zero(), "scanning an unformatted object at {}", o);
        let kind = object::kind_from_repr(repr);
        let referent_offset = object::REFERENT_WORD << LOG_BYTES_IN_WORD;
        object::visit_reference_slots(
            o.to_address(),
            o.to_address(),
            repr,
            0,
            usize::MAX,
            |slot| {
                if kind == ObjectKind::Reference && slot - o.to_address() == referent_offset {
                    return;
                }
                self.mark_object(read_slot(slot));
            },
        );
        if kind == ObjectKind::Reference {
            let referent = object::read_ref_field(o, object::REFERENT_WORD);
            if !referent.is_null() && !self.core.is_live(referent) {
                self.refs.delay_reference_referent(o);
            } else {
                self.mark_object(referent);
            }
        }
    }
}

/// Read a reference slot.
fn read_slot(slot: Address) -> ObjectReference {
    ObjectReference::from_address(unsafe {
        Address::from_usize(slot.atomic_load::<std::sync::atomic::AtomicUsize>(Ordering::Acquire))
    })
}
