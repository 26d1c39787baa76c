//! The weak-reference processor.
//!
//! During concurrent marking the tracer does not trace through referent
//! fields; it discovers `Reference` objects here instead.  After marking,
//! referents that did not survive are cleared.  During the compaction pause
//! the processor's own roots (the discovered list and the surviving referent
//! slots) are rewritten with post-compact addresses.
//!
//! The internal lock is a spin mutex so discovery can run from checkpoint
//! context without blocking on a parked holder.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::object;
use crate::util::ObjectReference;

pub struct ReferenceProcessor {
    // While set, newly discovered references are queued rather than traced
    // through; enabled from the marking pause until references are processed.
    slow_path: AtomicBool,
    discovered: spin::Mutex<Vec<ObjectReference>>,
}

impl Default for ReferenceProcessor {
    fn default() -> Self {
        ReferenceProcessor {
            slow_path: AtomicBool::new(false),
            discovered: spin::Mutex::new(vec![]),
        }
    }
}

impl ReferenceProcessor {
    pub fn enable_slow_path(&self) {
        self.slow_path.store(true, Ordering::Release);
    }

    pub fn disable_slow_path(&self) {
        self.slow_path.store(false, Ordering::Release);
    }

    pub fn slow_path_enabled(&self) -> bool {
        self.slow_path.load(Ordering::Acquire)
    }

    /// Queue a `Reference` object whose referent is not yet known to be live.
    pub fn delay_reference_referent(&self, reference: ObjectReference) {
        debug_assert_eq!(object::kind_of(reference), object::ObjectKind::Reference);
        self.discovered.lock().push(reference);
    }

    pub fn discovered_count(&self) -> usize {
        self.discovered.lock().len()
    }

    /// Process discovered references: clear referents that did not survive
    /// marking.  Keeps the list for root updating during compaction.
    pub fn process_references(&self, is_live: impl Fn(ObjectReference) -> bool) -> usize {
        let discovered = self.discovered.lock();
        let mut cleared = 0;
        for reference in discovered.iter() {
            let referent = object::read_ref_field(*reference, object::REFERENT_WORD);
            if !referent.is_null() && !is_live(referent) {
                object::write_ref_field(*reference, object::REFERENT_WORD, ObjectReference::NULL);
                cleared += 1;
            }
        }
        cleared
    }

    /// Rewrite the processor's roots (the discovered list entries) with their
    /// post-compact addresses.  The referent slots themselves are ordinary
    /// reference fields and are rewritten when their containing page is
    /// compacted.
    pub fn update_roots(&self, forward: impl Fn(ObjectReference) -> ObjectReference) {
        let mut discovered = self.discovered.lock();
        for reference in discovered.iter_mut() {
            *reference = forward(*reference);
        }
    }

    /// Drop the cycle's discovered list.
    pub fn release(&self) {
        self.discovered.lock().clear();
        self.disable_slow_path();
    }
}
