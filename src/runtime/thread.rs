//! Mutator threads and the suspend/checkpoint abstraction.
//!
//! A global mutator lock orders heap traversal against the two collector
//! pauses: mutators and checkpoints take it shared, the marking pause and the
//! compaction pause take it exclusive, so every mutator is at a safepoint for
//! the duration of a pause.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::util::constants::*;
use crate::util::Address;

/// A thread-local allocation buffer: a sub-range of the moving space owned by
/// one mutator.
#[derive(Copy, Clone, Debug)]
pub struct Tlab {
    pub begin: Address,
    pub pos: Address,
    pub end: Address,
}

impl Tlab {
    pub const EMPTY: Tlab = Tlab {
        begin: Address::ZERO,
        pos: Address::ZERO,
        end: Address::ZERO,
    };

    pub fn is_empty(&self) -> bool {
        self.begin.is_zero()
    }
}

/// The collector-facing face of a mutator thread: its roots, its TLAB, and
/// nothing else.
pub struct MutatorThread {
    id: usize,
    tlab: Mutex<Tlab>,
    // Addresses of reference cells this thread treats as roots (stack slots,
    // handles).  The pause rewrites these in place.
    roots: Mutex<Vec<Address>>,
}

impl MutatorThread {
    fn new(id: usize) -> Self {
        MutatorThread {
            id,
            tlab: Mutex::new(Tlab::EMPTY),
            roots: Mutex::new(vec![]),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Register a root slot. The slot must stay valid until deregistered.
    pub fn add_root(&self, slot: Address) {
        self.roots.lock().unwrap().push(slot);
    }

    pub fn clear_roots(&self) {
        self.roots.lock().unwrap().clear();
    }

    /// Visit the thread's root slots.
    pub fn visit_roots(&self, mut f: impl FnMut(Address)) {
        for slot in self.roots.lock().unwrap().iter() {
            f(*slot);
        }
    }

    /// Allocate from the TLAB; the caller refills on None.
    pub fn alloc_in_tlab(&self, size: usize) -> Option<Address> {
        debug_assert!(size % BYTES_IN_GRANULE == 0);
        let mut tlab = self.tlab.lock().unwrap();
        if tlab.is_empty() || tlab.pos + size > tlab.end {
            return None;
        }
        let result = tlab.pos;
        tlab.pos = tlab.pos + size;
        Some(result)
    }

    pub fn set_tlab(&self, begin: Address, end: Address) {
        *self.tlab.lock().unwrap() = Tlab {
            begin,
            pos: begin,
            end,
        };
    }

    /// Give up the TLAB, returning it.  The unused tail `[pos, end)` becomes
    /// a hole that the black-page slider preserves.
    pub fn revoke_tlab(&self) -> Tlab {
        std::mem::replace(&mut *self.tlab.lock().unwrap(), Tlab::EMPTY)
    }
}

/// A guard holding every mutator at a safepoint.
pub struct StopTheWorldScope<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

/// A guard for shared heap traversal (checkpoints, mutator heap access).
pub struct SharedMutatorScope<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

pub struct ThreadRegistry {
    threads: Mutex<Vec<Arc<MutatorThread>>>,
    next_id: AtomicUsize,
    mutator_lock: RwLock<()>,
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        ThreadRegistry {
            threads: Mutex::new(vec![]),
            next_id: AtomicUsize::new(0),
            mutator_lock: RwLock::new(()),
        }
    }
}

impl ThreadRegistry {
    /// Attach a mutator thread.
    pub fn attach(&self) -> Arc<MutatorThread> {
        let thread = Arc::new(MutatorThread::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
        ));
        self.threads.lock().unwrap().push(thread.clone());
        thread
    }

    pub fn detach(&self, thread: &Arc<MutatorThread>) {
        self.threads
            .lock()
            .unwrap()
            .retain(|t| t.id() != thread.id());
    }

    /// Run a closure against every attached thread under the shared mutator
    /// lock, standing in for a per-thread safepoint checkpoint.  Returns the
    /// number of threads visited.
    pub fn run_checkpoint(&self, mut f: impl FnMut(&MutatorThread)) -> usize {
        let _shared = self.mutator_lock.read().unwrap();
        let threads = self.threads.lock().unwrap();
        for t in threads.iter() {
            f(t);
        }
        threads.len()
    }

    /// Acquire the mutator lock exclusively: every mutator is suspended until
    /// the guard drops.
    pub fn stop_the_world(&self) -> StopTheWorldScope<'_> {
        StopTheWorldScope {
            _guard: self.mutator_lock.write().unwrap(),
        }
    }

    /// Shared heap access for a mutator.
    pub fn shared(&self) -> SharedMutatorScope<'_> {
        SharedMutatorScope {
            _guard: self.mutator_lock.read().unwrap(),
        }
    }

    /// Visit every attached thread.  Only safe with respect to thread
    /// attach/detach, not with respect to the threads' own mutation; pauses
    /// use it while holding the world stopped.
    pub fn for_each(&self, mut f: impl FnMut(&MutatorThread)) {
        for t in self.threads.lock().unwrap().iter() {
            f(t);
        }
    }

    pub fn count(&self) -> usize {
        self.threads.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ObjectReference;

    #[test]
    fn test_checkpoint_counts_threads() {
        let registry = ThreadRegistry::default();
        let t1 = registry.attach();
        let _t2 = registry.attach();
        let mut visited = 0;
        assert_eq!(registry.run_checkpoint(|_| visited += 1), 2);
        assert_eq!(visited, 2);
        registry.detach(&t1);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_tlab_alloc_and_revoke() {
        let registry = ThreadRegistry::default();
        let t = registry.attach();
        let begin = unsafe { Address::from_usize(0x4000_0000) };
        t.set_tlab(begin, begin + 64usize);
        assert_eq!(t.alloc_in_tlab(40), Some(begin));
        assert_eq!(t.alloc_in_tlab(40), None, "exhausted TLAB must refuse");
        let tlab = t.revoke_tlab();
        assert_eq!(tlab.pos, begin + 40usize);
        assert!(t.revoke_tlab().is_empty());
    }

    #[test]
    fn test_roots_are_slots() {
        let registry = ThreadRegistry::default();
        let t = registry.attach();
        let mut cell = ObjectReference::NULL;
        let slot = Address::from_mut_ptr(&mut cell);
        t.add_root(slot);
        let mut seen = vec![];
        t.visit_roots(|s| seen.push(s));
        assert_eq!(seen, vec![slot]);
    }
}
