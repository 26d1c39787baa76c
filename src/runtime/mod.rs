//! Runtime collaborators: mutator threads, the reference processor, and the
//! callback surface for the parts of the runtime the collector does not own.

pub mod reference_processor;
pub mod thread;

pub use self::reference_processor::ReferenceProcessor;
pub use self::thread::{MutatorThread, StopTheWorldScope, ThreadRegistry, Tlab};

use crate::util::{Address, ObjectReference};

/// Callbacks the collector invokes at well-defined points.  These stand in
/// for the class-linker tables, interned strings, monitor lists, JIT caches
/// and other runtime structures whose implementation lives outside the
/// collector.
pub trait RuntimeCallbacks: Send + Sync + 'static {
    /// Visit the address of every non-thread root slot (class tables,
    /// interned strings, monitor lists).  Called during root marking and
    /// again during the compaction pause to rewrite the slots.
    fn visit_global_roots(&self, _visitor: &mut dyn FnMut(Address)) {}

    /// Rewrite runtime-held weak object pointers (interpreter caches, JIT
    /// code maps).  `forward` returns the new address of a live object, or
    /// None for a dead one, in which case the entry should be dropped.
    fn update_weak_tables(&self, _forward: &mut dyn FnMut(ObjectReference) -> Option<ObjectReference>) {
    }

    /// Sweep runtime caches that key on dead objects; invoked after marking
    /// completes and before compaction begins.
    fn sweep_caches(&self) {}
}

/// A callback implementation with no runtime attached; useful for embedders
/// that route all roots through threads, and for tests.
pub struct NoRuntimeCallbacks;

impl RuntimeCallbacks for NoRuntimeCallbacks {}
