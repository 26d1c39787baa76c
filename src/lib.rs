//! A concurrent, sliding, compacting garbage collector for a managed-language
//! runtime, built on Linux `userfaultfd`.
//!
//! The collector traces the moving space with a bitmap-based tri-color mark,
//! derives per-page compaction metadata from a live-words bitmap and a
//! chunk-info vector, and then relocates live objects without stopping mutator
//! threads: the moving space is atomically remapped to a read-only from-space
//! shadow and re-registered with `userfaultfd`, so that every subsequent read
//! faults and is serviced by producing the post-compact contents of exactly
//! the faulted page.
//!
//! Major parts:
//! * [`collector`]: the mark phase, the compaction layout planner, the page
//!   compactor and black-page slider, the per-page state machine, and
//!   progressive from-space reclaim.
//! * [`uffd`]: the raw `userfaultfd` ABI and the fault-service driver
//!   (copy, minor-fault and SIGBUS delivery modes).
//! * [`heap`]: the moving bump-pointer space, the non-moving space, immune
//!   spaces, mark bitmaps and card tables the collector consumes.
//! * [`object`]: the concrete object model (class word, closed object-kind
//!   variant, reference-slot iteration).
//! * [`runtime`]: mutator threads, the suspend/checkpoint abstraction, the
//!   reference processor, and the callback surface for runtime collaborators
//!   that are outside the collector.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;

#[macro_use]
pub mod util;
pub mod collector;
pub mod heap;
pub mod object;
pub mod runtime;
pub mod uffd;

pub use crate::collector::MarkCompact;
pub use crate::util::options::{CompactorMode, Options};
pub use crate::util::{Address, ObjectReference};
