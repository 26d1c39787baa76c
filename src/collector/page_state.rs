//! The per-destination-page state machine coordinating the GC thread, uffd
//! worker threads, and faulting mutators.

use atomic::{Atomic, Ordering};
use bytemuck::NoUninit;

/// States advance monotonically:
/// `Unprocessed -> {Processing, MutatorProcessing, ProcessingAndMapping}
///  -> Processed -> ProcessedAndMapping -> ProcessedAndMapped`.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, NoUninit)]
pub enum PageState {
    /// No work started.
    Unprocessed = 0,
    /// A processor has claimed the page (minor-fault mode).
    Processing,
    /// A mutator thread is producing the page; blocks from-space reclaim.
    MutatorProcessing,
    /// Claim implies "also map when done" (copy mode).
    ProcessingAndMapping,
    /// Content ready in the shadow; not yet installed.
    Processed,
    /// Install in progress.
    ProcessedAndMapping,
    /// Installed; a fault can no longer occur here.
    ProcessedAndMapped,
}

fn rank(s: PageState) -> u8 {
    match s {
        PageState::Unprocessed => 0,
        PageState::Processing | PageState::MutatorProcessing | PageState::ProcessingAndMapping => 1,
        PageState::Processed => 2,
        PageState::ProcessedAndMapping => 3,
        PageState::ProcessedAndMapped => 4,
    }
}

pub struct PageStates {
    states: Box<[Atomic<PageState>]>,
}

impl PageStates {
    pub fn new(npages: usize) -> Self {
        PageStates {
            states: (0..npages)
                .map(|_| Atomic::new(PageState::Unprocessed))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn get(&self, idx: usize) -> PageState {
        self.states[idx].load(Ordering::Acquire)
    }

    /// Claim an unprocessed page.  Success grants exclusive write rights to
    /// the page's destination buffer.
    pub fn try_claim(&self, idx: usize, to: PageState) -> Result<(), PageState> {
        debug_assert_eq!(rank(to), 1);
        self.states[idx]
            .compare_exchange(
                PageState::Unprocessed,
                to,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
    }

    /// Publish a forward transition with release ordering, so any reader that
    /// acquires the new state also sees the page contents the writer
    /// produced.
    pub fn publish(&self, idx: usize, to: PageState) {
        debug_assert!(rank(to) > rank(self.states[idx].load(Ordering::Relaxed)));
        self.states[idx].store(to, Ordering::Release);
    }

    /// Elevate `Processed -> ProcessedAndMapping`, claiming the install.
    pub fn try_elevate(&self, idx: usize, from: PageState, to: PageState) -> bool {
        debug_assert!(rank(to) > rank(from));
        self.states[idx]
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Bounded-backoff wait for the page to be installed.  Cancellation is
    /// not supported mid-page.
    pub fn wait_mapped(&self, idx: usize) {
        let mut spins = 0u32;
        while self.get(idx) != PageState::ProcessedAndMapped {
            if spins < 64 {
                std::thread::yield_now();
            } else {
                std::thread::sleep(std::time::Duration::from_micros(10));
            }
            spins = spins.saturating_add(1);
        }
    }

    pub fn all_mapped(&self, total: usize) -> bool {
        (0..total).all(|i| self.get(i) == PageState::ProcessedAndMapped)
    }

    pub fn reset(&self) {
        for s in self.states.iter() {
            s.store(PageState::Unprocessed, Ordering::Relaxed);
        }
    }

    /// State histogram for fatal diagnostics.
    pub fn histogram(&self) -> [usize; 5] {
        let mut h = [0usize; 5];
        for s in self.states.iter() {
            h[rank(s.load(Ordering::Relaxed)) as usize] += 1;
        }
        h
    }
}
