//! Heap spaces and their side structures.

pub mod card_table;
pub mod immune_space;
pub mod mark_bitmap;
pub mod moving_space;
pub mod nonmoving_space;

pub use self::card_table::CardTable;
pub use self::immune_space::ImmuneSpace;
pub use self::mark_bitmap::MarkBitmap;
pub use self::moving_space::{Backing, Block, MovingSpace};
pub use self::nonmoving_space::NonMovingSpace;

use std::sync::RwLock;

use crate::util::options::{CompactorMode, Options};
use crate::util::Address;

/// Which space an address falls into.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SpaceKind {
    Moving,
    NonMoving,
    Immune(usize),
    Unknown,
}

/// The heap layout the collector operates on: one moving space, one
/// non-moving space, and any number of immune spaces.
pub struct HeapLayout {
    pub moving: MovingSpace,
    pub nonmoving: NonMovingSpace,
    immune: RwLock<Vec<ImmuneSpace>>,
}

impl HeapLayout {
    pub fn new(options: &Options) -> std::io::Result<Self> {
        let backing = if *options.mode == CompactorMode::MinorFault {
            Backing::Memfd
        } else {
            Backing::Anonymous
        };
        Ok(HeapLayout {
            moving: MovingSpace::new("uffdc:moving-space", *options.moving_space_size, backing)?,
            nonmoving: NonMovingSpace::new(
                "uffdc:non-moving-space",
                *options.non_moving_space_size,
            )?,
            immune: RwLock::new(vec![]),
        })
    }

    /// Add an immune space (e.g. an image or zygote range); returns its
    /// index.
    pub fn add_immune(&self, space: ImmuneSpace) -> usize {
        let mut immune = self.immune.write().unwrap();
        immune.push(space);
        immune.len() - 1
    }

    /// Run a closure against one immune space.
    pub fn with_immune<R>(&self, idx: usize, f: impl FnOnce(&ImmuneSpace) -> R) -> R {
        f(&self.immune.read().unwrap()[idx])
    }

    /// Visit every immune space.
    pub fn immune_each(&self, mut f: impl FnMut(&ImmuneSpace)) {
        for space in self.immune.read().unwrap().iter() {
            f(space);
        }
    }

    pub fn classify(&self, addr: Address) -> SpaceKind {
        if self.moving.contains(addr) {
            return SpaceKind::Moving;
        }
        if self.nonmoving.contains(addr) {
            return SpaceKind::NonMoving;
        }
        for (i, space) in self.immune.read().unwrap().iter().enumerate() {
            if space.contains(addr) {
                return SpaceKind::Immune(i);
            }
        }
        SpaceKind::Unknown
    }

    /// The write barrier: dirty the card of the space holding `addr`.
    pub fn dirty_card(&self, addr: Address) {
        match self.classify(addr) {
            SpaceKind::Moving => self.moving.cards().dirty(addr),
            SpaceKind::NonMoving => self.nonmoving.cards().dirty(addr),
            SpaceKind::Immune(i) => self.with_immune(i, |s| s.cards().dirty(addr)),
            SpaceKind::Unknown => {}
        }
    }

    /// A per-space summary, logged before a fatal abort.
    pub fn summary(&self) -> String {
        use std::fmt::Write;
        let mut s = String::new();
        let _ = writeln!(
            s,
            "moving: [{}, {}) top {} from-space {}",
            self.moving.begin(),
            self.moving.limit(),
            self.moving.top(),
            self.moving.from_space_begin(),
        );
        let _ = writeln!(
            s,
            "non-moving: [{}, {}) top {}",
            self.nonmoving.begin(),
            self.nonmoving.begin() + self.nonmoving.capacity(),
            self.nonmoving.top(),
        );
        self.immune_each(|space| {
            let _ = writeln!(
                s,
                "immune {}: [{}, {})",
                space.name(),
                space.begin(),
                space.begin() + space.capacity(),
            );
        });
        s
    }
}
