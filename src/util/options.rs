use bytemuck::NoUninit;
use std::fmt::Debug;
use strum_macros::EnumString;

use crate::util::constants::*;
use crate::util::conversions;

/// How userfaultfd faults on the moving space are delivered and resolved
/// during concurrent compaction.  `NoUninit` so the per-cycle effective mode
/// can live in a lock-free atomic cell.
#[repr(u8)]
#[derive(Copy, Clone, EnumString, Debug, PartialEq, Eq, NoUninit)]
pub enum CompactorMode {
    /// Worker threads read the uffd and serve faults with `UFFDIO_COPY` from
    /// private buffers.
    Copy,
    /// The moving space is memfd-backed; pages are produced into a shadow
    /// mapping and installed with `UFFDIO_CONTINUE`.
    MinorFault,
    /// Faults are delivered as SIGBUS to the faulting mutator, which produces
    /// the page in-signal and installs it with `UFFDIO_COPY`.
    SigBus,
}

/// The maximum number of uffd worker threads.
pub const MAX_PARALLEL_WORKERS: usize = 8;

lazy_static! {
    static ref SYSTEM_TOTAL_MEMORY: u64 = {
        use sysinfo::{MemoryRefreshKind, RefreshKind, System};
        // Only load memory-related components; loading everything in sysinfo
        // is slow and we just need the total.
        let sys = System::new_with_specifics(
            RefreshKind::nothing().with_memory(MemoryRefreshKind::nothing().with_ram()),
        );
        sys.total_memory()
    };
}

fn default_moving_space_size() -> usize {
    // A quarter of physical memory, clamped to [16 MiB, 1 GiB].
    let quarter = (*SYSTEM_TOTAL_MEMORY / 4) as usize;
    conversions::raw_align_up(quarter.clamp(16 << 20, 1 << 30), BYTES_IN_PAGE)
}

fn always_valid<T>(_: &T) -> bool {
    true
}

/// An option of a given type, with a validator.  To get the value of an
/// option, dereference it (for example, `*options.parallel_workers`).
#[derive(Clone)]
pub struct GcOption<T: Debug + Clone> {
    value: T,
    validator: fn(&T) -> bool,
}

impl<T: Debug + Clone> GcOption<T> {
    pub fn new(value: T, validator: fn(&T) -> bool) -> Self {
        GcOption { value, validator }
    }

    /// Set the option to the given value. Returns true if the value is valid,
    /// and we set the option to the value.
    pub fn set(&mut self, value: T) -> bool {
        if (self.validator)(&value) {
            self.value = value;
            return true;
        }
        false
    }
}

impl<T: Debug + Clone> std::ops::Deref for GcOption<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

macro_rules! options {
    ($($(#[$outer:meta])* $name:ident: $type:ty [$validator:expr] = $default:expr),* $(,)?) => [
        /// The set of collector options, settable in bulk from `UFFD_COMPACT_*`
        /// environment variables.
        #[derive(Clone)]
        pub struct Options {
            $($(#[$outer])* pub $name: GcOption<$type>),*
        }

        impl Options {
            /// Set an option by name from its string representation. Returns
            /// true if the option was parsed and validated successfully.
            pub fn set_from_string(&mut self, s: &str, val: &str) -> bool {
                match s {
                    $(stringify!($name) => if let Ok(typed) = val.parse::<$type>() {
                        self.$name.set(typed)
                    } else {
                        false
                    }),*,
                    _ => panic!("Invalid option key: {}", s),
                }
            }

            /// Check whether a key refers to a known option.
            pub fn is_valid_key(s: &str) -> bool {
                matches!(s, $(stringify!($name))|*)
            }
        }

        impl Default for Options {
            fn default() -> Self {
                let mut options = Options {
                    $($name: GcOption::new($default, $validator)),*
                };
                options.read_env_var_settings();
                options
            }
        }
    ];
}

options! {
    /// Fault delivery mode for concurrent compaction.
    mode: CompactorMode [always_valid] = CompactorMode::Copy,
    /// Bound on uffd worker threads.
    parallel_workers: usize
        [|v| *v >= 1 && *v <= MAX_PARALLEL_WORKERS && *v <= num_cpus::get()] = 2,
    /// Minimum from-space reclaim granularity in bytes.
    madvise_threshold: usize
        [|v| *v >= BYTES_IN_PAGE && conversions::raw_is_aligned(*v, BYTES_IN_PAGE)]
        = BYTES_IN_MBYTE,
    /// Force the stop-the-world fallback cycle even when the kernel supports
    /// concurrent compaction.  Observable, so tests can pin the fallback path.
    fallback_stw: bool [always_valid] = false,
    /// Capacity of the moving space in bytes.
    moving_space_size: usize
        [|v| *v >= BYTES_IN_MBYTE && conversions::raw_is_aligned(*v, BYTES_IN_PAGE)]
        = default_moving_space_size(),
    /// Capacity of the non-moving space in bytes.
    non_moving_space_size: usize
        [|v| *v >= BYTES_IN_PAGE && conversions::raw_is_aligned(*v, BYTES_IN_PAGE)]
        = 16 * BYTES_IN_MBYTE,
}

/// The prefix for environment-variable options, e.g.
/// `UFFD_COMPACT_PARALLEL_WORKERS=4`.
const ENV_VAR_PREFIX: &str = "UFFD_COMPACT_";

impl Options {
    /// Read options from environment variables, and apply those settings.
    /// Invalid values are logged and skipped, keeping the defaults.
    pub fn read_env_var_settings(&mut self) {
        for (key, val) in std::env::vars() {
            if let Some(rest_of_key) = key.strip_prefix(ENV_VAR_PREFIX) {
                let lowercase: &str = &rest_of_key.to_lowercase();
                if Self::is_valid_key(lowercase) && !self.set_from_string(lowercase, &val) {
                    warn!("Ignoring invalid option {key}={val}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let options = Options::default();
        assert_eq!(*options.parallel_workers, 2);
        assert_eq!(*options.madvise_threshold, BYTES_IN_MBYTE);
        assert_eq!(*options.mode, CompactorMode::Copy);
        assert!(!*options.fallback_stw);
        assert!(conversions::raw_is_aligned(
            *options.moving_space_size,
            BYTES_IN_PAGE
        ));
    }

    #[test]
    fn test_set_from_string() {
        let mut options = Options::default();
        assert!(options.set_from_string("mode", "SigBus"));
        assert_eq!(*options.mode, CompactorMode::SigBus);
        assert!(options.set_from_string("parallel_workers", "1"));
        assert_eq!(*options.parallel_workers, 1);
        // Parse failure.
        assert!(!options.set_from_string("parallel_workers", "many"));
        // Validation failure: not page aligned.
        assert!(!options.set_from_string("madvise_threshold", "100"));
        assert_eq!(*options.madvise_threshold, BYTES_IN_MBYTE);
    }

    #[test]
    fn test_env_var_prefix_round_trip() {
        // An option no other test asserts a default for, since tests in this
        // process run concurrently and Options::default() reads the
        // environment.
        std::env::set_var("UFFD_COMPACT_NON_MOVING_SPACE_SIZE", "8388608");
        let options = Options::default();
        assert_eq!(*options.non_moving_space_size, 8 * BYTES_IN_MBYTE);
        std::env::remove_var("UFFD_COMPACT_NON_MOVING_SPACE_SIZE");
    }

    macro_rules! mode_parse_tests {
        ($($mode:ident),*) => {
            paste::paste! {
                $(
                    #[test]
                    fn [<test_parse_mode_ $mode:lower>]() {
                        let mut options = Options::default();
                        assert!(options.set_from_string("mode", stringify!($mode)));
                        assert_eq!(*options.mode, CompactorMode::$mode);
                    }
                )*
            }
        };
    }

    mode_parse_tests!(Copy, MinorFault, SigBus);
}
