//! Utilities used across the collector.

pub mod address;
pub mod constants;
pub mod conversions;
pub mod logger;
pub mod memory;
pub mod options;

pub use self::address::Address;
pub use self::address::ObjectReference;

/// size in bytes
pub type ByteSize = usize;
/// offset in bytes
pub type ByteOffset = isize;
