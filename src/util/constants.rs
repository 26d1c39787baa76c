/// log2 of the number of bits in a byte
pub const LOG_BITS_IN_BYTE: u8 = 3;
/// The number of bits in a byte
pub const BITS_IN_BYTE: usize = 1 << LOG_BITS_IN_BYTE;

/// log2 of the number of bytes in a kilobyte
pub const LOG_BYTES_IN_KBYTE: u8 = 10;
/// The number of bytes in a kilobyte
pub const BYTES_IN_KBYTE: usize = 1 << LOG_BYTES_IN_KBYTE;

/// log2 of the number of bytes in a megabyte
pub const LOG_BYTES_IN_MBYTE: u8 = 20;
/// The number of bytes in a megabyte
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

#[cfg(target_pointer_width = "32")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 2;
#[cfg(target_pointer_width = "64")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 3;
/// The number of bytes in an address
pub const BYTES_IN_ADDRESS: usize = 1 << LOG_BYTES_IN_ADDRESS;

/// log2 of the number of bytes in a word
pub const LOG_BYTES_IN_WORD: u8 = LOG_BYTES_IN_ADDRESS;
/// The number of bytes in a word
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;
/// log2 of the number of bits in a word
pub const LOG_BITS_IN_WORD: usize = LOG_BITS_IN_BYTE as usize + LOG_BYTES_IN_WORD as usize;
/// The number of bits in a word
pub const BITS_IN_WORD: usize = 1 << LOG_BITS_IN_WORD;

/// log2 of the number of bytes in a page
pub const LOG_BYTES_IN_PAGE: u8 = 12;
/// The number of bytes in a page
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;

/// log2 of the allocation granule.  All object sizes and object start
/// addresses are multiples of the granule, and the live-words bitmap carries
/// one bit per granule.
pub const LOG_BYTES_IN_GRANULE: u8 = LOG_BYTES_IN_WORD;
/// The number of bytes in an allocation granule
pub const BYTES_IN_GRANULE: usize = 1 << LOG_BYTES_IN_GRANULE;

/// A chunk groups one bitmap word worth of granules, so that the post-compact
/// offset of any granule can be derived from one chunk-info entry plus a
/// single popcount of the chunk's bitmap word.
pub const GRANULES_IN_CHUNK: usize = BITS_IN_WORD;
/// log2 of the number of bytes in a chunk
pub const LOG_BYTES_IN_CHUNK: usize = LOG_BITS_IN_WORD + LOG_BYTES_IN_GRANULE as usize;
/// The number of bytes in a chunk
pub const BYTES_IN_CHUNK: usize = 1 << LOG_BYTES_IN_CHUNK;

/// The number of granules in a page
pub const GRANULES_IN_PAGE: usize = BYTES_IN_PAGE / BYTES_IN_GRANULE;
/// The number of chunks in a page
pub const CHUNKS_IN_PAGE: usize = BYTES_IN_PAGE / BYTES_IN_CHUNK;

/// log2 of the number of heap bytes covered by one card-table byte
pub const LOG_BYTES_IN_CARD: u8 = 10;
/// The number of heap bytes covered by one card-table byte
pub const BYTES_IN_CARD: usize = 1 << LOG_BYTES_IN_CARD;

/// The minimal object size in bytes: a class word plus one payload word.
pub const MIN_OBJECT_SIZE: usize = 2 * BYTES_IN_WORD;

// Page-granularity fault delivery requires that a page decomposes into whole
// chunks, otherwise one chunk-info entry could straddle two destination pages.
const_assert_eq!(BYTES_IN_PAGE % BYTES_IN_CHUNK, 0);
const_assert!(BYTES_IN_PAGE >= BYTES_IN_CHUNK);
const_assert_eq!(BYTES_IN_CARD % BYTES_IN_GRANULE, 0);
