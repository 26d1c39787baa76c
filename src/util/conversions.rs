use crate::util::constants::*;
use crate::util::Address;

/* Alignment */

/// Is the address aligned to a word boundary?
pub fn is_address_word_aligned(addr: Address) -> bool {
    addr.is_aligned_to(BYTES_IN_WORD)
}

/// Align an address up to a page boundary.
pub fn page_align_up(addr: Address) -> Address {
    addr.align_up(BYTES_IN_PAGE)
}

/// Align an address down to a page boundary.
pub fn page_align_down(addr: Address) -> Address {
    addr.align_down(BYTES_IN_PAGE)
}

/// Is the address page aligned?
pub fn is_page_aligned(addr: Address) -> bool {
    addr.is_aligned_to(BYTES_IN_PAGE)
}

/// Align a raw byte count up to the given power-of-two alignment.
pub const fn raw_align_up(val: usize, align: usize) -> usize {
    // See https://github.com/rust-lang/rust/blob/master/src/libcore/alloc.rs#L192
    val.wrapping_add(align).wrapping_sub(1) & !align.wrapping_sub(1)
}

/// Align a raw byte count down to the given power-of-two alignment.
pub const fn raw_align_down(val: usize, align: usize) -> usize {
    val & !align.wrapping_sub(1)
}

/// Is the raw value aligned to the given power-of-two alignment?
pub const fn raw_is_aligned(val: usize, align: usize) -> bool {
    val & align.wrapping_sub(1) == 0
}

/* Conversion */

/// Convert a byte count to a number of pages, rounding up.
pub const fn bytes_to_pages_up(bytes: usize) -> usize {
    raw_align_up(bytes, BYTES_IN_PAGE) >> LOG_BYTES_IN_PAGE
}

/// Convert a number of pages to a byte count.
pub const fn pages_to_bytes(pages: usize) -> usize {
    pages << LOG_BYTES_IN_PAGE
}

/// Convert a byte count to a number of chunks, rounding up.
pub const fn bytes_to_chunks_up(bytes: usize) -> usize {
    raw_align_up(bytes, BYTES_IN_CHUNK) >> LOG_BYTES_IN_CHUNK
}

/// Convert a byte count to a number of granules, rounding up.
pub const fn bytes_to_granules_up(bytes: usize) -> usize {
    raw_align_up(bytes, BYTES_IN_GRANULE) >> LOG_BYTES_IN_GRANULE
}

/// Convert a number of granules to a byte count.
pub const fn granules_to_bytes(granules: usize) -> usize {
    granules << LOG_BYTES_IN_GRANULE
}
