//! The concrete object model.
//!
//! Every managed object starts with a single header word holding the address
//! of its class object; a zero class word is never a valid object and is used
//! by the black-allocation walk to detect the end of a bump-pointer block.
//!
//! Class objects are themselves managed objects (their own class is the
//! meta-class).  A class object describes its instances with a closed set of
//! kinds: `Class`, `Array` (with an element kind), `String`, `Reference` and
//! plain `Instance`.  Reference fields of fixed-shape instances are encoded
//! as a one-word bitmap over the instance's words, which keeps reference-slot
//! iteration a shift-and-mask loop with no per-class tables.

use atomic::Ordering;
use memoffset::offset_of;
use std::sync::atomic::AtomicUsize;

use crate::util::constants::*;
use crate::util::conversions::raw_align_up;
use crate::util::{Address, ObjectReference};

/// The closed set of object shapes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    /// A class object, describing instances of one shape.
    Class,
    /// An array; elements are either references or primitives.
    Array,
    /// A byte string; no reference fields.
    String,
    /// A weak reference; its referent is treated specially by the marker.
    Reference,
    /// A fixed-shape instance.
    Instance,
}

/// Element shape of an array class.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElementKind {
    /// Elements are object references.
    Reference,
    /// Elements are primitives of `1 << log_bytes` bytes.
    Primitive { log_bytes: usize },
}

/// The in-memory shape of a class object.
#[repr(C)]
pub struct ClassRepr {
    /// Class word of the class object itself (the meta-class).
    klass: usize,
    /// `ObjectKind` discriminant for instances of this class.
    kind: usize,
    /// Total instance bytes (granule aligned) for fixed-shape kinds.
    instance_size: usize,
    /// Array element encoding: `(log2 element bytes << 1) | elements_are_refs`.
    elem: usize,
    /// Bit `i` set means word `i` of an instance holds a reference.  Bit 0 is
    /// never set; the class word is implicitly a reference.
    ref_map: usize,
    /// Reference to the superclass, or null.
    super_class: usize,
}

const KIND_CLASS: usize = 0;
const KIND_ARRAY: usize = 1;
const KIND_STRING: usize = 2;
const KIND_REFERENCE: usize = 3;
const KIND_INSTANCE: usize = 4;

/// Size of a class object in bytes.
pub const CLASS_BYTES: usize = raw_align_up(std::mem::size_of::<ClassRepr>(), BYTES_IN_GRANULE);

/// Array header: class word + length word.
pub const ARRAY_HEADER_BYTES: usize = 2 * BYTES_IN_WORD;
/// String header: class word + byte-length word.
pub const STRING_HEADER_BYTES: usize = 2 * BYTES_IN_WORD;

/// Word index of a weak reference's referent field.
pub const REFERENT_WORD: usize = 1;

/// Word index of a class object's superclass field; pinned by the `repr(C)`
/// layout of [`ClassRepr`] and checked against `offset_of!` in tests.
pub const SUPER_CLASS_WORD: usize = 5;

/// The reference bitmap describing a class object itself: only the
/// superclass word (the class word is implicit).
pub const CLASS_REF_MAP: usize = 1 << SUPER_CLASS_WORD;

const_assert!(CLASS_BYTES % BYTES_IN_GRANULE == 0);
const_assert!(MIN_OBJECT_SIZE <= ARRAY_HEADER_BYTES);

/// Read the class word of an object.  The load is atomic because concurrent
/// mutators may be publishing a freshly formatted object while the marker
/// reads it.
pub fn class_of(object: ObjectReference) -> ObjectReference {
    let raw = unsafe { object.to_address().atomic_load::<AtomicUsize>(Ordering::Acquire) };
    ObjectReference::from_address(unsafe { Address::from_usize(raw) })
}

/// Store the class word of an object.
pub fn set_class(object: ObjectReference, klass: ObjectReference) {
    unsafe {
        object
            .to_address()
            .atomic_store::<AtomicUsize>(klass.to_address().as_usize(), Ordering::Release)
    };
}

/// Read the kind tag out of class metadata readable at `klass_repr`.
///
/// `klass_repr` is the address where the class's words can be read.  During
/// compaction this may be the from-space copy of the class rather than the
/// class's (stale) pre-compact address.
pub fn kind_from_repr(klass_repr: Address) -> ObjectKind {
    let raw = unsafe { (klass_repr + offset_of!(ClassRepr, kind)).load::<usize>() };
    match raw {
        KIND_CLASS => ObjectKind::Class,
        KIND_ARRAY => ObjectKind::Array,
        KIND_STRING => ObjectKind::String,
        KIND_REFERENCE => ObjectKind::Reference,
        KIND_INSTANCE => ObjectKind::Instance,
        _ => panic!("invalid object kind {} in class at {}", raw, klass_repr),
    }
}

/// The kind of an object, consulting its class in place.
pub fn kind_of(object: ObjectReference) -> ObjectKind {
    kind_from_repr(class_of(object).to_address())
}

/// Element kind of an array class.
pub fn element_kind(klass_repr: Address) -> ElementKind {
    let elem = unsafe { (klass_repr + offset_of!(ClassRepr, elem)).load::<usize>() };
    if elem & 1 == 1 {
        ElementKind::Reference
    } else {
        ElementKind::Primitive {
            log_bytes: elem >> 1,
        }
    }
}

/// Length word of an array or string, given a readable copy of its header.
pub fn length_of(header_base: Address) -> usize {
    unsafe { (header_base + BYTES_IN_WORD).load::<usize>() }
}

/// Size of an object whose header words can be read at `header_base` and
/// whose class metadata can be read at `klass_repr`.  Always a multiple of
/// the granule.
pub fn size_with_repr(header_base: Address, klass_repr: Address) -> usize {
    let size = match kind_from_repr(klass_repr) {
        ObjectKind::Array => {
            let len = length_of(header_base);
            let log_bytes = match element_kind(klass_repr) {
                ElementKind::Reference => LOG_BYTES_IN_WORD as usize,
                ElementKind::Primitive { log_bytes } => log_bytes,
            };
            ARRAY_HEADER_BYTES + (len << log_bytes)
        }
        ObjectKind::String => STRING_HEADER_BYTES + length_of(header_base),
        ObjectKind::Class | ObjectKind::Reference | ObjectKind::Instance => unsafe {
            (klass_repr + offset_of!(ClassRepr, instance_size)).load::<usize>()
        },
    };
    raw_align_up(size, BYTES_IN_GRANULE)
}

/// Size of an object in place (valid outside an active compaction).
pub fn size_of(object: ObjectReference) -> usize {
    size_with_repr(object.to_address(), class_of(object).to_address())
}

/// Visit the reference-slot addresses of one object, bounded to the byte
/// range `[begin_byte, end_byte)` within the object.
///
/// * `header_base` is where the object's words can be read (for array
///   lengths and the class word); during compaction this is the from-space
///   copy.
/// * `slot_base` is where byte 0 of the object maps in the memory being
///   updated; the visitor receives `slot_base + offset` for each reference
///   slot, including the class word at offset 0.
pub fn visit_reference_slots(
    header_base: Address,
    slot_base: Address,
    klass_repr: Address,
    begin_byte: usize,
    end_byte: usize,
    mut f: impl FnMut(Address),
) {
    // The class word is a reference slot like any other.
    if begin_byte == 0 && end_byte > 0 {
        f(slot_base);
    }
    match kind_from_repr(klass_repr) {
        ObjectKind::String => {}
        ObjectKind::Array => {
            if let ElementKind::Reference = element_kind(klass_repr) {
                let len = length_of(header_base);
                let payload_end = ARRAY_HEADER_BYTES + (len << LOG_BYTES_IN_WORD);
                let mut off = std::cmp::max(ARRAY_HEADER_BYTES, begin_byte);
                off = raw_align_up(off, BYTES_IN_WORD);
                let end = std::cmp::min(end_byte, payload_end);
                while off < end {
                    f(slot_base + off);
                    off += BYTES_IN_WORD;
                }
            }
        }
        ObjectKind::Class | ObjectKind::Reference | ObjectKind::Instance => {
            let mut map =
                unsafe { (klass_repr + offset_of!(ClassRepr, ref_map)).load::<usize>() };
            debug_assert_eq!(map & 1, 0, "bit 0 of a ref map aliases the class word");
            while map != 0 {
                let word = map.trailing_zeros() as usize;
                map &= map - 1;
                let off = word << LOG_BYTES_IN_WORD;
                if off >= begin_byte && off < end_byte {
                    f(slot_base + off);
                }
            }
        }
    }
}

/// Read a reference field by word index.
pub fn read_ref_field(object: ObjectReference, word: usize) -> ObjectReference {
    let raw = unsafe {
        (object.to_address() + (word << LOG_BYTES_IN_WORD))
            .atomic_load::<AtomicUsize>(Ordering::Acquire)
    };
    ObjectReference::from_address(unsafe { Address::from_usize(raw) })
}

/// Write a reference field by word index.  Callers that need generational
/// precision must dirty the holder's card through the heap, not here.
pub fn write_ref_field(object: ObjectReference, word: usize, value: ObjectReference) {
    unsafe {
        (object.to_address() + (word << LOG_BYTES_IN_WORD))
            .atomic_store::<AtomicUsize>(value.to_address().as_usize(), Ordering::Release)
    };
}

/* Formatting: used by the embedder's allocator and by tests. */

/// Format a class object at `at`.  Passing a null `meta` makes the class its
/// own class (the bootstrap meta-class).
#[allow(clippy::too_many_arguments)]
pub fn format_class(
    at: Address,
    meta: ObjectReference,
    kind: ObjectKind,
    instance_size: usize,
    elem: ElementKind,
    ref_map: usize,
    super_class: ObjectReference,
) -> ObjectReference {
    debug_assert!(at.is_aligned_to(BYTES_IN_GRANULE));
    debug_assert_eq!(ref_map & 1, 0);
    let kind_raw = match kind {
        ObjectKind::Class => KIND_CLASS,
        ObjectKind::Array => KIND_ARRAY,
        ObjectKind::String => KIND_STRING,
        ObjectKind::Reference => KIND_REFERENCE,
        ObjectKind::Instance => KIND_INSTANCE,
    };
    let elem_raw = match elem {
        ElementKind::Reference => 1,
        ElementKind::Primitive { log_bytes } => log_bytes << 1,
    };
    let klass_word = if meta.is_null() { at.as_usize() } else { meta.to_address().as_usize() };
    unsafe {
        (at + offset_of!(ClassRepr, kind)).store::<usize>(kind_raw);
        (at + offset_of!(ClassRepr, instance_size)).store::<usize>(instance_size);
        (at + offset_of!(ClassRepr, elem)).store::<usize>(elem_raw);
        (at + offset_of!(ClassRepr, ref_map)).store::<usize>(ref_map);
        (at + offset_of!(ClassRepr, super_class)).store::<usize>(super_class.to_address().as_usize());
        // Publish the class word last.
        at.atomic_store::<AtomicUsize>(klass_word, Ordering::Release);
    }
    ObjectReference::from_address(at)
}

/// Format a fixed-shape instance (also used for `Reference` objects).
pub fn format_instance(at: Address, klass: ObjectReference) -> ObjectReference {
    debug_assert!(at.is_aligned_to(BYTES_IN_GRANULE));
    let object = ObjectReference::from_address(at);
    set_class(object, klass);
    object
}

/// Format an array of `len` elements.
pub fn format_array(at: Address, klass: ObjectReference, len: usize) -> ObjectReference {
    debug_assert!(at.is_aligned_to(BYTES_IN_GRANULE));
    unsafe { (at + BYTES_IN_WORD).store::<usize>(len) };
    let object = ObjectReference::from_address(at);
    set_class(object, klass);
    object
}

/// Format a string of `len` bytes.
pub fn format_string(at: Address, klass: ObjectReference, len: usize) -> ObjectReference {
    debug_assert!(at.is_aligned_to(BYTES_IN_GRANULE));
    unsafe { (at + BYTES_IN_WORD).store::<usize>(len) };
    let object = ObjectReference::from_address(at);
    set_class(object, klass);
    object
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::memory::{mmap_anywhere, MmapProtection};

    fn scratch(pages: usize) -> Address {
        mmap_anywhere(
            pages * BYTES_IN_PAGE,
            MmapProtection::ReadWrite,
            "uffdc:test:object",
        )
        .unwrap()
    }

    #[test]
    fn test_super_class_word_matches_layout() {
        assert_eq!(
            SUPER_CLASS_WORD,
            offset_of!(ClassRepr, super_class) / BYTES_IN_WORD
        );
        assert_eq!(CLASS_REF_MAP, 1 << SUPER_CLASS_WORD);
    }

    #[test]
    fn test_class_sizes_and_kinds() {
        let base = scratch(1);
        let meta = format_class(
            base,
            ObjectReference::NULL,
            ObjectKind::Class,
            CLASS_BYTES,
            ElementKind::Primitive { log_bytes: 0 },
            CLASS_REF_MAP,
            ObjectReference::NULL,
        );
        assert_eq!(class_of(meta), meta);
        assert_eq!(kind_of(meta), ObjectKind::Class);
        assert_eq!(size_of(meta), CLASS_BYTES);

        let point = format_class(
            base + CLASS_BYTES,
            meta,
            ObjectKind::Instance,
            4 * BYTES_IN_WORD,
            ElementKind::Primitive { log_bytes: 0 },
            0b0100, // word 2 is a reference
            ObjectReference::NULL,
        );
        let obj = format_instance(base + 2 * CLASS_BYTES, point);
        assert_eq!(size_of(obj), 4 * BYTES_IN_WORD);
        assert_eq!(kind_of(obj), ObjectKind::Instance);
    }

    #[test]
    fn test_array_and_string_sizes() {
        let base = scratch(1);
        let meta = format_class(
            base,
            ObjectReference::NULL,
            ObjectKind::Class,
            CLASS_BYTES,
            ElementKind::Primitive { log_bytes: 0 },
            CLASS_REF_MAP,
            ObjectReference::NULL,
        );
        let ref_array = format_class(
            base + CLASS_BYTES,
            meta,
            ObjectKind::Array,
            0,
            ElementKind::Reference,
            0,
            ObjectReference::NULL,
        );
        let string = format_class(
            base + 2 * CLASS_BYTES,
            meta,
            ObjectKind::String,
            0,
            ElementKind::Primitive { log_bytes: 0 },
            0,
            ObjectReference::NULL,
        );

        let arr = format_array(base + 3 * CLASS_BYTES, ref_array, 3);
        assert_eq!(size_of(arr), ARRAY_HEADER_BYTES + 3 * BYTES_IN_WORD);

        let s = format_string(base + 4 * CLASS_BYTES, string, 5);
        // 16-byte header + 5 bytes, granule aligned.
        assert_eq!(size_of(s), raw_align_up(STRING_HEADER_BYTES + 5, BYTES_IN_GRANULE));
    }

    #[test]
    fn test_reference_slot_iteration_bounds() {
        let base = scratch(1);
        let meta = format_class(
            base,
            ObjectReference::NULL,
            ObjectKind::Class,
            CLASS_BYTES,
            ElementKind::Primitive { log_bytes: 0 },
            CLASS_REF_MAP,
            ObjectReference::NULL,
        );
        let holder = format_class(
            base + CLASS_BYTES,
            meta,
            ObjectKind::Instance,
            6 * BYTES_IN_WORD,
            ElementKind::Primitive { log_bytes: 0 },
            0b10_0110, // words 1, 2 and 5
            ObjectReference::NULL,
        );
        let obj = format_instance(base + 2 * CLASS_BYTES, holder);
        let a = obj.to_address();

        let mut slots = vec![];
        visit_reference_slots(a, a, holder.to_address(), 0, usize::MAX, |s| {
            slots.push(s - a)
        });
        assert_eq!(slots, vec![0, 8, 16, 40]);

        // Bounded to [8, 40): drops the class word and the tail slot.
        slots.clear();
        visit_reference_slots(a, a, holder.to_address(), 8, 40, |s| slots.push(s - a));
        assert_eq!(slots, vec![8, 16]);
    }

    #[test]
    fn test_array_slot_iteration() {
        let base = scratch(1);
        let meta = format_class(
            base,
            ObjectReference::NULL,
            ObjectKind::Class,
            CLASS_BYTES,
            ElementKind::Primitive { log_bytes: 0 },
            CLASS_REF_MAP,
            ObjectReference::NULL,
        );
        let ref_array = format_class(
            base + CLASS_BYTES,
            meta,
            ObjectKind::Array,
            0,
            ElementKind::Reference,
            0,
            ObjectReference::NULL,
        );
        let arr = format_array(base + 2 * CLASS_BYTES, ref_array, 4);
        let a = arr.to_address();
        let mut slots = vec![];
        visit_reference_slots(a, a, ref_array.to_address(), 0, usize::MAX, |s| {
            slots.push(s - a)
        });
        assert_eq!(slots, vec![0, 16, 24, 32, 40]);
    }
}
