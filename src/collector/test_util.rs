//! Shared fixtures for collector unit tests.

use crate::collector::core::CollectorCore;
use crate::object::{self, ElementKind, ObjectKind};
use crate::util::constants::*;
use crate::util::options::Options;
use crate::util::ObjectReference;

/// A small heap with the stop-the-world fallback pinned, so tests never
/// depend on kernel features.
pub(crate) fn small_core() -> CollectorCore {
    let mut options = Options::default();
    options.moving_space_size.set(BYTES_IN_MBYTE);
    options.non_moving_space_size.set(BYTES_IN_MBYTE / 4);
    options.fallback_stw.set(true);
    let core = CollectorCore::new(options).unwrap();
    core.reset_cycle();
    core
}

pub(crate) struct Classes {
    pub meta: ObjectReference,
    /// 3-word instances: class word, one reference field (word 1), one
    /// primitive word.
    pub node: ObjectReference,
    /// Primitive byte arrays.
    pub byte_array: ObjectReference,
}

/// Bootstrap a meta-class and a couple of instance classes in the
/// non-moving space, so class metadata never moves under the tests' feet.
pub(crate) fn bootstrap_classes(core: &CollectorCore) -> Classes {
    let nm = &core.heap().nonmoving;
    let meta_at = nm.alloc(object::CLASS_BYTES).unwrap();
    let meta = object::format_class(
        meta_at,
        ObjectReference::NULL,
        ObjectKind::Class,
        object::CLASS_BYTES,
        ElementKind::Primitive { log_bytes: 0 },
        object::CLASS_REF_MAP,
        ObjectReference::NULL,
    );
    nm.publish(meta);

    let node_at = nm.alloc(object::CLASS_BYTES).unwrap();
    let node = object::format_class(
        node_at,
        meta,
        ObjectKind::Instance,
        3 * BYTES_IN_WORD,
        ElementKind::Primitive { log_bytes: 0 },
        0b010,
        ObjectReference::NULL,
    );
    nm.publish(node);

    let byte_array_at = nm.alloc(object::CLASS_BYTES).unwrap();
    let byte_array = object::format_class(
        byte_array_at,
        meta,
        ObjectKind::Array,
        0,
        ElementKind::Primitive { log_bytes: 0 },
        0,
        ObjectReference::NULL,
    );
    nm.publish(byte_array);

    Classes {
        meta,
        node,
        byte_array,
    }
}

/// Mark a moving-space object the way the tracer would: mark bitmap,
/// live-words bitmap and chunk-info vector.
pub(crate) fn mark_moving(core: &CollectorCore, o: ObjectReference) {
    let size = object::size_of(o);
    core.heap().moving.mark_bitmap().set(o.to_address());
    core.live_words.set_range(o.to_address(), size);
    core.chunk_info.add(o.to_address(), size);
}
