//! The compaction layout planner: derives first-object and first-offset
//! metadata for every destination page, for both the compacted pre-mark
//! region and the slid black-allocation region.

use atomic::Ordering;

use super::core::CollectorCore;
use crate::object;
use crate::util::constants::*;
use crate::util::conversions;
use crate::util::ObjectReference;

impl CollectorCore {
    /// Finalize the chunk-info vector and lay out the pre-mark portion of
    /// the moving space and the non-moving space.  Runs concurrently after
    /// marking; the black-allocation walks run later, inside the compaction
    /// pause, once the black region stops growing.
    pub(crate) fn prepare_for_compaction(&self) {
        let moving = &self.heap.moving;
        let black_begin = self.black_begin();
        debug_assert!(black_begin.is_aligned_to(BYTES_IN_PAGE));
        let nchunks = (black_begin - moving.begin()) >> LOG_BYTES_IN_CHUNK;

        #[cfg(feature = "extreme_assertions")]
        debug_assert_eq!(
            self.live_words.count_ones() << LOG_BYTES_IN_GRANULE,
            self.chunk_info.sum(nchunks),
            "live-words bitmap and chunk-info vector disagree"
        );

        let total_live = self.chunk_info.finalize(nchunks);
        let post_compact_end =
            moving.begin() + conversions::raw_align_up(total_live, BYTES_IN_PAGE);
        self.set_post_compact_end(post_compact_end);
        let count = (post_compact_end - moving.begin()) >> LOG_BYTES_IN_PAGE;
        self.set_moving_first_objs_count(count);
        debug!(
            "compaction layout: {} live bytes, {} destination pages, post-compact end {}",
            total_live, count, post_compact_end
        );

        self.init_moving_space_first_objects(count, total_live);
        self.init_non_moving_space_first_objects();
    }

    /// For each destination page, find the chunk in which the running live
    /// total crosses the page boundary, select the crossing granule by rank,
    /// and resolve the object containing it from the mark bitmap.
    fn init_moving_space_first_objects(&self, count: usize, total_live: usize) {
        let moving = &self.heap.moving;
        let mut chunk = 0usize;
        for i in 0..count {
            let target = i << LOG_BYTES_IN_PAGE;
            debug_assert!(target < total_live);
            while self.chunk_info.offset_of_chunk(chunk + 1) <= target {
                chunk += 1;
            }
            let excess = target - self.chunk_info.offset_of_chunk(chunk);
            let k = excess >> LOG_BYTES_IN_GRANULE;
            let bit_in_chunk = self.live_words.nth_set_bit_in_chunk(chunk, k);
            let bit = (chunk << LOG_BITS_IN_WORD) + bit_in_chunk;
            let granule_addr = self.live_words.addr_of_bit(bit);
            let first_obj = moving
                .mark_bitmap()
                .find_preceding(granule_addr)
                .unwrap_or_else(|| {
                    panic!(
                        "no marked object precedes live granule {} for page {}",
                        granule_addr, i
                    )
                });
            self.meta.first_obj_moving[i].store(first_obj, Ordering::Relaxed);
            self.meta.first_offset_moving[i].store(bit, Ordering::Relaxed);
        }
    }

    /// For each non-moving page, record the first marked object overlapping
    /// it: either an object from a preceding page that spills in, or the
    /// first object starting in the page, or nothing.
    pub(crate) fn init_non_moving_space_first_objects(&self) {
        let nm = &self.heap.nonmoving;
        let begin = nm.begin();
        nm.mark_bitmap().visit_marked_range(begin, nm.top(), |o| {
            let size = object::size_of(o);
            let first_page = (o.to_address() - begin) >> LOG_BYTES_IN_PAGE;
            let last_page = (o.to_address() + (size - 1) - begin) >> LOG_BYTES_IN_PAGE;
            for p in first_page..=last_page {
                let slot = &self.meta.first_obj_non_moving[p];
                if slot.load(Ordering::Relaxed).is_null() {
                    slot.store(o, Ordering::Relaxed);
                }
            }
        });
    }

    /// Walk the bump-pointer block list from the black-allocations boundary
    /// to the end of the last TLAB, recording for every black destination
    /// page its first overlapping object and the number of bytes
    /// contiguously live from the page start, and setting mark bits so the
    /// slider can find objects past TLAB holes.  Runs in the compaction
    /// pause.
    pub(crate) fn update_moving_space_black_allocations(&self) {
        let moving = &self.heap.moving;
        let black_begin = self.black_begin();
        let top = self.moving_top_at_pause();
        let black_end = conversions::page_align_up(top);
        self.set_black_end_aligned(black_end);
        let black_pages = (black_end - black_begin) >> LOG_BYTES_IN_PAGE;
        self.set_black_page_count(black_pages);
        if black_pages == 0 {
            return;
        }
        let first_black_idx = self.moving_first_objs_count();

        for block in moving.blocks_from(black_begin) {
            // Objects in a block are contiguous; a null class word ends the
            // used portion, and the rest of the block is a hole.
            let mut cursor = block.begin;
            let run_begin = cursor;
            while cursor < block.end() {
                let klass = unsafe { cursor.load::<usize>() };
                if klass == 0 {
                    break;
                }
                let obj = ObjectReference::from_address(cursor);
                let size = object::size_of(obj);
                moving.mark_bitmap().set(cursor);
                let first_page = (cursor - black_begin) >> LOG_BYTES_IN_PAGE;
                let last_page = (cursor + (size - 1) - black_begin) >> LOG_BYTES_IN_PAGE;
                for p in first_page..=last_page {
                    let slot = &self.meta.first_obj_moving[first_black_idx + p];
                    if slot.load(Ordering::Relaxed).is_null() {
                        slot.store(obj, Ordering::Relaxed);
                    }
                }
                cursor += size;
            }
            // Credit the contiguous run [run_begin, cursor) to each page it
            // covers from the page's start.
            let mut page_begin = run_begin.align_down(BYTES_IN_PAGE);
            if page_begin < run_begin {
                // The run enters its first page mid-way; that page's lead-in
                // is covered by an earlier run or is a hole.
                page_begin += BYTES_IN_PAGE;
            }
            while page_begin < cursor {
                let p = (page_begin - black_begin) >> LOG_BYTES_IN_PAGE;
                let covered = std::cmp::min(cursor - page_begin, BYTES_IN_PAGE);
                self.meta.first_offset_moving[first_black_idx + p]
                    .store(covered, Ordering::Relaxed);
                page_begin += BYTES_IN_PAGE;
            }
        }
    }

    /// Drain the post-pause allocation stack of the non-moving space,
    /// marking each object and folding it into the first-object array.
    pub(crate) fn update_non_moving_space_black_allocations(&self) {
        let nm = &self.heap.nonmoving;
        let begin = nm.begin();
        for o in nm.swap_alloc_stack() {
            nm.mark_bitmap().set(o.to_address());
            let size = object::size_of(o);
            let first_page = (o.to_address() - begin) >> LOG_BYTES_IN_PAGE;
            let last_page = (o.to_address() + (size - 1) - begin) >> LOG_BYTES_IN_PAGE;
            for p in first_page..=last_page {
                let slot = &self.meta.first_obj_non_moving[p];
                let current = slot.load(Ordering::Relaxed);
                if current.is_null() || o < current {
                    slot.store(o, Ordering::Relaxed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::test_util::{bootstrap_classes, mark_moving, small_core};

    #[test]
    fn test_layout_packs_sparse_page() {
        let core = small_core();
        let classes = bootstrap_classes(&core);
        let moving = &core.heap().moving;

        // A live node, a dead gap, another live node.
        let a_at = moving.alloc(24).unwrap();
        let a = object::format_instance(a_at, classes.node);
        moving.alloc(40).unwrap(); // dies unmarked
        let c_at = moving.alloc(24).unwrap();
        let c = object::format_instance(c_at, classes.node);
        assert_eq!(c_at, moving.begin() + 64usize);

        mark_moving(&core, a);
        mark_moving(&core, c);
        let b = moving.align_end();
        core.set_black_begin(b);

        core.prepare_for_compaction();

        assert_eq!(core.post_compact_end(), moving.begin() + BYTES_IN_PAGE);
        assert_eq!(core.moving_first_objs_count(), 1);
        assert_eq!(
            self_first_obj(&core, 0),
            a,
            "page 0 starts with the first live object"
        );
        assert_eq!(core.meta.first_offset_moving[0].load(Ordering::Relaxed), 0);

        // Translation packs the survivors.
        assert_eq!(core.post_compact(a), a);
        assert_eq!(
            core.post_compact(c).to_address(),
            moving.begin() + 24usize
        );
    }

    #[test]
    fn test_layout_object_exactly_at_page_boundary() {
        let core = small_core();
        let classes = bootstrap_classes(&core);
        let moving = &core.heap().moving;

        // An array that fills page 0 exactly, then a node.
        let a_at = moving.alloc(BYTES_IN_PAGE).unwrap();
        let a = object::format_array(
            a_at,
            classes.byte_array,
            BYTES_IN_PAGE - object::ARRAY_HEADER_BYTES,
        );
        let b_at = moving.alloc(24).unwrap();
        let b_obj = object::format_instance(b_at, classes.node);

        mark_moving(&core, a);
        mark_moving(&core, b_obj);
        core.set_black_begin(moving.align_end());

        core.prepare_for_compaction();

        assert_eq!(core.moving_first_objs_count(), 2);
        assert_eq!(self_first_obj(&core, 0), a);
        // The page-filling object is not the first object of page 1; the
        // next live object is.
        assert_eq!(self_first_obj(&core, 1), b_obj);
        assert_eq!(
            core.meta.first_offset_moving[1].load(Ordering::Relaxed),
            GRANULES_IN_PAGE
        );
    }

    #[test]
    fn test_layout_object_spanning_pages() {
        let core = small_core();
        let classes = bootstrap_classes(&core);
        let moving = &core.heap().moving;

        // One array spanning three pages.
        let a_at = moving.alloc(3 * BYTES_IN_PAGE).unwrap();
        let a = object::format_array(
            a_at,
            classes.byte_array,
            3 * BYTES_IN_PAGE - object::ARRAY_HEADER_BYTES,
        );
        mark_moving(&core, a);
        core.set_black_begin(moving.align_end());

        core.prepare_for_compaction();

        assert_eq!(core.moving_first_objs_count(), 3);
        for i in 0..3 {
            assert_eq!(self_first_obj(&core, i), a);
            assert_eq!(
                core.meta.first_offset_moving[i].load(Ordering::Relaxed),
                i * GRANULES_IN_PAGE,
                "first offset advances page by page through the object"
            );
        }
    }

    #[test]
    fn test_black_allocation_walk_records_first_chunk() {
        let core = small_core();
        let classes = bootstrap_classes(&core);
        let moving = &core.heap().moving;

        // Empty pre-mark region: the black boundary is the space begin.
        core.set_black_begin(moving.begin());

        // One shared block with two nodes, then a TLAB with one node and an
        // unused tail hole.
        let d_at = moving.alloc(24).unwrap();
        object::format_instance(d_at, classes.node);
        let e_at = moving.alloc(24).unwrap();
        object::format_instance(e_at, classes.node);
        let (tlab_begin, _end) = moving.carve_tlab(64).unwrap();
        object::format_instance(tlab_begin, classes.node);

        core.set_moving_top_at_pause(moving.top());
        core.prepare_for_compaction();
        core.update_moving_space_black_allocations();

        assert_eq!(core.moving_first_objs_count(), 0);
        assert_eq!(core.black_page_count(), 1);
        assert_eq!(
            self_first_obj(&core, 0).to_address(),
            d_at,
            "black page first object"
        );
        // Contiguous bytes from the page start: the shared block's 48.
        assert_eq!(
            core.meta.first_offset_moving[0].load(Ordering::Relaxed),
            48
        );
        // Black objects got mark bits so the slider can find the TLAB one.
        assert!(moving.mark_bitmap().test(tlab_begin));
    }

    #[test]
    fn test_non_moving_first_objects_and_empty_pages() {
        let core = small_core();
        let classes = bootstrap_classes(&core);
        let nm = &core.heap().nonmoving;

        // Leave page 0 to the classes; put one marked node on page 2.
        let hole = nm.alloc(2 * BYTES_IN_PAGE).unwrap();
        let obj_at = hole.align_up(BYTES_IN_PAGE) + BYTES_IN_PAGE;
        let o = object::format_instance(obj_at, classes.node);
        nm.publish(o);
        nm.mark_bitmap().set(obj_at);

        core.init_non_moving_space_first_objects();

        let page_of_o = (obj_at - nm.begin()) >> LOG_BYTES_IN_PAGE;
        assert_eq!(
            core.meta.first_obj_non_moving[page_of_o].load(Ordering::Relaxed),
            o
        );
        // The page before it has no marked object.
        assert!(core.meta.first_obj_non_moving[page_of_o - 1]
            .load(Ordering::Relaxed)
            .is_null());
    }

    fn self_first_obj(core: &CollectorCore, i: usize) -> ObjectReference {
        core.meta.first_obj_moving[i].load(Ordering::Relaxed)
    }
}
