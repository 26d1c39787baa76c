//! Concurrent compaction driven by real userfaultfd faults.  These tests
//! skip themselves on kernels without userfaultfd or MREMAP_DONTUNMAP; the
//! collector then falls back to stop-the-world, which tests/compaction.rs
//! already covers.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::*;
use uffd_compact::object;
use uffd_compact::Options;

fn concurrent_runtime() -> TestRuntime {
    TestRuntime::with_options(Options::default())
}

#[test]
fn test_concurrent_cycle_compacts() {
    let rt = concurrent_runtime();
    let s = rt.moving_begin();

    let a = rt.new_node(1);
    rt.new_node(999); // garbage
    let b = rt.new_node(2);
    rt.gc.write_ref(a, NODE_REF_WORD, b);
    let ra = rt.root(a);
    let rb = rt.root(b);

    rt.gc.run_phases();
    if rt.gc.last_cycle_was_fallback() {
        eprintln!("concurrent compaction unavailable; skipping");
        return;
    }

    let new_a = rt.read_root(ra);
    let new_b = rt.read_root(rb);
    assert_eq!(new_a.to_address(), s);
    assert_eq!(new_b.to_address(), s + NODE_SIZE);
    // Reading through the moving space after the cycle sees installed pages.
    assert_eq!(rt.tag_of(new_a), 1);
    assert_eq!(rt.tag_of(new_b), 2);
    assert_eq!(rt.field_of(new_a, NODE_REF_WORD), new_b);
}

#[test]
fn test_mutator_faults_mid_compaction() {
    let rt = concurrent_runtime();

    // A chain of nodes with recognizable tags, padded with garbage so the
    // survivors churn across pages.
    let mut prev = rt.new_node(0);
    let mut chain = vec![prev];
    for i in 1..512usize {
        rt.gc.alloc_moving_shared(120).unwrap(); // garbage
        let n = rt.new_node(i);
        rt.gc.write_ref(n, NODE_REF_WORD, prev);
        prev = n;
        chain.push(n);
    }
    let head = rt.root(prev);

    // A mutator thread walks the chain through its root, taking the shared
    // mutator lock per iteration so the pauses can fence it out.  Its reads
    // of relocated pages must fault and block until each page is installed.
    let stop = Arc::new(AtomicBool::new(false));
    let gc = rt.gc.clone();
    let head_cell: &'static std::sync::atomic::AtomicUsize = head;
    let stop2 = stop.clone();
    let walker = std::thread::spawn(move || {
        let mut walks = 0usize;
        while !stop2.load(Ordering::Acquire) {
            let _shared = gc.threads().shared();
            let mut cursor = uffd_compact::ObjectReference::from_address(unsafe {
                uffd_compact::Address::from_usize(head_cell.load(Ordering::Acquire))
            });
            let mut expect = 511usize;
            while !cursor.is_null() {
                let tag = unsafe {
                    (cursor.to_address() + NODE_TAG_WORD * WORD).load::<usize>()
                };
                assert_eq!(tag, expect, "chain tag mismatch during compaction");
                expect = expect.wrapping_sub(1);
                cursor = object::read_ref_field(cursor, NODE_REF_WORD);
            }
            walks += 1;
            drop(_shared);
            // Give the pauses a chance to take the lock exclusively.
            std::thread::sleep(std::time::Duration::from_micros(200));
        }
        walks
    });

    rt.gc.run_phases();
    let fallback = rt.gc.last_cycle_was_fallback();
    // Let the walker observe the fully compacted heap for a moment.
    std::thread::sleep(std::time::Duration::from_millis(20));
    stop.store(true, Ordering::Release);
    let walks = walker.join().unwrap();
    assert!(walks > 0, "the walker must have completed traversals");

    if fallback {
        eprintln!("concurrent compaction unavailable; ran as stop-the-world");
        return;
    }

    // Post-compaction integrity of the whole chain.
    let mut cursor = rt.read_root(head);
    let mut expect = 511usize;
    while !cursor.is_null() {
        assert_eq!(rt.tag_of(cursor), expect);
        expect = expect.wrapping_sub(1);
        cursor = rt.field_of(cursor, NODE_REF_WORD);
    }
    assert_eq!(expect, usize::MAX, "chain fully traversed");
    let _ = chain;
}

#[test]
fn test_two_concurrent_cycles_back_to_back() {
    let rt = concurrent_runtime();

    let keep = rt.new_string("survives two relocations");
    rt.new_node(999);
    let r = rt.root(keep);

    rt.gc.run_phases();
    let mid = rt.read_root(r);
    assert_eq!(rt.string_content(mid), "survives two relocations");

    rt.new_node(998); // more garbage for the second cycle
    rt.gc.run_phases();
    let fin = rt.read_root(r);
    assert_eq!(rt.string_content(fin), "survives two relocations");
    assert_eq!(rt.gc.cycle_count(), 2);
}
