extern crate uffd_compact;

use uffd_compact::{Address, ObjectReference};

#[test]
fn test_align_up() {
    let addr = unsafe { Address::from_usize(0) };
    let aligned = addr.align_up(8);

    assert_eq!(addr, aligned);

    let addr = unsafe { Address::from_usize(1) };
    assert_eq!(addr.align_up(8), unsafe { Address::from_usize(8) });
}

#[test]
fn test_is_aligned() {
    let addr = unsafe { Address::from_usize(0) };
    assert!(addr.is_aligned_to(8));

    let addr = unsafe { Address::from_usize(8) };
    assert!(addr.is_aligned_to(8));

    let addr = unsafe { Address::from_usize(12) };
    assert!(!addr.is_aligned_to(8));
    assert!(addr.is_aligned_to(4));
}

#[test]
fn test_arithmetic_and_ordering() {
    let base = unsafe { Address::from_usize(0x1000) };
    let higher = base + 0x20usize;
    assert_eq!(higher - base, 0x20);
    assert!(higher > base);
    assert_eq!(higher + (-0x20isize), base);
}

#[test]
fn test_object_reference_null() {
    assert!(ObjectReference::NULL.is_null());
    let base = unsafe { Address::from_usize(0x1000) };
    let o = ObjectReference::from_address(base);
    assert!(!o.is_null());
    assert_eq!(o.to_address(), base);
}
