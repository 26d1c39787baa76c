use atomic_traits::Atomic;
use bytemuck::NoUninit;

use std::fmt;
use std::ops::*;
use std::sync::atomic::Ordering;

use crate::util::{ByteOffset, ByteSize};

/// Address represents an arbitrary address. This is designed to represent
/// address and do address arithmetic mostly in a safe way, and to allow
/// mark some operations as unsafe. This type needs to be zero overhead
/// (memory wise and time wise). The idea is from the paper
/// High-level Low-level Programming (VEE09) and JikesRVM.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq, NoUninit)]
pub struct Address(usize);

/// Address + ByteSize (positive)
impl Add<ByteSize> for Address {
    type Output = Address;
    fn add(self, offset: ByteSize) -> Address {
        Address(self.0 + offset)
    }
}

/// Address += ByteSize (positive)
impl AddAssign<ByteSize> for Address {
    fn add_assign(&mut self, offset: ByteSize) {
        self.0 += offset;
    }
}

/// Address + ByteOffset (positive or negative)
impl Add<ByteOffset> for Address {
    type Output = Address;
    fn add(self, offset: ByteOffset) -> Address {
        Address((self.0 as isize + offset) as usize)
    }
}

/// Address - ByteSize (positive)
impl Sub<ByteSize> for Address {
    type Output = Address;
    fn sub(self, offset: ByteSize) -> Address {
        Address(self.0 - offset)
    }
}

/// Address - Address (the first address must be higher)
impl Sub<Address> for Address {
    type Output = ByteSize;
    fn sub(self, other: Address) -> ByteSize {
        debug_assert!(
            self.0 >= other.0,
            "for (addr_a - addr_b), a({}) needs to be larger than b({})",
            self,
            other
        );
        self.0 - other.0
    }
}

/// Address & mask
impl BitAnd<usize> for Address {
    type Output = usize;
    fn bitand(self, other: usize) -> usize {
        self.0 & other
    }
}

/// Address >> shift (get an index)
impl Shr<usize> for Address {
    type Output = usize;
    fn shr(self, shift: usize) -> usize {
        self.0 >> shift
    }
}

impl Address {
    /// The lowest possible address.
    pub const ZERO: Self = Address(0);

    /// creates Address from a pointer
    pub fn from_ptr<T>(ptr: *const T) -> Address {
        Address(ptr as usize)
    }

    /// creates Address from a mutable pointer
    pub fn from_mut_ptr<T>(ptr: *mut T) -> Address {
        Address(ptr as usize)
    }

    /// creates an Address from a usize.
    ///
    /// # Safety
    /// The binding or the collector is responsible for ensuring the usize
    /// value is indeed a valid address when it is dereferenced later.
    pub const unsafe fn from_usize(raw: usize) -> Address {
        Address(raw)
    }

    /// Gets the numeric value of the address.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Is the address zero?
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Aligns up the address to the given alignment (a power of two).
    pub const fn align_up(self, align: ByteSize) -> Address {
        debug_assert!(align.is_power_of_two());
        Address((self.0 + align - 1) & !(align - 1))
    }

    /// Aligns down the address to the given alignment (a power of two).
    pub const fn align_down(self, align: ByteSize) -> Address {
        debug_assert!(align.is_power_of_two());
        Address(self.0 & !(align - 1))
    }

    /// Is this address aligned to the given alignment?
    pub const fn is_aligned_to(self, align: ByteSize) -> bool {
        debug_assert!(align.is_power_of_two());
        self.0 & (align - 1) == 0
    }

    /// converts the Address to a const pointer
    pub fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// converts the Address to a mutable pointer
    pub fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Loads a value of type T from the address.
    ///
    /// # Safety
    /// The caller must guarantee the address is valid, mapped, and properly
    /// aligned for T.
    pub unsafe fn load<T: Copy>(self) -> T {
        *(self.0 as *const T)
    }

    /// Stores a value of type T to the address.
    ///
    /// # Safety
    /// The caller must guarantee the address is valid, mapped, and properly
    /// aligned for T.
    pub unsafe fn store<T>(self, value: T) {
        *(self.0 as *mut T) = value;
    }

    /// Atomically loads a value of type `T::Type` from the address.
    ///
    /// # Safety
    /// The caller must guarantee the address is valid and aligned for T.
    pub unsafe fn atomic_load<T: Atomic>(self, order: Ordering) -> T::Type {
        let loc = &*(self.0 as *const T);
        loc.load(order)
    }

    /// Atomically stores a value of type `T::Type` to the address.
    ///
    /// # Safety
    /// The caller must guarantee the address is valid and aligned for T.
    pub unsafe fn atomic_store<T: Atomic>(self, value: T::Type, order: Ordering) {
        let loc = &*(self.0 as *const T);
        loc.store(value, order)
    }

    /// Atomic compare-exchange on the value at the address.
    ///
    /// # Safety
    /// The caller must guarantee the address is valid and aligned for T.
    pub unsafe fn compare_exchange<T: Atomic>(
        self,
        old: T::Type,
        new: T::Type,
        success: Ordering,
        failure: Ordering,
    ) -> Result<T::Type, T::Type> {
        let loc = &*(self.0 as *const T);
        loc.compare_exchange(old, new, success, failure)
    }
}

impl fmt::UpperHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// ObjectReference represents a managed object by the address of its header
/// word (the class word).  A null reference is the zero address.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq, NoUninit)]
pub struct ObjectReference(Address);

impl ObjectReference {
    /// The null reference.
    pub const NULL: ObjectReference = ObjectReference(Address::ZERO);

    /// converts an address to an object reference
    pub fn from_address(addr: Address) -> ObjectReference {
        ObjectReference(addr)
    }

    /// returns the address of the object header
    pub const fn to_address(self) -> Address {
        self.0
    }

    /// is this a null reference?
    pub const fn is_null(self) -> bool {
        self.0.is_zero()
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
