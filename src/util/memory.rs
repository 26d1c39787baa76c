//! Thin wrappers over the kernel memory interface.
//!
//! Every wrapper returns `std::io::Result`; callers decide which `errno`
//! values are tolerable.  The collector treats any unexpected failure from
//! these calls as fatal, because half-migrated page tables cannot be safely
//! rewound.

use std::io::Result;
use std::os::unix::io::RawFd;

use crate::util::Address;

/// Set a range of memory to zero.
pub fn zero(start: Address, len: usize) {
    unsafe {
        std::ptr::write_bytes(start.to_mut_ptr::<u8>(), 0, len);
    }
}

/// Copy a range of memory. The ranges must not overlap.
pub fn copy(dst: Address, src: Address, len: usize) {
    unsafe {
        std::ptr::copy_nonoverlapping(src.to_ptr::<u8>(), dst.to_mut_ptr::<u8>(), len);
    }
}

pub fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// The protection flags for mmap/mprotect.
#[repr(i32)]
#[derive(Debug, Copy, Clone)]
pub enum MmapProtection {
    /// Allow read + write
    ReadWrite,
    /// Allow read only
    ReadOnly,
    /// Do not allow any access
    NoAccess,
}

impl MmapProtection {
    fn get_native_flags(&self) -> i32 {
        use libc::{PROT_NONE, PROT_READ, PROT_WRITE};
        match self {
            Self::ReadWrite => PROT_READ | PROT_WRITE,
            Self::ReadOnly => PROT_READ,
            Self::NoAccess => PROT_NONE,
        }
    }
}

/// Map an anonymous private region at a kernel-chosen address.
pub fn mmap_anywhere(size: usize, prot: MmapProtection, name: &str) -> Result<Address> {
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            prot.get_native_flags(),
            flags,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    let addr = Address::from_mut_ptr(ptr);
    set_vma_name(addr, size, name);
    Ok(addr)
}

/// Map a shared region backed by the given memfd at a kernel-chosen address.
pub fn mmap_memfd(fd: RawFd, size: usize, prot: MmapProtection, name: &str) -> Result<Address> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            prot.get_native_flags(),
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    let addr = Address::from_mut_ptr(ptr);
    set_vma_name(addr, size, name);
    Ok(addr)
}

/// Map a shared memfd-backed region over `[at, at+size)`, replacing whatever
/// mapping is there.
pub fn mmap_memfd_fixed(
    fd: RawFd,
    at: Address,
    size: usize,
    prot: MmapProtection,
    name: &str,
) -> Result<()> {
    let ptr = unsafe {
        libc::mmap(
            at.to_mut_ptr(),
            size,
            prot.get_native_flags(),
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    debug_assert_eq!(Address::from_mut_ptr(ptr), at);
    set_vma_name(at, size, name);
    Ok(())
}

/// Create a memfd of the given size.
pub fn memfd_create(name: &str, size: usize) -> Result<RawFd> {
    let cname = std::ffi::CString::new(name).unwrap();
    let fd = unsafe { libc::memfd_create(cname.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if let Err(e) = wrap_libc_call(&|| unsafe { libc::ftruncate(fd, size as libc::off_t) }, 0) {
        unsafe { libc::close(fd) };
        return Err(e);
    }
    Ok(fd)
}

/// Unmap a memory region.
pub fn munmap(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
}

/// Change the protection of a memory region.
pub fn mprotect(start: Address, size: usize, prot: MmapProtection) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::mprotect(start.to_mut_ptr(), size, prot.get_native_flags()) },
        0,
    )
}

/// Release the physical pages of a region back to the kernel. The virtual
/// mapping stays; subsequent reads return zero pages (or fault, if the range
/// is registered with userfaultfd in missing mode).
pub fn madvise_dontneed(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::madvise(start.to_mut_ptr(), size, libc::MADV_DONTNEED) },
        0,
    )
}

/// Punch a hole in a memfd-backed region, freeing the backing pages.
pub fn punch_hole(fd: RawFd, offset: usize, len: usize) -> Result<()> {
    wrap_libc_call(
        &|| unsafe {
            libc::fallocate(
                fd,
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                len as libc::off_t,
            )
        },
        0,
    )
}

// Not exported by every libc version the crate builds against.
const MREMAP_DONTUNMAP: libc::c_int = 4;

/// Move the page tables of `[src, src+size)` to `[dst, dst+size)` without
/// unmapping the source.  After the call the source range is still mapped but
/// its pages are zapped: with a userfaultfd missing-mode registration every
/// read of the source faults, while the destination carries the original
/// contents.  Requires Linux >= 5.13 (or a backport).
pub fn mremap_dontunmap(src: Address, dst: Address, size: usize) -> Result<()> {
    let flags = libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED | MREMAP_DONTUNMAP;
    let ptr = unsafe {
        libc::mremap(
            src.to_mut_ptr(),
            size,
            size,
            flags,
            dst.to_mut_ptr::<libc::c_void>(),
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    debug_assert_eq!(Address::from_mut_ptr(ptr), dst);
    Ok(())
}

/// Probe whether the running kernel supports `MREMAP_DONTUNMAP`.
pub fn has_mremap_dontunmap() -> bool {
    let page = crate::util::constants::BYTES_IN_PAGE;
    let Ok(src) = mmap_anywhere(page, MmapProtection::ReadWrite, "uffdc:probe:src") else {
        return false;
    };
    let Ok(dst) = mmap_anywhere(page, MmapProtection::NoAccess, "uffdc:probe:dst") else {
        let _ = munmap(src, page);
        return false;
    };
    let supported = mremap_dontunmap(src, dst, page).is_ok();
    let _ = munmap(src, page);
    let _ = munmap(dst, page);
    supported
}

/// Annotate a mapping with a human-readable name via `PR_SET_VMA`.
///
/// `PR_SET_VMA` is new in Linux 5.17.  When running on an older kernel the
/// prctl returns `EINVAL`; since this is only a debugging aid we log the
/// error instead of failing the mapping.
pub fn set_vma_name(start: Address, size: usize, name: &str) {
    let cname = std::ffi::CString::new(name).unwrap();
    let result = wrap_libc_call(
        &|| unsafe {
            libc::prctl(
                libc::PR_SET_VMA,
                libc::PR_SET_VMA_ANON_NAME,
                start.to_ptr::<libc::c_void>(),
                size,
                cname.as_ptr(),
            )
        },
        0,
    );
    if let Err(e) = result {
        debug!("Error while calling prctl: {e}");
    }
}

/// Get the memory maps for the process. The returned string is a multi-line
/// string.  Only meant for diagnostics, e.g. dumped before a fatal abort.
pub fn get_process_memory_maps() -> Result<String> {
    use std::fs::File;
    use std::io::Read;
    let mut data = String::new();
    let mut f = File::open("/proc/self/maps")?;
    f.read_to_string(&mut data)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_PAGE;

    #[test]
    fn test_mmap_zero_copy_munmap() {
        let size = 4 * BYTES_IN_PAGE;
        let a = mmap_anywhere(size, MmapProtection::ReadWrite, "uffdc:test").unwrap();
        let b = mmap_anywhere(size, MmapProtection::ReadWrite, "uffdc:test").unwrap();
        unsafe { a.store::<usize>(0xdead_beef) };
        copy(b, a, size);
        assert_eq!(unsafe { b.load::<usize>() }, 0xdead_beef);
        zero(b, size);
        assert_eq!(unsafe { b.load::<usize>() }, 0);
        munmap(a, size).unwrap();
        munmap(b, size).unwrap();
    }

    #[test]
    fn test_madvise_dontneed_zeroes() {
        let size = BYTES_IN_PAGE;
        let a = mmap_anywhere(size, MmapProtection::ReadWrite, "uffdc:test").unwrap();
        unsafe { a.store::<usize>(42) };
        madvise_dontneed(a, size).unwrap();
        assert_eq!(unsafe { a.load::<usize>() }, 0);
        munmap(a, size).unwrap();
    }

    #[test]
    fn test_mremap_dontunmap_probe_is_stable() {
        // Whatever the kernel supports, probing twice must agree.
        assert_eq!(has_mremap_dontunmap(), has_mremap_dontunmap());
    }
}
