//! The userfaultfd driver.
//!
//! [`UserFaultFd`] owns the file descriptor and exposes the handful of
//! operations the collector needs: feature negotiation, range registration,
//! and the COPY/ZEROPAGE/CONTINUE/WAKE installs.  Tolerated kernel
//! conditions (`EEXIST` when another thread installed a page first, `ENOENT`
//! on a shutdown-race wake, `EAGAIN` with partial progress) are absorbed
//! here; every other error is surfaced and treated as fatal by the caller.

pub mod sys;

use std::io::{Error, ErrorKind, Result};
use std::os::unix::io::RawFd;

use crate::util::Address;

/// How a fault was delivered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// The page has no backing (missing mode).
    Missing,
    /// The page has backing but no page-table entry (minor mode).
    Minor,
}

#[derive(Copy, Clone, Debug)]
pub struct FaultEvent {
    pub address: Address,
    pub is_write: bool,
    pub kind: FaultKind,
}

pub struct UserFaultFd {
    fd: RawFd,
    features: u64,
}

fn errno() -> i32 {
    Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl UserFaultFd {
    /// Open a userfaultfd and negotiate `requested` features on top of the
    /// baseline (missing faults on anonymous memory).  Unsupported requested
    /// features are dropped: the caller inspects [`UserFaultFd::features`]
    /// to decide which compaction mode is actually available.
    pub fn try_open(requested: u64) -> Result<UserFaultFd> {
        // Unprivileged userfaultfd may be restricted to user-mode faults;
        // try the restricted form first and fall back for older kernels.
        let mut raw = sys::userfaultfd(libc::O_CLOEXEC | sys::UFFD_USER_MODE_ONLY);
        if raw < 0 && errno() == libc::EINVAL {
            raw = sys::userfaultfd(libc::O_CLOEXEC);
        }
        if raw < 0 {
            return Err(Error::last_os_error());
        }
        let mut api = sys::uffdio_api {
            api: sys::UFFD_API,
            features: requested,
            ..Default::default()
        };
        let ret = unsafe { libc::ioctl(raw, sys::UFFDIO_API_IOCTL, &mut api) };
        if ret != 0 {
            // The kernel rejects the whole handshake if any requested
            // feature is unknown; retry with the baseline.
            unsafe { libc::close(raw) };
            raw = sys::userfaultfd(libc::O_CLOEXEC | sys::UFFD_USER_MODE_ONLY);
            if raw < 0 {
                raw = sys::userfaultfd(libc::O_CLOEXEC);
            }
            if raw < 0 {
                return Err(Error::last_os_error());
            }
            api = sys::uffdio_api {
                api: sys::UFFD_API,
                ..Default::default()
            };
            let ret = unsafe { libc::ioctl(raw, sys::UFFDIO_API_IOCTL, &mut api) };
            if ret != 0 {
                let e = Error::last_os_error();
                unsafe { libc::close(raw) };
                return Err(e);
            }
            // The baseline handshake enabled nothing beyond missing faults.
            api.features = 0;
        }
        // The handshake reports every supported feature; only the requested
        // ones are enabled on this descriptor.
        let enabled = api.features & requested;
        debug!(
            "userfaultfd open: fd {} enabled {:#x} (requested {:#x})",
            raw, enabled, requested
        );
        Ok(UserFaultFd {
            fd: raw,
            features: enabled,
        })
    }

    pub fn features(&self) -> u64 {
        self.features
    }

    pub fn supports(&self, feature: u64) -> bool {
        self.features & feature == feature
    }

    fn register(&self, start: Address, len: usize, mode: u64) -> Result<()> {
        let mut reg = sys::uffdio_register {
            range: sys::uffdio_range {
                start: start.as_usize() as u64,
                len: len as u64,
            },
            mode,
            ..Default::default()
        };
        let ret = unsafe { libc::ioctl(self.fd, sys::UFFDIO_REGISTER, &mut reg) };
        if ret != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// Register `[start, start+len)` for missing faults.
    pub fn register_missing(&self, start: Address, len: usize) -> Result<()> {
        self.register(start, len, sys::UFFDIO_REGISTER_MODE_MISSING)
    }

    /// Register `[start, start+len)` for missing and minor faults.
    pub fn register_minor(&self, start: Address, len: usize) -> Result<()> {
        self.register(
            start,
            len,
            sys::UFFDIO_REGISTER_MODE_MISSING | sys::UFFDIO_REGISTER_MODE_MINOR,
        )
    }

    pub fn unregister(&self, start: Address, len: usize) -> Result<()> {
        let mut range = sys::uffdio_range {
            start: start.as_usize() as u64,
            len: len as u64,
        };
        let ret = unsafe { libc::ioctl(self.fd, sys::UFFDIO_UNREGISTER, &mut range) };
        if ret != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// Install `len` bytes at `dst` by copying from `src`, atomically waking
    /// waiters.  `EEXIST` means another thread installed the page first and
    /// is not an error.
    pub fn copy(&self, dst: Address, src: Address, len: usize) -> Result<()> {
        let mut arg = sys::uffdio_copy {
            dst: dst.as_usize() as u64,
            src: src.as_usize() as u64,
            len: len as u64,
            mode: 0,
            copy: 0,
        };
        loop {
            let ret = unsafe { libc::ioctl(self.fd, sys::UFFDIO_COPY, &mut arg) };
            if ret == 0 {
                return Ok(());
            }
            match errno() {
                libc::EEXIST => return Ok(()),
                libc::EAGAIN => {
                    // Partial progress; `copy` holds bytes already installed.
                    let done = if arg.copy > 0 { arg.copy as u64 } else { 0 };
                    if done >= arg.len {
                        return Ok(());
                    }
                    arg.dst += done;
                    arg.src += done;
                    arg.len -= done;
                    arg.copy = 0;
                }
                _ => return Err(Error::last_os_error()),
            }
        }
    }

    /// Install a zero page at `[start, start+len)`.  `EEXIST` is tolerated.
    pub fn zeropage(&self, start: Address, len: usize) -> Result<()> {
        let mut arg = sys::uffdio_zeropage {
            range: sys::uffdio_range {
                start: start.as_usize() as u64,
                len: len as u64,
            },
            mode: 0,
            zeropage: 0,
        };
        let ret = unsafe { libc::ioctl(self.fd, sys::UFFDIO_ZEROPAGE, &mut arg) };
        if ret == 0 || errno() == libc::EEXIST {
            return Ok(());
        }
        Err(Error::last_os_error())
    }

    /// Resolve a minor fault: install the page-table entry for the backing
    /// page already present in the page cache.  `EEXIST` is tolerated;
    /// `EAGAIN` with partial `mapped` progress is retried.
    pub fn continue_mapping(&self, start: Address, len: usize) -> Result<()> {
        let mut arg = sys::uffdio_continue {
            range: sys::uffdio_range {
                start: start.as_usize() as u64,
                len: len as u64,
            },
            mode: 0,
            mapped: 0,
        };
        loop {
            let ret = unsafe { libc::ioctl(self.fd, sys::UFFDIO_CONTINUE, &mut arg) };
            if ret == 0 {
                return Ok(());
            }
            match errno() {
                libc::EEXIST => return Ok(()),
                libc::EAGAIN => {
                    let done = if arg.mapped > 0 { arg.mapped as u64 } else { 0 };
                    if done >= arg.range.len {
                        return Ok(());
                    }
                    arg.range.start += done;
                    arg.range.len -= done;
                    arg.mapped = 0;
                }
                _ => return Err(Error::last_os_error()),
            }
        }
    }

    /// Wake any thread faulted on the range.  `ENOENT` can only happen in
    /// the shutdown race where the range was already unregistered; tolerated.
    pub fn wake(&self, start: Address, len: usize) -> Result<()> {
        let mut range = sys::uffdio_range {
            start: start.as_usize() as u64,
            len: len as u64,
        };
        let ret = unsafe { libc::ioctl(self.fd, sys::UFFDIO_WAKE, &mut range) };
        if ret == 0 || errno() == libc::ENOENT {
            return Ok(());
        }
        Err(Error::last_os_error())
    }

    /// Block until a fault message arrives.  Non-pagefault events (which the
    /// collector never enables) are skipped.
    pub fn read_event(&self) -> Result<FaultEvent> {
        loop {
            let mut msg = std::mem::MaybeUninit::<sys::uffd_msg>::uninit();
            let n = unsafe {
                libc::read(
                    self.fd,
                    msg.as_mut_ptr() as *mut libc::c_void,
                    std::mem::size_of::<sys::uffd_msg>(),
                )
            };
            if n < 0 {
                if errno() == libc::EINTR {
                    continue;
                }
                return Err(Error::last_os_error());
            }
            if n as usize != std::mem::size_of::<sys::uffd_msg>() {
                return Err(Error::new(ErrorKind::UnexpectedEof, "short uffd read"));
            }
            let msg = unsafe { msg.assume_init() };
            if msg.event != sys::UFFD_EVENT_PAGEFAULT {
                debug!("ignoring uffd event {:#x}", msg.event);
                continue;
            }
            let flags = msg.pagefault.flags;
            return Ok(FaultEvent {
                address: unsafe { Address::from_usize(msg.pagefault.address as usize) },
                is_write: flags & sys::UFFD_PAGEFAULT_FLAG_WRITE != 0,
                kind: if flags & sys::UFFD_PAGEFAULT_FLAG_MINOR != 0 {
                    FaultKind::Minor
                } else {
                    FaultKind::Missing
                },
            });
        }
    }
}

impl Drop for UserFaultFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_PAGE;
    use crate::util::memory::{self, MmapProtection};

    #[test]
    fn test_missing_fault_round_trip() {
        let Ok(uffd) = UserFaultFd::try_open(0) else {
            eprintln!("userfaultfd unavailable; skipping");
            return;
        };
        let region =
            memory::mmap_anywhere(BYTES_IN_PAGE, MmapProtection::ReadWrite, "uffdc:test").unwrap();
        memory::madvise_dontneed(region, BYTES_IN_PAGE).unwrap();
        uffd.register_missing(region, BYTES_IN_PAGE).unwrap();

        let src =
            memory::mmap_anywhere(BYTES_IN_PAGE, MmapProtection::ReadWrite, "uffdc:test").unwrap();
        unsafe { src.store::<usize>(0x5ca1_ab1e) };

        let region_raw = region.as_usize();
        let reader = std::thread::spawn(move || {
            let addr = unsafe { Address::from_usize(region_raw) };
            unsafe { addr.load::<usize>() }
        });

        let event = uffd.read_event().unwrap();
        assert_eq!(event.kind, FaultKind::Missing);
        assert_eq!(
            event.address.align_down(BYTES_IN_PAGE),
            region,
            "fault must land in the registered page"
        );
        uffd.copy(region, src, BYTES_IN_PAGE).unwrap();

        assert_eq!(reader.join().unwrap(), 0x5ca1_ab1e);
        uffd.unregister(region, BYTES_IN_PAGE).unwrap();
        memory::munmap(region, BYTES_IN_PAGE).unwrap();
        memory::munmap(src, BYTES_IN_PAGE).unwrap();
    }

    #[test]
    fn test_copy_tolerates_already_mapped() {
        let Ok(uffd) = UserFaultFd::try_open(0) else {
            eprintln!("userfaultfd unavailable; skipping");
            return;
        };
        let region =
            memory::mmap_anywhere(BYTES_IN_PAGE, MmapProtection::ReadWrite, "uffdc:test").unwrap();
        memory::madvise_dontneed(region, BYTES_IN_PAGE).unwrap();
        uffd.register_missing(region, BYTES_IN_PAGE).unwrap();
        let src =
            memory::mmap_anywhere(BYTES_IN_PAGE, MmapProtection::ReadWrite, "uffdc:test").unwrap();
        uffd.copy(region, src, BYTES_IN_PAGE).unwrap();
        // Second install of the same page must be a tolerated no-op.
        uffd.copy(region, src, BYTES_IN_PAGE).unwrap();
        uffd.zeropage(region, BYTES_IN_PAGE).unwrap();
        uffd.unregister(region, BYTES_IN_PAGE).unwrap();
        memory::munmap(region, BYTES_IN_PAGE).unwrap();
        memory::munmap(src, BYTES_IN_PAGE).unwrap();
    }
}
