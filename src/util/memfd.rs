//! Anonymous shared memory backed by a memfd.
//!
//! Used to stand up a writable copy of a status page that can be mapped a
//! second time, read-only, the same way the scheduler's device is.

use std::ffi::CString;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use libc::c_char;
use libc::c_int;
use libc::c_uint;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;
use nix::sys::mman::mmap;
use nix::sys::mman::munmap;
use nix::unistd::ftruncate;

unsafe extern "C" {
    fn memfd_create(name: *const c_char, flags: c_uint) -> c_int;
}

/// Size of a page on this system.
pub fn page_size() -> Result<usize> {
    let size = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .with_context(|| "unable to query page size")?
        .ok_or_else(|| anyhow!("page size is not defined"))?;
    Ok(size as usize)
}

/// Round `size` up to a whole number of pages.
pub fn page_align(size: usize) -> Result<usize> {
    let page = page_size()?;
    Ok(size.max(1).div_ceil(page) * page)
}

/// A memfd mapped read-write into this process.
pub struct MemFd {
    fd: OwnedFd,
    data: *mut u8,
    size: usize,
}

impl MemFd {
    /// Create a new memfd of at least `size` bytes, zero-filled.
    ///
    /// # Arguments
    ///
    /// * `name` - Name of the memfd, visible in /proc/<pid>/fd
    /// * `size` - Minimum size in bytes; rounded up to a whole page
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let size = page_align(size)?;
        let c_name = CString::new(name).with_context(|| format!("invalid memfd name: {name}"))?;

        let raw = unsafe { memfd_create(c_name.as_ptr(), 0) };
        if raw == -1 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("unable to create memfd {name}"));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        ftruncate(&fd, size as i64).with_context(|| format!("unable to size memfd {name}"))?;

        let length = NonZeroUsize::new(size).ok_or_else(|| anyhow!("empty memfd"))?;
        let data = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                Some(&fd),
                0,
            )
        }
        .with_context(|| format!("unable to map memfd {name}"))?;

        Ok(MemFd {
            fd,
            data: data as *mut u8,
            size,
        })
    }

    /// Size of the mapping in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Store `value` at `offset` bytes into the mapping.
    ///
    /// Writes are volatile so that another mapping of the same memfd observes
    /// each one.
    pub fn store<T: Copy>(&self, offset: usize, value: T) -> Result<()> {
        let end = offset
            .checked_add(std::mem::size_of::<T>())
            .ok_or_else(|| anyhow!("store offset overflows"))?;
        if end > self.size {
            return Err(anyhow!(
                "store of {} bytes at {offset} exceeds memfd size {}",
                std::mem::size_of::<T>(),
                self.size
            ));
        }
        if offset % std::mem::align_of::<T>() != 0 {
            return Err(anyhow!("misaligned store at {offset}"));
        }
        unsafe { std::ptr::write_volatile(self.data.add(offset) as *mut T, value) };
        Ok(())
    }
}

impl AsFd for MemFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for MemFd {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.data as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memfd_create() {
        let memfd = MemFd::create("cpmd-test", 100).unwrap();
        assert_eq!(memfd.size(), page_size().unwrap());
        memfd.store(0, 42u64).unwrap();
        memfd.store(8, 43u32).unwrap();
    }

    #[test]
    fn test_store_bounds() {
        let memfd = MemFd::create("cpmd-test", 1).unwrap();
        let size = memfd.size();
        assert!(memfd.store(size - 8, 1u64).is_ok());
        assert!(memfd.store(size - 4, 1u64).is_err());
        assert!(memfd.store(4, 1u64).is_err());
    }
}
