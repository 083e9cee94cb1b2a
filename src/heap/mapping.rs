//! RAII guard over an mmap'd buffer region.
//!
//! The allocator driver does not unmap on fd close; the owner of the
//! mapping has to munmap it. Holding the mapping in a guard makes every
//! partial-failure path in the open sequence unwind correctly without
//! hand-rolled cleanup chains.

use crate::error::{Error, Result};
use rustix::fd::BorrowedFd;
use rustix::mm::{MapFlags, ProtFlags};
use std::ptr::NonNull;

/// A shared, offset-0 memory mapping of a buffer fd, unmapped on drop.
pub struct Mapping {
    /// Base of the mapped region.
    ptr: NonNull<u8>,
    /// Length of the mapped region.
    len: usize,
    /// Whether the mapping was established without write access.
    read_only: bool,
}

impl Mapping {
    /// Map `len` bytes of `fd` shared at offset 0.
    ///
    /// # Arguments
    ///
    /// * `fd` - The buffer fd to map (typically the share-ioctl export).
    /// * `len` - Length in bytes; callers pass the page-rounded size.
    /// * `read_only` - Map without `PROT_WRITE`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MappingFailed`] carrying the mmap errno.
    pub fn map_shared(fd: BorrowedFd<'_>, len: usize, read_only: bool) -> Result<Self> {
        let prot = if read_only {
            ProtFlags::READ
        } else {
            ProtFlags::READ | ProtFlags::WRITE
        };

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                MapFlags::SHARED,
                fd,
                0,
            )
            .map_err(Error::MappingFailed)?
        };

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or(Error::MappingFailed(rustix::io::Errno::FAULT))?;

        Ok(Self {
            ptr,
            len,
            read_only,
        })
    }

    /// Base pointer of the mapped region.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Mutable base pointer, or `None` for read-only mappings.
    #[inline]
    pub fn as_mut_ptr(&self) -> Option<*mut u8> {
        if self.read_only {
            None
        } else {
            Some(self.ptr.as_ptr())
        }
    }

    /// Length of the mapped region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the mapping has zero length.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this mapping was established without write access.
    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// The mapped region as a byte slice.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes for the life of the mapping.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The mapped region as a mutable byte slice.
    ///
    /// Returns `None` if the mapping is read-only.
    #[inline]
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        if self.read_only {
            None
        } else {
            // SAFETY: ptr is valid for len bytes, we have &mut self.
            Some(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) })
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe a mapping we own and have not unmapped.
        if let Err(errno) = unsafe { rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len) } {
            tracing::warn!(len = self.len, error = %errno, "munmap failed during teardown");
        }
    }
}

// SAFETY: the mapping is just a pointer and length into kernel-managed
// shared pages; moving it between threads is fine. Not Sync: the handle
// lifecycle is single-owner and mutation is only checked by &mut.
unsafe impl Send for Mapping {}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("ptr", &self.ptr.as_ptr())
            .field("len", &self.len)
            .field("read_only", &self.read_only)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::fd::AsFd;

    fn backing_fd(len: u64) -> rustix::fd::OwnedFd {
        let fd = rustix::fs::memfd_create("test_mapping", rustix::fs::MemfdFlags::CLOEXEC).unwrap();
        rustix::fs::ftruncate(&fd, len).unwrap();
        fd
    }

    #[test]
    fn test_map_read_write() {
        let fd = backing_fd(4096);
        let mut mapping = Mapping::map_shared(fd.as_fd(), 4096, false).unwrap();

        assert_eq!(mapping.len(), 4096);
        assert!(!mapping.is_read_only());

        mapping.as_mut_slice().unwrap()[..5].copy_from_slice(b"hello");
        assert_eq!(&mapping.as_slice()[..5], b"hello");
    }

    #[test]
    fn test_map_read_only_denies_mut() {
        let fd = backing_fd(4096);
        let mut mapping = Mapping::map_shared(fd.as_fd(), 4096, true).unwrap();

        assert!(mapping.is_read_only());
        assert!(mapping.as_mut_ptr().is_none());
        assert!(mapping.as_mut_slice().is_none());
        let _ = mapping.as_slice();
    }

    #[test]
    fn test_writes_visible_through_second_mapping() {
        let fd = backing_fd(4096);
        let mut first = Mapping::map_shared(fd.as_fd(), 4096, false).unwrap();
        let second = Mapping::map_shared(fd.as_fd(), 4096, false).unwrap();

        first.as_mut_slice().unwrap()[100] = 0xab;
        assert_eq!(second.as_slice()[100], 0xab);
    }

    #[test]
    fn test_map_zero_length_fails() {
        let fd = backing_fd(4096);
        let err = Mapping::map_shared(fd.as_fd(), 0, false).unwrap_err();
        assert!(matches!(err, Error::MappingFailed(_)));
    }

    #[test]
    fn test_map_unmappable_fd_fails() {
        // /dev/null has no mmap support; the mapping must surface the
        // errno instead of handing back a dangling region.
        let fd = rustix::fs::open(
            "/dev/null",
            rustix::fs::OFlags::RDWR | rustix::fs::OFlags::CLOEXEC,
            rustix::fs::Mode::empty(),
        )
        .unwrap();
        let err = Mapping::map_shared(fd.as_fd(), 4096, false).unwrap_err();
        assert!(matches!(err, Error::MappingFailed(_)));
    }
}
