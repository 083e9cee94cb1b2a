//! Driver ABI for ION-style allocators.
//!
//! The allocator device is driven through four ioctls: allocate, free,
//! share, and a generic custom-command dispatch that multiplexes
//! driver-specific operations (physical-address query, cache sync). The
//! structs here are the wire format those ioctls exchange; they must stay
//! `#[repr(C)]` and field-for-field stable.
//!
//! Two historic layouts of the allocation call exist: newer drivers carry
//! the heap selection in a dedicated `heap_id_mask` field, older ones fold
//! it into `flags`. [`AllocAbi`] selects the encoding; the struct itself is
//! shared by both.

use crate::error::{Error, Result};
use crate::heap::request::HeapMask;
use rustix::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use rustix::io::Errno;

// Ioctl request numbers, _IOWR('I', nr, struct) layout:
// dir(2 bits, read|write) << 30 | size << 16 | type << 8 | nr.
const IOC_WRITE: libc::c_ulong = 1;
const IOC_READ: libc::c_ulong = 2;

const fn iowr(nr: libc::c_ulong, size: usize) -> libc::c_ulong {
    ((IOC_READ | IOC_WRITE) << 30) | ((size as libc::c_ulong) << 16) | (ION_IOC_MAGIC << 8) | nr
}

/// Ioctl magic byte of the allocator device.
const ION_IOC_MAGIC: libc::c_ulong = b'I' as libc::c_ulong;

/// Allocate a buffer: in/out [`AllocationData`].
pub(crate) const ION_IOC_ALLOC: libc::c_ulong = iowr(0, std::mem::size_of::<AllocationData>());
/// Free an allocation: in [`HandleData`].
pub(crate) const ION_IOC_FREE: libc::c_ulong = iowr(1, std::mem::size_of::<HandleData>());
/// Export an allocation as a shareable, mmap-able fd: in/out [`FdData`].
pub(crate) const ION_IOC_SHARE: libc::c_ulong = iowr(4, std::mem::size_of::<FdData>());
/// Driver-specific command dispatch: in/out [`CustomData`].
pub(crate) const ION_IOC_CUSTOM: libc::c_ulong = iowr(6, std::mem::size_of::<CustomData>());

/// Argument of the allocate ioctl.
///
/// The driver writes the opaque allocation handle into `handle` on
/// success. Which of `heap_id_mask`/`flags` carries the heap selection
/// depends on the driver generation — see [`AllocAbi`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct AllocationData {
    /// Requested length in bytes (page-rounded by the caller).
    pub len: usize,
    /// Requested alignment (the page size).
    pub align: usize,
    /// Heap selection mask (newer drivers).
    pub heap_id_mask: u32,
    /// Allocation flags, or the heap mask on legacy drivers.
    pub flags: u32,
    /// OUTPUT: opaque allocation handle owned by the driver.
    pub handle: u32,
}

/// Argument of the free ioctl.
#[repr(C)]
pub(crate) struct HandleData {
    /// The allocation handle to release.
    pub handle: u32,
}

/// Argument of the share ioctl.
#[repr(C)]
pub(crate) struct FdData {
    /// The allocation handle to export.
    pub handle: u32,
    /// OUTPUT: shareable buffer fd, usable for mmap and fd passing.
    pub fd: i32,
}

/// Envelope of the custom-command ioctl.
///
/// `arg` is a pointer to the command-specific struct, passed through to
/// the driver untouched.
#[repr(C)]
pub(crate) struct CustomData {
    /// Which custom command to run ([`CustomCmd`]).
    pub cmd: u32,
    /// Pointer to the command-specific argument struct.
    pub arg: u64,
}

/// Argument of the physical-address query command.
#[repr(C)]
pub(crate) struct PhysData {
    /// Buffer fd identifying the allocation.
    pub buffer_fd: i32,
    /// OUTPUT: physical address backing the buffer.
    pub phys_addr: u64,
    /// OUTPUT: size of the physical region.
    pub len: u64,
}

/// Argument of the cache-sync command.
#[repr(C)]
pub(crate) struct MsyncData {
    /// Buffer fd identifying the allocation.
    pub buffer_fd: i32,
    /// Virtual address of the range to flush.
    pub vaddr: *const libc::c_void,
    /// Physical address of the range to flush.
    pub paddr: u64,
    /// Length of the range in bytes.
    pub len: usize,
}

/// Driver-specific commands multiplexed through the custom ioctl.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CustomCmd {
    /// Query the physical address backing a buffer fd.
    PhysQuery = 0,
    /// Flush/invalidate the CPU cache for a buffer range.
    CacheSync = 1,
}

/// Encoding of the heap mask in the allocation struct.
///
/// A versioned wire-format switch, not a behavior switch: both variants
/// fill the same [`AllocationData`], they just put the mask in different
/// fields. The default tracks the `legacy-alloc-abi` cargo feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocAbi {
    /// The mask goes in `heap_id_mask`; `flags` is zeroed.
    HeapIdMask,
    /// Legacy drivers: the mask is folded into `flags`.
    LegacyFlags,
}

impl Default for AllocAbi {
    fn default() -> Self {
        if cfg!(feature = "legacy-alloc-abi") {
            AllocAbi::LegacyFlags
        } else {
            AllocAbi::HeapIdMask
        }
    }
}

impl AllocAbi {
    /// Apply this encoding's heap-mask placement to an allocation struct.
    pub(crate) fn fill(self, data: &mut AllocationData, mask: HeapMask) {
        match self {
            AllocAbi::HeapIdMask => {
                data.heap_id_mask = mask.bits();
                data.flags = 0;
            }
            AllocAbi::LegacyFlags => {
                data.heap_id_mask = 0;
                data.flags = mask.bits();
            }
        }
    }
}

/// Errno of the last failed libc call.
pub(crate) fn last_errno() -> Errno {
    Errno::from_raw_os_error(
        std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO),
    )
}

/// Issue the allocate ioctl and return the driver's opaque handle.
pub(crate) fn alloc(
    device: BorrowedFd<'_>,
    len: usize,
    align: usize,
    mask: HeapMask,
    abi: AllocAbi,
) -> Result<u32> {
    let mut data = AllocationData {
        len,
        align,
        heap_id_mask: 0,
        flags: 0,
        handle: 0,
    };
    abi.fill(&mut data, mask);

    // SAFETY: ION_IOC_ALLOC reads and writes an AllocationData; the struct
    // is properly initialized and the fd is a valid open device.
    let ret = unsafe { libc::ioctl(device.as_raw_fd(), ION_IOC_ALLOC, &mut data) };
    if ret < 0 {
        return Err(Error::AllocationRejected(last_errno()));
    }
    Ok(data.handle)
}

/// Issue the free ioctl for an allocation handle.
///
/// Returns the raw errno on failure so teardown paths can log it without
/// constructing an [`Error`].
pub(crate) fn free(device: BorrowedFd<'_>, handle: u32) -> std::result::Result<(), Errno> {
    let mut data = HandleData { handle };

    // SAFETY: ION_IOC_FREE reads a HandleData identifying an allocation on
    // this device; the driver ignores unknown handles with an error.
    let ret = unsafe { libc::ioctl(device.as_raw_fd(), ION_IOC_FREE, &mut data) };
    if ret < 0 {
        return Err(last_errno());
    }
    Ok(())
}

/// Issue the share ioctl and return the exported buffer fd.
///
/// Returns the raw errno on failure; the caller decides how the failure
/// classifies (a share on the way to a mapping is a mapping failure, a
/// share feeding a driver query is a command failure).
pub(crate) fn share(device: BorrowedFd<'_>, handle: u32) -> std::result::Result<OwnedFd, Errno> {
    let mut data = FdData { handle, fd: -1 };

    // SAFETY: ION_IOC_SHARE reads the handle and writes a fresh fd; the
    // struct is properly initialized.
    let ret = unsafe { libc::ioctl(device.as_raw_fd(), ION_IOC_SHARE, &mut data) };
    if ret < 0 {
        return Err(last_errno());
    }

    // SAFETY: on success the driver returned a valid fd we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(data.fd) })
}

/// Dispatch a custom command through the generic custom ioctl.
///
/// `arg` must point to the struct layout the command expects; the driver
/// may write output fields through it.
pub(crate) fn custom<T>(device: BorrowedFd<'_>, cmd: CustomCmd, arg: &mut T) -> Result<()> {
    let mut data = CustomData {
        cmd: cmd as u32,
        arg: arg as *mut T as u64,
    };

    // SAFETY: ION_IOC_CUSTOM reads the envelope; the driver interprets
    // `arg` according to `cmd`, which matches the caller-provided struct.
    let ret = unsafe { libc::ioctl(device.as_raw_fd(), ION_IOC_CUSTOM, &mut data) };
    if ret < 0 {
        return Err(Error::DriverCommandRejected(last_errno()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::fd::AsFd;

    #[test]
    fn test_ioctl_number_layout() {
        // Direction bits (read|write) in the top two bits.
        assert_eq!(ION_IOC_ALLOC >> 30, IOC_READ | IOC_WRITE);
        // Magic byte in bits 8..16.
        assert_eq!((ION_IOC_ALLOC >> 8) & 0xff, b'I' as libc::c_ulong);
        // Command numbers in the low byte.
        assert_eq!(ION_IOC_ALLOC & 0xff, 0);
        assert_eq!(ION_IOC_FREE & 0xff, 1);
        assert_eq!(ION_IOC_SHARE & 0xff, 4);
        assert_eq!(ION_IOC_CUSTOM & 0xff, 6);
        // Struct size in bits 16..30.
        assert_eq!(
            (ION_IOC_CUSTOM >> 16) & 0x3fff,
            std::mem::size_of::<CustomData>() as libc::c_ulong
        );
    }

    #[test]
    fn test_alloc_abi_heap_id_mask() {
        let mut data = AllocationData {
            len: 4096,
            align: 4096,
            heap_id_mask: 0,
            flags: 0xdead,
            handle: 0,
        };
        AllocAbi::HeapIdMask.fill(&mut data, HeapMask::CARVEOUT);
        assert_eq!(data.heap_id_mask, HeapMask::CARVEOUT.bits());
        assert_eq!(data.flags, 0);
    }

    #[test]
    fn test_alloc_abi_legacy_flags() {
        let mut data = AllocationData {
            len: 4096,
            align: 4096,
            heap_id_mask: 0xdead,
            flags: 0,
            handle: 0,
        };
        AllocAbi::LegacyFlags.fill(&mut data, HeapMask::SYSTEM | HeapMask::DMA);
        assert_eq!(data.heap_id_mask, 0);
        assert_eq!(data.flags, (HeapMask::SYSTEM | HeapMask::DMA).bits());
    }

    #[test]
    fn test_alloc_abi_default_tracks_feature() {
        let abi = AllocAbi::default();
        if cfg!(feature = "legacy-alloc-abi") {
            assert_eq!(abi, AllocAbi::LegacyFlags);
        } else {
            assert_eq!(abi, AllocAbi::HeapIdMask);
        }
    }

    #[test]
    fn test_custom_cmd_values() {
        assert_eq!(CustomCmd::PhysQuery as u32, 0);
        assert_eq!(CustomCmd::CacheSync as u32, 1);
    }

    #[test]
    fn test_ioctls_rejected_on_non_driver_fd() {
        // A memfd is a valid open fd that is not an allocator device, so
        // the driver ioctls come back ENOTTY ("inappropriate ioctl").
        let fd = rustix::fs::memfd_create("not-a-driver", rustix::fs::MemfdFlags::CLOEXEC).unwrap();

        let err = alloc(fd.as_fd(), 4096, 4096, HeapMask::SYSTEM, AllocAbi::default()).unwrap_err();
        match err {
            Error::AllocationRejected(errno) => assert_eq!(errno, Errno::NOTTY),
            other => panic!("expected AllocationRejected, got {other:?}"),
        }

        assert_eq!(share(fd.as_fd(), 1).unwrap_err(), Errno::NOTTY);

        assert_eq!(free(fd.as_fd(), 1), Err(Errno::NOTTY));

        let mut phys = PhysData {
            buffer_fd: fd.as_fd().as_raw_fd(),
            phys_addr: 0,
            len: 0,
        };
        let err = custom(fd.as_fd(), CustomCmd::PhysQuery, &mut phys).unwrap_err();
        assert!(matches!(err, Error::DriverCommandRejected(Errno::NOTTY)));
    }
}
