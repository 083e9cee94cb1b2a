//! The physical heap handle and its lifecycle.
//!
//! One [`PhysicalHeapHandle`] owns one kernel allocation end to end:
//! the allocator device fd, the opaque allocation token, the shareable
//! buffer fd, and the optional CPU mapping. Acquisition is all-or-nothing
//! (a failure at any step unwinds everything acquired so far) and release
//! is unconditional (every teardown step runs, failures are logged and
//! swallowed).

use crate::error::{Error, Result};
use crate::heap::abi::{self, AllocAbi, CustomCmd, MsyncData, PhysData};
use crate::heap::mapping::Mapping;
use crate::heap::request::{AllocationRequest, HeapFlags, HeapMask};
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use rustix::fs::{Mode, OFlags};
use rustix::io::Errno;
use std::path::Path;

/// Configuration for opening a physical heap.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapConfig {
    /// Which encoding of the allocation struct the driver expects.
    pub alloc_abi: AllocAbi,
}

/// The physical address and size backing a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalRegion {
    /// Physical base address of the buffer.
    pub addr: u64,
    /// Size of the physical region in bytes.
    pub len: usize,
}

/// Lifecycle state of a handle.
///
/// A live handle is `Unmapped` or `Mapped`; after [`release`]
/// (or drop) it is `Released` and every operation on it fails with
/// [`Error::DeviceUnavailable`].
///
/// [`release`]: PhysicalHeapHandle::release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapState {
    /// Allocated, no local CPU mapping.
    Unmapped,
    /// Allocated and CPU-mapped.
    Mapped,
    /// All resources released.
    Released,
}

/// The driver's opaque allocation handle.
///
/// Only meaningful to the device that issued it; freed exactly once when
/// the owning [`PhysicalHeapHandle`] releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocToken(u32);

impl AllocToken {
    /// Wrap a raw token obtained from the driver.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw token value.
    pub fn into_raw(self) -> u32 {
        self.0
    }
}

/// Frees the kernel allocation unless disarmed.
///
/// Held across the share/map steps of `open` so that a failure there
/// cannot leak the just-allocated buffer.
struct TokenGuard<'fd> {
    device: BorrowedFd<'fd>,
    token: u32,
}

impl TokenGuard<'_> {
    fn into_token(self) -> u32 {
        let token = self.token;
        std::mem::forget(self);
        token
    }
}

impl Drop for TokenGuard<'_> {
    fn drop(&mut self) {
        if let Err(errno) = abi::free(self.device, self.token) {
            tracing::warn!(
                token = self.token,
                error = %errno,
                "failed to free kernel allocation while unwinding open"
            );
        }
    }
}

/// A kernel-allocated, optionally memory-mapped physical buffer.
///
/// The handle is created by a successful [`open`] (or adopted via
/// [`from_parts`]) and owns every resource behind the buffer. Dropping it
/// releases everything in the required order: unmap, free, close.
///
/// # Thread Model
///
/// `PhysicalHeapHandle` is `Send` but not `Sync`: one owning thread
/// manages the lifecycle, and there is no internal locking. No operation
/// blocks beyond the underlying ioctl/mmap syscall.
///
/// [`open`]: PhysicalHeapHandle::open
/// [`from_parts`]: PhysicalHeapHandle::from_parts
pub struct PhysicalHeapHandle {
    /// The allocator device fd. `None` once released.
    device: Option<OwnedFd>,
    /// The driver's allocation token. Freed exactly once.
    token: Option<u32>,
    /// The shareable buffer fd from the share ioctl. Present iff the
    /// buffer was exported (i.e. unless DONT_MAP_LOCALLY skipped it).
    buffer: Option<OwnedFd>,
    /// The CPU mapping. Dropped (munmap) before the token is freed.
    mapping: Option<Mapping>,
    /// Page-rounded buffer size.
    len: usize,
    /// Flags the buffer was opened with.
    flags: HeapFlags,
}

impl PhysicalHeapHandle {
    /// Allocate a buffer from the allocator device at `path`.
    ///
    /// The size is rounded up to the system page size before the driver
    /// sees it. Unless [`HeapFlags::DONT_MAP_LOCALLY`] is set, the buffer
    /// is also exported as a shareable fd and mapped read/write (or
    /// read-only with [`HeapFlags::READ_ONLY`]) into the caller's address
    /// space.
    ///
    /// # Arguments
    ///
    /// * `path` - The allocator device node (e.g. `/dev/ion`).
    /// * `size` - Requested size in bytes; must be greater than 0.
    /// * `heap_mask` - Which physical pool(s) may satisfy the allocation.
    /// * `flags` - Caller behavior flags.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidRequest`] - `size` is 0 (no syscall issued).
    /// * [`Error::DeviceUnavailable`] - the device node could not be
    ///   opened.
    /// * [`Error::AllocationRejected`] - the driver refused the
    ///   allocation; the device fd is closed before returning.
    /// * [`Error::MappingFailed`] - the share or mmap step failed; the
    ///   kernel allocation is freed and the device fd closed before
    ///   returning.
    ///
    /// No partial handle ever escapes: on any error the caller observes
    /// the same fd/allocation footprint as before the call.
    pub fn open(
        path: impl AsRef<Path>,
        size: usize,
        heap_mask: HeapMask,
        flags: HeapFlags,
    ) -> Result<Self> {
        Self::open_with_config(path, size, heap_mask, flags, HeapConfig::default())
    }

    /// Allocate with an explicit driver configuration.
    ///
    /// See [`open`](Self::open); `config` additionally selects the
    /// allocation-struct encoding for the driver generation in use.
    pub fn open_with_config(
        path: impl AsRef<Path>,
        size: usize,
        heap_mask: HeapMask,
        flags: HeapFlags,
        config: HeapConfig,
    ) -> Result<Self> {
        let request = AllocationRequest::new(size, heap_mask, flags)?;
        let device = open_device(path.as_ref(), flags.contains(HeapFlags::NO_CACHING))?;

        let raw_token = abi::alloc(
            device.as_fd(),
            request.len,
            request.align,
            heap_mask,
            config.alloc_abi,
        )?;
        // From here on a failure must free the allocation before the
        // device fd closes.
        let guard = TokenGuard {
            device: device.as_fd(),
            token: raw_token,
        };

        let (buffer, mapping) = if flags.contains(HeapFlags::DONT_MAP_LOCALLY) {
            (None, None)
        } else {
            let buffer = abi::share(device.as_fd(), raw_token).map_err(Error::MappingFailed)?;
            let mapping = Mapping::map_shared(
                buffer.as_fd(),
                request.len,
                flags.contains(HeapFlags::READ_ONLY),
            )?;
            (Some(buffer), Some(mapping))
        };

        let token = guard.into_token();
        tracing::debug!(
            len = request.len,
            heap_mask = heap_mask.bits(),
            mapped = mapping.is_some(),
            "allocated physical heap buffer"
        );

        Ok(Self {
            device: Some(device),
            token: Some(token),
            buffer,
            mapping,
            len: request.len,
            flags,
        })
    }

    /// Adopt resources allocated elsewhere into a handle.
    ///
    /// For callers that performed the allocate/share steps themselves
    /// (or received the pieces over IPC) and want the same lifecycle
    /// guarantees. The buffer is mapped unless
    /// [`HeapFlags::DONT_MAP_LOCALLY`] is set; if mapping fails, the
    /// adopted token is freed and both fds are closed before the error
    /// returns.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `device` is the allocator device
    /// that issued `token`, that `buffer` is the shared export of that
    /// allocation, and that `size` does not exceed the allocation's real
    /// size. A mapping over a mis-sized buffer faults on access.
    pub unsafe fn from_parts(
        device: OwnedFd,
        token: AllocToken,
        buffer: OwnedFd,
        size: usize,
        flags: HeapFlags,
    ) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidRequest(
                "size must be greater than 0".into(),
            ));
        }

        let mapping = if flags.contains(HeapFlags::DONT_MAP_LOCALLY) {
            None
        } else {
            match Mapping::map_shared(
                buffer.as_fd(),
                size,
                flags.contains(HeapFlags::READ_ONLY),
            ) {
                Ok(mapping) => Some(mapping),
                Err(err) => {
                    // Adopted resources must not leak either.
                    if let Err(errno) = abi::free(device.as_fd(), token.0) {
                        tracing::warn!(
                            token = token.0,
                            error = %errno,
                            "failed to free adopted allocation while unwinding"
                        );
                    }
                    return Err(err);
                }
            }
        };

        Ok(Self {
            device: Some(device),
            token: Some(token.0),
            buffer: Some(buffer),
            mapping,
            len: size,
            flags,
        })
    }

    /// Query the physical address backing this buffer.
    ///
    /// Issues the driver's physical-address command on the handle's own
    /// device fd, keyed by the buffer fd. An unmapped handle has no
    /// standing buffer fd, so a transient export is created for the query
    /// and closed afterwards.
    ///
    /// # Errors
    ///
    /// * [`Error::DeviceUnavailable`] - the handle is released (`EBADF`);
    ///   no ioctl is issued.
    /// * [`Error::DriverCommandRejected`] - the driver refused the
    ///   command. The handle's state is unchanged.
    pub fn physical_address(&self) -> Result<PhysicalRegion> {
        let device = self.require_device()?;
        match &self.buffer {
            Some(buffer) => query_phys_on(device, buffer.as_fd()),
            None => {
                let transient = self.export_transient(device)?;
                query_phys_on(device, transient.as_fd())
            }
        }
    }

    /// Flush/invalidate the CPU cache for a range of this buffer.
    ///
    /// Required after CPU writes to a cached buffer before a device reads
    /// it by physical address. Same fd sourcing and error rules as
    /// [`physical_address`](Self::physical_address).
    ///
    /// # Arguments
    ///
    /// * `vaddr` - Virtual base of the range (within this mapping).
    /// * `paddr` - Physical base of the range.
    /// * `len` - Length of the range in bytes.
    pub fn flush_cache(&self, vaddr: *const u8, paddr: u64, len: usize) -> Result<()> {
        let device = self.require_device()?;
        match &self.buffer {
            Some(buffer) => flush_on(device, buffer.as_fd(), vaddr, paddr, len),
            None => {
                let transient = self.export_transient(device)?;
                flush_on(device, transient.as_fd(), vaddr, paddr, len)
            }
        }
    }

    /// Release every resource: unmap, free the allocation, close the fds.
    ///
    /// Runs to completion regardless of individual step failures; those
    /// are logged at warn level, never returned. Calling this again (or
    /// dropping the handle afterwards) is a no-op.
    pub fn release(&mut self) {
        // Unmap first: the driver does not unmap on fd close.
        if let Some(mapping) = self.mapping.take() {
            drop(mapping);
        }

        // Free the allocation only while the device fd is still open.
        if let Some(device) = self.device.as_ref() {
            if let Some(token) = self.token.take() {
                if let Err(errno) = abi::free(device.as_fd(), token) {
                    tracing::warn!(
                        token,
                        error = %errno,
                        "failed to free kernel allocation during release"
                    );
                }
            }
        }

        // Closing is infallible from here: OwnedFd close errors are not
        // actionable for an allocator fd.
        self.buffer = None;
        if self.device.take().is_some() {
            tracing::debug!(len = self.len, "physical heap handle released");
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HeapState {
        if self.device.is_none() {
            HeapState::Released
        } else if self.mapping.is_some() {
            HeapState::Mapped
        } else {
            HeapState::Unmapped
        }
    }

    /// Page-rounded size of the buffer in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the buffer has zero length (never, for a live
    /// handle).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the buffer is currently CPU-mapped.
    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Base pointer of the CPU mapping, if one exists.
    #[inline]
    pub fn base_ptr(&self) -> Option<*const u8> {
        self.mapping.as_ref().map(Mapping::as_ptr)
    }

    /// The mapped buffer as a byte slice, if a mapping exists.
    #[inline]
    pub fn as_slice(&self) -> Option<&[u8]> {
        self.mapping.as_ref().map(Mapping::as_slice)
    }

    /// The mapped buffer as a mutable byte slice.
    ///
    /// `None` when unmapped or mapped read-only.
    #[inline]
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        self.mapping.as_mut().and_then(Mapping::as_mut_slice)
    }

    /// The shareable buffer fd, for fd passing or device import.
    ///
    /// `None` when the buffer was never exported (DONT_MAP_LOCALLY) or
    /// the handle is released.
    #[inline]
    pub fn buffer_fd(&self) -> Option<BorrowedFd<'_>> {
        self.buffer.as_ref().map(AsFd::as_fd)
    }

    /// The allocator device fd, while the handle is live.
    #[inline]
    pub fn device_fd(&self) -> Option<BorrowedFd<'_>> {
        self.device.as_ref().map(AsFd::as_fd)
    }

    /// Flags the buffer was opened with.
    #[inline]
    pub fn heap_flags(&self) -> HeapFlags {
        self.flags
    }

    fn require_device(&self) -> Result<BorrowedFd<'_>> {
        self.device
            .as_ref()
            .map(AsFd::as_fd)
            .ok_or(Error::DeviceUnavailable(Errno::BADF))
    }

    /// Export a short-lived buffer fd for a driver command on an
    /// unmapped handle.
    fn export_transient(&self, device: BorrowedFd<'_>) -> Result<OwnedFd> {
        let token = self.token.ok_or(Error::DeviceUnavailable(Errno::BADF))?;
        abi::share(device, token).map_err(Error::DriverCommandRejected)
    }
}

impl Drop for PhysicalHeapHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for PhysicalHeapHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalHeapHandle")
            .field("device_fd", &self.device.as_ref().map(|fd| fd.as_raw_fd()))
            .field("buffer_fd", &self.buffer.as_ref().map(|fd| fd.as_raw_fd()))
            .field("token", &self.token)
            .field("len", &self.len)
            .field("state", &self.state())
            .finish()
    }
}

/// Query the physical address of a buffer through a transient device fd.
///
/// For callers that hold only a shared buffer fd (e.g. received over
/// IPC) and no open handle: opens the allocator device, issues the
/// query, and closes the device before returning.
///
/// # Errors
///
/// * [`Error::DeviceUnavailable`] - the device node could not be opened.
/// * [`Error::DriverCommandRejected`] - the driver refused the query.
pub fn query_physical_address(
    device_path: impl AsRef<Path>,
    buffer: BorrowedFd<'_>,
) -> Result<PhysicalRegion> {
    let device = open_device(device_path.as_ref(), false)?;
    query_phys_on(device.as_fd(), buffer)
}

/// Flush the CPU cache for a buffer range through a transient device fd.
///
/// The transient-fd counterpart of
/// [`PhysicalHeapHandle::flush_cache`], with the same error split.
pub fn flush_buffer(
    device_path: impl AsRef<Path>,
    buffer: BorrowedFd<'_>,
    vaddr: *const u8,
    paddr: u64,
    len: usize,
) -> Result<()> {
    let device = open_device(device_path.as_ref(), false)?;
    flush_on(device.as_fd(), buffer, vaddr, paddr, len)
}

/// Open the allocator device read-write, O_SYNC when uncached access was
/// requested.
fn open_device(path: &Path, sync: bool) -> Result<OwnedFd> {
    let mut oflags = OFlags::RDWR | OFlags::CLOEXEC;
    if sync {
        oflags |= OFlags::SYNC;
    }
    rustix::fs::open(path, oflags, Mode::empty()).map_err(Error::DeviceUnavailable)
}

// Both public variants of each driver command (handle-owned fd vs
// transient fd) funnel into these; only the fd source differs.

fn query_phys_on(device: BorrowedFd<'_>, buffer: BorrowedFd<'_>) -> Result<PhysicalRegion> {
    let mut data = PhysData {
        buffer_fd: buffer.as_raw_fd(),
        phys_addr: 0,
        len: 0,
    };
    abi::custom(device, CustomCmd::PhysQuery, &mut data)?;
    Ok(PhysicalRegion {
        addr: data.phys_addr,
        len: data.len as usize,
    })
}

fn flush_on(
    device: BorrowedFd<'_>,
    buffer: BorrowedFd<'_>,
    vaddr: *const u8,
    paddr: u64,
    len: usize,
) -> Result<()> {
    let mut data = MsyncData {
        buffer_fd: buffer.as_raw_fd(),
        vaddr: vaddr.cast(),
        paddr,
        len,
    };
    abi::custom(device, CustomCmd::CacheSync, &mut data)
}
