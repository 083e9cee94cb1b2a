//! Allocation request parameters.
//!
//! A request is validated and page-rounded before the driver ever sees it:
//! the allocator works in whole pages, so a 1-byte request on a 4KiB-page
//! system becomes a 4KiB allocation.

use crate::error::{Error, Result};
use bitflags::bitflags;

bitflags! {
    /// Bitmask selecting which physical memory pool satisfies an
    /// allocation.
    ///
    /// The named bits cover the conventional pool kinds; vendor drivers
    /// define additional ones, reachable via
    /// [`from_bits_retain`](HeapMask::from_bits_retain).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeapMask: u32 {
        /// Discontiguous system memory (vmalloc-backed).
        const SYSTEM = 1 << 0;
        /// Physically contiguous system memory (kmalloc-backed).
        const SYSTEM_CONTIG = 1 << 1;
        /// Carveout region reserved at boot.
        const CARVEOUT = 1 << 2;
        /// Fixed-size chunk heap.
        const CHUNK = 1 << 3;
        /// CMA-backed DMA memory.
        const DMA = 1 << 4;
    }
}

bitflags! {
    /// Caller behavior flags for an allocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeapFlags: u32 {
        /// Map the buffer without write access.
        const READ_ONLY = 0x1;
        /// Allocate and share, but skip the local CPU mapping.
        const DONT_MAP_LOCALLY = 0x100;
        /// Open the device in synchronous-write mode; CPU writes bypass
        /// the cache.
        const NO_CACHING = 0x200;
    }
}

/// Validated, page-rounded parameters of one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRequest {
    /// Length in bytes, rounded up to a page multiple.
    pub len: usize,
    /// Alignment, always the system page size.
    pub align: usize,
    /// Physical pool selection.
    pub heap_mask: HeapMask,
    /// Caller behavior flags.
    pub flags: HeapFlags,
}

impl AllocationRequest {
    /// Build a request, rejecting zero sizes and rounding up to the page
    /// size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if `size` is 0. The driver has no
    /// way to report the size of a zero-length allocation, so it is
    /// refused before any syscall.
    pub fn new(size: usize, heap_mask: HeapMask, flags: HeapFlags) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidRequest(
                "size must be greater than 0".into(),
            ));
        }

        let page = rustix::param::page_size();
        let len = round_up_to_page(size, page);

        Ok(Self {
            len,
            align: page,
            heap_mask,
            flags,
        })
    }
}

/// Round `size` up to the next multiple of `page` (a power of two).
pub(crate) fn round_up_to_page(size: usize, page: usize) -> usize {
    (size + page - 1) & !(page - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up_to_page() {
        assert_eq!(round_up_to_page(1, 4096), 4096);
        assert_eq!(round_up_to_page(4096, 4096), 4096);
        assert_eq!(round_up_to_page(4097, 4096), 8192);
        assert_eq!(round_up_to_page(12288, 4096), 12288);
    }

    #[test]
    fn test_request_rounds_to_page_multiple() {
        let page = rustix::param::page_size();
        let req = AllocationRequest::new(1, HeapMask::SYSTEM, HeapFlags::empty()).unwrap();
        assert_eq!(req.len, page);
        assert_eq!(req.align, page);

        let req =
            AllocationRequest::new(page + 1, HeapMask::SYSTEM, HeapFlags::empty()).unwrap();
        assert_eq!(req.len, 2 * page);
        assert_eq!(req.len % page, 0);
    }

    #[test]
    fn test_request_exact_page_unchanged() {
        let page = rustix::param::page_size();
        let req = AllocationRequest::new(3 * page, HeapMask::DMA, HeapFlags::NO_CACHING).unwrap();
        assert_eq!(req.len, 3 * page);
    }

    #[test]
    fn test_zero_size_rejected() {
        let err = AllocationRequest::new(0, HeapMask::SYSTEM, HeapFlags::empty()).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(err.os_error(), None);
    }

    #[test]
    fn test_vendor_mask_preserved() {
        let vendor = HeapMask::from_bits_retain(1 << 12);
        let req = AllocationRequest::new(1, vendor, HeapFlags::empty()).unwrap();
        assert_eq!(req.heap_mask.bits(), 1 << 12);
    }
}
