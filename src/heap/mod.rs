//! Physical heap allocation over an ION-style allocator device.
//!
//! This module provides the single-region allocation primitive:
//!
//! - [`PhysicalHeapHandle`]: owns one kernel allocation and its lifecycle
//!   (acquire → share → map → release)
//! - [`AllocationRequest`]: validated, page-rounded request parameters
//! - [`AllocAbi`]: the versioned encoding of the allocation ioctl struct
//! - [`query_physical_address`] / [`flush_buffer`]: transient-fd variants
//!   of the custom driver commands, for callers holding only a buffer fd
//!
//! # Example
//!
//! ```rust,ignore
//! use ionheap::heap::{HeapFlags, HeapMask, PhysicalHeapHandle};
//!
//! // Allocate 1MB of device-visible memory, CPU-mapped.
//! let mut heap = PhysicalHeapHandle::open(
//!     "/dev/ion",
//!     1024 * 1024,
//!     HeapMask::CARVEOUT,
//!     HeapFlags::NO_CACHING,
//! )?;
//!
//! heap.as_mut_slice().unwrap()[..4].copy_from_slice(&[1, 2, 3, 4]);
//! let region = heap.physical_address()?;
//! ```

mod abi;
mod handle;
mod mapping;
mod request;

pub use abi::{AllocAbi, CustomCmd};
pub use handle::{
    flush_buffer, query_physical_address, AllocToken, HeapConfig, HeapState, PhysicalHeapHandle,
    PhysicalRegion,
};
pub use mapping::Mapping;
pub use request::{AllocationRequest, HeapFlags, HeapMask};
