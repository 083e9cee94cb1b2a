//! # Ionheap
//!
//! Physically-backed buffer allocation over ION-style kernel allocators.
//!
//! ION-style allocators hand out physically contiguous (or at least
//! physically addressable) buffers that can cross process and hardware
//! boundaries: a CPU writes frames, a DSP or display controller reads them
//! by physical address. The kernel side exposes an allocator device node
//! driven by ioctls; this crate owns the resulting resources so that the
//! acquire → share → map → release chain cannot leak on any failure path.
//!
//! ## What this crate is
//!
//! - **Single-region**: one [`PhysicalHeapHandle`] owns one kernel
//!   allocation, its shareable buffer fd, and an optional CPU mapping.
//! - **Scoped ownership**: every resource (device fd, kernel token,
//!   mapping) unwinds automatically when acquisition fails partway.
//! - **Typed failures**: every kernel rejection surfaces immediately as an
//!   [`Error`] carrying the OS error code; nothing is retried.
//!
//! It is *not* a memory allocator: there is no free-list, no pooling, no
//! fragmentation handling. Callers that need many buffers open many
//! handles.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ionheap::prelude::*;
//!
//! // One page from the system-contiguous pool, mapped for CPU access.
//! let heap = PhysicalHeapHandle::open(
//!     "/dev/ion",
//!     4096,
//!     HeapMask::SYSTEM_CONTIG,
//!     HeapFlags::empty(),
//! )?;
//!
//! // Hand the physical address to a hardware block.
//! let region = heap.physical_address()?;
//! dsp.submit(region.addr, region.len);
//!
//! // Make CPU writes visible to the device.
//! heap.flush_cache(heap.base_ptr().unwrap(), region.addr, region.len)?;
//!
//! // Unmap, free, close — in that order — when `heap` drops.
//! ```
//!
//! ## Platform
//!
//! Linux only. All kernel interaction is raw ioctl + mmap against a
//! caller-supplied allocator device node.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod heap;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::heap::{
        AllocAbi, HeapConfig, HeapFlags, HeapMask, HeapState, PhysicalHeapHandle, PhysicalRegion,
    };
}

pub use error::{Error, Result};
pub use heap::PhysicalHeapHandle;
