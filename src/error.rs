//! Error types for ionheap.
//!
//! Every kernel-facing failure keeps the OS error code it was rejected
//! with, and the variant itself distinguishes "the allocator device is not
//! open" from "the driver refused the call" — callers routing hardware
//! buffers care about the difference.

use rustix::io::Errno;
use thiserror::Error;

/// Result type alias using ionheap's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for ionheap operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The allocator device could not be opened, or the handle's device fd
    /// has already been released (carries `EBADF` in that case).
    #[error("allocator device unavailable: {0}")]
    DeviceUnavailable(Errno),

    /// The driver rejected the allocation ioctl.
    #[error("allocation rejected by driver: {0}")]
    AllocationRejected(Errno),

    /// Sharing or memory-mapping the allocated buffer failed.
    #[error("mapping allocation failed: {0}")]
    MappingFailed(Errno),

    /// The driver rejected a custom command (physical-address query or
    /// cache sync) on an open device.
    #[error("driver command rejected: {0}")]
    DriverCommandRejected(Errno),

    /// The request was rejected before any kernel interaction.
    #[error("invalid allocation request: {0}")]
    InvalidRequest(String),
}

impl Error {
    /// The raw OS error code behind this error, if a syscall produced one.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Error::DeviceUnavailable(errno)
            | Error::AllocationRejected(errno)
            | Error::MappingFailed(errno)
            | Error::DriverCommandRejected(errno) => Some(errno.raw_os_error()),
            Error::InvalidRequest(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_error_exposed() {
        let err = Error::AllocationRejected(Errno::INVAL);
        assert_eq!(err.os_error(), Some(Errno::INVAL.raw_os_error()));

        let err = Error::InvalidRequest("size must be greater than 0".into());
        assert_eq!(err.os_error(), None);
    }

    #[test]
    fn test_device_vs_driver_distinct() {
        // The two-tier distinction callers rely on: same errno, different
        // meaning, must stay different variants.
        let unavailable = Error::DeviceUnavailable(Errno::NOENT);
        let rejected = Error::DriverCommandRejected(Errno::NOENT);
        assert!(matches!(unavailable, Error::DeviceUnavailable(_)));
        assert!(matches!(rejected, Error::DriverCommandRejected(_)));
    }

    #[test]
    fn test_display_messages() {
        let err = Error::DeviceUnavailable(Errno::NOENT);
        assert!(err.to_string().contains("unavailable"));
        let err = Error::MappingFailed(Errno::NOMEM);
        assert!(err.to_string().contains("mapping"));
    }
}
