//! Error types for ExtentDB core.

use crate::types::Laddr;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in ExtentDB core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The segment device failed.
    ///
    /// A device failure during a journal append faults the journal.
    #[error("device error: {0}")]
    Device(#[from] extentdb_device::DeviceError),

    /// Optimistic commit or extent claim collision.
    #[error("transaction conflict: {message}")]
    Conflict {
        /// Description of the collision.
        message: String,
    },

    /// An LBA insert intersects a live range.
    #[error("overlapping mapping: {laddr}+{len:#x} intersects {existing}")]
    Overlap {
        /// Start of the rejected range.
        laddr: Laddr,
        /// Length of the rejected range.
        len: u32,
        /// Start of the live entry it intersects.
        existing: Laddr,
    },

    /// No free segment or address range is available.
    #[error("out of space: {message}")]
    OutOfSpace {
        /// What ran out.
        message: String,
    },

    /// Replay found an unreplayable record before the journal tail.
    #[error("journal corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// mkfs could not initialize the device.
    #[error("initialization failed: {message}")]
    Initialization {
        /// Description of the failure.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// No mapping exists at the logical address.
    #[error("no extent mapped at {laddr}")]
    NotFound {
        /// The unmapped address.
        laddr: Laddr,
    },

    /// The device does not hold a usable store.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// The journal was faulted by an earlier failure; remount required.
    #[error("journal faulted: remount required")]
    Faulted,
}

impl CoreError {
    /// Creates a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates an out of space error.
    pub fn out_of_space(message: impl Into<String>) -> Self {
        Self::OutOfSpace {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates an initialization error.
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates a not found error.
    #[must_use]
    pub fn not_found(laddr: Laddr) -> Self {
        Self::NotFound { laddr }
    }

    /// Returns true if retrying with a fresh transaction may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns true for device failures.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Device(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extentdb_device::DeviceError;

    #[test]
    fn only_conflict_is_retryable() {
        assert!(CoreError::conflict("busy").is_retryable());
        assert!(!CoreError::corruption("bad").is_retryable());
        assert!(!CoreError::out_of_space("full").is_retryable());
        assert!(!CoreError::Faulted.is_retryable());
    }

    #[test]
    fn device_error_converts() {
        let err: CoreError = DeviceError::Uninitialized.into();
        assert!(err.is_io());
        assert_eq!(err.to_string(), "device error: device is not initialized");
    }

    #[test]
    fn overlap_message() {
        let err = CoreError::Overlap {
            laddr: Laddr::new(0x2000),
            len: 0x1000,
            existing: Laddr::new(0x1800),
        };
        assert_eq!(
            err.to_string(),
            "overlapping mapping: laddr:0x2000+0x1000 intersects laddr:0x1800"
        );
    }
}
