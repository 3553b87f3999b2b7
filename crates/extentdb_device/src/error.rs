//! Error types for device operations.

use crate::manager::SegmentId;
use std::io;
use thiserror::Error;

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors that can occur during device operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The access does not fit inside the segment.
    #[error("access out of range: {segment} offset {offset}, len {len}, segment size {segment_size}")]
    OutOfRange {
        /// The addressed segment.
        segment: SegmentId,
        /// The requested offset.
        offset: u32,
        /// The requested length.
        len: usize,
        /// The device segment size.
        segment_size: u32,
    },

    /// The segment id does not exist on this device.
    #[error("invalid segment {segment}: device has {num_segments} segments")]
    InvalidSegment {
        /// The requested segment.
        segment: SegmentId,
        /// Number of segments on the device.
        num_segments: u32,
    },

    /// The device has not been initialized.
    #[error("device is not initialized")]
    Uninitialized,

    /// Another process holds the device.
    #[error("device locked: another process has exclusive access")]
    Locked,

    /// The device cannot be used.
    #[error("device unavailable: {0}")]
    Unavailable(String),
}
