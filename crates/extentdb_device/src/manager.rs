//! Segment manager trait definition.

use crate::error::{DeviceError, DeviceResult};
use std::fmt;

/// Identifier of a segment on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId(pub u32);

impl SegmentId {
    /// Creates a new segment id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the id as an index into per-segment tables.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg:{}", self.0)
    }
}

/// Geometry of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Size of every segment in bytes.
    pub segment_size: u32,
    /// Number of segments on the device.
    pub num_segments: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            segment_size: 1024 * 1024, // 1 MB
            num_segments: 64,
        }
    }
}

impl DeviceConfig {
    /// Creates a new geometry with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the segment size.
    #[must_use]
    pub const fn segment_size(mut self, size: u32) -> Self {
        self.segment_size = size;
        self
    }

    /// Sets the number of segments.
    #[must_use]
    pub const fn num_segments(mut self, count: u32) -> Self {
        self.num_segments = count;
        self
    }

    /// Returns the total device size in bytes.
    #[must_use]
    pub const fn total_size(&self) -> u64 {
        self.segment_size as u64 * self.num_segments as u64
    }

    /// Checks that an access to `segment` at `offset` of `len` bytes is in bounds.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSegment` or `OutOfRange` when it is not.
    pub fn check_access(&self, segment: SegmentId, offset: u32, len: usize) -> DeviceResult<()> {
        self.check_segment(segment)?;
        let end = u64::from(offset) + len as u64;
        if end > u64::from(self.segment_size) {
            return Err(DeviceError::OutOfRange {
                segment,
                offset,
                len,
                segment_size: self.segment_size,
            });
        }
        Ok(())
    }

    /// Checks that `segment` exists on the device.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSegment` when it does not.
    pub fn check_segment(&self, segment: SegmentId) -> DeviceResult<()> {
        if segment.as_u32() >= self.num_segments {
            return Err(DeviceError::InvalidSegment {
                segment,
                num_segments: self.num_segments,
            });
        }
        Ok(())
    }
}

/// The raw segment device underneath ExtentDB.
///
/// Segment managers are **opaque byte stores** split into equally sized
/// segments. ExtentDB owns all format interpretation and all allocation
/// policy: which segment to use next is decided by the segment cleaner,
/// the device only prepares (`allocate_segment`) and discards
/// (`release_segment`) the segment it is told about.
///
/// # Invariants
///
/// - `read` returns exactly the bytes previously written at that position,
///   or zeroes for bytes never written since the segment was released
/// - `sync` makes every completed `write` durable
/// - accesses never cross a segment boundary
///
/// # Implementors
///
/// - [`super::EphemeralSegmentManager`] - For testing
/// - [`super::FileSegmentManager`] - For persistent storage
pub trait SegmentManager: Send + Sync {
    /// Prepares the device for use.
    ///
    /// Calling `init` on an initialized device is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be made available.
    fn init(&self) -> DeviceResult<()>;

    /// Returns the device geometry.
    fn config(&self) -> DeviceConfig;

    /// Returns the size of every segment in bytes.
    fn segment_size(&self) -> u32 {
        self.config().segment_size
    }

    /// Returns the number of segments on the device.
    fn num_segments(&self) -> u32 {
        self.config().num_segments
    }

    /// Reads `len` bytes from `segment` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is outside the segment or an I/O error occurs.
    fn read(&self, segment: SegmentId, offset: u32, len: usize) -> DeviceResult<Vec<u8>>;

    /// Writes `data` to `segment` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is outside the segment or an I/O error occurs.
    fn write(&self, segment: SegmentId, offset: u32, data: &[u8]) -> DeviceResult<()>;

    /// Prepares `segment` to receive writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment does not exist or cannot be prepared.
    fn allocate_segment(&self, segment: SegmentId) -> DeviceResult<()>;

    /// Discards the contents of `segment`.
    ///
    /// After release the segment reads back as zeroes.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment does not exist or an I/O error occurs.
    fn release_segment(&self, segment: SegmentId) -> DeviceResult<()>;

    /// Makes all completed writes durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&self) -> DeviceResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_id_display() {
        assert_eq!(format!("{}", SegmentId::new(7)), "seg:7");
    }

    #[test]
    fn config_builder() {
        let config = DeviceConfig::new().segment_size(4096).num_segments(8);
        assert_eq!(config.segment_size, 4096);
        assert_eq!(config.num_segments, 8);
        assert_eq!(config.total_size(), 32 * 1024);
    }

    #[test]
    fn check_access_bounds() {
        let config = DeviceConfig::new().segment_size(4096).num_segments(2);
        assert!(config.check_access(SegmentId::new(1), 4000, 96).is_ok());
        assert!(matches!(
            config.check_access(SegmentId::new(1), 4000, 97),
            Err(DeviceError::OutOfRange { .. })
        ));
        assert!(matches!(
            config.check_access(SegmentId::new(2), 0, 1),
            Err(DeviceError::InvalidSegment { .. })
        ));
    }
}
