//! In-memory segment device for testing.

use crate::error::{DeviceError, DeviceResult};
use crate::manager::{DeviceConfig, SegmentId, SegmentManager};
use parking_lot::RwLock;

/// An in-memory segment device.
///
/// Segment storage is materialized on first write and dropped again on
/// release, so a large sparse device costs only what is written. Suitable
/// for:
/// - Unit tests
/// - Crash simulation (see [`EphemeralSegmentManager::duplicate`])
/// - Scratch stores that don't need persistence
///
/// # Example
///
/// ```rust
/// use extentdb_device::{DeviceConfig, EphemeralSegmentManager, SegmentId, SegmentManager};
///
/// let device = EphemeralSegmentManager::new(DeviceConfig::new().segment_size(4096).num_segments(4));
/// device.init().unwrap();
/// device.write(SegmentId::new(2), 10, b"test data").unwrap();
/// assert_eq!(device.read(SegmentId::new(2), 10, 9).unwrap(), b"test data");
/// ```
#[derive(Debug)]
pub struct EphemeralSegmentManager {
    config: DeviceConfig,
    segments: RwLock<Option<Vec<Option<Box<[u8]>>>>>,
}

impl EphemeralSegmentManager {
    /// Creates a new, uninitialized in-memory device.
    #[must_use]
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            segments: RwLock::new(None),
        }
    }

    /// Creates a device that is already initialized.
    #[must_use]
    pub fn initialized(config: DeviceConfig) -> Self {
        let device = Self::new(config);
        *device.segments.write() = Some(vec![None; config.num_segments as usize]);
        device
    }

    /// Returns a deep copy of the device contents.
    ///
    /// Useful for testing recovery: the copy is exactly what a crash at
    /// this instant would leave behind.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        Self {
            config: self.config,
            segments: RwLock::new(self.segments.read().clone()),
        }
    }

    /// Returns the number of segments currently holding materialized data.
    #[must_use]
    pub fn materialized_segments(&self) -> usize {
        self.segments
            .read()
            .as_ref()
            .map_or(0, |segments| segments.iter().filter(|s| s.is_some()).count())
    }
}

impl SegmentManager for EphemeralSegmentManager {
    fn init(&self) -> DeviceResult<()> {
        let mut segments = self.segments.write();
        if segments.is_none() {
            *segments = Some(vec![None; self.config.num_segments as usize]);
        }
        Ok(())
    }

    fn config(&self) -> DeviceConfig {
        self.config
    }

    fn read(&self, segment: SegmentId, offset: u32, len: usize) -> DeviceResult<Vec<u8>> {
        self.config.check_access(segment, offset, len)?;
        let guard = self.segments.read();
        let segments = guard.as_ref().ok_or(DeviceError::Uninitialized)?;

        let start = offset as usize;
        match &segments[segment.index()] {
            Some(data) => Ok(data[start..start + len].to_vec()),
            None => Ok(vec![0u8; len]),
        }
    }

    fn write(&self, segment: SegmentId, offset: u32, data: &[u8]) -> DeviceResult<()> {
        self.config.check_access(segment, offset, data.len())?;
        let mut guard = self.segments.write();
        let segments = guard.as_mut().ok_or(DeviceError::Uninitialized)?;

        let start = offset as usize;
        let buffer = segments[segment.index()]
            .get_or_insert_with(|| vec![0u8; self.config.segment_size as usize].into_boxed_slice());
        buffer[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn allocate_segment(&self, segment: SegmentId) -> DeviceResult<()> {
        self.config.check_segment(segment)?;
        if self.segments.read().is_none() {
            return Err(DeviceError::Uninitialized);
        }
        Ok(())
    }

    fn release_segment(&self, segment: SegmentId) -> DeviceResult<()> {
        self.config.check_segment(segment)?;
        let mut guard = self.segments.write();
        let segments = guard.as_mut().ok_or(DeviceError::Uninitialized)?;
        segments[segment.index()] = None;
        Ok(())
    }

    fn sync(&self) -> DeviceResult<()> {
        // Nothing is buffered
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_device() -> EphemeralSegmentManager {
        let device =
            EphemeralSegmentManager::new(DeviceConfig::new().segment_size(4096).num_segments(4));
        device.init().unwrap();
        device
    }

    #[test]
    fn uninitialized_device_rejects_io() {
        let device = EphemeralSegmentManager::new(DeviceConfig::default());
        assert!(matches!(
            device.read(SegmentId::new(0), 0, 1),
            Err(DeviceError::Uninitialized)
        ));
        assert!(matches!(
            device.write(SegmentId::new(0), 0, b"x"),
            Err(DeviceError::Uninitialized)
        ));
    }

    #[test]
    fn unwritten_segment_reads_zeroes() {
        let device = create_device();
        assert_eq!(device.read(SegmentId::new(1), 100, 4).unwrap(), vec![0; 4]);
        assert_eq!(device.materialized_segments(), 0);
    }

    #[test]
    fn write_and_read_back() {
        let device = create_device();
        device.write(SegmentId::new(3), 4090, b"abcdef").unwrap();
        assert_eq!(device.read(SegmentId::new(3), 4090, 6).unwrap(), b"abcdef");
        assert_eq!(device.read(SegmentId::new(3), 4089, 1).unwrap(), vec![0]);
    }

    #[test]
    fn write_past_segment_end_fails() {
        let device = create_device();
        let result = device.write(SegmentId::new(0), 4095, b"ab");
        assert!(matches!(result, Err(DeviceError::OutOfRange { .. })));
    }

    #[test]
    fn release_discards_contents() {
        let device = create_device();
        device.write(SegmentId::new(2), 0, b"live").unwrap();
        device.release_segment(SegmentId::new(2)).unwrap();
        assert_eq!(device.read(SegmentId::new(2), 0, 4).unwrap(), vec![0; 4]);
        assert_eq!(device.materialized_segments(), 0);
    }

    #[test]
    fn duplicate_is_independent() {
        let device = create_device();
        device.write(SegmentId::new(1), 0, b"one").unwrap();
        let copy = device.duplicate();
        device.write(SegmentId::new(1), 0, b"two").unwrap();
        assert_eq!(copy.read(SegmentId::new(1), 0, 3).unwrap(), b"one");
        assert_eq!(device.read(SegmentId::new(1), 0, 3).unwrap(), b"two");
    }

    #[test]
    fn init_is_idempotent() {
        let device = create_device();
        device.write(SegmentId::new(1), 0, b"keep").unwrap();
        device.init().unwrap();
        assert_eq!(device.read(SegmentId::new(1), 0, 4).unwrap(), b"keep");
    }

    #[test]
    fn invalid_segment_rejected() {
        let device = create_device();
        assert!(matches!(
            device.allocate_segment(SegmentId::new(4)),
            Err(DeviceError::InvalidSegment { .. })
        ));
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn write_then_read_matches(offset in 0u32..4000, data in proptest::collection::vec(any::<u8>(), 1..96)) {
                let device = create_device();
                device.write(SegmentId::new(1), offset, &data).unwrap();
                prop_assert_eq!(device.read(SegmentId::new(1), offset, data.len()).unwrap(), data);
            }
        }
    }
}
