//! Crash and fault injection for ExtentDB.
//!
//! [`CrashableDevice`] wraps an in-memory device and fails writes or
//! syncs on demand. A failing write can be torn: a prefix of it reaches
//! the device before the error is returned, as a power cut mid-write
//! would leave it.
//!
//! ## Test Strategy
//!
//! 1. **Fail an append** - the store must fault and refuse commits
//! 2. **Tear an append** - recovery must drop the torn record
//! 3. **Crash anywhere** - every commit acknowledged before the crash
//!    must be readable after recovery
//!
//! ## Usage
//!
//! ```rust,ignore
//! use extentdb_testkit::crash::CrashableDevice;
//!
//! let device = Arc::new(CrashableDevice::new(test_geometry()));
//! let tm = TransactionManager::new(device.clone(), test_config());
//! device.fail_after_writes(0, Some(10));
//! ```

use extentdb_device::{
    DeviceConfig, DeviceError, DeviceResult, EphemeralSegmentManager, SegmentId, SegmentManager,
};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// An in-memory device that can simulate crashes and I/O failures.
pub struct CrashableDevice {
    inner: Arc<EphemeralSegmentManager>,
    /// Writes still allowed before the next one fails.
    writes_left: AtomicUsize,
    /// Bytes of the failing write that still reach the device.
    torn_bytes: AtomicUsize,
    writes: AtomicUsize,
    crashed: AtomicBool,
    fail_on_sync: AtomicBool,
}

impl CrashableDevice {
    /// Creates a new crashable device with the given geometry.
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            inner: Arc::new(EphemeralSegmentManager::new(config)),
            writes_left: AtomicUsize::new(usize::MAX),
            torn_bytes: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            crashed: AtomicBool::new(false),
            fail_on_sync: AtomicBool::new(false),
        }
    }

    /// Lets `writes` more writes through, then fails the next one.
    ///
    /// With `torn` set, that many bytes of the failing write are stored
    /// before it fails. Once crashed, every write and sync fails until
    /// [`reset`](Self::reset).
    pub fn fail_after_writes(&self, writes: usize, torn: Option<usize>) {
        self.torn_bytes.store(torn.unwrap_or(0), Ordering::SeqCst);
        self.writes_left.store(writes, Ordering::SeqCst);
    }

    /// Sets whether sync should fail.
    pub fn set_fail_on_sync(&self, fail: bool) {
        self.fail_on_sync.store(fail, Ordering::SeqCst);
    }

    /// Clears every injected failure.
    pub fn reset(&self) {
        self.writes_left.store(usize::MAX, Ordering::SeqCst);
        self.torn_bytes.store(0, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
        self.fail_on_sync.store(false, Ordering::SeqCst);
    }

    /// Returns whether an injected failure has fired.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Returns the number of writes that reached the device.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Returns a copy of what is on the device right now.
    pub fn image(&self) -> EphemeralSegmentManager {
        self.inner.duplicate()
    }

    /// Overwrites bytes on the device, bypassing injected failures.
    pub fn corrupt(&self, segment: SegmentId, offset: u32, bytes: &[u8]) -> DeviceResult<()> {
        self.inner.write(segment, offset, bytes)
    }

    fn crash(&self, what: &str) -> DeviceError {
        self.crashed.store(true, Ordering::SeqCst);
        DeviceError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("simulated crash during {what}"),
        ))
    }
}

impl SegmentManager for CrashableDevice {
    fn init(&self) -> DeviceResult<()> {
        self.inner.init()
    }

    fn config(&self) -> DeviceConfig {
        self.inner.config()
    }

    fn read(&self, segment: SegmentId, offset: u32, len: usize) -> DeviceResult<Vec<u8>> {
        self.inner.read(segment, offset, len)
    }

    fn write(&self, segment: SegmentId, offset: u32, data: &[u8]) -> DeviceResult<()> {
        if self.has_crashed() {
            return Err(self.crash("write"));
        }

        let allowed = self
            .writes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                if left == usize::MAX {
                    Some(left)
                } else {
                    left.checked_sub(1)
                }
            })
            .is_ok();
        if !allowed {
            let torn = self.torn_bytes.load(Ordering::SeqCst).min(data.len());
            if torn > 0 {
                self.inner.write(segment, offset, &data[..torn])?;
            }
            return Err(self.crash("write"));
        }

        self.inner.write(segment, offset, data)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn allocate_segment(&self, segment: SegmentId) -> DeviceResult<()> {
        self.inner.allocate_segment(segment)
    }

    fn release_segment(&self, segment: SegmentId) -> DeviceResult<()> {
        if self.has_crashed() {
            return Err(self.crash("release"));
        }
        self.inner.release_segment(segment)
    }

    fn sync(&self) -> DeviceResult<()> {
        if self.has_crashed() || self.fail_on_sync.load(Ordering::SeqCst) {
            return Err(self.crash("sync"));
        }
        self.inner.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> CrashableDevice {
        let device = CrashableDevice::new(DeviceConfig::new().segment_size(4096).num_segments(4));
        device.init().unwrap();
        device
    }

    #[test]
    fn test_writes_pass_until_limit() {
        let device = device();
        device.fail_after_writes(2, None);
        device.write(SegmentId::new(1), 0, b"one").unwrap();
        device.write(SegmentId::new(1), 3, b"two").unwrap();
        assert!(device.write(SegmentId::new(1), 6, b"three").is_err());
        assert!(device.has_crashed());
        assert!(device.sync().is_err());
        assert_eq!(device.writes(), 2);
    }

    #[test]
    fn test_torn_write_keeps_prefix() {
        let device = device();
        device.fail_after_writes(0, Some(2));
        assert!(device.write(SegmentId::new(1), 0, b"abcd").is_err());
        assert_eq!(device.read(SegmentId::new(1), 0, 4).unwrap(), b"ab\0\0");
    }

    #[test]
    fn test_reset_clears_crash() {
        let device = device();
        device.set_fail_on_sync(true);
        assert!(device.sync().is_err());
        device.reset();
        device.sync().unwrap();
        device.write(SegmentId::new(2), 0, b"ok").unwrap();
    }

    #[test]
    fn test_image_is_independent_copy() {
        let device = device();
        device.write(SegmentId::new(1), 0, b"before").unwrap();
        let image = device.image();
        device.write(SegmentId::new(1), 0, b"after!").unwrap();
        assert_eq!(image.read(SegmentId::new(1), 0, 6).unwrap(), b"before");
    }
}
