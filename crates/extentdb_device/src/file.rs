//! File-based segment device for persistent storage.

use crate::error::{DeviceError, DeviceResult};
use crate::manager::{DeviceConfig, SegmentId, SegmentManager};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A file-based segment device.
///
/// All segments live in one file of `segment_size * num_segments` bytes;
/// segment `n` starts at byte `n * segment_size`. The file is locked
/// exclusively for the lifetime of the device so two stores can never
/// share it.
///
/// # Durability
///
/// - `write()` hands data to the OS
/// - `sync()` calls `File::sync_data()` to ensure data is on disk
///
/// # Example
///
/// ```no_run
/// use extentdb_device::{DeviceConfig, FileSegmentManager, SegmentId, SegmentManager};
/// use std::path::Path;
///
/// let device = FileSegmentManager::open(Path::new("store.img"), DeviceConfig::default()).unwrap();
/// device.init().unwrap();
/// device.write(SegmentId::new(1), 0, b"persistent data").unwrap();
/// device.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileSegmentManager {
    path: PathBuf,
    config: DeviceConfig,
    file: Mutex<File>,
}

impl FileSegmentManager {
    /// Opens or creates the device file at `path`.
    ///
    /// The file is not resized until [`SegmentManager::init`] is called.
    ///
    /// # Errors
    ///
    /// Returns `Locked` if another handle holds the file, or an I/O error.
    pub fn open(path: &Path, config: DeviceConfig) -> DeviceResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(DeviceError::Locked);
        }

        debug!(path = %path.display(), ?config, "opened file device");

        Ok(Self {
            path: path.to_path_buf(),
            config,
            file: Mutex::new(file),
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn position(&self, segment: SegmentId, offset: u32) -> u64 {
        u64::from(segment.as_u32()) * u64::from(self.config.segment_size) + u64::from(offset)
    }

    fn ensure_sized(&self, file: &File) -> DeviceResult<()> {
        if file.metadata()?.len() < self.config.total_size() {
            return Err(DeviceError::Uninitialized);
        }
        Ok(())
    }
}

impl SegmentManager for FileSegmentManager {
    fn init(&self) -> DeviceResult<()> {
        let file = self.file.lock();
        let current = file.metadata()?.len();
        if current < self.config.total_size() {
            file.set_len(self.config.total_size())?;
            file.sync_all()?;
            debug!(size = self.config.total_size(), "extended file device");
        }
        Ok(())
    }

    fn config(&self) -> DeviceConfig {
        self.config
    }

    fn read(&self, segment: SegmentId, offset: u32, len: usize) -> DeviceResult<Vec<u8>> {
        self.config.check_access(segment, offset, len)?;
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut file = self.file.lock();
        self.ensure_sized(&file)?;
        file.seek(SeekFrom::Start(self.position(segment, offset)))?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn write(&self, segment: SegmentId, offset: u32, data: &[u8]) -> DeviceResult<()> {
        self.config.check_access(segment, offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }

        let mut file = self.file.lock();
        self.ensure_sized(&file)?;
        file.seek(SeekFrom::Start(self.position(segment, offset)))?;
        file.write_all(data)?;
        Ok(())
    }

    fn allocate_segment(&self, segment: SegmentId) -> DeviceResult<()> {
        self.config.check_segment(segment)?;
        let file = self.file.lock();
        self.ensure_sized(&file)
    }

    fn release_segment(&self, segment: SegmentId) -> DeviceResult<()> {
        self.config.check_segment(segment)?;
        let zeroes = vec![0u8; self.config.segment_size as usize];
        let mut file = self.file.lock();
        self.ensure_sized(&file)?;
        file.seek(SeekFrom::Start(self.position(segment, 0)))?;
        file.write_all(&zeroes)?;
        Ok(())
    }

    fn sync(&self) -> DeviceResult<()> {
        let mut file = self.file.lock();
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }
}

impl Drop for FileSegmentManager {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&*self.file.lock());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_config() -> DeviceConfig {
        DeviceConfig::new().segment_size(4096).num_segments(4)
    }

    #[test]
    fn file_init_sizes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device.img");

        let device = FileSegmentManager::open(&path, small_config()).unwrap();
        device.init().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 * 4096);
    }

    #[test]
    fn file_io_before_init_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device.img");

        let device = FileSegmentManager::open(&path, small_config()).unwrap();
        assert!(matches!(
            device.read(SegmentId::new(1), 0, 4),
            Err(DeviceError::Uninitialized)
        ));
    }

    #[test]
    fn file_write_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device.img");

        let device = FileSegmentManager::open(&path, small_config()).unwrap();
        device.init().unwrap();
        device.write(SegmentId::new(2), 100, b"hello world").unwrap();
        assert_eq!(device.read(SegmentId::new(2), 106, 5).unwrap(), b"world");
    }

    #[test]
    fn file_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device.img");

        {
            let device = FileSegmentManager::open(&path, small_config()).unwrap();
            device.init().unwrap();
            device.write(SegmentId::new(3), 0, b"persistent data").unwrap();
            device.sync().unwrap();
        }

        {
            let device = FileSegmentManager::open(&path, small_config()).unwrap();
            device.init().unwrap();
            assert_eq!(device.read(SegmentId::new(3), 0, 15).unwrap(), b"persistent data");
        }
    }

    #[test]
    fn file_release_zeroes_segment() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device.img");

        let device = FileSegmentManager::open(&path, small_config()).unwrap();
        device.init().unwrap();
        device.write(SegmentId::new(1), 0, b"gone").unwrap();
        device.release_segment(SegmentId::new(1)).unwrap();
        assert_eq!(device.read(SegmentId::new(1), 0, 4).unwrap(), vec![0; 4]);
    }

    #[test]
    fn file_lock_prevents_second_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device.img");

        let _first = FileSegmentManager::open(&path, small_config()).unwrap();
        let second = FileSegmentManager::open(&path, small_config());
        assert!(matches!(second, Err(DeviceError::Locked)));
    }

    #[test]
    fn file_lock_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device.img");

        drop(FileSegmentManager::open(&path, small_config()).unwrap());
        assert!(FileSegmentManager::open(&path, small_config()).is_ok());
    }

    #[test]
    fn file_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("device.img");

        let device = FileSegmentManager::open(&path, small_config()).unwrap();
        assert_eq!(device.path(), path);
    }
}
