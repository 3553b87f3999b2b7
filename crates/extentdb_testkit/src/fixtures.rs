//! Store fixtures.
//!
//! Provides convenience functions for setting up mounted stores over
//! ephemeral and file devices, and common test scenarios.

use extentdb_core::{Config, CoreResult, Laddr, LogicalExtent, TransactionManager};
use extentdb_device::{DeviceConfig, EphemeralSegmentManager, FileSegmentManager, SegmentManager};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Segment size used by test stores.
pub const TEST_SEGMENT_SIZE: u32 = 64 * 1024;

/// Segment count used by test stores.
pub const TEST_NUM_SEGMENTS: u32 = 16;

/// Device geometry used by test stores.
#[must_use]
pub fn test_geometry() -> DeviceConfig {
    DeviceConfig::new()
        .segment_size(TEST_SEGMENT_SIZE)
        .num_segments(TEST_NUM_SEGMENTS)
}

/// Store configuration used by test stores.
#[must_use]
pub fn test_config() -> Config {
    Config::default()
        .cache_capacity_bytes(256 * 1024)
        .cleaner_reserve_segments(2)
}

enum Backing {
    Memory(Arc<EphemeralSegmentManager>),
    File { dir: TempDir, path: PathBuf },
}

/// A mounted store with automatic cleanup.
pub struct TestStore {
    /// The transaction manager.
    pub tm: TransactionManager,
    device: Arc<dyn SegmentManager>,
    backing: Backing,
    geometry: DeviceConfig,
    config: Config,
}

impl TestStore {
    /// Creates a mounted store over a fresh in-memory device.
    pub fn memory() -> Self {
        Self::memory_with(test_geometry(), test_config())
    }

    /// Creates a mounted store over an in-memory device with the given
    /// geometry and configuration.
    pub fn memory_with(geometry: DeviceConfig, config: Config) -> Self {
        let memory = Arc::new(EphemeralSegmentManager::new(geometry));
        let device: Arc<dyn SegmentManager> = memory.clone();
        let tm = Self::create(device.clone(), config.clone());
        Self {
            tm,
            device,
            backing: Backing::Memory(memory),
            geometry,
            config,
        }
    }

    /// Creates a mounted store over a file device in a temporary directory.
    pub fn file() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let path = dir.path().join("store.img");
        let geometry = test_geometry();
        let device: Arc<dyn SegmentManager> = Arc::new(
            FileSegmentManager::open(&path, geometry).expect("Failed to open file device"),
        );
        let config = test_config();
        let tm = Self::create(device.clone(), config.clone());
        Self {
            tm,
            device,
            backing: Backing::File { dir, path },
            geometry,
            config,
        }
    }

    fn create(device: Arc<dyn SegmentManager>, config: Config) -> TransactionManager {
        let tm = TransactionManager::new(device, config);
        tm.mkfs().expect("Failed to create store");
        tm.mount().expect("Failed to mount store");
        tm
    }

    /// Returns the device the store runs on.
    pub fn device(&self) -> &Arc<dyn SegmentManager> {
        &self.device
    }

    /// Returns the in-memory device, if the store has one.
    pub fn memory_device(&self) -> Option<&Arc<EphemeralSegmentManager>> {
        match &self.backing {
            Backing::Memory(memory) => Some(memory),
            Backing::File { .. } => None,
        }
    }

    /// Returns the device file path if file-based, None if in-memory.
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Memory(_) => None,
            Backing::File { path, .. } => Some(path),
        }
    }

    /// Returns the store configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Closes the store and mounts it again from the device.
    ///
    /// File stores reopen the device file, so the file lock is released
    /// and taken again.
    pub fn remount(&mut self) {
        self.tm.close().expect("Failed to close store");
        self.reopen_device();
        self.tm = TransactionManager::new(self.device.clone(), self.config.clone());
        self.tm.mount().expect("Failed to remount store");
    }

    /// Mounts a copy of the device as it is right now, without closing.
    ///
    /// Models a crash: whatever the store did not write is lost, whatever
    /// it wrote is kept. Only in-memory stores can crash.
    pub fn crash(&mut self) -> CoreResult<()> {
        let image = match &self.backing {
            Backing::Memory(memory) => Arc::new(memory.duplicate()),
            Backing::File { .. } => panic!("file stores cannot be crashed"),
        };
        self.device = image.clone();
        self.backing = Backing::Memory(image);
        self.tm = TransactionManager::new(self.device.clone(), self.config.clone());
        self.tm.mount()
    }

    fn reopen_device(&mut self) {
        let Backing::File { path, .. } = &self.backing else {
            return;
        };
        let path = path.clone();
        // every handle must go before the file lock can be taken again
        let placeholder: Arc<dyn SegmentManager> =
            Arc::new(EphemeralSegmentManager::new(self.geometry));
        self.tm = TransactionManager::new(placeholder.clone(), self.config.clone());
        self.device = placeholder;
        self.device = Arc::new(
            FileSegmentManager::open(&path, self.geometry).expect("Failed to reopen device"),
        );
    }

    /// Returns the temporary directory of a file store.
    pub fn dir(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Memory(_) => None,
            Backing::File { dir, .. } => Some(dir.path()),
        }
    }
}

impl std::ops::Deref for TestStore {
    type Target = TransactionManager;

    fn deref(&self) -> &Self::Target {
        &self.tm
    }
}

/// Runs a test with a temporary in-memory store.
///
/// # Example
///
/// ```rust,ignore
/// use extentdb_testkit::with_temp_store;
///
/// #[test]
/// fn my_test() {
///     with_temp_store(|tm| {
///         let mut tx = tm.create_transaction().unwrap();
///         // ... test operations
///     });
/// }
/// ```
pub fn with_temp_store<F, R>(f: F) -> R
where
    F: FnOnce(&TransactionManager) -> R,
{
    let store = TestStore::memory();
    f(&store.tm)
}

/// Runs a test with a temporary file-based store.
pub fn with_file_store<F, R>(f: F) -> R
where
    F: FnOnce(&TransactionManager, &Path) -> R,
{
    let store = TestStore::file();
    let path = store.path().expect("File store should have a path").to_path_buf();
    f(&store.tm, &path)
}

/// Allocates an extent of `len` bytes filled with `fill` in its own
/// transaction and returns its address.
pub fn write_extent(tm: &TransactionManager, hint: u64, len: u32, fill: u8) -> CoreResult<Laddr> {
    let mut tx = tm.create_transaction()?;
    let extent = tm.alloc_extent(&mut tx, Laddr::new(hint), len)?;
    if let Some(handle) = extent.handle {
        tx.write(handle, 0, &vec![fill; len as usize])?;
    }
    tm.submit_transaction(tx)?;
    Ok(extent.laddr)
}

/// Reads the extent starting exactly at `laddr`, if one is mapped.
pub fn read_extent(tm: &TransactionManager, laddr: Laddr) -> CoreResult<Option<LogicalExtent>> {
    let mut tx = tm.create_transaction()?;
    let extents = tm.read_extents(&mut tx, laddr, 1)?;
    Ok(extents.into_iter().find(|extent| extent.laddr == laddr))
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates a store with `count` extents of `len` bytes at consecutive
    /// addresses, extent `i` filled with `i as u8`.
    pub fn populated_store(count: usize, len: u32) -> (TestStore, Vec<Laddr>) {
        let store = TestStore::memory();
        let laddrs = (0..count)
            .map(|i| {
                write_extent(&store, 0, len, i as u8).expect("Failed to write extent")
            })
            .collect();
        (store, laddrs)
    }
}
