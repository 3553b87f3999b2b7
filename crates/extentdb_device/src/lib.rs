//! # ExtentDB Device
//!
//! The segment manager boundary for ExtentDB.
//!
//! A device is a fixed number of fixed-size **segments**. Devices are
//! opaque byte stores: they read and write byte ranges inside a segment,
//! prepare a segment for use and discard it again. They know nothing about
//! journal records, extents or the logical address space.
//!
//! ## Design Principles
//!
//! - Devices are addressed by `(SegmentId, offset)`
//! - The caller decides which segment to allocate; devices only prepare
//!   and discard segments
//! - Must be `Send + Sync` so one device can be shared by the journal,
//!   the cache and the cleaner
//!
//! ## Available Devices
//!
//! - [`EphemeralSegmentManager`] - In-memory, for tests and scratch stores
//! - [`FileSegmentManager`] - A single preallocated file, locked for exclusive use
//!
//! ## Example
//!
//! ```rust
//! use extentdb_device::{DeviceConfig, EphemeralSegmentManager, SegmentId, SegmentManager};
//!
//! let device = EphemeralSegmentManager::new(DeviceConfig::default());
//! device.init().unwrap();
//! device.allocate_segment(SegmentId::new(1)).unwrap();
//! device.write(SegmentId::new(1), 0, b"hello").unwrap();
//! assert_eq!(device.read(SegmentId::new(1), 0, 5).unwrap(), b"hello");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod ephemeral;
mod error;
mod file;
mod manager;

pub use ephemeral::EphemeralSegmentManager;
pub use error::{DeviceError, DeviceResult};
pub use file::FileSegmentManager;
pub use manager::{DeviceConfig, SegmentId, SegmentManager};
