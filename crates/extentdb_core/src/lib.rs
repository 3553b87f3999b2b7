//! # ExtentDB Core
//!
//! Transactional, log-structured extent store for ExtentDB.
//!
//! This crate provides:
//! - A journal of checksummed records over device segments
//! - An LBA B-tree mapping logical addresses to physical extents
//! - An extent cache tracking clean and dirty content
//! - A segment cleaner reclaiming space behind the journal
//! - A transaction manager committing copy-on-write transactions
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use extentdb_core::{Config, Laddr, TransactionManager};
//! use extentdb_device::{DeviceConfig, EphemeralSegmentManager};
//!
//! let device = Arc::new(EphemeralSegmentManager::new(
//!     DeviceConfig::new().segment_size(64 * 1024).num_segments(8),
//! ));
//! let tm = TransactionManager::new(device, Config::default());
//! tm.mkfs().unwrap();
//! tm.mount().unwrap();
//!
//! let mut tx = tm.create_transaction().unwrap();
//! let extent = tm.alloc_extent(&mut tx, Laddr::new(0), 4096).unwrap();
//! tx.write(extent.handle.unwrap(), 0, b"hello").unwrap();
//! tm.submit_transaction(tx).unwrap();
//!
//! let mut tx = tm.create_transaction().unwrap();
//! let found = tm.read_extents(&mut tx, Laddr::new(0), 4096).unwrap();
//! assert_eq!(&found[0].data[..5], b"hello");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod cleaner;
mod config;
mod error;
mod extent;
pub mod journal;
pub mod lba;
mod stats;
pub mod superblock;
mod transaction;
mod types;

pub use cache::Cache;
pub use cleaner::{CleanOutcome, ExtentCallback, RelocationResult, SegmentCleaner};
pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use extent::LogicalExtent;
pub use journal::{JournalCursor, JournalState};
pub use lba::{LbaEntry, LbaManager};
pub use stats::{StatsSnapshot, StoreStats};
pub use superblock::{CheckpointPosition, Superblock};
pub use transaction::{Transaction, TransactionManager, TransactionSource, TransactionState};
pub use types::{ExtentHandle, Generation, JournalSeq, Laddr, Paddr, SegmentId, TransactionId};
