//! # ExtentDB Testkit
//!
//! Test utilities for ExtentDB.
//!
//! This crate provides:
//! - Store fixtures over ephemeral and file devices
//! - A harness that mirrors every commit in a reference model
//! - A fault-injecting device for crash and I/O failure tests
//! - Property-based test generators using proptest
//! - Concurrent stress drivers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use extentdb_testkit::prelude::*;
//!
//! #[test]
//! fn round_trip() {
//!     let mut harness = IntegrationHarness::new();
//!     let laddr = harness.alloc(0, 4096, b'a');
//!     harness.remount();
//!     harness.verify_all();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod stress;

use std::sync::Once;
use tracing_subscriber::EnvFilter;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::stress::*;
    pub use crate::init_test_logging;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use stress::*;

static LOGGING: Once = Once::new();

/// Installs a `fmt` subscriber filtered by `RUST_LOG` (default `warn`).
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
