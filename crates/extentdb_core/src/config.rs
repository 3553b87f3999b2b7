//! Store configuration.

use crate::lba::{INTERNAL_CAPACITY, LEAF_CAPACITY};

/// Configuration for a transaction manager.
///
/// Device geometry is not configured here; it comes from the device.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bytes of clean extent content the cache may hold before evicting.
    pub cache_capacity_bytes: usize,

    /// Dirty extent count above which a checkpoint is written.
    pub checkpoint_dirty_limit: usize,

    /// Free segments below which cleaning runs after each commit.
    pub cleaner_reserve_segments: u32,

    /// Maximum cleaner passes run after a single commit.
    pub cleaner_max_passes: u32,

    /// Maximum extent content a single transaction may stage.
    pub max_transaction_bytes: usize,

    /// Whether to sync the device after every commit (safer but slower).
    pub sync_on_commit: bool,

    /// Maximum entries in an LBA leaf node.
    pub lba_leaf_capacity: usize,

    /// Maximum children of an LBA internal node.
    pub lba_internal_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_capacity_bytes: 64 * 1024 * 1024, // 64 MB
            checkpoint_dirty_limit: 4096,
            cleaner_reserve_segments: 4,
            cleaner_max_passes: 4,
            max_transaction_bytes: 16 * 1024 * 1024, // 16 MB
            sync_on_commit: true,
            lba_leaf_capacity: LEAF_CAPACITY,
            lba_internal_capacity: INTERNAL_CAPACITY,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cache capacity in bytes.
    #[must_use]
    pub const fn cache_capacity_bytes(mut self, bytes: usize) -> Self {
        self.cache_capacity_bytes = bytes;
        self
    }

    /// Sets the dirty extent count that triggers a checkpoint.
    #[must_use]
    pub const fn checkpoint_dirty_limit(mut self, limit: usize) -> Self {
        self.checkpoint_dirty_limit = limit;
        self
    }

    /// Sets the free segment reserve maintained by the cleaner.
    #[must_use]
    pub const fn cleaner_reserve_segments(mut self, segments: u32) -> Self {
        self.cleaner_reserve_segments = segments;
        self
    }

    /// Sets the maximum cleaner passes per commit.
    #[must_use]
    pub const fn cleaner_max_passes(mut self, passes: u32) -> Self {
        self.cleaner_max_passes = passes;
        self
    }

    /// Sets the maximum staged content per transaction.
    #[must_use]
    pub const fn max_transaction_bytes(mut self, bytes: usize) -> Self {
        self.max_transaction_bytes = bytes;
        self
    }

    /// Sets whether to sync the device on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the LBA node capacities.
    ///
    /// Small capacities make splits easy to provoke in tests. Values below
    /// 3 are raised to 3.
    #[must_use]
    pub const fn lba_capacity(mut self, leaf: usize, internal: usize) -> Self {
        self.lba_leaf_capacity = if leaf < 3 { 3 } else { leaf };
        self.lba_internal_capacity = if internal < 3 { 3 } else { internal };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.sync_on_commit);
        assert_eq!(config.lba_leaf_capacity, 64);
        assert_eq!(config.lba_internal_capacity, 64);
        assert_eq!(config.cleaner_reserve_segments, 4);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .sync_on_commit(false)
            .cache_capacity_bytes(1024)
            .checkpoint_dirty_limit(8)
            .lba_capacity(4, 1);

        assert!(!config.sync_on_commit);
        assert_eq!(config.cache_capacity_bytes, 1024);
        assert_eq!(config.checkpoint_dirty_limit, 8);
        assert_eq!(config.lba_leaf_capacity, 4);
        assert_eq!(config.lba_internal_capacity, 3);
    }
}
