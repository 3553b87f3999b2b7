//! Store statistics.
//!
//! # Usage
//!
//! ```rust,ignore
//! let stats = tm.stats();
//! println!("Commits: {}", stats.transactions_committed);
//! println!("Cache hit ratio: {:.2}", stats.cache_hit_ratio());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Store statistics and counters.
///
/// All counters are atomic and can be read while operations are in progress.
/// Values only ever increase.
#[derive(Debug, Default)]
pub struct StoreStats {
    // Transaction counters
    transactions_started: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_aborted: AtomicU64,
    conflicts: AtomicU64,

    // Journal counters
    records_written: AtomicU64,
    bytes_journaled: AtomicU64,
    checkpoints: AtomicU64,

    // Cleaner counters
    cleaner_passes: AtomicU64,
    segments_released: AtomicU64,
    extents_relocated: AtomicU64,
    bytes_relocated: AtomicU64,

    // Cache counters
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_evictions: AtomicU64,
}

impl StoreStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_transaction_start(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_abort(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_journal_write(&self, bytes: u64) {
        self.records_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_journaled.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cleaner_pass(&self) {
        self.cleaner_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_segment_released(&self) {
        self.segments_released.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_relocation(&self, extents: u64, bytes: u64) {
        self.extents_relocated.fetch_add(extents, Ordering::Relaxed);
        self.bytes_relocated.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_evictions(&self, count: u64) {
        self.cache_evictions.fetch_add(count, Ordering::Relaxed);
    }

    /// Returns the total number of transactions started.
    pub fn transactions_started(&self) -> u64 {
        self.transactions_started.load(Ordering::Relaxed)
    }

    /// Returns the total number of transactions committed.
    pub fn transactions_committed(&self) -> u64 {
        self.transactions_committed.load(Ordering::Relaxed)
    }

    /// Returns the total number of transactions aborted or dropped.
    pub fn transactions_aborted(&self) -> u64 {
        self.transactions_aborted.load(Ordering::Relaxed)
    }

    /// Returns the number of conflicts reported to callers.
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    /// Returns the number of journal records written, rolls excluded.
    pub fn records_written(&self) -> u64 {
        self.records_written.load(Ordering::Relaxed)
    }

    /// Returns the total bytes appended to the journal.
    pub fn bytes_journaled(&self) -> u64 {
        self.bytes_journaled.load(Ordering::Relaxed)
    }

    /// Returns the total number of checkpoints.
    pub fn checkpoints(&self) -> u64 {
        self.checkpoints.load(Ordering::Relaxed)
    }

    /// Returns the number of cleaner passes run.
    pub fn cleaner_passes(&self) -> u64 {
        self.cleaner_passes.load(Ordering::Relaxed)
    }

    /// Returns the number of segments released by the cleaner.
    pub fn segments_released(&self) -> u64 {
        self.segments_released.load(Ordering::Relaxed)
    }

    /// Returns the number of extents relocated by the cleaner.
    pub fn extents_relocated(&self) -> u64 {
        self.extents_relocated.load(Ordering::Relaxed)
    }

    /// Returns the bytes relocated by the cleaner.
    pub fn bytes_relocated(&self) -> u64 {
        self.bytes_relocated.load(Ordering::Relaxed)
    }

    /// Returns the number of cache hits.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Returns the number of cache misses.
    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    /// Returns the number of extents evicted from the cache.
    pub fn cache_evictions(&self) -> u64 {
        self.cache_evictions.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            transactions_started: self.transactions_started(),
            transactions_committed: self.transactions_committed(),
            transactions_aborted: self.transactions_aborted(),
            conflicts: self.conflicts(),
            records_written: self.records_written(),
            bytes_journaled: self.bytes_journaled(),
            checkpoints: self.checkpoints(),
            cleaner_passes: self.cleaner_passes(),
            segments_released: self.segments_released(),
            extents_relocated: self.extents_relocated(),
            bytes_relocated: self.bytes_relocated(),
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses(),
            cache_evictions: self.cache_evictions(),
        }
    }
}

/// A point-in-time snapshot of store statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Total number of transactions started.
    pub transactions_started: u64,
    /// Total number of transactions committed.
    pub transactions_committed: u64,
    /// Total number of transactions aborted or dropped.
    pub transactions_aborted: u64,
    /// Conflicts reported to callers.
    pub conflicts: u64,
    /// Journal records written, rolls excluded.
    pub records_written: u64,
    /// Bytes appended to the journal.
    pub bytes_journaled: u64,
    /// Total number of checkpoints.
    pub checkpoints: u64,
    /// Cleaner passes run.
    pub cleaner_passes: u64,
    /// Segments released by the cleaner.
    pub segments_released: u64,
    /// Extents relocated by the cleaner.
    pub extents_relocated: u64,
    /// Bytes relocated by the cleaner.
    pub bytes_relocated: u64,
    /// Cache hits.
    pub cache_hits: u64,
    /// Cache misses.
    pub cache_misses: u64,
    /// Extents evicted from the cache.
    pub cache_evictions: u64,
}

impl StatsSnapshot {
    /// Returns the fraction of cache lookups that hit, or 0 with no lookups.
    #[must_use]
    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}
