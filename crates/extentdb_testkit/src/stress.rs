//! Stress drivers for ExtentDB.
//!
//! These drivers run transactions from several threads against one
//! store to exercise claiming, commit serialization and cleaning under
//! concurrent access.

use crate::fixtures::write_extent;
use extentdb_core::{CoreError, CoreResult, Laddr, TransactionManager};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Operations that lost a conflict.
    pub conflicts: usize,
    /// Operations that failed for any other reason.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, conflicts: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + conflicts + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            conflicts,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Conflicts: {}", self.conflicts);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Size of every extent in bytes.
    pub extent_size: u32,
    /// Extents per thread, or shared extents for contended runs.
    pub extent_count: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 200,
            threads: 4,
            extent_size: 1024,
            extent_count: 8,
        }
    }
}

#[derive(Default)]
struct Counters {
    successful: AtomicUsize,
    conflicts: AtomicUsize,
    failed: AtomicUsize,
}

impl Counters {
    fn record(&self, result: CoreResult<()>) {
        let counter = match result {
            Ok(()) => &self.successful,
            Err(err) if err.is_retryable() => &self.conflicts,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn finish(&self, start: Instant) -> StressTestResult {
        StressTestResult::new(
            self.successful.load(Ordering::Relaxed),
            self.conflicts.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            start.elapsed(),
        )
    }
}

/// Overwrites the extent at `laddr` with `fill` in one transaction.
pub fn overwrite_extent(tm: &TransactionManager, laddr: Laddr, fill: u8) -> CoreResult<()> {
    let mut tx = tm.create_transaction()?;
    let current = tm
        .read_extents(&mut tx, laddr, 1)?
        .into_iter()
        .find(|extent| extent.laddr == laddr)
        .ok_or_else(|| CoreError::not_found(laddr))?;
    let clone = tm.get_mutable_extent(&mut tx, &current)?;
    if let Some(handle) = clone.handle {
        tx.write(handle, 0, &vec![fill; clone.len as usize])?;
    }
    tm.submit_transaction(tx)?;
    Ok(())
}

/// Runs writers that each own a disjoint set of extents.
///
/// No operation should conflict. Returns the result and, per thread, the
/// extents it owns with the fill byte it wrote last.
pub fn stress_disjoint_writers(
    tm: Arc<TransactionManager>,
    config: &StressConfig,
) -> (StressTestResult, Vec<Vec<(Laddr, u8)>>) {
    let region = u64::from(config.extent_size) * config.extent_count as u64;
    let counters = Arc::new(Counters::default());
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let tm = Arc::clone(&tm);
            let counters = Arc::clone(&counters);
            let config = config.clone();

            thread::spawn(move || {
                let base = region * t as u64;
                let mut owned: Vec<(Laddr, u8)> = (0..config.extent_count)
                    .filter_map(|_| write_extent(&tm, base, config.extent_size, 0).ok())
                    .map(|laddr| (laddr, 0))
                    .collect();
                if owned.is_empty() {
                    return owned;
                }
                for i in 0..config.operations {
                    let slot = i % owned.len();
                    let fill = (i % 251) as u8 + 1;
                    let result = overwrite_extent(&tm, owned[slot].0, fill);
                    if result.is_ok() {
                        owned[slot].1 = fill;
                    }
                    counters.record(result);
                }
                owned
            })
        })
        .collect();

    let owned = handles
        .into_iter()
        .map(|h| h.join().expect("Thread panicked"))
        .collect();
    (counters.finish(start), owned)
}

/// Runs writers that all overwrite the same few extents.
///
/// Conflicts are expected; the run checks that every operation either
/// commits or fails with a retryable conflict.
pub fn stress_contended_writers(
    tm: Arc<TransactionManager>,
    config: &StressConfig,
) -> StressTestResult {
    let shared: Arc<Vec<Laddr>> = Arc::new(
        (0..config.extent_count)
            .filter_map(|i| write_extent(&tm, 0, config.extent_size, i as u8).ok())
            .collect(),
    );
    let counters = Arc::new(Counters::default());
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let tm = Arc::clone(&tm);
            let shared = Arc::clone(&shared);
            let counters = Arc::clone(&counters);
            let operations = config.operations;

            thread::spawn(move || {
                for i in 0..operations {
                    if shared.is_empty() {
                        break;
                    }
                    let laddr = shared[(i + t) % shared.len()];
                    counters.record(overwrite_extent(&tm, laddr, t as u8));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }
    counters.finish(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{read_extent, test_config, test_geometry};
    use extentdb_core::Config;
    use extentdb_device::{DeviceConfig, EphemeralSegmentManager};

    fn shared_store() -> Arc<TransactionManager> {
        store_on(test_geometry(), test_config())
    }

    fn store_on(geometry: DeviceConfig, config: Config) -> Arc<TransactionManager> {
        let device = Arc::new(EphemeralSegmentManager::new(geometry));
        let tm = TransactionManager::new(device, config);
        tm.mkfs().unwrap();
        tm.mount().unwrap();
        Arc::new(tm)
    }

    #[test]
    fn test_disjoint_writers_never_conflict() {
        let tm = shared_store();
        let config = StressConfig {
            operations: 40,
            threads: 4,
            extent_size: 512,
            extent_count: 4,
        };
        let (result, owned) = stress_disjoint_writers(Arc::clone(&tm), &config);
        assert_eq!(result.conflicts, 0);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 160);

        for (laddr, fill) in owned.into_iter().flatten() {
            let extent = read_extent(&tm, laddr).unwrap().unwrap();
            assert!(extent.data.iter().all(|b| *b == fill));
        }
    }

    #[test]
    fn test_disjoint_writers_never_conflict_while_cleaning() {
        // small segments so commits keep triggering inline cleaning
        let geometry = DeviceConfig::new().segment_size(16 * 1024).num_segments(8);
        let tm = store_on(geometry, test_config());
        let config = StressConfig {
            operations: 100,
            threads: 4,
            extent_size: 512,
            extent_count: 4,
        };
        let (result, owned) = stress_disjoint_writers(Arc::clone(&tm), &config);
        assert!(tm.stats().segments_released > 0);
        assert_eq!(result.conflicts, 0);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 400);

        for (laddr, fill) in owned.into_iter().flatten() {
            let extent = read_extent(&tm, laddr).unwrap().unwrap();
            assert!(extent.data.iter().all(|b| *b == fill));
        }
        tm.lba().check_invariants().unwrap();
    }

    #[test]
    fn test_contended_writers_only_conflict() {
        let tm = shared_store();
        let config = StressConfig {
            operations: 30,
            threads: 4,
            extent_size: 512,
            extent_count: 2,
        };
        let result = stress_contended_writers(Arc::clone(&tm), &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops + result.conflicts, 120);
        assert!(result.successful_ops > 0);
        tm.lba().check_invariants().unwrap();
    }
}
