//! Transaction state.

use crate::cache::Cache;
use crate::error::{CoreError, CoreResult};
use crate::journal::{
    ADJUST_REF_DELTA_SIZE, ALLOC_DELTA_SIZE, RECORD_HEADER_SIZE, RELOCATE_DELTA_SIZE,
    REMAP_DELTA_SIZE,
};
use crate::lba::LbaEntry;
use crate::stats::StoreStats;
use crate::types::{ExtentHandle, Generation, Laddr, TransactionId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and can perform operations.
    Active,
    /// Transaction has been committed.
    Committed,
    /// Transaction has been aborted.
    Aborted,
}

/// Who created a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionSource {
    /// A foreground client.
    Client,
    /// The segment cleaner relocating live extents.
    Cleaner,
}

/// How a private extent relates to the committed mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingKind {
    /// Allocated by this transaction.
    Fresh,
    /// Copy-on-write clone of a committed extent.
    Mutated {
        /// The committed entry the clone replaces.
        original: LbaEntry,
    },
    /// Unchanged content being moved by the cleaner.
    Relocated {
        /// The committed entry being moved.
        original: LbaEntry,
    },
}

/// An extent in a transaction's private write set.
#[derive(Debug, Clone)]
pub(crate) struct PendingExtent {
    pub(crate) laddr: Laddr,
    pub(crate) len: u32,
    pub(crate) kind: PendingKind,
    pub(crate) data: Vec<u8>,
    /// Refcount of a fresh extent; unused for the other kinds.
    pub(crate) refcount: u32,
    /// False once the extent was dropped from the write set.
    pub(crate) live: bool,
}

impl PendingExtent {
    pub(crate) fn end(&self) -> u64 {
        self.laddr.as_u64() + u64::from(self.len)
    }
}

/// Registry of in-flight transactions and their snapshots.
#[derive(Debug, Default)]
pub(crate) struct ActiveTransactions {
    inner: Mutex<BTreeMap<TransactionId, Generation>>,
}

impl ActiveTransactions {
    /// Registers `id` with the generation current in `generation`.
    ///
    /// The generation is read under the registry lock, so a commit that
    /// publishes a generation and then asks for the oldest snapshot either
    /// sees this transaction or hands it the new generation.
    pub(crate) fn register_current(&self, id: TransactionId, generation: &AtomicU64) -> Generation {
        let mut inner = self.inner.lock();
        let snapshot = Generation::new(generation.load(Ordering::Acquire));
        inner.insert(id, snapshot);
        snapshot
    }

    pub(crate) fn unregister(&self, id: TransactionId) -> bool {
        self.inner.lock().remove(&id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns the oldest snapshot still held, if any transaction is active.
    pub(crate) fn oldest_snapshot(&self) -> Option<Generation> {
        self.inner.lock().values().min().copied()
    }
}

/// A transaction.
///
/// Holds a bounded private working set: extents it allocated or cloned
/// for mutation, refcount changes to committed extents, and the
/// generations of committed extents it observed. Nothing is visible to
/// other transactions until
/// [`submit_transaction`](crate::TransactionManager::submit_transaction).
///
/// Dropping an unsubmitted transaction aborts it.
pub struct Transaction {
    id: TransactionId,
    snapshot: Generation,
    source: TransactionSource,
    state: TransactionState,
    /// Private extents, addressed by `ExtentHandle`.
    pub(crate) pending: Vec<PendingExtent>,
    /// Live private extents by logical address.
    pub(crate) by_laddr: BTreeMap<Laddr, usize>,
    /// Refcount changes to committed extents.
    pub(crate) ref_deltas: BTreeMap<Laddr, i64>,
    /// Committed extents whose refcount this transaction drops to zero.
    pub(crate) removed: BTreeSet<Laddr>,
    /// Committed extents observed, with the generation seen.
    pub(crate) read_set: BTreeMap<Laddr, Generation>,
    pending_bytes: usize,
    cache: Arc<Cache>,
    active: Arc<ActiveTransactions>,
    stats: Arc<StoreStats>,
}

impl Transaction {
    /// Starts a transaction observing the generation current in
    /// `generation`.
    pub(crate) fn begin(
        id: TransactionId,
        generation: &AtomicU64,
        source: TransactionSource,
        cache: Arc<Cache>,
        active: Arc<ActiveTransactions>,
        stats: Arc<StoreStats>,
    ) -> Self {
        let snapshot = active.register_current(id, generation);
        stats.record_transaction_start();
        Self {
            id,
            snapshot,
            source,
            state: TransactionState::Active,
            pending: Vec::new(),
            by_laddr: BTreeMap::new(),
            ref_deltas: BTreeMap::new(),
            removed: BTreeSet::new(),
            read_set: BTreeMap::new(),
            pending_bytes: 0,
            cache,
            active,
            stats,
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the generation the transaction observes.
    #[must_use]
    pub fn snapshot(&self) -> Generation {
        self.snapshot
    }

    /// Returns who created the transaction.
    #[must_use]
    pub fn source(&self) -> TransactionSource {
        self.source
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Checks if the transaction is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Returns true if submitting the transaction would change nothing.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.by_laddr.is_empty()
            && self.removed.is_empty()
            && self.ref_deltas.values().all(|delta| *delta == 0)
    }

    /// Returns the bytes of private extent content staged.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Returns the size of the journal record submitting now would write.
    pub(crate) fn estimated_record_len(&self) -> usize {
        let extents: usize = self
            .live_extents()
            .map(|e| {
                let delta = match e.kind {
                    PendingKind::Fresh => ALLOC_DELTA_SIZE,
                    PendingKind::Mutated { .. } => REMAP_DELTA_SIZE,
                    PendingKind::Relocated { .. } => RELOCATE_DELTA_SIZE,
                };
                delta + e.data.len()
            })
            .sum();
        RECORD_HEADER_SIZE as usize + extents + ADJUST_REF_DELTA_SIZE * self.ref_deltas.len()
    }

    /// Returns the handle of the private extent at `laddr`, if any.
    #[must_use]
    pub fn handle_for(&self, laddr: Laddr) -> Option<ExtentHandle> {
        self.by_laddr.get(&laddr).map(|&index| ExtentHandle(index))
    }

    /// Returns the content of a private extent.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the handle does not name a live
    /// private extent of this transaction.
    pub fn data(&self, handle: ExtentHandle) -> CoreResult<&[u8]> {
        Ok(&self.live_extent(handle)?.data)
    }

    /// Returns the content of a private extent for writing.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the handle does not name a live
    /// private extent of this transaction, or the extent is being
    /// relocated rather than mutated.
    pub fn extent_mut(&mut self, handle: ExtentHandle) -> CoreResult<&mut [u8]> {
        self.ensure_active()?;
        let extent = self.live_extent(handle)?;
        if matches!(extent.kind, PendingKind::Relocated { .. }) {
            return Err(CoreError::invalid_operation(format!(
                "{} is being relocated, not mutated",
                extent.laddr
            )));
        }
        Ok(&mut self.pending[handle.index()].data)
    }

    /// Copies `bytes` into a private extent at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the write does not fit the extent or
    /// the handle is not valid.
    pub fn write(&mut self, handle: ExtentHandle, offset: u32, bytes: &[u8]) -> CoreResult<()> {
        let data = self.extent_mut(handle)?;
        let start = offset as usize;
        let end = start
            .checked_add(bytes.len())
            .filter(|end| *end <= data.len())
            .ok_or_else(|| {
                CoreError::invalid_operation(format!(
                    "write of {} bytes at offset {offset} exceeds extent of {} bytes",
                    bytes.len(),
                    data.len()
                ))
            })?;
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    pub(crate) fn ensure_active(&self) -> CoreResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(CoreError::invalid_operation(format!(
                "{} is {:?}",
                self.id, self.state
            )))
        }
    }

    pub(crate) fn live_extent(&self, handle: ExtentHandle) -> CoreResult<&PendingExtent> {
        self.pending
            .get(handle.index())
            .filter(|extent| extent.live)
            .ok_or_else(|| {
                CoreError::invalid_operation(format!(
                    "handle {} is not a live extent of {}",
                    handle.index(),
                    self.id
                ))
            })
    }

    /// Adds a private extent and returns its handle.
    pub(crate) fn stage(&mut self, extent: PendingExtent) -> ExtentHandle {
        let index = self.pending.len();
        self.pending_bytes += extent.data.len();
        self.by_laddr.insert(extent.laddr, index);
        self.pending.push(extent);
        ExtentHandle(index)
    }

    /// Drops the private extent at `laddr` from the write set.
    pub(crate) fn unstage(&mut self, laddr: Laddr) {
        if let Some(index) = self.by_laddr.remove(&laddr) {
            let extent = &mut self.pending[index];
            extent.live = false;
            self.pending_bytes -= extent.data.len();
        }
    }

    /// Returns the live private extents in address order.
    pub(crate) fn live_extents(&self) -> impl Iterator<Item = &PendingExtent> {
        self.by_laddr.values().map(|&index| &self.pending[index])
    }

    /// Returns the live private extents intersecting `[start, end)`.
    pub(crate) fn live_extents_in(&self, start: u64, end: u64) -> Vec<&PendingExtent> {
        self.live_extents()
            .filter(|e| e.laddr.as_u64() < end && e.end() > start)
            .collect()
    }

    /// Returns the ranges of live fresh extents, for free-space searches.
    pub(crate) fn fresh_ranges(&self) -> Vec<(Laddr, u32)> {
        self.live_extents()
            .filter(|e| e.kind == PendingKind::Fresh)
            .map(|e| (e.laddr, e.len))
            .collect()
    }

    pub(crate) fn record_read(&mut self, entry: &LbaEntry) {
        self.read_set.entry(entry.laddr).or_insert(entry.generation);
    }

    pub(crate) fn mark_committed(&mut self) {
        self.state = TransactionState::Committed;
    }

    pub(crate) fn mark_aborted(&mut self) {
        if self.state == TransactionState::Active {
            self.state = TransactionState::Aborted;
            self.stats.record_transaction_abort();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.mark_aborted();
        self.cache.release_transaction(self.id);
        self.active.unregister(self.id);
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("snapshot", &self.snapshot)
            .field("source", &self.source)
            .field("state", &self.state)
            .field("pending", &self.by_laddr.len())
            .field("pending_bytes", &self.pending_bytes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extentdb_device::{DeviceConfig, EphemeralSegmentManager};

    fn transaction() -> (Transaction, Arc<ActiveTransactions>, Arc<StoreStats>) {
        let device = Arc::new(EphemeralSegmentManager::initialized(
            DeviceConfig::new().segment_size(4096).num_segments(2),
        ));
        let stats = Arc::new(StoreStats::new());
        let cache = Arc::new(Cache::new(device, 1024, stats.clone()));
        let active = Arc::new(ActiveTransactions::default());
        let txn = Transaction::begin(
            TransactionId::new(1),
            &AtomicU64::new(5),
            TransactionSource::Client,
            cache,
            active.clone(),
            stats.clone(),
        );
        (txn, active, stats)
    }

    fn fresh(laddr: u64, len: u32) -> PendingExtent {
        PendingExtent {
            laddr: Laddr::new(laddr),
            len,
            kind: PendingKind::Fresh,
            data: vec![0; len as usize],
            refcount: 1,
            live: true,
        }
    }

    #[test]
    fn new_transaction_is_active_and_registered() {
        let (txn, active, _) = transaction();
        assert!(txn.is_active());
        assert!(txn.is_read_only());
        assert_eq!(active.len(), 1);
        assert_eq!(active.oldest_snapshot(), Some(Generation::new(5)));
    }

    #[test]
    fn drop_unregisters_and_counts_abort() {
        let (txn, active, stats) = transaction();
        drop(txn);
        assert_eq!(active.len(), 0);
        assert_eq!(stats.transactions_aborted(), 1);
    }

    #[test]
    fn write_into_staged_extent() {
        let (mut txn, _, _) = transaction();
        let handle = txn.stage(fresh(0x1000, 8));
        txn.write(handle, 2, b"abc").unwrap();
        assert_eq!(txn.data(handle).unwrap(), b"\0\0abc\0\0\0");
        assert_eq!(txn.pending_bytes(), 8);
        assert!(!txn.is_read_only());
    }

    #[test]
    fn write_past_end_rejected() {
        let (mut txn, _, _) = transaction();
        let handle = txn.stage(fresh(0, 4));
        assert!(txn.write(handle, 2, b"abc").is_err());
        assert!(txn.write(handle, u32::MAX, b"a").is_err());
    }

    #[test]
    fn unstaged_handle_is_invalid() {
        let (mut txn, _, _) = transaction();
        let handle = txn.stage(fresh(0, 4));
        txn.unstage(Laddr::new(0));
        assert!(txn.data(handle).is_err());
        assert_eq!(txn.pending_bytes(), 0);
        assert!(txn.handle_for(Laddr::new(0)).is_none());
    }

    #[test]
    fn live_extents_in_range() {
        let (mut txn, _, _) = transaction();
        txn.stage(fresh(0, 16));
        txn.stage(fresh(32, 16));
        txn.stage(fresh(64, 16));
        let hits: Vec<u64> = txn
            .live_extents_in(10, 40)
            .iter()
            .map(|e| e.laddr.as_u64())
            .collect();
        assert_eq!(hits, vec![0, 32]);
        assert_eq!(txn.fresh_ranges().len(), 3);
        assert_eq!(txn.estimated_record_len(), 44 + 3 * (21 + 16));
    }
}
