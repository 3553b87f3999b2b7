//! Transaction manager.

use crate::cache::Cache;
use crate::cleaner::{CleanOutcome, ExtentCallback, RelocationResult, SegmentCleaner};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::extent::LogicalExtent;
use crate::journal::{
    self, Delta, Journal, JournalState, Record, SegmentHeader, ALLOC_DELTA_SIZE,
    CHECKPOINT_ENTRY_SIZE, RECORD_HEADER_SIZE, RELOCATE_DELTA_SIZE, REMAP_DELTA_SIZE,
    SEGMENT_HEADER_SIZE,
};
use crate::lba::{LbaEntry, LbaManager};
use crate::stats::{StatsSnapshot, StoreStats};
use crate::superblock::{self, CheckpointPosition, Superblock};
use crate::transaction::state::{
    ActiveTransactions, PendingExtent, PendingKind, Transaction, TransactionSource,
};
use crate::types::{ExtentHandle, Generation, Laddr, Paddr, SegmentId, TransactionId};
use bytes::Bytes;
use extentdb_device::SegmentManager;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Top-level orchestrator of the extent store.
///
/// The transaction manager composes the journal, the LBA mapping, the
/// cache and the segment cleaner:
/// - Transactions read a fixed snapshot and stage changes privately
/// - Commits are serialized by a commit lock, which defines the total
///   order of visible states
/// - A commit is one journal record; once appended it is published to the
///   LBA and cache atomically with respect to other commits
/// - Cleaning relocates extents through ordinary cleaner transactions
///
/// ## Lifecycle
///
/// ```ignore
/// let tm = TransactionManager::new(device, Config::default());
/// tm.mkfs()?;
/// tm.mount()?;
///
/// let mut tx = tm.create_transaction()?;
/// let extent = tm.alloc_extent(&mut tx, Laddr::new(0), 4096)?;
/// tx.write(extent.handle.unwrap(), 0, b"hello")?;
/// tm.submit_transaction(tx)?;
///
/// tm.close()?;
/// ```
///
/// ## Lock Order
///
/// `commit_lock`, then the journal, then the cleaner's usage table. The
/// cleaner's pass lock is never taken while `commit_lock` is held.
pub struct TransactionManager {
    device: Arc<dyn SegmentManager>,
    config: Config,
    journal: Journal,
    lba: LbaManager,
    cache: Arc<Cache>,
    cleaner: SegmentCleaner,
    active: Arc<ActiveTransactions>,
    /// Serializes commits, checkpoints and lifecycle changes.
    commit_lock: Mutex<()>,
    /// Held shared while extent content is resolved and loaded, exclusive
    /// while a segment is released.
    release_lock: RwLock<()>,
    /// Latest published commit generation.
    generation: AtomicU64,
    next_txid: AtomicU64,
    superblock: Mutex<Option<Superblock>>,
    stats: Arc<StoreStats>,
}

impl TransactionManager {
    /// Creates a transaction manager over `device`.
    ///
    /// No I/O happens until [`mkfs`](Self::mkfs) or [`mount`](Self::mount).
    pub fn new(device: Arc<dyn SegmentManager>, config: Config) -> Self {
        let stats = Arc::new(StoreStats::new());
        let geometry = device.config();
        Self {
            journal: Journal::new(device.clone(), config.sync_on_commit),
            lba: LbaManager::new(config.lba_leaf_capacity, config.lba_internal_capacity),
            cache: Arc::new(Cache::new(
                device.clone(),
                config.cache_capacity_bytes,
                stats.clone(),
            )),
            cleaner: SegmentCleaner::new(geometry.num_segments, geometry.segment_size),
            active: Arc::new(ActiveTransactions::default()),
            commit_lock: Mutex::new(()),
            release_lock: RwLock::new(()),
            generation: AtomicU64::new(0),
            next_txid: AtomicU64::new(1),
            superblock: Mutex::new(None),
            device,
            config,
            stats,
        }
    }

    // === Lifecycle ===

    /// Creates an empty store on the device.
    ///
    /// Writes a fresh journal holding an empty checkpoint and a superblock
    /// pointing at it. The store must be mounted before use.
    ///
    /// # Errors
    ///
    /// Returns `Initialization` if the device cannot be initialized or
    /// written, and `InvalidOperation` if the store is mounted.
    pub fn mkfs(&self) -> CoreResult<()> {
        let _commit = self.commit_lock.lock();
        self.ensure_unmounted("mkfs")?;

        let init_error =
            |err: CoreError| CoreError::initialization(format!("cannot create store: {err}"));

        self.device.init().map_err(|err| init_error(err.into()))?;
        superblock::check_geometry(self.device.as_ref()).map_err(init_error)?;

        self.reset_state();
        for id in 0..self.device.num_segments() {
            self.device
                .release_segment(SegmentId::new(id))
                .map_err(|err| init_error(err.into()))?;
        }

        let created = self
            .journal
            .format(&self.cleaner)
            .and_then(|_| self.write_checkpoint(Generation::new(0)))
            .map_err(init_error);
        let position = match created {
            Ok(position) => position,
            Err(err) => {
                self.journal.set_state(JournalState::Empty);
                return Err(err);
            }
        };

        self.cache.mark_clean();
        self.journal.set_state(JournalState::Initialized);
        info!(
            segments = self.device.num_segments(),
            segment_size = self.device.segment_size(),
            checkpoint = %position.cursor,
            "created store"
        );
        Ok(())
    }

    /// Mounts the store: replays the journal from the last checkpoint and
    /// opens it for transactions.
    ///
    /// # Errors
    ///
    /// - `InvalidFormat` if the device holds no valid superblock
    /// - `Corruption` if replay finds an inconsistency before the tail, or
    ///   the tail disagrees with a cursor restored through
    ///   [`SegmentCleaner::set_next`]
    /// - `InvalidOperation` if the store is already mounted or
    ///   transactions are outstanding
    pub fn mount(&self) -> CoreResult<()> {
        let _commit = self.commit_lock.lock();
        self.ensure_unmounted("mount")?;

        self.device.init()?;
        superblock::check_geometry(self.device.as_ref())?;
        let sb = superblock::read_superblock(self.device.as_ref())?;

        self.journal.set_state(JournalState::Replaying);
        match self.replay_locked(sb) {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(error = %err, "mount failed");
                self.reset_state();
                self.journal.set_state(JournalState::Faulted);
                Err(err)
            }
        }
    }

    /// Closes the store: writes a checkpoint and drops cached content.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if transactions are outstanding or the
    /// store is not open.
    pub fn close(&self) -> CoreResult<()> {
        let _commit = self.commit_lock.lock();
        let outstanding = self.active.len();
        if outstanding > 0 {
            return Err(CoreError::invalid_operation(format!(
                "cannot close with {outstanding} outstanding transactions"
            )));
        }
        self.ensure_open()?;

        self.checkpoint_locked()?;
        self.journal.set_state(JournalState::Closed);
        self.cache.clear();
        info!(generation = %self.generation(), "closed store");
        Ok(())
    }

    fn ensure_unmounted(&self, operation: &str) -> CoreResult<()> {
        match self.journal.state() {
            JournalState::Open | JournalState::Replaying => {
                return Err(CoreError::invalid_operation(format!(
                    "{operation} on a mounted store"
                )));
            }
            JournalState::Empty
            | JournalState::Initialized
            | JournalState::Closed
            | JournalState::Faulted => {}
        }
        let outstanding = self.active.len();
        if outstanding > 0 {
            return Err(CoreError::invalid_operation(format!(
                "{operation} with {outstanding} outstanding transactions"
            )));
        }
        Ok(())
    }

    fn ensure_open(&self) -> CoreResult<()> {
        match self.journal.state() {
            JournalState::Open => Ok(()),
            JournalState::Faulted => Err(CoreError::Faulted),
            state => Err(CoreError::invalid_operation(format!(
                "store is {state:?}, not open"
            ))),
        }
    }

    fn reset_state(&self) {
        self.lba.clear();
        self.cache.clear();
        self.cleaner.reset();
        self.generation.store(0, Ordering::Release);
        *self.superblock.lock() = None;
    }

    fn replay_locked(&self, sb: Superblock) -> CoreResult<()> {
        self.cache.clear();
        let outcome = journal::replay(
            self.device.as_ref(),
            sb.checkpoint.cursor,
            sb.checkpoint.generation,
            &self.lba,
        )?;

        if let Some(restored) = self.cleaner.take_restored() {
            if restored != outcome.tail {
                return Err(CoreError::corruption(format!(
                    "restored journal cursor {restored} disagrees with replayed tail {}",
                    outcome.tail
                )));
            }
        }

        let live = self.lba.segment_usage();
        let chain: HashSet<SegmentId> = outcome.chain.iter().map(|link| link.segment).collect();
        let mut older = HashMap::new();
        for segment in live.keys().filter(|segment| !chain.contains(segment)) {
            let raw = self
                .device
                .read(*segment, 0, SEGMENT_HEADER_SIZE as usize)?;
            let segment_seq = SegmentHeader::decode(&raw).map_or(0, |h| h.segment_seq);
            older.insert(*segment, segment_seq);
        }
        self.cleaner
            .rebuild(&outcome.chain, &live, &older, outcome.tail);

        // content written after the checkpoint is dirty again
        let start = sb.checkpoint.cursor;
        for entry in self.lba.snapshot() {
            let after_checkpoint = chain.contains(&entry.paddr.segment)
                && (entry.paddr.segment != start.segment || entry.paddr.offset >= start.offset);
            if after_checkpoint {
                self.cache.mark_dirty(entry.paddr, entry.len);
            }
        }

        self.generation
            .store(outcome.generation.as_u64(), Ordering::Release);
        *self.superblock.lock() = Some(sb);
        self.journal.open_at(outcome.tail);
        info!(
            tail = %outcome.tail,
            generation = %outcome.generation,
            extents = self.lba.len(),
            dirty = self.cache.dirty_count(),
            "mounted store"
        );

        if self.cache.dirty_count() > self.config.checkpoint_dirty_limit {
            self.checkpoint_locked()?;
        }
        Ok(())
    }

    // === Transactions ===

    /// Creates a transaction observing the current commit generation.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is not open.
    pub fn create_transaction(&self) -> CoreResult<Transaction> {
        self.ensure_open()?;
        Ok(self.begin(TransactionSource::Client))
    }

    fn begin(&self, source: TransactionSource) -> Transaction {
        let id = TransactionId::new(self.next_txid.fetch_add(1, Ordering::Relaxed));
        Transaction::begin(
            id,
            &self.generation,
            source,
            self.cache.clone(),
            self.active.clone(),
            self.stats.clone(),
        )
    }

    /// Discards a transaction and releases its extent claims.
    pub fn abort(&self, mut tx: Transaction) {
        tx.mark_aborted();
        debug!(txid = %tx.id(), "aborted transaction");
    }

    /// Allocates a zero-filled extent of `len` bytes at the first free
    /// logical range at or after `hint`, as seen by the transaction.
    ///
    /// # Errors
    ///
    /// - `OutOfSpace` if no free range exists or the transaction's pending
    ///   data would not fit a journal record
    /// - `InvalidOperation` for a zero length or an inactive transaction
    pub fn alloc_extent(
        &self,
        tx: &mut Transaction,
        hint: Laddr,
        len: u32,
    ) -> CoreResult<LogicalExtent> {
        tx.ensure_active()?;
        self.ensure_open()?;
        if len == 0 {
            return Err(CoreError::invalid_operation("zero-length extent"));
        }
        self.check_room(tx, ALLOC_DELTA_SIZE, len as usize)?;

        let laddr = self
            .lba
            .find_free(hint, len, tx.snapshot(), &tx.removed, &tx.fresh_ranges())
            .ok_or_else(|| {
                CoreError::out_of_space(format!(
                    "no free logical range of {len} bytes at or after {hint}"
                ))
            })?;

        let handle = tx.stage(PendingExtent {
            laddr,
            len,
            kind: PendingKind::Fresh,
            data: vec![0; len as usize],
            refcount: 1,
            live: true,
        });
        debug!(txid = %tx.id(), %laddr, len, "allocated extent");
        Ok(Self::pending_view(tx, handle))
    }

    /// Returns a transaction-private copy of `extent` that can be written
    /// through the returned handle.
    ///
    /// The committed extent stays visible to other transactions until this
    /// one commits, at which point the clone replaces it.
    ///
    /// # Errors
    ///
    /// - `Conflict` if another transaction holds the extent or it changed
    ///   since `extent` was read
    /// - `NotFound` if nothing is mapped at the extent's address
    pub fn get_mutable_extent(
        &self,
        tx: &mut Transaction,
        extent: &LogicalExtent,
    ) -> CoreResult<LogicalExtent> {
        tx.ensure_active()?;
        self.ensure_open()?;
        if let Some(handle) = tx.handle_for(extent.laddr) {
            return Ok(Self::pending_view(tx, handle));
        }
        if tx.removed.contains(&extent.laddr) {
            return Err(CoreError::not_found(extent.laddr));
        }

        let (entry, data) = {
            let _release = self.release_lock.read();
            let entry = self
                .lookup_committed(tx, extent.laddr)?
                .ok_or_else(|| CoreError::not_found(extent.laddr))?;
            if entry.generation != extent.generation {
                return Err(self.conflict(format!(
                    "{} is at {}, caller holds {}",
                    entry.laddr, entry.generation, extent.generation
                )));
            }
            (entry, self.cache.get_or_load(entry.paddr, entry.len)?)
        };

        self.check_room(tx, REMAP_DELTA_SIZE, data.len())?;
        self.claim(tx, entry.laddr)?;
        tx.record_read(&entry);
        let handle = tx.stage(PendingExtent {
            laddr: entry.laddr,
            len: entry.len,
            kind: PendingKind::Mutated { original: entry },
            data: data.to_vec(),
            refcount: entry.refcount,
            live: true,
        });
        debug!(txid = %tx.id(), laddr = %entry.laddr, "cloned extent for mutation");
        Ok(Self::pending_view(tx, handle))
    }

    /// Returns every extent intersecting `[laddr, laddr + len)` as of the
    /// transaction's snapshot, with the transaction's own pending versions
    /// in place of committed ones.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if a committed extent in the range changed after
    /// the snapshot, or a device error if content cannot be loaded.
    pub fn read_extents(
        &self,
        tx: &mut Transaction,
        laddr: Laddr,
        len: u32,
    ) -> CoreResult<Vec<LogicalExtent>> {
        tx.ensure_active()?;
        self.ensure_open()?;
        let start = laddr.as_u64();
        let end = start.saturating_add(u64::from(len));

        let mut extents = Vec::new();
        {
            let _release = self.release_lock.read();
            let committed = self
                .lba
                .lookup_at(laddr, len, tx.snapshot())
                .map_err(|err| self.count_conflict(err))?;
            for entry in committed {
                if tx.removed.contains(&entry.laddr) || tx.by_laddr.contains_key(&entry.laddr) {
                    continue;
                }
                let data = self.cache.get_or_load(entry.paddr, entry.len)?;
                tx.record_read(&entry);
                let delta = tx.ref_deltas.get(&entry.laddr).copied().unwrap_or(0);
                extents.push(LogicalExtent {
                    laddr: entry.laddr,
                    len: entry.len,
                    refcount: Self::apply_delta(entry.refcount, delta),
                    generation: entry.generation,
                    paddr: Some(entry.paddr),
                    handle: None,
                    data,
                });
            }
        }

        let pending: Vec<usize> = tx
            .live_extents_in(start, end)
            .iter()
            .filter_map(|extent| tx.by_laddr.get(&extent.laddr).copied())
            .collect();
        extents.extend(
            pending
                .into_iter()
                .map(|index| Self::pending_view(tx, ExtentHandle(index))),
        );
        extents.sort_by_key(|extent| extent.laddr);
        Ok(extents)
    }

    /// Increments the refcount of the extent at `laddr` and returns the
    /// new count.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if nothing is mapped at `laddr`, or `Conflict`
    /// if another transaction holds the extent.
    pub fn inc_ref(&self, tx: &mut Transaction, laddr: Laddr) -> CoreResult<u32> {
        self.adjust_ref(tx, laddr, 1)
    }

    /// Decrements the refcount of the extent at `laddr` and returns the
    /// new count.
    ///
    /// Reaching zero stages the removal of the mapping; it takes effect
    /// when the transaction commits.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if nothing is mapped at `laddr`, or `Conflict`
    /// if another transaction holds the extent.
    pub fn dec_ref(&self, tx: &mut Transaction, laddr: Laddr) -> CoreResult<u32> {
        self.adjust_ref(tx, laddr, -1)
    }

    fn adjust_ref(&self, tx: &mut Transaction, laddr: Laddr, delta: i64) -> CoreResult<u32> {
        tx.ensure_active()?;
        self.ensure_open()?;

        if let Some(&index) = tx.by_laddr.get(&laddr) {
            let extent = &mut tx.pending[index];
            if extent.kind == PendingKind::Fresh {
                let count = Self::apply_delta(extent.refcount, delta);
                extent.refcount = count;
                if count == 0 {
                    tx.unstage(laddr);
                }
                return Ok(count);
            }
        }
        if tx.removed.contains(&laddr) {
            return Err(CoreError::not_found(laddr));
        }

        let entry = self
            .lookup_committed(tx, laddr)?
            .ok_or_else(|| CoreError::not_found(laddr))?;
        self.claim(tx, laddr)?;
        tx.record_read(&entry);

        let pending = tx.ref_deltas.entry(laddr).or_insert(0);
        *pending += delta;
        let count = Self::apply_delta(entry.refcount, *pending);
        if count == 0 {
            tx.removed.insert(laddr);
            tx.unstage(laddr);
            debug!(txid = %tx.id(), %laddr, "staged removal");
        }
        Ok(count)
    }

    /// Commits a transaction.
    ///
    /// Validates every committed extent the transaction touched against
    /// the current mapping, appends one journal record and publishes the
    /// changes. Returns the generation of the commit; a transaction that
    /// changed nothing writes no record and returns its snapshot.
    ///
    /// # Errors
    ///
    /// - `Conflict` if a touched extent changed after the transaction read
    ///   it, or a range it allocated was taken meanwhile
    /// - `OutOfSpace` if the journal cannot take the record
    /// - `Device` if the journal append fails; the store is then faulted
    pub fn submit_transaction(&self, mut tx: Transaction) -> CoreResult<Generation> {
        tx.ensure_active()?;
        if tx.is_read_only() {
            tx.mark_committed();
            self.stats.record_transaction_commit();
            return Ok(tx.snapshot());
        }

        let source = tx.source();
        let committed = {
            let _commit = self.commit_lock.lock();
            self.commit_locked(&tx)
        };
        let generation = committed.map_err(|err| self.count_conflict(err))?;

        tx.mark_committed();
        self.stats.record_transaction_commit();
        drop(tx);

        if source == TransactionSource::Client {
            self.run_maintenance();
        }
        Ok(generation)
    }

    fn commit_locked(&self, tx: &Transaction) -> CoreResult<Generation> {
        self.ensure_open()?;
        self.validate(tx)?;

        let generation = Generation::new(self.generation.load(Ordering::Acquire)).next();
        let (deltas, blocks) = Self::build_deltas(tx)?;
        let block_len = u32::try_from(blocks.len())
            .map_err(|_| CoreError::out_of_space("transaction content exceeds a record"))?;
        let record = Record::Commit {
            generation,
            deltas: deltas.clone(),
            blocks: blocks.clone(),
        };

        let appended = self.journal.append(&record, &self.cleaner)?;
        self.stats.record_journal_write(u64::from(appended.len));

        let applied =
            match self
                .lba
                .apply_commit(&deltas, appended.block_base, block_len, generation)
            {
                Ok(applied) => applied,
                Err(err) => {
                    error!(txid = %tx.id(), error = %err, "journaled commit failed to apply");
                    self.journal.set_state(JournalState::Faulted);
                    return Err(err);
                }
            };

        let mut written = Vec::with_capacity(applied.written.len());
        let mut written_usage = Vec::with_capacity(applied.written.len());
        for entry in &applied.written {
            let offset = (entry.paddr.offset - appended.block_base.offset) as usize;
            written.push((entry.paddr, blocks.slice(offset..offset + entry.len as usize)));
            written_usage.push((entry.paddr, entry.len));
        }
        let superseded: Vec<Paddr> = applied.superseded.iter().map(|(paddr, _)| *paddr).collect();
        self.cache.commit(&written, &superseded);
        self.cleaner.apply_usage(&written_usage, &applied.superseded);

        self.generation
            .store(generation.as_u64(), Ordering::Release);
        let oldest = self.active.oldest_snapshot().unwrap_or(generation);
        self.lba.prune_retired(oldest);

        debug!(
            txid = %tx.id(),
            %generation,
            deltas = deltas.len(),
            bytes = blocks.len(),
            at = %appended.location,
            "committed transaction"
        );
        Ok(generation)
    }

    fn validate(&self, tx: &Transaction) -> CoreResult<()> {
        for (&laddr, &seen) in &tx.read_set {
            match self.lba.get(laddr) {
                Some(entry) if entry.generation == seen => {}
                Some(entry) => {
                    return Err(CoreError::conflict(format!(
                        "{laddr} changed at {} after {} read it at {seen}",
                        entry.generation,
                        tx.id()
                    )));
                }
                None => {
                    return Err(CoreError::conflict(format!(
                        "{laddr} was removed after {} read it",
                        tx.id()
                    )));
                }
            }
        }

        for extent in tx.live_extents() {
            if extent.kind != PendingKind::Fresh {
                continue;
            }
            let taken = self
                .lba
                .lookup(extent.laddr, extent.len)
                .into_iter()
                .find(|entry| !tx.removed.contains(&entry.laddr));
            if let Some(entry) = taken {
                return Err(CoreError::conflict(format!(
                    "{} allocated by {} overlaps {} committed meanwhile",
                    extent.laddr,
                    tx.id(),
                    entry.laddr
                )));
            }
        }
        Ok(())
    }

    /// Builds the deltas of a commit: moves and remaps first, then
    /// refcount changes, then allocations, so ranges freed by the commit
    /// can be reused by it.
    fn build_deltas(tx: &Transaction) -> CoreResult<(Vec<Delta>, Bytes)> {
        let mut deltas = Vec::new();
        let mut blocks = Vec::with_capacity(tx.pending_bytes());
        let offset_of = |blocks: &Vec<u8>| {
            u32::try_from(blocks.len())
                .map_err(|_| CoreError::out_of_space("transaction content exceeds a record"))
        };

        for extent in tx.live_extents() {
            let delta = match extent.kind {
                PendingKind::Fresh => continue,
                PendingKind::Mutated { .. } => Delta::Remap {
                    laddr: extent.laddr,
                    block_offset: offset_of(&blocks)?,
                },
                PendingKind::Relocated { original } => Delta::Relocate {
                    laddr: extent.laddr,
                    expected: original.paddr,
                    block_offset: offset_of(&blocks)?,
                },
            };
            deltas.push(delta);
            blocks.extend_from_slice(&extent.data);
        }

        for (&laddr, &delta) in tx.ref_deltas.iter().filter(|(_, delta)| **delta != 0) {
            let delta = i32::try_from(delta).map_err(|_| {
                CoreError::invalid_operation(format!("refcount change on {laddr} out of range"))
            })?;
            deltas.push(Delta::AdjustRef { laddr, delta });
        }

        for extent in tx.live_extents().filter(|e| e.kind == PendingKind::Fresh) {
            deltas.push(Delta::Alloc {
                laddr: extent.laddr,
                len: extent.len,
                refcount: extent.refcount,
                block_offset: offset_of(&blocks)?,
            });
            blocks.extend_from_slice(&extent.data);
        }

        Ok((deltas, Bytes::from(blocks)))
    }

    // === Maintenance ===

    /// Writes a checkpoint of the whole mapping and points the superblock
    /// at it.
    ///
    /// Future mounts replay from here, and every segment before the
    /// checkpoint's segment becomes eligible for cleaning.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is not open or the journal or
    /// superblock cannot be written.
    pub fn checkpoint(&self) -> CoreResult<CheckpointPosition> {
        let _commit = self.commit_lock.lock();
        self.ensure_open()?;
        self.checkpoint_locked()
    }

    fn checkpoint_locked(&self) -> CoreResult<CheckpointPosition> {
        let position = self.write_checkpoint(self.generation())?;
        self.cache.mark_clean();
        self.stats.record_checkpoint();
        info!(
            checkpoint = %position.cursor,
            generation = %position.generation,
            extents = self.lba.len(),
            "wrote checkpoint"
        );
        Ok(position)
    }

    /// Appends the mapping as checkpoint records, syncs and updates the
    /// superblock.
    fn write_checkpoint(&self, generation: Generation) -> CoreResult<CheckpointPosition> {
        let entries = self.lba.snapshot();
        let room = self.journal.max_record_size().saturating_sub(RECORD_HEADER_SIZE) as usize;
        let per_record = (room / CHECKPOINT_ENTRY_SIZE).max(1);

        let mut chunks: Vec<&[LbaEntry]> = entries.chunks(per_record).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        let last = chunks.len() - 1;

        let mut start = None;
        for (index, chunk) in chunks.into_iter().enumerate() {
            let record = Record::Checkpoint {
                generation,
                first: index == 0,
                last: index == last,
                entries: chunk.to_vec(),
            };
            let appended = self.journal.append(&record, &self.cleaner)?;
            self.stats.record_journal_write(u64::from(appended.len));
            if start.is_none() {
                start = Some(journal::JournalCursor {
                    segment: appended.location.segment,
                    offset: appended.location.offset,
                    segment_seq: appended.segment_seq,
                    record_seq: appended.record_seq,
                });
            }
        }
        let cursor = start.ok_or_else(|| CoreError::invalid_operation("empty checkpoint"))?;
        self.journal.sync()?;

        let position = CheckpointPosition { cursor, generation };
        let mut current = self.superblock.lock();
        let sb = Superblock {
            epoch: current.map_or(1, |sb| sb.epoch + 1),
            segment_size: self.device.segment_size(),
            num_segments: self.device.num_segments(),
            checkpoint: position,
        };
        superblock::write_superblock(self.device.as_ref(), &sb)?;
        *current = Some(sb);
        self.cleaner.set_checkpoint_seq(cursor.segment_seq);
        Ok(position)
    }

    /// Runs one cleaner pass.
    ///
    /// If nothing is eligible but closed segments exist, they are waiting
    /// on a newer checkpoint: one is written and the pass retried.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is not open or relocation fails.
    pub fn clean_once(&self) -> CoreResult<CleanOutcome> {
        self.ensure_open()?;
        let mut outcome = self.cleaner.run_pass(self)?;
        self.stats.record_cleaner_pass();
        if outcome == CleanOutcome::Idle && self.cleaner.closed_segments() > 0 {
            self.checkpoint()?;
            outcome = self.cleaner.run_pass(self)?;
            self.stats.record_cleaner_pass();
        }
        Ok(outcome)
    }

    fn run_maintenance(&self) {
        if self.cache.dirty_count() > self.config.checkpoint_dirty_limit {
            if let Err(err) = self.checkpoint() {
                warn!(error = %err, "checkpoint after commit failed");
                return;
            }
        }

        let mut passes = 0;
        while passes < self.config.cleaner_max_passes
            && self.cleaner.free_segments() < self.config.cleaner_reserve_segments
        {
            passes += 1;
            match self.clean_once() {
                Ok(CleanOutcome::Cleaned { .. }) => {}
                Ok(outcome) => {
                    debug!(?outcome, "cleaning stopped");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "cleaning after commit failed");
                    break;
                }
            }
        }
    }

    // === Accessors ===

    /// Returns the latest published commit generation.
    #[must_use]
    pub fn generation(&self) -> Generation {
        Generation::new(self.generation.load(Ordering::Acquire))
    }

    /// Returns the journal state.
    #[must_use]
    pub fn journal_state(&self) -> JournalState {
        self.journal.state()
    }

    /// Returns the number of outstanding transactions.
    #[must_use]
    pub fn active_transactions(&self) -> usize {
        self.active.len()
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the LBA mapping.
    #[must_use]
    pub fn lba(&self) -> &LbaManager {
        &self.lba
    }

    /// Returns the extent cache.
    #[must_use]
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Returns the segment cleaner.
    #[must_use]
    pub fn segment_cleaner(&self) -> &SegmentCleaner {
        &self.cleaner
    }

    /// Returns a snapshot of the store statistics.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    // === Helpers ===

    fn lookup_committed(&self, tx: &Transaction, laddr: Laddr) -> CoreResult<Option<LbaEntry>> {
        self.lba
            .get_at(laddr, tx.snapshot())
            .map_err(|err| self.count_conflict(err))
    }

    fn claim(&self, tx: &Transaction, laddr: Laddr) -> CoreResult<()> {
        self.cache
            .add_to_transaction(tx.id(), laddr)
            .map_err(|err| self.count_conflict(err))
    }

    fn conflict(&self, message: String) -> CoreError {
        self.count_conflict(CoreError::conflict(message))
    }

    fn count_conflict(&self, err: CoreError) -> CoreError {
        if err.is_retryable() {
            self.stats.record_conflict();
            debug!(error = %err, "conflict");
        }
        err
    }

    fn check_room(&self, tx: &Transaction, delta_len: usize, bytes: usize) -> CoreResult<()> {
        let pending = tx.pending_bytes() + bytes;
        if pending > self.config.max_transaction_bytes {
            return Err(CoreError::out_of_space(format!(
                "transaction would stage {pending} bytes, limit is {}",
                self.config.max_transaction_bytes
            )));
        }
        let record = tx.estimated_record_len() + delta_len + bytes;
        let max = self.journal.max_record_size() as usize;
        if record > max {
            return Err(CoreError::out_of_space(format!(
                "transaction record of {record} bytes exceeds segment capacity of {max}"
            )));
        }
        Ok(())
    }

    /// Commits a cleaner transaction, first dropping every extent a client
    /// claimed away from it. Dropped extents move from relocated to yielded.
    fn submit_relocation(
        &self,
        mut tx: Transaction,
        result: &mut RelocationResult,
    ) -> CoreResult<()> {
        let committed = {
            let _commit = self.commit_lock.lock();
            for laddr in self.cache.take_preempted(tx.id()) {
                let Some(handle) = tx.handle_for(laddr) else {
                    continue;
                };
                let len = tx.live_extent(handle).map_or(0, |extent| extent.len);
                tx.unstage(laddr);
                result.relocated = result.relocated.saturating_sub(1);
                result.bytes = result.bytes.saturating_sub(u64::from(len));
                result.yielded += 1;
                debug!(txid = %tx.id(), %laddr, "yielded extent to client");
            }
            if tx.is_read_only() {
                None
            } else {
                Some(self.commit_locked(&tx))
            }
        };
        if let Some(committed) = committed {
            committed.map_err(|err| self.count_conflict(err))?;
        }
        tx.mark_committed();
        self.stats.record_transaction_commit();
        Ok(())
    }

    fn apply_delta(refcount: u32, delta: i64) -> u32 {
        u32::try_from((i64::from(refcount) + delta).max(0)).unwrap_or(u32::MAX)
    }

    fn pending_view(tx: &Transaction, handle: ExtentHandle) -> LogicalExtent {
        let extent = &tx.pending[handle.index()];
        let (refcount, generation) = match extent.kind {
            PendingKind::Fresh => (extent.refcount, tx.snapshot()),
            PendingKind::Mutated { original } | PendingKind::Relocated { original } => {
                let delta = tx.ref_deltas.get(&extent.laddr).copied().unwrap_or(0);
                (Self::apply_delta(original.refcount, delta), original.generation)
            }
        };
        LogicalExtent {
            laddr: extent.laddr,
            len: extent.len,
            refcount,
            generation,
            paddr: None,
            handle: Some(handle),
            data: Bytes::copy_from_slice(&extent.data),
        }
    }
}

impl ExtentCallback for TransactionManager {
    fn live_extents(&self, segment: SegmentId) -> Vec<LbaEntry> {
        self.lba.entries_in_segment(segment)
    }

    fn relocate_extents(&self, extents: &[LbaEntry]) -> CoreResult<RelocationResult> {
        let mut result = RelocationResult::default();
        let mut tx = self.begin(TransactionSource::Cleaner);

        for extent in extents {
            if !tx.is_read_only()
                && self
                    .check_room(&tx, RELOCATE_DELTA_SIZE, extent.len as usize)
                    .is_err()
            {
                self.submit_relocation(tx, &mut result)?;
                tx = self.begin(TransactionSource::Cleaner);
            }

            let _release = self.release_lock.read();
            let Some(current) = self.lba.get(extent.laddr) else {
                continue;
            };
            // moved or rewritten since the victim was scanned
            if current.paddr != extent.paddr {
                continue;
            }
            if self
                .cache
                .add_to_background_transaction(tx.id(), current.laddr)
                .is_err()
            {
                result.yielded += 1;
                continue;
            }

            let data = self.cache.get_or_load(current.paddr, current.len)?;
            tx.stage(PendingExtent {
                laddr: current.laddr,
                len: current.len,
                kind: PendingKind::Relocated { original: current },
                data: data.to_vec(),
                refcount: current.refcount,
                live: true,
            });
            result.relocated += 1;
            result.bytes += u64::from(current.len);
        }

        self.submit_relocation(tx, &mut result)?;
        self.stats
            .record_relocation(result.relocated as u64, result.bytes);
        debug!(
            relocated = result.relocated,
            yielded = result.yielded,
            "relocated extents"
        );
        Ok(result)
    }

    fn release_segment(&self, segment: SegmentId) -> CoreResult<()> {
        self.journal.sync()?;
        let _release = self.release_lock.write();
        if !self.lba.entries_in_segment(segment).is_empty() {
            return Err(CoreError::invalid_operation(format!(
                "{segment} still holds live extents"
            )));
        }
        self.device.release_segment(segment)?;
        self.cache.invalidate_segment(segment);
        self.cleaner.mark_released(segment);
        self.stats.record_segment_released();
        Ok(())
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("state", &self.journal.state())
            .field("generation", &self.generation())
            .field("extents", &self.lba.len())
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}
