//! Journal: the durable append log of the store.
//!
//! Every committed transaction is one journal record. Records are appended
//! to the open segment; when it cannot hold the next record the journal
//! asks its [`SegmentProvider`] (the segment cleaner) for a fresh segment,
//! writes that segment's header and then a roll record pointing at it, so
//! replay can follow the log across segments.
//!
//! ## On-device Format
//!
//! ```text
//! segment: | magic "XSEG" (4) | version (2) | reserved (2) | segment_seq (8) | crc32 (4) | records... |
//! record:  | magic "XREC" (4) | version (2) | kind (1) | flags (1) | record_seq (8) |
//!          | segment_seq (8) | generation (8) | delta_len (4) | block_len (4) | crc32 (4) |
//!          | deltas (delta_len) | blocks (block_len) |
//! ```
//!
//! Extent content travels inline in the block area, so a record is
//! self-describing: the physical address of new content is the record's
//! own address plus a fixed offset.
//!
//! ## Recovery Policy
//!
//! Replay starts at the checkpoint named by the superblock and stops at
//! the first position that does not hold the expected next record:
//!
//! - **Tail** (clean end of log): truncated header or body, bad magic,
//!   CRC mismatch, a record sequence that is not the successor of the
//!   previous one, or a segment sequence that does not match the segment
//!   being read
//! - **Corruption** (mount fails): the checkpoint position does not hold a
//!   checkpoint, a roll points at a segment whose header does not match, or
//!   a record that passed its CRC cannot be applied
//!
//! ## Invariants
//!
//! - The journal is **append-only** within a segment
//! - A device failure during append **faults** the journal; only a
//!   remount clears the fault
//! - Every segment keeps room for a final roll record
//! - Replay is **idempotent**: replaying an unchanged journal twice yields
//!   the same mapping

mod record;
mod replay;
mod scan;

pub use record::{
    compute_crc32, crc32_update, Delta, Record, RecordHeader, RecordKind, SegmentHeader,
    ADJUST_REF_DELTA_SIZE, ALLOC_DELTA_SIZE, CHECKPOINT_ENTRY_SIZE, RECORD_HEADER_SIZE,
    RELOCATE_DELTA_SIZE, REMAP_DELTA_SIZE, ROLL_RECORD_SIZE, SEGMENT_HEADER_SIZE,
};
pub use replay::{replay, ReplayOutcome};
pub use scan::{ChainSegment, JournalScanner, ScannedRecord, TailReason};

use crate::error::{CoreError, CoreResult};
use crate::types::{JournalSeq, Paddr, SegmentId};
use extentdb_device::{DeviceError, SegmentManager};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

/// State of the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalState {
    /// No store has been created or mounted.
    Empty,
    /// mkfs has written a fresh store.
    Initialized,
    /// Mount is replaying the log.
    Replaying,
    /// Appends are accepted.
    Open,
    /// The store was closed cleanly.
    Closed,
    /// A device failure interrupted an append; remount required.
    Faulted,
}

/// Position where the next journal record will be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalCursor {
    /// Segment the journal is writing.
    pub segment: SegmentId,
    /// Offset of the next record in that segment.
    pub offset: u32,
    /// Sequence of that segment in the journal chain.
    pub segment_seq: u64,
    /// Sequence number the next record will carry.
    pub record_seq: JournalSeq,
}

impl JournalCursor {
    /// Returns the cursor as a physical address.
    #[must_use]
    pub fn paddr(&self) -> Paddr {
        Paddr::new(self.segment, self.offset)
    }
}

impl fmt::Display for JournalCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (segment seq {}, next {})",
            self.paddr(),
            self.segment_seq,
            self.record_seq
        )
    }
}

/// Source of fresh segments for the journal.
///
/// Implemented by the segment cleaner, which owns the segment usage table.
pub trait SegmentProvider: Send + Sync {
    /// Chooses an empty segment for the journal to continue in and marks
    /// it open under `segment_seq`.
    ///
    /// # Errors
    ///
    /// Returns `OutOfSpace` when no empty segment remains.
    fn open_segment(&self, segment_seq: u64) -> CoreResult<SegmentId>;

    /// The journal has left `segment` after writing `written` bytes to it.
    fn close_segment(&self, segment: SegmentId, written: u32);

    /// The journal tail moved to `cursor`.
    fn advance(&self, cursor: JournalCursor);
}

/// Where an appended record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendedRecord {
    /// Address of the record header.
    pub location: Paddr,
    /// Address of the record's block area.
    pub block_base: Paddr,
    /// Sequence number the record carries.
    pub record_seq: JournalSeq,
    /// Sequence of the segment the record landed in.
    pub segment_seq: u64,
    /// Encoded length of the record.
    pub len: u32,
}

struct JournalInner {
    state: JournalState,
    cursor: Option<JournalCursor>,
}

/// Writes journal records to the device.
pub struct Journal {
    device: Arc<dyn SegmentManager>,
    inner: Mutex<JournalInner>,
    sync_on_append: bool,
}

impl Journal {
    /// Creates a journal over `device` in the `Empty` state.
    pub fn new(device: Arc<dyn SegmentManager>, sync_on_append: bool) -> Self {
        Self {
            device,
            inner: Mutex::new(JournalInner {
                state: JournalState::Empty,
                cursor: None,
            }),
            sync_on_append,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> JournalState {
        self.inner.lock().state
    }

    /// Returns the position of the next append, if the journal has one.
    #[must_use]
    pub fn cursor(&self) -> Option<JournalCursor> {
        self.inner.lock().cursor
    }

    /// Returns the largest record a single segment can hold.
    #[must_use]
    pub fn max_record_size(&self) -> u32 {
        self.device
            .segment_size()
            .saturating_sub(SEGMENT_HEADER_SIZE + ROLL_RECORD_SIZE)
    }

    /// Starts a fresh log in a segment chosen by `provider`.
    ///
    /// Leaves the journal `Open` so the initial checkpoint can be appended;
    /// the caller moves it to `Initialized` once the superblock points at
    /// that checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if no segment is available or the device fails.
    pub fn format(&self, provider: &dyn SegmentProvider) -> CoreResult<JournalCursor> {
        let mut inner = self.inner.lock();
        if matches!(inner.state, JournalState::Open | JournalState::Replaying) {
            return Err(CoreError::invalid_operation(format!(
                "cannot format a journal that is {:?}",
                inner.state
            )));
        }

        let segment_seq = 1;
        let segment = provider.open_segment(segment_seq)?;
        self.device.allocate_segment(segment)?;
        self.device
            .write(segment, 0, &SegmentHeader { segment_seq }.encode())?;

        let cursor = JournalCursor {
            segment,
            offset: SEGMENT_HEADER_SIZE,
            segment_seq,
            record_seq: JournalSeq::new(1),
        };
        inner.cursor = Some(cursor);
        inner.state = JournalState::Open;
        provider.advance(cursor);
        debug!(%cursor, "formatted journal");
        Ok(cursor)
    }

    /// Moves the journal to `state`.
    pub(crate) fn set_state(&self, state: JournalState) {
        self.inner.lock().state = state;
    }

    /// Opens the journal for appends at `cursor`, the tail found by replay.
    pub(crate) fn open_at(&self, cursor: JournalCursor) {
        let mut inner = self.inner.lock();
        inner.cursor = Some(cursor);
        inner.state = JournalState::Open;
    }

    /// Appends a record, rolling to a fresh segment when needed.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation` if the journal is not open, `Faulted` if it is
    ///   faulted
    /// - `OutOfSpace` if the record can never fit a segment or no segment
    ///   is left to roll to; the journal stays open
    /// - `Device` if a write fails; the journal is faulted
    pub fn append(
        &self,
        record: &Record,
        provider: &dyn SegmentProvider,
    ) -> CoreResult<AppendedRecord> {
        let mut inner = self.inner.lock();
        let mut cursor = Self::writable_cursor(&inner)?;

        let encoded_len = record.encoded_len();
        let len = u32::try_from(encoded_len)
            .ok()
            .filter(|len| *len <= self.max_record_size())
            .ok_or_else(|| {
                CoreError::out_of_space(format!(
                    "record of {encoded_len} bytes exceeds segment capacity of {}",
                    self.max_record_size()
                ))
            })?;

        let segment_size = self.device.segment_size();
        if u64::from(cursor.offset) + u64::from(len) + u64::from(ROLL_RECORD_SIZE)
            > u64::from(segment_size)
        {
            cursor = self.roll(&mut inner, cursor, record, provider)?;
        }

        let buf = record.encode(cursor.record_seq, cursor.segment_seq)?;
        if let Err(err) = self.device.write(cursor.segment, cursor.offset, &buf) {
            return Err(Self::fault(&mut inner, err));
        }
        if self.sync_on_append {
            if let Err(err) = self.device.sync() {
                return Err(Self::fault(&mut inner, err));
            }
        }

        let location = cursor.paddr();
        // bounded by len, which fits a u32
        let block_offset = record.block_area_offset() as u32;
        let next = JournalCursor {
            offset: cursor.offset + len,
            record_seq: cursor.record_seq.next(),
            ..cursor
        };
        inner.cursor = Some(next);
        provider.advance(next);

        Ok(AppendedRecord {
            location,
            block_base: location.add(block_offset),
            record_seq: cursor.record_seq,
            segment_seq: cursor.segment_seq,
            len,
        })
    }

    /// Makes every appended record durable.
    ///
    /// # Errors
    ///
    /// Returns the device error and faults the journal if the sync fails.
    pub fn sync(&self) -> CoreResult<()> {
        if let Err(err) = self.device.sync() {
            let mut inner = self.inner.lock();
            return Err(Self::fault(&mut inner, err));
        }
        Ok(())
    }

    fn writable_cursor(inner: &JournalInner) -> CoreResult<JournalCursor> {
        match (inner.state, inner.cursor) {
            (JournalState::Open, Some(cursor)) => Ok(cursor),
            (JournalState::Faulted, _) => Err(CoreError::Faulted),
            (state, _) => Err(CoreError::invalid_operation(format!(
                "journal is {state:?}, appends need an open journal"
            ))),
        }
    }

    fn roll(
        &self,
        inner: &mut JournalInner,
        cursor: JournalCursor,
        record: &Record,
        provider: &dyn SegmentProvider,
    ) -> CoreResult<JournalCursor> {
        let next_seq = cursor.segment_seq + 1;
        let next = provider.open_segment(next_seq)?;

        let header = SegmentHeader {
            segment_seq: next_seq,
        };
        let prepared = self
            .device
            .allocate_segment(next)
            .and_then(|()| self.device.write(next, 0, &header.encode()));
        if let Err(err) = prepared {
            return Err(Self::fault(inner, err));
        }
        if self.sync_on_append {
            if let Err(err) = self.device.sync() {
                return Err(Self::fault(inner, err));
            }
        }

        let roll = Record::Roll {
            generation: record.generation(),
            next_segment: next,
            next_segment_seq: next_seq,
        }
        .encode(cursor.record_seq, cursor.segment_seq)?;
        if let Err(err) = self.device.write(cursor.segment, cursor.offset, &roll) {
            return Err(Self::fault(inner, err));
        }
        // records in the new segment must never be durable without the roll
        if self.sync_on_append {
            if let Err(err) = self.device.sync() {
                return Err(Self::fault(inner, err));
            }
        }
        provider.close_segment(cursor.segment, cursor.offset + ROLL_RECORD_SIZE);

        debug!(from = %cursor.segment, to = %next, segment_seq = next_seq, "rolled journal segment");
        Ok(JournalCursor {
            segment: next,
            offset: SEGMENT_HEADER_SIZE,
            segment_seq: next_seq,
            record_seq: cursor.record_seq.next(),
        })
    }

    fn fault(inner: &mut JournalInner, err: DeviceError) -> CoreError {
        error!(error = %err, "journal write failed, faulting journal");
        inner.state = JournalState::Faulted;
        CoreError::Device(err)
    }
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Journal")
            .field("state", &inner.state)
            .field("cursor", &inner.cursor)
            .field("sync_on_append", &self.sync_on_append)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Generation, Laddr};
    use bytes::Bytes;
    use extentdb_device::{DeviceConfig, EphemeralSegmentManager};

    /// Hands out segments in order and remembers what it was told.
    #[derive(Default)]
    struct TestProvider {
        next: Mutex<u32>,
        closed: Mutex<Vec<(SegmentId, u32)>>,
        tail: Mutex<Option<JournalCursor>>,
        limit: u32,
    }

    impl TestProvider {
        fn with_limit(limit: u32) -> Self {
            Self {
                next: Mutex::new(1),
                limit,
                ..Self::default()
            }
        }
    }

    impl SegmentProvider for TestProvider {
        fn open_segment(&self, _segment_seq: u64) -> CoreResult<SegmentId> {
            let mut next = self.next.lock();
            if *next >= self.limit {
                return Err(CoreError::out_of_space("test provider exhausted"));
            }
            *next += 1;
            Ok(SegmentId::new(*next - 1))
        }

        fn close_segment(&self, segment: SegmentId, written: u32) {
            self.closed.lock().push((segment, written));
        }

        fn advance(&self, cursor: JournalCursor) {
            *self.tail.lock() = Some(cursor);
        }
    }

    fn setup(segments: u32) -> (Arc<EphemeralSegmentManager>, Journal, TestProvider) {
        let device = Arc::new(EphemeralSegmentManager::initialized(
            DeviceConfig::new().segment_size(4096).num_segments(segments),
        ));
        let journal = Journal::new(device.clone(), false);
        (device, journal, TestProvider::with_limit(segments))
    }

    fn commit(generation: u64, content: &[u8]) -> Record {
        Record::Commit {
            generation: Generation::new(generation),
            deltas: vec![Delta::Alloc {
                laddr: Laddr::new(generation * 0x1000),
                len: content.len() as u32,
                refcount: 1,
                block_offset: 0,
            }],
            blocks: Bytes::copy_from_slice(content),
        }
    }

    #[test]
    fn append_requires_open_journal() {
        let (_, journal, provider) = setup(4);
        assert!(matches!(
            journal.append(&commit(1, b"a"), &provider),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn append_places_blocks_after_deltas() {
        let (device, journal, provider) = setup(4);
        let start = journal.format(&provider).unwrap();
        assert_eq!(start.offset, SEGMENT_HEADER_SIZE);

        let appended = journal.append(&commit(1, b"hello"), &provider).unwrap();
        assert_eq!(appended.location, Paddr::new(SegmentId::new(1), SEGMENT_HEADER_SIZE));
        assert_eq!(
            appended.block_base,
            appended.location.add(RECORD_HEADER_SIZE + 21)
        );
        let stored = device
            .read(appended.block_base.segment, appended.block_base.offset, 5)
            .unwrap();
        assert_eq!(stored, b"hello");

        let cursor = journal.cursor().unwrap();
        assert_eq!(cursor.record_seq, JournalSeq::new(2));
        assert_eq!(*provider.tail.lock(), Some(cursor));
    }

    #[test]
    fn full_segment_rolls() {
        let (device, journal, provider) = setup(4);
        journal.format(&provider).unwrap();

        let content = vec![7u8; 1500];
        let first = journal.append(&commit(1, &content), &provider).unwrap();
        let second = journal.append(&commit(2, &content), &provider).unwrap();
        let third = journal.append(&commit(3, &content), &provider).unwrap();

        assert_eq!(first.location.segment, SegmentId::new(1));
        assert_eq!(second.location.segment, SegmentId::new(1));
        assert_eq!(third.location.segment, SegmentId::new(2));
        assert_eq!(third.location.offset, SEGMENT_HEADER_SIZE);
        assert_eq!(third.record_seq, JournalSeq::new(4));

        let header = device.read(SegmentId::new(2), 0, SEGMENT_HEADER_SIZE as usize).unwrap();
        assert_eq!(SegmentHeader::decode(&header), Some(SegmentHeader { segment_seq: 2 }));
        assert_eq!(provider.closed.lock().len(), 1);
    }

    #[test]
    fn oversized_record_is_out_of_space() {
        let (_, journal, provider) = setup(4);
        journal.format(&provider).unwrap();
        let content = vec![0u8; 4096];
        assert!(matches!(
            journal.append(&commit(1, &content), &provider),
            Err(CoreError::OutOfSpace { .. })
        ));
        assert_eq!(journal.state(), JournalState::Open);
    }

    #[test]
    fn exhausted_provider_leaves_journal_open() {
        let (_, journal, provider) = setup(2);
        journal.format(&provider).unwrap();
        let content = vec![1u8; 1500];
        journal.append(&commit(1, &content), &provider).unwrap();
        journal.append(&commit(2, &content), &provider).unwrap();
        assert!(matches!(
            journal.append(&commit(3, &content), &provider),
            Err(CoreError::OutOfSpace { .. })
        ));
        assert_eq!(journal.state(), JournalState::Open);
    }
}
