//! Segment cleaner.
//!
//! Owns the segment usage table: hands fresh segments to the journal,
//! tracks live bytes per segment as commits land, and reclaims space by
//! relocating the live extents of a cold segment and then releasing it.
//!
//! Relocation goes through the ordinary transaction path via the
//! [`ExtentCallback`] the transaction manager implements, so cleaning is
//! subject to the same conflict rules as client work: extents claimed by a
//! client transaction are skipped and the victim is retried later.
//!
//! ## Invariants
//!
//! - A victim is released only after every live extent in it has been
//!   relocated by a durable commit
//! - Segments the journal still needs for replay (the checkpoint segment
//!   and everything after it) are never victims
//! - Passes are serialized

mod usage;

pub use usage::{SegmentInfo, SegmentState, UsageTable};

use crate::error::{CoreError, CoreResult};
use crate::journal::{ChainSegment, JournalCursor, SegmentProvider};
use crate::lba::LbaEntry;
use crate::types::{Paddr, SegmentId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

/// Result of relocating a batch of extents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelocationResult {
    /// Extents moved.
    pub relocated: usize,
    /// Bytes moved.
    pub bytes: u64,
    /// Extents left in place because a client transaction held them or
    /// took them over during relocation.
    pub yielded: usize,
}

/// Hooks the cleaner uses to move extents through the transaction path.
pub trait ExtentCallback {
    /// Returns the live extents whose content is in `segment`.
    fn live_extents(&self, segment: SegmentId) -> Vec<LbaEntry>;

    /// Relocates `extents` to the journal's open segment and commits.
    ///
    /// # Errors
    ///
    /// Returns an error if the relocation commit fails.
    fn relocate_extents(&self, extents: &[LbaEntry]) -> CoreResult<RelocationResult>;

    /// Makes relocations durable and releases `segment` on the device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device sync or release fails.
    fn release_segment(&self, segment: SegmentId) -> CoreResult<()>;
}

/// Outcome of one cleaner pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanOutcome {
    /// The victim was emptied and released.
    Cleaned {
        /// The released segment.
        segment: SegmentId,
        /// Relocation totals.
        relocation: RelocationResult,
    },
    /// Some extents were claimed by clients; the victim stays for later.
    Deferred {
        /// The segment that could not be released.
        segment: SegmentId,
        /// Extents still live in it.
        remaining: usize,
    },
    /// No segment is eligible for cleaning.
    Idle,
}

#[derive(Debug)]
struct CleanerState {
    usage: UsageTable,
    /// Current journal write position.
    journal_tail: Option<JournalCursor>,
    /// Cursor restored through `set_next`, checked on the next mount.
    restored: Option<JournalCursor>,
    /// Segment sequence of the latest durable checkpoint.
    checkpoint_seq: u64,
}

/// Segment cleaner and journal segment allocator.
pub struct SegmentCleaner {
    state: Mutex<CleanerState>,
    pass_lock: Mutex<()>,
    num_segments: u32,
    segment_size: u32,
}

impl SegmentCleaner {
    /// Creates a cleaner for a device of `num_segments` segments.
    #[must_use]
    pub fn new(num_segments: u32, segment_size: u32) -> Self {
        Self {
            state: Mutex::new(CleanerState {
                usage: UsageTable::new(num_segments, segment_size),
                journal_tail: None,
                restored: None,
                checkpoint_seq: 0,
            }),
            pass_lock: Mutex::new(()),
            num_segments,
            segment_size,
        }
    }

    /// Forgets all usage; every segment but the superblock becomes empty.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.usage = UsageTable::new(self.num_segments, self.segment_size);
        state.journal_tail = None;
        state.checkpoint_seq = 0;
    }

    /// Returns the journal allocation cursor.
    #[must_use]
    pub fn get_next(&self) -> Option<JournalCursor> {
        self.state.lock().journal_tail
    }

    /// Restores a journal allocation cursor saved with [`get_next`].
    ///
    /// The next mount recomputes the cursor by replay and fails with
    /// `Corruption` if the two disagree.
    ///
    /// [`get_next`]: SegmentCleaner::get_next
    pub fn set_next(&self, cursor: JournalCursor) {
        let mut state = self.state.lock();
        state.restored = Some(cursor);
        state.journal_tail = Some(cursor);
    }

    /// Takes the cursor restored through `set_next`, if any.
    pub(crate) fn take_restored(&self) -> Option<JournalCursor> {
        self.state.lock().restored.take()
    }

    /// Records the segment sequence of the latest durable checkpoint.
    pub fn set_checkpoint_seq(&self, segment_seq: u64) {
        self.state.lock().checkpoint_seq = segment_seq;
    }

    /// Returns the segment sequence of the latest durable checkpoint.
    #[must_use]
    pub fn checkpoint_seq(&self) -> u64 {
        self.state.lock().checkpoint_seq
    }

    /// Returns a copy of the usage table.
    #[must_use]
    pub fn usage(&self) -> UsageTable {
        self.state.lock().usage.clone()
    }

    /// Returns the usage of one segment.
    #[must_use]
    pub fn segment_info(&self, segment: SegmentId) -> Option<SegmentInfo> {
        self.state.lock().usage.get(segment).copied()
    }

    /// Returns the number of empty segments.
    #[must_use]
    pub fn free_segments(&self) -> u32 {
        self.state.lock().usage.free_segments()
    }

    /// Returns the number of closed segments.
    #[must_use]
    pub fn closed_segments(&self) -> u32 {
        self.state.lock().usage.count(SegmentState::Closed)
    }

    /// Picks the next victim, if any segment is eligible.
    #[must_use]
    pub fn select_victim(&self) -> Option<SegmentId> {
        let state = self.state.lock();
        state.usage.select_victim(state.checkpoint_seq)
    }

    /// Accounts for a commit: `written` content is now live, `superseded`
    /// content is not.
    pub fn apply_usage(&self, written: &[(Paddr, u32)], superseded: &[(Paddr, u32)]) {
        let mut state = self.state.lock();
        for (paddr, len) in written {
            state.usage.add_live(paddr.segment, u64::from(*len));
        }
        for (paddr, len) in superseded {
            state.usage.remove_live(paddr.segment, u64::from(*len));
        }
    }

    /// Rebuilds the usage table after replay.
    ///
    /// `chain` lists the journal segments from the checkpoint to the tail
    /// (the last one is open), `live` the live bytes per segment from the
    /// LBA, and `older` the sequences of segments before the checkpoint
    /// that still hold live content.
    pub fn rebuild(
        &self,
        chain: &[ChainSegment],
        live: &HashMap<SegmentId, u64>,
        older: &HashMap<SegmentId, u64>,
        tail: JournalCursor,
    ) {
        let mut state = self.state.lock();
        let mut usage = UsageTable::new(self.num_segments, self.segment_size);

        for (&segment, &segment_seq) in older {
            if let Some(info) = usage.get_mut(segment) {
                info.state = SegmentState::Closed;
                info.segment_seq = segment_seq;
                info.written_bytes = self.segment_size;
            }
        }
        for link in chain {
            if let Some(info) = usage.get_mut(link.segment) {
                info.state = if link.segment == tail.segment {
                    SegmentState::Open
                } else {
                    SegmentState::Closed
                };
                info.segment_seq = link.segment_seq;
                info.written_bytes = link.written;
            }
        }
        for (&segment, &bytes) in live {
            usage.add_live(segment, bytes);
        }

        state.usage = usage;
        state.journal_tail = Some(tail);
        state.checkpoint_seq = chain.first().map_or(0, |link| link.segment_seq);
        debug!(
            free = state.usage.free_segments(),
            closed = state.usage.count(SegmentState::Closed),
            "rebuilt segment usage"
        );
    }

    /// Runs one cleaning pass: select a victim, relocate its live
    /// extents and release it.
    ///
    /// # Errors
    ///
    /// Returns an error if relocation or release fails; the victim is then
    /// left in place.
    pub fn run_pass(&self, callback: &dyn ExtentCallback) -> CoreResult<CleanOutcome> {
        let _pass = self.pass_lock.lock();
        let Some(victim) = self.select_victim() else {
            return Ok(CleanOutcome::Idle);
        };

        let live = callback.live_extents(victim);
        debug!(%victim, live = live.len(), "cleaning segment");
        let relocation = if live.is_empty() {
            RelocationResult::default()
        } else {
            callback.relocate_extents(&live)?
        };

        let remaining = callback.live_extents(victim).len();
        if remaining > 0 {
            debug!(%victim, remaining, yielded = relocation.yielded, "deferring segment");
            return Ok(CleanOutcome::Deferred {
                segment: victim,
                remaining,
            });
        }

        callback.release_segment(victim)?;
        info!(
            %victim,
            relocated = relocation.relocated,
            bytes = relocation.bytes,
            "released segment"
        );
        Ok(CleanOutcome::Cleaned {
            segment: victim,
            relocation,
        })
    }

    /// Marks a released segment empty.
    pub(crate) fn mark_released(&self, segment: SegmentId) {
        self.state.lock().usage.release(segment);
    }
}

impl SegmentProvider for SegmentCleaner {
    fn open_segment(&self, segment_seq: u64) -> CoreResult<SegmentId> {
        let mut state = self.state.lock();
        let segment = state.usage.first_empty().ok_or_else(|| {
            CoreError::out_of_space(format!(
                "no empty segment for journal segment seq {segment_seq}"
            ))
        })?;
        if let Some(info) = state.usage.get_mut(segment) {
            info.state = SegmentState::Open;
            info.segment_seq = segment_seq;
            info.live_bytes = 0;
            info.written_bytes = 0;
        }
        Ok(segment)
    }

    fn close_segment(&self, segment: SegmentId, written: u32) {
        let mut state = self.state.lock();
        if let Some(info) = state.usage.get_mut(segment) {
            info.state = SegmentState::Closed;
            info.written_bytes = written;
        }
    }

    fn advance(&self, cursor: JournalCursor) {
        let mut state = self.state.lock();
        if let Some(info) = state.usage.get_mut(cursor.segment) {
            info.written_bytes = cursor.offset;
        }
        state.journal_tail = Some(cursor);
    }
}

impl fmt::Debug for SegmentCleaner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SegmentCleaner")
            .field("free", &state.usage.free_segments())
            .field("journal_tail", &state.journal_tail)
            .field("checkpoint_seq", &state.checkpoint_seq)
            .finish_non_exhaustive()
    }
}
