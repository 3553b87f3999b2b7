//! Rebuilding the LBA mapping from the journal.

use super::record::Record;
use super::scan::{ChainSegment, JournalScanner, TailReason};
use super::JournalCursor;
use crate::error::{CoreError, CoreResult};
use crate::lba::{LbaEntry, LbaManager};
use crate::types::Generation;
use extentdb_device::SegmentManager;
use tracing::{info, warn};

/// What replay found.
#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    /// Where the next record will be appended.
    pub tail: JournalCursor,
    /// Why the scan stopped.
    pub tail_reason: Option<TailReason>,
    /// Generation of the last replayed commit.
    pub generation: Generation,
    /// Segments from the checkpoint to the tail, oldest first.
    pub chain: Vec<ChainSegment>,
    /// Mappings loaded from the checkpoint.
    pub checkpoint_entries: usize,
    /// Commit records applied on top of the checkpoint.
    pub commits_replayed: u64,
    /// Later checkpoints skipped over.
    pub checkpoints_skipped: u64,
    /// Relocations dropped because the mapping had moved on.
    pub relocations_skipped: u64,
}

/// Replays the journal from the checkpoint at `start` into `lba`.
///
/// `lba` is cleared first. The record at `start` must be the first chunk
/// of a checkpoint taken at `generation`; every commit after it is applied
/// in order until the tail.
///
/// # Errors
///
/// Returns a corruption error if the checkpoint is missing or incomplete,
/// generations go backwards, or a commit cannot be applied. Device errors
/// are returned as-is.
pub fn replay(
    device: &dyn SegmentManager,
    start: JournalCursor,
    generation: Generation,
    lba: &LbaManager,
) -> CoreResult<ReplayOutcome> {
    lba.clear();
    let mut scanner = JournalScanner::new(device, start)?;

    let entries = read_checkpoint(&mut scanner, start, generation)?;
    lba.restore(&entries).map_err(|err| {
        CoreError::corruption(format!("checkpoint at {start} does not restore: {err}"))
    })?;

    let mut current = generation;
    let mut commits_replayed = 0;
    let mut checkpoints_skipped = 0;
    let mut relocations_skipped = 0;

    while let Some(scanned) = scanner.next_record()? {
        let record_generation = scanned.record.generation();
        if record_generation < current {
            return Err(CoreError::corruption(format!(
                "record {} at {} carries {record_generation}, behind {current}",
                scanned.header.record_seq, scanned.location
            )));
        }

        match scanned.record {
            Record::Commit { deltas, blocks, .. } => {
                let block_len = u32::try_from(blocks.len())
                    .map_err(|_| CoreError::corruption("block area overflow"))?;
                let applied = lba
                    .apply_commit(&deltas, scanned.block_base, block_len, record_generation)
                    .map_err(|err| {
                        CoreError::corruption(format!(
                            "record {} at {} does not apply: {err}",
                            scanned.header.record_seq, scanned.location
                        ))
                    })?;
                relocations_skipped += applied.skipped_relocations as u64;
                commits_replayed += 1;
                current = record_generation;
            }
            Record::Checkpoint { .. } => checkpoints_skipped += 1,
            Record::Roll { .. } => {}
        }
    }

    let outcome = ReplayOutcome {
        tail: scanner.cursor(),
        tail_reason: scanner.tail_reason(),
        generation: current,
        chain: scanner.chain().to_vec(),
        checkpoint_entries: entries.len(),
        commits_replayed,
        checkpoints_skipped,
        relocations_skipped,
    };
    info!(
        tail = %outcome.tail,
        generation = %outcome.generation,
        checkpoint_entries = outcome.checkpoint_entries,
        commits = outcome.commits_replayed,
        "journal replayed"
    );
    Ok(outcome)
}

fn read_checkpoint(
    scanner: &mut JournalScanner<'_>,
    start: JournalCursor,
    generation: Generation,
) -> CoreResult<Vec<LbaEntry>> {
    let mut entries = Vec::new();
    let mut first_chunk = true;

    loop {
        let Some(scanned) = scanner.next_record()? else {
            if let Some(reason) = scanner.tail_reason() {
                warn!(%start, %reason, "checkpoint ends early");
            }
            return Err(CoreError::corruption(format!(
                "checkpoint at {start} is missing or incomplete"
            )));
        };

        match scanned.record {
            Record::Checkpoint {
                generation: chunk_generation,
                first,
                last,
                entries: chunk,
            } if first == first_chunk && chunk_generation == generation => {
                entries.extend(chunk);
                if last {
                    return Ok(entries);
                }
                first_chunk = false;
            }
            other => {
                return Err(CoreError::corruption(format!(
                    "expected checkpoint chunk at {}, found {:?} record at {}",
                    scanned.location,
                    other.kind(),
                    other.generation()
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{Delta, Journal, SegmentProvider};
    use crate::types::{Laddr, Paddr, SegmentId};
    use bytes::Bytes;
    use extentdb_device::{DeviceConfig, EphemeralSegmentManager};
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct SequentialProvider(Mutex<u32>);

    impl SegmentProvider for SequentialProvider {
        fn open_segment(&self, _segment_seq: u64) -> CoreResult<SegmentId> {
            let mut next = self.0.lock();
            *next += 1;
            Ok(SegmentId::new(*next - 1))
        }

        fn close_segment(&self, _segment: SegmentId, _written: u32) {}

        fn advance(&self, _cursor: JournalCursor) {}
    }

    struct Fixture {
        device: Arc<EphemeralSegmentManager>,
        journal: Journal,
        provider: SequentialProvider,
        start: JournalCursor,
    }

    fn fixture() -> Fixture {
        let device = Arc::new(EphemeralSegmentManager::initialized(
            DeviceConfig::new().segment_size(4096).num_segments(8),
        ));
        let journal = Journal::new(device.clone(), false);
        let provider = SequentialProvider(Mutex::new(1));
        let start = journal.format(&provider).unwrap();
        Fixture {
            device,
            journal,
            provider,
            start,
        }
    }

    fn empty_checkpoint(generation: u64) -> Record {
        Record::Checkpoint {
            generation: Generation::new(generation),
            first: true,
            last: true,
            entries: Vec::new(),
        }
    }

    fn alloc(generation: u64, laddr: u64, content: &[u8]) -> Record {
        Record::Commit {
            generation: Generation::new(generation),
            deltas: vec![Delta::Alloc {
                laddr: Laddr::new(laddr),
                len: content.len() as u32,
                refcount: 1,
                block_offset: 0,
            }],
            blocks: Bytes::copy_from_slice(content),
        }
    }

    #[test]
    fn replay_applies_commits_after_checkpoint() {
        let f = fixture();
        f.journal.append(&empty_checkpoint(0), &f.provider).unwrap();
        let first = f.journal.append(&alloc(1, 0x1000, b"abcd"), &f.provider).unwrap();
        f.journal.append(&alloc(2, 0x2000, b"efgh"), &f.provider).unwrap();

        let lba = LbaManager::new(4, 4);
        let outcome = replay(f.device.as_ref(), f.start, Generation::new(0), &lba).unwrap();
        assert_eq!(outcome.commits_replayed, 2);
        assert_eq!(outcome.generation, Generation::new(2));
        assert_eq!(outcome.tail, f.journal.cursor().unwrap());
        assert_eq!(lba.len(), 2);
        assert_eq!(lba.get(Laddr::new(0x1000)).unwrap().paddr, first.block_base);
    }

    #[test]
    fn replay_is_idempotent() {
        let f = fixture();
        f.journal.append(&empty_checkpoint(0), &f.provider).unwrap();
        f.journal.append(&alloc(1, 0x1000, b"abcd"), &f.provider).unwrap();

        let lba = LbaManager::new(4, 4);
        replay(f.device.as_ref(), f.start, Generation::new(0), &lba).unwrap();
        let once = lba.snapshot();
        replay(f.device.as_ref(), f.start, Generation::new(0), &lba).unwrap();
        assert_eq!(lba.snapshot(), once);
    }

    #[test]
    fn multi_chunk_checkpoint_restores_everything() {
        let f = fixture();
        let entry = |laddr: u64| LbaEntry {
            laddr: Laddr::new(laddr),
            len: 16,
            paddr: Paddr::new(SegmentId::new(1), 20),
            refcount: 1,
            generation: Generation::new(3),
        };
        f.journal
            .append(
                &Record::Checkpoint {
                    generation: Generation::new(3),
                    first: true,
                    last: false,
                    entries: vec![entry(0), entry(16)],
                },
                &f.provider,
            )
            .unwrap();
        f.journal
            .append(
                &Record::Checkpoint {
                    generation: Generation::new(3),
                    first: false,
                    last: true,
                    entries: vec![entry(32)],
                },
                &f.provider,
            )
            .unwrap();

        let lba = LbaManager::new(4, 4);
        let outcome = replay(f.device.as_ref(), f.start, Generation::new(3), &lba).unwrap();
        assert_eq!(outcome.checkpoint_entries, 3);
        assert_eq!(lba.len(), 3);
    }

    #[test]
    fn missing_checkpoint_is_corruption() {
        let f = fixture();
        f.journal.append(&alloc(1, 0x1000, b"abcd"), &f.provider).unwrap();
        let lba = LbaManager::new(4, 4);
        assert!(matches!(
            replay(f.device.as_ref(), f.start, Generation::new(0), &lba),
            Err(CoreError::Corruption { .. })
        ));
    }

    #[test]
    fn incomplete_checkpoint_is_corruption() {
        let f = fixture();
        f.journal
            .append(
                &Record::Checkpoint {
                    generation: Generation::new(0),
                    first: true,
                    last: false,
                    entries: Vec::new(),
                },
                &f.provider,
            )
            .unwrap();
        let lba = LbaManager::new(4, 4);
        assert!(matches!(
            replay(f.device.as_ref(), f.start, Generation::new(0), &lba),
            Err(CoreError::Corruption { .. })
        ));
    }

    #[test]
    fn generation_regression_is_corruption() {
        let f = fixture();
        f.journal.append(&empty_checkpoint(0), &f.provider).unwrap();
        f.journal.append(&alloc(2, 0x1000, b"abcd"), &f.provider).unwrap();
        f.journal.append(&alloc(1, 0x2000, b"efgh"), &f.provider).unwrap();
        let lba = LbaManager::new(4, 4);
        assert!(matches!(
            replay(f.device.as_ref(), f.start, Generation::new(0), &lba),
            Err(CoreError::Corruption { .. })
        ));
    }

    #[test]
    fn torn_tail_is_dropped() {
        let f = fixture();
        f.journal.append(&empty_checkpoint(0), &f.provider).unwrap();
        f.journal.append(&alloc(1, 0x1000, b"abcd"), &f.provider).unwrap();
        let torn = f.journal.append(&alloc(2, 0x2000, b"efgh"), &f.provider).unwrap();
        f.device
            .write(torn.block_base.segment, torn.block_base.offset, b"XXXX")
            .unwrap();

        let lba = LbaManager::new(4, 4);
        let outcome = replay(f.device.as_ref(), f.start, Generation::new(0), &lba).unwrap();
        assert_eq!(outcome.commits_replayed, 1);
        assert_eq!(outcome.tail.paddr(), torn.location);
        assert_eq!(outcome.tail_reason, Some(TailReason::ChecksumMismatch));
        assert!(lba.get(Laddr::new(0x2000)).is_none());
    }
}
