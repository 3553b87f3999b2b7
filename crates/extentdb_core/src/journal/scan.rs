//! Sequential journal scanner.

use super::record::{
    Record, RecordHeader, SegmentHeader, RECORD_HEADER_SIZE, SEGMENT_HEADER_SIZE,
};
use super::JournalCursor;
use crate::error::{CoreError, CoreResult};
use crate::types::{Paddr, SegmentId};
use bytes::Bytes;
use extentdb_device::SegmentManager;
use std::fmt;
use tracing::{debug, trace};

/// Why the scanner stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailReason {
    /// No room for another record header in the segment.
    EndOfSegment,
    /// The record extends past the end of the segment.
    Truncated,
    /// The bytes at the cursor are not a record header.
    NoRecord,
    /// The record failed its checksum.
    ChecksumMismatch,
    /// The record carries an unexpected record sequence.
    SequenceGap,
    /// The record was written under a different segment sequence.
    StaleSegment,
}

impl fmt::Display for TailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::EndOfSegment => "end of segment",
            Self::Truncated => "truncated record",
            Self::NoRecord => "no record header",
            Self::ChecksumMismatch => "checksum mismatch",
            Self::SequenceGap => "sequence gap",
            Self::StaleSegment => "stale segment data",
        };
        f.write_str(reason)
    }
}

/// One segment the scanner walked through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSegment {
    /// The segment.
    pub segment: SegmentId,
    /// Its sequence in the journal chain.
    pub segment_seq: u64,
    /// Bytes of valid journal data, header included.
    pub written: u32,
}

/// A record read back from the journal.
#[derive(Debug, Clone)]
pub struct ScannedRecord {
    /// Address of the record header.
    pub location: Paddr,
    /// The decoded header.
    pub header: RecordHeader,
    /// The decoded record.
    pub record: Record,
    /// Address of the record's block area.
    pub block_base: Paddr,
}

/// Walks the journal from a known position to its tail.
///
/// Roll records are followed transparently and never returned.
pub struct JournalScanner<'a> {
    device: &'a dyn SegmentManager,
    cursor: JournalCursor,
    segment_size: u32,
    chain: Vec<ChainSegment>,
    tail: Option<TailReason>,
    records: u64,
}

impl<'a> JournalScanner<'a> {
    /// Creates a scanner positioned at `start`.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the segment at `start` does not carry
    /// the expected segment header.
    pub fn new(device: &'a dyn SegmentManager, start: JournalCursor) -> CoreResult<Self> {
        check_segment_header(device, start.segment, start.segment_seq)?;
        Ok(Self {
            device,
            cursor: start,
            segment_size: device.segment_size(),
            chain: vec![ChainSegment {
                segment: start.segment,
                segment_seq: start.segment_seq,
                written: start.offset,
            }],
            tail: None,
            records: 0,
        })
    }

    /// Returns the position after the last valid record.
    #[must_use]
    pub fn cursor(&self) -> JournalCursor {
        self.cursor
    }

    /// Returns why the scan ended, once it has.
    #[must_use]
    pub fn tail_reason(&self) -> Option<TailReason> {
        self.tail
    }

    /// Returns the segments visited so far, oldest first.
    #[must_use]
    pub fn chain(&self) -> &[ChainSegment] {
        &self.chain
    }

    /// Returns the number of records read, rolls included.
    #[must_use]
    pub fn records_scanned(&self) -> u64 {
        self.records
    }

    /// Reads the next record, or `None` at the tail.
    ///
    /// # Errors
    ///
    /// Returns a device error if a read fails, or a corruption error if a
    /// checksummed record is malformed or a roll leads nowhere.
    pub fn next_record(&mut self) -> CoreResult<Option<ScannedRecord>> {
        loop {
            if self.tail.is_some() {
                return Ok(None);
            }
            let Some(scanned) = self.read_at_cursor()? else {
                return Ok(None);
            };

            let len = u32::try_from(scanned.header.record_len())
                .map_err(|_| CoreError::corruption("record length overflow"))?;
            self.cursor.offset += len;
            self.cursor.record_seq = self.cursor.record_seq.next();
            self.records += 1;
            if let Some(last) = self.chain.last_mut() {
                last.written = self.cursor.offset;
            }

            if let Record::Roll {
                next_segment,
                next_segment_seq,
                ..
            } = scanned.record
            {
                self.follow_roll(next_segment, next_segment_seq)?;
                continue;
            }
            return Ok(Some(scanned));
        }
    }

    fn stop(&mut self, reason: TailReason) -> CoreResult<Option<ScannedRecord>> {
        debug!(cursor = %self.cursor, %reason, "journal tail");
        self.tail = Some(reason);
        Ok(None)
    }

    fn read_at_cursor(&mut self) -> CoreResult<Option<ScannedRecord>> {
        let JournalCursor {
            segment, offset, ..
        } = self.cursor;
        if u64::from(offset) + u64::from(RECORD_HEADER_SIZE) > u64::from(self.segment_size) {
            return self.stop(TailReason::EndOfSegment);
        }

        let raw = self
            .device
            .read(segment, offset, RECORD_HEADER_SIZE as usize)?;
        let Some(header) = RecordHeader::decode(&raw) else {
            return self.stop(TailReason::NoRecord);
        };
        if header.segment_seq != self.cursor.segment_seq {
            return self.stop(TailReason::StaleSegment);
        }
        if header.record_seq != self.cursor.record_seq {
            return self.stop(TailReason::SequenceGap);
        }
        if u64::from(offset) + header.record_len() > u64::from(self.segment_size) {
            return self.stop(TailReason::Truncated);
        }

        // bounded by the segment size
        let body_len = header.body_len() as usize;
        let body = self
            .device
            .read(segment, offset + RECORD_HEADER_SIZE, body_len)?;
        if !header.verify(&raw, &body) {
            return self.stop(TailReason::ChecksumMismatch);
        }

        let record = Record::decode_body(&header, Bytes::from(body))?;
        let location = Paddr::new(segment, offset);
        trace!(%location, seq = %header.record_seq, kind = ?header.kind, "scanned record");
        Ok(Some(ScannedRecord {
            location,
            block_base: location.add(RECORD_HEADER_SIZE + header.delta_len),
            header,
            record,
        }))
    }

    fn follow_roll(&mut self, next_segment: SegmentId, next_segment_seq: u64) -> CoreResult<()> {
        if next_segment_seq != self.cursor.segment_seq + 1 {
            return Err(CoreError::corruption(format!(
                "roll in segment seq {} names segment seq {next_segment_seq}",
                self.cursor.segment_seq
            )));
        }
        check_segment_header(self.device, next_segment, next_segment_seq)?;

        self.cursor = JournalCursor {
            segment: next_segment,
            offset: SEGMENT_HEADER_SIZE,
            segment_seq: next_segment_seq,
            record_seq: self.cursor.record_seq,
        };
        self.chain.push(ChainSegment {
            segment: next_segment,
            segment_seq: next_segment_seq,
            written: SEGMENT_HEADER_SIZE,
        });
        Ok(())
    }
}

fn check_segment_header(
    device: &dyn SegmentManager,
    segment: SegmentId,
    segment_seq: u64,
) -> CoreResult<()> {
    let raw = device.read(segment, 0, SEGMENT_HEADER_SIZE as usize)?;
    match SegmentHeader::decode(&raw) {
        Some(header) if header.segment_seq == segment_seq => Ok(()),
        Some(header) => Err(CoreError::corruption(format!(
            "{segment} holds journal segment seq {}, expected {segment_seq}",
            header.segment_seq
        ))),
        None => Err(CoreError::corruption(format!(
            "{segment} has no journal segment header, expected seq {segment_seq}"
        ))),
    }
}

impl fmt::Debug for JournalScanner<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JournalScanner")
            .field("cursor", &self.cursor)
            .field("tail", &self.tail)
            .field("records", &self.records)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{Delta, Journal, SegmentProvider};
    use crate::types::{Generation, JournalSeq, Laddr};
    use extentdb_device::{DeviceConfig, EphemeralSegmentManager};
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct SequentialProvider {
        next: Mutex<u32>,
    }

    impl SegmentProvider for SequentialProvider {
        fn open_segment(&self, _segment_seq: u64) -> CoreResult<SegmentId> {
            let mut next = self.next.lock();
            *next += 1;
            Ok(SegmentId::new(*next - 1))
        }

        fn close_segment(&self, _segment: SegmentId, _written: u32) {}

        fn advance(&self, _cursor: JournalCursor) {}
    }

    fn commit(generation: u64, size: usize) -> Record {
        Record::Commit {
            generation: Generation::new(generation),
            deltas: vec![Delta::Alloc {
                laddr: Laddr::new(generation << 16),
                len: size as u32,
                refcount: 1,
                block_offset: 0,
            }],
            blocks: Bytes::from(vec![generation as u8; size]),
        }
    }

    fn write_log(count: u64, size: usize) -> (Arc<EphemeralSegmentManager>, JournalCursor) {
        let device = Arc::new(EphemeralSegmentManager::initialized(
            DeviceConfig::new().segment_size(4096).num_segments(8),
        ));
        let journal = Journal::new(device.clone(), false);
        let provider = SequentialProvider {
            next: Mutex::new(1),
        };
        let start = journal.format(&provider).unwrap();
        for generation in 1..=count {
            journal.append(&commit(generation, size), &provider).unwrap();
        }
        (device, start)
    }

    #[test]
    fn scan_returns_records_in_order() {
        let (device, start) = write_log(3, 100);
        let mut scanner = JournalScanner::new(device.as_ref(), start).unwrap();
        let mut generations = Vec::new();
        while let Some(scanned) = scanner.next_record().unwrap() {
            generations.push(scanned.record.generation().as_u64());
        }
        assert_eq!(generations, vec![1, 2, 3]);
        assert_eq!(scanner.tail_reason(), Some(TailReason::NoRecord));
        assert_eq!(scanner.cursor().record_seq, JournalSeq::new(4));
    }

    #[test]
    fn scan_follows_rolls() {
        let (device, start) = write_log(6, 1500);
        let mut scanner = JournalScanner::new(device.as_ref(), start).unwrap();
        let mut count = 0;
        while let Some(scanned) = scanner.next_record().unwrap() {
            count += 1;
            let content = device
                .read(scanned.block_base.segment, scanned.block_base.offset, 1500)
                .unwrap();
            assert!(content.iter().all(|b| *b == count as u8));
        }
        assert_eq!(count, 6);
        assert_eq!(scanner.chain().len(), 3);
        assert_eq!(scanner.chain()[2].segment_seq, 3);
    }

    #[test]
    fn corrupted_record_ends_scan() {
        let (device, start) = write_log(3, 100);
        let record_len = 44 + 21 + 100;
        let second_body = start.offset + record_len + 50;
        device
            .write(start.segment, second_body, &[0xAA])
            .unwrap();

        let mut scanner = JournalScanner::new(device.as_ref(), start).unwrap();
        assert!(scanner.next_record().unwrap().is_some());
        assert!(scanner.next_record().unwrap().is_none());
        assert_eq!(scanner.tail_reason(), Some(TailReason::ChecksumMismatch));
        assert_eq!(scanner.cursor().offset, start.offset + record_len);
    }

    #[test]
    fn wrong_segment_header_is_corruption() {
        let (device, mut start) = write_log(1, 16);
        start.segment_seq = 9;
        assert!(matches!(
            JournalScanner::new(device.as_ref(), start),
            Err(CoreError::Corruption { .. })
        ));
    }
}
