//! Journal record types and serialization.

use crate::error::{CoreError, CoreResult};
use crate::lba::LbaEntry;
use crate::types::{Generation, JournalSeq, Laddr, Paddr, SegmentId};
use bytes::Bytes;

/// Magic bytes identifying a journal segment header.
pub const SEGMENT_MAGIC: [u8; 4] = *b"XSEG";

/// Magic bytes identifying a journal record.
pub const RECORD_MAGIC: [u8; 4] = *b"XREC";

/// Current journal format version.
pub const JOURNAL_VERSION: u16 = 1;

/// Size of the header at offset 0 of every journal segment.
/// magic (4) + version (2) + reserved (2) + segment_seq (8) + crc (4) = 20 bytes
pub const SEGMENT_HEADER_SIZE: u32 = 20;

/// Size of the record envelope header.
/// magic (4) + version (2) + kind (1) + flags (1) + record_seq (8) +
/// segment_seq (8) + generation (8) + delta_len (4) + block_len (4) + crc (4) = 44 bytes
pub const RECORD_HEADER_SIZE: u32 = 44;

/// Offset of the CRC inside the record header.
const RECORD_CRC_OFFSET: usize = 40;

/// Size of a complete roll record.
pub const ROLL_RECORD_SIZE: u32 = RECORD_HEADER_SIZE + ROLL_BODY_SIZE as u32;

/// Encoded size of one checkpoint entry.
pub const CHECKPOINT_ENTRY_SIZE: usize = 33;

const ROLL_BODY_SIZE: usize = 13;

/// Encoded size of an alloc delta.
/// tag (1) + laddr (8) + len (4) + refcount (4) + block_offset (4) = 21 bytes
pub const ALLOC_DELTA_SIZE: usize = 21;

/// Encoded size of a remap delta: tag, laddr and block offset.
pub const REMAP_DELTA_SIZE: usize = 13;

/// Encoded size of a relocate delta.
/// tag (1) + laddr (8) + expected paddr (8) + block_offset (4) = 21 bytes
pub const RELOCATE_DELTA_SIZE: usize = 21;

/// Encoded size of a refcount delta: tag, laddr and signed change.
pub const ADJUST_REF_DELTA_SIZE: usize = 13;

/// Checkpoint chunk flag: first chunk of a checkpoint.
pub const FLAG_CHECKPOINT_FIRST: u8 = 0x01;

/// Checkpoint chunk flag: last chunk of a checkpoint.
pub const FLAG_CHECKPOINT_LAST: u8 = 0x02;

const TAG_ALLOC: u8 = 1;
const TAG_REMAP: u8 = 2;
const TAG_RELOCATE: u8 = 3;
const TAG_ADJUST_REF: u8 = 4;
const TAG_RESTORE: u8 = 5;
const TAG_ROLL: u8 = 6;

/// Header written at the start of every journal segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Position of the segment in the journal chain.
    pub segment_seq: u64,
}

impl SegmentHeader {
    /// Encodes the header.
    #[must_use]
    pub fn encode(&self) -> [u8; SEGMENT_HEADER_SIZE as usize] {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC);
        buf[4..6].copy_from_slice(&JOURNAL_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.segment_seq.to_le_bytes());
        let crc = compute_crc32(&buf[0..16]);
        buf[16..20].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes a header, returning `None` if the bytes are not a valid header.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < SEGMENT_HEADER_SIZE as usize || buf[0..4] != SEGMENT_MAGIC {
            return None;
        }
        if u16::from_le_bytes([buf[4], buf[5]]) != JOURNAL_VERSION {
            return None;
        }
        let crc = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
        if crc != compute_crc32(&buf[0..16]) {
            return None;
        }
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&buf[8..16]);
        Some(Self {
            segment_seq: u64::from_le_bytes(seq),
        })
    }
}

/// Kind of journal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// Deltas of one committed transaction.
    Commit = 1,
    /// One chunk of an LBA checkpoint.
    Checkpoint = 2,
    /// The journal continues in another segment.
    Roll = 3,
}

impl RecordKind {
    /// Converts a byte to a record kind.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Commit),
            2 => Some(Self::Checkpoint),
            3 => Some(Self::Roll),
            _ => None,
        }
    }

    /// Converts the record kind to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Decoded record envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Record kind.
    pub kind: RecordKind,
    /// Kind-specific flags.
    pub flags: u8,
    /// Sequence number of the record.
    pub record_seq: JournalSeq,
    /// Sequence of the segment the record was written to.
    pub segment_seq: u64,
    /// Commit generation carried by the record.
    pub generation: Generation,
    /// Length of the delta area.
    pub delta_len: u32,
    /// Length of the block area.
    pub block_len: u32,
    /// CRC over the header (minus this field) and the body.
    pub crc: u32,
}

impl RecordHeader {
    /// Decodes a header.
    ///
    /// Returns `None` when the bytes do not start a record of this format:
    /// wrong magic, unknown version or unknown kind. The CRC is checked
    /// separately against the body by [`RecordHeader::verify`].
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < RECORD_HEADER_SIZE as usize || buf[0..4] != RECORD_MAGIC {
            return None;
        }
        let mut decoder = Decoder::new(&buf[4..RECORD_HEADER_SIZE as usize]);
        let version = decoder.u16().ok()?;
        if version != JOURNAL_VERSION {
            return None;
        }
        let kind = RecordKind::from_byte(decoder.u8().ok()?)?;
        let flags = decoder.u8().ok()?;
        let record_seq = JournalSeq::new(decoder.u64().ok()?);
        let segment_seq = decoder.u64().ok()?;
        let generation = Generation::new(decoder.u64().ok()?);
        let delta_len = decoder.u32().ok()?;
        let block_len = decoder.u32().ok()?;
        let crc = decoder.u32().ok()?;
        Some(Self {
            kind,
            flags,
            record_seq,
            segment_seq,
            generation,
            delta_len,
            block_len,
            crc,
        })
    }

    /// Returns the length of the body following the header.
    #[must_use]
    pub fn body_len(&self) -> u64 {
        u64::from(self.delta_len) + u64::from(self.block_len)
    }

    /// Returns the total length of the record.
    #[must_use]
    pub fn record_len(&self) -> u64 {
        u64::from(RECORD_HEADER_SIZE) + self.body_len()
    }

    /// Checks the stored CRC against the raw header bytes and the body.
    #[must_use]
    pub fn verify(&self, raw_header: &[u8], body: &[u8]) -> bool {
        if raw_header.len() < RECORD_CRC_OFFSET {
            return false;
        }
        let crc = crc32_update(0, &raw_header[..RECORD_CRC_OFFSET]);
        crc32_update(crc, body) == self.crc
    }
}

/// A change to one LBA mapping carried by a commit record.
///
/// Block offsets are relative to the start of the record's block area, so
/// the physical address of new content is only known once the record has
/// been placed in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    /// A new mapping whose content is in the block area.
    Alloc {
        /// Start of the range.
        laddr: Laddr,
        /// Length of the range.
        len: u32,
        /// Initial reference count.
        refcount: u32,
        /// Offset of the content in the block area.
        block_offset: u32,
    },
    /// New content for an existing mapping.
    Remap {
        /// Start of the range.
        laddr: Laddr,
        /// Offset of the content in the block area.
        block_offset: u32,
    },
    /// Content moved by the cleaner.
    ///
    /// Applies only if the mapping still points at `expected`.
    Relocate {
        /// Start of the range.
        laddr: Laddr,
        /// Location the content was copied from.
        expected: Paddr,
        /// Offset of the content in the block area.
        block_offset: u32,
    },
    /// Reference count change; reaching zero removes the mapping.
    AdjustRef {
        /// Start of the range.
        laddr: Laddr,
        /// Signed change.
        delta: i32,
    },
}

impl Delta {
    /// Returns the logical address the delta applies to.
    #[must_use]
    pub fn laddr(&self) -> Laddr {
        match self {
            Self::Alloc { laddr, .. }
            | Self::Remap { laddr, .. }
            | Self::Relocate { laddr, .. }
            | Self::AdjustRef { laddr, .. } => *laddr,
        }
    }

    /// Returns the encoded size of the delta.
    #[must_use]
    pub const fn encoded_len(&self) -> usize {
        match self {
            Self::Alloc { .. } => ALLOC_DELTA_SIZE,
            Self::Remap { .. } => REMAP_DELTA_SIZE,
            Self::Relocate { .. } => RELOCATE_DELTA_SIZE,
            Self::AdjustRef { .. } => ADJUST_REF_DELTA_SIZE,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Alloc {
                laddr,
                len,
                refcount,
                block_offset,
            } => {
                buf.push(TAG_ALLOC);
                buf.extend_from_slice(&laddr.as_u64().to_le_bytes());
                buf.extend_from_slice(&len.to_le_bytes());
                buf.extend_from_slice(&refcount.to_le_bytes());
                buf.extend_from_slice(&block_offset.to_le_bytes());
            }
            Self::Remap {
                laddr,
                block_offset,
            } => {
                buf.push(TAG_REMAP);
                buf.extend_from_slice(&laddr.as_u64().to_le_bytes());
                buf.extend_from_slice(&block_offset.to_le_bytes());
            }
            Self::Relocate {
                laddr,
                expected,
                block_offset,
            } => {
                buf.push(TAG_RELOCATE);
                buf.extend_from_slice(&laddr.as_u64().to_le_bytes());
                encode_paddr(buf, *expected);
                buf.extend_from_slice(&block_offset.to_le_bytes());
            }
            Self::AdjustRef { laddr, delta } => {
                buf.push(TAG_ADJUST_REF);
                buf.extend_from_slice(&laddr.as_u64().to_le_bytes());
                buf.extend_from_slice(&delta.to_le_bytes());
            }
        }
    }

    fn decode(decoder: &mut Decoder<'_>) -> CoreResult<Self> {
        let tag = decoder.u8()?;
        let laddr = Laddr::new(decoder.u64()?);
        match tag {
            TAG_ALLOC => Ok(Self::Alloc {
                laddr,
                len: decoder.u32()?,
                refcount: decoder.u32()?,
                block_offset: decoder.u32()?,
            }),
            TAG_REMAP => Ok(Self::Remap {
                laddr,
                block_offset: decoder.u32()?,
            }),
            TAG_RELOCATE => Ok(Self::Relocate {
                laddr,
                expected: decoder.paddr()?,
                block_offset: decoder.u32()?,
            }),
            TAG_ADJUST_REF => Ok(Self::AdjustRef {
                laddr,
                delta: decoder.i32()?,
            }),
            other => Err(CoreError::corruption(format!("unknown delta tag {other}"))),
        }
    }
}

/// A journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Deltas of one committed transaction plus the content they reference.
    Commit {
        /// Generation assigned to the commit.
        generation: Generation,
        /// Mapping changes in application order.
        deltas: Vec<Delta>,
        /// Extent content referenced by block offsets.
        blocks: Bytes,
    },
    /// One chunk of a full LBA snapshot.
    Checkpoint {
        /// Generation the snapshot was taken at.
        generation: Generation,
        /// Whether this is the first chunk.
        first: bool,
        /// Whether this is the last chunk.
        last: bool,
        /// Mappings in this chunk.
        entries: Vec<LbaEntry>,
    },
    /// The journal continues at the start of `next_segment`.
    Roll {
        /// Generation current when the segment was rolled.
        generation: Generation,
        /// Segment the journal continues in.
        next_segment: SegmentId,
        /// Sequence written in that segment's header.
        next_segment_seq: u64,
    },
}

impl Record {
    /// Returns the record kind.
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Commit { .. } => RecordKind::Commit,
            Self::Checkpoint { .. } => RecordKind::Checkpoint,
            Self::Roll { .. } => RecordKind::Roll,
        }
    }

    /// Returns the generation carried by the record.
    #[must_use]
    pub fn generation(&self) -> Generation {
        match self {
            Self::Commit { generation, .. }
            | Self::Checkpoint { generation, .. }
            | Self::Roll { generation, .. } => *generation,
        }
    }

    fn flags(&self) -> u8 {
        match self {
            Self::Checkpoint { first, last, .. } => {
                let mut flags = 0;
                if *first {
                    flags |= FLAG_CHECKPOINT_FIRST;
                }
                if *last {
                    flags |= FLAG_CHECKPOINT_LAST;
                }
                flags
            }
            _ => 0,
        }
    }

    fn delta_len(&self) -> usize {
        match self {
            Self::Commit { deltas, .. } => deltas.iter().map(Delta::encoded_len).sum(),
            Self::Checkpoint { entries, .. } => entries.len() * CHECKPOINT_ENTRY_SIZE,
            Self::Roll { .. } => ROLL_BODY_SIZE,
        }
    }

    fn block_len(&self) -> usize {
        match self {
            Self::Commit { blocks, .. } => blocks.len(),
            _ => 0,
        }
    }

    /// Returns the offset of the block area from the start of the record.
    #[must_use]
    pub fn block_area_offset(&self) -> usize {
        RECORD_HEADER_SIZE as usize + self.delta_len()
    }

    /// Returns the size of the encoded record, header included.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_SIZE as usize + self.delta_len() + self.block_len()
    }

    /// Serializes the record with its envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the delta or block area exceeds the 4-byte
    /// length fields.
    pub fn encode(&self, record_seq: JournalSeq, segment_seq: u64) -> CoreResult<Vec<u8>> {
        let delta_len = u32::try_from(self.delta_len())
            .map_err(|_| CoreError::invalid_operation("journal record delta area too large"))?;
        let block_len = u32::try_from(self.block_len())
            .map_err(|_| CoreError::invalid_operation("journal record block area too large"))?;

        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&RECORD_MAGIC);
        buf.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        buf.push(self.kind().as_byte());
        buf.push(self.flags());
        buf.extend_from_slice(&record_seq.as_u64().to_le_bytes());
        buf.extend_from_slice(&segment_seq.to_le_bytes());
        buf.extend_from_slice(&self.generation().as_u64().to_le_bytes());
        buf.extend_from_slice(&delta_len.to_le_bytes());
        buf.extend_from_slice(&block_len.to_le_bytes());
        // CRC placeholder, filled in once the body is written
        buf.extend_from_slice(&[0u8; 4]);

        match self {
            Self::Commit { deltas, blocks, .. } => {
                for delta in deltas {
                    delta.encode(&mut buf);
                }
                buf.extend_from_slice(blocks);
            }
            Self::Checkpoint { entries, .. } => {
                for entry in entries {
                    encode_entry(&mut buf, entry);
                }
            }
            Self::Roll {
                next_segment,
                next_segment_seq,
                ..
            } => {
                buf.push(TAG_ROLL);
                buf.extend_from_slice(&next_segment.as_u32().to_le_bytes());
                buf.extend_from_slice(&next_segment_seq.to_le_bytes());
            }
        }

        let crc = crc32_update(
            crc32_update(0, &buf[..RECORD_CRC_OFFSET]),
            &buf[RECORD_HEADER_SIZE as usize..],
        );
        buf[RECORD_CRC_OFFSET..RECORD_CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decodes a record body whose CRC has already been verified.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the body does not match the header.
    pub fn decode_body(header: &RecordHeader, body: Bytes) -> CoreResult<Self> {
        let delta_len = header.delta_len as usize;
        if body.len() as u64 != header.body_len() {
            return Err(CoreError::corruption(format!(
                "record {} body is {} bytes, header says {}",
                header.record_seq,
                body.len(),
                header.body_len()
            )));
        }

        let mut decoder = Decoder::new(&body[..delta_len]);
        let record = match header.kind {
            RecordKind::Commit => {
                let mut deltas = Vec::new();
                while !decoder.is_empty() {
                    deltas.push(Delta::decode(&mut decoder)?);
                }
                Self::Commit {
                    generation: header.generation,
                    deltas,
                    blocks: body.slice(delta_len..),
                }
            }
            RecordKind::Checkpoint => {
                if delta_len % CHECKPOINT_ENTRY_SIZE != 0 || header.block_len != 0 {
                    return Err(CoreError::corruption(format!(
                        "checkpoint record {} has malformed body",
                        header.record_seq
                    )));
                }
                let mut entries = Vec::with_capacity(delta_len / CHECKPOINT_ENTRY_SIZE);
                while !decoder.is_empty() {
                    entries.push(decode_entry(&mut decoder)?);
                }
                Self::Checkpoint {
                    generation: header.generation,
                    first: header.flags & FLAG_CHECKPOINT_FIRST != 0,
                    last: header.flags & FLAG_CHECKPOINT_LAST != 0,
                    entries,
                }
            }
            RecordKind::Roll => {
                if decoder.u8()? != TAG_ROLL {
                    return Err(CoreError::corruption(format!(
                        "roll record {} has malformed body",
                        header.record_seq
                    )));
                }
                Self::Roll {
                    generation: header.generation,
                    next_segment: SegmentId::new(decoder.u32()?),
                    next_segment_seq: decoder.u64()?,
                }
            }
        };

        if !decoder.is_empty() {
            return Err(CoreError::corruption(format!(
                "trailing bytes in record {}",
                header.record_seq
            )));
        }
        Ok(record)
    }
}

fn encode_paddr(buf: &mut Vec<u8>, paddr: Paddr) {
    buf.extend_from_slice(&paddr.segment.as_u32().to_le_bytes());
    buf.extend_from_slice(&paddr.offset.to_le_bytes());
}

fn encode_entry(buf: &mut Vec<u8>, entry: &LbaEntry) {
    buf.push(TAG_RESTORE);
    buf.extend_from_slice(&entry.laddr.as_u64().to_le_bytes());
    buf.extend_from_slice(&entry.len.to_le_bytes());
    encode_paddr(buf, entry.paddr);
    buf.extend_from_slice(&entry.refcount.to_le_bytes());
    buf.extend_from_slice(&entry.generation.as_u64().to_le_bytes());
}

fn decode_entry(decoder: &mut Decoder<'_>) -> CoreResult<LbaEntry> {
    let tag = decoder.u8()?;
    if tag != TAG_RESTORE {
        return Err(CoreError::corruption(format!(
            "unexpected tag {tag} in checkpoint"
        )));
    }
    Ok(LbaEntry {
        laddr: Laddr::new(decoder.u64()?),
        len: decoder.u32()?,
        paddr: decoder.paddr()?,
        refcount: decoder.u32()?,
        generation: Generation::new(decoder.u64()?),
    })
}

/// Little-endian reader over a record body.
struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take<const N: usize>(&mut self) -> CoreResult<[u8; N]> {
        if self.pos + N > self.buf.len() {
            return Err(CoreError::corruption("unexpected end of record body"));
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> CoreResult<u16> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn u32(&mut self) -> CoreResult<u32> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn i32(&mut self) -> CoreResult<i32> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    fn paddr(&mut self) -> CoreResult<Paddr> {
        let segment = SegmentId::new(self.u32()?);
        Ok(Paddr::new(segment, self.u32()?))
    }
}

const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Continues a CRC32 (IEEE) computation over `data`.
///
/// Start with `0`; `crc32_update(crc32_update(0, a), b)` equals
/// `compute_crc32` of `a` followed by `b`.
#[must_use]
pub fn crc32_update(crc: u32, data: &[u8]) -> u32 {
    let mut crc = !crc;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

/// Computes CRC32 checksum for data.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    crc32_update(0, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_commit() -> Record {
        Record::Commit {
            generation: Generation::new(7),
            deltas: vec![
                Delta::Alloc {
                    laddr: Laddr::new(0x1000),
                    len: 4,
                    refcount: 1,
                    block_offset: 0,
                },
                Delta::Remap {
                    laddr: Laddr::new(0x8000),
                    block_offset: 4,
                },
                Delta::Relocate {
                    laddr: Laddr::new(0x9000),
                    expected: Paddr::new(SegmentId::new(3), 64),
                    block_offset: 6,
                },
                Delta::AdjustRef {
                    laddr: Laddr::new(0xA000),
                    delta: -2,
                },
            ],
            blocks: Bytes::from_static(b"aaaabbcc"),
        }
    }

    fn decode(buf: &[u8]) -> (RecordHeader, Record) {
        let header = RecordHeader::decode(buf).unwrap();
        let body = &buf[RECORD_HEADER_SIZE as usize..];
        assert!(header.verify(buf, body));
        let record = Record::decode_body(&header, Bytes::copy_from_slice(body)).unwrap();
        (header, record)
    }

    #[test]
    fn record_kind_roundtrip() {
        for kind in [RecordKind::Commit, RecordKind::Checkpoint, RecordKind::Roll] {
            assert_eq!(RecordKind::from_byte(kind.as_byte()), Some(kind));
        }
        assert_eq!(RecordKind::from_byte(0), None);
    }

    #[test]
    fn commit_record_roundtrip() {
        let record = sample_commit();
        let buf = record.encode(JournalSeq::new(12), 3).unwrap();
        assert_eq!(buf.len(), record.encoded_len());

        let (header, decoded) = decode(&buf);
        assert_eq!(header.kind, RecordKind::Commit);
        assert_eq!(header.record_seq, JournalSeq::new(12));
        assert_eq!(header.segment_seq, 3);
        assert_eq!(header.delta_len, 21 + 13 + 21 + 13);
        assert_eq!(header.block_len, 8);
        assert_eq!(decoded, record);
    }

    #[test]
    fn delta_sizes_match_encoding() {
        let Record::Commit { deltas, .. } = sample_commit() else {
            unreachable!()
        };
        for delta in deltas {
            let mut buf = Vec::new();
            delta.encode(&mut buf);
            assert_eq!(buf.len(), delta.encoded_len(), "{delta:?}");
        }
    }

    #[test]
    fn checkpoint_flags_roundtrip() {
        let record = Record::Checkpoint {
            generation: Generation::new(4),
            first: true,
            last: false,
            entries: vec![LbaEntry {
                laddr: Laddr::new(0xFF000),
                len: 4096,
                paddr: Paddr::new(SegmentId::new(2), 20 + 44),
                refcount: 3,
                generation: Generation::new(2),
            }],
        };
        let buf = record.encode(JournalSeq::new(1), 1).unwrap();
        let (header, decoded) = decode(&buf);
        assert_eq!(header.flags, FLAG_CHECKPOINT_FIRST);
        assert_eq!(header.delta_len as usize, CHECKPOINT_ENTRY_SIZE);
        assert_eq!(decoded, record);
    }

    #[test]
    fn roll_record_has_fixed_size() {
        let record = Record::Roll {
            generation: Generation::new(9),
            next_segment: SegmentId::new(5),
            next_segment_seq: 6,
        };
        let buf = record.encode(JournalSeq::new(30), 5).unwrap();
        assert_eq!(buf.len(), ROLL_RECORD_SIZE as usize);
        assert_eq!(decode(&buf).1, record);
    }

    #[test]
    fn flipped_body_bit_fails_crc() {
        let mut buf = sample_commit().encode(JournalSeq::new(1), 1).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        let header = RecordHeader::decode(&buf).unwrap();
        assert!(!header.verify(&buf, &buf[RECORD_HEADER_SIZE as usize..]));
    }

    #[test]
    fn flipped_header_bit_fails_crc() {
        let mut buf = sample_commit().encode(JournalSeq::new(1), 1).unwrap();
        buf[30] ^= 0x80; // inside the generation field
        let header = RecordHeader::decode(&buf).unwrap();
        assert!(!header.verify(&buf, &buf[RECORD_HEADER_SIZE as usize..]));
    }

    #[test]
    fn zeroes_are_not_a_record() {
        assert!(RecordHeader::decode(&[0u8; 64]).is_none());
        assert!(RecordHeader::decode(&RECORD_MAGIC).is_none());
    }

    #[test]
    fn segment_header_roundtrip() {
        let header = SegmentHeader { segment_seq: 42 };
        let buf = header.encode();
        assert_eq!(SegmentHeader::decode(&buf), Some(header));

        let mut bad = buf;
        bad[9] ^= 0xFF;
        assert_eq!(SegmentHeader::decode(&bad), None);
    }

    #[test]
    fn unknown_delta_tag_is_corruption() {
        let mut record = sample_commit().encode(JournalSeq::new(1), 1).unwrap();
        record[RECORD_HEADER_SIZE as usize] = 99;
        let header = RecordHeader::decode(&record).unwrap();
        let body = Bytes::copy_from_slice(&record[RECORD_HEADER_SIZE as usize..]);
        assert!(matches!(
            Record::decode_body(&header, body),
            Err(CoreError::Corruption { .. })
        ));
    }

    #[test]
    fn crc32_known_value() {
        // Known test vector: "123456789" should give 0xCBF43926
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn crc32_is_incremental() {
        let whole = compute_crc32(b"hello world");
        let split = crc32_update(crc32_update(0, b"hello "), b"world");
        assert_eq!(whole, split);
    }
}
