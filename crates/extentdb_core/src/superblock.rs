//! Superblock: the fixed root of the store.
//!
//! Segment 0 holds two superblock slots. Each update writes the slot
//! `epoch % 2` and syncs, so a torn update leaves the previous superblock
//! intact; mount uses the valid slot with the highest epoch.
//!
//! ## Format
//!
//! ```text
//! | magic "XSBK" (4) | version (2) | reserved (2) | epoch (8) |
//! | segment_size (4) | num_segments (4) |
//! | checkpoint segment (4) | checkpoint offset (4) | checkpoint record_seq (8) |
//! | checkpoint segment_seq (8) | checkpoint generation (8) | crc32 (4) |
//! ```

use crate::error::{CoreError, CoreResult};
use crate::journal::{compute_crc32, JournalCursor};
use crate::types::{Generation, JournalSeq, SegmentId};
use extentdb_device::SegmentManager;
use tracing::debug;

/// Magic bytes for the superblock.
pub const SUPERBLOCK_MAGIC: [u8; 4] = *b"XSBK";

/// Current superblock version.
pub const SUPERBLOCK_VERSION: u16 = 1;

/// Segment reserved for the superblock.
pub const SUPERBLOCK_SEGMENT: SegmentId = SegmentId::new(0);

/// Size of one superblock slot.
pub const SUPERBLOCK_SLOT_SIZE: u32 = 4096;

/// Smallest segment size that holds both superblock slots.
pub const MIN_SEGMENT_SIZE: u32 = 2 * SUPERBLOCK_SLOT_SIZE;

/// Encoded superblock size.
pub const SUPERBLOCK_SIZE: usize = 60;

/// Where replay starts: a checkpoint record and the generation it captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointPosition {
    /// Position of the checkpoint's first record.
    pub cursor: JournalCursor,
    /// Generation of the mapping in the checkpoint.
    pub generation: Generation,
}

/// Decoded superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    /// Update counter; the higher epoch wins.
    pub epoch: u64,
    /// Segment size the store was created with.
    pub segment_size: u32,
    /// Segment count the store was created with.
    pub num_segments: u32,
    /// Most recent complete checkpoint.
    pub checkpoint: CheckpointPosition,
}

impl Superblock {
    /// Returns the byte offset of this superblock's slot in segment 0.
    #[must_use]
    pub fn slot_offset(&self) -> u32 {
        if self.epoch % 2 == 0 {
            0
        } else {
            SUPERBLOCK_SLOT_SIZE
        }
    }

    /// Encodes the superblock.
    #[must_use]
    pub fn encode(&self) -> [u8; SUPERBLOCK_SIZE] {
        let cursor = &self.checkpoint.cursor;
        let mut buf = [0u8; SUPERBLOCK_SIZE];
        buf[0..4].copy_from_slice(&SUPERBLOCK_MAGIC);
        buf[4..6].copy_from_slice(&SUPERBLOCK_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.epoch.to_le_bytes());
        buf[16..20].copy_from_slice(&self.segment_size.to_le_bytes());
        buf[20..24].copy_from_slice(&self.num_segments.to_le_bytes());
        buf[24..28].copy_from_slice(&cursor.segment.as_u32().to_le_bytes());
        buf[28..32].copy_from_slice(&cursor.offset.to_le_bytes());
        buf[32..40].copy_from_slice(&cursor.record_seq.as_u64().to_le_bytes());
        buf[40..48].copy_from_slice(&cursor.segment_seq.to_le_bytes());
        buf[48..56].copy_from_slice(&self.checkpoint.generation.as_u64().to_le_bytes());
        let crc = compute_crc32(&buf[0..56]);
        buf[56..60].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes a superblock.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for a bad magic, unsupported version or
    /// checksum mismatch.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < SUPERBLOCK_SIZE || data[0..4] != SUPERBLOCK_MAGIC {
            return Err(CoreError::invalid_format("invalid superblock magic"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != SUPERBLOCK_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported superblock version: {version}"
            )));
        }
        let stored = read_u32(data, 56);
        if stored != compute_crc32(&data[0..56]) {
            return Err(CoreError::invalid_format("superblock checksum mismatch"));
        }

        Ok(Self {
            epoch: read_u64(data, 8),
            segment_size: read_u32(data, 16),
            num_segments: read_u32(data, 20),
            checkpoint: CheckpointPosition {
                cursor: JournalCursor {
                    segment: SegmentId::new(read_u32(data, 24)),
                    offset: read_u32(data, 28),
                    record_seq: JournalSeq::new(read_u64(data, 32)),
                    segment_seq: read_u64(data, 40),
                },
                generation: Generation::new(read_u64(data, 48)),
            },
        })
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(buf)
}

/// Checks that the device can hold a store.
///
/// # Errors
///
/// Returns `InvalidFormat` if segments are too small for the superblock or
/// the device has fewer than two segments.
pub fn check_geometry(device: &dyn SegmentManager) -> CoreResult<()> {
    let config = device.config();
    if config.segment_size < MIN_SEGMENT_SIZE {
        return Err(CoreError::invalid_format(format!(
            "segment size {} is below the minimum of {MIN_SEGMENT_SIZE}",
            config.segment_size
        )));
    }
    if config.num_segments < 2 {
        return Err(CoreError::invalid_format(format!(
            "device has {} segments, at least 2 are needed",
            config.num_segments
        )));
    }
    Ok(())
}

/// Writes `superblock` to its slot and syncs the device.
///
/// # Errors
///
/// Returns the device error if the write or sync fails.
pub fn write_superblock(device: &dyn SegmentManager, superblock: &Superblock) -> CoreResult<()> {
    device.write(
        SUPERBLOCK_SEGMENT,
        superblock.slot_offset(),
        &superblock.encode(),
    )?;
    device.sync()?;
    debug!(
        epoch = superblock.epoch,
        checkpoint = %superblock.checkpoint.cursor,
        "wrote superblock"
    );
    Ok(())
}

/// Reads the newest valid superblock.
///
/// # Errors
///
/// Returns `InvalidFormat` if neither slot holds a valid superblock or the
/// superblock does not describe this device, and device errors as-is.
pub fn read_superblock(device: &dyn SegmentManager) -> CoreResult<Superblock> {
    let mut newest: Option<Superblock> = None;
    for offset in [0, SUPERBLOCK_SLOT_SIZE] {
        let raw = device.read(SUPERBLOCK_SEGMENT, offset, SUPERBLOCK_SIZE)?;
        match Superblock::decode(&raw) {
            Ok(superblock) if newest.map_or(true, |n| superblock.epoch > n.epoch) => {
                newest = Some(superblock);
            }
            Ok(_) => {}
            Err(err) => debug!(offset, error = %err, "skipping superblock slot"),
        }
    }

    let superblock =
        newest.ok_or_else(|| CoreError::invalid_format("no valid superblock on device"))?;
    let config = device.config();
    if superblock.segment_size != config.segment_size
        || superblock.num_segments != config.num_segments
    {
        return Err(CoreError::invalid_format(format!(
            "superblock describes {} segments of {} bytes, device has {} of {}",
            superblock.num_segments,
            superblock.segment_size,
            config.num_segments,
            config.segment_size
        )));
    }
    Ok(superblock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use extentdb_device::{DeviceConfig, EphemeralSegmentManager};

    fn device() -> EphemeralSegmentManager {
        EphemeralSegmentManager::initialized(
            DeviceConfig::new().segment_size(16384).num_segments(8),
        )
    }

    fn superblock(epoch: u64) -> Superblock {
        Superblock {
            epoch,
            segment_size: 16384,
            num_segments: 8,
            checkpoint: CheckpointPosition {
                cursor: JournalCursor {
                    segment: SegmentId::new(3),
                    offset: 20,
                    segment_seq: epoch + 1,
                    record_seq: JournalSeq::new(epoch * 10),
                },
                generation: Generation::new(epoch * 7),
            },
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let sb = superblock(5);
        assert_eq!(Superblock::decode(&sb.encode()).unwrap(), sb);
    }

    #[test]
    fn invalid_magic_rejected() {
        let mut buf = superblock(1).encode();
        buf[0] = b'Y';
        assert!(matches!(
            Superblock::decode(&buf),
            Err(CoreError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn checksum_mismatch_rejected() {
        let mut buf = superblock(1).encode();
        buf[30] ^= 0x01;
        assert!(Superblock::decode(&buf).is_err());
    }

    #[test]
    fn newest_slot_wins() {
        let device = device();
        write_superblock(&device, &superblock(1)).unwrap();
        write_superblock(&device, &superblock(2)).unwrap();
        assert_eq!(read_superblock(&device).unwrap().epoch, 2);

        write_superblock(&device, &superblock(3)).unwrap();
        assert_eq!(read_superblock(&device).unwrap(), superblock(3));
    }

    #[test]
    fn torn_slot_falls_back() {
        let device = device();
        write_superblock(&device, &superblock(1)).unwrap();
        write_superblock(&device, &superblock(2)).unwrap();
        // damage the epoch 2 slot
        device.write(SUPERBLOCK_SEGMENT, 10, &[0xFF]).unwrap();
        assert_eq!(read_superblock(&device).unwrap().epoch, 1);
    }

    #[test]
    fn blank_device_is_invalid_format() {
        assert!(matches!(
            read_superblock(&device()),
            Err(CoreError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn geometry_mismatch_is_invalid_format() {
        let device = device();
        let mut sb = superblock(1);
        sb.num_segments = 4;
        write_superblock(&device, &sb).unwrap();
        assert!(matches!(
            read_superblock(&device),
            Err(CoreError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn small_segments_rejected() {
        let device = EphemeralSegmentManager::initialized(
            DeviceConfig::new().segment_size(4096).num_segments(8),
        );
        assert!(check_geometry(&device).is_err());
    }
}
