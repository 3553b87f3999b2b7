//! Core type definitions for ExtentDB.

use std::fmt;

pub use extentdb_device::SegmentId;

/// Logical address of an extent.
///
/// Logical addresses are offsets in an opaque 64-bit address space,
/// independent of where the extent is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Laddr(pub u64);

impl Laddr {
    /// Creates a new logical address.
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Returns the raw address value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the address `len` bytes further, or `None` on overflow.
    #[must_use]
    pub const fn checked_add(self, len: u32) -> Option<Self> {
        match self.0.checked_add(len as u64) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }
}

impl fmt::Display for Laddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "laddr:{:#x}", self.0)
    }
}

/// Physical address of extent content on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Paddr {
    /// Segment holding the content.
    pub segment: SegmentId,
    /// Byte offset inside the segment.
    pub offset: u32,
}

impl Paddr {
    /// Creates a new physical address.
    #[must_use]
    pub const fn new(segment: SegmentId, offset: u32) -> Self {
        Self { segment, offset }
    }

    /// Returns the address `delta` bytes further in the same segment.
    #[must_use]
    pub const fn add(self, delta: u32) -> Self {
        Self {
            segment: self.segment,
            offset: self.offset + delta,
        }
    }
}

impl fmt::Display for Paddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{:#x}", self.segment, self.offset)
    }
}

/// Global commit generation.
///
/// Advanced by one for every committed transaction. A transaction's
/// snapshot is the generation current when it was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub u64);

impl Generation {
    /// Creates a new generation.
    #[must_use]
    pub const fn new(generation: u64) -> Self {
        Self(generation)
    }

    /// Returns the raw generation value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next generation.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen:{}", self.0)
    }
}

/// Unique identifier for a transaction.
///
/// Transaction IDs are monotonically increasing and never reused within
/// a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Sequence number of a journal record.
///
/// Every record carries the successor of the previous record's sequence,
/// which is how replay recognizes the end of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JournalSeq(pub u64);

impl JournalSeq {
    /// Creates a new sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for JournalSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// Handle to an extent in a transaction's private write set.
///
/// Only meaningful for the transaction that returned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExtentHandle(pub(crate) usize);

impl ExtentHandle {
    /// Returns the slot index inside the write set.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn laddr_display_is_hex() {
        assert_eq!(format!("{}", Laddr::new(0xFF * 4096)), "laddr:0xff000");
    }

    #[test]
    fn laddr_checked_add_overflow() {
        assert_eq!(Laddr::new(10).checked_add(5), Some(Laddr::new(15)));
        assert_eq!(Laddr::new(u64::MAX).checked_add(1), None);
    }

    #[test]
    fn paddr_ordering_is_segment_major() {
        let a = Paddr::new(SegmentId::new(1), 4000);
        let b = Paddr::new(SegmentId::new(2), 20);
        assert!(a < b);
        assert_eq!(a.add(96), Paddr::new(SegmentId::new(1), 4096));
        assert_eq!(format!("{b}"), "seg:2+0x14");
    }

    #[test]
    fn generation_next() {
        let g = Generation::new(5);
        assert_eq!(g.next().as_u64(), 6);
        assert!(g < g.next());
    }

    #[test]
    fn journal_seq_display() {
        assert_eq!(format!("{}", JournalSeq::new(3)), "seq:3");
    }
}
