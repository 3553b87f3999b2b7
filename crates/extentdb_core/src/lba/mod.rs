//! Logical block address mapping.
//!
//! The LBA maps logical ranges `[laddr, laddr + len)` to the physical
//! location of their content, together with a reference count and the
//! generation of the last commit that logically changed the range.
//!
//! ## Structure
//!
//! An ordered paged index ([`LbaTree`]): leaves hold up to
//! [`LEAF_CAPACITY`] entries and are chained to their siblings for range
//! scans, internal nodes hold up to [`INTERNAL_CAPACITY`] children. An
//! insertion that overflows a node splits it at the median and pushes a
//! separator into the parent, growing a new root when the root splits.
//! Removal never merges nodes.
//!
//! ## Invariants
//!
//! - Live ranges **never overlap**
//! - Every mapped range has a refcount of at least 1
//! - The in-memory tree is authoritative; it is rebuilt from the journal
//!   on mount and only changed in the serialized commit path

mod manager;
mod tree;

pub use manager::{AppliedCommit, LbaManager};
pub use tree::LbaTree;

use crate::types::{Generation, Laddr, Paddr};

/// Default maximum entries in a leaf node.
pub const LEAF_CAPACITY: usize = 64;

/// Default maximum children of an internal node.
pub const INTERNAL_CAPACITY: usize = 64;

/// One mapping in the LBA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LbaEntry {
    /// Start of the logical range.
    pub laddr: Laddr,
    /// Length of the range in bytes.
    pub len: u32,
    /// Location of the content.
    pub paddr: Paddr,
    /// Reference count.
    pub refcount: u32,
    /// Generation of the last logical change.
    pub generation: Generation,
}

impl LbaEntry {
    /// Returns the end of the logical range (exclusive).
    #[must_use]
    pub fn end(&self) -> u64 {
        self.laddr.as_u64() + u64::from(self.len)
    }

    /// Returns true if the entry intersects `[start, end)`.
    #[must_use]
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.laddr.as_u64() < end && self.end() > start
    }
}
