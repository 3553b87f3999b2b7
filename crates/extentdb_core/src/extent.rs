//! Extent values handed out to callers.

use crate::types::{ExtentHandle, Generation, Laddr, Paddr};
use bytes::Bytes;

/// An extent as seen by one transaction.
///
/// Committed extents are immutable: holding a `LogicalExtent` never
/// observes a later commit. To change content, ask the transaction
/// manager for a mutable copy with
/// [`get_mutable_extent`](crate::TransactionManager::get_mutable_extent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalExtent {
    /// Start of the logical range.
    pub laddr: Laddr,
    /// Length of the range in bytes.
    pub len: u32,
    /// Reference count as seen by the reading transaction.
    pub refcount: u32,
    /// Generation of the last commit that logically changed the extent.
    pub generation: Generation,
    /// Where the content lives, or `None` for the transaction's own
    /// pending version.
    pub paddr: Option<Paddr>,
    /// Handle of the pending version in the reading transaction.
    pub handle: Option<ExtentHandle>,
    /// The content.
    pub data: Bytes,
}

impl LogicalExtent {
    /// Returns the end of the logical range (exclusive).
    #[must_use]
    pub fn end(&self) -> u64 {
        self.laddr.as_u64() + u64::from(self.len)
    }

    /// Returns true if this is the reading transaction's own pending version.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.handle.is_some()
    }
}
