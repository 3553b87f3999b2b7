//! Transactions over logical extents.
//!
//! A transaction reads the mapping as of its snapshot generation and
//! stages allocations, copy-on-write clones and refcount changes
//! privately. Submitting validates everything it observed against the
//! current mapping and commits it as one journal record.
//!
//! ## Isolation
//!
//! - Reads see the snapshot plus the transaction's own changes
//! - An extent can be held for modification by one transaction at a time;
//!   a second claimant gets `Conflict` immediately
//! - A commit fails with `Conflict` if any committed extent the
//!   transaction read changed since it was read
//!
//! Conflicts are retryable: abort and start over.

mod manager;
mod state;

pub use manager::TransactionManager;
pub use state::{Transaction, TransactionSource, TransactionState};
