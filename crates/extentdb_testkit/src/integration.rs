//! Model-checked integration harness.
//!
//! [`IntegrationHarness`] drives a [`TestStore`] and mirrors every
//! committed change in a plain map, so any sequence of operations,
//! remounts and crashes can be checked against what the store returns.

use crate::fixtures::{read_extent, write_extent, TestStore};
use crate::generators::Op;
use extentdb_core::{CoreResult, Laddr, TransactionManager};
use std::collections::BTreeMap;
use tracing::debug;

/// Expected state of one extent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelExtent {
    /// Expected content.
    pub data: Vec<u8>,
    /// Expected reference count.
    pub refcount: u32,
}

/// A test harness for integration testing.
pub struct IntegrationHarness {
    /// The store under test.
    pub store: TestStore,
    /// Extent tracking for verification.
    model: BTreeMap<Laddr, ModelExtent>,
}

impl IntegrationHarness {
    /// Creates a new integration harness with an in-memory store.
    pub fn new() -> Self {
        Self::with_store(TestStore::memory())
    }

    /// Creates a harness over an existing, empty store.
    pub fn with_store(store: TestStore) -> Self {
        Self {
            store,
            model: BTreeMap::new(),
        }
    }

    /// Returns the transaction manager.
    pub fn tm(&self) -> &TransactionManager {
        &self.store.tm
    }

    /// Returns the tracked extents.
    pub fn model(&self) -> &BTreeMap<Laddr, ModelExtent> {
        &self.model
    }

    /// Returns the count of tracked extents.
    pub fn tracked_count(&self) -> usize {
        self.model.len()
    }

    /// Allocates and fills an extent and tracks it.
    pub fn alloc(&mut self, hint: u64, len: u32, fill: u8) -> Laddr {
        let laddr = write_extent(self.tm(), hint, len, fill).expect("Failed to allocate extent");
        self.model.insert(
            laddr,
            ModelExtent {
                data: vec![fill; len as usize],
                refcount: 1,
            },
        );
        laddr
    }

    /// Overwrites part of a tracked extent through a mutable clone.
    pub fn overwrite(&mut self, laddr: Laddr, offset: u32, bytes: &[u8]) {
        self.try_overwrite(laddr, offset, bytes)
            .expect("Failed to overwrite extent");
        if let Some(expected) = self.model.get_mut(&laddr) {
            let start = offset as usize;
            expected.data[start..start + bytes.len()].copy_from_slice(bytes);
        }
    }

    fn try_overwrite(&self, laddr: Laddr, offset: u32, bytes: &[u8]) -> CoreResult<()> {
        let tm = self.tm();
        let mut tx = tm.create_transaction()?;
        let extents = tm.read_extents(&mut tx, laddr, 1)?;
        let current = extents
            .iter()
            .find(|extent| extent.laddr == laddr)
            .ok_or_else(|| extentdb_core::CoreError::not_found(laddr))?;
        let clone = tm.get_mutable_extent(&mut tx, current)?;
        if let Some(handle) = clone.handle {
            tx.write(handle, offset, bytes)?;
        }
        tm.submit_transaction(tx)?;
        Ok(())
    }

    /// Adds a reference to a tracked extent.
    pub fn inc_ref(&mut self, laddr: Laddr) -> u32 {
        self.adjust_ref(laddr, true)
    }

    /// Drops a reference to a tracked extent; zero removes it.
    pub fn dec_ref(&mut self, laddr: Laddr) -> u32 {
        self.adjust_ref(laddr, false)
    }

    fn adjust_ref(&mut self, laddr: Laddr, increment: bool) -> u32 {
        let tm = &self.store.tm;
        let mut tx = tm.create_transaction().expect("Failed to begin transaction");
        let count = if increment {
            tm.inc_ref(&mut tx, laddr)
        } else {
            tm.dec_ref(&mut tx, laddr)
        }
        .expect("Failed to adjust refcount");
        tm.submit_transaction(tx).expect("Failed to commit refcount");

        if count == 0 {
            self.model.remove(&laddr);
        } else if let Some(expected) = self.model.get_mut(&laddr) {
            expected.refcount = count;
        }
        count
    }

    /// Closes and remounts the store.
    pub fn remount(&mut self) {
        self.store.remount();
    }

    /// Crashes the store and mounts the surviving image.
    pub fn crash(&mut self) {
        self.store.crash().expect("Failed to recover after crash");
    }

    /// Applies a generated operation.
    ///
    /// Indexes in `op` pick among the tracked extents modulo their count;
    /// operations that need an extent are skipped while none exist.
    pub fn apply(&mut self, op: &Op) {
        let pick = |model: &BTreeMap<Laddr, ModelExtent>, index: usize| {
            model.keys().nth(index % model.len().max(1)).copied()
        };
        debug!(?op, tracked = self.model.len(), "applying operation");
        match *op {
            Op::Alloc { len, fill } => {
                self.alloc(0, len, fill);
            }
            Op::Overwrite { index, offset, len, fill } => {
                if let Some(laddr) = pick(&self.model, index) {
                    let size = self.model[&laddr].data.len() as u32;
                    let offset = offset % size;
                    let len = len.min(size - offset);
                    self.overwrite(laddr, offset, &vec![fill; len as usize]);
                }
            }
            Op::IncRef { index } => {
                if let Some(laddr) = pick(&self.model, index) {
                    self.inc_ref(laddr);
                }
            }
            Op::DecRef { index } => {
                if let Some(laddr) = pick(&self.model, index) {
                    self.dec_ref(laddr);
                }
            }
            Op::Remount => self.remount(),
            Op::Crash => self.crash(),
        }
    }

    /// Verifies all tracked extents are in the store and nothing else is.
    pub fn verify_all(&self) {
        for (laddr, expected) in &self.model {
            let actual = read_extent(self.tm(), *laddr)
                .expect("Failed to read extent")
                .unwrap_or_else(|| panic!("{laddr} is missing"));
            assert_eq!(actual.refcount, expected.refcount, "refcount mismatch for {laddr}");
            assert!(
                actual.data.as_ref() == expected.data.as_slice(),
                "content mismatch for {laddr}"
            );
        }
        assert_eq!(
            self.tm().lba().len(),
            self.model.len(),
            "store maps extents the model does not know"
        );
        self.tm()
            .lba()
            .check_invariants()
            .expect("LBA invariants violated");
    }
}

impl Default for IntegrationHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_harness_tracks_lifecycle() {
        let mut harness = IntegrationHarness::new();
        let a = harness.alloc(0, 4096, 1);
        let b = harness.alloc(0, 2048, 2);
        harness.overwrite(a, 100, b"model");
        harness.inc_ref(b);
        harness.verify_all();

        harness.remount();
        harness.verify_all();

        harness.dec_ref(b);
        harness.dec_ref(b);
        assert_eq!(harness.tracked_count(), 1);
        harness.verify_all();
    }

    #[test]
    fn test_harness_survives_crash() {
        let mut harness = IntegrationHarness::new();
        for fill in 0..8 {
            harness.alloc(0, 1024, fill);
        }
        harness.crash();
        harness.verify_all();
    }
}
