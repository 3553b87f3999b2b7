//! LBA manager: the shared mapping plus snapshot bookkeeping.

use crate::error::{CoreError, CoreResult};
use crate::journal::Delta;
use crate::lba::{LbaEntry, LbaTree};
use crate::types::{Generation, Laddr, Paddr, SegmentId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Marker left behind by a removed mapping.
///
/// Transactions whose snapshot predates the removal must not treat the
/// range as free or as never having existed.
#[derive(Debug, Clone, Copy)]
struct Retired {
    len: u32,
    generation: Generation,
}

#[derive(Debug)]
struct LbaState {
    tree: LbaTree,
    retired: BTreeMap<Laddr, Retired>,
}

/// Result of applying one commit record to the mapping.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AppliedCommit {
    /// Entries whose content now lives in the record's block area.
    pub written: Vec<LbaEntry>,
    /// Locations no longer referenced, with their lengths.
    pub superseded: Vec<(Paddr, u32)>,
    /// Entries removed because their refcount reached zero.
    pub removed: Vec<LbaEntry>,
    /// Relocations dropped because the mapping had moved on.
    pub skipped_relocations: usize,
}

/// Thread-safe owner of the LBA mapping.
///
/// Readers take a shared lock; every mutation happens under the exclusive
/// lock, and in the store only from the serialized commit path or replay.
#[derive(Debug)]
pub struct LbaManager {
    state: RwLock<LbaState>,
}

impl LbaManager {
    /// Creates an empty mapping with the given node capacities.
    #[must_use]
    pub fn new(leaf_capacity: usize, internal_capacity: usize) -> Self {
        Self {
            state: RwLock::new(LbaState {
                tree: LbaTree::new(leaf_capacity, internal_capacity),
                retired: BTreeMap::new(),
            }),
        }
    }

    /// Drops every mapping and retired marker.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.tree.clear();
        state.retired.clear();
    }

    /// Returns the number of live mappings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().tree.len()
    }

    /// Returns true if nothing is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().tree.is_empty()
    }

    /// Returns the depth of the index.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.state.read().tree.depth()
    }

    /// Returns the number of index node splits so far.
    #[must_use]
    pub fn splits(&self) -> u64 {
        self.state.read().tree.splits()
    }

    /// Returns the number of retired markers held.
    #[must_use]
    pub fn retired_count(&self) -> usize {
        self.state.read().retired.len()
    }

    /// Inserts a mapping.
    ///
    /// # Errors
    ///
    /// Returns `Overlap` if the range intersects a live mapping.
    pub fn insert(&self, entry: LbaEntry) -> CoreResult<()> {
        self.state.write().tree.insert(entry)
    }

    /// Returns all mappings intersecting `[laddr, laddr + len)`.
    #[must_use]
    pub fn lookup(&self, laddr: Laddr, len: u32) -> Vec<LbaEntry> {
        let end = laddr.as_u64().saturating_add(u64::from(len));
        self.state.read().tree.range(laddr.as_u64(), end)
    }

    /// Returns all mappings intersecting the range as of `snapshot`.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the range was changed by a commit newer than
    /// the snapshot: the snapshot's view can no longer be served.
    pub fn lookup_at(
        &self,
        laddr: Laddr,
        len: u32,
        snapshot: Generation,
    ) -> CoreResult<Vec<LbaEntry>> {
        let start = laddr.as_u64();
        let end = start.saturating_add(u64::from(len));
        let state = self.state.read();

        let entries = state.tree.range(start, end);
        if let Some(newer) = entries.iter().find(|e| e.generation > snapshot) {
            return Err(CoreError::conflict(format!(
                "{} changed at {} after snapshot {snapshot}",
                newer.laddr, newer.generation
            )));
        }
        if let Some((retired_at, generation)) = Self::newer_retired(&state, start, end, snapshot) {
            return Err(CoreError::conflict(format!(
                "{retired_at} removed at {generation} after snapshot {snapshot}"
            )));
        }
        Ok(entries)
    }

    /// Returns the mapping starting exactly at `laddr`.
    #[must_use]
    pub fn get(&self, laddr: Laddr) -> Option<LbaEntry> {
        self.state.read().tree.get(laddr).copied()
    }

    /// Returns the mapping starting exactly at `laddr` as of `snapshot`.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the mapping was changed or removed after the
    /// snapshot.
    pub fn get_at(&self, laddr: Laddr, snapshot: Generation) -> CoreResult<Option<LbaEntry>> {
        let state = self.state.read();
        match state.tree.get(laddr) {
            Some(entry) if entry.generation > snapshot => Err(CoreError::conflict(format!(
                "{laddr} changed at {} after snapshot {snapshot}",
                entry.generation
            ))),
            Some(entry) => Ok(Some(*entry)),
            None => match state.retired.get(&laddr) {
                Some(retired) if retired.generation > snapshot => {
                    Err(CoreError::conflict(format!(
                        "{laddr} removed at {} after snapshot {snapshot}",
                        retired.generation
                    )))
                }
                _ => Ok(None),
            },
        }
    }

    /// Points an existing mapping at new content.
    ///
    /// Returns the previous entry.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if nothing is mapped at `laddr`.
    pub fn remap(&self, laddr: Laddr, paddr: Paddr, generation: Generation) -> CoreResult<LbaEntry> {
        let mut state = self.state.write();
        let entry = state
            .tree
            .get_mut(laddr)
            .ok_or_else(|| CoreError::not_found(laddr))?;
        let previous = *entry;
        entry.paddr = paddr;
        entry.generation = generation;
        Ok(previous)
    }

    /// Moves a mapping from `expected` to `paddr` without a logical change.
    ///
    /// Returns the previous entry, or `None` if the mapping no longer points
    /// at `expected`.
    pub fn relocate(&self, laddr: Laddr, expected: Paddr, paddr: Paddr) -> Option<LbaEntry> {
        let mut state = self.state.write();
        let entry = state.tree.get_mut(laddr)?;
        if entry.paddr != expected {
            return None;
        }
        let previous = *entry;
        entry.paddr = paddr;
        Some(previous)
    }

    /// Adjusts the refcount of the mapping at `laddr` and returns the new count.
    ///
    /// Reaching zero removes the mapping and leaves a retired marker.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if nothing is mapped, or `InvalidOperation` if the
    /// count would underflow.
    pub fn adjust_ref(&self, laddr: Laddr, delta: i64, generation: Generation) -> CoreResult<u32> {
        let mut state = self.state.write();
        Self::adjust_ref_locked(&mut state, laddr, delta, generation).map(|(count, _)| count)
    }

    /// Removes the mapping at `laddr` regardless of its refcount.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if nothing is mapped at `laddr`.
    pub fn remove(&self, laddr: Laddr, generation: Generation) -> CoreResult<LbaEntry> {
        let mut state = self.state.write();
        let entry = state
            .tree
            .remove(laddr)
            .ok_or_else(|| CoreError::not_found(laddr))?;
        state.retired.insert(
            laddr,
            Retired {
                len: entry.len,
                generation,
            },
        );
        Ok(entry)
    }

    /// Finds the first free range of `len` bytes at or after `hint`.
    ///
    /// The search sees the mapping the way a transaction with `snapshot`
    /// would: mappings in `exclude` are treated as free (the transaction
    /// is removing them), ranges in `pending` as taken (the transaction is
    /// allocating them), and ranges removed after the snapshot as taken.
    #[must_use]
    pub fn find_free(
        &self,
        hint: Laddr,
        len: u32,
        snapshot: Generation,
        exclude: &BTreeSet<Laddr>,
        pending: &[(Laddr, u32)],
    ) -> Option<Laddr> {
        if len == 0 {
            return None;
        }
        let state = self.state.read();
        let mut candidate = hint.as_u64();
        loop {
            let end = candidate.checked_add(u64::from(len))?;

            let mut blocked_until = state
                .tree
                .range(candidate, end)
                .iter()
                .filter(|e| !exclude.contains(&e.laddr))
                .map(LbaEntry::end)
                .max();

            let retired_end = state
                .retired
                .range(..Laddr::new(end))
                .filter(|(laddr, r)| {
                    r.generation > snapshot
                        && laddr.as_u64() + u64::from(r.len) > candidate
                })
                .map(|(laddr, r)| laddr.as_u64() + u64::from(r.len))
                .max();
            blocked_until = blocked_until.max(retired_end);

            let pending_end = pending
                .iter()
                .filter(|(laddr, plen)| {
                    laddr.as_u64() < end && laddr.as_u64() + u64::from(*plen) > candidate
                })
                .map(|(laddr, plen)| laddr.as_u64() + u64::from(*plen))
                .max();
            blocked_until = blocked_until.max(pending_end);

            match blocked_until {
                Some(next) => candidate = next,
                None => return Some(Laddr::new(candidate)),
            }
        }
    }

    /// Returns every mapping in address order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LbaEntry> {
        self.state.read().tree.iter().copied().collect()
    }

    /// Replaces the whole mapping with `entries`.
    ///
    /// # Errors
    ///
    /// Returns `Overlap` if the entries intersect each other.
    pub fn restore(&self, entries: &[LbaEntry]) -> CoreResult<()> {
        let mut state = self.state.write();
        state.tree.clear();
        state.retired.clear();
        for entry in entries {
            state.tree.insert(*entry)?;
        }
        Ok(())
    }

    /// Returns live bytes per segment.
    #[must_use]
    pub fn segment_usage(&self) -> HashMap<SegmentId, u64> {
        let state = self.state.read();
        let mut usage = HashMap::new();
        for entry in state.tree.iter() {
            *usage.entry(entry.paddr.segment).or_insert(0) += u64::from(entry.len);
        }
        usage
    }

    /// Returns the mappings whose content lives in `segment`.
    #[must_use]
    pub fn entries_in_segment(&self, segment: SegmentId) -> Vec<LbaEntry> {
        self.state
            .read()
            .tree
            .iter()
            .filter(|e| e.paddr.segment == segment)
            .copied()
            .collect()
    }

    /// Drops retired markers no transaction can observe any more.
    ///
    /// Returns the number of markers dropped.
    pub fn prune_retired(&self, oldest_snapshot: Generation) -> usize {
        let mut state = self.state.write();
        let before = state.retired.len();
        state.retired.retain(|_, r| r.generation > oldest_snapshot);
        before - state.retired.len()
    }

    /// Checks the structural invariants of the index.
    ///
    /// # Errors
    ///
    /// Returns a corruption error describing the first violation.
    pub fn check_invariants(&self) -> CoreResult<()> {
        self.state.read().tree.check_invariants()
    }

    /// Applies the deltas of one commit record.
    ///
    /// New content locations are resolved against `block_base`, the
    /// physical address of the record's block area, and must lie inside
    /// its `block_len` bytes. Changed entries take `generation`, except
    /// for relocations, which are not logical changes.
    ///
    /// # Errors
    ///
    /// Returns the first delta that cannot be applied. Earlier deltas stay
    /// applied; callers treat a failure here as fatal.
    pub fn apply_commit(
        &self,
        deltas: &[Delta],
        block_base: Paddr,
        block_len: u32,
        generation: Generation,
    ) -> CoreResult<AppliedCommit> {
        let mut state = self.state.write();
        let mut applied = AppliedCommit::default();

        let locate = |laddr: Laddr, block_offset: u32, len: u32| -> CoreResult<Paddr> {
            if u64::from(block_offset) + u64::from(len) > u64::from(block_len) {
                return Err(CoreError::corruption(format!(
                    "content for {laddr} lies outside the record block area"
                )));
            }
            Ok(block_base.add(block_offset))
        };

        for delta in deltas {
            match *delta {
                Delta::Alloc {
                    laddr,
                    len,
                    refcount,
                    block_offset,
                } => {
                    if refcount == 0 {
                        return Err(CoreError::invalid_operation(format!(
                            "allocation of {laddr} with zero refcount"
                        )));
                    }
                    let entry = LbaEntry {
                        laddr,
                        len,
                        paddr: locate(laddr, block_offset, len)?,
                        refcount,
                        generation,
                    };
                    state.tree.insert(entry)?;
                    applied.written.push(entry);
                }
                Delta::Remap {
                    laddr,
                    block_offset,
                } => {
                    let len = state
                        .tree
                        .get(laddr)
                        .map(|e| e.len)
                        .ok_or_else(|| CoreError::not_found(laddr))?;
                    let paddr = locate(laddr, block_offset, len)?;
                    if let Some(entry) = state.tree.get_mut(laddr) {
                        applied.superseded.push((entry.paddr, entry.len));
                        entry.paddr = paddr;
                        entry.generation = generation;
                        applied.written.push(*entry);
                    }
                }
                Delta::Relocate {
                    laddr,
                    expected,
                    block_offset,
                } => {
                    let current = state.tree.get(laddr).copied();
                    match current {
                        Some(entry) if entry.paddr == expected => {
                            let paddr = locate(laddr, block_offset, entry.len)?;
                            if let Some(live) = state.tree.get_mut(laddr) {
                                live.paddr = paddr;
                                applied.superseded.push((expected, entry.len));
                                applied.written.push(*live);
                            }
                        }
                        _ => applied.skipped_relocations += 1,
                    }
                }
                Delta::AdjustRef { laddr, delta } => {
                    let (_, removed) =
                        Self::adjust_ref_locked(&mut state, laddr, i64::from(delta), generation)?;
                    if let Some(entry) = removed {
                        applied.superseded.push((entry.paddr, entry.len));
                        applied.removed.push(entry);
                    }
                }
            }
        }
        Ok(applied)
    }

    fn adjust_ref_locked(
        state: &mut LbaState,
        laddr: Laddr,
        delta: i64,
        generation: Generation,
    ) -> CoreResult<(u32, Option<LbaEntry>)> {
        let entry = state
            .tree
            .get_mut(laddr)
            .ok_or_else(|| CoreError::not_found(laddr))?;
        let count = i64::from(entry.refcount) + delta;
        if count < 0 {
            return Err(CoreError::invalid_operation(format!(
                "refcount of {laddr} would drop below zero"
            )));
        }
        let count = u32::try_from(count).map_err(|_| {
            CoreError::invalid_operation(format!("refcount of {laddr} overflows"))
        })?;

        if count > 0 {
            entry.refcount = count;
            entry.generation = generation;
            return Ok((count, None));
        }

        let removed = state.tree.remove(laddr);
        if let Some(entry) = removed {
            state.retired.insert(
                laddr,
                Retired {
                    len: entry.len,
                    generation,
                },
            );
        }
        Ok((0, removed))
    }

    fn newer_retired(
        state: &LbaState,
        start: u64,
        end: u64,
        snapshot: Generation,
    ) -> Option<(Laddr, Generation)> {
        state
            .retired
            .range(..Laddr::new(end))
            .find(|(laddr, r)| {
                r.generation > snapshot && laddr.as_u64() + u64::from(r.len) > start
            })
            .map(|(laddr, r)| (*laddr, r.generation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paddr(offset: u32) -> Paddr {
        Paddr::new(SegmentId::new(1), offset)
    }

    fn entry(laddr: u64, len: u32, generation: u64) -> LbaEntry {
        LbaEntry {
            laddr: Laddr::new(laddr),
            len,
            paddr: paddr(64),
            refcount: 1,
            generation: Generation::new(generation),
        }
    }

    fn manager() -> LbaManager {
        LbaManager::new(4, 4)
    }

    #[test]
    fn lookup_at_rejects_newer_entries() {
        let lba = manager();
        lba.insert(entry(0x1000, 0x1000, 3)).unwrap();

        assert_eq!(lba.lookup_at(Laddr::new(0x1000), 0x1000, Generation::new(3)).unwrap().len(), 1);
        assert!(matches!(
            lba.lookup_at(Laddr::new(0x1800), 0x10, Generation::new(2)),
            Err(CoreError::Conflict { .. })
        ));
    }

    #[test]
    fn removal_leaves_retired_marker() {
        let lba = manager();
        lba.insert(entry(0x1000, 0x1000, 1)).unwrap();
        assert_eq!(lba.adjust_ref(Laddr::new(0x1000), -1, Generation::new(5)).unwrap(), 0);
        assert!(lba.get(Laddr::new(0x1000)).is_none());

        // A snapshot from before the removal can no longer be served
        assert!(lba.get_at(Laddr::new(0x1000), Generation::new(4)).is_err());
        assert!(lba.lookup_at(Laddr::new(0x1000), 8, Generation::new(4)).is_err());
        // A newer one sees the range as empty
        assert_eq!(lba.get_at(Laddr::new(0x1000), Generation::new(5)).unwrap(), None);

        assert_eq!(lba.prune_retired(Generation::new(5)), 1);
        assert!(lba.get_at(Laddr::new(0x1000), Generation::new(4)).unwrap().is_none());
    }

    #[test]
    fn adjust_ref_underflow_rejected() {
        let lba = manager();
        lba.insert(entry(0, 16, 1)).unwrap();
        assert!(matches!(
            lba.adjust_ref(Laddr::new(0), -2, Generation::new(2)),
            Err(CoreError::InvalidOperation { .. })
        ));
        assert!(matches!(
            lba.adjust_ref(Laddr::new(16), 1, Generation::new(2)),
            Err(CoreError::NotFound { .. })
        ));
        assert_eq!(lba.adjust_ref(Laddr::new(0), 2, Generation::new(2)).unwrap(), 3);
    }

    #[test]
    fn find_free_skips_taken_ranges() {
        let lba = manager();
        lba.insert(entry(0, 0x1000, 1)).unwrap();
        lba.insert(entry(0x1000, 0x1000, 1)).unwrap();
        lba.insert(entry(0x3000, 0x1000, 1)).unwrap();
        let none = BTreeSet::new();
        let g = Generation::new(1);

        assert_eq!(lba.find_free(Laddr::new(0), 0x1000, g, &none, &[]), Some(Laddr::new(0x2000)));
        assert_eq!(lba.find_free(Laddr::new(0), 0x1001, g, &none, &[]), Some(Laddr::new(0x4000)));
        assert_eq!(
            lba.find_free(Laddr::new(0), 0x1000, g, &none, &[(Laddr::new(0x2000), 0x10)]),
            Some(Laddr::new(0x4000))
        );

        let exclude: BTreeSet<_> = [Laddr::new(0x1000)].into_iter().collect();
        assert_eq!(lba.find_free(Laddr::new(0), 0x1000, g, &exclude, &[]), Some(Laddr::new(0x1000)));
    }

    #[test]
    fn find_free_respects_newer_retired_ranges() {
        let lba = manager();
        lba.insert(entry(0, 0x1000, 1)).unwrap();
        lba.remove(Laddr::new(0), Generation::new(2)).unwrap();
        let none = BTreeSet::new();

        assert_eq!(
            lba.find_free(Laddr::new(0), 0x10, Generation::new(1), &none, &[]),
            Some(Laddr::new(0x1000))
        );
        assert_eq!(
            lba.find_free(Laddr::new(0), 0x10, Generation::new(2), &none, &[]),
            Some(Laddr::new(0))
        );
    }

    #[test]
    fn find_free_overflow_is_none() {
        let lba = manager();
        let none = BTreeSet::new();
        assert_eq!(lba.find_free(Laddr::new(u64::MAX - 4), 8, Generation::new(0), &none, &[]), None);
    }

    #[test]
    fn apply_commit_resolves_block_offsets() {
        let lba = manager();
        lba.insert(entry(0x8000, 4, 1)).unwrap();
        let base = Paddr::new(SegmentId::new(2), 200);

        let applied = lba
            .apply_commit(
                &[
                    Delta::Alloc {
                        laddr: Laddr::new(0x1000),
                        len: 8,
                        refcount: 1,
                        block_offset: 0,
                    },
                    Delta::Remap {
                        laddr: Laddr::new(0x8000),
                        block_offset: 8,
                    },
                ],
                base,
                12,
                Generation::new(2),
            )
            .unwrap();

        assert_eq!(applied.written.len(), 2);
        assert_eq!(applied.superseded, vec![(paddr(64), 4)]);
        assert_eq!(lba.get(Laddr::new(0x1000)).unwrap().paddr, base);
        let remapped = lba.get(Laddr::new(0x8000)).unwrap();
        assert_eq!(remapped.paddr, base.add(8));
        assert_eq!(remapped.generation, Generation::new(2));
    }

    #[test]
    fn apply_commit_skips_stale_relocation() {
        let lba = manager();
        lba.insert(entry(0, 4, 1)).unwrap();
        let applied = lba
            .apply_commit(
                &[Delta::Relocate {
                    laddr: Laddr::new(0),
                    expected: paddr(999),
                    block_offset: 0,
                }],
                Paddr::new(SegmentId::new(3), 20),
                4,
                Generation::new(2),
            )
            .unwrap();
        assert_eq!(applied.skipped_relocations, 1);
        assert_eq!(lba.get(Laddr::new(0)).unwrap().paddr, paddr(64));
    }

    #[test]
    fn relocation_keeps_generation() {
        let lba = manager();
        lba.insert(entry(0, 4, 1)).unwrap();
        let target = Paddr::new(SegmentId::new(3), 20);
        lba.apply_commit(
            &[Delta::Relocate {
                laddr: Laddr::new(0),
                expected: paddr(64),
                block_offset: 0,
            }],
            target,
            4,
            Generation::new(7),
        )
        .unwrap();
        let moved = lba.get(Laddr::new(0)).unwrap();
        assert_eq!(moved.paddr, target);
        assert_eq!(moved.generation, Generation::new(1));
    }

    #[test]
    fn apply_commit_rejects_content_outside_block_area() {
        let lba = manager();
        let result = lba.apply_commit(
            &[Delta::Alloc {
                laddr: Laddr::new(0),
                len: 16,
                refcount: 1,
                block_offset: 8,
            }],
            paddr(100),
            16,
            Generation::new(1),
        );
        assert!(matches!(result, Err(CoreError::Corruption { .. })));
    }

    #[test]
    fn segment_usage_sums_live_bytes() {
        let lba = manager();
        lba.insert(entry(0, 100, 1)).unwrap();
        lba.insert(entry(100, 50, 1)).unwrap();
        let mut other = entry(200, 10, 1);
        other.paddr = Paddr::new(SegmentId::new(4), 0);
        lba.insert(other).unwrap();

        let usage = lba.segment_usage();
        assert_eq!(usage[&SegmentId::new(1)], 150);
        assert_eq!(usage[&SegmentId::new(4)], 10);
        assert_eq!(lba.entries_in_segment(SegmentId::new(4)), vec![other]);
    }

    #[test]
    fn restore_replaces_contents() {
        let lba = manager();
        lba.insert(entry(0, 4, 1)).unwrap();
        let entries: Vec<_> = (0..20).map(|i| entry(i * 16, 16, 2)).collect();
        lba.restore(&entries).unwrap();
        assert_eq!(lba.snapshot(), entries);
        lba.check_invariants().unwrap();
    }
}
