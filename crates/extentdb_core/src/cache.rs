//! Extent cache.
//!
//! Holds committed extent content keyed by physical address, tracks which
//! extents are dirty (committed since the last checkpoint, so their
//! durability rests on journal replay) and which committed extents are
//! claimed by an in-flight transaction.
//!
//! ## Invariants
//!
//! - Content at a physical address never changes while it is cached; a
//!   mutation lands at a new address and the old one is invalidated
//! - Dirty extents are never evicted
//! - A committed extent is claimed by at most one transaction at a time
//! - A foreground claim takes over a background claim; the background
//!   transaction learns of the loss through [`Cache::take_preempted`]

use crate::error::{CoreError, CoreResult};
use crate::stats::StoreStats;
use crate::types::{Laddr, Paddr, SegmentId, TransactionId};
use bytes::Bytes;
use extentdb_device::SegmentManager;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug)]
struct CachedExtent {
    paddr: Paddr,
    data: Bytes,
    /// Position in the LRU order; `None` while dirty.
    lru_tick: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Claim {
    owner: TransactionId,
    preemptible: bool,
}

#[derive(Debug, Default)]
struct Claims {
    held: HashMap<Laddr, Claim>,
    /// Background transactions that lost extents to a foreground claim.
    preempted: HashMap<TransactionId, Vec<Laddr>>,
}

impl Claims {
    fn claim(&mut self, txid: TransactionId, laddr: Laddr, preemptible: bool) -> CoreResult<()> {
        match self.held.get_mut(&laddr) {
            Some(claim) if claim.owner == txid => Ok(()),
            Some(claim) if claim.preemptible && !preemptible => {
                let loser = claim.owner;
                *claim = Claim {
                    owner: txid,
                    preemptible,
                };
                self.preempted.entry(loser).or_default().push(laddr);
                debug!(%laddr, from = %loser, to = %txid, "claim preempted");
                Ok(())
            }
            Some(claim) => Err(CoreError::conflict(format!(
                "{laddr} is held by {}",
                claim.owner
            ))),
            None => {
                self.held.insert(
                    laddr,
                    Claim {
                        owner: txid,
                        preemptible,
                    },
                );
                Ok(())
            }
        }
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    slots: Vec<Option<CachedExtent>>,
    free_slots: Vec<usize>,
    by_paddr: HashMap<Paddr, usize>,
    lru: BTreeMap<u64, usize>,
    tick: u64,
    clean_bytes: usize,
    /// Extents committed since the last checkpoint, resident or not.
    dirty: HashMap<Paddr, u32>,
}

impl CacheInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, slot: usize) {
        let tick = self.next_tick();
        if let Some(extent) = self.slots[slot].as_mut() {
            // dirty extents stay out of the LRU
            if let Some(old) = extent.lru_tick {
                extent.lru_tick = Some(tick);
                self.lru.remove(&old);
                self.lru.insert(tick, slot);
            }
        }
    }

    fn insert(&mut self, paddr: Paddr, data: Bytes) -> usize {
        if let Some(&slot) = self.by_paddr.get(&paddr) {
            self.remove_slot(slot);
        }
        let dirty = self.dirty.contains_key(&paddr);
        let lru_tick = if dirty { None } else { Some(self.next_tick()) };
        if !dirty {
            self.clean_bytes += data.len();
        }

        let extent = CachedExtent {
            paddr,
            data,
            lru_tick,
        };
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot] = Some(extent);
                slot
            }
            None => {
                self.slots.push(Some(extent));
                self.slots.len() - 1
            }
        };
        self.by_paddr.insert(paddr, slot);
        if let Some(tick) = lru_tick {
            self.lru.insert(tick, slot);
        }
        slot
    }

    fn remove_slot(&mut self, slot: usize) -> Option<CachedExtent> {
        let extent = self.slots[slot].take()?;
        self.by_paddr.remove(&extent.paddr);
        if let Some(tick) = extent.lru_tick {
            self.lru.remove(&tick);
            self.clean_bytes -= extent.data.len();
        }
        self.free_slots.push(slot);
        Some(extent)
    }

    fn evict_to(&mut self, capacity: usize) -> usize {
        let mut evicted = 0;
        while self.clean_bytes > capacity {
            let Some((_, slot)) = self.lru.pop_first() else {
                break;
            };
            // the LRU entry is already gone; clear the tick so remove_slot
            // only adjusts the byte count
            if let Some(extent) = self.slots[slot].as_mut() {
                if extent.lru_tick.take().is_some() {
                    self.clean_bytes -= extent.data.len();
                }
            }
            self.remove_slot(slot);
            evicted += 1;
        }
        evicted
    }
}

/// In-memory extent cache shared by all transactions.
pub struct Cache {
    device: Arc<dyn SegmentManager>,
    inner: Mutex<CacheInner>,
    claims: Mutex<Claims>,
    capacity_bytes: usize,
    stats: Arc<StoreStats>,
}

impl Cache {
    /// Creates an empty cache that keeps at most `capacity_bytes` of clean
    /// content.
    pub fn new(
        device: Arc<dyn SegmentManager>,
        capacity_bytes: usize,
        stats: Arc<StoreStats>,
    ) -> Self {
        Self {
            device,
            inner: Mutex::new(CacheInner::default()),
            claims: Mutex::new(Claims::default()),
            capacity_bytes,
            stats,
        }
    }

    /// Returns the content at `paddr`, loading it from the device on a miss.
    ///
    /// The cache lock is not held during the device read.
    ///
    /// # Errors
    ///
    /// Returns the device error if the load fails.
    pub fn get_or_load(&self, paddr: Paddr, len: u32) -> CoreResult<Bytes> {
        {
            let mut inner = self.inner.lock();
            if let Some(&slot) = inner.by_paddr.get(&paddr) {
                inner.touch(slot);
                if let Some(extent) = inner.slots[slot].as_ref() {
                    if extent.data.len() == len as usize {
                        self.stats.record_cache_hit();
                        return Ok(extent.data.clone());
                    }
                }
            }
        }

        self.stats.record_cache_miss();
        let data = Bytes::from(self.device.read(paddr.segment, paddr.offset, len as usize)?);
        trace!(%paddr, len, "loaded extent");

        let mut inner = self.inner.lock();
        inner.insert(paddr, data.clone());
        let evicted = inner.evict_to(self.capacity_bytes);
        drop(inner);
        if evicted > 0 {
            self.stats.record_cache_evictions(evicted as u64);
        }
        Ok(data)
    }

    /// Returns the cached content at `paddr` without touching the device.
    #[must_use]
    pub fn get(&self, paddr: Paddr) -> Option<Bytes> {
        let inner = self.inner.lock();
        let slot = *inner.by_paddr.get(&paddr)?;
        inner.slots[slot].as_ref().map(|e| e.data.clone())
    }

    /// Claims the committed extent at `laddr` for foreground transaction
    /// `txid`.
    ///
    /// Claiming an extent the transaction already holds is a no-op. A
    /// background claim on the extent is taken over.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if another foreground transaction holds the extent.
    pub fn add_to_transaction(&self, txid: TransactionId, laddr: Laddr) -> CoreResult<()> {
        self.claims.lock().claim(txid, laddr, false)
    }

    /// Claims the committed extent at `laddr` for background transaction
    /// `txid`. A later foreground claim takes the extent away.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if any other transaction holds the extent.
    pub fn add_to_background_transaction(
        &self,
        txid: TransactionId,
        laddr: Laddr,
    ) -> CoreResult<()> {
        self.claims.lock().claim(txid, laddr, true)
    }

    /// Returns the extents taken from background transaction `txid` since
    /// the last call.
    pub fn take_preempted(&self, txid: TransactionId) -> Vec<Laddr> {
        self.claims
            .lock()
            .preempted
            .remove(&txid)
            .unwrap_or_default()
    }

    /// Returns the transaction holding `laddr`, if any.
    #[must_use]
    pub fn claimed_by(&self, laddr: Laddr) -> Option<TransactionId> {
        self.claims.lock().held.get(&laddr).map(|claim| claim.owner)
    }

    /// Drops every claim held by `txid`.
    pub fn release_transaction(&self, txid: TransactionId) {
        let mut claims = self.claims.lock();
        claims.held.retain(|_, claim| claim.owner != txid);
        claims.preempted.remove(&txid);
    }

    /// Returns the number of claimed extents.
    #[must_use]
    pub fn claim_count(&self) -> usize {
        self.claims.lock().held.len()
    }

    /// Publishes a commit: `written` content becomes dirty and resident,
    /// `superseded` locations are forgotten.
    pub fn commit(&self, written: &[(Paddr, Bytes)], superseded: &[Paddr]) {
        let mut inner = self.inner.lock();
        for paddr in superseded {
            inner.dirty.remove(paddr);
            if let Some(&slot) = inner.by_paddr.get(paddr) {
                inner.remove_slot(slot);
            }
        }
        for (paddr, data) in written {
            let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
            inner.dirty.insert(*paddr, len);
            inner.insert(*paddr, data.clone());
        }
    }

    /// Records a dirty extent without content, as found by replay.
    pub fn mark_dirty(&self, paddr: Paddr, len: u32) {
        self.inner.lock().dirty.insert(paddr, len);
    }

    /// Marks every dirty extent clean after a checkpoint and evicts down to
    /// capacity.
    pub fn mark_clean(&self) {
        let mut inner = self.inner.lock();
        inner.dirty.clear();
        let dirty_slots: Vec<usize> = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.as_ref().is_some_and(|e| e.lru_tick.is_none()))
            .map(|(index, _)| index)
            .collect();
        for slot in dirty_slots {
            let tick = inner.next_tick();
            let Some(extent) = inner.slots[slot].as_mut() else {
                continue;
            };
            extent.lru_tick = Some(tick);
            let len = extent.data.len();
            inner.clean_bytes += len;
            inner.lru.insert(tick, slot);
        }
        let evicted = inner.evict_to(self.capacity_bytes);
        drop(inner);
        if evicted > 0 {
            self.stats.record_cache_evictions(evicted as u64);
        }
    }

    /// Evicts cold clean extents until clean content fits the capacity.
    ///
    /// Returns the number of extents evicted.
    pub fn evict(&self) -> usize {
        let evicted = self.inner.lock().evict_to(self.capacity_bytes);
        if evicted > 0 {
            self.stats.record_cache_evictions(evicted as u64);
        }
        evicted
    }

    /// Evicts every clean extent. Returns the number evicted.
    pub fn evict_all_clean(&self) -> usize {
        let evicted = self.inner.lock().evict_to(0);
        if evicted > 0 {
            self.stats.record_cache_evictions(evicted as u64);
        }
        evicted
    }

    /// Drops all cached content and dirty state for a released segment.
    pub fn invalidate_segment(&self, segment: SegmentId) {
        let mut inner = self.inner.lock();
        inner.dirty.retain(|paddr, _| paddr.segment != segment);
        let slots: Vec<usize> = inner
            .by_paddr
            .iter()
            .filter(|(paddr, _)| paddr.segment == segment)
            .map(|(_, slot)| *slot)
            .collect();
        for slot in slots {
            inner.remove_slot(slot);
        }
    }

    /// Drops all content, dirty state and claims.
    pub fn clear(&self) {
        *self.inner.lock() = CacheInner::default();
        *self.claims.lock() = Claims::default();
    }

    /// Returns the number of dirty extents.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.inner.lock().dirty.len()
    }

    /// Returns true if the extent at `paddr` is dirty.
    #[must_use]
    pub fn is_dirty(&self, paddr: Paddr) -> bool {
        self.inner.lock().dirty.contains_key(&paddr)
    }

    /// Returns the number of resident extents.
    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.inner.lock().by_paddr.len()
    }

    /// Returns the bytes of clean resident content.
    #[must_use]
    pub fn clean_bytes(&self) -> usize {
        self.inner.lock().clean_bytes
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Cache")
            .field("resident", &inner.by_paddr.len())
            .field("dirty", &inner.dirty.len())
            .field("clean_bytes", &inner.clean_bytes)
            .field("capacity_bytes", &self.capacity_bytes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extentdb_device::{DeviceConfig, EphemeralSegmentManager};

    fn cache(capacity: usize) -> (Arc<EphemeralSegmentManager>, Cache, Arc<StoreStats>) {
        let device = Arc::new(EphemeralSegmentManager::initialized(
            DeviceConfig::new().segment_size(4096).num_segments(4),
        ));
        let stats = Arc::new(StoreStats::new());
        let cache = Cache::new(device.clone(), capacity, stats.clone());
        (device, cache, stats)
    }

    fn paddr(segment: u32, offset: u32) -> Paddr {
        Paddr::new(SegmentId::new(segment), offset)
    }

    #[test]
    fn miss_then_hit() {
        let (device, cache, stats) = cache(1024);
        device.write(SegmentId::new(1), 100, b"abcd").unwrap();

        assert_eq!(cache.get_or_load(paddr(1, 100), 4).unwrap(), &b"abcd"[..]);
        assert_eq!(cache.get_or_load(paddr(1, 100), 4).unwrap(), &b"abcd"[..]);
        assert_eq!(stats.cache_misses(), 1);
        assert_eq!(stats.cache_hits(), 1);
    }

    #[test]
    fn clean_extents_evicted_in_lru_order() {
        let (_, cache, stats) = cache(8);
        cache.get_or_load(paddr(1, 0), 4).unwrap();
        cache.get_or_load(paddr(1, 4), 4).unwrap();
        // touch the first so the second is coldest
        cache.get_or_load(paddr(1, 0), 4).unwrap();
        cache.get_or_load(paddr(1, 8), 4).unwrap();

        assert!(cache.get(paddr(1, 0)).is_some());
        assert!(cache.get(paddr(1, 4)).is_none());
        assert!(cache.get(paddr(1, 8)).is_some());
        assert_eq!(stats.cache_evictions(), 1);
    }

    #[test]
    fn dirty_extents_never_evicted() {
        let (_, cache, _) = cache(0);
        cache.commit(&[(paddr(2, 0), Bytes::from_static(b"dirty"))], &[]);
        assert_eq!(cache.evict(), 0);
        assert_eq!(cache.evict_all_clean(), 0);
        assert_eq!(cache.get(paddr(2, 0)).unwrap(), &b"dirty"[..]);
        assert_eq!(cache.dirty_count(), 1);

        cache.mark_clean();
        assert_eq!(cache.dirty_count(), 0);
        assert!(cache.get(paddr(2, 0)).is_none());
    }

    #[test]
    fn commit_invalidates_superseded() {
        let (_, cache, _) = cache(1024);
        cache.commit(&[(paddr(1, 0), Bytes::from_static(b"old"))], &[]);
        cache.commit(&[(paddr(1, 64), Bytes::from_static(b"new"))], &[paddr(1, 0)]);
        assert!(cache.get(paddr(1, 0)).is_none());
        assert!(!cache.is_dirty(paddr(1, 0)));
        assert!(cache.is_dirty(paddr(1, 64)));
    }

    #[test]
    fn claims_are_exclusive() {
        let (_, cache, _) = cache(1024);
        let t1 = TransactionId::new(1);
        let t2 = TransactionId::new(2);
        let laddr = Laddr::new(0x1000);

        cache.add_to_transaction(t1, laddr).unwrap();
        cache.add_to_transaction(t1, laddr).unwrap();
        assert!(matches!(
            cache.add_to_transaction(t2, laddr),
            Err(CoreError::Conflict { .. })
        ));

        cache.release_transaction(t1);
        cache.add_to_transaction(t2, laddr).unwrap();
        assert_eq!(cache.claimed_by(laddr), Some(t2));
    }

    #[test]
    fn foreground_claim_preempts_background() {
        let (_, cache, _) = cache(1024);
        let cleaner = TransactionId::new(1);
        let client = TransactionId::new(2);
        let other = TransactionId::new(3);
        let taken = Laddr::new(0x1000);
        let kept = Laddr::new(0x2000);

        cache.add_to_background_transaction(cleaner, taken).unwrap();
        cache.add_to_background_transaction(cleaner, kept).unwrap();
        cache.add_to_transaction(client, taken).unwrap();
        assert_eq!(cache.claimed_by(taken), Some(client));
        assert_eq!(cache.claimed_by(kept), Some(cleaner));

        // a background claim never takes from anyone
        assert!(matches!(
            cache.add_to_background_transaction(other, taken),
            Err(CoreError::Conflict { .. })
        ));
        assert!(matches!(
            cache.add_to_background_transaction(other, kept),
            Err(CoreError::Conflict { .. })
        ));

        assert_eq!(cache.take_preempted(cleaner), vec![taken]);
        assert!(cache.take_preempted(cleaner).is_empty());

        // the client's claim survives the cleaner's release
        cache.release_transaction(cleaner);
        assert_eq!(cache.claimed_by(taken), Some(client));
        assert_eq!(cache.claimed_by(kept), None);
    }

    #[test]
    fn release_forgets_preempted_extents() {
        let (_, cache, _) = cache(1024);
        let cleaner = TransactionId::new(1);
        let laddr = Laddr::new(0x1000);

        cache.add_to_background_transaction(cleaner, laddr).unwrap();
        cache.add_to_transaction(TransactionId::new(2), laddr).unwrap();
        cache.release_transaction(cleaner);
        assert!(cache.take_preempted(cleaner).is_empty());
    }

    #[test]
    fn invalidate_segment_drops_dirty_and_resident() {
        let (_, cache, _) = cache(1024);
        cache.commit(&[(paddr(1, 0), Bytes::from_static(b"a"))], &[]);
        cache.mark_dirty(paddr(1, 32), 4);
        cache.commit(&[(paddr(2, 0), Bytes::from_static(b"b"))], &[]);

        cache.invalidate_segment(SegmentId::new(1));
        assert_eq!(cache.dirty_count(), 1);
        assert_eq!(cache.resident_count(), 1);
        assert!(cache.get(paddr(2, 0)).is_some());
    }
}
