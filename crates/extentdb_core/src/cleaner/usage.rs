//! Segment usage table and victim selection.

use crate::types::SegmentId;
use std::fmt;

/// Lifecycle state of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Holds the superblock; never used by the journal.
    Reserved,
    /// Free for the journal to open.
    Empty,
    /// The journal is appending to it.
    Open,
    /// Fully written; a cleaning candidate once behind the checkpoint.
    Closed,
}

/// Usage of one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    /// The segment.
    pub segment: SegmentId,
    /// Lifecycle state.
    pub state: SegmentState,
    /// Position in the journal chain; 0 while empty.
    pub segment_seq: u64,
    /// Bytes of extent content still referenced by the LBA.
    pub live_bytes: u64,
    /// Bytes written by the journal, header included.
    pub written_bytes: u32,
}

impl SegmentInfo {
    fn empty(segment: SegmentId) -> Self {
        Self {
            segment,
            state: SegmentState::Empty,
            segment_seq: 0,
            live_bytes: 0,
            written_bytes: 0,
        }
    }
}

impl fmt::Display for SegmentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} seq {} live {} written {}",
            self.segment, self.state, self.segment_seq, self.live_bytes, self.written_bytes
        )
    }
}

/// Per-segment usage for every segment on the device.
#[derive(Debug, Clone)]
pub struct UsageTable {
    segments: Vec<SegmentInfo>,
    segment_size: u32,
}

impl UsageTable {
    /// Creates a table with segment 0 reserved and every other segment empty.
    #[must_use]
    pub fn new(num_segments: u32, segment_size: u32) -> Self {
        let segments = (0..num_segments)
            .map(|id| {
                let mut info = SegmentInfo::empty(SegmentId::new(id));
                if id == 0 {
                    info.state = SegmentState::Reserved;
                }
                info
            })
            .collect();
        Self {
            segments,
            segment_size,
        }
    }

    /// Returns the usage of `segment`.
    #[must_use]
    pub fn get(&self, segment: SegmentId) -> Option<&SegmentInfo> {
        self.segments.get(segment.index())
    }

    pub(crate) fn get_mut(&mut self, segment: SegmentId) -> Option<&mut SegmentInfo> {
        self.segments.get_mut(segment.index())
    }

    /// Returns every segment's usage.
    #[must_use]
    pub fn segments(&self) -> &[SegmentInfo] {
        &self.segments
    }

    /// Returns the number of empty segments.
    #[must_use]
    pub fn free_segments(&self) -> u32 {
        self.count(SegmentState::Empty)
    }

    /// Returns the number of segments in `state`.
    #[must_use]
    pub fn count(&self, state: SegmentState) -> u32 {
        self.segments.iter().filter(|s| s.state == state).count() as u32
    }

    /// Returns the lowest-numbered empty segment.
    #[must_use]
    pub fn first_empty(&self) -> Option<SegmentId> {
        self.segments
            .iter()
            .find(|s| s.state == SegmentState::Empty)
            .map(|s| s.segment)
    }

    /// Returns the highest segment sequence in use.
    #[must_use]
    pub fn newest_seq(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.segment_seq)
            .max()
            .unwrap_or(0)
    }

    /// Adds live bytes to a segment.
    pub fn add_live(&mut self, segment: SegmentId, bytes: u64) {
        if let Some(info) = self.get_mut(segment) {
            info.live_bytes += bytes;
        }
    }

    /// Removes live bytes from a segment.
    pub fn remove_live(&mut self, segment: SegmentId, bytes: u64) {
        if let Some(info) = self.get_mut(segment) {
            info.live_bytes = info.live_bytes.saturating_sub(bytes);
        }
    }

    /// Returns a segment to the empty state.
    pub fn release(&mut self, segment: SegmentId) {
        if let Some(info) = self.get_mut(segment) {
            *info = SegmentInfo::empty(segment);
        }
    }

    /// Picks the segment to clean next.
    ///
    /// Only closed segments whose sequence is below `checkpoint_seq` are
    /// eligible; replay needs everything from the checkpoint segment on.
    /// A segment with no live bytes is taken first (oldest first).
    /// Otherwise the segment with the best cost/benefit score
    /// `(1 - u) * age / (1 + u)` is taken, where `u` is the live fraction
    /// and `age` the distance from the newest segment sequence; segments
    /// that are completely live are never chosen.
    #[must_use]
    pub fn select_victim(&self, checkpoint_seq: u64) -> Option<SegmentId> {
        let eligible = || {
            self.segments
                .iter()
                .filter(move |s| s.state == SegmentState::Closed && s.segment_seq < checkpoint_seq)
        };

        if let Some(empty) = eligible()
            .filter(|s| s.live_bytes == 0)
            .min_by_key(|s| s.segment_seq)
        {
            return Some(empty.segment);
        }

        let newest = self.newest_seq();
        let capacity = f64::from(self.segment_size.max(1));
        eligible()
            .filter_map(|s| {
                let utilization = s.live_bytes as f64 / capacity;
                if utilization >= 1.0 {
                    return None;
                }
                let age = (newest - s.segment_seq + 1) as f64;
                Some((s.segment, (1.0 - utilization) * age / (1.0 + utilization)))
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(segment, _)| segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed(table: &mut UsageTable, id: u32, seq: u64, live: u64) {
        let info = table.get_mut(SegmentId::new(id)).unwrap();
        info.state = SegmentState::Closed;
        info.segment_seq = seq;
        info.live_bytes = live;
        info.written_bytes = 4096;
    }

    #[test]
    fn segment_zero_is_reserved() {
        let table = UsageTable::new(4, 4096);
        assert_eq!(table.get(SegmentId::new(0)).unwrap().state, SegmentState::Reserved);
        assert_eq!(table.free_segments(), 3);
        assert_eq!(table.first_empty(), Some(SegmentId::new(1)));
    }

    #[test]
    fn empty_segment_chosen_first() {
        let mut table = UsageTable::new(6, 4096);
        closed(&mut table, 1, 1, 100);
        closed(&mut table, 2, 2, 0);
        closed(&mut table, 3, 3, 0);
        assert_eq!(table.select_victim(10), Some(SegmentId::new(2)));
    }

    #[test]
    fn victim_must_precede_checkpoint() {
        let mut table = UsageTable::new(6, 4096);
        closed(&mut table, 1, 5, 0);
        closed(&mut table, 2, 6, 0);
        assert_eq!(table.select_victim(5), None);
        assert_eq!(table.select_victim(6), Some(SegmentId::new(1)));
    }

    #[test]
    fn cost_benefit_prefers_cold_sparse_segments() {
        let mut table = UsageTable::new(8, 4096);
        closed(&mut table, 1, 1, 3000); // old but mostly live
        closed(&mut table, 2, 2, 500); // old and sparse
        closed(&mut table, 3, 9, 400); // sparse but young
        closed(&mut table, 4, 10, 4096); // full
        assert_eq!(table.select_victim(11), Some(SegmentId::new(2)));
    }

    #[test]
    fn full_segments_never_chosen() {
        let mut table = UsageTable::new(4, 4096);
        closed(&mut table, 1, 1, 4096);
        assert_eq!(table.select_victim(5), None);
    }

    #[test]
    fn release_resets_usage() {
        let mut table = UsageTable::new(4, 4096);
        closed(&mut table, 1, 1, 10);
        table.release(SegmentId::new(1));
        assert_eq!(table.get(SegmentId::new(1)).unwrap().state, SegmentState::Empty);
        assert_eq!(table.free_segments(), 3);
    }
}
