//! Ring-position routing for outgoing records.
//!
//! Every record key hashes to a position on a ring of [`RING_SIZE`] slots.
//! Partitions own disjoint half-open ranges `[start, stop)` of that ring, and
//! the [`PartitionRangeIndex`] maps a position to whatever target (in practice
//! the queue of the live partition worker) currently serves its range.
//!
//! The scheduler is the only writer; any number of publishing tasks read. A
//! write replaces ranges under one lock acquisition, so readers observe either
//! the old mapping or the new one.

use parking_lot::RwLock;

/// Number of positions on the partition ring.
///
/// This is also the largest partition count a topic can have, since each
/// partition owns at least one position.
pub const RING_SIZE: u32 = 2520;

/// Maps a record key onto the partition ring.
pub fn key_position(key: &[u8]) -> u32 {
    crc32fast::hash(key) % RING_SIZE
}

#[derive(Debug, Clone)]
struct RangeEntry<T> {
    start: u32,
    stop: u32,
    target: T,
}

/// Ordered set of disjoint ranges, binary searched by range start.
#[derive(Debug)]
pub struct PartitionRangeIndex<T> {
    ranges: RwLock<Vec<RangeEntry<T>>>,
}

impl<T: Clone> PartitionRangeIndex<T> {
    pub fn new() -> Self {
        Self {
            ranges: RwLock::new(Vec::new()),
        }
    }

    /// Routes `[start, stop)` to `target`, replacing whatever served any
    /// overlapping span. Empty ranges are ignored.
    pub fn insert(&self, start: u32, stop: u32, target: T) {
        if start >= stop {
            return;
        }
        let mut ranges = self.ranges.write();
        carve(&mut ranges, start, stop);
        let at = ranges.partition_point(|e| e.start < start);
        ranges.insert(at, RangeEntry { start, stop, target });
    }

    /// Unroutes `[start, stop)`. Lookups in the span report not found.
    pub fn remove(&self, start: u32, stop: u32) {
        if start >= stop {
            return;
        }
        carve(&mut self.ranges.write(), start, stop);
    }

    /// Swaps the whole mapping in one step. Later entries win on overlap.
    pub fn replace_all<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (u32, u32, T)>,
    {
        let mut next = Vec::new();
        for (start, stop, target) in entries {
            if start >= stop {
                continue;
            }
            carve(&mut next, start, stop);
            let at = next.partition_point(|e| e.start < start);
            next.insert(at, RangeEntry { start, stop, target });
        }
        *self.ranges.write() = next;
    }

    /// Returns the target whose range contains `position`.
    pub fn lookup(&self, position: u32) -> Option<T> {
        let ranges = self.ranges.read();
        let after = ranges.partition_point(|e| e.start <= position);
        let entry = ranges.get(after.checked_sub(1)?)?;
        (position < entry.stop).then(|| entry.target.clone())
    }

    pub fn clear(&self) {
        self.ranges.write().clear();
    }

    /// Registered ranges in ring order.
    pub fn ranges(&self) -> Vec<(u32, u32)> {
        self.ranges.read().iter().map(|e| (e.start, e.stop)).collect()
    }

    pub fn len(&self) -> usize {
        self.ranges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for PartitionRangeIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cuts `[start, stop)` out of a sorted, disjoint range list, trimming or
/// splitting entries that straddle its edges.
fn carve<T: Clone>(ranges: &mut Vec<RangeEntry<T>>, start: u32, stop: u32) {
    if !ranges.iter().any(|e| e.start < stop && start < e.stop) {
        return;
    }
    let mut kept = Vec::with_capacity(ranges.len() + 1);
    for entry in ranges.drain(..) {
        if entry.stop <= start || entry.start >= stop {
            kept.push(entry);
            continue;
        }
        if entry.start < start {
            kept.push(RangeEntry {
                start: entry.start,
                stop: start,
                target: entry.target.clone(),
            });
        }
        if entry.stop > stop {
            kept.push(RangeEntry {
                start: stop,
                stop: entry.stop,
                target: entry.target,
            });
        }
    }
    *ranges = kept;
}
