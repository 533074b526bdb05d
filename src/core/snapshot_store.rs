//! Tick-keyed snapshot history.
//!
//! A [`SnapshotStore`] is a [`RingBuffer`] of `(tick, data)` records appended
//! in non-decreasing tick order. Lookups are linear scans; with a capacity of
//! a few hundred entries that is cheaper than maintaining an index.
//!
//! Duplicate ticks are allowed. Every lookup that can match more than one
//! entry returns the most recently appended one.

use crate::core::ring_buffer::{RingBuffer, SnapshotError};
use crate::core::tick::SimulationTickNumber;

/// One recorded state at one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    /// Tick the data belongs to.
    pub tick: SimulationTickNumber,
    /// Recorded state.
    pub data: T,
}

/// Ring buffer of snapshots keyed by tick.
#[derive(Debug, Clone)]
pub struct SnapshotStore<T> {
    buffer: RingBuffer<Snapshot<T>>,
}

impl<T> SnapshotStore<T> {
    /// Create a store holding at most `capacity` snapshots.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: RingBuffer::new(capacity),
        }
    }

    /// Create a store sized for `retention_secs` of history at `tick_rate`.
    pub fn with_retention(tick_rate: u32, retention_secs: u32) -> Self {
        Self::new(tick_rate as usize * retention_secs as usize)
    }

    /// Maximum number of snapshots held.
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Number of snapshots held.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True if empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop every snapshot, keeping the allocation.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Append a snapshot, evicting the oldest when full.
    pub fn add(&mut self, tick: SimulationTickNumber, data: T) -> &mut Snapshot<T> {
        debug_assert!(
            self.buffer.latest().map_or(true, |last| last.tick <= tick),
            "snapshot {} appended after a later tick",
            tick
        );
        self.buffer.push(Snapshot { tick, data });
        let newest = self.buffer.len() - 1;
        &mut self.buffer[newest]
    }

    /// Newest snapshot.
    pub fn latest(&self) -> Result<&Snapshot<T>, SnapshotError> {
        self.buffer.latest()
    }

    /// Newest snapshot, mutably.
    pub fn latest_mut(&mut self) -> Result<&mut Snapshot<T>, SnapshotError> {
        self.buffer.latest_mut()
    }

    /// Oldest snapshot still retained.
    pub fn oldest(&self) -> Result<&Snapshot<T>, SnapshotError> {
        self.buffer.oldest()
    }

    /// Snapshot counted from the newest end (0 = newest).
    pub fn get_from_end(&self, index: usize) -> Option<&Snapshot<T>> {
        self.buffer.get_from_end(index)
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Snapshot<T>> + '_ {
        self.buffer.iter()
    }

    fn index_of(&self, tick: SimulationTickNumber) -> Option<usize> {
        self.buffer.iter().rposition(|s| s.tick == tick)
    }

    /// Exact lookup. The last appended entry for `tick` wins.
    pub fn find(&self, tick: SimulationTickNumber) -> Option<&Snapshot<T>> {
        self.index_of(tick).and_then(|i| self.buffer.get(i))
    }

    /// Exact lookup, mutably. The last appended entry for `tick` wins.
    pub fn find_mut(&mut self, tick: SimulationTickNumber) -> Option<&mut Snapshot<T>> {
        let index = self.index_of(tick)?;
        self.buffer.get_mut(index)
    }

    /// Snapshot with the greatest tick `<= tick`.
    pub fn closest_at_or_before(&self, tick: SimulationTickNumber) -> Option<&Snapshot<T>> {
        let mut best: Option<&Snapshot<T>> = None;
        for snapshot in self.buffer.iter().rev() {
            if snapshot.tick > tick {
                continue;
            }
            if best.map_or(true, |b| snapshot.tick > b.tick) {
                best = Some(snapshot);
            }
        }
        best
    }

    /// Snapshot with the smallest tick `>= tick`.
    pub fn closest_at_or_after(&self, tick: SimulationTickNumber) -> Option<&Snapshot<T>> {
        let mut best: Option<&Snapshot<T>> = None;
        for snapshot in self.buffer.iter().rev() {
            if snapshot.tick < tick {
                continue;
            }
            if best.map_or(true, |b| snapshot.tick < b.tick) {
                best = Some(snapshot);
            }
        }
        best
    }

    /// Nearest snapshot on either side. Equal distances resolve to the later tick.
    pub fn closest_any(&self, tick: SimulationTickNumber) -> Option<&Snapshot<T>> {
        match (self.closest_at_or_before(tick), self.closest_at_or_after(tick)) {
            (Some(before), Some(after)) => {
                let below = tick - before.tick;
                let above = after.tick - tick;
                if above <= below {
                    Some(after)
                } else {
                    Some(before)
                }
            }
            (before, after) => after.or(before),
        }
    }
}

impl<T: Default> SnapshotStore<T> {
    /// Existing entry for `tick`, or a new default entry appended for it.
    ///
    /// The flag is `true` when the entry was created by this call.
    pub fn get_or_create(&mut self, tick: SimulationTickNumber) -> (&mut Snapshot<T>, bool) {
        match self.index_of(tick) {
            Some(index) => (&mut self.buffer[index], false),
            None => (self.add(tick, T::default()), true),
        }
    }
}

impl<T: Default + Clone> SnapshotStore<T> {
    /// Like [`get_or_create`](Self::get_or_create), but a new entry copies the
    /// newest existing data instead of starting from the default.
    pub fn get_or_create_carried(&mut self, tick: SimulationTickNumber) -> (&mut Snapshot<T>, bool) {
        if let Some(index) = self.index_of(tick) {
            return (&mut self.buffer[index], false);
        }
        let seed = self
            .buffer
            .latest()
            .map(|s| s.data.clone())
            .unwrap_or_default();
        (self.add(tick, seed), true)
    }
}

// =============================================================================
// TESTS
// =============================================================================
