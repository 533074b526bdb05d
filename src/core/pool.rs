//! Reuse of snapshot stores across entity lifetimes.
//!
//! Stores are acquired when an entity starts carrying history and released
//! when it despawns. A released store is cleared before it can be handed out
//! again, so no history leaks between entities.

use crate::core::snapshot_store::SnapshotStore;

/// Pool of equally sized [`SnapshotStore`]s.
#[derive(Debug)]
pub struct SnapshotPool<T> {
    capacity: usize,
    free: Vec<SnapshotStore<T>>,
}

impl<T> SnapshotPool<T> {
    /// Create an empty pool whose stores hold `capacity` snapshots.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: Vec::new(),
        }
    }

    /// Snapshot capacity of every store this pool hands out.
    pub fn store_capacity(&self) -> usize {
        self.capacity
    }

    /// Number of idle stores waiting for reuse.
    pub fn idle(&self) -> usize {
        self.free.len()
    }

    /// Take an empty store, reusing a released one when available.
    pub fn acquire(&mut self) -> SnapshotStore<T> {
        self.free
            .pop()
            .unwrap_or_else(|| SnapshotStore::new(self.capacity))
    }

    /// Return a store to the pool. Stores of a different size are dropped.
    pub fn release(&mut self, mut store: SnapshotStore<T>) {
        if store.capacity() != self.capacity.max(1) {
            return;
        }
        store.clear();
        self.free.push(store);
    }
}
