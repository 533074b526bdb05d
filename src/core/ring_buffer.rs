//! Fixed-capacity circular buffer with overwrite-oldest semantics.
//!
//! ```text
//!  capacity = 4, after pushing a b c d e f
//!
//!  slots:  [ e ][ f ][ c ][ d ]
//!                     ^head (oldest)
//!  logical: c d e f      index 0 = oldest, len-1 = newest
//! ```
//!
//! Storage is a single `Vec` allocated on first use and never grown beyond
//! `capacity`, so the buffer can be cleared and reused without reallocating.

use std::ops::{Index, IndexMut};

use thiserror::Error;

/// Errors from reading a buffer that has nothing in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SnapshotError {
    /// `latest`/`oldest` on an empty buffer.
    #[error("snapshot buffer is empty")]
    EmptyBuffer,
}

/// Circular buffer indexable from both ends.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: Vec<T>,
    head: usize,
    len: usize,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create an empty buffer. A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Vec::with_capacity(capacity),
            head: 0,
            len: 0,
            capacity,
        }
    }

    /// Maximum number of items held.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items currently held.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if nothing has been pushed since creation or the last clear.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True once the next push will evict the oldest item.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    #[inline]
    fn physical(&self, index: usize) -> usize {
        (self.head + index) % self.capacity
    }

    /// Append an item, evicting the oldest one when full. Returns the evicted item.
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.len < self.capacity {
            let slot = self.physical(self.len);
            if slot < self.items.len() {
                self.items[slot] = item;
            } else {
                self.items.push(item);
            }
            self.len += 1;
            return None;
        }

        let evicted = std::mem::replace(&mut self.items[self.head], item);
        self.head = (self.head + 1) % self.capacity;
        Some(evicted)
    }

    /// Item at logical index (0 = oldest).
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        self.items.get(self.physical(index))
    }

    /// Mutable item at logical index (0 = oldest).
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if index >= self.len {
            return None;
        }
        let slot = self.physical(index);
        self.items.get_mut(slot)
    }

    /// Item counted from the newest end (0 = newest).
    pub fn get_from_end(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        self.get(self.len - 1 - index)
    }

    /// Newest item.
    pub fn latest(&self) -> Result<&T, SnapshotError> {
        self.get_from_end(0).ok_or(SnapshotError::EmptyBuffer)
    }

    /// Newest item, mutably.
    pub fn latest_mut(&mut self) -> Result<&mut T, SnapshotError> {
        match self.len {
            0 => Err(SnapshotError::EmptyBuffer),
            len => self.get_mut(len - 1).ok_or(SnapshotError::EmptyBuffer),
        }
    }

    /// Oldest item.
    pub fn oldest(&self) -> Result<&T, SnapshotError> {
        self.get(0).ok_or(SnapshotError::EmptyBuffer)
    }

    /// Logically empty the buffer, keeping its allocation.
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator + '_ {
        (0..self.len).map(move |i| &self.items[self.physical(i)])
    }

    /// Iterate oldest to newest, mutably.
    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut T> + '_ {
        let filled = self.items.len();
        let len = self.len;
        let (front, back) = self.items.split_at_mut(self.head.min(filled));
        let tail_len = back.len().min(len);
        let wrap_len = len - tail_len;
        back[..tail_len].iter_mut().chain(front[..wrap_len].iter_mut())
    }
}

impl<T> Index<usize> for RingBuffer<T> {
    type Output = T;

    /// Logical indexing (0 = oldest). Panics when out of range.
    fn index(&self, index: usize) -> &T {
        assert!(index < self.len, "ring buffer index {} out of range", index);
        &self.items[self.physical(index)]
    }
}

impl<T> IndexMut<usize> for RingBuffer<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        assert!(index < self.len, "ring buffer index {} out of range", index);
        let slot = self.physical(index);
        &mut self.items[slot]
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_until_full() {
        let mut buf = RingBuffer::new(3);
        assert!(buf.is_empty());
        assert_eq!(buf.latest(), Err(SnapshotError::EmptyBuffer));
        assert_eq!(buf.oldest(), Err(SnapshotError::EmptyBuffer));

        for i in 0..3 {
            assert_eq!(buf.push(i), None);
        }
        assert!(buf.is_full());
        assert_eq!(*buf.oldest().unwrap(), 0);
        assert_eq!(*buf.latest().unwrap(), 2);
    }

    #[test]
    fn test_overwrite_oldest() {
        let mut buf = RingBuffer::new(3);
        for i in 0..5 {
            buf.push(i);
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(buf.get_from_end(0), Some(&4));
        assert_eq!(buf.get_from_end(2), Some(&2));
        assert_eq!(buf.get_from_end(3), None);
        assert_eq!(buf.push(5), Some(2));
    }

    #[test]
    fn test_iter_mut_wrapped() {
        let mut buf = RingBuffer::new(4);
        for i in 0..6 {
            buf.push(i);
        }
        for item in buf.iter_mut() {
            *item *= 10;
        }
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec![20, 30, 40, 50]);
        assert_eq!(buf.iter_mut().count(), 4);
    }

    #[test]
    fn test_clear_reuses_storage() {
        let mut buf = RingBuffer::new(2);
        buf.push(1);
        buf.push(2);
        buf.push(3);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.iter_mut().count(), 0);

        buf.push(7);
        assert_eq!(buf.len(), 1);
        assert_eq!(*buf.latest().unwrap(), 7);
        *buf.latest_mut().unwrap() = 8;
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec![8]);
    }

    #[test]
    fn test_zero_capacity_is_one() {
        let mut buf = RingBuffer::new(0);
        buf.push('a');
        buf.push('b');
        assert_eq!(buf.capacity(), 1);
        assert_eq!(*buf.latest().unwrap(), 'b');
    }
}
