use std::collections::VecDeque;
use std::fmt::Debug;

use bitset::BitSet;

/// A de-duplicating FIFO queue for tracking work left to do, for example
/// basic blocks or instructions still to be processed by a fixed point.
/// Inserting an element that is already enqueued has no effect. Elements
/// are dense indices, so occupancy is tracked with a bit set.
pub struct WorkQueue<T: From<usize> + Into<usize> + Copy + PartialEq + Debug> {
    deque: VecDeque<T>,
    set: BitSet<T>,
}

impl<T: From<usize> + Into<usize> + Copy + PartialEq + Debug> WorkQueue<T> {
    /// Creates a work queue holding all the elements of `0..len`.
    #[inline]
    pub fn with_all(len: usize) -> Self {
        WorkQueue { deque: (0..len).map(T::from).collect(), set: BitSet::new_filled(len) }
    }

    /// Creates an empty work queue for elements of `0..len`.
    #[inline]
    pub fn with_none(len: usize) -> Self {
        WorkQueue { deque: VecDeque::with_capacity(len), set: BitSet::new_empty(len) }
    }

    /// Attempts to enqueue `element`. Returns whether the queue changed.
    #[inline]
    pub fn insert(&mut self, element: T) -> bool {
        if self.set.insert(element) {
            self.deque.push_back(element);
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        let element = self.deque.pop_front()?;
        self.set.remove(element);
        Some(element)
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deque.is_empty()
    }
}

impl<T: From<usize> + Into<usize> + Copy + PartialEq + Debug> Extend<T> for WorkQueue<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        let set = &mut self.set;
        self.deque.extend(iter.into_iter().filter(|x| set.insert(*x)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_fifo() {
        let mut queue: WorkQueue<usize> = WorkQueue::with_none(8);
        assert!(queue.insert(3));
        assert!(queue.insert(1));
        assert!(!queue.insert(3));
        assert_eq!(queue.pop(), Some(3));
        assert!(queue.insert(3));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }
}
