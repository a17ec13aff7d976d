use std::collections::VecDeque;

/// Fixed-capacity ring buffer.
///
/// Small wrapper around `VecDeque`: `push` evicts from the front when full, so memory is
/// bounded by `capacity`. Backs the recent-error history and the latency window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CircularBuffer<T> {
    buffer: VecDeque<T>,
    capacity: usize,
}

impl<T> CircularBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `item`, returning the evicted oldest entry when the buffer was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        // Capacity==0 means "store nothing". Without this guard, VecDeque could grow unbounded.
        if self.capacity == 0 {
            return Some(item);
        }

        let evicted = if self.buffer.len() == self.capacity {
            self.buffer.pop_front()
        } else {
            None
        };
        self.buffer.push_back(item);
        evicted
    }

    pub fn front(&self) -> Option<&T> {
        self.buffer.front()
    }

    pub fn back(&self) -> Option<&T> {
        self.buffer.back()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.buffer.iter()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() == self.capacity
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl<'a, T> IntoIterator for &'a CircularBuffer<T> {
    type Item = &'a T;
    type IntoIter = std::collections::vec_deque::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.buffer.iter()
    }
}
