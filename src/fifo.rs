//! Bounded FIFO used by the serial data paths.
//!
//! The queue itself never drops anything: a push on a full queue returns
//! `false` and the owning peripheral decides whether that is a silent drop
//! or an overrun.

use std::collections::VecDeque;

/// Depth of every FIFO in the serial peripherals.
pub const FIFO_DEPTH: usize = 16;

#[derive(Debug, Clone)]
pub struct Fifo<T = u8> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> Fifo<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "FIFO capacity must be nonzero");
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `item`; `false` if the queue is full and `item` was not stored.
    pub fn push(&mut self, item: T) -> bool {
        if self.is_full() {
            return false;
        }
        self.items.push_back(item);
        true
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Remove and return everything queued, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.items.drain(..)
    }
}

impl<T> Default for Fifo<T> {
    fn default() -> Self {
        Self::new(FIFO_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_to_capacity() {
        let mut fifo = Fifo::new(FIFO_DEPTH);
        for i in 0..FIFO_DEPTH {
            assert!(fifo.push(i as u8));
        }
        assert_eq!(fifo.count(), FIFO_DEPTH);
        assert!(fifo.is_full());

        // capacity + 1-th push is rejected and the count stays put
        assert!(!fifo.push(0xaa));
        assert_eq!(fifo.count(), FIFO_DEPTH);
    }

    #[test]
    fn test_order_and_empty() {
        let mut fifo = Fifo::<u8>::default();
        assert!(fifo.is_empty());
        assert_eq!(fifo.pop(), None);

        fifo.push(1);
        fifo.push(2);
        assert_eq!(fifo.pop(), Some(1));
        assert_eq!(fifo.pop(), Some(2));
        assert!(fifo.is_empty());
    }

    #[test]
    fn test_clear_and_drain() {
        let mut fifo = Fifo::new(4);
        fifo.push(b'a');
        fifo.push(b'b');
        assert_eq!(fifo.drain().collect::<Vec<_>>(), b"ab");
        assert!(fifo.is_empty());

        fifo.push(b'c');
        fifo.clear();
        assert_eq!(fifo.count(), 0);
        assert_eq!(fifo.capacity(), 4);
    }
}
