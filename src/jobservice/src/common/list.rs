//! Synchronised in-memory list.

use parking_lot::RwLock;
use std::collections::VecDeque;

/// A bounded FIFO list shared between tasks.
///
/// Pushing into a full list evicts the oldest element. The list lives in process memory
/// only and is empty again after a restart.
#[derive(Debug)]
pub struct SyncList<T> {
    items: RwLock<VecDeque<T>>,
    capacity: usize,
}

impl<T> SyncList<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Append an item; returns the evicted oldest item when the list was full.
    pub fn push(&self, item: T) -> Option<T> {
        let mut items = self.items.write();
        let evicted = if items.len() >= self.capacity {
            items.pop_front()
        } else {
            None
        };
        items.push_back(item);
        evicted
    }

    /// Visit every item in order, removing those for which `f` returns true.
    pub fn iterate<F>(&self, mut f: F)
    where
        F: FnMut(&T) -> bool,
    {
        self.items.write().retain(|item| !f(item));
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Clone> SyncList<T> {
    /// Copy of the current items, for work that must not hold the lock (e.g. awaits).
    pub fn snapshot(&self) -> Vec<T> {
        self.items.read().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_iterate_removes_matched() {
        let list = SyncList::new(10);
        for i in 0..5 {
            list.push(i);
        }

        let mut seen = Vec::new();
        list.iterate(|x| {
            seen.push(*x);
            x % 2 == 0
        });

        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(list.snapshot(), vec![1, 3]);
    }

    #[test]
    fn test_full_list_evicts_oldest() {
        let list = SyncList::new(2);
        assert_eq!(list.push("a"), None);
        assert_eq!(list.push("b"), None);
        assert_eq!(list.push("c"), Some("a"));
        assert_eq!(list.snapshot(), vec!["b", "c"]);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let list = SyncList::new(0);
        list.push(1);
        assert_eq!(list.len(), 1);
        assert_eq!(list.capacity(), 1);
    }
}
