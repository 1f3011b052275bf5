//! Lock-free work queue for distributing pipelines across parallel workers

use std::sync::atomic::{AtomicUsize, Ordering};

/// Lock-free work queue distributing items to workers.
///
/// Workers call [`next()`](WorkQueue::next) to atomically claim the next item;
/// items are handed out in input order, each exactly once.
pub struct WorkQueue<S> {
    items: Vec<S>,
    cursor: AtomicUsize,
}

impl<S> WorkQueue<S> {
    pub fn new(items: Vec<S>) -> Self {
        log::debug!("{} items in work queue", items.len());
        Self {
            items,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Get next item to process (lock-free)
    pub fn next(&self) -> Option<&S> {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.items.get(i)
    }

    /// Total items in queue
    pub fn total(&self) -> usize {
        self.items.len()
    }

    /// Items not yet claimed
    pub fn remaining(&self) -> usize {
        self.total()
            .saturating_sub(self.cursor.load(Ordering::Relaxed))
    }
}
