//! Lock-free work queue backing the scheduler.

use crossbeam_queue::SegQueue;

/// An unbounded MPMC queue of work items.
///
/// Closing and termination are not the queue's business: the scheduler's
/// pending counter decides when an invocation is over, so the queue itself
/// stays a plain container.
#[derive(Debug, Default)]
pub struct WorkQueue<T> {
    inner: SegQueue<T>,
}

impl<T> WorkQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: SegQueue::new(),
        }
    }

    /// Pushes an item.
    pub fn push(&self, item: T) {
        self.inner.push(item);
    }

    /// Pops an item, if any.
    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let q = WorkQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn concurrent_producers_and_consumers() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let q = Arc::new(WorkQueue::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for t in 0..4 {
            let q = Arc::clone(&q);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    q.push(t * 100 + i);
                }
            }));
        }
        for _ in 0..4 {
            let q = Arc::clone(&q);
            let seen = Arc::clone(&seen);
            handles.push(std::thread::spawn(move || {
                while seen.load(Ordering::SeqCst) < 400 {
                    if q.pop().is_some() {
                        seen.fetch_add(1, Ordering::SeqCst);
                    } else {
                        std::thread::yield_now();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(seen.load(Ordering::SeqCst), 400);
        assert!(q.is_empty());
    }
}
