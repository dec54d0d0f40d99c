//! Per-worker queues with take-from-any.
//!
//! Posts are spread round-robin; a taker scans every queue starting at its
//! own. One semaphore permit exists per queued item, so takers sleep while
//! all queues are empty and a taker holding a permit always finds an item.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::Semaphore;

pub(crate) struct MultiQueue<T> {
    queues: Vec<Mutex<VecDeque<T>>>,
    available: Semaphore,
    cursor: AtomicUsize,
}

impl<T> MultiQueue<T> {
    pub(crate) fn new(count: usize) -> Self {
        debug_assert!(count > 0);
        Self {
            queues: (0..count).map(|_| Mutex::new(VecDeque::new())).collect(),
            available: Semaphore::new(0),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Enqueue `item`, returning the index of the queue it landed in.
    pub(crate) fn add(&self, item: T) -> usize {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        self.queues[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(item);
        // Permit strictly after the push: a permit always has an item behind it.
        self.available.add_permits(1);
        index
    }

    /// Wait for an item from any queue, preferring `start`.
    ///
    /// Cancel-safe. Returns `None` once the queues are closed.
    pub(crate) async fn take_any(&self, start: usize) -> Option<T> {
        let permit = self.available.acquire().await.ok()?;
        // A sweep can race a concurrent taker and come up empty even though
        // our item exists. Dropping the future while yielding returns the
        // permit with the item still queued.
        loop {
            if let Some(item) = self.sweep(start) {
                permit.forget();
                return Some(item);
            }
            tokio::task::yield_now().await;
        }
    }

    fn sweep(&self, start: usize) -> Option<T> {
        let count = self.queues.len();
        (0..count).find_map(|offset| {
            self.queues[(start + offset) % count]
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.queues
            .iter()
            .map(|q| q.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    /// Wake every waiting taker with `None`. Queued items stay put.
    pub(crate) fn close(&self) {
        self.available.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn add_spreads_round_robin() {
        let queues = MultiQueue::new(3);
        let landed: Vec<usize> = (0..6).map(|i| queues.add(i)).collect();
        assert_eq!(landed, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(queues.len(), 6);
    }

    #[tokio::test]
    async fn take_prefers_own_queue_then_any() {
        let queues = MultiQueue::new(2);
        queues.add("q0-a");
        queues.add("q1-a");
        queues.add("q0-b");

        assert_eq!(queues.take_any(1).await, Some("q1-a"));
        assert_eq!(queues.take_any(1).await, Some("q0-a"));
        assert_eq!(queues.take_any(1).await, Some("q0-b"));
        assert_eq!(queues.len(), 0);
    }

    #[tokio::test]
    async fn single_queue_is_fifo() {
        let queues = MultiQueue::new(1);
        for i in 0..5 {
            queues.add(i);
        }
        for i in 0..5 {
            assert_eq!(queues.take_any(0).await, Some(i));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_takers_each_get_one_item() {
        let queues = std::sync::Arc::new(MultiQueue::new(4));

        let takers: Vec<_> = (0..4)
            .map(|start| {
                let queues = std::sync::Arc::clone(&queues);
                tokio::spawn(async move {
                    let mut taken = Vec::new();
                    for _ in 0..250 {
                        taken.push(queues.take_any(start).await.unwrap());
                    }
                    taken
                })
            })
            .collect();

        for i in 0..1000u32 {
            queues.add(i);
        }

        let mut all = Vec::new();
        for taker in takers {
            let taken = tokio::time::timeout(Duration::from_secs(5), taker)
                .await
                .unwrap()
                .unwrap();
            all.extend(taken);
        }
        all.sort_unstable();
        assert_eq!(all, (0..1000).collect::<Vec<_>>());
        assert_eq!(queues.len(), 0);
    }

    #[tokio::test]
    async fn close_wakes_waiting_taker() {
        let queues = std::sync::Arc::new(MultiQueue::<u8>::new(2));

        let taker = {
            let queues = std::sync::Arc::clone(&queues);
            tokio::spawn(async move { queues.take_any(0).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queues.close();

        assert_eq!(taker.await.unwrap(), None);
    }
}
