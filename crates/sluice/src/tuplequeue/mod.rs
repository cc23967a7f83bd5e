//! Tuple buffering: per-port FIFO queues, partitioned queue containers, the
//! per-operator queue variants, and the drainers that extract ready batches.
//!
//! Queues never block on `offer`; backpressure is caller-side via the
//! advisory capacity (`offer` on a multi-threaded queue accepts only what
//! fits, and the caller retries with a bounded backoff). Only the thread
//! driving a pipeline's head operator may block waiting on its own queue,
//! through the blocking drainer pool.

mod container;
mod drainer;
mod operator;
mod pool;

pub use container::TupleQueueContainer;
pub use drainer::{
    Drainer, GreedyDrainer, MultiPortConjunctiveDrainer, MultiPortDisjunctiveDrainer,
    SinglePortDrainer,
};
pub use operator::{DefaultOperatorQueue, EmptyOperatorQueue, OperatorQueue, PartitionedOperatorQueue};
pub use pool::DrainerPool;

use sluice_api::Tuple;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Access discipline of a [`TupleQueue`].
///
/// Multi-threaded queues are offered by other pipelines' threads and drained
/// by the owner; their capacity bounds offers and their condvar supports the
/// blocking drainer pool. Single-threaded queues are internal to one
/// replica thread and treat capacity as advisory only.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThreadingMode {
    SingleThreaded,
    MultiThreaded,
}

#[derive(Debug)]
struct QueueInner {
    tuples: VecDeque<Tuple>,
    capacity: usize,
}

/// A FIFO of tuples for one input port.
#[derive(Debug)]
pub struct TupleQueue {
    multi_threaded: AtomicBool,
    inner: Mutex<QueueInner>,
    available: Condvar,
}

impl TupleQueue {
    pub fn new(mode: ThreadingMode, capacity: usize) -> Self {
        Self {
            multi_threaded: AtomicBool::new(mode == ThreadingMode::MultiThreaded),
            inner: Mutex::new(QueueInner {
                tuples: VecDeque::new(),
                capacity,
            }),
            available: Condvar::new(),
        }
    }

    pub fn mode(&self) -> ThreadingMode {
        if self.multi_threaded.load(Ordering::Acquire) {
            ThreadingMode::MultiThreaded
        } else {
            ThreadingMode::SingleThreaded
        }
    }

    /// Switches the access discipline in place, keeping buffered tuples.
    /// Used when pipelines are merged or split.
    pub fn switch_threading_mode(&self, mode: ThreadingMode) {
        self.multi_threaded
            .store(mode == ThreadingMode::MultiThreaded, Ordering::Release);
    }

    /// Appends as many tuples as capacity allows, removing the accepted
    /// prefix from `tuples`. Returns the accepted count. Single-threaded
    /// queues accept everything.
    pub fn offer(&self, tuples: &mut Vec<Tuple>) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let accepted = if self.multi_threaded.load(Ordering::Acquire) {
            inner.capacity.saturating_sub(inner.tuples.len()).min(tuples.len())
        } else {
            tuples.len()
        };
        inner.tuples.extend(tuples.drain(..accepted));
        if accepted > 0 {
            self.available.notify_all();
        }
        accepted
    }

    /// Appends all tuples regardless of capacity.
    pub fn force_offer(&self, tuples: impl IntoIterator<Item = Tuple>) {
        let mut inner = self.inner.lock().unwrap();
        inner.tuples.extend(tuples);
        self.available.notify_all();
    }

    /// Appends a single tuple regardless of capacity.
    pub fn push(&self, tuple: Tuple) {
        let mut inner = self.inner.lock().unwrap();
        inner.tuples.push_back(tuple);
        self.available.notify_all();
    }

    /// Removes and returns up to `count` tuples.
    pub fn poll(&self, count: usize) -> Vec<Tuple> {
        let mut inner = self.inner.lock().unwrap();
        let take = count.min(inner.tuples.len());
        inner.tuples.drain(..take).collect()
    }

    /// Removes and returns exactly `count` tuples, or nothing if fewer are
    /// buffered.
    pub fn poll_exact(&self, count: usize) -> Option<Vec<Tuple>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.tuples.len() < count {
            return None;
        }
        Some(inner.tuples.drain(..count).collect())
    }

    /// Removes and returns everything buffered.
    pub fn poll_all(&self) -> Vec<Tuple> {
        let mut inner = self.inner.lock().unwrap();
        inner.tuples.drain(..).collect()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().tuples.is_empty()
    }

    /// Discards all buffered tuples, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let dropped = inner.tuples.len();
        inner.tuples.clear();
        dropped
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    /// Grows the capacity to at least `capacity`; never shrinks.
    pub fn ensure_capacity(&self, capacity: usize) {
        let mut inner = self.inner.lock().unwrap();
        if capacity > inner.capacity {
            inner.capacity = capacity;
        }
    }

    /// Waits until at least `count` tuples are buffered or `timeout`
    /// elapses. Returns whether the size condition holds on return.
    pub fn await_size(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while inner.tuples.len() < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, wait) = self
                .available
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
            if wait.timed_out() {
                return inner.tuples.len() >= count;
            }
        }
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sluice_api::Tuple;
    use std::sync::Arc;
    use std::thread;

    fn tuples(n: usize) -> Vec<Tuple> {
        (0..n).map(|i| Tuple::of("n", i as i64)).collect()
    }

    #[test]
    fn multi_threaded_offer_respects_capacity() {
        let queue = TupleQueue::new(ThreadingMode::MultiThreaded, 3);
        let mut batch = tuples(5);
        assert_eq!(queue.offer(&mut batch), 3);
        assert_eq!(batch.len(), 2);
        assert_eq!(queue.size(), 3);

        queue.ensure_capacity(5);
        assert_eq!(queue.offer(&mut batch), 2);
        assert!(batch.is_empty());
    }

    #[test]
    fn single_threaded_offer_ignores_capacity() {
        let queue = TupleQueue::new(ThreadingMode::SingleThreaded, 2);
        let mut batch = tuples(10);
        assert_eq!(queue.offer(&mut batch), 10);
    }

    #[test]
    fn poll_exact_leaves_data_when_unsatisfied() {
        let queue = TupleQueue::new(ThreadingMode::SingleThreaded, 16);
        queue.force_offer(tuples(2));
        assert!(queue.poll_exact(3).is_none());
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.poll_exact(2).unwrap().len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn poll_preserves_offer_order() {
        let queue = TupleQueue::new(ThreadingMode::SingleThreaded, 16);
        queue.force_offer(tuples(4));
        let polled = queue.poll_all();
        let values: Vec<i64> = polled
            .iter()
            .map(|t| t.get("n").unwrap().as_int().unwrap())
            .collect();
        assert_eq!(values, vec![0, 1, 2, 3]);
    }

    #[test]
    fn await_size_wakes_on_offer() {
        let queue = Arc::new(TupleQueue::new(ThreadingMode::MultiThreaded, 16));
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.force_offer(tuples(2));
            })
        };
        assert!(queue.await_size(2, Duration::from_secs(5)));
        producer.join().unwrap();
    }

    #[test]
    fn await_size_times_out() {
        let queue = TupleQueue::new(ThreadingMode::MultiThreaded, 16);
        assert!(!queue.await_size(1, Duration::from_millis(10)));
    }
}
