//! Bounded blocking FIFO used for every sensor stream.
//!
//! Producers block (or are refused) once `capacity` items are pending; the
//! consumer blocks until an item arrives or the queue is shut down. After
//! shutdown, already queued items are still handed out before `None`.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::OverflowPolicy;
use crate::error::{QueueError, QueueResult};

/// Shared "something changed" signal for a set of queues.
///
/// The merger waits on this instead of on any single queue so it can watch
/// all streams at once.
#[derive(Debug, Default)]
pub struct Wakeup {
    generation: Mutex<u64>,
    changed: Condvar,
}

impl Wakeup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notify(&self) {
        let mut generation = self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *generation = generation.wrapping_add(1);
        self.changed.notify_all();
    }

    pub fn generation(&self) -> u64 {
        *self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the generation moves past `seen` or `timeout` elapses.
    pub fn wait_since(&self, seen: u64, timeout: Option<Duration>) -> u64 {
        let guard = self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match timeout {
            Some(timeout) => {
                let (guard, _) = self
                    .changed
                    .wait_timeout_while(guard, timeout, |g| *g == seen)
                    .unwrap_or_else(PoisonError::into_inner);
                *guard
            }
            None => {
                let guard = self
                    .changed
                    .wait_while(guard, |g| *g == seen)
                    .unwrap_or_else(PoisonError::into_inner);
                *guard
            }
        }
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    shutdown: bool,
}

pub struct BlockingQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
    wakeup: Option<Arc<Wakeup>>,
}

impl<T> BlockingQueue<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
            policy,
            wakeup: None,
        }
    }

    /// Same as `new`, but every enqueue and the shutdown also poke `wakeup`.
    pub fn with_wakeup(capacity: usize, policy: OverflowPolicy, wakeup: Arc<Wakeup>) -> Self {
        Self {
            wakeup: Some(wakeup),
            ..Self::new(capacity, policy)
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signal(&self) {
        if let Some(wakeup) = &self.wakeup {
            wakeup.notify();
        }
    }

    pub fn enqueue(&self, item: T) -> QueueResult<()> {
        let mut state = self.lock();
        if state.shutdown {
            return Err(QueueError::Shutdown);
        }

        if state.items.len() >= self.capacity {
            state = match self.policy {
                OverflowPolicy::Reject => {
                    return Err(QueueError::Full {
                        capacity: self.capacity,
                    })
                }
                OverflowPolicy::Block => self
                    .not_full
                    .wait_while(state, |s| !s.shutdown && s.items.len() >= self.capacity)
                    .unwrap_or_else(PoisonError::into_inner),
                OverflowPolicy::BlockFor(ms) => {
                    let deadline = Instant::now() + Duration::from_millis(ms);
                    let mut state = state;
                    while !state.shutdown && state.items.len() >= self.capacity {
                        let now = Instant::now();
                        if now >= deadline {
                            return Err(QueueError::TimedOut);
                        }
                        state = self
                            .not_full
                            .wait_timeout(state, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0;
                    }
                    state
                }
            };
            if state.shutdown {
                return Err(QueueError::Shutdown);
            }
        }

        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        self.signal();
        Ok(())
    }

    /// Block until an item is available. `None` once shut down and drained.
    pub fn dequeue(&self) -> Option<T> {
        let mut state = self
            .not_empty
            .wait_while(self.lock(), |s| !s.shutdown && s.items.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        let item = state.items.pop_front();
        drop(state);
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    pub fn try_dequeue(&self) -> Option<T> {
        let item = self.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Inspect the head without removing it.
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.lock().items.front().map(f)
    }

    /// Refuse new items and wake every blocked producer and consumer.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
        self.signal();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True once shut down with nothing left to hand out
    pub fn is_finished(&self) -> bool {
        let state = self.lock();
        state.shutdown && state.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = BlockingQueue::new(10, OverflowPolicy::Block);
        for i in 0..5 {
            queue.enqueue(i).unwrap();
        }
        let drained: Vec<i32> = (0..5).filter_map(|_| queue.try_dequeue()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_sixth_enqueue_blocks_until_dequeue() {
        let queue = Arc::new(BlockingQueue::new(5, OverflowPolicy::Block));
        for i in 0..5 {
            queue.enqueue(i).unwrap();
        }

        let done = Arc::new(AtomicBool::new(false));
        let producer = {
            let queue = Arc::clone(&queue);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                queue.enqueue(5).unwrap();
                done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(150));
        assert!(!done.load(Ordering::SeqCst), "sixth enqueue should still be blocked");
        assert_eq!(queue.len(), 5);

        assert_eq!(queue.dequeue(), Some(0));
        producer.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn test_reject_policy_signals_backpressure() {
        let queue = BlockingQueue::new(2, OverflowPolicy::Reject);
        queue.enqueue(1).unwrap();
        queue.enqueue(2).unwrap();
        assert_eq!(queue.enqueue(3), Err(QueueError::Full { capacity: 2 }));
    }

    #[test]
    fn test_block_for_times_out() {
        let queue = BlockingQueue::new(1, OverflowPolicy::BlockFor(30));
        queue.enqueue(1).unwrap();
        let start = Instant::now();
        assert_eq!(queue.enqueue(2), Err(QueueError::TimedOut));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_shutdown_wakes_blocked_consumer() {
        let queue: Arc<BlockingQueue<u32>> = Arc::new(BlockingQueue::new(4, OverflowPolicy::Block));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.dequeue())
        };
        thread::sleep(Duration::from_millis(50));
        queue.shutdown();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_shutdown_drains_pending_items() {
        let queue = BlockingQueue::new(4, OverflowPolicy::Block);
        queue.enqueue(7).unwrap();
        queue.shutdown();
        assert_eq!(queue.enqueue(8), Err(QueueError::Shutdown));
        assert!(!queue.is_finished());
        assert_eq!(queue.dequeue(), Some(7));
        assert_eq!(queue.dequeue(), None);
        assert!(queue.is_finished());
    }

    #[test]
    fn test_wakeup_generation_advances() {
        let wakeup = Wakeup::new();
        let queue = BlockingQueue::with_wakeup(4, OverflowPolicy::Block, Arc::clone(&wakeup));
        let before = wakeup.generation();
        queue.enqueue(1).unwrap();
        assert!(wakeup.wait_since(before, Some(Duration::from_millis(10))) > before);
    }
}
