//! Timestamp-ordered k-way merge over the per-stream queues.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::blocking::{BlockingQueue, Wakeup};
use crate::config::OverflowPolicy;
use crate::types::{InertialSample, OdometrySample, PositionFix, SensorSample, StreamKind};

/// Anything that can be ordered by sensor time
pub trait Timestamped {
    fn timestamp(&self) -> f64;
}

impl Timestamped for InertialSample {
    fn timestamp(&self) -> f64 {
        self.timestamp
    }
}

impl Timestamped for PositionFix {
    fn timestamp(&self) -> f64 {
        self.timestamp
    }
}

impl Timestamped for OdometrySample {
    fn timestamp(&self) -> f64 {
        self.timestamp
    }
}

impl<T: Timestamped> BlockingQueue<T> {
    pub fn peek_timestamp(&self) -> Option<f64> {
        self.peek_with(|item| item.timestamp())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepths {
    pub inertial: usize,
    pub fix: usize,
    pub odometry: usize,
}

/// The three stream queues plus the wakeup they share
#[derive(Clone)]
pub struct SensorQueues {
    pub inertial: Arc<BlockingQueue<InertialSample>>,
    pub fix: Arc<BlockingQueue<PositionFix>>,
    pub odometry: Arc<BlockingQueue<OdometrySample>>,
    pub wakeup: Arc<Wakeup>,
}

impl SensorQueues {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let wakeup = Wakeup::new();
        Self {
            inertial: Arc::new(BlockingQueue::with_wakeup(capacity, policy, Arc::clone(&wakeup))),
            fix: Arc::new(BlockingQueue::with_wakeup(capacity, policy, Arc::clone(&wakeup))),
            odometry: Arc::new(BlockingQueue::with_wakeup(capacity, policy, Arc::clone(&wakeup))),
            wakeup,
        }
    }

    pub fn shutdown(&self) {
        self.inertial.shutdown();
        self.fix.shutdown();
        self.odometry.shutdown();
    }

    pub fn depths(&self) -> QueueDepths {
        QueueDepths {
            inertial: self.inertial.len(),
            fix: self.fix.len(),
            odometry: self.odometry.len(),
        }
    }

    fn all_finished(&self) -> bool {
        self.inertial.is_finished() && self.fix.is_finished() && self.odometry.is_finished()
    }
}

fn stream_rank(kind: StreamKind) -> u8 {
    // Inertial first on ties so the window up to a fix is complete
    match kind {
        StreamKind::Inertial => 0,
        StreamKind::Fix => 1,
        StreamKind::Odometry => 2,
    }
}

/// Hands out samples from all streams in non-decreasing timestamp order.
///
/// A fix or odometry head is held back for up to `reorder_window` while the
/// inertial queue is momentarily empty, since an older inertial sample may
/// still be in flight from its producer.
pub struct SensorMerger {
    queues: SensorQueues,
    reorder_window: Duration,
    held: Option<(StreamKind, Instant)>,
}

impl SensorMerger {
    pub fn new(queues: SensorQueues, reorder_window: Duration) -> Self {
        Self {
            queues,
            reorder_window,
            held: None,
        }
    }

    fn oldest_head(&self) -> Option<(StreamKind, f64)> {
        let heads = [
            (StreamKind::Inertial, self.queues.inertial.peek_timestamp()),
            (StreamKind::Fix, self.queues.fix.peek_timestamp()),
            (StreamKind::Odometry, self.queues.odometry.peek_timestamp()),
        ];
        heads
            .into_iter()
            .filter_map(|(kind, ts)| ts.map(|t| (kind, t)))
            .min_by(|a, b| {
                a.1.total_cmp(&b.1)
                    .then_with(|| stream_rank(a.0).cmp(&stream_rank(b.0)))
            })
    }

    fn pop(&self, kind: StreamKind) -> Option<SensorSample> {
        match kind {
            StreamKind::Inertial => self.queues.inertial.try_dequeue().map(SensorSample::Inertial),
            StreamKind::Fix => self.queues.fix.try_dequeue().map(SensorSample::Fix),
            StreamKind::Odometry => self.queues.odometry.try_dequeue().map(SensorSample::Odometry),
        }
    }

    /// Block for the next sample in global timestamp order.
    ///
    /// Returns `None` once every queue is shut down and drained.
    pub fn next_sample(&mut self) -> Option<SensorSample> {
        loop {
            let seen = self.queues.wakeup.generation();

            if let Some((kind, _)) = self.oldest_head() {
                let inertial_pending = kind != StreamKind::Inertial
                    && self.queues.inertial.is_empty()
                    && !self.queues.inertial.is_shutdown();

                if inertial_pending && !self.reorder_window.is_zero() {
                    let deadline = match self.held {
                        Some((held_kind, deadline)) if held_kind == kind => deadline,
                        _ => {
                            let deadline = Instant::now() + self.reorder_window;
                            self.held = Some((kind, deadline));
                            deadline
                        }
                    };
                    let now = Instant::now();
                    if now < deadline {
                        self.queues.wakeup.wait_since(seen, Some(deadline - now));
                        continue;
                    }
                }

                self.held = None;
                if let Some(sample) = self.pop(kind) {
                    return Some(sample);
                }
                continue;
            }

            if self.queues.all_finished() {
                return None;
            }
            self.queues.wakeup.wait_since(seen, None);
        }
    }
}

impl Iterator for SensorMerger {
    type Item = SensorSample;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_sample()
    }
}
