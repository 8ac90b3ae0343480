//! High-rate state propagation between smoother solutions.
//!
//! Runs on the inertial producer path: each aligned sample moves the
//! propagated state forward from the latest optimized snapshot. When a newer
//! snapshot lands, the propagator restarts from it and replays the samples it
//! has buffered since the snapshot's timestamp.

use std::collections::VecDeque;

use nalgebra::Vector3;

use crate::types::{
    EstimatorStatus, ImuBias, InertialSample, NavState, OptimizedState, StateEstimate,
};

#[derive(Clone, Copy, Debug, PartialEq)]
struct Propagated {
    timestamp: f64,
    nav: NavState,
    bias: ImuBias,
}

pub struct StatePropagator {
    gravity: Vector3<f64>,
    base_epoch: Option<usize>,
    current: Option<Propagated>,
    last_sample: Option<InertialSample>,
    history: VecDeque<InertialSample>,
    history_len: usize,
}

impl StatePropagator {
    /// `history_len` bounds how many samples are kept for replay.
    pub fn new(gravity: f64, history_len: usize) -> Self {
        Self {
            gravity: Vector3::new(0.0, 0.0, -gravity),
            base_epoch: None,
            current: None,
            last_sample: None,
            history: VecDeque::with_capacity(history_len),
            history_len: history_len.max(1),
        }
    }

    pub fn base_epoch(&self) -> Option<usize> {
        self.base_epoch
    }

    /// Restart from a newer optimized state and replay buffered samples.
    pub fn rebase(&mut self, snapshot: &OptimizedState) {
        if self.base_epoch.is_some_and(|e| e >= snapshot.epoch) {
            return;
        }
        self.base_epoch = Some(snapshot.epoch);

        let mut current = Propagated {
            timestamp: snapshot.timestamp,
            nav: snapshot.nav,
            bias: snapshot.bias,
        };
        let mut previous: Option<&InertialSample> = None;
        for sample in &self.history {
            if sample.timestamp > current.timestamp {
                current = self.advance(current, previous, sample);
            }
            previous = Some(sample);
        }
        self.current = Some(current);
    }

    /// Feed one aligned inertial sample. Returns true if the state advanced.
    ///
    /// Non-finite samples are ignored and never enter the replay history.
    pub fn propagate(&mut self, sample: &InertialSample) -> bool {
        if !sample.is_finite()
            || self
                .last_sample
                .as_ref()
                .is_some_and(|last| sample.timestamp <= last.timestamp)
        {
            return false;
        }

        if self.history.len() == self.history_len {
            self.history.pop_front();
        }
        self.history.push_back(sample.clone());
        let previous = self.last_sample.replace(sample.clone());

        match self.current {
            Some(current) if sample.timestamp > current.timestamp => {
                self.current = Some(self.advance(current, previous.as_ref(), sample));
                true
            }
            _ => false,
        }
    }

    /// Midpoint strapdown step from `current` to `sample`
    fn advance(
        &self,
        current: Propagated,
        previous: Option<&InertialSample>,
        sample: &InertialSample,
    ) -> Propagated {
        let dt = sample.timestamp - current.timestamp;
        let (accel, gyro) = match previous {
            Some(prev) => (0.5 * (prev.accel + sample.accel), 0.5 * (prev.gyro + sample.gyro)),
            None => (sample.accel, sample.gyro),
        };
        let nav = current.nav.integrate(
            &(accel - current.bias.accel),
            &(gyro - current.bias.gyro),
            &self.gravity,
            dt,
        );
        Propagated {
            timestamp: sample.timestamp,
            nav,
            bias: current.bias,
        }
    }

    pub fn estimate(&self, status: EstimatorStatus) -> Option<StateEstimate> {
        self.current.map(|c| StateEstimate {
            timestamp: c.timestamp,
            nav: c.nav,
            bias: c.bias,
            status,
            predicted: true,
        })
    }

    pub fn timestamp(&self) -> Option<f64> {
        self.current.map(|c| c.timestamp)
    }
}

/// Limits pushed outputs to a configured rate, measured in sensor time.
#[derive(Clone, Debug)]
pub struct OutputThrottle {
    period: f64,
    last_emit: Option<f64>,
}

impl OutputThrottle {
    pub fn new(rate_hz: f64) -> Self {
        Self {
            period: if rate_hz > 0.0 { 1.0 / rate_hz } else { 0.0 },
            last_emit: None,
        }
    }

    pub fn should_emit(&mut self, timestamp: f64) -> bool {
        let due = self
            .last_emit
            .map_or(true, |last| timestamp - last >= self.period - 1e-9);
        if due {
            self.last_emit = Some(timestamp);
        }
        due
    }
}
