//! Estimator status and diagnostics.
//!
//! `StatusMonitor` derives the externally visible status from what the
//! worker last reported. `Diagnostics` holds lock-free counters that any
//! thread can bump and that serialize into a `DiagnosticsSnapshot`.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queues::QueueDepths;
use crate::types::EstimatorStatus;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct StatusInputs {
    halted: bool,
    initialized: bool,
    latest_degraded: bool,
    last_fix_time: Option<f64>,
    latest_sensor_time: Option<f64>,
}

/// Computes `EstimatorStatus` from the worker's latest observations.
///
/// Staleness is measured in sensor time: newest inertial timestamp minus the
/// last accepted fix.
#[derive(Debug)]
pub struct StatusMonitor {
    inputs: Mutex<StatusInputs>,
    fix_stale_after: f64,
}

impl StatusMonitor {
    pub fn new(fix_stale_after: f64) -> Self {
        Self {
            inputs: Mutex::new(StatusInputs::default()),
            fix_stale_after,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatusInputs> {
        self.inputs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark_initialized(&self) {
        self.lock().initialized = true;
    }

    pub fn mark_halted(&self) {
        self.lock().halted = true;
    }

    pub fn record_fix(&self, timestamp: f64) {
        let mut inputs = self.lock();
        inputs.last_fix_time = Some(timestamp);
        inputs.latest_sensor_time = Some(inputs.latest_sensor_time.map_or(timestamp, |t| t.max(timestamp)));
    }

    pub fn record_sensor_time(&self, timestamp: f64) {
        let mut inputs = self.lock();
        inputs.latest_sensor_time = Some(inputs.latest_sensor_time.map_or(timestamp, |t| t.max(timestamp)));
    }

    /// Degraded summary or dropped constraint in the newest epoch
    pub fn record_epoch(&self, degraded: bool) {
        self.lock().latest_degraded = degraded;
    }

    pub fn seconds_since_fix(&self) -> Option<f64> {
        let inputs = self.lock();
        match (inputs.last_fix_time, inputs.latest_sensor_time) {
            (Some(fix), Some(now)) => Some((now - fix).max(0.0)),
            _ => None,
        }
    }

    pub fn status(&self) -> EstimatorStatus {
        let inputs = *self.lock();
        if inputs.halted {
            return EstimatorStatus::Halted;
        }
        if !inputs.initialized {
            return EstimatorStatus::AwaitingFirstFix;
        }
        if inputs.latest_degraded {
            return EstimatorStatus::Degraded;
        }
        let stale = match (inputs.last_fix_time, inputs.latest_sensor_time) {
            (Some(fix), Some(now)) => now - fix > self.fix_stale_after,
            _ => true,
        };
        if stale {
            EstimatorStatus::FixStale
        } else {
            EstimatorStatus::Nominal
        }
    }
}

/// Counters shared by producers, the worker and readers
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub inertial_samples: AtomicU64,
    pub fixes_accepted: AtomicU64,
    pub fixes_rejected: AtomicU64,
    pub odometry_samples: AtomicU64,
    pub odometry_constraints: AtomicU64,
    pub epochs: AtomicU64,
    pub degraded_epochs: AtomicU64,
    pub dropped_constraints: AtomicU64,
    pub out_of_order_dropped: AtomicU64,
    pub non_finite_dropped: AtomicU64,
    pub failed_epochs: AtomicU64,
    pub enqueue_rejected: AtomicU64,
    pub outputs_published: AtomicU64,
    pub outputs_dropped: AtomicU64,
    last_solve_us: AtomicU64,
    max_solve_us: AtomicU64,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_solve(&self, elapsed: Duration) {
        let micros = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.last_solve_us.store(micros, Ordering::Relaxed);
        self.max_solve_us.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn snapshot(
        &self,
        status: EstimatorStatus,
        queue_depths: QueueDepths,
        seconds_since_fix: Option<f64>,
    ) -> DiagnosticsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DiagnosticsSnapshot {
            generated_at: chrono::Utc::now().to_rfc3339(),
            status,
            queue_depths,
            inertial_samples: load(&self.inertial_samples),
            fixes_accepted: load(&self.fixes_accepted),
            fixes_rejected: load(&self.fixes_rejected),
            odometry_samples: load(&self.odometry_samples),
            odometry_constraints: load(&self.odometry_constraints),
            epochs: load(&self.epochs),
            degraded_epochs: load(&self.degraded_epochs),
            dropped_constraints: load(&self.dropped_constraints),
            out_of_order_dropped: load(&self.out_of_order_dropped),
            non_finite_dropped: load(&self.non_finite_dropped),
            failed_epochs: load(&self.failed_epochs),
            enqueue_rejected: load(&self.enqueue_rejected),
            outputs_published: load(&self.outputs_published),
            outputs_dropped: load(&self.outputs_dropped),
            last_solve_ms: load(&self.last_solve_us) as f64 / 1000.0,
            max_solve_ms: load(&self.max_solve_us) as f64 / 1000.0,
            seconds_since_fix,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DiagnosticsSnapshot {
    pub generated_at: String,
    pub status: EstimatorStatus,
    pub queue_depths: QueueDepths,
    pub inertial_samples: u64,
    pub fixes_accepted: u64,
    pub fixes_rejected: u64,
    pub odometry_samples: u64,
    pub odometry_constraints: u64,
    pub epochs: u64,
    pub degraded_epochs: u64,
    pub dropped_constraints: u64,
    pub out_of_order_dropped: u64,
    /// Samples discarded for NaN or infinite readings
    pub non_finite_dropped: u64,
    /// Epochs the smoother refused, their inertial window discarded
    pub failed_epochs: u64,
    pub enqueue_rejected: u64,
    pub outputs_published: u64,
    pub outputs_dropped: u64,
    // Timing
    pub last_solve_ms: f64,
    pub max_solve_ms: f64,
    /// Sensor-time seconds since the last accepted fix
    pub seconds_since_fix: Option<f64>,
}

impl DiagnosticsSnapshot {
    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}
