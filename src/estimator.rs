//! Public estimator facade.
//!
//! Producers call the `on_*` callbacks from any thread. Inertial samples are
//! aligned into the body frame, queued for the fusion worker and propagated
//! on the caller's thread so high-rate outputs never wait for a solve.
//! Readers poll `current_state()` or subscribe to the pushed stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};

use crate::config::EstimatorConfig;
use crate::error::{EstimatorError, EstimatorResult, QueueError};
use crate::local_frame::FrameAlignment;
use crate::propagator::{OutputThrottle, StatePropagator};
use crate::queues::{SensorMerger, SensorQueues};
use crate::smoother::{IncrementalSmoother, Smoother};
use crate::status::{Diagnostics, DiagnosticsSnapshot};
use crate::types::{
    BiasEstimate, EstimatorStatus, InertialSample, OdometrySample, PositionFix, StateEstimate,
};
use crate::worker::{FusionWorker, Shared};

/// Inertial samples kept for replay after a new smoother solution
const PROPAGATION_HISTORY: usize = 4096;

struct OutputPath {
    propagator: StatePropagator,
    throttle: OutputThrottle,
}

pub struct StateEstimator {
    queues: SensorQueues,
    alignment: FrameAlignment,
    shared: Arc<Shared>,
    output: Mutex<OutputPath>,
    output_tx: Sender<StateEstimate>,
    output_rx: Receiver<StateEstimate>,
    subscribed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StateEstimator {
    /// Validate the configuration and start the fusion worker.
    pub fn new(config: EstimatorConfig) -> EstimatorResult<Self> {
        config.validate()?;
        let smoother = Box::new(IncrementalSmoother::new(&config));
        Self::with_smoother(config, smoother)
    }

    /// Start with a caller-provided smoother backend.
    pub fn with_smoother(
        config: EstimatorConfig,
        smoother: Box<dyn Smoother + Send>,
    ) -> EstimatorResult<Self> {
        config.validate()?;

        let queues = SensorQueues::new(config.queue_capacity, config.overflow_policy);
        let shared = Shared::new(&config);
        let (output_tx, output_rx) = bounded(config.output_channel_capacity);
        let output = OutputPath {
            propagator: StatePropagator::new(config.gravity, PROPAGATION_HISTORY),
            throttle: OutputThrottle::new(config.output_rate_hz),
        };
        let alignment = FrameAlignment::from_config(&config);

        let merger = SensorMerger::new(queues.clone(), config.reorder_window());
        let worker = FusionWorker::with_smoother(config, Arc::clone(&shared), smoother);
        let handle = thread::Builder::new()
            .name("fusion-worker".to_string())
            .spawn(move || worker.run(merger))
            .map_err(EstimatorError::Spawn)?;

        Ok(Self {
            queues,
            alignment,
            shared,
            output: Mutex::new(output),
            output_tx,
            output_rx,
            subscribed: AtomicBool::new(false),
            worker: Mutex::new(Some(handle)),
        })
    }

    fn output(&self) -> MutexGuard<'_, OutputPath> {
        self.output.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn count_rejection(&self, err: &QueueError) {
        if matches!(err, QueueError::Full { .. } | QueueError::TimedOut) {
            Diagnostics::bump(&self.shared.diagnostics.enqueue_rejected);
        }
    }

    /// Samples with NaN or infinite readings are counted and dropped.
    pub fn on_inertial_sample(&self, sample: InertialSample) -> EstimatorResult<()> {
        if !sample.is_finite() {
            log::warn!("dropping inertial sample at t={:.3} with non-finite readings", sample.timestamp);
            Diagnostics::bump(&self.shared.diagnostics.non_finite_dropped);
            return Ok(());
        }
        let aligned = self.alignment.align_sample(&sample);
        if let Err(e) = self.queues.inertial.enqueue(aligned.clone()) {
            self.count_rejection(&e);
            return Err(e.into());
        }
        Diagnostics::bump(&self.shared.diagnostics.inertial_samples);
        self.propagate(&aligned);
        Ok(())
    }

    pub fn on_position_fix(&self, fix: PositionFix) -> EstimatorResult<()> {
        self.queues.fix.enqueue(fix).map_err(|e| {
            self.count_rejection(&e);
            e.into()
        })
    }

    pub fn on_odometry_sample(&self, sample: OdometrySample) -> EstimatorResult<()> {
        self.queues.odometry.enqueue(sample).map_err(|e| {
            self.count_rejection(&e);
            e.into()
        })
    }

    fn propagate(&self, sample: &InertialSample) {
        let mut output = self.output();
        if let Some(snapshot) = self.shared.optimized.latest() {
            output.propagator.rebase(&snapshot);
        }
        if !output.propagator.propagate(sample) || !output.throttle.should_emit(sample.timestamp) {
            return;
        }
        if !self.subscribed.load(Ordering::Acquire) {
            return;
        }
        if let Some(estimate) = output.propagator.estimate(self.shared.status.status()) {
            self.publish(estimate);
        }
    }

    /// Push to subscribers; when the channel is full the oldest estimate gives way.
    fn publish(&self, estimate: StateEstimate) {
        let diagnostics = &self.shared.diagnostics;
        match self.output_tx.try_send(estimate) {
            Ok(()) => Diagnostics::bump(&diagnostics.outputs_published),
            Err(TrySendError::Full(estimate)) => {
                let _ = self.output_rx.try_recv();
                Diagnostics::bump(&diagnostics.outputs_dropped);
                if self.output_tx.try_send(estimate).is_ok() {
                    Diagnostics::bump(&diagnostics.outputs_published);
                }
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Newest estimate: the propagated state if it is ahead of the smoother,
    /// otherwise the smoother's own solution.
    pub fn current_state(&self) -> Option<StateEstimate> {
        let optimized = self.shared.optimized.latest()?;
        let status = self.status();

        let mut output = self.output();
        output.propagator.rebase(&optimized);
        match output.propagator.estimate(status) {
            Some(propagated) if propagated.timestamp > optimized.timestamp => Some(propagated),
            _ => Some(StateEstimate {
                timestamp: optimized.timestamp,
                nav: optimized.nav,
                bias: optimized.bias,
                status,
                predicted: false,
            }),
        }
    }

    /// Newest smoothed bias with its marginal covariance
    pub fn bias_estimate(&self) -> Option<BiasEstimate> {
        self.shared.optimized.latest().map(BiasEstimate::from)
    }

    pub fn status(&self) -> EstimatorStatus {
        self.shared.status.status()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.shared.diagnostics.snapshot(
            self.status(),
            self.queues.depths(),
            self.shared.status.seconds_since_fix(),
        )
    }

    /// Stream of throttled propagated estimates.
    ///
    /// Receivers share one stream: each estimate goes to a single receiver.
    pub fn subscribe(&self) -> Receiver<StateEstimate> {
        self.subscribed.store(true, Ordering::Release);
        self.output_rx.clone()
    }

    /// Stop accepting samples, let the worker drain what is queued, and join it.
    ///
    /// Calling it again is a no-op.
    pub fn shutdown(&self) -> EstimatorResult<()> {
        self.queues.shutdown();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };
        match handle.join() {
            Ok(()) => {
                log::info!("estimator shut down");
                Ok(())
            }
            Err(_) => {
                self.shared.status.mark_halted();
                log::error!("fusion worker panicked");
                Err(EstimatorError::WorkerPanicked)
            }
        }
    }
}

impl Drop for StateEstimator {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("shutdown on drop failed: {e}");
        }
    }
}
