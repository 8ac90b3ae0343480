//! Fusion worker: the single writer of the estimate.
//!
//! Consumes merged samples in timestamp order, buffers inertial and odometry
//! data between epochs, closes an epoch on every accepted fix (and on
//! odometry or long inertial-only stretches), and publishes the smoother's
//! result through the shared optimized-state cell.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use nalgebra::Vector3;

use crate::config::EstimatorConfig;
use crate::factors::{
    align_static, OdometryIntegrator, PositionConstraint, Preintegrator, PriorSigmas,
};
use crate::local_frame::LocalFrameConverter;
use crate::queues::SensorMerger;
use crate::smoother::{IncrementalSmoother, Smoother};
use crate::status::{Diagnostics, StatusMonitor};
use crate::types::{
    ImuBias, InertialSample, NavState, OdometrySample, OptimizedState, PositionFix, SensorSample,
    StreamKind,
};

/// Latest smoother output, the one value readers share with the worker
#[derive(Debug, Default)]
pub struct OptimizedStateCell {
    inner: Mutex<Option<OptimizedState>>,
}

impl OptimizedStateCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, state: OptimizedState) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some(state);
    }

    pub fn latest(&self) -> Option<OptimizedState> {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// State shared between the worker, producers and readers
#[derive(Debug)]
pub struct Shared {
    pub optimized: OptimizedStateCell,
    pub status: StatusMonitor,
    pub diagnostics: Diagnostics,
}

impl Shared {
    pub fn new(config: &EstimatorConfig) -> Arc<Self> {
        Arc::new(Self {
            optimized: OptimizedStateCell::new(),
            status: StatusMonitor::new(config.fix_stale_after),
            diagnostics: Diagnostics::new(),
        })
    }
}

pub struct FusionWorker {
    config: EstimatorConfig,
    preintegrator: Preintegrator,
    converter: LocalFrameConverter,
    odometry: OdometryIntegrator,
    smoother: Box<dyn Smoother + Send>,
    shared: Arc<Shared>,
    lever_arm: Vector3<f64>,
    prior_sigmas: PriorSigmas,

    /// Samples since the last epoch, led by the last one at or before it
    imu_buffer: Vec<InertialSample>,
    odom_buffer: Vec<OdometrySample>,
    init_window: VecDeque<InertialSample>,
    last_epoch: Option<f64>,
    last_seen: [Option<f64>; 3],
}

impl FusionWorker {
    pub fn new(config: EstimatorConfig, shared: Arc<Shared>) -> Self {
        let smoother = Box::new(IncrementalSmoother::new(&config));
        Self::with_smoother(config, shared, smoother)
    }

    pub fn with_smoother(
        config: EstimatorConfig,
        shared: Arc<Shared>,
        smoother: Box<dyn Smoother + Send>,
    ) -> Self {
        Self {
            preintegrator: Preintegrator::from_config(&config),
            converter: LocalFrameConverter::new(config.max_fix_error),
            odometry: OdometryIntegrator::from_config(&config),
            lever_arm: Vector3::from(config.gps_lever_arm),
            prior_sigmas: PriorSigmas::from_config(&config),
            init_window: VecDeque::with_capacity(config.init_window_samples),
            smoother,
            shared,
            imu_buffer: Vec::new(),
            odom_buffer: Vec::new(),
            last_epoch: None,
            last_seen: [None; 3],
            config,
        }
    }

    /// Drain the merger until every queue is shut down and empty.
    pub fn run(mut self, mut merger: SensorMerger) {
        log::info!("fusion worker started");
        while let Some(sample) = merger.next_sample() {
            self.process(sample);
        }
        self.shared.status.mark_halted();
        log::info!(
            "fusion worker stopped: {} nodes, {} factors",
            self.smoother.num_nodes(),
            self.smoother.num_factors()
        );
    }

    pub fn is_initialized(&self) -> bool {
        self.last_epoch.is_some()
    }

    pub fn smoother(&self) -> &dyn Smoother {
        self.smoother.as_ref()
    }

    pub fn converter(&self) -> &LocalFrameConverter {
        &self.converter
    }

    /// Handle one sample; samples must arrive in non-decreasing time order.
    pub fn process(&mut self, sample: SensorSample) {
        let stream = sample.stream();
        let timestamp = sample.timestamp();
        let slot = match stream {
            StreamKind::Inertial => 0,
            StreamKind::Fix => 1,
            StreamKind::Odometry => 2,
        };
        if !sample.has_finite_readings() {
            log::warn!("dropping {:?} sample at t={:.3} with non-finite readings", stream, timestamp);
            Diagnostics::bump(&self.shared.diagnostics.non_finite_dropped);
            return;
        }
        if self.last_seen[slot].is_some_and(|last| timestamp <= last) {
            log::warn!(
                "dropping out-of-order {:?} sample at t={:.3} (last {:?})",
                stream,
                timestamp,
                self.last_seen[slot]
            );
            Diagnostics::bump(&self.shared.diagnostics.out_of_order_dropped);
            return;
        }
        self.last_seen[slot] = Some(timestamp);

        match sample {
            SensorSample::Inertial(imu) => self.on_inertial(imu),
            SensorSample::Fix(fix) => self.on_fix(fix),
            SensorSample::Odometry(odom) => self.on_odometry(odom),
        }
    }

    fn on_inertial(&mut self, sample: InertialSample) {
        self.shared.status.record_sensor_time(sample.timestamp);

        let Some(last_epoch) = self.last_epoch else {
            if self.init_window.len() == self.config.init_window_samples {
                self.init_window.pop_front();
            }
            self.init_window.push_back(sample);
            return;
        };

        let timestamp = sample.timestamp;
        self.imu_buffer.push(sample);
        if timestamp - last_epoch > self.config.max_epoch_interval {
            log::debug!("no fix for {:.2}s, closing inertial-only epoch", timestamp - last_epoch);
            self.close_epoch(timestamp, None);
        }
    }

    fn on_fix(&mut self, fix: PositionFix) {
        if let Err(reason) = self.converter.check(&fix) {
            log::warn!("rejecting fix at t={:.3}: {}", fix.timestamp, reason);
            Diagnostics::bump(&self.shared.diagnostics.fixes_rejected);
            return;
        }

        let Some(last_epoch) = self.last_epoch else {
            self.initialize_from(&fix);
            return;
        };

        if fix.timestamp <= last_epoch {
            log::warn!(
                "rejecting fix at t={:.3}: not after last epoch t={:.3}",
                fix.timestamp,
                last_epoch
            );
            Diagnostics::bump(&self.shared.diagnostics.fixes_rejected);
            return;
        }

        let local = match self.converter.accept(&fix) {
            Ok(local) => local,
            Err(reason) => {
                log::warn!("rejecting fix at t={:.3}: {}", fix.timestamp, reason);
                Diagnostics::bump(&self.shared.diagnostics.fixes_rejected);
                return;
            }
        };
        let constraint =
            PositionConstraint::new(fix.timestamp, local, self.config.gps_sigma, self.lever_arm);
        self.close_epoch(fix.timestamp, Some(constraint));
    }

    fn on_odometry(&mut self, sample: OdometrySample) {
        Diagnostics::bump(&self.shared.diagnostics.odometry_samples);
        if !self.config.use_odometry {
            return;
        }
        let Some(last_epoch) = self.last_epoch else {
            return;
        };

        let timestamp = sample.timestamp;
        self.odom_buffer.push(sample);
        if timestamp - last_epoch >= self.config.odometry_epoch_interval {
            self.close_epoch(timestamp, None);
        }
    }

    /// First accepted fix with a full static window seeds the smoother.
    fn initialize_from(&mut self, fix: &PositionFix) {
        let local = match self.converter.accept(fix) {
            Ok(local) => local,
            Err(reason) => {
                log::warn!("rejecting fix at t={:.3}: {}", fix.timestamp, reason);
                Diagnostics::bump(&self.shared.diagnostics.fixes_rejected);
                return;
            }
        };
        Diagnostics::bump(&self.shared.diagnostics.fixes_accepted);
        self.shared.status.record_fix(fix.timestamp);

        if self.init_window.len() < self.config.init_window_samples {
            log::info!(
                "fix at t={:.3} before static window filled ({}/{} samples), waiting",
                fix.timestamp,
                self.init_window.len(),
                self.config.init_window_samples
            );
            return;
        }

        let window: Vec<InertialSample> = self.init_window.iter().cloned().collect();
        let Some((rotation, bias)) = align_static(
            &window,
            self.config.gravity,
            self.config.static_gravity_tolerance,
            self.config.estimate_initial_gyro_bias,
        ) else {
            log::warn!("vehicle not static at t={:.3}, waiting for next fix", fix.timestamp);
            return;
        };

        let nav = NavState::new(rotation, local - rotation * self.lever_arm, Vector3::zeros());
        match self
            .smoother
            .initialize(fix.timestamp, nav, bias, &self.prior_sigmas)
        {
            Ok(state) => {
                self.last_epoch = Some(fix.timestamp);
                self.imu_buffer = window.last().cloned().into_iter().collect();
                self.init_window.clear();
                self.shared.optimized.publish(state);
                self.shared.status.mark_initialized();
                log::info!("estimator initialized at t={:.3}", fix.timestamp);
            }
            Err(e) => log::error!("smoother initialization failed: {e}"),
        }
    }

    fn bias_estimate(&self) -> ImuBias {
        self.smoother
            .current_estimate()
            .map(|s| s.bias)
            .unwrap_or_default()
    }

    fn close_epoch(&mut self, timestamp: f64, position: Option<PositionConstraint>) {
        let Some(start) = self.last_epoch else {
            return;
        };
        let bias = self.bias_estimate();
        let motion = self
            .preintegrator
            .integrate(&self.imu_buffer, start, timestamp, &bias);
        let odometry = if self.config.use_odometry {
            self.odometry.integrate(start, timestamp, &self.odom_buffer)
        } else {
            None
        };
        let has_odometry = odometry.is_some();

        let has_fix = position.is_some();
        match self.smoother.add_epoch(timestamp, motion, position, odometry) {
            Ok(result) => {
                self.last_epoch = Some(timestamp);
                retain_from(&mut self.imu_buffer, timestamp, |s| s.timestamp);
                retain_from(&mut self.odom_buffer, timestamp, |s| s.timestamp);

                let diagnostics = &self.shared.diagnostics;
                Diagnostics::bump(&diagnostics.epochs);
                diagnostics.record_solve(result.solve_time);
                Diagnostics::add(&diagnostics.dropped_constraints, result.dropped_constraints as u64);
                if result.degraded {
                    Diagnostics::bump(&diagnostics.degraded_epochs);
                }
                if has_odometry {
                    Diagnostics::bump(&diagnostics.odometry_constraints);
                }
                if result.fix_used {
                    Diagnostics::bump(&diagnostics.fixes_accepted);
                    self.shared.status.record_fix(timestamp);
                }

                self.shared.status.record_epoch(
                    result.degraded || result.dropped_constraints > 0 || result.prediction_only,
                );
                self.shared.optimized.publish(result.state);
            }
            Err(e) => {
                if has_fix {
                    Diagnostics::bump(&self.shared.diagnostics.fixes_rejected);
                }
                if !e.is_data_error() {
                    log::warn!("epoch at t={:.3} not added: {}", timestamp, e);
                    return;
                }
                // The same window would fail again: drop it and let the next
                // epoch bridge the hole with a degraded summary
                log::error!(
                    "epoch at t={:.3} failed ({}), discarding {} inertial samples",
                    timestamp,
                    e,
                    self.imu_buffer.len()
                );
                Diagnostics::bump(&self.shared.diagnostics.failed_epochs);
                self.imu_buffer.retain(|s| s.timestamp > timestamp);
                self.odom_buffer.retain(|s| s.timestamp > timestamp);
            }
        }
    }
}

/// Drop everything before the last element at or before `t`
fn retain_from<T>(buffer: &mut Vec<T>, t: f64, timestamp: impl Fn(&T) -> f64) {
    let keep_from = buffer
        .iter()
        .rposition(|item| timestamp(item) <= t)
        .unwrap_or(0);
    buffer.drain(..keep_from);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use crate::error::{SmootherError, SmootherResult};
    use crate::factors::{PreintegratedMotion, RelativeMotion};
    use crate::queues::SensorQueues;
    use crate::smoother::EpochResult;
    use crate::types::{EstimatorStatus, Matrix6};
    use std::sync::atomic::Ordering;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;

    /// Records what the worker hands to the smoother
    #[derive(Default)]
    struct RecordingSmoother {
        epochs: Arc<Mutex<Vec<(f64, f64, f64, bool)>>>,
        fail_next: Arc<Mutex<Option<SmootherError>>>,
        last: Option<OptimizedState>,
        factors: usize,
    }

    impl Smoother for RecordingSmoother {
        fn initialize(&mut self, timestamp: f64, nav: NavState, bias: ImuBias, _: &PriorSigmas) -> SmootherResult<OptimizedState> {
            if self.last.is_some() {
                return Err(SmootherError::AlreadyInitialized);
            }
            let state = OptimizedState { timestamp, epoch: 0, nav, bias, bias_covariance: Matrix6::identity() * 0.01 };
            self.last = Some(state);
            self.factors = 1;
            Ok(state)
        }

        fn add_epoch(
            &mut self,
            timestamp: f64,
            motion: PreintegratedMotion,
            position: Option<PositionConstraint>,
            odometry: Option<RelativeMotion>,
        ) -> SmootherResult<EpochResult> {
            let last = self.last.ok_or(SmootherError::NotInitialized)?;
            if timestamp <= last.timestamp {
                return Err(SmootherError::NonMonotonicEpoch { previous: last.timestamp, next: timestamp });
            }
            if let Some(e) = self.fail_next.lock().unwrap().take() {
                return Err(e);
            }
            self.epochs.lock().unwrap().push((timestamp, motion.start, motion.end, position.is_some()));
            self.factors += 2 + position.is_some() as usize + odometry.is_some() as usize;
            let state = OptimizedState { timestamp, epoch: last.epoch + 1, ..last };
            self.last = Some(state);
            Ok(EpochResult {
                state,
                degraded: motion.degraded,
                dropped_constraints: 0,
                fix_used: position.is_some(),
                prediction_only: false,
                iterations: 1,
                converged: true,
                solve_time: Duration::from_micros(10),
            })
        }

        fn current_estimate(&self) -> Option<OptimizedState> {
            self.last
        }

        fn num_nodes(&self) -> usize {
            self.last.map_or(0, |s| s.epoch + 1)
        }

        fn num_factors(&self) -> usize {
            self.factors
        }
    }

    fn config() -> EstimatorConfig {
        EstimatorConfig {
            init_window_samples: 10,
            ..EstimatorConfig::default()
        }
    }

    fn recording_worker(config: EstimatorConfig) -> (FusionWorker, Arc<Shared>, Arc<Mutex<Vec<(f64, f64, f64, bool)>>>) {
        let shared = Shared::new(&config);
        let smoother = RecordingSmoother::default();
        let epochs = Arc::clone(&smoother.epochs);
        let worker = FusionWorker::with_smoother(config, Arc::clone(&shared), Box::new(smoother));
        (worker, shared, epochs)
    }

    fn imu(t: f64) -> SensorSample {
        SensorSample::Inertial(InertialSample::new(t, Vector3::new(0.0, 0.0, 9.81), Vector3::zeros()))
    }

    fn fix(t: f64, accuracy: f64) -> SensorSample {
        SensorSample::Fix(PositionFix::new(t, 34.0, -84.0, 300.0, accuracy))
    }

    /// 100 Hz IMU from `start` to `end` (inclusive)
    fn feed_imu(worker: &mut FusionWorker, start: f64, end: f64) {
        let n = ((end - start) * 100.0).round() as usize;
        for i in 0..=n {
            worker.process(imu(start + i as f64 * 0.01));
        }
    }

    #[test]
    fn test_initializes_on_first_fix_after_static_window() {
        let (mut worker, shared, _) = recording_worker(config());
        feed_imu(&mut worker, 0.0, 0.05);
        worker.process(fix(0.05, 1.0));
        // Only 6 inertial samples so far: origin fixed, not yet initialized
        assert!(!worker.is_initialized());
        assert!(worker.converter().has_origin());
        assert_eq!(shared.status.status(), EstimatorStatus::AwaitingFirstFix);

        feed_imu(&mut worker, 0.06, 0.2);
        worker.process(fix(0.2, 1.0));
        assert!(worker.is_initialized());
        assert_eq!(shared.optimized.latest().unwrap().timestamp, 0.2);
        assert_eq!(shared.status.status(), EstimatorStatus::Nominal);
    }

    #[test]
    fn test_rejected_fix_leaves_graph_unchanged() {
        let (mut worker, shared, epochs) = recording_worker(config());
        feed_imu(&mut worker, 0.0, 0.2);
        worker.process(fix(0.2, 1.0));
        feed_imu(&mut worker, 0.21, 1.0);

        let factors_before = worker.smoother().num_factors();
        let nodes_before = worker.smoother().num_nodes();
        worker.process(fix(1.0, 50.0));
        assert_eq!(worker.smoother().num_factors(), factors_before);
        assert_eq!(worker.smoother().num_nodes(), nodes_before);
        assert!(epochs.lock().unwrap().is_empty());

        let snapshot = shared.diagnostics.snapshot(shared.status.status(), Default::default(), None);
        assert_eq!(snapshot.fixes_rejected, 1);
    }

    #[test]
    fn test_invalid_fix_before_origin_rejected() {
        let (mut worker, shared, _) = recording_worker(config());
        let mut bad = PositionFix::new(0.0, 34.0, -84.0, 300.0, 1.0);
        bad.valid = false;
        worker.process(SensorSample::Fix(bad));
        assert!(!worker.converter().has_origin());
        assert_eq!(shared.diagnostics.fixes_rejected.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn test_epoch_windows_chain_exactly() {
        let (mut worker, _, epochs) = recording_worker(config());
        feed_imu(&mut worker, 0.0, 0.2);
        worker.process(fix(0.2, 1.0));
        for k in 1..=5 {
            let t = 0.2 + k as f64;
            feed_imu(&mut worker, t - 0.99, t);
            worker.process(fix(t, 1.0));
        }
        let epochs = epochs.lock().unwrap();
        assert_eq!(epochs.len(), 5);
        let mut previous = 0.2;
        for &(t, start, end, has_fix) in epochs.iter() {
            assert!((start - previous).abs() < 1e-9);
            assert!((end - t).abs() < 1e-9);
            assert!(has_fix);
            previous = t;
        }
    }

    #[test]
    fn test_out_of_order_within_stream_dropped() {
        let (mut worker, shared, _) = recording_worker(config());
        worker.process(imu(1.0));
        worker.process(imu(0.5));
        assert_eq!(shared.diagnostics.out_of_order_dropped.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn test_epoch_timestamps_strictly_increase_for_any_interleaving() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..10 {
            let config = EstimatorConfig {
                use_odometry: true,
                odometry_epoch_interval: 0.3,
                ..config()
            };
            let (mut worker, _, epochs) = recording_worker(config);
            let queues = SensorQueues::new(10_000, OverflowPolicy::Block);

            // Streams with jittered timestamps, the fix stream occasionally going backwards
            let imu_stream: Vec<SensorSample> = (0..500).map(|i| imu(i as f64 * 0.01)).collect();
            let mut fix_stream: Vec<SensorSample> = (1..10)
                .map(|i| fix(i as f64 * 0.5 + rng.gen_range(-0.05..0.05), 1.0))
                .collect();
            fix_stream.swap(3, 4);
            let odom_stream: Vec<SensorSample> = (0..100)
                .map(|i| {
                    SensorSample::Odometry(OdometrySample::new(
                        i as f64 * 0.05 + 0.001,
                        Vector3::zeros(),
                        Vector3::zeros(),
                    ))
                })
                .collect();

            let mut order: Vec<usize> = std::iter::repeat(0)
                .take(imu_stream.len())
                .chain(std::iter::repeat(1).take(fix_stream.len()))
                .chain(std::iter::repeat(2).take(odom_stream.len()))
                .collect();
            order.shuffle(&mut rng);
            let mut streams = [
                imu_stream.into_iter(),
                fix_stream.into_iter(),
                odom_stream.into_iter(),
            ];
            for s in order {
                match streams[s].next() {
                    Some(SensorSample::Inertial(x)) => queues.inertial.enqueue(x).unwrap(),
                    Some(SensorSample::Fix(x)) => queues.fix.enqueue(x).unwrap(),
                    Some(SensorSample::Odometry(x)) => queues.odometry.enqueue(x).unwrap(),
                    None => {}
                }
            }
            queues.shutdown();

            for sample in SensorMerger::new(queues, Duration::from_millis(1)) {
                worker.process(sample);
            }

            let epochs = epochs.lock().unwrap();
            assert!(!epochs.is_empty());
            assert!(epochs.windows(2).all(|w| w[0].0 < w[1].0));
            assert!(epochs.windows(2).all(|w| (w[1].1 - w[0].0).abs() < 1e-9));
        }
    }

    #[test]
    fn test_odometry_closes_epochs_without_fixes() {
        let config = EstimatorConfig {
            use_odometry: true,
            odometry_epoch_interval: 0.5,
            ..config()
        };
        let (mut worker, shared, epochs) = recording_worker(config);
        feed_imu(&mut worker, 0.0, 0.2);
        worker.process(fix(0.2, 1.0));
        for i in 1..=20 {
            let t = 0.2 + i as f64 * 0.1;
            feed_imu(&mut worker, t - 0.09, t);
            worker.process(SensorSample::Odometry(OdometrySample::new(t + 0.001, Vector3::new(1.0, 0.0, 0.0), Vector3::zeros())));
        }
        let epochs = epochs.lock().unwrap();
        assert!(epochs.len() >= 3);
        assert!(epochs.iter().all(|e| !e.3));
        assert!(shared.diagnostics.odometry_constraints.load(std::sync::atomic::Ordering::Relaxed) >= 3);
    }

    #[test]
    fn test_inertial_only_epoch_bounds_buffer() {
        let config = EstimatorConfig {
            max_epoch_interval: 1.0,
            ..config()
        };
        let (mut worker, _, epochs) = recording_worker(config);
        feed_imu(&mut worker, 0.0, 0.2);
        worker.process(fix(0.2, 1.0));
        feed_imu(&mut worker, 0.21, 3.5);
        assert_eq!(epochs.lock().unwrap().len(), 3);
        assert!(worker.imu_buffer.len() < 110);
    }

    #[test]
    fn test_static_vehicle_with_real_smoother() {
        let config = config();
        let shared = Shared::new(&config);
        let mut worker = FusionWorker::new(config, Arc::clone(&shared));
        feed_imu(&mut worker, 0.0, 0.2);
        worker.process(fix(0.2, 1.0));
        for k in 1..=5 {
            let t = 0.2 + k as f64;
            feed_imu(&mut worker, t - 0.99, t);
            worker.process(fix(t, 1.0));
        }
        let state = shared.optimized.latest().unwrap();
        assert_eq!(state.epoch, 5);
        assert!(state.nav.position.norm() < 0.2);
        assert!(state.nav.velocity.norm() < 0.1);
        assert_eq!(shared.status.status(), EstimatorStatus::Nominal);
    }

    #[test]
    fn test_non_finite_inertial_sample_dropped_and_epochs_continue() {
        let config = config();
        let shared = Shared::new(&config);
        let mut worker = FusionWorker::new(config, Arc::clone(&shared));
        feed_imu(&mut worker, 0.0, 0.2);
        worker.process(fix(0.2, 1.0));
        feed_imu(&mut worker, 0.21, 1.2);
        worker.process(fix(1.2, 1.0));
        worker.process(SensorSample::Inertial(InertialSample::new(
            1.205,
            Vector3::new(f64::NAN, 0.0, 9.81),
            Vector3::zeros(),
        )));
        for k in 2..=10 {
            let t = 0.2 + k as f64;
            feed_imu(&mut worker, t - 0.99, t);
            worker.process(fix(t, 1.0));
        }

        let diagnostics = &shared.diagnostics;
        assert_eq!(diagnostics.non_finite_dropped.load(Ordering::Relaxed), 1);
        assert_eq!(diagnostics.epochs.load(Ordering::Relaxed), 10);
        assert_eq!(diagnostics.fixes_rejected.load(Ordering::Relaxed), 0);
        let state = shared.optimized.latest().unwrap();
        assert_eq!(state.epoch, 10);
        assert!(state.nav.is_finite());
        assert!(state.nav.position.norm() < 0.5);
        assert_eq!(shared.status.status(), EstimatorStatus::Nominal);
    }

    #[test]
    fn test_non_finite_odometry_dropped() {
        let config = EstimatorConfig {
            use_odometry: true,
            ..config()
        };
        let (mut worker, shared, _) = recording_worker(config);
        worker.process(SensorSample::Odometry(OdometrySample::new(
            0.1,
            Vector3::new(1.0, f64::INFINITY, 0.0),
            Vector3::zeros(),
        )));
        assert_eq!(shared.diagnostics.non_finite_dropped.load(Ordering::Relaxed), 1);
        assert_eq!(shared.diagnostics.odometry_samples.load(Ordering::Relaxed), 0);
        // The stream clock did not advance past the dropped sample
        worker.process(SensorSample::Odometry(OdometrySample::new(0.1, Vector3::zeros(), Vector3::zeros())));
        assert_eq!(shared.diagnostics.out_of_order_dropped.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_failed_epoch_discards_window_and_recovers() {
        let config = config();
        let shared = Shared::new(&config);
        let smoother = RecordingSmoother::default();
        let epochs = Arc::clone(&smoother.epochs);
        let fail_next = Arc::clone(&smoother.fail_next);
        let mut worker = FusionWorker::with_smoother(config, Arc::clone(&shared), Box::new(smoother));

        feed_imu(&mut worker, 0.0, 0.2);
        worker.process(fix(0.2, 1.0));
        feed_imu(&mut worker, 0.21, 1.2);
        *fail_next.lock().unwrap() = Some(SmootherError::InvalidCovariance("inertial factor"));
        worker.process(fix(1.2, 1.0));

        assert!(epochs.lock().unwrap().is_empty());
        assert!(worker.imu_buffer.len() <= 1);
        assert!(worker.imu_buffer.iter().all(|s| s.timestamp > 1.19));
        assert_eq!(shared.diagnostics.failed_epochs.load(Ordering::Relaxed), 1);
        assert_eq!(shared.diagnostics.fixes_rejected.load(Ordering::Relaxed), 1);

        for k in 2..=3 {
            let t = 0.2 + k as f64;
            feed_imu(&mut worker, t - 0.99, t);
            worker.process(fix(t, 1.0));
        }
        let epochs = epochs.lock().unwrap();
        assert_eq!(epochs.len(), 2);
        // The next epoch still chains from the last node the smoother holds
        assert!((epochs[0].1 - 0.2).abs() < 1e-9);
        assert!((epochs[0].0 - 2.2).abs() < 1e-9);
        assert!((epochs[1].1 - 2.2).abs() < 1e-9);
        assert!(worker.imu_buffer.len() <= 2);
    }

    #[test]
    fn test_accelerating_window_does_not_initialize() {
        let (mut worker, shared, _) = recording_worker(config());
        for i in 0..=20 {
            let t = i as f64 * 0.01;
            worker.process(SensorSample::Inertial(InertialSample::new(t, Vector3::new(4.0, 0.0, 9.81), Vector3::zeros())));
        }
        worker.process(fix(0.2, 1.0));
        assert!(!worker.is_initialized());
        assert_eq!(shared.status.status(), EstimatorStatus::AwaitingFirstFix);

        // Once the vehicle stops, the next fix initializes
        feed_imu(&mut worker, 0.21, 0.4);
        worker.process(fix(0.4, 1.0));
        assert!(worker.is_initialized());
    }

    #[test]
    fn test_retain_from_keeps_carry_sample() {
        let mut buffer = vec![0.0, 0.5, 1.0, 1.5];
        retain_from(&mut buffer, 1.2, |t| *t);
        assert_eq!(buffer, vec![1.0, 1.5]);
    }
}
