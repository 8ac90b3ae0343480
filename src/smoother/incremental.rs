//! Windowed incremental smoother.
//!
//! Every epoch appends one node plus its factors and re-solves only the most
//! recent `window` nodes with Gauss-Newton (Levenberg damping on failure);
//! older nodes stay fixed at their last solution and act as anchors for the
//! factors that cross into the window.

use std::time::Instant;

use nalgebra::{DMatrix, DVector, Vector3};

use super::graph::{FactorGraph, GraphFactor, NodeState};
use super::{EpochResult, Smoother};
use crate::config::EstimatorConfig;
use crate::error::{SmootherError, SmootherResult};
use crate::factors::{
    BiasRandomWalk, ImuFactor, PositionConstraint, PreintegratedMotion, PriorFactor, PriorSigmas,
    RelativeMotion,
};
use crate::types::{
    ImuBias, Matrix6, NavState, OptimizedState, Vector6, BIAS_DIM, NODE_ACC_BIAS, NODE_DIM,
};

/// Allowed disagreement between epoch times and summary window edges (s)
const WINDOW_TOLERANCE: f64 = 1e-6;
const BASE_DAMPING: f64 = 1e-9;
const MAX_DAMPING: f64 = 1e8;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SolverSettings {
    pub window: usize,
    pub max_iterations: usize,
    pub convergence_threshold: f64,
    pub huber_threshold: f64,
}

impl SolverSettings {
    pub fn from_config(config: &EstimatorConfig) -> Self {
        Self {
            window: config.smoother_window.max(2),
            max_iterations: config.max_iterations.max(1),
            convergence_threshold: config.convergence_threshold,
            huber_threshold: config.huber_threshold,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SolveReport {
    pub iterations: usize,
    pub converged: bool,
    pub cost: f64,
}

/// Why a solution was refused by the numerical policy
#[derive(Clone, Debug, PartialEq)]
enum PolicyViolation {
    Solver(SmootherError),
    NonFinite,
    BiasOutOfRange { accel: f64, gyro: f64 },
    BiasUncertain { accel_sigma: f64, gyro_sigma: f64 },
    Outlier { factor: usize, chi2: f64 },
}

impl std::fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyViolation::Solver(e) => write!(f, "{e}"),
            PolicyViolation::NonFinite => write!(f, "non-finite state"),
            PolicyViolation::BiasOutOfRange { accel, gyro } => {
                write!(f, "bias out of range (accel {accel:.3}, gyro {gyro:.4})")
            }
            PolicyViolation::BiasUncertain { accel_sigma, gyro_sigma } => write!(
                f,
                "bias unobservable (sigma accel {accel_sigma:.3}, gyro {gyro_sigma:.4})"
            ),
            PolicyViolation::Outlier { chi2, .. } => write!(f, "constraint chi2 {chi2:.1}"),
        }
    }
}

pub struct IncrementalSmoother {
    graph: FactorGraph,
    settings: SolverSettings,
    gravity: Vector3<f64>,
    accel_bias_walk: f64,
    gyro_bias_walk: f64,
    outlier_chi2: f64,
    max_accel_bias: f64,
    max_gyro_bias: f64,
    max_accel_bias_sigma: f64,
    max_gyro_bias_sigma: f64,
    /// Marginal bias covariance of the newest node
    bias_covariance: Matrix6,
}

impl IncrementalSmoother {
    pub fn new(config: &EstimatorConfig) -> Self {
        Self {
            graph: FactorGraph::new(),
            settings: SolverSettings::from_config(config),
            gravity: Vector3::new(0.0, 0.0, -config.gravity),
            accel_bias_walk: config.accel_bias_random_walk,
            gyro_bias_walk: config.gyro_bias_random_walk,
            outlier_chi2: config.outlier_chi2,
            max_accel_bias: config.max_accel_bias,
            max_gyro_bias: config.max_gyro_bias,
            max_accel_bias_sigma: config.max_accel_bias_sigma,
            max_gyro_bias_sigma: config.max_gyro_bias_sigma,
            bias_covariance: Matrix6::zeros(),
        }
    }

    pub fn graph(&self) -> &FactorGraph {
        &self.graph
    }

    fn first_free(&self) -> usize {
        self.graph.num_nodes().saturating_sub(self.settings.window)
    }

    /// Gauss-Newton over the free window
    fn solve(&mut self) -> SmootherResult<SolveReport> {
        let first_free = self.first_free();
        let ids = self.graph.active_factors_from(first_free);
        let huber = self.settings.huber_threshold;

        let mut cost = self.graph.robust_cost(&ids, huber);
        if !cost.is_finite() {
            return Err(SmootherError::Diverged("non-finite initial cost".to_string()));
        }

        let mut report = SolveReport {
            cost,
            ..SolveReport::default()
        };
        let mut lambda = 0.0;

        while report.iterations < self.settings.max_iterations {
            report.iterations += 1;

            let (hessian, gradient) = self.graph.linearize(&ids, first_free, huber);
            let delta = solve_damped(&hessian, &gradient, &mut lambda)?;

            let saved = self.graph.snapshot_from(first_free);
            self.graph.retract_from(first_free, &delta);
            let new_cost = self.graph.robust_cost(&ids, huber);

            if !new_cost.is_finite() || new_cost > cost * (1.0 + 1e-12) + 1e-12 {
                self.graph.restore_from(first_free, &saved);
                lambda = (lambda * 10.0).max(1e-3);
                if lambda > MAX_DAMPING {
                    break;
                }
                continue;
            }

            lambda *= 0.1;
            if lambda < 1e-9 {
                lambda = 0.0;
            }
            cost = new_cost;
            report.cost = cost;

            if delta.norm() < self.settings.convergence_threshold {
                report.converged = true;
                break;
            }
        }

        Ok(report)
    }

    /// Marginal covariance of the newest node's bias, conditioned on the
    /// nodes outside the window
    fn bias_marginal(&mut self) -> SmootherResult<Matrix6> {
        let first_free = self.first_free();
        let newest = self
            .graph
            .num_nodes()
            .checked_sub(1)
            .ok_or(SmootherError::NotInitialized)?;
        let ids = self.graph.active_factors_from(first_free);
        let (hessian, _) = self.graph.linearize(&ids, first_free, self.settings.huber_threshold);
        let offset = (newest - first_free) * NODE_DIM + NODE_ACC_BIAS;
        marginal_block(hessian, offset)
    }

    /// Solve, then apply the numerical policy to the result
    fn solve_checked(
        &mut self,
        new_aux: &[usize],
    ) -> Result<(SolveReport, Matrix6), PolicyViolation> {
        let report = self.solve().map_err(PolicyViolation::Solver)?;
        let first_free = self.first_free();

        for node in &self.graph.nodes()[first_free..] {
            if !node.is_finite() {
                return Err(PolicyViolation::NonFinite);
            }
            let accel = node.bias.accel.norm();
            let gyro = node.bias.gyro.norm();
            if accel > self.max_accel_bias || gyro > self.max_gyro_bias {
                return Err(PolicyViolation::BiasOutOfRange { accel, gyro });
            }
        }

        let worst = new_aux
            .iter()
            .filter_map(|&id| self.graph.factor(id).filter(|e| e.active).map(|e| (id, e)))
            .map(|(id, entry)| (id, entry.factor.chi2(self.graph.nodes())))
            .max_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((factor, chi2)) = worst {
            if chi2 > self.outlier_chi2 {
                return Err(PolicyViolation::Outlier { factor, chi2 });
            }
        }

        let covariance = self.bias_marginal().map_err(PolicyViolation::Solver)?;
        if !covariance.iter().all(|v| v.is_finite()) {
            return Err(PolicyViolation::NonFinite);
        }
        let max_variance = |range: std::ops::Range<usize>| {
            range.map(|i| covariance[(i, i)]).fold(0.0, f64::max)
        };
        let accel_sigma = max_variance(0..3).sqrt();
        let gyro_sigma = max_variance(3..6).sqrt();
        if accel_sigma > self.max_accel_bias_sigma || gyro_sigma > self.max_gyro_bias_sigma {
            return Err(PolicyViolation::BiasUncertain {
                accel_sigma,
                gyro_sigma,
            });
        }

        Ok((report, covariance))
    }
}

/// `BIAS_DIM`-square block of `H⁻¹` starting at `offset`, from the Cholesky factor
fn marginal_block(mut information: DMatrix<f64>, offset: usize) -> SmootherResult<Matrix6> {
    let n = information.nrows();
    if offset + BIAS_DIM > n {
        return Err(SmootherError::Singular);
    }
    for i in 0..n {
        information[(i, i)] += BASE_DAMPING;
    }
    let chol = information.cholesky().ok_or(SmootherError::Singular)?;
    let mut unit = DMatrix::<f64>::zeros(n, BIAS_DIM);
    for k in 0..BIAS_DIM {
        unit[(offset + k, k)] = 1.0;
    }
    let columns = chol.solve(&unit);
    Ok(Matrix6::from_fn(|r, c| columns[(offset + r, c)]))
}

/// Solve `(H + λI) δ = -g`, raising λ until the system factorizes
fn solve_damped(
    hessian: &DMatrix<f64>,
    gradient: &DVector<f64>,
    lambda: &mut f64,
) -> SmootherResult<DVector<f64>> {
    loop {
        let mut damped = hessian.clone();
        for i in 0..damped.nrows() {
            damped[(i, i)] += *lambda + BASE_DAMPING;
        }
        if let Some(chol) = damped.cholesky() {
            return Ok(-chol.solve(gradient));
        }
        *lambda = if *lambda == 0.0 { 1e-6 } else { *lambda * 10.0 };
        if *lambda > MAX_DAMPING {
            return Err(SmootherError::Singular);
        }
    }
}

impl Smoother for IncrementalSmoother {
    fn initialize(
        &mut self,
        timestamp: f64,
        nav: NavState,
        bias: ImuBias,
        sigmas: &PriorSigmas,
    ) -> SmootherResult<OptimizedState> {
        if self.graph.num_nodes() > 0 {
            return Err(SmootherError::AlreadyInitialized);
        }
        if !sigmas.is_valid() {
            return Err(SmootherError::InvalidCovariance("prior"));
        }

        let node = self.graph.add_node(NodeState::new(timestamp, nav, bias));
        let (accel_var, gyro_var) = (sigmas.accel_bias.powi(2), sigmas.gyro_bias.powi(2));
        self.bias_covariance = Matrix6::from_diagonal(&Vector6::new(
            accel_var, accel_var, accel_var, gyro_var, gyro_var, gyro_var,
        ));
        self.graph.add_factor(GraphFactor::Prior {
            node,
            factor: PriorFactor::new(nav, bias, sigmas),
        });
        log::info!(
            "smoother initialized at t={:.3} position=({:.2}, {:.2}, {:.2})",
            timestamp,
            nav.position.x,
            nav.position.y,
            nav.position.z
        );
        Ok(NodeState::new(timestamp, nav, bias).to_optimized(node, self.bias_covariance))
    }

    fn add_epoch(
        &mut self,
        timestamp: f64,
        motion: PreintegratedMotion,
        position: Option<PositionConstraint>,
        odometry: Option<RelativeMotion>,
    ) -> SmootherResult<EpochResult> {
        let started = Instant::now();
        let previous = *self
            .graph
            .last_node()
            .ok_or(SmootherError::NotInitialized)?;

        if !(timestamp > previous.timestamp) {
            return Err(SmootherError::NonMonotonicEpoch {
                previous: previous.timestamp,
                next: timestamp,
            });
        }
        if (motion.start - previous.timestamp).abs() > WINDOW_TOLERANCE
            || (motion.end - timestamp).abs() > WINDOW_TOLERANCE
        {
            return Err(SmootherError::WindowMismatch {
                start: motion.start,
                end: motion.end,
                expected_start: previous.timestamp,
                expected_end: timestamp,
            });
        }

        let mut dropped = 0;
        let odometry = match odometry {
            Some(rel)
                if (rel.start - previous.timestamp).abs() > WINDOW_TOLERANCE
                    || (rel.end - timestamp).abs() > WINDOW_TOLERANCE =>
            {
                log::warn!(
                    "odometry window [{:.3}, {:.3}] does not match epoch, constraint dropped",
                    rel.start,
                    rel.end
                );
                dropped += 1;
                None
            }
            other => other,
        };

        let degraded = motion.degraded;
        let dt = motion.duration();
        let predicted = NodeState::new(
            timestamp,
            motion.predict(&previous.nav, &previous.bias, &self.gravity),
            previous.bias,
        );
        let imu_factor = ImuFactor::new(motion, self.gravity)?;

        let prev_index = self.graph.num_nodes() - 1;
        let first_free = (prev_index + 1).saturating_sub(self.settings.window);
        let saved = self.graph.snapshot_from(first_free);

        let index = self.graph.add_node(predicted);
        self.graph.add_factor(GraphFactor::Imu {
            from: prev_index,
            to: index,
            factor: imu_factor,
        });
        let walk = BiasRandomWalk::new(self.accel_bias_walk, self.gyro_bias_walk, dt);
        let walk_growth = Matrix6::from_diagonal(&walk.sigma().component_mul(walk.sigma()));
        self.graph.add_factor(GraphFactor::BiasWalk {
            from: prev_index,
            to: index,
            factor: walk,
        });

        let mut new_aux = Vec::with_capacity(2);
        let position_id = position.map(|constraint| {
            self.graph.add_factor(GraphFactor::Position {
                node: index,
                constraint,
            })
        });
        new_aux.extend(position_id);
        if let Some(motion) = odometry {
            new_aux.push(self.graph.add_factor(GraphFactor::Odometry {
                from: prev_index,
                to: index,
                motion,
            }));
        }

        let mut prediction_only = false;
        let mut outcome = self.solve_checked(&new_aux);
        let (report, bias_covariance) = loop {
            let violation = match outcome {
                Ok(solved) => break solved,
                Err(violation) => violation,
            };

            self.graph.restore_from(first_free, &saved);
            self.graph.set_node(index, predicted);

            let culprits: Vec<usize> = match violation {
                PolicyViolation::Outlier { factor, .. } => vec![factor],
                _ => new_aux
                    .iter()
                    .copied()
                    .filter(|&id| self.graph.factor(id).is_some_and(|e| e.active))
                    .collect(),
            };

            if culprits.is_empty() {
                log::warn!(
                    "epoch {} at t={:.3}: {}, keeping inertial prediction",
                    index,
                    timestamp,
                    violation
                );
                prediction_only = true;
                // No solution to marginalize: the bias only random-walks from the previous node
                break (SolveReport::default(), self.bias_covariance + walk_growth);
            }

            for id in culprits {
                if let Some(entry) = self.graph.factor(id) {
                    log::warn!(
                        "epoch {} at t={:.3}: {}, dropping {} constraint",
                        index,
                        timestamp,
                        violation,
                        entry.factor.label()
                    );
                }
                self.graph.deactivate(id);
                dropped += 1;
            }
            outcome = self.solve_checked(&new_aux);
        };

        self.bias_covariance = bias_covariance;
        let node = self.graph.nodes()[index];
        let fix_used = position_id
            .and_then(|id| self.graph.factor(id))
            .is_some_and(|entry| entry.active);
        let solve_time = started.elapsed();
        log::debug!(
            "epoch {} t={:.3} iters={} converged={} cost={:.3} dropped={} solve={:?}",
            index,
            timestamp,
            report.iterations,
            report.converged,
            report.cost,
            dropped,
            solve_time
        );

        Ok(EpochResult {
            state: node.to_optimized(index, bias_covariance),
            degraded,
            dropped_constraints: dropped,
            fix_used,
            prediction_only,
            iterations: report.iterations,
            converged: report.converged,
            solve_time,
        })
    }

    fn current_estimate(&self) -> Option<OptimizedState> {
        let index = self.graph.num_nodes().checked_sub(1)?;
        self.graph
            .last_node()
            .map(|n| n.to_optimized(index, self.bias_covariance))
    }

    fn num_nodes(&self) -> usize {
        self.graph.num_nodes()
    }

    fn num_factors(&self) -> usize {
        self.graph.num_factors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::Preintegrator;
    use crate::types::InertialSample;
    use nalgebra::UnitQuaternion;

    fn config() -> EstimatorConfig {
        EstimatorConfig {
            gps_sigma: 0.5,
            ..EstimatorConfig::default()
        }
    }

    fn sigmas(config: &EstimatorConfig) -> PriorSigmas {
        PriorSigmas::from_config(config)
    }

    /// Level vehicle moving at constant `speed` along east
    fn imu_window(start: f64, end: f64) -> Vec<InertialSample> {
        let n = ((end - start) * 100.0).round() as usize;
        (0..=n)
            .map(|i| {
                InertialSample::new(
                    start + i as f64 * 0.01,
                    Vector3::new(0.0, 0.0, 9.81),
                    Vector3::zeros(),
                )
            })
            .collect()
    }

    fn start_state(speed: f64) -> NavState {
        NavState::new(UnitQuaternion::identity(), Vector3::zeros(), Vector3::new(speed, 0.0, 0.0))
    }

    fn initialized(config: &EstimatorConfig) -> IncrementalSmoother {
        let mut smoother = IncrementalSmoother::new(config);
        smoother
            .initialize(0.0, start_state(1.0), ImuBias::zero(), &sigmas(config))
            .unwrap();
        smoother
    }

    fn epoch(
        smoother: &mut IncrementalSmoother,
        config: &EstimatorConfig,
        start: f64,
        end: f64,
        fix: Option<Vector3<f64>>,
    ) -> EpochResult {
        let motion = Preintegrator::from_config(config).integrate(&imu_window(start, end), start, end, &ImuBias::zero());
        let position = fix.map(|p| PositionConstraint::new(end, p, config.gps_sigma, Vector3::zeros()));
        smoother.add_epoch(end, motion, position, None).unwrap()
    }

    #[test]
    fn test_initialize_twice_rejected() {
        let config = config();
        let mut smoother = initialized(&config);
        let err = smoother
            .initialize(0.0, NavState::identity(), ImuBias::zero(), &sigmas(&config))
            .unwrap_err();
        assert_eq!(err, SmootherError::AlreadyInitialized);
        assert_eq!(smoother.num_nodes(), 1);
        assert_eq!(smoother.num_factors(), 1);
    }

    #[test]
    fn test_add_epoch_requires_initialization() {
        let config = config();
        let mut smoother = IncrementalSmoother::new(&config);
        let motion = PreintegratedMotion::new(0.0, ImuBias::zero());
        let err = smoother.add_epoch(1.0, motion, None, None).unwrap_err();
        assert_eq!(err, SmootherError::NotInitialized);
        assert!(smoother.current_estimate().is_none());
    }

    #[test]
    fn test_non_monotonic_epoch_rejected() {
        let config = config();
        let mut smoother = initialized(&config);
        epoch(&mut smoother, &config, 0.0, 1.0, Some(Vector3::new(1.0, 0.0, 0.0)));
        let motion = Preintegrator::from_config(&config).integrate(&imu_window(1.0, 1.5), 1.0, 1.0, &ImuBias::zero());
        let err = smoother.add_epoch(1.0, motion, None, None).unwrap_err();
        assert!(matches!(err, SmootherError::NonMonotonicEpoch { .. }));
        assert_eq!(smoother.num_nodes(), 2);
    }

    #[test]
    fn test_window_mismatch_rejected() {
        let config = config();
        let mut smoother = initialized(&config);
        let motion = Preintegrator::from_config(&config).integrate(&imu_window(0.0, 1.0), 0.2, 1.0, &ImuBias::zero());
        let err = smoother.add_epoch(1.0, motion, None, None).unwrap_err();
        assert!(matches!(err, SmootherError::WindowMismatch { .. }));
        assert_eq!(smoother.num_nodes(), 1);
    }

    #[test]
    fn test_ten_consistent_epochs_bounded_error() {
        let config = config();
        let mut smoother = initialized(&config);
        for k in 0..10 {
            let (start, end) = (k as f64, (k + 1) as f64);
            let result = epoch(&mut smoother, &config, start, end, Some(Vector3::new(end, 0.0, 0.0)));
            assert_eq!(result.dropped_constraints, 0);
            assert!(result.fix_used);
            assert!(!result.prediction_only);
            assert_eq!(result.state.epoch, k + 1);
        }

        let estimate = smoother.current_estimate().unwrap();
        assert_eq!(estimate.timestamp, 10.0);
        assert!((estimate.nav.position - Vector3::new(10.0, 0.0, 0.0)).norm() < 0.5);
        assert!((estimate.nav.velocity - Vector3::new(1.0, 0.0, 0.0)).norm() < 0.2);
        assert_eq!(smoother.num_nodes(), 11);
        // prior + (inertial, bias walk, position) per epoch
        assert_eq!(smoother.num_factors(), 1 + 3 * 10);
    }

    #[test]
    fn test_sliding_window_keeps_solving() {
        let config = EstimatorConfig {
            smoother_window: 4,
            ..config()
        };
        let mut smoother = initialized(&config);
        for k in 0..25 {
            let (start, end) = (k as f64 * 0.5, (k + 1) as f64 * 0.5);
            epoch(&mut smoother, &config, start, end, Some(Vector3::new(end, 0.0, 0.0)));
        }
        let estimate = smoother.current_estimate().unwrap();
        assert!((estimate.nav.position.x - 12.5).abs() < 0.5);
        assert_eq!(smoother.num_nodes(), 26);
    }

    #[test]
    fn test_outlier_fix_dropped() {
        let config = config();
        let mut smoother = initialized(&config);
        for k in 0..3 {
            epoch(&mut smoother, &config, k as f64, (k + 1) as f64, Some(Vector3::new((k + 1) as f64, 0.0, 0.0)));
        }
        let result = epoch(&mut smoother, &config, 3.0, 4.0, Some(Vector3::new(4.0, 150.0, 0.0)));
        assert_eq!(result.dropped_constraints, 1);
        assert!(!result.fix_used);
        assert!(!result.prediction_only);
        assert!((result.state.nav.position - Vector3::new(4.0, 0.0, 0.0)).norm() < 0.5);

        let entry = smoother.graph().factor(smoother.num_factors() - 1).unwrap();
        assert!(!entry.active);
    }

    #[test]
    fn test_bias_covariance_reported() {
        let config = config();
        let mut smoother = initialized(&config);
        let prior = smoother.current_estimate().unwrap().bias_covariance;
        assert_eq!(prior[(0, 0)], config.prior_accel_bias_sigma.powi(2));

        let result = epoch(&mut smoother, &config, 0.0, 1.0, Some(Vector3::new(1.0, 0.0, 0.0)));
        let covariance = result.state.bias_covariance;
        for i in 0..6 {
            assert!(covariance[(i, i)] > 0.0);
        }
        // Information only accumulates: never much looser than prior plus one step of walk
        assert!(covariance[(0, 0)].sqrt() < 2.0 * config.prior_accel_bias_sigma);
        assert!(covariance[(5, 5)].sqrt() < 2.0 * config.prior_gyro_bias_sigma);
        assert_eq!(smoother.current_estimate().unwrap().bias_covariance, covariance);
    }

    #[test]
    fn test_unobservable_bias_drops_constraint_then_predicts() {
        let config = EstimatorConfig {
            max_accel_bias_sigma: 1e-4,
            ..config()
        };
        let mut smoother = initialized(&config);
        let result = epoch(&mut smoother, &config, 0.0, 1.0, Some(Vector3::new(1.0, 0.0, 0.0)));
        assert_eq!(result.dropped_constraints, 1);
        assert!(!result.fix_used);
        assert!(result.prediction_only);
        assert!(!smoother.graph().factor(smoother.num_factors() - 1).unwrap().active);

        // Held on the prediction; uncertainty grows by the walk
        assert!((result.state.nav.position - Vector3::new(1.0, 0.0, 0.0)).norm() < 1e-3);
        let walk_var = config.accel_bias_random_walk.powi(2) * 1.0;
        let expected = config.prior_accel_bias_sigma.powi(2) + walk_var;
        assert!((result.state.bias_covariance[(0, 0)] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_marginal_block_matches_inverse() {
        let mut information = DMatrix::<f64>::identity(8, 8) * 4.0;
        information[(2, 3)] = 1.0;
        information[(3, 2)] = 1.0;
        let block = marginal_block(information.clone(), 2).unwrap();
        let inverse = information.try_inverse().unwrap();
        for r in 0..6 {
            for c in 0..6 {
                assert!((block[(r, c)] - inverse[(r + 2, c + 2)]).abs() < 1e-9);
            }
        }
        assert!(marginal_block(DMatrix::identity(4, 4), 0).is_err());
    }

    #[test]
    fn test_epoch_without_fix_follows_prediction() {
        let config = config();
        let mut smoother = initialized(&config);
        let result = epoch(&mut smoother, &config, 0.0, 1.0, None);
        assert!((result.state.nav.position - Vector3::new(1.0, 0.0, 0.0)).norm() < 1e-3);
        assert_eq!(smoother.num_factors(), 3);
    }

    #[test]
    fn test_degraded_summary_reported() {
        let config = config();
        let mut smoother = initialized(&config);
        let samples: Vec<_> = imu_window(0.0, 1.0)
            .into_iter()
            .filter(|s| s.timestamp < 0.2 || s.timestamp > 0.7)
            .collect();
        let motion = Preintegrator::from_config(&config).integrate(&samples, 0.0, 1.0, &ImuBias::zero());
        let result = smoother
            .add_epoch(1.0, motion, Some(PositionConstraint::new(1.0, Vector3::new(1.0, 0.0, 0.0), 0.5, Vector3::zeros())), None)
            .unwrap();
        assert!(result.degraded);
    }

    #[test]
    fn test_mismatched_odometry_window_dropped() {
        let config = config();
        let mut smoother = initialized(&config);
        let motion = Preintegrator::from_config(&config).integrate(&imu_window(0.0, 1.0), 0.0, 1.0, &ImuBias::zero());
        let odometry = crate::factors::OdometryIntegrator::from_config(&config)
            .integrate(0.5, 1.0, &[crate::types::OdometrySample::new(0.5, Vector3::new(1.0, 0.0, 0.0), Vector3::zeros())])
            .unwrap();
        let result = smoother.add_epoch(1.0, motion, None, Some(odometry)).unwrap();
        assert_eq!(result.dropped_constraints, 1);
        assert_eq!(smoother.num_factors(), 3);
    }
}
