//! Wheel odometry between epochs.
//!
//! Body-frame twist samples are dead-reckoned over an epoch window into a
//! relative pose, which then constrains the two epoch nodes it spans.

use nalgebra::{UnitQuaternion, Vector3, Vector6};

use crate::config::EstimatorConfig;
use crate::types::{so3_exp, so3_log, NavState, OdometrySample};

/// Variance floor so a zero-length or noise-free window still whitens
const MIN_VARIANCE: f64 = 1e-8;

/// Relative pose between two epochs measured by wheel odometry
#[derive(Clone, Debug, PartialEq)]
pub struct RelativeMotion {
    pub start: f64,
    pub end: f64,
    /// Rotation from body(end) to body(start)
    pub delta_rotation: UnitQuaternion<f64>,
    /// Displacement expressed in body(start)
    pub delta_position: Vector3<f64>,
    /// Per-axis standard deviation: rotation (0:3, rad), translation (3:6, m)
    pub sigma: Vector6<f64>,
    pub sample_count: usize,
}

impl RelativeMotion {
    /// Residual [δθ, δp] against two navigation states
    pub fn residual(&self, state_i: &NavState, state_j: &NavState) -> Vector6<f64> {
        let ri_inv = state_i.rotation.inverse();
        let rot_error = so3_log(&(self.delta_rotation.inverse() * ri_inv * state_j.rotation));
        let pos_error = ri_inv * (state_j.position - state_i.position) - self.delta_position;

        let mut residual = Vector6::zeros();
        residual.fixed_rows_mut::<3>(0).copy_from(&rot_error);
        residual.fixed_rows_mut::<3>(3).copy_from(&pos_error);
        residual
    }

    pub fn whitened_residual(&self, state_i: &NavState, state_j: &NavState) -> Vector6<f64> {
        self.residual(state_i, state_j).component_div(&self.sigma)
    }

    pub fn chi2(&self, state_i: &NavState, state_j: &NavState) -> f64 {
        self.whitened_residual(state_i, state_j).norm_squared()
    }
}

#[derive(Clone, Debug)]
pub struct OdometryIntegrator {
    /// Linear velocity noise density (m/s/√Hz)
    linear_sigma: f64,
    /// Angular velocity noise density (rad/s/√Hz)
    angular_sigma: f64,
}

impl OdometryIntegrator {
    pub fn new(linear_sigma: f64, angular_sigma: f64) -> Self {
        Self {
            linear_sigma,
            angular_sigma,
        }
    }

    pub fn from_config(config: &EstimatorConfig) -> Self {
        Self::new(config.odometry_linear_sigma, config.odometry_angular_sigma)
    }

    /// Dead-reckon the twist samples over `[start, stop]`.
    ///
    /// Each sample's twist is held until the next one; the first sample is
    /// held back to `start` and the last forward to `stop`. Returns `None`
    /// when there is no sample to integrate.
    pub fn integrate(
        &self,
        start: f64,
        stop: f64,
        samples: &[OdometrySample],
    ) -> Option<RelativeMotion> {
        if stop <= start {
            return None;
        }
        let first = samples.first()?;

        let mut rotation = UnitQuaternion::identity();
        let mut position = Vector3::zeros();
        let mut linear_var = 0.0;
        let mut angular_var = 0.0;

        let mut step = |sample: &OdometrySample, dt: f64| {
            if dt <= 0.0 {
                return;
            }
            position += rotation * (sample.linear * dt);
            rotation *= so3_exp(&(sample.angular * dt));

            // Density terms grow with the interval, reported variances with its square
            linear_var += self.linear_sigma.powi(2) * dt
                + sample.linear_variance.unwrap_or(0.0) * dt * dt;
            angular_var += self.angular_sigma.powi(2) * dt
                + sample.angular_variance.unwrap_or(0.0) * dt * dt;
        };

        if first.timestamp > start {
            step(first, first.timestamp.min(stop) - start);
        }
        for (k, sample) in samples.iter().enumerate() {
            let next_time = samples.get(k + 1).map_or(stop, |n| n.timestamp.min(stop));
            let from = sample.timestamp.max(start);
            if next_time > from {
                step(sample, next_time - from);
            }
        }

        let sample_count = samples
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp <= stop)
            .count();

        let linear_sigma = linear_var.max(MIN_VARIANCE).sqrt();
        let angular_sigma = angular_var.max(MIN_VARIANCE).sqrt();
        Some(RelativeMotion {
            start,
            end: stop,
            delta_rotation: rotation,
            delta_position: position,
            sigma: Vector6::new(
                angular_sigma,
                angular_sigma,
                angular_sigma,
                linear_sigma,
                linear_sigma,
                linear_sigma,
            ),
            sample_count,
        })
    }
}
