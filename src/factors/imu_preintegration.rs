//! IMU preintegration between smoother epochs.
//!
//! Implements on-manifold preintegration (Forster et al., "On-Manifold
//! Preintegration for Real-Time Visual-Inertial Odometry"). Rotation,
//! velocity and position deltas are accumulated in the body frame of the
//! epoch start, together with their 9x9 covariance and the first-order
//! Jacobians needed to re-apply a different bias without re-integrating.

use nalgebra::{Matrix3, SMatrix, UnitQuaternion, Vector3};

use crate::config::EstimatorConfig;
use crate::error::{SmootherError, SmootherResult};
use crate::types::{
    skew_symmetric, so3_exp, so3_log, so3_right_jacobian, sqrt_information, ImuBias,
    InertialSample, Matrix6, Matrix9, NavState, Vector9, PREINT_POS, PREINT_ROT, PREINT_VEL,
};

/// Added to the covariance diagonal before whitening: short windows leave
/// velocity and position almost perfectly correlated.
const COVARIANCE_JITTER: f64 = 1e-9;

/// Preintegrated motion over `[start, end]`
#[derive(Clone, Debug)]
pub struct PreintegratedMotion {
    pub start: f64,
    pub end: f64,

    /// ΔR: rotation from body(end) to body(start)
    pub delta_rotation: UnitQuaternion<f64>,
    /// Δv in the body frame at `start` (gravity excluded)
    pub delta_velocity: Vector3<f64>,
    /// Δp in the body frame at `start` (gravity excluded)
    pub delta_position: Vector3<f64>,

    /// Covariance of [δθ, δv, δp]
    pub covariance: Matrix9,

    /// Bias the deltas were integrated with
    pub bias: ImuBias,

    // ∂ΔR/∂bg, ∂Δv/∂ba, ∂Δv/∂bg, ∂Δp/∂ba, ∂Δp/∂bg
    pub d_rot_d_bg: Matrix3<f64>,
    pub d_vel_d_ba: Matrix3<f64>,
    pub d_vel_d_bg: Matrix3<f64>,
    pub d_pos_d_ba: Matrix3<f64>,
    pub d_pos_d_bg: Matrix3<f64>,

    /// Inertial samples falling inside the window
    pub sample_count: usize,
    /// Largest spacing between inputs used over the window
    pub max_gap: f64,
    /// A gap exceeded the sanity threshold; covariance has been inflated
    pub degraded: bool,
}

impl PreintegratedMotion {
    pub fn new(start: f64, bias: ImuBias) -> Self {
        Self {
            start,
            end: start,
            delta_rotation: UnitQuaternion::identity(),
            delta_velocity: Vector3::zeros(),
            delta_position: Vector3::zeros(),
            covariance: Matrix9::zeros(),
            bias,
            d_rot_d_bg: Matrix3::zeros(),
            d_vel_d_ba: Matrix3::zeros(),
            d_vel_d_bg: Matrix3::zeros(),
            d_pos_d_ba: Matrix3::zeros(),
            d_pos_d_bg: Matrix3::zeros(),
            sample_count: 0,
            max_gap: 0.0,
            degraded: false,
        }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Integrate one constant reading held for `dt` seconds.
    ///
    /// `accel_var` / `gyro_var` are the discrete noise variances for this step.
    fn integrate_step(
        &mut self,
        accel: &Vector3<f64>,
        gyro: &Vector3<f64>,
        dt: f64,
        accel_var: f64,
        gyro_var: f64,
    ) {
        let a = accel - self.bias.accel;
        let w = gyro - self.bias.gyro;
        let dt2 = dt * dt;

        let step_rotation = so3_exp(&(w * dt));
        let step_matrix = step_rotation.to_rotation_matrix().into_inner();
        let jr = so3_right_jacobian(&(w * dt));
        let r = self.delta_rotation.to_rotation_matrix().into_inner();
        let a_skew = skew_symmetric(&a);

        // ── Covariance ──
        let mut state_jac = Matrix9::identity();
        state_jac
            .fixed_view_mut::<3, 3>(PREINT_ROT, PREINT_ROT)
            .copy_from(&step_matrix.transpose());
        state_jac
            .fixed_view_mut::<3, 3>(PREINT_VEL, PREINT_ROT)
            .copy_from(&(-r * a_skew * dt));
        state_jac
            .fixed_view_mut::<3, 3>(PREINT_POS, PREINT_ROT)
            .copy_from(&(-0.5 * r * a_skew * dt2));
        state_jac
            .fixed_view_mut::<3, 3>(PREINT_POS, PREINT_VEL)
            .copy_from(&(Matrix3::identity() * dt));

        // Noise columns: accel (0:3), gyro (3:6)
        let mut noise_jac = SMatrix::<f64, 9, 6>::zeros();
        noise_jac
            .fixed_view_mut::<3, 3>(PREINT_ROT, 3)
            .copy_from(&(jr * dt));
        noise_jac
            .fixed_view_mut::<3, 3>(PREINT_VEL, 0)
            .copy_from(&(r * dt));
        noise_jac
            .fixed_view_mut::<3, 3>(PREINT_POS, 0)
            .copy_from(&(0.5 * r * dt2));

        let mut noise = Matrix6::zeros();
        for i in 0..3 {
            noise[(i, i)] = accel_var;
            noise[(i + 3, i + 3)] = gyro_var;
        }

        self.covariance = state_jac * self.covariance * state_jac.transpose()
            + noise_jac * noise * noise_jac.transpose();

        // ── Bias Jacobians (position first: it needs the previous velocity terms) ──
        self.d_pos_d_ba += self.d_vel_d_ba * dt - 0.5 * r * dt2;
        self.d_pos_d_bg += self.d_vel_d_bg * dt - 0.5 * r * a_skew * self.d_rot_d_bg * dt2;
        self.d_vel_d_ba -= r * dt;
        self.d_vel_d_bg -= r * a_skew * self.d_rot_d_bg * dt;
        self.d_rot_d_bg = step_matrix.transpose() * self.d_rot_d_bg - jr * dt;

        // ── Deltas ──
        self.delta_position += self.delta_velocity * dt + 0.5 * r * a * dt2;
        self.delta_velocity += r * a * dt;
        self.delta_rotation *= step_rotation;
        self.end += dt;
    }

    /// Deltas re-linearized to `bias` with the first-order Jacobians
    pub fn corrected(&self, bias: &ImuBias) -> (UnitQuaternion<f64>, Vector3<f64>, Vector3<f64>) {
        let dba = bias.accel - self.bias.accel;
        let dbg = bias.gyro - self.bias.gyro;

        let rotation = self.delta_rotation * so3_exp(&(self.d_rot_d_bg * dbg));
        let velocity = self.delta_velocity + self.d_vel_d_ba * dba + self.d_vel_d_bg * dbg;
        let position = self.delta_position + self.d_pos_d_ba * dba + self.d_pos_d_bg * dbg;
        (rotation, velocity, position)
    }

    /// Propagate `state` across the window
    pub fn predict(&self, state: &NavState, bias: &ImuBias, gravity: &Vector3<f64>) -> NavState {
        let (dr, dv, dp) = self.corrected(bias);
        let dt = self.duration();
        NavState::new(
            state.rotation * dr,
            state.position + state.velocity * dt + gravity * (0.5 * dt * dt) + state.rotation * dp,
            state.velocity + gravity * dt + state.rotation * dv,
        )
    }
}

/// Builds `PreintegratedMotion` summaries for epoch windows.
#[derive(Clone, Debug)]
pub struct Preintegrator {
    accel_noise_density: f64,
    gyro_noise_density: f64,
    max_gap: f64,
    degraded_inflation: f64,
}

impl Preintegrator {
    pub fn new(
        accel_noise_density: f64,
        gyro_noise_density: f64,
        max_gap: f64,
        degraded_inflation: f64,
    ) -> Self {
        Self {
            accel_noise_density,
            gyro_noise_density,
            max_gap,
            degraded_inflation,
        }
    }

    pub fn from_config(config: &EstimatorConfig) -> Self {
        Self::new(
            config.accel_noise_density,
            config.gyro_noise_density,
            config.max_imu_gap,
            config.degraded_inflation,
        )
    }

    /// Summarize the motion over exactly `[start, end]`.
    ///
    /// `samples` must be time ordered; samples outside the window only bound
    /// the interpolation at its edges. Consecutive samples are averaged
    /// (midpoint rule). Before the first and after the last sample the
    /// nearest reading is held.
    pub fn integrate(
        &self,
        samples: &[InertialSample],
        start: f64,
        end: f64,
        bias: &ImuBias,
    ) -> PreintegratedMotion {
        let mut motion = PreintegratedMotion::new(start, *bias);
        if end <= start {
            return motion;
        }

        let (first, last) = match (samples.first(), samples.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => {
                // Nothing to integrate: keep the window but make the factor weak
                motion.end = end;
                motion.max_gap = end - start;
                motion.degraded = true;
                motion.covariance = Matrix9::identity() * self.degraded_inflation;
                return motion;
            }
        };

        motion.sample_count = samples
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp <= end)
            .count();

        if first.timestamp > start {
            let hold = first.timestamp.min(end) - start;
            self.step(&mut motion, &first.accel, &first.gyro, hold);
        }

        for pair in samples.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            let lo = a.timestamp.max(start);
            let hi = b.timestamp.min(end);
            if hi <= lo {
                continue;
            }
            let accel = 0.5 * (a.accel + b.accel);
            let gyro = 0.5 * (a.gyro + b.gyro);
            motion.max_gap = motion.max_gap.max(b.timestamp - a.timestamp);
            self.step(&mut motion, &accel, &gyro, hi - lo);
        }

        if last.timestamp < end {
            let hold = end - last.timestamp.max(start);
            self.step(&mut motion, &last.accel, &last.gyro, hold);
        }

        // Hold segments count as gaps as well
        motion.max_gap = motion
            .max_gap
            .max(first.timestamp - start)
            .max(end - last.timestamp);

        // Guard against accumulated rounding on the window end
        motion.end = end;

        if motion.max_gap > self.max_gap {
            log::warn!(
                "inertial gap of {:.3}s in window [{:.3}, {:.3}], summary degraded",
                motion.max_gap,
                start,
                end
            );
            motion.degraded = true;
            motion.covariance *= self.degraded_inflation;
        }

        motion
    }

    fn step(&self, motion: &mut PreintegratedMotion, accel: &Vector3<f64>, gyro: &Vector3<f64>, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        let accel_var = self.accel_noise_density.powi(2) / dt;
        let gyro_var = self.gyro_noise_density.powi(2) / dt;
        motion.integrate_step(accel, gyro, dt, accel_var, gyro_var);
    }
}

/// Initial attitude and gyro bias from a static window.
///
/// The mean specific force points along world up when the vehicle is at rest;
/// yaw is unobservable and left at zero. A window whose mean specific force
/// differs from `gravity` by more than `tolerance` is not static and yields
/// `None`.
pub fn align_static(
    samples: &[InertialSample],
    gravity: f64,
    tolerance: f64,
    estimate_gyro_bias: bool,
) -> Option<(UnitQuaternion<f64>, ImuBias)> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f64;
    let mean_accel = samples.iter().map(|s| s.accel).sum::<Vector3<f64>>() / n;
    let mean_gyro = samples.iter().map(|s| s.gyro).sum::<Vector3<f64>>() / n;

    if !mean_accel.iter().all(|v| v.is_finite()) || !mean_gyro.iter().all(|v| v.is_finite()) {
        return None;
    }
    if (mean_accel.norm() - gravity).abs() > tolerance {
        log::debug!(
            "window not static: |mean specific force| {:.3} vs gravity {:.3}",
            mean_accel.norm(),
            gravity
        );
        return None;
    }

    let up = Vector3::z();
    let rotation = UnitQuaternion::rotation_between(&mean_accel, &up).unwrap_or_else(|| {
        // Antiparallel: upside down
        UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI)
    });

    let gyro_bias = if estimate_gyro_bias {
        mean_gyro
    } else {
        Vector3::zeros()
    };
    Some((rotation, ImuBias::new(Vector3::zeros(), gyro_bias)))
}

/// Inertial factor between two consecutive epoch nodes.
///
/// Residual order is [δθ, δv, δp], matching the summary covariance.
#[derive(Clone, Debug)]
pub struct ImuFactor {
    pub motion: PreintegratedMotion,
    pub gravity: Vector3<f64>,
    whitening: Matrix9,
}

impl ImuFactor {
    pub fn new(motion: PreintegratedMotion, gravity: Vector3<f64>) -> SmootherResult<Self> {
        let covariance = motion.covariance + Matrix9::identity() * COVARIANCE_JITTER;
        let dynamic = nalgebra::DMatrix::from_iterator(9, 9, covariance.iter().cloned());
        let whitening = sqrt_information(&dynamic)
            .map(|w| Matrix9::from_iterator(w.iter().cloned()))
            .ok_or(SmootherError::InvalidCovariance("inertial factor"))?;
        Ok(Self {
            motion,
            gravity,
            whitening,
        })
    }

    pub fn residual(
        &self,
        state_i: &NavState,
        bias_i: &ImuBias,
        state_j: &NavState,
    ) -> Vector9 {
        let (dr, dv, dp) = self.motion.corrected(bias_i);
        let dt = self.motion.duration();
        let g = &self.gravity;
        let ri_inv = state_i.rotation.inverse();

        let rot_error = so3_log(&(dr.inverse() * ri_inv * state_j.rotation));
        let vel_error = ri_inv * (state_j.velocity - state_i.velocity - g * dt) - dv;
        let pos_error = ri_inv
            * (state_j.position - state_i.position - state_i.velocity * dt - g * (0.5 * dt * dt))
            - dp;

        let mut residual = Vector9::zeros();
        residual.fixed_rows_mut::<3>(PREINT_ROT).copy_from(&rot_error);
        residual.fixed_rows_mut::<3>(PREINT_VEL).copy_from(&vel_error);
        residual.fixed_rows_mut::<3>(PREINT_POS).copy_from(&pos_error);
        residual
    }

    pub fn whitened_residual(
        &self,
        state_i: &NavState,
        bias_i: &ImuBias,
        state_j: &NavState,
    ) -> Vector9 {
        self.whitening * self.residual(state_i, bias_i, state_j)
    }
}
