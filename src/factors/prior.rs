//! Prior on the first node and the bias random walk between epochs.

use nalgebra::Vector3;

use crate::config::EstimatorConfig;
use crate::types::{
    so3_log, ImuBias, NavState, Vector15, Vector6, NODE_ACC_BIAS, NODE_GYRO_BIAS, NODE_POS,
    NODE_ROT, NODE_VEL,
};

/// Standard deviations for the node-0 prior
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PriorSigmas {
    pub rotation: f64,
    pub position: f64,
    pub velocity: f64,
    pub accel_bias: f64,
    pub gyro_bias: f64,
}

impl PriorSigmas {
    pub fn from_config(config: &EstimatorConfig) -> Self {
        Self {
            rotation: config.prior_rotation_sigma,
            position: config.prior_position_sigma,
            velocity: config.prior_velocity_sigma,
            accel_bias: config.prior_accel_bias_sigma,
            gyro_bias: config.prior_gyro_bias_sigma,
        }
    }

    fn as_vector(&self) -> Vector15 {
        let mut sigma = Vector15::zeros();
        sigma.fixed_rows_mut::<3>(NODE_ROT).fill(self.rotation);
        sigma.fixed_rows_mut::<3>(NODE_POS).fill(self.position);
        sigma.fixed_rows_mut::<3>(NODE_VEL).fill(self.velocity);
        sigma.fixed_rows_mut::<3>(NODE_ACC_BIAS).fill(self.accel_bias);
        sigma.fixed_rows_mut::<3>(NODE_GYRO_BIAS).fill(self.gyro_bias);
        sigma
    }

    pub fn is_valid(&self) -> bool {
        [self.rotation, self.position, self.velocity, self.accel_bias, self.gyro_bias]
            .iter()
            .all(|s| s.is_finite() && *s > 0.0)
    }
}

/// Anchors a node to a known navigation state and bias
#[derive(Clone, Debug, PartialEq)]
pub struct PriorFactor {
    pub nav: NavState,
    pub bias: ImuBias,
    sigma: Vector15,
}

impl PriorFactor {
    pub fn new(nav: NavState, bias: ImuBias, sigmas: &PriorSigmas) -> Self {
        Self {
            nav,
            bias,
            sigma: sigmas.as_vector(),
        }
    }

    /// Residual in node tangent order [δθ, δp, δv, δba, δbg]
    pub fn residual(&self, nav: &NavState, bias: &ImuBias) -> Vector15 {
        let mut residual = Vector15::zeros();
        residual
            .fixed_rows_mut::<3>(NODE_ROT)
            .copy_from(&so3_log(&(self.nav.rotation.inverse() * nav.rotation)));
        residual
            .fixed_rows_mut::<3>(NODE_POS)
            .copy_from(&(nav.position - self.nav.position));
        residual
            .fixed_rows_mut::<3>(NODE_VEL)
            .copy_from(&(nav.velocity - self.nav.velocity));
        residual
            .fixed_rows_mut::<3>(NODE_ACC_BIAS)
            .copy_from(&(bias.accel - self.bias.accel));
        residual
            .fixed_rows_mut::<3>(NODE_GYRO_BIAS)
            .copy_from(&(bias.gyro - self.bias.gyro));
        residual
    }

    pub fn whitened_residual(&self, nav: &NavState, bias: &ImuBias) -> Vector15 {
        self.residual(nav, bias).component_div(&self.sigma)
    }
}

/// Bias between-factor: biases drift as a random walk between epochs.
#[derive(Clone, Debug, PartialEq)]
pub struct BiasRandomWalk {
    /// [accel (0:3), gyro (3:6)] standard deviation over the interval
    sigma: Vector6,
}

impl BiasRandomWalk {
    /// `accel_walk` / `gyro_walk` are random-walk densities per √s.
    pub fn new(accel_walk: f64, gyro_walk: f64, dt: f64) -> Self {
        let scale = dt.max(1e-6).sqrt();
        let accel = Vector3::repeat(accel_walk * scale);
        let gyro = Vector3::repeat(gyro_walk * scale);
        let mut sigma = Vector6::zeros();
        sigma.fixed_rows_mut::<3>(0).copy_from(&accel);
        sigma.fixed_rows_mut::<3>(3).copy_from(&gyro);
        Self { sigma }
    }

    pub fn sigma(&self) -> &Vector6 {
        &self.sigma
    }

    pub fn residual(&self, bias_i: &ImuBias, bias_j: &ImuBias) -> Vector6 {
        let mut residual = Vector6::zeros();
        residual
            .fixed_rows_mut::<3>(0)
            .copy_from(&(bias_j.accel - bias_i.accel));
        residual
            .fixed_rows_mut::<3>(3)
            .copy_from(&(bias_j.gyro - bias_i.gyro));
        residual
    }

    pub fn whitened_residual(&self, bias_i: &ImuBias, bias_j: &ImuBias) -> Vector6 {
        self.residual(bias_i, bias_j).component_div(&self.sigma)
    }
}
