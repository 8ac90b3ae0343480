use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EstimatorError, EstimatorResult};
use crate::types::STANDARD_GRAVITY;

/// Axis convention the IMU reports its readings in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameConvention {
    /// x forward, y left, z up
    Enu,
    /// x forward, y right, z down
    Ned,
}

/// What a producer experiences when its queue is full
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Block until the worker drains a slot (or the queue shuts down)
    Block,
    /// Block for at most this many milliseconds, then report a timeout
    BlockFor(u64),
    /// Return immediately with a backpressure error
    Reject,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    // ── Inertial noise model ──
    pub accel_noise_density: f64,
    pub gyro_noise_density: f64,
    pub accel_bias_random_walk: f64,
    pub gyro_bias_random_walk: f64,
    pub gravity: f64,

    // ── Absolute position ──
    pub gps_sigma: f64,
    pub max_fix_error: f64,
    pub gps_lever_arm: [f64; 3],
    pub fix_stale_after: f64,

    // ── Frame alignment ──
    pub invert_x: bool,
    pub invert_y: bool,
    pub invert_z: bool,
    pub imu_frame: FrameConvention,

    // ── Queues / output ──
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub reorder_window_ms: u64,
    pub output_rate_hz: f64,
    pub output_channel_capacity: usize,

    // ── Odometry ──
    pub use_odometry: bool,
    pub odometry_epoch_interval: f64,
    pub odometry_linear_sigma: f64,
    pub odometry_angular_sigma: f64,

    // ── Preintegration ──
    pub max_imu_gap: f64,
    pub degraded_inflation: f64,
    pub init_window_samples: usize,
    pub estimate_initial_gyro_bias: bool,
    /// Allowed |‖mean specific force‖ - gravity| for a window to count as static [m/s²]
    pub static_gravity_tolerance: f64,
    /// Close an inertial-only epoch after this long without a fix [s]
    pub max_epoch_interval: f64,

    // ── Prior on the first node ──
    pub prior_rotation_sigma: f64,
    pub prior_position_sigma: f64,
    pub prior_velocity_sigma: f64,
    pub prior_accel_bias_sigma: f64,
    pub prior_gyro_bias_sigma: f64,

    // ── Smoother ──
    pub smoother_window: usize,
    pub max_iterations: usize,
    pub convergence_threshold: f64,
    pub huber_threshold: f64,
    pub outlier_chi2: f64,
    pub max_accel_bias: f64,
    pub max_gyro_bias: f64,
    /// Largest accepted marginal 1-sigma of the newest accel bias [m/s²]
    pub max_accel_bias_sigma: f64,
    /// Largest accepted marginal 1-sigma of the newest gyro bias [rad/s]
    pub max_gyro_bias_sigma: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            accel_noise_density: 0.02,
            gyro_noise_density: 0.002,
            accel_bias_random_walk: 1e-3,
            gyro_bias_random_walk: 1e-4,
            gravity: STANDARD_GRAVITY,
            gps_sigma: 0.5,
            max_fix_error: 5.0,
            gps_lever_arm: [0.0, 0.0, 0.0],
            fix_stale_after: 2.0,
            invert_x: false,
            invert_y: false,
            invert_z: false,
            imu_frame: FrameConvention::Enu,
            queue_capacity: 400,
            overflow_policy: OverflowPolicy::Block,
            reorder_window_ms: 20,
            output_rate_hz: 50.0,
            output_channel_capacity: 256,
            use_odometry: false,
            odometry_epoch_interval: 0.5,
            odometry_linear_sigma: 0.1,
            odometry_angular_sigma: 0.05,
            max_imu_gap: 0.1,
            degraded_inflation: 100.0,
            init_window_samples: 20,
            estimate_initial_gyro_bias: true,
            static_gravity_tolerance: 0.5,
            max_epoch_interval: 5.0,
            prior_rotation_sigma: 0.1,
            prior_position_sigma: 0.5,
            prior_velocity_sigma: 0.1,
            prior_accel_bias_sigma: 0.1,
            prior_gyro_bias_sigma: 0.01,
            smoother_window: 20,
            max_iterations: 6,
            convergence_threshold: 1e-6,
            huber_threshold: 3.0,
            outlier_chi2: 100.0,
            max_accel_bias: 1.0,
            max_gyro_bias: 0.2,
            max_accel_bias_sigma: 1.0,
            max_gyro_bias_sigma: 0.1,
        }
    }
}

impl EstimatorConfig {
    /// Load a JSON config; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> EstimatorResult<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would make the estimator meaningless.
    pub fn validate(&self) -> EstimatorResult<()> {
        let positive = [
            ("accel_noise_density", self.accel_noise_density),
            ("gyro_noise_density", self.gyro_noise_density),
            ("accel_bias_random_walk", self.accel_bias_random_walk),
            ("gyro_bias_random_walk", self.gyro_bias_random_walk),
            ("gravity", self.gravity),
            ("gps_sigma", self.gps_sigma),
            ("max_fix_error", self.max_fix_error),
            ("fix_stale_after", self.fix_stale_after),
            ("output_rate_hz", self.output_rate_hz),
            ("odometry_epoch_interval", self.odometry_epoch_interval),
            ("odometry_linear_sigma", self.odometry_linear_sigma),
            ("odometry_angular_sigma", self.odometry_angular_sigma),
            ("max_imu_gap", self.max_imu_gap),
            ("max_epoch_interval", self.max_epoch_interval),
            ("static_gravity_tolerance", self.static_gravity_tolerance),
            ("prior_rotation_sigma", self.prior_rotation_sigma),
            ("prior_position_sigma", self.prior_position_sigma),
            ("prior_velocity_sigma", self.prior_velocity_sigma),
            ("prior_accel_bias_sigma", self.prior_accel_bias_sigma),
            ("prior_gyro_bias_sigma", self.prior_gyro_bias_sigma),
            ("huber_threshold", self.huber_threshold),
            ("outlier_chi2", self.outlier_chi2),
            ("max_accel_bias", self.max_accel_bias),
            ("max_gyro_bias", self.max_gyro_bias),
            ("max_accel_bias_sigma", self.max_accel_bias_sigma),
            ("max_gyro_bias_sigma", self.max_gyro_bias_sigma),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(EstimatorError::InvalidConfig(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if self.degraded_inflation < 1.0 {
            return Err(EstimatorError::InvalidConfig(
                "degraded_inflation must be >= 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(EstimatorError::InvalidConfig(
                "queue_capacity must be > 0".to_string(),
            ));
        }
        if self.output_channel_capacity == 0 {
            return Err(EstimatorError::InvalidConfig(
                "output_channel_capacity must be > 0".to_string(),
            ));
        }
        if self.init_window_samples == 0 {
            return Err(EstimatorError::InvalidConfig(
                "init_window_samples must be > 0".to_string(),
            ));
        }
        if self.smoother_window < 2 {
            return Err(EstimatorError::InvalidConfig(
                "smoother_window must hold at least 2 nodes".to_string(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(EstimatorError::InvalidConfig(
                "max_iterations must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reorder_window(&self) -> Duration {
        Duration::from_millis(self.reorder_window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EstimatorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = EstimatorConfig {
            queue_capacity: 0,
            ..EstimatorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EstimatorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_negative_noise_rejected() {
        let config = EstimatorConfig {
            gyro_noise_density: -1.0,
            ..EstimatorConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("gyro_noise_density"));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{ "gps_sigma": 2.0, "use_odometry": true, "imu_frame": "Ned" }"#;
        let config: EstimatorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.gps_sigma, 2.0);
        assert!(config.use_odometry);
        assert_eq!(config.imu_frame, FrameConvention::Ned);
        assert_eq!(config.queue_capacity, EstimatorConfig::default().queue_capacity);
    }

    #[test]
    fn test_overflow_policy_json() {
        let json = r#"{ "overflow_policy": { "BlockFor": 15 } }"#;
        let config: EstimatorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.overflow_policy, OverflowPolicy::BlockFor(15));
    }
}
