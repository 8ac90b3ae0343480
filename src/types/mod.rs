pub mod linalg;

pub use linalg::*;

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Earth gravity used when no configuration overrides it (m/s²)
pub const STANDARD_GRAVITY: f64 = 9.81;

/// Raw inertial sample: specific force and angular rate in the sensor frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InertialSample {
    pub timestamp: f64,
    /// Linear acceleration [m/s²]
    pub accel: Vector3<f64>,
    /// Angular rate [rad/s]
    pub gyro: Vector3<f64>,
}

impl InertialSample {
    pub fn new(timestamp: f64, accel: Vector3<f64>, gyro: Vector3<f64>) -> Self {
        Self {
            timestamp,
            accel,
            gyro,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.timestamp.is_finite()
            && self.accel.iter().chain(self.gyro.iter()).all(|v| v.is_finite())
    }
}

/// Geodetic position fix from a GNSS receiver
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    pub timestamp: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    /// Reported 1-sigma horizontal error [m]
    pub accuracy: f64,
    /// Receiver-reported validity (false = no fix)
    #[serde(default = "default_valid")]
    pub valid: bool,
}

fn default_valid() -> bool {
    true
}

impl PositionFix {
    pub fn new(timestamp: f64, latitude: f64, longitude: f64, altitude: f64, accuracy: f64) -> Self {
        Self {
            timestamp,
            latitude,
            longitude,
            altitude,
            accuracy,
            valid: true,
        }
    }
}

/// Wheel odometry twist in the vehicle body frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OdometrySample {
    pub timestamp: f64,
    /// Linear velocity [m/s]
    pub linear: Vector3<f64>,
    /// Angular velocity [rad/s]
    pub angular: Vector3<f64>,
    /// Reported linear velocity variance [m²/s²], if the source provides one
    #[serde(default)]
    pub linear_variance: Option<f64>,
    /// Reported angular velocity variance [rad²/s²]
    #[serde(default)]
    pub angular_variance: Option<f64>,
}

impl OdometrySample {
    pub fn new(timestamp: f64, linear: Vector3<f64>, angular: Vector3<f64>) -> Self {
        Self {
            timestamp,
            linear,
            angular,
            linear_variance: None,
            angular_variance: None,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.timestamp.is_finite()
            && self.linear.iter().chain(self.angular.iter()).all(|v| v.is_finite())
    }
}

/// Any sample the fusion worker consumes, tagged by stream
#[derive(Clone, Debug, PartialEq)]
pub enum SensorSample {
    Inertial(InertialSample),
    Fix(PositionFix),
    Odometry(OdometrySample),
}

impl SensorSample {
    pub fn timestamp(&self) -> f64 {
        match self {
            SensorSample::Inertial(s) => s.timestamp,
            SensorSample::Fix(f) => f.timestamp,
            SensorSample::Odometry(o) => o.timestamp,
        }
    }

    /// Fix values are screened by the local frame converter instead
    pub fn has_finite_readings(&self) -> bool {
        match self {
            SensorSample::Inertial(s) => s.is_finite(),
            SensorSample::Fix(f) => f.timestamp.is_finite(),
            SensorSample::Odometry(o) => o.is_finite(),
        }
    }

    pub fn stream(&self) -> StreamKind {
        match self {
            SensorSample::Inertial(_) => StreamKind::Inertial,
            SensorSample::Fix(_) => StreamKind::Fix,
            SensorSample::Odometry(_) => StreamKind::Odometry,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Inertial,
    Fix,
    Odometry,
}

/// Accelerometer and gyroscope biases
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImuBias {
    /// Accelerometer bias [m/s²]
    pub accel: Vector3<f64>,
    /// Gyroscope bias [rad/s]
    pub gyro: Vector3<f64>,
}

impl ImuBias {
    pub fn new(accel: Vector3<f64>, gyro: Vector3<f64>) -> Self {
        Self { accel, gyro }
    }

    pub fn zero() -> Self {
        Self::new(Vector3::zeros(), Vector3::zeros())
    }

    pub fn is_finite(&self) -> bool {
        self.accel.iter().chain(self.gyro.iter()).all(|v| v.is_finite())
    }
}

impl Default for ImuBias {
    fn default() -> Self {
        Self::zero()
    }
}

/// Navigation state: body-to-world rotation, position and velocity (world frame)
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NavState {
    pub rotation: UnitQuaternion<f64>,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
}

impl NavState {
    pub fn new(
        rotation: UnitQuaternion<f64>,
        position: Vector3<f64>,
        velocity: Vector3<f64>,
    ) -> Self {
        Self {
            rotation,
            position,
            velocity,
        }
    }

    pub fn identity() -> Self {
        Self::new(UnitQuaternion::identity(), Vector3::zeros(), Vector3::zeros())
    }

    pub fn is_finite(&self) -> bool {
        self.rotation.coords.iter().all(|v| v.is_finite())
            && self.position.iter().all(|v| v.is_finite())
            && self.velocity.iter().all(|v| v.is_finite())
    }

    /// Constant-input strapdown step in the world frame.
    ///
    /// `accel` and `gyro` are already bias-corrected body-frame readings and
    /// `gravity` is the world-frame gravity vector.
    pub fn integrate(
        &self,
        accel: &Vector3<f64>,
        gyro: &Vector3<f64>,
        gravity: &Vector3<f64>,
        dt: f64,
    ) -> NavState {
        let accel_world = self.rotation * accel + gravity;
        let position = self.position + self.velocity * dt + 0.5 * accel_world * dt * dt;
        let velocity = self.velocity + accel_world * dt;
        let rotation = self.rotation * so3_exp(&(gyro * dt));
        NavState::new(rotation, position, velocity)
    }
}

impl Default for NavState {
    fn default() -> Self {
        Self::identity()
    }
}

/// Smoother output for the newest epoch, shared with readers as one value
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizedState {
    pub timestamp: f64,
    pub epoch: usize,
    pub nav: NavState,
    pub bias: ImuBias,
    /// Marginal covariance of `bias`, accelerometer block first
    pub bias_covariance: Matrix6,
}

/// Bias estimate with its uncertainty, as reported to consumers
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BiasEstimate {
    pub bias: ImuBias,
    pub covariance: Matrix6,
}

impl BiasEstimate {
    /// 1-sigma accelerometer bias per axis [m/s²]
    pub fn accel_sigma(&self) -> Vector3<f64> {
        Vector3::from_fn(|i, _| self.covariance[(i, i)].max(0.0).sqrt())
    }

    /// 1-sigma gyroscope bias per axis [rad/s]
    pub fn gyro_sigma(&self) -> Vector3<f64> {
        Vector3::from_fn(|i, _| self.covariance[(i + 3, i + 3)].max(0.0).sqrt())
    }
}

impl From<OptimizedState> for BiasEstimate {
    fn from(state: OptimizedState) -> Self {
        Self {
            bias: state.bias,
            covariance: state.bias_covariance,
        }
    }
}

/// Externally visible estimator health
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstimatorStatus {
    /// No origin/initial state yet
    AwaitingFirstFix,
    Nominal,
    /// No accepted fix for longer than the configured threshold
    FixStale,
    /// Degraded inertial window or a dropped constraint in the latest epoch
    Degraded,
    /// Terminal: processing stopped
    Halted,
}

impl std::fmt::Display for EstimatorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EstimatorStatus::AwaitingFirstFix => "AWAITING_FIRST_FIX",
            EstimatorStatus::Nominal => "NOMINAL",
            EstimatorStatus::FixStale => "FIX_STALE",
            EstimatorStatus::Degraded => "DEGRADED",
            EstimatorStatus::Halted => "HALTED",
        };
        f.write_str(name)
    }
}

/// What consumers receive from `current_state()` or the output channel
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateEstimate {
    pub timestamp: f64,
    pub nav: NavState,
    pub bias: ImuBias,
    pub status: EstimatorStatus,
    /// True when this estimate is an inertial prediction rather than a smoother solution
    pub predicted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sample_timestamp_and_stream() {
        let imu = SensorSample::Inertial(InertialSample::new(1.5, Vector3::zeros(), Vector3::zeros()));
        let fix = SensorSample::Fix(PositionFix::new(2.0, 34.0, -84.0, 300.0, 1.0));
        assert_eq!(imu.timestamp(), 1.5);
        assert_eq!(imu.stream(), StreamKind::Inertial);
        assert_eq!(fix.stream(), StreamKind::Fix);
    }

    #[test]
    fn test_nav_state_free_fall_cancels_at_rest() {
        let state = NavState::identity();
        let gravity = Vector3::new(0.0, 0.0, -STANDARD_GRAVITY);
        let accel = Vector3::new(0.0, 0.0, STANDARD_GRAVITY);
        let next = state.integrate(&accel, &Vector3::zeros(), &gravity, 0.1);
        assert_relative_eq!(next.position, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(next.velocity, Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_fix_deserializes_without_valid_flag() {
        let json = r#"{"timestamp":1.0,"latitude":34.0,"longitude":-84.0,"altitude":300.0,"accuracy":2.0}"#;
        let fix: PositionFix = serde_json::from_str(json).unwrap();
        assert!(fix.valid);
    }

    #[test]
    fn test_non_finite_readings_detected() {
        let good = SensorSample::Inertial(InertialSample::new(1.0, Vector3::new(0.0, 0.0, 9.81), Vector3::zeros()));
        let nan_gyro = SensorSample::Inertial(InertialSample::new(1.0, Vector3::zeros(), Vector3::new(f64::NAN, 0.0, 0.0)));
        let inf_odom = SensorSample::Odometry(OdometrySample::new(1.0, Vector3::new(f64::INFINITY, 0.0, 0.0), Vector3::zeros()));
        assert!(good.has_finite_readings());
        assert!(!nan_gyro.has_finite_readings());
        assert!(!inf_odom.has_finite_readings());
    }

    #[test]
    fn test_bias_estimate_sigmas() {
        let mut covariance = Matrix6::zeros();
        covariance[(0, 0)] = 0.04;
        covariance[(5, 5)] = 1e-6;
        let estimate = BiasEstimate { bias: ImuBias::zero(), covariance };
        assert_relative_eq!(estimate.accel_sigma().x, 0.2, epsilon = 1e-12);
        assert_relative_eq!(estimate.gyro_sigma().z, 1e-3, epsilon = 1e-12);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(EstimatorStatus::FixStale.to_string(), "FIX_STALE");
    }
}
