//! Absolute position constraint from a GNSS fix.
//!
//! Pins the antenna position of one epoch node to a fix expressed in the
//! local ENU frame. The antenna sits at `lever_arm` in the body frame, so the
//! predicted measurement is `p + R * lever_arm`.

use nalgebra::Vector3;

use crate::types::NavState;

/// Vertical GNSS error relative to horizontal
const VERTICAL_SIGMA_SCALE: f64 = 3.0;

#[derive(Clone, Debug, PartialEq)]
pub struct PositionConstraint {
    /// Sensor time of the fix
    pub timestamp: f64,

    /// Fix in local ENU coordinates [East, North, Up] (meters)
    pub measurement: Vector3<f64>,

    /// IMU-to-antenna offset in the body frame (meters)
    pub lever_arm: Vector3<f64>,

    /// Per-axis standard deviation (meters)
    pub sigma: Vector3<f64>,
}

impl PositionConstraint {
    /// `horizontal_sigma` applies to east/north; up gets three times that.
    pub fn new(
        timestamp: f64,
        measurement: Vector3<f64>,
        horizontal_sigma: f64,
        lever_arm: Vector3<f64>,
    ) -> Self {
        Self {
            timestamp,
            measurement,
            lever_arm,
            sigma: Vector3::new(
                horizontal_sigma,
                horizontal_sigma,
                VERTICAL_SIGMA_SCALE * horizontal_sigma,
            ),
        }
    }

    /// Position error of the antenna in the local frame
    pub fn residual(&self, state: &NavState) -> Vector3<f64> {
        state.position + state.rotation * self.lever_arm - self.measurement
    }

    pub fn whitened_residual(&self, state: &NavState) -> Vector3<f64> {
        self.residual(state).component_div(&self.sigma)
    }

    /// Squared Mahalanobis distance
    pub fn chi2(&self, state: &NavState) -> f64 {
        self.whitened_residual(state).norm_squared()
    }
}
