//! Local tangent frame handling.
//!
//! Absolute fixes are projected into an East-North-Up frame anchored at the
//! first accepted fix (WGS-84 geodetic -> ECEF -> ENU). Inertial readings are
//! brought into the forward-left-up body frame the estimator works in.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::config::{EstimatorConfig, FrameConvention};
use crate::types::{InertialSample, PositionFix};

// ===== WGS-84 =====
const WGS84_A: f64 = 6_378_137.0;
const WGS84_F: f64 = 1.0 / 298.257_223_563;
const WGS84_E2: f64 = WGS84_F * (2.0 - WGS84_F);

/// Geodetic coordinates (degrees, degrees, meters) to Earth-centered Earth-fixed
pub fn geodetic_to_ecef(latitude: f64, longitude: f64, altitude: f64) -> Vector3<f64> {
    let lat = latitude.to_radians();
    let lon = longitude.to_radians();
    let (sin_lat, cos_lat) = lat.sin_cos();
    let (sin_lon, cos_lon) = lon.sin_cos();
    let n = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();

    Vector3::new(
        (n + altitude) * cos_lat * cos_lon,
        (n + altitude) * cos_lat * sin_lon,
        (n * (1.0 - WGS84_E2) + altitude) * sin_lat,
    )
}

/// Fixed anchor of the local frame
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalOrigin {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    ecef: Vector3<f64>,
    /// Rows are the east, north and up axes expressed in ECEF
    ecef_to_enu: Matrix3<f64>,
}

impl LocalOrigin {
    pub fn new(latitude: f64, longitude: f64, altitude: f64) -> Self {
        let lat = latitude.to_radians();
        let lon = longitude.to_radians();
        let (sin_lat, cos_lat) = lat.sin_cos();
        let (sin_lon, cos_lon) = lon.sin_cos();

        #[rustfmt::skip]
        let ecef_to_enu = Matrix3::new(
            -sin_lon,            cos_lon,           0.0,
            -sin_lat * cos_lon, -sin_lat * sin_lon, cos_lat,
             cos_lat * cos_lon,  cos_lat * sin_lon, sin_lat,
        );

        Self {
            latitude,
            longitude,
            altitude,
            ecef: geodetic_to_ecef(latitude, longitude, altitude),
            ecef_to_enu,
        }
    }

    /// Project a geodetic position into this frame's East-North-Up coordinates
    pub fn to_enu(&self, latitude: f64, longitude: f64, altitude: f64) -> Vector3<f64> {
        let ecef = geodetic_to_ecef(latitude, longitude, altitude);
        self.ecef_to_enu * (ecef - self.ecef)
    }
}

/// Why a fix did not become a constraint
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FixRejection {
    /// Receiver flagged the fix as invalid
    Invalid,
    /// Non-finite coordinates or accuracy
    Malformed,
    /// Reported error above `max_fix_error`
    AccuracyExceeded { accuracy: f64, limit: f64 },
}

impl std::fmt::Display for FixRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FixRejection::Invalid => write!(f, "receiver reported no fix"),
            FixRejection::Malformed => write!(f, "non-finite fix"),
            FixRejection::AccuracyExceeded { accuracy, limit } => {
                write!(f, "accuracy {accuracy:.2} m exceeds limit {limit:.2} m")
            }
        }
    }
}

/// Converts fixes into the local frame, fixing the origin exactly once.
#[derive(Clone, Debug)]
pub struct LocalFrameConverter {
    origin: Option<LocalOrigin>,
    max_fix_error: f64,
}

impl LocalFrameConverter {
    pub fn new(max_fix_error: f64) -> Self {
        Self {
            origin: None,
            max_fix_error,
        }
    }

    pub fn origin(&self) -> Option<&LocalOrigin> {
        self.origin.as_ref()
    }

    pub fn has_origin(&self) -> bool {
        self.origin.is_some()
    }

    /// Screen a fix without touching the origin
    pub fn check(&self, fix: &PositionFix) -> Result<(), FixRejection> {
        if !fix.valid {
            return Err(FixRejection::Invalid);
        }
        if !(fix.latitude.is_finite()
            && fix.longitude.is_finite()
            && fix.altitude.is_finite()
            && fix.accuracy.is_finite())
        {
            return Err(FixRejection::Malformed);
        }
        if fix.accuracy > self.max_fix_error {
            return Err(FixRejection::AccuracyExceeded {
                accuracy: fix.accuracy,
                limit: self.max_fix_error,
            });
        }
        Ok(())
    }

    /// Accept a fix and return its local position.
    ///
    /// The first accepted fix becomes the origin and maps to zero; later
    /// fixes never move it.
    pub fn accept(&mut self, fix: &PositionFix) -> Result<Vector3<f64>, FixRejection> {
        self.check(fix)?;
        let origin = match self.origin {
            Some(origin) => origin,
            None => {
                let origin = LocalOrigin::new(fix.latitude, fix.longitude, fix.altitude);
                log::info!(
                    "local origin fixed at ({:.7}, {:.7}, {:.2} m)",
                    fix.latitude,
                    fix.longitude,
                    fix.altitude
                );
                self.origin = Some(origin);
                origin
            }
        };
        Ok(origin.to_enu(fix.latitude, fix.longitude, fix.altitude))
    }
}

/// Maps raw IMU axes into the forward-left-up body frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameAlignment {
    axes: Vector3<f64>,
}

impl FrameAlignment {
    pub fn new(convention: FrameConvention, invert_x: bool, invert_y: bool, invert_z: bool) -> Self {
        let sign = |invert: bool| if invert { -1.0 } else { 1.0 };
        let convention_axes = match convention {
            FrameConvention::Enu => Vector3::new(1.0, 1.0, 1.0),
            // forward-right-down -> forward-left-up
            FrameConvention::Ned => Vector3::new(1.0, -1.0, -1.0),
        };
        Self {
            axes: convention_axes.component_mul(&Vector3::new(
                sign(invert_x),
                sign(invert_y),
                sign(invert_z),
            )),
        }
    }

    pub fn from_config(config: &EstimatorConfig) -> Self {
        Self::new(config.imu_frame, config.invert_x, config.invert_y, config.invert_z)
    }

    pub fn apply(&self, v: &Vector3<f64>) -> Vector3<f64> {
        v.component_mul(&self.axes)
    }

    pub fn align_sample(&self, sample: &InertialSample) -> InertialSample {
        InertialSample::new(sample.timestamp, self.apply(&sample.accel), self.apply(&sample.gyro))
    }
}
