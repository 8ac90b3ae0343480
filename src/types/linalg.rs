//! Linear algebra type system for the estimator
//!
//! Fixed-size aliases for the tangent-space blocks used by preintegration and
//! the smoother, plus the handful of SO(3) helpers both need.

use nalgebra::{DMatrix, Matrix3, SMatrix, SVector, UnitQuaternion, Vector3};

// ===== Tangent Dimensions =====
pub const NAV_DIM: usize = 9; // rotation, velocity, position
pub const BIAS_DIM: usize = 6; // accel, gyro
pub const NODE_DIM: usize = NAV_DIM + BIAS_DIM; // 15

// ===== Node tangent layout =====
// [δθ (0:3), δp (3:6), δv (6:9), δba (9:12), δbg (12:15)]
pub const NODE_ROT: usize = 0;
pub const NODE_POS: usize = 3;
pub const NODE_VEL: usize = 6;
pub const NODE_ACC_BIAS: usize = 9;
pub const NODE_GYRO_BIAS: usize = 12;

// ===== Preintegration layout =====
// [δθ (0:3), δv (3:6), δp (6:9)]
pub const PREINT_ROT: usize = 0;
pub const PREINT_VEL: usize = 3;
pub const PREINT_POS: usize = 6;

pub type Vector6 = SVector<f64, 6>;
pub type Vector9 = SVector<f64, NAV_DIM>;
pub type Vector15 = SVector<f64, NODE_DIM>;
pub type Matrix6 = SMatrix<f64, 6, 6>;
pub type Matrix9 = SMatrix<f64, NAV_DIM, NAV_DIM>;

/// Skew-symmetric (cross product) matrix of a 3D vector
pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v[2], v[1], v[2], 0.0, -v[0], -v[1], v[0], 0.0)
}

/// SO(3) exponential map: rotation vector -> unit quaternion
pub fn so3_exp(omega: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*omega)
}

/// SO(3) logarithm map: unit quaternion -> rotation vector
pub fn so3_log(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    q.scaled_axis()
}

/// Right Jacobian of SO(3), used to map gyro noise into the rotation delta
pub fn so3_right_jacobian(omega: &Vector3<f64>) -> Matrix3<f64> {
    let theta = omega.norm();
    let skew = skew_symmetric(omega);
    if theta < 1e-6 {
        return Matrix3::identity() - 0.5 * skew;
    }
    let theta2 = theta * theta;
    Matrix3::identity() - (1.0 - theta.cos()) / theta2 * skew
        + (theta - theta.sin()) / (theta2 * theta) * skew * skew
}

/// Whitening matrix for a covariance: `L⁻¹` where `Σ = L Lᵀ`.
///
/// Returns `None` when the covariance is not positive definite.
pub fn sqrt_information(covariance: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let chol = covariance.clone().cholesky()?;
    chol.l().try_inverse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_exp_log_roundtrip_small_angle() {
        let omega = Vector3::new(0.1, -0.2, 0.05);
        let q = so3_exp(&omega);
        assert_relative_eq!(so3_log(&q), omega, epsilon = 1e-12);
    }

    #[test]
    fn test_right_jacobian_identity_at_zero() {
        let jr = so3_right_jacobian(&Vector3::zeros());
        assert_relative_eq!(jr, Matrix3::identity(), epsilon = 1e-12);
    }

    #[test]
    fn test_sqrt_information_whitens() {
        let cov = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![4.0, 9.0, 16.0]));
        let w = sqrt_information(&cov).unwrap();
        assert_relative_eq!(w[(0, 0)], 0.5, epsilon = 1e-12);
        assert_relative_eq!(w[(1, 1)], 1.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(w[(2, 2)], 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_sqrt_information_rejects_indefinite() {
        let cov = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![1.0, -1.0, 1.0]));
        assert!(sqrt_information(&cov).is_none());
    }
}
