//! Factor graph building blocks
//!
//! Inertial preintegration, absolute position, wheel odometry and prior
//! factors. Each exposes a whitened residual the smoother linearizes.

pub mod gps;
pub mod imu_preintegration;
pub mod odometry;
pub mod prior;

pub use gps::PositionConstraint;
pub use imu_preintegration::{align_static, ImuFactor, PreintegratedMotion, Preintegrator};
pub use odometry::{OdometryIntegrator, RelativeMotion};
pub use prior::{BiasRandomWalk, PriorFactor, PriorSigmas};
