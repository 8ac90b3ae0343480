//! GPS/IMU/wheel-odometry state estimator built on a sliding-window factor
//! graph smoother with on-manifold inertial preintegration.

pub mod config;
pub mod error;
pub mod estimator;
pub mod factors;
pub mod local_frame;
pub mod propagator;
pub mod queues;
pub mod smoother;
pub mod status;
pub mod types;
pub mod worker;

pub use config::{EstimatorConfig, FrameConvention, OverflowPolicy};
pub use error::{EstimatorError, EstimatorResult, QueueError, SmootherError};
pub use estimator::StateEstimator;
pub use status::DiagnosticsSnapshot;
pub use types::{
    BiasEstimate, EstimatorStatus, ImuBias, InertialSample, NavState, OdometrySample, OptimizedState,
    PositionFix, StateEstimate,
};
