//! Factor graph smoother
//!
//! The fusion worker talks to the smoother only through the `Smoother`
//! trait: seed it once with a prior, then append one epoch at a time.

pub mod graph;
pub mod incremental;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SmootherResult;
use crate::factors::{PositionConstraint, PreintegratedMotion, PriorSigmas, RelativeMotion};
use crate::types::{ImuBias, NavState, OptimizedState};

pub use graph::{FactorGraph, GraphFactor, NodeState};
pub use incremental::IncrementalSmoother;

/// Outcome of one `add_epoch` call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochResult {
    pub state: OptimizedState,
    /// The inertial summary for this epoch was flagged as degraded
    pub degraded: bool,
    /// Constraints dropped by the numerical policy in this epoch
    pub dropped_constraints: usize,
    /// The epoch's position constraint survived the numerical policy
    pub fix_used: bool,
    /// The solve failed even without the new constraints; the node holds the inertial prediction
    pub prediction_only: bool,
    pub iterations: usize,
    pub converged: bool,
    pub solve_time: Duration,
}

pub trait Smoother {
    /// Seed node 0 with a prior.
    fn initialize(
        &mut self,
        timestamp: f64,
        nav: NavState,
        bias: ImuBias,
        sigmas: &PriorSigmas,
    ) -> SmootherResult<OptimizedState>;

    /// Append one epoch ending at `timestamp`.
    ///
    /// `motion` must span exactly [previous epoch, `timestamp`].
    fn add_epoch(
        &mut self,
        timestamp: f64,
        motion: PreintegratedMotion,
        position: Option<PositionConstraint>,
        odometry: Option<RelativeMotion>,
    ) -> SmootherResult<EpochResult>;

    /// Latest solved state, without re-solving
    fn current_estimate(&self) -> Option<OptimizedState>;

    fn num_nodes(&self) -> usize;

    fn num_factors(&self) -> usize;
}
