//! Append-only factor graph storage.
//!
//! Nodes are epoch states indexed by epoch number; factors only ever get
//! appended or switched off. `factors_by_node` indexes each factor under the
//! newest node it touches, so a solve over the most recent nodes finds its
//! factors without scanning the whole history.

use nalgebra::{DMatrix, DVector, Vector3};

use crate::factors::{BiasRandomWalk, ImuFactor, PositionConstraint, PriorFactor, RelativeMotion};
use crate::types::{
    so3_exp, ImuBias, Matrix6, NavState, OptimizedState, Vector15, NODE_ACC_BIAS, NODE_DIM,
    NODE_GYRO_BIAS, NODE_POS, NODE_ROT, NODE_VEL,
};

/// Central-difference step on the node tangent space
const NUMERICAL_DIFF_EPS: f64 = 1e-6;

/// One epoch's estimated state
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NodeState {
    pub timestamp: f64,
    pub nav: NavState,
    pub bias: ImuBias,
}

impl NodeState {
    pub fn new(timestamp: f64, nav: NavState, bias: ImuBias) -> Self {
        Self {
            timestamp,
            nav,
            bias,
        }
    }

    /// Apply a tangent-space increment [δθ, δp, δv, δba, δbg]
    pub fn retract(&self, delta: &Vector15) -> NodeState {
        let rot: Vector3<f64> = delta.fixed_rows::<3>(NODE_ROT).into_owned();
        NodeState {
            timestamp: self.timestamp,
            nav: NavState::new(
                self.nav.rotation * so3_exp(&rot),
                self.nav.position + delta.fixed_rows::<3>(NODE_POS),
                self.nav.velocity + delta.fixed_rows::<3>(NODE_VEL),
            ),
            bias: ImuBias::new(
                self.bias.accel + delta.fixed_rows::<3>(NODE_ACC_BIAS),
                self.bias.gyro + delta.fixed_rows::<3>(NODE_GYRO_BIAS),
            ),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.timestamp.is_finite() && self.nav.is_finite() && self.bias.is_finite()
    }

    pub fn to_optimized(&self, epoch: usize, bias_covariance: Matrix6) -> OptimizedState {
        OptimizedState {
            timestamp: self.timestamp,
            epoch,
            nav: self.nav,
            bias: self.bias,
            bias_covariance,
        }
    }
}

#[derive(Clone, Debug)]
pub enum GraphFactor {
    Prior {
        node: usize,
        factor: PriorFactor,
    },
    Imu {
        from: usize,
        to: usize,
        factor: ImuFactor,
    },
    BiasWalk {
        from: usize,
        to: usize,
        factor: BiasRandomWalk,
    },
    Position {
        node: usize,
        constraint: PositionConstraint,
    },
    Odometry {
        from: usize,
        to: usize,
        motion: RelativeMotion,
    },
}

impl GraphFactor {
    /// Nodes this factor touches (oldest first)
    pub fn keys(&self) -> (usize, Option<usize>) {
        match self {
            GraphFactor::Prior { node, .. } | GraphFactor::Position { node, .. } => (*node, None),
            GraphFactor::Imu { from, to, .. }
            | GraphFactor::BiasWalk { from, to, .. }
            | GraphFactor::Odometry { from, to, .. } => (*from, Some(*to)),
        }
    }

    pub fn newest_key(&self) -> usize {
        let (a, b) = self.keys();
        b.unwrap_or(a)
    }

    /// Measurement constraints that the numerical policy may drop
    pub fn is_auxiliary(&self) -> bool {
        matches!(self, GraphFactor::Position { .. } | GraphFactor::Odometry { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            GraphFactor::Prior { .. } => "prior",
            GraphFactor::Imu { .. } => "inertial",
            GraphFactor::BiasWalk { .. } => "bias walk",
            GraphFactor::Position { .. } => "position",
            GraphFactor::Odometry { .. } => "odometry",
        }
    }

    /// Whitened residual at the given node values
    pub fn whitened_error(&self, nodes: &[NodeState]) -> DVector<f64> {
        match self {
            GraphFactor::Prior { node, factor } => {
                let n = &nodes[*node];
                let e = factor.whitened_residual(&n.nav, &n.bias);
                DVector::from_column_slice(e.as_slice())
            }
            GraphFactor::Imu { from, to, factor } => {
                let (i, j) = (&nodes[*from], &nodes[*to]);
                let e = factor.whitened_residual(&i.nav, &i.bias, &j.nav);
                DVector::from_column_slice(e.as_slice())
            }
            GraphFactor::BiasWalk { from, to, factor } => {
                let e = factor.whitened_residual(&nodes[*from].bias, &nodes[*to].bias);
                DVector::from_column_slice(e.as_slice())
            }
            GraphFactor::Position { node, constraint } => {
                let e = constraint.whitened_residual(&nodes[*node].nav);
                DVector::from_column_slice(e.as_slice())
            }
            GraphFactor::Odometry { from, to, motion } => {
                let e = motion.whitened_residual(&nodes[*from].nav, &nodes[*to].nav);
                DVector::from_column_slice(e.as_slice())
            }
        }
    }

    /// Squared Mahalanobis distance
    pub fn chi2(&self, nodes: &[NodeState]) -> f64 {
        self.whitened_error(nodes).norm_squared()
    }
}

#[derive(Clone, Debug)]
pub struct FactorEntry {
    pub factor: GraphFactor,
    pub active: bool,
}

/// Arena of epoch nodes and the factors between them
#[derive(Clone, Debug, Default)]
pub struct FactorGraph {
    nodes: Vec<NodeState>,
    factors: Vec<FactorEntry>,
    factors_by_node: Vec<Vec<usize>>,
}

impl FactorGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: NodeState) -> usize {
        self.nodes.push(node);
        self.factors_by_node.push(Vec::new());
        self.nodes.len() - 1
    }

    /// Append a factor; its keys must already exist.
    pub fn add_factor(&mut self, factor: GraphFactor) -> usize {
        let id = self.factors.len();
        let newest = factor.newest_key();
        debug_assert!(newest < self.nodes.len(), "factor references a missing node");
        self.factors_by_node[newest].push(id);
        self.factors.push(FactorEntry {
            factor,
            active: true,
        });
        id
    }

    pub fn deactivate(&mut self, id: usize) {
        if let Some(entry) = self.factors.get_mut(id) {
            entry.active = false;
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_factors(&self) -> usize {
        self.factors.len()
    }

    pub fn num_active_factors(&self) -> usize {
        self.factors.iter().filter(|f| f.active).count()
    }

    pub fn nodes(&self) -> &[NodeState] {
        &self.nodes
    }

    pub fn last_node(&self) -> Option<&NodeState> {
        self.nodes.last()
    }

    pub fn factor(&self, id: usize) -> Option<&FactorEntry> {
        self.factors.get(id)
    }

    pub fn set_node(&mut self, index: usize, node: NodeState) {
        if let Some(slot) = self.nodes.get_mut(index) {
            *slot = node;
        }
    }

    /// Values of nodes `first..` for later restore
    pub fn snapshot_from(&self, first: usize) -> Vec<NodeState> {
        self.nodes[first.min(self.nodes.len())..].to_vec()
    }

    pub fn restore_from(&mut self, first: usize, values: &[NodeState]) {
        for (slot, value) in self.nodes[first..].iter_mut().zip(values) {
            *slot = *value;
        }
    }

    /// Active factors touching any node at or after `first`
    pub fn active_factors_from(&self, first: usize) -> Vec<usize> {
        self.factors_by_node[first.min(self.factors_by_node.len())..]
            .iter()
            .flatten()
            .copied()
            .filter(|&id| self.factors[id].active)
            .collect()
    }

    /// Huber cost of the given factors
    pub fn robust_cost(&self, factor_ids: &[usize], huber: f64) -> f64 {
        factor_ids
            .iter()
            .map(|&id| {
                let factor = &self.factors[id].factor;
                let norm = factor.whitened_error(&self.nodes).norm();
                if factor.is_auxiliary() {
                    huber_loss(norm, huber)
                } else {
                    0.5 * norm * norm
                }
            })
            .sum()
    }

    /// Gauss-Newton normal equations over the free nodes `first_free..`.
    ///
    /// Jacobians are central differences of the whitened residuals with
    /// respect to each free node's tangent space. Auxiliary factors are
    /// reweighted by their Huber weight.
    pub fn linearize(
        &mut self,
        factor_ids: &[usize],
        first_free: usize,
        huber: f64,
    ) -> (DMatrix<f64>, DVector<f64>) {
        let free = self.nodes.len().saturating_sub(first_free);
        let dim = free * NODE_DIM;
        let mut hessian = DMatrix::<f64>::zeros(dim, dim);
        let mut gradient = DVector::<f64>::zeros(dim);

        let FactorGraph { nodes, factors, .. } = self;

        for &id in factor_ids {
            let factor = &factors[id].factor;
            let error = factor.whitened_error(nodes);
            let weight = if factor.is_auxiliary() {
                huber_weight(error.norm(), huber)
            } else {
                1.0
            };

            let (a, b) = factor.keys();
            let mut blocks: Vec<(usize, DMatrix<f64>)> = Vec::with_capacity(2);
            for key in std::iter::once(a).chain(b) {
                if key < first_free {
                    continue;
                }
                let jacobian = numerical_jacobian(factor, nodes, key, error.len());
                blocks.push(((key - first_free) * NODE_DIM, jacobian));
            }

            for (row_offset, ja) in &blocks {
                let jt = ja.transpose();
                let g = &jt * &error * weight;
                let mut g_block = gradient.rows_mut(*row_offset, NODE_DIM);
                g_block += g;
                for (col_offset, jb) in &blocks {
                    let h = &jt * jb * weight;
                    let mut h_block = hessian.view_mut((*row_offset, *col_offset), (NODE_DIM, NODE_DIM));
                    h_block += h;
                }
            }
        }

        (hessian, gradient)
    }

    /// Apply a stacked tangent increment to nodes `first_free..`
    pub fn retract_from(&mut self, first_free: usize, delta: &DVector<f64>) {
        for (k, node) in self.nodes[first_free..].iter_mut().enumerate() {
            let step = Vector15::from_iterator(delta.rows(k * NODE_DIM, NODE_DIM).iter().copied());
            *node = node.retract(&step);
        }
    }
}

fn numerical_jacobian(
    factor: &GraphFactor,
    nodes: &mut [NodeState],
    key: usize,
    rows: usize,
) -> DMatrix<f64> {
    let mut jacobian = DMatrix::<f64>::zeros(rows, NODE_DIM);
    let original = nodes[key];
    for axis in 0..NODE_DIM {
        let mut delta = Vector15::zeros();
        delta[axis] = NUMERICAL_DIFF_EPS;
        nodes[key] = original.retract(&delta);
        let plus = factor.whitened_error(nodes);
        delta[axis] = -NUMERICAL_DIFF_EPS;
        nodes[key] = original.retract(&delta);
        let minus = factor.whitened_error(nodes);
        jacobian.set_column(axis, &((plus - minus) / (2.0 * NUMERICAL_DIFF_EPS)));
    }
    nodes[key] = original;
    jacobian
}

/// IRLS weight of the Huber kernel for a whitened residual norm
pub fn huber_weight(norm: f64, threshold: f64) -> f64 {
    if norm <= threshold {
        1.0
    } else {
        threshold / norm
    }
}

fn huber_loss(norm: f64, threshold: f64) -> f64 {
    if norm <= threshold {
        0.5 * norm * norm
    } else {
        threshold * (norm - 0.5 * threshold)
    }
}
