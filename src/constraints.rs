use std::{fmt::Display, sync::Arc};

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::{
    topology::{NodeId, NodeKind, Topology},
    utils::vectors::Vec4,
};

/// One scalar constraint equation.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Constraint {
    /// $`m(\sum_i p_i) - m_0 = 0`$ over the daughters of `node`.
    Mass { node: NodeId, target: f64 },
    /// Energy conservation at the root.
    Energy,
    /// Conservation of $`p_x`$ at the root.
    Px,
    /// Conservation of $`p_y`$ at the root.
    Py,
    /// Conservation of $`p_z`$ at the root.
    Pz,
}

impl Display for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constraint::Mass { node, target } => write!(f, "m(#{}) = {}", node.index(), target),
            Constraint::Energy => write!(f, "E"),
            Constraint::Px => write!(f, "px"),
            Constraint::Py => write!(f, "py"),
            Constraint::Pz => write!(f, "pz"),
        }
    }
}

/// Computes the residuals of all constraint equations of a topology.
///
/// The residual vector holds the mass constraints in post-order followed by the four components
/// $`(E, p_x, p_y, p_z)`$ of $`\sum p_\text{root children} - (p_\text{beam} + p_\text{target})`$.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConstraintEvaluator {
    topology: Arc<Topology>,
    constraints: Vec<Constraint>,
}

impl ConstraintEvaluator {
    pub fn new(topology: Arc<Topology>) -> Self {
        let mut constraints: Vec<Constraint> = topology
            .iter()
            .filter(|(_, node)| !node.is_root())
            .filter_map(|(id, node)| node.mass().map(|target| Constraint::Mass { node: id, target }))
            .collect();
        constraints.extend([
            Constraint::Energy,
            Constraint::Px,
            Constraint::Py,
            Constraint::Pz,
        ]);
        Self {
            topology,
            constraints,
        }
    }
    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }
    pub fn n_equations(&self) -> usize {
        self.constraints.len()
    }
    /// The summed four-vector of every node, indexed like [`Topology::nodes`].
    pub fn node_vectors(&self, leaf_vectors: &[Vec4]) -> Vec<Vec4> {
        let mut sums: Vec<Vec4> = Vec::with_capacity(self.topology.nodes().len());
        for node in self.topology.nodes() {
            let p4 = match &node.kind {
                NodeKind::Leaf { leaf, .. } => leaf_vectors[*leaf],
                NodeKind::Internal { children, .. } => {
                    children.iter().map(|child| sums[child.index()]).sum()
                }
            };
            sums.push(p4);
        }
        sums
    }
    /// The residual of every constraint for the given leaf four-vectors and initial state.
    pub fn evaluate(&self, leaf_vectors: &[Vec4], initial: &Vec4) -> DVector<f64> {
        let sums = self.node_vectors(leaf_vectors);
        let missing = sums[self.topology.root().index()] - initial;
        DVector::from_iterator(
            self.constraints.len(),
            self.constraints.iter().map(|constraint| match constraint {
                Constraint::Mass { node, target } => sums[node.index()].signed_mag() - target,
                Constraint::Energy => missing.e(),
                Constraint::Px => missing.px(),
                Constraint::Py => missing.py(),
                Constraint::Pz => missing.pz(),
            }),
        )
    }
}
