//! # kinfit
//!
//! `kinfit` is a constrained kinematic fitter for particle decay trees. Reconstructed
//! final-state candidates (energies and directions with uncertainties) are attached to the leaves
//! of a declared decay topology, and their parameters are adjusted within their uncertainties so
//! that
//!
//! * every constrained intermediate node reproduces its nominal invariant mass, and
//! * the four-momentum of the whole final state equals that of the initial state (beam plus
//!   target).
//!
//! The fit minimizes
//!
//! ```math
//! \chi^2 = \sum_i \left(\frac{x_i - m_i}{\sigma_i}\right)^2
//! ```
//!
//! over all measured parameters $`x_i`$ subject to those constraints, using an iterated
//! linearization with Lagrange multipliers. Parameters may also be left unmeasured (free, no
//! $`\chi^2`$ contribution) or fixed (held constant). When the assignment of candidates to leaves
//! is ambiguous, a [`PermutationSearch`] fits every distinct assignment (optionally in parallel)
//! and ranks the outcomes.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kinfit::{
//!     channels, Candidate, ConstantUncertainties, Detector, InitialState, KinfitResult,
//!     PermutationSearch,
//! };
//!
//! fn main() -> KinfitResult<()> {
//!     // γ p → π0 p, π0 → γ γ
//!     let topology = Arc::new(channels::single_pi0().build()?);
//!     let search = PermutationSearch::new(
//!         topology,
//!         InitialState::default(),
//!         Box::new(ConstantUncertainties::calorimeter_defaults()),
//!     );
//!     let candidates = [
//!         Candidate::new(251.3, 0.61, 0.27, Detector::Barrel),
//!         Candidate::new(180.9, 1.32, -2.41, Detector::Barrel),
//!         Candidate::new(120.0, 0.35, 2.90, Detector::Forward),
//!     ];
//!     let report = search.run(700.0, &candidates)?;
//!     if let Some(best) = report.best() {
//!         println!("{} (chi2 = {}, P = {})", best.result.status, best.result.chi2, best.result.probability);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! * `rayon` (default): fit permutations (and optionally Jacobian columns) in parallel.
#![warn(clippy::perf, clippy::style)]
#![allow(clippy::excessive_precision)]

use thiserror::Error;

/// Standard decay channels and a registry of named topologies.
pub mod channels;
/// Evaluation of mass and four-momentum conservation constraints on a decay tree.
pub mod constraints;
/// Settings for individual fits, the initial state and the permutation search.
pub mod config;
/// Single fit parameters: measured, unmeasured and fixed values in their fit parameterization.
pub mod measurement;
/// Generation of exact decay kinematics and detector smearing for calibration studies.
pub mod mc;
/// Final-state particles bound to candidates, and the candidates themselves.
pub mod particle;
/// Enumeration of candidate-to-leaf assignments and the parallel permutation search.
pub mod permutations;
/// Fit outcomes: status, $`\chi^2`$, probability and pulls.
pub mod result;
/// The iterative Lagrange-multiplier solver.
pub mod solver;
/// Declarative decay trees and their validated, immutable compiled form.
pub mod topology;
/// A decay tree bound to one assignment of candidates, exposing its fit parameters.
pub mod tree;
/// Per-candidate uncertainty models.
pub mod uncertainties;
/// Utility functions, enums, and vector types.
pub mod utils;

pub use crate::channels::TopologyRegistry;
pub use crate::config::{
    BeamTreatment, EnergyParameterization, ExtraCandidates, FitSettings, InitialState,
    SearchSettings, Selection,
};
pub use crate::measurement::{Measurement, MeasurementKind, Transform};
pub use crate::particle::{Candidate, FitParticle};
pub use crate::permutations::{Assignment, PermutationFit, PermutationSearch, SearchReport};
pub use crate::result::{FitResult, FitStatus, Pull};
pub use crate::solver::{fit, Solver};
pub use crate::topology::{Decay, NodeId, Topology, TopologyDefinition};
pub use crate::tree::FitTree;
pub use crate::uncertainties::{ConstantUncertainties, EnergyScaling, Sigmas, UncertaintyModel};
pub use crate::utils::enums::{Detector, ParticleKind, Quantity};
pub use crate::utils::vectors::{Vec3, Vec4};

/// A [`Result`] type alias for [`KinfitError`]s.
pub type KinfitResult<T> = Result<T, KinfitError>;

/// The error type used by all `kinfit` methods.
#[derive(Error, Debug)]
pub enum KinfitError {
    /// A measured value or uncertainty which cannot enter a fit (non-finite values, non-positive
    /// uncertainties or a vanishing value under a reciprocal parameterization).
    #[error("Invalid measurement of {quantity}: {reason}")]
    InvalidMeasurement {
        /// The quantity which was being measured
        quantity: utils::enums::Quantity,
        /// What was wrong with it
        reason: String,
    },
    /// A decay tree which violates the structural rules of a topology.
    #[error("Invalid topology: {reason}")]
    InvalidTopology {
        /// What was wrong with the tree
        reason: String,
    },
    /// A fit with more unmeasured parameters than constraint equations.
    #[error(
        "Fit is underconstrained: {unmeasured} unmeasured parameters but only {equations} constraint equations!"
    )]
    Underconstrained {
        /// Number of constraint equations
        equations: usize,
        /// Number of unmeasured parameters
        unmeasured: usize,
    },
    /// The uncertainty model has no entry for a particle kind in a detector.
    #[error("No uncertainties modeled for {kind} in {detector}!")]
    UnmodeledUncertainty {
        /// The particle hypothesis
        kind: utils::enums::ParticleKind,
        /// The detector the candidate was seen in
        detector: utils::enums::Detector,
    },
    /// A lookup of a node which does not exist in the topology.
    #[error("No node named \"{name}\" in topology!")]
    NodeNotFound {
        /// Name of the node which failed lookup
        name: String,
    },
    /// An error which occurs when the user tries to parse an invalid string of text, typically
    /// into an enum variant.
    #[error("Failed to parse string: \"{name}\" does not correspond to a valid \"{object}\"!")]
    ParseError {
        /// The string which was parsed
        name: String,
        /// The name of the object it failed to parse into
        object: String,
    },
    /// An error type for [`rayon`] thread pools
    #[cfg(feature = "rayon")]
    #[error("Error building thread pool: {0}")]
    ThreadPoolError(#[from] rayon::ThreadPoolBuildError),
    /// A custom fallback error for errors too complex or too infrequent to warrant their own error
    /// category.
    #[error("{0}")]
    Custom(String),
}

impl Clone for KinfitError {
    // Thread pool errors are not cloneable, so they degrade to their message. Everything else is
    // kept intact so aborted permutations can still be matched on.
    fn clone(&self) -> Self {
        match self {
            Self::InvalidMeasurement { quantity, reason } => Self::InvalidMeasurement {
                quantity: *quantity,
                reason: reason.clone(),
            },
            Self::InvalidTopology { reason } => Self::InvalidTopology {
                reason: reason.clone(),
            },
            Self::Underconstrained {
                equations,
                unmeasured,
            } => Self::Underconstrained {
                equations: *equations,
                unmeasured: *unmeasured,
            },
            Self::UnmodeledUncertainty { kind, detector } => Self::UnmodeledUncertainty {
                kind: *kind,
                detector: *detector,
            },
            Self::NodeNotFound { name } => Self::NodeNotFound { name: name.clone() },
            Self::ParseError { name, object } => Self::ParseError {
                name: name.clone(),
                object: object.clone(),
            },
            #[cfg(feature = "rayon")]
            Self::ThreadPoolError(err) => Self::Custom(err.to_string()),
            Self::Custom(message) => Self::Custom(message.clone()),
        }
    }
}
