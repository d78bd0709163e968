use std::{cmp::Ordering, fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    tree::FitTree,
    utils::{enums::Quantity, vectors::Vec4},
    KinfitError, KinfitResult,
};

/// How a fit ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FitStatus {
    /// Both the $`\chi^2`$ and the constraints settled within their tolerances.
    Converged,
    /// The iteration cap was reached first.
    MaxIterations,
    /// The linear system was singular or the parameters stopped being finite.
    NumericalFailure,
    /// There were fewer candidates than leaves, so nothing was fitted.
    InsufficientInput,
}

impl FitStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, FitStatus::Converged)
    }
}

impl Display for FitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FitStatus::Converged => write!(f, "Converged"),
            FitStatus::MaxIterations => write!(f, "MaxIterations"),
            FitStatus::NumericalFailure => write!(f, "NumericalFailure"),
            FitStatus::InsufficientInput => write!(f, "InsufficientInput"),
        }
    }
}

impl FromStr for FitStatus {
    type Err = KinfitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "converged" => Ok(Self::Converged),
            "maxiterations" | "max_iterations" => Ok(Self::MaxIterations),
            "numericalfailure" | "numerical_failure" => Ok(Self::NumericalFailure),
            "insufficientinput" | "insufficient_input" => Ok(Self::InsufficientInput),
            _ => Err(KinfitError::ParseError {
                name: s.to_string(),
                object: "FitStatus".to_string(),
            }),
        }
    }
}

/// The normalized residual $`(x - m)/\sigma`$ of one measured parameter after the fit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pull {
    /// Name of the leaf, or `None` for the beam energy.
    pub leaf: Option<String>,
    pub quantity: Quantity,
    pub value: f64,
}

impl Display for Pull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.leaf {
            Some(leaf) => write!(f, "{}.{} = {:.4}", leaf, self.quantity, self.value),
            None => write!(f, "{} = {:.4}", self.quantity, self.value),
        }
    }
}

/// The outcome of one fit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub status: FitStatus,
    /// The last computed $`\chi^2`$, also for fits which did not converge.
    pub chi2: f64,
    pub ndf: usize,
    pub iterations: usize,
    /// Largest absolute constraint residual at the last iteration.
    pub max_constraint: f64,
    /// Pulls of all measured parameters.
    pub pulls: Vec<Pull>,
    /// $`P(\chi^2, n_\text{df})`$ for converged fits, zero otherwise.
    pub probability: f64,
    /// The tree at the last iteration, absent if nothing was fitted.
    pub fitted_tree: Option<FitTree>,
}

impl FitResult {
    /// The placeholder result for an event with fewer candidates than leaves.
    pub fn insufficient_input() -> Self {
        Self {
            status: FitStatus::InsufficientInput,
            chi2: f64::NAN,
            ndf: 0,
            iterations: 0,
            max_constraint: f64::NAN,
            pulls: Vec::new(),
            probability: 0.0,
            fitted_tree: None,
        }
    }
    pub fn is_converged(&self) -> bool {
        self.status.is_converged()
    }
    /// Fitted four-vector of the node called `name`.
    ///
    /// # Errors
    ///
    /// Fails with [`KinfitError::NodeNotFound`] if there is no such node or nothing was fitted.
    pub fn fitted_vector(&self, name: &str) -> KinfitResult<Vec4> {
        self.fitted_tree
            .as_ref()
            .ok_or_else(|| KinfitError::NodeNotFound {
                name: name.to_string(),
            })?
            .node_vector(name)
    }
    /// Ranking of results: converged fits first, then by decreasing probability, then by
    /// increasing $`\chi^2`$. `NaN`s rank last.
    pub fn ranking(&self, other: &Self) -> Ordering {
        fn descending(a: f64, b: f64) -> Ordering {
            match (a.is_nan(), b.is_nan()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => b.total_cmp(&a),
            }
        }
        other
            .is_converged()
            .cmp(&self.is_converged())
            .then_with(|| descending(self.probability, other.probability))
            .then_with(|| descending(-self.chi2, -other.chi2))
    }
}

impl Display for FitResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} after {} iteration(s): chi2/ndf = {:.4}/{}, P = {:.4}",
            self.status, self.iterations, self.chi2, self.ndf, self.probability
        )
    }
}
