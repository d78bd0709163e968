use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    measurement::{Measurement, Transform},
    utils::{enums::Quantity, vectors::Vec4},
    KinfitError, KinfitResult,
};

/// How the energy of a final-state particle is represented as a fit parameter.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnergyParameterization {
    /// The kinetic energy $`E_k`$ itself.
    #[default]
    Kinetic,
    /// The inverse kinetic energy $`1/E_k`$, whose uncertainty is $`\sigma/E_k^2`$. This is closer
    /// to Gaussian for tracks whose energy comes from a curvature measurement.
    InverseKinetic,
}

impl EnergyParameterization {
    /// The [`Transform`] between the physical kinetic energy and the fit parameter.
    pub fn transform(&self) -> Transform {
        match self {
            EnergyParameterization::Kinetic => Transform::Identity,
            EnergyParameterization::InverseKinetic => Transform::Reciprocal,
        }
    }
}

impl Display for EnergyParameterization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnergyParameterization::Kinetic => write!(f, "Ek"),
            EnergyParameterization::InverseKinetic => write!(f, "1/Ek"),
        }
    }
}

impl FromStr for EnergyParameterization {
    type Err = KinfitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ek" | "kinetic" => Ok(Self::Kinetic),
            "1/ek" | "inverse" | "inversekinetic" => Ok(Self::InverseKinetic),
            _ => Err(KinfitError::ParseError {
                name: s.to_string(),
                object: "EnergyParameterization".to_string(),
            }),
        }
    }
}

/// Tuning of a single constrained fit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitSettings {
    /// Maximum number of linearization steps before giving up.
    pub max_iterations: usize,
    /// Convergence threshold on the change of $`\chi^2`$ between iterations.
    pub chi2_epsilon: f64,
    /// Convergence threshold on the largest absolute constraint residual.
    pub constraint_epsilon: f64,
    /// Relative size of the smallest pivot of the linear system (compared to the largest) below
    /// which the system is treated as singular.
    pub pivot_tolerance: f64,
    /// Relative step used for the central-difference derivatives. The absolute step for a
    /// parameter $`p`$ is `step_scale * (|p| + 1)`.
    pub step_scale: f64,
    /// Parameterization of particle energies.
    pub energy: EnergyParameterization,
    /// Compute the columns of the constraint Jacobian in parallel.
    pub parallel_jacobian: bool,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            chi2_epsilon: 1e-6,
            constraint_epsilon: 1e-6,
            pivot_tolerance: 1e-12,
            step_scale: f64::cbrt(f64::EPSILON),
            energy: EnergyParameterization::default(),
            parallel_jacobian: false,
        }
    }
}

impl FitSettings {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }
    pub fn with_chi2_epsilon(mut self, chi2_epsilon: f64) -> Self {
        self.chi2_epsilon = chi2_epsilon;
        self
    }
    pub fn with_constraint_epsilon(mut self, constraint_epsilon: f64) -> Self {
        self.constraint_epsilon = constraint_epsilon;
        self
    }
    pub fn with_pivot_tolerance(mut self, pivot_tolerance: f64) -> Self {
        self.pivot_tolerance = pivot_tolerance;
        self
    }
    pub fn with_step_scale(mut self, step_scale: f64) -> Self {
        self.step_scale = step_scale;
        self
    }
    pub fn with_energy(mut self, energy: EnergyParameterization) -> Self {
        self.energy = energy;
        self
    }
    pub fn with_parallel_jacobian(mut self, parallel_jacobian: bool) -> Self {
        self.parallel_jacobian = parallel_jacobian;
        self
    }
}

/// How the beam energy enters the fit.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum BeamTreatment {
    /// The beam energy is known exactly and held fixed.
    #[default]
    Exact,
    /// The beam energy is measured with the given absolute uncertainty.
    Measured {
        /// Uncertainty of the beam energy (MeV)
        sigma: f64,
    },
    /// The beam energy is a free parameter.
    Unmeasured,
}

/// The initial state: a beam along $`+z`$ hitting a target at rest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InitialState {
    /// How the beam energy is treated in the fit.
    pub beam: BeamTreatment,
    /// Rest mass of the beam particle (MeV).
    pub beam_mass: f64,
    /// Rest mass of the target (MeV).
    pub target_mass: f64,
}

impl Default for InitialState {
    /// A real photon beam on a proton target with an exactly known beam energy.
    fn default() -> Self {
        Self {
            beam: BeamTreatment::Exact,
            beam_mass: 0.0,
            target_mass: 938.272,
        }
    }
}

impl InitialState {
    /// A photon beam on a target of the given mass.
    pub fn new(target_mass: f64) -> Self {
        Self {
            target_mass,
            ..Default::default()
        }
    }
    pub fn with_beam(mut self, beam: BeamTreatment) -> Self {
        self.beam = beam;
        self
    }
    pub fn with_beam_mass(mut self, beam_mass: f64) -> Self {
        self.beam_mass = beam_mass;
        self
    }
    /// The total four-momentum of beam and target for a beam of total energy `beam_energy`.
    pub fn four_vector(&self, beam_energy: f64) -> Vec4 {
        let pz = (beam_energy * beam_energy - self.beam_mass * self.beam_mass)
            .max(0.0)
            .sqrt();
        Vec4::new(0.0, 0.0, pz, beam_energy + self.target_mass)
    }
    /// The fit parameter describing the beam energy.
    pub fn beam_measurement(&self, beam_energy: f64) -> KinfitResult<Measurement> {
        match self.beam {
            BeamTreatment::Exact => {
                Measurement::fixed(Quantity::BeamEnergy, beam_energy, Transform::Identity)
            }
            BeamTreatment::Measured { sigma } => Measurement::measured(
                Quantity::BeamEnergy,
                beam_energy,
                sigma,
                Transform::Identity,
            ),
            BeamTreatment::Unmeasured => {
                Measurement::unmeasured(Quantity::BeamEnergy, beam_energy, Transform::Identity)
            }
        }
    }
}

/// What to do with candidates beyond the number of leaves of a topology.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtraCandidates {
    /// Only the first `k` candidates are used for a topology with `k` leaves.
    #[default]
    Discard,
    /// Every injective assignment of `k` out of all candidates is fitted; the leftovers are
    /// reported as unassigned.
    Enumerate,
}

/// Which fits a permutation search reports.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selection {
    /// Only the best-ranked fit.
    Best,
    /// Every fit, in ranked order.
    #[default]
    All,
}

/// Settings of a [`PermutationSearch`](crate::permutations::PermutationSearch).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSettings {
    /// Handling of surplus candidates.
    pub extra_candidates: ExtraCandidates,
    /// Which fits end up in the report.
    pub selection: Selection,
    /// Size of a dedicated thread pool for the search, or `None` to use the global pool.
    pub threads: Option<usize>,
}

impl SearchSettings {
    pub fn with_extra_candidates(mut self, extra_candidates: ExtraCandidates) -> Self {
        self.extra_candidates = extra_candidates;
        self
    }
    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use crate::measurement::MeasurementKind;

    use super::*;

    #[test]
    fn test_initial_state_four_vector() {
        let initial = InitialState::default();
        let p4 = initial.four_vector(700.0);
        assert_relative_eq!(p4.pz(), 700.0);
        assert_relative_eq!(p4.e(), 1638.272);
        // s = m_t^2 + 2 E m_t for a massless beam
        assert_relative_eq!(
            p4.mag2(),
            938.272f64.powi(2) + 2.0 * 700.0 * 938.272,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_beam_measurement() {
        let exact = InitialState::default().beam_measurement(700.0).unwrap();
        assert_eq!(exact.kind(), MeasurementKind::Fixed);
        let measured = InitialState::default()
            .with_beam(BeamTreatment::Measured { sigma: 2.0 })
            .beam_measurement(700.0)
            .unwrap();
        assert_eq!(measured.kind(), MeasurementKind::Measured);
        assert_relative_eq!(measured.sigma(), 2.0);
        assert!(InitialState::default()
            .with_beam(BeamTreatment::Measured { sigma: 0.0 })
            .beam_measurement(700.0)
            .is_err());
    }

    #[test]
    fn test_settings_builders() {
        let settings = FitSettings::default()
            .with_max_iterations(5)
            .with_energy(EnergyParameterization::InverseKinetic);
        assert_eq!(settings.max_iterations, 5);
        assert_eq!(settings.energy.transform(), Transform::Reciprocal);
        assert_eq!(
            EnergyParameterization::from_str("1/Ek").unwrap(),
            EnergyParameterization::InverseKinetic
        );
        let search = SearchSettings::default().with_threads(2);
        assert_eq!(search.threads, Some(2));
        assert_eq!(search.extra_candidates, ExtraCandidates::Discard);
    }
}
