use std::sync::Arc;

use accurate::{sum::Klein, traits::*};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::{
    config::{FitSettings, InitialState},
    constraints::ConstraintEvaluator,
    measurement::Measurement,
    particle::{Candidate, FitParticle},
    result::Pull,
    topology::{NodeKind, Topology},
    uncertainties::UncertaintyModel,
    utils::{enums::Quantity, vectors::Vec4},
    KinfitError, KinfitResult,
};

/// Location of a free fit parameter.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum Slot {
    Beam,
    Leaf { leaf: usize, index: usize },
}

/// A [`Topology`] with one candidate bound to every leaf.
///
/// The tree owns the fitted state of one permutation. Its free parameters (the beam energy if it
/// is not exact, followed by every non-fixed leaf parameter in leaf order) form the parameter
/// vector seen by the [`Solver`](crate::solver::Solver).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitTree {
    evaluator: ConstraintEvaluator,
    initial: InitialState,
    beam: Measurement,
    particles: Vec<FitParticle>,
    assignment: Vec<usize>,
    slots: Vec<Slot>,
}

impl FitTree {
    /// Bind `candidates[assignment[i]]` to leaf `i` of `topology`, with uncertainties from
    /// `model`.
    ///
    /// Unmeasured quantities of a single leaf are seeded from the missing four-momentum of the
    /// other leaves.
    ///
    /// # Errors
    ///
    /// Fails with [`KinfitError::UnmodeledUncertainty`] if `model` cannot describe a candidate,
    /// [`KinfitError::InvalidMeasurement`] for unusable candidate values or uncertainties and
    /// [`KinfitError::Underconstrained`] if there are more free unmeasured parameters than
    /// constraint equations.
    pub fn bind(
        topology: Arc<Topology>,
        initial: &InitialState,
        beam_energy: f64,
        candidates: &[Candidate],
        assignment: &[usize],
        model: &dyn UncertaintyModel,
        settings: &FitSettings,
    ) -> KinfitResult<Self> {
        if assignment.len() != topology.n_leaves() {
            return Err(KinfitError::Custom(format!(
                "cannot assign {} candidates to the {} leaves of \"{}\"",
                assignment.len(),
                topology.n_leaves(),
                topology.name()
            )));
        }
        let beam = initial.beam_measurement(beam_energy)?;
        let particles = assignment
            .iter()
            .enumerate()
            .map(|(leaf, &index)| {
                let candidate = candidates.get(index).ok_or_else(|| {
                    KinfitError::Custom(format!(
                        "candidate {} does not exist ({} given)",
                        index,
                        candidates.len()
                    ))
                })?;
                let kind = topology.leaf_kind(leaf);
                let sigmas = model.sigmas(kind, candidate)?;
                FitParticle::bind(kind, candidate, &sigmas, settings)
            })
            .collect::<KinfitResult<Vec<_>>>()?;
        let mut slots = Vec::new();
        if beam.is_free() {
            slots.push(Slot::Beam);
        }
        for (leaf, particle) in particles.iter().enumerate() {
            for (index, measurement) in particle.measurements().iter().enumerate() {
                if measurement.is_free() {
                    slots.push(Slot::Leaf { leaf, index });
                }
            }
        }
        let mut tree = Self {
            evaluator: ConstraintEvaluator::new(topology),
            initial: initial.clone(),
            beam,
            particles,
            assignment: assignment.to_vec(),
            slots,
        };
        let (equations, unmeasured) = (tree.n_equations(), tree.n_unmeasured());
        if unmeasured > equations {
            return Err(KinfitError::Underconstrained {
                equations,
                unmeasured,
            });
        }
        tree.seed_unmeasured();
        Ok(tree)
    }

    fn seed_unmeasured(&mut self) {
        let is_open = |particle: &FitParticle| {
            particle.measurements()[..3]
                .iter()
                .any(|m| m.is_unmeasured())
        };
        let open: Vec<usize> = (0..self.particles.len())
            .filter(|&leaf| is_open(&self.particles[leaf]))
            .collect();
        let &[leaf] = open.as_slice() else {
            return;
        };
        let missing: Vec4 = self.initial_vector()
            - self
                .particles
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != leaf)
                .map(|(_, particle)| particle.current_vector())
                .sum::<Vec4>();
        let p3 = missing.vec3();
        let mass = self.particles[leaf].kind().mass();
        let ek = (p3.mag2() + mass * mass).sqrt() - mass;
        for measurement in self.particles[leaf].measurements_mut() {
            if !measurement.is_unmeasured() {
                continue;
            }
            match measurement.quantity() {
                Quantity::Energy if ek > 0.0 => measurement.seed(ek),
                Quantity::Theta if p3.mag2() > 0.0 => measurement.seed(p3.theta()),
                Quantity::Phi if p3.mag2() > 0.0 => measurement.seed(p3.phi()),
                _ => {}
            }
        }
        self.particles[leaf].update();
        tracing::trace!(leaf, ek, "seeded unmeasured leaf from missing momentum");
    }

    pub fn topology(&self) -> &Arc<Topology> {
        self.evaluator.topology()
    }
    pub fn evaluator(&self) -> &ConstraintEvaluator {
        &self.evaluator
    }
    pub fn initial_state(&self) -> &InitialState {
        &self.initial
    }
    /// The beam energy parameter.
    pub fn beam(&self) -> &Measurement {
        &self.beam
    }
    /// Bound particles, by leaf index.
    pub fn particles(&self) -> &[FitParticle] {
        &self.particles
    }
    /// The particle bound to the leaf called `name`.
    pub fn particle(&self, name: &str) -> KinfitResult<&FitParticle> {
        let id = self.topology().find(name)?;
        match self.topology().node(id).kind {
            NodeKind::Leaf { leaf, .. } => Ok(&self.particles[leaf]),
            NodeKind::Internal { .. } => Err(KinfitError::NodeNotFound {
                name: format!("{} (not a leaf)", name),
            }),
        }
    }
    /// Index of the candidate bound to each leaf.
    pub fn assignment(&self) -> &[usize] {
        &self.assignment
    }
    /// Beam plus target at the current beam energy.
    pub fn initial_vector(&self) -> Vec4 {
        self.initial.four_vector(self.beam.physical())
    }
    /// Current four-vectors of the leaves.
    pub fn leaf_vectors(&self) -> Vec<Vec4> {
        self.particles.iter().map(|p| p.current_vector()).collect()
    }
    /// The current four-vector of the node called `name` (the sum over its leaves).
    pub fn node_vector(&self, name: &str) -> KinfitResult<Vec4> {
        let id = self.topology().find(name)?;
        Ok(self.evaluator.node_vectors(&self.leaf_vectors())[id.index()])
    }

    pub fn n_parameters(&self) -> usize {
        self.slots.len()
    }
    pub fn n_unmeasured(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| self.measurement(slot).is_unmeasured())
            .count()
    }
    pub fn n_equations(&self) -> usize {
        self.evaluator.n_equations()
    }
    /// Degrees of freedom: constraint equations minus unmeasured parameters.
    pub fn ndf(&self) -> usize {
        self.n_equations().saturating_sub(self.n_unmeasured())
    }

    fn measurement(&self, slot: &Slot) -> &Measurement {
        match slot {
            Slot::Beam => &self.beam,
            Slot::Leaf { leaf, index } => &self.particles[*leaf].measurements()[*index],
        }
    }
    /// The free parameters in fit order.
    pub fn parameter_measurements(&self) -> Vec<&Measurement> {
        self.slots.iter().map(|slot| self.measurement(slot)).collect()
    }
    /// Current raw values of the free parameters.
    pub fn parameters(&self) -> DVector<f64> {
        DVector::from_iterator(
            self.slots.len(),
            self.slots.iter().map(|slot| self.measurement(slot).fitted()),
        )
    }
    /// Move the free parameters to `p` and refresh the cached four-vectors.
    pub fn set_parameters(&mut self, p: &[f64]) {
        for (slot, value) in self.slots.iter().zip(p) {
            match slot {
                Slot::Beam => self.beam.set_fitted(*value),
                Slot::Leaf { leaf, index } => {
                    self.particles[*leaf].measurements_mut()[*index].set_fitted(*value)
                }
            }
        }
        for particle in self.particles.iter_mut() {
            particle.update();
        }
    }
    /// Return every parameter to its measured value.
    pub fn reset(&mut self) {
        self.beam.reset();
        for particle in self.particles.iter_mut() {
            for measurement in particle.measurements_mut() {
                measurement.reset();
            }
            particle.update();
        }
    }

    fn vectors_at(&self, p: &[f64]) -> (Vec4, Vec<Vec4>) {
        let mut beam = self.beam.fitted();
        let mut raw: Vec<Vec<f64>> = self
            .particles
            .iter()
            .map(|particle| particle.measurements().iter().map(|m| m.fitted()).collect())
            .collect();
        for (slot, value) in self.slots.iter().zip(p) {
            match slot {
                Slot::Beam => beam = *value,
                Slot::Leaf { leaf, index } => raw[*leaf][*index] = *value,
            }
        }
        let initial = self
            .initial
            .four_vector(self.beam.transform().to_physical(beam));
        let leaves = self
            .particles
            .iter()
            .zip(&raw)
            .map(|(particle, values)| particle.vector_from(values))
            .collect();
        (initial, leaves)
    }
    /// Constraint residuals at the free parameters `p`, leaving the tree untouched.
    pub fn constraints_at(&self, p: &[f64]) -> DVector<f64> {
        let (initial, leaves) = self.vectors_at(p);
        self.evaluator.evaluate(&leaves, &initial)
    }
    /// Constraint residuals at the current parameters.
    pub fn constraints(&self) -> DVector<f64> {
        self.evaluator
            .evaluate(&self.leaf_vectors(), &self.initial_vector())
    }
    /// $`\chi^2`$ at the free parameters `p`.
    pub fn chi2_at(&self, p: &[f64]) -> f64 {
        self.slots
            .iter()
            .zip(p)
            .filter_map(|(slot, value)| self.measurement(slot).residual_at(*value))
            .map(|r| r * r)
            .sum_with_accumulator::<Klein<f64>>()
    }
    /// $`\chi^2`$ at the current parameters.
    pub fn chi2(&self) -> f64 {
        self.chi2_at(self.parameters().as_slice())
    }
    /// Normalized residuals of all measured parameters.
    pub fn pulls(&self) -> Vec<Pull> {
        self.slots
            .iter()
            .filter_map(|slot| {
                let measurement = self.measurement(slot);
                let value = measurement.residual()?;
                let leaf = match slot {
                    Slot::Beam => None,
                    Slot::Leaf { leaf, .. } => Some(self.topology().leaf_name(*leaf).to_string()),
                };
                Some(Pull {
                    leaf,
                    quantity: measurement.quantity(),
                    value,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use crate::{
        config::BeamTreatment,
        topology::{Decay, TopologyDefinition},
        uncertainties::{ConstantUncertainties, Sigmas},
        utils::enums::{Detector, ParticleKind},
    };

    use super::*;

    fn pi0p() -> Arc<Topology> {
        Arc::new(
            TopologyDefinition::new(
                "pi0p",
                vec![
                    Decay::resonance(
                        "pi0",
                        134.9766,
                        vec![
                            Decay::leaf("g1", ParticleKind::Photon),
                            Decay::leaf("g2", ParticleKind::Photon),
                        ],
                    ),
                    Decay::leaf("p", ParticleKind::Proton),
                ],
            )
            .build()
            .unwrap(),
        )
    }

    fn model(proton_energy_sigma: f64) -> ConstantUncertainties {
        ConstantUncertainties::new()
            .with(
                ParticleKind::Photon,
                Detector::Barrel,
                Sigmas::new(5.0, 0.02, 0.02),
            )
            .with(
                ParticleKind::Proton,
                Detector::Forward,
                Sigmas::new(proton_energy_sigma, 0.01, 0.01),
            )
    }

    fn candidates() -> Vec<Candidate> {
        vec![
            Candidate::new(300.0, 0.8, 0.3, Detector::Barrel),
            Candidate::new(200.0, 1.4, -2.5, Detector::Barrel),
            Candidate::new(150.0, 0.3, 2.0, Detector::Forward),
        ]
    }

    #[test]
    fn test_bind_layout() {
        let tree = FitTree::bind(
            pi0p(),
            &InitialState::default(),
            700.0,
            &candidates(),
            &[0, 1, 2],
            &model(4.0),
            &FitSettings::default(),
        )
        .unwrap();
        assert_eq!(tree.n_parameters(), 9);
        assert_eq!(tree.n_unmeasured(), 0);
        assert_eq!(tree.ndf(), 5);
        assert_eq!(tree.chi2(), 0.0);
        assert_eq!(tree.pulls().len(), 9);
        assert_eq!(tree.pulls()[3].leaf.as_deref(), Some("g2"));
        assert_relative_eq!(
            tree.particle("g2").unwrap().current_vector().e(),
            200.0
        );
        assert!(tree.particle("pi0").is_err());
        let c = tree.constraints();
        let p = tree.parameters();
        assert_eq!(c, tree.constraints_at(p.as_slice()));
        let pi0 = tree.node_vector("pi0").unwrap();
        assert_relative_eq!(c[0], pi0.mag() - 134.9766, epsilon = 1e-9);
    }

    #[test]
    fn test_free_beam_and_proton() {
        let initial = InitialState::default().with_beam(BeamTreatment::Unmeasured);
        let tree = FitTree::bind(
            pi0p(),
            &initial,
            700.0,
            &candidates(),
            &[0, 1, 2],
            &model(0.0),
            &FitSettings::default(),
        )
        .unwrap();
        assert_eq!(tree.n_parameters(), 10);
        assert_eq!(tree.n_unmeasured(), 2);
        assert_eq!(tree.ndf(), 3);
        assert!(tree.pulls().iter().all(|pull| pull.leaf.is_some()));
    }

    #[test]
    fn test_seeding() {
        let tree = FitTree::bind(
            pi0p(),
            &InitialState::default(),
            700.0,
            &candidates(),
            &[0, 1, 2],
            &model(0.0),
            &FitSettings::default(),
        )
        .unwrap();
        // the seeded proton energy balances the momentum of the photons
        let photons: Vec4 = tree.leaf_vectors()[..2].iter().sum();
        let missing = tree.initial_vector() - photons;
        let proton = tree.particle("p").unwrap();
        let ek = proton.measurement(Quantity::Energy).unwrap().physical();
        assert_relative_eq!(
            ek,
            (missing.vec3().mag2() + 938.272f64.powi(2)).sqrt() - 938.272,
            epsilon = 1e-9
        );
        // the seed is a starting point, not a measurement
        assert_eq!(tree.chi2(), 0.0);
    }

    #[test]
    fn test_underconstrained() {
        let all_free = ConstantUncertainties::new()
            .with(ParticleKind::Photon, Detector::Barrel, Sigmas::new(0.0, 0.0, 0.02))
            .with(ParticleKind::Proton, Detector::Forward, Sigmas::new(0.0, 0.01, 0.01));
        let exact = FitTree::bind(
            pi0p(),
            &InitialState::default(),
            700.0,
            &candidates(),
            &[0, 1, 2],
            &all_free,
            &FitSettings::default(),
        )
        .unwrap();
        assert_eq!(exact.n_unmeasured(), 5);
        assert_eq!(exact.ndf(), 0);
        let none_measured = ConstantUncertainties::new()
            .with(ParticleKind::Photon, Detector::Barrel, Sigmas::new(0.0, 0.0, 0.0))
            .with(ParticleKind::Proton, Detector::Forward, Sigmas::new(0.0, 0.01, 0.01));
        assert!(matches!(
            FitTree::bind(
                pi0p(),
                &InitialState::default(),
                700.0,
                &candidates(),
                &[0, 1, 2],
                &none_measured,
                &FitSettings::default(),
            ),
            Err(KinfitError::Underconstrained {
                equations: 5,
                unmeasured: 7
            })
        ));
    }

    #[test]
    fn test_set_parameters_and_reset() {
        let mut tree = FitTree::bind(
            pi0p(),
            &InitialState::default(),
            700.0,
            &candidates(),
            &[0, 1, 2],
            &model(4.0),
            &FitSettings::default(),
        )
        .unwrap();
        let mut p = tree.parameters();
        p[0] += 10.0;
        tree.set_parameters(p.as_slice());
        assert_relative_eq!(tree.particles()[0].current_vector().e(), 310.0);
        assert_relative_eq!(tree.chi2(), 4.0, epsilon = 1e-12);
        tree.reset();
        assert_eq!(tree.chi2(), 0.0);
    }
}
