use nalgebra::{DMatrix, DVector};
#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::{
    config::FitSettings,
    result::{FitResult, FitStatus},
    tree::FitTree,
    utils::functions::chi2_probability,
};

/// Where a [`Solver`] stands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SolverState {
    /// Nothing has been computed beyond the starting point.
    Initialized,
    /// At least one iteration ran and the fit has not finished.
    Iterating,
    /// The fit ended with the given status.
    Finished(FitStatus),
}

/// Iterative least-squares fit of a [`FitTree`] under its constraints.
///
/// Every step linearizes the constraints $`c(p)`$ around the current parameters with a
/// central-difference Jacobian $`J`$ and solves
///
/// ```math
/// \begin{pmatrix} W & J_s^\intercal \\ J_s & 0 \end{pmatrix}
/// \begin{pmatrix} \delta \\ \lambda \end{pmatrix}
/// = \begin{pmatrix} -r \\ -c \end{pmatrix}
/// ```
///
/// in scaled coordinates $`\Delta p_i = s_i \delta_i`$, where $`s_i`$ is the uncertainty of a
/// measured parameter and $`\max(|p_i|, 1)`$ for an unmeasured one, $`J_s = J\,\text{diag}(s)`$,
/// $`r`$ are the normalized residuals and $`W`$ is the identity on measured parameters and zero on
/// unmeasured ones. The step minimizes $`\chi^2`$ subject to $`c + J\Delta p = 0`$.
///
/// The [`Solver::step`] method advances a single iteration, so callers can interleave their own
/// checks (a time budget, for instance) and stop with [`Solver::finish`] at any point.
#[derive(Clone, Debug)]
pub struct Solver {
    tree: FitTree,
    settings: FitSettings,
    state: SolverState,
    iterations: usize,
    chi2: f64,
    constraints: DVector<f64>,
}

impl Solver {
    pub fn new(tree: FitTree, settings: &FitSettings) -> Self {
        let chi2 = tree.chi2();
        let constraints = tree.constraints();
        Self {
            tree,
            settings: settings.clone(),
            state: SolverState::Initialized,
            iterations: 0,
            chi2,
            constraints,
        }
    }
    pub fn state(&self) -> SolverState {
        self.state
    }
    pub fn is_finished(&self) -> bool {
        matches!(self.state, SolverState::Finished(_))
    }
    pub fn iterations(&self) -> usize {
        self.iterations
    }
    /// $`\chi^2`$ after the latest iteration.
    pub fn chi2(&self) -> f64 {
        self.chi2
    }
    /// Constraint residuals after the latest iteration.
    pub fn constraints(&self) -> &DVector<f64> {
        &self.constraints
    }
    pub fn tree(&self) -> &FitTree {
        &self.tree
    }

    fn max_constraint(&self) -> f64 {
        self.constraints
            .iter()
            .fold(0.0, |acc: f64, c| if c.is_nan() { f64::NAN } else { acc.max(c.abs()) })
    }

    fn stop(&mut self, status: FitStatus) -> SolverState {
        self.state = SolverState::Finished(status);
        tracing::debug!(
            %status,
            iterations = self.iterations,
            chi2 = self.chi2,
            "fit finished"
        );
        self.state
    }

    /// Run one iteration and return the new state. Finished solvers are left unchanged.
    pub fn step(&mut self) -> SolverState {
        match self.state {
            SolverState::Finished(_) => return self.state,
            SolverState::Initialized => {
                if !self.chi2.is_finite() || self.constraints.iter().any(|c| !c.is_finite()) {
                    return self.stop(FitStatus::NumericalFailure);
                }
                if self.tree.n_parameters() == 0 {
                    // nothing to adjust: the starting point either satisfies the constraints or not
                    return if self.max_constraint() < self.settings.constraint_epsilon {
                        self.stop(FitStatus::Converged)
                    } else {
                        self.stop(FitStatus::NumericalFailure)
                    };
                }
                self.state = SolverState::Iterating;
            }
            SolverState::Iterating => {}
        }
        if self.iterations >= self.settings.max_iterations {
            return self.stop(FitStatus::MaxIterations);
        }
        self.iterations += 1;
        let p = self.tree.parameters();
        let jacobian = self.jacobian(&p);
        let Some(delta) = self.solve(&p, &jacobian) else {
            return self.stop(FitStatus::NumericalFailure);
        };
        let next = &p + delta;
        if next.iter().any(|v| !v.is_finite()) {
            return self.stop(FitStatus::NumericalFailure);
        }
        self.tree.set_parameters(next.as_slice());
        let chi2 = self.tree.chi2();
        let constraints = self.tree.constraints();
        if !chi2.is_finite() || constraints.iter().any(|c| !c.is_finite()) {
            return self.stop(FitStatus::NumericalFailure);
        }
        let delta_chi2 = (chi2 - self.chi2).abs();
        self.chi2 = chi2;
        self.constraints = constraints;
        let max_constraint = self.max_constraint();
        tracing::debug!(
            iteration = self.iterations,
            chi2,
            delta_chi2,
            max_constraint,
            "solver iteration"
        );
        if delta_chi2 < self.settings.chi2_epsilon
            && max_constraint < self.settings.constraint_epsilon
        {
            self.stop(FitStatus::Converged)
        } else if self.iterations >= self.settings.max_iterations {
            self.stop(FitStatus::MaxIterations)
        } else {
            self.state
        }
    }

    /// Iterate until the fit finishes and return its result.
    pub fn run(mut self) -> FitResult {
        while !self.is_finished() {
            self.step();
        }
        self.finish()
    }

    /// Build the result from the current state. A solver stopped before it finished reports
    /// [`FitStatus::MaxIterations`].
    pub fn finish(self) -> FitResult {
        let status = match self.state {
            SolverState::Finished(status) => status,
            SolverState::Initialized | SolverState::Iterating => FitStatus::MaxIterations,
        };
        let ndf = self.tree.ndf();
        let probability = if status.is_converged() {
            chi2_probability(self.chi2, ndf)
        } else {
            0.0
        };
        let max_constraint = self.max_constraint();
        FitResult {
            status,
            chi2: self.chi2,
            ndf,
            iterations: self.iterations,
            max_constraint,
            pulls: self.tree.pulls(),
            probability,
            fitted_tree: Some(self.tree),
        }
    }

    fn jacobian_column(&self, p: &DVector<f64>, j: usize) -> DVector<f64> {
        let h = self.settings.step_scale * (p[j].abs() + 1.0);
        let mut plus = p.clone();
        plus[j] += h;
        let mut minus = p.clone();
        minus[j] -= h;
        (self.tree.constraints_at(plus.as_slice()) - self.tree.constraints_at(minus.as_slice()))
            / (2.0 * h)
    }

    #[cfg(feature = "rayon")]
    fn jacobian(&self, p: &DVector<f64>) -> DMatrix<f64> {
        let columns: Vec<DVector<f64>> = if self.settings.parallel_jacobian {
            (0..p.len())
                .into_par_iter()
                .map(|j| self.jacobian_column(p, j))
                .collect()
        } else {
            (0..p.len()).map(|j| self.jacobian_column(p, j)).collect()
        };
        DMatrix::from_columns(&columns)
    }

    #[cfg(not(feature = "rayon"))]
    fn jacobian(&self, p: &DVector<f64>) -> DMatrix<f64> {
        let columns: Vec<DVector<f64>> = (0..p.len()).map(|j| self.jacobian_column(p, j)).collect();
        DMatrix::from_columns(&columns)
    }

    /// The parameter step, or `None` if the linear system is singular.
    fn solve(&self, p: &DVector<f64>, jacobian: &DMatrix<f64>) -> Option<DVector<f64>> {
        let n = p.len();
        let m = self.constraints.len();
        let measurements = self.tree.parameter_measurements();
        let scales: Vec<f64> = measurements
            .iter()
            .zip(p.iter())
            .map(|(measurement, value)| {
                if measurement.is_measured() {
                    measurement.sigma()
                } else {
                    value.abs().max(1.0)
                }
            })
            .collect();
        let mut a = DMatrix::<f64>::zeros(n + m, n + m);
        let mut b = DVector::<f64>::zeros(n + m);
        for (j, measurement) in measurements.iter().enumerate() {
            if let Some(residual) = measurement.residual_at(p[j]) {
                a[(j, j)] = 1.0;
                b[j] = -residual;
            }
            for i in 0..m {
                let scaled = jacobian[(i, j)] * scales[j];
                a[(n + i, j)] = scaled;
                a[(j, n + i)] = scaled;
            }
        }
        for i in 0..m {
            b[n + i] = -self.constraints[i];
        }
        let lu = a.full_piv_lu();
        let pivots = lu.u().diagonal();
        let largest = pivots.amax();
        let smallest = pivots.iter().fold(f64::INFINITY, |acc, d| acc.min(d.abs()));
        if largest.is_nan() || largest <= 0.0 || smallest <= self.settings.pivot_tolerance * largest {
            tracing::trace!(smallest, largest, "singular constraint system");
            return None;
        }
        let solution = lu.solve(&b)?;
        Some(DVector::from_iterator(
            n,
            (0..n).map(|j| solution[j] * scales[j]),
        ))
    }
}

/// Fit `tree` to completion.
pub fn fit(tree: FitTree, settings: &FitSettings) -> FitResult {
    Solver::new(tree, settings).run()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use crate::{
        config::{BeamTreatment, InitialState},
        mc::{EventGenerator, Smearer},
        particle::Candidate,
        config::EnergyParameterization,
        topology::{Decay, Topology, TopologyDefinition},
        uncertainties::{ConstantUncertainties, Sigmas, UncertaintyModel},
        utils::{
            enums::{Detector, ParticleKind, Quantity},
            vectors::Vec3,
        },
    };

    use super::*;

    const BEAM: f64 = 700.0;
    const PI0_MASS: f64 = 134.9766;

    fn pi0p() -> Arc<Topology> {
        Arc::new(
            TopologyDefinition::new(
                "pi0p",
                vec![
                    Decay::resonance(
                        "pi0",
                        PI0_MASS,
                        vec![
                            Decay::leaf("g1", ParticleKind::Photon),
                            Decay::leaf("g2", ParticleKind::Photon),
                        ],
                    ),
                    Decay::leaf("p", ParticleKind::Proton),
                ],
            )
            .with_sibling_symmetries()
            .build()
            .unwrap(),
        )
    }

    fn model(proton_energy_sigma: f64) -> ConstantUncertainties {
        let photon = Sigmas::new(3.0, 0.02, 0.02);
        let proton = Sigmas::new(proton_energy_sigma, 0.01, 0.02);
        ConstantUncertainties::new()
            .with(ParticleKind::Photon, Detector::Barrel, photon)
            .with(ParticleKind::Photon, Detector::Forward, photon)
            .with(ParticleKind::Proton, Detector::Barrel, proton)
            .with(ParticleKind::Proton, Detector::Forward, proton)
    }

    /// Exact candidates away from the beam axis and with enough energy for the resolution.
    fn exact_event(generator: &EventGenerator, rng: &mut ChaCha8Rng) -> Vec<Candidate> {
        loop {
            let candidates = generator.candidates(&generator.generate(BEAM, rng));
            if candidates.iter().all(|c| {
                c.energy > 50.0 && c.theta > 0.1 && c.theta < std::f64::consts::PI - 0.1
            }) {
                return candidates;
            }
        }
    }

    fn bind(
        candidates: &[Candidate],
        initial: &InitialState,
        model: &dyn UncertaintyModel,
    ) -> FitTree {
        FitTree::bind(
            pi0p(),
            initial,
            BEAM,
            candidates,
            &[0, 1, 2],
            model,
            &FitSettings::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_noiseless_fit() {
        let generator = EventGenerator::new(pi0p(), InitialState::default()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let candidates = exact_event(&generator, &mut rng);
        let result = fit(
            bind(&candidates, &InitialState::default(), &model(3.0)),
            &FitSettings::default(),
        );
        assert_eq!(result.status, FitStatus::Converged);
        assert!(result.iterations <= 2);
        assert!(result.chi2 < 1e-6);
        assert_eq!(result.ndf, 5);
        assert!(result.probability > 0.99);
        let tree = result.fitted_tree.as_ref().unwrap();
        for (particle, candidate) in tree.particles().iter().zip(&candidates) {
            let fitted = particle.fitted_candidate();
            assert_relative_eq!(fitted.energy, candidate.energy, max_relative = 1e-6);
            assert_relative_eq!(fitted.theta, candidate.theta, epsilon = 1e-6);
            assert_relative_eq!(fitted.phi, candidate.phi, epsilon = 1e-6);
        }
        assert_relative_eq!(
            result.fitted_vector("pi0").unwrap().mag(),
            PI0_MASS,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_free_beam_and_proton_energy() {
        let generator = EventGenerator::new(pi0p(), InitialState::default()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let candidates = exact_event(&generator, &mut rng);
        let initial = InitialState::default().with_beam(BeamTreatment::Unmeasured);
        let result = fit(
            bind(&candidates, &initial, &model(0.0)),
            &FitSettings::default(),
        );
        assert_eq!(result.status, FitStatus::Converged);
        // 5 equations, unmeasured beam energy and proton energy
        assert_eq!(result.ndf, 3);
        assert!(result.chi2 < 1e-6);
        let tree = result.fitted_tree.unwrap();
        assert_relative_eq!(tree.beam().physical(), BEAM, max_relative = 1e-6);
        assert_relative_eq!(
            tree.particle("p").unwrap().fitted_candidate().energy,
            candidates[2].energy,
            max_relative = 1e-6
        );
        // unmeasured parameters have no pulls
        assert_eq!(result.pulls.len(), 8);
        assert!(result.pulls.iter().all(|pull| pull.quantity != Quantity::BeamEnergy));
    }

    fn vertex_model() -> ConstantUncertainties {
        let photon = Sigmas::new(3.0, 0.02, 0.02);
        let proton = Sigmas::new(3.0, 0.01, 0.02).with_vertex(1.0);
        ConstantUncertainties::new()
            .with(ParticleKind::Photon, Detector::Barrel, photon)
            .with(ParticleKind::Photon, Detector::Forward, photon)
            .with(ParticleKind::Proton, Detector::Barrel, proton)
            .with(ParticleKind::Proton, Detector::Forward, proton)
    }

    /// The same track coming from a vertex at `z`, with its angles taken at the detector hit.
    fn displaced(candidate: &Candidate, z: f64) -> Candidate {
        let n = Vec3::from_polar(1.0, candidate.theta, candidate.phi);
        let arm = candidate.detector.lever_arm();
        let along = -z * n.z + (z * z * n.z * n.z - z * z + arm * arm).sqrt();
        let hit = Vec3::new(0.0, 0.0, z) + n * along;
        Candidate {
            theta: hit.theta(),
            ..*candidate
        }
        .with_vertex(z)
    }

    #[test]
    fn test_vertex_fit() {
        let generator = EventGenerator::new(pi0p(), InitialState::default()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut truth = exact_event(&generator, &mut rng);
        let flight = truth[2].theta;
        truth[2] = displaced(&truth[2], 2.0);
        assert!((truth[2].theta - flight).abs() > 1e-4);

        let tree = bind(&truth, &InitialState::default(), &vertex_model());
        assert!(tree.particle("p").unwrap().has_vertex());
        assert_eq!(tree.n_parameters(), 10);
        let result = fit(tree, &FitSettings::default());
        assert_eq!(result.status, FitStatus::Converged);
        assert!(result.iterations <= 2);
        assert!(result.chi2 < 1e-6);
        assert_eq!(result.ndf, 5);
        let proton = result.fitted_tree.as_ref().unwrap().particle("p").unwrap();
        assert_relative_eq!(
            proton.fitted_candidate().vertex_z.unwrap(),
            2.0,
            epsilon = 1e-6
        );
        assert_relative_eq!(proton.fitted_candidate().theta, truth[2].theta, epsilon = 1e-6);

        let mut smearer = Smearer::new(Box::new(vertex_model()), 7);
        let kinds = [ParticleKind::Photon, ParticleKind::Photon, ParticleKind::Proton];
        let candidates = smearer.smear_all(&kinds, &truth).unwrap();
        assert!(candidates[2].vertex_z.is_some());
        let result = fit(
            bind(&candidates, &InitialState::default(), &vertex_model()),
            &FitSettings::default(),
        );
        assert_eq!(result.status, FitStatus::Converged);
        assert!(result.chi2 > 0.0);
        assert_relative_eq!(
            result.fitted_vector("pi0").unwrap().mag(),
            PI0_MASS,
            epsilon = 1e-4
        );
        assert!(result
            .pulls
            .iter()
            .any(|pull| pull.leaf.as_deref() == Some("p") && pull.quantity == Quantity::VertexZ));
    }

    #[test]
    fn test_inverse_kinetic_energy() {
        let settings = FitSettings::default().with_energy(EnergyParameterization::InverseKinetic);
        let bind_inverse = |candidates: &[Candidate]| {
            FitTree::bind(
                pi0p(),
                &InitialState::default(),
                BEAM,
                candidates,
                &[0, 1, 2],
                &model(3.0),
                &settings,
            )
            .unwrap()
        };
        let generator = EventGenerator::new(pi0p(), InitialState::default()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        let truth = exact_event(&generator, &mut rng);
        let result = fit(bind_inverse(&truth), &settings);
        assert_eq!(result.status, FitStatus::Converged);
        assert!(result.iterations <= 2);
        assert!(result.chi2 < 1e-6);
        let tree = result.fitted_tree.as_ref().unwrap();
        for (particle, candidate) in tree.particles().iter().zip(&truth) {
            assert_relative_eq!(
                particle.fitted_candidate().energy,
                candidate.energy,
                max_relative = 1e-6
            );
        }

        let mut smearer = Smearer::new(Box::new(model(3.0)), 8);
        let kinds = [ParticleKind::Photon, ParticleKind::Photon, ParticleKind::Proton];
        let candidates = smearer.smear_all(&kinds, &truth).unwrap();
        let result = fit(bind_inverse(&candidates), &settings);
        assert_eq!(result.status, FitStatus::Converged);
        assert!(result.chi2 > 0.0);
        assert_relative_eq!(
            result.fitted_vector("pi0").unwrap().mag(),
            PI0_MASS,
            epsilon = 1e-4
        );
        assert!(result
            .pulls
            .iter()
            .filter(|pull| pull.quantity == Quantity::Energy)
            .all(|pull| pull.value.is_finite()));
    }

    #[test]
    fn test_measured_beam() {
        let initial = InitialState::default().with_beam(BeamTreatment::Measured { sigma: 5.0 });
        let generator = EventGenerator::new(pi0p(), InitialState::default()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let truth = exact_event(&generator, &mut rng);
        let result = fit(bind(&truth, &initial, &model(3.0)), &FitSettings::default());
        assert_eq!(result.status, FitStatus::Converged);
        assert!(result.iterations <= 2);
        assert!(result.chi2 < 1e-6);
        assert_eq!(result.ndf, 5);
        // nine candidate quantities and the beam energy
        assert_eq!(result.pulls.len(), 10);
        assert!(result
            .pulls
            .iter()
            .any(|pull| pull.leaf.is_none() && pull.quantity == Quantity::BeamEnergy));

        // a tagger reading 3 MeV too high
        let tree = FitTree::bind(
            pi0p(),
            &initial,
            BEAM + 3.0,
            &truth,
            &[0, 1, 2],
            &model(3.0),
            &FitSettings::default(),
        )
        .unwrap();
        let result = fit(tree, &FitSettings::default());
        assert_eq!(result.status, FitStatus::Converged);
        assert!(result.chi2 > 0.0);
        let beam = result.fitted_tree.as_ref().unwrap().beam().physical();
        assert!(beam < BEAM + 3.0 && beam > BEAM - 3.0, "fitted beam {}", beam);
    }

    #[test]
    fn test_exactly_constrained() {
        let generator = EventGenerator::new(pi0p(), InitialState::default()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let truth = exact_event(&generator, &mut rng);
        let mut candidates = truth.clone();
        // start the free quantities away from the solution
        candidates[0].energy += 10.0;
        candidates[1].energy -= 5.0;
        candidates[2].energy += 20.0;
        candidates[2].theta += 0.05;
        let photon = Sigmas::new(0.0, 0.02, 0.02);
        let proton = Sigmas::new(0.0, 0.0, 0.0);
        let model = ConstantUncertainties::new()
            .with(ParticleKind::Photon, Detector::Barrel, photon)
            .with(ParticleKind::Photon, Detector::Forward, photon)
            .with(ParticleKind::Proton, Detector::Barrel, proton)
            .with(ParticleKind::Proton, Detector::Forward, proton);
        let tree = bind(&candidates, &InitialState::default(), &model);
        assert_eq!(tree.n_unmeasured(), tree.n_equations());
        let result = fit(tree, &FitSettings::default());
        assert_eq!(result.status, FitStatus::Converged);
        assert_eq!(result.ndf, 0);
        assert!(result.chi2 < 1e-12);
        assert_eq!(result.probability, 1.0);
        let fitted = result.fitted_tree.unwrap();
        for (particle, expected) in fitted.particles().iter().zip(&truth) {
            assert_relative_eq!(
                particle.fitted_candidate().energy,
                expected.energy,
                max_relative = 1e-6
            );
        }
    }

    #[test]
    fn test_formation() {
        let topology = Arc::new(
            TopologyDefinition::new(
                "formation",
                vec![Decay::unconstrained(
                    "x",
                    vec![
                        Decay::leaf("g1", ParticleKind::Photon),
                        Decay::leaf("g2", ParticleKind::Photon),
                    ],
                )],
            )
            .build()
            .unwrap(),
        );
        let initial = InitialState::default();
        let generator = EventGenerator::new(topology.clone(), initial.clone()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let truth = generator.candidates(&generator.generate(BEAM, &mut rng));
        let mut smearer = Smearer::new(Box::new(model(3.0)), 4);
        let kinds = [ParticleKind::Photon, ParticleKind::Photon];
        let candidates = smearer.smear_all(&kinds, &truth).unwrap();
        let tree = FitTree::bind(
            topology,
            &initial,
            BEAM,
            &candidates,
            &[0, 1],
            &model(3.0),
            &FitSettings::default(),
        )
        .unwrap();
        let result = fit(tree, &FitSettings::default());
        assert_eq!(result.status, FitStatus::Converged);
        assert_eq!(result.ndf, 4);
        let target = initial.target_mass;
        assert_relative_eq!(
            result.fitted_vector("x").unwrap().mag(),
            (target * target + 2.0 * BEAM * target).sqrt(),
            epsilon = 1e-4
        );
    }

    #[test]
    fn test_iteration_cap() {
        let generator = EventGenerator::new(pi0p(), InitialState::default()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let truth = exact_event(&generator, &mut rng);
        let mut smearer = Smearer::new(Box::new(model(3.0)), 5);
        let kinds = [ParticleKind::Photon, ParticleKind::Photon, ParticleKind::Proton];
        let candidates = smearer.smear_all(&kinds, &truth).unwrap();
        let tree = bind(&candidates, &InitialState::default(), &model(3.0));
        let capped = fit(tree.clone(), &FitSettings::default().with_max_iterations(1));
        assert_eq!(capped.status, FitStatus::MaxIterations);
        assert_eq!(capped.iterations, 1);
        assert_eq!(capped.probability, 0.0);
        assert!(capped.chi2 > 0.0);
        let full = fit(tree, &FitSettings::default());
        assert_eq!(full.status, FitStatus::Converged);
        assert!(full.iterations > 1);
    }

    #[test]
    fn test_singular_system() {
        // the azimuth of a photon along the beam axis does not enter any constraint
        let model = ConstantUncertainties::new()
            .with(
                ParticleKind::Photon,
                Detector::Forward,
                Sigmas::new(3.0, 0.02, 0.0),
            )
            .with(
                ParticleKind::Photon,
                Detector::Barrel,
                Sigmas::new(3.0, 0.02, 0.02),
            )
            .with(
                ParticleKind::Proton,
                Detector::Barrel,
                Sigmas::new(3.0, 0.02, 0.02),
            );
        let candidates = [
            Candidate::new(300.0, 0.0, 0.0, Detector::Forward),
            Candidate::new(200.0, 1.0, 1.0, Detector::Barrel),
            Candidate::new(100.0, 1.0, -2.0, Detector::Barrel),
        ];
        let result = fit(
            bind(&candidates, &InitialState::default(), &model),
            &FitSettings::default(),
        );
        assert_eq!(result.status, FitStatus::NumericalFailure);
        assert_eq!(result.probability, 0.0);
    }

    #[test]
    fn test_step_and_determinism() {
        let generator = EventGenerator::new(pi0p(), InitialState::default()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let truth = exact_event(&generator, &mut rng);
        let mut smearer = Smearer::new(Box::new(model(3.0)), 6);
        let kinds = [ParticleKind::Photon, ParticleKind::Photon, ParticleKind::Proton];
        let candidates = smearer.smear_all(&kinds, &truth).unwrap();
        let tree = bind(&candidates, &InitialState::default(), &model(3.0));

        let mut solver = Solver::new(tree.clone(), &FitSettings::default());
        assert_eq!(solver.state(), SolverState::Initialized);
        assert_eq!(solver.step(), SolverState::Iterating);
        while !solver.is_finished() {
            solver.step();
        }
        let stepped = solver.finish();
        let first = fit(tree.clone(), &FitSettings::default());
        let second = fit(tree.clone(), &FitSettings::default());
        assert_eq!(first, second);
        assert_eq!(first, stepped);
        let parallel = fit(tree, &FitSettings::default().with_parallel_jacobian(true));
        assert_eq!(parallel.status, first.status);
        assert_relative_eq!(parallel.chi2, first.chi2, epsilon = 1e-9);
    }

    #[test]
    fn test_probability_calibration() {
        let generator = EventGenerator::new(pi0p(), InitialState::default()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut smearer = Smearer::new(Box::new(model(3.0)), 42);
        let kinds = [ParticleKind::Photon, ParticleKind::Photon, ParticleKind::Proton];
        let trials = 400;
        let mut probabilities = Vec::with_capacity(trials);
        for _ in 0..trials {
            let truth = exact_event(&generator, &mut rng);
            let candidates = smearer.smear_all(&kinds, &truth).unwrap();
            let result = fit(
                bind(&candidates, &InitialState::default(), &model(3.0)),
                &FitSettings::default(),
            );
            assert!(result.chi2 >= 0.0);
            if result.is_converged() {
                probabilities.push(result.probability);
            }
        }
        assert!(probabilities.len() >= trials * 95 / 100);
        let mean = probabilities.iter().sum::<f64>() / probabilities.len() as f64;
        assert!((mean - 0.5).abs() < 0.06, "mean probability {}", mean);
    }
}
