use std::fmt::Debug;

use dyn_clone::DynClone;
use serde::{Deserialize, Serialize};

use crate::{
    particle::Candidate,
    utils::enums::{Detector, ParticleKind},
    KinfitError, KinfitResult,
};

/// Uncertainties of one candidate in physical units: MeV for the kinetic energy, radians for the
/// angles and cm for the vertex position.
///
/// A positive value marks the quantity as measured, zero as unmeasured and a negative value as
/// fixed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Sigmas {
    pub energy: f64,
    pub theta: f64,
    pub phi: f64,
    /// Only used for charged particles.
    pub vertex_z: Option<f64>,
}

impl Sigmas {
    pub fn new(energy: f64, theta: f64, phi: f64) -> Self {
        Self {
            energy,
            theta,
            phi,
            vertex_z: None,
        }
    }
    pub fn with_vertex(mut self, vertex_z: f64) -> Self {
        self.vertex_z = Some(vertex_z);
        self
    }
}

/// A source of per-candidate measurement uncertainties.
///
/// Implementors are queried once per candidate and permutation, possibly from several threads at
/// once, so [`UncertaintyModel::sigmas`] must not have side effects.
///
/// ```
/// use kinfit::{Candidate, KinfitResult, ParticleKind, Sigmas, UncertaintyModel};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Debug, Serialize, Deserialize)]
/// struct Flat;
///
/// #[typetag::serde]
/// impl UncertaintyModel for Flat {
///     fn sigmas(&self, _kind: ParticleKind, _candidate: &Candidate) -> KinfitResult<Sigmas> {
///         Ok(Sigmas::new(5.0, 0.02, 0.02))
///     }
/// }
/// ```
#[typetag::serde(tag = "type")]
pub trait UncertaintyModel: DynClone + Send + Sync + Debug {
    /// The uncertainties of `candidate` under the hypothesis `kind`.
    ///
    /// # Errors
    ///
    /// Should return [`KinfitError::UnmodeledUncertainty`] for combinations of particle kind and
    /// detector the model knows nothing about.
    fn sigmas(&self, kind: ParticleKind, candidate: &Candidate) -> KinfitResult<Sigmas>;
}

dyn_clone::clone_trait_object!(UncertaintyModel);

/// How the tabulated energy uncertainty scales with the candidate's kinetic energy $`E_k`$.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum EnergyScaling {
    /// $`\sigma_E`$ is used as is.
    #[default]
    Absolute,
    /// $`\sigma_E \cdot E_k`$
    Relative,
    /// $`\sigma_E \cdot E_k^{1 + a}`$ for an exponent $`a`$.
    Power { exponent: f64 },
}

impl EnergyScaling {
    pub fn apply(&self, sigma: f64, energy: f64) -> f64 {
        match self {
            EnergyScaling::Absolute => sigma,
            EnergyScaling::Relative => sigma * energy,
            EnergyScaling::Power { exponent } => sigma * energy * energy.powf(*exponent),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Entry {
    kind: ParticleKind,
    detector: Detector,
    sigmas: Sigmas,
}

/// A lookup table of uncertainties per particle kind and detector.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstantUncertainties {
    entries: Vec<Entry>,
    scaling: EnergyScaling,
}

impl ConstantUncertainties {
    /// An empty table with absolute energy uncertainties.
    pub fn new() -> Self {
        Self::default()
    }
    /// Photons and protons in the barrel and forward calorimeters with relative energy
    /// resolutions. Proton energies are left unmeasured.
    pub fn calorimeter_defaults() -> Self {
        let deg = std::f64::consts::PI / 180.0;
        Self::new()
            .with_energy_scaling(EnergyScaling::Relative)
            .with(
                ParticleKind::Photon,
                Detector::Barrel,
                Sigmas::new(0.0107, 3.79 * deg, 1.78 * deg),
            )
            .with(
                ParticleKind::Photon,
                Detector::Forward,
                Sigmas::new(0.035, 0.42 * deg, 1.15 * deg),
            )
            .with(
                ParticleKind::Proton,
                Detector::Barrel,
                Sigmas::new(0.0, 5.5 * deg, 5.3 * deg),
            )
            .with(
                ParticleKind::Proton,
                Detector::Forward,
                Sigmas::new(0.0, 2.8 * deg, 4.45 * deg),
            )
    }
    /// Add or replace the uncertainties of `kind` in `detector`.
    pub fn with(mut self, kind: ParticleKind, detector: Detector, sigmas: Sigmas) -> Self {
        let entry = Entry {
            kind,
            detector,
            sigmas,
        };
        match self
            .entries
            .iter_mut()
            .find(|e| e.kind == kind && e.detector == detector)
        {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
        self
    }
    pub fn with_energy_scaling(mut self, scaling: EnergyScaling) -> Self {
        self.scaling = scaling;
        self
    }
}

#[typetag::serde]
impl UncertaintyModel for ConstantUncertainties {
    fn sigmas(&self, kind: ParticleKind, candidate: &Candidate) -> KinfitResult<Sigmas> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.kind == kind && e.detector == candidate.detector)
            .ok_or(KinfitError::UnmodeledUncertainty {
                kind,
                detector: candidate.detector,
            })?;
        let mut sigmas = entry.sigmas;
        // zero and negative entries encode unmeasured and fixed, which scaling must not change
        if sigmas.energy > 0.0 {
            let scaled = self.scaling.apply(sigmas.energy, candidate.energy);
            if !(scaled.is_finite() && scaled > 0.0) {
                return Err(KinfitError::UnmodeledUncertainty {
                    kind,
                    detector: candidate.detector,
                });
            }
            sigmas.energy = scaled;
        }
        Ok(sigmas)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn test_lookup() {
        let model = ConstantUncertainties::new()
            .with(ParticleKind::Photon, Detector::Barrel, Sigmas::new(5.0, 0.02, 0.03))
            .with(ParticleKind::Photon, Detector::Barrel, Sigmas::new(6.0, 0.02, 0.03));
        let c = Candidate::new(100.0, 1.0, 0.0, Detector::Barrel);
        assert_relative_eq!(model.sigmas(ParticleKind::Photon, &c).unwrap().energy, 6.0);
        assert!(matches!(
            model.sigmas(ParticleKind::Proton, &c),
            Err(KinfitError::UnmodeledUncertainty {
                kind: ParticleKind::Proton,
                detector: Detector::Barrel
            })
        ));
    }

    #[test]
    fn test_energy_scaling() {
        let c = Candidate::new(400.0, 1.0, 0.0, Detector::Forward);
        let defaults = ConstantUncertainties::calorimeter_defaults();
        let photon = defaults.sigmas(ParticleKind::Photon, &c).unwrap();
        assert_relative_eq!(photon.energy, 0.035 * 400.0);
        let proton = defaults.sigmas(ParticleKind::Proton, &c).unwrap();
        assert_eq!(proton.energy, 0.0);
        let power = ConstantUncertainties::new()
            .with_energy_scaling(EnergyScaling::Power { exponent: -0.5 })
            .with(ParticleKind::Photon, Detector::Forward, Sigmas::new(0.5, 0.01, 0.01));
        assert_relative_eq!(
            power.sigmas(ParticleKind::Photon, &c).unwrap().energy,
            0.5 * 20.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_scaling_without_energy() {
        let power = ConstantUncertainties::new()
            .with_energy_scaling(EnergyScaling::Power { exponent: -0.5 })
            .with(ParticleKind::Photon, Detector::Barrel, Sigmas::new(0.5, 0.01, 0.01))
            .with(ParticleKind::Proton, Detector::Barrel, Sigmas::new(0.0, 0.01, 0.01));
        let relative = power.clone().with_energy_scaling(EnergyScaling::Relative);
        let absolute = power.clone().with_energy_scaling(EnergyScaling::Absolute);
        for energy in [0.0, -20.0, f64::NAN] {
            let c = Candidate::new(energy, 1.0, 0.0, Detector::Barrel);
            for model in [&power, &relative] {
                assert!(matches!(
                    model.sigmas(ParticleKind::Photon, &c),
                    Err(KinfitError::UnmodeledUncertainty {
                        kind: ParticleKind::Photon,
                        detector: Detector::Barrel
                    })
                ));
                // an unmeasured energy does not depend on the reading
                assert_eq!(model.sigmas(ParticleKind::Proton, &c).unwrap().energy, 0.0);
            }
            assert_eq!(absolute.sigmas(ParticleKind::Photon, &c).unwrap().energy, 0.5);
        }
    }

    #[test]
    fn test_model_serde() {
        let model: Box<dyn UncertaintyModel> = Box::new(ConstantUncertainties::calorimeter_defaults());
        let json = serde_json::to_string(&model).unwrap();
        let back: Box<dyn UncertaintyModel> = serde_json::from_str(&json).unwrap();
        let c = Candidate::new(100.0, 1.0, 0.0, Detector::Barrel);
        assert_eq!(
            model.sigmas(ParticleKind::Photon, &c).unwrap(),
            back.sigmas(ParticleKind::Photon, &c).unwrap()
        );
    }
}
