use serde::{Deserialize, Serialize};

use crate::{
    config::FitSettings,
    measurement::{Measurement, Transform},
    uncertainties::Sigmas,
    utils::{
        enums::{Detector, ParticleKind, Quantity},
        vectors::{Vec3, Vec4},
    },
    KinfitResult,
};

/// A reconstructed final-state candidate as delivered by the reconstruction.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Kinetic energy (MeV).
    pub energy: f64,
    /// Polar angle (rad).
    pub theta: f64,
    /// Azimuthal angle (rad).
    pub phi: f64,
    /// The detector the candidate was seen in.
    pub detector: Detector,
    /// Longitudinal vertex position (cm) for charged tracks, if known.
    pub vertex_z: Option<f64>,
}

impl Candidate {
    pub fn new(energy: f64, theta: f64, phi: f64, detector: Detector) -> Self {
        Self {
            energy,
            theta,
            phi,
            detector,
            vertex_z: None,
        }
    }
    pub fn with_vertex(mut self, vertex_z: f64) -> Self {
        self.vertex_z = Some(vertex_z);
        self
    }
    /// The candidate seen from the nominal vertex for a particle with four-momentum `p4` and rest
    /// mass `mass`.
    pub fn from_p4(p4: &Vec4, mass: f64, detector: Detector) -> Self {
        let p3 = p4.vec3();
        Self::new(p4.e() - mass, p3.theta(), p3.phi(), detector)
    }
    /// The four-momentum of this candidate under the mass hypothesis `mass`, ignoring the vertex.
    pub fn p4(&self, mass: f64) -> Vec4 {
        let e = self.energy + mass;
        let p = (self.energy * (self.energy + 2.0 * mass)).max(0.0).sqrt();
        Vec3::from_polar(p, self.theta, self.phi).with_energy(e)
    }
}

const ENERGY: usize = 0;
const THETA: usize = 1;
const PHI: usize = 2;
const VERTEX_Z: usize = 3;

/// A final-state particle attached to a leaf: its fit parameters and the four-vector they imply.
///
/// Neutral particles carry three parameters (kinetic energy, $`\theta`$, $`\phi`$). Charged
/// particles whose uncertainty model supplies a vertex uncertainty carry a fourth, the vertex
/// position $`z`$. The angles then describe the detector hit at the detector's lever arm $`L`$,
/// so the flight direction is
///
/// ```math
/// \hat{n} \propto L\,\hat{r}(\theta, \phi) - z\,\hat{e}_z.
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitParticle {
    kind: ParticleKind,
    detector: Detector,
    measurements: Vec<Measurement>,
    p4: Vec4,
}

impl FitParticle {
    /// Bind a candidate to a particle hypothesis with the given uncertainties.
    ///
    /// Each uncertainty follows [`Measurement::from_sigma`]: positive is measured, zero is
    /// unmeasured and negative is fixed.
    ///
    /// # Errors
    ///
    /// Returns [`KinfitError::InvalidMeasurement`](crate::KinfitError::InvalidMeasurement) for
    /// non-finite candidate values or `NaN` uncertainties.
    pub fn bind(
        kind: ParticleKind,
        candidate: &Candidate,
        sigmas: &Sigmas,
        settings: &FitSettings,
    ) -> KinfitResult<Self> {
        let energy_transform = settings.energy.transform();
        // A free energy has no meaningful reconstructed value (e.g. a proton stopped in the
        // target), so start it somewhere representable until the tree seeds it.
        let energy = if sigmas.energy == 0.0 && !(candidate.energy > 0.0) {
            1.0
        } else {
            candidate.energy
        };
        let mut measurements = vec![
            Measurement::from_sigma(Quantity::Energy, energy, sigmas.energy, energy_transform)?,
            Measurement::from_sigma(
                Quantity::Theta,
                candidate.theta,
                sigmas.theta,
                Transform::Identity,
            )?,
            Measurement::from_sigma(Quantity::Phi, candidate.phi, sigmas.phi, Transform::Identity)?,
        ];
        if kind.is_charged() {
            if let Some(sigma_z) = sigmas.vertex_z {
                measurements.push(Measurement::from_sigma(
                    Quantity::VertexZ,
                    candidate.vertex_z.unwrap_or(0.0),
                    sigma_z,
                    Transform::Identity,
                )?);
            }
        }
        let mut particle = Self {
            kind,
            detector: candidate.detector,
            measurements,
            p4: Vec4::default(),
        };
        particle.update();
        Ok(particle)
    }

    pub fn kind(&self) -> ParticleKind {
        self.kind
    }
    pub fn detector(&self) -> Detector {
        self.detector
    }
    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }
    pub(crate) fn measurements_mut(&mut self) -> &mut [Measurement] {
        &mut self.measurements
    }
    /// The parameter for the given quantity, if this particle has one.
    pub fn measurement(&self, quantity: Quantity) -> Option<&Measurement> {
        self.measurements.iter().find(|m| m.quantity() == quantity)
    }
    pub fn has_vertex(&self) -> bool {
        self.measurements.len() > VERTEX_Z
    }
    /// The cached four-vector of the current fitted values.
    pub fn current_vector(&self) -> Vec4 {
        self.p4
    }
    /// Normalized residual of parameter `i`, `None` unless it is measured.
    pub fn residual(&self, i: usize) -> Option<f64> {
        self.measurements.get(i).and_then(|m| m.residual())
    }
    /// Recompute the cached four-vector after the fitted values changed.
    pub(crate) fn update(&mut self) {
        let raw: Vec<f64> = self.measurements.iter().map(|m| m.fitted()).collect();
        self.p4 = self.vector_from(&raw);
    }
    /// The four-vector implied by the raw parameter values `raw`, given in the order of
    /// [`FitParticle::measurements`].
    pub(crate) fn vector_from(&self, raw: &[f64]) -> Vec4 {
        let ek = self.measurements[ENERGY].transform().to_physical(raw[ENERGY]);
        let (theta, phi) = (raw[THETA], raw[PHI]);
        let direction = if self.has_vertex() {
            let hit = Vec3::from_polar(self.detector.lever_arm(), theta, phi);
            (hit - Vec3::new(0.0, 0.0, raw[VERTEX_Z])).unit()
        } else {
            Vec3::from_polar(1.0, theta, phi)
        };
        let mass = self.kind.mass();
        // NaN below threshold on purpose: the solver treats it as a numerical failure
        let p = (ek * (ek + 2.0 * mass)).sqrt();
        (direction * p).with_energy(ek + mass)
    }
    /// The fitted kinematics as a candidate, with the fitted vertex if there is one.
    pub fn fitted_candidate(&self) -> Candidate {
        let candidate = Candidate::new(
            self.measurements[ENERGY].physical(),
            self.measurements[THETA].physical(),
            self.measurements[PHI].physical(),
            self.detector,
        );
        match self.measurements.get(VERTEX_Z) {
            Some(vertex) => candidate.with_vertex(vertex.physical()),
            None => candidate,
        }
    }
}
