use std::{f64::consts::PI, sync::Arc};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use crate::{
    config::InitialState,
    particle::Candidate,
    topology::{NodeId, NodeKind, Topology},
    uncertainties::UncertaintyModel,
    utils::{
        enums::{Detector, ParticleKind},
        functions::breakup_momentum,
        vectors::{Vec3, Vec4},
    },
    KinfitError, KinfitResult,
};

/// Decay `parent` into two particles of masses `m1` and `m2`, the first of which flies along
/// the direction (`costheta`, `phi`) in the rest frame of `parent`.
pub fn two_body_decay(parent: &Vec4, m1: f64, m2: f64, costheta: f64, phi: f64) -> (Vec4, Vec4) {
    let q = breakup_momentum(parent.mag(), m1, m2);
    let p1 = Vec3::from_polar(q, costheta.clamp(-1.0, 1.0).acos(), phi);
    let beta = parent.beta();
    (
        p1.with_mass(m1).boost(&beta),
        (-p1).with_mass(m2).boost(&beta),
    )
}

/// The detector a particle flying at polar angle `theta` ends up in: the forward wall below
/// 20 degrees, the barrel above.
pub fn detector_for(theta: f64) -> Detector {
    if theta < 20.0_f64.to_radians() {
        Detector::Forward
    } else {
        Detector::Barrel
    }
}

/// Generates exact final states of a topology by a chain of isotropic two-body decays.
///
/// Every internal node must have exactly two daughters (the root may also have a single one,
/// which then carries the full initial state), and every intermediate node must carry a mass.
#[derive(Clone, Debug)]
pub struct EventGenerator {
    topology: Arc<Topology>,
    initial: InitialState,
}

impl EventGenerator {
    /// # Errors
    ///
    /// Fails with [`KinfitError::InvalidTopology`] for topologies which are not chains of
    /// two-body decays with known masses.
    pub fn new(topology: Arc<Topology>, initial: InitialState) -> KinfitResult<Self> {
        let root = topology.root();
        let formation = matches!(
            &topology.node(root).kind,
            NodeKind::Internal { children, .. } if children.len() == 1
        );
        for (id, node) in topology.iter() {
            if let NodeKind::Internal { mass, children } = &node.kind {
                if children.len() > 2 {
                    return Err(KinfitError::InvalidTopology {
                        reason: format!(
                            "cannot generate {}-body decay of \"{}\"",
                            children.len(),
                            node.name
                        ),
                    });
                }
                let takes_initial = id == root || (formation && node.parent == Some(root));
                if mass.is_none() && !takes_initial {
                    return Err(KinfitError::InvalidTopology {
                        reason: format!("cannot generate \"{}\" without a mass", node.name),
                    });
                }
            }
        }
        Ok(Self { topology, initial })
    }

    fn mass(&self, id: NodeId) -> f64 {
        match &self.topology.node(id).kind {
            NodeKind::Leaf { particle, .. } => particle.mass(),
            NodeKind::Internal { mass, .. } => mass.unwrap_or(0.0),
        }
    }

    fn decay(&self, id: NodeId, p4: Vec4, rng: &mut impl Rng, leaves: &mut [Vec4]) {
        match &self.topology.node(id).kind {
            NodeKind::Leaf { leaf, .. } => leaves[*leaf] = p4,
            NodeKind::Internal { children, .. } => match children[..] {
                [only] => self.decay(only, p4, rng, leaves),
                [first, second] => {
                    let m1 = self.mass(first);
                    let m2 = self.mass(second);
                    let costheta = rng.gen_range(-1.0..=1.0);
                    let phi = rng.gen_range(-PI..PI);
                    let (p1, p2) = two_body_decay(&p4, m1, m2, costheta, phi);
                    self.decay(first, p1, rng, leaves);
                    self.decay(second, p2, rng, leaves);
                }
                _ => {}
            },
        }
    }

    /// Four-vectors of all leaves, by leaf index, for one event at the given beam energy.
    pub fn generate(&self, beam_energy: f64, rng: &mut impl Rng) -> Vec<Vec4> {
        let mut leaves = vec![Vec4::default(); self.topology.n_leaves()];
        let initial = self.initial.four_vector(beam_energy);
        self.decay(self.topology.root(), initial, rng, &mut leaves);
        leaves
    }

    /// The unsmeared candidates of the leaves, seen from the nominal vertex.
    pub fn candidates(&self, leaves: &[Vec4]) -> Vec<Candidate> {
        leaves
            .iter()
            .zip(self.topology.leaf_kinds())
            .map(|(p4, kind)| Candidate::from_p4(p4, kind.mass(), detector_for(p4.vec3().theta())))
            .collect()
    }
}

/// Applies Gaussian detector resolution to exact candidates.
#[derive(Clone, Debug)]
pub struct Smearer {
    model: Box<dyn UncertaintyModel>,
    rng: ChaCha8Rng,
}

impl Smearer {
    pub fn new(model: Box<dyn UncertaintyModel>, seed: u64) -> Self {
        Self {
            model,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
    fn smear_value(&mut self, value: f64, sigma: f64) -> KinfitResult<f64> {
        if sigma > 0.0 {
            let normal = Normal::new(value, sigma)
                .map_err(|e| KinfitError::Custom(format!("invalid smearing width: {}", e)))?;
            Ok(normal.sample(&mut self.rng))
        } else {
            Ok(value)
        }
    }
    /// Smear every measured quantity of `truth` with the resolution the model assigns to it.
    pub fn smear(&mut self, kind: ParticleKind, truth: &Candidate) -> KinfitResult<Candidate> {
        let sigmas = self.model.sigmas(kind, truth)?;
        let mut smeared = Candidate::new(
            self.smear_value(truth.energy, sigmas.energy)?,
            self.smear_value(truth.theta, sigmas.theta)?,
            self.smear_value(truth.phi, sigmas.phi)?,
            truth.detector,
        );
        if kind.is_charged() {
            if let Some(sigma_z) = sigmas.vertex_z {
                let z = truth.vertex_z.unwrap_or(0.0);
                smeared = smeared.with_vertex(self.smear_value(z, sigma_z)?);
            }
        }
        Ok(smeared)
    }
    /// Smear a full final state, `kinds[i]` being the hypothesis of `truth[i]`.
    pub fn smear_all(
        &mut self,
        kinds: &[ParticleKind],
        truth: &[Candidate],
    ) -> KinfitResult<Vec<Candidate>> {
        kinds
            .iter()
            .zip(truth)
            .map(|(kind, candidate)| self.smear(*kind, candidate))
            .collect()
    }
}
