use std::sync::Arc;

use indexmap::IndexMap;

use crate::{
    topology::{Decay, Topology, TopologyDefinition},
    utils::enums::ParticleKind,
    KinfitError, KinfitResult,
};

/// Nominal $`\pi^0`$ mass (MeV).
pub const PI0_MASS: f64 = 134.9766;
/// Nominal $`\eta`$ mass (MeV).
pub const ETA_MASS: f64 = 547.862;
/// Nominal $`\omega`$ mass (MeV).
pub const OMEGA_MASS: f64 = 782.65;
/// Nominal $`\eta'`$ mass (MeV).
pub const ETA_PRIME_MASS: f64 = 957.78;

fn photon(name: &str) -> Decay {
    Decay::leaf(name, ParticleKind::Photon)
}

fn proton() -> Decay {
    Decay::leaf("p", ParticleKind::Proton)
}

fn pi0(name: &str, g1: &str, g2: &str) -> Decay {
    Decay::resonance(name, PI0_MASS, vec![photon(g1), photon(g2)])
}

/// $`\gamma p \to \pi^0 p`$, $`\pi^0 \to \gamma\gamma`$.
pub fn single_pi0() -> TopologyDefinition {
    TopologyDefinition::new("pi0p", vec![pi0("pi0", "g1", "g2"), proton()])
        .with_sibling_symmetries()
}

/// $`\gamma p \to \pi^0 \pi^0 p`$ with both $`\pi^0 \to \gamma\gamma`$.
pub fn two_pi0() -> TopologyDefinition {
    TopologyDefinition::new(
        "2pi0p",
        vec![pi0("pi0a", "g1", "g2"), pi0("pi0b", "g3", "g4"), proton()],
    )
    .with_sibling_symmetries()
    .with_subtree_symmetries()
}

/// $`\gamma p \to \eta p`$, $`\eta \to \gamma\gamma`$.
pub fn eta_2g() -> TopologyDefinition {
    TopologyDefinition::new(
        "etap",
        vec![
            Decay::resonance("eta", ETA_MASS, vec![photon("g1"), photon("g2")]),
            proton(),
        ],
    )
    .with_sibling_symmetries()
}

/// $`\gamma p \to \omega p`$, $`\omega \to \pi^0\gamma`$.
pub fn omega_pi0_gamma() -> TopologyDefinition {
    TopologyDefinition::new(
        "omegap",
        vec![
            Decay::resonance("omega", OMEGA_MASS, vec![pi0("pi0", "g1", "g2"), photon("g3")]),
            proton(),
        ],
    )
    .with_sibling_symmetries()
}

/// $`\gamma p \to \eta' p`$, $`\eta' \to \omega\gamma`$, $`\omega \to \pi^0\gamma`$.
pub fn eta_prime_omega_gamma() -> TopologyDefinition {
    TopologyDefinition::new(
        "etaprimep",
        vec![
            Decay::resonance(
                "etaprime",
                ETA_PRIME_MASS,
                vec![
                    Decay::resonance(
                        "omega",
                        OMEGA_MASS,
                        vec![pi0("pi0", "g1", "g2"), photon("g3")],
                    ),
                    photon("g4"),
                ],
            ),
            proton(),
        ],
    )
    .with_sibling_symmetries()
}

/// $`\gamma p \to \eta' p`$, $`\eta' \to \pi^0\pi^0\pi^0`$, all $`\pi^0 \to \gamma\gamma`$.
pub fn eta_prime_3pi0() -> TopologyDefinition {
    TopologyDefinition::new(
        "etaprime3pi0p",
        vec![
            Decay::resonance(
                "etaprime",
                ETA_PRIME_MASS,
                vec![
                    pi0("pi0a", "g1", "g2"),
                    pi0("pi0b", "g3", "g4"),
                    pi0("pi0c", "g5", "g6"),
                ],
            ),
            proton(),
        ],
    )
    .with_sibling_symmetries()
    .with_subtree_symmetries()
}

/// `n` photons and a proton constrained only by four-momentum conservation.
pub fn photons_only(n: usize) -> TopologyDefinition {
    let mut final_state: Vec<Decay> = (1..=n).map(|i| photon(&format!("g{}", i))).collect();
    final_state.push(proton());
    TopologyDefinition::new(&format!("{}gp", n), final_state).with_sibling_symmetries()
}

/// Compiled topologies by name.
///
/// The registry is an ordinary value: build one, register the hypotheses of an analysis and hand
/// the topologies to the searches that need them.
#[derive(Clone, Debug, Default)]
pub struct TopologyRegistry {
    topologies: IndexMap<String, Arc<Topology>>,
}

impl TopologyRegistry {
    pub fn new() -> Self {
        Self::default()
    }
    /// A registry with every channel of this module.
    pub fn standard() -> KinfitResult<Self> {
        let mut registry = Self::new();
        for definition in [
            single_pi0(),
            two_pi0(),
            eta_2g(),
            omega_pi0_gamma(),
            eta_prime_omega_gamma(),
            eta_prime_3pi0(),
        ] {
            registry.register(&definition)?;
        }
        Ok(registry)
    }
    /// Compile `definition` and store it under its name, replacing any topology of the same name.
    pub fn register(&mut self, definition: &TopologyDefinition) -> KinfitResult<Arc<Topology>> {
        let topology = Arc::new(definition.build()?);
        self.topologies
            .insert(definition.name.clone(), topology.clone());
        Ok(topology)
    }
    pub fn get(&self, name: &str) -> KinfitResult<Arc<Topology>> {
        self.topologies
            .get(name)
            .cloned()
            .ok_or_else(|| KinfitError::Custom(format!("No topology named \"{}\"!", name)))
    }
    /// Names of the registered topologies in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.topologies.keys().map(|k| k.as_str()).collect()
    }
    pub fn len(&self) -> usize {
        self.topologies.len()
    }
    pub fn is_empty(&self) -> bool {
        self.topologies.is_empty()
    }
}
