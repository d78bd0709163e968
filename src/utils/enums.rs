use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::KinfitError;

/// The detector system in which a candidate was reconstructed.
///
/// The detector determines which uncertainties apply to a candidate and the lever arm used to
/// translate a shifted vertex into a change of flight direction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Detector {
    /// The central calorimeter surrounding the target.
    Barrel,
    /// The forward wall downstream of the target.
    Forward,
    /// A candidate without a known detector of origin.
    Unknown,
}

impl Detector {
    /// Distance (cm) from the nominal target center to the detector surface, used as the lever
    /// arm between the measured hit position and the fitted vertex.
    pub fn lever_arm(&self) -> f64 {
        match self {
            Detector::Barrel => 25.4,
            Detector::Forward => 145.7,
            Detector::Unknown => 100.0,
        }
    }
}

impl Display for Detector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Detector::Barrel => write!(f, "Barrel"),
            Detector::Forward => write!(f, "Forward"),
            Detector::Unknown => write!(f, "Unknown"),
        }
    }
}

impl FromStr for Detector {
    type Err = KinfitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "barrel" | "cb" | "central" => Ok(Self::Barrel),
            "forward" | "taps" | "fw" => Ok(Self::Forward),
            "unknown" | "none" => Ok(Self::Unknown),
            _ => Err(KinfitError::ParseError {
                name: s.to_string(),
                object: "Detector".to_string(),
            }),
        }
    }
}

/// Final-state particle hypotheses which can sit on the leaves of a decay tree.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParticleKind {
    Photon,
    Proton,
    Neutron,
    PiPlus,
    PiMinus,
    KPlus,
    KMinus,
    Electron,
    Positron,
}

impl ParticleKind {
    /// The rest mass in MeV.
    pub fn mass(&self) -> f64 {
        match self {
            ParticleKind::Photon => 0.0,
            ParticleKind::Proton => 938.272,
            ParticleKind::Neutron => 939.565,
            ParticleKind::PiPlus | ParticleKind::PiMinus => 139.57039,
            ParticleKind::KPlus | ParticleKind::KMinus => 493.677,
            ParticleKind::Electron | ParticleKind::Positron => 0.51099895,
        }
    }
    /// Electric charge in units of the elementary charge.
    pub fn charge(&self) -> i32 {
        match self {
            ParticleKind::Photon | ParticleKind::Neutron => 0,
            ParticleKind::Proton | ParticleKind::PiPlus | ParticleKind::KPlus => 1,
            ParticleKind::Positron => 1,
            ParticleKind::PiMinus | ParticleKind::KMinus | ParticleKind::Electron => -1,
        }
    }
    pub fn is_charged(&self) -> bool {
        self.charge() != 0
    }
}

impl Display for ParticleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParticleKind::Photon => write!(f, "γ"),
            ParticleKind::Proton => write!(f, "p"),
            ParticleKind::Neutron => write!(f, "n"),
            ParticleKind::PiPlus => write!(f, "π+"),
            ParticleKind::PiMinus => write!(f, "π-"),
            ParticleKind::KPlus => write!(f, "K+"),
            ParticleKind::KMinus => write!(f, "K-"),
            ParticleKind::Electron => write!(f, "e-"),
            ParticleKind::Positron => write!(f, "e+"),
        }
    }
}

impl FromStr for ParticleKind {
    type Err = KinfitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "photon" | "gamma" | "g" | "γ" => Ok(Self::Photon),
            "proton" | "p" => Ok(Self::Proton),
            "neutron" | "n" => Ok(Self::Neutron),
            "pi+" | "piplus" | "π+" => Ok(Self::PiPlus),
            "pi-" | "piminus" | "π-" => Ok(Self::PiMinus),
            "k+" | "kplus" => Ok(Self::KPlus),
            "k-" | "kminus" => Ok(Self::KMinus),
            "electron" | "e-" => Ok(Self::Electron),
            "positron" | "e+" => Ok(Self::Positron),
            _ => Err(KinfitError::ParseError {
                name: s.to_string(),
                object: "ParticleKind".to_string(),
            }),
        }
    }
}

/// The physical quantity represented by a fit parameter.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quantity {
    /// Kinetic energy of a final-state particle.
    Energy,
    /// Polar angle of a final-state particle.
    Theta,
    /// Azimuthal angle of a final-state particle.
    Phi,
    /// Longitudinal position of the vertex a charged particle was produced at.
    VertexZ,
    /// Energy of the incoming beam.
    BeamEnergy,
}

impl Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Quantity::Energy => write!(f, "Ek"),
            Quantity::Theta => write!(f, "theta"),
            Quantity::Phi => write!(f, "phi"),
            Quantity::VertexZ => write!(f, "vz"),
            Quantity::BeamEnergy => write!(f, "Ebeam"),
        }
    }
}
