use std::fmt::Display;

use auto_ops::{impl_op_ex, impl_op_ex_commutative};
use serde::{Deserialize, Serialize};

/// A three-vector of `f64` components, typically a three-momentum or a position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    /// The $`x`$-component.
    pub x: f64,
    /// The $`y`$-component.
    pub y: f64,
    /// The $`z`$-component.
    pub z: f64,
}

impl Vec3 {
    /// Create a new [`Vec3`] from its Cartesian components.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
    /// Create a [`Vec3`] from a magnitude and the polar and azimuthal angles (radians).
    pub fn from_polar(r: f64, theta: f64, phi: f64) -> Self {
        let (sin_theta, cos_theta) = theta.sin_cos();
        let (sin_phi, cos_phi) = phi.sin_cos();
        Self::new(
            r * sin_theta * cos_phi,
            r * sin_theta * sin_phi,
            r * cos_theta,
        )
    }
    /// Interpret the [`Vec3`] as a three-momentum and build the [`Vec4`] of a particle with the
    /// given rest mass.
    pub fn with_mass(&self, mass: f64) -> Vec4 {
        let e = f64::sqrt(mass.powi(2) + self.mag2());
        Vec4::new(self.x, self.y, self.z, e)
    }
    /// Interpret the [`Vec3`] as a three-momentum and attach the given energy.
    pub fn with_energy(&self, energy: f64) -> Vec4 {
        Vec4::new(self.x, self.y, self.z, energy)
    }
    pub fn dot(&self, other: &Self) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }
    pub fn cross(&self, other: &Self) -> Self {
        Self::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }
    pub fn mag2(&self) -> f64 {
        self.dot(self)
    }
    pub fn mag(&self) -> f64 {
        self.mag2().sqrt()
    }
    pub fn costheta(&self) -> f64 {
        self.z / self.mag()
    }
    pub fn theta(&self) -> f64 {
        self.costheta().acos()
    }
    pub fn phi(&self) -> f64 {
        self.y.atan2(self.x)
    }
    /// The unit vector in the direction of the [`Vec3`].
    pub fn unit(&self) -> Self {
        let mag = self.mag();
        Self::new(self.x / mag, self.y / mag, self.z / mag)
    }
}

impl_op_ex!(+ |a: &Vec3, b: &Vec3| -> Vec3 { Vec3::new(a.x + b.x, a.y + b.y, a.z + b.z) });
impl_op_ex!(-|a: &Vec3, b: &Vec3| -> Vec3 { Vec3::new(a.x - b.x, a.y - b.y, a.z - b.z) });
impl_op_ex!(-|a: &Vec3| -> Vec3 { Vec3::new(-a.x, -a.y, -a.z) });
impl_op_ex_commutative!(*|a: &Vec3, b: &f64| -> Vec3 { Vec3::new(a.x * b, a.y * b, a.z * b) });
impl_op_ex!(/ |a: &Vec3, b: &f64| -> Vec3 { Vec3::new(a.x / b, a.y / b, a.z / b) });

/// A four-vector of `f64` components, stored as $`(p_x, p_y, p_z, E)`$.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec4 {
    /// The $`x`$-component of the momentum.
    pub x: f64,
    /// The $`y`$-component of the momentum.
    pub y: f64,
    /// The $`z`$-component of the momentum.
    pub z: f64,
    /// The energy.
    pub t: f64,
}

impl Vec4 {
    /// Create a new [`Vec4`] from its momentum components and energy.
    pub const fn new(px: f64, py: f64, pz: f64, e: f64) -> Self {
        Self {
            x: px,
            y: py,
            z: pz,
            t: e,
        }
    }
    pub fn px(&self) -> f64 {
        self.x
    }
    pub fn py(&self) -> f64 {
        self.y
    }
    pub fn pz(&self) -> f64 {
        self.z
    }
    pub fn e(&self) -> f64 {
        self.t
    }
    pub fn vec3(&self) -> Vec3 {
        Vec3::new(self.x, self.y, self.z)
    }
    /// The velocity $`\vec{\beta} = \vec{p}/E`$.
    pub fn beta(&self) -> Vec3 {
        self.vec3() / self.e()
    }
    pub fn gamma(&self) -> f64 {
        self.e() / self.mag()
    }
    /// The Minkowski norm squared, $`E^2 - |\vec{p}|^2`$ (the invariant mass squared).
    pub fn mag2(&self) -> f64 {
        self.e() * self.e() - self.vec3().mag2()
    }
    /// The invariant mass, $`\sqrt{E^2 - |\vec{p}|^2}`$.
    pub fn mag(&self) -> f64 {
        self.mag2().sqrt()
    }
    /// The invariant mass continued to space-like vectors as $`-\sqrt{|\vec{p}|^2 - E^2}`$.
    ///
    /// Unlike [`Vec4::mag`], this never returns `NaN` for finite input, which keeps mass
    /// constraints differentiable when an iteration passes through unphysical kinematics.
    pub fn signed_mag(&self) -> f64 {
        let m2 = self.mag2();
        if m2 < 0.0 {
            -(-m2).sqrt()
        } else {
            m2.sqrt()
        }
    }
    /// Boost the [`Vec4`] by the velocity `beta`.
    pub fn boost(&self, beta: &Vec3) -> Self {
        let b2 = beta.dot(beta);
        if b2 == 0.0 {
            return *self;
        }
        let gamma = 1.0 / (1.0 - b2).sqrt();
        let p3 = self.vec3() + beta * ((gamma - 1.0) * self.vec3().dot(beta) / b2 + gamma * self.e());
        p3.with_energy(gamma * (self.e() + beta.dot(&self.vec3())))
    }
    /// A compact string form, `[e, px, py, pz]`.
    pub fn to_p4_string(&self) -> String {
        format!("[e = {:.5}; p = ({:.5}, {:.5}, {:.5})]", self.t, self.x, self.y, self.z)
    }
    /// The components in the order $`(E, p_x, p_y, p_z)`$.
    pub fn to_array(&self) -> [f64; 4] {
        [self.t, self.x, self.y, self.z]
    }
}

impl Display for Vec4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_p4_string())
    }
}

impl_op_ex!(+ |a: &Vec4, b: &Vec4| -> Vec4 { Vec4::new(a.x + b.x, a.y + b.y, a.z + b.z, a.t + b.t) });
impl_op_ex!(-|a: &Vec4, b: &Vec4| -> Vec4 { Vec4::new(a.x - b.x, a.y - b.y, a.z - b.z, a.t - b.t) });
impl_op_ex!(-|a: &Vec4| -> Vec4 { Vec4::new(-a.x, -a.y, -a.z, -a.t) });
impl_op_ex!(+= |a: &mut Vec4, b: &Vec4| { *a = *a + b; });
impl_op_ex!(-= |a: &mut Vec4, b: &Vec4| { *a = *a - b; });

impl std::iter::Sum for Vec4 {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Vec4::default(), |acc, p4| acc + p4)
    }
}

impl<'a> std::iter::Sum<&'a Vec4> for Vec4 {
    fn sum<I: Iterator<Item = &'a Vec4>>(iter: I) -> Self {
        iter.fold(Vec4::default(), |acc, p4| acc + p4)
    }
}
