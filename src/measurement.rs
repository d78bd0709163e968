use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::{utils::enums::Quantity, KinfitError, KinfitResult};

/// A map between the raw fit parameter and the physical value it represents.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transform {
    /// The fit parameter is the physical value.
    #[default]
    Identity,
    /// The fit parameter is the reciprocal of the physical value.
    Reciprocal,
}

impl Transform {
    /// Map a raw fit parameter to its physical value.
    pub fn to_physical(&self, raw: f64) -> f64 {
        match self {
            Transform::Identity => raw,
            Transform::Reciprocal => 1.0 / raw,
        }
    }
    /// Map a physical value to its raw fit parameter.
    pub fn to_raw(&self, physical: f64) -> f64 {
        match self {
            Transform::Identity => physical,
            Transform::Reciprocal => 1.0 / physical,
        }
    }
    /// Propagate an uncertainty on the physical value `physical` to the raw fit parameter.
    pub fn sigma_to_raw(&self, physical: f64, sigma: f64) -> f64 {
        match self {
            Transform::Identity => sigma,
            Transform::Reciprocal => sigma / (physical * physical),
        }
    }
}

/// The role of a parameter in the fit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasurementKind {
    /// Adjusted by the fit and contributes to the $`\chi^2`$.
    Measured,
    /// Adjusted by the fit without contributing to the $`\chi^2`$; costs one degree of freedom.
    Unmeasured,
    /// Held at its measured value.
    Fixed,
}

impl Display for MeasurementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeasurementKind::Measured => write!(f, "measured"),
            MeasurementKind::Unmeasured => write!(f, "unmeasured"),
            MeasurementKind::Fixed => write!(f, "fixed"),
        }
    }
}

/// One scalar fit parameter.
///
/// The measured value, the current fitted value and the uncertainty are all stored in the raw
/// parameterization given by the [`Transform`]. Only the solver changes the fitted value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    quantity: Quantity,
    kind: MeasurementKind,
    transform: Transform,
    measured: f64,
    fitted: f64,
    sigma: f64,
}

impl Measurement {
    fn validate_value(quantity: Quantity, value: f64, transform: Transform) -> KinfitResult<f64> {
        if !value.is_finite() {
            return Err(KinfitError::InvalidMeasurement {
                quantity,
                reason: format!("value {} is not finite", value),
            });
        }
        let raw = transform.to_raw(value);
        if !raw.is_finite() {
            return Err(KinfitError::InvalidMeasurement {
                quantity,
                reason: format!("value {} has no finite parameter under {:?}", value, transform),
            });
        }
        Ok(raw)
    }

    /// A measured quantity with physical value `value` and physical uncertainty `sigma`.
    ///
    /// # Errors
    ///
    /// Returns [`KinfitError::InvalidMeasurement`] unless `sigma` is finite and strictly
    /// positive and `value` maps to a finite parameter.
    pub fn measured(
        quantity: Quantity,
        value: f64,
        sigma: f64,
        transform: Transform,
    ) -> KinfitResult<Self> {
        if !(sigma.is_finite() && sigma > 0.0) {
            return Err(KinfitError::InvalidMeasurement {
                quantity,
                reason: format!("uncertainty must be finite and positive (got {})", sigma),
            });
        }
        let raw = Self::validate_value(quantity, value, transform)?;
        let raw_sigma = transform.sigma_to_raw(value, sigma).abs();
        if !(raw_sigma.is_finite() && raw_sigma > 0.0) {
            return Err(KinfitError::InvalidMeasurement {
                quantity,
                reason: format!("uncertainty {} vanishes under {:?}", sigma, transform),
            });
        }
        Ok(Self {
            quantity,
            kind: MeasurementKind::Measured,
            transform,
            measured: raw,
            fitted: raw,
            sigma: raw_sigma,
        })
    }

    /// A free quantity starting from the physical value `value`.
    pub fn unmeasured(quantity: Quantity, value: f64, transform: Transform) -> KinfitResult<Self> {
        let raw = Self::validate_value(quantity, value, transform)?;
        Ok(Self {
            quantity,
            kind: MeasurementKind::Unmeasured,
            transform,
            measured: raw,
            fitted: raw,
            sigma: 0.0,
        })
    }

    /// A quantity held fixed at the physical value `value`.
    pub fn fixed(quantity: Quantity, value: f64, transform: Transform) -> KinfitResult<Self> {
        let raw = Self::validate_value(quantity, value, transform)?;
        Ok(Self {
            quantity,
            kind: MeasurementKind::Fixed,
            transform,
            measured: raw,
            fitted: raw,
            sigma: 0.0,
        })
    }

    /// Build a parameter from an uncertainty as supplied by an uncertainty model: a positive
    /// `sigma` is measured, zero is unmeasured and a negative `sigma` is fixed.
    ///
    /// # Errors
    ///
    /// Returns [`KinfitError::InvalidMeasurement`] for a `NaN` uncertainty and for values which
    /// cannot be represented.
    pub fn from_sigma(
        quantity: Quantity,
        value: f64,
        sigma: f64,
        transform: Transform,
    ) -> KinfitResult<Self> {
        if sigma.is_nan() {
            Err(KinfitError::InvalidMeasurement {
                quantity,
                reason: "uncertainty is NaN".to_string(),
            })
        } else if sigma > 0.0 {
            Self::measured(quantity, value, sigma, transform)
        } else if sigma == 0.0 {
            Self::unmeasured(quantity, value, transform)
        } else {
            Self::fixed(quantity, value, transform)
        }
    }

    pub fn quantity(&self) -> Quantity {
        self.quantity
    }
    pub fn kind(&self) -> MeasurementKind {
        self.kind
    }
    pub fn transform(&self) -> Transform {
        self.transform
    }
    /// Whether the solver may change this parameter.
    pub fn is_free(&self) -> bool {
        self.kind != MeasurementKind::Fixed
    }
    pub fn is_measured(&self) -> bool {
        self.kind == MeasurementKind::Measured
    }
    pub fn is_unmeasured(&self) -> bool {
        self.kind == MeasurementKind::Unmeasured
    }
    /// The measured raw parameter.
    pub fn measured_value(&self) -> f64 {
        self.measured
    }
    /// The current raw parameter.
    pub fn fitted(&self) -> f64 {
        self.fitted
    }
    /// The raw uncertainty (zero unless measured).
    pub fn sigma(&self) -> f64 {
        self.sigma
    }
    /// The current physical value.
    pub fn physical(&self) -> f64 {
        self.transform.to_physical(self.fitted)
    }
    /// The measured physical value.
    pub fn measured_physical(&self) -> f64 {
        self.transform.to_physical(self.measured)
    }
    /// Normalized residual $`(x - m)/\sigma`$ of a measured parameter, `None` otherwise.
    pub fn residual(&self) -> Option<f64> {
        self.residual_at(self.fitted)
    }
    /// Normalized residual of a measured parameter evaluated at the raw value `raw`.
    pub fn residual_at(&self, raw: f64) -> Option<f64> {
        self.is_measured().then(|| (raw - self.measured) / self.sigma)
    }
    /// Set the current raw parameter. Fixed parameters ignore this.
    pub fn set_fitted(&mut self, raw: f64) {
        if self.is_free() {
            self.fitted = raw;
        }
    }
    /// Move the starting point of an unmeasured parameter to the physical value `physical`.
    pub(crate) fn seed(&mut self, physical: f64) {
        let raw = self.transform.to_raw(physical);
        if self.is_unmeasured() && raw.is_finite() {
            self.measured = raw;
            self.fitted = raw;
        }
    }
    /// Return the fitted value to the measured one.
    pub fn reset(&mut self) {
        self.fitted = self.measured;
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn test_measured_validation() {
        assert!(Measurement::measured(Quantity::Energy, 100.0, 2.0, Transform::Identity).is_ok());
        for sigma in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                Measurement::measured(Quantity::Energy, 100.0, sigma, Transform::Identity),
                Err(KinfitError::InvalidMeasurement { .. })
            ));
        }
        assert!(
            Measurement::measured(Quantity::Theta, f64::NAN, 0.1, Transform::Identity).is_err()
        );
        assert!(
            Measurement::measured(Quantity::Energy, 0.0, 1.0, Transform::Reciprocal).is_err()
        );
    }

    #[test]
    fn test_from_sigma() {
        let m = Measurement::from_sigma(Quantity::Phi, 0.5, 0.01, Transform::Identity).unwrap();
        assert_eq!(m.kind(), MeasurementKind::Measured);
        let u = Measurement::from_sigma(Quantity::Energy, 50.0, 0.0, Transform::Identity).unwrap();
        assert_eq!(u.kind(), MeasurementKind::Unmeasured);
        assert!(u.is_free());
        let f = Measurement::from_sigma(Quantity::Energy, 50.0, -1.0, Transform::Identity).unwrap();
        assert_eq!(f.kind(), MeasurementKind::Fixed);
        assert!(!f.is_free());
        assert!(Measurement::from_sigma(Quantity::Energy, 50.0, f64::NAN, Transform::Identity)
            .is_err());
    }

    #[test]
    fn test_reciprocal_transform() {
        let m = Measurement::measured(Quantity::Energy, 200.0, 10.0, Transform::Reciprocal)
            .unwrap();
        assert_relative_eq!(m.measured_value(), 0.005);
        assert_relative_eq!(m.sigma(), 10.0 / 40000.0);
        assert_relative_eq!(m.physical(), 200.0);
    }

    #[test]
    fn test_residual() {
        let mut m =
            Measurement::measured(Quantity::Theta, 1.0, 0.1, Transform::Identity).unwrap();
        assert_relative_eq!(m.residual().unwrap(), 0.0);
        m.set_fitted(1.2);
        assert_relative_eq!(m.residual().unwrap(), 2.0, epsilon = 1e-12);
        m.reset();
        assert_relative_eq!(m.fitted(), 1.0);
        let mut fixed = Measurement::fixed(Quantity::BeamEnergy, 700.0, Transform::Identity)
            .unwrap();
        fixed.set_fitted(710.0);
        assert_relative_eq!(fixed.fitted(), 700.0);
        assert!(fixed.residual().is_none());
    }
}
