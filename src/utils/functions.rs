use statrs::distribution::{ChiSquared, ContinuousCDF};

/// The breakup momentum of a particle with mass `m0` decaying into two particles with masses `m1`
/// and `m2`:
///
/// ```math
/// q(m_0, m_1, m_2) = \frac{\sqrt{|\lambda(m_0^2, m_1^2, m_2^2)|}}{2m_0}
/// ```
///
/// where $`\lambda`$ is the Källén function.
pub fn breakup_momentum(m0: f64, m1: f64, m2: f64) -> f64 {
    f64::sqrt(f64::abs(
        m0.powi(4) + m1.powi(4) + m2.powi(4)
            - 2.0 * (m0.powi(2) * m1.powi(2) + m0.powi(2) * m2.powi(2) + m1.powi(2) * m2.powi(2)),
    )) / (2.0 * m0)
}

/// The probability of finding a $`\chi^2`$ at least as large as `chi2` for `ndf` degrees of
/// freedom (the survival function of the $`\chi^2`$ distribution).
///
/// For `ndf == 0` the system is exactly constrained and there is no test statistic, so the
/// probability is defined as `1.0` for a vanishing `chi2` and `0.0` otherwise.
pub fn chi2_probability(chi2: f64, ndf: usize) -> f64 {
    if !chi2.is_finite() || chi2 < 0.0 {
        return 0.0;
    }
    if ndf == 0 {
        return if chi2 <= f64::EPSILON.sqrt() { 1.0 } else { 0.0 };
    }
    match ChiSquared::new(ndf as f64) {
        Ok(dist) => dist.sf(chi2),
        Err(_) => 0.0,
    }
}
