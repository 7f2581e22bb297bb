//! Probability distributions and numerical helpers.
//!
//! The [`Distribution`] trait with [`Beta`], [`Gamma`], [`Exponential`] and
//! [`Poisson`], plus the special functions ([`ln_gamma`], [`ln_beta`],
//! [`betai`], [`gammainc`]) the proposal kernels and priors are built from.

use core::f64::consts::PI;

use cyanea_core::{CyaneaError, Result};

// ── Numerical helpers ──────────────────────────────────────────────────────

/// Natural log of the gamma function via the Lanczos approximation (g=7).
pub fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 8] = [
        676.5203681218851,
        -1259.1392167224028,
        771.32342877765313,
        -176.61502916214059,
        12.507343278686905,
        -0.13857109526572012,
        9.9843695780195716e-6,
        1.5056327351493116e-7,
    ];

    if x < 0.5 {
        // Reflection formula: Γ(x) = π / (sin(πx) · Γ(1-x))
        let log_pi_over_sin = (PI / (PI * x).sin()).ln();
        log_pi_over_sin - ln_gamma(1.0 - x)
    } else {
        let x = x - 1.0;
        let mut ag = 0.99999999999980993_f64;
        for (i, &c) in COEFFS.iter().enumerate() {
            ag += c / (x + i as f64 + 1.0);
        }
        let t = x + 7.5; // g + 0.5
        0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + ag.ln()
    }
}

/// Regularized incomplete beta function I_x(a, b) via continued fraction
/// (Lentz's method, max 200 iterations).
///
/// Backs the Beta CDF and quantile used by the proposal kernels.
pub fn betai(a: f64, b: f64, x: f64) -> Result<f64> {
    if x < 0.0 || x > 1.0 {
        return Err(CyaneaError::InvalidInput(
            "betai: x must be in [0, 1]".into(),
        ));
    }
    if x == 0.0 || x == 1.0 {
        return Ok(x);
    }

    // Use symmetry relation for numerical stability.
    if x > (a + 1.0) / (a + b + 2.0) {
        return Ok(1.0 - betai(b, a, 1.0 - x)?);
    }

    let ln_prefactor = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b)
        + a * x.ln()
        + b * (1.0 - x).ln();
    let prefactor = ln_prefactor.exp();

    // Evaluate continued fraction with modified Lentz's method.
    let tiny = 1e-30_f64;
    let eps = 1e-10_f64;
    let max_iter = 200;

    let mut c = 1.0_f64;
    let mut d = (1.0 - (a + b) * x / (a + 1.0)).recip();
    if d.abs() < tiny {
        d = tiny;
    }
    let mut h = d;

    for m in 1..=max_iter {
        let m_f64 = m as f64;

        // Even step: d_{2m}
        let num_even = m_f64 * (b - m_f64) * x / ((a + 2.0 * m_f64 - 1.0) * (a + 2.0 * m_f64));
        d = 1.0 + num_even * d;
        if d.abs() < tiny {
            d = tiny;
        }
        d = d.recip();
        c = 1.0 + num_even / c;
        if c.abs() < tiny {
            c = tiny;
        }
        h *= d * c;

        // Odd step: d_{2m+1}
        let num_odd = -((a + m_f64) * (a + b + m_f64) * x)
            / ((a + 2.0 * m_f64) * (a + 2.0 * m_f64 + 1.0));
        d = 1.0 + num_odd * d;
        if d.abs() < tiny {
            d = tiny;
        }
        d = d.recip();
        c = 1.0 + num_odd / c;
        if c.abs() < tiny {
            c = tiny;
        }
        let delta = d * c;
        h *= delta;

        if (delta - 1.0).abs() < eps {
            return Ok(prefactor * h / a);
        }
    }

    Ok(prefactor * h / a)
}

/// Natural log of the beta function B(a, b).
pub fn ln_beta(a: f64, b: f64) -> f64 {
    ln_gamma(a) + ln_gamma(b) - ln_gamma(a + b)
}

// ── Regularized lower incomplete gamma function ──────────────────────────

/// Regularized lower incomplete gamma function P(a, x) = γ(a, x) / Γ(a).
///
/// Uses the series expansion when x < a + 1 and the continued fraction
/// representation (computing Q = 1 - P) otherwise.
pub fn gammainc(a: f64, x: f64) -> Result<f64> {
    if a <= 0.0 {
        return Err(CyaneaError::InvalidInput("gammainc: a must be positive".into()));
    }
    if x < 0.0 {
        return Err(CyaneaError::InvalidInput("gammainc: x must be non-negative".into()));
    }
    if x == 0.0 {
        return Ok(0.0);
    }

    if x < a + 1.0 {
        // Series expansion
        gammainc_series(a, x)
    } else {
        // Continued fraction for upper gamma, then P = 1 - Q
        let q = gammainc_cf(a, x)?;
        Ok(1.0 - q)
    }
}

/// Series expansion for P(a, x).
fn gammainc_series(a: f64, x: f64) -> Result<f64> {
    let max_iter = 200;
    let eps = 1e-12;
    let ln_prefix = a * x.ln() - x - ln_gamma(a);

    let mut sum = 1.0 / a;
    let mut term = 1.0 / a;

    for n in 1..=max_iter {
        term *= x / (a + n as f64);
        sum += term;
        if term.abs() < sum.abs() * eps {
            return Ok(sum * ln_prefix.exp());
        }
    }

    Ok(sum * ln_prefix.exp())
}

/// Continued fraction for Q(a, x) = 1 - P(a, x) via modified Lentz's method.
fn gammainc_cf(a: f64, x: f64) -> Result<f64> {
    let max_iter = 200;
    let eps = 1e-12;
    let tiny = 1e-30_f64;
    let ln_prefix = a * x.ln() - x - ln_gamma(a);

    let mut b = x + 1.0 - a;
    let mut c = 1.0 / tiny;
    let mut d = 1.0 / b;
    let mut h = d;

    for i in 1..=max_iter {
        let an = -(i as f64) * (i as f64 - a);
        b += 2.0;
        d = an * d + b;
        if d.abs() < tiny {
            d = tiny;
        }
        c = b + an / c;
        if c.abs() < tiny {
            c = tiny;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < eps {
            break;
        }
    }

    Ok(h * ln_prefix.exp())
}

// ── Distribution trait ─────────────────────────────────────────────────────

/// A probability distribution with basic statistical properties.
pub trait Distribution {
    /// Probability density (or mass) function at `x`.
    fn pdf(&self, x: f64) -> f64;

    /// Natural log of the density at `x`; `-inf` outside the support.
    fn ln_pdf(&self, x: f64) -> f64 {
        self.pdf(x).ln()
    }

    /// Cumulative distribution function at `x`.
    fn cdf(&self, x: f64) -> f64;

    /// Distribution mean.
    fn mean(&self) -> f64;

    /// Distribution variance.
    fn variance(&self) -> f64;

    /// Distribution standard deviation (default: sqrt of variance).
    fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

// ── Beta distribution ──────────────────────────────────────────────────────

/// Beta distribution on (0, 1) with shape parameters α and β.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Beta {
    alpha: f64,
    beta: f64,
}

impl Beta {
    /// Create a new Beta distribution. Both shapes must be positive and finite.
    pub fn new(alpha: f64, beta: f64) -> Result<Self> {
        if !(alpha > 0.0 && beta > 0.0 && alpha.is_finite() && beta.is_finite()) {
            return Err(CyaneaError::InvalidInput(format!(
                "Beta: shapes must be positive, got ({alpha}, {beta})"
            )));
        }
        Ok(Self { alpha, beta })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    /// Inverse CDF by bisection on [`betai`].
    ///
    /// `p` must lie in [0, 1]; the result is accurate to about 1e-12.
    pub fn quantile(&self, p: f64) -> Result<f64> {
        if !(0.0..=1.0).contains(&p) {
            return Err(CyaneaError::InvalidInput(
                "Beta::quantile: p must be in [0, 1]".into(),
            ));
        }
        if p == 0.0 || p == 1.0 {
            return Ok(p);
        }
        let (mut lo, mut hi) = (0.0_f64, 1.0_f64);
        for _ in 0..100 {
            let mid = 0.5 * (lo + hi);
            if betai(self.alpha, self.beta, mid)? < p {
                lo = mid;
            } else {
                hi = mid;
            }
            if hi - lo < 1e-12 {
                break;
            }
        }
        Ok(0.5 * (lo + hi))
    }
}

impl Distribution for Beta {
    fn pdf(&self, x: f64) -> f64 {
        self.ln_pdf(x).exp()
    }

    fn ln_pdf(&self, x: f64) -> f64 {
        if !(0.0..=1.0).contains(&x) {
            return f64::NEG_INFINITY;
        }
        // Boundary densities: finite only when the matching shape is exactly 1.
        let left = if x == 0.0 {
            if self.alpha == 1.0 {
                0.0
            } else if self.alpha < 1.0 {
                return f64::INFINITY;
            } else {
                return f64::NEG_INFINITY;
            }
        } else {
            (self.alpha - 1.0) * x.ln()
        };
        let right = if x == 1.0 {
            if self.beta == 1.0 {
                0.0
            } else if self.beta < 1.0 {
                return f64::INFINITY;
            } else {
                return f64::NEG_INFINITY;
            }
        } else {
            (self.beta - 1.0) * (1.0 - x).ln()
        };
        left + right - ln_beta(self.alpha, self.beta)
    }

    fn cdf(&self, x: f64) -> f64 {
        if x <= 0.0 {
            return 0.0;
        }
        if x >= 1.0 {
            return 1.0;
        }
        betai(self.alpha, self.beta, x).unwrap_or(f64::NAN)
    }

    fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    fn variance(&self) -> f64 {
        let s = self.alpha + self.beta;
        self.alpha * self.beta / (s * s * (s + 1.0))
    }
}

// ── Gamma distribution ─────────────────────────────────────────────────────

/// Gamma distribution with shape k and rate θ⁻¹ (mean `shape / rate`).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Gamma {
    shape: f64,
    rate: f64,
}

impl Gamma {
    /// Create a new Gamma distribution. Shape and rate must be positive.
    pub fn new(shape: f64, rate: f64) -> Result<Self> {
        if !(shape > 0.0 && rate > 0.0) {
            return Err(CyaneaError::InvalidInput(
                "Gamma: shape and rate must be positive".into(),
            ));
        }
        Ok(Self { shape, rate })
    }
}

impl Distribution for Gamma {
    fn pdf(&self, x: f64) -> f64 {
        self.ln_pdf(x).exp()
    }

    fn ln_pdf(&self, x: f64) -> f64 {
        if x < 0.0 || (x == 0.0 && self.shape > 1.0) {
            return f64::NEG_INFINITY;
        }
        if x == 0.0 {
            return if self.shape == 1.0 {
                self.rate.ln()
            } else {
                f64::INFINITY
            };
        }
        self.shape * self.rate.ln() + (self.shape - 1.0) * x.ln()
            - self.rate * x
            - ln_gamma(self.shape)
    }

    fn cdf(&self, x: f64) -> f64 {
        if x <= 0.0 {
            return 0.0;
        }
        gammainc(self.shape, self.rate * x).unwrap_or(f64::NAN)
    }

    fn mean(&self) -> f64 {
        self.shape / self.rate
    }

    fn variance(&self) -> f64 {
        self.shape / (self.rate * self.rate)
    }
}

// ── Exponential distribution ───────────────────────────────────────────────

/// Exponential distribution with rate λ.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Exponential {
    rate: f64,
}

impl Exponential {
    /// Create a new Exponential distribution. `rate` must be positive.
    pub fn new(rate: f64) -> Result<Self> {
        if !(rate > 0.0) {
            return Err(CyaneaError::InvalidInput(
                "Exponential: rate must be positive".into(),
            ));
        }
        Ok(Self { rate })
    }
}

impl Distribution for Exponential {
    fn pdf(&self, x: f64) -> f64 {
        if x < 0.0 {
            0.0
        } else {
            self.rate * (-self.rate * x).exp()
        }
    }

    fn ln_pdf(&self, x: f64) -> f64 {
        if x < 0.0 {
            f64::NEG_INFINITY
        } else {
            self.rate.ln() - self.rate * x
        }
    }

    fn cdf(&self, x: f64) -> f64 {
        if x <= 0.0 {
            0.0
        } else {
            1.0 - (-self.rate * x).exp()
        }
    }

    fn mean(&self) -> f64 {
        1.0 / self.rate
    }

    fn variance(&self) -> f64 {
        1.0 / (self.rate * self.rate)
    }
}

// ── Poisson distribution ───────────────────────────────────────────────────

/// Poisson distribution with rate parameter λ.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Poisson {
    lambda: f64,
}

impl Poisson {
    /// Create a new Poisson distribution. `lambda` must be positive.
    pub fn new(lambda: f64) -> Result<Self> {
        if lambda <= 0.0 {
            return Err(CyaneaError::InvalidInput(
                "Poisson: lambda must be positive".into(),
            ));
        }
        Ok(Self { lambda })
    }
}

impl Distribution for Poisson {
    fn pdf(&self, x: f64) -> f64 {
        self.ln_pdf(x).exp()
    }

    fn ln_pdf(&self, x: f64) -> f64 {
        let k = x.round();
        if k < 0.0 || (x - k).abs() > 1e-9 {
            return f64::NEG_INFINITY;
        }
        // Log-space to avoid overflow for large counts.
        k * self.lambda.ln() - self.lambda - ln_gamma(k + 1.0)
    }

    fn cdf(&self, x: f64) -> f64 {
        let k_max = x.floor() as i64;
        if k_max < 0 {
            return 0.0;
        }
        let sum: f64 = (0..=k_max).map(|k| self.pdf(k as f64)).sum();
        sum.min(1.0)
    }

    fn mean(&self) -> f64 {
        self.lambda
    }

    fn variance(&self) -> f64 {
        self.lambda
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn beta_density_is_finite_inside_support(
            a in 1.0f64..20.0,
            b in 1.0f64..20.0,
            x in 0.001f64..0.999,
        ) {
            let d = Beta::new(a, b).unwrap();
            prop_assert!(d.ln_pdf(x).is_finite());
            let c = d.cdf(x);
            prop_assert!((0.0..=1.0).contains(&c));
        }

        #[test]
        fn beta_quantile_is_monotone(
            a in 0.5f64..10.0,
            b in 0.5f64..10.0,
            p in 0.01f64..0.98,
        ) {
            let d = Beta::new(a, b).unwrap();
            let lo = d.quantile(p).unwrap();
            let hi = d.quantile(p + 0.01).unwrap();
            prop_assert!(lo <= hi);
        }
    }
}
