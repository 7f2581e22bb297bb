//! Densities of stochastic variables and functions of deterministic ones.
//!
//! Both traits are implemented for plain closures, so models can be wired up
//! inline; the named densities below cover the priors the moves are usually
//! paired with.

use cyanea_stats::{Distribution, Exponential, Gamma, Poisson};

use super::value::Value;

/// Log density of a stochastic variable given its parents' values.
pub trait Density: Send + Sync {
    fn ln_density(&self, value: &Value, parents: &[&Value]) -> f64;
}

impl<F> Density for F
where
    F: Fn(&Value, &[&Value]) -> f64 + Send + Sync,
{
    fn ln_density(&self, value: &Value, parents: &[&Value]) -> f64 {
        self(value, parents)
    }
}

/// Update function of a deterministic variable.
pub trait Function: Send + Sync {
    fn evaluate(&self, parents: &[&Value]) -> Value;
}

impl<F> Function for F
where
    F: Fn(&[&Value]) -> Value + Send + Sync,
{
    fn evaluate(&self, parents: &[&Value]) -> Value {
        self(parents)
    }
}

/// A distribution parameter: a constant, or the real value of a parent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Param {
    Fixed(f64),
    /// Index into the variable's parent list.
    Parent(usize),
}

impl Param {
    fn resolve(&self, parents: &[&Value]) -> Option<f64> {
        match *self {
            Param::Fixed(x) => Some(x),
            Param::Parent(i) => parents.get(i).and_then(|v| v.as_real().ok()),
        }
    }
}

/// Sum `ln_pdf` over a real or a vector of reals.
fn iid_ln_density(value: &Value, ln_pdf: impl Fn(f64) -> f64) -> f64 {
    match value {
        Value::Real(x) => ln_pdf(*x),
        Value::Vector(v) => v.iter().map(|&x| ln_pdf(x)).sum(),
        _ => f64::NEG_INFINITY,
    }
}

/// Improper flat density: log density 0 for every value.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flat;

impl Density for Flat {
    fn ln_density(&self, _value: &Value, _parents: &[&Value]) -> f64 {
        0.0
    }
}

/// Exponential prior on a positive real (or each element of a vector).
#[derive(Debug, Clone, Copy)]
pub struct ExponentialPrior {
    pub rate: Param,
}

impl Density for ExponentialPrior {
    fn ln_density(&self, value: &Value, parents: &[&Value]) -> f64 {
        let Some(d) = self.rate.resolve(parents).and_then(|r| Exponential::new(r).ok()) else {
            return f64::NEG_INFINITY;
        };
        iid_ln_density(value, |x| d.ln_pdf(x))
    }
}

/// Gamma prior parameterised by shape and rate.
#[derive(Debug, Clone, Copy)]
pub struct GammaPrior {
    pub shape: Param,
    pub rate: Param,
}

impl Density for GammaPrior {
    fn ln_density(&self, value: &Value, parents: &[&Value]) -> f64 {
        let (Some(shape), Some(rate)) = (self.shape.resolve(parents), self.rate.resolve(parents))
        else {
            return f64::NEG_INFINITY;
        };
        match Gamma::new(shape, rate) {
            Ok(d) => iid_ln_density(value, |x| d.ln_pdf(x)),
            Err(_) => f64::NEG_INFINITY,
        }
    }
}

/// Uniform density on `[lower, upper]`.
#[derive(Debug, Clone, Copy)]
pub struct UniformPrior {
    pub lower: f64,
    pub upper: f64,
}

impl Density for UniformPrior {
    fn ln_density(&self, value: &Value, _parents: &[&Value]) -> f64 {
        let width = self.upper - self.lower;
        iid_ln_density(value, |x| {
            if (self.lower..=self.upper).contains(&x) {
                -width.ln()
            } else {
                f64::NEG_INFINITY
            }
        })
    }
}

/// Poisson prior on an integer count, e.g. the number of admixture events.
#[derive(Debug, Clone, Copy)]
pub struct PoissonPrior {
    pub rate: Param,
}

impl Density for PoissonPrior {
    fn ln_density(&self, value: &Value, parents: &[&Value]) -> f64 {
        let Ok(k) = value.as_integer() else {
            return f64::NEG_INFINITY;
        };
        match self.rate.resolve(parents).and_then(|r| Poisson::new(r).ok()) {
            Some(d) => d.ln_pdf(k as f64),
            None => f64::NEG_INFINITY,
        }
    }
}
