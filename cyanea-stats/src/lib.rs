//! Statistical building blocks for the cyanea workspace.
//!
//! - **Special functions**: log-gamma, log-beta, regularized incomplete
//!   beta and gamma functions
//! - **Distributions**: Beta, Gamma, Exponential and Poisson behind the
//!   [`Distribution`] trait, used as proposal kernels and priors

pub mod distribution;

pub use distribution::{
    betai, gammainc, ln_beta, ln_gamma, Beta, Distribution, Exponential, Gamma, Poisson,
};
