//! Proposal engine for Bayesian inference over admixture networks.
//!
//! - **Networks**: [`AdmixtureNetwork`], a binary time tree plus lateral
//!   admixture edges, with journaled surgery so any proposal can be undone
//!   exactly
//! - **Model graph**: [`ModelGraph`], a dependency graph of constant,
//!   stochastic and deterministic variables with touch/keep/restore
//! - **Moves**: reversible proposals on networks and parameters behind the
//!   [`Proposal`] trait, driven through the [`Move`] state machine
//! - **Sampler**: a Metropolis-Hastings [`Chain`] with weighted move
//!   schedules, tuning and convergence diagnostics

pub mod dag;
pub mod mcmc;
pub mod moves;
pub mod network;
pub mod random;

pub use dag::{ModelGraph, Value, VariableId};
pub use mcmc::{
    convergence_diagnostics, run_chains, Chain, ConvergenceDiag, McmcConfig, McmcResult,
    McmcSample,
};
pub use moves::{AdmixtureConfig, Failure, Move, MoveState, Outcome, PairSampling, Proposal};
pub use network::{AdmixtureNetwork, NodeId};
pub use random::{RandomSource, SeededRandom};
