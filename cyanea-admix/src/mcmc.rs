//! Metropolis-Hastings driver for the proposal engine.
//!
//! A [`Chain`] owns a model graph and a weighted schedule of [`Move`]s. Each
//! generation picks a move with probability proportional to its weight,
//! performs it, sums the log density ratios over every variable downstream
//! of what the move touched, and accepts or rejects. Move tuning happens
//! during burn-in only, so the sampled part of the chain is a fixed kernel.
//! Moves with an activation generation join the schedule once the chain
//! reaches it; until then they are neither picked nor counted in the total
//! weight.

use std::collections::{BTreeSet, HashMap};

use cyanea_core::{Annotated, CyaneaError, Result};
use tracing::{info, trace};

use crate::dag::{ModelGraph, VariableId};
use crate::moves::Move;
use crate::network::AdmixtureNetwork;
use crate::random::{RandomSource, SeededRandom};

/// MCMC sampler configuration.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct McmcConfig {
    pub n_generations: usize,
    pub sample_every: usize,
    pub burnin: usize,
    /// Tune every move after this many burn-in generations; 0 disables.
    pub tune_every: usize,
    pub seed: u64,
    /// Run [`AdmixtureNetwork::verify`] every this many generations.
    pub verify_every: Option<usize>,
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            n_generations: 10000,
            sample_every: 100,
            burnin: 1000,
            tune_every: 100,
            seed: 42,
            verify_every: None,
        }
    }
}

/// A single MCMC sample.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct McmcSample {
    pub generation: usize,
    pub ln_posterior: f64,
    pub admixture_events: usize,
    pub tree_height: f64,
}

/// Per-move counters at the end of a run.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MoveSummary {
    pub name: String,
    pub weight: f64,
    pub active_from: usize,
    pub tried: u64,
    pub accepted: u64,
    pub failed: u64,
    pub tuning: Option<f64>,
}

/// Results from an MCMC run.
#[derive(Debug, Clone)]
pub struct McmcResult {
    pub samples: Vec<McmcSample>,
    pub acceptance_rates: HashMap<String, f64>,
    pub moves: Vec<MoveSummary>,
}

/// Convergence diagnostics for MCMC samples.
#[derive(Debug, Clone)]
pub struct ConvergenceDiag {
    pub ess: HashMap<String, f64>,
    pub mean_ln_posterior: f64,
    pub variance_ln_posterior: f64,
}

/// One Markov chain: a model graph, its network variable and a move
/// schedule.
#[derive(Debug)]
pub struct Chain {
    graph: ModelGraph,
    network: VariableId,
    moves: Vec<Move>,
    /// Steps taken over the chain's lifetime, across runs.
    generation: usize,
}

impl Chain {
    /// Fails if the schedule is empty, a weight is negative or not finite,
    /// no move with positive weight is active from the first generation,
    /// or `network` does not hold a network.
    pub fn new(graph: ModelGraph, network: VariableId, moves: Vec<Move>) -> Result<Self> {
        if moves.is_empty() {
            return Err(CyaneaError::InvalidInput("move schedule is empty".into()));
        }
        if let Some(bad) = moves.iter().find(|m| !(m.weight() >= 0.0 && m.weight().is_finite())) {
            return Err(CyaneaError::InvalidInput(format!(
                "move '{}' has invalid weight {}",
                bad.name(),
                bad.weight()
            )));
        }
        if !(active_weight(&moves, 0) > 0.0) {
            return Err(CyaneaError::InvalidInput(
                "no move with positive weight is active at generation 0".into(),
            ));
        }
        if network >= graph.len() {
            return Err(CyaneaError::InvalidInput(format!("variable {network} does not exist")));
        }
        graph.network(network)?;
        Ok(Self {
            graph,
            network,
            moves,
            generation: 0,
        })
    }

    pub fn graph(&self) -> &ModelGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut ModelGraph {
        &mut self.graph
    }

    pub fn network(&self) -> Result<&AdmixtureNetwork> {
        self.graph.network(self.network)
    }

    pub fn moves(&self) -> &[Move] {
        &self.moves
    }

    /// Generations stepped so far.
    pub fn generation(&self) -> usize {
        self.generation
    }

    /// Weighted pick among the moves active at the current generation.
    fn pick(&self, rng: &mut dyn RandomSource) -> usize {
        let generation = self.generation;
        let target = rng.uniform01() * active_weight(&self.moves, generation);
        let mut acc = 0.0;
        let mut last = 0;
        for (i, m) in self.moves.iter().enumerate() {
            if !m.is_active(generation) || m.weight() <= 0.0 {
                continue;
            }
            acc += m.weight();
            last = i;
            if target < acc {
                return i;
            }
        }
        last
    }

    /// One Metropolis-Hastings step. Returns whether the proposal was
    /// accepted.
    pub fn step(&mut self, rng: &mut dyn RandomSource) -> Result<bool> {
        let k = self.pick(rng);
        self.generation += 1;
        let mv = &mut self.moves[k];
        mv.prepare(&mut self.graph, rng);
        let ln_hastings = mv.perform(&mut self.graph, rng)?;
        if ln_hastings == f64::NEG_INFINITY {
            mv.reject(&mut self.graph);
            trace!(proposal = mv.name(), "rejected without evaluation");
            return Ok(false);
        }

        let mut affected = BTreeSet::new();
        for &v in mv.touched() {
            affected.insert(v);
            self.graph.affected_nodes(v, &mut affected);
        }
        let ln_ratio: f64 = affected
            .into_iter()
            .map(|v| self.graph.ln_probability_ratio(v))
            .sum();
        let ln_alpha = ln_ratio + ln_hastings;

        let accept = !ln_alpha.is_nan() && (ln_alpha >= 0.0 || rng.uniform01().ln() < ln_alpha);
        if accept {
            mv.accept(&mut self.graph);
        } else {
            mv.reject(&mut self.graph);
        }
        trace!(proposal = mv.name(), ln_alpha, accept, "step");
        Ok(accept)
    }

    fn sample(&mut self, generation: usize) -> Result<McmcSample> {
        let ln_posterior = self.graph.total_ln_probability();
        let net = self.graph.network(self.network)?;
        Ok(McmcSample {
            generation,
            ln_posterior,
            admixture_events: net.admixture_event_count(),
            tree_height: net.height(),
        })
    }

    /// Run the chain for `config.n_generations`, seeding a fresh generator
    /// from `config.seed`.
    pub fn run(&mut self, config: &McmcConfig) -> Result<McmcResult> {
        let mut rng = SeededRandom::new(config.seed);
        self.run_with(config, &mut rng)
    }

    /// Run the chain drawing from `rng`.
    pub fn run_with(&mut self, config: &McmcConfig, rng: &mut dyn RandomSource) -> Result<McmcResult> {
        if config.sample_every == 0 {
            return Err(CyaneaError::InvalidInput("sample_every must be positive".into()));
        }
        info!(
            generations = config.n_generations,
            burnin = config.burnin,
            moves = self.moves.len(),
            "starting chain"
        );

        let mut samples = Vec::new();
        for gen in 0..config.n_generations {
            self.step(rng)?;

            if gen < config.burnin && config.tune_every > 0 && (gen + 1) % config.tune_every == 0 {
                for mv in &mut self.moves {
                    mv.tune();
                }
            }
            if let Some(every) = config.verify_every {
                if every > 0 && (gen + 1) % every == 0 {
                    self.network()?.verify()?;
                }
            }
            if gen >= config.burnin && (gen - config.burnin) % config.sample_every == 0 {
                samples.push(self.sample(gen)?);
            }
        }

        let moves: Vec<MoveSummary> = self
            .moves
            .iter()
            .map(|m| MoveSummary {
                name: m.name().to_string(),
                weight: m.weight(),
                active_from: m.activation(),
                tried: m.tried(),
                accepted: m.accepted(),
                failed: m.failed(),
                tuning: m.tuning(),
            })
            .collect();
        let acceptance_rates = self
            .moves
            .iter()
            .map(|m| (m.name().to_string(), m.acceptance_rate()))
            .collect();
        info!(
            samples = samples.len(),
            events = self.network()?.admixture_event_count(),
            "chain finished"
        );

        Ok(McmcResult {
            samples,
            acceptance_rates,
            moves,
        })
    }
}

fn active_weight(moves: &[Move], generation: usize) -> f64 {
    moves
        .iter()
        .filter(|m| m.is_active(generation))
        .map(Move::weight)
        .sum()
}

/// Run independent chains, chain `i` seeded with `config.seed + i`.
///
/// With the `parallel` feature the chains run on the rayon thread pool.
pub fn run_chains(chains: Vec<Chain>, config: &McmcConfig) -> Result<Vec<McmcResult>> {
    let run = |(i, mut chain): (usize, Chain)| {
        let config = McmcConfig {
            seed: config.seed.wrapping_add(i as u64),
            ..config.clone()
        };
        chain.run(&config)
    };

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        chains.into_par_iter().enumerate().map(run).collect()
    }

    #[cfg(not(feature = "parallel"))]
    {
        chains.into_iter().enumerate().map(run).collect()
    }
}

/// Compute convergence diagnostics from MCMC samples.
pub fn convergence_diagnostics(samples: &[McmcSample]) -> ConvergenceDiag {
    let n = samples.len();
    let lps: Vec<f64> = samples.iter().map(|s| s.ln_posterior).collect();

    let mean = if n > 0 {
        lps.iter().sum::<f64>() / n as f64
    } else {
        0.0
    };
    let variance = if n > 1 {
        lps.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64
    } else {
        0.0
    };

    let events: Vec<f64> = samples.iter().map(|s| s.admixture_events as f64).collect();
    let heights: Vec<f64> = samples.iter().map(|s| s.tree_height).collect();
    let mut ess = HashMap::new();
    ess.insert("ln_posterior".to_string(), effective_sample_size(&lps));
    ess.insert("admixture_events".to_string(), effective_sample_size(&events));
    ess.insert("tree_height".to_string(), effective_sample_size(&heights));

    ConvergenceDiag {
        ess,
        mean_ln_posterior: mean,
        variance_ln_posterior: variance,
    }
}

/// Effective sample size via autocorrelation, truncated at the first
/// negative lag.
fn effective_sample_size(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return n as f64;
    }

    let mean = values.iter().sum::<f64>() / n as f64;
    let var: f64 = values.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / n as f64;
    if var < 1e-30 {
        return n as f64;
    }

    let mut sum_rho = 0.0;
    for lag in 1..n {
        let mut rho = 0.0;
        for i in 0..(n - lag) {
            rho += (values[i] - mean) * (values[i + lag] - mean);
        }
        rho /= n as f64 * var;

        if rho < 0.0 {
            break;
        }
        sum_rho += rho;
    }

    let ess = n as f64 / (1.0 + 2.0 * sum_rho);
    ess.max(1.0)
}
