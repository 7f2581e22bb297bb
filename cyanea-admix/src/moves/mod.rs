//! Proposals and the transactional move protocol.
//!
//! A [`Proposal`] knows how to draw one candidate state and its log Hastings
//! ratio. A [`Move`] wraps a proposal with the state machine the sampler
//! drives:
//!
//! ```text
//! Idle --perform--> Proposed --accept/reject--> Idle
//!          \------> Failed   --accept/reject--> Idle   (no-ops)
//! ```
//!
//! `perform` opens an edit on the network, so `reject` can replay the exact
//! inverse of every surgery step and restore every touched variable. A
//! proposal that hits a structurally invalid candidate reports a
//! [`Failure`]; the move then rolls back immediately, returns `-inf` and the
//! following accept/reject call does nothing.

mod common;
pub mod divergence_merge;
pub mod edge_add;
pub mod edge_fnpr;
pub mod edge_remove;
pub mod edge_replace;
pub mod edge_reweight;
pub mod edge_slide;
pub mod node_age;
pub mod scale;
pub mod topology;

use cyanea_core::{Annotated, Result};
use tracing::debug;

use crate::dag::{ModelGraph, VariableId};
use crate::random::RandomSource;

pub use divergence_merge::DivergenceMerge;
pub use edge_add::EdgeAdd;
pub use edge_fnpr::EdgeFnpr;
pub use edge_remove::EdgeRemove;
pub use edge_replace::EdgeReplaceFnpr;
pub use edge_reweight::EdgeReweight;
pub use edge_slide::EdgeSlide;
pub use node_age::NodeAgeRateShift;
pub use scale::ScaleMove;
pub use topology::{Fnpr, Nni, Spr};

/// Acceptance rate targeted when tuning moves that change one value.
pub const SCALAR_TARGET: f64 = 0.44;
/// Acceptance rate targeted when tuning moves that change several values.
pub const MULTIVARIATE_TARGET: f64 = 0.234;

/// Why a proposal produced no candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, thiserror::Error)]
pub enum Failure {
    #[error("no admixture edge to operate on")]
    NoAdmixtureEdge,
    #[error("admixture event cap reached")]
    EventCap,
    #[error("residual matrix has no positive mass")]
    ZeroResidualMass,
    #[error("age window is empty")]
    EmptyAgeWindow,
    #[error("edge would cross the outgroup boundary")]
    OutgroupMismatch,
    #[error("edge would join sister lineages")]
    SisterLineages,
    #[error("no valid reattachment point")]
    NoReattachmentPoint,
    #[error("candidate lies next to the root")]
    NearRoot,
    #[error("no eligible node")]
    NoEligibleNode,
    #[error("draw fell outside its support")]
    DegenerateDraw,
    #[error("network rejected the splice")]
    InvalidSplice,
    #[error("too many admixture edges to redraw")]
    TooManyEdges,
}

/// Result of [`Proposal::propose`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    /// A candidate state was written; carries the log Hastings ratio.
    Proposed(f64),
    Failed(Failure),
}

/// One proposal kernel.
///
/// `propose` mutates the model in place: network surgery through the
/// network's journaled primitives, other variables through
/// [`ModelGraph::set_value`]. It may return `Failed` at any point; the
/// wrapping [`Move`] undoes whatever was already changed.
pub trait Proposal: Send {
    fn name(&self) -> &str;

    /// Network variable edited by this proposal, if any.
    fn network(&self) -> Option<VariableId>;

    /// Every other variable the proposal may assign to.
    fn variables(&self) -> Vec<VariableId>;

    /// Draw auxiliary randomness ahead of `propose`.
    fn prepare(&mut self, _graph: &mut ModelGraph, _rng: &mut dyn RandomSource) {}

    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RandomSource) -> Result<Outcome>;

    /// Adapt the tuning parameter to the acceptance rate since the last call.
    fn tune(&mut self, _acceptance_rate: f64) {}

    /// Current tuning parameter, if the proposal has one.
    fn tuning(&self) -> Option<f64> {
        None
    }
}

/// Protocol state of a [`Move`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveState {
    Idle,
    Proposed,
    Failed,
}

/// A proposal with its protocol state, schedule weight and counters.
pub struct Move {
    proposal: Box<dyn Proposal>,
    weight: f64,
    /// First generation at which the sampler may pick this move.
    active_from: usize,
    state: MoveState,
    touched: Vec<VariableId>,
    tried: u64,
    accepted: u64,
    failed: u64,
    tried_since_tune: u64,
    accepted_since_tune: u64,
}

impl Move {
    pub fn new(proposal: impl Proposal + 'static, weight: f64) -> Self {
        Self {
            proposal: Box::new(proposal),
            weight,
            active_from: 0,
            state: MoveState::Idle,
            touched: Vec::new(),
            tried: 0,
            accepted: 0,
            failed: 0,
            tried_since_tune: 0,
            accepted_since_tune: 0,
        }
    }

    /// Keep the move out of the schedule before `generation`, letting the
    /// tree settle before admixture edges start to change.
    pub fn active_from(mut self, generation: usize) -> Self {
        self.active_from = generation;
        self
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn activation(&self) -> usize {
        self.active_from
    }

    pub fn is_active(&self, generation: usize) -> bool {
        generation >= self.active_from
    }

    pub fn state(&self) -> MoveState {
        self.state
    }

    pub fn tried(&self) -> u64 {
        self.tried
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn acceptance_rate(&self) -> f64 {
        if self.tried == 0 {
            0.0
        } else {
            self.accepted as f64 / self.tried as f64
        }
    }

    pub fn tuning(&self) -> Option<f64> {
        self.proposal.tuning()
    }

    /// Variables touched by the pending proposal.
    pub fn touched(&self) -> &[VariableId] {
        &self.touched
    }

    pub fn prepare(&mut self, graph: &mut ModelGraph, rng: &mut dyn RandomSource) {
        self.proposal.prepare(graph, rng);
    }

    /// Propose a new state and return its log Hastings ratio, or `-inf` if
    /// the proposal failed (the model is then left untouched).
    ///
    /// # Panics
    ///
    /// Panics if the previous proposal was neither accepted nor rejected.
    pub fn perform(&mut self, graph: &mut ModelGraph, rng: &mut dyn RandomSource) -> Result<f64> {
        if self.state != MoveState::Idle {
            panic!(
                "move '{}' performed twice without accept or reject in between",
                self.proposal.name()
            );
        }
        self.tried += 1;
        self.tried_since_tune += 1;
        if let Some(id) = self.proposal.network() {
            graph.network_mut(id)?.begin_edit();
        }

        let outcome = match self.proposal.propose(graph, rng) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.abandon(graph);
                return Err(e);
            }
        };
        match outcome {
            Outcome::Failed(reason) => {
                self.abandon(graph);
                self.failed += 1;
                self.state = MoveState::Failed;
                debug!(proposal = self.proposal.name(), %reason, "proposal failed");
                Ok(f64::NEG_INFINITY)
            }
            Outcome::Proposed(ln_hastings) => {
                if let Some(id) = self.proposal.network() {
                    graph.touch(id);
                }
                self.touched = self
                    .mutable_variables()
                    .into_iter()
                    .filter(|&v| graph.is_touched(v))
                    .collect();
                self.state = MoveState::Proposed;
                if ln_hastings.is_nan() || ln_hastings == f64::INFINITY {
                    Ok(f64::NEG_INFINITY)
                } else {
                    Ok(ln_hastings)
                }
            }
        }
    }

    /// Commit the proposed state.
    ///
    /// # Panics
    ///
    /// Panics if called without a preceding `perform`.
    pub fn accept(&mut self, graph: &mut ModelGraph) {
        match self.state {
            MoveState::Idle => panic!("move '{}' accepted without perform", self.proposal.name()),
            MoveState::Failed => {}
            MoveState::Proposed => {
                if let Some(id) = self.proposal.network() {
                    if let Ok(network) = graph.network_mut(id) {
                        network.commit_edit();
                    }
                }
                for &v in &self.touched {
                    graph.keep(v);
                }
                self.accepted += 1;
                self.accepted_since_tune += 1;
            }
        }
        self.touched.clear();
        self.state = MoveState::Idle;
    }

    /// Undo the proposed state.
    ///
    /// # Panics
    ///
    /// Panics if called without a preceding `perform`.
    pub fn reject(&mut self, graph: &mut ModelGraph) {
        match self.state {
            MoveState::Idle => panic!("move '{}' rejected without perform", self.proposal.name()),
            MoveState::Failed => {}
            MoveState::Proposed => self.abandon(graph),
        }
        self.touched.clear();
        self.state = MoveState::Idle;
    }

    /// Tune from the acceptance rate since the previous call.
    pub fn tune(&mut self) {
        if self.tried_since_tune == 0 {
            return;
        }
        let rate = self.accepted_since_tune as f64 / self.tried_since_tune as f64;
        self.proposal.tune(rate);
        debug!(
            proposal = self.proposal.name(),
            rate,
            tuning = ?self.proposal.tuning(),
            "tuned"
        );
        self.tried_since_tune = 0;
        self.accepted_since_tune = 0;
    }

    fn mutable_variables(&self) -> Vec<VariableId> {
        let mut vars = self.proposal.variables();
        vars.extend(self.proposal.network());
        vars
    }

    /// Roll the network back and restore every touched variable.
    fn abandon(&mut self, graph: &mut ModelGraph) {
        if let Some(id) = self.proposal.network() {
            if let Ok(network) = graph.network_mut(id) {
                network.rollback_edit();
            }
        }
        for v in self.mutable_variables() {
            if graph.is_touched(v) {
                graph.restore(v);
            }
        }
    }
}

impl Annotated for Move {
    fn name(&self) -> &str {
        self.proposal.name()
    }
}

impl std::fmt::Debug for Move {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Move")
            .field("proposal", &self.proposal.name())
            .field("weight", &self.weight)
            .field("active_from", &self.active_from)
            .field("state", &self.state)
            .field("tried", &self.tried)
            .field("accepted", &self.accepted)
            .finish()
    }
}

/// How Edge-Add picks the donor/recipient taxon pair.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PairSampling {
    /// Every ordered pair of distinct tips equally likely.
    Uniform,
    /// Pairs weighted by `exp(delta * r / max r)` over positive residuals.
    Residual { delta: f64 },
}

/// Settings shared by the admixture-edge proposals.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdmixtureConfig {
    /// Upper bound on the number of admixture edges.
    pub max_events: usize,
    /// Allow edges between lineages that share their immediate parent.
    pub allow_sister_admixture: bool,
    pub pair_sampling: PairSampling,
    /// Second shape of the Beta(1, s) draw placing new edges in their age
    /// window; larger values favour younger edges.
    pub age_skew: f64,
    /// Shapes of the Beta draw for a new edge's weight, scaled by `max_weight`.
    pub weight_shape: (f64, f64),
    pub max_weight: f64,
}

impl Default for AdmixtureConfig {
    fn default() -> Self {
        Self {
            max_events: 10,
            allow_sister_admixture: false,
            pair_sampling: PairSampling::Residual { delta: 1.0 },
            age_skew: 2.0,
            weight_shape: (1.0, 3.0),
            max_weight: 0.5,
        }
    }
}

/// Multiplicative factor for a scale-type tuning parameter: grow it when
/// the acceptance rate is above `target`, shrink it otherwise.
pub fn tuning_factor(acceptance_rate: f64, target: f64) -> f64 {
    if acceptance_rate > target {
        1.0 + (acceptance_rate - target) / (1.0 - target)
    } else {
        1.0 / (2.0 - acceptance_rate / target)
    }
}

#[cfg(test)]
pub(crate) mod fixtures;
