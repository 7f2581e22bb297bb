//! Small models shared by the proposal and sampler tests.

use std::collections::VecDeque;

use cyanea_stats::ln_gamma;

use super::*;
use crate::dag::{ExponentialPrior, Param, Replacement, SquareMatrix, Value};
use crate::network::AdmixtureNetwork;
use crate::random::{RandomSource, SeededRandom};

pub(crate) const FOUR_TAXA: &str = "((A:1,B:1):1,(C:1,D:1):1);";
pub(crate) const SIX_TAXA: &str = "(((A:1,B:1):1,C:2):1,((D:1.5,E:1.5):1,F:2.5):0.5);";

/// Network with a Poisson(1) prior on its event count, residuals that
/// shrink as edges join two clades, a pseudo-likelihood on the positive
/// residuals and one exponential-prior rate per tree branch.
pub(crate) struct Model {
    pub graph: ModelGraph,
    pub network: VariableId,
    pub offset: VariableId,
    pub residuals: VariableId,
    pub events: VariableId,
    pub fit: VariableId,
    pub rates: Vec<VariableId>,
    pub config: AdmixtureConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Snapshot {
    values: Vec<Value>,
    ln_densities: Vec<f64>,
}

fn residual_matrix(net: &AdmixtureNetwork, offset: f64) -> SquareMatrix {
    let tips = net.tips();
    let mut m = SquareMatrix::from_fn(tips.len(), |i, j| {
        if i == j {
            0.0
        } else {
            1.0 / (1.0 + net.age(net.mrca(tips[i], tips[j]))) + offset
        }
    });
    for p in net.admixture_parents() {
        let c = net.admixture_child_of(p).unwrap();
        let w = net.weight(p);
        for a in net.descendant_tips(c) {
            for b in net.descendant_tips(p) {
                let (i, j) = (net.tip_index(a).unwrap(), net.tip_index(b).unwrap());
                if i != j {
                    m.set(i, j, m.get(i, j) - w);
                    m.set(j, i, m.get(j, i) - w);
                }
            }
        }
    }
    m
}

impl Model {
    pub fn four_taxa(edges: &[(&str, &str, f64, f64)]) -> Self {
        Self::from_newick(FOUR_TAXA, edges)
    }

    pub fn six_taxa(edges: &[(&str, &str, f64, f64)]) -> Self {
        Self::from_newick(SIX_TAXA, edges)
    }

    /// Build from a Newick tree plus `(donor, recipient, age, weight)` edges.
    pub fn from_newick(text: &str, edges: &[(&str, &str, f64, f64)]) -> Self {
        let mut net = AdmixtureNetwork::from_newick(text).unwrap();
        let branches = net.node_count();
        for &(donor, recipient, age, weight) in edges {
            let (d, r) = (net.tip_by_name(donor).unwrap(), net.tip_by_name(recipient).unwrap());
            net.insert_admixture_edge(d, r, age, weight).unwrap();
        }

        let mut graph = ModelGraph::new();
        let network = graph
            .add_stochastic(
                "network",
                Value::from(net),
                |v: &Value, _: &[&Value]| {
                    let k = v.as_network().unwrap().admixture_event_count() as f64;
                    -1.0 - ln_gamma(k + 1.0)
                },
                &[],
            )
            .unwrap();
        let offset = graph.add_constant("offset", Value::Real(-0.3));
        let residuals = graph
            .add_deterministic(
                "residuals",
                |ps: &[&Value]| {
                    let net = ps[0].as_network().unwrap();
                    Value::from(residual_matrix(net, ps[1].as_real().unwrap()))
                },
                &[network, offset],
            )
            .unwrap();
        let events = graph
            .add_deterministic(
                "events",
                |ps: &[&Value]| {
                    Value::Integer(ps[0].as_network().unwrap().admixture_event_count() as i64)
                },
                &[network],
            )
            .unwrap();
        let fit = graph
            .add_stochastic(
                "fit",
                Value::Real(0.0),
                |_: &Value, ps: &[&Value]| {
                    let m = ps[0].as_matrix().unwrap();
                    let mut ss = 0.0;
                    for i in 0..m.dim() {
                        for j in 0..m.dim() {
                            if i != j && m.get(i, j) > 0.0 {
                                ss += m.get(i, j).powi(2);
                            }
                        }
                    }
                    -10.0 * ss
                },
                &[residuals],
            )
            .unwrap();
        let rates = (0..branches)
            .map(|b| {
                graph
                    .add_stochastic(
                        format!("rate.{b}"),
                        Value::Real(1.0),
                        ExponentialPrior {
                            rate: Param::Fixed(1.0),
                        },
                        &[],
                    )
                    .unwrap()
            })
            .collect();

        Self {
            graph,
            network,
            offset,
            residuals,
            events,
            fit,
            rates,
            config: AdmixtureConfig {
                max_events: 3,
                ..Default::default()
            },
        }
    }

    pub fn network(&self) -> &AdmixtureNetwork {
        self.graph.network(self.network).unwrap()
    }

    pub fn event_count(&self) -> usize {
        self.network().admixture_event_count()
    }

    /// Move every residual by `offset` (relative to the join term).
    pub fn shift_residuals(&mut self, offset: f64) {
        self.graph
            .replace(self.offset, Replacement::Constant(Value::Real(offset)))
            .unwrap();
    }

    pub fn snapshot(&mut self) -> Snapshot {
        let n = self.graph.len();
        Snapshot {
            values: (0..n).map(|v| self.graph.value(v).clone()).collect(),
            ln_densities: (0..n).map(|v| self.graph.ln_probability(v)).collect(),
        }
    }

    pub fn nothing_touched(&self) -> bool {
        (0..self.graph.len()).all(|v| !self.graph.is_touched(v))
    }

    pub fn edge_add(&self) -> EdgeAdd {
        EdgeAdd::new(self.network, self.config.clone()).with_residuals(self.residuals)
    }

    pub fn edge_remove(&self) -> EdgeRemove {
        EdgeRemove::new(self.network, self.config.clone()).with_residuals(self.residuals)
    }

    pub fn edge_slide(&self) -> EdgeSlide {
        EdgeSlide::new(self.network, self.config.clone())
    }

    pub fn edge_reweight(&self) -> EdgeReweight {
        EdgeReweight::new(self.network)
    }

    pub fn edge_fnpr(&self) -> EdgeFnpr {
        EdgeFnpr::new(self.network, self.config.clone()).with_rates(self.rates.clone())
    }

    pub fn edge_replace(&self) -> EdgeReplaceFnpr {
        EdgeReplaceFnpr::new(self.network, self.config.clone()).with_residuals(self.residuals)
    }

    pub fn divergence_merge(&self) -> DivergenceMerge {
        DivergenceMerge::new(self.network).with_rates(self.rates.clone())
    }

    pub fn node_age(&self) -> NodeAgeRateShift {
        NodeAgeRateShift::new(self.network).with_rates(self.rates.clone())
    }

    pub fn nni(&self) -> Nni {
        Nni::new(self.network)
    }

    pub fn fnpr(&self) -> Fnpr {
        Fnpr::new(self.network)
    }

    pub fn spr(&self) -> Spr {
        Spr::new(self.network)
    }
}

/// Replays fixed draws so a proposal's choices can be steered exactly.
/// Beta draws ignore their shapes.
#[derive(Debug, Default)]
pub(crate) struct ScriptedRandom {
    uniforms: VecDeque<f64>,
    betas: VecDeque<f64>,
}

impl ScriptedRandom {
    pub fn new(uniforms: &[f64], betas: &[f64]) -> Self {
        Self {
            uniforms: uniforms.iter().copied().collect(),
            betas: betas.iter().copied().collect(),
        }
    }

    pub fn is_spent(&self) -> bool {
        self.uniforms.is_empty() && self.betas.is_empty()
    }
}

impl RandomSource for ScriptedRandom {
    fn uniform01(&mut self) -> f64 {
        self.uniforms.pop_front().expect("script ran out of uniform draws")
    }

    fn beta_sample(&mut self, _a: f64, _b: f64) -> f64 {
        self.betas.pop_front().expect("script ran out of beta draws")
    }
}

/// Uniform draw that makes `uniform_index(n)` return `k`.
pub(crate) fn index_draw(k: usize, n: usize) -> f64 {
    (k as f64 + 0.5) / n as f64
}

/// Perform then reject `rounds` times, checking that the model comes back
/// unchanged every time. Returns how many proposals did not fail.
pub(crate) fn assert_reject_restores(
    model: &mut Model,
    proposal: impl Proposal + 'static,
    seed: u64,
    rounds: usize,
) -> usize {
    let mut mv = Move::new(proposal, 1.0);
    let mut rng = SeededRandom::new(seed);
    let mut proposed = 0;
    for round in 0..rounds {
        let before = model.snapshot();
        let ln = mv.perform(&mut model.graph, &mut rng).unwrap();
        assert!(!ln.is_nan());
        match mv.state() {
            MoveState::Proposed => {
                proposed += 1;
                model.network().verify().unwrap_or_else(|e| {
                    panic!("round {round}: proposed network is invalid: {e}")
                });
            }
            MoveState::Failed => {
                assert_eq!(ln, f64::NEG_INFINITY);
                assert!(model.nothing_touched(), "round {round}: failure touched the graph");
            }
            MoveState::Idle => unreachable!(),
        }
        mv.reject(&mut model.graph);
        assert!(model.nothing_touched());
        assert_eq!(model.snapshot(), before, "round {round}: reject did not restore");
    }
    proposed
}

/// Perform then accept (or reject on failure) `rounds` times, verifying the
/// network after every step. Returns how many proposals were accepted.
pub(crate) fn assert_accept_keeps_valid(
    model: &mut Model,
    proposal: impl Proposal + 'static,
    seed: u64,
    rounds: usize,
) -> usize {
    let mut mv = Move::new(proposal, 1.0);
    let mut rng = SeededRandom::new(seed);
    for round in 0..rounds {
        mv.perform(&mut model.graph, &mut rng).unwrap();
        match mv.state() {
            MoveState::Proposed => mv.accept(&mut model.graph),
            _ => mv.reject(&mut model.graph),
        }
        let net = model.network();
        net.verify()
            .unwrap_or_else(|e| panic!("round {round}: accepted network is invalid: {e}"));
        assert!(!net.is_editing());
        assert!(model.nothing_touched());
    }
    mv.accepted() as usize
}
