//! Edge-FNPR: regraft one end of an admixture edge onto another lineage at
//! the same age.

use cyanea_core::Result;

use super::common::{attach_edge, beta_slide, check_admixture, detach_edge, perturb_rates, Placement};
use super::{tuning_factor, AdmixtureConfig, Failure, Outcome, Proposal, SCALAR_TARGET};
use crate::dag::{ModelGraph, VariableId};
use crate::random::RandomSource;

/// Moves the donor or the recipient end (probability ½ each) of a
/// uniformly chosen edge onto a uniformly chosen branch crossing the edge's
/// age, and slides the weight with a Beta kernel.
///
/// The candidate branches are the same set in both directions, so only the
/// weight kernel and the branch-rate multipliers enter the Hastings ratio.
/// When branch rates are attached, the rates of the branch the end leaves
/// and the branch it joins are multiplied by `exp(δ(U − ½))`.
#[derive(Debug, Clone)]
pub struct EdgeFnpr {
    network: VariableId,
    rates: Vec<VariableId>,
    allow_sister: bool,
    lambda: f64,
    rate_delta: f64,
}

impl EdgeFnpr {
    pub fn new(network: VariableId, config: AdmixtureConfig) -> Self {
        Self {
            network,
            rates: Vec::new(),
            allow_sister: config.allow_sister_admixture,
            lambda: 20.0,
            rate_delta: 0.5,
        }
    }

    /// Per-branch rate variables, indexed by branch index.
    pub fn with_rates(mut self, rates: Vec<VariableId>) -> Self {
        self.rates = rates;
        self
    }
}

impl Proposal for EdgeFnpr {
    fn name(&self) -> &str {
        "edge-fnpr"
    }

    fn network(&self) -> Option<VariableId> {
        Some(self.network)
    }

    fn variables(&self) -> Vec<VariableId> {
        self.rates.clone()
    }

    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RandomSource) -> Result<Outcome> {
        let net = graph.network_mut(self.network)?;
        let edges = net.admixture_parents();
        if edges.is_empty() {
            return Ok(Outcome::Failed(Failure::NoAdmixtureEdge));
        }
        let pos = detach_edge(net, edges[rng.uniform_index(edges.len())])?;
        let move_child_end = rng.uniform01() < 0.5;
        let (moving, fixed) = if move_child_end {
            (pos.child_child, pos.parent_child)
        } else {
            (pos.parent_child, pos.child_child)
        };

        let candidates: Vec<_> = net
            .branches_crossing(pos.age, None)
            .into_iter()
            .filter(|&n| n != fixed)
            .collect();
        if candidates.is_empty() {
            return Ok(Outcome::Failed(Failure::NoReattachmentPoint));
        }
        let target = candidates[rng.uniform_index(candidates.len())];

        let (unit_weight, ln_weight) = match beta_slide(rng, pos.weight / 0.5, self.lambda) {
            Ok(d) => d,
            Err(reason) => return Ok(Outcome::Failed(reason)),
        };
        let weight = unit_weight * 0.5;
        if !(weight > 0.0 && weight < 0.5) {
            return Ok(Outcome::Failed(Failure::DegenerateDraw));
        }
        let placement = if move_child_end {
            Placement {
                child_below: target,
                parent_below: fixed,
                age: pos.age,
                weight,
            }
        } else {
            Placement {
                child_below: fixed,
                parent_below: target,
                age: pos.age,
                weight,
            }
        };
        let branches: Vec<usize> = [moving, target]
            .iter()
            .filter_map(|&n| net.branch_index(n))
            .collect();

        if let Err(reason) = attach_edge(net, &placement) {
            return Ok(Outcome::Failed(reason));
        }
        if let Err(reason) = check_admixture(net, self.allow_sister) {
            return Ok(Outcome::Failed(reason));
        }
        let ln_jacobian = perturb_rates(graph, &self.rates, &branches, self.rate_delta, rng)?;
        Ok(Outcome::Proposed(ln_weight + ln_jacobian))
    }

    fn tune(&mut self, acceptance_rate: f64) {
        self.lambda /= tuning_factor(acceptance_rate, SCALAR_TARGET);
    }

    fn tuning(&self) -> Option<f64> {
        Some(self.lambda)
    }
}
