//! Node-Age: slide an internal node between its parent and children,
//! rescaling the rates of the branches it touches.

use cyanea_core::Result;

use super::common::beta_slide;
use super::{tuning_factor, Failure, Outcome, Proposal, SCALAR_TARGET};
use crate::dag::{ModelGraph, Value, VariableId};
use crate::network::{AdmixtureNetwork, NodeId};
use crate::random::RandomSource;

/// Proposes a new age for a uniformly chosen non-root internal node.
///
/// Admixture nodes move together with their partner, so the window is
/// bounded by the children and parents of both ends. The age is slid on
/// the unit scale of the window with a Beta kernel.
///
/// When a divergence node moves and branch rates are attached, the rate of
/// every tree branch whose length changes is rescaled by `L / L'` so the
/// expected substitutions along it stay put; `Σ ln(L / L')` is the
/// Jacobian.
#[derive(Debug, Clone)]
pub struct NodeAgeRateShift {
    network: VariableId,
    rates: Vec<VariableId>,
    lambda: f64,
    /// Uniform draw for the node choice, taken in `prepare`.
    pending: Option<f64>,
}

impl NodeAgeRateShift {
    pub fn new(network: VariableId) -> Self {
        Self {
            network,
            rates: Vec::new(),
            lambda: 10.0,
            pending: None,
        }
    }

    pub fn with_rates(mut self, rates: Vec<VariableId>) -> Self {
        self.rates = rates;
        self
    }

    pub fn with_concentration(mut self, lambda: f64) -> Self {
        self.lambda = lambda;
        self
    }
}

/// `(lower, upper)` ages `id` may take, accounting for its partner.
fn age_bounds(net: &AdmixtureNetwork, id: NodeId) -> Option<(f64, f64)> {
    let mut ends = vec![id];
    ends.extend(net.partner(id));
    let mut lower = f64::NEG_INFINITY;
    let mut upper = f64::INFINITY;
    for n in ends {
        for &c in net.children(n) {
            lower = lower.max(net.age(c));
        }
        upper = upper.min(net.age(net.parent(n)?));
    }
    Some((lower, upper))
}

/// Tree branches whose length depends on the age of divergence node `id`:
/// its own and its children's, as `(branch index, bottom node, top node)`.
fn dependent_branches(net: &AdmixtureNetwork, id: NodeId) -> Vec<(usize, NodeId, NodeId)> {
    let mut branches = Vec::with_capacity(3);
    if let (Some(index), Some(top)) = (net.node(id).index, net.topology_parent(id)) {
        branches.push((index, id, top));
    }
    for &c in net.children(id) {
        let bottom = net.topology_descendant(c);
        if let Some(index) = net.node(bottom).index {
            branches.push((index, bottom, id));
        }
    }
    branches
}

impl Proposal for NodeAgeRateShift {
    fn name(&self) -> &str {
        "node-age"
    }

    fn network(&self) -> Option<VariableId> {
        Some(self.network)
    }

    fn variables(&self) -> Vec<VariableId> {
        self.rates.clone()
    }

    fn prepare(&mut self, _graph: &mut ModelGraph, rng: &mut dyn RandomSource) {
        self.pending = Some(rng.uniform01());
    }

    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RandomSource) -> Result<Outcome> {
        let u = match self.pending.take() {
            Some(u) => u,
            None => rng.uniform01(),
        };
        let net = graph.network_mut(self.network)?;
        let candidates: Vec<NodeId> = net
            .nodes()
            .filter(|n| !n.is_tip() && !n.is_root())
            .map(|n| n.id)
            .collect();
        if candidates.is_empty() {
            return Ok(Outcome::Failed(Failure::NoEligibleNode));
        }
        let id = candidates[((u * candidates.len() as f64) as usize).min(candidates.len() - 1)];

        let Some((lower, upper)) = age_bounds(net, id) else {
            return Ok(Outcome::Failed(Failure::NearRoot));
        };
        if !(upper > lower) {
            return Ok(Outcome::Failed(Failure::EmptyAgeWindow));
        }
        let span = upper - lower;
        let (unit, ln_kernel) = match beta_slide(rng, (net.age(id) - lower) / span, self.lambda) {
            Ok(d) => d,
            Err(reason) => return Ok(Outcome::Failed(reason)),
        };
        let age = lower + unit * span;
        if !(lower < age && age < upper) {
            return Ok(Outcome::Failed(Failure::DegenerateDraw));
        }

        let rescale = !self.rates.is_empty() && net.node(id).is_divergence();
        let branches = if rescale {
            dependent_branches(net, id)
        } else {
            Vec::new()
        };
        let before: Vec<f64> = branches
            .iter()
            .map(|&(_, bottom, top)| net.age(top) - net.age(bottom))
            .collect();

        net.set_age(id, age);
        if let Some(partner) = net.partner(id) {
            net.set_age(partner, age);
        }
        let after: Vec<f64> = branches
            .iter()
            .map(|&(_, bottom, top)| net.age(top) - net.age(bottom))
            .collect();

        let mut ln_jacobian = 0.0;
        for (k, &(index, _, _)) in branches.iter().enumerate() {
            let Some(&r) = self.rates.get(index) else {
                continue;
            };
            let ratio = before[k] / after[k];
            let rate = graph.real(r)?;
            graph.set_value(r, Value::Real(rate * ratio))?;
            ln_jacobian += ratio.ln();
        }
        Ok(Outcome::Proposed(ln_kernel + ln_jacobian))
    }

    fn tune(&mut self, acceptance_rate: f64) {
        self.lambda /= tuning_factor(acceptance_rate, SCALAR_TARGET);
    }

    fn tuning(&self) -> Option<f64> {
        Some(self.lambda)
    }
}
