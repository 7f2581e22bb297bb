//! Edge-Slide: move an admixture edge to a new age, letting both ends
//! follow their lineages up or down the tree.

use cyanea_core::Result;

use super::common::{
    attach_edge, beta_slide, check_admixture, descend, descent_ln_probability, detach_edge, Draw,
    Placement,
};
use super::{tuning_factor, AdmixtureConfig, Failure, Outcome, Proposal, MULTIVARIATE_TARGET};
use crate::dag::{ModelGraph, VariableId};
use crate::network::{AdmixtureEdgePosition, AdmixtureNetwork, NodeId};
use crate::random::RandomSource;

/// Slides a uniformly chosen edge to a new age and weight.
///
/// The age is proposed on the unit scale `age / height` with a Beta kernel
/// centred on the current value, the weight likewise on `weight / 0.5`.
/// Each end then follows its rail through the network without the edge:
/// upwards the lineage is unique, downwards a child is chosen uniformly at
/// every divergence. The descent probabilities enter the Hastings ratio.
#[derive(Debug, Clone)]
pub struct EdgeSlide {
    network: VariableId,
    allow_sister: bool,
    /// Beta kernel concentration.
    lambda: f64,
}

impl EdgeSlide {
    pub fn new(network: VariableId, config: AdmixtureConfig) -> Self {
        Self {
            network,
            allow_sister: config.allow_sister_admixture,
            lambda: 20.0,
        }
    }

    pub fn with_concentration(mut self, lambda: f64) -> Self {
        self.lambda = lambda;
        self
    }

    /// New placement for the detached edge `pos` and its log Hastings ratio.
    fn draw(
        &self,
        net: &AdmixtureNetwork,
        pos: &AdmixtureEdgePosition,
        rng: &mut dyn RandomSource,
    ) -> Draw<(Placement, f64)> {
        let height = net.height();
        let (unit_age, ln_age) = beta_slide(rng, pos.age / height, self.lambda)?;
        let (unit_weight, ln_weight) = beta_slide(rng, pos.weight / 0.5, self.lambda)?;
        let age = unit_age * height;
        let weight = unit_weight * 0.5;
        if !(weight > 0.0 && weight < 0.5) {
            return Err(Failure::DegenerateDraw);
        }
        let (child_below, c_fwd, c_rev) = follow_rail(net, pos.child_child, pos.age, age, rng)?;
        let (parent_below, p_fwd, p_rev) = follow_rail(net, pos.parent_child, pos.age, age, rng)?;
        let placement = Placement {
            child_below,
            parent_below,
            age,
            weight,
        };
        Ok((placement, ln_age + ln_weight + c_rev + p_rev - c_fwd - p_fwd))
    }
}

/// New branch for an end currently above `below` at `from` when the edge
/// moves to `to`, with `(ln p forward, ln p reverse)` of the rail walk.
fn follow_rail(
    net: &AdmixtureNetwork,
    below: NodeId,
    from: f64,
    to: f64,
    rng: &mut dyn RandomSource,
) -> Draw<(NodeId, f64, f64)> {
    if to < from {
        let (node, ln_fwd) = descend(net, below, to, rng)?;
        Ok((node, ln_fwd, 0.0))
    } else {
        let node = net.branch_at_age(below, to).ok_or(Failure::DegenerateDraw)?;
        Ok((node, 0.0, descent_ln_probability(net, node, below)))
    }
}

impl Proposal for EdgeSlide {
    fn name(&self) -> &str {
        "edge-slide"
    }

    fn network(&self) -> Option<VariableId> {
        Some(self.network)
    }

    fn variables(&self) -> Vec<VariableId> {
        Vec::new()
    }

    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RandomSource) -> Result<Outcome> {
        let net = graph.network_mut(self.network)?;
        let edges = net.admixture_parents();
        if edges.is_empty() {
            return Ok(Outcome::Failed(Failure::NoAdmixtureEdge));
        }
        let pos = detach_edge(net, edges[rng.uniform_index(edges.len())])?;

        let (placement, ln_hastings) = match self.draw(net, &pos, rng) {
            Ok(d) => d,
            Err(reason) => return Ok(Outcome::Failed(reason)),
        };

        if let Err(reason) = attach_edge(net, &placement) {
            return Ok(Outcome::Failed(reason));
        }
        if let Err(reason) = check_admixture(net, self.allow_sister) {
            return Ok(Outcome::Failed(reason));
        }
        Ok(Outcome::Proposed(ln_hastings))
    }

    fn tune(&mut self, acceptance_rate: f64) {
        self.lambda /= tuning_factor(acceptance_rate, MULTIVARIATE_TARGET);
    }

    fn tuning(&self) -> Option<f64> {
        Some(self.lambda)
    }
}
