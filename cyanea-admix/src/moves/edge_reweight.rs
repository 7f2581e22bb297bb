//! Edge-Reweight: slide the weight of one admixture edge.

use cyanea_core::Result;

use super::common::beta_slide;
use super::{tuning_factor, Failure, Outcome, Proposal, SCALAR_TARGET};
use crate::dag::{ModelGraph, VariableId};
use crate::random::RandomSource;

/// Slides the weight of a uniformly chosen edge with a Beta kernel on
/// `weight / 0.5`, leaving the topology and ages alone.
#[derive(Debug, Clone)]
pub struct EdgeReweight {
    network: VariableId,
    lambda: f64,
}

impl EdgeReweight {
    pub fn new(network: VariableId) -> Self {
        Self {
            network,
            lambda: 20.0,
        }
    }

    pub fn with_concentration(mut self, lambda: f64) -> Self {
        self.lambda = lambda;
        self
    }
}

impl Proposal for EdgeReweight {
    fn name(&self) -> &str {
        "edge-reweight"
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
        let parent = edges[rng.uniform_index(edges.len())];
        let Some(child) = net.admixture_child_of(parent) else {
            return Ok(Outcome::Failed(Failure::NoAdmixtureEdge));
        };
        let (unit, ln_hastings) = match beta_slide(rng, net.weight(parent) / 0.5, self.lambda) {
            Ok(d) => d,
            Err(reason) => return Ok(Outcome::Failed(reason)),
        };
        let weight = unit * 0.5;
        net.set_weight(parent, weight);
        net.set_weight(child, weight);
        Ok(Outcome::Proposed(ln_hastings))
    }

    fn tune(&mut self, acceptance_rate: f64) {
        self.lambda /= tuning_factor(acceptance_rate, SCALAR_TARGET);
    }

    fn tuning(&self) -> Option<f64> {
        Some(self.lambda)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;

    #[test]
    fn ends_share_the_new_weight() {
        let mut model = Model::six_taxa(&[("A", "D", 0.5, 0.2), ("F", "C", 1.2, 0.1)]);
        let proposal = model.edge_reweight();
        let accepted = assert_accept_keeps_valid(&mut model, proposal, 3, 50);
        assert!(accepted > 0);
        let net = model.network();
        for p in net.admixture_parents() {
            let c = net.admixture_child_of(p).unwrap();
            assert_eq!(net.weight(p), net.weight(c));
            assert!(net.weight(p) > 0.0 && net.weight(p) < 0.5);
            assert_eq!(net.age(p), net.age(c));
        }
    }

    #[test]
    fn reject_is_exact() {
        let mut model = Model::six_taxa(&[("A", "D", 0.5, 0.2)]);
        let proposal = model.edge_reweight();
        assert_eq!(assert_reject_restores(&mut model, proposal, 8, 30), 30);
    }

    #[test]
    fn kernel_is_reversible() {
        let mut rng = crate::random::SeededRandom::new(14);
        let (y, ln) = beta_slide(&mut rng, 0.4, 20.0).unwrap();
        let back = rng.beta_ln_pdf(20.0 * y + 1.0, 20.0 * (1.0 - y) + 1.0, 0.4);
        let fwd = rng.beta_ln_pdf(9.0, 13.0, y);
        assert!((ln - (back - fwd)).abs() < 1e-12);
    }
}
