//! Edge-Remove: delete a uniformly chosen admixture edge.

use cyanea_core::Result;

use super::common::{detach_edge, ln_add_density, pair_weights, Placement};
use super::{AdmixtureConfig, Failure, Outcome, Proposal};
use crate::dag::{ModelGraph, VariableId};
use crate::random::RandomSource;

/// Removes one admixture edge, the inverse of [`EdgeAdd`](super::EdgeAdd).
///
/// The edge is picked uniformly among the K edges; residuals enter only
/// through the reverse add density.
/// `ln H = ln q_add(edge) + ln K`, with `q_add` evaluated on the network
/// after the removal and with residuals recomputed for it. The two nodes
/// stay allocated until the move is accepted.
#[derive(Debug, Clone)]
pub struct EdgeRemove {
    network: VariableId,
    residuals: Option<VariableId>,
    config: AdmixtureConfig,
}

impl EdgeRemove {
    /// `config` must match the paired [`EdgeAdd`](super::EdgeAdd).
    pub fn new(network: VariableId, config: AdmixtureConfig) -> Self {
        Self {
            network,
            residuals: None,
            config,
        }
    }

    pub fn with_residuals(mut self, residuals: VariableId) -> Self {
        self.residuals = Some(residuals);
        self
    }
}

impl Proposal for EdgeRemove {
    fn name(&self) -> &str {
        "edge-remove"
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
        let k = edges.len();
        let pos = detach_edge(net, edges[rng.uniform_index(k)])?;

        graph.touch(self.network);
        let Some(weights) =
            pair_weights(graph, self.network, self.residuals, self.config.pair_sampling)?
        else {
            return Ok(Outcome::Failed(Failure::ZeroResidualMass));
        };
        let net = graph.network(self.network)?;
        let ln_reverse = ln_add_density(net, &weights, &self.config, &Placement::from(pos), rng);
        Ok(Outcome::Proposed(ln_reverse + (k as f64).ln()))
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::super::{Move, MoveState};
    use super::*;
    use crate::dag::Value;
    use crate::random::SeededRandom;

    #[test]
    fn accept_removes_and_deallocates() {
        let mut model = Model::four_taxa(&[("A", "C", 0.5, 0.2)]);
        let p = model.network().admixture_parents()[0];
        let mut mv = Move::new(model.edge_remove(), 1.0);
        let mut rng = SeededRandom::new(1);

        let ln = mv.perform(&mut model.graph, &mut rng).unwrap();
        assert!(ln.is_finite());
        assert_eq!(model.event_count(), 0);
        // Still allocated while only proposed.
        assert!(model.network().get_node(p).is_some());

        mv.accept(&mut model.graph);
        assert_eq!(model.event_count(), 0);
        assert_eq!(model.graph.value(model.events), &Value::Integer(0));
        assert!(model.network().get_node(p).is_none());
        assert_eq!(model.network().node_count(), 7);
        model.network().verify().unwrap();
    }

    #[test]
    fn reject_restores_edge() {
        let mut model = Model::four_taxa(&[("A", "C", 0.5, 0.2)]);
        let before = model.snapshot();
        let mut mv = Move::new(model.edge_remove(), 1.0);
        let mut rng = SeededRandom::new(1);
        mv.perform(&mut model.graph, &mut rng).unwrap();
        mv.reject(&mut model.graph);

        assert_eq!(model.snapshot(), before);
        let net = model.network();
        let p = net.admixture_parents()[0];
        let c = net.admixture_child_of(p).unwrap();
        assert_eq!(net.age(p), 0.5);
        assert_eq!(net.age(c), 0.5);
        assert_eq!(net.weight(c), 0.2);
        assert_eq!(model.graph.value(model.events), &Value::Integer(1));
    }

    #[test]
    fn hastings_matches_add_density() {
        let mut model = Model::four_taxa(&[("A", "C", 0.5, 0.2)]);
        let mut mv = Move::new(model.edge_remove(), 1.0);
        let mut rng = SeededRandom::new(3);
        let ln = mv.perform(&mut model.graph, &mut rng).unwrap();
        assert_eq!(mv.state(), MoveState::Proposed);

        // Without the edge, cherry residuals are 0.2 and cross residuals
        // 1/3 - 0.3, so with delta / max = 5 the pair (C, A) has weight
        // e^(1/6) out of 4e + 8e^(1/6). Its window is (0, 1), where
        // Beta(1, 2) at 0.5 is 1; the weight density is 3 * 0.6^2 / 0.5.
        let cross = (1.0f64 / 6.0).exp();
        let p = cross / (4.0 * 1f64.exp() + 8.0 * cross);
        let expected = p.ln() + (1.08f64 / 0.5).ln();
        assert!((ln - expected).abs() < 1e-9, "{ln} vs {expected}");
        mv.reject(&mut model.graph);
    }

    #[test]
    fn pick_is_uniform_over_edges() {
        // Residuals differ between the two edges' pairs; the pick ignores
        // them.
        let mut model = Model::six_taxa(&[("A", "D", 0.5, 0.2), ("F", "C", 1.2, 0.1)]);
        let mut mv = Move::new(model.edge_remove(), 1.0);
        let mut rng = SeededRandom::new(23);
        let (mut young, mut old) = (0usize, 0usize);
        for _ in 0..2000 {
            mv.perform(&mut model.graph, &mut rng).unwrap();
            assert_eq!(mv.state(), MoveState::Proposed);
            let net = model.network();
            let left = net.admixture_parents();
            assert_eq!(left.len(), 1);
            if net.age(left[0]) > 1.0 {
                young += 1;
            } else {
                old += 1;
            }
            mv.reject(&mut model.graph);
        }
        assert_eq!(young + old, 2000);
        assert!((850..=1150).contains(&young), "{young} vs {old}");
    }

    #[test]
    fn empty_network_fails() {
        let mut model = Model::four_taxa(&[]);
        let proposal = model.edge_remove();
        assert_eq!(assert_reject_restores(&mut model, proposal, 0, 5), 0);
    }

    #[test]
    fn reject_is_exact_across_seeds() {
        let mut model = Model::six_taxa(&[("A", "D", 0.5, 0.2), ("F", "C", 1.2, 0.1)]);
        let proposal = model.edge_remove();
        let proposed = assert_reject_restores(&mut model, proposal, 17, 40);
        assert_eq!(proposed, 40);
    }
}
