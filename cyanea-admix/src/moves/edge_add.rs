//! Edge-Add: place a new admixture edge between two sampled lineages.

use cyanea_core::Result;

use super::common::{attach_edge, draw_placement, ln_add_density, pair_weights};
use super::{AdmixtureConfig, Failure, Outcome, Proposal};
use crate::dag::{ModelGraph, VariableId};
use crate::random::RandomSource;

/// Adds one admixture edge.
///
/// A (recipient, donor) tip pair is drawn uniformly or from the positive
/// residuals, the age from Beta(1, skew) over the pair's age window and the
/// weight from a scaled Beta. The reverse is Edge-Remove's uniform pick, so
///
/// `ln H = −ln K' − ln q_add(edge)`
///
/// where `K'` counts edges after the addition and `q_add` is the density of
/// drawing the edge on the network without it, summed over every tip pair
/// whose lineages pass through the chosen branches.
#[derive(Debug, Clone)]
pub struct EdgeAdd {
    network: VariableId,
    residuals: Option<VariableId>,
    config: AdmixtureConfig,
}

impl EdgeAdd {
    pub fn new(network: VariableId, config: AdmixtureConfig) -> Self {
        Self {
            network,
            residuals: None,
            config,
        }
    }

    /// Residual matrix variable used by [`PairSampling::Residual`](super::PairSampling).
    pub fn with_residuals(mut self, residuals: VariableId) -> Self {
        self.residuals = Some(residuals);
        self
    }
}

impl Proposal for EdgeAdd {
    fn name(&self) -> &str {
        "edge-add"
    }

    fn network(&self) -> Option<VariableId> {
        Some(self.network)
    }

    fn variables(&self) -> Vec<VariableId> {
        Vec::new()
    }

    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RandomSource) -> Result<Outcome> {
        let count = graph.network(self.network)?.admixture_event_count();
        if count >= self.config.max_events {
            return Ok(Outcome::Failed(Failure::EventCap));
        }
        let Some(weights) =
            pair_weights(graph, self.network, self.residuals, self.config.pair_sampling)?
        else {
            return Ok(Outcome::Failed(Failure::ZeroResidualMass));
        };

        let net = graph.network(self.network)?;
        let placement = match draw_placement(net, &weights, &self.config, rng) {
            Ok(p) => p,
            Err(reason) => return Ok(Outcome::Failed(reason)),
        };
        let ln_forward = ln_add_density(net, &weights, &self.config, &placement, rng);

        let net = graph.network_mut(self.network)?;
        if let Err(reason) = attach_edge(net, &placement) {
            return Ok(Outcome::Failed(reason));
        }
        let ln_reverse = -((count + 1) as f64).ln();
        Ok(Outcome::Proposed(ln_reverse - ln_forward))
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::super::{Move, MoveState, PairSampling};
    use super::*;
    use crate::random::SeededRandom;

    #[test]
    fn adds_one_edge() {
        let mut model = Model::four_taxa(&[]);
        let mut mv = Move::new(model.edge_add(), 1.0);
        let mut rng = SeededRandom::new(4);
        let mut added = 0;
        for _ in 0..50 {
            let ln = mv.perform(&mut model.graph, &mut rng).unwrap();
            if mv.state() == MoveState::Proposed {
                assert!(ln.is_finite());
                assert_eq!(model.event_count(), 1);
                model.network().verify().unwrap();
                added += 1;
            }
            mv.reject(&mut model.graph);
            assert_eq!(model.event_count(), 0);
        }
        assert!(added > 0);
    }

    /// Uniform draw selecting the ordered (recipient, donor) pair under
    /// uniform pair sampling.
    fn pair_draw(model: &Model, recipient: &str, donor: &str) -> f64 {
        let net = model.network();
        let n = net.tip_count();
        let i = net.tip_index(net.tip_by_name(recipient).unwrap()).unwrap();
        let j = net.tip_index(net.tip_by_name(donor).unwrap()).unwrap();
        let k = i * (n - 1) + if j < i { j } else { j - 1 };
        index_draw(k, n * (n - 1))
    }

    fn uniform_pairs(model: &Model) -> EdgeAdd {
        let config = AdmixtureConfig {
            pair_sampling: PairSampling::Uniform,
            ..model.config.clone()
        };
        EdgeAdd::new(model.network, config)
    }

    #[test]
    fn hastings_on_empty_network() {
        let mut model = Model::four_taxa(&[]);
        let mut mv = Move::new(uniform_pairs(&model), 1.0);
        let mut rng = ScriptedRandom::new(&[pair_draw(&model, "A", "C")], &[0.5, 0.4]);
        let ln = mv.perform(&mut model.graph, &mut rng).unwrap();
        assert_eq!(mv.state(), MoveState::Proposed);
        assert!(rng.is_spent());

        // One pair out of 12 on the window (0, 1), where Beta(1, 2) at 0.5
        // is 1; the weight density is Beta(1, 3)(0.4) / 0.5 = 2.16. The
        // reverse pick is one edge out of one.
        let expected = 12f64.ln() - 2.16f64.ln();
        assert!((ln - expected).abs() < 1e-9, "{ln} vs {expected}");

        let net = model.network();
        let p = net.admixture_parents()[0];
        let c = net.admixture_child_of(p).unwrap();
        assert_eq!(net.age(p), 0.5);
        assert_eq!(net.children(c), &[net.tip_by_name("A").unwrap()]);
        assert_eq!(net.children(p), &[net.tip_by_name("C").unwrap()]);
        mv.reject(&mut model.graph);
        assert_eq!(model.event_count(), 0);
    }

    #[test]
    fn hastings_counts_existing_edges() {
        let mut model = Model::four_taxa(&[("A", "C", 0.5, 0.2)]);
        let mut mv = Move::new(uniform_pairs(&model), 1.0);
        let mut rng = ScriptedRandom::new(&[pair_draw(&model, "B", "D")], &[0.25, 0.4]);
        let ln = mv.perform(&mut model.graph, &mut rng).unwrap();
        assert_eq!(mv.state(), MoveState::Proposed);
        assert!(rng.is_spent());
        assert_eq!(model.event_count(), 2);

        // ln H = -ln K' - ln q_add with K' = 2; Beta(1, 2) at 0.25 is 1.5.
        let expected = -(2f64.ln()) - (1.0f64 / 12.0).ln() - 1.5f64.ln() - 2.16f64.ln();
        assert!((ln - expected).abs() < 1e-9, "{ln} vs {expected}");
        mv.reject(&mut model.graph);
    }

    #[test]
    fn respects_event_cap() {
        let mut model = Model::four_taxa(&[("A", "C", 0.5, 0.2)]);
        let config = AdmixtureConfig {
            max_events: 1,
            ..model.config.clone()
        };
        let mut mv = Move::new(EdgeAdd::new(model.network, config), 1.0);
        let mut rng = SeededRandom::new(1);
        assert_eq!(mv.perform(&mut model.graph, &mut rng).unwrap(), f64::NEG_INFINITY);
        assert_eq!(mv.state(), MoveState::Failed);
    }

    #[test]
    fn zero_residual_mass_fails() {
        let mut model = Model::four_taxa(&[]);
        model.shift_residuals(-1.0);
        let mut mv = Move::new(model.edge_add(), 1.0);
        let mut rng = SeededRandom::new(2);
        let before = model.snapshot();
        assert_eq!(mv.perform(&mut model.graph, &mut rng).unwrap(), f64::NEG_INFINITY);
        mv.reject(&mut model.graph);
        assert_eq!(model.snapshot(), before);
    }

    #[test]
    fn uniform_pairs_never_join_sisters() {
        let mut model = Model::four_taxa(&[]);
        let config = AdmixtureConfig {
            pair_sampling: PairSampling::Uniform,
            ..model.config.clone()
        };
        let mut mv = Move::new(EdgeAdd::new(model.network, config), 1.0);
        let mut rng = SeededRandom::new(6);
        let mut windows_empty = 0;
        for _ in 0..100 {
            mv.perform(&mut model.graph, &mut rng).unwrap();
            match mv.state() {
                MoveState::Proposed => {
                    let net = model.network();
                    let p = net.admixture_parents()[0];
                    let c = net.admixture_child_of(p).unwrap();
                    assert_ne!(net.topology_parent(p), net.topology_parent(c));
                }
                _ => windows_empty += 1,
            }
            mv.reject(&mut model.graph);
        }
        // A–B and C–D pairs (4 of 12) have empty windows.
        assert!(windows_empty > 10);
    }
}
