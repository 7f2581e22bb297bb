//! Divergence-Merge: turn an admixture edge into a divergence.

use cyanea_core::Result;

use super::common::{check_admixture, detach_edge, perturb_rates, pick_weighted};
use super::{Failure, Outcome, Proposal};
use crate::dag::{ModelGraph, VariableId};
use crate::random::RandomSource;

/// Collapses an admixture edge whose two ends hang directly below
/// divergence nodes.
///
/// The edge is chosen with probability proportional to its weight among
/// those candidates. With `cp` the divergence above the recipient end and
/// `pp` the one above the donor end, the edge is removed, `cp` is cut out
/// of its lineage (its other child takes its place) and reinserted on the
/// donor lineage below `pp`, joining the recipient and donor lineages at
/// an age drawn uniformly between their ages and `pp`'s.
///
/// There is no paired split move, so the Hastings ratio accounts for the
/// forward choices only: `ln(Σw / w) + ln(hi − lo)` plus the rate Jacobian.
/// Give it a zero schedule weight unless that is what the model intends.
#[derive(Debug, Clone)]
pub struct DivergenceMerge {
    network: VariableId,
    rates: Vec<VariableId>,
    allow_sister: bool,
    rate_delta: f64,
}

impl DivergenceMerge {
    pub fn new(network: VariableId) -> Self {
        Self {
            network,
            rates: Vec::new(),
            allow_sister: false,
            rate_delta: 0.5,
        }
    }

    pub fn with_rates(mut self, rates: Vec<VariableId>) -> Self {
        self.rates = rates;
        self
    }

    pub fn allow_sister_admixture(mut self, allow: bool) -> Self {
        self.allow_sister = allow;
        self
    }
}

impl Proposal for DivergenceMerge {
    fn name(&self) -> &str {
        "divergence-merge"
    }

    fn network(&self) -> Option<VariableId> {
        Some(self.network)
    }

    fn variables(&self) -> Vec<VariableId> {
        self.rates.clone()
    }

    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RandomSource) -> Result<Outcome> {
        let net = graph.network_mut(self.network)?;
        let candidates = net.first_admixture_parent_per_lineage();
        if candidates.is_empty() {
            return Ok(Outcome::Failed(Failure::NoAdmixtureEdge));
        }
        let weights: Vec<f64> = candidates.iter().map(|&p| net.weight(p)).collect();
        let k = pick_weighted(&weights, rng);
        let total: f64 = weights.iter().sum();
        let edge = candidates[k];

        let (Some(child), Some(pp)) = (net.admixture_child_of(edge), net.parent(edge)) else {
            return Ok(Outcome::Failed(Failure::NoAdmixtureEdge));
        };
        let Some(cp) = net.parent(child) else {
            return Ok(Outcome::Failed(Failure::NearRoot));
        };
        if net.parent(cp).is_none() {
            return Ok(Outcome::Failed(Failure::NearRoot));
        }
        if cp == pp {
            return Ok(Outcome::Failed(Failure::SisterLineages));
        }

        let pos = detach_edge(net, edge)?;
        let (recipient, donor) = (pos.child_child, pos.parent_child);
        let lower = net.age(recipient).max(net.age(donor));
        let upper = net.age(pp);
        if !(upper > lower) {
            return Ok(Outcome::Failed(Failure::EmptyAgeWindow));
        }
        let age = lower + rng.uniform01() * (upper - lower);
        if !(lower < age && age < upper) {
            return Ok(Outcome::Failed(Failure::DegenerateDraw));
        }
        if net.prune_and_regraft(cp, recipient, donor, age).is_err() {
            return Ok(Outcome::Failed(Failure::InvalidSplice));
        }
        if let Err(reason) = check_admixture(net, self.allow_sister) {
            return Ok(Outcome::Failed(reason));
        }
        let branches: Vec<usize> = [recipient, donor]
            .iter()
            .filter_map(|&n| net.branch_index(n))
            .collect();

        let ln_jacobian = perturb_rates(graph, &self.rates, &branches, self.rate_delta, rng)?;
        Ok(Outcome::Proposed(
            (total / weights[k]).ln() + (upper - lower).ln() + ln_jacobian,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::super::{Move, MoveState};
    use super::*;
    use crate::random::SeededRandom;

    #[test]
    fn merges_recipient_onto_donor_lineage() {
        // Edge from D (donor) into A (recipient) at 0.5, on the six-taxon
        // tree where A's divergence AB is not the root.
        let mut model = Model::six_taxa(&[("D", "A", 0.5, 0.2)]);
        let net = model.network();
        let (a, b, d) = (
            net.tip_by_name("A").unwrap(),
            net.tip_by_name("B").unwrap(),
            net.tip_by_name("D").unwrap(),
        );
        let ab = net.topology_parent(a).unwrap();
        let abc = net.parent(ab).unwrap();
        let de = net.topology_parent(d).unwrap();

        let mut mv = Move::new(model.divergence_merge(), 1.0);
        let mut rng = SeededRandom::new(4);
        let ln = mv.perform(&mut model.graph, &mut rng).unwrap();
        assert_eq!(mv.state(), MoveState::Proposed);
        assert!(ln.is_finite());

        let net = model.network();
        net.verify().unwrap();
        assert_eq!(net.admixture_event_count(), 0);
        // AB now joins A and D below DE; B hangs from ABC directly.
        assert_eq!(net.parent(a), Some(ab));
        assert_eq!(net.parent(d), Some(ab));
        assert_eq!(net.parent(ab), Some(de));
        assert_eq!(net.parent(b), Some(abc));
        assert!(net.age(ab) > 0.0 && net.age(ab) < 1.5);

        mv.accept(&mut model.graph);
        assert_eq!(model.network().node_count(), 11);
    }

    #[test]
    fn recipient_below_root_fails() {
        let mut model = Model::from_newick("((A:1,B:1):1,C:2);", &[("A", "C", 0.5, 0.2)]);
        let proposal = model.divergence_merge();
        assert_eq!(assert_reject_restores(&mut model, proposal, 3, 10), 0);
    }

    #[test]
    fn sister_lineages_fail() {
        let mut model = Model::four_taxa(&[("A", "B", 0.5, 0.2)]);
        let proposal = model.divergence_merge();
        assert_eq!(assert_reject_restores(&mut model, proposal, 5, 10), 0);
    }

    #[test]
    fn merge_below_donor_divergence() {
        let mut model = Model::four_taxa(&[("A", "C", 0.5, 0.2)]);
        let proposal = model.divergence_merge();
        assert_eq!(assert_reject_restores(&mut model, proposal, 3, 10), 10);
    }

    #[test]
    fn reject_is_exact() {
        let mut model = Model::six_taxa(&[("A", "D", 0.5, 0.2), ("F", "C", 1.2, 0.1)]);
        let proposal = model.divergence_merge();
        assert_reject_restores(&mut model, proposal, 13, 40);
    }
}
