//! Tree rearrangements: nearest-neighbour interchange and the two
//! prune-regraft variants.
//!
//! Admixture nodes on the moved branches travel with them. Afterwards every
//! edge must still satisfy the outgroup and sister-lineage constraints,
//! otherwise the proposal fails.

use cyanea_core::Result;

use super::common::{check_admixture, pick_prune, regraft_targets};
use super::{Failure, Outcome, Proposal};
use crate::dag::{ModelGraph, VariableId};
use crate::random::RandomSource;

/// Narrow nearest-neighbour interchange.
///
/// Picks a divergence node `i` whose parent `j` is also a divergence node,
/// one child `c` of `i` and swaps it with `i`'s sibling `u`. Requires `u` to
/// be younger than `i`. Symmetric, so `ln H = 0`.
#[derive(Debug, Clone)]
pub struct Nni {
    network: VariableId,
    allow_sister: bool,
}

impl Nni {
    pub fn new(network: VariableId) -> Self {
        Self {
            network,
            allow_sister: false,
        }
    }

    pub fn allow_sister_admixture(mut self, allow: bool) -> Self {
        self.allow_sister = allow;
        self
    }
}

impl Proposal for Nni {
    fn name(&self) -> &str {
        "nni"
    }

    fn network(&self) -> Option<VariableId> {
        Some(self.network)
    }

    fn variables(&self) -> Vec<VariableId> {
        Vec::new()
    }

    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RandomSource) -> Result<Outcome> {
        let net = graph.network_mut(self.network)?;
        let candidates: Vec<_> = net
            .divergence_nodes()
            .into_iter()
            .filter(|&i| net.parent(i).is_some_and(|j| net.node(j).is_divergence()))
            .collect();
        if candidates.is_empty() {
            return Ok(Outcome::Failed(Failure::NoEligibleNode));
        }
        let i = candidates[rng.uniform_index(candidates.len())];
        let Some(j) = net.parent(i) else {
            return Ok(Outcome::Failed(Failure::NearRoot));
        };
        let c = net.children(i)[rng.uniform_index(2)];
        let Some(&u) = net.children(j).iter().find(|&&n| n != i) else {
            return Ok(Outcome::Failed(Failure::NoEligibleNode));
        };

        if !(net.age(u) < net.age(i)) {
            return Ok(Outcome::Failed(Failure::NoReattachmentPoint));
        }
        if net.is_outgroup(c) != net.is_outgroup(u) {
            return Ok(Outcome::Failed(Failure::OutgroupMismatch));
        }
        if net.exchange_subtrees(c, u).is_err() {
            return Ok(Outcome::Failed(Failure::InvalidSplice));
        }
        if let Err(reason) = check_admixture(net, self.allow_sister) {
            return Ok(Outcome::Failed(reason));
        }
        Ok(Outcome::Proposed(0.0))
    }
}

/// Fixed-height prune and regraft.
///
/// A non-root divergence node is pruned with one of its children and
/// regrafted, at its current age, onto a uniformly chosen branch crossing
/// that age. The candidate set is the same in both directions, so
/// `ln H = 0`.
#[derive(Debug, Clone)]
pub struct Fnpr {
    network: VariableId,
    allow_sister: bool,
}

impl Fnpr {
    pub fn new(network: VariableId) -> Self {
        Self {
            network,
            allow_sister: false,
        }
    }

    pub fn allow_sister_admixture(mut self, allow: bool) -> Self {
        self.allow_sister = allow;
        self
    }
}

impl Proposal for Fnpr {
    fn name(&self) -> &str {
        "fnpr"
    }

    fn network(&self) -> Option<VariableId> {
        Some(self.network)
    }

    fn variables(&self) -> Vec<VariableId> {
        Vec::new()
    }

    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RandomSource) -> Result<Outcome> {
        let net = graph.network_mut(self.network)?;
        let prune = match pick_prune(net, rng) {
            Ok(p) => p,
            Err(reason) => return Ok(Outcome::Failed(reason)),
        };
        let age = net.age(prune.node);
        // The sibling's segment reaches the old parent once `p` is gone.
        let mut targets = net.branches_crossing(age, Some(prune.node));
        targets.push(prune.sibling);
        let target = targets[rng.uniform_index(targets.len())];

        if net.prune_and_regraft(prune.node, prune.moving, target, age).is_err() {
            return Ok(Outcome::Failed(Failure::InvalidSplice));
        }
        if let Err(reason) = check_admixture(net, self.allow_sister) {
            return Ok(Outcome::Failed(reason));
        }
        Ok(Outcome::Proposed(0.0))
    }
}

/// Variable-height subtree prune and regraft.
///
/// Like [`Fnpr`] but the target may be any branch whose top lies above the
/// pruned subtree, and the new age is uniform on the part of that branch
/// above both the subtree and the target. `ln H = ln Δ_fwd − ln Δ_rev` for
/// the two age windows.
#[derive(Debug, Clone)]
pub struct Spr {
    network: VariableId,
    allow_sister: bool,
}

impl Spr {
    pub fn new(network: VariableId) -> Self {
        Self {
            network,
            allow_sister: false,
        }
    }

    pub fn allow_sister_admixture(mut self, allow: bool) -> Self {
        self.allow_sister = allow;
        self
    }
}

impl Proposal for Spr {
    fn name(&self) -> &str {
        "spr"
    }

    fn network(&self) -> Option<VariableId> {
        Some(self.network)
    }

    fn variables(&self) -> Vec<VariableId> {
        Vec::new()
    }

    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RandomSource) -> Result<Outcome> {
        let net = graph.network_mut(self.network)?;
        let prune = match pick_prune(net, rng) {
            Ok(p) => p,
            Err(reason) => return Ok(Outcome::Failed(reason)),
        };
        let targets = regraft_targets(net, &prune);
        if targets.is_empty() {
            return Ok(Outcome::Failed(Failure::NoReattachmentPoint));
        }
        let (target, upper) = targets[rng.uniform_index(targets.len())];
        let floor = net.age(prune.moving);
        let lower = floor.max(net.age(target));
        let window_fwd = upper - lower;
        let window_rev = net.age(prune.old_parent) - floor.max(net.age(prune.sibling));
        if !(window_fwd > 0.0 && window_rev > 0.0) {
            return Ok(Outcome::Failed(Failure::EmptyAgeWindow));
        }
        let age = lower + rng.uniform01() * window_fwd;
        if !(lower < age && age < upper) {
            return Ok(Outcome::Failed(Failure::DegenerateDraw));
        }

        if net.prune_and_regraft(prune.node, prune.moving, target, age).is_err() {
            return Ok(Outcome::Failed(Failure::InvalidSplice));
        }
        if let Err(reason) = check_admixture(net, self.allow_sister) {
            return Ok(Outcome::Failed(reason));
        }
        Ok(Outcome::Proposed(window_fwd.ln() - window_rev.ln()))
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::super::{Move, MoveState};
    use super::*;
    use crate::network::AdmixtureNetwork;
    use crate::random::SeededRandom;

    fn tip_sets(net: &AdmixtureNetwork) -> Vec<Vec<String>> {
        let mut clades: Vec<Vec<String>> = net
            .divergence_nodes()
            .into_iter()
            .map(|n| {
                let mut names: Vec<String> = net
                    .descendant_tips(n)
                    .into_iter()
                    .filter_map(|t| net.node(t).name.clone())
                    .collect();
                names.sort();
                names
            })
            .collect();
        clades.sort();
        clades
    }

    #[test]
    fn nni_swaps_neighbours() {
        let mut model = Model::six_taxa(&[]);
        let before = tip_sets(model.network());
        let mut mv = Move::new(model.nni(), 1.0);
        let mut rng = SeededRandom::new(3);
        let mut changed = 0;
        for _ in 0..40 {
            let ln = mv.perform(&mut model.graph, &mut rng).unwrap();
            if mv.state() == MoveState::Proposed {
                assert_eq!(ln, 0.0);
                model.network().verify().unwrap();
                if tip_sets(model.network()) != before {
                    changed += 1;
                }
            }
            mv.reject(&mut model.graph);
        }
        assert!(changed > 0);
        assert_eq!(tip_sets(model.network()), before);
    }

    #[test]
    fn nni_needs_younger_uncle() {
        // Both cherries have age 1, so neither uncle is younger.
        let mut model = Model::four_taxa(&[]);
        let proposal = model.nni();
        assert_eq!(assert_reject_restores(&mut model, proposal, 4, 20), 0);
    }

    #[test]
    fn nni_respects_outgroup() {
        let mut model = Model::six_taxa(&[]);
        model
            .graph
            .network_mut(model.network)
            .unwrap()
            .set_outgroup(&["C"])
            .unwrap();
        let c = model.network().tip_by_name("C").unwrap();
        let parent = model.network().parent(c);
        let proposal = model.nni();
        let accepted = assert_accept_keeps_valid(&mut model, proposal, 6, 50);
        assert!(accepted > 0);
        // No other lineage is outgroup, so C never trades places.
        assert_eq!(model.network().parent(c), parent);
    }

    #[test]
    fn fnpr_keeps_ages() {
        let mut model = Model::six_taxa(&[]);
        let ages: Vec<f64> = {
            let mut a: Vec<f64> = model.network().nodes().map(|n| n.age).collect();
            a.sort_by(f64::total_cmp);
            a
        };
        let proposal = model.fnpr();
        let accepted = assert_accept_keeps_valid(&mut model, proposal, 10, 100);
        assert!(accepted > 0);
        let mut after: Vec<f64> = model.network().nodes().map(|n| n.age).collect();
        after.sort_by(f64::total_cmp);
        assert_eq!(ages, after);
    }

    #[test]
    fn fnpr_reject_is_exact_with_edges() {
        let mut model = Model::six_taxa(&[("A", "D", 0.5, 0.2), ("F", "C", 1.2, 0.1)]);
        let proposal = model.fnpr();
        let proposed = assert_reject_restores(&mut model, proposal, 15, 60);
        assert!(proposed > 0);
    }

    #[test]
    fn spr_hastings_is_window_ratio() {
        let mut model = Model::four_taxa(&[]);
        let mut mv = Move::new(model.spr(), 1.0);
        let mut rng = SeededRandom::new(0);
        for _ in 0..30 {
            let ln = mv.perform(&mut model.graph, &mut rng).unwrap();
            if mv.state() == MoveState::Proposed {
                // The old window for either cherry node is (0, 2); the new
                // one is at most the root branch's (0, 2) too.
                assert!(ln <= 1e-12);
                assert!(ln.is_finite());
            }
            mv.reject(&mut model.graph);
        }
    }

    #[test]
    fn spr_accepts_stay_valid_with_edges() {
        let mut model = Model::six_taxa(&[("A", "D", 0.5, 0.2)]);
        let proposal = model.spr();
        let accepted = assert_accept_keeps_valid(&mut model, proposal, 12, 200);
        assert!(accepted > 0);
        assert_eq!(model.event_count(), 1);
        assert_eq!(model.network().height(), 3.0);
    }

    #[test]
    fn spr_reject_is_exact() {
        let mut model = Model::six_taxa(&[("A", "D", 0.5, 0.2), ("F", "C", 1.2, 0.1)]);
        let proposal = model.spr();
        let proposed = assert_reject_restores(&mut model, proposal, 27, 60);
        assert!(proposed > 0);
    }
}
