//! Edge-Replace-FNPR: subtree prune-regraft that strips the admixture edges
//! its rearrangement disturbs and redraws as many new ones.

use std::collections::BTreeSet;

use cyanea_core::Result;

use super::common::{
    attach_edge, check_admixture, detach_edge, draw_placement, edges_above, ln_add_density,
    ln_sum_exp, orderings, pair_weights, pick_prune, regraft_targets, Draw, Placement, Prune,
};
use super::{AdmixtureConfig, Failure, Outcome, Proposal};
use crate::dag::{ModelGraph, VariableId};
use crate::network::{AdmixtureNetwork, NodeId};
use crate::random::RandomSource;

/// Most edges a single proposal strips and redraws. The set density sums
/// over every drawing order, so the cost grows factorially.
pub const MAX_REDRAWN_EDGES: usize = 5;

/// Prunes a divergence node `p` with one child lineage `rc` and regrafts it
/// onto a uniformly chosen branch at a uniform age.
///
/// Admixture edges with an end on `p`'s own branch or on the branch from
/// `rc` up to `p` lose their anchor, so they are removed first and the same
/// number of edges is then drawn afresh with the Edge-Add kernel. The
/// reverse move strips the same two branches, so the proposal is only
/// reversible when the redrawn edges land exactly there; otherwise the
/// Hastings ratio is `-inf`.
///
/// `ln H = ln Δ_fwd − ln Δ_rev + ln Q(old) − ln Q(new)`, where `Δ` are the
/// regraft age windows and `Q(S)` is the density of drawing the edge set
/// `S` one edge at a time, summed over every order the draws could come
/// in. The choice of `p` and of the target branch is uniform over sets of
/// equal size in both directions.
#[derive(Debug, Clone)]
pub struct EdgeReplaceFnpr {
    network: VariableId,
    residuals: Option<VariableId>,
    config: AdmixtureConfig,
}

impl EdgeReplaceFnpr {
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

    /// Edges anchored on the branch above `p` or between `rc` and `p`.
    fn disturbed_edges(net: &AdmixtureNetwork, p: NodeId, rc: NodeId) -> Vec<NodeId> {
        let mut edges = edges_above(net, p);
        edges.extend(edges_above(net, rc));
        edges
    }

    /// Remove `edges` in the given order, returning the log density of
    /// adding them back in the opposite order. `-inf` when some step has
    /// no pair mass to draw from.
    fn strip(
        &self,
        graph: &mut ModelGraph,
        edges: &[NodeId],
        rng: &mut dyn RandomSource,
    ) -> Result<f64> {
        let mut ln_q = 0.0;
        for &e in edges {
            let pos = detach_edge(graph.network_mut(self.network)?, e)?;
            graph.touch(self.network);
            let Some(weights) =
                pair_weights(graph, self.network, self.residuals, self.config.pair_sampling)?
            else {
                ln_q = f64::NEG_INFINITY;
                continue;
            };
            let net = graph.network(self.network)?;
            ln_q += ln_add_density(net, &weights, &self.config, &Placement::from(pos), rng);
        }
        Ok(ln_q)
    }

    /// Remove `edges` and return the log density of drawing them as a set
    /// onto what is left: the sequential densities summed over every order.
    fn strip_set(
        &self,
        graph: &mut ModelGraph,
        edges: &[NodeId],
        rng: &mut dyn RandomSource,
    ) -> Result<f64> {
        let mark = graph.network(self.network)?.edit_mark();
        let orders = orderings(edges);
        let mut terms = Vec::with_capacity(orders.len());
        for (k, order) in orders.iter().enumerate() {
            if k > 0 {
                graph.network_mut(self.network)?.rollback_to(mark);
            }
            terms.push(self.strip(graph, order, rng)?);
        }
        Ok(ln_sum_exp(&terms))
    }

    /// Log density of drawing `edges` as a set onto the network without
    /// them. The network is left as it was.
    fn set_density(
        &self,
        graph: &mut ModelGraph,
        edges: &[NodeId],
        rng: &mut dyn RandomSource,
    ) -> Result<f64> {
        let mark = graph.network(self.network)?.edit_mark();
        let ln_q = self.strip_set(graph, edges, rng)?;
        graph.network_mut(self.network)?.rollback_to(mark);
        graph.touch(self.network);
        Ok(ln_q)
    }

    /// Draw and attach `count` new edges. Returns their parents.
    fn redraw(
        &self,
        graph: &mut ModelGraph,
        count: usize,
        rng: &mut dyn RandomSource,
    ) -> Result<Draw<Vec<NodeId>>> {
        let mut added = Vec::with_capacity(count);
        for _ in 0..count {
            graph.touch(self.network);
            let Some(weights) =
                pair_weights(graph, self.network, self.residuals, self.config.pair_sampling)?
            else {
                return Ok(Err(Failure::ZeroResidualMass));
            };
            let net = graph.network(self.network)?;
            let placement = match draw_placement(net, &weights, &self.config, rng) {
                Ok(p) => p,
                Err(reason) => return Ok(Err(reason)),
            };
            match attach_edge(graph.network_mut(self.network)?, &placement) {
                Ok(parent) => added.push(parent),
                Err(reason) => return Ok(Err(reason)),
            }
        }
        Ok(Ok(added))
    }
}

impl Proposal for EdgeReplaceFnpr {
    fn name(&self) -> &str {
        "edge-replace-fnpr"
    }

    fn network(&self) -> Option<VariableId> {
        Some(self.network)
    }

    fn variables(&self) -> Vec<VariableId> {
        Vec::new()
    }

    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RandomSource) -> Result<Outcome> {
        let net = graph.network(self.network)?;
        let picked = match pick_prune(net, rng) {
            Ok(p) => p,
            Err(reason) => return Ok(Outcome::Failed(reason)),
        };
        let p = picked.node;
        let rc = net.topology_descendant(picked.moving);
        let stripped = Self::disturbed_edges(net, p, rc);
        if stripped.len() > MAX_REDRAWN_EDGES {
            return Ok(Outcome::Failed(Failure::TooManyEdges));
        }

        let ln_reverse = self.strip_set(graph, &stripped, rng)?;

        let net = graph.network_mut(self.network)?;
        let Some(old_parent) = net.parent(p) else {
            return Ok(Outcome::Failed(Failure::NearRoot));
        };
        let prune = Prune {
            node: p,
            moving: rc,
            sibling: picked.sibling,
            old_parent,
        };
        let targets = regraft_targets(net, &prune);
        if targets.is_empty() {
            return Ok(Outcome::Failed(Failure::NoReattachmentPoint));
        }
        let (target, upper) = targets[rng.uniform_index(targets.len())];
        let lower = net.age(rc).max(net.age(target));
        let window_fwd = upper - lower;
        let window_rev = net.age(old_parent) - net.age(rc).max(net.age(prune.sibling));
        if !(window_fwd > 0.0 && window_rev > 0.0) {
            return Ok(Outcome::Failed(Failure::EmptyAgeWindow));
        }
        let age = lower + rng.uniform01() * window_fwd;
        if !(lower < age && age < upper) {
            return Ok(Outcome::Failed(Failure::DegenerateDraw));
        }
        if net.prune_and_regraft(p, rc, target, age).is_err() {
            return Ok(Outcome::Failed(Failure::InvalidSplice));
        }

        let added = match self.redraw(graph, stripped.len(), rng)? {
            Ok(d) => d,
            Err(reason) => return Ok(Outcome::Failed(reason)),
        };
        let net = graph.network(self.network)?;
        if let Err(reason) = check_admixture(net, self.config.allow_sister_admixture) {
            return Ok(Outcome::Failed(reason));
        }
        let reverse_strips: BTreeSet<NodeId> =
            Self::disturbed_edges(net, p, rc).into_iter().collect();
        if reverse_strips != added.iter().copied().collect::<BTreeSet<_>>() {
            // The reverse move would strip a different set of edges.
            return Ok(Outcome::Proposed(f64::NEG_INFINITY));
        }
        let ln_forward = self.set_density(graph, &added, rng)?;

        Ok(Outcome::Proposed(
            window_fwd.ln() - window_rev.ln() + ln_reverse - ln_forward,
        ))
    }
}
