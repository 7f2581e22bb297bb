//! Sub-algorithms shared by several proposals: taxon-pair weighting, age
//! windows and edge placement densities, the Beta slide kernel, random
//! descent along the tree, and regraft candidate search.

use cyanea_core::{CyaneaError, Result};

use super::{AdmixtureConfig, Failure, PairSampling};
use crate::dag::{ModelGraph, SquareMatrix, Value, VariableId};
use crate::network::{AdmixtureEdgePosition, AdmixtureNetwork, NodeId};
use crate::random::RandomSource;

/// Outcome of a step that can fail structurally.
pub(crate) type Draw<T> = std::result::Result<T, Failure>;

// ── Taxon pairs ─────────────────────────────────────────────────────────

/// Sampling weights over ordered (recipient, donor) tip pairs.
#[derive(Debug, Clone)]
pub(crate) struct PairWeights {
    weights: SquareMatrix,
    total: f64,
}

impl PairWeights {
    /// Every ordered pair of distinct tips equally weighted. `None` for
    /// fewer than two tips.
    pub(crate) fn uniform(n: usize) -> Option<Self> {
        if n < 2 {
            return None;
        }
        let weights = SquareMatrix::from_fn(n, |i, j| if i == j { 0.0 } else { 1.0 });
        Some(Self {
            weights,
            total: (n * (n - 1)) as f64,
        })
    }

    /// Weights `exp(delta * r_ij / max r)` on positive residuals, zero
    /// elsewhere. `None` when no off-diagonal residual is positive.
    pub(crate) fn from_residuals(residuals: &SquareMatrix, delta: f64) -> Option<Self> {
        let max = residuals.max_off_diagonal();
        if !(max > 0.0) {
            return None;
        }
        let lambda = delta / max;
        let weights = SquareMatrix::from_fn(residuals.dim(), |i, j| {
            let r = residuals.get(i, j);
            if i != j && r > 0.0 {
                (lambda * r).exp()
            } else {
                0.0
            }
        });
        let total: f64 = (0..weights.dim())
            .flat_map(|i| (0..weights.dim()).map(move |j| (i, j)))
            .map(|(i, j)| weights.get(i, j))
            .sum();
        if total > 0.0 && total.is_finite() {
            Some(Self { weights, total })
        } else {
            None
        }
    }

    pub(crate) fn probability(&self, recipient: usize, donor: usize) -> f64 {
        self.weights.get(recipient, donor) / self.total
    }

    /// Draw an ordered (recipient, donor) pair of tip indices.
    pub(crate) fn sample(&self, rng: &mut dyn RandomSource) -> (usize, usize) {
        let n = self.weights.dim();
        let target = rng.uniform01() * self.total;
        let mut acc = 0.0;
        let mut last = (0, 1);
        for i in 0..n {
            for j in 0..n {
                let w = self.weights.get(i, j);
                if w > 0.0 {
                    acc += w;
                    last = (i, j);
                    if target < acc {
                        return (i, j);
                    }
                }
            }
        }
        last
    }
}

/// Pair weights for the network's current state.
///
/// Residuals are read through the graph, so after editing the network the
/// caller must touch it first for them to be recomputed. `Ok(None)` means
/// there is no positive mass to sample from.
pub(crate) fn pair_weights(
    graph: &mut ModelGraph,
    network: VariableId,
    residuals: Option<VariableId>,
    sampling: PairSampling,
) -> Result<Option<PairWeights>> {
    let n = graph.network(network)?.tip_count();
    match (sampling, residuals) {
        (PairSampling::Uniform, _) => Ok(PairWeights::uniform(n)),
        (PairSampling::Residual { delta }, Some(r)) => {
            let matrix = graph.value(r).as_matrix()?;
            if matrix.dim() != n {
                return Err(CyaneaError::InvalidInput(format!(
                    "residual matrix is {}x{}, network has {n} tips",
                    matrix.dim(),
                    matrix.dim()
                )));
            }
            Ok(PairWeights::from_residuals(matrix, delta))
        }
        (PairSampling::Residual { .. }, None) => Err(CyaneaError::InvalidInput(
            "residual pair sampling needs a residual matrix variable".into(),
        )),
    }
}

// ── Edge placement ──────────────────────────────────────────────────────

/// Ages at which an edge between the lineages of tips `a` and `b` may sit.
///
/// The window runs from the older of the two tips to their MRCA, or, when
/// sister admixture is disallowed, to the older child of the MRCA so that
/// the two lineages never hang from the same divergence.
pub(crate) fn age_window(
    net: &AdmixtureNetwork,
    a: NodeId,
    b: NodeId,
    allow_sister: bool,
) -> Option<(f64, f64)> {
    if a == b {
        return None;
    }
    let lo = net.age(a).max(net.age(b));
    let mrca = net.mrca(a, b);
    let hi = if allow_sister {
        net.age(mrca)
    } else {
        net.children(mrca)
            .iter()
            .map(|&c| net.age(net.topology_descendant(c)))
            .fold(f64::NEG_INFINITY, f64::max)
    };
    (hi > lo).then_some((lo, hi))
}

/// Where a new admixture edge goes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Placement {
    /// Node below the admixture child (recipient lineage).
    pub child_below: NodeId,
    /// Node below the admixture parent (donor lineage).
    pub parent_below: NodeId,
    pub age: f64,
    pub weight: f64,
}

impl From<AdmixtureEdgePosition> for Placement {
    fn from(pos: AdmixtureEdgePosition) -> Self {
        Self {
            child_below: pos.child_child,
            parent_below: pos.parent_child,
            age: pos.age,
            weight: pos.weight,
        }
    }
}

/// Draw a placement the way Edge-Add does: a weighted tip pair, a
/// Beta(1, skew) age inside the pair's window and a scaled Beta weight.
pub(crate) fn draw_placement(
    net: &AdmixtureNetwork,
    weights: &PairWeights,
    config: &AdmixtureConfig,
    rng: &mut dyn RandomSource,
) -> Draw<Placement> {
    let (i, j) = weights.sample(rng);
    let (a, b) = (net.tips()[i], net.tips()[j]);
    let (lo, hi) =
        age_window(net, a, b, config.allow_sister_admixture).ok_or(Failure::EmptyAgeWindow)?;
    let age = lo + rng.beta_sample(1.0, config.age_skew) * (hi - lo);
    if !(lo < age && age < hi) {
        return Err(Failure::DegenerateDraw);
    }
    let (wa, wb) = config.weight_shape;
    let weight = config.max_weight * rng.beta_sample(wa, wb);
    if !(weight > 0.0 && weight < 0.5) {
        return Err(Failure::DegenerateDraw);
    }
    let (Some(child_below), Some(parent_below)) =
        (net.branch_at_age(a, age), net.branch_at_age(b, age))
    else {
        return Err(Failure::DegenerateDraw);
    };
    if net.is_outgroup(child_below) != net.is_outgroup(parent_below) {
        return Err(Failure::OutgroupMismatch);
    }
    Ok(Placement {
        child_below,
        parent_below,
        age,
        weight,
    })
}

/// Log density of [`draw_placement`] producing `placement` on `net`.
///
/// Sums over every tip pair whose lineages run through the two branches.
pub(crate) fn ln_add_density(
    net: &AdmixtureNetwork,
    weights: &PairWeights,
    config: &AdmixtureConfig,
    placement: &Placement,
    rng: &dyn RandomSource,
) -> f64 {
    let t = placement.age;
    let recipients = net.descendant_tips(placement.child_below);
    let donors = net.descendant_tips(placement.parent_below);
    let mut density = 0.0;
    for &a in &recipients {
        for &b in &donors {
            let (Some(i), Some(j)) = (net.tip_index(a), net.tip_index(b)) else {
                continue;
            };
            let p = weights.probability(i, j);
            if p == 0.0 {
                continue;
            }
            if let Some((lo, hi)) = age_window(net, a, b, config.allow_sister_admixture) {
                if lo < t && t < hi {
                    let x = (t - lo) / (hi - lo);
                    density += p * rng.beta_ln_pdf(1.0, config.age_skew, x).exp() / (hi - lo);
                }
            }
        }
    }
    if density > 0.0 {
        density.ln() + ln_weight_density(config, placement.weight, rng)
    } else {
        f64::NEG_INFINITY
    }
}

fn ln_weight_density(config: &AdmixtureConfig, weight: f64, rng: &dyn RandomSource) -> f64 {
    let (a, b) = config.weight_shape;
    rng.beta_ln_pdf(a, b, weight / config.max_weight) - config.max_weight.ln()
}

/// Splice a new edge in at `placement`. Returns the admixture parent.
pub(crate) fn attach_edge(net: &mut AdmixtureNetwork, placement: &Placement) -> Draw<NodeId> {
    if net.is_outgroup(placement.child_below) != net.is_outgroup(placement.parent_below) {
        return Err(Failure::OutgroupMismatch);
    }
    let parent = net.allocate_node(placement.age);
    let child = net.allocate_node(placement.age);
    net.add_admixture_edge(
        parent,
        child,
        placement.parent_below,
        placement.child_below,
        placement.age,
        placement.weight,
    )
    .map_err(|_| Failure::InvalidSplice)?;
    Ok(parent)
}

/// Cut an edge out and schedule both of its nodes for deallocation.
pub(crate) fn detach_edge(
    net: &mut AdmixtureNetwork,
    parent: NodeId,
) -> Result<AdmixtureEdgePosition> {
    let pos = net.remove_admixture_edge(parent)?;
    for n in [pos.parent, pos.child] {
        net.erase_admixture_node(n);
        net.retire(n);
    }
    Ok(pos)
}

/// Structural constraints every admixture edge must satisfy after a move:
/// both ends on the same side of the outgroup boundary and, unless allowed,
/// not hanging from the same divergence.
pub(crate) fn check_admixture(net: &AdmixtureNetwork, allow_sister: bool) -> Draw<()> {
    if !net.outgroup_consistent() {
        return Err(Failure::OutgroupMismatch);
    }
    if !allow_sister {
        for p in net.admixture_parents() {
            let Some(c) = net.admixture_child_of(p) else {
                continue;
            };
            if net.topology_parent(p) == net.topology_parent(c) {
                return Err(Failure::SisterLineages);
            }
        }
    }
    Ok(())
}

/// Admixture edges (by parent) with an end among the pass-through nodes
/// directly above `node`.
pub(crate) fn edges_above(net: &AdmixtureNetwork, node: NodeId) -> Vec<NodeId> {
    let mut edges = Vec::new();
    let mut cur = net.parent(node);
    while let Some(n) = cur {
        if !net.node(n).is_pass_through() {
            break;
        }
        edges.push(net.admixture_parent_of(n).unwrap_or(n));
        cur = net.parent(n);
    }
    edges
}

// ── Kernels ─────────────────────────────────────────────────────────────

/// Beta slide on the unit interval: `x' ~ Beta(λx + 1, λ(1 − x) + 1)`.
/// Returns `x'` and `ln q(x | x') − ln q(x' | x)`.
pub(crate) fn beta_slide(rng: &mut dyn RandomSource, x: f64, lambda: f64) -> Draw<(f64, f64)> {
    let (a, b) = (lambda * x + 1.0, lambda * (1.0 - x) + 1.0);
    let y = rng.beta_sample(a, b);
    if !(y > 0.0 && y < 1.0) {
        return Err(Failure::DegenerateDraw);
    }
    let forward = rng.beta_ln_pdf(a, b, y);
    let backward = rng.beta_ln_pdf(lambda * y + 1.0, lambda * (1.0 - y) + 1.0, x);
    Ok((y, backward - forward))
}

/// `ln Σ exp(x)`, `-inf` for an empty or all `-inf` input.
pub(crate) fn ln_sum_exp(terms: &[f64]) -> f64 {
    let max = terms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return max;
    }
    max + terms.iter().map(|&t| (t - max).exp()).sum::<f64>().ln()
}

/// Every ordering of `items`.
pub(crate) fn orderings<T: Copy>(items: &[T]) -> Vec<Vec<T>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut all = Vec::new();
    for (i, &first) in items.iter().enumerate() {
        let mut rest = items.to_vec();
        rest.remove(i);
        for mut tail in orderings(&rest) {
            tail.insert(0, first);
            all.push(tail);
        }
    }
    all
}

/// Index drawn with probability proportional to `weights`.
pub(crate) fn pick_weighted(weights: &[f64], rng: &mut dyn RandomSource) -> usize {
    let total: f64 = weights.iter().sum();
    let target = rng.uniform01() * total;
    let mut acc = 0.0;
    for (i, &w) in weights.iter().enumerate() {
        acc += w;
        if target < acc {
            return i;
        }
    }
    weights.len().saturating_sub(1)
}

/// Multiply the rates of the given branches by `exp(delta (U − ½))`.
/// Returns the log-Jacobian, `ln u` per distinct branch.
pub(crate) fn perturb_rates(
    graph: &mut ModelGraph,
    rates: &[VariableId],
    branches: &[usize],
    delta: f64,
    rng: &mut dyn RandomSource,
) -> Result<f64> {
    let mut targets: Vec<VariableId> = branches.iter().filter_map(|&b| rates.get(b).copied()).collect();
    targets.sort_unstable();
    targets.dedup();
    if targets.is_empty() {
        return Ok(0.0);
    }
    let ln_u = delta * (rng.uniform01() - 0.5);
    for &r in &targets {
        let rate = graph.real(r)?;
        graph.set_value(r, Value::Real(rate * ln_u.exp()))?;
    }
    Ok(ln_u * targets.len() as f64)
}

// ── Walking the tree ────────────────────────────────────────────────────

/// Walk down from `start` (whose branch lies above `age`), picking a child
/// uniformly at every node, until reaching the node whose branch spans
/// `age`. Returns it with the log probability of the path taken.
pub(crate) fn descend(
    net: &AdmixtureNetwork,
    start: NodeId,
    age: f64,
    rng: &mut dyn RandomSource,
) -> Draw<(NodeId, f64)> {
    let mut cur = start;
    let mut ln_p = 0.0;
    while net.age(cur) >= age {
        let children = net.children(cur);
        if children.is_empty() {
            return Err(Failure::NoReattachmentPoint);
        }
        ln_p -= (children.len() as f64).ln();
        cur = children[rng.uniform_index(children.len())];
    }
    Ok((cur, ln_p))
}

/// Log probability that [`descend`] from `top` ends at `bottom`.
pub(crate) fn descent_ln_probability(net: &AdmixtureNetwork, top: NodeId, bottom: NodeId) -> f64 {
    let mut ln_p = 0.0;
    let mut cur = bottom;
    while cur != top {
        let Some(p) = net.parent(cur) else {
            return f64::NEG_INFINITY;
        };
        ln_p -= (net.children(p).len() as f64).ln();
        cur = p;
    }
    ln_p
}

/// A divergence node pruned together with one of its children.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Prune {
    pub node: NodeId,
    pub moving: NodeId,
    pub sibling: NodeId,
    pub old_parent: NodeId,
}

/// Non-root divergence nodes.
pub(crate) fn prunable(net: &AdmixtureNetwork) -> Vec<NodeId> {
    net.divergence_nodes()
        .into_iter()
        .filter(|&n| net.parent(n).is_some())
        .collect()
}

/// Pick a prunable node uniformly and one of its children with
/// probability ½.
pub(crate) fn pick_prune(net: &AdmixtureNetwork, rng: &mut dyn RandomSource) -> Draw<Prune> {
    let candidates = prunable(net);
    if candidates.is_empty() {
        return Err(Failure::NoEligibleNode);
    }
    let node = candidates[rng.uniform_index(candidates.len())];
    let children = net.children(node);
    let k = rng.uniform_index(2);
    let old_parent = net.parent(node).ok_or(Failure::NearRoot)?;
    Ok(Prune {
        node,
        moving: children[k],
        sibling: children[1 - k],
        old_parent,
    })
}

/// Segments `prune.moving` could be regrafted onto, as seen in the network
/// with `prune.node` removed: `(target, age of the node above it)`. The
/// sibling's segment reaches up to the old parent.
pub(crate) fn regraft_targets(net: &AdmixtureNetwork, prune: &Prune) -> Vec<(NodeId, f64)> {
    let floor = net.age(prune.moving);
    net.preorder()
        .filter(|&n| n != prune.node && !net.is_ancestor(prune.moving, n))
        .filter_map(|n| {
            let parent = net.parent(n)?;
            let above = if parent == prune.node {
                prune.old_parent
            } else {
                parent
            };
            let upper = net.age(above);
            (upper > floor).then_some((n, upper))
        })
        .collect()
}
