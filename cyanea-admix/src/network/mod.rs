//! Admixture networks: binary time trees plus lateral gene-flow edges.
//!
//! Nodes live in an arena of slots addressed by [`NodeId`]. Tree nodes keep
//! their id for the lifetime of the network, and their `index` doubles as
//! the branch index for per-branch parameters (tips occupy `0..n` and are the
//! rows of the residual matrix). Admixture nodes come in pairs: an
//! admixture *parent* spliced into the donor lineage and an admixture
//! *child* spliced into the recipient lineage, at the same age, carrying the
//! same weight. Both are pass-through nodes with exactly one child.
//!
//! All surgery goes through the primitives in [`edit`](self), which record
//! their inverse while an edit is open so a rejected proposal can be undone
//! exactly.

mod edit;
pub mod newick;

use std::collections::{BTreeMap, BTreeSet};

use cyanea_core::{CyaneaError, Result, Summarizable};

pub use edit::AdmixtureEdgePosition;
use edit::Edit;

/// Index of a node slot in an [`AdmixtureNetwork`].
pub type NodeId = usize;

/// Tolerance for comparing ages read from Newick branch lengths.
const AGE_EPSILON: f64 = 1e-9;

/// A node of an admixture network.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Node {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub age: f64,
    /// Admixture proportion; meaningful on admixture nodes only.
    pub weight: f64,
    pub outgroup: bool,
    /// Branch index of tree nodes; `None` for admixture nodes.
    pub index: Option<usize>,
    pub name: Option<String>,
}

impl Node {
    fn new(id: NodeId, age: f64) -> Self {
        Self {
            id,
            parent: None,
            children: Vec::new(),
            age,
            weight: 0.0,
            outgroup: false,
            index: None,
            name: None,
        }
    }

    pub fn is_tip(&self) -> bool {
        self.children.is_empty()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// One child: an admixture node sitting on a lineage.
    pub fn is_pass_through(&self) -> bool {
        self.children.len() == 1
    }

    pub fn is_divergence(&self) -> bool {
        self.children.len() == 2
    }
}

/// An admixture network owning all of its nodes.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdmixtureNetwork {
    slots: Vec<Option<Node>>,
    free: Vec<NodeId>,
    root: NodeId,
    /// Tip node ids by tip index.
    tips: Vec<NodeId>,
    /// Nodes currently part of the network.
    registry: BTreeSet<NodeId>,
    /// Admixture parent → admixture child.
    admixture_children: BTreeMap<NodeId, NodeId>,
    /// Admixture child → admixture parent.
    admixture_parents: BTreeMap<NodeId, NodeId>,
    /// Nodes removed by the open edit, deallocated on commit.
    #[cfg_attr(feature = "serde", serde(skip))]
    retired: Vec<NodeId>,
    #[cfg_attr(feature = "serde", serde(skip))]
    journal: Option<Vec<Edit>>,
}

impl PartialEq for AdmixtureNetwork {
    fn eq(&self, other: &Self) -> bool {
        self.slots == other.slots
            && self.free == other.free
            && self.root == other.root
            && self.tips == other.tips
            && self.registry == other.registry
            && self.admixture_children == other.admixture_children
            && self.admixture_parents == other.admixture_parents
    }
}

impl AdmixtureNetwork {
    /// Assemble a network from tree nodes whose ids equal their slot index.
    ///
    /// Tips must carry `index` values `0..n`; every node must be registered.
    fn from_tree_nodes(nodes: Vec<Node>, root: NodeId) -> Result<Self> {
        let mut tips = vec![usize::MAX; nodes.iter().filter(|n| n.is_tip()).count()];
        for node in &nodes {
            if node.is_tip() {
                match node.index {
                    Some(i) if i < tips.len() => tips[i] = node.id,
                    _ => {
                        return Err(CyaneaError::InvalidInput(format!(
                            "tip {} has no valid tip index",
                            node.id
                        )))
                    }
                }
            }
        }
        if tips.contains(&usize::MAX) {
            return Err(CyaneaError::InvalidInput("tip indices are not 0..n".into()));
        }
        let registry = nodes.iter().map(|n| n.id).collect();
        let network = Self {
            slots: nodes.into_iter().map(Some).collect(),
            free: Vec::new(),
            root,
            tips,
            registry,
            admixture_children: BTreeMap::new(),
            admixture_parents: BTreeMap::new(),
            retired: Vec::new(),
            journal: None,
        };
        network.verify()?;
        Ok(network)
    }

    /// Parse a binary time tree from Newick. See [`newick::parse`].
    pub fn from_newick(input: &str) -> Result<Self> {
        newick::parse(input)
    }

    /// Extended Newick with `#H<k>` labels on admixture nodes.
    pub fn to_newick(&self) -> String {
        newick::write(self)
    }

    // ── Node access ─────────────────────────────────────────────────────

    /// Get a node by id, if the slot is allocated.
    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    /// # Panics
    ///
    /// Panics if the slot is not allocated; ids handed out by the network
    /// stay allocated until the edit that removed them is committed.
    pub fn node(&self, id: NodeId) -> &Node {
        match self.get_node(id) {
            Some(node) => node,
            None => panic!("node {id} is not allocated"),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match self.slots.get_mut(id).and_then(Option::as_mut) {
            Some(node) => node,
            None => panic!("node {id} is not allocated"),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn age(&self, id: NodeId) -> f64 {
        self.node(id).age
    }

    pub fn weight(&self, id: NodeId) -> f64 {
        self.node(id).weight
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    pub fn is_outgroup(&self, id: NodeId) -> bool {
        self.node(id).outgroup
    }

    /// Height of the network (age of the root).
    pub fn height(&self) -> f64 {
        self.age(self.root)
    }

    /// Number of nodes currently in the network.
    pub fn node_count(&self) -> usize {
        self.registry.len()
    }

    pub fn tip_count(&self) -> usize {
        self.tips.len()
    }

    /// Tip node ids in tip-index order.
    pub fn tips(&self) -> &[NodeId] {
        &self.tips
    }

    /// Tip index (residual matrix row) of a tip node.
    pub fn tip_index(&self, id: NodeId) -> Option<usize> {
        let node = self.node(id);
        if node.is_tip() {
            node.index
        } else {
            None
        }
    }

    pub fn tip_by_name(&self, name: &str) -> Option<NodeId> {
        self.tips
            .iter()
            .copied()
            .find(|&t| self.node(t).name.as_deref() == Some(name))
    }

    pub fn is_registered(&self, id: NodeId) -> bool {
        self.registry.contains(&id)
    }

    /// Registered nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.registry.iter().map(move |&id| self.node(id))
    }

    /// Registered nodes with two children.
    pub fn divergence_nodes(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|n| n.is_divergence())
            .map(|n| n.id)
            .collect()
    }

    // ── Admixture registry ──────────────────────────────────────────────

    /// Admixture child paired with an admixture parent.
    pub fn admixture_child_of(&self, parent: NodeId) -> Option<NodeId> {
        self.admixture_children.get(&parent).copied()
    }

    /// Admixture parent paired with an admixture child.
    pub fn admixture_parent_of(&self, child: NodeId) -> Option<NodeId> {
        self.admixture_parents.get(&child).copied()
    }

    /// The other end of the admixture edge `id` belongs to.
    pub fn partner(&self, id: NodeId) -> Option<NodeId> {
        self.admixture_child_of(id)
            .or_else(|| self.admixture_parent_of(id))
    }

    pub fn is_admixture_node(&self, id: NodeId) -> bool {
        self.partner(id).is_some()
    }

    /// Registered admixture parents, one per admixture edge, in id order.
    pub fn admixture_parents(&self) -> Vec<NodeId> {
        self.admixture_children
            .keys()
            .copied()
            .filter(|p| self.registry.contains(p))
            .collect()
    }

    /// Number of admixture edges in the network.
    pub fn admixture_event_count(&self) -> usize {
        self.admixture_parents().len()
    }

    /// Admixture parents whose own edge end and whose partner both hang
    /// directly below a divergence node, i.e. the topmost event on each of
    /// the two lineages.
    pub fn first_admixture_parent_per_lineage(&self) -> Vec<NodeId> {
        self.admixture_parents()
            .into_iter()
            .filter(|&p| {
                let Some(c) = self.admixture_child_of(p) else {
                    return false;
                };
                let below_divergence =
                    |n: NodeId| self.parent(n).is_some_and(|q| self.node(q).is_divergence());
                below_divergence(p) && below_divergence(c)
            })
            .collect()
    }

    // ── Structural queries ──────────────────────────────────────────────

    /// First node at or below `id` that is not a pass-through node.
    pub fn topology_descendant(&self, id: NodeId) -> NodeId {
        let mut cur = id;
        while self.node(cur).is_pass_through() {
            cur = self.node(cur).children[0];
        }
        cur
    }

    /// First ancestor of `id` that is not a pass-through node.
    pub fn topology_parent(&self, id: NodeId) -> Option<NodeId> {
        let mut cur = self.parent(id)?;
        while self.node(cur).is_pass_through() {
            cur = self.parent(cur)?;
        }
        Some(cur)
    }

    /// Index of the tree branch `id` sits on.
    pub fn branch_index(&self, id: NodeId) -> Option<usize> {
        self.node(self.topology_descendant(id)).index
    }

    /// `id` and all of its ancestors, root last.
    pub fn path_to_root(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = vec![id];
        let mut cur = id;
        while let Some(p) = self.parent(cur) {
            path.push(p);
            cur = p;
        }
        path
    }

    /// Whether `ancestor` is `node` or lies on its path to the root.
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cur = Some(node);
        while let Some(c) = cur {
            if c == ancestor {
                return true;
            }
            cur = self.parent(c);
        }
        false
    }

    /// Most recent common ancestor along topology edges.
    pub fn mrca(&self, a: NodeId, b: NodeId) -> NodeId {
        let ancestors_a: BTreeSet<NodeId> = self.path_to_root(a).into_iter().collect();
        let mut cur = b;
        loop {
            if ancestors_a.contains(&cur) {
                return cur;
            }
            match self.parent(cur) {
                Some(p) => cur = p,
                None => return self.root,
            }
        }
    }

    /// Tips below `id` (inclusive), left to right.
    pub fn descendant_tips(&self, id: NodeId) -> Vec<NodeId> {
        let mut tips = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            let node = self.node(n);
            if node.is_tip() {
                tips.push(n);
            }
            stack.extend(node.children.iter().rev());
        }
        tips
    }

    /// Node whose branch, on the path from `from` to the root, spans `age`
    /// strictly: `age(node) < age < age(parent)`.
    pub fn branch_at_age(&self, from: NodeId, age: f64) -> Option<NodeId> {
        let mut cur = from;
        while let Some(p) = self.parent(cur) {
            if self.age(cur) < age && age < self.age(p) {
                return Some(cur);
            }
            cur = p;
        }
        None
    }

    /// All branches (segments between adjacent nodes) crossing `age`,
    /// skipping the subtree rooted at `exclude`.
    pub fn branches_crossing(&self, age: f64, exclude: Option<NodeId>) -> Vec<NodeId> {
        self.preorder()
            .filter(|&n| !exclude.is_some_and(|x| self.is_ancestor(x, n)))
            .filter(|&n| {
                self.parent(n)
                    .is_some_and(|p| self.age(n) < age && age < self.age(p))
            })
            .collect()
    }

    /// Tree branches (between topology nodes, ignoring admixture nodes)
    /// crossing `age`, skipping the subtree rooted at `exclude`.
    pub fn topology_branches_crossing(&self, age: f64, exclude: Option<NodeId>) -> Vec<NodeId> {
        self.preorder()
            .filter(|&n| !self.node(n).is_pass_through())
            .filter(|&n| !exclude.is_some_and(|x| self.is_ancestor(x, n)))
            .filter(|&n| {
                self.topology_parent(n)
                    .is_some_and(|p| self.age(n) < age && age < self.age(p))
            })
            .collect()
    }

    /// Sum of all branch segment lengths.
    pub fn tree_length(&self) -> f64 {
        self.nodes()
            .filter_map(|n| n.parent.map(|p| self.age(p) - n.age))
            .sum()
    }

    /// Tree length in units of the root age.
    pub fn unit_tree_length(&self) -> f64 {
        self.tree_length() / self.height()
    }

    /// Preorder traversal from the root (children left to right).
    pub fn preorder(&self) -> PreorderIter<'_> {
        PreorderIter {
            network: self,
            stack: vec![self.root],
        }
    }

    // ── Configuration helpers ───────────────────────────────────────────

    /// Flag the named tips as outgroup and propagate: an internal node is
    /// outgroup when all of its descendants are, admixture nodes follow the
    /// lineage they sit on.
    pub fn set_outgroup(&mut self, names: &[&str]) -> Result<()> {
        let mut flagged = BTreeSet::new();
        for name in names {
            match self.tip_by_name(name) {
                Some(t) => {
                    flagged.insert(t);
                }
                None => {
                    return Err(CyaneaError::InvalidInput(format!("unknown tip '{name}'")));
                }
            }
        }
        let order: Vec<NodeId> = self.preorder().collect();
        for &n in order.iter().rev() {
            let flag = if self.node(n).is_tip() {
                flagged.contains(&n)
            } else {
                self.children(n).iter().all(|&c| self.node(c).outgroup)
            };
            self.node_mut(n).outgroup = flag;
        }
        Ok(())
    }

    /// Place an admixture edge at `age` on the lineages above `donor` and
    /// `recipient`, with the given weight. Returns (parent, child).
    pub fn insert_admixture_edge(
        &mut self,
        donor: NodeId,
        recipient: NodeId,
        age: f64,
        weight: f64,
    ) -> Result<(NodeId, NodeId)> {
        let (Some(pc), Some(cc)) = (
            self.branch_at_age(donor, age),
            self.branch_at_age(recipient, age),
        ) else {
            return Err(CyaneaError::InvalidInput(format!(
                "no branch crosses age {age} above nodes {donor} and {recipient}"
            )));
        };
        let parent = self.allocate_node(age);
        let child = self.allocate_node(age);
        if let Err(e) = self.add_admixture_edge(parent, child, pc, cc, age, weight) {
            self.discard_unattached(&[child, parent]);
            return Err(e);
        }
        Ok((parent, child))
    }

    // ── Consistency ─────────────────────────────────────────────────────

    /// Check every structural invariant of the network.
    pub fn verify(&self) -> Result<()> {
        let fail = |msg: String| Err(CyaneaError::Invariant(msg));

        if !self.registry.contains(&self.root) {
            return fail(format!("root {} is not registered", self.root));
        }
        if self.node(self.root).parent.is_some() {
            return fail(format!("root {} has a parent", self.root));
        }
        let reachable: BTreeSet<NodeId> = self.preorder().collect();
        if reachable != self.registry {
            return fail("registry does not match the nodes reachable from the root".into());
        }
        for (i, &t) in self.tips.iter().enumerate() {
            let node = self.node(t);
            if !node.is_tip() || node.index != Some(i) {
                return fail(format!("tip table entry {i} points at node {t}"));
            }
        }

        for node in self.nodes() {
            if node.children.len() > 2 {
                return fail(format!("node {} has {} children", node.id, node.children.len()));
            }
            for &c in &node.children {
                let child = self.node(c);
                if child.parent != Some(node.id) {
                    return fail(format!("node {c} does not point back to parent {}", node.id));
                }
                if !(child.age < node.age) {
                    return fail(format!(
                        "node {c} (age {}) is not younger than its parent {} (age {})",
                        child.age, node.id, node.age
                    ));
                }
            }
            let admixture = self.is_admixture_node(node.id);
            if node.is_pass_through() != admixture {
                return fail(format!(
                    "node {} has one child but is not an admixture node, or vice versa",
                    node.id
                ));
            }
            if admixture && node.parent.is_none() {
                return fail(format!("admixture node {} has no parent", node.id));
            }
            if node.is_tip() && node.index.is_none() {
                return fail(format!("tip {} has no index", node.id));
            }
        }

        for (&p, &c) in &self.admixture_children {
            if !self.registry.contains(&p) && !self.registry.contains(&c) {
                continue;
            }
            if !(self.registry.contains(&p) && self.registry.contains(&c)) {
                return fail(format!("admixture pair ({p}, {c}) is half registered"));
            }
            if self.admixture_parents.get(&c) != Some(&p) {
                return fail(format!("admixture pair ({p}, {c}) is not mirrored"));
            }
            let (pn, cn) = (self.node(p), self.node(c));
            if pn.age != cn.age {
                return fail(format!("admixture pair ({p}, {c}) has unequal ages"));
            }
            if pn.weight != cn.weight || !(cn.weight > 0.0 && cn.weight < 0.5) {
                return fail(format!(
                    "admixture pair ({p}, {c}) has invalid weight {}",
                    cn.weight
                ));
            }
            if pn.outgroup != cn.outgroup {
                return fail(format!("admixture pair ({p}, {c}) crosses the outgroup"));
            }
        }
        Ok(())
    }
}

impl Summarizable for AdmixtureNetwork {
    fn summary(&self) -> String {
        format!(
            "AdmixtureNetwork: {} nodes ({} tips, {} admixture events), height {:.4}",
            self.node_count(),
            self.tip_count(),
            self.admixture_event_count(),
            self.height()
        )
    }
}

/// Preorder iterator over node ids.
pub struct PreorderIter<'a> {
    network: &'a AdmixtureNetwork,
    stack: Vec<NodeId>,
}

impl<'a> Iterator for PreorderIter<'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        for &child in self.network.node(id).children.iter().rev() {
            self.stack.push(child);
        }
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn four_taxa() -> AdmixtureNetwork {
        AdmixtureNetwork::from_newick("((A:1,B:1):1,(C:1,D:1):1);").unwrap()
    }

    fn tip(net: &AdmixtureNetwork, name: &str) -> NodeId {
        net.tip_by_name(name).unwrap()
    }

    #[test]
    fn ages_from_branch_lengths() {
        let net = four_taxa();
        assert_eq!(net.tip_count(), 4);
        assert_eq!(net.node_count(), 7);
        assert_eq!(net.height(), 2.0);
        let ab = net.parent(tip(&net, "A")).unwrap();
        assert_eq!(net.age(ab), 1.0);
        assert_eq!(net.age(tip(&net, "D")), 0.0);
        assert!((net.tree_length() - 6.0).abs() < 1e-12);
        assert!((net.unit_tree_length() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn mrca_and_paths() {
        let net = four_taxa();
        let (a, b, c) = (tip(&net, "A"), tip(&net, "B"), tip(&net, "C"));
        assert_eq!(net.mrca(a, b), net.parent(a).unwrap());
        assert_eq!(net.mrca(a, c), net.root());
        assert_eq!(net.path_to_root(a).len(), 3);
        assert!(net.is_ancestor(net.root(), c));
        assert!(!net.is_ancestor(a, b));
    }

    #[test]
    fn branches_crossing_an_age() {
        let net = four_taxa();
        assert_eq!(net.branches_crossing(0.5, None).len(), 4);
        assert_eq!(net.branches_crossing(1.5, None).len(), 2);
        let ab = net.parent(tip(&net, "A")).unwrap();
        assert_eq!(net.branches_crossing(0.5, Some(ab)).len(), 2);
    }

    #[test]
    fn insert_edge_splices_pass_through_nodes() {
        let mut net = four_taxa();
        let (a, c) = (tip(&net, "A"), tip(&net, "C"));
        let (p, ch) = net.insert_admixture_edge(a, c, 0.5, 0.2).unwrap();
        net.verify().unwrap();
        assert_eq!(net.admixture_event_count(), 1);
        assert_eq!(net.node_count(), 9);
        assert_eq!(net.children(p), &[a]);
        assert_eq!(net.children(ch), &[c]);
        assert_eq!(net.partner(ch), Some(p));
        assert_eq!(net.topology_descendant(p), a);
        assert_eq!(net.branch_index(ch), net.node(c).index);
        assert_eq!(net.topology_parent(a), net.parent(p));
        assert_eq!(net.first_admixture_parent_per_lineage(), vec![p]);
        // Segments crossing 0.25 are still the four tip branches.
        assert_eq!(net.branches_crossing(0.25, None).len(), 4);
        assert_eq!(net.topology_branches_crossing(0.75, None).len(), 4);
    }

    #[test]
    fn insert_edge_rejects_bad_ages() {
        let mut net = four_taxa();
        let before = net.clone();
        let (a, c) = (tip(&net, "A"), tip(&net, "C"));
        assert!(net.insert_admixture_edge(a, c, 2.5, 0.2).is_err());
        assert!(net.insert_admixture_edge(a, c, 0.5, 0.7).is_err());
        assert_eq!(net, before);
    }

    #[test]
    fn outgroup_propagates() {
        let mut net = four_taxa();
        net.set_outgroup(&["C", "D"]).unwrap();
        let cd = net.parent(tip(&net, "C")).unwrap();
        assert!(net.is_outgroup(cd));
        assert!(!net.is_outgroup(net.root()));
        let (a, c) = (tip(&net, "A"), tip(&net, "C"));
        assert!(net.insert_admixture_edge(a, c, 0.5, 0.2).is_ok());
        assert!(net.verify().is_err());
        assert!(net.set_outgroup(&["Z"]).is_err());
    }

    #[test]
    fn summary_format() {
        let net = four_taxa();
        assert_eq!(
            net.summary(),
            "AdmixtureNetwork: 7 nodes (4 tips, 0 admixture events), height 2.0000"
        );
    }
}
