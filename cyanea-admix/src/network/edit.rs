//! Journaled surgery primitives.
//!
//! While an edit is open (`begin_edit`), every primitive pushes the inverse
//! of what it changed onto the journal. `rollback_edit` replays the journal
//! backwards, leaving the network equal to its state at `begin_edit`;
//! `commit_edit` drops the journal and deallocates retired nodes. Outside an
//! edit the primitives apply directly.

use cyanea_core::{CyaneaError, Result};

use super::{AdmixtureNetwork, Node, NodeId};

/// One reversible change to the network.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Edit {
    Parent { node: NodeId, old: Option<NodeId> },
    Children { node: NodeId, old: Vec<NodeId> },
    Age { node: NodeId, old: f64 },
    Weight { node: NodeId, old: f64 },
    Outgroup { node: NodeId, old: bool },
    Allocate { node: NodeId, reused: bool },
    Register { node: NodeId },
    Unregister { node: NodeId },
    Pair { parent: NodeId, child: NodeId },
    Retire { node: NodeId },
}

/// Where an admixture edge sat before it was cut out of the network.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdmixtureEdgePosition {
    pub parent: NodeId,
    pub child: NodeId,
    /// Node directly below the admixture parent.
    pub parent_child: NodeId,
    /// Node directly below the admixture child.
    pub child_child: NodeId,
    pub age: f64,
    pub weight: f64,
}

impl AdmixtureNetwork {
    // ── Edit transactions ───────────────────────────────────────────────

    /// Open an edit.
    ///
    /// # Panics
    ///
    /// Panics if an edit is already open.
    pub fn begin_edit(&mut self) {
        if self.journal.is_some() {
            panic!("network edit already in progress");
        }
        self.journal = Some(Vec::new());
    }

    pub fn is_editing(&self) -> bool {
        self.journal.is_some()
    }

    /// Close the open edit, deallocating retired nodes. Returns how many
    /// nodes were deallocated.
    pub fn commit_edit(&mut self) -> usize {
        self.journal = None;
        let retired = std::mem::take(&mut self.retired);
        for &id in &retired {
            self.deallocate(id);
        }
        retired.len()
    }

    /// Undo every change made since `begin_edit`. No-op without an open edit.
    pub fn rollback_edit(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        for edit in journal.into_iter().rev() {
            self.undo(edit);
        }
    }

    /// Position in the open edit to return to with
    /// [`rollback_to`](Self::rollback_to). Zero outside an edit.
    pub fn edit_mark(&self) -> usize {
        self.journal.as_ref().map_or(0, Vec::len)
    }

    /// Undo the changes made after `mark`, keeping the edit open.
    pub fn rollback_to(&mut self, mark: usize) {
        let tail = match self.journal.as_mut() {
            Some(journal) if mark < journal.len() => journal.split_off(mark),
            _ => return,
        };
        for edit in tail.into_iter().rev() {
            self.undo(edit);
        }
    }

    fn record(&mut self, edit: Edit) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(edit);
        }
    }

    fn undo(&mut self, edit: Edit) {
        match edit {
            Edit::Parent { node, old } => self.node_mut(node).parent = old,
            Edit::Children { node, old } => self.node_mut(node).children = old,
            Edit::Age { node, old } => self.node_mut(node).age = old,
            Edit::Weight { node, old } => self.node_mut(node).weight = old,
            Edit::Outgroup { node, old } => self.node_mut(node).outgroup = old,
            Edit::Allocate { node, reused } => {
                if reused {
                    self.slots[node] = None;
                    self.free.push(node);
                } else {
                    // LIFO replay: a fresh slot is always the last one.
                    self.slots.pop();
                }
            }
            Edit::Register { node } => {
                self.registry.remove(&node);
            }
            Edit::Unregister { node } => {
                self.registry.insert(node);
            }
            Edit::Pair { parent, child } => {
                self.admixture_children.remove(&parent);
                self.admixture_parents.remove(&child);
            }
            Edit::Retire { node } => self.retired.retain(|&r| r != node),
        }
    }

    fn deallocate(&mut self, id: NodeId) {
        if let Some(c) = self.admixture_children.remove(&id) {
            self.admixture_parents.remove(&c);
        }
        if let Some(p) = self.admixture_parents.remove(&id) {
            self.admixture_children.remove(&p);
        }
        self.registry.remove(&id);
        self.slots[id] = None;
        self.free.push(id);
    }

    // ── Field setters ───────────────────────────────────────────────────

    pub fn set_age(&mut self, id: NodeId, age: f64) {
        let old = self.node(id).age;
        self.record(Edit::Age { node: id, old });
        self.node_mut(id).age = age;
    }

    pub fn set_weight(&mut self, id: NodeId, weight: f64) {
        let old = self.node(id).weight;
        self.record(Edit::Weight { node: id, old });
        self.node_mut(id).weight = weight;
    }

    pub fn set_outgroup_flag(&mut self, id: NodeId, outgroup: bool) {
        let old = self.node(id).outgroup;
        if old != outgroup {
            self.record(Edit::Outgroup { node: id, old });
            self.node_mut(id).outgroup = outgroup;
        }
    }

    fn set_parent(&mut self, id: NodeId, parent: Option<NodeId>) {
        let old = self.node(id).parent;
        self.record(Edit::Parent { node: id, old });
        self.node_mut(id).parent = parent;
    }

    fn set_children(&mut self, id: NodeId, children: Vec<NodeId>) {
        let old = std::mem::replace(&mut self.node_mut(id).children, children);
        self.record(Edit::Children { node: id, old });
    }

    /// Swap `old` for `new` in the child list of `parent`, keeping its
    /// position. Returns false if `old` is not a child of `parent`.
    fn replace_child(&mut self, parent: NodeId, old: NodeId, new: NodeId) -> bool {
        let Some(pos) = self.children(parent).iter().position(|&c| c == old) else {
            return false;
        };
        let mut children = self.children(parent).to_vec();
        children[pos] = new;
        self.set_children(parent, children);
        true
    }

    // ── Allocation and registry ─────────────────────────────────────────

    /// Allocate a detached, unregistered node, reusing a free slot if any.
    pub fn allocate_node(&mut self, age: f64) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(Node::new(id, age));
                self.record(Edit::Allocate { node: id, reused: true });
                id
            }
            None => {
                let id = self.slots.len();
                self.slots.push(Some(Node::new(id, age)));
                self.record(Edit::Allocate { node: id, reused: false });
                id
            }
        }
    }

    /// Give back nodes allocated for an edge that could not be placed.
    pub(crate) fn discard_unattached(&mut self, ids: &[NodeId]) {
        for &id in ids {
            if self.journal.is_some() {
                self.retire(id);
            } else if id + 1 == self.slots.len() {
                self.slots.pop();
            } else {
                self.slots[id] = None;
                self.free.push(id);
            }
        }
    }

    /// Add a node to the registry of live nodes.
    pub fn push_admixture_node(&mut self, id: NodeId) {
        if self.registry.insert(id) {
            self.record(Edit::Register { node: id });
        }
    }

    /// Drop a node from the registry of live nodes. Its slot stays
    /// allocated until it is deallocated.
    pub fn erase_admixture_node(&mut self, id: NodeId) {
        if self.registry.remove(&id) {
            self.record(Edit::Unregister { node: id });
        }
    }

    fn pair(&mut self, parent: NodeId, child: NodeId) {
        if self.admixture_children.get(&parent) == Some(&child) {
            return;
        }
        self.admixture_children.insert(parent, child);
        self.admixture_parents.insert(child, parent);
        self.record(Edit::Pair { parent, child });
    }

    /// Schedule a node for deallocation when the open edit commits.
    pub fn retire(&mut self, id: NodeId) {
        if !self.retired.contains(&id) {
            self.retired.push(id);
            self.record(Edit::Retire { node: id });
        }
    }

    // ── Admixture edges ─────────────────────────────────────────────────

    /// Cut the admixture edge that `id` (either end) belongs to out of the
    /// network. The two nodes stay paired, allocated and registered; callers
    /// erase and retire them as needed.
    pub fn remove_admixture_edge(&mut self, id: NodeId) -> Result<AdmixtureEdgePosition> {
        let parent = self.admixture_parent_of(id).unwrap_or(id);
        let Some(child) = self.admixture_child_of(parent) else {
            return Err(CyaneaError::InvalidInput(format!(
                "node {id} is not an admixture node"
            )));
        };
        for n in [parent, child] {
            let node = self.node(n);
            if !node.is_pass_through() || node.parent.is_none() {
                return Err(CyaneaError::Invariant(format!(
                    "admixture node {n} is not spliced into a lineage"
                )));
            }
        }
        let position = AdmixtureEdgePosition {
            parent,
            child,
            parent_child: self.children(parent)[0],
            child_child: self.children(child)[0],
            age: self.age(child),
            weight: self.weight(child),
        };
        self.excise(parent);
        self.excise(child);
        Ok(position)
    }

    fn excise(&mut self, id: NodeId) {
        let below = self.children(id)[0];
        let above = self.parent(id);
        if let Some(above) = above {
            self.replace_child(above, id, below);
        }
        self.set_parent(below, above);
        self.set_parent(id, None);
        self.set_children(id, Vec::new());
    }

    /// Splice detached nodes `parent` and `child` into the branches above
    /// `parent_child` and `child_child` at `age`, pair and register them.
    ///
    /// Nothing is changed when the placement is invalid.
    pub fn add_admixture_edge(
        &mut self,
        parent: NodeId,
        child: NodeId,
        parent_child: NodeId,
        child_child: NodeId,
        age: f64,
        weight: f64,
    ) -> Result<()> {
        let invalid = |msg: String| Err(CyaneaError::InvalidInput(msg));
        if parent == child || parent_child == child_child {
            return invalid("admixture edge ends must be distinct".into());
        }
        for n in [parent, child] {
            let node = self.node(n);
            if node.parent.is_some() || !node.children.is_empty() {
                return invalid(format!("node {n} is still attached"));
            }
        }
        if self
            .partner(parent)
            .is_some_and(|p| p != child)
            || self.partner(child).is_some_and(|p| p != parent)
        {
            return invalid(format!("nodes {parent} and {child} belong to other edges"));
        }
        if !(weight > 0.0 && weight < 0.5) {
            return invalid(format!("admixture weight {weight} outside (0, 0.5)"));
        }
        for below in [parent_child, child_child] {
            if !self.registry.contains(&below) {
                return invalid(format!("node {below} is not in the network"));
            }
            let Some(above) = self.parent(below) else {
                return invalid(format!("node {below} has no branch above it"));
            };
            if !(self.age(below) < age && age < self.age(above)) {
                return invalid(format!(
                    "age {age} is outside the branch above node {below}"
                ));
            }
        }

        for n in [parent, child] {
            self.set_age(n, age);
            self.set_weight(n, weight);
        }
        self.pair(parent, child);
        self.push_admixture_node(parent);
        self.push_admixture_node(child);
        self.splice_above(parent, parent_child);
        self.splice_above(child, child_child);
        let (pg, cg) = (self.is_outgroup(parent_child), self.is_outgroup(child_child));
        self.set_outgroup_flag(parent, pg);
        self.set_outgroup_flag(child, cg);
        Ok(())
    }

    fn splice_above(&mut self, node: NodeId, below: NodeId) {
        if let Some(above) = self.parent(below) {
            self.replace_child(above, below, node);
            self.set_parent(node, Some(above));
        }
        self.set_children(node, vec![below]);
        self.set_parent(below, Some(node));
    }

    // ── Topology ────────────────────────────────────────────────────────

    /// Prune divergence node `p` together with its child `moving`, then
    /// regraft it onto the branch above `target` at `age`. `p`'s other child
    /// takes its old place.
    ///
    /// Nothing is changed when the move is invalid.
    pub fn prune_and_regraft(
        &mut self,
        p: NodeId,
        moving: NodeId,
        target: NodeId,
        age: f64,
    ) -> Result<()> {
        let invalid = |msg: String| Err(CyaneaError::InvalidInput(msg));
        let Some(old_parent) = self.parent(p) else {
            return invalid(format!("cannot prune the root {p}"));
        };
        if !self.node(p).is_divergence() || !self.children(p).contains(&moving) {
            return invalid(format!("node {moving} is not a child of divergence node {p}"));
        }
        let sibling = if self.children(p)[0] == moving {
            self.children(p)[1]
        } else {
            self.children(p)[0]
        };
        if target == p || !self.registry.contains(&target) || self.is_ancestor(moving, target) {
            return invalid(format!("cannot regraft node {p} above node {target}"));
        }
        let new_parent = if target == sibling {
            Some(old_parent)
        } else {
            self.parent(target)
        };
        let Some(new_parent) = new_parent else {
            return invalid(format!("node {target} has no branch above it"));
        };
        if !(self.age(moving) < age && self.age(target) < age && age < self.age(new_parent)) {
            return invalid(format!("age {age} does not fit the regraft branch"));
        }

        self.set_age(p, age);
        self.replace_child(old_parent, p, sibling);
        self.set_parent(sibling, Some(old_parent));

        let above = self.parent(target).unwrap_or(old_parent);
        self.replace_child(above, target, p);
        self.set_parent(p, Some(above));
        let children: Vec<NodeId> = self
            .children(p)
            .iter()
            .map(|&c| if c == sibling { target } else { c })
            .collect();
        self.set_children(p, children);
        self.set_parent(target, Some(p));

        self.refresh_outgroup_upwards(p);
        self.refresh_outgroup_upwards(old_parent);
        Ok(())
    }

    /// Exchange the parents of two nodes. Ages are left alone.
    pub fn exchange_subtrees(&mut self, a: NodeId, b: NodeId) -> Result<()> {
        let (Some(pa), Some(pb)) = (self.parent(a), self.parent(b)) else {
            return Err(CyaneaError::InvalidInput("cannot exchange the root".into()));
        };
        if pa == pb || self.is_ancestor(a, b) || self.is_ancestor(b, a) {
            return Err(CyaneaError::InvalidInput(format!(
                "nodes {a} and {b} cannot be exchanged"
            )));
        }
        if !(self.age(a) < self.age(pb) && self.age(b) < self.age(pa)) {
            return Err(CyaneaError::InvalidInput(format!(
                "exchanging nodes {a} and {b} breaks age order"
            )));
        }
        self.replace_child(pa, a, b);
        self.replace_child(pb, b, a);
        self.set_parent(a, Some(pb));
        self.set_parent(b, Some(pa));
        self.refresh_outgroup_upwards(pa);
        self.refresh_outgroup_upwards(pb);
        Ok(())
    }

    /// Recompute outgroup flags of tree nodes from `from` up to the root.
    /// Admixture nodes keep theirs; a change there shows up as a mismatch
    /// across the edge.
    fn refresh_outgroup_upwards(&mut self, from: NodeId) {
        let mut cur = Some(from);
        while let Some(n) = cur {
            if self.node(n).is_divergence() {
                let flag = self.children(n).iter().all(|&c| self.is_outgroup(c));
                self.set_outgroup_flag(n, flag);
            }
            cur = self.parent(n);
        }
    }

    /// Whether every admixture edge joins nodes with equal outgroup flags
    /// and sits on lineages with those same flags.
    pub fn outgroup_consistent(&self) -> bool {
        self.admixture_parents().into_iter().all(|p| {
            let Some(c) = self.admixture_child_of(p) else {
                return false;
            };
            let flag = self.is_outgroup(p);
            flag == self.is_outgroup(c)
                && [p, c]
                    .iter()
                    .all(|&n| self.is_outgroup(self.topology_descendant(n)) == flag)
        })
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
    fn rollback_restores_removed_edge() {
        let mut net = four_taxa();
        let (a, c) = (tip(&net, "A"), tip(&net, "C"));
        let (p, _) = net.insert_admixture_edge(a, c, 0.5, 0.2).unwrap();
        let before = net.clone();

        net.begin_edit();
        let pos = net.remove_admixture_edge(p).unwrap();
        net.erase_admixture_node(pos.parent);
        net.erase_admixture_node(pos.child);
        net.retire(pos.parent);
        net.retire(pos.child);
        assert_eq!(net.admixture_event_count(), 0);
        assert_eq!(pos.parent_child, a);
        assert_eq!(pos.child_child, c);
        assert_eq!(pos.age, 0.5);
        assert_eq!(pos.weight, 0.2);
        net.rollback_edit();

        assert_eq!(net, before);
        net.verify().unwrap();
    }

    #[test]
    fn commit_deallocates_retired_nodes() {
        let mut net = four_taxa();
        let (a, c) = (tip(&net, "A"), tip(&net, "C"));
        let (p, ch) = net.insert_admixture_edge(a, c, 0.5, 0.2).unwrap();

        net.begin_edit();
        net.remove_admixture_edge(ch).unwrap();
        for n in [p, ch] {
            net.erase_admixture_node(n);
            net.retire(n);
        }
        assert_eq!(net.commit_edit(), 2);
        assert!(net.get_node(p).is_none());
        assert!(net.partner(ch).is_none());
        net.verify().unwrap();
        assert_eq!(net.node_count(), 7);

        // Freed slots are reused by the next allocation.
        let reused = net.allocate_node(0.3);
        assert_eq!(reused, ch);
    }

    #[test]
    fn rollback_of_add_releases_fresh_slots() {
        let mut net = four_taxa();
        let before = net.clone();
        let (b, d) = (tip(&net, "B"), tip(&net, "D"));
        net.begin_edit();
        let p = net.allocate_node(0.4);
        let c = net.allocate_node(0.4);
        net.add_admixture_edge(p, c, b, d, 0.4, 0.1).unwrap();
        net.verify().unwrap();
        net.rollback_edit();
        assert_eq!(net, before);
    }

    #[test]
    fn rollback_to_keeps_earlier_changes() {
        let mut net = four_taxa();
        let (a, b, c, d) = (tip(&net, "A"), tip(&net, "B"), tip(&net, "C"), tip(&net, "D"));
        let (p, _) = net.insert_admixture_edge(a, c, 0.5, 0.2).unwrap();
        let before = net.clone();

        net.begin_edit();
        net.set_weight(p, 0.3);
        let mark = net.edit_mark();
        let q = net.allocate_node(0.4);
        let r = net.allocate_node(0.4);
        net.add_admixture_edge(q, r, b, d, 0.4, 0.1).unwrap();
        net.remove_admixture_edge(p).unwrap();
        assert_eq!(net.admixture_event_count(), 1);

        net.rollback_to(mark);
        assert!(net.is_editing());
        assert_eq!(net.edit_mark(), mark);
        assert_eq!(net.admixture_event_count(), 1);
        assert_eq!(net.weight(p), 0.3);
        net.verify().unwrap();

        net.rollback_edit();
        assert_eq!(net, before);
        assert_eq!(net.edit_mark(), 0);
    }

    #[test]
    fn invalid_add_changes_nothing() {
        let mut net = four_taxa();
        let (a, b) = (tip(&net, "A"), tip(&net, "B"));
        let p = net.allocate_node(1.5);
        let c = net.allocate_node(1.5);
        let snapshot = net.clone();
        assert!(net.add_admixture_edge(p, c, a, b, 1.5, 0.2).is_err());
        assert!(net.add_admixture_edge(p, c, a, a, 0.5, 0.2).is_err());
        assert_eq!(net, snapshot);
    }

    #[test]
    fn prune_and_regraft_moves_a_cherry_member() {
        let mut net = four_taxa();
        let (a, c) = (tip(&net, "A"), tip(&net, "C"));
        let ab = net.parent(a).unwrap();
        let before = net.clone();
        net.begin_edit();
        net.prune_and_regraft(ab, a, c, 0.5).unwrap();
        net.verify().unwrap();
        assert_eq!(net.parent(a), Some(ab));
        assert_eq!(net.parent(c), Some(ab));
        assert_eq!(net.age(ab), 0.5);
        assert_eq!(net.parent(tip(&net, "B")), Some(net.root()));
        net.rollback_edit();
        assert_eq!(net, before);
    }

    #[test]
    fn regraft_onto_sibling_branch_only_changes_age() {
        let mut net = four_taxa();
        let (a, b) = (tip(&net, "A"), tip(&net, "B"));
        let ab = net.parent(a).unwrap();
        net.prune_and_regraft(ab, a, b, 0.25).unwrap();
        net.verify().unwrap();
        assert_eq!(net.parent(ab), Some(net.root()));
        assert_eq!(net.age(ab), 0.25);
        assert!(net.prune_and_regraft(net.root(), a, b, 0.5).is_err());
    }

    #[test]
    fn exchange_respects_ages() {
        let mut net = four_taxa();
        let (a, c) = (tip(&net, "A"), tip(&net, "C"));
        let ab = net.parent(a).unwrap();
        let cd = net.parent(c).unwrap();
        net.exchange_subtrees(a, c).unwrap();
        net.verify().unwrap();
        assert_eq!(net.parent(a), Some(cd));
        assert_eq!(net.parent(c), Some(ab));
        assert!(net.exchange_subtrees(ab, c).is_err());
    }

    #[test]
    #[should_panic(expected = "already in progress")]
    fn nested_edit_panics() {
        let mut net = four_taxa();
        net.begin_edit();
        net.begin_edit();
    }
}
