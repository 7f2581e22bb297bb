//! Newick input and extended-Newick output for admixture networks.
//!
//! Input is a rooted binary time tree:
//! ```text
//! tree     = subtree ';'
//! subtree  = '(' subtree ',' subtree ')' label | label
//! label    = name? (':' length)?
//! ```
//! Every non-root node needs a branch length. Ages are measured back from
//! the tip farthest from the root, so non-contemporaneous tips get positive
//! ages. Output writes admixture nodes as single-child groups labelled
//! `#H<k>`, with `k` shared by the two ends of an edge.

use std::collections::BTreeMap;

use cyanea_core::{CyaneaError, Result};

use super::{AdmixtureNetwork, Node, NodeId, AGE_EPSILON};

/// A parsed node before ages and ids are assigned.
struct RawNode {
    children: Vec<usize>,
    name: Option<String>,
    length: Option<f64>,
}

/// Parse a Newick string into an [`AdmixtureNetwork`] without admixture edges.
///
/// Tips get ids and indices `0..n` in order of appearance; internal nodes
/// follow in postorder, so the root has the largest id.
pub fn parse(input: &str) -> Result<AdmixtureNetwork> {
    let mut parser = Parser::new(input.as_bytes());
    let (raw, root) = parser.parse_tree()?;

    // Depth of every raw node below the root.
    let mut depth = vec![0.0; raw.len()];
    let mut stack = vec![root];
    while let Some(n) = stack.pop() {
        for &c in &raw[n].children {
            let Some(len) = raw[c].length else {
                return Err(CyaneaError::Parse(format!(
                    "missing branch length on node {}",
                    raw[c].name.as_deref().unwrap_or("<internal>")
                )));
            };
            if !(len > 0.0) {
                return Err(CyaneaError::Parse(format!(
                    "branch length must be positive, got {len}"
                )));
            }
            depth[c] = depth[n] + len;
            stack.push(c);
        }
    }
    let max_depth = depth.iter().copied().fold(0.0, f64::max);

    // Renumber: tips in appearance order, then internal nodes in postorder.
    let mut order = Vec::with_capacity(raw.len());
    postorder(&raw, root, &mut order);
    let mut ids = vec![0; raw.len()];
    let tips: Vec<usize> = order.iter().copied().filter(|&n| raw[n].children.is_empty()).collect();
    let internals = order.iter().copied().filter(|&n| !raw[n].children.is_empty());
    for (id, n) in tips.iter().copied().chain(internals).enumerate() {
        ids[n] = id;
    }

    let mut nodes: Vec<Option<Node>> = (0..raw.len()).map(|_| None).collect();
    for (n, r) in raw.iter().enumerate() {
        if !(r.children.is_empty() || r.children.len() == 2) {
            return Err(CyaneaError::Parse(format!(
                "node with {} children; only binary trees are supported",
                r.children.len()
            )));
        }
        let mut age = max_depth - depth[n];
        if age.abs() < AGE_EPSILON {
            age = 0.0;
        }
        let id = ids[n];
        nodes[id] = Some(Node {
            id,
            parent: None,
            children: r.children.iter().map(|&c| ids[c]).collect(),
            age,
            weight: 0.0,
            outgroup: false,
            index: Some(id),
            name: r.name.clone(),
        });
    }
    let mut nodes: Vec<Node> = nodes.into_iter().flatten().collect();
    for n in 0..nodes.len() {
        for c in nodes[n].children.clone() {
            nodes[c].parent = Some(n);
        }
    }
    AdmixtureNetwork::from_tree_nodes(nodes, ids[root])
}

fn postorder(raw: &[RawNode], n: usize, out: &mut Vec<usize>) {
    for &c in &raw[n].children {
        postorder(raw, c, out);
    }
    out.push(n);
}

/// Serialize a network to extended Newick.
pub fn write(network: &AdmixtureNetwork) -> String {
    let labels: BTreeMap<NodeId, usize> = network
        .admixture_parents()
        .into_iter()
        .enumerate()
        .flat_map(|(k, p)| {
            let c = network.admixture_child_of(p);
            std::iter::once((p, k + 1)).chain(c.map(|c| (c, k + 1)))
        })
        .collect();
    let mut buf = String::new();
    write_subtree(network, network.root(), &labels, &mut buf);
    buf.push(';');
    buf
}

fn write_subtree(
    network: &AdmixtureNetwork,
    id: NodeId,
    labels: &BTreeMap<NodeId, usize>,
    buf: &mut String,
) {
    let node = network.node(id);
    if !node.children.is_empty() {
        buf.push('(');
        for (i, &child) in node.children.iter().enumerate() {
            if i > 0 {
                buf.push(',');
            }
            write_subtree(network, child, labels, buf);
        }
        buf.push(')');
    }
    if let Some(k) = labels.get(&id) {
        buf.push_str(&format!("#H{k}"));
    } else if let Some(ref name) = node.name {
        buf.push_str(name);
    }
    if let Some(p) = node.parent {
        buf.push(':');
        let s = format!("{:.10}", network.age(p) - node.age);
        let s = s.trim_end_matches('0');
        let s = s.trim_end_matches('.');
        buf.push_str(s);
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    nodes: Vec<RawNode>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            nodes: Vec::new(),
        }
    }

    fn parse_tree(&mut self) -> Result<(Vec<RawNode>, usize)> {
        self.skip_whitespace();
        let root = self.parse_subtree()?;
        self.skip_whitespace();
        if self.peek() != Some(b';') {
            return Err(CyaneaError::Parse("expected ';' at end of Newick string".into()));
        }
        self.pos += 1;
        Ok((std::mem::take(&mut self.nodes), root))
    }

    fn parse_subtree(&mut self) -> Result<usize> {
        self.skip_whitespace();
        let id = self.nodes.len();
        self.nodes.push(RawNode {
            children: Vec::new(),
            name: None,
            length: None,
        });

        if self.peek() == Some(b'(') {
            self.pos += 1;
            loop {
                let child = self.parse_subtree()?;
                self.nodes[id].children.push(child);
                self.skip_whitespace();
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b')') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(CyaneaError::Parse("expected ',' or ')' in Newick string".into())),
                }
            }
        }
        self.parse_label(id)?;
        Ok(id)
    }

    fn parse_label(&mut self, id: usize) -> Result<()> {
        self.skip_whitespace();
        let start = self.pos;
        while let Some(b) = self.peek() {
            match b {
                b':' | b',' | b')' | b'(' | b';' | b' ' | b'\t' | b'\n' | b'\r' => break,
                _ => self.pos += 1,
            }
        }
        if self.pos > start {
            let name = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
            self.nodes[id].name = Some(name);
        }
        self.skip_whitespace();
        if self.peek() == Some(b':') {
            self.pos += 1;
            self.skip_whitespace();
            let start = self.pos;
            while let Some(b'0'..=b'9' | b'.' | b'-' | b'+' | b'e' | b'E') = self.peek() {
                self.pos += 1;
            }
            let text = String::from_utf8_lossy(&self.input[start..self.pos]);
            if text.is_empty() {
                return Err(CyaneaError::Parse("expected number after ':'".into()));
            }
            let len: f64 = text
                .parse()
                .map_err(|_| CyaneaError::Parse(format!("invalid branch length: '{text}'")))?;
            self.nodes[id].length = Some(len);
        }
        Ok(())
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while let Some(b' ' | b'\t' | b'\n' | b'\r') = self.peek() {
            self.pos += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tips_are_numbered_first() {
        let net = parse("((A:1,B:1):1,(C:1,D:1):1);").unwrap();
        let names: Vec<&str> = net
            .tips()
            .iter()
            .map(|&t| net.node(t).name.as_deref().unwrap())
            .collect();
        assert_eq!(names, vec!["A", "B", "C", "D"]);
        assert_eq!(net.root(), 6);
        assert_eq!(net.tip_index(net.tips()[2]), Some(2));
    }

    #[test]
    fn non_ultrametric_tips_get_ages() {
        let net = parse("((A:2,B:1):1,C:3);").unwrap();
        assert_eq!(net.height(), 3.0);
        assert_eq!(net.age(net.tip_by_name("B").unwrap()), 1.0);
        assert_eq!(net.age(net.tip_by_name("A").unwrap()), 0.0);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse("((A:1,B:1):1,C:2)").is_err());
        assert!(parse("((A:1,B:1),C:2);").is_err());
        assert!(parse("((A:1,B:1,E:1):1,C:2);").is_err());
        assert!(parse("((A:1,B:0):1,C:2);").is_err());
        assert!(parse("((A:x,B:1):1,C:2);").is_err());
    }

    #[test]
    fn writes_admixture_labels() {
        let mut net = parse("((A:1,B:1):1,(C:1,D:1):1);").unwrap();
        let (a, c) = (net.tip_by_name("A").unwrap(), net.tip_by_name("C").unwrap());
        net.insert_admixture_edge(a, c, 0.5, 0.2).unwrap();
        assert_eq!(
            write(&net),
            "(((A:0.5)#H1:0.5,B:1):1,((C:0.5)#H1:0.5,D:1):1);"
        );
    }

    #[test]
    fn plain_tree_round_trips() {
        let text = "((A:1,B:1):1,(C:1.5,D:1.5):0.5);";
        let net = parse(text).unwrap();
        assert_eq!(write(&net), text);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn caterpillar_trees_parse_and_verify(lengths in proptest::collection::vec(0.01f64..5.0, 2..12)) {
            // Build ((((T0:l,T1:l):l,T2:l):l,...) with positive lengths.
            let mut text = format!("(T0:{},T1:{})", lengths[0], lengths[0]);
            for (i, l) in lengths.iter().enumerate().skip(1) {
                text = format!("({text}:{l},T{}:{})", i + 1, l + lengths[..i].iter().sum::<f64>());
            }
            text.push(';');
            let net = parse(&text).unwrap();
            prop_assert_eq!(net.tip_count(), lengths.len() + 1);
            prop_assert!(net.verify().is_ok());
        }
    }
}
