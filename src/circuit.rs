//! Circuit graphs
//!
//! A [`Circuit`] is a set of unique `(layer, component, head?)` nodes and a
//! list of importance-weighted edges, with thresholded pruning and Graphviz
//! DOT export.

use serde::Serialize;

use crate::key::Component;

/// One node: a whole component, or a single attention head when `head` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CircuitNode {
    pub layer: usize,
    pub component: Component,
    pub head: Option<usize>,
}

impl CircuitNode {
    pub fn new(layer: usize, component: Component, head: Option<usize>) -> Self {
        Self {
            layer,
            component,
            head,
        }
    }

    /// `L{layer}H{head}` for heads, `L{layer}{first three component chars, uppercased}` otherwise.
    pub fn label(&self) -> String {
        match self.head {
            Some(head) => format!("L{}H{}", self.layer, head),
            None => {
                let short: String = self.component.as_str().chars().take(3).collect();
                format!("L{}{}", self.layer, short.to_uppercase())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitEdge {
    pub from: CircuitNode,
    pub to: CircuitNode,
    /// Expected in `[0, 1]`
    pub importance: f32,
}

/// Directed graph of circuit components.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Circuit {
    pub name: String,
    pub description: String,
    pub behavior: String,
    nodes: Vec<CircuitNode>,
    edges: Vec<CircuitEdge>,
}

impl Circuit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_behavior(mut self, behavior: impl Into<String>) -> Self {
        self.behavior = behavior.into();
        self
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> &[CircuitNode] {
        &self.nodes
    }

    /// Edges in insertion order (duplicates kept).
    pub fn edges(&self) -> &[CircuitEdge] {
        &self.edges
    }

    pub fn contains(&self, node: &CircuitNode) -> bool {
        self.nodes.contains(node)
    }

    /// Add a node unless an identical one is present.
    pub fn add_node(&mut self, node: CircuitNode) {
        if !self.nodes.contains(&node) {
            self.nodes.push(node);
        }
    }

    /// Append an edge, adding both endpoints if absent.
    pub fn add_edge(&mut self, from: CircuitNode, to: CircuitNode, importance: f32) {
        self.add_node(from);
        self.add_node(to);
        self.edges.push(CircuitEdge {
            from,
            to,
            importance,
        });
    }

    /// Copy keeping only edges with `importance >= threshold` and their endpoints.
    pub fn minimal(&self, threshold: f32) -> Circuit {
        let mut pruned = Circuit {
            name: format!("{}_minimal", self.name),
            description: self.description.clone(),
            behavior: self.behavior.clone(),
            nodes: Vec::new(),
            edges: Vec::new(),
        };
        for edge in self.edges.iter().filter(|e| e.importance >= threshold) {
            pruned.add_edge(edge.from, edge.to, edge.importance);
        }
        pruned
    }

    pub fn total_importance(&self) -> f32 {
        self.edges.iter().map(|e| e.importance).sum()
    }

    /// Mean edge importance; 0 for an edgeless circuit.
    pub fn average_importance(&self) -> f32 {
        if self.edges.is_empty() {
            0.0
        } else {
            self.total_importance() / self.edges.len() as f32
        }
    }

    /// Graphviz DOT. Pen width is `1 + 3·importance`; edge labels show importance to 2 decimals.
    pub fn to_dot(&self) -> String {
        let mut lines: Vec<String> = vec![
            "digraph Circuit {".to_string(),
            "  rankdir=TB;".to_string(),
            "  node [shape=box];".to_string(),
            String::new(),
        ];
        for node in &self.nodes {
            let label = node.label();
            lines.push(format!("  \"{label}\" [label=\"{label}\"];"));
        }
        lines.push(String::new());
        for edge in &self.edges {
            lines.push(format!(
                "  \"{}\" -> \"{}\" [penwidth={:.1}, label=\"{:.2}\"];",
                edge.from.label(),
                edge.to.label(),
                1.0 + edge.importance * 3.0,
                edge.importance
            ));
        }
        lines.push("}".to_string());
        lines.join("\n")
    }
}
