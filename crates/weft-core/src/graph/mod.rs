//! Static graph model: typed nodes connected by mode-qualified edges.
//!
//! A `Graph` is built once by the caller, validated before execution, and
//! owned by exactly one run. Cycles are legal; execution order is driven by
//! readiness, never by a topological sort.

pub mod edge;
pub mod node;

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub use edge::{Edge, Endpoint, Mode, ModeFlag};
pub use node::{Node, ValueType};

use crate::error::{Result, WeftError};
use crate::types::NodeState;

/// A set of nodes and the edges between them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node.
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add an edge.
    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Edges whose destination is `node_id`, in declaration order.
    pub fn inbound<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.to.node == node_id)
    }

    /// Edges whose source is `node_id`, in declaration order.
    pub fn outbound<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from.node == node_id)
    }

    /// Nodes with no outbound edges.
    pub fn sinks(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .iter()
            .filter(|n| !self.edges.iter().any(|e| e.from.node == n.id))
    }

    /// A clone with every node reset to `pending`, ready for a new run.
    pub fn fresh(&self) -> Self {
        let mut graph = self.clone();
        for node in &mut graph.nodes {
            node.state = NodeState::Pending;
        }
        graph
    }

    /// Check structural invariants. All problems are reported together.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        let mut node_ids = HashSet::new();

        for node in &self.nodes {
            if node.id.trim().is_empty() {
                problems.push("node with empty id".to_string());
            } else if !node_ids.insert(node.id.as_str()) {
                problems.push(format!("duplicate node id '{}'", node.id));
            }
            if node.node_type.trim().is_empty() {
                problems.push(format!("node '{}' has no type", node.id));
            }
        }

        let mut edge_ids = HashSet::new();
        for edge in &self.edges {
            if !edge_ids.insert(edge.id.as_str()) {
                problems.push(format!("duplicate edge id '{}'", edge.id));
            }

            let source = self.node(&edge.from.node);
            let target = self.node(&edge.to.node);

            let out_ty = match source {
                None => {
                    problems.push(format!(
                        "edge '{}' references unknown source node '{}'",
                        edge.id, edge.from.node
                    ));
                    None
                }
                Some(n) => match n.outputs.get(&edge.from.port) {
                    Some(ty) => Some(*ty),
                    None => {
                        problems.push(format!(
                            "edge '{}' reads undeclared output '{}'",
                            edge.id, edge.from
                        ));
                        None
                    }
                },
            };

            let in_ty = match target {
                None => {
                    problems.push(format!(
                        "edge '{}' references unknown target node '{}'",
                        edge.id, edge.to.node
                    ));
                    None
                }
                Some(n) => match n.inputs.get(&edge.to.port) {
                    Some(ty) => Some(*ty),
                    None => {
                        problems.push(format!(
                            "edge '{}' targets undeclared input '{}'",
                            edge.id, edge.to
                        ));
                        None
                    }
                },
            };

            if let (Some(out_ty), Some(in_ty)) = (out_ty, in_ty) {
                let delivered = if edge.delivers_array() {
                    ValueType::Array
                } else {
                    out_ty
                };
                if !in_ty.accepts(delivered) {
                    problems.push(format!(
                        "edge '{}' delivers {} into {} slot '{}'",
                        edge.id, delivered, in_ty, edge.to
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(WeftError::Validation(problems.join("; ")))
        }
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| WeftError::GraphParse(e.to_string()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| WeftError::GraphParse(e.to_string()))
    }

    /// Load a graph file; `.toml` files are parsed as TOML, anything else as JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content),
            _ => Self::from_json(&content),
        }
    }
}
