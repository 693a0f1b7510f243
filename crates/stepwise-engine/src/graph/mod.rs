//! Workflow graph model.
//!
//! A workflow is a directed graph of typed [`Node`]s connected by [`Edge`]s.
//! Node configuration is decoded per kind when the document is loaded, so the
//! engine only ever sees a closed set of well-formed node variants. Structural
//! rules (single start, reachability, loop shape) are checked by
//! [`WorkflowGraph::validate`] before any run starts.

pub mod edge;
pub mod node;
mod validate;

pub use edge::{Branch, Edge};
pub use node::{
    AgentConfig, ApprovalConfig, Decision, IfElseConfig, InputVariable, Node, NodeKind,
    OutputFormat, StartConfig, ToolNodeConfig, TransformConfig, VariableType, WhileConfig,
};

use serde::{Deserialize, Serialize};

use stepwise_core::error::{Result, StepwiseError};

use node::RawNode;

/// A complete workflow document: `{nodes: [...], edges: [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

#[derive(Deserialize)]
struct RawGraph {
    nodes: Vec<RawNode>,
    #[serde(default)]
    edges: Vec<Edge>,
}

impl WorkflowGraph {
    /// Decode a graph document. Unknown kinds and malformed node configs are
    /// validation errors naming the offending node.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let raw: RawGraph = serde_json::from_value(value)
            .map_err(|e| StepwiseError::validation(format!("malformed graph document: {}", e), None))?;
        Self::from_raw(raw)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let raw: RawGraph = serde_json::from_str(text)
            .map_err(|e| StepwiseError::validation(format!("malformed graph document: {}", e), None))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawGraph) -> Result<Self> {
        let nodes = raw
            .nodes
            .into_iter()
            .map(Node::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            nodes,
            edges: raw.edges,
        })
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_node(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| matches!(n.kind, NodeKind::Start(_)))
    }

    /// Outgoing edges of `node_id`, in document order.
    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    pub fn incoming<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.target == node_id)
    }

    /// The outgoing edge of `node_id` carrying `branch`.
    pub fn branch_edge(&self, node_id: &str, branch: Branch) -> Option<&Edge> {
        self.edges
            .iter()
            .find(|e| e.source == node_id && e.branch() == Some(branch))
    }

    /// The single outgoing edge of a non-branching node.
    pub fn sole_edge(&self, node_id: &str) -> Option<&Edge> {
        self.edges.iter().find(|e| e.source == node_id)
    }
}
