use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use stepwise_core::traits::ScriptBindings;

use crate::graph::Edge;

/// Mutable state of one run. Owned by exactly one run at a time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    /// Bound inputs, typed per the start node's declared variables.
    pub inputs: Map<String, Value>,
    /// Output of the most recently completed value-producing node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<Value>,
    /// Last output of every node that has run, by node id.
    #[serde(default)]
    pub node_outputs: BTreeMap<String, Value>,
    /// Completed body entries per `while` node.
    #[serde(default)]
    pub iteration_counters: BTreeMap<String, u32>,
    /// Edge ids in traversal order.
    #[serde(default, rename = "visitedEdgeTrace")]
    pub visited_edges: Vec<String>,
    /// Node dispatches so far.
    #[serde(default)]
    pub steps: usize,
}

impl ExecutionContext {
    pub fn new(inputs: Map<String, Value>) -> Self {
        Self {
            inputs,
            ..Default::default()
        }
    }

    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    /// Record a node's output and make it the new `lastOutput`.
    pub fn record_output(&mut self, node_id: &str, value: Value) {
        self.node_outputs.insert(node_id.to_string(), value.clone());
        self.last_output = Some(value);
    }

    /// Record a control node's output without touching `lastOutput`.
    pub fn record_control(&mut self, node_id: &str, value: Value) {
        self.node_outputs.insert(node_id.to_string(), value);
    }

    pub fn traverse(&mut self, edge: &Edge) {
        self.visited_edges.push(edge.id.clone());
    }

    pub fn iteration(&self, node_id: &str) -> u32 {
        self.iteration_counters.get(node_id).copied().unwrap_or(0)
    }

    /// Variables visible to scripts: `input`, `lastOutput` and `outputs`.
    pub fn bindings(&self) -> ScriptBindings {
        let outputs: Map<String, Value> = self
            .node_outputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        ScriptBindings::new(Value::Object(self.inputs.clone()))
            .with("lastOutput", self.last_output.clone().unwrap_or(Value::Null))
            .with("outputs", Value::Object(outputs))
    }
}
