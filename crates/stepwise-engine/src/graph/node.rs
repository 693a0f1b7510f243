use serde::{Deserialize, Serialize};
use serde_json::Value;

use stepwise_core::error::StepwiseError;
use stepwise_core::types::ToolSpec;

/// A typed step in a workflow graph.
///
/// On the wire a node is `{id, kind, name?, config}`; `config` is decoded
/// according to `kind` into a [`NodeKind`] variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct Node {
    pub id: String,
    pub name: Option<String>,
    pub kind: NodeKind,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Start(StartConfig),
    End,
    Agent(AgentConfig),
    Transform(TransformConfig),
    IfElse(IfElseConfig),
    While(WhileConfig),
    UserApproval(ApprovalConfig),
    Tool(ToolNodeConfig),
}

impl NodeKind {
    /// Wire name of this kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::End => "end",
            Self::Agent(_) => "agent",
            Self::Transform(_) => "transform",
            Self::IfElse(_) => "if-else",
            Self::While(_) => "while",
            Self::UserApproval(_) => "user-approval",
            Self::Tool(_) => "tool",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartConfig {
    #[serde(default)]
    pub variables: Vec<InputVariable>,
}

/// A runtime input declared on the start node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputVariable {
    pub name: String,
    #[serde(rename = "type", default)]
    pub var_type: VariableType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    #[default]
    String,
    Number,
    Boolean,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub instructions: String,
    /// Model id override; the configured default model otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_rounds: Option<u32>,
}

/// Requested shape of an agent's final answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<Value>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformConfig {
    pub script: String,
    /// Per-node override of the engine's script timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IfElseConfig {
    pub condition: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhileConfig {
    #[serde(alias = "condition")]
    pub while_condition: String,
    pub max_iterations: u32,
}

/// Outcome of a human approval gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    #[default]
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalConfig {
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Decision applied when `timeout_secs` elapses without a resume.
    #[serde(default)]
    pub on_timeout: Decision,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolNodeConfig {
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Wire form of a node, before `config` is decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RawNode {
    id: String,
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default)]
    config: Value,
}

fn decode<T: serde::de::DeserializeOwned>(id: &str, kind: &str, config: Value) -> Result<T, StepwiseError> {
    // Editors emit `null` for nodes without settings
    let config = if config.is_null() {
        Value::Object(Default::default())
    } else {
        config
    };
    serde_json::from_value(config).map_err(|e| {
        StepwiseError::validation(format!("invalid {} config: {}", kind, e), Some(id))
    })
}

impl TryFrom<RawNode> for Node {
    type Error = StepwiseError;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let RawNode {
            id,
            kind,
            name,
            config,
        } = raw;
        let kind = match kind.as_str() {
            "start" => NodeKind::Start(decode(&id, &kind, config)?),
            "end" => NodeKind::End,
            "agent" => NodeKind::Agent(decode(&id, &kind, config)?),
            "transform" => NodeKind::Transform(decode(&id, &kind, config)?),
            "if-else" => NodeKind::IfElse(decode(&id, &kind, config)?),
            "while" => NodeKind::While(decode(&id, &kind, config)?),
            "user-approval" => NodeKind::UserApproval(decode(&id, &kind, config)?),
            "tool" | "mcp" => NodeKind::Tool(decode(&id, &kind, config)?),
            other => {
                return Err(StepwiseError::validation(
                    format!("unknown node kind '{}'", other),
                    Some(&id),
                ))
            }
        };
        Ok(Node { id, name, kind })
    }
}

impl From<Node> for RawNode {
    fn from(node: Node) -> Self {
        let kind = node.kind.name().to_string();
        let config = match node.kind {
            NodeKind::Start(c) => serde_json::to_value(c),
            NodeKind::End => Ok(Value::Object(Default::default())),
            NodeKind::Agent(c) => serde_json::to_value(c),
            NodeKind::Transform(c) => serde_json::to_value(c),
            NodeKind::IfElse(c) => serde_json::to_value(c),
            NodeKind::While(c) => serde_json::to_value(c),
            NodeKind::UserApproval(c) => serde_json::to_value(c),
            NodeKind::Tool(c) => serde_json::to_value(c),
        }
        .unwrap_or(Value::Null);
        RawNode {
            id: node.id,
            kind,
            name: node.name,
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> Result<Node, StepwiseError> {
        let raw: RawNode = serde_json::from_value(value).unwrap();
        Node::try_from(raw)
    }

    #[test]
    fn test_decode_agent_config() {
        let node = parse(json!({
            "id": "a1",
            "kind": "agent",
            "config": {
                "instructions": "Answer: {{input.q}}",
                "model": "gpt-4o-mini",
                "tools": [{"server": "search", "names": ["query"]}],
                "outputFormat": {"type": "json", "schema": {"type": "object"}}
            }
        }))
        .unwrap();
        match node.kind {
            NodeKind::Agent(cfg) => {
                assert_eq!(cfg.model.as_deref(), Some("gpt-4o-mini"));
                assert_eq!(cfg.tools[0].names, vec!["query"]);
                assert!(matches!(cfg.output_format, OutputFormat::Json { schema: Some(_) }));
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_decode_start_variables() {
        let node = parse(json!({
            "id": "s",
            "kind": "start",
            "config": {"variables": [
                {"name": "n", "type": "number", "required": true},
                {"name": "flag", "type": "boolean", "defaultValue": false}
            ]}
        }))
        .unwrap();
        let NodeKind::Start(cfg) = node.kind else { panic!("not a start node") };
        assert_eq!(cfg.variables[0].var_type, VariableType::Number);
        assert!(cfg.variables[0].required);
        assert_eq!(cfg.variables[1].default_value, Some(json!(false)));
    }

    #[test]
    fn test_while_condition_alias() {
        let node = parse(json!({
            "id": "w",
            "kind": "while",
            "config": {"condition": "true", "maxIterations": 2}
        }))
        .unwrap();
        let NodeKind::While(cfg) = node.kind else { panic!("not a while node") };
        assert_eq!(cfg.while_condition, "true");
        assert_eq!(cfg.max_iterations, 2);
    }

    #[test]
    fn test_end_without_config() {
        let node = parse(json!({"id": "e", "kind": "end"})).unwrap();
        assert!(matches!(node.kind, NodeKind::End));
    }

    #[test]
    fn test_unknown_kind_names_node() {
        let err = parse(json!({"id": "x", "kind": "teleport", "config": {}})).unwrap_err();
        match err {
            StepwiseError::Validation { node_id, reason } => {
                assert_eq!(node_id.as_deref(), Some("x"));
                assert!(reason.contains("teleport"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_bad_config_names_node() {
        let err = parse(json!({"id": "w", "kind": "while", "config": {"maxIterations": -1}}))
            .unwrap_err();
        assert!(matches!(err, StepwiseError::Validation { node_id: Some(ref id), .. } if id == "w"));
    }

    #[test]
    fn test_approval_defaults_to_reject_on_timeout() {
        let node = parse(json!({
            "id": "ap",
            "kind": "user-approval",
            "config": {"prompt": "ok?", "timeoutSecs": 60}
        }))
        .unwrap();
        let NodeKind::UserApproval(cfg) = node.kind else { panic!("not an approval node") };
        assert_eq!(cfg.on_timeout, Decision::Reject);
        assert_eq!(cfg.timeout_secs, Some(60));
    }

    #[test]
    fn test_node_roundtrips_through_wire_form() {
        let node = parse(json!({
            "id": "t",
            "kind": "mcp",
            "config": {"server": "s", "tool": "q", "arguments": {"a": "{{input.x}}"}}
        }))
        .unwrap();
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["kind"], "tool");
        let back: Node = serde_json::from_value(json).unwrap();
        assert!(matches!(back.kind, NodeKind::Tool(ref c) if c.tool == "q"));
    }
}
