use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classes surfaced by the agent/tool invoker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvokerErrorKind {
    /// Model endpoint unreachable after all retries.
    UpstreamUnavailable,
    /// Model endpoint answered with a non-retryable error.
    UpstreamRejected,
    /// The invocation exceeded its time budget.
    Timeout,
    /// The model kept requesting tools past the configured round limit.
    ToolRoundsExhausted,
    /// Structured output did not parse or did not match its schema.
    MalformedOutput,
    /// A remote tool failed or reported an error result.
    ToolFailed,
}

impl InvokerErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::UpstreamRejected => "upstream_rejected",
            Self::Timeout => "timeout",
            Self::ToolRoundsExhausted => "tool_rounds_exhausted",
            Self::MalformedOutput => "malformed_output",
            Self::ToolFailed => "tool_failed",
        }
    }
}

impl std::fmt::Display for InvokerErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StepwiseError {
    // Graph errors
    #[error("Invalid workflow graph: {reason}")]
    Validation {
        reason: String,
        node_id: Option<String>,
    },

    #[error("Invalid input '{name}': {reason}")]
    Input { name: String, reason: String },

    // Script errors
    #[error("Script failed: {message}")]
    Script { message: String },

    #[error("Script timed out after {timeout_ms}ms")]
    ScriptTimeout { timeout_ms: u64 },

    // Invoker errors
    #[error("Invoker error ({kind}): {message}")]
    Invoker {
        kind: InvokerErrorKind,
        message: String,
        /// Raw model text, kept for diagnostics on malformed output.
        raw: Option<String>,
    },

    #[error("Loop safety violated at node {node_id} after {iterations} iterations")]
    LoopSafety { node_id: String, iterations: u32 },

    // Run lifecycle errors
    #[error("Run cancelled")]
    Cancelled,

    #[error("Approval rejected at node {node_id}")]
    ApprovalRejected {
        node_id: String,
        note: Option<String>,
    },

    #[error("Run not found: {0}")]
    RunNotFound(String),

    // LLM transport errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("MCP error: {0}")]
    Mcp(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StepwiseError {
    pub fn validation(reason: impl Into<String>, node_id: Option<&str>) -> Self {
        Self::Validation {
            reason: reason.into(),
            node_id: node_id.map(str::to_string),
        }
    }

    pub fn invoker(kind: InvokerErrorKind, message: impl Into<String>) -> Self {
        Self::Invoker {
            kind,
            message: message.into(),
            raw: None,
        }
    }

    /// Stable label carried in `error` event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::Input { .. } => "input_error",
            Self::Script { .. } | Self::ScriptTimeout { .. } => "script_error",
            Self::Invoker { .. } => "invoker_error",
            Self::LoopSafety { .. } => "loop_safety_violation",
            Self::Cancelled => "cancelled",
            Self::ApprovalRejected { .. } => "approval_rejected",
            Self::RunNotFound(_) => "run_not_found",
            Self::LlmRequest(_) | Self::LlmStream(_) | Self::LlmParse(_) => "llm_error",
            Self::ToolNotFound(_)
            | Self::ToolExecution { .. }
            | Self::ToolTimeout { .. }
            | Self::Mcp(_) => "tool_error",
            Self::Config(_) | Self::ConfigNotFound(_) => "config_error",
            Self::Database(_) => "database_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }

    /// Payload attached to the terminal `error` event of a failed node.
    pub fn to_payload(&self) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        match self {
            Self::Invoker { kind, raw, .. } => {
                payload["invokerKind"] = serde_json::json!(kind);
                if let Some(raw) = raw {
                    payload["raw"] = serde_json::Value::String(raw.clone());
                }
            }
            Self::Input { name, .. } => {
                payload["input"] = serde_json::Value::String(name.clone());
            }
            Self::ApprovalRejected { note: Some(note), .. } => {
                payload["note"] = serde_json::Value::String(note.clone());
            }
            _ => {}
        }
        payload
    }
}

pub type Result<T> = std::result::Result<T, StepwiseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels() {
        assert_eq!(
            StepwiseError::validation("no start", None).kind(),
            "validation_error"
        );
        assert_eq!(
            StepwiseError::ScriptTimeout { timeout_ms: 5 }.kind(),
            "script_error"
        );
        assert_eq!(StepwiseError::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn test_invoker_payload_carries_raw_text() {
        let err = StepwiseError::Invoker {
            kind: InvokerErrorKind::MalformedOutput,
            message: "not json".into(),
            raw: Some("hello".into()),
        };
        let payload = err.to_payload();
        assert_eq!(payload["kind"], "invoker_error");
        assert_eq!(payload["invokerKind"], "malformed_output");
        assert_eq!(payload["raw"], "hello");
    }

    #[test]
    fn test_invoker_kind_serializes_snake_case() {
        let json = serde_json::to_string(&InvokerErrorKind::UpstreamUnavailable).unwrap();
        assert_eq!(json, "\"upstream_unavailable\"");
    }
}
