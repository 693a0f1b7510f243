use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::event::ExecutionEvent;
use crate::types::*;

/// Streaming chat client for one provider.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// Variables handed to a sandboxed script. Nothing else is visible to it.
#[derive(Debug, Clone, Default)]
pub struct ScriptBindings {
    vars: serde_json::Map<String, serde_json::Value>,
}

impl ScriptBindings {
    /// Bindings with `input` set.
    pub fn new(input: serde_json::Value) -> Self {
        let mut vars = serde_json::Map::new();
        vars.insert("input".to_string(), input);
        Self { vars }
    }

    pub fn with(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.vars.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.vars.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.vars.iter()
    }
}

/// Sandboxed evaluator for user-supplied transform and condition code.
pub trait ScriptRunner: Send + Sync + 'static {
    /// Evaluate `script` against `bindings`, bounded by `timeout`.
    ///
    /// Cancelling `cancel` aborts evaluation at the next progress check.
    fn run(
        &self,
        script: &str,
        bindings: ScriptBindings,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Evaluate a condition, coercing the result with [`is_truthy`].
    fn run_condition(
        &self,
        script: &str,
        bindings: ScriptBindings,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<bool>> {
        let fut = self.run(script, bindings, timeout, cancel);
        Box::pin(async move { Ok(is_truthy(&fut.await?)) })
    }
}

/// Remote tool capability: discovery plus invoke-by-name.
pub trait ToolProvider: Send + Sync + 'static {
    /// Definitions for every tool the given specs allow, named as the model will call them.
    fn definitions<'a>(&'a self, specs: &'a [ToolSpec])
        -> BoxFuture<'a, Result<Vec<ToolDefinition>>>;

    /// Call a tool by the name returned from [`ToolProvider::definitions`].
    fn call(&self, name: &str, arguments: serde_json::Value) -> BoxFuture<'_, Result<ToolOutput>>;

    /// Call `tool` on `server` directly, without going through a model.
    fn call_on(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        let name = qualified_tool_name(server, tool);
        Box::pin(async move { self.call(&name, arguments).await })
    }
}

/// Name format exposed to models: `mcp__{server}__{tool}`.
pub fn qualified_tool_name(server: &str, tool: &str) -> String {
    format!("mcp__{}__{}", server, tool)
}

/// Split a qualified tool name back into `(server, tool)`.
pub fn split_tool_name(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix("mcp__")?;
    let (server, tool) = rest.split_once("__")?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

/// Consumer of a run's ordered event stream.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ExecutionEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_name_roundtrip() {
        let name = qualified_tool_name("search", "web_query");
        assert_eq!(name, "mcp__search__web_query");
        assert_eq!(split_tool_name(&name), Some(("search", "web_query")));
    }

    #[test]
    fn test_split_rejects_unqualified() {
        assert_eq!(split_tool_name("bash"), None);
        assert_eq!(split_tool_name("mcp____x"), None);
    }

    #[test]
    fn test_bindings() {
        let b = ScriptBindings::new(serde_json::json!({"x": 1}))
            .with("lastOutput", serde_json::json!("hi"));
        assert_eq!(b.get("input").unwrap()["x"], 1);
        assert_eq!(b.get("lastOutput").unwrap(), "hi");
        assert_eq!(b.iter().count(), 2);
    }
}
