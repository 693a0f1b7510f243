use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::{qualified_tool_name, split_tool_name, ToolProvider};
use stepwise_core::types::*;

/// In-memory tool servers with canned results. Every call is recorded.
#[derive(Clone, Default)]
pub struct MockToolProvider {
    servers: Arc<Mutex<HashMap<String, Vec<String>>>>,
    results: Arc<Mutex<HashMap<(String, String), ToolOutput>>>,
    calls: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
}

impl MockToolProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tool` on `server`, answering every call with `result`.
    pub fn with_tool(self, server: &str, tool: &str, result: ToolOutput) -> Self {
        self.servers
            .lock()
            .unwrap()
            .entry(server.to_string())
            .or_default()
            .push(tool.to_string());
        self.results
            .lock()
            .unwrap()
            .insert((server.to_string(), tool.to_string()), result);
        self
    }

    /// Qualified names and arguments of every call, in order.
    pub fn calls(&self) -> Vec<(String, serde_json::Value)> {
        self.calls.lock().unwrap().clone()
    }
}

impl ToolProvider for MockToolProvider {
    fn definitions<'a>(
        &'a self,
        specs: &'a [ToolSpec],
    ) -> BoxFuture<'a, Result<Vec<ToolDefinition>>> {
        Box::pin(async move {
            let servers = self.servers.lock().unwrap();
            let mut defs = Vec::new();
            for spec in specs {
                let tools = servers
                    .get(&spec.server)
                    .ok_or_else(|| StepwiseError::Mcp(format!("unknown server '{}'", spec.server)))?;
                for tool in tools.iter().filter(|t| spec.allows(t)) {
                    defs.push(ToolDefinition {
                        name: qualified_tool_name(&spec.server, tool),
                        description: format!("mock tool {}", tool),
                        input_schema: serde_json::json!({"type": "object"}),
                    });
                }
            }
            Ok(defs)
        })
    }

    fn call(&self, name: &str, arguments: serde_json::Value) -> BoxFuture<'_, Result<ToolOutput>> {
        let name = name.to_string();
        Box::pin(async move {
            self.calls.lock().unwrap().push((name.clone(), arguments));
            let (server, tool) =
                split_tool_name(&name).ok_or_else(|| StepwiseError::ToolNotFound(name.clone()))?;
            self.results
                .lock()
                .unwrap()
                .get(&(server.to_string(), tool.to_string()))
                .cloned()
                .ok_or_else(|| StepwiseError::ToolNotFound(name.clone()))
        })
    }
}
