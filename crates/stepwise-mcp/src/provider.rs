use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::{qualified_tool_name, split_tool_name, ToolProvider};
use stepwise_core::types::{ToolDefinition, ToolOutput, ToolSpec};

use crate::client::McpClientManager;
use crate::handler::McpEvent;

const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// One tool as advertised by its server, before qualification.
#[derive(Debug, Clone)]
struct CachedTool {
    name: String,
    description: String,
    schema: serde_json::Value,
}

/// [`ToolProvider`] over connected MCP servers.
///
/// Tool listings are cached per server until the server announces
/// `tools/list_changed`.
pub struct McpToolProvider {
    manager: Arc<McpClientManager>,
    cache: Mutex<HashMap<String, Vec<CachedTool>>>,
}

impl McpToolProvider {
    pub fn new(manager: Arc<McpClientManager>) -> Arc<Self> {
        let provider = Arc::new(Self {
            manager,
            cache: Mutex::new(HashMap::new()),
        });
        provider.spawn_invalidation();
        provider
    }

    pub fn manager(&self) -> &Arc<McpClientManager> {
        &self.manager
    }

    /// Forget the cached listing for `server`.
    pub fn invalidate(&self, server: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(server);
        }
    }

    fn invalidate_all(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    fn spawn_invalidation(self: &Arc<Self>) {
        let mut events = self.manager.subscribe_events();
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = events.recv().await;
                let Some(provider) = weak.upgrade() else { break };
                match event {
                    Ok(McpEvent::ToolsChanged { server }) => {
                        debug!(server = %server, "Dropping cached MCP tool list");
                        provider.invalidate(&server);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => provider.invalidate_all(),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    async fn server_tools(&self, server: &str) -> Result<Vec<CachedTool>> {
        if let Some(tools) = self.cache.lock().ok().and_then(|c| c.get(server).cloned()) {
            return Ok(tools);
        }

        let tools: Vec<CachedTool> = self
            .manager
            .list_tools(server)
            .await?
            .into_iter()
            .map(|tool| CachedTool {
                description: tool
                    .description
                    .as_ref()
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| format!("MCP tool: {}", tool.name)),
                schema: serde_json::to_value(&*tool.input_schema)
                    .unwrap_or_else(|_| serde_json::json!({"type": "object"})),
                name: tool.name.to_string(),
            })
            .collect();

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(server.to_string(), tools.clone());
        }
        Ok(tools)
    }
}

fn select_definitions(server: &str, tools: &[CachedTool], spec: &ToolSpec) -> Vec<ToolDefinition> {
    for wanted in &spec.names {
        if !tools.iter().any(|t| &t.name == wanted) {
            warn!(server = %server, tool = %wanted, "Requested tool is not advertised by server");
        }
    }
    tools
        .iter()
        .filter(|t| spec.allows(&t.name))
        .map(|t| ToolDefinition {
            name: qualified_tool_name(server, &t.name),
            description: t.description.clone(),
            input_schema: t.schema.clone(),
        })
        .collect()
}

impl ToolProvider for McpToolProvider {
    fn definitions<'a>(
        &'a self,
        specs: &'a [ToolSpec],
    ) -> BoxFuture<'a, Result<Vec<ToolDefinition>>> {
        Box::pin(async move {
            let mut defs = Vec::new();
            for spec in specs {
                let tools = self.server_tools(&spec.server).await?;
                defs.extend(select_definitions(&spec.server, &tools, spec));
            }
            Ok(defs)
        })
    }

    fn call(&self, name: &str, arguments: serde_json::Value) -> BoxFuture<'_, Result<ToolOutput>> {
        let name = name.to_string();
        Box::pin(async move {
            let (server, tool) =
                split_tool_name(&name).ok_or_else(|| StepwiseError::ToolNotFound(name.clone()))?;

            let arguments = match arguments {
                serde_json::Value::Object(map) => Some(map),
                serde_json::Value::Null => None,
                other => {
                    return Err(StepwiseError::ToolExecution {
                        tool: name.clone(),
                        message: format!("arguments must be an object, got {}", other),
                    })
                }
            };

            let timeout_secs = self
                .manager
                .get_config(server)
                .await
                .map(|c| c.timeout_secs)
                .unwrap_or(DEFAULT_TIMEOUT_SECS);

            debug!(server = %server, tool = %tool, "Calling MCP tool");
            match tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                self.manager.call_tool(server, tool, arguments),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(StepwiseError::ToolTimeout {
                    tool: name.clone(),
                    timeout_secs,
                }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cached(names: &[&str]) -> Vec<CachedTool> {
        names
            .iter()
            .map(|n| CachedTool {
                name: n.to_string(),
                description: format!("does {}", n),
                schema: serde_json::json!({"type": "object"}),
            })
            .collect()
    }

    #[test]
    fn test_select_all_tools_when_unfiltered() {
        let defs = select_definitions("search", &cached(&["query", "fetch"]), &ToolSpec::server("search"));
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["mcp__search__query", "mcp__search__fetch"]);
    }

    #[test]
    fn test_select_named_tools_only() {
        let spec = ToolSpec {
            server: "search".into(),
            names: vec!["fetch".into(), "missing".into()],
        };
        let defs = select_definitions("search", &cached(&["query", "fetch"]), &spec);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "mcp__search__fetch");
        assert_eq!(defs[0].description, "does fetch");
    }

    #[tokio::test]
    async fn test_unqualified_name_is_not_found() {
        let provider = McpToolProvider::new(Arc::new(McpClientManager::new()));
        let err = provider.call("bash", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, StepwiseError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_server_is_mcp_error() {
        let provider = McpToolProvider::new(Arc::new(McpClientManager::new()));
        let err = provider
            .definitions(&[ToolSpec::server("nowhere")])
            .await
            .unwrap_err();
        assert!(matches!(err, StepwiseError::Mcp(_)));
    }

    #[tokio::test]
    async fn test_tools_changed_invalidates_cache() {
        let manager = Arc::new(McpClientManager::new());
        let provider = McpToolProvider::new(manager.clone());
        provider
            .cache
            .lock()
            .unwrap()
            .insert("search".into(), cached(&["query"]));

        manager.notify(McpEvent::ToolsChanged {
            server: "search".into(),
        });
        for _ in 0..50 {
            if !provider.cache.lock().unwrap().contains_key("search") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("cache entry was not invalidated");
    }
}
