use std::collections::HashMap;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use rmcp::model::{CallToolRequestParams, RawContent, Tool as McpTool};
use rmcp::service::RunningService;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransport;
use rmcp::{RoleClient, ServiceExt};

use stepwise_core::config::{McpServerConfig, McpTransport};
use stepwise_core::error::StepwiseError;
use stepwise_core::types::ToolOutput;

use crate::handler::{McpEvent, StepwiseClientHandler};

type McpConnection = RunningService<RoleClient, StepwiseClientHandler>;

/// Connections to the configured MCP servers, keyed by server name.
pub struct McpClientManager {
    connections: Mutex<HashMap<String, McpConnection>>,
    server_configs: Mutex<HashMap<String, McpServerConfig>>,
    event_tx: broadcast::Sender<McpEvent>,
}

impl Default for McpClientManager {
    fn default() -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            connections: Mutex::new(HashMap::new()),
            server_configs: Mutex::new(HashMap::new()),
            event_tx,
        }
    }
}

impl McpClientManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<McpEvent> {
        self.event_tx.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn notify(&self, event: McpEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Connect to an MCP server and remember its config for reconnects.
    pub async fn connect(&self, name: &str, config: &McpServerConfig) -> Result<(), StepwiseError> {
        let handler = StepwiseClientHandler::new(name, self.event_tx.clone());

        let client = match &config.transport {
            McpTransport::Stdio { command, args, env } => {
                let mut cmd = tokio::process::Command::new(command);
                cmd.args(args);
                for (k, v) in env {
                    cmd.env(k, v);
                }

                let transport = rmcp::transport::TokioChildProcess::new(cmd).map_err(|e| {
                    StepwiseError::Mcp(format!("Failed to spawn {}: {}", command, e))
                })?;

                handler.serve(transport).await.map_err(|e| {
                    StepwiseError::Mcp(format!("MCP init for '{}' failed: {}", name, e))
                })?
            }
            McpTransport::Http { url } => {
                let transport = StreamableHttpClientTransport::from_uri(url.as_str());

                <StepwiseClientHandler as ServiceExt<RoleClient>>::serve(handler, transport)
                    .await
                    .map_err(|e| {
                        StepwiseError::Mcp(format!("MCP init for '{}' failed: {}", name, e))
                    })?
            }
        };

        info!(server = %name, "MCP server connected");

        self.connections
            .lock()
            .await
            .insert(name.to_string(), client);
        self.server_configs
            .lock()
            .await
            .insert(name.to_string(), config.clone());
        Ok(())
    }

    /// Drop the current connection to `server_name` and dial it again.
    pub async fn reconnect(&self, server_name: &str) -> Result<(), StepwiseError> {
        let config = self.get_config(server_name).await.ok_or_else(|| {
            StepwiseError::Mcp(format!("No stored config for server '{}'", server_name))
        })?;

        if let Some(mut old) = self.connections.lock().await.remove(server_name) {
            let _ = old.close().await;
        }

        self.connect(server_name, &config).await
    }

    pub async fn is_connected(&self, server_name: &str) -> bool {
        self.connections
            .lock()
            .await
            .get(server_name)
            .is_some_and(|c| !c.is_closed())
    }

    pub async fn connected_servers(&self) -> Vec<String> {
        self.connections.lock().await.keys().cloned().collect()
    }

    pub async fn get_config(&self, server_name: &str) -> Option<McpServerConfig> {
        self.server_configs.lock().await.get(server_name).cloned()
    }

    pub async fn list_tools(&self, server_name: &str) -> Result<Vec<McpTool>, StepwiseError> {
        let conns = self.connections.lock().await;
        let client = conns.get(server_name).ok_or_else(|| not_connected(server_name))?;

        let tools = client.list_all_tools().await.map_err(|e| {
            StepwiseError::Mcp(format!("Failed to list tools from '{}': {}", server_name, e))
        })?;

        debug!(server = %server_name, count = tools.len(), "Listed MCP tools");
        Ok(tools)
    }

    /// Call a tool, reconnecting once if the transport has closed underneath us.
    pub async fn call_tool(
        &self,
        server_name: &str,
        tool_name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<ToolOutput, StepwiseError> {
        let result = self
            .call_tool_inner(server_name, tool_name, arguments.clone())
            .await;

        if let Err(ref e) = result {
            let err_str = e.to_string();
            if err_str.contains("closed") || err_str.contains("Transport") {
                warn!(server = %server_name, "MCP transport closed, attempting reconnect");
                if self.reconnect(server_name).await.is_ok() {
                    return self.call_tool_inner(server_name, tool_name, arguments).await;
                }
            }
        }

        result
    }

    async fn call_tool_inner(
        &self,
        server_name: &str,
        tool_name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<ToolOutput, StepwiseError> {
        let conns = self.connections.lock().await;
        let client = conns.get(server_name).ok_or_else(|| not_connected(server_name))?;

        let params = CallToolRequestParams {
            name: tool_name.to_string().into(),
            arguments,
            meta: None,
            task: None,
        };

        let result = client.call_tool(params).await.map_err(|e| {
            StepwiseError::Mcp(format!(
                "Tool call '{}.{}' failed: {}",
                server_name, tool_name, e
            ))
        })?;

        let text: Vec<String> = result
            .content
            .iter()
            .map(|c| match c.raw {
                RawContent::Text(ref t) => t.text.to_string(),
                _ => format!("{:?}", c.raw),
            })
            .collect();

        Ok(ToolOutput {
            content: text.join("\n"),
            structured: result.structured_content,
            is_error: result.is_error.unwrap_or(false),
        })
    }

    pub async fn disconnect_all(&self) {
        let mut conns = self.connections.lock().await;
        for (name, mut client) in conns.drain() {
            let _ = client.close().await;
            info!(server = %name, "MCP server disconnected");
        }
    }
}

fn not_connected(server_name: &str) -> StepwiseError {
    StepwiseError::Mcp(format!("Server '{}' not connected", server_name))
}
