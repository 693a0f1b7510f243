use std::future::Future;

use tokio::sync::broadcast;
use tracing::debug;

use rmcp::handler::client::ClientHandler;
use rmcp::model::*;
use rmcp::service::NotificationContext;
use rmcp::RoleClient;

/// Notifications surfaced from connected MCP servers.
#[derive(Debug, Clone, PartialEq)]
pub enum McpEvent {
    ToolsChanged { server: String },
    LogMessage {
        server: String,
        level: String,
        message: String,
    },
}

/// Client-side handler for one server connection. Forwards notifications to
/// the manager's event channel.
pub struct StepwiseClientHandler {
    server_name: String,
    event_tx: broadcast::Sender<McpEvent>,
}

impl StepwiseClientHandler {
    pub fn new(server_name: &str, event_tx: broadcast::Sender<McpEvent>) -> Self {
        Self {
            server_name: server_name.to_string(),
            event_tx,
        }
    }
}

#[allow(clippy::manual_async_fn)]
impl ClientHandler for StepwiseClientHandler {
    fn on_tool_list_changed(
        &self,
        _ctx: NotificationContext<RoleClient>,
    ) -> impl Future<Output = ()> + Send + '_ {
        async {
            debug!(server = %self.server_name, "MCP tools/list_changed notification");
            let _ = self.event_tx.send(McpEvent::ToolsChanged {
                server: self.server_name.clone(),
            });
        }
    }

    fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _ctx: NotificationContext<RoleClient>,
    ) -> impl Future<Output = ()> + Send + '_ {
        async move {
            let level = format!("{:?}", params.level);
            let message = params.data.to_string();
            debug!(server = %self.server_name, level = %level, "MCP log: {}", message);
            let _ = self.event_tx.send(McpEvent::LogMessage {
                server: self.server_name.clone(),
                level,
                message,
            });
        }
    }

    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            meta: None,
            protocol_version: Default::default(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "stepwise".into(),
                title: None,
                version: env!("CARGO_PKG_VERSION").into(),
                description: None,
                icons: None,
                website_url: None,
            },
        }
    }
}
