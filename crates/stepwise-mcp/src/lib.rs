mod client;
mod handler;
mod provider;

pub use client::McpClientManager;
pub use handler::{McpEvent, StepwiseClientHandler};
pub use provider::McpToolProvider;

use tracing::warn;

use stepwise_core::config::McpConfig;

/// Connect every server marked `auto_connect`. Failures are logged and skipped.
/// Returns the number of servers connected.
pub async fn connect_all(manager: &McpClientManager, config: &McpConfig) -> usize {
    let mut connected = 0;
    for (name, server) in &config.servers {
        if !server.auto_connect {
            continue;
        }
        match manager.connect(name, server).await {
            Ok(()) => connected += 1,
            Err(e) => warn!(server = %name, error = %e, "MCP server unavailable"),
        }
    }
    connected
}
