use std::sync::Arc;

use tracing::info;

use stepwise_core::config::AppConfig;
use stepwise_core::traits::LlmClient;
use stepwise_engine::{
    LlmInvoker, MemorySuspensionStore, RunManager, SqliteSuspensionStore, SuspensionStore,
    WorkflowEngine,
};
use stepwise_mcp::{McpClientManager, McpEvent, McpToolProvider};
use stepwise_script::RhaiScriptRunner;

/// Everything a command needs to execute workflows.
pub struct Runtime {
    pub manager: Arc<RunManager>,
    pub mcp: Arc<McpClientManager>,
}

/// Wire the LLM client, MCP servers, script sandbox and suspension store
/// described by `config` into a run manager.
pub async fn build(config: &AppConfig) -> anyhow::Result<Runtime> {
    let llm: Arc<dyn LlmClient> = Arc::from(stepwise_llm::client_from_config(config));
    info!(
        provider = %config.model.provider,
        model = %config.model.model_id,
        fallbacks = config.fallback_models.len(),
        "LLM client ready"
    );

    let mcp = Arc::new(McpClientManager::new());
    if let Some(ref mcp_config) = config.mcp {
        let connected = stepwise_mcp::connect_all(&mcp, mcp_config).await;
        info!(
            connected,
            configured = mcp_config.servers.len(),
            "MCP servers initialized"
        );
        spawn_mcp_logger(&mcp);
    }
    let tools = McpToolProvider::new(mcp.clone());

    let store: Arc<dyn SuspensionStore> = match config.store {
        Some(ref store) => {
            let path = store.resolved_path();
            let sqlite = SqliteSuspensionStore::open(&path)?;
            info!(path = %path.display(), "Suspended runs persisted to SQLite");
            Arc::new(sqlite)
        }
        None => Arc::new(MemorySuspensionStore::new()),
    };

    let invoker = LlmInvoker::from_config(llm, tools.clone(), config);
    let engine = WorkflowEngine::new(
        config.engine.clone(),
        Arc::new(RhaiScriptRunner::new()),
        Arc::new(invoker),
        tools,
    );

    Ok(Runtime {
        manager: Arc::new(RunManager::new(Arc::new(engine), store)),
        mcp,
    })
}

fn spawn_mcp_logger(mcp: &McpClientManager) {
    let mut events = mcp.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                McpEvent::ToolsChanged { server } => {
                    info!(server = %server, "MCP tools changed");
                }
                McpEvent::LogMessage {
                    server,
                    level,
                    message,
                } => {
                    info!(server = %server, level = %level, "MCP: {}", message);
                }
            }
        }
    });
}
