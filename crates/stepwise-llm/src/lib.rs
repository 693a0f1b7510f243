pub mod providers;
pub mod retry;
pub mod streaming;

use stepwise_core::config::{AppConfig, ModelConfig};
use stepwise_core::traits::LlmClient;

pub use providers::anthropic::AnthropicClient;
pub use providers::openai::OpenAiClient;
pub use retry::{is_retryable, RetryingClient};

/// Create an LLM client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Box<dyn LlmClient> {
    match config.provider.as_str() {
        "anthropic" | "claude" => Box::new(AnthropicClient::new()),
        // Everything else speaks the OpenAI chat completions dialect
        _ => Box::new(OpenAiClient::new()),
    }
}

/// Build the client agent nodes use: the primary model wrapped with retry and
/// the configured fallback models.
pub fn client_from_config(config: &AppConfig) -> Box<dyn LlmClient> {
    let primary = create_client(&config.model);
    let fallbacks = config
        .fallback_models
        .iter()
        .map(|fb| (fb.clone(), create_client(fb)))
        .collect();
    let retry = config.model.retry.clone().unwrap_or_default();
    Box::new(RetryingClient::new(primary, fallbacks, retry))
}
