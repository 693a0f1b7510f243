use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tracing::{info, warn};

use stepwise_core::config::{ModelConfig, RetryConfig};
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::LlmClient;
use stepwise_core::types::*;

/// An LLM client that retries failed requests and falls back to alternative models.
///
/// Each attempt to open a stream is bounded by `attempt_timeout_secs`; an attempt
/// that times out counts as a retryable failure.
pub struct RetryingClient {
    primary: Box<dyn LlmClient>,
    fallbacks: Vec<(ModelConfig, Box<dyn LlmClient>)>,
    retry_config: RetryConfig,
}

impl RetryingClient {
    pub fn new(
        primary: Box<dyn LlmClient>,
        fallbacks: Vec<(ModelConfig, Box<dyn LlmClient>)>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            primary,
            fallbacks,
            retry_config,
        }
    }

    async fn attempt<'a>(
        &self,
        client: &'a dyn LlmClient,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> Result<BoxStream<'a, Result<StreamDelta>>> {
        let limit = Duration::from_secs(self.retry_config.attempt_timeout_secs.max(1));
        match tokio::time::timeout(limit, client.chat_stream(config, messages, tools)).await {
            Ok(result) => result,
            Err(_) => Err(StepwiseError::LlmRequest(format!(
                "timeout after {}s waiting for response",
                limit.as_secs()
            ))),
        }
    }
}

/// Whether an LLM failure is transient: rate limits, server errors, timeouts,
/// dropped connections and broken streams.
pub fn is_retryable(e: &StepwiseError) -> bool {
    match e {
        StepwiseError::LlmRequest(msg) => {
            if let Some(status) = http_status(msg) {
                return status == 408 || status == 429 || status >= 500;
            }
            let lower = msg.to_lowercase();
            lower.contains("timeout") || lower.contains("timed out") || lower.contains("connection")
        }
        StepwiseError::LlmStream(_) => true,
        _ => false,
    }
}

/// Status code from messages shaped `HTTP 503: ...`.
fn http_status(msg: &str) -> Option<u16> {
    let rest = msg.strip_prefix("HTTP ")?;
    rest.split(|c: char| !c.is_ascii_digit())
        .next()
        .and_then(|code| code.parse().ok())
}

/// Exponential backoff for `attempt` (zero-based), capped and jittered.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl LlmClient for RetryingClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let config = config.clone();
        let tools = tools.to_vec();

        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;

            let mut last_err = None;
            for attempt in 0..=max_retries {
                match self
                    .attempt(self.primary.as_ref(), &config, messages.clone(), &tools)
                    .await
                {
                    Ok(stream) => return Ok(stream),
                    Err(e) => {
                        if is_retryable(&e) && attempt < max_retries {
                            let backoff = calculate_backoff(attempt, &self.retry_config);
                            warn!(
                                attempt = attempt + 1,
                                max_retries,
                                backoff_ms = backoff.as_millis() as u64,
                                error = %e,
                                "Retrying LLM request"
                            );
                            tokio::time::sleep(backoff).await;
                            last_err = Some(e);
                            continue;
                        }
                        last_err = Some(e);
                        break;
                    }
                }
            }

            // Non-retryable rejections (bad request, auth) are not masked by fallbacks.
            if let Some(e) = last_err.take() {
                if !is_retryable(&e) {
                    return Err(e);
                }
                last_err = Some(e);
            }

            if !self.fallbacks.is_empty() {
                info!("Primary LLM exhausted, trying fallback models");
            }
            for (fb_config, fb_client) in &self.fallbacks {
                match self
                    .attempt(fb_client.as_ref(), fb_config, messages.clone(), &tools)
                    .await
                {
                    Ok(stream) => {
                        info!(
                            model = %fb_config.model_id,
                            provider = %fb_config.provider,
                            "Fell back to alternative model"
                        );
                        return Ok(stream);
                    }
                    Err(e) => {
                        warn!(
                            model = %fb_config.model_id,
                            error = %e,
                            "Fallback model also failed"
                        );
                        continue;
                    }
                }
            }

            Err(last_err
                .unwrap_or_else(|| StepwiseError::LlmRequest("All providers failed".into())))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use stepwise_test_utils::{test_model_config, MockLlmClient};

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            attempt_timeout_secs: 5,
        }
    }

    #[test]
    fn test_is_retryable() {
        assert!(is_retryable(&StepwiseError::LlmRequest("HTTP 429: slow down".into())));
        assert!(is_retryable(&StepwiseError::LlmRequest("HTTP 503: busy".into())));
        assert!(!is_retryable(&StepwiseError::LlmRequest("HTTP 400: bad".into())));
        assert!(!is_retryable(&StepwiseError::LlmRequest("HTTP 401: model 500x".into())));
        assert!(is_retryable(&StepwiseError::LlmRequest("connection refused".into())));
        assert!(is_retryable(&StepwiseError::LlmStream("eof".into())));
        assert!(!is_retryable(&StepwiseError::Cancelled));
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 1000,
            max_backoff_ms: 4000,
            attempt_timeout_secs: 60,
        };
        let d = calculate_backoff(9, &config);
        assert!(d <= Duration::from_millis(4800));
        assert!(d >= Duration::from_millis(3200));
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let primary = MockLlmClient::new()
            .with_error(StepwiseError::LlmRequest("HTTP 502: gateway".into()))
            .with_text_response("ok");
        let calls = primary.call_counter();
        let client = RetryingClient::new(Box::new(primary), vec![], fast_retry(2));

        let stream = client
            .chat_stream(&test_model_config(), vec![ChatMessage::user("hi")], &[])
            .await
            .unwrap();
        let deltas: Vec<_> = stream.collect().await;
        assert!(matches!(&deltas[0], Ok(StreamDelta::TextDelta(t)) if t == "ok"));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let primary = MockLlmClient::new()
            .with_error(StepwiseError::LlmRequest("HTTP 401: bad key".into()))
            .with_text_response("never");
        let calls = primary.call_counter();
        let fallback = MockLlmClient::new().with_text_response("fallback");
        let client = RetryingClient::new(
            Box::new(primary),
            vec![(test_model_config(), Box::new(fallback) as Box<dyn LlmClient>)],
            fast_retry(3),
        );

        let err = client
            .chat_stream(&test_model_config(), vec![ChatMessage::user("hi")], &[])
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("401"));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_falls_back_when_primary_unavailable() {
        let primary = MockLlmClient::new()
            .with_error(StepwiseError::LlmRequest("HTTP 503: down".into()))
            .with_error(StepwiseError::LlmRequest("HTTP 503: down".into()));
        let fallback = MockLlmClient::new().with_text_response("from fallback");
        let client = RetryingClient::new(
            Box::new(primary),
            vec![(test_model_config(), Box::new(fallback) as Box<dyn LlmClient>)],
            fast_retry(1),
        );

        let stream = client
            .chat_stream(&test_model_config(), vec![ChatMessage::user("hi")], &[])
            .await
            .unwrap();
        let deltas: Vec<_> = stream.collect().await;
        assert!(matches!(&deltas[0], Ok(StreamDelta::TextDelta(t)) if t == "from fallback"));
    }
}
