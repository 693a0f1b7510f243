//! Agent invocation: one LLM conversation with an optional tool-call loop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stepwise_core::config::{AppConfig, ModelConfig, RetryConfig};
use stepwise_core::error::{InvokerErrorKind, Result, StepwiseError};
use stepwise_core::traits::{LlmClient, ToolProvider};
use stepwise_core::types::{
    ChatMessage, ContentBlock, Role, StopReason, StreamDelta, ToolDefinition, ToolSpec,
};
use stepwise_llm::retry::calculate_backoff;

use crate::graph::OutputFormat;

/// Everything an agent node hands to the invoker, already resolved.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub instructions: String,
    /// Model id override for this call.
    pub model: Option<String>,
    pub tools: Vec<ToolSpec>,
    pub output_format: OutputFormat,
    pub max_tool_rounds: Option<u32>,
}

impl AgentRequest {
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            model: None,
            tools: vec![],
            output_format: OutputFormat::Text,
            max_tool_rounds: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentResult {
    /// The node output: the answer text, or the parsed JSON for structured output.
    pub output: Value,
    /// Raw final answer text.
    pub text: String,
    pub tool_rounds: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Calls a model on behalf of an agent node.
pub trait AgentInvoker: Send + Sync + 'static {
    fn invoke(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<AgentResult>>;
}

#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    input_json: String,
}

/// [`AgentInvoker`] over an [`LlmClient`] and a [`ToolProvider`].
///
/// Opening a stream is retried by the client (see `stepwise_llm::RetryingClient`).
/// A stream that breaks midway is retried here, a whole turn at a time.
pub struct LlmInvoker {
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolProvider>,
    model: ModelConfig,
    retry: RetryConfig,
    max_tool_rounds: u32,
    timeout: Duration,
}

impl LlmInvoker {
    pub fn new(llm: Arc<dyn LlmClient>, tools: Arc<dyn ToolProvider>, model: ModelConfig) -> Self {
        Self {
            llm,
            tools,
            retry: model.retry.clone().unwrap_or_default(),
            model,
            max_tool_rounds: 8,
            timeout: Duration::from_secs(120),
        }
    }

    pub fn from_config(
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolProvider>,
        config: &AppConfig,
    ) -> Self {
        Self::new(llm, tools, config.model.clone())
            .with_max_tool_rounds(config.engine.max_tool_rounds)
            .with_timeout(Duration::from_secs(config.engine.invoker_timeout_secs))
    }

    pub fn with_max_tool_rounds(mut self, rounds: u32) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn converse(&self, request: AgentRequest, cancel: CancellationToken) -> Result<AgentResult> {
        let model = match request.model.as_deref() {
            Some(id) => self.model.with_model(id),
            None => self.model.clone(),
        };

        let tool_defs = if request.tools.is_empty() {
            vec![]
        } else {
            self.tools.definitions(&request.tools).await.map_err(|e| {
                StepwiseError::invoker(
                    InvokerErrorKind::ToolFailed,
                    format!("tool discovery failed: {}", e),
                )
            })?
        };

        let mut messages = Vec::new();
        if let OutputFormat::Json { schema } = &request.output_format {
            messages.push(ChatMessage::system(json_instruction(schema.as_ref())));
        }
        messages.push(ChatMessage::user(request.instructions.as_str()));

        let allowed: HashSet<&str> = tool_defs.iter().map(|d| d.name.as_str()).collect();
        let max_rounds = request.max_tool_rounds.unwrap_or(self.max_tool_rounds);
        let mut rounds = 0u32;
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(StepwiseError::Cancelled);
            }

            let Turn {
                text,
                mut tool_calls,
                stop_reason,
                usage,
            } = self.turn(&model, &messages, &tool_defs, &cancel).await?;
            input_tokens += usage.0;
            output_tokens += usage.1;

            tool_calls.retain(|tc| !tc.name.is_empty());
            if tool_calls.is_empty() {
                if stop_reason == Some(StopReason::MaxTokens) {
                    warn!("Model hit max tokens; answer may be truncated");
                }
                info!(
                    tool_rounds = rounds,
                    input_tokens, output_tokens, "Agent invocation complete"
                );
                let output = match &request.output_format {
                    OutputFormat::Text => Value::String(text.clone()),
                    OutputFormat::Json { schema } => parse_structured(&text, schema.as_ref())?,
                };
                return Ok(AgentResult {
                    output,
                    text,
                    tool_rounds: rounds,
                    input_tokens,
                    output_tokens,
                });
            }

            if rounds >= max_rounds {
                return Err(StepwiseError::invoker(
                    InvokerErrorKind::ToolRoundsExhausted,
                    format!("model still requesting tools after {} rounds", max_rounds),
                ));
            }
            rounds += 1;

            let parsed: Vec<Value> = tool_calls
                .iter()
                .map(|tc| {
                    if tc.input_json.trim().is_empty() {
                        Value::Object(Default::default())
                    } else {
                        serde_json::from_str(&tc.input_json).unwrap_or(Value::Null)
                    }
                })
                .collect();

            let mut assistant = Vec::new();
            if !text.is_empty() {
                assistant.push(ContentBlock::Text { text });
            }
            for (tc, input) in tool_calls.iter().zip(parsed.iter()) {
                assistant.push(ContentBlock::ToolUse {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    input: input.clone(),
                });
            }
            messages.push(ChatMessage {
                role: Role::Assistant,
                content: assistant,
                timestamp: Some(chrono::Utc::now()),
            });

            let mut results = Vec::with_capacity(tool_calls.len());
            for (tc, input) in tool_calls.iter().zip(parsed) {
                if !allowed.contains(tc.name.as_str()) {
                    warn!(tool = %tc.name, "Model requested a tool this node does not declare");
                    results.push(ContentBlock::ToolResult {
                        tool_use_id: tc.id.clone(),
                        content: format!("tool '{}' is not available to this node", tc.name),
                        is_error: true,
                    });
                    continue;
                }
                debug!(tool = %tc.name, round = rounds, "Calling tool");
                let outcome = tokio::select! {
                    r = self.tools.call(&tc.name, input) => r,
                    _ = cancel.cancelled() => return Err(StepwiseError::Cancelled),
                };
                let (content, is_error) = match outcome {
                    Ok(out) => (out.content, out.is_error),
                    Err(e) => {
                        warn!(tool = %tc.name, error = %e, "Tool call failed");
                        (e.to_string(), true)
                    }
                };
                results.push(ContentBlock::ToolResult {
                    tool_use_id: tc.id.clone(),
                    content,
                    is_error,
                });
            }
            messages.push(ChatMessage {
                role: Role::User,
                content: results,
                timestamp: Some(chrono::Utc::now()),
            });
        }
    }
}

impl LlmInvoker {
    /// One model turn. A stream that breaks after it opened is retried from the
    /// start with backoff; failures to open are left to the client.
    async fn turn(
        &self,
        model: &ModelConfig,
        messages: &[ChatMessage],
        tool_defs: &[ToolDefinition],
        cancel: &CancellationToken,
    ) -> Result<Turn> {
        let mut attempt = 0u32;
        loop {
            let stream = tokio::select! {
                result = self.llm.chat_stream(model, messages.to_vec(), tool_defs) => {
                    result.map_err(upstream_error)?
                }
                _ = cancel.cancelled() => return Err(StepwiseError::Cancelled),
            };

            match read_turn(stream, cancel).await {
                Ok(turn) => return Ok(turn),
                Err(e) if stepwise_llm::is_retryable(&e) && attempt < self.retry.max_retries => {
                    let backoff = calculate_backoff(attempt, &self.retry);
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = self.retry.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Model stream broke, retrying turn"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return Err(StepwiseError::Cancelled),
                    }
                }
                Err(e) => return Err(upstream_error(e)),
            }
        }
    }
}

/// What one model turn produced. `usage` is (input, output) tokens.
struct Turn {
    text: String,
    tool_calls: Vec<ToolCallAccumulator>,
    stop_reason: Option<StopReason>,
    usage: (u64, u64),
}

async fn read_turn(
    mut stream: BoxStream<'_, Result<StreamDelta>>,
    cancel: &CancellationToken,
) -> Result<Turn> {
    let mut turn = Turn {
        text: String::new(),
        tool_calls: Vec::new(),
        stop_reason: None,
        usage: (0, 0),
    };

    loop {
        let delta = tokio::select! {
            delta = stream.next() => delta,
            _ = cancel.cancelled() => return Err(StepwiseError::Cancelled),
        };
        let Some(delta) = delta else { break };
        match delta? {
            StreamDelta::TextDelta(chunk) => turn.text.push_str(&chunk),
            StreamDelta::ToolUseStart { index, id, name } => {
                while turn.tool_calls.len() <= index {
                    turn.tool_calls.push(ToolCallAccumulator::default());
                }
                turn.tool_calls[index].id = id;
                turn.tool_calls[index].name = name;
            }
            StreamDelta::ToolInputDelta { index, delta } => {
                if let Some(tc) = turn.tool_calls.get_mut(index) {
                    tc.input_json.push_str(&delta);
                }
            }
            StreamDelta::Stop(reason) => turn.stop_reason = Some(reason),
            StreamDelta::Usage {
                input_tokens,
                output_tokens,
            } => {
                turn.usage.0 += input_tokens;
                turn.usage.1 += output_tokens;
            }
        }
    }
    Ok(turn)
}

impl AgentInvoker for LlmInvoker {
    fn invoke(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<AgentResult>> {
        Box::pin(async move {
            match tokio::time::timeout(self.timeout, self.converse(request, cancel)).await {
                Ok(result) => result,
                Err(_) => Err(StepwiseError::invoker(
                    InvokerErrorKind::Timeout,
                    format!("agent did not finish within {}s", self.timeout.as_secs()),
                )),
            }
        })
    }
}

/// Classify a model transport error that survived the client's own retries.
fn upstream_error(err: StepwiseError) -> StepwiseError {
    match err {
        StepwiseError::Cancelled | StepwiseError::Invoker { .. } => err,
        e if stepwise_llm::is_retryable(&e) => {
            StepwiseError::invoker(InvokerErrorKind::UpstreamUnavailable, e.to_string())
        }
        e => StepwiseError::invoker(InvokerErrorKind::UpstreamRejected, e.to_string()),
    }
}

fn json_instruction(schema: Option<&Value>) -> String {
    let mut text = String::from(
        "Reply with a single JSON value and nothing else. Do not wrap it in prose.",
    );
    if let Some(schema) = schema {
        text.push_str("\nThe value must conform to this JSON Schema:\n");
        text.push_str(&schema.to_string());
    }
    text
}

fn malformed(message: String, raw: &str) -> StepwiseError {
    StepwiseError::Invoker {
        kind: InvokerErrorKind::MalformedOutput,
        message,
        raw: Some(raw.to_string()),
    }
}

/// Parse a structured answer and check it against `schema`.
pub fn parse_structured(text: &str, schema: Option<&Value>) -> Result<Value> {
    let body = strip_code_fences(text);
    let value: Value = serde_json::from_str(&body)
        .map_err(|e| malformed(format!("answer is not valid JSON: {}", e), text))?;

    if let Some(schema) = schema {
        let compiled = jsonschema::JSONSchema::compile(schema)
            .map_err(|e| malformed(format!("invalid output schema: {}", e), text))?;
        let outcome = compiled
            .validate(&value)
            .map_err(|errors| errors.map(|e| e.to_string()).collect::<Vec<_>>());
        if let Err(details) = outcome {
            return Err(malformed(
                format!("answer does not match schema: {}", details.join("; ")),
                text,
            ));
        }
    }
    Ok(value)
}

fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Language tag, if any, runs to the end of the fence line
        let content_start = after.find('\n').map_or(0, |p| p + 1);
        let after = &after[content_start..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    trimmed.to_string()
}
