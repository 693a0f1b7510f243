use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use stepwise_core::config::ModelConfig;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::LlmClient;
use stepwise_core::types::*;

use crate::streaming::{SseEvent, SseStream};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API client.
pub struct AnthropicClient {
    http: Client,
}

impl AnthropicClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for AnthropicClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
}

#[derive(Serialize, Debug)]
struct ApiMessage {
    role: &'static str,
    content: serde_json::Value,
}

#[derive(Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SseData {
    MessageStart {
        message: MessageInfo,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlockInfo,
    },
    ContentBlockDelta {
        index: usize,
        delta: DeltaInfo,
    },
    ContentBlockStop {},
    MessageDelta {
        delta: MessageDeltaInfo,
        #[serde(default)]
        usage: Option<UsageInfo>,
    },
    MessageStop {},
    Ping {},
    Error {
        error: ApiError,
    },
}

#[derive(Deserialize, Debug)]
struct MessageInfo {
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct UsageInfo {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlockInfo {
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DeltaInfo {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
struct MessageDeltaInfo {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

fn convert_messages(messages: Vec<ChatMessage>) -> (Option<String>, Vec<ApiMessage>) {
    let mut system: Option<String> = None;
    let mut api_msgs = Vec::new();

    for msg in messages {
        let role = match msg.role {
            Role::System => {
                let text = msg.text();
                system = Some(match system {
                    Some(prev) => format!("{}\n\n{}", prev, text),
                    None => text,
                });
                continue;
            }
            Role::Assistant => "assistant",
            // Tool results travel as user turns
            Role::User | Role::Tool => "user",
        };
        api_msgs.push(ApiMessage {
            role,
            content: convert_content_blocks(&msg.content),
        });
    }

    (system, api_msgs)
}

fn convert_content_blocks(blocks: &[ContentBlock]) -> serde_json::Value {
    if let [ContentBlock::Text { text }] = blocks {
        return serde_json::Value::String(text.clone());
    }

    blocks
        .iter()
        .map(|b| match b {
            ContentBlock::Text { text } => serde_json::json!({
                "type": "text",
                "text": text,
            }),
            ContentBlock::ToolUse { id, name, input } => serde_json::json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": input,
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => serde_json::json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error,
            }),
        })
        .collect::<Vec<_>>()
        .into()
}

fn usage_delta(usage: UsageInfo) -> Result<StreamDelta> {
    Ok(StreamDelta::Usage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
    })
}

fn parse_sse_to_deltas(event: SseEvent) -> Vec<Result<StreamDelta>> {
    let data: SseData = match serde_json::from_str(&event.data) {
        Ok(data) => data,
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse Anthropic SSE data");
            return vec![];
        }
    };

    match data {
        SseData::MessageStart { message } => message.usage.map(usage_delta).into_iter().collect(),
        SseData::ContentBlockStart {
            index,
            content_block: ContentBlockInfo::ToolUse { id, name },
        } => vec![Ok(StreamDelta::ToolUseStart { index, id, name })],
        SseData::ContentBlockDelta { index, delta } => match delta {
            DeltaInfo::TextDelta { text } => vec![Ok(StreamDelta::TextDelta(text))],
            DeltaInfo::InputJsonDelta { partial_json } => vec![Ok(StreamDelta::ToolInputDelta {
                index,
                delta: partial_json,
            })],
            DeltaInfo::Other => vec![],
        },
        SseData::MessageDelta { delta, usage } => {
            let mut deltas = Vec::new();
            if let Some(usage) = usage {
                debug!(output_tokens = usage.output_tokens, "Token usage");
                deltas.push(usage_delta(usage));
            }
            let stop = match delta.stop_reason.as_deref() {
                Some("end_turn") => Some(StopReason::EndTurn),
                Some("tool_use") => Some(StopReason::ToolUse),
                Some("max_tokens") => Some(StopReason::MaxTokens),
                Some("stop_sequence") => Some(StopReason::StopSequence),
                _ => None,
            };
            deltas.extend(stop.map(|s| Ok(StreamDelta::Stop(s))));
            deltas
        }
        SseData::Error { error } => vec![Err(StepwiseError::LlmStream(error.message))],
        SseData::ContentBlockStart { .. }
        | SseData::ContentBlockStop {}
        | SseData::MessageStop {}
        | SseData::Ping {} => vec![],
    }
}

impl LlmClient for AnthropicClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let config = config.clone();
        let tools = tools.to_vec();

        Box::pin(async move {
            let api_key = config
                .api_key
                .as_deref()
                .ok_or_else(|| StepwiseError::Config("Anthropic API key not set".into()))?;

            let base_url = config.base_url.as_deref().unwrap_or(ANTHROPIC_API_URL);

            let (system, api_messages) = convert_messages(messages);

            let body = AnthropicRequest {
                model: config.model_id.clone(),
                max_tokens: config.max_tokens,
                temperature: (config.temperature > 0.0).then_some(config.temperature),
                messages: api_messages,
                system,
                stream: true,
                tools: tools
                    .iter()
                    .map(|t| ApiTool {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        input_schema: t.input_schema.clone(),
                    })
                    .collect(),
            };

            let mut req = self
                .http
                .post(base_url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json");
            for (k, v) in &config.extra_headers {
                req = req.header(k.as_str(), v.as_str());
            }

            let response = req
                .json(&body)
                .send()
                .await
                .map_err(|e| StepwiseError::LlmRequest(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown error".to_string());
                return Err(StepwiseError::LlmRequest(format!("HTTP {}: {}", status, body)));
            }

            let delta_stream = SseStream::new(response.bytes_stream())
                .map(|event| futures::stream::iter(parse_sse_to_deltas(event)))
                .flatten();

            Ok(Box::pin(delta_stream) as BoxStream<'_, Result<StreamDelta>>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(data: &str) -> SseEvent {
        SseEvent {
            event_type: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn test_message_start_emits_usage() {
        let deltas = parse_sse_to_deltas(event(
            r#"{"type":"message_start","message":{"id":"m1","usage":{"input_tokens":12,"output_tokens":1}}}"#,
        ));
        assert!(matches!(
            &deltas[0],
            Ok(StreamDelta::Usage {
                input_tokens: 12,
                ..
            })
        ));
    }

    #[test]
    fn test_tool_use_block() {
        let start = parse_sse_to_deltas(event(
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"tu_1","name":"mcp__s__t","input":{}}}"#,
        ));
        assert!(matches!(&start[0], Ok(StreamDelta::ToolUseStart { index: 1, .. })));

        let delta = parse_sse_to_deltas(event(
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"a\""}}"#,
        ));
        assert!(matches!(&delta[0], Ok(StreamDelta::ToolInputDelta { delta, .. }) if delta == "{\"a\""));
    }

    #[test]
    fn test_text_block_start_is_silent() {
        let deltas = parse_sse_to_deltas(event(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
        ));
        assert!(deltas.is_empty());
    }

    #[test]
    fn test_message_delta_stop_and_usage() {
        let deltas = parse_sse_to_deltas(event(
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":9}}"#,
        ));
        assert_eq!(deltas.len(), 2);
        assert!(matches!(&deltas[1], Ok(StreamDelta::Stop(StopReason::ToolUse))));
    }

    #[test]
    fn test_error_event() {
        let deltas = parse_sse_to_deltas(event(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        ));
        assert!(matches!(&deltas[0], Err(StepwiseError::LlmStream(m)) if m == "Overloaded"));
    }

    #[test]
    fn test_system_messages_are_lifted() {
        let (system, msgs) = convert_messages(vec![
            ChatMessage::system("be terse"),
            ChatMessage::user("hi"),
        ]);
        assert_eq!(system.as_deref(), Some("be terse"));
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, serde_json::json!("hi"));
    }
}
