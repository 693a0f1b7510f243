use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use stepwise_core::config::ModelConfig;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::LlmClient;
use stepwise_core::types::*;

enum Scripted {
    Deltas(Vec<StreamDelta>),
    Fail(StepwiseError),
    Broken(Vec<StreamDelta>, StepwiseError),
}

/// LLM client that replays scripted turns in order and records every request.
///
/// When the script runs out, requests fail with a non-retryable `HTTP 400`.
#[derive(Clone, Default)]
pub struct MockLlmClient {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    requests: Arc<Mutex<Vec<(ModelConfig, Vec<ChatMessage>, Vec<ToolDefinition>)>>>,
    calls: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// A turn that streams `text` and ends.
    pub fn with_text_response(self, text: &str) -> Self {
        self.push(Scripted::Deltas(vec![
            StreamDelta::TextDelta(text.to_string()),
            StreamDelta::Usage {
                input_tokens: 10,
                output_tokens: 5,
            },
            StreamDelta::Stop(StopReason::EndTurn),
        ]))
    }

    /// A turn that requests one tool call. Arguments are streamed in two pieces.
    pub fn with_tool_call(self, id: &str, name: &str, arguments: serde_json::Value) -> Self {
        let args = arguments.to_string();
        let (head, tail) = args.split_at(args.len() / 2);
        self.push(Scripted::Deltas(vec![
            StreamDelta::ToolUseStart {
                index: 0,
                id: id.to_string(),
                name: name.to_string(),
            },
            StreamDelta::ToolInputDelta {
                index: 0,
                delta: head.to_string(),
            },
            StreamDelta::ToolInputDelta {
                index: 0,
                delta: tail.to_string(),
            },
            StreamDelta::Stop(StopReason::ToolUse),
        ]))
    }

    /// A turn whose request fails before any stream is returned.
    pub fn with_error(self, error: StepwiseError) -> Self {
        self.push(Scripted::Fail(error))
    }

    /// A turn whose stream yields `partial` text and then fails with `error`.
    pub fn with_stream_error(self, partial: &str, error: StepwiseError) -> Self {
        self.push(Scripted::Broken(
            vec![StreamDelta::TextDelta(partial.to_string())],
            error,
        ))
    }

    /// Sleep before answering each request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    /// Messages of every request received so far.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, messages, _)| messages.clone())
            .collect()
    }

    /// Model ids of every request received so far.
    pub fn models(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(config, _, _)| config.model_id.clone())
            .collect()
    }

    /// Tool names offered on every request received so far.
    pub fn offered_tools(&self) -> Vec<Vec<String>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, tools)| tools.iter().map(|t| t.name.clone()).collect())
            .collect()
    }

    fn push(self, turn: Scripted) -> Self {
        self.script.lock().unwrap().push_back(turn);
        self
    }
}

impl LlmClient for MockLlmClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap()
            .push((config.clone(), messages, tools.to_vec()));
        let next = self.script.lock().unwrap().pop_front();
        let delay = self.delay;

        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match next {
                Some(Scripted::Deltas(deltas)) => {
                    let stream = futures::stream::iter(deltas.into_iter().map(Ok));
                    Ok(Box::pin(stream) as BoxStream<'_, Result<StreamDelta>>)
                }
                Some(Scripted::Broken(deltas, e)) => {
                    let items = deltas.into_iter().map(Ok).chain(std::iter::once(Err(e)));
                    let stream = futures::stream::iter(items);
                    Ok(Box::pin(stream) as BoxStream<'_, Result<StreamDelta>>)
                }
                Some(Scripted::Fail(e)) => Err(e),
                None => Err(StepwiseError::LlmRequest(
                    "HTTP 400: no scripted response left".into(),
                )),
            }
        })
    }
}
