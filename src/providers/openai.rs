//! OpenAI-compatible Chat Completions provider.
//!
//! Streams `POST {base_url}/v1/chat/completions` with `stream: true` and
//! normalizes the `data: {...}` chunks into [`StreamEvent`]s. Works with any
//! server speaking the same protocol (Ollama, vLLM, LM Studio, OpenRouter).
//!
//! Tool calls arrive as indexed argument fragments; they are accumulated and
//! emitted as complete [`ToolCall`]s once the model reports `tool_calls` as
//! its finish reason or the stream closes.

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tracing::debug;

use super::sse::{SseEvent, SseLineParser};
use crate::chat::events::{FinishReason, StreamEvent};
use crate::chat::message::{ProviderMessage, ToolCall};
use crate::chat::provider::{ChatEventStream, ChatProvider, StreamOptions};
use crate::error::{CompanionError, Result};

// ── Configuration ─────────────────────────────────────────────

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Base URL without the `/v1/...` path.
    pub base_url: String,
    /// Bearer token, if required.
    pub api_key: Option<String>,
}

impl OpenAiConfig {
    /// Settings for `base_url` without authentication.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
        }
    }

    /// Set the bearer token.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

// ── Request building ──────────────────────────────────────────

/// Convert provider messages to the Chat Completions wire format.
pub fn messages_to_openai(messages: &[ProviderMessage]) -> serde_json::Value {
    let converted: Vec<serde_json::Value> = messages
        .iter()
        .map(|msg| match msg {
            ProviderMessage::System { content } => {
                serde_json::json!({ "role": "system", "content": content })
            }
            ProviderMessage::User { content } => {
                serde_json::json!({ "role": "user", "content": content })
            }
            ProviderMessage::Assistant { content, .. } => {
                serde_json::json!({ "role": "assistant", "content": content })
            }
            ProviderMessage::Tool {
                tool_call_id,
                content,
            } => serde_json::json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "content": content,
            }),
        })
        .collect();
    serde_json::Value::Array(converted)
}

/// Build the JSON body for a streaming completion.
pub fn build_completions_request(model: &str, messages: &[ProviderMessage]) -> serde_json::Value {
    serde_json::json!({
        "model": model,
        "messages": messages_to_openai(messages),
        "stream": true,
    })
}

// ── Response parsing ──────────────────────────────────────────

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Other,
    }
}

#[derive(Debug, Default, Clone)]
struct PartialToolCall {
    id: String,
    name: String,
    args: String,
}

/// Collects streamed tool-call fragments keyed by their index.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u64, PartialToolCall>,
}

impl ToolCallAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one fragment into the call at `index`.
    pub fn process_chunk(
        &mut self,
        index: u64,
        id: Option<&str>,
        name: Option<&str>,
        args_fragment: Option<&str>,
    ) {
        let call = self.calls.entry(index).or_default();
        if let Some(id) = id.filter(|s| !s.is_empty()) {
            call.id = id.to_owned();
        }
        if let Some(name) = name.filter(|s| !s.is_empty()) {
            call.name = name.to_owned();
        }
        if let Some(args) = args_fragment {
            call.args.push_str(args);
        }
    }

    /// Take every accumulated call in index order.
    pub fn finish_all(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.calls)
            .into_values()
            .map(|c| ToolCall {
                tool_call_id: c.id,
                tool_name: c.name,
                args: c.args,
            })
            .collect()
    }

    /// Whether any call is pending.
    pub fn has_active_calls(&self) -> bool {
        !self.calls.is_empty()
    }
}

/// Parse one `data:` payload into events. Unparseable payloads yield nothing.
pub fn parse_completions_chunk(
    data: &str,
    accumulator: &mut ToolCallAccumulator,
) -> Vec<StreamEvent> {
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(data) else {
        debug!(data, "skipping unparseable completion chunk");
        return Vec::new();
    };

    let mut events = Vec::new();
    let Some(choices) = parsed.get("choices").and_then(|c| c.as_array()) else {
        return events;
    };

    for choice in choices {
        if let Some(delta) = choice.get("delta") {
            if let Some(content) = delta.get("content").and_then(|c| c.as_str())
                && !content.is_empty()
            {
                events.push(StreamEvent::text(content));
            }

            if let Some(tool_calls) = delta.get("tool_calls").and_then(|tc| tc.as_array()) {
                for tc in tool_calls {
                    let index = tc.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                    let id = tc.get("id").and_then(|i| i.as_str());
                    let function = tc.get("function");
                    let name = function.and_then(|f| f.get("name")).and_then(|n| n.as_str());
                    let args = function
                        .and_then(|f| f.get("arguments"))
                        .and_then(|a| a.as_str());
                    accumulator.process_chunk(index, id, name, args);
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(|f| f.as_str()) {
            events.extend(accumulator.finish_all().into_iter().map(StreamEvent::ToolCall));
            events.push(StreamEvent::Finish {
                finish_reason: map_finish_reason(reason),
            });
        }
    }

    events
}

/// Pull `error.message` out of an error body, falling back to the raw body.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.to_owned())
}

fn map_http_error(status: reqwest::StatusCode, body: &str) -> CompanionError {
    let message = extract_error_message(body);
    match status.as_u16() {
        401 => CompanionError::Provider(format!("authentication failed: {message}")),
        429 => CompanionError::Provider(format!("rate limited: {message}")),
        code => CompanionError::Provider(format!("HTTP {code}: {message}")),
    }
}

// ── Adapter ───────────────────────────────────────────────────

/// Streaming provider for OpenAI-compatible endpoints.
pub struct OpenAiProvider {
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("base_url", &self.config.base_url)
            .field("authenticated", &self.config.api_key.is_some())
            .finish()
    }
}

impl OpenAiProvider {
    /// Create a provider with a fresh HTTP client.
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn stream(
        &self,
        model: &str,
        messages: Vec<ProviderMessage>,
        options: StreamOptions,
    ) -> Result<ChatEventStream> {
        let body = build_completions_request(model, &messages);
        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| CompanionError::Provider(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(map_http_error(status, &body_text));
        }

        Ok(Box::pin(create_event_stream(response.bytes_stream())))
    }
}

struct StreamState {
    byte_stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    sse_parser: SseLineParser,
    accumulator: ToolCallAccumulator,
    buffered: std::collections::VecDeque<Result<StreamEvent>>,
    done: bool,
}

impl StreamState {
    fn absorb(&mut self, event: SseEvent) {
        if event.is_done() {
            return;
        }
        for parsed in parse_completions_chunk(&event.data, &mut self.accumulator) {
            self.buffered.push_back(Ok(parsed));
        }
    }
}

/// Turn a response body into a stream of events.
fn create_event_stream(
    byte_stream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
) -> impl Stream<Item = Result<StreamEvent>> + Send {
    futures_util::stream::unfold(
        StreamState {
            byte_stream: Box::pin(byte_stream),
            sse_parser: SseLineParser::new(),
            accumulator: ToolCallAccumulator::new(),
            buffered: std::collections::VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(item) = state.buffered.pop_front() {
                    return Some((item, state));
                }
                if state.done {
                    return None;
                }

                match state.byte_stream.next().await {
                    Some(Ok(chunk)) => {
                        for event in state.sse_parser.push(&chunk) {
                            state.absorb(event);
                        }
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((
                            Err(CompanionError::Stream(format!("stream read error: {e}"))),
                            state,
                        ));
                    }
                    None => {
                        state.done = true;
                        if let Some(event) = state.sse_parser.flush() {
                            state.absorb(event);
                        }
                        let pending = state.accumulator.finish_all();
                        state
                            .buffered
                            .extend(pending.into_iter().map(|c| Ok(StreamEvent::ToolCall(c))));
                    }
                }
            }
        },
    )
}
