//! Streaming send pipeline.
//!
//! [`ChatPipeline::send`] runs one conversational turn:
//!
//! ```text
//! beforeCompose → append user message → snapshot → afterCompose → beforeSend
//!   → provider stream (text → parser → tokenLiteral/tokenSpecial,
//!                      tool events → effect queue)
//!   → finish: flush parser, commit buffer, tokenLiteral(flush), streamEnd,
//!             assistantResponseEnd
//!   → afterSend
//! ```
//!
//! Turns are serialized: a `send` issued while another is streaming waits for
//! it to finish before composing. [`ChatPipeline::is_sending`] reports `true`
//! from the moment a send is entered until it returns, including while queued.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::{debug, error, info, warn};

use super::events::{FinishReason, StreamEvent};
use super::history::ConversationHistory;
use super::hooks::{HookChannel, HookRegistry};
use super::message::{
    AssistantMessage, Attachment, ChatMessage, ToolCallResult, UserMessage, compose_content,
};
use super::parser::{MarkerEvent, MarkerParser};
use super::provider::{ChatProvider, ProviderConfig, StreamOptions};
use super::queue::{EffectHandler, EffectQueue, EffectRecord};
use super::store::{HISTORY_KEY, HistoryStore};
use crate::config::ChatConfig;
use crate::error::Result;

/// Literal sent on the token channel after a response so speech output flushes.
pub const FLUSH_MARKER: &str = "\u{200B}\u{200B}";

/// Per-turn options for [`ChatPipeline::send`].
#[derive(Clone)]
pub struct SendOptions {
    /// Model identifier.
    pub model: String,
    /// Provider to stream from.
    pub provider: Arc<dyn ChatProvider>,
    /// Provider settings (headers).
    pub provider_config: ProviderConfig,
    /// Images attached to the message.
    pub attachments: Vec<Attachment>,
    /// When false the user message is sent to the provider but retracted
    /// from history before `afterCompose` fires.
    pub visible: bool,
}

impl std::fmt::Debug for SendOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendOptions")
            .field("model", &self.model)
            .field("provider", &self.provider.name())
            .field("attachments", &self.attachments.len())
            .field("visible", &self.visible)
            .finish()
    }
}

impl SendOptions {
    /// Visible turn with no attachments and default provider settings.
    pub fn new(model: impl Into<String>, provider: Arc<dyn ChatProvider>) -> Self {
        Self {
            model: model.into(),
            provider,
            provider_config: ProviderConfig::default(),
            attachments: Vec::new(),
            visible: true,
        }
    }

    /// Set provider settings.
    pub fn with_provider_config(mut self, config: ProviderConfig) -> Self {
        self.provider_config = config;
        self
    }

    /// Attach files.
    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Keep the user message out of the visible history.
    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }
}

/// Applies queued tool records to the in-flight assistant message.
struct StreamingBufferHandler {
    buffer: Arc<Mutex<AssistantMessage>>,
}

#[async_trait]
impl EffectHandler<EffectRecord> for StreamingBufferHandler {
    async fn handle(&self, record: EffectRecord) -> Result<()> {
        let mut buffer = lock(&self.buffer);
        match record {
            EffectRecord::ToolCall(call) => buffer.push_tool_call(call),
            EffectRecord::ToolCallResult(result) => buffer.push_tool_result(result),
        }
        Ok(())
    }
}

/// Decrements the in-flight counter when a send returns, however it returns.
struct SendingGuard<'a>(&'a AtomicUsize);

impl<'a> SendingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for SendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct PipelineState {
    history: Mutex<ConversationHistory>,
    persona: Mutex<String>,
    streaming: Arc<Mutex<AssistantMessage>>,
    in_flight: AtomicUsize,
    turn_lock: tokio::sync::Mutex<()>,
    /// Held across copy and save so saves land in mutation order.
    persist_lock: tokio::sync::Mutex<()>,
}

/// Orchestrates conversational turns. Cheap to clone; clones share state.
///
/// Configure with the `with_*` methods before cloning.
#[derive(Clone)]
pub struct ChatPipeline {
    state: Arc<PipelineState>,
    hooks: Arc<HookRegistry>,
    store: Option<Arc<dyn HistoryStore>>,
    min_literal_len: usize,
}

impl std::fmt::Debug for ChatPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatPipeline")
            .field("messages", &self.history_len())
            .field("sending", &self.is_sending())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl ChatPipeline {
    /// Create a pipeline with an in-memory history and its own hook registry.
    pub fn new(config: &ChatConfig) -> Self {
        Self {
            state: Arc::new(PipelineState {
                history: Mutex::new(ConversationHistory::new(&config.system_prompt)),
                persona: Mutex::new(config.system_prompt.clone()),
                streaming: Arc::new(Mutex::new(AssistantMessage::default())),
                in_flight: AtomicUsize::new(0),
                turn_lock: tokio::sync::Mutex::new(()),
                persist_lock: tokio::sync::Mutex::new(()),
            }),
            hooks: Arc::new(HookRegistry::new()),
            store: None,
            min_literal_len: config.min_literal_emit_length,
        }
    }

    /// Share an existing hook registry.
    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Persist history through `store` after every mutation.
    pub fn with_store(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the in-memory history with what the store holds.
    ///
    /// Returns `Ok(false)` when there is no store or nothing was saved yet.
    pub async fn load_history(&self) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let Some(messages) = store.load(HISTORY_KEY).await? else {
            return Ok(false);
        };
        let persona = lock(&self.state.persona).clone();
        let mut restored = ConversationHistory::from_messages(messages, &persona);
        restored.set_system_prompt(&persona);
        info!(messages = restored.len(), "restored conversation history");
        *lock(&self.state.history) = restored;
        Ok(true)
    }

    /// Hook registry the pipeline fires.
    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    /// Whether any send is in flight or queued.
    pub fn is_sending(&self) -> bool {
        self.state.in_flight.load(Ordering::SeqCst) > 0
    }

    /// Copy of the history.
    pub fn messages(&self) -> Vec<ChatMessage> {
        lock(&self.state.history).messages().to_vec()
    }

    /// Number of history entries.
    pub fn history_len(&self) -> usize {
        lock(&self.state.history).len()
    }

    /// Whether an assistant message exists at or after index `start`.
    pub fn has_assistant_since(&self, start: usize) -> bool {
        lock(&self.state.history).has_assistant_since(start)
    }

    /// Copy of the in-flight assistant message.
    pub fn streaming_message(&self) -> AssistantMessage {
        lock(&self.state.streaming).clone()
    }

    /// Current persona prompt (without the fixed formatting instructions).
    pub fn system_prompt(&self) -> String {
        lock(&self.state.persona).clone()
    }

    /// Change the persona prompt and regenerate the system message in place.
    pub async fn set_system_prompt(&self, persona: &str) {
        {
            *lock(&self.state.persona) = persona.to_owned();
            lock(&self.state.history).set_system_prompt(persona);
        }
        self.persist().await;
    }

    /// Reset the history to a single system message.
    pub async fn cleanup_messages(&self) {
        {
            let persona = lock(&self.state.persona).clone();
            lock(&self.state.history).reset(&persona);
        }
        self.persist().await;
    }

    /// Append a message produced outside a turn (bridged chat, errors).
    pub async fn push_message(&self, message: ChatMessage) {
        lock(&self.state.history).push(message);
        self.persist().await;
    }

    /// Drop every non-persistent hook. Call at the start of a new session.
    pub fn clear_hooks(&self) {
        self.hooks.clear_transient();
    }

    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let _ordered = self.state.persist_lock.lock().await;
        let messages = self.messages();
        if let Err(e) = store.save(HISTORY_KEY, &messages).await {
            warn!(error = %e, "failed to persist conversation history");
        }
    }

    /// Run one turn. Empty text without attachments is a silent no-op.
    ///
    /// # Errors
    ///
    /// Returns the first hook, provider, or stream error. The error is logged
    /// before it is returned.
    pub async fn send(&self, text: &str, options: SendOptions) -> Result<()> {
        let _sending = SendingGuard::enter(&self.state.in_flight);

        if text.is_empty() && options.attachments.is_empty() {
            debug!("ignoring empty send");
            return Ok(());
        }

        let _turn = self.state.turn_lock.lock().await;
        match self.run_turn(text, options).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "error sending message");
                Err(e)
            }
        }
    }

    async fn run_turn(&self, text: &str, options: SendOptions) -> Result<()> {
        self.hooks.fire(HookChannel::BeforeCompose, text).await?;

        let user = UserMessage::new(compose_content(text, &options.attachments));
        let user_id = user.id.clone();
        let snapshot = {
            let mut history = lock(&self.state.history);
            history.push(ChatMessage::User(user));
            let snapshot = history.provider_snapshot();
            if !options.visible {
                history.retract(&user_id);
            }
            snapshot
        };
        self.persist().await;

        *lock(&self.state.streaming) = AssistantMessage::default();
        let mut parser = MarkerParser::new(self.min_literal_len);
        let handler: Arc<dyn EffectHandler<EffectRecord>> = Arc::new(StreamingBufferHandler {
            buffer: Arc::clone(&self.state.streaming),
        });
        let queue = EffectQueue::new(handler);

        self.hooks.fire(HookChannel::AfterCompose, text).await?;
        self.hooks.fire(HookChannel::BeforeSend, text).await?;

        let stream_options = StreamOptions {
            headers: options.provider_config.headers.clone(),
        };
        debug!(
            provider = options.provider.name(),
            model = %options.model,
            messages = snapshot.len(),
            "streaming response"
        );
        let mut stream = options
            .provider
            .stream(&options.model, snapshot, stream_options)
            .await?;

        let mut full_text = String::new();
        let mut finished = false;
        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::ToolCall(call) => queue.enqueue(EffectRecord::ToolCall(call))?,
                StreamEvent::ToolResult {
                    tool_call_id,
                    result,
                } => queue.enqueue(EffectRecord::ToolCallResult(ToolCallResult {
                    id: tool_call_id,
                    result,
                }))?,
                StreamEvent::TextDelta { text: delta } => {
                    full_text.push_str(&delta);
                    let events = parser.consume(&delta);
                    self.dispatch_tokens(events).await?;
                }
                StreamEvent::Finish { finish_reason } => {
                    self.finish_turn(&mut parser, &queue, &full_text, finish_reason)
                        .await?;
                    finished = true;
                    break;
                }
            }
        }

        if !finished {
            warn!("provider stream closed without a finish event");
            self.finish_turn(&mut parser, &queue, &full_text, FinishReason::Other)
                .await?;
        }
        queue.close().await;

        self.hooks.fire(HookChannel::AfterSend, text).await
    }

    async fn dispatch_tokens(&self, events: Vec<MarkerEvent>) -> Result<()> {
        for event in events {
            match event {
                MarkerEvent::Literal(literal) => {
                    self.hooks.fire(HookChannel::TokenLiteral, &literal).await?;
                    lock(&self.state.streaming).push_text(&literal);
                }
                MarkerEvent::Special(special) => {
                    self.hooks.fire(HookChannel::TokenSpecial, &special).await?;
                }
            }
        }
        Ok(())
    }

    async fn finish_turn(
        &self,
        parser: &mut MarkerParser,
        queue: &EffectQueue<EffectRecord>,
        full_text: &str,
        finish_reason: FinishReason,
    ) -> Result<()> {
        self.dispatch_tokens(parser.end()).await?;
        queue.flush().await;

        let committed = {
            let message = std::mem::take(&mut *lock(&self.state.streaming));
            if message.is_empty() {
                false
            } else {
                lock(&self.state.history).push(ChatMessage::Assistant(message));
                true
            }
        };
        if committed {
            self.persist().await;
        }
        debug!(%finish_reason, committed, chars = full_text.chars().count(), "assistant response complete");

        self.hooks.fire(HookChannel::TokenLiteral, FLUSH_MARKER).await?;
        self.hooks.fire(HookChannel::StreamEnd, "").await?;
        self.hooks
            .fire(HookChannel::AssistantResponseEnd, full_text)
            .await
    }
}
