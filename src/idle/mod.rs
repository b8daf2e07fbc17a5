//! Idle-continuation engine.
//!
//! When nobody talks for `timeout_ms`, the engine starts an autonomous turn:
//! it either deepens its previous response (a continuation, bounded by
//! `max_context_continuation`) or opens a fresh topic drawn from the
//! retrieval store. The synthetic prompt is sent hidden, so only the reply
//! shows up in history.
//!
//! States:
//!
//! ```text
//!            timeout                      turn ends (any outcome)
//!   Idle ─────────────────▶ Talking ───────────────────────────▶ Idle
//!    ▲  │
//!    │  └── set_enabled(false) ──▶ Disabled ── set_enabled(true) ─┘
//! ```
//!
//! Exactly one timer is pending while enabled and idle. Every path that arms
//! the timer goes through [`IdleTalkEngine::rearm`], which cancels the
//! previous timer first and refuses to arm while a turn is active.

pub mod prompt;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chat::hooks::{HookOptions, HookToken};
use crate::chat::pipeline::{ChatPipeline, SendOptions};
use crate::chat::provider::{ChatProvider, ProviderConfig};
use crate::config::{IdleTalkConfig, TopicMode};
use crate::knowledge::{KnowledgeStore, Topic};

/// Interval between history checks while waiting for the reply.
const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Longest wait for the reply to show up in history.
const RESPONSE_WAIT_CEILING: Duration = Duration::from_secs(30);
/// Related items requested when building a continuation.
const CONTINUATION_CONTEXT_LIMIT: usize = 3;
/// Candidates requested when choosing a fresh topic.
const TOPIC_CANDIDATES: usize = 5;

// ── Shared talking flag ───────────────────────────────────────

/// Process-wide "an autonomous turn is in flight" signal.
///
/// Clones share the flag. Hand the same flag to every engine and to the
/// knowledge injector.
#[derive(Debug, Clone, Default)]
pub struct TalkingFlag(Arc<AtomicBool>);

impl TalkingFlag {
    /// Create a cleared flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a turn is in flight.
    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Set the flag if it was clear. Returns whether this call set it.
    pub fn try_begin(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Clear the flag.
    pub fn end(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ── Model resolution ──────────────────────────────────────────

/// The model an autonomous turn should use.
#[derive(Clone)]
pub struct ActiveModel {
    /// Model identifier.
    pub model: String,
    /// Provider serving it.
    pub provider: Arc<dyn ChatProvider>,
    /// Provider settings.
    pub provider_config: ProviderConfig,
}

impl std::fmt::Debug for ActiveModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveModel")
            .field("model", &self.model)
            .field("provider", &self.provider.name())
            .finish()
    }
}

/// Resolves the currently selected model, if any.
#[async_trait]
pub trait ModelSource: Send + Sync {
    /// The active model, or `None` when nothing is configured.
    async fn active_model(&self) -> Option<ActiveModel>;
}

/// A model source with a fixed answer.
#[derive(Debug, Clone, Default)]
pub struct StaticModelSource(Option<ActiveModel>);

impl StaticModelSource {
    /// Always resolve to `model`.
    pub fn new(model: ActiveModel) -> Self {
        Self(Some(model))
    }

    /// Never resolve.
    pub fn none() -> Self {
        Self(None)
    }
}

#[async_trait]
impl ModelSource for StaticModelSource {
    async fn active_model(&self) -> Option<ActiveModel> {
        self.0.clone()
    }
}

// ── State ─────────────────────────────────────────────────────

struct TimerHandle {
    token: CancellationToken,
    generation: u64,
}

struct IdleState {
    enabled: bool,
    last_interaction: Instant,
    timer: Option<TimerHandle>,
    last_response: Option<String>,
    initial_topic: Option<String>,
    continuation_count: u32,
    generation: u64,
}

impl IdleState {
    fn clear_context(&mut self) {
        self.last_response = None;
        self.initial_topic = None;
        self.continuation_count = 0;
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.token.cancel();
        }
    }
}

/// Point-in-time copy of the engine state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleSnapshot {
    /// Whether the engine is enabled.
    pub enabled: bool,
    /// Whether a timer is pending.
    pub timer_armed: bool,
    /// Whether an autonomous turn is in flight.
    pub talking: bool,
    /// Last assistant response, kept for continuation.
    pub last_response: Option<String>,
    /// Content of the topic that opened the current thread.
    pub initial_topic: Option<String>,
    /// Continuations of the current topic so far.
    pub continuation_count: u32,
    /// Last time the timer was reset.
    pub last_interaction: Instant,
}

fn lock(state: &Mutex<IdleState>) -> MutexGuard<'_, IdleState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct EngineInner {
    config: IdleTalkConfig,
    pipeline: ChatPipeline,
    knowledge: Arc<dyn KnowledgeStore>,
    models: Arc<dyn ModelSource>,
    talking: TalkingFlag,
    state: Mutex<IdleState>,
    hook_tokens: Mutex<Vec<HookToken>>,
}

// ── Engine ────────────────────────────────────────────────────

/// Timer-driven autonomous talk. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct IdleTalkEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for IdleTalkEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleTalkEngine")
            .field("state", &self.snapshot())
            .finish()
    }
}

impl IdleTalkEngine {
    /// Create an engine. Nothing happens until [`initialize`](Self::initialize).
    pub fn new(
        config: IdleTalkConfig,
        pipeline: ChatPipeline,
        knowledge: Arc<dyn KnowledgeStore>,
        models: Arc<dyn ModelSource>,
        talking: TalkingFlag,
    ) -> Self {
        let enabled = config.enabled;
        Self {
            inner: Arc::new(EngineInner {
                config,
                pipeline,
                knowledge,
                models,
                talking,
                state: Mutex::new(IdleState {
                    enabled,
                    last_interaction: Instant::now(),
                    timer: None,
                    last_response: None,
                    initial_topic: None,
                    continuation_count: 0,
                    generation: 0,
                }),
                hook_tokens: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register the persistent hooks and arm the first timer.
    ///
    /// No-op when disabled. Must be called inside a tokio runtime.
    pub fn initialize(&self) {
        let config = &self.inner.config;
        if !lock(&self.inner.state).enabled {
            info!("idle talk disabled");
            return;
        }
        info!(
            timeout_ms = config.timeout_ms,
            mode = ?config.mode,
            continue_context = config.continue_context,
            max_context_continuation = config.max_context_continuation,
            "initializing idle talk"
        );

        let mut tokens = self
            .inner
            .hook_tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if tokens.is_empty() {
            tokens.extend(self.register_hooks());
        }
        drop(tokens);

        self.rearm();
    }

    fn register_hooks(&self) -> [HookToken; 2] {
        let hooks = self.inner.pipeline.hooks();

        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let before_compose = hooks.on_before_message_composed(
            move |_| {
                let engine = weak.upgrade().map(|inner| IdleTalkEngine { inner });
                async move {
                    if let Some(engine) = engine {
                        engine.on_user_input();
                    }
                    Ok(())
                }
            },
            HookOptions::persistent(),
        );

        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let response_end = hooks.on_assistant_response_end(
            move |text| {
                let engine = weak.upgrade().map(|inner| IdleTalkEngine { inner });
                async move {
                    if let Some(engine) = engine {
                        engine.on_response_end(text);
                    }
                    Ok(())
                }
            },
            HookOptions::persistent(),
        );

        [before_compose, response_end]
    }

    fn on_user_input(&self) {
        if self.inner.talking.is_active() {
            debug!("autonomous turn in progress, keeping topic context");
            return;
        }
        lock(&self.inner.state).clear_context();
        info!("user input detected, cleared topic context");
    }

    fn on_response_end(&self, text: String) {
        debug!(chars = text.chars().count(), "storing response for continuation");
        lock(&self.inner.state).last_response = (!text.is_empty()).then_some(text);
        self.reset_idle_timer(false);
    }

    /// Record activity, optionally drop the topic context, and re-arm.
    pub fn reset_idle_timer(&self, clear_context: bool) {
        {
            let mut state = lock(&self.inner.state);
            state.last_interaction = Instant::now();
            if clear_context {
                state.clear_context();
                info!("topic context cleared");
            }
        }
        self.rearm();
    }

    /// Cancel any pending timer, then arm a new one if enabled and not talking.
    pub fn rearm(&self) {
        let mut state = lock(&self.inner.state);
        state.cancel_timer();
        if !state.enabled {
            debug!("idle talk disabled, timer not armed");
            return;
        }
        if self.inner.talking.is_active() {
            debug!("autonomous turn in progress, timer not armed");
            return;
        }

        state.generation += 1;
        let generation = state.generation;
        let token = CancellationToken::new();
        state.timer = Some(TimerHandle {
            token: token.clone(),
            generation,
        });
        drop(state);

        let timeout = Duration::from_millis(self.inner.config.timeout_ms);
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(inner) = weak.upgrade() {
                        IdleTalkEngine { inner }.on_timer_fired(generation).await;
                    }
                }
            }
        });
        debug!(generation, timeout_ms = self.inner.config.timeout_ms, "idle timer armed");
    }

    async fn on_timer_fired(&self, generation: u64) {
        {
            let mut state = lock(&self.inner.state);
            if state.timer.as_ref().map(|t| t.generation) != Some(generation) {
                debug!(generation, "ignoring stale idle timer");
                return;
            }
            state.timer = None;
        }
        self.handle_idle_timeout().await;
    }

    /// Run one autonomous turn if enabled and no turn is in flight.
    ///
    /// Whatever the outcome, the engine leaves the talking state and re-arms.
    pub async fn handle_idle_timeout(&self) {
        let enabled = lock(&self.inner.state).enabled;
        if !enabled {
            warn!("skipping idle timeout: disabled");
            return;
        }
        if self.inner.pipeline.is_sending() {
            info!("conversation in progress, deferring idle talk");
            self.rearm();
            return;
        }
        if !self.inner.talking.try_begin() {
            warn!("skipping idle timeout: autonomous turn already in progress");
            return;
        }
        lock(&self.inner.state).cancel_timer();

        info!("idle timeout, starting autonomous turn");
        self.run_autonomous_turn().await;

        self.inner.talking.end();
        self.rearm();
    }

    async fn run_autonomous_turn(&self) {
        let Some(prompt) = self.build_idle_talk_prompt().await else {
            warn!("failed to build idle talk prompt");
            return;
        };
        let Some(active) = self.inner.models.active_model().await else {
            warn!("no model configured for idle talk");
            return;
        };

        let pipeline = &self.inner.pipeline;
        let initial_len = pipeline.history_len();
        debug!(prompt = %prompt, "sending idle talk prompt");
        let options = SendOptions::new(active.model, active.provider)
            .with_provider_config(active.provider_config)
            .hidden();
        if let Err(e) = pipeline.send(&prompt, options).await {
            error!(error = %e, "idle talk turn failed");
            return;
        }

        let started = Instant::now();
        let deadline = started + RESPONSE_WAIT_CEILING;
        loop {
            if pipeline.has_assistant_since(initial_len) {
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "idle talk response received");
                return;
            }
            // Nothing left in flight that could still commit a response.
            if !pipeline.is_sending() {
                warn!("idle talk turn produced no response");
                return;
            }
            if Instant::now() >= deadline {
                warn!(
                    waited_ms = RESPONSE_WAIT_CEILING.as_millis() as u64,
                    "timed out waiting for idle talk response"
                );
                return;
            }
            tokio::time::sleep(RESPONSE_POLL_INTERVAL).await;
        }
    }

    /// Build the next autonomous prompt, or `None` when no topic is available.
    ///
    /// Continues the previous response while the continuation budget lasts,
    /// otherwise resets the topic context and picks a fresh topic.
    pub async fn build_idle_talk_prompt(&self) -> Option<String> {
        let config = &self.inner.config;
        let continue_from = {
            let state = lock(&self.inner.state);
            if config.continue_context
                && state.continuation_count < config.max_context_continuation
            {
                state.last_response.clone()
            } else {
                None
            }
        };

        if let Some(last_response) = continue_from {
            let related = match self
                .inner
                .knowledge
                .query_similar(
                    &last_response,
                    CONTINUATION_CONTEXT_LIMIT,
                    config.min_similarity,
                )
                .await
            {
                Ok(response) => {
                    let n = response.results.len().min(CONTINUATION_CONTEXT_LIMIT);
                    prompt::related_context_block(&response.results[..n])
                }
                Err(e) => {
                    warn!(error = %e, "related knowledge lookup failed, continuing without it");
                    String::new()
                }
            };

            let count = {
                let mut state = lock(&self.inner.state);
                state.continuation_count += 1;
                state.continuation_count
            };
            info!(
                count,
                max = config.max_context_continuation,
                "building continuation prompt"
            );
            return Some(prompt::continuation_prompt(&last_response, &related));
        }

        {
            let mut state = lock(&self.inner.state);
            if state.continuation_count >= config.max_context_continuation {
                info!("continuation limit reached, switching topic");
                state.clear_context();
            }
        }

        let topic = self.pick_topic().await?;
        {
            let mut state = lock(&self.inner.state);
            state.initial_topic = Some(topic.content.clone());
            state.continuation_count = 0;
        }
        Some(prompt::new_topic_prompt(&topic.content))
    }

    async fn pick_topic(&self) -> Option<Topic> {
        let mut topics = match self.inner.knowledge.random_topics(TOPIC_CANDIDATES).await {
            Ok(topics) => topics,
            Err(e) => {
                warn!(error = %e, "failed to fetch topics");
                return None;
            }
        };
        if topics.is_empty() {
            info!("retrieval store returned no topics");
            return None;
        }

        let index = match self.inner.config.mode {
            TopicMode::Random => rand::thread_rng().gen_range(0..topics.len()),
            TopicMode::Sequential => 0,
        };
        let topic = topics.swap_remove(index);
        info!(author = %topic.author, "selected topic");
        Some(topic)
    }

    /// Enable or disable the engine. Disabling cancels the pending timer.
    pub fn set_enabled(&self, enabled: bool) {
        {
            let mut state = lock(&self.inner.state);
            state.enabled = enabled;
            if !enabled {
                state.cancel_timer();
                info!("idle talk disabled");
                return;
            }
        }
        info!("idle talk enabled");
        self.rearm();
    }

    /// Cancel the pending timer. Context and hooks are left in place.
    pub fn dispose(&self) {
        lock(&self.inner.state).cancel_timer();
        info!("idle talk monitoring stopped");
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> IdleSnapshot {
        let state = lock(&self.inner.state);
        IdleSnapshot {
            enabled: state.enabled,
            timer_armed: state.timer.is_some(),
            talking: self.inner.talking.is_active(),
            last_response: state.last_response.clone(),
            initial_topic: state.initial_topic.clone(),
            continuation_count: state.continuation_count,
            last_interaction: state.last_interaction,
        }
    }

    /// Hook registrations made by [`initialize`](Self::initialize).
    pub fn hook_tokens(&self) -> Vec<HookToken> {
        self.inner
            .hook_tokens
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }
}
