//! Hook registry: eight ordered extension channels fired by the send pipeline.
//!
//! Callbacks on one channel run sequentially in registration order. The first
//! callback that fails aborts the rest of that firing and its error is returned
//! to whoever fired the channel. Entries registered without
//! [`HookOptions::persistent`] are dropped by [`HookRegistry::clear_transient`].
//!
//! ```
//! use hibiki::chat::hooks::{HookChannel, HookOptions, HookRegistry};
//!
//! # tokio_test_block(async {
//! let hooks = HookRegistry::new();
//! let token = hooks.on_before_send(|text| async move {
//!     println!("sending {text}");
//!     Ok(())
//! }, HookOptions::default());
//! hooks.fire(HookChannel::BeforeSend, "hello").await.unwrap();
//! assert!(hooks.unregister(token));
//! # });
//! # fn tokio_test_block(f: impl std::future::Future<Output = ()>) {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use tracing::debug;

use crate::error::Result;

/// Pipeline stage a hook is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookChannel {
    /// Before the user message is built. Payload: outgoing text.
    BeforeCompose,
    /// After the message is in history and snapshotted. Payload: outgoing text.
    AfterCompose,
    /// Right before the provider call. Payload: outgoing text.
    BeforeSend,
    /// After the provider stream completed. Payload: outgoing text.
    AfterSend,
    /// A literal text run (or the flush marker). Payload: the text.
    TokenLiteral,
    /// A control marker. Payload: the marker.
    TokenSpecial,
    /// The provider stream finished. No payload.
    StreamEnd,
    /// The full response text is known. Payload: the text.
    AssistantResponseEnd,
}

impl HookChannel {
    /// Every channel, in pipeline order.
    pub const ALL: [HookChannel; 8] = [
        Self::BeforeCompose,
        Self::AfterCompose,
        Self::BeforeSend,
        Self::AfterSend,
        Self::TokenLiteral,
        Self::TokenSpecial,
        Self::StreamEnd,
        Self::AssistantResponseEnd,
    ];

    fn index(self) -> usize {
        match self {
            Self::BeforeCompose => 0,
            Self::AfterCompose => 1,
            Self::BeforeSend => 2,
            Self::AfterSend => 3,
            Self::TokenLiteral => 4,
            Self::TokenSpecial => 5,
            Self::StreamEnd => 6,
            Self::AssistantResponseEnd => 7,
        }
    }
}

impl std::fmt::Display for HookChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::BeforeCompose => "before_compose",
            Self::AfterCompose => "after_compose",
            Self::BeforeSend => "before_send",
            Self::AfterSend => "after_send",
            Self::TokenLiteral => "token_literal",
            Self::TokenSpecial => "token_special",
            Self::StreamEnd => "stream_end",
            Self::AssistantResponseEnd => "assistant_response_end",
        };
        f.write_str(name)
    }
}

/// Boxed callback future.
pub type HookFuture = BoxFuture<'static, Result<()>>;

/// A registered callback. Receives the channel payload by value.
pub type HookCallback = Arc<dyn Fn(String) -> HookFuture + Send + Sync>;

/// Registration options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookOptions {
    /// Survive [`HookRegistry::clear_transient`].
    pub persistent: bool,
}

impl HookOptions {
    /// Options for a persistent hook.
    pub fn persistent() -> Self {
        Self { persistent: true }
    }
}

/// Handle for removing one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookToken {
    channel: HookChannel,
    id: u64,
}

impl HookToken {
    /// Channel the hook was registered on.
    pub fn channel(&self) -> HookChannel {
        self.channel
    }
}

struct HookEntry {
    id: u64,
    callback: HookCallback,
    persistent: bool,
}

/// Ordered callback lists, one per [`HookChannel`].
#[derive(Default)]
pub struct HookRegistry {
    channels: Mutex<[Vec<HookEntry>; 8]>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: Vec<(HookChannel, usize)> =
            HookChannel::ALL.iter().map(|c| (*c, self.len(*c))).collect();
        f.debug_struct("HookRegistry")
            .field("hooks", &counts)
            .finish()
    }
}

impl HookRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, [Vec<HookEntry>; 8]> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append `callback` to `channel`.
    pub fn register(
        &self,
        channel: HookChannel,
        callback: HookCallback,
        options: HookOptions,
    ) -> HookToken {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()[channel.index()].push(HookEntry {
            id,
            callback,
            persistent: options.persistent,
        });
        HookToken { channel, id }
    }

    /// Append an async closure to `channel`.
    pub fn register_fn<F, Fut>(&self, channel: HookChannel, f: F, options: HookOptions) -> HookToken
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let callback: HookCallback = Arc::new(move |payload| Box::pin(f(payload)));
        self.register(channel, callback, options)
    }

    /// Remove the registration behind `token`. Returns whether it was present.
    pub fn unregister(&self, token: HookToken) -> bool {
        let mut channels = self.lock();
        let entries = &mut channels[token.channel.index()];
        let before = entries.len();
        entries.retain(|e| e.id != token.id);
        entries.len() != before
    }

    /// Run every callback on `channel` in order, stopping at the first error.
    ///
    /// The list is snapshotted first, so callbacks may register or unregister
    /// hooks without affecting the current firing.
    pub async fn fire(&self, channel: HookChannel, payload: &str) -> Result<()> {
        let callbacks: Vec<HookCallback> = self.lock()[channel.index()]
            .iter()
            .map(|e| Arc::clone(&e.callback))
            .collect();

        for (position, callback) in callbacks.iter().enumerate() {
            if let Err(e) = callback(payload.to_owned()).await {
                debug!(%channel, position, error = %e, "hook failed, aborting remaining callbacks");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Drop every non-persistent registration on every channel.
    pub fn clear_transient(&self) {
        let mut channels = self.lock();
        for entries in channels.iter_mut() {
            entries.retain(|e| e.persistent);
        }
    }

    /// Number of callbacks registered on `channel`.
    pub fn len(&self, channel: HookChannel) -> usize {
        self.lock()[channel.index()].len()
    }

    // ── Typed registration ────────────────────────────────────

    /// Hook run before the user message is composed.
    pub fn on_before_message_composed<F, Fut>(&self, f: F, options: HookOptions) -> HookToken
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register_fn(HookChannel::BeforeCompose, f, options)
    }

    /// Hook run after the user message is composed.
    pub fn on_after_message_composed<F, Fut>(&self, f: F, options: HookOptions) -> HookToken
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register_fn(HookChannel::AfterCompose, f, options)
    }

    /// Hook run before the provider is called.
    pub fn on_before_send<F, Fut>(&self, f: F, options: HookOptions) -> HookToken
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register_fn(HookChannel::BeforeSend, f, options)
    }

    /// Hook run after the provider stream completes.
    pub fn on_after_send<F, Fut>(&self, f: F, options: HookOptions) -> HookToken
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register_fn(HookChannel::AfterSend, f, options)
    }

    /// Hook run for every literal text run.
    pub fn on_token_literal<F, Fut>(&self, f: F, options: HookOptions) -> HookToken
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register_fn(HookChannel::TokenLiteral, f, options)
    }

    /// Hook run for every control marker.
    pub fn on_token_special<F, Fut>(&self, f: F, options: HookOptions) -> HookToken
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register_fn(HookChannel::TokenSpecial, f, options)
    }

    /// Hook run when the provider stream finishes.
    pub fn on_stream_end<F, Fut>(&self, f: F, options: HookOptions) -> HookToken
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register_fn(HookChannel::StreamEnd, move |_| f(), options)
    }

    /// Hook run with the full response text.
    pub fn on_assistant_response_end<F, Fut>(&self, f: F, options: HookOptions) -> HookToken
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register_fn(HookChannel::AssistantResponseEnd, f, options)
    }
}
