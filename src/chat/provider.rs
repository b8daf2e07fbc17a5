//! Model provider trait.
//!
//! A [`ChatProvider`] turns a provider-ready message list into a stream of
//! [`StreamEvent`]s. [`ScriptedProvider`] replays canned responses and records
//! what it was asked; it backs the demo's offline mode and the test suites.

use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use super::events::StreamEvent;
use super::message::ProviderMessage;
use crate::error::{CompanionError, Result};

/// A boxed stream of provider events. An `Err` item aborts the turn.
pub type ChatEventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Per-provider settings forwarded with each send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Extra HTTP headers.
    pub headers: BTreeMap<String, String>,
}

/// Options for one provider call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOptions {
    /// Extra HTTP headers.
    pub headers: BTreeMap<String, String>,
}

/// A model backend that can stream a response.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &str;

    /// Start streaming a response for `messages` from `model`.
    async fn stream(
        &self,
        model: &str,
        messages: Vec<ProviderMessage>,
        options: StreamOptions,
    ) -> Result<ChatEventStream>;
}

// ── Scripted provider ─────────────────────────────────────────

/// One scripted stream item.
#[derive(Debug, Clone)]
pub enum ScriptedItem {
    /// Yield this event.
    Event(StreamEvent),
    /// Yield a stream error with this message.
    Error(String),
}

/// What a [`ScriptedProvider`] was asked to do.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Requested model.
    pub model: String,
    /// Messages sent.
    pub messages: Vec<ProviderMessage>,
    /// Headers sent.
    pub headers: BTreeMap<String, String>,
}

enum ScriptedTurn {
    Items(Vec<ScriptedItem>),
    Reject(String),
}

/// Provider that replays queued turns in order.
///
/// Once the queue is empty every call answers `reply N` (N counting calls
/// from 1) followed by a normal finish.
#[derive(Default)]
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl std::fmt::Debug for ScriptedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedProvider")
            .field("calls", &self.call_count())
            .finish()
    }
}

impl ScriptedProvider {
    /// Create a provider with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a turn yielding `events`.
    pub fn with_turn(self, events: Vec<StreamEvent>) -> Self {
        self.push_items(events.into_iter().map(ScriptedItem::Event).collect());
        self
    }

    /// Queue a turn that streams `text` in one delta and finishes.
    pub fn with_reply(self, text: &str) -> Self {
        self.with_turn(vec![StreamEvent::text(text), StreamEvent::finish()])
    }

    /// Queue a turn built from raw items, including errors.
    pub fn with_items(self, items: Vec<ScriptedItem>) -> Self {
        self.push_items(items);
        self
    }

    /// Queue a turn whose `stream` call itself fails.
    pub fn with_rejection(self, message: &str) -> Self {
        if let Ok(mut turns) = self.turns.lock() {
            turns.push_back(ScriptedTurn::Reject(message.to_owned()));
        }
        self
    }

    fn push_items(&self, items: Vec<ScriptedItem>) {
        if let Ok(mut turns) = self.turns.lock() {
            turns.push_back(ScriptedTurn::Items(items));
        }
    }

    /// Number of `stream` calls so far.
    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Every request received, oldest first.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(
        &self,
        model: &str,
        messages: Vec<ProviderMessage>,
        options: StreamOptions,
    ) -> Result<ChatEventStream> {
        let call_number = {
            let mut requests = self
                .requests
                .lock()
                .map_err(|_| CompanionError::Provider("request log poisoned".into()))?;
            requests.push(RecordedRequest {
                model: model.to_owned(),
                messages,
                headers: options.headers,
            });
            requests.len()
        };

        let turn = self.turns.lock().ok().and_then(|mut t| t.pop_front());
        let items = match turn {
            Some(ScriptedTurn::Items(items)) => items,
            Some(ScriptedTurn::Reject(message)) => return Err(CompanionError::Provider(message)),
            None => vec![
                ScriptedItem::Event(StreamEvent::text(format!("reply {call_number}"))),
                ScriptedItem::Event(StreamEvent::finish()),
            ],
        };

        let stream = futures_util::stream::iter(items.into_iter().map(|item| match item {
            ScriptedItem::Event(event) => Ok(event),
            ScriptedItem::Error(message) => Err(CompanionError::Stream(message)),
        }));
        Ok(Box::pin(stream))
    }
}
