//! Conversation orchestration: messages, token parsing, effect queueing,
//! hooks, history persistence, and the streaming send pipeline.

pub mod events;
pub mod history;
pub mod hooks;
pub mod message;
pub mod parser;
pub mod pipeline;
pub mod provider;
pub mod queue;
pub mod store;

pub use events::{FinishReason, StreamEvent};
pub use history::ConversationHistory;
pub use hooks::{HookChannel, HookOptions, HookRegistry, HookToken};
pub use message::{AssistantMessage, Attachment, ChatMessage, ProviderMessage, Slice};
pub use pipeline::{ChatPipeline, FLUSH_MARKER, SendOptions};
pub use provider::{ChatEventStream, ChatProvider, ProviderConfig, StreamOptions};
pub use store::{FsHistoryStore, HISTORY_KEY, HistoryStore, MemoryHistoryStore};
