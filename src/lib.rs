//! Hibiki: conversation orchestration core for a streaming AI companion.
//!
//! A turn flows through a fixed set of stages:
//! User text → hooks → history → provider stream → token parser → hooks → history
//!
//! # Architecture
//!
//! - **Send pipeline** ([`chat::pipeline`]): runs one turn end to end and keeps
//!   the conversation history
//! - **Token parser** ([`chat::parser`]): splits streamed text into literal runs
//!   and `<|...|>` control markers
//! - **Effect queue** ([`chat::queue`]): applies tool calls and results to the
//!   in-flight message in arrival order
//! - **Hooks** ([`chat::hooks`]): eight ordered async callback channels
//! - **Idle talk** ([`idle`]): autonomous turns after a period of silence
//! - **Knowledge** ([`knowledge`]): retrieval store for topics and prompt context

pub mod bridge;
pub mod chat;
pub mod config;
pub mod error;
pub mod idle;
pub mod knowledge;
pub mod providers;

pub use bridge::{AudioCue, BridgeEvent};
pub use chat::{ChatPipeline, HookChannel, HookRegistry, SendOptions};
pub use config::CompanionConfig;
pub use error::{CompanionError, Result};
pub use idle::{IdleTalkEngine, TalkingFlag};
