//! Normalized streaming events produced by a model provider.
//!
//! A typical stream flows:
//! ```text
//! TextDelta* → Finish
//! ```
//!
//! With tools:
//! ```text
//! TextDelta* → ToolCall → ToolResult → TextDelta* → Finish
//! ```

use serde::{Deserialize, Serialize};

use super::message::ToolCall;

/// A single event from a provider stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A chunk of generated text.
    TextDelta {
        /// The text fragment.
        text: String,
    },
    /// The model issued a tool call.
    ToolCall(ToolCall),
    /// A tool call produced a result.
    ToolResult {
        /// The call this result answers.
        tool_call_id: String,
        /// Result payload.
        result: Option<serde_json::Value>,
    },
    /// The response is complete.
    Finish {
        /// Why generation stopped.
        finish_reason: FinishReason,
    },
}

impl StreamEvent {
    /// Shorthand for a text delta.
    pub fn text(text: impl Into<String>) -> Self {
        Self::TextDelta { text: text.into() }
    }

    /// Shorthand for a normal finish.
    pub fn finish() -> Self {
        Self::Finish {
            finish_reason: FinishReason::Stop,
        }
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural completion.
    Stop,
    /// Hit the token limit.
    Length,
    /// Stopped to let tools run.
    ToolCalls,
    /// Provider content filter.
    ContentFilter,
    /// The stream closed without a finish signal, or an unknown reason.
    Other,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Length => write!(f, "length"),
            Self::ToolCalls => write!(f, "tool_calls"),
            Self::ContentFilter => write!(f, "content_filter"),
            Self::Other => write!(f, "other"),
        }
    }
}
