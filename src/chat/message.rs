//! Message types for the conversation history.
//!
//! [`ChatMessage`] is what the history stores and what observers render.
//! [`ProviderMessage`] is the trimmed form sent to a model provider: assistant
//! slices are dropped (the provider only needs text and tool results) and
//! display-only error entries are omitted.
//!
//! # Examples
//!
//! ```
//! use hibiki::chat::message::{AssistantMessage, Slice};
//!
//! let mut msg = AssistantMessage::default();
//! msg.push_text("Hello, ");
//! msg.push_text("world");
//! assert_eq!(msg.slices, vec![Slice::Text { text: "Hello, world".into() }]);
//! assert_eq!(msg.content, "Hello, world");
//! ```

use serde::{Deserialize, Serialize};

// ── Tool calls ────────────────────────────────────────────────

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    /// Provider-assigned identifier correlating the call with its result.
    pub tool_call_id: String,
    /// Name of the tool being invoked.
    pub tool_name: String,
    /// JSON-encoded arguments.
    pub args: String,
}

/// The outcome of a tool call, as reported by the provider stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// The tool call this result belongs to.
    pub id: String,
    /// Result payload, if the tool produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

// ── Slices ────────────────────────────────────────────────────

/// One ordered fragment of an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Slice {
    /// A run of literal text. Adjacent runs are merged.
    Text {
        /// The text.
        text: String,
    },
    /// A tool call issued mid-response.
    ToolCall {
        /// The call.
        #[serde(rename = "toolCall")]
        tool_call: ToolCall,
    },
    /// A tool result surfaced mid-response.
    ToolCallResult(ToolCallResult),
}

/// An assistant message under construction or committed to history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    /// Concatenated literal text.
    #[serde(default)]
    pub content: String,
    /// Ordered slices in arrival order.
    #[serde(default)]
    pub slices: Vec<Slice>,
    /// Tool results reported during the turn.
    #[serde(default)]
    pub tool_results: Vec<ToolCallResult>,
}

impl AssistantMessage {
    /// Create an assistant message holding a single text slice.
    pub fn from_text(text: impl Into<String>) -> Self {
        let mut msg = Self::default();
        msg.push_text(&text.into());
        msg
    }

    /// Append literal text, merging with a trailing text slice.
    pub fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.content.push_str(text);
        if let Some(Slice::Text { text: last }) = self.slices.last_mut() {
            last.push_str(text);
            return;
        }
        self.slices.push(Slice::Text {
            text: text.to_owned(),
        });
    }

    /// Append a tool-call slice.
    pub fn push_tool_call(&mut self, call: ToolCall) {
        self.slices.push(Slice::ToolCall { tool_call: call });
    }

    /// Record a tool result.
    pub fn push_tool_result(&mut self, result: ToolCallResult) {
        self.tool_results.push(result);
    }

    /// Whether nothing worth committing has accumulated.
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}

// ── User content ──────────────────────────────────────────────

/// A single part of a multi-part user message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Text part.
    Text {
        /// The text.
        text: String,
    },
    /// Inline image.
    ImageUrl {
        /// Image location.
        image_url: ImageUrl,
    },
}

/// Image reference, usually a `data:` URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    /// The URL.
    pub url: String,
}

/// User message content: plain text or a list of parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text.
    Text(String),
    /// Text followed by attachments.
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text of every text part.
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect(),
        }
    }
}

/// A file attached to an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    /// Base64-encoded image.
    Image {
        /// Base64 payload.
        data: String,
        /// MIME type such as `image/png`.
        mime_type: String,
    },
}

impl Attachment {
    /// Convert to a content part.
    pub fn to_part(&self) -> ContentPart {
        match self {
            Self::Image { data, mime_type } => ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{mime_type};base64,{data}"),
                },
            },
        }
    }
}

/// Build user content: plain text alone, parts when attachments are present.
pub fn compose_content(text: &str, attachments: &[Attachment]) -> MessageContent {
    if attachments.is_empty() {
        return MessageContent::Text(text.to_owned());
    }
    let mut parts = Vec::with_capacity(attachments.len() + 1);
    parts.push(ContentPart::Text {
        text: text.to_owned(),
    });
    parts.extend(attachments.iter().map(Attachment::to_part));
    MessageContent::Parts(parts)
}

/// A user message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    /// Unique id, used to retract the message.
    pub id: String,
    /// Message content.
    pub content: MessageContent,
    /// Display name of an external author (bridged chat platforms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Platform the message came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl UserMessage {
    /// Create a user message with a fresh id.
    pub fn new(content: MessageContent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content,
            author: None,
            source: None,
        }
    }
}

// ── Messages ──────────────────────────────────────────────────

/// An entry in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    /// System instructions. Always at index 0.
    System {
        /// Prompt text.
        content: String,
    },
    /// User input.
    User(UserMessage),
    /// Model output.
    Assistant(AssistantMessage),
    /// Tool output fed back to the model.
    Tool {
        /// Call this output answers.
        tool_call_id: String,
        /// Output text.
        content: String,
    },
    /// Display-only error entry.
    Error {
        /// Error text.
        message: String,
    },
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    /// Create a plain-text user message with a fresh id.
    pub fn user(text: impl Into<String>) -> Self {
        Self::User(UserMessage::new(MessageContent::Text(text.into())))
    }

    /// Role name as used in serialized form.
    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User(_) => "user",
            Self::Assistant(_) => "assistant",
            Self::Tool { .. } => "tool",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this is an assistant message.
    pub fn is_assistant(&self) -> bool {
        matches!(self, Self::Assistant(_))
    }

    /// Provider-ready form, or `None` for display-only entries.
    pub fn to_provider(&self) -> Option<ProviderMessage> {
        match self {
            Self::System { content } => Some(ProviderMessage::System {
                content: content.clone(),
            }),
            Self::User(user) => Some(ProviderMessage::User {
                content: user.content.clone(),
            }),
            Self::Assistant(assistant) => Some(ProviderMessage::Assistant {
                content: assistant.content.clone(),
                tool_results: assistant.tool_results.clone(),
            }),
            Self::Tool {
                tool_call_id,
                content,
            } => Some(ProviderMessage::Tool {
                tool_call_id: tool_call_id.clone(),
                content: content.clone(),
            }),
            Self::Error { .. } => None,
        }
    }
}

/// A message in the form a model provider consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ProviderMessage {
    /// System instructions.
    System {
        /// Prompt text.
        content: String,
    },
    /// User input.
    User {
        /// Content.
        content: MessageContent,
    },
    /// Earlier model output, slices stripped.
    Assistant {
        /// Text.
        content: String,
        /// Tool results from that turn.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_results: Vec<ToolCallResult>,
    },
    /// Tool output.
    Tool {
        /// Call this output answers.
        tool_call_id: String,
        /// Output text.
        content: String,
    },
}
