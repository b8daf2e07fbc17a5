//! Conversation history with a pinned system message.

use serde::{Deserialize, Serialize};

use super::message::{ChatMessage, ProviderMessage};

/// Formatting instruction for fenced code blocks.
const CODE_BLOCK_INSTRUCTION: &str = "- For any programming code block, always specify the \
     programming language on the fence, eg. ```python ... ```\n";

/// Formatting instruction for math.
const MATH_INSTRUCTION: &str = "- For any math equation, use LaTeX format, eg: $ x^3 $, \
     always escape dollar sign outside math equation\n";

/// Build the full system prompt for a persona base prompt.
pub fn system_prompt_for(base: &str) -> String {
    format!("{CODE_BLOCK_INSTRUCTION}{MATH_INSTRUCTION}{base}")
}

/// Ordered message list. Index 0 is always the system message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationHistory {
    messages: Vec<ChatMessage>,
}

impl ConversationHistory {
    /// Create a history holding only the system message for `base_prompt`.
    pub fn new(base_prompt: &str) -> Self {
        Self {
            messages: vec![ChatMessage::system(system_prompt_for(base_prompt))],
        }
    }

    /// Rebuild from stored messages, inserting a system message if index 0 is missing one.
    pub fn from_messages(mut messages: Vec<ChatMessage>, base_prompt: &str) -> Self {
        if !matches!(messages.first(), Some(ChatMessage::System { .. })) {
            messages.insert(0, ChatMessage::system(system_prompt_for(base_prompt)));
        }
        Self { messages }
    }

    /// Replace index 0 with a system message built from `base_prompt`.
    pub fn set_system_prompt(&mut self, base_prompt: &str) {
        let system = ChatMessage::system(system_prompt_for(base_prompt));
        match self.messages.first_mut() {
            Some(first @ ChatMessage::System { .. }) => *first = system,
            _ => self.messages.insert(0, system),
        }
    }

    /// Drop everything except a fresh system message.
    pub fn reset(&mut self, base_prompt: &str) {
        self.messages = vec![ChatMessage::system(system_prompt_for(base_prompt))];
    }

    /// Append a message.
    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Remove the user message with `id`. Returns it when found.
    pub fn retract(&mut self, id: &str) -> Option<ChatMessage> {
        let index = self
            .messages
            .iter()
            .rposition(|m| matches!(m, ChatMessage::User(u) if u.id == id))?;
        Some(self.messages.remove(index))
    }

    /// Number of messages, including the system message.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the history is empty. Never true for a constructed history.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// All messages in order.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Whether an assistant message exists at or after `start`.
    pub fn has_assistant_since(&self, start: usize) -> bool {
        self.messages
            .iter()
            .skip(start)
            .any(ChatMessage::is_assistant)
    }

    /// Provider-ready copy of the history.
    pub fn provider_snapshot(&self) -> Vec<ProviderMessage> {
        self.messages
            .iter()
            .filter_map(ChatMessage::to_provider)
            .collect()
    }
}
