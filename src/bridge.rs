//! Remote event bridge.
//!
//! A remote server relays chat from external platforms and pre-rendered
//! speech. Each event is one JSON object:
//!
//! ```json
//! {"type": "input:text", "data": {"text": "hello", "author": "mio", "source": "twitch"}}
//! {"type": "output:text", "data": {"text": "hi mio"}}
//! {"type": "output:audio", "data": {"audioUrl": "https://example.com/a.wav", "text": "hi"}}
//! ```
//!
//! Bridged messages go straight into history. They never trigger a provider
//! call or the send hooks.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chat::message::{AssistantMessage, ChatMessage, MessageContent, UserMessage};
use crate::chat::pipeline::ChatPipeline;
use crate::error::{CompanionError, Result};

/// An event received from the remote bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BridgeEvent {
    /// A chat message from an external platform.
    #[serde(rename = "input:text")]
    InputText {
        /// Message body as typed by the sender.
        text: String,
        /// Display name of the sender.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        author: Option<String>,
        /// Platform the message came from, e.g. `twitch`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    /// Assistant text produced elsewhere.
    #[serde(rename = "output:text")]
    OutputText {
        /// Text to record as the assistant reply.
        text: String,
    },
    /// Pre-rendered speech.
    #[serde(rename = "output:audio")]
    OutputAudio {
        /// Where the rendered audio can be fetched.
        #[serde(rename = "audioUrl")]
        audio_url: String,
        /// Transcript of the audio.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
}

/// Audio the caller should play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioCue {
    /// Where the rendered audio can be fetched.
    pub audio_url: String,
    /// Transcript to show while the audio plays.
    pub text: Option<String>,
}

impl BridgeEvent {
    /// Parse one JSON event.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| CompanionError::Pipeline(format!("invalid bridge event: {e}")))
    }

    /// Apply the event to `pipeline`. Audio events are handed back instead.
    pub async fn apply(self, pipeline: &ChatPipeline) -> Option<AudioCue> {
        match self {
            Self::InputText {
                text,
                author,
                source,
            } => {
                let display = match &author {
                    Some(author) => format!("{author}: {text}"),
                    None => text,
                };
                let mut message = UserMessage::new(MessageContent::Text(display));
                message.author = author;
                message.source = source;
                debug!(source = ?message.source, "bridged user message");
                pipeline.push_message(ChatMessage::User(message)).await;
                None
            }
            Self::OutputText { text } => {
                debug!("bridged assistant message");
                pipeline
                    .push_message(ChatMessage::Assistant(AssistantMessage::from_text(text)))
                    .await;
                None
            }
            Self::OutputAudio { audio_url, text } => Some(AudioCue { audio_url, text }),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::chat::message::Slice;
    use crate::config::ChatConfig;

    #[test]
    fn parses_wire_names() {
        let event = BridgeEvent::from_json(
            r#"{"type":"output:audio","data":{"audioUrl":"https://a/b.wav"}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            BridgeEvent::OutputAudio {
                audio_url: "https://a/b.wav".into(),
                text: None
            }
        );

        let json = serde_json::to_value(BridgeEvent::OutputText { text: "hi".into() }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "output:text", "data": {"text": "hi"}}));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = BridgeEvent::from_json(r#"{"type":"input:audio","data":{}}"#).unwrap_err();
        assert!(matches!(err, CompanionError::Pipeline(_)));
    }

    #[tokio::test]
    async fn input_text_is_tagged_with_author() {
        let pipeline = ChatPipeline::new(&ChatConfig::default());
        let event = BridgeEvent::from_json(
            r#"{"type":"input:text","data":{"text":"hello","author":"mio","source":"twitch"}}"#,
        )
        .unwrap();
        assert!(event.apply(&pipeline).await.is_none());

        match pipeline.messages().last().unwrap() {
            ChatMessage::User(user) => {
                assert_eq!(user.content.text(), "mio: hello");
                assert_eq!(user.author.as_deref(), Some("mio"));
                assert_eq!(user.source.as_deref(), Some("twitch"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn input_without_author_is_plain() {
        let pipeline = ChatPipeline::new(&ChatConfig::default());
        BridgeEvent::InputText {
            text: "hello".into(),
            author: None,
            source: None,
        }
        .apply(&pipeline)
        .await;
        match pipeline.messages().last().unwrap() {
            ChatMessage::User(user) => assert_eq!(user.content.text(), "hello"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn output_text_becomes_single_slice_assistant() {
        let pipeline = ChatPipeline::new(&ChatConfig::default());
        BridgeEvent::OutputText { text: "hi".into() }
            .apply(&pipeline)
            .await;
        match pipeline.messages().last().unwrap() {
            ChatMessage::Assistant(message) => {
                assert_eq!(message.content, "hi");
                assert_eq!(message.slices, vec![Slice::Text { text: "hi".into() }]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn audio_is_returned_not_stored() {
        let pipeline = ChatPipeline::new(&ChatConfig::default());
        let cue = BridgeEvent::OutputAudio {
            audio_url: "u".into(),
            text: Some("t".into()),
        }
        .apply(&pipeline)
        .await;
        assert_eq!(
            cue,
            Some(AudioCue {
                audio_url: "u".into(),
                text: Some("t".into())
            })
        );
        assert_eq!(pipeline.history_len(), 1);
    }
}
