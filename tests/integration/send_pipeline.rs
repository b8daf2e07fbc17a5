//! End-to-end turns through the send pipeline with scripted providers.

use std::sync::Arc;

use hibiki::CompanionError;
use hibiki::chat::events::StreamEvent;
use hibiki::chat::message::{ChatMessage, Slice, ToolCall};
use hibiki::chat::provider::{ScriptedItem, ScriptedProvider};
use hibiki::chat::{ChatPipeline, FLUSH_MARKER, FsHistoryStore, HookOptions, SendOptions};
use hibiki::config::ChatConfig;

use crate::helpers::{last_user_text, record_hooks, roles};

fn options(provider: &Arc<ScriptedProvider>) -> SendOptions {
    SendOptions::new("test-model", Arc::clone(provider) as _)
}

// ─── Token routing ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_markers_split_across_chunks_keep_order() {
    let pipeline = ChatPipeline::new(&ChatConfig::default());
    let log = record_hooks(&pipeline);
    let provider = Arc::new(ScriptedProvider::new().with_turn(vec![
        StreamEvent::text("Hello <|"),
        StreamEvent::text("happy|> there, friend!"),
        StreamEvent::finish(),
    ]));

    pipeline.send("hi", options(&provider)).await.unwrap();

    let log = log.lock().unwrap().clone();
    let tokens: Vec<&str> = log
        .iter()
        .filter(|entry| entry.starts_with("token_"))
        .map(String::as_str)
        .collect();
    let special_at = tokens
        .iter()
        .position(|t| *t == "token_special:<|happy|>")
        .unwrap();
    let literals_before: String = tokens[..special_at]
        .iter()
        .filter_map(|t| t.strip_prefix("token_literal:"))
        .collect();
    assert_eq!(literals_before, "Hello ");
    let flush = format!("token_literal:{FLUSH_MARKER}");
    assert_eq!(tokens.last().copied(), Some(flush.as_str()));

    match pipeline.messages().last().unwrap() {
        ChatMessage::Assistant(message) => {
            assert_eq!(message.content, "Hello  there, friend!");
            assert!(!message.content.contains("<|"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_hooks_bracket_the_turn() {
    let pipeline = ChatPipeline::new(&ChatConfig::default());
    let log = record_hooks(&pipeline);
    let provider = Arc::new(ScriptedProvider::new().with_reply("ok"));

    pipeline.send("hello", options(&provider)).await.unwrap();

    let log = log.lock().unwrap().clone();
    assert_eq!(log.first().map(String::as_str), Some("before_compose:hello"));
    assert_eq!(log.last().map(String::as_str), Some("after_send:hello"));
    let end = log.iter().position(|e| e == "assistant_response_end:ok").unwrap();
    let stream_end = log.iter().position(|e| e == "stream_end:").unwrap();
    assert!(stream_end < end);
}

// ─── Tool effects ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_tool_call_lands_between_text_slices() {
    let pipeline = ChatPipeline::new(&ChatConfig {
        min_literal_emit_length: 1,
        ..ChatConfig::default()
    });
    let call = ToolCall {
        tool_call_id: "c1".into(),
        tool_name: "weather".into(),
        args: "{}".into(),
    };
    let provider = Arc::new(ScriptedProvider::new().with_turn(vec![
        StreamEvent::text("checking"),
        StreamEvent::ToolCall(call.clone()),
        StreamEvent::text("sunny"),
        StreamEvent::finish(),
    ]));

    pipeline.send("weather?", options(&provider)).await.unwrap();

    match pipeline.messages().last().unwrap() {
        ChatMessage::Assistant(message) => {
            assert!(
                message
                    .slices
                    .iter()
                    .any(|s| matches!(s, Slice::ToolCall { tool_call } if *tool_call == call))
            );
            assert_eq!(message.content, "checkingsunny");
        }
        other => panic!("unexpected {other:?}"),
    }
}

// ─── Failures ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stream_error_keeps_user_message_and_next_turn_works() {
    let pipeline = ChatPipeline::new(&ChatConfig::default());
    let provider = Arc::new(ScriptedProvider::new().with_items(vec![
        ScriptedItem::Event(StreamEvent::text("partial")),
        ScriptedItem::Error("connection reset".into()),
    ]));

    assert!(pipeline.send("first", options(&provider)).await.is_err());
    assert!(!pipeline.is_sending());
    assert_eq!(roles(&pipeline), vec!["system", "user"]);

    pipeline.send("second", options(&provider)).await.unwrap();
    assert_eq!(roles(&pipeline), vec!["system", "user", "user", "assistant"]);
    let requests = provider.requests();
    assert_eq!(last_user_text(&requests[1].messages), "second");
}

#[tokio::test]
async fn test_failing_response_end_hook_skips_after_send() {
    let pipeline = ChatPipeline::new(&ChatConfig::default());
    pipeline.hooks().on_assistant_response_end(
        |_| async { Err(CompanionError::Hook("speaker unplugged".into())) },
        HookOptions::persistent(),
    );
    let log = record_hooks(&pipeline);
    let provider = Arc::new(ScriptedProvider::new().with_turn(vec![
        StreamEvent::text("Still here."),
        StreamEvent::finish(),
    ]));

    let err = pipeline.send("hi", options(&provider)).await.unwrap_err();

    assert!(matches!(err, CompanionError::Hook(ref m) if m == "speaker unplugged"));
    assert_eq!(roles(&pipeline), vec!["system", "user", "assistant"]);
    assert!(!pipeline.is_sending());
    let log = log.lock().unwrap().clone();
    assert!(log.contains(&"stream_end:".to_owned()));
    assert!(!log.iter().any(|entry| entry.starts_with("assistant_response_end:")));
    assert!(!log.iter().any(|entry| entry.starts_with("after_send:")));
}

// ─── Hidden turns ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_hidden_prompt_reaches_provider_but_not_history() {
    let pipeline = ChatPipeline::new(&ChatConfig::default());
    let provider = Arc::new(ScriptedProvider::new().with_reply("a thought"));

    pipeline
        .send("secret prompt", options(&provider).hidden())
        .await
        .unwrap();

    assert_eq!(roles(&pipeline), vec!["system", "assistant"]);
    assert_eq!(last_user_text(&provider.requests()[0].messages), "secret prompt");
}

// ─── Persistence ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_history_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new().with_reply("welcome back"));

    {
        let store = Arc::new(FsHistoryStore::new(dir.path()).unwrap());
        let pipeline = ChatPipeline::new(&ChatConfig::default()).with_store(store);
        pipeline.send("remember me", options(&provider)).await.unwrap();
    }

    let store = Arc::new(FsHistoryStore::new(dir.path()).unwrap());
    let restored = ChatPipeline::new(&ChatConfig::default()).with_store(store);
    assert!(restored.load_history().await.unwrap());
    assert_eq!(roles(&restored), vec!["system", "user", "assistant"]);

    restored.send("again", options(&provider)).await.unwrap();
    let requests = provider.requests();
    let replay = &requests[1].messages;
    assert_eq!(replay.len(), 4);
}

#[tokio::test]
async fn test_fresh_store_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsHistoryStore::new(dir.path()).unwrap());
    let pipeline = ChatPipeline::new(&ChatConfig::default()).with_store(store);
    assert!(!pipeline.load_history().await.unwrap());
    assert_eq!(roles(&pipeline), vec!["system"]);
}
