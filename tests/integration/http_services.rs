//! Pipeline turns against mocked HTTP services: an OpenAI-compatible
//! streaming endpoint and the knowledge service.

use std::collections::BTreeMap;
use std::sync::Arc;

use hibiki::chat::{ChatMessage, ChatPipeline, ProviderConfig, SendOptions};
use hibiki::config::{ChatConfig, KnowledgeConfig};
use hibiki::idle::TalkingFlag;
use hibiki::knowledge::http::HttpKnowledgeStore;
use hibiki::knowledge::injection::KnowledgeInjector;
use hibiki::providers::{OpenAiConfig, OpenAiProvider};
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use crate::helpers::record_hooks;

fn sse_body(chunks: &[serde_json::Value]) -> String {
    let mut body = String::new();
    for chunk in chunks {
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn delta(content: &str) -> serde_json::Value {
    serde_json::json!({"choices": [{"index": 0, "delta": {"content": content}}]})
}

fn stop() -> serde_json::Value {
    serde_json::json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]})
}

async fn completions_server(chunks: &[serde_json::Value]) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(serde_json::json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse_body(chunks)),
        )
        .mount(&server)
        .await;
    server
}

fn system_text(pipeline: &ChatPipeline) -> String {
    match &pipeline.messages()[0] {
        ChatMessage::System { content } => content.clone(),
        other => panic!("unexpected {other:?}"),
    }
}

// ─── OpenAI-compatible streaming ────────────────────────────────────────────

#[tokio::test]
async fn test_openai_stream_drives_a_turn() {
    let server = completions_server(&[
        delta("Good evening! "),
        delta("<|smile|>"),
        delta("Nice to see you."),
        stop(),
    ])
    .await;

    let pipeline = ChatPipeline::new(&ChatConfig::default());
    let log = record_hooks(&pipeline);
    let provider = Arc::new(OpenAiProvider::new(
        OpenAiConfig::new(server.uri()).with_api_key("sk-test"),
    ));

    pipeline
        .send("hello", SendOptions::new("qwen3:8b", provider))
        .await
        .unwrap();

    let log = log.lock().unwrap().clone();
    assert!(log.contains(&"token_special:<|smile|>".to_owned()));
    assert!(log.contains(&"assistant_response_end:Good evening! <|smile|>Nice to see you.".to_owned()));
    match pipeline.messages().last().unwrap() {
        ChatMessage::Assistant(message) => {
            assert_eq!(message.content, "Good evening! Nice to see you.");
        }
        other => panic!("unexpected {other:?}"),
    }

    let requests = server.received_requests().await.unwrap();
    let request: &Request = &requests[0];
    let auth = request.headers.get("authorization").unwrap();
    assert_eq!(auth.to_str().unwrap(), "Bearer sk-test");
    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["model"], "qwen3:8b");
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["content"], "hello");
}

#[tokio::test]
async fn test_provider_headers_are_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("x-session", "abc"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse_body(&[delta("ok"), stop()])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = ChatPipeline::new(&ChatConfig::default());
    let provider = Arc::new(OpenAiProvider::new(OpenAiConfig::new(server.uri())));
    let config = ProviderConfig {
        headers: BTreeMap::from([("x-session".to_owned(), "abc".to_owned())]),
    };

    pipeline
        .send("hi", SendOptions::new("m", provider).with_provider_config(config))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_rate_limit_surfaces_as_provider_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
            "error": {"message": "slow down"}
        })))
        .mount(&server)
        .await;

    let pipeline = ChatPipeline::new(&ChatConfig::default());
    let provider = Arc::new(OpenAiProvider::new(OpenAiConfig::new(server.uri())));
    let err = pipeline
        .send("hi", SendOptions::new("m", provider))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("rate limited: slow down"));
    assert!(!pipeline.is_sending());
}

// ─── Knowledge injection ────────────────────────────────────────────────────

#[tokio::test]
async fn test_knowledge_reaches_the_provider_prompt() {
    let knowledge = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/knowledge"))
        .and(query_param("query", "best ramen in kyoto?"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "query": "best ramen in kyoto?",
            "results": [{"author": "aki", "content": "try the shop by the river", "similarity": 0.82}],
            "total": 1
        })))
        .mount(&knowledge)
        .await;
    let llm = completions_server(&[delta("sure"), stop()]).await;

    let pipeline = ChatPipeline::new(&ChatConfig {
        system_prompt: "You are Hibiki.".into(),
        ..ChatConfig::default()
    });
    let config = KnowledgeConfig {
        enabled: true,
        url: knowledge.uri(),
        ..KnowledgeConfig::default()
    };
    let store = Arc::new(HttpKnowledgeStore::from_config(&config));
    let (_injector, _token) =
        KnowledgeInjector::new(store, pipeline.clone(), TalkingFlag::new(), &config).install();

    let provider = Arc::new(OpenAiProvider::new(OpenAiConfig::new(llm.uri())));
    pipeline
        .send("best ramen in kyoto?", SendOptions::new("m", provider))
        .await
        .unwrap();

    let system = system_text(&pipeline);
    assert!(system.contains("You are Hibiki.\n\n## Related knowledge"));
    assert!(system.contains("1. [82.0% relevant] try the shop by the river"));

    let requests = llm.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    let sent_system = body["messages"][0]["content"].as_str().unwrap();
    assert!(sent_system.contains("try the shop by the river"));
}

#[tokio::test]
async fn test_knowledge_outage_keeps_base_prompt() {
    let knowledge = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&knowledge)
        .await;
    let llm = completions_server(&[delta("hello"), stop()]).await;

    let pipeline = ChatPipeline::new(&ChatConfig {
        system_prompt: "You are Hibiki.".into(),
        ..ChatConfig::default()
    });
    let config = KnowledgeConfig {
        enabled: true,
        url: knowledge.uri(),
        ..KnowledgeConfig::default()
    };
    let (_injector, _token) = KnowledgeInjector::new(
        Arc::new(HttpKnowledgeStore::from_config(&config)),
        pipeline.clone(),
        TalkingFlag::new(),
        &config,
    )
    .install();

    let provider = Arc::new(OpenAiProvider::new(OpenAiConfig::new(llm.uri())));
    pipeline
        .send("anything", SendOptions::new("m", provider))
        .await
        .unwrap();

    assert!(system_text(&pipeline).ends_with("You are Hibiki."));
    assert!(matches!(
        pipeline.messages().last(),
        Some(ChatMessage::Assistant(_))
    ));
}
