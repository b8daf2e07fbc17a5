//! Shared helpers for integration tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use hibiki::chat::message::{ChatMessage, ProviderMessage};
use hibiki::chat::provider::{ProviderConfig, ScriptedProvider};
use hibiki::chat::{ChatPipeline, HookChannel, HookOptions};
use hibiki::idle::{ActiveModel, StaticModelSource};
use hibiki::knowledge::{StaticKnowledgeStore, Topic};

/// Record `channel:payload` for every hook firing on `pipeline`, in order.
pub(crate) fn record_hooks(pipeline: &ChatPipeline) -> Arc<Mutex<Vec<String>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    for channel in HookChannel::ALL {
        let log = Arc::clone(&log);
        pipeline.hooks().register_fn(
            channel,
            move |payload| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(format!("{channel}:{payload}"));
                    Ok(())
                }
            },
            HookOptions::persistent(),
        );
    }
    log
}

/// Model source resolving to `provider`.
pub(crate) fn scripted_models(provider: &Arc<ScriptedProvider>) -> Arc<StaticModelSource> {
    Arc::new(StaticModelSource::new(ActiveModel {
        model: "test-model".into(),
        provider: Arc::clone(provider) as _,
        provider_config: ProviderConfig::default(),
    }))
}

/// In-memory store with a handful of topics.
pub(crate) fn topic_store() -> Arc<StaticKnowledgeStore> {
    Arc::new(StaticKnowledgeStore::new(vec![
        Topic::new("aki", "autumn leaves in kyoto"),
        Topic::new("mio", "hiking up mount takao"),
        Topic::new("ren", "late night ramen shops"),
    ]))
}

/// Text of the last user message in a provider request.
pub(crate) fn last_user_text(messages: &[ProviderMessage]) -> String {
    messages
        .iter()
        .rev()
        .find_map(|m| match m {
            ProviderMessage::User { content } => Some(content.text()),
            _ => None,
        })
        .unwrap_or_default()
}

/// Roles of every history entry.
pub(crate) fn roles(pipeline: &ChatPipeline) -> Vec<&'static str> {
    pipeline.messages().iter().map(ChatMessage::role).collect()
}

/// Poll `condition` every 10ms until it holds or `limit` elapses.
pub(crate) async fn wait_until(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
