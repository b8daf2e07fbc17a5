//! Idle-continuation engine driven by a paused tokio clock.

use std::sync::Arc;
use std::time::Duration;

use hibiki::chat::provider::ScriptedProvider;
use hibiki::chat::{ChatPipeline, SendOptions};
use hibiki::config::{ChatConfig, IdleTalkConfig, TopicMode};
use hibiki::idle::{IdleTalkEngine, TalkingFlag};

use crate::helpers::{last_user_text, roles, scripted_models, topic_store, wait_until};

const TIMEOUT: Duration = Duration::from_millis(1_000);

struct Harness {
    pipeline: ChatPipeline,
    provider: Arc<ScriptedProvider>,
    engine: IdleTalkEngine,
    talking: TalkingFlag,
}

fn harness(max_continuations: u32) -> Harness {
    let pipeline = ChatPipeline::new(&ChatConfig::default());
    let provider = Arc::new(ScriptedProvider::new());
    let talking = TalkingFlag::new();
    let config = IdleTalkConfig {
        timeout_ms: TIMEOUT.as_millis() as u64,
        mode: TopicMode::Sequential,
        max_context_continuation: max_continuations,
        ..IdleTalkConfig::default()
    };
    let engine = IdleTalkEngine::new(
        config,
        pipeline.clone(),
        topic_store(),
        scripted_models(&provider),
        talking.clone(),
    );
    Harness {
        pipeline,
        provider,
        engine,
        talking,
    }
}

impl Harness {
    /// Let the timer fire and wait for the autonomous turn to settle.
    async fn idle_turn(&self, expected_calls: usize) {
        tokio::time::sleep(TIMEOUT + Duration::from_millis(1)).await;
        let settled = wait_until(Duration::from_millis(500), || {
            let snap = self.engine.snapshot();
            self.provider.call_count() == expected_calls && !snap.talking && snap.timer_armed
        })
        .await;
        assert!(settled, "autonomous turn {expected_calls} did not settle");
    }

    fn prompt(&self, call: usize) -> String {
        last_user_text(&self.provider.requests()[call].messages)
    }
}

// ─── Continuation cycle ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_continuations_then_topic_switch() {
    let h = harness(2);
    h.engine.initialize();
    assert!(h.engine.snapshot().timer_armed);

    h.idle_turn(1).await;
    assert!(h.prompt(0).contains("Topic: autumn leaves in kyoto"));
    let snap = h.engine.snapshot();
    assert_eq!(snap.last_response.as_deref(), Some("reply 1"));
    assert_eq!(snap.continuation_count, 0);

    h.idle_turn(2).await;
    assert!(h.prompt(1).contains("\"reply 1\""));
    assert_eq!(h.engine.snapshot().continuation_count, 1);

    h.idle_turn(3).await;
    assert!(h.prompt(2).contains("\"reply 2\""));
    assert_eq!(h.engine.snapshot().continuation_count, 2);

    h.idle_turn(4).await;
    assert!(h.prompt(3).contains("Topic: "));
    assert_eq!(h.engine.snapshot().continuation_count, 0);

    // Synthetic prompts never show up in history.
    assert_eq!(
        roles(&h.pipeline),
        vec!["system", "assistant", "assistant", "assistant", "assistant"]
    );
    h.engine.dispose();
}

// ─── Interaction with user turns ────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_user_turn_clears_context_and_restarts_timer() {
    let h = harness(3);
    h.engine.initialize();
    h.idle_turn(1).await;
    assert!(h.engine.snapshot().last_response.is_some());

    let options = SendOptions::new("test-model", Arc::clone(&h.provider) as _);
    h.pipeline.send("hello there", options).await.unwrap();

    // The user turn cleared the topic, then the reply became the new context.
    let snap = h.engine.snapshot();
    assert_eq!(snap.initial_topic, None);
    assert_eq!(snap.continuation_count, 0);
    assert_eq!(snap.last_response.as_deref(), Some("reply 2"));
    assert!(snap.timer_armed);

    h.idle_turn(3).await;
    assert!(h.prompt(2).contains("\"reply 2\""));
    h.engine.dispose();
}

#[tokio::test(start_paused = true)]
async fn test_activity_postpones_timeout() {
    let h = harness(3);
    h.engine.initialize();

    for _ in 0..3 {
        tokio::time::sleep(TIMEOUT / 2).await;
        h.engine.reset_idle_timer(false);
    }
    assert_eq!(h.provider.call_count(), 0);

    h.idle_turn(1).await;
    h.engine.dispose();
}

#[tokio::test(start_paused = true)]
async fn test_no_turn_while_another_is_talking() {
    let h = harness(3);
    h.engine.initialize();
    assert!(h.talking.try_begin());

    tokio::time::sleep(TIMEOUT * 3).await;
    assert_eq!(h.provider.call_count(), 0);

    h.talking.end();
    h.engine.reset_idle_timer(false);
    h.idle_turn(1).await;
    h.engine.dispose();
}

// ─── Failure recovery ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_failed_turn_rearms_timer() {
    let h = harness(3);
    let provider = Arc::new(ScriptedProvider::new().with_rejection("model offline"));
    let engine = IdleTalkEngine::new(
        IdleTalkConfig {
            timeout_ms: TIMEOUT.as_millis() as u64,
            ..IdleTalkConfig::default()
        },
        h.pipeline.clone(),
        topic_store(),
        scripted_models(&provider),
        TalkingFlag::new(),
    );
    engine.initialize();

    tokio::time::sleep(TIMEOUT + Duration::from_millis(1)).await;
    let recovered = wait_until(Duration::from_millis(500), || {
        let snap = engine.snapshot();
        provider.call_count() == 1 && !snap.talking && snap.timer_armed
    })
    .await;
    assert!(recovered);

    // The next timeout runs a normal turn.
    tokio::time::sleep(TIMEOUT + Duration::from_millis(1)).await;
    let answered = wait_until(Duration::from_millis(500), || provider.call_count() == 2).await;
    assert!(answered);
    engine.dispose();
}

#[tokio::test(start_paused = true)]
async fn test_dispose_stops_autonomous_turns() {
    let h = harness(3);
    h.engine.initialize();
    h.engine.dispose();

    tokio::time::sleep(TIMEOUT * 5).await;
    assert_eq!(h.provider.call_count(), 0);
    assert!(!h.engine.snapshot().timer_armed);
}
