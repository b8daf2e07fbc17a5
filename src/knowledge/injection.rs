//! Knowledge injection into the system prompt.
//!
//! Before each user message is composed, related knowledge is looked up and
//! appended to the persona prompt. Autonomous turns are skipped so that the
//! idle engine's own prompts do not drag unrelated context in.

use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};

use super::{KnowledgeStore, format_knowledge_for_prompt};
use crate::chat::hooks::{HookOptions, HookToken};
use crate::chat::pipeline::ChatPipeline;
use crate::config::KnowledgeConfig;
use crate::error::Result;
use crate::idle::TalkingFlag;

/// Rewrites the system prompt with retrieved knowledge before each user turn.
pub struct KnowledgeInjector {
    store: Arc<dyn KnowledgeStore>,
    pipeline: ChatPipeline,
    talking: TalkingFlag,
    base_prompt: String,
    limit: usize,
    threshold: f32,
}

impl std::fmt::Debug for KnowledgeInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeInjector")
            .field("limit", &self.limit)
            .field("threshold", &self.threshold)
            .finish()
    }
}

impl KnowledgeInjector {
    /// Create an injector. The pipeline's current persona prompt becomes the base.
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        pipeline: ChatPipeline,
        talking: TalkingFlag,
        config: &KnowledgeConfig,
    ) -> Self {
        let base_prompt = pipeline.system_prompt();
        Self {
            store,
            pipeline,
            talking,
            base_prompt,
            limit: config.limit,
            threshold: config.threshold,
        }
    }

    /// Register the persistent beforeCompose hook.
    ///
    /// The hook holds a weak reference; dropping the returned `Arc` disables it.
    pub fn install(self) -> (Arc<Self>, HookToken) {
        let injector = Arc::new(self);
        let weak: Weak<Self> = Arc::downgrade(&injector);
        let token = injector.pipeline.hooks().on_before_message_composed(
            move |text| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(injector) => injector.inject(&text).await,
                        None => Ok(()),
                    }
                }
            },
            HookOptions::persistent(),
        );
        (injector, token)
    }

    /// Look up knowledge for `text` and rewrite the system prompt.
    ///
    /// Retrieval failures are logged and leave the base prompt in place.
    pub async fn inject(&self, text: &str) -> Result<()> {
        if self.talking.is_active() {
            debug!("skipping knowledge injection during autonomous turn");
            return Ok(());
        }
        if text.trim().is_empty() {
            return Ok(());
        }

        let knowledge = match self
            .store
            .query_similar(text, self.limit, self.threshold)
            .await
        {
            Ok(response) => format_knowledge_for_prompt(&response.results),
            Err(e) => {
                warn!(error = %e, "knowledge lookup failed, using base prompt");
                String::new()
            }
        };

        if !knowledge.is_empty() {
            info!("injecting related knowledge into system prompt");
        }
        self.pipeline
            .set_system_prompt(&format!("{}{knowledge}", self.base_prompt))
            .await;
        Ok(())
    }
}
