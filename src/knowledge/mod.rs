//! Retrieval store: topics for idle talk and context for prompts.
//!
//! [`KnowledgeStore`] is the query surface the rest of the crate depends on.
//! [`http::HttpKnowledgeStore`] talks to the knowledge service over HTTP;
//! [`StaticKnowledgeStore`] keeps a fixed list in memory.

pub mod http;
pub mod injection;

use std::collections::HashSet;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A stored utterance usable as a topic or as context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    /// Who originally said it.
    #[serde(default)]
    pub author: String,
    /// The text.
    pub content: String,
    /// Platform it was collected from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Link to the original post.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Unix timestamp of the original post.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posted_at: Option<i64>,
    /// Similarity to the query (0.0-1.0), present on similarity results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
}

impl Topic {
    /// Create a topic with only author and content.
    pub fn new(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            content: content.into(),
            source: None,
            url: None,
            posted_at: None,
            similarity: None,
        }
    }
}

/// Result of a similarity query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeResponse {
    /// The query text.
    #[serde(default)]
    pub query: String,
    /// Matches, most similar first.
    #[serde(default)]
    pub results: Vec<Topic>,
    /// Total matches above the threshold.
    #[serde(default)]
    pub total: usize,
}

/// Query interface of a retrieval store.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Up to `limit` randomly chosen topics.
    async fn random_topics(&self, limit: usize) -> Result<Vec<Topic>>;

    /// Up to `limit` items similar to `text` with similarity at least `threshold`.
    async fn query_similar(
        &self,
        text: &str,
        limit: usize,
        threshold: f32,
    ) -> Result<KnowledgeResponse>;
}

/// Render matches as a prompt section. Empty input renders nothing.
pub fn format_knowledge_for_prompt(results: &[Topic]) -> String {
    if results.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = results
        .iter()
        .enumerate()
        .map(|(i, topic)| {
            let relevance = topic.similarity.unwrap_or(0.0) * 100.0;
            format!("{}. [{relevance:.1}% relevant] {}", i + 1, topic.content)
        })
        .collect();
    format!("\n\n## Related knowledge\n\n{}\n", lines.join("\n"))
}

// ── In-memory store ───────────────────────────────────────────

/// Fixed in-memory topic list.
///
/// Similarity is the Jaccard overlap of lowercase words, which is enough for
/// offline use and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticKnowledgeStore {
    topics: Vec<Topic>,
}

impl StaticKnowledgeStore {
    /// Create a store over `topics`.
    pub fn new(topics: Vec<Topic>) -> Self {
        Self { topics }
    }

    fn words(text: &str) -> HashSet<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect()
    }

    fn similarity(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
        let union = a.union(b).count();
        if union == 0 {
            return 0.0;
        }
        a.intersection(b).count() as f32 / union as f32
    }
}

#[async_trait]
impl KnowledgeStore for StaticKnowledgeStore {
    async fn random_topics(&self, limit: usize) -> Result<Vec<Topic>> {
        let mut rng = rand::thread_rng();
        Ok(self
            .topics
            .choose_multiple(&mut rng, limit)
            .cloned()
            .collect())
    }

    async fn query_similar(
        &self,
        text: &str,
        limit: usize,
        threshold: f32,
    ) -> Result<KnowledgeResponse> {
        let query_words = Self::words(text);
        let mut matches: Vec<Topic> = self
            .topics
            .iter()
            .filter_map(|topic| {
                let score = Self::similarity(&query_words, &Self::words(&topic.content));
                (score >= threshold && score > 0.0).then(|| Topic {
                    similarity: Some(score),
                    ..topic.clone()
                })
            })
            .collect();
        matches.sort_by(|a, b| {
            b.similarity
                .unwrap_or(0.0)
                .total_cmp(&a.similarity.unwrap_or(0.0))
        });
        let total = matches.len();
        matches.truncate(limit);
        Ok(KnowledgeResponse {
            query: text.to_owned(),
            results: matches,
            total,
        })
    }
}
