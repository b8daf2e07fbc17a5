//! HTTP client for the knowledge service.
//!
//! Endpoints:
//! - `GET {url}/knowledge?query=..&limit=..&threshold=..` → [`KnowledgeResponse`]
//! - `GET {url}/random?limit=..` → `{"results": [...]}`

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::{KnowledgeResponse, KnowledgeStore, Topic};
use crate::config::KnowledgeConfig;
use crate::error::{CompanionError, Result};

#[derive(Debug, Deserialize)]
struct RandomTopicsResponse {
    #[serde(default, alias = "posts")]
    results: Vec<Topic>,
}

/// Retrieval store backed by the knowledge service.
#[derive(Debug, Clone)]
pub struct HttpKnowledgeStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpKnowledgeStore {
    /// Create a client for the service at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            client: reqwest::Client::new(),
        }
    }

    /// Create a client from configuration.
    pub fn from_config(config: &KnowledgeConfig) -> Self {
        Self::new(config.url.clone())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| CompanionError::Knowledge(format!("request to {path} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CompanionError::Knowledge(format!(
                "{path} returned {}",
                status.as_u16()
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| CompanionError::Knowledge(format!("invalid {path} response: {e}")))
    }
}

#[async_trait]
impl KnowledgeStore for HttpKnowledgeStore {
    async fn random_topics(&self, limit: usize) -> Result<Vec<Topic>> {
        let response: RandomTopicsResponse = self
            .get_json("/random", &[("limit", limit.to_string())])
            .await?;
        debug!(count = response.results.len(), "fetched random topics");
        Ok(response.results)
    }

    async fn query_similar(
        &self,
        text: &str,
        limit: usize,
        threshold: f32,
    ) -> Result<KnowledgeResponse> {
        if text.trim().is_empty() {
            debug!("skipping empty knowledge query");
            return Ok(KnowledgeResponse::default());
        }

        let mut response: KnowledgeResponse = self
            .get_json(
                "/knowledge",
                &[
                    ("query", text.to_owned()),
                    ("limit", limit.to_string()),
                    ("threshold", threshold.to_string()),
                ],
            )
            .await?;
        if response.total == 0 {
            response.total = response.results.len();
        }
        info!(total = response.total, threshold, "knowledge query matched");
        Ok(response)
    }
}
