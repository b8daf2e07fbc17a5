//! Configuration types for the conversation companion.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{CompanionError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    /// Streaming send pipeline settings.
    pub chat: ChatConfig,
    /// Idle-continuation engine settings.
    pub idle_talk: IdleTalkConfig,
    /// Retrieval store settings.
    pub knowledge: KnowledgeConfig,
    /// Model provider settings.
    pub provider: ProviderSettings,
}

/// Streaming send pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Minimum number of characters the token parser buffers before
    /// emitting a literal event.
    pub min_literal_emit_length: usize,
    /// Persona base prompt placed after the fixed formatting instructions
    /// in the system message.
    pub system_prompt: String,
    /// Where the conversation history is persisted. `None` keeps it in memory.
    /// Relative paths resolve against [`data_dir`].
    pub history_path: Option<PathBuf>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            min_literal_emit_length: 24,
            system_prompt: "You are Hibiki, a cheerful companion who chats with listeners \
                            in short, natural sentences."
                .to_owned(),
            history_path: None,
        }
    }
}

impl ChatConfig {
    /// Resolved history directory, if persistence is configured.
    pub fn history_dir(&self) -> Option<PathBuf> {
        self.history_path.as_ref().map(|path| {
            if path.is_absolute() {
                path.clone()
            } else {
                data_dir().join(path)
            }
        })
    }
}

/// Application data root.
///
/// Resolves to `dirs::data_dir()/hibiki/` by default. Override with
/// the `HIBIKI_DATA_DIR` environment variable.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("HIBIKI_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("hibiki"))
        .unwrap_or_else(|| PathBuf::from("/tmp/hibiki-data"))
}

/// How a fresh topic is chosen among the candidates returned by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicMode {
    /// Pick uniformly at random.
    #[default]
    Random,
    /// Take candidates in the order the store returned them.
    Sequential,
}

/// Idle-continuation engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleTalkConfig {
    /// Whether the engine arms its timer at all.
    pub enabled: bool,
    /// Silence duration before an autonomous turn, in milliseconds.
    pub timeout_ms: u64,
    /// Topic selection strategy.
    pub mode: TopicMode,
    /// Similarity threshold for continuation context lookups (0.0-1.0).
    pub min_similarity: f32,
    /// Whether autonomous turns deepen the previous response.
    pub continue_context: bool,
    /// Maximum consecutive continuations of one topic.
    pub max_context_continuation: u32,
}

impl Default for IdleTalkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 30_000,
            mode: TopicMode::Random,
            min_similarity: 0.6,
            continue_context: true,
            max_context_continuation: 3,
        }
    }
}

/// Retrieval store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    /// Whether the HTTP retrieval store is used.
    pub enabled: bool,
    /// Base URL of the retrieval service.
    pub url: String,
    /// Default number of results for knowledge injection.
    pub limit: usize,
    /// Default similarity threshold for knowledge injection.
    pub threshold: f32,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:3100".to_owned(),
            limit: 3,
            threshold: 0.3,
        }
    }
}

/// OpenAI-compatible provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Base URL of the API (without `/v1/chat/completions`).
    pub base_url: String,
    /// Model identifier sent with every request.
    pub model: String,
    /// Bearer token, if the endpoint needs one.
    pub api_key: Option<String>,
    /// Extra HTTP headers forwarded on every request.
    pub headers: BTreeMap<String, String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_owned(),
            model: "qwen3:8b".to_owned(),
            api_key: None,
            headers: BTreeMap::new(),
        }
    }
}

impl CompanionConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid TOML.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CompanionError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| CompanionError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/hibiki/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("hibiki").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("hibiki")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/hibiki-config/config.toml")
        }
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`CompanionError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.idle_talk.min_similarity) {
            return Err(CompanionError::Config(format!(
                "idle_talk.min_similarity must be within 0..=1, got {}",
                self.idle_talk.min_similarity
            )));
        }
        if self.idle_talk.enabled && self.idle_talk.timeout_ms == 0 {
            return Err(CompanionError::Config(
                "idle_talk.timeout_ms must be positive when idle talk is enabled".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.knowledge.threshold) {
            return Err(CompanionError::Config(format!(
                "knowledge.threshold must be within 0..=1, got {}",
                self.knowledge.threshold
            )));
        }
        if self.knowledge.enabled && self.knowledge.url.trim().is_empty() {
            return Err(CompanionError::Config(
                "knowledge.url must be set when the knowledge store is enabled".into(),
            ));
        }
        Ok(())
    }
}
