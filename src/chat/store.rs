//! Durable storage for the conversation history.
//!
//! The history lives under a single fixed key, [`HISTORY_KEY`]. Two backends
//! are provided: [`MemoryHistoryStore`] for tests and ephemeral sessions, and
//! [`FsHistoryStore`] which keeps one JSON file per key with atomic writes
//! (temp file, fsync, rename).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::message::ChatMessage;
use crate::error::{CompanionError, Result};

/// Key the conversation history is stored under.
pub const HISTORY_KEY: &str = "chat/messages";

/// Async key-value storage for message lists.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Load the messages stored under `key`, or `None` if nothing was saved yet.
    async fn load(&self, key: &str) -> Result<Option<Vec<ChatMessage>>>;

    /// Overwrite the messages stored under `key`.
    async fn save(&self, key: &str, messages: &[ChatMessage]) -> Result<()>;
}

/// In-memory history store. Cheaply cloneable; clones share contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryHistoryStore {
    entries: Arc<RwLock<HashMap<String, Vec<ChatMessage>>>>,
}

impl MemoryHistoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<ChatMessage>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, messages: &[ChatMessage]) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_owned(), messages.to_vec());
        Ok(())
    }
}

/// Filesystem-backed history store.
///
/// Each key maps to `{data_dir}/{key}.json` with `/` replaced by `_`.
#[derive(Debug, Clone)]
pub struct FsHistoryStore {
    data_dir: PathBuf,
    write_lock: Arc<std::sync::Mutex<()>>,
}

impl FsHistoryStore {
    /// Create a store rooted at `data_dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`CompanionError::History`] if the directory cannot be created.
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir).map_err(|e| {
            CompanionError::History(format!(
                "failed to create history directory {}: {e}",
                data_dir.display()
            ))
        })?;
        Ok(Self {
            data_dir,
            write_lock: Arc::new(std::sync::Mutex::new(())),
        })
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn file_stem(key: &str) -> String {
        key.replace(['/', '\\'], "_")
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.data_dir.join(format!("{}.json", Self::file_stem(key)))
    }

    fn write_atomic(&self, key: &str, messages: &[ChatMessage]) -> Result<()> {
        let path = self.entry_path(key);
        let json = serde_json::to_string_pretty(messages)
            .map_err(|e| CompanionError::History(format!("failed to serialize history: {e}")))?;

        // One writer at a time: every save of a key shares the same temp file.
        let _writing = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let tmp_path = self.data_dir.join(format!(".{}.tmp", Self::file_stem(key)));
        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| {
            CompanionError::History(format!(
                "failed to write temp file {}: {e}",
                tmp_path.display()
            ))
        })?;

        if let Ok(file) = std::fs::File::open(&tmp_path) {
            let _ = file.sync_all();
        }

        std::fs::rename(&tmp_path, &path).map_err(|e| {
            CompanionError::History(format!(
                "failed to rename temp file to {}: {e}",
                path.display()
            ))
        })
    }
}

#[async_trait]
impl HistoryStore for FsHistoryStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<ChatMessage>>> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path).map_err(|e| {
            CompanionError::History(format!("failed to read {}: {e}", path.display()))
        })?;
        let messages = serde_json::from_str(&content).map_err(|e| {
            CompanionError::History(format!("failed to parse {}: {e}", path.display()))
        })?;
        Ok(Some(messages))
    }

    async fn save(&self, key: &str, messages: &[ChatMessage]) -> Result<()> {
        self.write_atomic(key, messages)
    }
}
