//! Keyed blob persistence for the three pieces of durable state.
//!
//! Stores only move opaque strings. The typed helpers below own the JSON
//! encoding and treat anything missing or unreadable as absent.

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::{AgentConfig, StateBackend};
use crate::conversation::Turn;
use crate::database::SqliteStateStore;
use crate::emotion::EmotionState;
use crate::memory::{LongTermMemoryStore, MemoryRecord};

pub const CONVERSATION_KEY: &str = "conversation";
pub const MEMORIES_KEY: &str = "memories";
pub const EMOTION_KEY: &str = "emotion";

pub trait StateStore: Send + Sync {
    fn load_blob(&self, key: &str) -> Result<Option<String>>;
    fn save_blob(&self, key: &str, value: &str) -> Result<()>;
}

/// Open the store selected by config.
pub fn open_state_store(config: &AgentConfig) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match config.state_backend {
        StateBackend::Sqlite => Arc::new(
            SqliteStateStore::new(&config.database_path).with_context(|| {
                format!("Failed to open state database at '{}'", config.database_path)
            })?,
        ),
        StateBackend::JsonFiles => Arc::new(JsonFileStateStore::new(&config.state_dir)?),
        StateBackend::Memory => {
            tracing::warn!("Using in-memory state store; nothing will survive a restart");
            Arc::new(InMemoryStateStore::default())
        }
    };
    Ok(store)
}

#[derive(Default)]
pub struct InMemoryStateStore {
    blobs: Mutex<HashMap<String, String>>,
}

impl StateStore for InMemoryStateStore {
    fn load_blob(&self, key: &str) -> Result<Option<String>> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|e| anyhow::anyhow!("State store lock poisoned: {}", e))?;
        Ok(blobs.get(key).cloned())
    }

    fn save_blob(&self, key: &str, value: &str) -> Result<()> {
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|e| anyhow::anyhow!("State store lock poisoned: {}", e))?;
        blobs.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// One file per key, using the legacy file names so an existing state
/// directory loads as-is.
pub struct JsonFileStateStore {
    dir: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create state directory {:?}", dir))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name = match key {
            CONVERSATION_KEY => "chat_history.json".to_string(),
            MEMORIES_KEY => "memory.json".to_string(),
            EMOTION_KEY => "emotion.txt".to_string(),
            other => format!("{}.json", other),
        };
        self.dir.join(file_name)
    }
}

impl StateStore for JsonFileStateStore {
    fn load_blob(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        fs::read_to_string(&path)
            .map(Some)
            .with_context(|| format!("Failed to read {:?}", path))
    }

    fn save_blob(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value).with_context(|| format!("Failed to write {:?}", tmp))?;
        fs::rename(&tmp, &path).with_context(|| format!("Failed to replace {:?}", path))?;
        Ok(())
    }
}

/// Fetch and parse a blob; any failure along the way reads as absent.
fn load_json(store: &dyn StateStore, key: &str) -> Option<Value> {
    let raw = match store.load_blob(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!("Failed to load '{}' state, treating as absent: {:#}", key, e);
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Corrupt '{}' state, treating as absent: {}", key, e);
            None
        }
    }
}

/// Decode a JSON array element by element, skipping entries that don't fit.
fn decode_list<T: serde::de::DeserializeOwned>(key: &str, value: Option<Value>) -> Vec<T> {
    let items = match value {
        Some(Value::Array(items)) => items,
        Some(_) => {
            tracing::warn!("'{}' state is not a list, treating as absent", key);
            return Vec::new();
        }
        None => return Vec::new(),
    };
    let total = items.len();
    let decoded: Vec<T> = items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect();
    if decoded.len() < total {
        tracing::warn!(
            "Skipped {} unreadable entries in '{}' state",
            total - decoded.len(),
            key
        );
    }
    decoded
}

fn save_json<T: serde::Serialize + ?Sized>(store: &dyn StateStore, key: &str, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .with_context(|| format!("Failed to encode '{}' state", key))?;
    store
        .save_blob(key, &text)
        .with_context(|| format!("Failed to save '{}' state", key))
}

pub fn load_conversation(store: &dyn StateStore) -> Vec<Turn> {
    decode_list(CONVERSATION_KEY, load_json(store, CONVERSATION_KEY))
}

pub fn save_conversation(store: &dyn StateStore, turns: &[Turn]) -> Result<()> {
    save_json(store, CONVERSATION_KEY, turns)
}

pub fn load_memories(store: &dyn StateStore, capacity: usize) -> LongTermMemoryStore {
    let records: Vec<MemoryRecord> = decode_list(MEMORIES_KEY, load_json(store, MEMORIES_KEY));
    LongTermMemoryStore::from_records(records, capacity)
}

pub fn save_memories(store: &dyn StateStore, memories: &LongTermMemoryStore) -> Result<()> {
    save_json(store, MEMORIES_KEY, memories.records())
}

pub fn load_emotion(store: &dyn StateStore) -> EmotionState {
    let default = EmotionState::default();
    match load_json(store, EMOTION_KEY) {
        Some(raw) => EmotionState::validate(&raw, &default),
        None => default,
    }
}

pub fn save_emotion(store: &dyn StateStore, emotion: &EmotionState) -> Result<()> {
    save_json(store, EMOTION_KEY, emotion)
}
