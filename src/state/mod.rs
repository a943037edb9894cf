//! Daemon state: in-memory session tracking plus the SQLite-backed shared
//! key-value store.
//!
//! Sessions live only in memory and are carried across hot reloads inside
//! `LOAD_STATE`; the keyed store persists on disk and needs no transfer.

pub mod kv;

use std::path::PathBuf;

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde_json::Value;

pub use kv::{KvEntry, SharedStateStore};

/// Tracks the last observed output per LLM session.
///
/// The completion pipeline is the sole writer; everything else reads.
#[derive(Debug, Default)]
pub struct SessionTracker {
    sessions: DashMap<String, Value>,
    last_session_path: Option<PathBuf>,
}

impl SessionTracker {
    pub fn new(last_session_path: Option<PathBuf>) -> Self {
        Self {
            sessions: DashMap::new(),
            last_session_path,
        }
    }

    /// Record the output of a completed LLM call.
    pub fn track(&self, session_id: &str, output: Value) {
        self.sessions.insert(session_id.to_string(), output);
        if let Some(path) = &self.last_session_path {
            if let Err(e) = std::fs::write(path, session_id) {
                tracing::warn!(error = %e, "failed to persist last_session_id");
            }
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Value> {
        self.sessions.get(session_id).map(|v| v.clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Most recent session id persisted on disk, surviving restarts.
    pub fn last_session_id(&self) -> Option<String> {
        let path = self.last_session_path.as_ref()?;
        std::fs::read_to_string(path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Serialise for hot-reload transfer.
    pub fn serialize_state(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        Value::Object(map)
    }

    /// Absorb state from a predecessor daemon.
    pub fn load_state(&self, state: &Value) -> Result<usize> {
        let map = state
            .as_object()
            .context("sessions state must be an object keyed by session id")?;
        for (session_id, output) in map {
            self.sessions.insert(session_id.clone(), output.clone());
        }
        Ok(map.len())
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }
}
