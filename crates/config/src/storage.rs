//! Storage locations for the gateway's persisted state.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Where usage, error, debug and cooldown state files live.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Base directory.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data"),
        }
    }
}

impl StorageConfig {
    /// Usage records, one JSON document per line.
    pub fn usage_log(&self) -> PathBuf {
        self.path.join("usage.jsonl")
    }

    /// Error records, one JSON document per line.
    pub fn error_log(&self) -> PathBuf {
        self.path.join("errors.jsonl")
    }

    /// Captured SSE traces, one file per request id.
    pub fn debug_dir(&self) -> PathBuf {
        self.path.join("debug")
    }

    /// Cooldown state, a single JSON document replaced atomically.
    pub fn cooldown_state(&self) -> PathBuf {
        self.path.join("cooldowns.json")
    }

    /// Base directory accessor.
    pub fn base(&self) -> &Path {
        &self.path
    }
}
