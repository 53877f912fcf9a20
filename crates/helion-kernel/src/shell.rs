//! Shell version history.
//!
//! The self-improvement loop rewrites the browser shell over time. Every
//! accepted rewrite becomes a version: bodies live in
//! `shell-versions/<id>.html`, the index in `shell-versions.json`, and
//! `shell-current.json` points at the active version so a bad rewrite is one
//! activate away from being rolled back.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{KernelError, Result};
use crate::registry::atomic_write;

/// Index record for one saved shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellVersion {
    /// Version id (uuid).
    pub id: String,
    /// Where the version came from (`seed`, `self-improve`, `manual`).
    pub origin: String,
    /// Optional note describing the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Unix seconds.
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct CurrentPointer {
    id: Option<String>,
}

/// The shell version store.
pub struct ShellStore {
    data_root: PathBuf,
    index: Mutex<Vec<ShellVersion>>,
}

impl ShellStore {
    /// Load the index from `<data_root>/shell-versions.json`.
    pub fn load(data_root: &Path) -> Self {
        let index = match std::fs::read(data_root.join("shell-versions.json")) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                tracing::warn!(%err, "corrupt shell-versions.json, starting fresh");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        Self {
            data_root: data_root.to_path_buf(),
            index: Mutex::new(index),
        }
    }

    /// Save a new shell body and return its version record.
    ///
    /// Saving does not activate; call [`ShellStore::activate`] after any
    /// validation the caller wants to run.
    pub fn save(&self, html: &str, origin: &str, note: Option<String>) -> Result<ShellVersion> {
        let version = ShellVersion {
            id: Uuid::new_v4().to_string(),
            origin: origin.to_string(),
            note,
            created_at: now(),
        };
        let dir = self.data_root.join("shell-versions");
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(format!("{}.html", version.id)), html)?;

        let mut index = self.index.lock();
        index.insert(0, version.clone());
        let json = serde_json::to_vec_pretty(&*index)
            .map_err(|e| KernelError::Internal(format!("shell index serialize: {e}")))?;
        drop(index);
        atomic_write(&self.data_root.join("shell-versions.json"), &json)?;
        Ok(version)
    }

    /// All versions, newest first.
    pub fn list(&self) -> Vec<ShellVersion> {
        self.index.lock().clone()
    }

    /// Make a version current.
    pub fn activate(&self, id: &str) -> Result<()> {
        if !self.index.lock().iter().any(|v| v.id == id) {
            return Err(KernelError::NotFound {
                what: format!("shell version {id}"),
            });
        }
        let pointer = CurrentPointer {
            id: Some(id.to_string()),
        };
        let json = serde_json::to_vec_pretty(&pointer)
            .map_err(|e| KernelError::Internal(format!("shell pointer serialize: {e}")))?;
        atomic_write(&self.data_root.join("shell-current.json"), &json)?;
        Ok(())
    }

    /// The active version's body, when one is set.
    pub fn current(&self) -> Option<String> {
        let bytes = std::fs::read(self.data_root.join("shell-current.json")).ok()?;
        let pointer: CurrentPointer = serde_json::from_slice(&bytes).ok()?;
        let id = pointer.id?;
        std::fs::read_to_string(
            self.data_root
                .join("shell-versions")
                .join(format!("{id}.html")),
        )
        .ok()
    }

    /// The active version's id, when one is set.
    pub fn current_id(&self) -> Option<String> {
        let bytes = std::fs::read(self.data_root.join("shell-current.json")).ok()?;
        let pointer: CurrentPointer = serde_json::from_slice(&bytes).ok()?;
        pointer.id
    }
}

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
