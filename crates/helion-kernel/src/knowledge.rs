//! Generation knowledge base.
//!
//! A bounded history of past generations the gateway consults before calling
//! a provider: similar past prompts become a short memory section in the
//! system prompt, which measurably reduces re-generation drift for repeat
//! requests. Persisted to `knowledge.json`, capped at 200 entries.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use helion_guard::{trigram, Capability, Complexity};

use crate::registry::atomic_write;
use crate::error::Result;

/// Maximum retained entries.
pub const MAX_ENTRIES: usize = 200;

/// One remembered generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    /// The original prompt.
    pub prompt: String,
    /// Normalized form used for similarity.
    pub normalized: String,
    /// Provider that served it.
    pub provider: String,
    /// Model that served it.
    pub model: String,
    /// Classified complexity.
    pub complexity: Complexity,
    /// Capabilities the generated app declared.
    pub capabilities: Vec<Capability>,
    /// Unix seconds.
    pub created_at: u64,
}

/// The knowledge base. Oldest entries fall off the back.
pub struct KnowledgeBase {
    path: PathBuf,
    entries: Mutex<VecDeque<KnowledgeEntry>>,
}

impl KnowledgeBase {
    /// Load from `<data_root>/knowledge.json`, starting fresh on corruption.
    pub fn load(data_root: &Path) -> Self {
        let path = data_root.join("knowledge.json");
        let entries = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<KnowledgeEntry>>(&bytes) {
                Ok(v) => v.into_iter().collect(),
                Err(err) => {
                    tracing::warn!(%err, "corrupt knowledge.json, starting fresh");
                    VecDeque::new()
                }
            },
            Err(_) => VecDeque::new(),
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    /// Record a generation, evicting the oldest entry past the cap.
    pub fn record(&self, mut entry: KnowledgeEntry) -> Result<()> {
        entry.normalized = trigram::normalize(&entry.prompt);
        {
            let mut entries = self.entries.lock();
            entries.push_front(entry);
            while entries.len() > MAX_ENTRIES {
                entries.pop_back();
            }
        }
        self.persist()
    }

    /// Past generations similar to `prompt`, best first.
    pub fn find_similar(&self, prompt: &str, threshold: f64, limit: usize) -> Vec<KnowledgeEntry> {
        let needle = trigram::normalize(prompt);
        if needle.is_empty() {
            return Vec::new();
        }
        let entries = self.entries.lock();
        let mut scored: Vec<(f64, KnowledgeEntry)> = entries
            .iter()
            .filter_map(|e| {
                let score = trigram::similarity(&needle, &e.normalized);
                (score >= threshold).then(|| (score, e.clone()))
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.into_iter().take(limit).map(|(_, e)| e).collect()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no generations are remembered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop near-duplicate entries (same normalized prompt), keeping the
    /// newest. Returns how many were removed; used by the pruning task.
    pub fn prune_duplicates(&self) -> Result<usize> {
        let removed = {
            let mut entries = self.entries.lock();
            let mut seen = std::collections::HashSet::new();
            let before = entries.len();
            entries.retain(|e| seen.insert(e.normalized.clone()));
            before - entries.len()
        };
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    fn persist(&self) -> Result<()> {
        let entries = self.entries.lock();
        let vec: Vec<&KnowledgeEntry> = entries.iter().collect();
        let json = serde_json::to_vec_pretty(&vec)
            .map_err(|e| crate::error::KernelError::Internal(format!("knowledge serialize: {e}")))?;
        drop(entries);
        atomic_write(&self.path, &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(prompt: &str) -> KnowledgeEntry {
        KnowledgeEntry {
            prompt: prompt.to_string(),
            normalized: String::new(),
            provider: "test".into(),
            model: "m".into(),
            complexity: Complexity::Simple,
            capabilities: vec![Capability::UiWindow],
            created_at: 0,
        }
    }

    #[test]
    fn record_and_find_similar() {
        let dir = tempdir().unwrap();
        let kb = KnowledgeBase::load(dir.path());
        kb.record(entry("a pomodoro timer")).unwrap();
        kb.record(entry("currency converter")).unwrap();

        let hits = kb.find_similar("make a pomodoro timer", 0.25, 3);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].prompt, "a pomodoro timer");
    }

    #[test]
    fn bounded_at_max_entries() {
        let dir = tempdir().unwrap();
        let kb = KnowledgeBase::load(dir.path());
        for i in 0..(MAX_ENTRIES + 25) {
            kb.record(entry(&format!("unique prompt number {i}"))).unwrap();
        }
        assert_eq!(kb.len(), MAX_ENTRIES);
    }

    #[test]
    fn survives_reload() {
        let dir = tempdir().unwrap();
        {
            let kb = KnowledgeBase::load(dir.path());
            kb.record(entry("notes app")).unwrap();
        }
        let kb = KnowledgeBase::load(dir.path());
        assert_eq!(kb.len(), 1);
    }

    #[test]
    fn prune_removes_duplicates() {
        let dir = tempdir().unwrap();
        let kb = KnowledgeBase::load(dir.path());
        kb.record(entry("a notes app")).unwrap();
        kb.record(entry("notes app")).unwrap(); // same normalized form
        kb.record(entry("weather widget")).unwrap();
        let removed = kb.prune_duplicates().unwrap();
        assert_eq!(removed, 1);
        assert_eq!(kb.len(), 2);
    }
}
