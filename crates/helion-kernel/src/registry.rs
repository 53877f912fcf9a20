//! Content-addressed app registry.
//!
//! Every generated app is stored under the first 16 hex characters of the
//! SHA-256 of its code. Sixteen characters keeps addresses short enough for
//! URLs; at the registry sizes a single-user kernel sees, the truncation is
//! a non-issue, and identical code deduplicating to one entry is exactly the
//! behavior we want.
//!
//! Persistence is a single `registry.json`, newest-first, rewritten
//! atomically (temp file + rename) on every mutation.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use helion_guard::{trigram, AppType, Capability};

use crate::error::{KernelError, Result};

/// Width of the content address in hex characters.
pub const HASH_LEN: usize = 16;

/// Similarity floor and cap for [`AppRegistry::find_similar`].
pub const SIMILAR_THRESHOLD: f64 = 0.25;
const SEARCH_LIMIT: usize = 10;

/// One registered app.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppEntry {
    /// Content address: first 16 hex chars of SHA-256(code).
    pub hash: String,
    /// The prompt that produced the app.
    pub prompt: String,
    /// Normalized prompt used for similarity search.
    pub normalized_prompt: String,
    /// Display title.
    pub title: String,
    /// Execution substrate.
    #[serde(rename = "type")]
    pub app_type: AppType,
    /// The generated code (HTML, process code, or base64 wasm).
    pub code: String,
    /// Container recipe for process apps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    /// Capabilities the app declared.
    pub capabilities: Vec<Capability>,
    /// Model that generated it.
    pub model: String,
    /// Provider that generated it.
    pub provider: String,
    /// Launch count (bumped on dedup hits and explicit launches).
    pub launches: u64,
    /// Creation time, unix seconds.
    pub created_at: u64,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Optional generated specification document (markdown).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<String>,
    /// Net user rating.
    #[serde(default)]
    pub rating: i32,
}

/// Outcome of a publish.
#[derive(Debug, Clone, Serialize)]
pub struct Published {
    /// The content address.
    pub hash: String,
    /// True when the code was already registered (dedup hit).
    pub existing: bool,
    /// The entry as stored.
    pub entry: AppEntry,
}

/// A page of browse results.
#[derive(Debug, Clone, Serialize)]
pub struct BrowsePage {
    /// The entries in this page.
    pub apps: Vec<AppEntry>,
    /// Total entries matching the filter.
    pub total: usize,
    /// Echo of the requested offset.
    pub offset: usize,
}

/// Browse filters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrowseQuery {
    /// Entries to skip.
    #[serde(default)]
    pub offset: usize,
    /// Page size (default 20, capped at 100).
    pub limit: Option<usize>,
    /// Only entries carrying this tag.
    pub tag: Option<String>,
    /// Only entries of this type.
    #[serde(rename = "type")]
    pub app_type: Option<AppType>,
}

/// A search hit with its score.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    /// The matching entry.
    pub entry: AppEntry,
    /// Dice similarity in 0–1.
    pub score: f64,
}

/// Aggregate statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    /// Number of entries.
    pub apps: usize,
    /// Sum of launch counts.
    pub total_launches: u64,
    /// Entries per type.
    pub by_type: BTreeMap<String, usize>,
    /// Distinct tag count.
    pub tags: usize,
}

/// Compute the content address of a code body.
pub fn content_hash(code: &str) -> String {
    let digest = Sha256::digest(code.as_bytes());
    hex::encode(digest)[..HASH_LEN].to_string()
}

/// The registry. Writers serialize through the entry lock; readers see
/// either pre- or post-write state.
pub struct AppRegistry {
    path: PathBuf,
    entries: RwLock<Vec<AppEntry>>,
}

impl AppRegistry {
    /// Load the registry from `<data_root>/registry.json`, tolerating a
    /// missing or corrupt file by starting empty.
    pub fn load(data_root: &Path) -> Self {
        let path = data_root.join("registry.json");
        let entries = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<AppEntry>>(&bytes) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!(?path, %err, "corrupt registry.json, starting fresh");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        tracing::info!(count = entries.len(), "registry loaded");
        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    /// Publish an app. Identical code deduplicates: the existing entry's
    /// launch count is bumped and returned with `existing = true`.
    pub fn publish(&self, mut entry: AppEntry) -> Result<Published> {
        if entry.code.is_empty() {
            return Err(KernelError::Validation {
                reason: "cannot publish empty code".into(),
            });
        }
        entry.hash = content_hash(&entry.code);
        entry.normalized_prompt = trigram::normalize(&entry.prompt);

        let mut entries = self.entries.write();
        if let Some(existing) = entries.iter_mut().find(|e| e.hash == entry.hash) {
            existing.launches += 1;
            let snapshot = existing.clone();
            drop(entries);
            self.persist()?;
            return Ok(Published {
                hash: snapshot.hash.clone(),
                existing: true,
                entry: snapshot,
            });
        }

        entries.insert(0, entry.clone());
        drop(entries);
        self.persist()?;
        tracing::info!(hash = %entry.hash, title = %entry.title, "app published");
        Ok(Published {
            hash: entry.hash.clone(),
            existing: false,
            entry,
        })
    }

    /// Look up an entry by content address.
    pub fn get(&self, hash: &str) -> Option<AppEntry> {
        self.entries.read().iter().find(|e| e.hash == hash).cloned()
    }

    /// Bump an entry's launch count.
    pub fn record_launch(&self, hash: &str) -> Result<u64> {
        let launches = {
            let mut entries = self.entries.write();
            let entry = entries
                .iter_mut()
                .find(|e| e.hash == hash)
                .ok_or_else(|| KernelError::NotFound {
                    what: format!("app {hash}"),
                })?;
            entry.launches += 1;
            entry.launches
        };
        self.persist()?;
        Ok(launches)
    }

    /// Page through entries, optionally filtered by tag and type.
    ///
    /// Order is insertion order, newest first. Launch counts and ratings are
    /// carried on each entry for callers that want to re-rank a page.
    pub fn browse(&self, query: &BrowseQuery) -> BrowsePage {
        let limit = query.limit.unwrap_or(20).min(100);
        let entries = self.entries.read();
        let filtered: Vec<&AppEntry> = entries
            .iter()
            .filter(|e| match &query.tag {
                Some(tag) => e.tags.iter().any(|t| t == tag),
                None => true,
            })
            .filter(|e| match query.app_type {
                Some(t) => e.app_type == t,
                None => true,
            })
            .collect();
        let total = filtered.len();
        let apps = filtered
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .cloned()
            .collect();
        BrowsePage {
            apps,
            total,
            offset: query.offset,
        }
    }

    /// Rank entries against a free-text query by trigram similarity over the
    /// normalized prompt, title, and tags. Returns at most 10 hits.
    pub fn search(&self, query: &str) -> Vec<SearchHit> {
        let needle = trigram::normalize(query);
        if needle.is_empty() {
            return Vec::new();
        }
        let mut hits: Vec<SearchHit> = self
            .entries
            .read()
            .iter()
            .filter_map(|e| {
                let haystack = format!(
                    "{} {} {}",
                    e.normalized_prompt,
                    trigram::normalize(&e.title),
                    e.tags.join(" ")
                );
                let score = trigram::similarity(&needle, haystack.trim());
                (score > 0.0).then(|| SearchHit {
                    entry: e.clone(),
                    score,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(SEARCH_LIMIT);
        hits
    }

    /// Entries whose normalized prompt is at least `threshold`-similar to the
    /// given prompt. Used for dedup hints and gateway memory.
    pub fn find_similar(&self, prompt: &str, threshold: f64, limit: usize) -> Vec<SearchHit> {
        let needle = trigram::normalize(prompt);
        if needle.is_empty() {
            return Vec::new();
        }
        let mut hits: Vec<SearchHit> = self
            .entries
            .read()
            .iter()
            .filter_map(|e| {
                let score = trigram::similarity(&needle, &e.normalized_prompt);
                (score >= threshold).then(|| SearchHit {
                    entry: e.clone(),
                    score,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        hits
    }

    /// All tags with their usage counts, most used first.
    pub fn tags(&self) -> Vec<(String, usize)> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for entry in self.entries.read().iter() {
            for tag in &entry.tags {
                *counts.entry(tag.clone()).or_default() += 1;
            }
        }
        let mut tags: Vec<(String, usize)> = counts.into_iter().collect();
        tags.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        tags
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> RegistryStats {
        let entries = self.entries.read();
        let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
        for e in entries.iter() {
            *by_type.entry(e.app_type.to_string()).or_default() += 1;
        }
        RegistryStats {
            apps: entries.len(),
            total_launches: entries.iter().map(|e| e.launches).sum(),
            by_type,
            tags: self.tags().len(),
        }
    }

    /// Attach or replace an entry's generated spec document.
    pub fn update_spec(&self, hash: &str, spec: &str) -> Result<()> {
        self.mutate(hash, |e| e.spec = Some(spec.to_string()))
    }

    /// Apply a +1/-1 rating.
    pub fn rate(&self, hash: &str, delta: i32) -> Result<i32> {
        if delta != 1 && delta != -1 {
            return Err(KernelError::Validation {
                reason: "rating delta must be +1 or -1".into(),
            });
        }
        let mut rating = 0;
        self.mutate(hash, |e| {
            e.rating = e.rating.saturating_add(delta);
            rating = e.rating;
        })?;
        Ok(rating)
    }

    /// Replace an entry's tag list.
    pub fn set_tags(&self, hash: &str, tags: Vec<String>) -> Result<()> {
        self.mutate(hash, |e| e.tags = tags)
    }

    /// Delete an entry. Registry entries are never garbage-collected
    /// implicitly; this is the only way one goes away.
    pub fn delete(&self, hash: &str) -> Result<()> {
        {
            let mut entries = self.entries.write();
            let before = entries.len();
            entries.retain(|e| e.hash != hash);
            if entries.len() == before {
                return Err(KernelError::NotFound {
                    what: format!("app {hash}"),
                });
            }
        }
        self.persist()
    }

    /// All entries (snapshotting, community export).
    pub fn all(&self) -> Vec<AppEntry> {
        self.entries.read().clone()
    }

    /// Best-effort import of a community index.
    ///
    /// Fetches `index_url` (a JSON array of hashes), then each entry at
    /// `index_url/../<hash>.json`. Failures are silent: community sync must
    /// never degrade local operation. Imports are tagged
    /// `community` and keep the local launch counter when the hash already
    /// exists.
    pub async fn sync_community(&self, index_url: &str) -> usize {
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
        {
            Ok(c) => c,
            Err(_) => return 0,
        };

        let hashes: Vec<String> = match client.get(index_url).send().await {
            Ok(resp) => match resp.json().await {
                Ok(v) => v,
                Err(err) => {
                    tracing::debug!(%err, "community index parse failed");
                    return 0;
                }
            },
            Err(err) => {
                tracing::debug!(%err, "community index fetch failed");
                return 0;
            }
        };

        let base = index_url.rsplit_once('/').map(|(b, _)| b).unwrap_or(index_url);
        let mut imported = 0;
        for hash in hashes {
            if self.get(&hash).is_some() {
                continue;
            }
            let url = format!("{base}/{hash}.json");
            let entry: AppEntry = match client
                .get(&url)
                .timeout(Duration::from_secs(8))
                .send()
                .await
                .ok()
                .and_then(|r| r.error_for_status().ok())
            {
                Some(resp) => match resp.json().await {
                    Ok(e) => e,
                    Err(_) => continue,
                },
                None => continue,
            };
            // Re-derive the address locally; never trust the remote hash.
            let mut entry = entry;
            entry.launches = 0;
            if !entry.tags.iter().any(|t| t == "community") {
                entry.tags.push("community".to_string());
            }
            if self.publish(entry).is_ok() {
                imported += 1;
            }
        }
        if imported > 0 {
            tracing::info!(imported, "community sync complete");
        }
        imported
    }

    /// Run a closure against one entry under the write lock, then persist.
    fn mutate(&self, hash: &str, f: impl FnOnce(&mut AppEntry)) -> Result<()> {
        {
            let mut entries = self.entries.write();
            let entry = entries
                .iter_mut()
                .find(|e| e.hash == hash)
                .ok_or_else(|| KernelError::NotFound {
                    what: format!("app {hash}"),
                })?;
            f(entry);
        }
        self.persist()
    }

    /// Atomic full-file rewrite: serialize to a temp file, then rename over
    /// the target so readers never observe a torn write.
    fn persist(&self) -> Result<()> {
        let entries = self.entries.read();
        let json = serde_json::to_vec_pretty(&*entries)
            .map_err(|e| KernelError::Internal(format!("registry serialize: {e}")))?;
        drop(entries);
        atomic_write(&self.path, &json)
    }
}

/// Write `bytes` to `path` via a sibling temp file and rename.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(prompt: &str, code: &str) -> AppEntry {
        AppEntry {
            hash: String::new(),
            prompt: prompt.to_string(),
            normalized_prompt: String::new(),
            title: prompt.to_string(),
            app_type: AppType::Iframe,
            code: code.to_string(),
            dockerfile: None,
            capabilities: vec![Capability::UiWindow],
            model: "test-model".into(),
            provider: "test".into(),
            launches: 1,
            created_at: 0,
            tags: vec![],
            spec: None,
            rating: 0,
        }
    }

    #[test]
    fn hash_is_sha256_prefix() {
        let h = content_hash("<html></html>");
        assert_eq!(h.len(), HASH_LEN);
        let full = hex::encode(Sha256::digest(b"<html></html>"));
        assert_eq!(h, full[..HASH_LEN]);
    }

    #[test]
    fn publish_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let reg = AppRegistry::load(dir.path());
        let published = reg.publish(entry("a clock", "<html>clock</html>")).unwrap();
        assert!(!published.existing);
        let got = reg.get(&published.hash).unwrap();
        assert_eq!(got.hash, content_hash("<html>clock</html>"));
        assert_eq!(got.prompt, "a clock");
    }

    #[test]
    fn duplicate_publish_dedupes_and_bumps_launches() {
        let dir = tempdir().unwrap();
        let reg = AppRegistry::load(dir.path());
        let first = reg.publish(entry("a clock", "<html>x</html>")).unwrap();
        let second = reg.publish(entry("another clock", "<html>x</html>")).unwrap();
        assert!(second.existing);
        assert_eq!(first.hash, second.hash);
        assert_eq!(second.entry.launches, first.entry.launches + 1);
        assert_eq!(reg.all().len(), 1);
    }

    #[test]
    fn different_code_gets_different_hashes() {
        let dir = tempdir().unwrap();
        let reg = AppRegistry::load(dir.path());
        let a = reg.publish(entry("a", "<html>a</html>")).unwrap();
        let b = reg.publish(entry("b", "<html>b</html>")).unwrap();
        assert_ne!(a.hash, b.hash);
        assert_eq!(reg.all().len(), 2);
    }

    #[test]
    fn registry_survives_reload() {
        let dir = tempdir().unwrap();
        let hash = {
            let reg = AppRegistry::load(dir.path());
            reg.publish(entry("todo list", "<html>todo</html>")).unwrap().hash
        };
        let reg = AppRegistry::load(dir.path());
        assert!(reg.get(&hash).is_some());
    }

    #[test]
    fn corrupt_file_starts_fresh() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("registry.json"), b"{not json").unwrap();
        let reg = AppRegistry::load(dir.path());
        assert!(reg.all().is_empty());
    }

    #[test]
    fn newest_entries_come_first() {
        let dir = tempdir().unwrap();
        let reg = AppRegistry::load(dir.path());
        reg.publish(entry("first", "<html>1</html>")).unwrap();
        reg.publish(entry("second", "<html>2</html>")).unwrap();
        let all = reg.all();
        assert_eq!(all[0].prompt, "second");
        assert_eq!(all[1].prompt, "first");
    }

    #[test]
    fn search_finds_similar_prompts() {
        let dir = tempdir().unwrap();
        let reg = AppRegistry::load(dir.path());
        reg.publish(entry("a pomodoro timer", "<html>p</html>")).unwrap();
        reg.publish(entry("currency converter", "<html>c</html>")).unwrap();
        let hits = reg.search("pomodoro timer app");
        assert!(!hits.is_empty());
        assert_eq!(hits[0].entry.prompt, "a pomodoro timer");
    }

    #[test]
    fn find_similar_honors_threshold() {
        let dir = tempdir().unwrap();
        let reg = AppRegistry::load(dir.path());
        reg.publish(entry("a pomodoro timer", "<html>p</html>")).unwrap();
        let hits = reg.find_similar("make me a pomodoro timer", SIMILAR_THRESHOLD, 3);
        assert_eq!(hits.len(), 1);
        let none = reg.find_similar("completely unrelated spreadsheet", 0.9, 3);
        assert!(none.is_empty());
    }

    #[test]
    fn browse_filters_by_tag_and_type() {
        let dir = tempdir().unwrap();
        let reg = AppRegistry::load(dir.path());
        let mut tagged = entry("tagged", "<html>t</html>");
        tagged.tags = vec!["game".into()];
        reg.publish(tagged).unwrap();
        reg.publish(entry("plain", "<html>p</html>")).unwrap();

        let page = reg.browse(&BrowseQuery {
            tag: Some("game".into()),
            ..Default::default()
        });
        assert_eq!(page.total, 1);
        assert_eq!(page.apps[0].prompt, "tagged");

        let page = reg.browse(&BrowseQuery {
            app_type: Some(AppType::Process),
            ..Default::default()
        });
        assert_eq!(page.total, 0);
    }

    #[test]
    fn rate_validates_delta() {
        let dir = tempdir().unwrap();
        let reg = AppRegistry::load(dir.path());
        let hash = reg.publish(entry("a", "<html>a</html>")).unwrap().hash;
        assert_eq!(reg.rate(&hash, 1).unwrap(), 1);
        assert_eq!(reg.rate(&hash, -1).unwrap(), 0);
        assert!(reg.rate(&hash, 5).is_err());
    }

    #[test]
    fn delete_removes_entry() {
        let dir = tempdir().unwrap();
        let reg = AppRegistry::load(dir.path());
        let hash = reg.publish(entry("a", "<html>a</html>")).unwrap().hash;
        reg.delete(&hash).unwrap();
        assert!(reg.get(&hash).is_none());
        assert!(matches!(
            reg.delete(&hash),
            Err(KernelError::NotFound { .. })
        ));
    }

    #[test]
    fn record_launch_bumps_count() {
        let dir = tempdir().unwrap();
        let reg = AppRegistry::load(dir.path());
        let published = reg.publish(entry("a", "<html>a</html>")).unwrap();
        let launches = reg.record_launch(&published.hash).unwrap();
        assert_eq!(launches, published.entry.launches + 1);
    }
}
