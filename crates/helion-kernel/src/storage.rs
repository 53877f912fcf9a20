//! Per-app persistent key-value storage.
//!
//! Each app owns `<data_root>/apps/<sanitized id>/store.json`, a flat JSON
//! object with a byte quota over its serialized form. Two independent layers
//! keep apps inside their directory:
//!
//! 1. The sanitizer maps every character outside `[A-Za-z0-9_-]` to `_`, so
//!    an app id cannot even spell a path separator.
//! 2. The `apps/` tree is held as a `cap_std::fs::Dir` handle; all file
//!    operations resolve relative to it, so even a sanitizer regression
//!    cannot escape.
//!
//! Writes are debounced ~500 ms per app and coalesced; `flush_all` drains
//! every dirty store synchronously and is called on graceful shutdown.

use cap_std::ambient_authority;
use cap_std::fs::Dir;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{KernelError, Result};

/// Default serialized-size quota per app.
pub const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

/// Debounce window for coalescing writes.
pub const FLUSH_DEBOUNCE: Duration = Duration::from_millis(500);

const STORE_FILE: &str = "store.json";

/// Map any character outside `[A-Za-z0-9_-]` to `_`.
pub fn sanitize_app_id(app_id: &str) -> String {
    app_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

struct StoreEntry {
    data: Map<String, Value>,
    dirty: bool,
    /// A flush is already scheduled for this app.
    flush_pending: bool,
}

/// Usage numbers for one app's store.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreUsage {
    /// Serialized size in bytes.
    pub used: usize,
    /// The quota in bytes.
    pub quota: usize,
    /// Number of keys.
    pub keys: usize,
}

/// The storage service. Cheap to clone; all clones share the cache.
#[derive(Clone)]
pub struct AppStorage {
    inner: Arc<StorageInner>,
}

struct StorageInner {
    root: Dir,
    cache: Mutex<HashMap<String, StoreEntry>>,
    quota: usize,
}

impl AppStorage {
    /// Open (creating if needed) the `apps/` tree under `data_root`.
    pub fn open(data_root: &Path) -> Result<Self> {
        let apps_dir = data_root.join("apps");
        std::fs::create_dir_all(&apps_dir)?;
        let root = Dir::open_ambient_dir(&apps_dir, ambient_authority())?;
        Ok(Self {
            inner: Arc::new(StorageInner {
                root,
                cache: Mutex::new(HashMap::new()),
                quota: DEFAULT_QUOTA_BYTES,
            }),
        })
    }

    /// Open with a non-default quota (tests use small ones).
    pub fn open_with_quota(data_root: &Path, quota: usize) -> Result<Self> {
        let mut storage = Self::open(data_root)?;
        let inner = Arc::get_mut(&mut storage.inner).expect("sole owner at construction");
        inner.quota = quota;
        Ok(storage)
    }

    /// Read one key. `None` when the key (or the app) does not exist.
    pub fn get(&self, app_id: &str, key: &str) -> Option<Value> {
        let app = sanitize_app_id(app_id);
        let mut cache = self.inner.cache.lock();
        let entry = self.inner.load_entry(&mut cache, &app);
        entry.data.get(key).cloned()
    }

    /// Write one key, enforcing the quota on the post-write serialized size.
    ///
    /// A failing set does not mutate the store: the previous value (or
    /// absence) is restored before returning `quota_exceeded`.
    pub fn set(&self, app_id: &str, key: &str, value: Value) -> Result<()> {
        let app = sanitize_app_id(app_id);
        let mut cache = self.inner.cache.lock();
        let quota = self.inner.quota;
        let entry = self.inner.load_entry(&mut cache, &app);

        let previous = entry.data.insert(key.to_string(), value);
        let serialized = serde_json::to_vec(&entry.data)
            .map_err(|e| KernelError::Internal(format!("store serialize: {e}")))?;

        if serialized.len() > quota {
            // Roll back.
            let over = serialized.len() - quota;
            match previous {
                Some(prev) => {
                    entry.data.insert(key.to_string(), prev);
                }
                None => {
                    entry.data.remove(key);
                }
            }
            let used = serde_json::to_vec(&entry.data).map(|v| v.len()).unwrap_or(0);
            return Err(KernelError::QuotaExceeded {
                app_id: app,
                used,
                requested: over,
                limit: quota,
            });
        }

        entry.dirty = true;
        let schedule = !entry.flush_pending;
        if schedule {
            entry.flush_pending = true;
        }
        drop(cache);

        if schedule {
            self.schedule_flush(app);
        }
        Ok(())
    }

    /// Remove one key. Returns whether it existed.
    pub fn remove(&self, app_id: &str, key: &str) -> bool {
        let app = sanitize_app_id(app_id);
        let mut cache = self.inner.cache.lock();
        let entry = self.inner.load_entry(&mut cache, &app);
        let existed = entry.data.remove(key).is_some();
        if existed {
            entry.dirty = true;
            let schedule = !entry.flush_pending;
            entry.flush_pending = true;
            drop(cache);
            if schedule {
                self.schedule_flush(app);
            }
        }
        existed
    }

    /// All keys in an app's store.
    pub fn keys(&self, app_id: &str) -> Vec<String> {
        let app = sanitize_app_id(app_id);
        let mut cache = self.inner.cache.lock();
        let entry = self.inner.load_entry(&mut cache, &app);
        entry.data.keys().cloned().collect()
    }

    /// Usage accounting for an app.
    pub fn usage(&self, app_id: &str) -> StoreUsage {
        let app = sanitize_app_id(app_id);
        let mut cache = self.inner.cache.lock();
        let entry = self.inner.load_entry(&mut cache, &app);
        StoreUsage {
            used: serde_json::to_vec(&entry.data).map(|v| v.len()).unwrap_or(0),
            quota: self.inner.quota,
            keys: entry.data.len(),
        }
    }

    /// Clear an app's store (keeps the app directory).
    pub fn clear(&self, app_id: &str) -> Result<()> {
        let app = sanitize_app_id(app_id);
        {
            let mut cache = self.inner.cache.lock();
            let entry = self.inner.load_entry(&mut cache, &app);
            entry.data.clear();
            entry.dirty = true;
        }
        self.inner.flush_app(&app)
    }

    /// Delete an app's storage entirely.
    pub fn delete(&self, app_id: &str) -> Result<()> {
        let app = sanitize_app_id(app_id);
        self.inner.cache.lock().remove(&app);
        if self.inner.root.exists(&app) {
            self.inner.root.remove_dir_all(&app)?;
        }
        Ok(())
    }

    /// Export one app's store as a JSON object.
    pub fn export(&self, app_id: &str) -> Value {
        let app = sanitize_app_id(app_id);
        let mut cache = self.inner.cache.lock();
        let entry = self.inner.load_entry(&mut cache, &app);
        Value::Object(entry.data.clone())
    }

    /// Import a JSON object into an app's store, replacing its contents.
    pub fn import(&self, app_id: &str, data: Value) -> Result<()> {
        let Value::Object(map) = data else {
            return Err(KernelError::Validation {
                reason: "import payload must be a JSON object".into(),
            });
        };
        let serialized = serde_json::to_vec(&map)
            .map_err(|e| KernelError::Internal(format!("store serialize: {e}")))?;
        if serialized.len() > self.inner.quota {
            return Err(KernelError::QuotaExceeded {
                app_id: sanitize_app_id(app_id),
                used: 0,
                requested: serialized.len(),
                limit: self.inner.quota,
            });
        }
        let app = sanitize_app_id(app_id);
        {
            let mut cache = self.inner.cache.lock();
            let entry = self.inner.load_entry(&mut cache, &app);
            entry.data = map;
            entry.dirty = true;
        }
        self.inner.flush_app(&app)
    }

    /// Apps that have a store on disk.
    pub fn list_apps(&self) -> Vec<String> {
        let mut apps: Vec<String> = self
            .inner
            .root
            .entries()
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
                    .filter_map(|e| e.file_name().into_string().ok())
                    .collect()
            })
            .unwrap_or_default();
        apps.sort();
        apps
    }

    /// Export every app's store keyed by app id.
    pub fn export_all(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for app in self.list_apps() {
            out.insert(app.clone(), self.export(&app));
        }
        out
    }

    /// Synchronously write every dirty store. Called on graceful shutdown.
    pub fn flush_all(&self) -> Result<()> {
        let apps: Vec<String> = {
            let cache = self.inner.cache.lock();
            cache
                .iter()
                .filter(|(_, e)| e.dirty)
                .map(|(k, _)| k.clone())
                .collect()
        };
        for app in apps {
            self.inner.flush_app(&app)?;
        }
        Ok(())
    }

    /// Debounced flush: wait out the window, then write if still dirty.
    fn schedule_flush(&self, app: String) {
        let inner = Arc::clone(&self.inner);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(FLUSH_DEBOUNCE).await;
                    if let Err(err) = inner.flush_app(&app) {
                        tracing::warn!(app, %err, "debounced flush failed");
                    }
                });
            }
            // No runtime (sync tests): write through immediately.
            Err(_) => {
                if let Err(err) = inner.flush_app(&app) {
                    tracing::warn!(app, %err, "write-through flush failed");
                }
            }
        }
    }
}

impl StorageInner {
    /// Load an app's store into the cache if absent. Corrupt files start
    /// fresh with a warning; storage must never brick an app.
    fn load_entry<'c>(
        &self,
        cache: &'c mut HashMap<String, StoreEntry>,
        app: &str,
    ) -> &'c mut StoreEntry {
        cache.entry(app.to_string()).or_insert_with(|| {
            let path = format!("{app}/{STORE_FILE}");
            let data = match self.root.read(&path) {
                Ok(bytes) => match serde_json::from_slice::<Map<String, Value>>(&bytes) {
                    Ok(map) => map,
                    Err(err) => {
                        tracing::warn!(app, %err, "corrupt store.json, starting fresh");
                        Map::new()
                    }
                },
                Err(_) => Map::new(),
            };
            StoreEntry {
                data,
                dirty: false,
                flush_pending: false,
            }
        })
    }

    fn flush_app(&self, app: &str) -> crate::error::Result<()> {
        let mut cache = self.cache.lock();
        let Some(entry) = cache.get_mut(app) else {
            return Ok(());
        };
        entry.flush_pending = false;
        if !entry.dirty {
            return Ok(());
        }
        let bytes = serde_json::to_vec_pretty(&entry.data)
            .map_err(|e| KernelError::Internal(format!("store serialize: {e}")))?;
        entry.dirty = false;
        // Write under the lock: flushes are rare and stores are small, and
        // this keeps flush ordering identical to mutation ordering.
        self.root.create_dir_all(app)?;
        let tmp = format!("{app}/{STORE_FILE}.tmp");
        let fin = format!("{app}/{STORE_FILE}");
        self.root.write(&tmp, &bytes)?;
        self.root.rename(&tmp, &self.root, &fin)?;
        Ok(())
    }
}
