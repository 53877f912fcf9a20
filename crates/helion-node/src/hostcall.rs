//! Host-call handler backed by the kernel's services.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

use helion_kernel::AppStorage;
use helion_sandbox::wasm::hostcall::HostCallHandler;

/// Notifications kept for the status endpoint.
const NOTIFICATION_LIMIT: usize = 100;

/// Serves WASM host calls from kernel storage and the notification buffer.
pub struct KernelHostCalls {
    storage: AppStorage,
    notifications: Arc<Mutex<Vec<String>>>,
}

impl KernelHostCalls {
    /// Build the handler.
    pub fn new(storage: AppStorage, notifications: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            storage,
            notifications,
        }
    }
}

impl HostCallHandler for KernelHostCalls {
    fn storage_get(&self, app_id: &str, key: &str) -> Option<Value> {
        self.storage.get(app_id, key)
    }

    fn storage_set(&self, app_id: &str, key: &str, value: Value) -> Result<(), String> {
        self.storage
            .set(app_id, key, value)
            .map_err(|e| e.to_string())
    }

    fn storage_remove(&self, app_id: &str, key: &str) -> bool {
        self.storage.remove(app_id, key)
    }

    fn storage_keys(&self, app_id: &str) -> Vec<String> {
        self.storage.keys(app_id)
    }

    fn notify(&self, app_id: &str, message: &str) {
        tracing::info!(app_id, message, "app notification");
        let mut buffer = self.notifications.lock();
        buffer.push(format!("{app_id}: {message}"));
        let len = buffer.len();
        if len > NOTIFICATION_LIMIT {
            buffer.drain(..len - NOTIFICATION_LIMIT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn handler_round_trips_storage() {
        let dir = tempdir().unwrap();
        let storage = AppStorage::open(dir.path()).unwrap();
        let handler = KernelHostCalls::new(storage, Arc::new(Mutex::new(Vec::new())));

        handler.storage_set("app", "k", json!({"v": 1})).unwrap();
        assert_eq!(handler.storage_get("app", "k"), Some(json!({"v": 1})));
        assert_eq!(handler.storage_keys("app"), vec!["k"]);
        assert!(handler.storage_remove("app", "k"));
        assert_eq!(handler.storage_get("app", "k"), None);
    }

    #[test]
    fn notifications_are_bounded() {
        let dir = tempdir().unwrap();
        let storage = AppStorage::open(dir.path()).unwrap();
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let handler = KernelHostCalls::new(storage, Arc::clone(&buffer));

        for i in 0..(NOTIFICATION_LIMIT + 20) {
            handler.notify("app", &format!("n{i}"));
        }
        assert_eq!(buffer.lock().len(), NOTIFICATION_LIMIT);
        assert!(buffer.lock().last().unwrap().contains("n119"));
    }
}
