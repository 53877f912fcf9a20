//! Host-call dispatch: capability gating and the handler seam.
//!
//! The dispatcher thread owns an app's ring receiver. Each request is a
//! JSON body whose shape depends on the call type; each response is
//! `{"ok":true,"value":...}` or `{"ok":false,"error":"..."}`. Capability
//! checks happen here against the granted set captured at launch — import
//! gating already refused modules that *require* ungranted capabilities,
//! this is the second fence for modules that merely *try*.

use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use helion_guard::Capability;

use super::ring::{HostCallKind, HostRing};

/// What the kernel must provide to service host calls.
///
/// The node implements this over the storage service and the shell event
/// stream; tests implement it in memory.
pub trait HostCallHandler: Send + Sync + 'static {
    /// Read a storage key.
    fn storage_get(&self, app_id: &str, key: &str) -> Option<Value>;
    /// Write a storage key. Err carries a user-visible reason (quota).
    fn storage_set(&self, app_id: &str, key: &str, value: Value) -> Result<(), String>;
    /// Remove a storage key; returns whether it existed.
    fn storage_remove(&self, app_id: &str, key: &str) -> bool;
    /// List storage keys.
    fn storage_keys(&self, app_id: &str) -> Vec<String>;
    /// Surface a notification.
    fn notify(&self, app_id: &str, message: &str);
    /// An app asked for a capability at runtime. The answer is always a
    /// denial; grants go through the kernel API, never through a sandbox.
    fn cap_request(&self, app_id: &str, capability: &str) {
        tracing::info!(app_id, capability, "runtime capability request recorded");
    }
    /// HTTP through the kernel. Default: not served in this sandbox.
    fn fetch(&self, _app_id: &str, _request: Value) -> Result<Value, String> {
        Err("fetch is not available in the compute sandbox".to_string())
    }
}

/// Capability required for a call type, if any.
pub fn required_capability(kind: HostCallKind) -> Option<Capability> {
    match kind {
        HostCallKind::StorageGet
        | HostCallKind::StorageSet
        | HostCallKind::StorageRemove
        | HostCallKind::StorageKeys => Some(Capability::StorageLocal),
        HostCallKind::Fetch => Some(Capability::NetworkHttp),
        HostCallKind::Notify | HostCallKind::CapRequest => None,
    }
}

/// Capability an `llmos` import requires, if any. `None` for the always-
/// allowed imports; `Err`-style absence is handled by the caller for
/// unknown names.
pub fn import_capability(name: &str) -> Option<Option<Capability>> {
    match name {
        "storage_get" | "storage_set" | "storage_remove" | "storage_keys" => {
            Some(Some(Capability::StorageLocal))
        }
        "fetch" => Some(Some(Capability::NetworkHttp)),
        "notify" | "cap_request" => Some(None),
        _ => None,
    }
}

#[derive(Deserialize)]
struct KeyRequest {
    key: String,
    #[serde(default)]
    value: Option<Value>,
}

#[derive(Deserialize)]
struct TextRequest {
    #[serde(default)]
    message: String,
    #[serde(default)]
    capability: String,
}

/// Serve one request body.
pub fn dispatch(
    handler: &dyn HostCallHandler,
    granted: &HashSet<Capability>,
    app_id: &str,
    kind: HostCallKind,
    payload: &[u8],
) -> Value {
    if let Some(cap) = required_capability(kind) {
        if !granted.contains(&cap) {
            return json!({"ok": false, "error": format!("{cap} not granted")});
        }
    }

    match kind {
        HostCallKind::StorageGet => match parse::<KeyRequest>(payload) {
            Ok(req) => match handler.storage_get(app_id, &req.key) {
                Some(value) => json!({"ok": true, "value": value}),
                None => json!({"ok": true, "value": Value::Null}),
            },
            Err(e) => error_body(e),
        },
        HostCallKind::StorageSet => match parse::<KeyRequest>(payload) {
            Ok(req) => {
                let value = req.value.unwrap_or(Value::Null);
                match handler.storage_set(app_id, &req.key, value) {
                    Ok(()) => json!({"ok": true}),
                    Err(e) => error_body(e),
                }
            }
            Err(e) => error_body(e),
        },
        HostCallKind::StorageRemove => match parse::<KeyRequest>(payload) {
            Ok(req) => json!({"ok": true, "value": handler.storage_remove(app_id, &req.key)}),
            Err(e) => error_body(e),
        },
        HostCallKind::StorageKeys => {
            json!({"ok": true, "value": handler.storage_keys(app_id)})
        }
        HostCallKind::Notify => match parse::<TextRequest>(payload) {
            Ok(req) => {
                handler.notify(app_id, &req.message);
                json!({"ok": true})
            }
            Err(e) => error_body(e),
        },
        HostCallKind::CapRequest => match parse::<TextRequest>(payload) {
            Ok(req) => {
                handler.cap_request(app_id, &req.capability);
                json!({"ok": false, "error": "capability requests require an explicit grant"})
            }
            Err(e) => error_body(e),
        },
        HostCallKind::Fetch => match serde_json::from_slice::<Value>(payload) {
            Ok(req) => match handler.fetch(app_id, req) {
                Ok(value) => json!({"ok": true, "value": value}),
                Err(e) => error_body(e),
            },
            Err(e) => error_body(e.to_string()),
        },
    }
}

/// Run an app's dispatcher until its ring disconnects.
pub fn run_dispatcher(
    ring: Arc<HostRing>,
    wake: Receiver<()>,
    handler: Arc<dyn HostCallHandler>,
    granted: HashSet<Capability>,
    app_id: String,
) {
    while wake.recv().is_ok() {
        let Some((kind, payload)) = ring.take_request() else {
            continue;
        };
        let response = dispatch(handler.as_ref(), &granted, &app_id, kind, &payload);
        let bytes = serde_json::to_vec(&response).unwrap_or_else(|_| b"{\"ok\":false}".to_vec());
        ring.respond(&bytes);
    }
}

fn parse<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, String> {
    serde_json::from_slice(payload).map_err(|e| format!("bad host call body: {e}"))
}

fn error_body(message: impl Into<String>) -> Value {
    json!({"ok": false, "error": message.into()})
}

/// In-memory handler shared by unit and integration tests.
#[doc(hidden)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// A [`HostCallHandler`] backed by a plain map.
    #[derive(Default)]
    pub struct MemoryHandler {
        /// The backing store.
        pub store: Mutex<HashMap<String, Value>>,
        /// Captured notifications.
        pub notifications: Mutex<Vec<String>>,
    }

    impl HostCallHandler for MemoryHandler {
        fn storage_get(&self, _app: &str, key: &str) -> Option<Value> {
            self.store.lock().get(key).cloned()
        }
        fn storage_set(&self, _app: &str, key: &str, value: Value) -> Result<(), String> {
            self.store.lock().insert(key.to_string(), value);
            Ok(())
        }
        fn storage_remove(&self, _app: &str, key: &str) -> bool {
            self.store.lock().remove(key).is_some()
        }
        fn storage_keys(&self, _app: &str) -> Vec<String> {
            self.store.lock().keys().cloned().collect()
        }
        fn notify(&self, _app: &str, message: &str) {
            self.notifications.lock().push(message.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryHandler;
    use super::*;

    fn granted(caps: &[Capability]) -> HashSet<Capability> {
        caps.iter().copied().collect()
    }

    #[test]
    fn storage_calls_require_the_capability() {
        let handler = MemoryHandler::default();
        let resp = dispatch(
            &handler,
            &granted(&[]),
            "app",
            HostCallKind::StorageSet,
            br#"{"key":"k","value":1}"#,
        );
        assert_eq!(resp["ok"], false);
        assert_eq!(resp["error"], "storage:local not granted");

        let resp = dispatch(
            &handler,
            &granted(&[Capability::StorageLocal]),
            "app",
            HostCallKind::StorageSet,
            br#"{"key":"k","value":1}"#,
        );
        assert_eq!(resp["ok"], true);
    }

    #[test]
    fn get_round_trips_set() {
        let handler = MemoryHandler::default();
        let caps = granted(&[Capability::StorageLocal]);
        dispatch(&handler, &caps, "app", HostCallKind::StorageSet, br#"{"key":"n","value":42}"#);
        let resp = dispatch(&handler, &caps, "app", HostCallKind::StorageGet, br#"{"key":"n"}"#);
        assert_eq!(resp["ok"], true);
        assert_eq!(resp["value"], 42);

        let missing = dispatch(&handler, &caps, "app", HostCallKind::StorageGet, br#"{"key":"x"}"#);
        assert_eq!(missing["value"], Value::Null);
    }

    #[test]
    fn notify_is_always_allowed() {
        let handler = MemoryHandler::default();
        let resp = dispatch(
            &handler,
            &granted(&[]),
            "app",
            HostCallKind::Notify,
            br#"{"message":"hello"}"#,
        );
        assert_eq!(resp["ok"], true);
        assert_eq!(handler.notifications.lock().as_slice(), ["hello"]);
    }

    #[test]
    fn cap_request_is_recorded_but_denied() {
        let handler = MemoryHandler::default();
        let resp = dispatch(
            &handler,
            &granted(&[]),
            "app",
            HostCallKind::CapRequest,
            br#"{"capability":"network:http"}"#,
        );
        assert_eq!(resp["ok"], false);
    }

    #[test]
    fn fetch_without_grant_is_denied_before_the_handler() {
        let handler = MemoryHandler::default();
        let resp = dispatch(&handler, &granted(&[]), "app", HostCallKind::Fetch, b"{}");
        assert_eq!(resp["error"], "network:http not granted");

        // With the grant, the default handler still declines.
        let resp = dispatch(
            &handler,
            &granted(&[Capability::NetworkHttp]),
            "app",
            HostCallKind::Fetch,
            b"{}",
        );
        assert_eq!(resp["ok"], false);
    }

    #[test]
    fn malformed_bodies_are_errors_not_panics() {
        let handler = MemoryHandler::default();
        let caps = granted(&[Capability::StorageLocal]);
        let resp = dispatch(&handler, &caps, "app", HostCallKind::StorageGet, b"not json");
        assert_eq!(resp["ok"], false);
    }

    #[test]
    fn import_capability_table() {
        assert_eq!(
            import_capability("storage_get"),
            Some(Some(Capability::StorageLocal))
        );
        assert_eq!(import_capability("fetch"), Some(Some(Capability::NetworkHttp)));
        assert_eq!(import_capability("notify"), Some(None));
        assert_eq!(import_capability("steal_key"), None);
    }
}
