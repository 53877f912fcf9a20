//! The in-process compute sandbox.
//!
//! Each launched app gets its own wasmtime `Engine` and `Store`, runs on a
//! blocking worker thread, and talks to the kernel only through its host
//! ring. Memory is capped twice (the declared maximum validated before
//! compilation, and a `StoreLimits` ceiling at runtime); CPU is bounded by
//! epoch interruption, driven by a deadline timer and by `kill`.

pub mod hostcall;
pub mod ring;
pub mod validate;

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wasmtime::{
    Caller, Config, Engine, Linker, Memory, MemoryType, Module, Store, StoreLimits,
    StoreLimitsBuilder, Val, ValType,
};

use helion_guard::Capability;

use crate::error::{Result, SandboxError};
use hostcall::{import_capability, HostCallHandler};
use ring::{HostCallKind, HostRing};

const WASM_PAGE: usize = 64 * 1024;

/// Launch options.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Exported function to invoke.
    pub entry_fn: String,
    /// Arguments, converted to the entry's parameter types.
    pub args: Vec<i64>,
    /// CPU deadline.
    pub timeout_ms: u64,
    /// Initial pages for a host-provided `llmos.memory` import.
    pub memory_pages: u32,
    /// Ceiling on any memory, declared or imported.
    pub max_memory_pages: u32,
    /// Bearer tokens by capability, for guests that present them outward.
    pub tokens: HashMap<Capability, String>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            entry_fn: "main".into(),
            args: Vec::new(),
            timeout_ms: 30_000,
            memory_pages: 16,
            max_memory_pages: 1024,
            tokens: HashMap::new(),
        }
    }
}

/// Exit states of a launched app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    /// Currently executing.
    Running,
    /// Returned normally.
    Done,
    /// Trapped or failed.
    Failed,
    /// Terminated by `kill`.
    Killed,
}

/// Public view of a running app.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WasmAppInfo {
    /// The app id.
    pub app_id: String,
    /// Display title.
    pub title: String,
    /// Current state (always `running` while listed).
    pub state: AppState,
    /// Unix seconds at launch.
    pub started_at: u64,
    /// Granted capabilities.
    pub capabilities: Vec<Capability>,
}

struct RunningApp {
    info: WasmAppInfo,
    engine: Engine,
    killed: Arc<AtomicBool>,
}

/// Store state reachable from host functions.
struct StoreData {
    limits: StoreLimits,
    ring: Arc<HostRing>,
    host_memory: Option<Memory>,
}

/// The WASM sandbox.
pub struct WasmSandbox {
    handler: Arc<dyn HostCallHandler>,
    apps: Arc<Mutex<HashMap<String, RunningApp>>>,
}

impl WasmSandbox {
    /// Build over a host-call handler.
    pub fn new(handler: Arc<dyn HostCallHandler>) -> Self {
        Self {
            handler,
            apps: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Validate, compile, and run a module to completion.
    ///
    /// Resolves with the entry function's return value; rejects on
    /// validation failure, missing grants, traps, the CPU deadline, or
    /// `kill`. The app slot is always freed on the way out so the id can be
    /// relaunched.
    pub async fn launch(
        &self,
        app_id: &str,
        wasm_bytes: Vec<u8>,
        capabilities: Vec<Capability>,
        title: &str,
        opts: LaunchOptions,
    ) -> Result<Value> {
        validate::validate_memory(&wasm_bytes, opts.max_memory_pages)?;

        let mut config = Config::new();
        config.epoch_interruption(true);
        let engine = Engine::new(&config).map_err(|e| SandboxError::Execution(e.to_string()))?;
        let killed = Arc::new(AtomicBool::new(false));
        let timed_out = Arc::new(AtomicBool::new(false));

        {
            let mut apps = self.apps.lock();
            if apps.contains_key(app_id) {
                return Err(SandboxError::Duplicate {
                    app_id: app_id.to_string(),
                });
            }
            apps.insert(
                app_id.to_string(),
                RunningApp {
                    info: WasmAppInfo {
                        app_id: app_id.to_string(),
                        title: title.to_string(),
                        state: AppState::Running,
                        started_at: now_unix(),
                        capabilities: capabilities.clone(),
                    },
                    engine: engine.clone(),
                    killed: Arc::clone(&killed),
                },
            );
        }

        let granted: HashSet<Capability> = capabilities.into_iter().collect();
        let (ring, wake) = HostRing::new();
        let dispatcher = {
            let ring = Arc::clone(&ring);
            let handler = Arc::clone(&self.handler);
            let granted = granted.clone();
            let app = app_id.to_string();
            std::thread::spawn(move || hostcall::run_dispatcher(ring, wake, handler, granted, app))
        };

        let timer = {
            let engine = engine.clone();
            let timed_out = Arc::clone(&timed_out);
            let timeout = Duration::from_millis(opts.timeout_ms);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                timed_out.store(true, Ordering::SeqCst);
                engine.increment_epoch();
            })
        };

        let worker = {
            let engine = engine.clone();
            let ring = Arc::clone(&ring);
            let granted = granted.clone();
            let opts = opts.clone();
            tokio::task::spawn_blocking(move || run_module(&engine, &wasm_bytes, &granted, &ring, &opts))
        };
        let joined = worker.await;

        timer.abort();
        ring.disconnect();
        let _ = dispatcher.join();
        self.apps.lock().remove(app_id);

        let result = match joined {
            Ok(result) => result,
            Err(join_err) => Err(SandboxError::Execution(format!("worker panicked: {join_err}"))),
        };
        match result {
            Ok(value) => {
                tracing::debug!(app_id, "wasm app finished");
                Ok(value)
            }
            Err(err) => {
                if timed_out.load(Ordering::SeqCst) && is_interrupt(&err) {
                    tracing::warn!(app_id, ms = opts.timeout_ms, "wasm app hit CPU deadline");
                    Err(SandboxError::CpuTimeout { ms: opts.timeout_ms })
                } else if killed.load(Ordering::SeqCst) && is_interrupt(&err) {
                    Err(SandboxError::Killed)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Terminate a running app. Returns whether anything was running.
    pub fn kill(&self, app_id: &str) -> bool {
        let apps = self.apps.lock();
        match apps.get(app_id) {
            Some(app) => {
                app.killed.store(true, Ordering::SeqCst);
                app.engine.increment_epoch();
                true
            }
            None => false,
        }
    }

    /// Terminate every running app.
    pub fn kill_all(&self) -> usize {
        let apps = self.apps.lock();
        for app in apps.values() {
            app.killed.store(true, Ordering::SeqCst);
            app.engine.increment_epoch();
        }
        apps.len()
    }

    /// Info for one running app.
    pub fn get_app(&self, app_id: &str) -> Option<WasmAppInfo> {
        self.apps.lock().get(app_id).map(|a| a.info.clone())
    }

    /// All running apps.
    pub fn list_apps(&self) -> Vec<WasmAppInfo> {
        self.apps.lock().values().map(|a| a.info.clone()).collect()
    }
}

/// Everything that happens on the worker thread.
fn run_module(
    engine: &Engine,
    wasm_bytes: &[u8],
    granted: &HashSet<Capability>,
    ring: &Arc<HostRing>,
    opts: &LaunchOptions,
) -> Result<Value> {
    let module = Module::new(engine, wasm_bytes)
        .map_err(|e| SandboxError::Validation(format!("compile failed: {e}")))?;

    let mut imports_memory = false;
    for import in module.imports() {
        if import.module() != "llmos" {
            return Err(SandboxError::Validation(format!(
                "unknown import module '{}'",
                import.module()
            )));
        }
        if import.name() == "memory" {
            imports_memory = true;
            continue;
        }
        match import_capability(import.name()) {
            Some(Some(cap)) if !granted.contains(&cap) => {
                return Err(SandboxError::CapabilityDenied {
                    capability: cap.to_string(),
                });
            }
            Some(_) => {}
            None => {
                return Err(SandboxError::Validation(format!(
                    "unknown import '{}'",
                    import.name()
                )));
            }
        }
    }

    let limits = StoreLimitsBuilder::new()
        .memory_size(opts.max_memory_pages as usize * WASM_PAGE)
        .memories(2)
        .tables(4)
        .instances(1)
        .build();
    let mut store = Store::new(
        engine,
        StoreData {
            limits,
            ring: Arc::clone(ring),
            host_memory: None,
        },
    );
    store.limiter(|d| &mut d.limits);
    store.set_epoch_deadline(1);

    let mut linker: Linker<StoreData> = Linker::new(engine);
    define_host_functions(&mut linker)?;

    if imports_memory {
        let ty = MemoryType::new(opts.memory_pages, Some(opts.max_memory_pages));
        let memory = Memory::new(&mut store, ty)
            .map_err(|e| SandboxError::Execution(format!("host memory: {e}")))?;
        store.data_mut().host_memory = Some(memory);
        linker
            .define(&mut store, "llmos", "memory", memory)
            .map_err(|e| SandboxError::Execution(format!("define memory: {e}")))?;
    }

    let instance = linker
        .instantiate(&mut store, &module)
        .map_err(|e| SandboxError::Execution(format!("instantiate failed: {e}")))?;

    let func = instance
        .get_func(&mut store, &opts.entry_fn)
        .ok_or_else(|| SandboxError::NoExportedFunction {
            name: opts.entry_fn.clone(),
        })?;

    let ty = func.ty(&store);
    let params: Vec<Val> = ty
        .params()
        .enumerate()
        .map(|(i, p)| {
            let arg = opts.args.get(i).copied().unwrap_or(0);
            match p {
                ValType::I32 => Ok(Val::I32(arg as i32)),
                ValType::I64 => Ok(Val::I64(arg)),
                ValType::F32 => Ok(Val::F32((arg as f32).to_bits())),
                ValType::F64 => Ok(Val::F64((arg as f64).to_bits())),
                other => Err(SandboxError::Validation(format!(
                    "unsupported parameter type {other}"
                ))),
            }
        })
        .collect::<Result<_>>()?;
    let mut results = vec![Val::I32(0); ty.results().len()];

    func.call(&mut store, &params, &mut results)
        .map_err(|e| SandboxError::Execution(format!("trap: {e:#}")))?;

    Ok(match results.first() {
        Some(Val::I32(v)) => json!(v),
        Some(Val::I64(v)) => json!(v),
        Some(Val::F32(bits)) => json!(f32::from_bits(*bits)),
        Some(Val::F64(bits)) => json!(f64::from_bits(*bits)),
        _ => Value::Null,
    })
}

/// Was this execution error an epoch interrupt (deadline or kill)?
fn is_interrupt(err: &SandboxError) -> bool {
    match err {
        SandboxError::Execution(msg) => {
            msg.contains("interrupt") || msg.contains("epoch") || msg.contains("deadline")
        }
        _ => false,
    }
}

/// Register every `llmos` host function on the linker.
fn define_host_functions(linker: &mut Linker<StoreData>) -> Result<()> {
    let wrap = |e: wasmtime::Error| SandboxError::Execution(format!("linker: {e}"));

    linker
        .func_wrap(
            "llmos",
            "storage_get",
            |mut caller: Caller<'_, StoreData>, kp: i32, kl: i32, op: i32, oc: i32| -> i32 {
                let Some(key) = read_guest_str(&mut caller, kp, kl) else {
                    return -2;
                };
                ring_out(
                    &mut caller,
                    HostCallKind::StorageGet,
                    json!({ "key": key }),
                    op,
                    oc,
                )
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "llmos",
            "storage_set",
            |mut caller: Caller<'_, StoreData>, kp: i32, kl: i32, vp: i32, vl: i32| -> i32 {
                let (Some(key), Some(raw)) = (
                    read_guest_str(&mut caller, kp, kl),
                    read_guest(&mut caller, vp, vl),
                ) else {
                    return -2;
                };
                let value = decode_value(&raw);
                ring_status(
                    &mut caller,
                    HostCallKind::StorageSet,
                    json!({ "key": key, "value": value }),
                )
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "llmos",
            "storage_remove",
            |mut caller: Caller<'_, StoreData>, kp: i32, kl: i32| -> i32 {
                let Some(key) = read_guest_str(&mut caller, kp, kl) else {
                    return -2;
                };
                ring_status(&mut caller, HostCallKind::StorageRemove, json!({ "key": key }))
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "llmos",
            "storage_keys",
            |mut caller: Caller<'_, StoreData>, op: i32, oc: i32| -> i32 {
                ring_out(&mut caller, HostCallKind::StorageKeys, json!({}), op, oc)
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "llmos",
            "notify",
            |mut caller: Caller<'_, StoreData>, mp: i32, ml: i32| -> i32 {
                let Some(message) = read_guest_str(&mut caller, mp, ml) else {
                    return -2;
                };
                ring_status(&mut caller, HostCallKind::Notify, json!({ "message": message }))
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "llmos",
            "cap_request",
            |mut caller: Caller<'_, StoreData>, cp: i32, cl: i32| -> i32 {
                let Some(capability) = read_guest_str(&mut caller, cp, cl) else {
                    return -2;
                };
                ring_status(
                    &mut caller,
                    HostCallKind::CapRequest,
                    json!({ "capability": capability }),
                )
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "llmos",
            "fetch",
            |mut caller: Caller<'_, StoreData>, rp: i32, rl: i32, op: i32, oc: i32| -> i32 {
                let Some(raw) = read_guest(&mut caller, rp, rl) else {
                    return -2;
                };
                let request = decode_value(&raw);
                ring_out(&mut caller, HostCallKind::Fetch, request, op, oc)
            },
        )
        .map_err(wrap)?;

    Ok(())
}

/// A raw value from the guest: JSON when it parses, a string otherwise.
fn decode_value(raw: &[u8]) -> Value {
    serde_json::from_slice(raw)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(raw).into_owned()))
}

/// Ring call returning only a status code: 0 ok, 1 true-ish, -2 error.
fn ring_status(caller: &mut Caller<'_, StoreData>, kind: HostCallKind, body: Value) -> i32 {
    let ring = Arc::clone(&caller.data().ring);
    let payload = serde_json::to_vec(&body).unwrap_or_default();
    let Ok(raw) = ring.call(kind, &payload) else {
        return -2;
    };
    let resp: Value = serde_json::from_slice(&raw).unwrap_or(Value::Null);
    if resp["ok"] == json!(true) {
        match &resp["value"] {
            Value::Bool(true) => 1,
            _ => 0,
        }
    } else {
        -2
    }
}

/// Ring call writing the response value into guest memory.
///
/// Returns the byte length written, -1 for a null value, -2 on any error
/// (including a response that does not fit in `out_cap`).
fn ring_out(
    caller: &mut Caller<'_, StoreData>,
    kind: HostCallKind,
    body: Value,
    out_ptr: i32,
    out_cap: i32,
) -> i32 {
    let ring = Arc::clone(&caller.data().ring);
    let payload = serde_json::to_vec(&body).unwrap_or_default();
    let Ok(raw) = ring.call(kind, &payload) else {
        return -2;
    };
    let resp: Value = serde_json::from_slice(&raw).unwrap_or(Value::Null);
    if resp["ok"] != json!(true) {
        return -2;
    }
    let bytes = match &resp["value"] {
        Value::Null => return -1,
        Value::String(s) => s.clone().into_bytes(),
        other => serde_json::to_vec(other).unwrap_or_default(),
    };
    if bytes.len() > out_cap.max(0) as usize {
        return -2;
    }
    match write_guest(caller, out_ptr, &bytes) {
        Some(()) => bytes.len() as i32,
        None => -2,
    }
}

fn guest_memory(caller: &mut Caller<'_, StoreData>) -> Option<Memory> {
    if let Some(mem) = caller.get_export("memory").and_then(|e| e.into_memory()) {
        return Some(mem);
    }
    caller.data().host_memory
}

fn read_guest(caller: &mut Caller<'_, StoreData>, ptr: i32, len: i32) -> Option<Vec<u8>> {
    let memory = guest_memory(caller)?;
    let start = usize::try_from(ptr).ok()?;
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    memory.data(&caller).get(start..end).map(|s| s.to_vec())
}

fn read_guest_str(caller: &mut Caller<'_, StoreData>, ptr: i32, len: i32) -> Option<String> {
    String::from_utf8(read_guest(caller, ptr, len)?).ok()
}

fn write_guest(caller: &mut Caller<'_, StoreData>, ptr: i32, bytes: &[u8]) -> Option<()> {
    let memory = guest_memory(caller)?;
    let start = usize::try_from(ptr).ok()?;
    let end = start.checked_add(bytes.len())?;
    memory
        .data_mut(caller)
        .get_mut(start..end)?
        .copy_from_slice(bytes);
    Some(())
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
