//! End-to-end tests of the compute sandbox against real modules.

use std::sync::Arc;
use std::time::{Duration, Instant};

use helion_guard::Capability;
use helion_sandbox::error::SandboxError;
use helion_sandbox::wasm::hostcall::testing::MemoryHandler;
use helion_sandbox::wasm::hostcall::HostCallHandler;
use helion_sandbox::wasm::{LaunchOptions, WasmSandbox};

fn wasm(wat: &str) -> Vec<u8> {
    wat::parse_str(wat).expect("valid wat")
}

fn sandbox() -> (WasmSandbox, Arc<MemoryHandler>) {
    let handler = Arc::new(MemoryHandler::default());
    (
        WasmSandbox::new(Arc::clone(&handler) as Arc<dyn HostCallHandler>),
        handler,
    )
}

fn opts(timeout_ms: u64) -> LaunchOptions {
    LaunchOptions {
        timeout_ms,
        ..LaunchOptions::default()
    }
}

#[tokio::test]
async fn plain_module_returns_its_value() {
    let (sandbox, _) = sandbox();
    let bytes = wasm("(module (memory 1 4) (func (export \"main\") (result i32) i32.const 42))");
    let value = sandbox
        .launch("calc", bytes, vec![], "Calc", opts(5_000))
        .await
        .unwrap();
    assert_eq!(value, 42);
    assert!(sandbox.list_apps().is_empty(), "slot freed after completion");
}

#[tokio::test]
async fn entry_arguments_are_passed() {
    let (sandbox, _) = sandbox();
    let bytes = wasm(
        "(module (func (export \"add\") (param i32 i32) (result i32)
            local.get 0 local.get 1 i32.add))",
    );
    let value = sandbox
        .launch(
            "adder",
            bytes,
            vec![],
            "Adder",
            LaunchOptions {
                entry_fn: "add".into(),
                args: vec![20, 22],
                ..opts(5_000)
            },
        )
        .await
        .unwrap();
    assert_eq!(value, 42);
}

#[tokio::test]
async fn unbounded_memory_is_rejected() {
    let (sandbox, _) = sandbox();
    let bytes = wasm("(module (memory 1))");
    let err = sandbox
        .launch("bad", bytes, vec![], "Bad", opts(5_000))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unbounded memory"));
    assert!(sandbox.list_apps().is_empty());
}

#[tokio::test]
async fn oversized_memory_is_rejected() {
    let (sandbox, _) = sandbox();
    let bytes = wasm("(module (memory 1 2048))");
    let err = sandbox
        .launch("big", bytes, vec![], "Big", opts(5_000))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("exceeds limit"));
}

#[tokio::test]
async fn missing_export_is_reported() {
    let (sandbox, _) = sandbox();
    let bytes = wasm("(module (memory 1 4) (func (export \"other\")))");
    let err = sandbox
        .launch("noentry", bytes, vec![], "NoEntry", opts(5_000))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no exported function"));
}

#[tokio::test]
async fn ungated_import_is_refused() {
    let (sandbox, _) = sandbox();
    let bytes = wasm(
        "(module
            (import \"llmos\" \"storage_set\" (func (param i32 i32 i32 i32) (result i32)))
            (memory 1 4)
            (func (export \"main\")))",
    );
    let err = sandbox
        .launch("thief", bytes, vec![], "Thief", opts(5_000))
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("storage:local not granted"),
        "got: {err}"
    );
}

#[tokio::test]
async fn unknown_import_is_refused() {
    let (sandbox, _) = sandbox();
    let bytes = wasm(
        "(module
            (import \"env\" \"anything\" (func))
            (func (export \"main\")))",
    );
    let err = sandbox
        .launch("alien", bytes, vec![], "Alien", opts(5_000))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown import"));
}

#[tokio::test]
async fn infinite_loop_hits_cpu_deadline() {
    let (sandbox, _) = sandbox();
    let bytes = wasm("(module (memory 1 4) (func (export \"main\") (loop (br 0))))");
    let started = Instant::now();
    let err = sandbox
        .launch("spinner", bytes, vec![], "Spinner", opts(500))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.to_string().contains("CPU timeout"), "got: {err}");
    assert!(elapsed >= Duration::from_millis(450), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "fired late: {elapsed:?}");
    assert!(sandbox.list_apps().is_empty(), "slot freed after timeout");
}

#[tokio::test]
async fn kill_settles_launch_as_killed() {
    let (sandbox, _) = sandbox();
    let sandbox = Arc::new(sandbox);
    let bytes = wasm("(module (memory 1 4) (func (export \"main\") (loop (br 0))))");

    let launcher = {
        let sandbox = Arc::clone(&sandbox);
        tokio::spawn(async move {
            sandbox
                .launch("victim", bytes, vec![], "Victim", opts(60_000))
                .await
        })
    };

    // Give the worker a moment to start spinning, then kill it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sandbox.list_apps().len(), 1);
    assert!(sandbox.kill("victim"));

    let err = launcher.await.unwrap().unwrap_err();
    assert!(matches!(err, SandboxError::Killed), "got: {err}");
    assert!(sandbox.list_apps().is_empty());
    assert!(!sandbox.kill("victim"), "second kill finds nothing");
}

#[tokio::test]
async fn duplicate_app_id_is_a_conflict() {
    let (sandbox, _) = sandbox();
    let sandbox = Arc::new(sandbox);
    let spinner = wasm("(module (memory 1 4) (func (export \"main\") (loop (br 0))))");

    let launcher = {
        let sandbox = Arc::clone(&sandbox);
        let bytes = spinner.clone();
        tokio::spawn(async move {
            sandbox
                .launch("dup", bytes, vec![], "First", opts(60_000))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = sandbox
        .launch("dup", spinner, vec![], "Second", opts(5_000))
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::Duplicate { .. }));

    sandbox.kill("dup");
    let _ = launcher.await.unwrap();
}

#[tokio::test]
async fn host_calls_round_trip_through_storage() {
    let (sandbox, handler) = sandbox();
    // Writes "42" under "count", reads it back, returns the byte length.
    let bytes = wasm(
        r#"(module
            (import "llmos" "storage_set" (func $set (param i32 i32 i32 i32) (result i32)))
            (import "llmos" "storage_get" (func $get (param i32 i32 i32 i32) (result i32)))
            (memory (export "memory") 1 4)
            (data (i32.const 0) "count")
            (data (i32.const 16) "\"42\"")
            (func (export "main") (result i32)
                (drop (call $set (i32.const 0) (i32.const 5) (i32.const 16) (i32.const 4)))
                (call $get (i32.const 0) (i32.const 5) (i32.const 64) (i32.const 32))))"#,
    );
    let value = sandbox
        .launch(
            "counter",
            bytes,
            vec![Capability::StorageLocal],
            "Counter",
            opts(5_000),
        )
        .await
        .unwrap();
    // get wrote the stored string "42" (2 bytes) into guest memory.
    assert_eq!(value, 2);
    assert_eq!(
        handler.store.lock().get("count"),
        Some(&serde_json::json!("42"))
    );
}

#[tokio::test]
async fn notify_flows_without_any_grant() {
    let (sandbox, handler) = sandbox();
    let bytes = wasm(
        r#"(module
            (import "llmos" "notify" (func $notify (param i32 i32) (result i32)))
            (memory (export "memory") 1 4)
            (data (i32.const 0) "hi")
            (func (export "main") (result i32)
                (call $notify (i32.const 0) (i32.const 2))))"#,
    );
    let value = sandbox
        .launch("toaster", bytes, vec![], "Toaster", opts(5_000))
        .await
        .unwrap();
    assert_eq!(value, 0);
    assert_eq!(handler.notifications.lock().as_slice(), ["hi"]);
}

#[tokio::test]
async fn kill_all_sweeps_every_app() {
    let (sandbox, _) = sandbox();
    let sandbox = Arc::new(sandbox);
    let spinner = wasm("(module (memory 1 4) (func (export \"main\") (loop (br 0))))");

    let mut launchers = Vec::new();
    for id in ["a", "b", "c"] {
        let sandbox = Arc::clone(&sandbox);
        let bytes = spinner.clone();
        launchers.push(tokio::spawn(async move {
            sandbox.launch(id, bytes, vec![], id, opts(60_000)).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sandbox.list_apps().len(), 3);
    assert_eq!(sandbox.kill_all(), 3);

    for launcher in launchers {
        assert!(launcher.await.unwrap().is_err());
    }
    assert!(sandbox.list_apps().is_empty());
}
