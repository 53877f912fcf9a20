//! The container process manager.
//!
//! Builds images and runs app containers under non-negotiable constraints:
//! hard memory/CPU/pid caps, read-only rootfs, no kernel capabilities, no
//! network unless granted, a bounded host-port range for web UIs, a global
//! container ceiling, and a 30-minute wall clock.

pub mod engine;
pub mod logs;

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use helion_guard::Capability;
use helion_kernel::sanitize_app_id;

use crate::error::{Result, SandboxError};
use engine::{EngineClient, EngineTransport};
use logs::demux_to_string;

/// Hard memory cap per container.
pub const MEMORY_LIMIT_BYTES: i64 = 512 * 1024 * 1024;
/// One CPU core, in nano-cpus.
pub const NANO_CPUS: i64 = 1_000_000_000;
/// Max processes inside a container.
pub const PIDS_LIMIT: i64 = 64;
/// `/tmp` tmpfs size.
pub const TMPFS_SIZE: &str = "64m";
/// Wall-clock ceiling per container.
pub const WALL_CLOCK_LIMIT: Duration = Duration::from_secs(30 * 60);
/// Grace period on stop before the engine kills.
pub const STOP_GRACE_SECS: u32 = 5;
/// The port apps are told to listen on inside the container.
pub const CONTAINER_PORT: u16 = 8000;
/// Delay before the starting→running health poll.
const HEALTH_POLL_DELAY: Duration = Duration::from_secs(3);

/// Manager policy.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Engine transport.
    pub transport: EngineTransport,
    /// First host port handed to containers.
    pub port_start: u16,
    /// Last host port (inclusive).
    pub port_end: u16,
    /// Global ceiling on simultaneously running containers.
    pub max_containers: usize,
    /// Data root for volume binds.
    pub data_root: PathBuf,
    /// Anthropic key injected only under `api:anthropic`.
    pub anthropic_api_key: Option<String>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            transport: EngineTransport::default(),
            port_start: 5100,
            port_end: 5199,
            max_containers: 5,
            data_root: PathBuf::from("./data"),
            anthropic_api_key: None,
        }
    }
}

/// Lifecycle of one managed container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Image build in flight.
    Building,
    /// Created and started; health not yet confirmed.
    Starting,
    /// Health-confirmed running.
    Running,
    /// Stopped (by request or wall clock).
    Stopped,
    /// Failed to start or died early.
    Failed,
}

/// Public view of one managed container.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessInfo {
    /// The app id.
    pub app_id: String,
    /// Engine container id.
    pub container_id: String,
    /// Image the container runs.
    pub image: String,
    /// Host port, when one was allocated.
    pub port: Option<u16>,
    /// Current state.
    pub state: ProcessState,
    /// Unix seconds at launch.
    pub started_at: u64,
    /// Granted capabilities.
    pub capabilities: Vec<Capability>,
}

struct ManagerInner {
    client: EngineClient,
    config: ProcessConfig,
    processes: Mutex<HashMap<String, ProcessInfo>>,
    free_ports: Mutex<BTreeSet<u16>>,
}

/// The process manager. Clone-cheap; clones share state.
#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<ManagerInner>,
}

impl ProcessManager {
    /// Build the manager.
    pub fn new(config: ProcessConfig) -> Self {
        let free_ports = (config.port_start..=config.port_end).collect();
        Self {
            inner: Arc::new(ManagerInner {
                client: EngineClient::new(config.transport.clone()),
                config,
                processes: Mutex::new(HashMap::new()),
                free_ports: Mutex::new(free_ports),
            }),
        }
    }

    /// Build an image from a recipe and context files via the engine CLI.
    ///
    /// The recipe must already have passed the analyzer; the manager does
    /// not re-check it.
    pub async fn build_image(
        &self,
        app_id: &str,
        recipe: &str,
        context_files: &[(String, String)],
    ) -> Result<String> {
        let dir = tempfile_dir()?;
        tokio::fs::write(dir.join("Dockerfile"), recipe).await?;
        for (name, content) in context_files {
            let clean = sanitize_context_name(name);
            tokio::fs::write(dir.join(&clean), content).await?;
        }

        let tag = format!(
            "helion/{}:{}",
            sanitize_app_id(app_id).to_lowercase(),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        tracing::info!(app_id, %tag, "building image");

        let mut cmd = tokio::process::Command::new("docker");
        if let EngineTransport::Tcp(addr) = &self.inner.config.transport {
            cmd.env("DOCKER_HOST", format!("tcp://{addr}"));
        }
        let output = cmd
            .arg("build")
            .arg("-t")
            .arg(&tag)
            .arg(&dir)
            .output()
            .await
            .map_err(|e| SandboxError::Engine(format!("docker build spawn: {e}")))?;
        let _ = tokio::fs::remove_dir_all(&dir).await;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            return Err(SandboxError::Engine(format!("image build failed: {tail}")));
        }
        Ok(tag)
    }

    /// Create and start a container for an app.
    pub async fn launch(
        &self,
        app_id: &str,
        image: &str,
        capabilities: &[Capability],
    ) -> Result<ProcessInfo> {
        {
            let processes = self.inner.processes.lock();
            if processes.contains_key(app_id) {
                return Err(SandboxError::Duplicate {
                    app_id: app_id.to_string(),
                });
            }
            let active = processes
                .values()
                .filter(|p| matches!(p.state, ProcessState::Building | ProcessState::Starting | ProcessState::Running))
                .count();
            if active >= self.inner.config.max_containers {
                return Err(SandboxError::ResourceExhausted(format!(
                    "container limit of {} reached",
                    self.inner.config.max_containers
                )));
            }
        }

        let network = capabilities.contains(&Capability::ProcessNetwork);
        let port = if network {
            Some(self.allocate_port()?)
        } else {
            None
        };

        let body = container_create_body(
            image,
            capabilities,
            port,
            &self.inner.config.data_root,
            app_id,
            self.inner.config.anthropic_api_key.as_deref(),
        );

        let name = format!("helion-{}", sanitize_app_id(app_id).to_lowercase());
        let created = match self.inner.client.create_container(&name, body).await {
            Ok(id) => id,
            Err(err) => {
                if let Some(p) = port {
                    self.free_port(p);
                }
                return Err(err);
            }
        };
        if let Err(err) = self.inner.client.start_container(&created).await {
            let _ = self.inner.client.remove_container(&created).await;
            if let Some(p) = port {
                self.free_port(p);
            }
            return Err(err);
        }

        let info = ProcessInfo {
            app_id: app_id.to_string(),
            container_id: created,
            image: image.to_string(),
            port,
            state: ProcessState::Starting,
            started_at: now_unix(),
            capabilities: capabilities.to_vec(),
        };
        self.inner
            .processes
            .lock()
            .insert(app_id.to_string(), info.clone());
        tracing::info!(app_id, port = ?port, "container started");

        self.spawn_health_poll(app_id.to_string());
        self.spawn_wall_clock(app_id.to_string());
        Ok(info)
    }

    /// Stop and remove an app's container, freeing its port.
    ///
    /// Removal failures are logged, never fatal: the state update and port
    /// release always happen.
    pub async fn stop(&self, app_id: &str) -> Result<()> {
        let (container_id, port) = {
            let processes = self.inner.processes.lock();
            let info = processes
                .get(app_id)
                .ok_or_else(|| SandboxError::NotFound(format!("process {app_id}")))?;
            (info.container_id.clone(), info.port)
        };

        if let Err(err) = self
            .inner
            .client
            .stop_container(&container_id, STOP_GRACE_SECS)
            .await
        {
            tracing::warn!(app_id, %err, "container stop failed");
        }
        if let Err(err) = self.inner.client.remove_container(&container_id).await {
            tracing::warn!(app_id, %err, "container remove failed");
        }

        if let Some(p) = port {
            self.free_port(p);
        }
        if let Some(info) = self.inner.processes.lock().get_mut(app_id) {
            info.state = ProcessState::Stopped;
            info.port = None;
        }
        tracing::info!(app_id, "container stopped");
        Ok(())
    }

    /// Stop everything (shutdown path).
    pub async fn stop_all(&self) {
        let ids: Vec<String> = {
            let processes = self.inner.processes.lock();
            processes
                .values()
                .filter(|p| {
                    matches!(p.state, ProcessState::Starting | ProcessState::Running)
                })
                .map(|p| p.app_id.clone())
                .collect()
        };
        for id in ids {
            if let Err(err) = self.stop(&id).await {
                tracing::warn!(app_id = %id, %err, "stop_all: stop failed");
            }
        }
    }

    /// Probe the engine for liveness and update the state machine.
    pub async fn health_check(&self, app_id: &str) -> Result<ProcessState> {
        let container_id = {
            let processes = self.inner.processes.lock();
            let info = processes
                .get(app_id)
                .ok_or_else(|| SandboxError::NotFound(format!("process {app_id}")))?;
            if matches!(info.state, ProcessState::Stopped | ProcessState::Failed) {
                return Ok(info.state);
            }
            info.container_id.clone()
        };

        let running = self.inner.client.is_running(&container_id).await?;
        let mut processes = self.inner.processes.lock();
        let Some(info) = processes.get_mut(app_id) else {
            return Err(SandboxError::NotFound(format!("process {app_id}")));
        };
        info.state = match (info.state, running) {
            (ProcessState::Starting, true) | (ProcessState::Running, true) => ProcessState::Running,
            (ProcessState::Starting, false) => ProcessState::Failed,
            (ProcessState::Running, false) => ProcessState::Stopped,
            (other, _) => other,
        };
        Ok(info.state)
    }

    /// Tail of the container's logs, demultiplexed to clean UTF-8.
    pub async fn get_logs(&self, app_id: &str, tail: usize) -> Result<String> {
        let container_id = {
            let processes = self.inner.processes.lock();
            processes
                .get(app_id)
                .map(|p| p.container_id.clone())
                .ok_or_else(|| SandboxError::NotFound(format!("process {app_id}")))?
        };
        let raw = self.inner.client.container_logs(&container_id, tail).await?;
        Ok(demux_to_string(&raw))
    }

    /// All known processes.
    pub fn list(&self) -> Vec<ProcessInfo> {
        let mut infos: Vec<ProcessInfo> = self.inner.processes.lock().values().cloned().collect();
        infos.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        infos
    }

    /// One process.
    pub fn get(&self, app_id: &str) -> Option<ProcessInfo> {
        self.inner.processes.lock().get(app_id).cloned()
    }

    /// Drop a stopped/failed entry from the table.
    pub fn forget(&self, app_id: &str) -> bool {
        let mut processes = self.inner.processes.lock();
        match processes.get(app_id) {
            Some(info) if matches!(info.state, ProcessState::Stopped | ProcessState::Failed) => {
                processes.remove(app_id);
                true
            }
            _ => false,
        }
    }

    /// Free ports remaining in the range (diagnostics/tests).
    pub fn free_port_count(&self) -> usize {
        self.inner.free_ports.lock().len()
    }

    fn allocate_port(&self) -> Result<u16> {
        let mut ports = self.inner.free_ports.lock();
        let Some(port) = ports.iter().next().copied() else {
            return Err(SandboxError::ResourceExhausted(format!(
                "no free ports in {}-{}",
                self.inner.config.port_start, self.inner.config.port_end
            )));
        };
        ports.remove(&port);
        Ok(port)
    }

    fn free_port(&self, port: u16) {
        if (self.inner.config.port_start..=self.inner.config.port_end).contains(&port) {
            self.inner.free_ports.lock().insert(port);
        }
    }

    /// Promote starting→running (or fail) after a short delay.
    fn spawn_health_poll(&self, app_id: String) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(HEALTH_POLL_DELAY).await;
            match manager.health_check(&app_id).await {
                Ok(state) => tracing::debug!(app_id, ?state, "health poll"),
                Err(err) => tracing::debug!(app_id, %err, "health poll failed"),
            }
        });
    }

    /// Enforce the wall clock.
    fn spawn_wall_clock(&self, app_id: String) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(WALL_CLOCK_LIMIT).await;
            let still_running = manager
                .get(&app_id)
                .map(|p| matches!(p.state, ProcessState::Starting | ProcessState::Running))
                .unwrap_or(false);
            if still_running {
                tracing::warn!(app_id, "wall clock exceeded, stopping container");
                let _ = manager.stop(&app_id).await;
            }
        });
    }
}

/// The engine create body with every constraint pinned.
///
/// Pure so the constraints are testable without an engine:
/// - 512 MiB memory, swap equal (no swap headroom)
/// - 1 CPU, 64 pids, read-only rootfs
/// - all kernel capabilities dropped, no-new-privileges
/// - `/tmp` 64 MiB tmpfs `rw,noexec,nosuid`
/// - nofile 1024/2048
/// - network `none` without `process:network`
/// - volume bind only with `process:volume`
/// - `ANTHROPIC_API_KEY` only with `api:anthropic`
pub fn container_create_body(
    image: &str,
    capabilities: &[Capability],
    host_port: Option<u16>,
    data_root: &Path,
    app_id: &str,
    anthropic_api_key: Option<&str>,
) -> Value {
    let network = capabilities.contains(&Capability::ProcessNetwork);
    let volume = capabilities.contains(&Capability::ProcessVolume);
    let anthropic = capabilities.contains(&Capability::ApiAnthropic);

    let mut env = vec![format!("PORT={CONTAINER_PORT}")];
    if anthropic {
        if let Some(key) = anthropic_api_key {
            env.push(format!("ANTHROPIC_API_KEY={key}"));
        }
    }

    let mut host_config = json!({
        "Memory": MEMORY_LIMIT_BYTES,
        "MemorySwap": MEMORY_LIMIT_BYTES,
        "NanoCpus": NANO_CPUS,
        "PidsLimit": PIDS_LIMIT,
        "ReadonlyRootfs": true,
        "CapDrop": ["ALL"],
        "SecurityOpt": ["no-new-privileges"],
        "Tmpfs": { "/tmp": format!("rw,noexec,nosuid,size={TMPFS_SIZE}") },
        "Ulimits": [
            { "Name": "nofile", "Soft": 1024, "Hard": 2048 }
        ],
        "NetworkMode": if network { "bridge" } else { "none" },
    });

    if let Some(port) = host_port {
        host_config["PortBindings"] = json!({
            format!("{CONTAINER_PORT}/tcp"): [{ "HostPort": port.to_string() }]
        });
    }
    if volume {
        let bind = format!(
            "{}/{}:/data:rw",
            data_root.display(),
            sanitize_app_id(app_id)
        );
        host_config["Binds"] = json!([bind]);
    }

    let mut body = json!({
        "Image": image,
        "Env": env,
        "HostConfig": host_config,
        "Labels": { "io.helion.app": app_id },
    });
    if host_port.is_some() {
        body["ExposedPorts"] = json!({ format!("{CONTAINER_PORT}/tcp"): {} });
    }
    body
}

fn sanitize_context_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn tempfile_dir() -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("helion-build-{}", Uuid::new_v4().simple()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_body_pins_the_constraints() {
        let body = container_create_body(
            "helion/app:1",
            &[Capability::ProcessBackground],
            None,
            Path::new("/data"),
            "app",
            None,
        );
        let hc = &body["HostConfig"];
        assert_eq!(hc["Memory"], MEMORY_LIMIT_BYTES);
        assert_eq!(hc["MemorySwap"], MEMORY_LIMIT_BYTES, "no swap headroom");
        assert_eq!(hc["NanoCpus"], NANO_CPUS);
        assert_eq!(hc["PidsLimit"], PIDS_LIMIT);
        assert_eq!(hc["ReadonlyRootfs"], true);
        assert_eq!(hc["CapDrop"][0], "ALL");
        assert_eq!(hc["SecurityOpt"][0], "no-new-privileges");
        assert_eq!(hc["Tmpfs"]["/tmp"], "rw,noexec,nosuid,size=64m");
        assert_eq!(hc["Ulimits"][0]["Soft"], 1024);
        assert_eq!(hc["Ulimits"][0]["Hard"], 2048);
        assert_eq!(hc["NetworkMode"], "none");
        assert!(hc.get("Binds").is_none());
        assert!(body.get("ExposedPorts").is_none());

        let env = body["Env"].as_array().unwrap();
        assert!(!env.iter().any(|e| e.as_str().unwrap().starts_with("ANTHROPIC")));
    }

    #[test]
    fn network_grant_enables_bridge_and_ports() {
        let body = container_create_body(
            "img",
            &[Capability::ProcessNetwork],
            Some(5100),
            Path::new("/data"),
            "app",
            None,
        );
        assert_eq!(body["HostConfig"]["NetworkMode"], "bridge");
        assert_eq!(
            body["HostConfig"]["PortBindings"]["8000/tcp"][0]["HostPort"],
            "5100"
        );
        assert!(body["ExposedPorts"].get("8000/tcp").is_some());
    }

    #[test]
    fn volume_grant_binds_only_the_app_dir() {
        let body = container_create_body(
            "img",
            &[Capability::ProcessVolume],
            None,
            Path::new("/data"),
            "my app/../etc",
            None,
        );
        let bind = body["HostConfig"]["Binds"][0].as_str().unwrap();
        assert_eq!(bind, "/data/my_app____etc:/data:rw");
    }

    #[test]
    fn api_key_requires_the_grant() {
        let with_grant = container_create_body(
            "img",
            &[Capability::ApiAnthropic],
            None,
            Path::new("/data"),
            "app",
            Some("sk-test"),
        );
        let env = with_grant["Env"].as_array().unwrap();
        assert!(env.iter().any(|e| e.as_str().unwrap() == "ANTHROPIC_API_KEY=sk-test"));

        let without_grant = container_create_body(
            "img",
            &[Capability::ProcessBackground],
            None,
            Path::new("/data"),
            "app",
            Some("sk-test"),
        );
        let env = without_grant["Env"].as_array().unwrap();
        assert!(!env.iter().any(|e| e.as_str().unwrap().starts_with("ANTHROPIC")));
    }

    #[test]
    fn port_allocation_is_first_free_and_recycles() {
        let manager = ProcessManager::new(ProcessConfig {
            port_start: 5100,
            port_end: 5102,
            ..ProcessConfig::default()
        });
        assert_eq!(manager.free_port_count(), 3);
        let a = manager.allocate_port().unwrap();
        let b = manager.allocate_port().unwrap();
        let c = manager.allocate_port().unwrap();
        assert_eq!((a, b, c), (5100, 5101, 5102));

        let err = manager.allocate_port().unwrap_err();
        assert!(matches!(err, SandboxError::ResourceExhausted(_)));

        manager.free_port(b);
        assert_eq!(manager.allocate_port().unwrap(), 5101, "freed port reused");
    }

    #[test]
    fn out_of_range_free_is_ignored() {
        let manager = ProcessManager::new(ProcessConfig {
            port_start: 5100,
            port_end: 5101,
            ..ProcessConfig::default()
        });
        manager.free_port(9999);
        assert_eq!(manager.free_port_count(), 2);
    }

    #[test]
    fn context_names_cannot_traverse() {
        assert_eq!(sanitize_context_name("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_context_name("server.js"), "server.js");
    }
}
