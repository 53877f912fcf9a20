//! Kernel wiring: every service constructed once, in dependency order.
//!
//! Initialization order is load-bearing: profile → storage → scheduler
//! state → task registration → capability key → registry → (HTTP listener,
//! started by main) → background probe and community sync. Shutdown runs
//! the reverse of the stateful parts: flush storage, persist scheduler,
//! stop containers.

use std::sync::Arc;
use std::time::Duration;

use helion_gateway::{
    ClaudeConfig, ClaudeProvider, Gateway, GatewayConfig, OllamaConfig, OllamaProvider,
    OpenAiConfig, OpenAiProvider, PromptRouter, ProviderRegistry, ResourceMonitor,
};
use helion_guard::RuleEngine;
use helion_kernel::{
    AgentTaskQueue, AppRegistry, AppStorage, CapabilityService, KnowledgeBase, ProfileStore,
    Scheduler, SchedulerConfig, ShellStore, TokenService,
};
use helion_sandbox::container::{ProcessConfig, ProcessManager};
use helion_sandbox::WasmSandbox;

use crate::config::Args;
use crate::hostcall::KernelHostCalls;

/// Everything the HTTP surface and the tasks need, in one place.
pub struct Kernel {
    /// Parsed configuration.
    pub args: Args,
    /// Static analyzer.
    pub analyzer: Arc<RuleEngine>,
    /// Capability grants and tokens.
    pub caps: Arc<CapabilityService>,
    /// Content-addressed app registry.
    pub registry: Arc<AppRegistry>,
    /// Per-app storage.
    pub storage: AppStorage,
    /// Generation memory.
    pub knowledge: Arc<KnowledgeBase>,
    /// Background tasks.
    pub scheduler: Scheduler,
    /// Profile and snapshots.
    pub profile: Arc<ProfileStore>,
    /// Shell version history.
    pub shell: Arc<ShellStore>,
    /// Queued agent tasks.
    pub queue: Arc<AgentTaskQueue>,
    /// Provider adapters, for availability reporting.
    pub providers: ProviderRegistry,
    /// Generation pipeline.
    pub gateway: Arc<Gateway>,
    /// Prompt router.
    pub router: PromptRouter,
    /// Model monitor.
    pub monitor: Arc<ResourceMonitor>,
    /// Compute sandbox.
    pub wasm: Arc<WasmSandbox>,
    /// Container manager, when enabled.
    pub processes: Option<ProcessManager>,
    /// Recent in-app notifications (bounded).
    pub notifications: Arc<parking_lot::Mutex<Vec<String>>>,
    /// Unix seconds at boot.
    pub started_at: u64,
}

impl Kernel {
    /// Construct all services. Does not bind the listener or start timers.
    pub fn boot(args: Args) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(&args.data_dir)?;

        // Profile first: it can veto services below.
        let profile = Arc::new(ProfileStore::load(&args.data_dir));

        // Stores.
        let storage = AppStorage::open(&args.data_dir)?;
        let knowledge = Arc::new(KnowledgeBase::load(&args.data_dir));
        let shell = Arc::new(ShellStore::load(&args.data_dir));
        let queue = Arc::new(AgentTaskQueue::load(&args.data_dir));

        // Scheduler state before task registration (registration adopts it).
        let scheduler = Scheduler::load(
            &args.data_dir,
            SchedulerConfig {
                defer: Duration::from_secs(args.scheduler_defer_minutes * 60),
                daily_budget: args.scheduler_daily_budget,
                task_config: serde_json::json!({
                    "max_registry": args.scheduler_max_registry,
                    "provider": args.scheduler_provider,
                }),
            },
        );

        // Capability key, then the registry of things it will guard.
        let caps = Arc::new(CapabilityService::new(TokenService::new()));
        let registry = Arc::new(AppRegistry::load(&args.data_dir));

        // Providers.
        let mut providers = ProviderRegistry::new();
        let ollama = Arc::new(OllamaProvider::new(OllamaConfig {
            url: args.ollama_url.clone(),
            model: args.ollama_model.clone(),
        }));
        providers.register(ollama.clone());
        if let Some(key) = &args.anthropic_api_key {
            providers.register(Arc::new(ClaudeProvider::new(ClaudeConfig {
                api_key: key.clone(),
                model: args.claude_model.clone(),
            })));
        }
        if let Some(key) = &args.openai_api_key {
            providers.register(Arc::new(OpenAiProvider::new(OpenAiConfig {
                api_key: key.clone(),
                base_url: args.openai_base_url.clone(),
                model: args.openai_model.clone(),
            })));
        }

        let monitor = Arc::new(ResourceMonitor::new(providers.clone(), Some(ollama)));
        let router = PromptRouter::new(providers.clone());
        let llm_profile = profile.get().llm;
        let gateway = Arc::new(Gateway::new(
            providers.clone(),
            Arc::clone(&monitor),
            Arc::clone(&knowledge),
            GatewayConfig {
                provider_override: llm_profile.provider,
                fallback_provider: llm_profile.fallback,
            },
        ));

        // Sandboxes.
        let notifications = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let host_calls = Arc::new(KernelHostCalls::new(
            storage.clone(),
            Arc::clone(&notifications),
        ));
        let wasm = Arc::new(WasmSandbox::new(host_calls));
        let processes = if args.docker_enabled {
            Some(ProcessManager::new(ProcessConfig {
                transport: args.engine_transport(),
                port_start: args.docker_port_start,
                port_end: args.docker_port_end,
                max_containers: args.docker_max_containers,
                data_root: args.data_dir.clone(),
                anthropic_api_key: args.anthropic_api_key.clone(),
            }))
        } else {
            None
        };

        let kernel = Arc::new(Self {
            analyzer: Arc::new(RuleEngine::new()),
            caps,
            registry,
            storage,
            knowledge,
            scheduler,
            profile,
            shell,
            queue,
            providers,
            gateway,
            router,
            monitor,
            wasm,
            processes,
            notifications,
            started_at: now_unix(),
            args,
        });

        crate::tasks::register_all(&kernel);
        Ok(kernel)
    }

    /// Background work started after the listener binds: resource probes
    /// and (when configured) community sync.
    pub fn start_background(self: &Arc<Self>) {
        if self.args.scheduler_enabled && self.profile.get().services.scheduler {
            self.scheduler.start();
        }

        let monitor = Arc::clone(&self.monitor);
        tokio::spawn(async move {
            loop {
                monitor.probe().await;
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        });

        if !self.args.community_index.is_empty() {
            let registry = Arc::clone(&self.registry);
            let index = self.args.community_index.clone();
            tokio::spawn(async move {
                loop {
                    registry.sync_community(&index).await;
                    tokio::time::sleep(Duration::from_secs(30 * 60)).await;
                }
            });
        }
    }

    /// Graceful shutdown: flush storage, persist scheduler, stop containers.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down");
        if let Err(err) = self.storage.flush_all() {
            tracing::warn!(%err, "storage flush failed during shutdown");
        }
        self.scheduler.persist();
        if let Some(processes) = &self.processes {
            processes.stop_all().await;
        }
        self.wasm.kill_all();
    }
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
    use clap::Parser;
    use tempfile::tempdir;

    #[tokio::test]
    async fn kernel_boots_on_an_empty_data_dir() {
        let dir = tempdir().unwrap();
        let args = Args::parse_from([
            "helion-node",
            "--data-dir",
            dir.path().to_str().unwrap(),
        ]);
        let kernel = Kernel::boot(args).unwrap();
        assert!(kernel.registry.all().is_empty());
        assert!(!kernel.scheduler.get_all().is_empty(), "built-in tasks registered");
        assert!(kernel.processes.is_none(), "docker disabled by default");
    }

    #[tokio::test]
    async fn shutdown_flushes_cleanly() {
        let dir = tempdir().unwrap();
        let args = Args::parse_from([
            "helion-node",
            "--data-dir",
            dir.path().to_str().unwrap(),
        ]);
        let kernel = Kernel::boot(args).unwrap();
        kernel
            .storage
            .set("app", "k", serde_json::json!(1))
            .unwrap();
        kernel.shutdown().await;
        assert!(dir.path().join("apps/app/store.json").exists());
        assert!(dir.path().join("scheduler.json").exists());
    }
}
