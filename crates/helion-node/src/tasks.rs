//! Built-in background tasks.
//!
//! Registered at boot, disabled by default except the curator; the user
//! enables the rest through the scheduler API. Handlers hold the service
//! handles they need rather than the whole kernel.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use helion_gateway::Gateway;
use helion_guard::{Complexity, RuleEngine, Severity};
use helion_kernel::{
    AgentTaskQueue, AppRegistry, KnowledgeBase, ProfileMode, ProfileStore, Scheduler, ShellStore,
    TaskContext, TaskDefinition, TaskHandler, TaskOutcome,
};

use crate::kernel::Kernel;

/// Register every built-in task with the scheduler.
pub fn register_all(kernel: &Arc<Kernel>) {
    let scheduler: &Scheduler = &kernel.scheduler;

    scheduler.register(TaskDefinition {
        id: "registry-curator".into(),
        name: "Registry curator".into(),
        description: "Re-analyze stored apps, quarantine-tag criticals, write a security report"
            .into(),
        category: "security".into(),
        requires_llm: false,
        default_interval: Duration::from_secs(6 * 60 * 60),
        handler: Arc::new(RegistryCurator {
            registry: Arc::clone(&kernel.registry),
            analyzer: Arc::clone(&kernel.analyzer),
            report_dir: kernel.args.data_dir.join("security-reports"),
        }),
    });

    scheduler.register(TaskDefinition {
        id: "knowledge-pruner".into(),
        name: "Knowledge pruner".into(),
        description: "Drop duplicate generation-memory entries".into(),
        category: "maintenance".into(),
        requires_llm: false,
        default_interval: Duration::from_secs(24 * 60 * 60),
        handler: Arc::new(KnowledgePruner {
            knowledge: Arc::clone(&kernel.knowledge),
        }),
    });

    scheduler.register(TaskDefinition {
        id: "spec-writer".into(),
        name: "Spec writer".into(),
        description: "Generate missing app specification documents".into(),
        category: "improvement".into(),
        requires_llm: true,
        default_interval: Duration::from_secs(12 * 60 * 60),
        handler: Arc::new(SpecWriter {
            registry: Arc::clone(&kernel.registry),
            gateway: Arc::clone(&kernel.gateway),
        }),
    });

    scheduler.register(TaskDefinition {
        id: "queue-runner".into(),
        name: "Queue runner".into(),
        description: "Drain queued agent tasks through the gateway".into(),
        category: "improvement".into(),
        requires_llm: true,
        default_interval: Duration::from_secs(15 * 60),
        handler: Arc::new(QueueRunner {
            queue: Arc::clone(&kernel.queue),
            gateway: Arc::clone(&kernel.gateway),
        }),
    });

    scheduler.register(TaskDefinition {
        id: "snapshot-refresher".into(),
        name: "Snapshot refresher".into(),
        description: "Refresh solidified snapshot artifacts from the registry".into(),
        category: "maintenance".into(),
        requires_llm: false,
        default_interval: Duration::from_secs(24 * 60 * 60),
        handler: Arc::new(SnapshotRefresher {
            profile: Arc::clone(&kernel.profile),
            registry: Arc::clone(&kernel.registry),
            shell: Arc::clone(&kernel.shell),
        }),
    });
}

/// Re-run the analyzer across the registry and persist a report.
struct RegistryCurator {
    registry: Arc<AppRegistry>,
    analyzer: Arc<RuleEngine>,
    report_dir: PathBuf,
}

#[async_trait]
impl TaskHandler for RegistryCurator {
    async fn run(&self, _ctx: TaskContext) -> TaskOutcome {
        let entries = self.registry.all();
        let mut flagged = Vec::new();
        let mut quarantined = 0usize;

        for entry in &entries {
            let report = self.analyzer.analyze_code(&entry.code);
            let recipe_report = entry.dockerfile.as_deref().map(|d| self.analyzer.analyze_recipe(d));
            let critical = !report.passed
                || recipe_report.as_ref().map(|r| !r.passed).unwrap_or(false);

            if critical {
                let mut tags = entry.tags.clone();
                if !tags.iter().any(|t| t == "quarantined") {
                    tags.push("quarantined".into());
                    if self.registry.set_tags(&entry.hash, tags).is_ok() {
                        quarantined += 1;
                    }
                }
            }
            if !report.findings.is_empty() {
                flagged.push(json!({
                    "hash": entry.hash,
                    "title": entry.title,
                    "critical": report.findings.iter()
                        .filter(|f| f.severity == Severity::Critical).count(),
                    "warnings": report.findings.iter()
                        .filter(|f| f.severity == Severity::Warning).count(),
                    "rules": report.findings.iter().map(|f| f.rule).collect::<Vec<_>>(),
                }));
            }
        }

        let report = json!({
            "at": Utc::now().to_rfc3339(),
            "scanned": entries.len(),
            "flagged": flagged.len(),
            "quarantined": quarantined,
            "apps": flagged,
        });
        std::fs::create_dir_all(&self.report_dir).map_err(|e| e.to_string())?;
        let name = format!("{}.json", Utc::now().format("%Y-%m-%dT%H-%M-%SZ"));
        std::fs::write(
            self.report_dir.join(name),
            serde_json::to_vec_pretty(&report).map_err(|e| e.to_string())?,
        )
        .map_err(|e| e.to_string())?;

        Ok(json!({
            "scanned": entries.len(),
            "flagged": report["flagged"],
            "quarantined": quarantined,
        }))
    }
}

/// Dedupe the knowledge base.
struct KnowledgePruner {
    knowledge: Arc<KnowledgeBase>,
}

#[async_trait]
impl TaskHandler for KnowledgePruner {
    async fn run(&self, _ctx: TaskContext) -> TaskOutcome {
        let removed = self.knowledge.prune_duplicates().map_err(|e| e.to_string())?;
        Ok(json!({ "removed": removed, "remaining": self.knowledge.len() }))
    }
}

/// Fill in missing `spec` fields, budget permitting.
struct SpecWriter {
    registry: Arc<AppRegistry>,
    gateway: Arc<Gateway>,
}

#[async_trait]
impl TaskHandler for SpecWriter {
    async fn run(&self, ctx: TaskContext) -> TaskOutcome {
        let missing: Vec<_> = self
            .registry
            .all()
            .into_iter()
            .filter(|e| e.spec.is_none())
            .collect();

        let mut written = 0usize;
        for entry in missing {
            if ctx.budget_remaining() == 0 {
                break;
            }
            ctx.track_llm_call();
            let system = "Write a terse markdown specification of the given app: purpose, \
                          interface, stored data, capabilities. Under 200 words. Output markdown only.";
            let excerpt: String = entry.code.chars().take(4000).collect();
            let user = format!(
                "Prompt: {}\nCapabilities: {:?}\n\nCode:\n{excerpt}",
                entry.prompt, entry.capabilities,
            );
            match self.gateway.complete(system, &user, Complexity::Simple).await {
                Ok((text, _, _)) => {
                    self.registry
                        .update_spec(&entry.hash, text.trim())
                        .map_err(|e| e.to_string())?;
                    written += 1;
                }
                Err(err) => return Err(err.to_string()),
            }
        }
        Ok(json!({ "written": written }))
    }
}

/// Drain the agent-task queue.
struct QueueRunner {
    queue: Arc<AgentTaskQueue>,
    gateway: Arc<Gateway>,
}

#[async_trait]
impl TaskHandler for QueueRunner {
    async fn run(&self, ctx: TaskContext) -> TaskOutcome {
        let mut completed = 0usize;
        while let Some(task) = {
            if ctx.budget_remaining() == 0 {
                None
            } else {
                self.queue.claim()
            }
        } {
            ctx.track_llm_call();
            let outcome = self
                .gateway
                .complete(
                    "You are the kernel's background agent. Answer the task directly and concisely.",
                    &task.prompt,
                    Complexity::Medium,
                )
                .await;
            match outcome {
                Ok((text, _, _)) => {
                    self.queue
                        .complete(&task.id, true, text.trim())
                        .map_err(|e| e.to_string())?;
                    completed += 1;
                }
                Err(err) => {
                    self.queue
                        .complete(&task.id, false, &err.to_string())
                        .map_err(|e| e.to_string())?;
                    return Err(err.to_string());
                }
            }
        }
        Ok(json!({ "completed": completed, "queued": self.queue.queued_len() }))
    }
}

/// Keep the solidified snapshot current.
struct SnapshotRefresher {
    profile: Arc<ProfileStore>,
    registry: Arc<AppRegistry>,
    shell: Arc<ShellStore>,
}

#[async_trait]
impl TaskHandler for SnapshotRefresher {
    async fn run(&self, _ctx: TaskContext) -> TaskOutcome {
        if self.profile.mode() != ProfileMode::Solidified {
            return Ok(json!({ "skipped": "ephemeral mode" }));
        }
        let apps = self.registry.all();
        let shell = self.shell.current();
        let meta = self
            .profile
            .solidify(&apps, shell.as_deref())
            .map_err(|e| e.to_string())?;
        Ok(json!({ "apps": meta.apps.len(), "has_shell": meta.has_shell }))
    }
}
