//! Resource monitor: which models exist, and how strong they are.
//!
//! Every known model gets a tier, a 1–9 capability ordinal. Tiers come from
//! a static name table or, for local models the table has never heard of,
//! from their parameter-count-ish download size. `best_for` picks the
//! strongest available model meeting a task's floor — except for routing,
//! where the *smallest* adequate model wins because the router runs often
//! and its output is only trusted for two fields anyway.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use helion_guard::Complexity;

use crate::provider::ProviderRegistry;
use crate::providers::OllamaProvider;

/// A model the monitor knows about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model name as the provider reports it.
    pub name: String,
    /// Owning provider.
    pub provider: String,
    /// Download size in bytes when known (local models).
    pub size: u64,
    /// Capability ordinal, 1–9.
    pub tier: u8,
    /// Whether this model may be picked without an explicit override.
    pub default_eligible: bool,
}

/// What the model will be asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskClass {
    /// Prompt classification; cheap and frequent.
    Route,
    /// Simple iframe generation.
    Simple,
    /// Medium generation.
    Medium,
    /// Complex generation and process apps.
    Complex,
}

impl TaskClass {
    /// Minimum acceptable tier.
    pub fn min_tier(&self) -> u8 {
        match self {
            TaskClass::Route => 1,
            TaskClass::Simple => 2,
            TaskClass::Medium => 4,
            TaskClass::Complex => 6,
        }
    }
}

impl From<Complexity> for TaskClass {
    fn from(c: Complexity) -> Self {
        match c {
            Complexity::Simple => TaskClass::Simple,
            Complexity::Medium => TaskClass::Medium,
            Complexity::Complex => TaskClass::Complex,
        }
    }
}

/// Static tier table: substring match against the model name, first hit
/// wins, checked in order.
const TIER_TABLE: &[(&str, u8)] = &[
    ("opus", 9),
    ("gpt-4o-mini", 5),
    ("gpt-4o", 8),
    ("sonnet", 8),
    ("gpt-4", 7),
    ("deepseek-r1", 7),
    ("qwen2.5-coder:32b", 7),
    ("llama3.3", 6),
    ("qwen2.5-coder:14b", 6),
    ("haiku", 5),
    ("qwen2.5-coder:7b", 5),
    ("codellama", 4),
    ("mistral", 4),
    ("llama3.2", 3),
    ("phi3", 3),
    ("gemma2:2b", 2),
    ("qwen2.5:0.5b", 1),
    ("tinyllama", 1),
];

/// Tier from the static table, or `None` for unknown names.
pub fn tier_by_name(name: &str) -> Option<u8> {
    let lower = name.to_lowercase();
    TIER_TABLE
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
        .map(|(_, tier)| *tier)
}

/// Tier estimate from download size, for models the table misses.
pub fn tier_by_size(size: u64) -> u8 {
    const GIB: u64 = 1024 * 1024 * 1024;
    match size {
        0 => 3,
        s if s < GIB => 1,
        s if s < 3 * GIB => 2,
        s if s < 6 * GIB => 4,
        s if s < 12 * GIB => 5,
        s if s < 25 * GIB => 6,
        _ => 7,
    }
}

/// The monitor. Probe results are cached until the next probe.
pub struct ResourceMonitor {
    providers: ProviderRegistry,
    ollama: Option<Arc<OllamaProvider>>,
    models: RwLock<Vec<ModelInfo>>,
}

impl ResourceMonitor {
    /// Build over the provider registry. The ollama adapter is passed
    /// separately because only it reports model sizes.
    pub fn new(providers: ProviderRegistry, ollama: Option<Arc<OllamaProvider>>) -> Self {
        Self {
            providers,
            ollama,
            models: RwLock::new(Vec::new()),
        }
    }

    /// Probe every provider and rebuild the model list.
    ///
    /// Failures degrade to an empty contribution from that provider; the
    /// monitor never errors out of a probe.
    pub async fn probe(&self) {
        let mut models = Vec::new();

        if let Some(ollama) = &self.ollama {
            match ollama.list_models_sized().await {
                Ok(local) => {
                    for (name, size) in local {
                        let tier = tier_by_name(&name).unwrap_or_else(|| tier_by_size(size));
                        models.push(ModelInfo {
                            name,
                            provider: "ollama".into(),
                            size,
                            tier,
                            default_eligible: true,
                        });
                    }
                }
                Err(err) => tracing::debug!(%err, "ollama probe failed"),
            }
        }

        for provider in self.providers.all() {
            if provider.name() == "ollama" {
                continue;
            }
            if !provider.is_available().await {
                continue;
            }
            let default_model = provider.default_model();
            match provider.list_models().await {
                Ok(names) => {
                    for name in names {
                        let tier = tier_by_name(&name).unwrap_or(5);
                        // Non-default cloud models are override-only: they
                        // cost real money and the user never asked for them.
                        let default_eligible = name == default_model;
                        models.push(ModelInfo {
                            name,
                            provider: provider.name().to_string(),
                            size: 0,
                            tier,
                            default_eligible,
                        });
                    }
                }
                Err(err) => tracing::debug!(provider = provider.name(), %err, "listing failed"),
            }
        }

        tracing::debug!(count = models.len(), "model probe complete");
        *self.models.write() = models;
    }

    /// The cached model list.
    pub fn models(&self) -> Vec<ModelInfo> {
        self.models.read().clone()
    }

    /// Replace the cached list (tests).
    pub fn set_models(&self, models: Vec<ModelInfo>) {
        *self.models.write() = models;
    }

    /// The best model for a task.
    ///
    /// Default-eligible models are preferred; override-only models are
    /// considered only when no default-eligible model meets the floor. For
    /// [`TaskClass::Route`] the smallest adequate model is returned, for
    /// everything else the strongest.
    pub fn best_for(&self, task: TaskClass) -> Option<ModelInfo> {
        let models = self.models.read();
        let floor = task.min_tier();

        let pick = |candidates: &[&ModelInfo]| -> Option<ModelInfo> {
            let adequate: Vec<&&ModelInfo> =
                candidates.iter().filter(|m| m.tier >= floor).collect();
            let chosen = if task == TaskClass::Route {
                adequate.iter().min_by_key(|m| m.tier)
            } else {
                adequate.iter().max_by_key(|m| m.tier)
            };
            chosen.map(|m| (**m).clone())
        };

        let defaults: Vec<&ModelInfo> = models.iter().filter(|m| m.default_eligible).collect();
        if let Some(found) = pick(&defaults) {
            return Some(found);
        }
        let overrides: Vec<&ModelInfo> = models.iter().filter(|m| !m.default_eligible).collect();
        pick(&overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(name: &str, provider: &str, tier: u8, default_eligible: bool) -> ModelInfo {
        ModelInfo {
            name: name.into(),
            provider: provider.into(),
            size: 0,
            tier,
            default_eligible,
        }
    }

    fn monitor_with(models: Vec<ModelInfo>) -> ResourceMonitor {
        let monitor = ResourceMonitor::new(ProviderRegistry::new(), None);
        monitor.set_models(models);
        monitor
    }

    #[test]
    fn name_table_lookup() {
        assert_eq!(tier_by_name("claude-opus-4-1-20250805"), Some(9));
        assert_eq!(tier_by_name("qwen2.5-coder:7b"), Some(5));
        assert_eq!(tier_by_name("totally-unknown"), None);
    }

    #[test]
    fn size_estimation_is_monotone() {
        let sizes = [
            512 * 1024 * 1024u64,
            2 * 1024 * 1024 * 1024,
            5 * 1024 * 1024 * 1024,
            10 * 1024 * 1024 * 1024,
            20 * 1024 * 1024 * 1024,
            40 * 1024 * 1024 * 1024,
        ];
        let tiers: Vec<u8> = sizes.iter().map(|s| tier_by_size(*s)).collect();
        let mut sorted = tiers.clone();
        sorted.sort_unstable();
        assert_eq!(tiers, sorted);
    }

    #[test]
    fn best_for_generation_is_strongest() {
        let monitor = monitor_with(vec![
            model("small", "ollama", 3, true),
            model("big", "ollama", 7, true),
        ]);
        let best = monitor.best_for(TaskClass::Complex).unwrap();
        assert_eq!(best.name, "big");
    }

    #[test]
    fn best_for_route_is_smallest_adequate() {
        let monitor = monitor_with(vec![
            model("tiny", "ollama", 1, true),
            model("mid", "ollama", 4, true),
            model("big", "ollama", 8, true),
        ]);
        let best = monitor.best_for(TaskClass::Route).unwrap();
        assert_eq!(best.name, "tiny");
    }

    #[test]
    fn floor_filters_inadequate_models() {
        let monitor = monitor_with(vec![model("small", "ollama", 2, true)]);
        assert!(monitor.best_for(TaskClass::Complex).is_none());
        assert!(monitor.best_for(TaskClass::Simple).is_some());
    }

    #[test]
    fn override_only_used_as_last_resort() {
        let monitor = monitor_with(vec![
            model("default-mid", "ollama", 6, true),
            model("override-big", "claude", 9, false),
        ]);
        // A default meets the floor: overrides are ignored even when stronger.
        let best = monitor.best_for(TaskClass::Complex).unwrap();
        assert_eq!(best.name, "default-mid");

        // No default meets the floor: overrides become eligible.
        let monitor = monitor_with(vec![
            model("default-small", "ollama", 2, true),
            model("override-big", "claude", 9, false),
        ]);
        let best = monitor.best_for(TaskClass::Complex).unwrap();
        assert_eq!(best.name, "override-big");
    }
}
