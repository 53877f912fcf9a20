//! User profile and the ephemeral/solidified lifecycle.
//!
//! The profile is a user-editable `profile.yaml` under the data root. Serde
//! defaults act as the overlay: a partial file is valid and missing fields
//! take their defaults, so hand-edits cannot brick boot.
//!
//! `solidify` freezes the current generation output — every registry entry
//! and the active shell — under `snapshot/`, then flips the profile to
//! `solidified`. A solidified kernel reuses frozen artifacts on boot instead
//! of regenerating. Process apps snapshot their textual artifacts only
//! (recipe + code + metadata); images are rebuilt on resume.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{KernelError, Result};
use crate::registry::AppEntry;
use crate::storage::sanitize_app_id;

/// Whether generated artifacts persist across boots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProfileMode {
    /// Regenerate on every boot.
    #[default]
    Ephemeral,
    /// Reuse frozen snapshot artifacts.
    Solidified,
}

/// Shell preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellProfile {
    /// Color theme name.
    pub theme: String,
    /// Accent color (CSS).
    pub accent: String,
    /// Wallpaper style identifier.
    pub wallpaper: String,
}

impl Default for ShellProfile {
    fn default() -> Self {
        Self {
            theme: "dark".into(),
            accent: "#7c6cf0".into(),
            wallpaper: "gradient".into(),
        }
    }
}

/// Which built-in services run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesProfile {
    /// SSH access into the host container.
    pub ssh: bool,
    /// Local inference endpoint.
    pub ollama: bool,
    /// Background task scheduler.
    pub scheduler: bool,
}

impl Default for ServicesProfile {
    fn default() -> Self {
        Self {
            ssh: false,
            ollama: true,
            scheduler: true,
        }
    }
}

/// Security posture knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityProfile {
    /// Enforce the sandbox (disabling is for development only).
    pub sandbox: bool,
    /// Allow `network:http` grants at all.
    pub network: bool,
    /// Cap on capabilities per app.
    pub max_capabilities: usize,
}

impl Default for SecurityProfile {
    fn default() -> Self {
        Self {
            sandbox: true,
            network: true,
            max_capabilities: 6,
        }
    }
}

/// LLM preferences.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LlmProfile {
    /// Preferred provider name, when pinned.
    pub provider: Option<String>,
    /// Preferred model, when pinned.
    pub model: Option<String>,
    /// Fallback provider name.
    pub fallback: Option<String>,
}

/// The user profile record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    /// Artifact lifecycle mode.
    pub mode: ProfileMode,
    /// Display name.
    pub name: String,
    /// BCP-47 locale.
    pub locale: String,
    /// IANA timezone.
    pub timezone: String,
    /// Shell preferences.
    pub shell: ShellProfile,
    /// Apps launched at boot, by content address.
    pub boot_apps: Vec<String>,
    /// Service switches.
    pub services: ServicesProfile,
    /// Security knobs.
    pub security: SecurityProfile,
    /// LLM preferences.
    pub llm: LlmProfile,
    /// Extra data-root paths to retain across ephemeral boots.
    pub persist: Vec<String>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            mode: ProfileMode::Ephemeral,
            name: "helion".into(),
            locale: "en-US".into(),
            timezone: "UTC".into(),
            shell: ShellProfile::default(),
            boot_apps: Vec::new(),
            services: ServicesProfile::default(),
            security: SecurityProfile::default(),
            llm: LlmProfile::default(),
            persist: Vec::new(),
        }
    }
}

/// Snapshot metadata written at solidify time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Unix seconds the snapshot was taken.
    pub created_at: u64,
    /// Content addresses included.
    pub apps: Vec<String>,
    /// Whether a shell body was captured.
    pub has_shell: bool,
}

/// Profile file plus snapshot tree management.
pub struct ProfileStore {
    data_root: PathBuf,
    profile: RwLock<Profile>,
}

impl ProfileStore {
    /// Load `profile.yaml`, falling back to defaults when missing or corrupt.
    pub fn load(data_root: &Path) -> Self {
        let path = data_root.join("profile.yaml");
        let profile = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_yaml::from_str::<Profile>(&text) {
                Ok(p) => p,
                Err(err) => {
                    tracing::warn!(%err, "corrupt profile.yaml, using defaults");
                    Profile::default()
                }
            },
            Err(_) => Profile::default(),
        };
        Self {
            data_root: data_root.to_path_buf(),
            profile: RwLock::new(profile),
        }
    }

    /// A copy of the current profile.
    pub fn get(&self) -> Profile {
        self.profile.read().clone()
    }

    /// Replace and persist the profile.
    pub fn set(&self, profile: Profile) -> Result<()> {
        *self.profile.write() = profile;
        self.save()
    }

    /// Current lifecycle mode.
    pub fn mode(&self) -> ProfileMode {
        self.profile.read().mode
    }

    /// Freeze all given apps and the shell under `snapshot/`, then flip the
    /// profile to solidified.
    pub fn solidify(&self, apps: &[AppEntry], shell_html: Option<&str>) -> Result<SnapshotMeta> {
        let snap = self.data_root.join("snapshot");
        let apps_dir = snap.join("apps");
        std::fs::create_dir_all(&apps_dir)?;

        let mut hashes = Vec::with_capacity(apps.len());
        for entry in apps {
            let json = serde_json::to_vec_pretty(entry)
                .map_err(|e| KernelError::Internal(format!("snapshot serialize: {e}")))?;
            std::fs::write(apps_dir.join(format!("{}.json", sanitize_app_id(&entry.hash))), json)?;
            hashes.push(entry.hash.clone());
        }

        if let Some(html) = shell_html {
            std::fs::write(snap.join("shell.html"), html)?;
        }

        let meta = SnapshotMeta {
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            apps: hashes,
            has_shell: shell_html.is_some(),
        };
        let meta_json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| KernelError::Internal(format!("snapshot meta serialize: {e}")))?;
        std::fs::write(snap.join("meta.json"), meta_json)?;

        self.profile.write().mode = ProfileMode::Solidified;
        self.save()?;
        tracing::info!(apps = meta.apps.len(), "solidified");
        Ok(meta)
    }

    /// Return to ephemeral mode, optionally deleting the snapshot tree.
    pub fn go_ephemeral(&self, clear_snapshot: bool) -> Result<()> {
        self.profile.write().mode = ProfileMode::Ephemeral;
        self.save()?;
        if clear_snapshot {
            let snap = self.data_root.join("snapshot");
            if snap.exists() {
                std::fs::remove_dir_all(&snap)?;
            }
        }
        Ok(())
    }

    /// Snapshot metadata, if a snapshot exists.
    pub fn snapshot_meta(&self) -> Option<SnapshotMeta> {
        let bytes = std::fs::read(self.data_root.join("snapshot/meta.json")).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// A frozen app, only available in solidified mode.
    pub fn load_snapshot_app(&self, app_id: &str) -> Option<AppEntry> {
        if self.mode() != ProfileMode::Solidified {
            return None;
        }
        let path = self
            .data_root
            .join("snapshot/apps")
            .join(format!("{}.json", sanitize_app_id(app_id)));
        let bytes = std::fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// The frozen shell, only available in solidified mode.
    pub fn load_snapshot_shell(&self) -> Option<String> {
        if self.mode() != ProfileMode::Solidified {
            return None;
        }
        std::fs::read_to_string(self.data_root.join("snapshot/shell.html")).ok()
    }

    fn save(&self) -> Result<()> {
        let profile = self.profile.read();
        let yaml = serde_yaml::to_string(&*profile)
            .map_err(|e| KernelError::Internal(format!("profile serialize: {e}")))?;
        std::fs::write(self.data_root.join("profile.yaml"), yaml)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helion_guard::{AppType, Capability};
    use tempfile::tempdir;

    fn app(hash_seed: &str) -> AppEntry {
        AppEntry {
            hash: crate::registry::content_hash(hash_seed),
            prompt: "p".into(),
            normalized_prompt: "p".into(),
            title: "t".into(),
            app_type: AppType::Iframe,
            code: hash_seed.to_string(),
            dockerfile: None,
            capabilities: vec![Capability::UiWindow],
            model: "m".into(),
            provider: "pr".into(),
            launches: 1,
            created_at: 0,
            tags: vec![],
            spec: None,
            rating: 0,
        }
    }

    #[test]
    fn defaults_when_missing() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::load(dir.path());
        let profile = store.get();
        assert_eq!(profile.mode, ProfileMode::Ephemeral);
        assert!(profile.services.scheduler);
        assert!(profile.security.sandbox);
    }

    #[test]
    fn partial_yaml_overlays_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("profile.yaml"),
            "name: workstation\nboot_apps:\n  - abc123\n",
        )
        .unwrap();
        let store = ProfileStore::load(dir.path());
        let profile = store.get();
        assert_eq!(profile.name, "workstation");
        assert_eq!(profile.boot_apps, vec!["abc123"]);
        // Unspecified fields keep defaults.
        assert_eq!(profile.locale, "en-US");
        assert!(profile.services.ollama);
    }

    #[test]
    fn corrupt_yaml_uses_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("profile.yaml"), ": : :\n\t bad").unwrap();
        let store = ProfileStore::load(dir.path());
        assert_eq!(store.get().mode, ProfileMode::Ephemeral);
    }

    #[test]
    fn solidify_writes_snapshot_and_flips_mode() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::load(dir.path());
        let apps = vec![app("<html>a</html>"), app("<html>b</html>")];
        let meta = store.solidify(&apps, Some("<html>shell</html>")).unwrap();

        assert_eq!(meta.apps.len(), 2);
        assert!(meta.has_shell);
        assert_eq!(store.mode(), ProfileMode::Solidified);
        assert!(dir.path().join("snapshot/meta.json").exists());
        assert!(dir.path().join("snapshot/shell.html").exists());

        // Mode survives reload via profile.yaml.
        let reloaded = ProfileStore::load(dir.path());
        assert_eq!(reloaded.mode(), ProfileMode::Solidified);
    }

    #[test]
    fn snapshot_loads_only_when_solidified() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::load(dir.path());
        let entry = app("<html>x</html>");
        let hash = entry.hash.clone();
        store.solidify(&[entry], Some("<html>shell</html>")).unwrap();

        assert!(store.load_snapshot_app(&hash).is_some());
        assert_eq!(
            store.load_snapshot_shell().as_deref(),
            Some("<html>shell</html>")
        );

        store.go_ephemeral(false).unwrap();
        // Artifacts still on disk, but ephemeral mode refuses them.
        assert!(store.load_snapshot_app(&hash).is_none());
        assert!(store.load_snapshot_shell().is_none());
    }

    #[test]
    fn go_ephemeral_can_clear_snapshot() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::load(dir.path());
        store.solidify(&[app("<html>x</html>")], None).unwrap();
        assert!(dir.path().join("snapshot").exists());

        store.go_ephemeral(true).unwrap();
        assert!(!dir.path().join("snapshot").exists());
        assert_eq!(store.mode(), ProfileMode::Ephemeral);
    }
}
