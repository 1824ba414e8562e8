//! Project config (`automaker.toml`, spec §3 "Configuration") and
//! per-user credentials/settings (spec §3 "Credentials and global
//! settings") — mirrors forge's `ForgeConfig`/`forge.toml` shape,
//! extended with the per-user data-directory split forge never needed
//! since every forge invocation is scoped to one project on one
//! machine run by one person in the terminal.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse automaker.toml: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize automaker.toml: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to parse credentials: {0}")]
    ParseJson(#[from] serde_json::Error),
    #[error("no per-user data directory available on this platform")]
    NoDataDir,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectConfig {
    pub project: ProjectMeta,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectMeta {
    pub name: String,
    #[serde(default)]
    pub stack: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Squash,
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineSettings {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_provider")]
    pub default_provider: String,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default = "default_worktrees_enabled")]
    pub worktrees_enabled: bool,
    #[serde(default = "default_merge_strategy")]
    pub merge_strategy: MergeStrategy,
    /// Resolved Open Question (spec §9 / DESIGN.md): approving a
    /// plan-gated feature reuses the worktree the planning turn already
    /// produced instead of provisioning a fresh one.
    #[serde(default = "default_reuse_worktree_on_approval")]
    pub reuse_worktree_on_approval: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_provider: default_provider(),
            default_model: None,
            worktrees_enabled: default_worktrees_enabled(),
            merge_strategy: default_merge_strategy(),
            reuse_worktree_on_approval: default_reuse_worktree_on_approval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProviderOverride {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_max_concurrency() -> usize {
    4
}
fn default_provider() -> String {
    "claude".into()
}
fn default_worktrees_enabled() -> bool {
    true
}
fn default_merge_strategy() -> MergeStrategy {
    MergeStrategy::Merge
}
fn default_reuse_worktree_on_approval() -> bool {
    true
}

impl ProjectConfig {
    pub fn load(project_dir: &Path) -> Result<Self, ConfigError> {
        let path = project_dir.join("automaker.toml");
        let content = std::fs::read_to_string(&path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save(&self, project_dir: &Path) -> Result<(), ConfigError> {
        let path = project_dir.join("automaker.toml");
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Generates a minimal `automaker.toml` for a newly-initialized project.
    pub fn scaffold(name: &str, stack: &str) -> Self {
        Self {
            project: ProjectMeta { name: name.into(), stack: stack.into() },
            engine: EngineSettings::default(),
            providers: BTreeMap::new(),
        }
    }
}

/// Per-user credentials and global settings (spec §3): a single JSON
/// file in an OS-appropriate per-user data directory, read-mostly and
/// updated by whole-file replacement (spec §5 "last-writer-wins").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GlobalSettings {
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
    #[serde(default)]
    pub preferred_provider: Option<String>,
}

pub struct GlobalSettingsStore {
    path: PathBuf,
}

impl GlobalSettingsStore {
    /// Locates `<data dir>/automaker/settings.json` via the `directories`
    /// crate so the path is correct on Linux, macOS, and Windows.
    pub fn locate() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from("dev", "automaker", "automaker").ok_or(ConfigError::NoDataDir)?;
        Ok(Self { path: dirs.data_dir().join("settings.json") })
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Result<GlobalSettings, ConfigError> {
        if !self.path.exists() {
            return Ok(GlobalSettings::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, settings: &GlobalSettings) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(settings)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_TOML: &str = r#"
[project]
name = "my-app"
stack = "Rust, axum, sqlx"

[engine]
max_concurrency = 6
default_provider = "codex"
worktrees_enabled = true
merge_strategy = "squash"

[providers.claude]
model = "opus"
"#;

    #[test]
    fn parse_full_config() {
        let config: ProjectConfig = toml::from_str(SAMPLE_TOML).unwrap();
        assert_eq!(config.project.name, "my-app");
        assert_eq!(config.engine.max_concurrency, 6);
        assert_eq!(config.engine.default_provider, "codex");
        assert_eq!(config.engine.merge_strategy, MergeStrategy::Squash);
        assert_eq!(config.providers["claude"].model.as_deref(), Some("opus"));
    }

    #[test]
    fn parse_minimal_config_uses_defaults() {
        let toml_str = r#"
[project]
name = "bare"
"#;
        let config: ProjectConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.max_concurrency, 4);
        assert_eq!(config.engine.default_provider, "claude");
        assert!(config.engine.reuse_worktree_on_approval);
        assert_eq!(config.engine.merge_strategy, MergeStrategy::Merge);
    }

    #[test]
    fn scaffold_creates_default() {
        let config = ProjectConfig::scaffold("test-app", "Rust");
        assert_eq!(config.project.name, "test-app");
        assert_eq!(config.engine.max_concurrency, 4);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn roundtrip_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProjectConfig::scaffold("roundtrip", "Rust, axum");
        config.save(dir.path()).unwrap();
        let loaded = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn load_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ProjectConfig::load(dir.path()).is_err());
    }

    #[test]
    fn global_settings_roundtrip_via_whole_file_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let store = GlobalSettingsStore::at(dir.path().join("settings.json"));

        assert_eq!(store.load().unwrap(), GlobalSettings::default());

        let mut settings = GlobalSettings::default();
        settings.credentials.insert("claude".into(), "sk-fake".into());
        store.save(&settings).unwrap();

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded, settings);
    }
}
