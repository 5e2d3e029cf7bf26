//! cmdgate.json loading
//!
//! Resolution order: `--config <file>`, then `.cmdgate/cmdgate.json` in the
//! current directory, then the global config directory, then defaults.

use anyhow::Context;
use cmdgate_foundation::{JsonStore, SecurityPolicy, CONFIG_DIR};
use cmdgate_task::{ProcessorConfig, StoreConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "cmdgate.json";

/// Who approves pending jobs while `serve` runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Auto-approve commands that do not require confirmation
    #[default]
    Policy,
    /// Everything waits for `cmdgate approve`
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GateConfig {
    /// Job store root; defaults to the platform data directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    pub policy: SecurityPolicy,
    pub processor: ProcessorConfig,
    pub store: StoreConfig,
    pub approval: ApprovalMode,
    pub maintenance_interval_secs: u64,
    /// JSON-lines audit file; audit goes to the log when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_log: Option<PathBuf>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            policy: SecurityPolicy::default(),
            processor: ProcessorConfig::default(),
            store: StoreConfig::default(),
            approval: ApprovalMode::default(),
            maintenance_interval_secs: 300,
            audit_log: None,
        }
    }
}

impl GateConfig {
    /// Load from the first source that exists. Returns the file used, if any.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            let config = load_file(path)?;
            return Ok((config, Some(path.to_path_buf())));
        }

        let mut candidates = vec![JsonStore::current_project()?];
        if let Ok(global) = JsonStore::global() {
            candidates.push(global);
        }
        for store in candidates {
            if store.exists(CONFIG_FILE) {
                let path = store.file_path(CONFIG_FILE);
                let config = store
                    .load(CONFIG_FILE)
                    .with_context(|| format!("Failed to load {}", path.display()))?;
                return Ok((config, Some(path)));
            }
        }
        Ok((Self::default(), None))
    }

    /// Store root
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        dirs::data_local_dir()
            .map(|d| d.join(CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(format!(".{}", CONFIG_DIR)).join("data"))
    }
}

fn load_file(path: &Path) -> anyhow::Result<GateConfig> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Invalid config path {}", path.display()))?;
    JsonStore::new(dir)
        .load(name)
        .with_context(|| format!("Failed to load {}", path.display()))
}

/// Write a starter config with the development tool set rooted at `root`
pub fn write_starter(root: &Path, force: bool) -> anyhow::Result<PathBuf> {
    let store = JsonStore::project(root);
    let path = store.file_path(CONFIG_FILE);
    if store.exists(CONFIG_FILE) && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    let config = GateConfig {
        policy: SecurityPolicy::development(root),
        data_dir: Some(store.base_dir().join("data")),
        ..GateConfig::default()
    };
    store.save(CONFIG_FILE, &config)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: GateConfig = serde_json::from_str(
            r#"{
                "processor": { "maxConcurrentJobs": 4 },
                "approval": "manual",
                "policy": { "commands": [ { "command": "npm" } ] }
            }"#,
        )
        .unwrap();

        assert_eq!(config.processor.max_concurrent_jobs, 4);
        assert_eq!(config.processor.kill_grace_ms, 5000);
        assert_eq!(config.approval, ApprovalMode::Manual);
        assert_eq!(config.maintenance_interval_secs, 300);
        assert_eq!(config.store.result_retention_hours, 24);
        assert!(config.policy.find("npm").unwrap().requires_confirmation);
    }

    #[test]
    fn test_explicit_file_and_starter() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_starter(dir.path(), false).unwrap();
        assert!(write_starter(dir.path(), false).is_err());

        let (config, used) = GateConfig::load(Some(path.as_path())).unwrap();
        assert_eq!(used.as_deref(), Some(path.as_path()));
        assert!(config.policy.find("npm").is_some());
        assert_eq!(config.data_dir(), dir.path().join(".cmdgate").join("data"));

        let missing = dir.path().join("missing.json");
        assert!(GateConfig::load(Some(missing.as_path())).is_err());
    }
}
