//! Configuration Module - settings from `<config dir>/a11y-triage/config.toml`
//!
//! Loaded once at startup and passed down explicitly; nothing in the library
//! reads configuration from a global.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cluster::{ClusteringMethod, DEFAULT_SIMILARITY_THRESHOLD};
use crate::runtime::RuntimeConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub runtime: RuntimeSettings,
    pub clustering: ClusteringSettings,
    pub sandbox: SandboxSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Agents running at once inside a group (0 = CPU count)
    pub max_concurrent_agents: usize,
    pub agent_timeout_secs: u64,
    /// Bound on a whole run (0 = none)
    pub plan_timeout_secs: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 0,
            agent_timeout_secs: 120,
            plan_timeout_secs: 0,
        }
    }
}

impl RuntimeSettings {
    pub fn to_runtime_config(&self) -> RuntimeConfig {
        let workers = if self.max_concurrent_agents == 0 {
            num_cpus::get()
        } else {
            self.max_concurrent_agents
        };
        let config = RuntimeConfig::default()
            .with_concurrency(workers)
            .with_agent_timeout(Duration::from_secs(self.agent_timeout_secs.max(1)));
        if self.plan_timeout_secs > 0 {
            config.with_plan_timeout(Duration::from_secs(self.plan_timeout_secs))
        } else {
            config
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringSettings {
    pub method: ClusteringMethod,
    pub similarity_threshold: f64,
}

impl Default for ClusteringSettings {
    fn default() -> Self {
        Self {
            method: ClusteringMethod::Semantic,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Parent directory of every sandbox
    pub root: PathBuf,
    /// Re-hash the originals after each patch batch
    pub verify_originals: bool,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            root: default_sandbox_root(),
            verify_originals: true,
        }
    }
}

fn default_sandbox_root() -> PathBuf {
    directories::ProjectDirs::from("org", "a11y", "a11y-triage")
        .map(|dirs| dirs.data_local_dir().join("sandbox"))
        .or_else(|| dirs::data_local_dir().map(|d| d.join("a11y-triage").join("sandbox")))
        .unwrap_or_else(|| std::env::temp_dir().join("a11y-triage").join("sandbox"))
}

impl Config {
    /// Load config from default path or return defaults
    pub fn load() -> Self {
        Self::load_from(&Self::default_path()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;

        Ok(())
    }

    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("org", "a11y", "a11y-triage")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".a11y-triage")
                    .join("config.toml")
            })
    }

    /// Reject values no component could honour
    pub fn validate(&self) -> Result<()> {
        let t = self.clustering.similarity_threshold;
        if !(0.0..=1.0).contains(&t) {
            anyhow::bail!("clustering.similarity_threshold must be within [0, 1], got {t}");
        }
        if self.runtime.agent_timeout_secs == 0 {
            anyhow::bail!("runtime.agent_timeout_secs must be at least 1");
        }
        Ok(())
    }
}

/// Sample config file with comments
pub fn generate_sample_config() -> String {
    r#"# a11y-triage configuration

[general]
# Log level: trace, debug, info, warn, error (RUST_LOG overrides)
log_level = "info"

[runtime]
# Agents running at once inside a plan group (0 = CPU count)
max_concurrent_agents = 0

# Per-agent time limit in seconds
agent_timeout_secs = 120

# Whole-run time limit in seconds (0 = none). Agents still running when it
# expires are cancelled and the run is reported as partial.
plan_timeout_secs = 1800

[clustering]
# "rule_based", "semantic" or "hybrid"
method = "semantic"

# Edge threshold for semantic grouping, within [0, 1]
similarity_threshold = 0.7

[sandbox]
# Parent directory for sandbox copies
# root = "/var/tmp/a11y-triage/sandbox"

# Re-hash the original artifacts after every patch batch
verify_originals = true
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.clustering.method, ClusteringMethod::Semantic);
        assert_eq!(config.runtime.agent_timeout_secs, 120);
        assert!(config.sandbox.verify_originals);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.clustering.method = ClusteringMethod::Hybrid;
        config.runtime.plan_timeout_secs = 60;
        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_parse_sample_config() {
        let config: Config = toml::from_str(&generate_sample_config()).unwrap();
        assert_eq!(config.runtime.plan_timeout_secs, 1800);
        // missing keys fall back to defaults
        assert_eq!(config.sandbox.root, SandboxSettings::default().root);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[clustering]\nsimilarity_threshold = 1.5\n").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("similarity_threshold"));
    }

    #[test]
    fn test_runtime_conversion() {
        let settings = RuntimeSettings {
            max_concurrent_agents: 3,
            agent_timeout_secs: 5,
            plan_timeout_secs: 0,
        };
        let rc = settings.to_runtime_config();
        assert_eq!(rc.max_concurrent_agents, 3);
        assert_eq!(rc.agent_timeout, Duration::from_secs(5));
        assert_eq!(rc.plan_timeout, None);
    }
}
