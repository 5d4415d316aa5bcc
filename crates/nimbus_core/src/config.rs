use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::broadcast::DEFAULT_QUEUE_CAPACITY;
use crate::context::{ContextMapping, LogicalEnv, ProviderKind};
use crate::error::NimbusError;

/// How a provider waits out an `AuthRequired` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginMode {
    /// Run the tool's own login command and wait for it.
    #[default]
    Interactive,
    /// Wait for someone to report completion through `complete_login`.
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NimbusConfig {
    pub mappings: Vec<ContextMapping>,
    pub freshness_secs: u64,
    pub command_timeout_secs: u64,
    pub lock_timeout_secs: u64,
    pub login_timeout_secs: u64,
    pub login_mode: LoginMode,
    pub hub_queue_capacity: usize,
    pub aws_path: String,
    pub gcloud_path: String,
    pub kubectl_path: String,
    pub log_level: String,
}

impl Default for NimbusConfig {
    fn default() -> Self {
        Self {
            mappings: Vec::new(),
            freshness_secs: 300,
            command_timeout_secs: 120,
            lock_timeout_secs: 60,
            login_timeout_secs: 180,
            login_mode: LoginMode::default(),
            hub_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            aws_path: ProviderKind::Aws.default_program().into(),
            gcloud_path: ProviderKind::Gcp.default_program().into(),
            kubectl_path: ProviderKind::Kubernetes.default_program().into(),
            log_level: "info".into(),
        }
    }
}

impl NimbusConfig {
    /// Returns the base config directory: `~/.nimbus/`
    pub fn base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".nimbus"))
    }

    /// Returns the config file path: `~/.nimbus/config.json`
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.json"))
    }

    /// Returns the logs directory: `~/.nimbus/logs/`
    pub fn logs_dir() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("logs"))
    }

    pub fn ensure_dirs() -> Result<()> {
        for dir in [Self::base_dir()?, Self::logs_dir()?] {
            if !dir.exists() {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
            }
        }
        Ok(())
    }

    /// Loads config from disk, or creates default if missing.
    pub fn load() -> Result<Self> {
        Self::ensure_dirs()?;
        let path = Self::config_path()?;
        Self::load_from_path(&path)
    }

    /// Load config from a specific file path and validate it.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let config: Self = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            info!("Loaded config from {}", path.display());
            config
        } else {
            let config = Self::default();
            config.save_to_path(path)?;
            info!("Created default config at {}", path.display());
            config
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        self.save_to_path(&path)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Rejects duplicate (kind, env) pairs, bad names and zero timeouts.
    pub fn validate(&self) -> std::result::Result<(), NimbusError> {
        let timeouts = [
            ("freshness_secs", self.freshness_secs),
            ("command_timeout_secs", self.command_timeout_secs),
            ("lock_timeout_secs", self.lock_timeout_secs),
            ("login_timeout_secs", self.login_timeout_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(NimbusError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.hub_queue_capacity == 0 {
            return Err(NimbusError::Config(
                "hub_queue_capacity must be greater than zero".into(),
            ));
        }
        for kind in ProviderKind::ALL {
            let program = self.program_for(kind);
            if program.trim().is_empty() {
                return Err(NimbusError::Config(format!("no executable configured for {kind}")));
            }
            if program.chars().any(char::is_whitespace) {
                return Err(NimbusError::Config(format!(
                    "executable path for {kind} must not contain whitespace: '{program}'"
                )));
            }
        }

        let mut seen: HashSet<(ProviderKind, &LogicalEnv)> = HashSet::new();
        for mapping in &self.mappings {
            mapping.validate()?;
            if !seen.insert((mapping.provider_kind, &mapping.logical_env)) {
                return Err(NimbusError::Config(format!(
                    "duplicate mapping for {}/{}",
                    mapping.provider_kind, mapping.logical_env
                )));
            }
        }
        Ok(())
    }

    pub fn mappings_for(&self, kind: ProviderKind) -> Vec<ContextMapping> {
        self.mappings
            .iter()
            .filter(|m| m.provider_kind == kind)
            .cloned()
            .collect()
    }

    pub fn program_for(&self, kind: ProviderKind) -> &str {
        match kind {
            ProviderKind::Aws => &self.aws_path,
            ProviderKind::Gcp => &self.gcloud_path,
            ProviderKind::Kubernetes => &self.kubectl_path,
        }
    }

    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }
}
