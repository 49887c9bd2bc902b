//! Application configuration
//!
//! Loaded from `~/.config/prompt-sync/config.toml`; every section falls back
//! to defaults so a partial file is enough. Cloud credentials are not kept
//! here, they live in the cloud sync settings blob in the flat store.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Base directory for every relative path below
    pub data_dir: PathBuf,
    /// Relational store file
    pub database_file: PathBuf,
    /// Legacy flat store file
    pub flat_store_file: PathBuf,
    /// Where migration backups go
    pub backup_dir: PathBuf,
    /// Fallback log filter when RUST_LOG is unset
    pub log_level: String,
    pub companion: CompanionConfig,
    pub cloud: CloudConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    /// Shared sync file exchanged with the companion extension
    pub path: PathBuf,
    pub backups_enabled: bool,
    /// Oldest backups are removed past this count
    pub max_backups: usize,
    /// Quiet period before a file change is processed
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub request_timeout_secs: u64,
    /// Divergent snapshots modified closer together than this are a conflict
    pub conflict_window_ms: u64,
    /// File name of the snapshot inside the provider's remote path
    pub remote_file_name: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .map(|d| d.join("prompt-sync"))
            .unwrap_or_else(|| PathBuf::from(".prompt-sync"));

        Self {
            data_dir,
            database_file: PathBuf::from("prompts.db"),
            flat_store_file: PathBuf::from("flat-store.json"),
            backup_dir: PathBuf::from("backups"),
            log_level: "info".to_string(),
            companion: CompanionConfig::default(),
            cloud: CloudConfig::default(),
        }
    }
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("companion/sync-data.json"),
            backups_enabled: true,
            max_backups: 10,
            debounce_ms: 300,
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            conflict_window_ms: 1000,
            remote_file_name: "prompt-sync-data.json".to_string(),
        }
    }
}

impl AppConfig {
    /// Default location of the config file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("prompt-sync/config.toml"))
            .unwrap_or_else(|| PathBuf::from("prompt-sync.toml"))
    }

    /// Load from `path`, or defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve(&self.database_file)
    }

    pub fn flat_store_path(&self) -> PathBuf {
        self.resolve(&self.flat_store_file)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.resolve(&self.backup_dir)
    }

    pub fn companion_path(&self) -> PathBuf {
        self.resolve(&self.companion.path)
    }

    pub fn debounce_duration(&self) -> Duration {
        Duration::from_millis(self.companion.debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        self.cloud.request_timeout()
    }

    pub fn conflict_window(&self) -> Duration {
        self.cloud.conflict_window()
    }
}

impl CloudConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn conflict_window(&self) -> Duration {
        Duration::from_millis(self.conflict_window_ms)
    }
}
