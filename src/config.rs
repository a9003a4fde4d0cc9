use crate::utils::{default_store_path, get_data_dir, write_atomic};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine and CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    /// Overrides `<data_dir>/policy.json`
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    /// Maximum wait for a scope lock before reporting `Busy`
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Maximum wait for the IP allocator or enforcement driver
    #[serde(default = "default_collaborator_timeout_ms")]
    pub collaborator_timeout_ms: u64,
    /// Reject ports on non-TCP/UDP rules instead of dropping them
    #[serde(default = "default_true")]
    pub strict_port_validation: bool,
    #[serde(default = "default_true")]
    pub audit_enabled: bool,
    /// Maximum number of rules per group and in the machine rule set
    #[serde(default = "default_max_rules")]
    pub max_rules_per_scope: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            lock_timeout_ms: default_lock_timeout_ms(),
            collaborator_timeout_ms: default_collaborator_timeout_ms(),
            strict_port_validation: true,
            audit_enabled: true,
            max_rules_per_scope: default_max_rules(),
        }
    }
}

impl AppConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }

    /// Store location: the configured override or the XDG default.
    pub fn resolved_store_path(&self) -> Option<PathBuf> {
        self.store_path.clone().or_else(default_store_path)
    }
}

fn default_true() -> bool {
    true
}

fn default_lock_timeout_ms() -> u64 {
    2000
}

fn default_collaborator_timeout_ms() -> u64 {
    5000
}

fn default_max_rules() -> usize {
    1000
}

fn config_path() -> Option<PathBuf> {
    get_data_dir().map(|dir| dir.join("config.json"))
}

/// Saves the config to `path` using an atomic write with 0o600 permissions.
///
/// # Async
/// Uses `tokio::fs` for non-blocking I/O.
pub async fn save_config_to(path: &Path, config: &AppConfig) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    write_atomic(path, json.as_bytes()).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        }
    })
}

/// Saves the config to `<data_dir>/config.json`.
pub async fn save_config(config: &AppConfig) -> std::io::Result<()> {
    match config_path() {
        Some(path) => save_config_to(&path, config).await,
        None => Ok(()),
    }
}

/// Loads the config from `path`, or returns defaults if missing or unparsable.
///
/// # Async
/// Uses `tokio::fs` for non-blocking I/O.
pub async fn load_config_from(path: &Path) -> AppConfig {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => serde_json::from_str::<AppConfig>(&json).unwrap_or_else(|e| {
            tracing::warn!("Ignoring unparsable config {}: {}", path.display(), e);
            AppConfig::default()
        }),
        Err(_) => AppConfig::default(),
    }
}

/// Loads the config from `<data_dir>/config.json`.
pub async fn load_config() -> AppConfig {
    match config_path() {
        Some(path) => load_config_from(&path).await,
        None => AppConfig::default(),
    }
}
