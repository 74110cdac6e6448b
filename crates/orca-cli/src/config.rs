//! Configuration file management for orca.
//!
//! Provides a TOML config file at `~/.config/orca/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use orca_core::settings::Settings;
use orca_core::sync::SyncConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub tracker: TrackerSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub log: LogSection,
    #[serde(default)]
    pub agent: AgentSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TrackerSection {
    /// Linear API key.
    pub api_key: Option<String>,
    /// Shared secret for webhook signature verification.
    pub webhook_secret: Option<String>,
    /// Projects to sync.
    #[serde(default)]
    pub project_ids: Vec<String>,
    /// project id -> repository root.
    #[serde(default)]
    pub project_repos: HashMap<String, PathBuf>,
    /// Fallback repository for unmapped projects.
    pub default_repo: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 4400,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StoreSection {
    /// Path to the SQLite store file.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogSection {
    /// Path of the rolling system log.
    pub path: Option<PathBuf>,
    /// Rotate to `<path>.1` past this size.
    pub max_size_bytes: u64,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            path: None,
            max_size_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentSection {
    pub executable: String,
    pub max_turns: u32,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            executable: "claude".to_string(),
            max_turns: 50,
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// The orca config directory, always in XDG layout:
/// `$XDG_CONFIG_HOME/orca` or `~/.config/orca`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("orca");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("orca")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix (the API key lives in it).
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for the serve loop.
#[derive(Debug)]
pub struct OrcaConfig {
    pub api_key: String,
    pub webhook_secret: String,
    pub sync: SyncConfig,
    pub settings: Settings,
    pub store_path: PathBuf,
    pub log_path: PathBuf,
    pub log_max_size_bytes: u64,
    pub bind: String,
    pub port: u16,
}

impl OrcaConfig {
    /// Resolve configuration: CLI flag > env var > config file > default.
    ///
    /// - API key: `ORCA_API_KEY` env > `tracker.api_key` > error
    /// - Webhook secret: `ORCA_WEBHOOK_SECRET` env > `tracker.webhook_secret` > error
    /// - Store path: `cli_store_path` > `ORCA_STORE_PATH` env > `store.path` > `~/.local/share/orca/orca.db`
    pub fn resolve(cli_store_path: Option<&str>, cli_port: Option<u16>) -> Result<Self> {
        let file = load_config().unwrap_or_default();

        let api_key = if let Ok(key) = std::env::var("ORCA_API_KEY") {
            key
        } else if let Some(key) = file.tracker.api_key.clone() {
            key
        } else {
            bail!("tracker API key not found; set ORCA_API_KEY or run `orca init`");
        };

        let webhook_secret = if let Ok(secret) = std::env::var("ORCA_WEBHOOK_SECRET") {
            secret
        } else if let Some(secret) = file.tracker.webhook_secret.clone() {
            secret
        } else {
            bail!("webhook secret not found; set ORCA_WEBHOOK_SECRET or run `orca init`");
        };

        let store_path = if let Some(path) = cli_store_path {
            PathBuf::from(path)
        } else if let Ok(path) = std::env::var("ORCA_STORE_PATH") {
            PathBuf::from(path)
        } else if let Some(path) = file.store.path.clone() {
            path
        } else {
            default_data_dir().join("orca.db")
        };

        let log_path = file
            .log
            .path
            .clone()
            .unwrap_or_else(|| default_data_dir().join("orca.log"));

        let settings = Settings {
            agent_executable: file.agent.executable.clone(),
            max_turns: file.agent.max_turns,
            ..Default::default()
        };

        Ok(Self {
            api_key,
            webhook_secret,
            sync: SyncConfig {
                project_ids: file.tracker.project_ids.clone(),
                project_repos: file.tracker.project_repos.clone(),
                default_repo: file.tracker.default_repo.clone(),
            },
            settings,
            store_path,
            log_path,
            log_max_size_bytes: file.log.max_size_bytes,
            bind: file.server.bind.clone(),
            port: cli_port.unwrap_or(file.server.port),
        })
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("orca")
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
