//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! the service base URL, timeouts, where the session is stored, the
//! redirect targets and the last used username.
//!
//! Configuration is stored at `~/.config/authgate/config.json`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::manager::{DEFAULT_LOGIN_PATH, DEFAULT_RENEWAL_TIMEOUT_SECS};
use crate::auth::{CredentialStore, FileBackend, KeyringBackend, MemoryBackend, SessionSettings, StorageBackend};
use crate::routes::guard::{DEFAULT_ADMIN_LANDING_PATH, DEFAULT_LANDING_PATH};
use crate::routes::LandingPages;

/// Application name used for config/data directory paths
const APP_NAME: &str = "authgate";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000/api/v1";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

pub const ENV_BASE_URL: &str = "AUTHGATE_BASE_URL";
pub const ENV_STORAGE: &str = "AUTHGATE_STORAGE";

/// Where the session survives between runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    Keyring,
    /// Nothing survives the process
    Memory,
}

impl FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(StorageKind::File),
            "keyring" => Ok(StorageKind::Keyring),
            "memory" => Ok(StorageKind::Memory),
            other => anyhow::bail!("Unknown storage kind '{}' (expected file, keyring or memory)", other),
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageKind::File => "file",
            StorageKind::Keyring => "keyring",
            StorageKind::Memory => "memory",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub renewal_timeout_secs: u64,
    pub storage: StorageKind,
    pub login_path: String,
    pub landing_path: String,
    pub admin_landing_path: String,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            renewal_timeout_secs: DEFAULT_RENEWAL_TIMEOUT_SECS,
            storage: StorageKind::default(),
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            landing_path: DEFAULT_LANDING_PATH.to_string(),
            admin_landing_path: DEFAULT_ADMIN_LANDING_PATH.to_string(),
            last_username: None,
        }
    }
}

impl Config {
    /// Load from the standard location, then apply environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)?.with_overrides(|key| std::env::var(key).ok())
    }

    /// Load from a specific file. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Invalid config file {}", path.display()))
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Apply `AUTHGATE_*` overrides using the given variable lookup.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(url) = lookup(ENV_BASE_URL).filter(|v| !v.trim().is_empty()) {
            self.base_url = url.trim().to_string();
        }
        if let Some(kind) = lookup(ENV_STORAGE).filter(|v| !v.trim().is_empty()) {
            self.storage = kind
                .parse()
                .with_context(|| format!("Invalid {}", ENV_STORAGE))?;
        }
        Ok(self)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            renewal_timeout: Duration::from_secs(self.renewal_timeout_secs),
            login_path: self.login_path.clone(),
        }
    }

    pub fn landing_pages(&self) -> LandingPages {
        LandingPages {
            login: self.login_path.clone(),
            landing: self.landing_path.clone(),
            admin_landing: self.admin_landing_path.clone(),
        }
    }

    pub fn storage_backend(&self) -> Result<Box<dyn StorageBackend>> {
        Ok(match self.storage {
            StorageKind::File => Box::new(FileBackend::new(&self.data_dir()?)),
            StorageKind::Keyring => Box::new(KeyringBackend::new()),
            StorageKind::Memory => Box::new(MemoryBackend::new()),
        })
    }

    pub fn credential_store(&self) -> Result<CredentialStore> {
        Ok(CredentialStore::new(self.storage_backend()?))
    }
}
