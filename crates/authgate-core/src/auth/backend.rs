//! Pluggable key/value backings for the credential store.
//!
//! Every backend reads and writes the whole map in one operation, so a
//! save or clear is never observable half-done.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use keyring::Entry;
use thiserror::Error;
use tracing::debug;

/// Key/value map as persisted by a backend.
pub type StoredMap = BTreeMap<String, String>;

/// Service name used for keyring storage
const KEYRING_SERVICE: &str = "authgate";

/// Keyring account holding the serialized map
const KEYRING_USER: &str = "session";

/// Session file name in the data directory
const SESSION_FILE: &str = "session.json";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Stored session is corrupt: {0}")]
    Corrupt(String),
}

pub trait StorageBackend: Send + Sync {
    /// Read the complete map. A missing store reads as empty.
    fn read(&self) -> Result<StoredMap, StoreError>;

    /// Replace the complete map.
    fn write(&self, entries: &StoredMap) -> Result<(), StoreError>;
}

// ============================================================================
// In-memory
// ============================================================================

/// Non-durable backend for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<StoredMap>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate the backend, e.g. to simulate a previous run.
    pub fn with_entries(entries: StoredMap) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn read(&self) -> Result<StoredMap, StoreError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Unavailable("memory backend poisoned".to_string()))?;
        Ok(entries.clone())
    }

    fn write(&self, entries: &StoredMap) -> Result<(), StoreError> {
        let mut current = self
            .entries
            .lock()
            .map_err(|_| StoreError::Unavailable("memory backend poisoned".to_string()))?;
        *current = entries.clone();
        Ok(())
    }
}

// ============================================================================
// File
// ============================================================================

/// JSON map in a single file, replaced atomically via rename.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(SESSION_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unavailable(context: &str, e: std::io::Error) -> StoreError {
        StoreError::Unavailable(format!("{}: {}", context, e))
    }
}

impl StorageBackend for FileBackend {
    fn read(&self) -> Result<StoredMap, StoreError> {
        if !self.path.exists() {
            return Ok(StoredMap::new());
        }
        let contents = fs::read_to_string(&self.path)
            .map_err(|e| Self::unavailable("Failed to read session file", e))?;
        serde_json::from_str(&contents).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    fn write(&self, entries: &StoredMap) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Self::unavailable("Failed to create data directory", e))?;
        }
        let contents = serde_json::to_string_pretty(entries)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let tmp_path = self.path.with_extension("json.tmp");
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600); // Owner read/write only
        }
        let mut file = options
            .open(&tmp_path)
            .map_err(|e| Self::unavailable("Failed to create session file", e))?;
        file.write_all(contents.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| Self::unavailable("Failed to write session file", e))?;
        fs::rename(&tmp_path, &self.path)
            .map_err(|e| Self::unavailable("Failed to replace session file", e))?;

        debug!(path = ?self.path, "Session file written");
        Ok(())
    }
}

// ============================================================================
// Keyring
// ============================================================================

/// Whole map serialized into one OS keychain entry.
pub struct KeyringBackend {
    service: String,
}

impl KeyringBackend {
    pub fn new() -> Self {
        Self {
            service: KEYRING_SERVICE.to_string(),
        }
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self) -> Result<Entry, StoreError> {
        Entry::new(&self.service, KEYRING_USER)
            .map_err(|e| StoreError::Unavailable(format!("Failed to create keyring entry: {}", e)))
    }
}

impl Default for KeyringBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for KeyringBackend {
    fn read(&self) -> Result<StoredMap, StoreError> {
        match self.entry()?.get_password() {
            Ok(json) => serde_json::from_str(&json).map_err(|e| StoreError::Corrupt(e.to_string())),
            Err(keyring::Error::NoEntry) => Ok(StoredMap::new()),
            Err(e) => Err(StoreError::Unavailable(format!(
                "Failed to read from keychain: {}",
                e
            ))),
        }
    }

    fn write(&self, entries: &StoredMap) -> Result<(), StoreError> {
        let entry = self.entry()?;
        if entries.is_empty() {
            return match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(StoreError::Unavailable(format!(
                    "Failed to delete keychain entry: {}",
                    e
                ))),
            };
        }
        let json = serde_json::to_string(entries).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        entry
            .set_password(&json)
            .map_err(|e| StoreError::Unavailable(format!("Failed to store in keychain: {}", e)))
    }
}
