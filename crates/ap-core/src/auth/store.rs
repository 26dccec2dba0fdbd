//! Durable storage for the device refresh token.
//!
//! The file store writes `<base>/device.json` with restricted permissions
//! (0600). Only the device token is persisted, never the access token.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// The persisted slot: which backend issued the token, and the token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDeviceToken {
    pub base_url: String,
    pub device_token: String,
}

/// One durable key-value slot for the device token.
pub trait DeviceTokenStore: Send + Sync {
    /// # Errors
    /// Returns an error if the slot exists but cannot be read.
    fn load(&self) -> Result<Option<StoredDeviceToken>>;

    /// # Errors
    /// Returns an error if the slot cannot be written.
    fn save(&self, token: &StoredDeviceToken) -> Result<()>;

    /// # Errors
    /// Returns an error if the slot cannot be removed.
    fn clear(&self) -> Result<()>;
}

/// File-backed store.
#[derive(Debug, Clone)]
pub struct FileDeviceTokenStore {
    path: PathBuf,
}

impl FileDeviceTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the default location under `AP_HOME`.
    pub fn default_location() -> Self {
        Self::new(crate::config::paths::device_token_path())
    }
}

impl DeviceTokenStore for FileDeviceTokenStore {
    fn load(&self) -> Result<Option<StoredDeviceToken>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read device token from {}", self.path.display()))?;
        let token = serde_json::from_str(&contents).with_context(|| {
            format!("Failed to parse device token from {}", self.path.display())
        })?;
        Ok(Some(token))
    }

    fn save(&self, token: &StoredDeviceToken) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let contents =
            serde_json::to_string_pretty(token).context("Failed to serialize device token")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&self.path)
                .with_context(|| format!("Failed to open {} for writing", self.path.display()))?;
            file.write_all(contents.as_bytes())
                .with_context(|| format!("Failed to write to {}", self.path.display()))?;
        }

        #[cfg(not(unix))]
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.path)
                .with_context(|| format!("Failed to open {} for writing", self.path.display()))?;
            file.write_all(contents.as_bytes())
                .with_context(|| format!("Failed to write to {}", self.path.display()))?;
        }

        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }
}

/// In-memory store. Counts `clear` calls so callers can assert on them.
#[derive(Debug, Default)]
pub struct MemoryDeviceTokenStore {
    slot: Mutex<Option<StoredDeviceToken>>,
    clears: AtomicUsize,
}

impl MemoryDeviceTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(base_url: &str, device_token: &str) -> Self {
        Self {
            slot: Mutex::new(Some(StoredDeviceToken {
                base_url: base_url.to_string(),
                device_token: device_token.to_string(),
            })),
            clears: AtomicUsize::new(0),
        }
    }

    pub fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> Option<StoredDeviceToken> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }
}

impl DeviceTokenStore for MemoryDeviceTokenStore {
    fn load(&self) -> Result<Option<StoredDeviceToken>> {
        Ok(self.current())
    }

    fn save(&self, token: &StoredDeviceToken) -> Result<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|e| anyhow::anyhow!("device token store poisoned: {e}"))?;
        *slot = Some(token.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        let mut slot = self
            .slot
            .lock()
            .map_err(|e| anyhow::anyhow!("device token store poisoned: {e}"))?;
        *slot = None;
        Ok(())
    }
}
