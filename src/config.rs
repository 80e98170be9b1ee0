//! Settings surface
//!
//! JSON-file-backed settings with defaults matching the product surface:
//! publisher enable flags and ports, auto-connect/auto-reconnect/history
//! toggles, the favorite device, and the scan timeout. `SettingsStore`
//! publishes every change on a watch channel so the service layer can
//! reconcile the publishers without polling.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::ble::transport::DeviceId;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Enable flag and port for one network publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub enabled: bool,
    pub port: u16,
}

impl ServerConfig {
    pub fn disabled(port: u16) -> Self {
        Self {
            enabled: false,
            port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// HTTP snapshot responder.
    pub http: ServerConfig,
    /// WebSocket pusher.
    pub websocket: ServerConfig,
    /// Retry the last device after an unexpected disconnect.
    pub auto_reconnect_enabled: bool,
    /// Scan for the favorite device on startup.
    pub auto_connect_enabled: bool,
    /// Record sessions to the history store.
    pub history_recording_enabled: bool,
    /// The favorite device, used by startup auto-connect.
    pub favorite_device: Option<DeviceId>,
    /// Device discovery window, in seconds.
    pub scan_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http: ServerConfig::disabled(8000),
            websocket: ServerConfig::disabled(8001),
            auto_reconnect_enabled: true,
            auto_connect_enabled: false,
            history_recording_enabled: false,
            favorite_device: None,
            scan_timeout_secs: 15,
        }
    }
}

impl Settings {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }
}

/// Shared settings holder: reads go through a lock, writes persist to disk
/// and notify watchers.
pub struct SettingsStore {
    path: Option<PathBuf>,
    current: RwLock<Settings>,
    tx: watch::Sender<Settings>,
}

impl SettingsStore {
    /// Load settings from `path`, falling back to defaults when the file
    /// does not exist yet.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let settings = if path.exists() {
            let text = fs::read_to_string(&path)?;
            serde_json::from_str(&text)?
        } else {
            Settings::default()
        };
        let (tx, _) = watch::channel(settings.clone());
        Ok(Self {
            path: Some(path),
            current: RwLock::new(settings),
            tx,
        })
    }

    /// An in-memory store that never touches disk.
    pub fn ephemeral(settings: Settings) -> Self {
        let (tx, _) = watch::channel(settings.clone());
        Self {
            path: None,
            current: RwLock::new(settings),
            tx,
        }
    }

    pub fn get(&self) -> Settings {
        self.current.read().unwrap().clone()
    }

    /// Watch for settings changes. The value at subscribe time counts as
    /// seen; `changed()` resolves on the next update.
    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }

    /// Apply a mutation, persist it, and notify watchers.
    pub fn update(&self, mutate: impl FnOnce(&mut Settings)) -> Result<(), ConfigError> {
        let updated = {
            let mut current = self.current.write().unwrap();
            mutate(&mut current);
            current.clone()
        };
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, serde_json::to_vec_pretty(&updated)?)?;
        }
        self.tx.send_replace(updated);
        Ok(())
    }
}
