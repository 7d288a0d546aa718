//! Persisted user settings and the stores that hold them

use crate::errors::{RelayError, Result};
use crate::profile::{ServerProfile, is_absolute_url, normalize_base_url};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};

const CHANGE_CHANNEL_CAPACITY: usize = 16;

/// Persisted configuration, stored as one JSON object with camelCase keys
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub server_url: String,
    pub credential: String,
    pub ask_for_keyword: bool,
    pub auto_copy: bool,
    pub language: String,
    pub enable_additional_server: bool,
    pub additional_server_url: String,
    pub additional_credential: String,
    pub additional_server_name: String,
    pub auto_save_settings: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            credential: String::new(),
            ask_for_keyword: false,
            auto_copy: false,
            language: "en".to_string(),
            enable_additional_server: false,
            additional_server_url: String::new(),
            additional_credential: String::new(),
            additional_server_name: String::new(),
            auto_save_settings: true,
        }
    }
}

impl Settings {
    pub const KEYS: [&'static str; 10] = [
        "serverUrl",
        "credential",
        "askForKeyword",
        "autoCopy",
        "language",
        "enableAdditionalServer",
        "additionalServerUrl",
        "additionalCredential",
        "additionalServerName",
        "autoSaveSettings",
    ];

    pub fn primary_profile(&self) -> ServerProfile {
        ServerProfile::primary(&self.server_url, &self.credential)
    }

    pub fn additional_profile(&self) -> ServerProfile {
        ServerProfile::additional(
            &self.additional_server_url,
            &self.additional_credential,
            &self.additional_server_name,
        )
    }

    /// Trim and normalize every field, rejecting an unusable configuration.
    pub fn validated(&self) -> Result<Settings> {
        let mut clean = self.clone();

        clean.server_url = normalize_base_url(&self.server_url);
        clean.credential = self.credential.trim().to_string();
        clean.language = self.language.trim().to_string();
        clean.additional_server_url = normalize_base_url(&self.additional_server_url);
        clean.additional_credential = self.additional_credential.trim().to_string();
        clean.additional_server_name = self.additional_server_name.trim().to_string();

        if clean.server_url.is_empty() {
            return Err(RelayError::Configuration("server URL is required".to_string()));
        }
        if !is_absolute_url(&clean.server_url) {
            return Err(RelayError::Configuration(format!(
                "server URL '{}' is not an absolute URL",
                clean.server_url
            )));
        }
        if clean.credential.is_empty() {
            return Err(RelayError::Configuration("API signature is required".to_string()));
        }

        if clean.enable_additional_server {
            if clean.additional_server_name.is_empty() {
                return Err(RelayError::Configuration(
                    "additional server name is required".to_string(),
                ));
            }
            if clean.additional_server_url.is_empty() {
                return Err(RelayError::Configuration(
                    "additional server URL is required".to_string(),
                ));
            }
            if !is_absolute_url(&clean.additional_server_url) {
                return Err(RelayError::Configuration(format!(
                    "additional server URL '{}' is not an absolute URL",
                    clean.additional_server_url
                )));
            }
            if clean.additional_credential.is_empty() {
                return Err(RelayError::Configuration(
                    "additional server signature is required".to_string(),
                ));
            }
        }

        if clean.language.is_empty() {
            clean.language = Settings::default().language;
        }

        Ok(clean)
    }

    /// Keys whose values differ between `self` and `other`
    pub fn changed_keys(&self, other: &Settings) -> Vec<&'static str> {
        let (before, after) = match (serde_json::to_value(self), serde_json::to_value(other)) {
            (Ok(before), Ok(after)) => (before, after),
            _ => return Settings::KEYS.to_vec(),
        };

        Settings::KEYS
            .iter()
            .copied()
            .filter(|key| before.get(*key) != after.get(*key))
            .collect()
    }

    /// Set a single field by its persisted key name.
    pub fn set_field(&mut self, key: &str, value: &str) -> Result<()> {
        let parse_bool = |value: &str| -> Result<bool> {
            match value.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                other => Err(RelayError::InvalidInput(format!(
                    "'{}' is not a boolean for {}",
                    other, key
                ))),
            }
        };

        match key {
            "serverUrl" => self.server_url = value.to_string(),
            "credential" => self.credential = value.to_string(),
            "askForKeyword" => self.ask_for_keyword = parse_bool(value)?,
            "autoCopy" => self.auto_copy = parse_bool(value)?,
            "language" => self.language = value.to_string(),
            "enableAdditionalServer" => self.enable_additional_server = parse_bool(value)?,
            "additionalServerUrl" => self.additional_server_url = value.to_string(),
            "additionalCredential" => self.additional_credential = value.to_string(),
            "additionalServerName" => self.additional_server_name = value.to_string(),
            "autoSaveSettings" => self.auto_save_settings = parse_bool(value)?,
            unknown => {
                return Err(RelayError::InvalidInput(format!(
                    "unknown settings key '{}'",
                    unknown
                )));
            }
        }

        Ok(())
    }

    /// Copy with credentials masked, for display
    pub fn redacted(&self) -> Settings {
        let mask = |secret: &str| {
            if secret.is_empty() {
                String::new()
            } else {
                "********".to_string()
            }
        };

        Settings {
            credential: mask(&self.credential),
            additional_credential: mask(&self.additional_credential),
            ..self.clone()
        }
    }
}

/// Notification sent to subscribers after a save that changed something
#[derive(Clone, Debug)]
pub struct SettingsChange {
    pub changed_keys: Vec<&'static str>,
    pub settings: Settings,
}

/// Asynchronous key-value settings storage shared by every component
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Read the current settings snapshot.
    async fn load(&self) -> Result<Settings>;

    /// Replace the stored settings as a whole.
    async fn save(&self, settings: &Settings) -> Result<()>;

    /// Receive a notification for every effective change.
    fn subscribe(&self) -> broadcast::Receiver<SettingsChange>;
}

/// Settings persisted as a JSON file
#[derive(Debug)]
pub struct FileSettingsStore {
    path: PathBuf,
    changes: broadcast::Sender<SettingsChange>,
    write_lock: Mutex<()>,
}

impl FileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            path: path.into(),
            changes,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<Option<Settings>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SettingsStore for FileSettingsStore {
    async fn load(&self) -> Result<Settings> {
        match self.read_file().await {
            Ok(Some(settings)) => Ok(settings),
            Ok(None) => {
                debug!("No settings file at {}, using defaults", self.path.display());
                Ok(Settings::default())
            }
            Err(e) => {
                warn!(
                    "Could not read settings from {}, treating as unset: {}",
                    self.path.display(),
                    e
                );
                Ok(Settings::default())
            }
        }
    }

    async fn save(&self, settings: &Settings) -> Result<()> {
        // Held across read, write and rename so concurrent saves apply in turn
        let _guard = self.write_lock.lock().await;
        let previous = self.load().await?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let staging = self
            .path
            .with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        let json = serde_json::to_vec_pretty(settings)?;
        tokio::fs::write(&staging, json).await?;
        tokio::fs::rename(&staging, &self.path).await?;

        let changed_keys = previous.changed_keys(settings);
        info!(
            "Saved settings to {} ({} keys changed)",
            self.path.display(),
            changed_keys.len()
        );

        if !changed_keys.is_empty() {
            // No subscribers is not an error
            let _ = self.changes.send(SettingsChange {
                changed_keys,
                settings: settings.clone(),
            });
        }

        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SettingsChange> {
        self.changes.subscribe()
    }
}

/// In-memory settings, for tests and embedding
#[derive(Debug)]
pub struct MemorySettingsStore {
    settings: RwLock<Settings>,
    changes: broadcast::Sender<SettingsChange>,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            settings: RwLock::new(settings),
            changes,
        }
    }
}

impl Default for MemorySettingsStore {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn load(&self) -> Result<Settings> {
        Ok(self.settings.read().await.clone())
    }

    async fn save(&self, settings: &Settings) -> Result<()> {
        let mut current = self.settings.write().await;
        let changed_keys = current.changed_keys(settings);
        *current = settings.clone();
        drop(current);

        if !changed_keys.is_empty() {
            let _ = self.changes.send(SettingsChange {
                changed_keys,
                settings: settings.clone(),
            });
        }

        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SettingsChange> {
        self.changes.subscribe()
    }
}
