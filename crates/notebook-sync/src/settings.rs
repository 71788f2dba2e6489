//! Client settings persistence.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/pup-notebooks/settings.json
//! - Linux: ~/.config/pup-notebooks/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\pup-notebooks\settings.json
//!
//! `PUP_SERVER_URL` and `PUP_AUTOSAVE_DELAY_MS` override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use log::warn;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Client settings. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the notebook server
    pub server_url: String,

    /// Path of the real-time WebSocket endpoint on the server
    pub ws_path: String,

    /// Quiet period before an autosave fires, in milliseconds
    pub autosave_delay_ms: u64,

    /// Delay before reconnecting a dropped connection, in milliseconds
    pub reconnect_delay_ms: u64,

    /// Upper bound on a completion round trip, in milliseconds
    pub completion_timeout_ms: u64,

    /// Identifier characters before the cursor that trigger completion
    pub completion_min_prefix: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8000".to_string(),
            ws_path: "/ws".to_string(),
            autosave_delay_ms: 200,
            reconnect_delay_ms: 3000,
            completion_timeout_ms: 2000,
            completion_min_prefix: 2,
        }
    }
}

impl Settings {
    pub fn autosave_delay(&self) -> Duration {
        Duration::from_millis(self.autosave_delay_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    /// Set one field by its file key. String fields take `value` verbatim,
    /// other fields parse it as JSON.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut fields = serde_json::to_value(&*self)?;
        let slot = fields
            .get_mut(key)
            .ok_or_else(|| anyhow!("Unknown setting {:?}", key))?;
        *slot = if slot.is_string() {
            serde_json::Value::String(value.to_string())
        } else {
            match serde_json::from_str(value) {
                Ok(parsed) => parsed,
                Err(_) => bail!("Invalid value {:?} for {}", value, key),
            }
        };
        *self = serde_json::from_value(fields)
            .map_err(|e| anyhow!("Invalid value {:?} for {}: {}", value, key, e))?;
        Ok(())
    }

    /// Apply `PUP_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("PUP_SERVER_URL") {
            if !url.trim().is_empty() {
                self.server_url = url.trim().to_string();
            }
        }
        if let Ok(delay) = std::env::var("PUP_AUTOSAVE_DELAY_MS") {
            match delay.trim().parse() {
                Ok(ms) => self.autosave_delay_ms = ms,
                Err(_) => warn!(
                    "[settings] Ignoring PUP_AUTOSAVE_DELAY_MS={:?}: not a number",
                    delay
                ),
            }
        }
        self
    }
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pup-notebooks")
        .join("settings.json")
}

/// Load settings from `path`, returning defaults if it is missing or corrupt.
pub fn load_settings_from(path: &Path) -> Settings {
    if !path.exists() {
        return Settings::default();
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("[settings] Corrupt settings at {:?}: {}", path, e);
                Settings::default()
            }
        },
        Err(e) => {
            warn!("[settings] Failed to read {:?}: {}", path, e);
            Settings::default()
        }
    }
}

/// Load settings from disk and apply environment overrides.
pub fn load_settings() -> Settings {
    load_settings_from(&settings_path()).with_env_overrides()
}

/// Save settings to `path`
pub fn save_settings_to(settings: &Settings, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

/// Save settings to disk
pub fn save_settings(settings: &Settings) -> Result<()> {
    save_settings_to(settings, &settings_path())
}

/// JSON schema of the settings file.
pub fn settings_schema() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(Settings)).unwrap_or_default()
}
