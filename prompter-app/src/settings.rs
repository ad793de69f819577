//! Persistent host settings (JSON file in the platform data directory).

use std::fs;
use std::path::{Path, PathBuf};

use prompter_core::EngineConfig;
use serde::{Deserialize, Serialize};

/// Environment override for the websocket endpoint.
pub const SERVER_URL_ENV: &str = "PROMPTER_SERVER_URL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub engine: EngineConfig,
    /// Log interim transcripts at `info` instead of `debug`.
    pub echo_interim: bool,
    /// Connect to the server as soon as the host starts.
    pub auto_connect: bool,
    /// Start listening right after connecting.
    pub auto_start: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            echo_interim: false,
            auto_connect: true,
            auto_start: false,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.engine.normalize();
        if self.auto_start && !self.auto_connect {
            // Listening without a connection only fills the turn buffer.
            self.auto_connect = true;
        }
    }

    /// Apply `PROMPTER_SERVER_URL` when set and non-blank.
    pub fn apply_env_overrides(&mut self) {
        if let Some(url) = std::env::var(SERVER_URL_ENV)
            .ok()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
        {
            self.engine.transport.url = url;
        }
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Prompter")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("prompter")
            .join("settings.json")
    }
}

/// Missing or unreadable files fall back to defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<AppSettings>(&raw).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), "ignoring malformed settings: {e}");
            AppSettings::default()
        }),
        Err(_) => AppSettings::default(),
    };
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
