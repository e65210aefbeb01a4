use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::exchange::DEFAULT_BLOCK_SIZE;

const SETTINGS_FILE_NAME: &str = "settings.json";
const CONFIG_DIR_NAME: &str = "vox-relay";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// WebSocket URL of the speech recognizer.
    pub recognizer_url: String,

    /// Base URL of the transcript storage backend.
    pub backend_url: String,

    /// Samples accumulated before a block is handed to the streamer.
    pub block_size: usize,

    /// Capture sample rate the recognizer expects, in Hz.
    pub sample_rate: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            recognizer_url: "ws://localhost:8000/api/stt".to_string(),
            backend_url: "http://localhost:8000".to_string(),
            block_size: DEFAULT_BLOCK_SIZE,
            sample_rate: 8000,
        }
    }
}

impl Settings {
    /// A zero block size would make the exchange spin on empty hand-offs;
    /// fall back to the default instead of propagating it.
    pub fn effective_block_size(&self) -> usize {
        if self.block_size == 0 {
            log::warn!(
                "Settings: block_size 0 is invalid, using {}",
                DEFAULT_BLOCK_SIZE
            );
            DEFAULT_BLOCK_SIZE
        } else {
            self.block_size
        }
    }

    /// Overlay `VOX_RELAY_*` environment variables (loaded from `.env` if
    /// present) on top of whatever was read from disk.
    pub fn apply_env_overrides(&mut self) {
        let _ = dotenvy::dotenv();

        if let Ok(url) = std::env::var("VOX_RELAY_RECOGNIZER_URL") {
            if !url.is_empty() {
                self.recognizer_url = url;
            }
        }
        if let Ok(url) = std::env::var("VOX_RELAY_BACKEND_URL") {
            if !url.is_empty() {
                self.backend_url = url;
            }
        }
        if let Ok(raw) = std::env::var("VOX_RELAY_BLOCK_SIZE") {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => self.block_size = n,
                _ => log::warn!("Settings: ignoring invalid VOX_RELAY_BLOCK_SIZE {:?}", raw),
            }
        }
    }
}

fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(CONFIG_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings() -> Settings {
    let path = match settings_path() {
        Ok(p) => p,
        Err(e) => {
            log::warn!("Settings: {}", e);
            return Settings::default();
        }
    };
    load_settings_from(&path)
}

pub fn load_settings_from(path: &Path) -> Settings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<Settings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                Settings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            Settings::default()
        }
    }
}

pub fn save_settings(settings: &Settings) -> Result<(), String> {
    let path = settings_path()?;
    save_settings_to(&path, settings)
}

pub fn save_settings_to(path: &Path, settings: &Settings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write atomically: write to a temp file in the same directory, then rename.
    // This prevents partial/corrupt settings.json if the process dies mid-write.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // On Unix, rename will atomically replace the destination. On Windows, rename
    // fails if the destination exists, so we remove it first (ignoring NotFound).
    if cfg!(windows) {
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(format!("Remove existing settings file {:?}: {}", path, e));
                }
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}
