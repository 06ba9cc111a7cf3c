//! JSON persistence for engine settings.

use super::EngineSettings;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

fn config_dir() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sonograph")
}

#[derive(Debug)]
pub struct SettingsManager {
    path: PathBuf,
    pub data: EngineSettings,
}

impl SettingsManager {
    pub fn load_or_default() -> Self {
        Self::load_from(config_dir().join("settings.json"))
    }

    /// Loads from an explicit path, falling back to defaults on any error.
    pub fn load_from(path: PathBuf) -> Self {
        let data = fs::read_to_string(&path)
            .ok()
            .and_then(|s| {
                serde_json::from_str(&s)
                    .map_err(|e| warn!("[settings] parse error {path:?}: {e}"))
                    .ok()
            })
            .unwrap_or_default();
        Self { path, data }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.data
    }

    pub fn save(&self) -> Result<()> {
        save_to(&self.path, &self.data)
    }
}

fn save_to(path: &Path, data: &EngineSettings) -> Result<()> {
    let json = serde_json::to_string_pretty(data)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating settings dir {parent:?}"))?;
    }
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, &json).with_context(|| format!("writing {temp_path:?}"))?;
    fs::rename(&temp_path, path).with_context(|| format!("renaming into {path:?}"))?;
    Ok(())
}
