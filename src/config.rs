use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_FORMAT_SELECTION: &str = "Video • MP4 • 1080p";

/// Settings the download core reads. The settings UI owns writing them; the
/// core only ever receives a snapshot at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DownloaderSettings {
    /// Empty means "use the platform default download folder".
    pub download_dir: Option<PathBuf>,
    pub no_playlist: bool,
    pub skip_format_check: bool,
    pub background_format_check: bool,
    pub play_sound_alerts: bool,
    pub show_visual_alerts: bool,
    pub last_format_selection: String,
}

impl Default for DownloaderSettings {
    fn default() -> Self {
        Self {
            download_dir: None,
            no_playlist: true,
            skip_format_check: false,
            background_format_check: true,
            play_sound_alerts: true,
            show_visual_alerts: true,
            last_format_selection: DEFAULT_FORMAT_SELECTION.to_string(),
        }
    }
}

impl DownloaderSettings {
    pub fn effective_download_dir(&self, paths: &AppPaths) -> PathBuf {
        match &self.download_dir {
            Some(dir) if !dir.as_os_str().is_empty() => dir.clone(),
            _ => paths.default_download_dir(),
        }
    }
}

pub fn load_downloader_settings(paths: &AppPaths) -> Result<DownloaderSettings> {
    let path = paths.settings_path();
    if !path.exists() {
        return Ok(DownloaderSettings::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: DownloaderSettings = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::InvalidInput(format!(
            "failed to parse downloader settings at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    Ok(parsed)
}

pub fn save_downloader_settings(paths: &AppPaths, settings: &DownloaderSettings) -> Result<()> {
    let path = paths.settings_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}
