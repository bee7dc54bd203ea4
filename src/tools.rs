use crate::cmd;
use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);
const YTDLP_MIN_BYTES: u64 = 512 * 1024;

#[cfg(windows)]
const YTDLP_DOWNLOAD_URL: &str =
    "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp.exe";
#[cfg(target_os = "macos")]
const YTDLP_DOWNLOAD_URL: &str =
    "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp_macos";
#[cfg(not(any(windows, target_os = "macos")))]
const YTDLP_DOWNLOAD_URL: &str =
    "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp_linux";

#[derive(Debug, Clone, Serialize)]
pub struct FfmpegToolsStatus {
    pub installed: bool,
    pub available: bool,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub ffmpeg_version: Option<String>,
    pub ffprobe_version: Option<String>,
}

pub fn ffmpeg_tools_status(paths: &AppPaths) -> FfmpegToolsStatus {
    let ffmpeg_path = paths.ffmpeg_bin_path();
    let ffprobe_path = paths.ffprobe_bin_path();
    let installed = ffmpeg_path.exists() && ffprobe_path.exists();
    let ffmpeg_version = tool_version_first_line(paths.ffmpeg_cmd(), "-version");
    let ffprobe_version = tool_version_first_line(paths.ffprobe_cmd(), "-version");

    FfmpegToolsStatus {
        installed,
        available: ffmpeg_version.is_some(),
        ffmpeg_path: ffmpeg_path.to_string_lossy().to_string(),
        ffprobe_path: ffprobe_path.to_string_lossy().to_string(),
        ffmpeg_version,
        ffprobe_version,
    }
}

/// Downloads a static ffmpeg/ffprobe build into the tools directory.
pub fn install_ffmpeg_tools(paths: &AppPaths) -> Result<FfmpegToolsStatus> {
    paths.ensure_dirs()?;

    let destination = paths.ffmpeg_dir();
    std::fs::create_dir_all(&destination)?;

    let download_url = ffmpeg_sidecar::download::ffmpeg_download_url()
        .map_err(|e| EngineError::InstallFailed(e.to_string()))?;
    tracing::info!(url = download_url, "downloading ffmpeg");
    let archive_path =
        ffmpeg_sidecar::download::download_ffmpeg_package(download_url, &destination)
            .map_err(|e| EngineError::InstallFailed(e.to_string()))?;
    ffmpeg_sidecar::download::unpack_ffmpeg(&archive_path, &destination)
        .map_err(|e| EngineError::InstallFailed(e.to_string()))?;

    Ok(ffmpeg_tools_status(paths))
}

#[derive(Debug, Clone, Serialize)]
pub struct YtDlpToolsStatus {
    pub available: bool,
    pub bundled_installed: bool,
    pub bundled_path: String,
    pub ytdlp_path: String,
    pub ytdlp_version: Option<String>,
}

/// Bundled copy first, then whatever `yt-dlp` resolves to on PATH.
pub fn ytdlp_tools_status(paths: &AppPaths) -> YtDlpToolsStatus {
    let bundled = paths.ytdlp_bin_path();
    let bundled_installed = bundled.exists();

    let mut candidates: Vec<PathBuf> = Vec::new();
    if bundled_installed {
        candidates.push(bundled.clone());
    }
    candidates.push(PathBuf::from("yt-dlp"));

    let resolved = candidates.into_iter().find_map(|candidate| {
        tool_version_first_line(&candidate, "--version").map(|v| (candidate, v))
    });

    YtDlpToolsStatus {
        available: resolved.is_some(),
        bundled_installed,
        bundled_path: bundled.to_string_lossy().to_string(),
        ytdlp_path: resolved
            .as_ref()
            .map(|(p, _)| p.to_string_lossy().to_string())
            .unwrap_or_default(),
        ytdlp_version: resolved.map(|(_, v)| v),
    }
}

/// Fetches the latest standalone yt-dlp release for this platform.
pub fn install_ytdlp_tools(paths: &AppPaths) -> Result<YtDlpToolsStatus> {
    paths.ensure_dirs()?;

    let destination = paths.ytdlp_bin_path();
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = destination.with_extension("download");

    tracing::info!(url = YTDLP_DOWNLOAD_URL, "downloading yt-dlp");
    let resp = ureq::get(YTDLP_DOWNLOAD_URL)
        .call()
        .map_err(|e| EngineError::InstallFailed(format!("yt-dlp download failed: {e}")))?;
    let status = resp.status();
    if status.as_u16() >= 400 {
        return Err(EngineError::InstallFailed(format!(
            "yt-dlp download failed (status={status})"
        )));
    }

    {
        let mut reader = resp.into_body().into_reader();
        let mut file = std::fs::File::create(&tmp_path)?;
        std::io::copy(&mut reader, &mut file)?;
        file.flush()?;
    }

    let downloaded_size = std::fs::metadata(&tmp_path).map(|m| m.len()).unwrap_or(0);
    if downloaded_size < YTDLP_MIN_BYTES {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(EngineError::InstallFailed(
            "downloaded yt-dlp is unexpectedly small".to_string(),
        ));
    }

    if destination.exists() {
        let _ = std::fs::remove_file(&destination);
    }
    if std::fs::rename(&tmp_path, &destination).is_err() {
        std::fs::copy(&tmp_path, &destination)?;
        let _ = std::fs::remove_file(&tmp_path);
    }
    mark_executable(&destination)?;

    Ok(ytdlp_tools_status(paths))
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Both external tools, as checked before a download starts.
#[derive(Debug, Clone, Serialize)]
pub struct ToolsStatus {
    pub ytdlp: YtDlpToolsStatus,
    pub ffmpeg: FfmpegToolsStatus,
}

pub fn tools_status(paths: &AppPaths) -> ToolsStatus {
    ToolsStatus {
        ytdlp: ytdlp_tools_status(paths),
        ffmpeg: ffmpeg_tools_status(paths),
    }
}

/// Fails with [`EngineError::ToolNotFound`] when no runnable yt-dlp exists.
pub fn require_ytdlp(paths: &AppPaths) -> Result<YtDlpToolsStatus> {
    let status = ytdlp_tools_status(paths);
    if !status.available {
        return Err(EngineError::ToolNotFound {
            tool: "yt-dlp".to_string(),
        });
    }
    Ok(status)
}

fn tool_version_first_line(program: impl AsRef<std::ffi::OsStr>, arg: &str) -> Option<String> {
    let mut command = cmd::command(program);
    command.arg(arg);
    let output = cmd::output_with_timeout(&mut command, VERSION_TIMEOUT).ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let first = text.lines().next()?.trim();
    if first.is_empty() {
        return None;
    }
    Some(first.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tools_dir_reports_nothing_bundled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());

        let ffmpeg = ffmpeg_tools_status(&paths);
        assert!(!ffmpeg.installed);
        assert!(ffmpeg.ffmpeg_path.ends_with(if cfg!(windows) { "ffmpeg.exe" } else { "ffmpeg" }));

        let ytdlp = ytdlp_tools_status(&paths);
        assert!(!ytdlp.bundled_installed);
        assert_eq!(ytdlp.bundled_path, paths.ytdlp_bin_path().to_string_lossy());
    }

    #[cfg(unix)]
    #[test]
    fn bundled_ytdlp_wins_over_path() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        std::fs::create_dir_all(paths.ytdlp_dir()).expect("mkdir");
        let bin = paths.ytdlp_bin_path();
        std::fs::write(&bin, "#!/bin/sh\necho 2099.01.01\n").expect("write");
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let status = require_ytdlp(&paths).expect("available");
        assert!(status.bundled_installed);
        assert_eq!(status.ytdlp_version.as_deref(), Some("2099.01.01"));
        assert_eq!(status.ytdlp_path, bin.to_string_lossy());
    }

    #[cfg(unix)]
    #[test]
    fn mark_executable_sets_exec_bits() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("tool");
        std::fs::write(&file, b"x").expect("write");
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o644)).expect("chmod");
        mark_executable(&file).expect("mark");
        let mode = std::fs::metadata(&file).expect("meta").permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}
