use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir().join("downloader_settings.json")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.base_dir.join("db")
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_dir().join("app.sqlite")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn download_logs_dir(&self) -> PathBuf {
        self.logs_dir().join("downloads")
    }

    pub fn engine_log_path(&self) -> PathBuf {
        self.logs_dir().join("engine.jsonl")
    }

    pub fn default_download_dir(&self) -> PathBuf {
        if let Some(home) = home_dir() {
            return home.join("Downloads");
        }
        self.base_dir.join("downloads")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.base_dir.join("tools")
    }

    pub fn ffmpeg_dir(&self) -> PathBuf {
        self.tools_dir().join("ffmpeg")
    }

    pub fn ytdlp_dir(&self) -> PathBuf {
        self.tools_dir().join("yt-dlp")
    }

    pub fn ffmpeg_bin_path(&self) -> PathBuf {
        exe_path(self.ffmpeg_dir().join("ffmpeg"))
    }

    pub fn ffprobe_bin_path(&self) -> PathBuf {
        exe_path(self.ffmpeg_dir().join("ffprobe"))
    }

    pub fn ytdlp_bin_path(&self) -> PathBuf {
        exe_path(self.ytdlp_dir().join("yt-dlp"))
    }

    pub fn ffmpeg_cmd(&self) -> PathBuf {
        bundled_or_path(self.ffmpeg_bin_path(), "ffmpeg")
    }

    pub fn ffprobe_cmd(&self) -> PathBuf {
        bundled_or_path(self.ffprobe_bin_path(), "ffprobe")
    }

    pub fn ytdlp_cmd(&self) -> PathBuf {
        bundled_or_path(self.ytdlp_bin_path(), "yt-dlp")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.db_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.download_logs_dir())?;
        std::fs::create_dir_all(self.tools_dir())?;
        Ok(())
    }
}

fn exe_path(mut path: PathBuf) -> PathBuf {
    if cfg!(windows) {
        path.set_extension("exe");
    }
    path
}

fn bundled_or_path(bundled: PathBuf, fallback: &str) -> PathBuf {
    if bundled.exists() {
        bundled
    } else {
        PathBuf::from(fallback)
    }
}

fn home_dir() -> Option<PathBuf> {
    let var = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
