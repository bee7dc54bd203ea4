//! Quality presets and their mapping onto download-tool format selectors.
//!
//! Every preset resolves to a selector whose last alternative is a bare
//! `best`, so the download tool can always pick *something* playable.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

pub const VIDEO_TIERS: [u32; 5] = [2160, 1440, 1080, 720, 480];
pub const MP3_BITRATES: [u32; 7] = [320, 256, 192, 160, 128, 96, 64];

/// Bitrate the tool is asked for when a preset says "best".
const BEST_AUDIO_KBPS: u32 = 192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    Mp3,
    M4a,
    Ogg,
    Wma,
}

impl AudioFormat {
    fn id(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::M4a => "m4a",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Wma => "wma",
        }
    }

    fn label(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "MP3",
            AudioFormat::M4a => "M4A",
            AudioFormat::Ogg => "OGG",
            AudioFormat::Wma => "WMA",
        }
    }

    /// Value passed to `--audio-format`.
    fn tool_format(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::M4a => "m4a",
            AudioFormat::Ogg => "vorbis",
            AudioFormat::Wma => "wma",
        }
    }

    /// Explicit encoder so the tool never falls back to its own default.
    fn codec(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "libmp3lame",
            AudioFormat::M4a => "aac",
            AudioFormat::Ogg => "libvorbis",
            AudioFormat::Wma => "wmav2",
        }
    }

    fn selector(self) -> &'static str {
        match self {
            AudioFormat::M4a => "bestaudio[ext=m4a]/bestaudio/best",
            _ => "bestaudio/best",
        }
    }

    fn from_id(value: &str) -> Option<Self> {
        match value {
            "mp3" => Some(AudioFormat::Mp3),
            "m4a" => Some(AudioFormat::M4a),
            "ogg" => Some(AudioFormat::Ogg),
            "wma" => Some(AudioFormat::Wma),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioBitrate {
    Kbps(u32),
    Best,
}

impl AudioBitrate {
    pub fn kbps(self) -> u32 {
        match self {
            AudioBitrate::Kbps(k) => k,
            AudioBitrate::Best => BEST_AUDIO_KBPS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QualityPreset {
    Video { max_height: u32 },
    Audio { format: AudioFormat, bitrate: AudioBitrate },
}

/// Output of [`resolve`]: everything the worker needs to build the tool's
/// command line for one preset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFormat {
    pub selector: String,
    pub post_args: Vec<String>,
    pub expected_extension: &'static str,
    pub merge_output_format: Option<&'static str>,
}

const DEFAULT_SELECTOR: &str = "best[ext=mp4]/best";

impl QualityPreset {
    /// The fixed, user-selectable presets in display order.
    pub fn all() -> Vec<QualityPreset> {
        let mut out: Vec<QualityPreset> = VIDEO_TIERS
            .iter()
            .map(|&h| QualityPreset::Video { max_height: h })
            .collect();
        out.extend(MP3_BITRATES.iter().map(|&k| QualityPreset::Audio {
            format: AudioFormat::Mp3,
            bitrate: AudioBitrate::Kbps(k),
        }));
        for format in [AudioFormat::M4a, AudioFormat::Ogg, AudioFormat::Wma] {
            out.push(QualityPreset::Audio {
                format,
                bitrate: AudioBitrate::Kbps(320),
            });
            out.push(QualityPreset::Audio {
                format,
                bitrate: AudioBitrate::Best,
            });
        }
        out
    }

    /// Parses ids such as `video_1080`, `mp3_320` or `ogg_best`.
    pub fn from_id(id: &str) -> Option<Self> {
        let (kind, value) = id.trim().split_once('_')?;
        if kind == "video" {
            let max_height: u32 = value.parse().ok()?;
            if max_height == 0 {
                return None;
            }
            return Some(QualityPreset::Video { max_height });
        }
        let format = AudioFormat::from_id(kind)?;
        let bitrate = if value == "best" {
            if format == AudioFormat::Mp3 {
                return None;
            }
            AudioBitrate::Best
        } else {
            let kbps: u32 = value.parse().ok()?;
            if kbps == 0 {
                return None;
            }
            AudioBitrate::Kbps(kbps)
        };
        Some(QualityPreset::Audio { format, bitrate })
    }

    pub fn id(&self) -> String {
        match self {
            QualityPreset::Video { max_height } => format!("video_{max_height}"),
            QualityPreset::Audio {
                format,
                bitrate: AudioBitrate::Best,
            } => format!("{}_best", format.id()),
            QualityPreset::Audio {
                format,
                bitrate: AudioBitrate::Kbps(k),
            } => format!("{}_{k}", format.id()),
        }
    }

    pub fn label(&self) -> String {
        match self {
            QualityPreset::Video { max_height } => {
                format!("Video • MP4 • {}", video_tier_name(*max_height))
            }
            QualityPreset::Audio { format, bitrate } => {
                format!("Audio • {} • {} kbps", format.label(), bitrate.kbps())
            }
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim();
        Self::all().into_iter().find(|p| p.label() == label)
    }

    pub fn is_video(&self) -> bool {
        matches!(self, QualityPreset::Video { .. })
    }

    pub fn video_height(&self) -> Option<u32> {
        match self {
            QualityPreset::Video { max_height } => Some(*max_height),
            QualityPreset::Audio { .. } => None,
        }
    }

    pub fn expected_extension(&self) -> &'static str {
        match self {
            QualityPreset::Video { .. } => "mp4",
            QualityPreset::Audio { format, .. } => format.id(),
        }
    }

    pub fn resolve(&self) -> ResolvedFormat {
        match self {
            QualityPreset::Video { max_height } => ResolvedFormat {
                selector: video_selector(*max_height),
                post_args: Vec::new(),
                expected_extension: "mp4",
                merge_output_format: Some("mp4"),
            },
            QualityPreset::Audio { format, bitrate } => ResolvedFormat {
                selector: format.selector().to_string(),
                post_args: vec![
                    "--extract-audio".to_string(),
                    "--audio-format".to_string(),
                    format.tool_format().to_string(),
                    "--audio-quality".to_string(),
                    format!("{}k", bitrate.kbps()),
                    "--prefer-ffmpeg".to_string(),
                    "--postprocessor-args".to_string(),
                    format!("ffmpeg:-acodec {}", format.codec()),
                ],
                expected_extension: format.id(),
                merge_output_format: None,
            },
        }
    }
}

impl fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Resolves a preset id, falling back to a best-effort MP4 selector for
/// unknown or empty ids.
pub fn resolve(preset_id: &str) -> ResolvedFormat {
    match QualityPreset::from_id(preset_id) {
        Some(preset) => preset.resolve(),
        None => default_format(),
    }
}

pub fn default_format() -> ResolvedFormat {
    ResolvedFormat {
        selector: DEFAULT_SELECTOR.to_string(),
        post_args: Vec::new(),
        expected_extension: "mp4",
        merge_output_format: None,
    }
}

fn video_selector(height: u32) -> String {
    format!(
        "bestvideo[height<={height}][ext=mp4]+bestaudio[ext=m4a]\
         /bestvideo[height<={height}]+bestaudio\
         /best[height<={height}][ext=mp4]\
         /best[height<={height}]\
         /best[ext=mp4]\
         /best"
    )
}

fn video_tier_name(height: u32) -> String {
    match height {
        2160 => "4K".to_string(),
        1440 => "2K".to_string(),
        h => format!("{h}p"),
    }
}

/// Pulls a `<N>p` / `4K` / `2K` resolution out of a display label.
pub fn height_from_label(label: &str) -> Option<u32> {
    for part in label.split('•') {
        let part = part.trim();
        match part {
            "4K" => return Some(2160),
            "2K" => return Some(1440),
            _ => {}
        }
        if let Some(num) = part.strip_suffix('p') {
            if let Ok(h) = num.parse::<u32>() {
                return Some(h);
            }
        }
    }
    height_re().captures(label)?.get(1)?.as_str().parse().ok()
}

fn height_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)p").unwrap())
}
