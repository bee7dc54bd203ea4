use crate::cmd::{self, CommandRunError};
use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

const TRANSCODE_TICK_MS: u64 = 100;
const TRANSCODE_CRAWL_START: u8 = 10;
const TRANSCODE_CRAWL_CEIL: u8 = 90;
const TRANSCODE_PULSE_CEIL: u8 = 95;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaProbe {
    pub duration_ms: Option<i64>,
    pub container: Option<String>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub bit_rate: Option<u64>,
    pub sample_rate: Option<u32>,
    pub title: Option<String>,
}

/// Display-ready summary for the converter's file panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub title: String,
    pub extension: String,
    pub bitrate_kbps: Option<u64>,
    pub sample_rate_hz: Option<u32>,
    pub duration: Option<String>,
}

pub fn probe(paths: &AppPaths, input: &Path) -> Result<MediaProbe> {
    let output = cmd::command(paths.ffprobe_cmd())
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(input)
        .output()
        .map_err(|e| EngineError::from_spawn("ffprobe", e))?;

    if !output.status.success() {
        return Err(EngineError::ExternalToolError {
            tool: "ffprobe".to_string(),
            code: output.status.code(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    parse_probe_json(&output.stdout)
}

fn parse_probe_json(stdout: &[u8]) -> Result<MediaProbe> {
    let parsed: FfprobeOutput = serde_json::from_slice(stdout)?;
    let streams = parsed.streams.unwrap_or_default();
    let format = parsed.format;

    let container = format
        .as_ref()
        .and_then(|f| f.format_name.as_deref())
        .map(first_format_name);
    let duration_ms = format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(parse_seconds_to_ms);
    let title = format
        .as_ref()
        .and_then(|f| f.tags.as_ref())
        .and_then(|t| t.title.clone())
        .filter(|t| !t.trim().is_empty());

    let video = streams
        .iter()
        .find(|st| st.codec_type.as_deref() == Some("video"));
    let audio = streams
        .iter()
        .find(|st| st.codec_type.as_deref() == Some("audio"));

    // Container bit rate first, first audio stream as fallback.
    let bit_rate = format
        .as_ref()
        .and_then(|f| f.bit_rate.as_deref())
        .and_then(|v| v.parse().ok())
        .or_else(|| {
            audio
                .and_then(|st| st.bit_rate.as_deref())
                .and_then(|v| v.parse().ok())
        });

    Ok(MediaProbe {
        duration_ms,
        container,
        video_codec: video.and_then(|st| st.codec_name.clone()),
        audio_codec: audio.and_then(|st| st.codec_name.clone()),
        width: video.and_then(|st| st.width),
        height: video.and_then(|st| st.height),
        bit_rate,
        sample_rate: audio
            .and_then(|st| st.sample_rate.as_deref())
            .and_then(|v| v.parse().ok()),
        title,
    })
}

/// Never fails: a missing or broken probe falls back to what the file name
/// tells us.
pub fn media_info(paths: &AppPaths, input: &Path) -> MediaInfo {
    let probe = match probe(paths, input) {
        Ok(p) => Some(p),
        Err(err) => {
            tracing::debug!(path = %input.display(), error = %err, "media probe failed");
            None
        }
    };
    media_info_from_probe(input, probe.as_ref())
}

fn media_info_from_probe(input: &Path, probe: Option<&MediaProbe>) -> MediaInfo {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let extension = input
        .extension()
        .map(|s| s.to_string_lossy().to_uppercase())
        .unwrap_or_default();

    MediaInfo {
        title: probe.and_then(|p| p.title.clone()).unwrap_or(stem),
        extension,
        bitrate_kbps: probe.and_then(|p| p.bit_rate).map(|b| b / 1000),
        sample_rate_hz: probe.and_then(|p| p.sample_rate),
        duration: probe
            .and_then(|p| p.duration_ms)
            .map(|ms| format_minutes_seconds((ms / 1000).max(0) as u64)),
    }
}

/// `m:ss`, minutes unbounded.
pub fn format_minutes_seconds(total_secs: u64) -> String {
    format!("{}:{:02}", total_secs / 60, total_secs % 60)
}

/// Width and height of the first video stream, or `None` when the file has
/// none or the probe does not answer within `timeout`.
pub fn video_dimensions(
    paths: &AppPaths,
    input: &Path,
    timeout: Duration,
) -> Result<Option<(u32, u32)>> {
    let mut command = cmd::command(paths.ffprobe_cmd());
    command
        .args([
            "-v",
            "quiet",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-of",
            "csv=p=0",
        ])
        .arg(input);

    let output = match cmd::output_with_timeout(&mut command, timeout) {
        Ok(output) => output,
        Err(CommandRunError::Spawn(e)) => return Err(EngineError::from_spawn("ffprobe", e)),
        Err(CommandRunError::TimedOut(_)) => return Ok(None),
        Err(CommandRunError::Wait(e)) => return Err(EngineError::Io(e)),
    };
    if !output.status.success() {
        return Ok(None);
    }
    Ok(parse_dimensions_csv(&String::from_utf8_lossy(&output.stdout)))
}

fn parse_dimensions_csv(stdout: &str) -> Option<(u32, u32)> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let mut parts = line.split(',');
    let width = parts.next()?.trim().parse().ok()?;
    let height = parts.next()?.trim().parse().ok()?;
    Some((width, height))
}

pub fn ffmpeg_available(paths: &AppPaths) -> bool {
    cmd::command(paths.ffmpeg_cmd())
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvertFormat {
    Mp3,
    M4a,
    Wav,
    Flac,
    Ogg,
    Wma,
}

impl ConvertFormat {
    pub const ALL: [ConvertFormat; 6] = [
        ConvertFormat::Mp3,
        ConvertFormat::M4a,
        ConvertFormat::Wav,
        ConvertFormat::Flac,
        ConvertFormat::Ogg,
        ConvertFormat::Wma,
    ];

    pub fn extension(self) -> &'static str {
        match self {
            ConvertFormat::Mp3 => "mp3",
            ConvertFormat::M4a => "m4a",
            ConvertFormat::Wav => "wav",
            ConvertFormat::Flac => "flac",
            ConvertFormat::Ogg => "ogg",
            ConvertFormat::Wma => "wma",
        }
    }

    pub fn codec(self) -> &'static str {
        match self {
            ConvertFormat::Mp3 => "mp3",
            ConvertFormat::M4a => "aac",
            ConvertFormat::Wav => "pcm_s16le",
            ConvertFormat::Flac => "flac",
            ConvertFormat::Ogg => "libvorbis",
            ConvertFormat::Wma => "wmav2",
        }
    }

    pub fn is_lossless(self) -> bool {
        matches!(self, ConvertFormat::Wav | ConvertFormat::Flac)
    }
}

#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    pub input: PathBuf,
    pub format: ConvertFormat,
    pub bitrate_kbps: u32,
    pub overwrite: bool,
}

impl TranscodeRequest {
    /// Same directory and stem as the input, new extension.
    pub fn output_path(&self) -> PathBuf {
        self.input.with_extension(self.format.extension())
    }
}

fn transcode_args(req: &TranscodeRequest, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = [
        "-nostdin",
        "-hide_banner",
        "-nostats",
        "-loglevel",
        "error",
        "-i",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(req.input.to_string_lossy().to_string());
    args.extend(
        ["-vn", "-ar", "44100", "-ac", "2", "-c:a", req.format.codec()]
            .iter()
            .map(|s| s.to_string()),
    );
    if !req.format.is_lossless() {
        args.push("-b:a".to_string());
        args.push(format!("{}k", req.bitrate_kbps));
    }
    args.push(output.to_string_lossy().to_string());
    args
}

/// One tick of the converter's simulated progress: climb by 2 to 90, then
/// pulse between 90 and 95 until the transcoder exits.
pub fn next_transcode_progress(current: u8) -> u8 {
    if current < TRANSCODE_CRAWL_CEIL {
        (current + 2).min(TRANSCODE_CRAWL_CEIL)
    } else if current >= TRANSCODE_PULSE_CEIL {
        TRANSCODE_CRAWL_CEIL
    } else {
        current + 1
    }
}

/// Converts an audio (or video) file into one of the fixed audio targets.
/// `on_progress` sees 10, the crawl, and finally 100 once ffmpeg exits.
pub fn transcode_audio(
    paths: &AppPaths,
    req: &TranscodeRequest,
    cancel: Option<&AtomicBool>,
    mut on_progress: impl FnMut(u8),
) -> Result<PathBuf> {
    if !req.input.is_file() {
        return Err(EngineError::InvalidInput(format!(
            "input file not found: {}",
            req.input.display()
        )));
    }
    let output = req.output_path();
    if output == req.input {
        return Err(EngineError::InvalidInput(
            "input already has the target format".to_string(),
        ));
    }
    if output.exists() {
        if !req.overwrite {
            return Err(EngineError::InvalidInput(format!(
                "output already exists: {}",
                output.display()
            )));
        }
        std::fs::remove_file(&output)?;
    }

    let mut child = cmd::command(paths.ffmpeg_cmd())
        .args(transcode_args(req, &output))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| EngineError::from_spawn("ffmpeg", e))?;

    let stderr = child.stderr.take();
    let stderr_handle = thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = stderr {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    });

    let mut progress = TRANSCODE_CRAWL_START;
    on_progress(progress);
    let status = loop {
        if cancel.is_some_and(|c| c.load(Ordering::SeqCst)) {
            cmd::terminate(&mut child, Duration::from_secs(2));
            let _ = stderr_handle.join();
            let _ = std::fs::remove_file(&output);
            return Err(EngineError::Cancelled);
        }
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                thread::sleep(Duration::from_millis(TRANSCODE_TICK_MS));
                progress = next_transcode_progress(progress);
                on_progress(progress);
            }
            Err(err) => {
                cmd::terminate(&mut child, Duration::from_millis(0));
                let _ = stderr_handle.join();
                return Err(EngineError::Io(err));
            }
        }
    };

    let stderr = stderr_handle.join().unwrap_or_default();
    on_progress(100);
    if !status.success() {
        let _ = std::fs::remove_file(&output);
        return Err(EngineError::ExternalToolError {
            tool: "ffmpeg".to_string(),
            code: status.code(),
            detail: stderr.trim().to_string(),
        });
    }
    tracing::info!(output = %output.display(), format = ?req.format, "transcode finished");
    Ok(output)
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeOutput {
    streams: Option<Vec<FfprobeStream>>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
    bit_rate: Option<String>,
    sample_rate: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    bit_rate: Option<String>,
    tags: Option<FfprobeTags>,
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeTags {
    #[serde(alias = "TITLE", alias = "Title")]
    title: Option<String>,
}

fn first_format_name(value: &str) -> String {
    value.split(',').next().unwrap_or(value).trim().to_string()
}

fn parse_seconds_to_ms(value: &str) -> Option<i64> {
    let seconds: f64 = value.parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some((seconds * 1000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_PROBE: &str = r#"{
        "streams": [
            {"codec_type": "video", "codec_name": "h264", "width": 1280, "height": 720},
            {"codec_type": "audio", "codec_name": "aac", "sample_rate": "44100", "bit_rate": "128000"}
        ],
        "format": {
            "format_name": "mov,mp4,m4a,3gp,3g2,mj2",
            "duration": "125.4",
            "bit_rate": "1500000",
            "tags": {"title": "Clip Title"}
        }
    }"#;

    #[test]
    fn probe_json_maps_streams_and_format() {
        let probe = parse_probe_json(SAMPLE_PROBE.as_bytes()).expect("parse");
        assert_eq!(probe.container.as_deref(), Some("mov"));
        assert_eq!(probe.duration_ms, Some(125_400));
        assert_eq!(probe.height, Some(720));
        assert_eq!(probe.audio_codec.as_deref(), Some("aac"));
        assert_eq!(probe.bit_rate, Some(1_500_000));
        assert_eq!(probe.sample_rate, Some(44_100));
        assert_eq!(probe.title.as_deref(), Some("Clip Title"));
    }

    #[test]
    fn media_info_uses_stream_bitrate_and_file_stem_fallbacks() {
        let probe = parse_probe_json(
            br#"{"streams":[{"codec_type":"audio","bit_rate":"192000","sample_rate":"48000"}],
                 "format":{"duration":"61.9"}}"#,
        )
        .expect("parse");
        let info = media_info_from_probe(Path::new("/music/My Song.flac"), Some(&probe));
        assert_eq!(info.title, "My Song");
        assert_eq!(info.extension, "FLAC");
        assert_eq!(info.bitrate_kbps, Some(192));
        assert_eq!(info.sample_rate_hz, Some(48_000));
        assert_eq!(info.duration.as_deref(), Some("1:01"));

        let bare = media_info_from_probe(Path::new("x.wav"), None);
        assert_eq!(bare.title, "x");
        assert_eq!(bare.duration, None);
    }

    #[test]
    fn dimensions_csv_is_parsed_leniently() {
        assert_eq!(parse_dimensions_csv("1920,1080\n"), Some((1920, 1080)));
        assert_eq!(parse_dimensions_csv("\n 640,360 \n"), Some((640, 360)));
        assert_eq!(parse_dimensions_csv("N/A,N/A"), None);
        assert_eq!(parse_dimensions_csv(""), None);
    }

    #[test]
    fn transcode_args_pin_sample_rate_channels_and_codec() {
        let req = TranscodeRequest {
            input: PathBuf::from("/in/track.wav"),
            format: ConvertFormat::Ogg,
            bitrate_kbps: 192,
            overwrite: false,
        };
        let args = transcode_args(&req, &req.output_path());
        let joined = args.join(" ");
        assert!(joined.contains("-vn -ar 44100 -ac 2 -c:a libvorbis -b:a 192k"));
        assert!(joined.ends_with("/in/track.ogg"));

        let flac = TranscodeRequest {
            format: ConvertFormat::Flac,
            ..req
        };
        assert!(!transcode_args(&flac, &flac.output_path()).contains(&"-b:a".to_string()));
    }

    #[test]
    fn transcode_progress_climbs_then_pulses() {
        let mut p = TRANSCODE_CRAWL_START;
        let mut seen = Vec::new();
        for _ in 0..60 {
            p = next_transcode_progress(p);
            seen.push(p);
        }
        assert!(seen.iter().all(|v| (10..=95).contains(v)));
        assert!(seen.contains(&90));
        assert!(seen.contains(&95));
        assert_eq!(next_transcode_progress(95), 90);
    }

    #[test]
    fn transcode_refuses_to_clobber_existing_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let input = dir.path().join("a.wav");
        std::fs::write(&input, b"RIFF").expect("write input");
        std::fs::write(dir.path().join("a.mp3"), b"old").expect("write output");

        let req = TranscodeRequest {
            input,
            format: ConvertFormat::Mp3,
            bitrate_kbps: 320,
            overwrite: false,
        };
        let err = transcode_audio(&paths, &req, None, |_| {}).expect_err("must refuse");
        assert!(matches!(err, EngineError::InvalidInput(_)));
        assert_eq!(
            std::fs::read(dir.path().join("a.mp3")).expect("read"),
            b"old".to_vec()
        );
    }
}
