//! Preview metadata for a pasted URL: title, channel, duration, thumbnail.

use crate::cmd::{self, CommandRunError};
use crate::paths::AppPaths;
use crate::progress::{self, ParserContext, ProgressEvent};
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

pub const METADATA_TIMEOUT: Duration = Duration::from_secs(30);
const OEMBED_ENDPOINT: &str = "https://www.youtube.com/oembed";
const OEMBED_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub url: String,
    pub title: String,
    pub channel: Option<String>,
    pub duration_seconds: Option<u64>,
    pub duration_text: Option<String>,
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DumpJson {
    title: Option<String>,
    duration: Option<f64>,
    duration_string: Option<String>,
    channel: Option<String>,
    uploader: Option<String>,
    thumbnail: Option<String>,
    webpage_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OEmbedInfo {
    pub title: String,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub thumbnail_url: String,
}

/// `youtube.com/watch` and `youtu.be/` links, case-insensitive.
pub fn is_youtube_url(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("youtube.com/watch") || lower.contains("youtu.be/")
}

/// Drops playlist context from a watch URL, keeping only the video id.
/// Short links and anything unparsable come back unchanged.
pub fn strip_playlist(input: &str) -> String {
    let trimmed = input.trim();
    let Ok(parsed) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };
    if parsed
        .host_str()
        .is_some_and(|h| h.eq_ignore_ascii_case("youtu.be"))
    {
        return trimmed.to_string();
    }
    match parsed.query_pairs().find(|(k, _)| k == "v") {
        Some((_, id)) if !id.is_empty() => format!("https://www.youtube.com/watch?v={id}"),
        _ => trimmed.to_string(),
    }
}

/// Auto-generated music channels carry a `- Topic` suffix.
pub fn clean_channel_name(name: &str) -> String {
    if name.contains("- Topic") {
        name.replace("- Topic", "").trim().to_string()
    } else {
        name.to_string()
    }
}

/// `mm:ss` from whole seconds; minutes are not wrapped into hours.
pub fn format_duration(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

fn metadata_from_dump(url: &str, dump: DumpJson) -> VideoMetadata {
    let duration_seconds = dump
        .duration
        .filter(|d| d.is_finite() && *d > 0.0)
        .map(|d| d as u64);
    let duration_text = dump
        .duration_string
        .filter(|s| !s.trim().is_empty())
        .or_else(|| duration_seconds.map(format_duration));
    let channel = dump
        .channel
        .or(dump.uploader)
        .map(|c| clean_channel_name(&c))
        .filter(|c| !c.is_empty());

    VideoMetadata {
        url: dump.webpage_url.unwrap_or_else(|| url.to_string()),
        title: dump
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| url.to_string()),
        channel,
        duration_seconds,
        duration_text,
        thumbnail_url: dump.thumbnail,
    }
}

/// Maps the first recognised failure line in `stderr` onto the error
/// taxonomy, falling back to a generic tool error.
fn classify_stderr(stderr: &str, code: Option<i32>) -> EngineError {
    let mut ctx = ParserContext::default();
    for line in stderr.lines() {
        if let Some(ProgressEvent::Error { kind, message, .. }) =
            progress::parse_line(line, &mut ctx)
        {
            return kind.into_error(message);
        }
    }
    EngineError::ExternalToolError {
        tool: "yt-dlp".to_string(),
        code,
        detail: stderr.trim().to_string(),
    }
}

/// Full metadata through the download tool's JSON dump.
pub fn fetch(
    paths: &AppPaths,
    url: &str,
    no_playlist: bool,
    timeout: Duration,
) -> Result<VideoMetadata> {
    let url = url.trim();
    if url.is_empty() {
        return Err(EngineError::InvalidInput("url is required".to_string()));
    }

    let mut command = cmd::command(paths.ytdlp_cmd());
    command.args(["-J", "--no-warnings"]);
    if no_playlist {
        command.arg("--no-playlist");
    }
    command.arg(url);

    let output = match cmd::output_with_timeout(&mut command, timeout) {
        Ok(output) => output,
        Err(CommandRunError::Spawn(e)) => return Err(EngineError::from_spawn("yt-dlp", e)),
        Err(CommandRunError::Wait(e)) => return Err(EngineError::Io(e)),
        Err(err @ CommandRunError::TimedOut(_)) => {
            return Err(EngineError::ExternalToolError {
                tool: "yt-dlp".to_string(),
                code: None,
                detail: err.to_string(),
            })
        }
    };

    if !output.status.success() {
        return Err(classify_stderr(
            &String::from_utf8_lossy(&output.stderr),
            output.status.code(),
        ));
    }

    let dump: DumpJson = serde_json::from_slice(&output.stdout)?;
    Ok(metadata_from_dump(url, dump))
}

/// Quick title/channel/thumbnail lookup that does not need the download tool.
pub fn fetch_oembed(url: &str) -> Result<OEmbedInfo> {
    let resp = ureq::get(OEMBED_ENDPOINT)
        .query("url", url)
        .query("format", "json")
        .config()
        .timeout_global(Some(OEMBED_TIMEOUT))
        .build()
        .call()
        .map_err(|e| EngineError::UnavailableOrRestrictedSource(format!("preview lookup failed: {e}")))?;
    let body = resp
        .into_body()
        .read_to_string()
        .map_err(|e| EngineError::UnavailableOrRestrictedSource(format!("preview lookup failed: {e}")))?;
    let mut info: OEmbedInfo = serde_json::from_str(&body)?;
    info.author_name = clean_channel_name(&info.author_name);
    Ok(info)
}
