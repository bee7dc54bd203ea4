//! Line-at-a-time parser for the download tool's `--newline` progress output.
//!
//! The parser is a pure function over one line plus a small [`ParserContext`]
//! the caller keeps between lines. Malformed tokens are ignored; a line that
//! matches nothing yields `None`.

use crate::EngineError;
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;

pub const DOWNLOAD_FLOOR_PERCENT: u8 = 5;
pub const DOWNLOAD_CEIL_PERCENT: u8 = 75;
pub const CONVERT_START_PERCENT: u8 = 80;
pub const CRAWL_CEIL_PERCENT: u8 = 94;
pub const FINALIZE_PERCENT: u8 = 95;
pub const COMPLETE_PERCENT: u8 = 100;

const CONVERSION_INDICATORS: [&str; 10] = [
    "Deleting original file",
    "Correcting container",
    "Fixing DASH",
    "Merging formats",
    "Converting",
    "Postprocessing",
    "Extracting audio",
    "Destination:",
    "Writing metadata",
    "ffmpeg",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Download,
    Convert,
    Finalize,
}

/// Classification of a fatal tool line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    UnavailableOrRestricted,
    UnsupportedSource,
    FormatUnavailable,
    /// An `ERROR:` line that matched no known phrase.
    Tool,
}

impl FailureKind {
    pub fn into_error(self, message: String) -> EngineError {
        match self {
            FailureKind::UnavailableOrRestricted => {
                EngineError::UnavailableOrRestrictedSource(message)
            }
            FailureKind::UnsupportedSource => EngineError::UnsupportedSource(message),
            FailureKind::FormatUnavailable => EngineError::FormatUnavailable(message),
            FailureKind::Tool => EngineError::ExternalToolError {
                tool: "yt-dlp".to_string(),
                code: None,
                detail: message,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    FormatUnavailable,
    AlreadyDownloaded,
    AlreadyExists,
    Transcoder,
    /// Raised by the worker, never by the parser: the finished file is far
    /// smaller than the size the tool announced.
    UnexpectedSize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PercentUpdate {
    /// Normalized 0..=100 value, already rescaled into the download band.
    pub percent: u8,
    pub raw_percent: f64,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub speed_bytes_per_sec: Option<u64>,
    pub eta_seconds: Option<u64>,
    pub size_text: Option<String>,
    pub speed_text: Option<String>,
    pub eta_text: Option<String>,
    pub status_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    StageStarted {
        stage: Stage,
        path: PathBuf,
        percent: u8,
    },
    PercentUpdate(PercentUpdate),
    StageTransition {
        from: Stage,
        to: Stage,
        percent: u8,
    },
    /// Postprocessing is still running; keeps the indicator moving.
    Crawl {
        percent: u8,
        path: Option<PathBuf>,
    },
    Warning {
        kind: WarningKind,
        text: String,
    },
    Error {
        kind: FailureKind,
        message: String,
        raw: String,
    },
    Completed {
        output_path: PathBuf,
    },
}

impl ProgressEvent {
    pub fn percent(&self) -> Option<u8> {
        match self {
            ProgressEvent::StageStarted { percent, .. }
            | ProgressEvent::StageTransition { percent, .. }
            | ProgressEvent::Crawl { percent, .. } => Some(*percent),
            ProgressEvent::PercentUpdate(update) => Some(update.percent),
            ProgressEvent::Completed { .. } => Some(COMPLETE_PERCENT),
            ProgressEvent::Warning { .. } | ProgressEvent::Error { .. } => None,
        }
    }
}

/// Rolling state between lines of one run.
#[derive(Debug, Clone)]
pub struct ParserContext {
    pub stage: Stage,
    pub last_percent: u8,
    pub download_started: bool,
    pub download_completed: bool,
    /// Set once a raw percent strictly above every earlier one was seen.
    pub real_progress: bool,
    pub highest_raw_percent: u32,
    pub destination: Option<PathBuf>,
    pub total_bytes: Option<u64>,
    pub size_text: Option<String>,
}

impl Default for ParserContext {
    fn default() -> Self {
        Self {
            stage: Stage::Download,
            last_percent: 0,
            download_started: false,
            download_completed: false,
            real_progress: false,
            highest_raw_percent: 0,
            destination: None,
            total_bytes: None,
            size_text: None,
        }
    }
}

impl ParserContext {
    fn bump(&mut self, percent: u8) -> u8 {
        let percent = percent.min(COMPLETE_PERCENT).max(self.last_percent);
        self.last_percent = percent;
        percent
    }

    fn transition(&mut self, to: Stage, percent: u8) -> ProgressEvent {
        let from = self.stage;
        if to > self.stage {
            self.stage = to;
        }
        ProgressEvent::StageTransition {
            from,
            to: self.stage,
            percent: self.bump(percent),
        }
    }
}

pub fn parse_line(line: &str, ctx: &mut ParserContext) -> Option<ProgressEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    // Lines naming an output file carry the video title, so phrase matching
    // would trip over titles like "AAC codec failed".
    let names_file = names_output_file(line);
    if !names_file {
        if let Some(event) = classify_problem(line) {
            return Some(event);
        }
    }

    if let Some(rest) = line.strip_prefix("[download] Destination:") {
        let path = PathBuf::from(rest.trim());
        ctx.download_started = true;
        ctx.destination = Some(path.clone());
        return Some(ProgressEvent::StageStarted {
            stage: Stage::Download,
            path,
            percent: ctx.bump(DOWNLOAD_FLOOR_PERCENT),
        });
    }

    if line.starts_with("[download]") && line.contains('%') {
        if let Some(update) = parse_percent_line(line, ctx) {
            return Some(ProgressEvent::PercentUpdate(update));
        }
    }

    if line.contains("Extracting audio") || line.contains("Merging formats") {
        ctx.download_completed = true;
        if let Some(path) = quoted_path(line) {
            ctx.destination = Some(path);
        }
        return Some(ctx.transition(Stage::Convert, CONVERT_START_PERCENT));
    }

    if line.contains("Post-process file") || line.contains("Finished downloading") {
        if ctx.download_completed || ctx.stage > Stage::Download {
            return Some(ctx.transition(Stage::Finalize, FINALIZE_PERCENT));
        }
        return None;
    }

    if !names_file {
        if let Some(event) = transcoder_complaint(line) {
            return Some(event);
        }
    }

    if ctx.download_completed
        && CONVERSION_INDICATORS.iter().any(|needle| line.contains(needle))
    {
        if ctx.stage == Stage::Download {
            ctx.stage = Stage::Convert;
        }
        let path = postprocess_destination(line);
        if let Some(p) = &path {
            ctx.destination = Some(p.clone());
        }
        let next = if ctx.last_percent >= CRAWL_CEIL_PERCENT {
            ctx.last_percent
        } else {
            (ctx.last_percent + 1).min(CRAWL_CEIL_PERCENT)
        };
        return Some(ProgressEvent::Crawl {
            percent: ctx.bump(next),
            path,
        });
    }

    None
}

/// Error and warning phrases. First match wins.
fn classify_problem(line: &str) -> Option<ProgressEvent> {
    let error = |kind: FailureKind, message: &str| ProgressEvent::Error {
        kind,
        message: message.to_string(),
        raw: line.to_string(),
    };
    let warning = |kind: WarningKind| ProgressEvent::Warning {
        kind,
        text: line.to_string(),
    };

    if line.contains("No video formats found") {
        return Some(error(
            FailureKind::FormatUnavailable,
            "No video formats are available for this URL.",
        ));
    }
    if line.contains("Unsupported URL") || line.contains("is not a valid URL") {
        return Some(error(
            FailureKind::UnsupportedSource,
            "The URL is not valid or the site is not supported.",
        ));
    }
    if line.contains("Private video") || line.contains("Sign in to confirm your age") {
        return Some(error(
            FailureKind::UnavailableOrRestricted,
            "This video is private or requires age verification.",
        ));
    }
    if line.contains("This video is unavailable") {
        return Some(error(
            FailureKind::UnavailableOrRestricted,
            "This video is not available.",
        ));
    }
    if line.contains("Video unavailable") {
        return Some(error(
            FailureKind::UnavailableOrRestricted,
            "Video not available. It may have been removed or made private.",
        ));
    }
    if line.contains("format not available") || line.contains("requested format") {
        return Some(warning(WarningKind::FormatUnavailable));
    }
    if line.contains("has already been downloaded") {
        return Some(warning(WarningKind::AlreadyDownloaded));
    }
    if line.contains("already exists") {
        return Some(warning(WarningKind::AlreadyExists));
    }
    if line.starts_with("ERROR:") || line.contains(" ERROR:") || line.starts_with("Error:") {
        let detail = line
            .split_once(':')
            .map(|(_, rest)| rest.trim())
            .unwrap_or(line);
        return Some(error(FailureKind::Tool, detail));
    }
    None
}

fn names_output_file(line: &str) -> bool {
    (line.starts_with('[') && (line.contains("] Destination:") || line.contains("Merging formats into")))
        || line.starts_with("Deleting original file")
        || line.starts_with("Post-process file")
}

fn transcoder_complaint(line: &str) -> Option<ProgressEvent> {
    let lower = line.to_lowercase();
    let failed = lower.contains("error") || lower.contains("failed");
    let transcoder_topic = ["ffmpeg", "conversion", "codec", "aac", "vorbis", "wma"]
        .iter()
        .any(|needle| lower.contains(needle));
    if transcoder_topic && (failed || (lower.contains("codec") && lower.contains("not found"))) {
        return Some(ProgressEvent::Warning {
            kind: WarningKind::Transcoder,
            text: line.to_string(),
        });
    }
    None
}

fn parse_percent_line(line: &str, ctx: &mut ParserContext) -> Option<PercentUpdate> {
    let raw_percent: f64 = line
        .split_whitespace()
        .find_map(|tok| tok.strip_suffix('%'))
        .and_then(|v| v.parse().ok())?;
    if !raw_percent.is_finite() || raw_percent < 0.0 {
        return None;
    }

    // Later streams of a merged download (the audio track) must not replace
    // the size of the first one.
    let first_stream = !ctx.download_completed;
    let whole = raw_percent.floor().min(100.0) as u32;
    if whole > ctx.highest_raw_percent {
        ctx.real_progress = true;
        ctx.highest_raw_percent = whole;
    }
    if whole >= 100 {
        ctx.download_completed = true;
    }
    let scaled = (whole * 3 / 4).clamp(
        u32::from(DOWNLOAD_FLOOR_PERCENT),
        u32::from(DOWNLOAD_CEIL_PERCENT),
    ) as u8;

    let size_token = token_after(line, " of ");
    let total_bytes = size_token.and_then(size_token_to_bytes);
    let size_text = size_token.and_then(humanize_size_token);
    if first_stream {
        if let Some(total) = total_bytes {
            ctx.total_bytes = Some(total);
        }
        if let Some(text) = &size_text {
            ctx.size_text = Some(text.clone());
        }
    }

    let speed_token = token_after(line, " at ");
    let speed_bytes_per_sec = speed_token
        .and_then(|t| t.strip_suffix("/s"))
        .and_then(size_token_to_bytes);
    let speed_text = speed_token.and_then(humanize_speed);

    let eta_token = token_after(line, " ETA ");
    let eta_seconds = eta_token.and_then(eta_to_seconds);
    let eta_text = eta_token.and_then(format_eta);

    let downloaded_bytes =
        total_bytes.map(|t| ((raw_percent.min(100.0) / 100.0) * t as f64) as u64);
    let status_text = match (downloaded_bytes, &size_text) {
        (Some(done), Some(total_text)) => {
            let mut status = format!("Downloading… {} of {}", humanize_bytes(done), total_text);
            if let Some(speed) = &speed_text {
                status.push_str(&format!(" — {speed}"));
            }
            if let Some(eta) = &eta_text {
                status.push_str(&format!(" — {eta} remaining"));
            }
            Some(status)
        }
        _ => None,
    };

    Some(PercentUpdate {
        percent: ctx.bump(scaled),
        raw_percent,
        downloaded_bytes,
        total_bytes,
        speed_bytes_per_sec,
        eta_seconds,
        size_text: size_text.filter(|_| first_stream),
        speed_text,
        eta_text,
        status_text,
    })
}

fn token_after<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    line.split_once(marker)?.1.split_whitespace().next()
}

fn quoted_path(line: &str) -> Option<PathBuf> {
    let start = line.find('"')?;
    let rest = &line[start + 1..];
    let end = rest.rfind('"')?;
    let inner = rest[..end].trim();
    (!inner.is_empty()).then(|| PathBuf::from(inner))
}

fn postprocess_destination(line: &str) -> Option<PathBuf> {
    if !line.starts_with('[') || line.starts_with("[download]") {
        return None;
    }
    let (_, rest) = line.split_once("Destination:")?;
    let rest = rest.trim();
    (!rest.is_empty()).then(|| PathBuf::from(rest))
}

fn size_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^~?\s*([0-9]+(?:\.[0-9]+)?)\s*([KMGT]i?B|B)$").unwrap())
}

fn split_size_token(token: &str) -> Option<(f64, char)> {
    let caps = size_token_re().captures(token.trim())?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str().chars().next()?;
    Some((value, unit))
}

/// `50.00MiB` -> bytes, base 1024.
pub fn size_token_to_bytes(token: &str) -> Option<u64> {
    let (value, unit) = split_size_token(token)?;
    let factor = match unit {
        'K' => 1024f64,
        'M' => 1024f64.powi(2),
        'G' => 1024f64.powi(3),
        'T' => 1024f64.powi(4),
        _ => 1.0,
    };
    Some((value * factor).round() as u64)
}

/// `50.00MiB` -> `50.00 MB`.
pub fn humanize_size_token(token: &str) -> Option<String> {
    let (value, unit) = split_size_token(token)?;
    Some(match unit {
        'T' => format!("{value:.2} TB"),
        'G' => format!("{value:.2} GB"),
        'M' => format!("{value:.2} MB"),
        'K' => format!("{value:.0} KB"),
        _ => format!("{value} B"),
    })
}

pub fn humanize_speed(token: &str) -> Option<String> {
    let base = token.strip_suffix("/s")?;
    humanize_size_token(base).map(|text| format!("{text}/s"))
}

pub fn humanize_bytes(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    let b = bytes as f64;
    if b >= KIB.powi(3) {
        format!("{:.2} GB", b / KIB.powi(3))
    } else if b >= KIB.powi(2) {
        format!("{:.2} MB", b / KIB.powi(2))
    } else if b >= KIB {
        format!("{:.0} KB", b / KIB)
    } else {
        format!("{bytes} B")
    }
}

/// Final-size text for completion summaries (`12.3 MB`, `512.0 KB`, `10 bytes`).
pub fn summarize_file_size(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    let b = bytes as f64;
    if b >= KIB * KIB {
        format!("{:.1} MB", b / (KIB * KIB))
    } else if b >= KIB {
        format!("{:.1} KB", b / KIB)
    } else {
        format!("{bytes} bytes")
    }
}

fn eta_to_seconds(token: &str) -> Option<u64> {
    let parts: Vec<u64> = token
        .split(':')
        .map(|p| p.parse::<u64>())
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    match parts.as_slice() {
        [s] => Some(*s),
        [m, s] => Some(m * 60 + s),
        [h, m, s] => Some(h * 3600 + m * 60 + s),
        _ => None,
    }
}

/// Normalizes an ETA token to `mm:ss`, or `h:mm:ss` past an hour.
pub fn format_eta(token: &str) -> Option<String> {
    let parts: Vec<&str> = token.split(':').collect();
    match parts.as_slice() {
        [m, s] => {
            let m: u64 = m.parse().ok()?;
            let s: u64 = s.parse().ok()?;
            Some(format!("{m:02}:{s:02}"))
        }
        [h, m, s] => {
            let h: u64 = h.parse().ok()?;
            let m: u64 = m.parse().ok()?;
            let s: u64 = s.parse().ok()?;
            Some(format!("{h}:{m:02}:{s:02}"))
        }
        _ => {
            let secs = token.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0)? as u64;
            Some(format_seconds(secs))
        }
    }
}

pub fn format_seconds(secs: u64) -> String {
    if secs >= 3600 {
        format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else {
        format!("{:02}:{:02}", secs / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(lines: &[&str]) -> (Vec<ProgressEvent>, ParserContext) {
        let mut ctx = ParserContext::default();
        let events = lines
            .iter()
            .filter_map(|line| parse_line(line, &mut ctx))
            .collect();
        (events, ctx)
    }

    #[test]
    fn percent_line_is_rescaled_and_humanized() {
        let mut ctx = ParserContext::default();
        let event = parse_line(
            "[download]  12.3% of 50.00MiB at 2.31MiB/s ETA 00:40",
            &mut ctx,
        )
        .expect("event");
        let ProgressEvent::PercentUpdate(update) = event else {
            panic!("expected percent update, got {event:?}");
        };
        assert_eq!(update.percent, 9);
        assert_eq!(update.total_bytes, Some(50 * 1024 * 1024));
        assert_eq!(update.speed_text.as_deref(), Some("2.31 MB/s"));
        assert_eq!(update.eta_text.as_deref(), Some("00:40"));
        assert_eq!(update.eta_seconds, Some(40));
        assert_eq!(update.size_text.as_deref(), Some("50.00 MB"));
        assert_eq!(
            update.status_text.as_deref(),
            Some("Downloading… 6.15 MB of 50.00 MB — 2.31 MB/s — 00:40 remaining")
        );
        assert!(ctx.real_progress);
    }

    #[test]
    fn low_and_high_percent_are_clamped_to_download_band() {
        let (events, ctx) = run(&["[download]   1.0% of 10.00MiB", "[download] 100% of 10.00MiB"]);
        let percents: Vec<u8> = events.iter().filter_map(ProgressEvent::percent).collect();
        assert_eq!(percents, vec![5, 75]);
        assert!(ctx.download_completed);
    }

    #[test]
    fn video_unavailable_yields_translated_error() {
        let mut ctx = ParserContext::default();
        let event = parse_line("ERROR: Video unavailable", &mut ctx).expect("event");
        match event {
            ProgressEvent::Error { kind, message, raw } => {
                assert_eq!(kind, FailureKind::UnavailableOrRestricted);
                assert!(message.starts_with("Video not available"));
                assert_ne!(message, raw);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn format_not_available_is_only_a_warning() {
        let mut ctx = ParserContext::default();
        let event = parse_line(
            "WARNING: [youtube] abc: requested format not available",
            &mut ctx,
        )
        .expect("event");
        assert!(matches!(
            event,
            ProgressEvent::Warning {
                kind: WarningKind::FormatUnavailable,
                ..
            }
        ));
    }

    #[test]
    fn error_phrases_map_to_their_kinds() {
        let cases = [
            ("ERROR: Unsupported URL: https://x", FailureKind::UnsupportedSource),
            ("ERROR: [youtube] x: Private video", FailureKind::UnavailableOrRestricted),
            (
                "ERROR: Sign in to confirm your age",
                FailureKind::UnavailableOrRestricted,
            ),
            ("ERROR: No video formats found!", FailureKind::FormatUnavailable),
            ("ERROR: something odd happened", FailureKind::Tool),
        ];
        for (line, expected) in cases {
            let mut ctx = ParserContext::default();
            match parse_line(line, &mut ctx) {
                Some(ProgressEvent::Error { kind, .. }) => assert_eq!(kind, expected, "{line}"),
                other => panic!("{line}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn transcoder_complaints_are_warnings() {
        let mut ctx = ParserContext::default();
        let event = parse_line("[ExtractAudio] ffmpeg failed: codec aac error", &mut ctx);
        assert!(matches!(
            event,
            Some(ProgressEvent::Warning {
                kind: WarningKind::Transcoder,
                ..
            })
        ));
    }

    #[test]
    fn titles_with_tool_words_still_track_destination_and_merge() {
        let mut ctx = ParserContext::default();
        let started = parse_line(
            "[download] Destination: /out/FFmpeg_error_codes_explained.f137.mp4",
            &mut ctx,
        );
        assert!(matches!(started, Some(ProgressEvent::StageStarted { .. })), "{started:?}");
        assert_eq!(
            ctx.destination,
            Some(PathBuf::from("/out/FFmpeg_error_codes_explained.f137.mp4"))
        );

        parse_line("[download] 100% of 2.00MiB", &mut ctx);
        let merge = parse_line(
            "[Merger] Merging formats into \"/out/FFmpeg_error_codes_explained.mp4\"",
            &mut ctx,
        );
        assert_eq!(
            merge,
            Some(ProgressEvent::StageTransition {
                from: Stage::Download,
                to: Stage::Convert,
                percent: CONVERT_START_PERCENT
            })
        );
        assert_eq!(
            ctx.destination,
            Some(PathBuf::from("/out/FFmpeg_error_codes_explained.mp4"))
        );

        let crawl = parse_line("Deleting original file /out/AAC_codec_failed.f251.webm", &mut ctx);
        assert!(matches!(crawl, Some(ProgressEvent::Crawl { .. })), "{crawl:?}");
    }

    #[test]
    fn restricted_phrases_in_a_title_do_not_abort() {
        let mut ctx = ParserContext::default();
        let event = parse_line(
            "[download] Destination: /out/Private video reveal.webm",
            &mut ctx,
        );
        assert!(matches!(event, Some(ProgressEvent::StageStarted { .. })), "{event:?}");
    }

    #[test]
    fn full_audio_run_moves_through_stages_monotonically() {
        let (events, ctx) = run(&[
            "[youtube] abc: Downloading webpage",
            "[download] Destination: /tmp/out/Song.webm",
            "[download]   3.0% of 4.00MiB at 1.00MiB/s ETA 00:04",
            "[download]  50.0% of 4.00MiB at 1.00MiB/s ETA 00:02",
            "[download] 100% of 4.00MiB in 00:04",
            "[ExtractAudio] Destination: /tmp/out/Song.mp3",
            "Deleting original file /tmp/out/Song.webm (pass -k to keep)",
            "[download]  10.0% of 4.00MiB",
            "Post-process file /tmp/out/Song.mp3 exists",
        ]);
        let percents: Vec<u8> = events.iter().filter_map(ProgressEvent::percent).collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
        assert_eq!(percents.last(), Some(&FINALIZE_PERCENT));
        assert_eq!(ctx.stage, Stage::Finalize);
        assert_eq!(ctx.destination, Some(PathBuf::from("/tmp/out/Song.mp3")));
        assert!(percents.iter().all(|p| *p <= FINALIZE_PERCENT));
    }

    #[test]
    fn merge_jumps_to_conversion_and_crawl_stops_at_ceiling() {
        let mut ctx = ParserContext::default();
        parse_line("[download] 100% of 1.00MiB", &mut ctx);
        let merge = parse_line(
            "[Merger] Merging formats into \"/tmp/out/Clip.mp4\"",
            &mut ctx,
        )
        .expect("merge");
        assert_eq!(
            merge,
            ProgressEvent::StageTransition {
                from: Stage::Download,
                to: Stage::Convert,
                percent: CONVERT_START_PERCENT
            }
        );
        assert_eq!(ctx.destination, Some(PathBuf::from("/tmp/out/Clip.mp4")));

        let mut last = 0;
        for _ in 0..30 {
            last = parse_line("[FixupM3u8] Fixing DASH container", &mut ctx)
                .and_then(|e| e.percent())
                .expect("crawl");
        }
        assert_eq!(last, CRAWL_CEIL_PERCENT);
    }

    #[test]
    fn unrelated_and_malformed_lines_are_ignored() {
        let mut ctx = ParserContext::default();
        assert_eq!(parse_line("", &mut ctx), None);
        assert_eq!(parse_line("[youtube] abc: Downloading m3u8 information", &mut ctx), None);
        assert_eq!(parse_line("[download] xx% of what", &mut ctx), None);
        // Indicators before the download finished do not crawl.
        assert_eq!(parse_line("[info] Writing metadata", &mut ctx), None);
        assert_eq!(ctx.last_percent, 0);
    }

    #[test]
    fn second_stream_keeps_the_first_streams_size() {
        let (events, ctx) = run(&[
            "[download] Destination: /out/Clip.f137.mp4",
            "[download]  50.0% of 40.00MiB at 1.00MiB/s ETA 00:20",
            "[download] 100% of 40.00MiB in 00:40",
            "[download] Destination: /out/Clip.f140.m4a",
            "[download]  50.0% of 3.00MiB at 1.00MiB/s ETA 00:01",
        ]);
        let sizes: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::PercentUpdate(u) => u.size_text.as_deref(),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec!["40.00 MB", "40.00 MB"]);
        assert_eq!(ctx.size_text.as_deref(), Some("40.00 MB"));
        assert_eq!(ctx.total_bytes, Some(40 * 1024 * 1024));
    }

    #[test]
    fn repeated_percent_is_not_real_progress() {
        let (_, ctx) = run(&["[download]   0.0% of 1.00MiB", "[download]   0.0% of 1.00MiB"]);
        assert!(!ctx.real_progress);
    }

    #[test]
    fn eta_tokens_are_normalized() {
        assert_eq!(format_eta("0:40").as_deref(), Some("00:40"));
        assert_eq!(format_eta("1:02:03").as_deref(), Some("1:02:03"));
        assert_eq!(format_eta("3725").as_deref(), Some("1:02:05"));
        assert_eq!(format_eta("Unknown"), None);
    }

    #[test]
    fn size_helpers_cover_units() {
        assert_eq!(size_token_to_bytes("1.5GiB"), Some(1_610_612_736));
        assert_eq!(size_token_to_bytes("~2.00KiB"), Some(2048));
        assert_eq!(size_token_to_bytes("Unknown"), None);
        assert_eq!(humanize_size_token("512.00KiB").as_deref(), Some("512 KB"));
        assert_eq!(humanize_bytes(3 * 1024 * 1024), "3.00 MB");
        assert_eq!(summarize_file_size(10), "10 bytes");
        assert_eq!(summarize_file_size(1536), "1.5 KB");
    }
}
