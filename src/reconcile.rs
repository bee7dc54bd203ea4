//! Requested vs. available/obtained video quality.
//!
//! Both probes are advisory: any failure (missing tool, timeout, unparsable
//! output) yields `None` and the download proceeds with the requested tier.

use crate::cmd::{self, CommandRunError};
use crate::config::DownloaderSettings;
use crate::ffmpeg;
use crate::paths::AppPaths;
use crate::presets::QualityPreset;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

pub const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(10);
pub const BACKGROUND_PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(8);
pub const POSTFLIGHT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityReconciliationResult {
    pub requested_tier: u32,
    pub available_max_tier: Option<u32>,
    pub actual_tier: Option<u32>,
    pub adjusted: bool,
}

impl QualityReconciliationResult {
    /// Tier to download at (pre-flight) or to display (post-flight).
    pub fn effective_tier(&self) -> u32 {
        if !self.adjusted {
            return self.requested_tier;
        }
        self.actual_tier
            .or(self.available_max_tier)
            .unwrap_or(self.requested_tier)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreflightPlan {
    /// Audio presets and users who turned the check off.
    Skip,
    /// Probe first, then start with the possibly lowered tier.
    Blocking,
    /// Start right away and correct the label when the probe answers.
    Background,
}

pub fn plan_preflight(preset: &QualityPreset, settings: &DownloaderSettings) -> PreflightPlan {
    if !preset.is_video() || settings.skip_format_check {
        PreflightPlan::Skip
    } else if settings.background_format_check {
        PreflightPlan::Background
    } else {
        PreflightPlan::Blocking
    }
}

fn dimensions_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{2,5})x(\d{2,5})$").unwrap())
}

/// Highest vertical resolution mentioned in a `--list-formats` table, from
/// `<w>x<h>` or `<n>p` tokens.
pub fn parse_max_resolution(listing: &str) -> Option<u32> {
    let re = dimensions_re();
    let mut max = 0u32;
    for token in listing.split_whitespace() {
        let height = if let Some(caps) = re.captures(token) {
            caps.get(2).and_then(|m| m.as_str().parse::<u32>().ok())
        } else if let Some(num) = token.strip_suffix('p') {
            num.parse::<u32>().ok()
        } else {
            None
        };
        if let Some(h) = height {
            max = max.max(h);
        }
    }
    (max > 0).then_some(max)
}

/// Runs the format listing; returns the maximum available height.
pub fn probe_max_resolution(
    paths: &AppPaths,
    url: &str,
    no_playlist: bool,
    timeout: Duration,
) -> Option<u32> {
    let mut command = cmd::command(paths.ytdlp_cmd());
    command.arg("--list-formats");
    if no_playlist {
        command.arg("--no-playlist");
    }
    command.arg(url);

    let output = match cmd::output_with_timeout(&mut command, timeout) {
        Ok(output) => output,
        Err(err @ CommandRunError::TimedOut(_)) => {
            tracing::debug!(%url, error = %err, "format listing timed out");
            return None;
        }
        Err(err) => {
            tracing::warn!(%url, error = %err, "format listing failed");
            return None;
        }
    };
    if !output.status.success() {
        tracing::debug!(%url, code = ?output.status.code(), "format listing exited non-zero");
        return None;
    }
    parse_max_resolution(&String::from_utf8_lossy(&output.stdout))
}

/// Compares the request with the listing's maximum. `adjusted` only when the
/// source tops out below the requested tier.
pub fn compare_available(
    requested_tier: u32,
    available_max: Option<u32>,
) -> QualityReconciliationResult {
    let adjusted = matches!(available_max, Some(max) if max < requested_tier);
    QualityReconciliationResult {
        requested_tier,
        available_max_tier: available_max,
        actual_tier: None,
        adjusted,
    }
}

/// Compares the request with the artifact's encoded height.
pub fn compare_actual(
    requested_tier: u32,
    actual_height: Option<u32>,
) -> QualityReconciliationResult {
    let adjusted = matches!(actual_height, Some(h) if h != requested_tier);
    QualityReconciliationResult {
        requested_tier,
        available_max_tier: None,
        actual_tier: actual_height,
        adjusted,
    }
}

pub fn preflight(
    paths: &AppPaths,
    url: &str,
    preset: &QualityPreset,
    no_playlist: bool,
    timeout: Duration,
) -> Option<QualityReconciliationResult> {
    let requested = preset.video_height()?;
    let max = probe_max_resolution(paths, url, no_playlist, timeout);
    Some(compare_available(requested, max))
}

pub fn postflight(
    paths: &AppPaths,
    artifact: &Path,
    requested_tier: u32,
) -> Option<QualityReconciliationResult> {
    if !artifact.is_file() {
        return None;
    }
    let dims = match ffmpeg::video_dimensions(paths, artifact, POSTFLIGHT_TIMEOUT) {
        Ok(dims) => dims,
        Err(err) => {
            tracing::debug!(path = %artifact.display(), error = %err, "post-download probe failed");
            return None;
        }
    };
    let (_, height) = dims?;
    Some(compare_actual(requested_tier, Some(height)))
}

/// Rewrites the quality part of a `Video • MP4 • 1080p` style label.
pub fn adjusted_label(label: &str, height: u32) -> String {
    let replacement = format!(" Adjusted to max quality ({height}p)");
    let mut parts: Vec<String> = label.split('•').map(str::to_string).collect();
    if parts.len() >= 3 {
        parts[2] = replacement;
        parts.join("•")
    } else {
        format!("Video • MP4 •{replacement}")
    }
}
