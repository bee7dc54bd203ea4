//! Same-name output detection, run before a worker is created.

use crate::presets::QualityPreset;
use crate::Result;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const MAX_RENAME_SUFFIX: u32 = 999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateChoice {
    Overwrite,
    Rename,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplicateResolution {
    /// Start the download. `output_stem` replaces the title in the output
    /// template when the user picked a new name.
    Proceed { output_stem: Option<String> },
    Cancelled,
}

/// Extension the finished file will carry for `preset_id`; unknown ids are
/// treated as video.
pub fn extension_for_preset(preset_id: &str) -> &'static str {
    QualityPreset::from_id(preset_id)
        .map(|p| p.expected_extension())
        .unwrap_or("mp4")
}

pub fn expected_filename(title: &str, extension: &str) -> String {
    format!("{}.{extension}", title.trim())
}

/// Approximates the download tool's `--restrict-filenames` sanitising: ASCII
/// letters, digits, `-`, `.` and `_` survive, everything else becomes `_`.
pub fn restricted_stem(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    for c in title.trim().chars() {
        let keep = c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_');
        let mapped = if keep { c } else { '_' };
        if mapped == '_' && out.ends_with('_') {
            continue;
        }
        out.push(mapped);
    }
    out.trim_matches('_').to_string()
}

/// Existing files in `dir` that the new download would collide with.
pub fn find_conflicts(dir: &Path, title: &str, extension: &str) -> Vec<PathBuf> {
    let mut names = vec![expected_filename(title, extension)];
    let restricted = restricted_stem(title);
    if !restricted.is_empty() {
        let name = expected_filename(&restricted, extension);
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
        .into_iter()
        .map(|name| dir.join(name))
        .filter(|path| path.exists())
        .collect()
}

/// `title (n).ext` with the smallest free `n`, or `title_<unix secs>.ext`
/// once 999 suffixes are taken.
pub fn unique_filename(dir: &Path, title: &str, extension: &str) -> String {
    let title = title.trim();
    for n in 1..=MAX_RENAME_SUFFIX {
        let candidate = format!("{title} ({n}).{extension}");
        if !dir.join(&candidate).exists() {
            return candidate;
        }
    }
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{title}_{ts}.{extension}")
}

/// Applies the user's decision for a detected conflict.
pub fn resolve(
    dir: &Path,
    title: &str,
    extension: &str,
    choice: DuplicateChoice,
) -> Result<DuplicateResolution> {
    match choice {
        DuplicateChoice::Cancel => Ok(DuplicateResolution::Cancelled),
        DuplicateChoice::Overwrite => {
            for path in find_conflicts(dir, title, extension) {
                // The tool refuses to overwrite, so the old file has to go first.
                std::fs::remove_file(&path)?;
                tracing::info!(path = %path.display(), "removed existing file before overwrite");
            }
            Ok(DuplicateResolution::Proceed { output_stem: None })
        }
        DuplicateChoice::Rename => {
            // The stem goes into the output template verbatim, where a
            // separator would turn part of the title into a folder.
            let safe_title = title.replace(['/', '\\'], "_");
            let name = unique_filename(dir, &safe_title, extension);
            let stem = name
                .strip_suffix(&format!(".{extension}"))
                .map(str::to_string)
                .unwrap_or(name);
            Ok(DuplicateResolution::Proceed {
                output_stem: Some(stem),
            })
        }
    }
}
