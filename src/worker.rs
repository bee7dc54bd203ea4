//! One download-tool process per worker: launch, stream its output through the
//! progress parser, validate the artifact and report a single terminal event.

use crate::cmd::{self, Termination};
use crate::diagnostics::{self, Level};
use crate::ffmpeg;
use crate::paths::AppPaths;
use crate::presets::{self, ResolvedFormat};
use crate::progress::{self, ParserContext, ProgressEvent, Stage, WarningKind};
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

pub const CANCEL_GRACE: Duration = Duration::from_secs(2);
pub const MIN_ARTIFACT_BYTES: u64 = 1024;

const LINE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Newest-file recovery ignores files older than the run start minus this.
const ARTIFACT_MTIME_SLACK: Duration = Duration::from_secs(2);
const PARTIAL_SUFFIXES: [&str; 2] = [".part", ".ytdl"];
const DIAGNOSTIC_TAIL_LINES: usize = 20;
const TOOL: &str = "yt-dlp";

/// Immutable once a worker has been built from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    pub output_dir: PathBuf,
    pub preset_id: String,
    pub no_playlist: bool,
    /// Display only.
    pub channel: Option<String>,
    /// Replaces the tool's title in the output template after a rename.
    pub output_stem: Option<String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, output_dir: impl Into<PathBuf>, preset_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            output_dir: output_dir.into(),
            preset_id: preset_id.into(),
            no_playlist: true,
            channel: None,
            output_stem: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Created,
    Running,
    Cancelling,
    Cancelled,
    Completed,
    Failed,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkerState::Cancelled | WorkerState::Completed | WorkerState::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadOutcome {
    pub output_path: PathBuf,
    pub file_bytes: u64,
    /// `x.y MB` style summary for the completion notification.
    pub size_text: String,
}

/// Outward notifications. Exactly one of `Finished`, `Failed` or `Cancelled`
/// ends every started worker, and nothing follows it.
#[derive(Debug)]
pub enum WorkerEvent {
    ProgressChanged(u8),
    SizeTextChanged(String),
    StatusTextChanged(String),
    Warning { kind: WarningKind, text: String },
    Finished(DownloadOutcome),
    Failed(EngineError),
    Cancelled,
}

impl WorkerEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerEvent::Finished(_) | WorkerEvent::Failed(_) | WorkerEvent::Cancelled
        )
    }
}

struct Shared {
    cancel: AtomicBool,
    state: Mutex<WorkerState>,
    child: Mutex<Option<Child>>,
    destination: Mutex<Option<PathBuf>>,
}

pub struct DownloadWorker {
    id: String,
    paths: AppPaths,
    request: DownloadRequest,
    format: ResolvedFormat,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadWorker {
    pub fn new(paths: AppPaths, request: DownloadRequest) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), paths, request)
    }

    /// `id` doubles as the diagnostic log scope.
    pub fn with_id(id: String, paths: AppPaths, request: DownloadRequest) -> Self {
        let format = presets::resolve(&request.preset_id);
        Self {
            id,
            paths,
            request,
            format,
            shared: Arc::new(Shared {
                cancel: AtomicBool::new(false),
                state: Mutex::new(WorkerState::Created),
                child: Mutex::new(None),
                destination: Mutex::new(None),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request(&self) -> &DownloadRequest {
        &self.request
    }

    pub fn state(&self) -> WorkerState {
        *lock(&self.shared.state)
    }

    pub fn build_args(&self) -> Vec<String> {
        build_args(&self.request, &self.format)
    }

    /// Launches the run on its own thread; `sink` receives every event.
    pub fn start<F>(&self, sink: F) -> Result<()>
    where
        F: FnMut(WorkerEvent) + Send + 'static,
    {
        {
            let mut state = lock(&self.shared.state);
            if *state != WorkerState::Created {
                return Err(EngineError::InvalidInput(format!(
                    "worker {} cannot start from state {:?}",
                    self.id, *state
                )));
            }
            *state = WorkerState::Running;
        }

        let mut run = Run {
            id: self.id.clone(),
            paths: self.paths.clone(),
            request: self.request.clone(),
            format: self.format.clone(),
            shared: Arc::clone(&self.shared),
            sink,
            last_percent: 0,
            size_text: None,
            status_text: None,
            started_at: SystemTime::now(),
        };
        let spawned = thread::Builder::new()
            .name(format!("download-{}", short_id(&self.id)))
            .spawn(move || run.run());
        match spawned {
            Ok(handle) => {
                *lock(&self.handle) = Some(handle);
                Ok(())
            }
            Err(err) => {
                *lock(&self.shared.state) = WorkerState::Failed;
                Err(EngineError::Io(err))
            }
        }
    }

    pub fn start_with_channel(&self) -> Result<Receiver<WorkerEvent>> {
        let (tx, rx) = mpsc::channel();
        self.start(move |event| {
            let _ = tx.send(event);
        })?;
        Ok(rx)
    }

    /// Stops the tool (graceful, then forced after [`CANCEL_GRACE`]) and
    /// removes partial files. A no-op once the worker has finished.
    pub fn cancel(&self) {
        {
            let mut state = lock(&self.shared.state);
            match *state {
                WorkerState::Created => {
                    self.shared.cancel.store(true, Ordering::SeqCst);
                    *state = WorkerState::Cancelled;
                    return;
                }
                WorkerState::Running => {
                    self.shared.cancel.store(true, Ordering::SeqCst);
                    *state = WorkerState::Cancelling;
                }
                _ => return,
            }
        }

        let termination = stop_child(&self.shared);
        let destination = lock(&self.shared.destination).clone();
        let removed = cleanup_partial_files(&self.request.output_dir, destination.as_deref());
        tracing::info!(
            worker = %self.id,
            ?termination,
            removed_partials = removed,
            "download cancel requested"
        );
    }

    /// Blocks until the worker thread has emitted its terminal event.
    pub fn join(&self) {
        let handle = lock(&self.handle).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

/// Full argument list for the download tool, URL last.
pub fn build_args(request: &DownloadRequest, format: &ResolvedFormat) -> Vec<String> {
    let stem = match request.output_stem.as_deref().map(str::trim) {
        Some(stem) if !stem.is_empty() => stem.replace('%', "%%"),
        _ => "%(title)s".to_string(),
    };
    let template = request.output_dir.join(format!("{stem}.%(ext)s"));

    let mut args = vec![
        "-f".to_string(),
        format.selector.clone(),
        "-o".to_string(),
        template.to_string_lossy().to_string(),
        "--newline".to_string(),
        "--progress".to_string(),
        "--no-overwrites".to_string(),
        "--restrict-filenames".to_string(),
    ];
    if let Some(container) = format.merge_output_format {
        args.push("--merge-output-format".to_string());
        args.push(container.to_string());
    }
    if request.no_playlist {
        args.push("--no-playlist".to_string());
    }
    args.extend(format.post_args.iter().cloned());
    args.push(request.url.trim().to_string());
    args
}

/// Deletes `*.part` / `*.ytdl` in `output_dir`, plus the same suffixes next
/// to `destination` when its base name is known. Returns how many went.
pub fn cleanup_partial_files(output_dir: &Path, destination: Option<&Path>) -> usize {
    let mut removed = remove_matching(output_dir, |name| has_partial_suffix(name));
    if let Some(dest) = destination {
        let parent = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => output_dir,
        };
        if let Some(stem) = dest.file_stem().map(|s| s.to_string_lossy().to_string()) {
            removed += remove_matching(parent, |name| {
                name.starts_with(stem.as_str()) && has_partial_suffix(name)
            });
        }
    }
    removed
}

fn has_partial_suffix(name: &str) -> bool {
    PARTIAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

fn is_partial(name: &str) -> bool {
    has_partial_suffix(name) || name.contains(".part-Frag")
}

fn remove_matching(dir: &Path, matches: impl Fn(&str) -> bool) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !matches(&name) {
            continue;
        }
        let path = entry.path();
        if path.is_file() && std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    removed
}

/// Most recently modified finished file in `dir` not older than `not_before`.
fn newest_file(dir: &Path, not_before: SystemTime) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || is_partial(&name) {
                return None;
            }
            let meta = entry.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            let modified = meta.modified().ok()?;
            (modified >= not_before).then(|| (modified, entry.path()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

fn stop_child(shared: &Shared) -> Option<Termination> {
    let mut guard = lock(&shared.child);
    guard.as_mut().map(|child| cmd::terminate(child, CANCEL_GRACE))
}

fn spawn_line_reader(pipe: impl Read + Send + 'static, tx: Sender<String>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

struct Run<F> {
    id: String,
    paths: AppPaths,
    request: DownloadRequest,
    format: ResolvedFormat,
    shared: Arc<Shared>,
    sink: F,
    last_percent: u8,
    size_text: Option<String>,
    status_text: Option<String>,
    started_at: SystemTime,
}

impl<F> Run<F>
where
    F: FnMut(WorkerEvent),
{
    fn run(&mut self) {
        let result = self.execute();
        self.finish(result);
    }

    fn cancelled(&self) -> bool {
        self.shared.cancel.load(Ordering::SeqCst)
    }

    fn emit(&mut self, event: WorkerEvent) {
        (self.sink)(event);
    }

    fn emit_progress(&mut self, percent: u8) {
        if percent > self.last_percent {
            self.last_percent = percent;
            self.emit(WorkerEvent::ProgressChanged(percent));
        }
    }

    fn emit_status(&mut self, text: &str) {
        if self.status_text.as_deref() != Some(text) {
            self.status_text = Some(text.to_string());
            self.emit(WorkerEvent::StatusTextChanged(text.to_string()));
        }
    }

    fn log(&self, level: Level, event: &str, data: serde_json::Value) {
        if let Err(err) = diagnostics::log_line(&self.paths, &self.id, level, event, data) {
            tracing::debug!(worker = %self.id, error = %err, "diagnostic log write failed");
        }
    }

    fn execute(&mut self) -> Result<DownloadOutcome> {
        let args = build_args(&self.request, &self.format);
        tracing::info!(
            worker = %self.id,
            url = %self.request.url,
            preset = %self.request.preset_id,
            "download started"
        );
        self.log(
            Level::Info,
            "started",
            json!({
                "url": self.request.url,
                "preset": self.request.preset_id,
                "output_dir": self.request.output_dir.to_string_lossy(),
                "args": args,
            }),
        );

        std::fs::create_dir_all(&self.request.output_dir).map_err(|e| {
            EngineError::from_io(
                &format!("create {}", self.request.output_dir.display()),
                e,
            )
        })?;

        if !self.format.post_args.is_empty() && !ffmpeg::ffmpeg_available(&self.paths) {
            let text = "ffmpeg was not found; audio conversion may fail.".to_string();
            self.log(Level::Warn, "transcoder_missing", json!({}));
            self.emit(WorkerEvent::Warning {
                kind: WarningKind::Transcoder,
                text,
            });
        }

        self.emit_status("Starting download…");

        let mut command = cmd::command(self.paths.ytdlp_cmd());
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .map_err(|e| EngineError::from_spawn(TOOL, e))?;

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, tx.clone());
        }
        drop(tx);
        *lock(&self.shared.child) = Some(child);

        let mut ctx = ParserContext::default();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(DIAGNOSTIC_TAIL_LINES);
        let mut unclassified_error: Option<String> = None;
        let mut fatal: Option<EngineError> = None;

        loop {
            if self.cancelled() {
                break;
            }
            let line = match rx.recv_timeout(LINE_POLL_INTERVAL) {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if tail.len() == DIAGNOSTIC_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.clone());

            let Some(event) = progress::parse_line(&line, &mut ctx) else {
                continue;
            };
            if let Some(err) = self.handle_event(event, &mut unclassified_error) {
                fatal = Some(err);
                break;
            }
            if ctx.destination.is_some() {
                *lock(&self.shared.destination) = ctx.destination.clone();
            }
        }

        if self.cancelled() {
            stop_child(&self.shared);
            return Err(EngineError::Cancelled);
        }
        if let Some(err) = fatal {
            stop_child(&self.shared);
            return Err(err);
        }

        let status = self.wait_for_exit()?;
        if self.cancelled() {
            return Err(EngineError::Cancelled);
        }

        if !status.success() || unclassified_error.is_some() {
            let detail = unclassified_error
                .unwrap_or_else(|| tail.iter().cloned().collect::<Vec<_>>().join("\n"));
            return Err(EngineError::ExternalToolError {
                tool: TOOL.to_string(),
                code: status.code(),
                detail,
            });
        }

        let outcome = self.validate(&ctx)?;
        let completed = ProgressEvent::Completed {
            output_path: outcome.output_path.clone(),
        };
        self.handle_event(completed, &mut None);
        Ok(outcome)
    }

    /// Maps one parsed line to outward events. Returns the error that must
    /// abort the run, if any.
    fn handle_event(
        &mut self,
        event: ProgressEvent,
        unclassified_error: &mut Option<String>,
    ) -> Option<EngineError> {
        match event {
            ProgressEvent::StageStarted { percent, path, .. } => {
                tracing::debug!(worker = %self.id, destination = %path.display(), "destination");
                self.emit_progress(percent);
                self.emit_status("Downloading…");
            }
            ProgressEvent::PercentUpdate(update) => {
                self.emit_progress(update.percent);
                if let Some(size) = update.size_text {
                    if self.size_text.as_deref() != Some(size.as_str()) {
                        self.size_text = Some(size.clone());
                        self.emit(WorkerEvent::SizeTextChanged(size));
                    }
                }
                if let Some(status) = update.status_text {
                    self.emit_status(&status);
                }
            }
            ProgressEvent::StageTransition { to, percent, .. } => {
                self.emit_progress(percent);
                match to {
                    Stage::Download => {}
                    Stage::Convert => self.emit_status("Converting…"),
                    Stage::Finalize => self.emit_status("Finalizing…"),
                }
            }
            ProgressEvent::Crawl { percent, .. } => {
                self.emit_progress(percent);
                self.emit_status("Processing…");
            }
            ProgressEvent::Warning { kind, text } => {
                tracing::warn!(worker = %self.id, ?kind, line = %text, "download tool warning");
                self.log(
                    Level::Warn,
                    "tool_warning",
                    json!({ "kind": format!("{kind:?}"), "line": text }),
                );
                self.emit(WorkerEvent::Warning { kind, text });
            }
            ProgressEvent::Error { kind, message, raw } => {
                self.log(
                    Level::Error,
                    "tool_error_line",
                    json!({ "kind": format!("{kind:?}"), "message": message, "line": raw }),
                );
                if kind == progress::FailureKind::Tool {
                    unclassified_error.get_or_insert(message);
                    return None;
                }
                return Some(kind.into_error(message));
            }
            ProgressEvent::Completed { output_path } => {
                tracing::debug!(worker = %self.id, path = %output_path.display(), "artifact validated");
                self.emit_progress(progress::COMPLETE_PERCENT);
                self.emit_status("Download complete");
            }
        }
        None
    }

    fn wait_for_exit(&self) -> Result<ExitStatus> {
        loop {
            {
                let mut guard = lock(&self.shared.child);
                let Some(child) = guard.as_mut() else {
                    return Err(EngineError::ProcessLaunchFailed {
                        tool: TOOL.to_string(),
                        message: "process handle missing".to_string(),
                    });
                };
                let polled = child
                    .try_wait()
                    .map_err(|e| EngineError::from_io("wait for download tool", e))?;
                if let Some(status) = polled {
                    return Ok(status);
                }
            }
            if self.cancelled() {
                stop_child(&self.shared);
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    fn locate_artifact(&self, ctx: &ParserContext) -> Option<PathBuf> {
        if let Some(dest) = &ctx.destination {
            let converted = dest.with_extension(self.format.expected_extension);
            for candidate in [dest.clone(), converted] {
                let name = candidate
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                if candidate.is_file() && !is_partial(&name) {
                    return Some(candidate);
                }
            }
        }
        let not_before = self
            .started_at
            .checked_sub(ARTIFACT_MTIME_SLACK)
            .unwrap_or(self.started_at);
        newest_file(&self.request.output_dir, not_before)
    }

    fn validate(&mut self, ctx: &ParserContext) -> Result<DownloadOutcome> {
        let Some(path) = self.locate_artifact(ctx) else {
            return Err(EngineError::NoArtifactProduced(
                "The download finished but no output file was found.".to_string(),
            ));
        };
        let bytes = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(EngineError::from_io(&format!("read {}", path.display()), e));
            }
            Err(_) => {
                return Err(EngineError::NoArtifactProduced(format!(
                    "The output file {} does not exist.",
                    path.display()
                )))
            }
        };
        if bytes < MIN_ARTIFACT_BYTES {
            return Err(EngineError::ArtifactTooSmall { path, bytes });
        }
        if !ctx.real_progress {
            return Err(EngineError::NoArtifactProduced(
                "The download reported success but no progress was observed. The requested format may not be available."
                    .to_string(),
            ));
        }
        if let Some(expected) = ctx.total_bytes {
            if bytes.saturating_mul(10) < expected {
                let text = format!(
                    "Output is {} but {} was expected.",
                    progress::summarize_file_size(bytes),
                    progress::summarize_file_size(expected)
                );
                self.log(
                    Level::Warn,
                    "artifact_smaller_than_expected",
                    json!({ "bytes": bytes, "expected_bytes": expected }),
                );
                self.emit(WorkerEvent::Warning {
                    kind: WarningKind::UnexpectedSize,
                    text,
                });
            }
        }

        Ok(DownloadOutcome {
            size_text: progress::summarize_file_size(bytes),
            output_path: path,
            file_bytes: bytes,
        })
    }

    fn finish(&mut self, result: Result<DownloadOutcome>) {
        let result = {
            let mut state = lock(&self.shared.state);
            let result = if self.cancelled() {
                Err(EngineError::Cancelled)
            } else {
                result
            };
            *state = match &result {
                Ok(_) => WorkerState::Completed,
                Err(e) if e.is_cancelled() => WorkerState::Cancelled,
                Err(_) => WorkerState::Failed,
            };
            result
        };

        match result {
            Ok(outcome) => {
                tracing::info!(
                    worker = %self.id,
                    path = %outcome.output_path.display(),
                    bytes = outcome.file_bytes,
                    "download completed"
                );
                self.log(
                    Level::Info,
                    "completed",
                    json!({
                        "output_path": outcome.output_path.to_string_lossy(),
                        "file_bytes": outcome.file_bytes,
                    }),
                );
                self.emit(WorkerEvent::Finished(outcome));
            }
            Err(EngineError::Cancelled) => {
                let destination = lock(&self.shared.destination).clone();
                let removed =
                    cleanup_partial_files(&self.request.output_dir, destination.as_deref());
                tracing::info!(worker = %self.id, removed_partials = removed, "download cancelled");
                self.log(Level::Info, "cancelled", json!({ "removed_partials": removed }));
                self.emit(WorkerEvent::Cancelled);
            }
            Err(err) => {
                tracing::warn!(worker = %self.id, error = %err, "download failed");
                self.log(
                    Level::Error,
                    "failed",
                    json!({ "error": err.to_string(), "message": err.user_message() }),
                );
                self.emit(WorkerEvent::ProgressChanged(0));
                self.emit(WorkerEvent::Failed(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dir: &Path, preset: &str) -> DownloadRequest {
        DownloadRequest::new("https://youtu.be/abc", dir, preset)
    }

    #[test]
    fn video_args_merge_to_mp4_and_skip_playlists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let req = request(dir.path(), "video_720");
        let args = build_args(&req, &presets::resolve("video_720"));

        let f = args.iter().position(|a| a == "-f").expect("-f");
        assert!(args[f + 1].contains("height<=720"));
        let o = args.iter().position(|a| a == "-o").expect("-o");
        assert!(args[o + 1].ends_with("%(title)s.%(ext)s"));
        for flag in ["--newline", "--progress", "--no-overwrites", "--restrict-filenames", "--no-playlist"] {
            assert!(args.iter().any(|a| a == flag), "{flag}");
        }
        let m = args
            .iter()
            .position(|a| a == "--merge-output-format")
            .expect("merge");
        assert_eq!(args[m + 1], "mp4");
        assert_eq!(args.last().map(String::as_str), Some("https://youtu.be/abc"));
        assert!(!args.iter().any(|a| a == "--extract-audio"));
    }

    #[test]
    fn audio_args_carry_codec_and_renamed_stem() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut req = request(dir.path(), "mp3_192");
        req.no_playlist = false;
        req.output_stem = Some("Song (1) 100%".to_string());
        let args = build_args(&req, &presets::resolve("mp3_192"));

        let o = args.iter().position(|a| a == "-o").expect("-o");
        assert!(args[o + 1].ends_with("Song (1) 100%%.%(ext)s"));
        assert!(args.iter().any(|a| a == "--extract-audio"));
        assert!(args.iter().any(|a| a == "192k"));
        assert!(args.iter().any(|a| a == "ffmpeg:-acodec libmp3lame"));
        assert!(!args.iter().any(|a| a == "--no-playlist"));
        assert!(!args.iter().any(|a| a == "--merge-output-format"));
    }

    #[test]
    fn cleanup_removes_partials_in_dir_and_next_to_destination() {
        let dir = tempfile::tempdir().expect("tempdir");
        let other = dir.path().join("elsewhere");
        std::fs::create_dir_all(&other).expect("mkdir");
        for name in ["a.mp4.part", "a.mp4.ytdl", "keep.mp4"] {
            std::fs::write(dir.path().join(name), b"x").expect("write");
        }
        std::fs::write(other.join("Clip.f137.mp4.part"), b"x").expect("write");
        std::fs::write(other.join("Other.mp4.part"), b"x").expect("write");

        let removed = cleanup_partial_files(dir.path(), Some(&other.join("Clip.f137.mp4")));
        assert_eq!(removed, 3);
        assert!(dir.path().join("keep.mp4").exists());
        assert!(!dir.path().join("a.mp4.part").exists());
        assert!(other.join("Other.mp4.part").exists());
    }

    #[test]
    fn newest_file_skips_partials_and_old_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let old = dir.path().join("old.mp4");
        std::fs::write(&old, b"x").expect("write");
        let long_ago = SystemTime::now() - Duration::from_secs(3600);
        filetime::set_file_mtime(&old, filetime::FileTime::from_system_time(long_ago))
            .expect("age");
        std::fs::write(dir.path().join("new.mp4.part"), b"x").expect("write");

        let cutoff = SystemTime::now() - Duration::from_secs(60);
        assert_eq!(newest_file(dir.path(), cutoff), None);

        std::fs::write(dir.path().join("new.mp4"), b"x").expect("write");
        assert_eq!(newest_file(dir.path(), cutoff), Some(dir.path().join("new.mp4")));
    }

    #[cfg(unix)]
    #[test]
    fn unwritable_output_folder_fails_with_permission_error() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let locked = dir.path().join("locked");
        std::fs::create_dir_all(&locked).expect("mkdir");
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).expect("chmod");
        if std::fs::write(locked.join("write-check"), b"x").is_ok() {
            // Running as root; mode bits are not enforced.
            return;
        }

        let worker = DownloadWorker::new(
            AppPaths::new(dir.path().to_path_buf()),
            request(&locked.join("out"), "video_720"),
        );
        let rx = worker.start_with_channel().expect("start");
        let last = rx
            .iter()
            .find(WorkerEvent::is_terminal)
            .expect("terminal event");
        worker.join();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        match last {
            WorkerEvent::Failed(err @ EngineError::PermissionDenied(_)) => {
                assert!(err.user_message().starts_with("Permission error"));
            }
            other => panic!("unexpected terminal event: {other:?}"),
        }
        assert_eq!(worker.state(), WorkerState::Failed);
    }

    #[test]
    fn cancel_before_start_is_terminal_and_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let worker = DownloadWorker::new(
            AppPaths::new(dir.path().to_path_buf()),
            request(dir.path(), "video_1080"),
        );
        assert_eq!(worker.state(), WorkerState::Created);
        worker.cancel();
        worker.cancel();
        assert_eq!(worker.state(), WorkerState::Cancelled);
        assert!(worker.start(|_| {}).is_err());
    }
}
