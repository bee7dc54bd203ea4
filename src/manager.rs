//! Active downloads keyed by URL, plus the event queue the UI context drains.
//!
//! Workers never touch UI-owned state. They push [`ManagerEvent`]s onto one
//! channel; [`DownloadManager::poll_events`] applies history updates and
//! registry removals on the caller's thread and hands the events back.

use crate::config::DownloaderSettings;
use crate::duplicates::{self, DuplicateChoice, DuplicateResolution};
use crate::history::{self, EntryStatus, NewEntry};
use crate::paths::AppPaths;
use crate::presets::QualityPreset;
use crate::reconcile::{self, PreflightPlan, QualityReconciliationResult};
use crate::tools;
use crate::worker::{DownloadRequest, DownloadWorker, WorkerEvent};
use crate::{EngineError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;

const FALLBACK_LABEL: &str = "Video • MP4 • Best available";

/// What the UI collected for one download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSpec {
    pub url: String,
    /// Title from the preview; used for the history row and duplicate check.
    pub title: String,
    pub channel: Option<String>,
    pub preset_id: String,
    /// The user's answer when an earlier attempt reported a duplicate.
    pub on_duplicate: Option<DuplicateChoice>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started {
        key: String,
        entry_id: String,
        format_label: String,
    },
    /// Nothing was started; ask the user and call again with `on_duplicate`.
    DuplicateFound { conflicts: Vec<PathBuf> },
    /// The user picked cancel on the duplicate prompt.
    Cancelled,
}

#[derive(Debug)]
pub enum ManagerEventKind {
    Worker(WorkerEvent),
    QualityAdjusted {
        result: QualityReconciliationResult,
        format_label: String,
    },
}

#[derive(Debug)]
pub struct ManagerEvent {
    /// Registry key: the trimmed source URL.
    pub key: String,
    pub entry_id: String,
    pub kind: ManagerEventKind,
}

struct ActiveDownload {
    entry_id: String,
    worker: DownloadWorker,
}

pub struct DownloadManager {
    paths: AppPaths,
    settings: DownloaderSettings,
    active: HashMap<String, ActiveDownload>,
    tx: Sender<ManagerEvent>,
    rx: Receiver<ManagerEvent>,
}

impl DownloadManager {
    pub fn new(paths: AppPaths, settings: DownloaderSettings) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            paths,
            settings,
            active: HashMap::new(),
            tx,
            rx,
        }
    }

    pub fn settings(&self) -> &DownloaderSettings {
        &self.settings
    }

    /// Applies to downloads started afterwards.
    pub fn update_settings(&mut self, settings: DownloaderSettings) {
        self.settings = settings;
    }

    pub fn is_active(&self, url: &str) -> bool {
        self.active.contains_key(url.trim())
    }

    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.active.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn start_download(&mut self, job: DownloadSpec) -> Result<StartOutcome> {
        let key = job.url.trim().to_string();
        if key.is_empty() {
            return Err(EngineError::InvalidInput("url is required".to_string()));
        }
        if self.active.contains_key(&key) {
            return Err(EngineError::InvalidInput(format!(
                "a download for {key} is already running"
            )));
        }

        let output_dir = self.settings.effective_download_dir(&self.paths);
        let title = match job.title.trim() {
            "" => key.clone(),
            t => t.to_string(),
        };

        let extension = duplicates::extension_for_preset(&job.preset_id);
        let conflicts = duplicates::find_conflicts(&output_dir, &title, extension);
        let choice = match (conflicts.is_empty(), job.on_duplicate) {
            (true, _) => None,
            (false, None) => return Ok(StartOutcome::DuplicateFound { conflicts }),
            (false, Some(DuplicateChoice::Cancel)) => return Ok(StartOutcome::Cancelled),
            (false, Some(choice)) => Some(choice),
        };

        // Checked before an overwrite removes anything.
        tools::require_ytdlp(&self.paths)?;

        let mut output_stem = None;
        if let Some(choice) = choice {
            match duplicates::resolve(&output_dir, &title, extension, choice)? {
                DuplicateResolution::Cancelled => return Ok(StartOutcome::Cancelled),
                DuplicateResolution::Proceed { output_stem: stem } => output_stem = stem,
            }
        }

        let mut preset = QualityPreset::from_id(&job.preset_id);
        let mut format_label = preset
            .map(|p| p.label())
            .unwrap_or_else(|| FALLBACK_LABEL.to_string());
        let plan = preset
            .map(|p| reconcile::plan_preflight(&p, &self.settings))
            .unwrap_or(PreflightPlan::Skip);

        let mut blocking_adjustment = None;
        if let (PreflightPlan::Blocking, Some(requested)) = (plan, preset) {
            if let Some(result) = reconcile::preflight(
                &self.paths,
                &key,
                &requested,
                self.settings.no_playlist,
                reconcile::PREFLIGHT_TIMEOUT,
            ) {
                if result.adjusted {
                    let tier = result.effective_tier();
                    tracing::info!(url = %key, requested = result.requested_tier, tier, "lowering requested quality");
                    preset = Some(QualityPreset::Video { max_height: tier });
                    format_label = reconcile::adjusted_label(&format_label, tier);
                    blocking_adjustment = Some(result);
                }
            }
        }
        let preset_id = preset.map(|p| p.id()).unwrap_or(job.preset_id.clone());

        std::fs::create_dir_all(&output_dir)?;
        let entry = history::insert_entry(
            &self.paths,
            &NewEntry {
                url: &key,
                title: &title,
                channel: job.channel.as_deref(),
                preset: &preset_id,
                format_label: &format_label,
            },
        )?;

        let request = DownloadRequest {
            url: key.clone(),
            output_dir,
            preset_id: preset_id.clone(),
            no_playlist: self.settings.no_playlist,
            channel: job.channel.clone(),
            output_stem,
        };
        let worker = DownloadWorker::with_id(entry.id.clone(), self.paths.clone(), request);

        if let Some(result) = blocking_adjustment {
            let _ = self.tx.send(ManagerEvent {
                key: key.clone(),
                entry_id: entry.id.clone(),
                kind: ManagerEventKind::QualityAdjusted {
                    result,
                    format_label: format_label.clone(),
                },
            });
        }

        history::set_status(&self.paths, &entry.id, EntryStatus::Running)?;
        let sink = self.worker_sink(&key, &entry.id, preset, &format_label);
        if let Err(err) = worker.start(sink) {
            let _ = history::mark_failed(&self.paths, &entry.id, &err.user_message());
            return Err(err);
        }

        if let (PreflightPlan::Background, Some(requested)) = (plan, preset) {
            self.spawn_background_preflight(&key, &entry.id, requested, &format_label);
        }

        self.active.insert(
            key.clone(),
            ActiveDownload {
                entry_id: entry.id.clone(),
                worker,
            },
        );
        Ok(StartOutcome::Started {
            key,
            entry_id: entry.id,
            format_label,
        })
    }

    /// Forwards worker events and runs the post-download probe on the worker
    /// thread once the artifact exists.
    fn worker_sink(
        &self,
        key: &str,
        entry_id: &str,
        preset: Option<QualityPreset>,
        format_label: &str,
    ) -> impl FnMut(WorkerEvent) + Send + 'static {
        let tx = self.tx.clone();
        let paths = self.paths.clone();
        let key = key.to_string();
        let entry_id = entry_id.to_string();
        let format_label = format_label.to_string();
        move |event| {
            let finished_path = match &event {
                WorkerEvent::Finished(outcome) => Some(outcome.output_path.clone()),
                _ => None,
            };
            let _ = tx.send(ManagerEvent {
                key: key.clone(),
                entry_id: entry_id.clone(),
                kind: ManagerEventKind::Worker(event),
            });

            let (Some(path), Some(requested)) =
                (finished_path, preset.and_then(|p| p.video_height()))
            else {
                return;
            };
            if let Some(result) = reconcile::postflight(&paths, &path, requested) {
                if result.adjusted {
                    let _ = tx.send(ManagerEvent {
                        key: key.clone(),
                        entry_id: entry_id.clone(),
                        kind: ManagerEventKind::QualityAdjusted {
                            result,
                            format_label: reconcile::adjusted_label(
                                &format_label,
                                result.effective_tier(),
                            ),
                        },
                    });
                }
            }
        }
    }

    fn spawn_background_preflight(
        &self,
        key: &str,
        entry_id: &str,
        preset: QualityPreset,
        format_label: &str,
    ) {
        let tx = self.tx.clone();
        let paths = self.paths.clone();
        let key = key.to_string();
        let entry_id = entry_id.to_string();
        let format_label = format_label.to_string();
        let no_playlist = self.settings.no_playlist;
        let spawned = thread::Builder::new()
            .name("format-check".to_string())
            .spawn(move || {
                let Some(result) = reconcile::preflight(
                    &paths,
                    &key,
                    &preset,
                    no_playlist,
                    reconcile::BACKGROUND_PREFLIGHT_TIMEOUT,
                ) else {
                    return;
                };
                if !result.adjusted {
                    return;
                }
                tracing::info!(
                    url = %key,
                    requested = result.requested_tier,
                    available = ?result.available_max_tier,
                    "background format check found a lower maximum"
                );
                let _ = tx.send(ManagerEvent {
                    key,
                    entry_id,
                    kind: ManagerEventKind::QualityAdjusted {
                        result,
                        format_label: reconcile::adjusted_label(
                            &format_label,
                            result.effective_tier(),
                        ),
                    },
                });
            });
        if let Err(err) = spawned {
            tracing::warn!(error = %err, "could not start background format check");
        }
    }

    /// Drains pending events, applying their history side effects.
    pub fn poll_events(&mut self) -> Vec<ManagerEvent> {
        let mut out = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    self.apply(&event);
                    out.push(event);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }

    fn apply(&mut self, event: &ManagerEvent) {
        let outcome = match &event.kind {
            ManagerEventKind::Worker(WorkerEvent::Finished(done)) => {
                self.retire(&event.key, &event.entry_id);
                history::mark_completed(&self.paths, &event.entry_id, &done.output_path)
            }
            ManagerEventKind::Worker(WorkerEvent::Failed(err)) => {
                self.retire(&event.key, &event.entry_id);
                history::mark_failed(&self.paths, &event.entry_id, &err.user_message())
            }
            ManagerEventKind::Worker(WorkerEvent::Cancelled) => {
                self.retire(&event.key, &event.entry_id);
                history::remove_entry(&self.paths, &event.entry_id).map(|_| ())
            }
            ManagerEventKind::QualityAdjusted { format_label, .. } => {
                history::update_format_label(&self.paths, &event.entry_id, format_label)
            }
            ManagerEventKind::Worker(_) => Ok(()),
        };
        if let Err(err) = outcome {
            tracing::warn!(entry = %event.entry_id, error = %err, "history update failed");
        }
    }

    /// Drops the registry slot only if it still belongs to `entry_id`.
    fn retire(&mut self, key: &str, entry_id: &str) {
        if self
            .active
            .get(key)
            .is_some_and(|active| active.entry_id == entry_id)
        {
            self.active.remove(key);
        }
    }

    /// Returns false when no download for `url` is running.
    pub fn cancel(&self, url: &str) -> bool {
        match self.active.get(url.trim()) {
            Some(active) => {
                active.worker.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels everything still running and waits for the workers to stop.
    pub fn shutdown(&mut self) {
        for active in self.active.values() {
            active.worker.cancel();
        }
        for active in self.active.values() {
            active.worker.join();
        }
        let _ = self.poll_events();
        self.active.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &std::path::Path) -> DownloadManager {
        let settings = DownloaderSettings {
            download_dir: Some(dir.join("out")),
            ..DownloaderSettings::default()
        };
        DownloadManager::new(AppPaths::new(dir.to_path_buf()), settings)
    }

    fn job(choice: Option<DuplicateChoice>) -> DownloadSpec {
        DownloadSpec {
            url: "https://youtu.be/abc".to_string(),
            title: "Clip".to_string(),
            channel: None,
            preset_id: "mp3_320".to_string(),
            on_duplicate: choice,
        }
    }

    #[test]
    fn duplicate_is_reported_before_anything_starts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut mgr = manager(dir.path());
        std::fs::create_dir_all(dir.path().join("out")).expect("mkdir");
        std::fs::write(dir.path().join("out").join("Clip.mp3"), b"x").expect("write");

        match mgr.start_download(job(None)).expect("start") {
            StartOutcome::DuplicateFound { conflicts } => assert_eq!(conflicts.len(), 1),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!mgr.is_active("https://youtu.be/abc"));

        assert_eq!(
            mgr.start_download(job(Some(DuplicateChoice::Cancel)))
                .expect("start"),
            StartOutcome::Cancelled
        );
        assert!(history::list_entries(&mgr.paths, 10, 0).expect("list").is_empty());
        assert!(mgr.poll_events().is_empty());
    }

    #[test]
    fn blank_url_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut mgr = manager(dir.path());
        let mut s = job(None);
        s.url = "   ".to_string();
        assert!(matches!(
            mgr.start_download(s),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(!mgr.cancel("https://youtu.be/abc"));
    }
}
