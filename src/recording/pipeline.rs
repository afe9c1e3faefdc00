use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::capture::{CaptureDevice, CaptureFactory, CaptureOptions, ChunkSink};
use super::chunk::{Chunk, ChunkBuffer};
use super::recovery::{clear_after_success, FailureMarker, FailureMarkerStore};
use super::upload::{ProgressSink, UploadError, UploadPolicy, Uploader};
use crate::clock::Clock;
use crate::config::RecorderSettings;
use crate::media::MediaStream;
use crate::notify::{NoticeLevel, Notifier};
use crate::schedule::PeriodicTask;
use crate::transport::ProctoringApi;
use crate::violation::{metadata, Metadata, ViolationType};

/// Reports recorder faults (init failure, capture errors) as violations.
pub type RecorderFaultHook = Arc<dyn Fn(ViolationType, Metadata) + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadPhase {
    #[default]
    Idle,
    Uploading,
    Completed,
    Error,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UploadState {
    pub progress: u8,
    pub status: UploadPhase,
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Nothing (or too little) buffered, or no session to attribute it to.
    Skipped,
    Uploaded,
    Failed,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecordingInfo {
    pub is_recording: bool,
    pub session_id: Option<String>,
    pub chunk_count: usize,
    pub buffered_bytes: usize,
    pub mime_type: String,
    pub upload: UploadState,
}

/// Collaborators of a recording pipeline.
#[derive(Clone)]
pub struct RecorderDeps {
    pub api: Arc<dyn ProctoringApi>,
    pub capture: Arc<dyn CaptureFactory>,
    pub markers: Arc<dyn FailureMarkerStore>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
    pub progress: Option<Arc<dyn ProgressSink>>,
}

struct Shared {
    settings: RecorderSettings,
    uploader: Uploader,
    deps: RecorderDeps,
    fault_hook: Mutex<Option<RecorderFaultHook>>,
    session_id: Mutex<Option<String>>,
    buffer: Mutex<ChunkBuffer>,
    upload_gate: Mutex<()>,
    device: Mutex<Option<Box<dyn CaptureDevice>>>,
    recording: AtomicBool,
    upload_state: Mutex<UploadState>,
    auto_save: Mutex<Option<PeriodicTask>>,
    final_outcome: Mutex<Option<SaveOutcome>>,
}

/// Screen recording capture with chunked, retried uploads.
///
/// Chunks accumulate in memory for the whole recording. Intermediate saves upload the
/// assembled buffer without clearing it; only a successful final upload clears it.
pub struct RecordingPipeline {
    shared: Arc<Shared>,
}

impl RecordingPipeline {
    pub fn new(settings: RecorderSettings, deps: RecorderDeps) -> Self {
        let uploader = Uploader::new(
            deps.api.clone(),
            UploadPolicy {
                max_retries: settings.upload_max_retries,
                base_delay: settings.retry_base_delay,
                large_upload_bytes: settings.large_upload_bytes,
                part_bytes: settings.upload_part_bytes,
            },
        );
        Self {
            shared: Arc::new(Shared {
                settings,
                uploader,
                deps,
                fault_hook: Mutex::new(None),
                session_id: Mutex::new(None),
                buffer: Mutex::new(ChunkBuffer::default()),
                upload_gate: Mutex::new(()),
                device: Mutex::new(None),
                recording: AtomicBool::new(false),
                upload_state: Mutex::new(UploadState::default()),
                auto_save: Mutex::new(None),
                final_outcome: Mutex::new(None),
            }),
        }
    }

    pub fn set_fault_hook(&self, hook: RecorderFaultHook) {
        if let Ok(mut slot) = self.shared.fault_hook.lock() {
            *slot = Some(hook);
        }
    }

    pub fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::SeqCst)
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.session_id.lock().ok().and_then(|s| s.clone())
    }

    pub fn chunk_count(&self) -> usize {
        self.shared.buffer.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn buffered_bytes(&self) -> usize {
        self.shared.buffer.lock().map(|b| b.total_bytes()).unwrap_or(0)
    }

    pub fn upload_state(&self) -> UploadState {
        self.shared
            .upload_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn recording_info(&self) -> RecordingInfo {
        let (chunk_count, buffered_bytes) = self
            .shared
            .buffer
            .lock()
            .map(|b| (b.len(), b.total_bytes()))
            .unwrap_or((0, 0));
        RecordingInfo {
            is_recording: self.is_recording(),
            session_id: self.session_id(),
            chunk_count,
            buffered_bytes,
            mime_type: self.shared.settings.mime_type.clone(),
            upload: self.upload_state(),
        }
    }

    /// Starts capturing `stream` attributed to `session_id`, plus the auto-save timer.
    pub fn start(&self, stream: &MediaStream, session_id: &str) -> Result<()> {
        if self.is_recording() {
            log::warn!("recording already active; start ignored");
            return Ok(());
        }
        self.set_session(session_id);

        let options = CaptureOptions {
            mime_type: self.shared.settings.mime_type.clone(),
            video_bitrate: self.shared.settings.video_bitrate,
            audio_bitrate: self.shared.settings.audio_bitrate,
        };
        let sink: Arc<dyn ChunkSink> = Arc::new(PipelineSink {
            shared: Arc::downgrade(&self.shared),
        });
        let mut device = match self.shared.deps.capture.create(stream, &options, sink) {
            Ok(device) => device,
            Err(err) => {
                self.shared.report_fault(ViolationType::MediaRecorderInitFailed, &err);
                return Err(err.context("create capture device"));
            }
        };
        if let Err(err) = device.start(self.shared.settings.timeslice) {
            self.shared.report_fault(ViolationType::MediaRecorderInitFailed, &err);
            return Err(err.context("start capture device"));
        }
        {
            let mut slot = self
                .shared
                .device
                .lock()
                .map_err(|_| anyhow!("capture device slot poisoned"))?;
            *slot = Some(device);
        }
        self.shared.recording.store(true, Ordering::SeqCst);
        self.shared.set_upload_state(UploadState::default());

        let weak = Arc::downgrade(&self.shared);
        let task = PeriodicTask::spawn(
            "recording-autosave",
            self.shared.settings.auto_save_interval,
            move || {
                if let Some(shared) = weak.upgrade() {
                    shared.save_intermediate();
                }
            },
        )?;
        if let Ok(mut slot) = self.shared.auto_save.lock() {
            *slot = Some(task);
        }
        log::info!(
            "screen recording started for session {} ({}, timeslice {:?})",
            session_id,
            options.mime_type,
            self.shared.settings.timeslice
        );
        Ok(())
    }

    /// Stops capture. The device's stop event triggers the final upload, whose outcome
    /// is returned.
    pub fn stop(&self) -> SaveOutcome {
        self.shared.stop_auto_save();
        let device = self.shared.device.lock().ok().and_then(|mut d| d.take());
        let Some(mut device) = device else {
            log::debug!("stop requested with no active capture device");
            return SaveOutcome::Skipped;
        };
        self.shared.recording.store(false, Ordering::SeqCst);
        if let Err(err) = device.stop() {
            log::error!("capture device failed to stop cleanly: {:#}", err);
            self.shared.upload_final();
        }
        self.shared
            .final_outcome
            .lock()
            .ok()
            .and_then(|mut o| o.take())
            .unwrap_or(SaveOutcome::Skipped)
    }

    /// Uploads everything buffered so far as a non-final chunk. The buffer is kept.
    pub fn save_intermediate(&self) -> SaveOutcome {
        self.shared.save_intermediate()
    }

    /// Switches attribution, saving unflushed chunks under the old id first.
    pub fn update_session_id(&self, session_id: &str) {
        if self.session_id().as_deref() == Some(session_id) {
            return;
        }
        if self.is_recording() && self.chunk_count() > 0 {
            log::info!("saving recording before session id change");
            self.save_intermediate();
        }
        self.set_session(session_id);
    }

    /// Aborts in-flight uploads; their retry loops stop without another attempt.
    pub fn cancel_upload(&self) {
        self.shared.uploader.cancel();
        log::warn!("recording upload cancelled");
    }

    fn set_session(&self, session_id: &str) {
        if let Ok(mut slot) = self.shared.session_id.lock() {
            *slot = Some(session_id.to_string());
        }
        log::info!("recording attributed to session {}", session_id);
    }
}

impl Shared {
    fn report_fault(&self, kind: ViolationType, err: &anyhow::Error) {
        log::error!("{}: {:#}", kind, err);
        let hook = self.fault_hook.lock().ok().and_then(|h| h.clone());
        if let Some(hook) = hook {
            hook(
                kind,
                metadata([("error", serde_json::Value::String(format!("{:#}", err)))]),
            );
        }
    }

    fn set_upload_state(&self, state: UploadState) {
        if let Ok(mut slot) = self.upload_state.lock() {
            *slot = state;
        }
    }

    fn stop_auto_save(&self) {
        let task = self.auto_save.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            task.stop();
        }
    }

    fn save_intermediate(&self) -> SaveOutcome {
        let Ok(_gate) = self.upload_gate.lock() else {
            return SaveOutcome::Skipped;
        };
        let buffered = self.buffer.lock().map(|b| b.total_bytes()).unwrap_or(0);
        if buffered == 0 || buffered < self.settings.auto_save_min_bytes {
            log::debug!("intermediate save skipped ({} bytes buffered)", buffered);
            return SaveOutcome::Skipped;
        }
        match self.upload(false) {
            Ok(()) => SaveOutcome::Uploaded,
            Err(UploadError::Cancelled) => SaveOutcome::Cancelled,
            Err(UploadError::MissingSession) => SaveOutcome::Skipped,
            Err(err) => {
                self.deps.notifier.notify(
                    NoticeLevel::Warning,
                    "Auto-save of the screen recording failed. Recording continues.",
                );
                log::warn!("intermediate save failed: {}", err);
                SaveOutcome::Failed
            }
        }
    }

    fn upload_final(&self) -> SaveOutcome {
        let outcome = self.upload_final_inner();
        if let Ok(mut slot) = self.final_outcome.lock() {
            *slot = Some(outcome);
        }
        outcome
    }

    fn upload_final_inner(&self) -> SaveOutcome {
        let Ok(_gate) = self.upload_gate.lock() else {
            return SaveOutcome::Skipped;
        };
        if self.buffer.lock().map(|b| b.is_empty()).unwrap_or(true) {
            log::info!("no recording data to upload");
            return SaveOutcome::Skipped;
        }
        let session_id = self.session_id.lock().ok().and_then(|s| s.clone());
        match self.upload(true) {
            Ok(()) => {
                if let Ok(mut buffer) = self.buffer.lock() {
                    buffer.clear();
                }
                if let Some(session_id) = session_id {
                    clear_after_success(
                        self.deps.markers.as_ref(),
                        &session_id,
                        self.settings.recovery_window,
                        self.deps.clock.as_ref(),
                    );
                }
                self.deps
                    .notifier
                    .notify(NoticeLevel::Info, "Screen recording uploaded.");
                SaveOutcome::Uploaded
            }
            Err(UploadError::Cancelled) => SaveOutcome::Cancelled,
            Err(UploadError::MissingSession) => SaveOutcome::Skipped,
            Err(UploadError::Exhausted { attempts, last }) => {
                if let Some(session_id) = session_id {
                    let marker = FailureMarker {
                        session_id,
                        timestamp_ms: self.deps.clock.now_ms(),
                    };
                    if let Err(err) = self.deps.markers.save(&marker) {
                        log::error!("failed to persist upload failure marker: {:#}", err);
                    }
                }
                log::error!(
                    "final recording upload failed after {} attempts: {}",
                    attempts,
                    last
                );
                self.deps.notifier.notify(
                    NoticeLevel::Error,
                    &format!(
                        "Failed to upload the screen recording after {} attempts. \
                         Please contact support.",
                        attempts
                    ),
                );
                SaveOutcome::Failed
            }
        }
    }

    /// Assembles the buffer and sends it. Caller holds the upload gate.
    fn upload(&self, is_final: bool) -> Result<(), UploadError> {
        let Some(session_id) = self.session_id.lock().ok().and_then(|s| s.clone()) else {
            log::warn!("recording upload skipped: no session id");
            return Err(UploadError::MissingSession);
        };
        let blob = match self.buffer.lock() {
            Ok(buffer) => buffer.assemble(),
            Err(_) => return Err(UploadError::MissingSession),
        };
        let progress = self.deps.progress.as_deref();
        let state_progress = StateProgress {
            shared: self,
            outer: progress,
        };
        self.set_upload_state(UploadState {
            progress: 0,
            status: UploadPhase::Uploading,
            error: None,
        });
        let sink: Option<&dyn ProgressSink> =
            progress.map(|_| &state_progress as &dyn ProgressSink);
        match self.uploader.upload_blob(&session_id, &blob, is_final, sink) {
            Ok(_) => {
                self.set_upload_state(UploadState {
                    progress: 100,
                    status: UploadPhase::Completed,
                    error: None,
                });
                Ok(())
            }
            Err(err) => {
                self.set_upload_state(UploadState {
                    progress: 0,
                    status: UploadPhase::Error,
                    error: Some(err.to_string()),
                });
                Err(err)
            }
        }
    }
}

/// Mirrors part progress into the upload state and forwards it to the UI sink.
struct StateProgress<'a> {
    shared: &'a Shared,
    outer: Option<&'a dyn ProgressSink>,
}

impl ProgressSink for StateProgress<'_> {
    fn progress(&self, percent: u8) {
        if let Ok(mut state) = self.shared.upload_state.lock() {
            state.progress = percent;
        }
        if let Some(outer) = self.outer {
            outer.progress(percent);
        }
    }
}

struct PipelineSink {
    shared: Weak<Shared>,
}

impl ChunkSink for PipelineSink {
    fn data_available(&self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let now = shared.deps.clock.now_ms();
        if let Ok(mut buffer) = shared.buffer.lock() {
            buffer.push(Chunk::new(data, now));
        };
    }

    fn stopped(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.recording.store(false, Ordering::SeqCst);
            shared.upload_final();
        }
    }

    fn failed(&self, error: &str) {
        if let Some(shared) = self.shared.upgrade() {
            shared.report_fault(ViolationType::ScreenRecordingFailed, &anyhow!("{}", error));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::media::{DisplaySurface, MediaTrack};
    use crate::notify::CollectingNotifier;
    use crate::recording::recovery::MemoryMarkerStore;
    use crate::sim::SimulatedCapture;
    use crate::transport::{MemoryApi, UploadFailure};
    use std::time::Duration;

    struct Harness {
        api: Arc<MemoryApi>,
        capture: Arc<SimulatedCapture>,
        markers: Arc<MemoryMarkerStore>,
        notifier: Arc<CollectingNotifier>,
        pipeline: RecordingPipeline,
    }

    fn harness() -> Harness {
        let api = Arc::new(MemoryApi::new());
        let capture = Arc::new(SimulatedCapture::new());
        let markers = Arc::new(MemoryMarkerStore::new());
        let notifier = Arc::new(CollectingNotifier::new());
        let settings = RecorderSettings {
            auto_save_interval: Duration::from_secs(3600),
            auto_save_min_bytes: 4,
            upload_max_retries: 3,
            retry_base_delay: Duration::from_millis(1),
            ..RecorderSettings::default()
        };
        let pipeline = RecordingPipeline::new(
            settings,
            RecorderDeps {
                api: api.clone(),
                capture: capture.clone(),
                markers: markers.clone(),
                notifier: notifier.clone(),
                clock: Arc::new(ManualClock::new(1_000)),
                progress: None,
            },
        );
        Harness {
            api,
            capture,
            markers,
            notifier,
            pipeline,
        }
    }

    fn screen() -> MediaStream {
        MediaStream::new(vec![MediaTrack::display("screen", DisplaySurface::Monitor)])
    }

    #[test]
    fn final_upload_clears_buffer() {
        let h = harness();
        h.pipeline.start(&screen(), "P").unwrap();
        h.capture.emit(vec![1; 10]);
        h.capture.emit(vec![2; 10]);
        h.pipeline.stop();

        let uploads = h.api.accepted_uploads();
        assert_eq!(uploads.len(), 1);
        assert!(uploads[0].is_final);
        assert_eq!(uploads[0].bytes, 20);
        assert_eq!(h.pipeline.chunk_count(), 0);
        assert_eq!(h.pipeline.upload_state().status, UploadPhase::Completed);
        assert!(!h.pipeline.is_recording());
    }

    #[test]
    fn intermediate_saves_never_shrink_buffer() {
        let h = harness();
        h.pipeline.start(&screen(), "P").unwrap();
        h.capture.emit(vec![1; 2]);
        assert_eq!(h.pipeline.save_intermediate(), SaveOutcome::Skipped);
        h.capture.emit(vec![1; 8]);
        let mut counts = Vec::new();
        for _ in 0..3 {
            assert_eq!(h.pipeline.save_intermediate(), SaveOutcome::Uploaded);
            counts.push(h.pipeline.chunk_count());
        }
        assert_eq!(counts, vec![2, 2, 2]);
        let indexes: Vec<u32> = h.api.accepted_uploads().iter().map(|u| u.chunk_index).collect();
        assert_eq!(indexes, vec![0, 0, 0]);
    }

    #[test]
    fn server_assembles_exactly_what_was_recorded() {
        let h = harness();
        h.pipeline.start(&screen(), "P").unwrap();
        let mut recorded = Vec::new();
        for byte in 1..=3u8 {
            let data = vec![byte; 100];
            recorded.extend_from_slice(&data);
            h.capture.emit(data);
            if byte < 3 {
                assert_eq!(h.pipeline.save_intermediate(), SaveOutcome::Uploaded);
            }
        }
        assert_eq!(h.pipeline.stop(), SaveOutcome::Uploaded);

        let sizes: Vec<(u32, bool, usize)> = h
            .api
            .accepted_uploads()
            .iter()
            .map(|u| (u.chunk_index, u.is_final, u.bytes))
            .collect();
        assert_eq!(sizes, vec![(0, false, 100), (0, false, 200), (0, true, 300)]);
        assert_eq!(h.api.assembled_recording("P"), Some(recorded));
    }

    #[test]
    fn final_failure_writes_marker_after_max_retries() {
        let h = harness();
        h.api.set_upload_failure(UploadFailure::Always(500));
        h.pipeline.start(&screen(), "P").unwrap();
        h.capture.emit(vec![3; 16]);
        h.pipeline.stop();

        assert_eq!(h.api.upload_attempts().len(), 3);
        let marker = h.markers.current().expect("marker written");
        assert_eq!(marker.session_id, "P");
        assert_eq!(marker.timestamp_ms, 1_000);
        assert_eq!(h.notifier.count(NoticeLevel::Error), 1);
        assert_eq!(h.pipeline.upload_state().status, UploadPhase::Error);
        assert_eq!(h.pipeline.chunk_count(), 1);
    }

    #[test]
    fn intermediate_failure_warns_without_marker() {
        let h = harness();
        h.api.set_upload_failure(UploadFailure::Always(500));
        h.pipeline.start(&screen(), "P").unwrap();
        h.capture.emit(vec![3; 16]);
        assert_eq!(h.pipeline.save_intermediate(), SaveOutcome::Failed);
        assert_eq!(h.api.upload_attempts().len(), 3);
        assert!(h.markers.current().is_none());
        assert_eq!(h.notifier.count(NoticeLevel::Warning), 1);
        assert_eq!(h.pipeline.chunk_count(), 1);
        assert!(h.pipeline.is_recording());
    }

    #[test]
    fn session_change_saves_under_old_id_first() {
        let h = harness();
        h.pipeline.start(&screen(), "P").unwrap();
        h.capture.emit(vec![5; 16]);
        h.pipeline.update_session_id("M");
        h.pipeline.stop();
        let sessions: Vec<(String, bool)> = h
            .api
            .accepted_uploads()
            .into_iter()
            .map(|u| (u.session_id, u.is_final))
            .collect();
        assert_eq!(
            sessions,
            vec![("P".to_string(), false), ("M".to_string(), true)]
        );
    }

    #[test]
    fn init_failure_reports_fault() {
        let h = harness();
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = faults.clone();
        h.pipeline
            .set_fault_hook(Arc::new(move |kind, _| sink.lock().unwrap().push(kind)));
        h.capture.fail_next_create();
        assert!(h.pipeline.start(&screen(), "P").is_err());
        assert!(!h.pipeline.is_recording());

        h.pipeline.start(&screen(), "P").unwrap();
        h.capture.fail("encoder crashed");
        assert_eq!(
            *faults.lock().unwrap(),
            vec![
                ViolationType::MediaRecorderInitFailed,
                ViolationType::ScreenRecordingFailed
            ]
        );
    }

    #[test]
    fn successful_final_upload_clears_own_marker() {
        let h = harness();
        h.markers
            .save(&FailureMarker {
                session_id: "P".to_string(),
                timestamp_ms: 500,
            })
            .unwrap();
        h.pipeline.start(&screen(), "P").unwrap();
        h.capture.emit(vec![1; 4]);
        h.pipeline.stop();
        assert!(h.markers.current().is_none());
    }
}
