//! Exam-lifecycle supervision.
//!
//! The orchestrator owns the media streams, the perception loop, the environment
//! watcher and the recording pipeline, and reacts to the violation registry moving to
//! `Terminated`. Every collaborator callback holds a `Weak` handle back to it.
//!
//! Lock discipline: internal locks are held only for field reads/writes. Nothing calls
//! into the registry, the recorder or a collaborator while holding one, since those
//! may call back in on the same thread.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::clock::Clock;
use crate::config::ProctorConfig;
use crate::environment::{EnvironmentGuard, EnvironmentWatcher, PageEvents, WindowMetrics};
use crate::media::{
    DisplaySurface, FullscreenControl, MediaConstraints, MediaDevices, MediaStream,
};
use crate::notify::{NoticeLevel, Notifier};
use crate::perception::{
    FaceAnalyzer, FaceDetector, PerceptionMonitor, PoseEstimator, RenderTargets, RunLengths,
};
use crate::recording::{
    check_on_session, CaptureFactory, FailureMarkerStore, ProgressSink, RecorderDeps,
    RecordingInfo, RecordingPipeline, RecoveryCheck, RecoveryWindows, SaveOutcome,
};
use crate::schedule::{PeriodicTask, Timeout};
use crate::session::{SessionContext, SessionIdentity};
use crate::transport::{ProctoringApi, UploadStatus};
use crate::violation::{
    metadata, AuditDispatcher, AuditSink, LogOutcome, Metadata, Termination, ViolationRegistry,
    ViolationState, ViolationType,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Lifecycle {
    #[default]
    Idle,
    CameraRequested,
    Monitoring,
    Paused,
    Terminated,
    Completed,
}

/// Everything the orchestrator talks to.
pub struct ProctoringDeps {
    pub api: Arc<dyn ProctoringApi>,
    pub devices: Arc<dyn MediaDevices>,
    pub fullscreen: Arc<dyn FullscreenControl>,
    pub page: Arc<dyn PageEvents>,
    pub window: Arc<dyn WindowMetrics>,
    pub capture: Arc<dyn CaptureFactory>,
    pub markers: Arc<dyn FailureMarkerStore>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
    pub detector: Box<dyn FaceDetector>,
    pub estimator: Box<dyn PoseEstimator>,
    /// Upload progress display; enables split uploads for large recordings.
    pub progress: Option<Arc<dyn ProgressSink>>,
    /// Audit trail override. Defaults to a dispatcher posting to `api`.
    pub audit: Option<Arc<dyn AuditSink>>,
}

pub type ExamCallback = Arc<dyn Fn() + Send + Sync>;

/// UI-facing state.
#[derive(Clone, Debug, PartialEq)]
pub struct ProctoringSnapshot {
    pub lifecycle: Lifecycle,
    pub violations: ViolationState,
    pub session: SessionIdentity,
    pub exam_active: bool,
    pub models_loaded: bool,
    pub camera_active: bool,
    pub screen_active: bool,
    pub perception_running: bool,
    pub environment_watching: bool,
    pub recording: bool,
    pub fullscreen_prompt_visible: bool,
    pub fullscreen_declined: bool,
    pub fullscreen_transition: bool,
    pub last_error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Diagnostics {
    pub snapshot: ProctoringSnapshot,
    pub detector: &'static str,
    pub run_lengths: RunLengths,
    pub recording: Option<RecordingInfo>,
}

#[derive(Default)]
struct OrchestratorState {
    lifecycle: Lifecycle,
    exam_active: bool,
    camera: Option<MediaStream>,
    screen: Option<MediaStream>,
    screen_tracking: bool,
    fullscreen_declined: bool,
    fullscreen_prompt_visible: bool,
    last_error: Option<String>,
}

#[derive(Default)]
struct ExamCallbacks {
    on_logout: Option<ExamCallback>,
    on_complete: Option<ExamCallback>,
}

struct Shared {
    config: ProctorConfig,
    api: Arc<dyn ProctoringApi>,
    devices: Arc<dyn MediaDevices>,
    fullscreen: Arc<dyn FullscreenControl>,
    page: Arc<dyn PageEvents>,
    window: Arc<dyn WindowMetrics>,
    capture: Arc<dyn CaptureFactory>,
    markers: Arc<dyn FailureMarkerStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    progress: Option<Arc<dyn ProgressSink>>,
    dispatcher: Option<Arc<AuditDispatcher>>,
    session: SessionContext,
    registry: ViolationRegistry,
    analyzer: Arc<Mutex<FaceAnalyzer>>,
    targets: Arc<Mutex<Option<RenderTargets>>>,
    models_loaded: AtomicBool,
    state: Mutex<OrchestratorState>,
    callbacks: Mutex<ExamCallbacks>,
    perception: Mutex<Option<PeriodicTask>>,
    environment: Mutex<Option<EnvironmentGuard>>,
    recorder: Mutex<Option<Arc<RecordingPipeline>>>,
    transition: AtomicBool,
    /// Set while the exam flow holds the flag (modals, phase changes); fullscreen
    /// events then leave it alone until released or timed out.
    transition_held: AtomicBool,
    transition_generation: AtomicU64,
    transition_timeout: Mutex<Option<Timeout>>,
}

pub struct ProctoringOrchestrator {
    shared: Arc<Shared>,
}

impl ProctoringOrchestrator {
    pub fn new(config: ProctorConfig, deps: ProctoringDeps) -> Result<Self> {
        let session = SessionContext::new();
        let (audit, dispatcher): (Arc<dyn AuditSink>, Option<Arc<AuditDispatcher>>) =
            match deps.audit {
                Some(audit) => (audit, None),
                None => {
                    let dispatcher = Arc::new(AuditDispatcher::spawn(deps.api.clone())?);
                    (dispatcher.clone(), Some(dispatcher))
                }
            };
        let registry = ViolationRegistry::new(
            config.violations.clone(),
            session.clone(),
            audit,
            deps.notifier.clone(),
            deps.clock.clone(),
        );
        let analyzer = FaceAnalyzer::new(deps.detector, deps.estimator, config.perception.clone());

        let shared = Arc::new(Shared {
            config,
            api: deps.api,
            devices: deps.devices,
            fullscreen: deps.fullscreen,
            page: deps.page,
            window: deps.window,
            capture: deps.capture,
            markers: deps.markers,
            notifier: deps.notifier,
            clock: deps.clock,
            progress: deps.progress,
            dispatcher,
            session,
            registry,
            analyzer: Arc::new(Mutex::new(analyzer)),
            targets: Arc::new(Mutex::new(None)),
            models_loaded: AtomicBool::new(false),
            state: Mutex::new(OrchestratorState::default()),
            callbacks: Mutex::new(ExamCallbacks::default()),
            perception: Mutex::new(None),
            environment: Mutex::new(None),
            recorder: Mutex::new(None),
            transition: AtomicBool::new(false),
            transition_held: AtomicBool::new(false),
            transition_generation: AtomicU64::new(0),
            transition_timeout: Mutex::new(None),
        });

        let weak = Arc::downgrade(&shared);
        shared.registry.on_terminated(move |termination| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_termination(termination);
            }
        });
        Ok(Self { shared })
    }

    pub fn registry(&self) -> &ViolationRegistry {
        &self.shared.registry
    }

    pub fn session(&self) -> &SessionContext {
        &self.shared.session
    }

    /// Reports a violation observed by the surrounding exam flow.
    pub fn log_violation(&self, kind: ViolationType, metadata: Metadata) -> LogOutcome {
        self.shared.registry.log(kind, metadata)
    }

    pub fn set_exam_callbacks(
        &self,
        on_logout: Option<ExamCallback>,
        on_complete: Option<ExamCallback>,
    ) {
        let mut callbacks = lock(&self.shared.callbacks);
        callbacks.on_logout = on_logout;
        callbacks.on_complete = on_complete;
    }

    /// Establishes the session for the current exam phase.
    pub fn set_session(&self, session_id: &str, is_preliminary: bool) -> RecoveryCheck {
        let shared = &self.shared;
        shared.session.set_current(session_id, is_preliminary);
        let check = check_on_session(
            shared.markers.as_ref(),
            session_id,
            RecoveryWindows {
                recovery: shared.config.recorder.recovery_window,
                cleanup: shared.config.recorder.cleanup_window,
            },
            shared.clock.as_ref(),
            shared.notifier.as_ref(),
        );
        if let (Some(recorder), Some(durable)) =
            (shared.recorder(), shared.session.recording_session_id())
        {
            if recorder.is_recording() {
                recorder.update_session_id(&durable);
            }
        }
        check
    }

    pub fn set_exam_active(&self, active: bool) {
        lock(&self.shared.state).exam_active = active;
        self.shared.ensure_perception();
    }

    pub fn attach_render_targets(&self, targets: RenderTargets) {
        *lock(&self.shared.targets) = Some(targets);
        self.shared.ensure_perception();
    }

    pub fn detach_render_targets(&self) {
        lock(&self.shared.targets).take();
        self.shared.ensure_perception();
    }

    /// Loads the face models. Returns false (and tells the user) on failure.
    pub fn load_models(&self) -> bool {
        let result = lock(&self.shared.analyzer).load_models();
        match result {
            Ok(()) => {
                self.shared.models_loaded.store(true, Ordering::SeqCst);
                self.shared.ensure_perception();
                true
            }
            Err(err) => {
                log::error!("failed to load face detection models: {:#}", err);
                self.shared.set_error(format!("{:#}", err));
                self.shared.notifier.notify(
                    NoticeLevel::Error,
                    "Failed to load face detection models. Please reload the page.",
                );
                false
            }
        }
    }

    /// Asks for camera and microphone. A refusal terminates the attempt.
    pub fn request_camera_stream(&self) -> Option<MediaStream> {
        let shared = &self.shared;
        lock(&shared.state).lifecycle = Lifecycle::CameraRequested;
        match shared.devices.get_user_media(MediaConstraints::CAMERA_AND_MIC) {
            Ok(stream) => {
                log::info!("camera stream acquired ({} tracks)", stream.tracks().len());
                lock(&shared.state).camera = Some(stream.clone());
                shared.ensure_perception();
                Some(stream)
            }
            Err(err) => {
                log::error!("camera access denied: {:#}", err);
                shared.set_error(format!("{:#}", err));
                shared.notifier.notify(
                    NoticeLevel::Error,
                    "Camera access is required to take this exam.",
                );
                shared.fatal(ViolationType::CameraAccessDenied, &err);
                None
            }
        }
    }

    /// Asks for a screen share. Only an entire-monitor share is accepted.
    pub fn request_screen_stream(&self) -> Option<MediaStream> {
        let shared = &self.shared;
        let stream = match shared.devices.get_display_media() {
            Ok(stream) => stream,
            Err(err) => {
                log::error!("screen share denied: {:#}", err);
                shared.set_error(format!("{:#}", err));
                shared.notifier.notify(
                    NoticeLevel::Error,
                    "Screen sharing is required to take this exam.",
                );
                shared.fatal(ViolationType::ScreenShareDenied, &err);
                return None;
            }
        };
        let surface = stream.display_surface();
        if surface != Some(DisplaySurface::Monitor) {
            let shown = surface.map(|s| s.as_str()).unwrap_or("unknown");
            log::warn!("screen share rejected: surface is {}", shown);
            stream.stop_all();
            shared.set_error(format!("shared surface was {}", shown));
            shared.notifier.notify(
                NoticeLevel::Error,
                "Please share your entire screen, not a window or a tab.",
            );
            shared.registry.log(
                ViolationType::ScreenShareNotEntire,
                metadata([("surface", serde_json::Value::String(shown.to_string()))]),
            );
            return None;
        }

        for track in stream.video_tracks() {
            let weak = Arc::downgrade(shared);
            track.on_ended(Arc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_screen_share_ended();
                }
            }));
        }
        log::info!("screen share acquired");
        lock(&shared.state).screen = Some(stream.clone());
        Some(stream)
    }

    /// Starts supervision. Calling it again while recording only refreshes attribution.
    pub fn start_monitoring(&self, camera: Option<MediaStream>, screen: Option<MediaStream>) {
        let shared = &self.shared;
        if shared.registry.is_terminated() {
            log::warn!("start_monitoring ignored: attempt already terminated");
            return;
        }
        let (camera, screen) = {
            let mut state = lock(&shared.state);
            if camera.is_some() {
                state.camera = camera;
            }
            if screen.is_some() {
                state.screen = screen;
            }
            state.lifecycle = Lifecycle::Monitoring;
            state.screen_tracking = true;
            (state.camera.clone(), state.screen.clone())
        };

        shared.start_environment();
        shared.start_recorder(camera.as_ref(), screen.as_ref());
        shared.enter_fullscreen();
        shared.ensure_perception();
        log::info!("proctoring monitoring started");
    }

    /// User accepted the fullscreen prompt.
    pub fn enter_fullscreen(&self) -> bool {
        self.shared.enter_fullscreen()
    }

    /// Suppresses fullscreen-exit violations while the exam flow shows a modal or
    /// switches phases. The flag is force-cleared after the configured timeout.
    pub fn set_transition_state(&self, transitioning: bool) {
        let shared = &self.shared;
        if shared.transition_held.swap(transitioning, Ordering::SeqCst) == transitioning {
            return;
        }
        log::debug!("fullscreen transition state set to {}", transitioning);
        if transitioning {
            shared.begin_transition();
        } else {
            shared.end_transition();
        }
    }

    /// User refused the fullscreen prompt; no prompts until fullscreen is re-entered.
    pub fn decline_fullscreen(&self) {
        let mut state = lock(&self.shared.state);
        state.fullscreen_declined = true;
        state.fullscreen_prompt_visible = false;
        log::info!("fullscreen prompt declined");
    }

    /// Between exam phases: perception, environment and screen-share tracking stop,
    /// fullscreen is left, recording continues.
    pub fn pause_proctoring_session(&self) {
        let shared = &self.shared;
        {
            let mut state = lock(&shared.state);
            if state.lifecycle != Lifecycle::Monitoring {
                log::debug!("pause ignored in {:?}", state.lifecycle);
                return;
            }
            state.lifecycle = Lifecycle::Paused;
            state.screen_tracking = false;
            state.fullscreen_prompt_visible = false;
        }
        shared.stop_perception();
        shared.stop_environment();
        shared.exit_fullscreen();
        log::info!("proctoring paused; recording continues");
    }

    /// Pause and flush the recording buffer.
    pub fn pause_keep_recording(&self) -> SaveOutcome {
        self.pause_proctoring_session();
        self.save_current_recording()
    }

    pub fn resume_monitoring(&self) {
        let shared = &self.shared;
        {
            let mut state = lock(&shared.state);
            if state.lifecycle != Lifecycle::Paused || shared.registry.is_terminated() {
                log::debug!("resume ignored in {:?}", state.lifecycle);
                return;
            }
            state.lifecycle = Lifecycle::Monitoring;
            state.screen_tracking = true;
        }
        shared.start_environment();
        shared.enter_fullscreen();
        shared.ensure_perception();
        log::info!("proctoring resumed");
    }

    /// Ends the exam normally: everything stops and the recording gets its final upload.
    pub fn stop_proctoring_session(&self) {
        let shared = &self.shared;
        let completed = {
            let mut state = lock(&shared.state);
            let completed = state.lifecycle != Lifecycle::Terminated;
            if completed {
                state.lifecycle = Lifecycle::Completed;
            }
            state.screen_tracking = false;
            completed
        };
        shared.teardown(true);
        if completed {
            let callback = lock(&shared.callbacks).on_complete.clone();
            if let Some(callback) = callback {
                callback();
            }
        }
        log::info!("proctoring session stopped");
    }

    /// Clears violations and identity for a fresh attempt. Uploaded recordings are kept.
    pub fn reset_for_new_test(&self) {
        let shared = &self.shared;
        shared.stop_perception();
        shared.stop_environment();
        if let Some(recorder) = shared.take_recorder() {
            recorder.stop();
        }
        {
            let mut state = lock(&shared.state);
            state.lifecycle = Lifecycle::Idle;
            state.screen_tracking = false;
            state.fullscreen_declined = false;
            state.fullscreen_prompt_visible = false;
            state.last_error = None;
        }
        lock(&shared.analyzer).reset();
        shared.registry.reset();
        shared.session.reset_for_new_test();
        log::info!("proctoring re-armed for a new test");
    }

    /// `reset_for_new_test` plus releasing every stream.
    pub fn reset_proctoring_state(&self) {
        self.reset_for_new_test();
        let shared = &self.shared;
        shared.exit_fullscreen();
        let (camera, screen) = {
            let mut state = lock(&shared.state);
            state.exam_active = false;
            (state.camera.take(), state.screen.take())
        };
        for stream in [camera, screen].into_iter().flatten() {
            stream.stop_all();
        }
    }

    pub fn reset_violation_state(&self) {
        self.shared.registry.reset();
    }

    pub fn save_current_recording(&self) -> SaveOutcome {
        match self.shared.recorder() {
            Some(recorder) => recorder.save_intermediate(),
            None => SaveOutcome::Skipped,
        }
    }

    /// Stops the recorder, which triggers the final upload.
    pub fn save_final_recording(&self) -> SaveOutcome {
        match self.shared.take_recorder() {
            Some(recorder) => recorder.stop(),
            None => SaveOutcome::Skipped,
        }
    }

    pub fn cancel_upload(&self) {
        if let Some(recorder) = self.shared.recorder() {
            recorder.cancel_upload();
        }
    }

    pub fn check_upload_status(&self) -> Option<UploadStatus> {
        let session_id = self.shared.session.recording_session_id()?;
        match self.shared.api.upload_status(&session_id) {
            Ok(status) => Some(status),
            Err(err) => {
                log::warn!("upload status check failed for {}: {:#}", session_id, err);
                None
            }
        }
    }

    pub fn recording_info(&self) -> Option<RecordingInfo> {
        self.shared.recorder().map(|r| r.recording_info())
    }

    pub fn snapshot(&self) -> ProctoringSnapshot {
        self.shared.snapshot()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let (detector, run_lengths) = {
            let analyzer = lock(&self.shared.analyzer);
            (analyzer.detector_name(), analyzer.run_lengths())
        };
        Diagnostics {
            snapshot: self.snapshot(),
            detector,
            run_lengths,
            recording: self.recording_info(),
        }
    }
}

impl Drop for ProctoringOrchestrator {
    fn drop(&mut self) {
        self.shared.stop_perception();
        self.shared.stop_environment();
        lock(&self.shared.transition_timeout).take();
        if let Some(dispatcher) = &self.shared.dispatcher {
            dispatcher.shutdown();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn set_error(&self, message: String) {
        lock(&self.state).last_error = Some(message);
    }

    fn recorder(&self) -> Option<Arc<RecordingPipeline>> {
        lock(&self.recorder).clone()
    }

    fn take_recorder(&self) -> Option<Arc<RecordingPipeline>> {
        lock(&self.recorder).take()
    }

    /// Fatal permission failure: counted when a session exists, forced otherwise.
    fn fatal(&self, kind: ViolationType, err: &anyhow::Error) {
        let outcome = self.registry.log(
            kind,
            metadata([("error", serde_json::Value::String(format!("{:#}", err)))]),
        );
        if outcome == LogOutcome::Dropped {
            self.registry.force_terminate(kind);
        }
    }

    fn perception_ready(&self) -> bool {
        if self.registry.is_terminated() || !self.models_loaded.load(Ordering::SeqCst) {
            return false;
        }
        let camera_live = {
            let state = lock(&self.state);
            if !state.exam_active || state.lifecycle != Lifecycle::Monitoring {
                return false;
            }
            state
                .camera
                .as_ref()
                .map(|c| c.video_tracks().any(|t| t.is_live()))
                .unwrap_or(false)
        };
        camera_live && lock(&self.targets).is_some()
    }

    /// Starts the perception loop when every precondition holds, stops it otherwise.
    fn ensure_perception(self: &Arc<Self>) {
        if !self.perception_ready() {
            self.stop_perception();
            return;
        }
        let mut slot = lock(&self.perception);
        if slot.is_some() {
            return;
        }
        let monitor = PerceptionMonitor::new(
            self.analyzer.clone(),
            self.targets.clone(),
            self.clock.clone(),
            self.config.perception.startup_grace,
        );
        let weak: Weak<Shared> = Arc::downgrade(self);
        let task = PeriodicTask::spawn(
            "perception",
            self.config.perception.loop_interval,
            move || {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if !shared.perception_ready() {
                    shared.stop_perception();
                    return;
                }
                if let Some(result) = monitor.tick() {
                    shared.registry.update_face_state(result.state);
                    for kind in result.violations {
                        shared.registry.log(kind, Metadata::new());
                    }
                }
            },
        );
        match task {
            Ok(task) => {
                *slot = Some(task);
                log::info!("perception loop started");
            }
            Err(err) => log::error!("failed to start perception loop: {:#}", err),
        }
    }

    fn stop_perception(&self) {
        let task = lock(&self.perception).take();
        if let Some(task) = task {
            task.stop();
            log::info!("perception loop stopped");
        }
    }

    fn start_environment(self: &Arc<Self>) {
        if lock(&self.environment).is_some() {
            return;
        }
        let watcher = EnvironmentWatcher::new(
            self.page.clone(),
            self.window.clone(),
            self.config.environment.clone(),
        );
        let on_violation = {
            let weak = Arc::downgrade(self);
            Arc::new(move |kind: ViolationType, metadata: Metadata| {
                if let Some(shared) = weak.upgrade() {
                    shared.registry.log(kind, metadata);
                }
            })
        };
        let on_fullscreen = {
            let weak = Arc::downgrade(self);
            Arc::new(move |active: bool| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_fullscreen_change(active);
                }
            })
        };
        match watcher.start(on_violation, Some(on_fullscreen)) {
            Ok(guard) => {
                let mut slot = lock(&self.environment);
                if slot.is_none() {
                    *slot = Some(guard);
                }
            }
            Err(err) => log::error!("failed to start environment detectors: {:#}", err),
        }
    }

    fn stop_environment(&self) {
        let guard = lock(&self.environment).take();
        if let Some(guard) = guard {
            guard.stop();
        }
    }

    fn start_recorder(
        self: &Arc<Self>,
        camera: Option<&MediaStream>,
        screen: Option<&MediaStream>,
    ) {
        let Some(durable) = self.session.recording_session_id() else {
            log::warn!("recording not started: no session id");
            return;
        };
        if let Some(existing) = self.recorder() {
            if existing.is_recording() {
                existing.update_session_id(&durable);
                log::info!("recording already active; attribution refreshed");
                return;
            }
        }
        let Some(screen) = screen else {
            log::warn!("recording not started: no screen stream");
            return;
        };
        let recorder = Arc::new(RecordingPipeline::new(
            self.config.recorder.clone(),
            RecorderDeps {
                api: self.api.clone(),
                capture: self.capture.clone(),
                markers: self.markers.clone(),
                notifier: self.notifier.clone(),
                clock: self.clock.clone(),
                progress: self.progress.clone(),
            },
        ));
        let weak = Arc::downgrade(self);
        recorder.set_fault_hook(Arc::new(move |kind: ViolationType, metadata: Metadata| {
            if let Some(shared) = weak.upgrade() {
                shared.registry.log(kind, metadata);
            }
        }));
        let combined = MediaStream::combine(screen, camera);
        match recorder.start(&combined, &durable) {
            Ok(()) => *lock(&self.recorder) = Some(recorder),
            Err(err) => {
                log::error!("screen recording failed to start: {:#}", err);
                self.set_error(format!("{:#}", err));
            }
        }
    }

    fn begin_transition(self: &Arc<Self>) {
        self.transition.store(true, Ordering::SeqCst);
        let generation = self.transition_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(self);
        let timeout = Timeout::spawn(
            "fullscreen-transition",
            self.config.fullscreen.transition_timeout,
            move || {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if shared.transition_generation.load(Ordering::SeqCst) == generation
                    && shared.transition.swap(false, Ordering::SeqCst)
                {
                    shared.transition_held.store(false, Ordering::SeqCst);
                    log::warn!("fullscreen transition flag force-cleared after timeout");
                }
            },
        );
        match timeout {
            Ok(timeout) => *lock(&self.transition_timeout) = Some(timeout),
            Err(err) => log::error!("failed to arm fullscreen transition timeout: {:#}", err),
        }
    }

    fn end_transition(&self) {
        self.transition.store(false, Ordering::SeqCst);
        self.transition_held.store(false, Ordering::SeqCst);
        lock(&self.transition_timeout).take();
    }

    fn enter_fullscreen(self: &Arc<Self>) -> bool {
        if self.fullscreen.is_fullscreen() {
            self.fullscreen_entered();
            return true;
        }
        self.begin_transition();
        match self.fullscreen.request() {
            Ok(()) => {
                self.fullscreen_entered();
                true
            }
            Err(err) => {
                self.end_transition();
                log::warn!("fullscreen request refused: {:#}", err);
                {
                    let mut state = lock(&self.state);
                    state.fullscreen_declined = true;
                    state.fullscreen_prompt_visible = false;
                }
                self.registry.log(
                    ViolationType::FullscreenRequestDenied,
                    metadata([("error", serde_json::Value::String(format!("{:#}", err)))]),
                );
                false
            }
        }
    }

    fn fullscreen_entered(&self) {
        let mut state = lock(&self.state);
        state.fullscreen_prompt_visible = false;
        state.fullscreen_declined = false;
    }

    fn exit_fullscreen(self: &Arc<Self>) {
        if !self.fullscreen.is_fullscreen() {
            return;
        }
        self.begin_transition();
        if let Err(err) = self.fullscreen.exit() {
            self.end_transition();
            log::warn!("failed to exit fullscreen: {:#}", err);
        }
    }

    fn on_fullscreen_change(&self, active: bool) {
        if self.transition.load(Ordering::SeqCst) {
            if !self.transition_held.load(Ordering::SeqCst) {
                self.end_transition();
            }
            log::debug!("fullscreen change during transition (active={})", active);
            return;
        }
        if active {
            self.fullscreen_entered();
            return;
        }
        {
            let state = lock(&self.state);
            if !state.exam_active || state.lifecycle != Lifecycle::Monitoring {
                return;
            }
        }
        if self.registry.is_terminated() {
            return;
        }
        self.registry.log(ViolationType::FullscreenExited, Metadata::new());
        if self.registry.is_terminated() {
            return;
        }
        let mut state = lock(&self.state);
        if !state.fullscreen_declined {
            state.fullscreen_prompt_visible = true;
            drop(state);
            self.notifier.notify(
                NoticeLevel::Warning,
                "Please return to fullscreen mode to continue the exam.",
            );
        }
    }

    fn on_screen_share_ended(&self) {
        let tracking = lock(&self.state).screen_tracking;
        if !tracking || self.registry.is_terminated() {
            return;
        }
        log::error!("screen share ended while monitoring");
        self.registry
            .log(ViolationType::ScreenShareStopped, Metadata::new());
    }

    fn handle_termination(self: &Arc<Self>, termination: &Termination) {
        log::error!(
            "attempt terminated: {:?} after {} violations",
            termination.reason,
            termination.violation_count
        );
        {
            let mut state = lock(&self.state);
            state.lifecycle = Lifecycle::Terminated;
            state.screen_tracking = false;
            state.fullscreen_prompt_visible = false;
        }
        self.teardown(false);
        let callback = lock(&self.callbacks).on_logout.clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Stops loops, the recorder (final upload) and fullscreen. With `release_streams`
    /// the camera and screen tracks are stopped too.
    fn teardown(self: &Arc<Self>, release_streams: bool) {
        self.stop_perception();
        self.stop_environment();
        if let Some(recorder) = self.take_recorder() {
            recorder.stop();
        }
        self.exit_fullscreen();
        if release_streams {
            let (camera, screen) = {
                let mut state = lock(&self.state);
                (state.camera.take(), state.screen.take())
            };
            for stream in [camera, screen].into_iter().flatten() {
                stream.stop_all();
            }
        }
    }

    fn snapshot(&self) -> ProctoringSnapshot {
        let perception_running = lock(&self.perception).is_some();
        let environment_watching = lock(&self.environment).is_some();
        let recording = self.recorder().map(|r| r.is_recording()).unwrap_or(false);
        let state = lock(&self.state);
        ProctoringSnapshot {
            lifecycle: state.lifecycle,
            violations: self.registry.state(),
            session: self.session.snapshot(),
            exam_active: state.exam_active,
            models_loaded: self.models_loaded.load(Ordering::SeqCst),
            camera_active: state.camera.as_ref().map(|c| c.is_active()).unwrap_or(false),
            screen_active: state.screen.as_ref().map(|s| s.is_active()).unwrap_or(false),
            perception_running,
            environment_watching,
            recording,
            fullscreen_prompt_visible: state.fullscreen_prompt_visible,
            fullscreen_declined: state.fullscreen_declined,
            fullscreen_transition: self.transition.load(Ordering::SeqCst),
            last_error: state.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::environment::{FixedWindowMetrics, MemoryPage, PageSignal};
    use crate::notify::CollectingNotifier;
    use crate::perception::scripted::{
        CountingOverlay, SceneScript, ScriptedDetector, SyntheticCamera, SyntheticFace,
    };
    use crate::perception::GeometricEstimator;
    use crate::recording::MemoryMarkerStore;
    use crate::sim::{SimulatedCapture, SimulatedDevices, SimulatedFullscreen};
    use crate::transport::MemoryApi;
    use crate::violation::MemoryAuditSink;
    use std::time::Duration;

    struct Rig {
        page: Arc<MemoryPage>,
        devices: Arc<SimulatedDevices>,
        fullscreen: Arc<SimulatedFullscreen>,
        capture: Arc<SimulatedCapture>,
        api: Arc<MemoryApi>,
        audit: Arc<MemoryAuditSink>,
        script: SceneScript,
        orchestrator: ProctoringOrchestrator,
    }

    fn rig() -> Rig {
        let mut config = ProctorConfig::default();
        config.perception.loop_interval = Duration::from_millis(5);
        config.perception.startup_grace = Duration::ZERO;
        config.perception.no_face_threshold_frames = 2;
        config.environment.devtools_poll = Duration::from_secs(3600);
        config.recorder.retry_base_delay = Duration::from_millis(1);
        config.fullscreen.transition_timeout = Duration::from_millis(250);

        let page = Arc::new(MemoryPage::new());
        let devices = Arc::new(SimulatedDevices::new());
        let fullscreen = Arc::new(SimulatedFullscreen::new(Some(page.clone())));
        let capture = Arc::new(SimulatedCapture::new());
        let api = Arc::new(MemoryApi::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let script = SceneScript::new();
        let orchestrator = ProctoringOrchestrator::new(
            config,
            ProctoringDeps {
                api: api.clone(),
                devices: devices.clone(),
                fullscreen: fullscreen.clone(),
                page: page.clone(),
                window: Arc::new(FixedWindowMetrics::new((1280, 800), (1280, 800))),
                capture: capture.clone(),
                markers: Arc::new(MemoryMarkerStore::new()),
                notifier: Arc::new(CollectingNotifier::new()),
                clock: Arc::new(ManualClock::new(0)),
                detector: Box::new(ScriptedDetector::new(script.clone())),
                estimator: Box::new(GeometricEstimator),
                progress: None,
                audit: Some(audit.clone()),
            },
        )
        .unwrap();
        Rig {
            page,
            devices,
            fullscreen,
            capture,
            api,
            audit,
            script,
            orchestrator,
        }
    }

    fn start(rig: &Rig) {
        let o = &rig.orchestrator;
        o.set_session("P", true);
        let camera = o.request_camera_stream();
        let screen = o.request_screen_stream();
        o.set_exam_active(true);
        o.start_monitoring(camera, screen);
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..400 {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn full_start_runs_every_subsystem() {
        let rig = rig();
        start(&rig);
        let snap = rig.orchestrator.snapshot();
        assert_eq!(snap.lifecycle, Lifecycle::Monitoring);
        assert!(snap.recording && snap.environment_watching);
        assert!(!snap.perception_running, "models not loaded yet");
        assert!(rig.fullscreen.is_fullscreen());
        assert!(!snap.fullscreen_transition);

        assert!(rig.orchestrator.load_models());
        rig.orchestrator.attach_render_targets(RenderTargets {
            video: Box::new(SyntheticCamera::new()),
            overlay: Box::new(CountingOverlay::default()),
        });
        assert!(rig.orchestrator.snapshot().perception_running);
        rig.orchestrator.detach_render_targets();
        assert!(!rig.orchestrator.snapshot().perception_running);
    }

    #[test]
    fn start_monitoring_twice_keeps_one_recorder() {
        let rig = rig();
        start(&rig);
        rig.orchestrator.set_session("M", false);
        rig.orchestrator.start_monitoring(None, None);
        assert_eq!(rig.capture.devices_created(), 1);
        assert_eq!(
            rig.orchestrator.recording_info().unwrap().session_id.as_deref(),
            Some("P")
        );
    }

    #[test]
    fn non_monitor_share_is_rejected_without_termination() {
        let rig = rig();
        rig.orchestrator.set_session("P", true);
        rig.devices.share_surface(DisplaySurface::Window);
        assert!(rig.orchestrator.request_screen_stream().is_none());
        let state = rig.orchestrator.registry().state();
        assert!(!state.is_terminated);
        assert_eq!(state.violation_count, 1);
        assert!(!rig.devices.last_screen().unwrap().is_active());
    }

    #[test]
    fn screen_share_ending_terminates_and_uploads() {
        let rig = rig();
        let loggedout = Arc::new(AtomicBool::new(false));
        let flag = loggedout.clone();
        rig.orchestrator
            .set_exam_callbacks(Some(Arc::new(move || flag.store(true, Ordering::SeqCst))), None);
        start(&rig);
        rig.capture.emit(vec![9; 32]);
        rig.devices.last_screen().unwrap().tracks()[0].end();

        let snap = rig.orchestrator.snapshot();
        assert_eq!(snap.lifecycle, Lifecycle::Terminated);
        assert!(snap.violations.is_terminated);
        assert!(!snap.recording);
        assert!(loggedout.load(Ordering::SeqCst));
        let finals: Vec<_> = rig
            .api
            .accepted_uploads()
            .into_iter()
            .filter(|u| u.is_final)
            .collect();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].session_id, "P");
    }

    #[test]
    fn pause_keeps_recording_and_ignores_screen_end() {
        let rig = rig();
        start(&rig);
        rig.orchestrator.pause_proctoring_session();
        let snap = rig.orchestrator.snapshot();
        assert_eq!(snap.lifecycle, Lifecycle::Paused);
        assert!(snap.recording);
        assert!(!snap.environment_watching);
        assert!(!rig.fullscreen.is_fullscreen());
        assert_eq!(snap.violations.violation_count, 0);

        rig.page.dispatch(PageSignal::VisibilityChanged { hidden: true });
        rig.orchestrator.resume_monitoring();
        assert!(rig.fullscreen.is_fullscreen());
        assert_eq!(rig.orchestrator.snapshot().lifecycle, Lifecycle::Monitoring);
        assert!(!rig.orchestrator.registry().is_terminated());
    }

    #[test]
    fn involuntary_fullscreen_exit_is_a_violation_and_prompts() {
        let rig = rig();
        start(&rig);
        rig.fullscreen.user_exit();
        let snap = rig.orchestrator.snapshot();
        assert!(snap.fullscreen_prompt_visible);
        assert_eq!(snap.violations.violation_count, 1);
        assert!(!snap.violations.is_terminated);

        rig.orchestrator.decline_fullscreen();
        rig.page
            .dispatch(PageSignal::FullscreenChanged { active: false });
        let snap = rig.orchestrator.snapshot();
        assert!(!snap.fullscreen_prompt_visible);
        assert_eq!(snap.violations.violation_count, 2);
        assert!(rig
            .audit
            .records()
            .iter()
            .any(|r| r.violation_type == ViolationType::FullscreenExited));
    }

    #[test]
    fn reentering_fullscreen_rearms_the_prompt() {
        let rig = rig();
        start(&rig);
        rig.fullscreen.user_exit();
        rig.orchestrator.decline_fullscreen();
        assert!(rig.orchestrator.snapshot().fullscreen_declined);

        rig.fullscreen.request().unwrap();
        let snap = rig.orchestrator.snapshot();
        assert!(!snap.fullscreen_declined);
        assert!(!snap.fullscreen_prompt_visible);

        rig.fullscreen.user_exit();
        let snap = rig.orchestrator.snapshot();
        assert!(snap.fullscreen_prompt_visible);
        assert_eq!(snap.violations.violation_count, 2);
    }

    #[test]
    fn held_transition_suppresses_exits_until_timeout() {
        let rig = rig();
        start(&rig);
        rig.orchestrator.set_transition_state(true);
        rig.fullscreen.user_exit();
        rig.fullscreen.request().unwrap();
        rig.fullscreen.user_exit();
        let snap = rig.orchestrator.snapshot();
        assert_eq!(snap.violations.violation_count, 0);
        assert!(snap.fullscreen_transition);
        assert!(!snap.fullscreen_prompt_visible);

        assert!(wait_for(|| !rig.orchestrator.snapshot().fullscreen_transition));
        rig.fullscreen.request().unwrap();
        rig.fullscreen.user_exit();
        assert_eq!(rig.orchestrator.snapshot().violations.violation_count, 1);

        rig.orchestrator.set_transition_state(true);
        rig.orchestrator.set_transition_state(false);
        rig.fullscreen.request().unwrap();
        rig.fullscreen.user_exit();
        assert_eq!(rig.orchestrator.snapshot().violations.violation_count, 2);
    }

    #[test]
    fn transition_flag_is_force_cleared() {
        let rig = rig();
        start(&rig);
        rig.orchestrator.shared.begin_transition();
        assert!(rig.orchestrator.snapshot().fullscreen_transition);
        assert!(wait_for(|| !rig.orchestrator.snapshot().fullscreen_transition));
    }

    #[test]
    fn perception_violations_reach_registry() {
        let rig = rig();
        rig.script.push_repeated(vec![], 50);
        start(&rig);
        rig.orchestrator.load_models();
        rig.orchestrator.attach_render_targets(RenderTargets {
            video: Box::new(SyntheticCamera::new()),
            overlay: Box::new(CountingOverlay::default()),
        });
        assert!(wait_for(|| rig.orchestrator.registry().is_terminated()));
        assert!(wait_for(|| !rig.orchestrator.snapshot().perception_running));
        assert!(rig
            .audit
            .records()
            .iter()
            .any(|r| r.violation_type == ViolationType::NoFace));
    }

    #[test]
    fn reset_for_new_test_clears_state() {
        let rig = rig();
        rig.script.push(vec![SyntheticFace::default()]);
        start(&rig);
        rig.orchestrator
            .log_violation(ViolationType::HeadTurned, Metadata::new());
        rig.orchestrator.reset_for_new_test();
        let snap = rig.orchestrator.snapshot();
        assert_eq!(snap.lifecycle, Lifecycle::Idle);
        assert_eq!(snap.violations.violation_count, 0);
        assert_eq!(snap.session, SessionIdentity::default());
        assert!(!snap.recording);
    }
}
