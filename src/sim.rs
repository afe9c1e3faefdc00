//! Simulated browser collaborators: devices, fullscreen and a capture encoder.
//!
//! Used by the demo harness and the tests. Every simulated event is delivered
//! synchronously on the caller's thread unless a generator is configured.

use anyhow::{anyhow, Result};
use rand::RngCore;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::environment::{MemoryPage, PageSignal};
use crate::media::{
    DisplaySurface, FullscreenControl, MediaConstraints, MediaDevices, MediaStream, MediaTrack,
    TrackKind,
};
use crate::recording::{CaptureDevice, CaptureFactory, CaptureOptions, ChunkSink};
use crate::schedule::PeriodicTask;

struct DeviceState {
    deny_camera: bool,
    deny_screen: bool,
    surface: DisplaySurface,
    camera: Option<MediaStream>,
    screen: Option<MediaStream>,
}

/// Permission prompts that answer from configuration.
pub struct SimulatedDevices {
    state: Mutex<DeviceState>,
    camera_requests: AtomicU64,
    screen_requests: AtomicU64,
}

impl Default for SimulatedDevices {
    fn default() -> Self {
        Self {
            state: Mutex::new(DeviceState {
                deny_camera: false,
                deny_screen: false,
                surface: DisplaySurface::Monitor,
                camera: None,
                screen: None,
            }),
            camera_requests: AtomicU64::new(0),
            screen_requests: AtomicU64::new(0),
        }
    }
}

impl SimulatedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_camera(&self, deny: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.deny_camera = deny;
        }
    }

    pub fn deny_screen(&self, deny: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.deny_screen = deny;
        }
    }

    /// Surface the next screen share will report.
    pub fn share_surface(&self, surface: DisplaySurface) {
        if let Ok(mut state) = self.state.lock() {
            state.surface = surface;
        }
    }

    pub fn last_camera(&self) -> Option<MediaStream> {
        self.state.lock().ok().and_then(|s| s.camera.clone())
    }

    pub fn last_screen(&self) -> Option<MediaStream> {
        self.state.lock().ok().and_then(|s| s.screen.clone())
    }

    pub fn camera_requests(&self) -> u64 {
        self.camera_requests.load(Ordering::SeqCst)
    }

    pub fn screen_requests(&self) -> u64 {
        self.screen_requests.load(Ordering::SeqCst)
    }
}

impl MediaDevices for SimulatedDevices {
    fn get_user_media(&self, constraints: MediaConstraints) -> Result<MediaStream> {
        self.camera_requests.fetch_add(1, Ordering::SeqCst);
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("device state poisoned"))?;
        if state.deny_camera {
            return Err(anyhow!("NotAllowedError: permission denied"));
        }
        let mut tracks = Vec::new();
        if constraints.video {
            tracks.push(MediaTrack::new(TrackKind::Video, "simulated camera"));
        }
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, "simulated microphone"));
        }
        let stream = MediaStream::new(tracks);
        state.camera = Some(stream.clone());
        Ok(stream)
    }

    fn get_display_media(&self) -> Result<MediaStream> {
        self.screen_requests.fetch_add(1, Ordering::SeqCst);
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("device state poisoned"))?;
        if state.deny_screen {
            return Err(anyhow!("NotAllowedError: screen share denied"));
        }
        let stream = MediaStream::new(vec![MediaTrack::display(
            "simulated screen",
            state.surface,
        )]);
        state.screen = Some(stream.clone());
        Ok(stream)
    }
}

/// Fullscreen state that echoes changes to a page as `FullscreenChanged` signals.
pub struct SimulatedFullscreen {
    active: AtomicBool,
    refuse: AtomicBool,
    page: Option<Arc<MemoryPage>>,
}

impl SimulatedFullscreen {
    pub fn new(page: Option<Arc<MemoryPage>>) -> Self {
        Self {
            active: AtomicBool::new(false),
            refuse: AtomicBool::new(false),
            page,
        }
    }

    pub fn refuse_requests(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// The user left fullscreen (Esc, window manager).
    pub fn user_exit(&self) {
        self.transition(false);
    }

    fn transition(&self, active: bool) {
        let was = self.active.swap(active, Ordering::SeqCst);
        if was == active {
            return;
        }
        if let Some(page) = &self.page {
            page.dispatch(PageSignal::FullscreenChanged { active });
        }
    }
}

impl FullscreenControl for SimulatedFullscreen {
    fn is_fullscreen(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn request(&self) -> Result<()> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(anyhow!("fullscreen request refused"));
        }
        self.transition(true);
        Ok(())
    }

    fn exit(&self) -> Result<()> {
        self.transition(false);
        Ok(())
    }
}

#[derive(Default)]
struct CaptureState {
    sink: Option<Arc<dyn ChunkSink>>,
    recording: bool,
    fail_next_create: bool,
    created: u64,
    last_options: Option<CaptureOptions>,
}

/// Capture encoder driven by `emit`, or by a generator emitting random bytes every
/// timeslice.
#[derive(Clone, Default)]
pub struct SimulatedCapture {
    state: Arc<Mutex<CaptureState>>,
    generator_bytes: Option<usize>,
}

impl SimulatedCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emits `bytes_per_slice` random bytes on every timeslice while recording.
    pub fn generating(bytes_per_slice: usize) -> Self {
        Self {
            state: Arc::default(),
            generator_bytes: Some(bytes_per_slice),
        }
    }

    pub fn fail_next_create(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_next_create = true;
        }
    }

    pub fn devices_created(&self) -> u64 {
        self.state.lock().map(|s| s.created).unwrap_or(0)
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().map(|s| s.recording).unwrap_or(false)
    }

    pub fn last_options(&self) -> Option<CaptureOptions> {
        self.state.lock().ok().and_then(|s| s.last_options.clone())
    }

    /// Delivers one encoded segment from the active device.
    pub fn emit(&self, data: Vec<u8>) {
        emit_from(&self.state, data);
    }

    /// Reports an encoder error from the active device.
    pub fn fail(&self, error: &str) {
        let sink = self.state.lock().ok().and_then(|s| s.sink.clone());
        if let Some(sink) = sink {
            sink.failed(error);
        }
    }
}

fn emit_from(state: &Mutex<CaptureState>, data: Vec<u8>) {
    let sink = state
        .lock()
        .ok()
        .filter(|s| s.recording)
        .and_then(|s| s.sink.clone());
    if let Some(sink) = sink {
        sink.data_available(data);
    }
}

impl CaptureFactory for SimulatedCapture {
    fn create(
        &self,
        stream: &MediaStream,
        options: &CaptureOptions,
        sink: Arc<dyn ChunkSink>,
    ) -> Result<Box<dyn CaptureDevice>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("capture state poisoned"))?;
        if std::mem::take(&mut state.fail_next_create) {
            return Err(anyhow!("NotSupportedError: {} is not supported", options.mime_type));
        }
        if stream.video_tracks().next().is_none() {
            return Err(anyhow!("stream has no video track"));
        }
        state.created += 1;
        state.sink = Some(sink);
        state.last_options = Some(options.clone());
        Ok(Box::new(SimulatedDevice {
            state: self.state.clone(),
            generator_bytes: self.generator_bytes,
            generator: None,
        }))
    }
}

struct SimulatedDevice {
    state: Arc<Mutex<CaptureState>>,
    generator_bytes: Option<usize>,
    generator: Option<PeriodicTask>,
}

impl CaptureDevice for SimulatedDevice {
    fn start(&mut self, timeslice: Duration) -> Result<()> {
        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| anyhow!("capture state poisoned"))?;
            state.recording = true;
        }
        if let Some(bytes) = self.generator_bytes {
            let state = self.state.clone();
            self.generator = Some(PeriodicTask::spawn("sim-capture", timeslice, move || {
                let mut data = vec![0u8; bytes];
                rand::thread_rng().fill_bytes(&mut data);
                emit_from(&state, data);
            })?);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(generator) = self.generator.take() {
            generator.stop();
        }
        let sink = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| anyhow!("capture state poisoned"))?;
            if !state.recording {
                return Ok(());
            }
            state.recording = false;
            state.sink.clone()
        };
        if let Some(sink) = sink {
            sink.stopped();
        }
        Ok(())
    }

    fn is_recording(&self) -> bool {
        self.state.lock().map(|s| s.recording).unwrap_or(false)
    }
}
