//! Media streams, device permissions and fullscreen control.
//!
//! Tracks are shared handles: the orchestrator owns the streams, the recorder and the
//! perception loop only read from them.

use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Surface a display-capture track is showing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplaySurface {
    Monitor,
    Window,
    Browser,
}

impl DisplaySurface {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplaySurface::Monitor => "monitor",
            DisplaySurface::Window => "window",
            DisplaySurface::Browser => "browser",
        }
    }
}

pub type EndedHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct TrackState {
    ended: bool,
    handlers: Vec<EndedHandler>,
}

struct TrackInner {
    id: u64,
    kind: TrackKind,
    label: String,
    surface: Option<DisplaySurface>,
    state: Mutex<TrackState>,
}

static NEXT_TRACK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("live", &self.is_live())
            .finish()
    }
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: &str) -> Self {
        Self::build(kind, label, None)
    }

    pub fn display(label: &str, surface: DisplaySurface) -> Self {
        Self::build(TrackKind::Video, label, Some(surface))
    }

    fn build(kind: TrackKind, label: &str, surface: Option<DisplaySurface>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: NEXT_TRACK_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                label: label.to_string(),
                surface,
                state: Mutex::new(TrackState::default()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn display_surface(&self) -> Option<DisplaySurface> {
        self.inner.surface
    }

    pub fn is_live(&self) -> bool {
        self.inner.state.lock().map(|s| !s.ended).unwrap_or(false)
    }

    pub fn on_ended(&self, handler: EndedHandler) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.handlers.push(handler);
        }
    }

    /// Drops every `on_ended` handler.
    pub fn clear_ended_handlers(&self) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.handlers.clear();
        }
    }

    /// Local stop. Does not fire `ended` handlers.
    pub fn stop(&self) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.ended = true;
        }
    }

    /// The source went away (user revoked sharing, device unplugged); fires handlers once.
    pub fn end(&self) {
        let handlers = match self.inner.state.lock() {
            Ok(mut state) if !state.ended => {
                state.ended = true;
                state.handlers.clone()
            }
            _ => return,
        };
        for handler in handlers {
            handler();
        }
    }

    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[derive(Clone, Debug, Default)]
pub struct MediaStream {
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { tracks }
    }

    /// Video tracks of `video` plus audio tracks of `audio`, sharing the same tracks.
    pub fn combine(video: &MediaStream, audio: Option<&MediaStream>) -> Self {
        let mut tracks: Vec<MediaTrack> = video.video_tracks().cloned().collect();
        if let Some(audio) = audio {
            tracks.extend(audio.audio_tracks().cloned());
        }
        Self { tracks }
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    /// Surface of the first video track, if it is a display capture.
    pub fn display_surface(&self) -> Option<DisplaySurface> {
        self.video_tracks().next().and_then(|t| t.display_surface())
    }

    pub fn is_active(&self) -> bool {
        self.tracks.iter().any(|t| t.is_live())
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl MediaConstraints {
    pub const CAMERA_AND_MIC: MediaConstraints = MediaConstraints {
        video: true,
        audio: true,
    };
}

/// Permission-gated device access. Errors mean the user or platform refused.
pub trait MediaDevices: Send + Sync {
    fn get_user_media(&self, constraints: MediaConstraints) -> Result<MediaStream>;
    fn get_display_media(&self) -> Result<MediaStream>;
}

pub trait FullscreenControl: Send + Sync {
    fn is_fullscreen(&self) -> bool;
    fn request(&self) -> Result<()>;
    fn exit(&self) -> Result<()>;
}
