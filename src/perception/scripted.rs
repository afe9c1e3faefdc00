//! Scripted perception backends for tests and the demo harness.
//!
//! `ScriptedDetector` ignores pixel content and replays a queue of synthetic scenes, each
//! a list of faces with a pose. The last scene repeats once the queue drains.

use anyhow::Result;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::detector::{BoundingBox, FaceDetection, FaceDetector, FaceLandmarks, Point};
use super::estimate::NEUTRAL_NOSE_RATIO;
use super::frame::{FrameSource, Overlay, ReadyState, VideoFrame};

const PITCH_GAIN_DEG: f32 = 150.0;

/// Face placed in a synthetic scene.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SyntheticFace {
    pub center_x: f32,
    pub center_y: f32,
    /// Bounding-box width in pixels.
    pub size: f32,
    pub yaw_deg: f32,
    pub pitch_deg: f32,
    /// Target eye aspect ratio.
    pub eye_openness: f32,
    pub score: f32,
}

impl Default for SyntheticFace {
    fn default() -> Self {
        Self {
            center_x: 320.0,
            center_y: 200.0,
            size: 160.0,
            yaw_deg: 0.0,
            pitch_deg: 0.0,
            eye_openness: 0.3,
            score: 0.9,
        }
    }
}

/// Builds a 68-point landmark set matching the requested pose.
pub fn synthetic_landmarks(face: &SyntheticFace) -> FaceLandmarks {
    let (cx, cy) = (face.center_x, face.center_y);
    let s = face.size * 0.3;
    let mut points = vec![Point::new(cx, cy); FaceLandmarks::POINT_COUNT];

    let chin_y = cy + 2.5 * s;
    points[8] = Point::new(cx, chin_y);
    let ratio = NEUTRAL_NOSE_RATIO + face.pitch_deg / PITCH_GAIN_DEG;
    points[30] = Point::new(
        cx + s * face.yaw_deg.to_radians().sin(),
        cy + ratio * (chin_y - cy),
    );

    place_eye(&mut points, 36, cx - s, cx - 0.3 * s, cy, face.eye_openness);
    place_eye(&mut points, 42, cx + 0.3 * s, cx + s, cy, face.eye_openness);
    FaceLandmarks { points }
}

fn place_eye(points: &mut [Point], first: usize, x_start: f32, x_end: f32, y: f32, ear: f32) {
    let width = x_end - x_start;
    let gap = ear * width;
    let x1 = x_start + width / 3.0;
    let x2 = x_start + 2.0 * width / 3.0;
    points[first] = Point::new(x_start, y);
    points[first + 1] = Point::new(x1, y - gap / 2.0);
    points[first + 2] = Point::new(x2, y - gap / 2.0);
    points[first + 3] = Point::new(x_end, y);
    points[first + 4] = Point::new(x2, y + gap / 2.0);
    points[first + 5] = Point::new(x1, y + gap / 2.0);
}

pub fn synthetic_detection(face: &SyntheticFace) -> FaceDetection {
    FaceDetection {
        bbox: BoundingBox {
            x: face.center_x - face.size / 2.0,
            y: face.center_y - face.size / 2.0,
            width: face.size,
            height: face.size * 1.2,
        },
        score: face.score,
        landmarks: Some(synthetic_landmarks(face)),
    }
}

/// Shared queue of scenes; clone to keep feeding a detector that was moved elsewhere.
#[derive(Clone, Debug, Default)]
pub struct SceneScript {
    scenes: Arc<Mutex<VecDeque<Vec<SyntheticFace>>>>,
    last: Arc<Mutex<Vec<SyntheticFace>>>,
}

impl SceneScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, faces: Vec<SyntheticFace>) {
        if let Ok(mut scenes) = self.scenes.lock() {
            scenes.push_back(faces);
        }
    }

    pub fn push_repeated(&self, faces: Vec<SyntheticFace>, times: usize) {
        for _ in 0..times {
            self.push(faces.clone());
        }
    }

    fn next_scene(&self) -> Vec<SyntheticFace> {
        let next = self.scenes.lock().ok().and_then(|mut s| s.pop_front());
        let Ok(mut last) = self.last.lock() else {
            return Vec::new();
        };
        if let Some(scene) = next {
            *last = scene;
        }
        last.clone()
    }
}

pub struct ScriptedDetector {
    script: SceneScript,
    fail_load: bool,
}

impl ScriptedDetector {
    pub fn new(script: SceneScript) -> Self {
        Self {
            script,
            fail_load: false,
        }
    }

    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }
}

impl FaceDetector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn load(&mut self) -> Result<()> {
        if self.fail_load {
            return Err(anyhow::anyhow!("scripted detector configured to fail loading"));
        }
        Ok(())
    }

    fn detect(&mut self, _pixels: &[u8], _width: u32, _height: u32) -> Result<Vec<FaceDetection>> {
        Ok(self
            .script
            .next_scene()
            .iter()
            .map(synthetic_detection)
            .collect())
    }
}

/// Frame source producing small synthetic frames with a settable ready state.
#[derive(Clone, Debug)]
pub struct SyntheticCamera {
    ready: Arc<Mutex<ReadyState>>,
    frames: Arc<AtomicU64>,
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self {
            ready: Arc::new(Mutex::new(ReadyState::HaveEnoughData)),
            frames: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl SyntheticCamera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready_state(&self, state: ReadyState) {
        if let Ok(mut ready) = self.ready.lock() {
            *ready = state;
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }
}

impl FrameSource for SyntheticCamera {
    fn ready_state(&self) -> ReadyState {
        self.ready
            .lock()
            .map(|r| *r)
            .unwrap_or(ReadyState::HaveNothing)
    }

    fn capture(&mut self) -> Result<VideoFrame> {
        let n = self.frames.fetch_add(1, Ordering::SeqCst) + 1;
        let pixels = (0..64u64).map(|i| ((i + n) % 256) as u8).collect();
        Ok(VideoFrame::new(pixels, 8, 8, n))
    }
}

/// Overlay that only counts clears.
#[derive(Clone, Debug, Default)]
pub struct CountingOverlay {
    clears: Arc<AtomicU64>,
}

impl CountingOverlay {
    pub fn clears(&self) -> u64 {
        self.clears.load(Ordering::SeqCst)
    }
}

impl Overlay for CountingOverlay {
    fn clear(&mut self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }
}
