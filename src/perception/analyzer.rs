use anyhow::Result;

use super::detector::{FaceDetection, FaceDetector};
use super::estimate::PoseEstimator;
use super::frame::FrameSource;
use crate::config::PerceptionSettings;
use crate::violation::ViolationType;

/// Latest per-frame observation, overwritten every tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaceState {
    pub face_detected: bool,
    pub multiple_faces: bool,
    pub head_turned: bool,
    pub looking_away: bool,
    pub eyes_closed: bool,
}

#[derive(Clone, Debug, Default)]
pub struct AnalysisResult {
    pub violations: Vec<ViolationType>,
    pub state: FaceState,
    pub detections: Vec<FaceDetection>,
}

/// Consecutive-frame run lengths per condition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunLengths {
    pub no_face: u32,
    pub multiple_faces: u32,
    pub head_turned: u32,
    pub looking_away: u32,
    pub eyes_closed: u32,
}

/// Debounced face analysis.
///
/// A condition must hold for `violation_threshold_frames` consecutive ticks before it is
/// reported, after which its run length restarts from zero. "No face" uses its own
/// threshold and keeps reporting on every tick while the face stays missing.
pub struct FaceAnalyzer {
    detector: Box<dyn FaceDetector>,
    estimator: Box<dyn PoseEstimator>,
    settings: PerceptionSettings,
    runs: RunLengths,
    loaded: bool,
}

impl FaceAnalyzer {
    pub fn new(
        detector: Box<dyn FaceDetector>,
        estimator: Box<dyn PoseEstimator>,
        settings: PerceptionSettings,
    ) -> Self {
        Self {
            detector,
            estimator,
            settings,
            runs: RunLengths::default(),
            loaded: false,
        }
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector.name()
    }

    pub fn load_models(&mut self) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        self.detector.load()?;
        self.loaded = true;
        log::info!("face detector '{}' loaded", self.detector.name());
        Ok(())
    }

    pub fn models_loaded(&self) -> bool {
        self.loaded
    }

    pub fn run_lengths(&self) -> RunLengths {
        self.runs
    }

    pub fn reset(&mut self) {
        self.runs = RunLengths::default();
    }

    /// Analyzes the current frame. `Ok(None)` when the source is not ready yet.
    pub fn analyze(&mut self, source: &mut dyn FrameSource) -> Result<Option<AnalysisResult>> {
        if !source.ready_state().is_ready() {
            return Ok(None);
        }
        let frame = source.capture()?;
        let detections = self
            .detector
            .detect(frame.pixels(), frame.width, frame.height)?;
        drop(frame);
        Ok(Some(self.evaluate(detections)))
    }

    /// Applies thresholds and debouncing to one frame's detections.
    pub fn evaluate(&mut self, detections: Vec<FaceDetection>) -> AnalysisResult {
        let s = &self.settings;
        let present: Vec<&FaceDetection> = detections
            .iter()
            .filter(|d| d.score >= s.detector_score_threshold)
            .filter(|d| d.bbox.width > s.min_face_size_px)
            .collect();

        let mut result = AnalysisResult::default();
        result.state.face_detected = !present.is_empty();
        result.state.multiple_faces = present.len() > 1;

        if result.state.face_detected {
            self.runs.no_face = 0;
        } else {
            self.runs.no_face += 1;
        }
        if self.runs.no_face >= s.no_face_threshold_frames {
            result.violations.push(ViolationType::NoFace);
        }

        if debounce(
            &mut self.runs.multiple_faces,
            result.state.multiple_faces,
            s.violation_threshold_frames,
        ) {
            result.violations.push(ViolationType::MultipleFaces);
        }

        if let Some(primary) = present.first() {
            if let Some(landmarks) = primary.landmarks.as_ref() {
                if let Some(pose) = self.estimator.head_pose(landmarks) {
                    result.state.head_turned = pose.yaw_deg.abs() > s.head_yaw_turned_deg;
                    result.state.looking_away = pose.yaw_deg.abs() > s.head_yaw_away_deg
                        || pose.pitch_deg.abs() > s.head_pitch_away_deg;
                }
                if let Some(ear) = self.estimator.eye_aspect_ratio(landmarks) {
                    result.state.eyes_closed = ear < s.ear_closed_threshold;
                }
            }
            let threshold = s.violation_threshold_frames;
            if debounce(&mut self.runs.head_turned, result.state.head_turned, threshold) {
                result.violations.push(ViolationType::HeadTurned);
            }
            if debounce(
                &mut self.runs.looking_away,
                result.state.looking_away,
                threshold,
            ) {
                result.violations.push(ViolationType::LookingAway);
            }
            if debounce(&mut self.runs.eyes_closed, result.state.eyes_closed, threshold) {
                result.violations.push(ViolationType::EyesClosed);
            }
        }

        result.detections = detections;
        result
    }
}

/// Advances a run length; true when it reaches `threshold` (and restarts it).
fn debounce(run: &mut u32, active: bool, threshold: u32) -> bool {
    if !active {
        *run = 0;
        return false;
    }
    *run += 1;
    if *run >= threshold {
        *run = 0;
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::estimate::GeometricEstimator;
    use crate::perception::frame::ReadyState;
    use crate::perception::scripted::{
        synthetic_detection, SceneScript, ScriptedDetector, SyntheticCamera, SyntheticFace,
    };

    fn settings() -> PerceptionSettings {
        PerceptionSettings {
            no_face_threshold_frames: 3,
            violation_threshold_frames: 2,
            ..PerceptionSettings::default()
        }
    }

    fn analyzer() -> FaceAnalyzer {
        FaceAnalyzer::new(
            Box::new(ScriptedDetector::new(SceneScript::new())),
            Box::new(GeometricEstimator),
            settings(),
        )
    }

    fn face() -> SyntheticFace {
        SyntheticFace::default()
    }

    #[test]
    fn no_face_debounce_and_reset() {
        let mut a = analyzer();
        assert!(a.evaluate(vec![]).violations.is_empty());
        assert!(a.evaluate(vec![]).violations.is_empty());
        assert_eq!(a.evaluate(vec![]).violations, vec![ViolationType::NoFace]);

        let present = a.evaluate(vec![synthetic_detection(&face())]);
        assert!(present.violations.is_empty());
        assert!(present.state.face_detected);
        assert_eq!(a.run_lengths().no_face, 0);

        assert!(a.evaluate(vec![]).violations.is_empty());
        assert!(a.evaluate(vec![]).violations.is_empty());
    }

    #[test]
    fn tiny_detection_does_not_count_as_face() {
        let mut a = analyzer();
        let tiny = SyntheticFace {
            size: 20.0,
            ..face()
        };
        let result = a.evaluate(vec![synthetic_detection(&tiny)]);
        assert!(!result.state.face_detected);
        assert_eq!(a.run_lengths().no_face, 1);
        assert_eq!(result.detections.len(), 1);
    }

    #[test]
    fn head_turn_emits_at_threshold_then_restarts() {
        let mut a = analyzer();
        let turned = SyntheticFace {
            yaw_deg: 30.0,
            ..face()
        };
        let mut emitted = Vec::new();
        for _ in 0..4 {
            let r = a.evaluate(vec![synthetic_detection(&turned)]);
            assert!(r.state.head_turned);
            assert!(!r.state.looking_away);
            emitted.push(r.violations.contains(&ViolationType::HeadTurned));
        }
        assert_eq!(emitted, vec![false, true, false, true]);
    }

    #[test]
    fn strong_yaw_is_also_looking_away() {
        let mut a = analyzer();
        let away = SyntheticFace {
            yaw_deg: 50.0,
            ..face()
        };
        a.evaluate(vec![synthetic_detection(&away)]);
        let r = a.evaluate(vec![synthetic_detection(&away)]);
        assert!(r.violations.contains(&ViolationType::HeadTurned));
        assert!(r.violations.contains(&ViolationType::LookingAway));
    }

    #[test]
    fn multiple_faces_and_closed_eyes() {
        let mut a = analyzer();
        let sleepy = SyntheticFace {
            eye_openness: 0.05,
            ..face()
        };
        let second = SyntheticFace {
            center_x: 500.0,
            ..face()
        };
        let scene = vec![synthetic_detection(&sleepy), synthetic_detection(&second)];
        let first = a.evaluate(scene.clone());
        assert!(first.state.multiple_faces && first.state.eyes_closed);
        assert!(first.violations.is_empty());
        let second = a.evaluate(scene);
        assert!(second.violations.contains(&ViolationType::MultipleFaces));
        assert!(second.violations.contains(&ViolationType::EyesClosed));
    }

    #[test]
    fn interleaved_clear_frame_resets_run() {
        let mut a = analyzer();
        let turned = SyntheticFace {
            yaw_deg: 30.0,
            ..face()
        };
        a.evaluate(vec![synthetic_detection(&turned)]);
        a.evaluate(vec![synthetic_detection(&face())]);
        let r = a.evaluate(vec![synthetic_detection(&turned)]);
        assert!(r.violations.is_empty());
    }

    #[test]
    fn analyze_skips_unready_source() {
        let script = SceneScript::new();
        script.push(vec![]);
        let mut a = FaceAnalyzer::new(
            Box::new(ScriptedDetector::new(script)),
            Box::new(GeometricEstimator),
            settings(),
        );
        let mut camera = SyntheticCamera::new();
        camera.set_ready_state(ReadyState::HaveMetadata);
        assert!(a.analyze(&mut camera).unwrap().is_none());
        assert_eq!(camera.frames_captured(), 0);

        camera.set_ready_state(ReadyState::HaveEnoughData);
        let r = a.analyze(&mut camera).unwrap().unwrap();
        assert!(!r.state.face_detected);
        assert_eq!(camera.frames_captured(), 1);
    }

    #[test]
    fn load_failure_leaves_models_unloaded() {
        let mut a = FaceAnalyzer::new(
            Box::new(ScriptedDetector::new(SceneScript::new()).failing_load()),
            Box::new(GeometricEstimator),
            settings(),
        );
        assert!(a.load_models().is_err());
        assert!(!a.models_loaded());
    }
}
