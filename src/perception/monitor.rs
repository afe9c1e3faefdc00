use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::analyzer::{AnalysisResult, FaceAnalyzer};
use super::frame::RenderTargets;
use crate::clock::Clock;

/// One polling tick's worth of perception: grace check, analysis, overlay refresh.
///
/// The analyzer and render targets are shared with the orchestrator; the monitor only
/// borrows them for the duration of a tick.
pub struct PerceptionMonitor {
    analyzer: Arc<Mutex<FaceAnalyzer>>,
    targets: Arc<Mutex<Option<RenderTargets>>>,
    clock: Arc<dyn Clock>,
    grace_until_ms: u64,
}

impl PerceptionMonitor {
    pub fn new(
        analyzer: Arc<Mutex<FaceAnalyzer>>,
        targets: Arc<Mutex<Option<RenderTargets>>>,
        clock: Arc<dyn Clock>,
        grace: Duration,
    ) -> Self {
        let grace_until_ms = clock.now_ms() + grace.as_millis() as u64;
        Self {
            analyzer,
            targets,
            clock,
            grace_until_ms,
        }
    }

    pub fn in_grace_period(&self) -> bool {
        self.clock.now_ms() < self.grace_until_ms
    }

    /// `None` during the grace period, without render targets, before the camera is
    /// ready, or when analysis failed (logged).
    pub fn tick(&self) -> Option<AnalysisResult> {
        if self.in_grace_period() {
            return None;
        }
        let mut guard = self.targets.lock().ok()?;
        let targets = guard.as_mut()?;
        let mut analyzer = self.analyzer.lock().ok()?;
        match analyzer.analyze(targets.video.as_mut()) {
            Ok(Some(result)) => {
                targets.overlay.clear();
                Some(result)
            }
            Ok(None) => None,
            Err(err) => {
                log::error!("face analysis failed: {:#}", err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::PerceptionSettings;
    use crate::perception::estimate::GeometricEstimator;
    use crate::perception::scripted::{
        CountingOverlay, SceneScript, ScriptedDetector, SyntheticCamera, SyntheticFace,
    };

    #[test]
    fn grace_period_suppresses_analysis() {
        let script = SceneScript::new();
        script.push(vec![SyntheticFace::default()]);
        let analyzer = Arc::new(Mutex::new(FaceAnalyzer::new(
            Box::new(ScriptedDetector::new(script)),
            Box::new(GeometricEstimator),
            PerceptionSettings::default(),
        )));
        let camera = SyntheticCamera::new();
        let overlay = CountingOverlay::default();
        let targets = Arc::new(Mutex::new(Some(RenderTargets {
            video: Box::new(camera.clone()),
            overlay: Box::new(overlay.clone()),
        })));
        let clock = ManualClock::new(0);
        let monitor = PerceptionMonitor::new(
            analyzer,
            targets.clone(),
            Arc::new(clock.clone()),
            Duration::from_secs(5),
        );

        assert!(monitor.tick().is_none());
        assert_eq!(camera.frames_captured(), 0);

        clock.advance(Duration::from_secs(5));
        let result = monitor.tick().expect("analysis after grace");
        assert!(result.state.face_detected);
        assert_eq!(overlay.clears(), 1);

        targets.lock().unwrap().take();
        assert!(monitor.tick().is_none());
    }
}
