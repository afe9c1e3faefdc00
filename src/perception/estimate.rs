//! Head-pose and eye-openness estimators.
//!
//! These are geometric approximations over 2D landmarks, not calibrated biometrics. The
//! analyzer only relies on the thresholds they are compared against, so a model-based
//! estimator can be swapped in behind `PoseEstimator`.

use super::detector::{FaceLandmarks, Point};

const LEFT_EYE: [usize; 6] = [36, 37, 38, 39, 40, 41];
const RIGHT_EYE: [usize; 6] = [42, 43, 44, 45, 46, 47];
const NOSE_TIP: usize = 30;
const CHIN: usize = 8;
const LEFT_EYE_OUTER: usize = 36;
const RIGHT_EYE_OUTER: usize = 45;

/// Nose tip sits at roughly this fraction of the eye-line-to-chin distance when the head
/// is level.
pub const NEUTRAL_NOSE_RATIO: f32 = 0.40;
const PITCH_GAIN_DEG: f32 = 150.0;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HeadPose {
    pub yaw_deg: f32,
    pub pitch_deg: f32,
}

pub trait PoseEstimator: Send + Sync {
    /// `None` when the landmarks are insufficient.
    fn head_pose(&self, landmarks: &FaceLandmarks) -> Option<HeadPose>;

    /// Mean eye aspect ratio of both eyes.
    fn eye_aspect_ratio(&self, landmarks: &FaceLandmarks) -> Option<f32>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct GeometricEstimator;

impl PoseEstimator for GeometricEstimator {
    fn head_pose(&self, landmarks: &FaceLandmarks) -> Option<HeadPose> {
        if !landmarks.is_complete() {
            return None;
        }
        let p = &landmarks.points;
        let left = p[LEFT_EYE_OUTER];
        let right = p[RIGHT_EYE_OUTER];
        let eye_mid = left.midpoint(right);
        let half_iod = left.distance(right) / 2.0;
        if half_iod <= f32::EPSILON {
            return None;
        }
        let lateral = ((p[NOSE_TIP].x - eye_mid.x) / half_iod).clamp(-1.0, 1.0);
        let yaw_deg = lateral.asin().to_degrees();

        let face_height = p[CHIN].y - eye_mid.y;
        if face_height <= f32::EPSILON {
            return None;
        }
        let ratio = (p[NOSE_TIP].y - eye_mid.y) / face_height;
        let pitch_deg = (ratio - NEUTRAL_NOSE_RATIO) * PITCH_GAIN_DEG;

        Some(HeadPose { yaw_deg, pitch_deg })
    }

    fn eye_aspect_ratio(&self, landmarks: &FaceLandmarks) -> Option<f32> {
        if !landmarks.is_complete() {
            return None;
        }
        let left = eye_ratio(&landmarks.points, LEFT_EYE)?;
        let right = eye_ratio(&landmarks.points, RIGHT_EYE)?;
        Some((left + right) / 2.0)
    }
}

fn eye_ratio(points: &[Point], idx: [usize; 6]) -> Option<f32> {
    let [p0, p1, p2, p3, p4, p5] = idx.map(|i| points[i]);
    let width = p0.distance(p3);
    if width <= f32::EPSILON {
        return None;
    }
    Some((p1.distance(p5) + p2.distance(p4)) / (2.0 * width))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::scripted::{synthetic_landmarks, SyntheticFace};

    #[test]
    fn frontal_face_is_level() {
        let lm = synthetic_landmarks(&SyntheticFace::default());
        let pose = GeometricEstimator.head_pose(&lm).unwrap();
        assert!(pose.yaw_deg.abs() < 1.0, "yaw {}", pose.yaw_deg);
        assert!(pose.pitch_deg.abs() < 1.0, "pitch {}", pose.pitch_deg);
        let ear = GeometricEstimator.eye_aspect_ratio(&lm).unwrap();
        assert!(ear > 0.25, "ear {}", ear);
    }

    #[test]
    fn shifted_nose_reads_as_yaw() {
        let face = SyntheticFace {
            yaw_deg: 35.0,
            ..SyntheticFace::default()
        };
        let pose = GeometricEstimator
            .head_pose(&synthetic_landmarks(&face))
            .unwrap();
        assert!((pose.yaw_deg - 35.0).abs() < 1.0, "yaw {}", pose.yaw_deg);
    }

    #[test]
    fn closed_eyes_have_low_ratio() {
        let face = SyntheticFace {
            eye_openness: 0.05,
            ..SyntheticFace::default()
        };
        let ear = GeometricEstimator
            .eye_aspect_ratio(&synthetic_landmarks(&face))
            .unwrap();
        assert!(ear < 0.1, "ear {}", ear);
    }

    #[test]
    fn incomplete_landmarks_yield_nothing() {
        let lm = FaceLandmarks {
            points: vec![Point::default(); 5],
        };
        assert!(GeometricEstimator.head_pose(&lm).is_none());
        assert!(GeometricEstimator.eye_aspect_ratio(&lm).is_none());
    }
}
