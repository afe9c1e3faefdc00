//! Face presence and pose analysis over the camera feed.

mod analyzer;
mod detector;
mod estimate;
mod frame;
mod monitor;
pub mod scripted;

pub use analyzer::{AnalysisResult, FaceAnalyzer, FaceState, RunLengths};
pub use detector::{BoundingBox, FaceDetection, FaceDetector, FaceLandmarks, Point};
pub use estimate::{GeometricEstimator, HeadPose, PoseEstimator};
pub use frame::{FrameSource, Overlay, ReadyState, RenderTargets, VideoFrame};
pub use monitor::PerceptionMonitor;
