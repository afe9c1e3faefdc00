use anyhow::Result;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(self, other: Point) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    pub fn midpoint(self, other: Point) -> Point {
        Point::new((self.x + other.x) / 2.0, (self.y + other.y) / 2.0)
    }
}

/// Face bounding box in frame pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// 68-point facial landmarks (iBUG 300-W ordering).
#[derive(Clone, Debug, PartialEq)]
pub struct FaceLandmarks {
    pub points: Vec<Point>,
}

impl FaceLandmarks {
    pub const POINT_COUNT: usize = 68;

    pub fn is_complete(&self) -> bool {
        self.points.len() >= Self::POINT_COUNT
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    pub score: f32,
    pub landmarks: Option<FaceLandmarks>,
}

/// Face detector backend.
///
/// Implementations receive pixels only for the duration of `detect` and must not retain
/// them. Results are ordered most-confident first.
pub trait FaceDetector: Send {
    fn name(&self) -> &'static str;

    /// Loads model weights. Called once before the perception loop may start.
    fn load(&mut self) -> Result<()> {
        Ok(())
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<FaceDetection>>;
}
