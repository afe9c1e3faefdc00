//! Video frame containers and the camera-side frame source seam.

use anyhow::Result;
use zeroize::Zeroize;

/// Buffering level of the camera element, mirroring the media `readyState` ladder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    HaveNothing,
    HaveMetadata,
    HaveCurrentData,
    HaveFutureData,
    HaveEnoughData,
}

impl ReadyState {
    /// Enough data buffered to analyze a frame.
    pub fn is_ready(self) -> bool {
        self >= ReadyState::HaveFutureData
    }
}

/// One captured camera frame. Pixel bytes are private and zeroized on drop.
pub struct VideoFrame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at_ms: u64,
}

impl VideoFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, captured_at_ms: u64) -> Self {
        Self {
            data,
            width,
            height,
            captured_at_ms,
        }
    }

    pub(crate) fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

impl Drop for VideoFrame {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

/// Camera element the analyzer samples from.
pub trait FrameSource: Send {
    fn ready_state(&self) -> ReadyState;

    /// Grab the current frame. Only called when `ready_state().is_ready()`.
    fn capture(&mut self) -> Result<VideoFrame>;
}

/// Drawing surface paired with the camera element (the overlay canvas).
pub trait Overlay: Send {
    fn clear(&mut self);
}

/// Camera element plus overlay. The perception loop only runs while these are attached.
pub struct RenderTargets {
    pub video: Box<dyn FrameSource>,
    pub overlay: Box<dyn Overlay>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_threshold_is_future_data() {
        assert!(!ReadyState::HaveCurrentData.is_ready());
        assert!(ReadyState::HaveFutureData.is_ready());
        assert!(ReadyState::HaveEnoughData.is_ready());
    }

    #[test]
    fn frame_exposes_dimensions() {
        let frame = VideoFrame::new(vec![1, 2, 3], 640, 480, 7);
        assert_eq!(frame.width, 640);
        assert_eq!(frame.byte_len(), 3);
        assert_eq!(frame.pixels(), &[1, 2, 3]);
    }
}
