use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::media::MediaStream;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureOptions {
    pub mime_type: String,
    pub video_bitrate: u32,
    pub audio_bitrate: u32,
}

/// Receives encoder output. Called from whatever thread the device runs on.
pub trait ChunkSink: Send + Sync {
    fn data_available(&self, data: Vec<u8>);
    /// The device flushed its last segment and stopped.
    fn stopped(&self);
    fn failed(&self, error: &str);
}

/// Timesliced encoder over a media stream.
///
/// `stop` flushes any pending segment through `data_available` and then reports
/// `stopped`, either before returning or later from the device's own thread.
pub trait CaptureDevice: Send {
    fn start(&mut self, timeslice: Duration) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn is_recording(&self) -> bool;
}

pub trait CaptureFactory: Send + Sync {
    fn create(
        &self,
        stream: &MediaStream,
        options: &CaptureOptions,
        sink: Arc<dyn ChunkSink>,
    ) -> Result<Box<dyn CaptureDevice>>;
}
