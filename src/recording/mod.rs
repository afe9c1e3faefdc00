//! Screen recording capture, chunked upload and failure recovery.

mod capture;
mod chunk;
mod pipeline;
mod recovery;
mod upload;

pub use capture::{CaptureDevice, CaptureFactory, CaptureOptions, ChunkSink};
pub use chunk::{Chunk, ChunkBuffer};
pub use pipeline::{
    RecorderDeps, RecorderFaultHook, RecordingInfo, RecordingPipeline, SaveOutcome, UploadPhase,
    UploadState,
};
pub use recovery::{
    check_on_session, clear_after_success, FailureMarker, FailureMarkerStore, FileMarkerStore,
    MemoryMarkerStore, RecoveryCheck, RecoveryWindows,
};
pub use upload::{ProgressSink, UploadError, UploadPolicy, UploadedBlob, Uploader};
