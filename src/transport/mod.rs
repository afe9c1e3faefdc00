//! Backend transport for audit records and recording uploads.
//!
//! `HttpApi` talks to the proctoring backend over blocking HTTP. A `stub://` base URL
//! selects `MemoryApi`, which keeps every request in memory and can be scripted to fail.

mod http;
mod memory;
mod multipart;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::ProctorConfig;
use crate::schedule::CancelToken;
use crate::violation::ViolationRecord;

pub use http::HttpApi;
pub use memory::{MemoryApi, UploadAttempt, UploadFailure};
pub use multipart::MultipartForm;

/// One `POST /upload/screen-chunk/{sessionId}` request.
#[derive(Clone, Copy, Debug)]
pub struct ChunkUpload<'a> {
    pub data: &'a [u8],
    pub chunk_index: u32,
    pub is_final: bool,
}

/// Parsed JSON body of an accepted upload; `Null` when the server sent none.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UploadReceipt {
    pub body: serde_json::Value,
}

/// Server-side assembly state reported by `GET /upload/status/{sessionId}`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyStatus {
    Completed,
    Processing,
    ChunkReceived,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStatus {
    #[serde(default)]
    pub status: AssemblyStatus,
    #[serde(default)]
    pub chunks_received: Option<u32>,
    #[serde(default)]
    pub total_size: Option<u64>,
    #[serde(default)]
    pub file_url: Option<String>,
}

/// Upload progress callback: `(bytes_sent, bytes_total)`.
pub type ProgressFn<'a> = &'a mut dyn FnMut(u64, u64);

pub trait ProctoringApi: Send + Sync {
    fn log_violation(&self, record: &ViolationRecord) -> Result<()>;

    /// Sends one chunk. Implementations should stop early once `cancel` fires.
    fn upload_chunk(
        &self,
        session_id: &str,
        chunk: &ChunkUpload<'_>,
        cancel: &CancelToken,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<UploadReceipt>;

    fn upload_status(&self, session_id: &str) -> Result<UploadStatus>;
}

/// Builds the transport named by `api.base_url`.
pub fn connect(config: &ProctorConfig) -> Result<Arc<dyn ProctoringApi>> {
    let base = config.api.base_url.trim();
    if base.to_lowercase().starts_with("stub://") {
        log::info!("using in-memory proctoring api ({})", base);
        return Ok(Arc::new(MemoryApi::new()));
    }
    let api = HttpApi::new(
        base,
        config.api.token.clone(),
        config.api.request_timeout,
        config.recorder.upload_timeout,
    )?;
    log::info!("using proctoring api at {}", api.base_url());
    Ok(Arc::new(api))
}
