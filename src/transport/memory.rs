use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{
    AssemblyStatus, ChunkUpload, ProctoringApi, ProgressFn, UploadReceipt, UploadStatus,
};
use crate::schedule::CancelToken;
use crate::violation::ViolationRecord;

/// How the in-memory backend answers chunk uploads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UploadFailure {
    #[default]
    None,
    /// Every upload is rejected with this status.
    Always(u16),
    /// Only non-final uploads are rejected.
    Intermediate(u16),
    /// Only final uploads are rejected.
    Final(u16),
    /// The next `n` uploads are rejected with HTTP 503, later ones succeed.
    Next(u32),
}

/// One chunk upload as seen by the in-memory backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadAttempt {
    pub session_id: String,
    pub chunk_index: u32,
    pub is_final: bool,
    pub bytes: usize,
    pub sha256: String,
    pub accepted: bool,
}

#[derive(Default)]
struct MemoryState {
    violations: Vec<ViolationRecord>,
    uploads: Vec<UploadAttempt>,
    failure: UploadFailure,
    remaining_failures: u32,
    upload_delay: Duration,
    sessions: HashMap<String, (u32, u64)>,
    chunk_files: HashMap<String, BTreeMap<u32, Vec<u8>>>,
    recordings: HashMap<String, Vec<u8>>,
}

/// Backend that lives in process memory; selected by a `stub://` base URL.
#[derive(Default)]
pub struct MemoryApi {
    state: Mutex<MemoryState>,
    fail_violations: AtomicBool,
    violation_attempts: AtomicU64,
}

impl MemoryApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_violation_logs(&self, fail: bool) {
        self.fail_violations.store(fail, Ordering::SeqCst);
    }

    pub fn violation_log_attempts(&self) -> u64 {
        self.violation_attempts.load(Ordering::SeqCst)
    }

    pub fn logged_violations(&self) -> Vec<ViolationRecord> {
        self.state
            .lock()
            .map(|s| s.violations.clone())
            .unwrap_or_default()
    }

    pub fn set_upload_failure(&self, failure: UploadFailure) {
        if let Ok(mut state) = self.state.lock() {
            state.failure = failure;
            state.remaining_failures = match failure {
                UploadFailure::Next(n) => n,
                _ => 0,
            };
        }
    }

    /// Simulated network latency per upload; cancellation cuts it short.
    pub fn set_upload_delay(&self, delay: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.upload_delay = delay;
        }
    }

    /// Every upload request received, accepted or not.
    pub fn upload_attempts(&self) -> Vec<UploadAttempt> {
        self.state
            .lock()
            .map(|s| s.uploads.clone())
            .unwrap_or_default()
    }

    pub fn accepted_uploads(&self) -> Vec<UploadAttempt> {
        self.upload_attempts()
            .into_iter()
            .filter(|a| a.accepted)
            .collect()
    }

    /// The recording the backend assembled for `session_id` on its final chunk.
    ///
    /// Chunks are stored per index, a repeated index overwrites the earlier file, and
    /// the final chunk concatenates every stored file in index order.
    pub fn assembled_recording(&self, session_id: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.recordings.get(session_id).cloned())
    }

    fn rejection(state: &mut MemoryState, is_final: bool) -> Option<u16> {
        match state.failure {
            UploadFailure::None => None,
            UploadFailure::Always(code) => Some(code),
            UploadFailure::Intermediate(code) => (!is_final).then_some(code),
            UploadFailure::Final(code) => is_final.then_some(code),
            UploadFailure::Next(_) => {
                if state.remaining_failures > 0 {
                    state.remaining_failures -= 1;
                    Some(503)
                } else {
                    None
                }
            }
        }
    }
}

impl ProctoringApi for MemoryApi {
    fn log_violation(&self, record: &ViolationRecord) -> Result<()> {
        self.violation_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_violations.load(Ordering::SeqCst) {
            return Err(anyhow!("violation log rejected with HTTP 500"));
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("memory api state poisoned"))?;
        state.violations.push(record.clone());
        Ok(())
    }

    fn upload_chunk(
        &self,
        session_id: &str,
        chunk: &ChunkUpload<'_>,
        cancel: &CancelToken,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<UploadReceipt> {
        let delay = self
            .state
            .lock()
            .map(|s| s.upload_delay)
            .map_err(|_| anyhow!("memory api state poisoned"))?;
        if !delay.is_zero() && cancel.wait_timeout(delay) {
            return Err(anyhow!("upload cancelled"));
        }
        if cancel.is_cancelled() {
            return Err(anyhow!("upload cancelled"));
        }

        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("memory api state poisoned"))?;
        let rejection = Self::rejection(&mut state, chunk.is_final);
        state.uploads.push(UploadAttempt {
            session_id: session_id.to_string(),
            chunk_index: chunk.chunk_index,
            is_final: chunk.is_final,
            bytes: chunk.data.len(),
            sha256: hex::encode(Sha256::digest(chunk.data)),
            accepted: rejection.is_none(),
        });
        if let Some(code) = rejection {
            return Err(anyhow!("chunk upload rejected with HTTP {}", code));
        }
        let entry = state.sessions.entry(session_id.to_string()).or_default();
        entry.0 += 1;
        entry.1 += chunk.data.len() as u64;
        let files = state.chunk_files.entry(session_id.to_string()).or_default();
        files.insert(chunk.chunk_index, chunk.data.to_vec());
        if chunk.is_final {
            let assembled: Vec<u8> = files.values().flatten().copied().collect();
            files.clear();
            state.recordings.insert(session_id.to_string(), assembled);
        }
        drop(state);

        if let Some(progress) = progress {
            let total = chunk.data.len() as u64;
            progress(total, total);
        }
        Ok(UploadReceipt {
            body: serde_json::json!({
                "status": "chunk_received",
                "chunk_index": chunk.chunk_index,
                "is_final": chunk.is_final,
            }),
        })
    }

    fn upload_status(&self, session_id: &str) -> Result<UploadStatus> {
        let state = self
            .state
            .lock()
            .map_err(|_| anyhow!("memory api state poisoned"))?;
        let Some((chunks, bytes)) = state.sessions.get(session_id).copied() else {
            return Ok(UploadStatus::default());
        };
        let finished = state
            .uploads
            .iter()
            .any(|u| u.session_id == session_id && u.is_final && u.accepted);
        Ok(UploadStatus {
            status: if finished {
                AssemblyStatus::Completed
            } else {
                AssemblyStatus::ChunkReceived
            },
            chunks_received: Some(chunks),
            total_size: Some(bytes),
            file_url: finished.then(|| format!("memory://recordings/{}.webm", session_id)),
        })
    }
}
