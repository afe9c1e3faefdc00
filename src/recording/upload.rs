use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::schedule::CancelToken;
use crate::transport::{ChunkUpload, ProctoringApi, UploadReceipt};

/// Percentage callback for large uploads (the "file upload" collaborator).
pub trait ProgressSink: Send + Sync {
    fn progress(&self, percent: u8);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadError {
    Cancelled,
    Exhausted { attempts: u32, last: String },
    MissingSession,
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadError::Cancelled => write!(f, "upload cancelled"),
            UploadError::Exhausted { attempts, last } => {
                write!(f, "upload failed after {} attempts: {}", attempts, last)
            }
            UploadError::MissingSession => write!(f, "no session id for upload"),
        }
    }
}

impl std::error::Error for UploadError {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub large_upload_bytes: usize,
    pub part_bytes: usize,
}

/// Result of a successful blob upload.
#[derive(Clone, Debug)]
pub struct UploadedBlob {
    pub parts: u32,
    pub bytes: usize,
    pub sha256: String,
    pub receipt: UploadReceipt,
}

/// Retrying chunk uploader.
///
/// Each request is attempted up to `max_retries` times with a linear backoff of
/// `attempt * base_delay` between attempts. `cancel` aborts in-flight uploads and their
/// pending backoff; uploads started afterwards are unaffected.
pub struct Uploader {
    api: Arc<dyn ProctoringApi>,
    policy: UploadPolicy,
    cancel: Mutex<CancelToken>,
}

impl Uploader {
    pub fn new(api: Arc<dyn ProctoringApi>, policy: UploadPolicy) -> Self {
        Self {
            api,
            policy,
            cancel: Mutex::new(CancelToken::new()),
        }
    }

    pub fn api(&self) -> &Arc<dyn ProctoringApi> {
        &self.api
    }

    pub fn cancel(&self) {
        if let Ok(mut token) = self.cancel.lock() {
            token.cancel();
            *token = CancelToken::new();
        }
    }

    fn current_token(&self) -> CancelToken {
        self.cancel
            .lock()
            .map(|t| t.clone())
            .unwrap_or_else(|_| {
                let token = CancelToken::new();
                token.cancel();
                token
            })
    }

    /// Number of requests `upload_blob` will make for a blob of `len` bytes.
    pub fn parts_for(&self, len: usize, with_progress: bool) -> u32 {
        if with_progress && len > self.policy.large_upload_bytes && self.policy.part_bytes > 0 {
            len.div_ceil(self.policy.part_bytes) as u32
        } else {
            1
        }
    }

    /// Uploads `blob` as chunk indexes `0..parts`.
    ///
    /// Every blob holds the whole recording so far, so each upload overwrites the
    /// server's earlier chunks instead of appending after them. With a progress sink
    /// and a blob above the large-upload threshold the blob is sent as consecutive
    /// parts, only the last one carrying `is_final`.
    pub fn upload_blob(
        &self,
        session_id: &str,
        blob: &[u8],
        is_final: bool,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<UploadedBlob, UploadError> {
        let cancel = self.current_token();
        let sha256 = hex::encode(Sha256::digest(blob));
        let parts = self.parts_for(blob.len(), progress.is_some());
        let part_len = if parts > 1 {
            self.policy.part_bytes
        } else {
            blob.len().max(1)
        };

        let total = blob.len() as u64;
        let mut done: u64 = 0;
        let mut receipt = UploadReceipt::default();
        if let Some(sink) = progress {
            sink.progress(0);
        }
        for (offset, data) in blob.chunks(part_len).enumerate().map(|(i, d)| (i as u32, d)) {
            let chunk = ChunkUpload {
                data,
                chunk_index: offset,
                is_final: is_final && offset + 1 == parts,
            };
            let mut report = |sent: u64, _part_total: u64| {
                if let Some(sink) = progress {
                    sink.progress(percent(done + sent, total));
                }
            };
            let report: Option<&mut dyn FnMut(u64, u64)> = match progress {
                Some(_) => Some(&mut report),
                None => None,
            };
            receipt = self.send_with_retry(session_id, &chunk, &cancel, report)?;
            done += data.len() as u64;
        }
        if blob.is_empty() {
            let chunk = ChunkUpload {
                data: blob,
                chunk_index: 0,
                is_final,
            };
            receipt = self.send_with_retry(session_id, &chunk, &cancel, None)?;
        }
        if let Some(sink) = progress {
            sink.progress(100);
        }
        log::info!(
            "uploaded {} bytes for session {} (final {}, parts {}, sha256 {})",
            blob.len(),
            session_id,
            is_final,
            parts,
            sha256
        );
        Ok(UploadedBlob {
            parts,
            bytes: blob.len(),
            sha256,
            receipt,
        })
    }

    fn send_with_retry(
        &self,
        session_id: &str,
        chunk: &ChunkUpload<'_>,
        cancel: &CancelToken,
        mut progress: Option<&mut dyn FnMut(u64, u64)>,
    ) -> Result<UploadReceipt, UploadError> {
        let max = self.policy.max_retries.max(1);
        let mut last = String::new();
        for attempt in 1..=max {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            let reborrowed = progress.as_mut().map(|p| &mut **p as &mut dyn FnMut(u64, u64));
            match self.api.upload_chunk(session_id, chunk, cancel, reborrowed) {
                Ok(receipt) => return Ok(receipt),
                Err(err) => {
                    if cancel.is_cancelled() {
                        return Err(UploadError::Cancelled);
                    }
                    log::warn!(
                        "chunk {} upload attempt {}/{} failed: {:#}",
                        chunk.chunk_index,
                        attempt,
                        max,
                        err
                    );
                    last = format!("{:#}", err);
                }
            }
            if attempt < max && cancel.wait_timeout(self.policy.base_delay * attempt) {
                return Err(UploadError::Cancelled);
            }
        }
        Err(UploadError::Exhausted {
            attempts: max,
            last,
        })
    }
}

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.saturating_mul(100) / total).min(100)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryApi, UploadFailure};

    fn policy(max_retries: u32) -> UploadPolicy {
        UploadPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            large_upload_bytes: 8,
            part_bytes: 4,
        }
    }

    #[derive(Default)]
    struct Percentages(Mutex<Vec<u8>>);

    impl ProgressSink for Percentages {
        fn progress(&self, percent: u8) {
            self.0.lock().unwrap().push(percent);
        }
    }

    #[test]
    fn exhausts_after_max_retries() {
        let api = Arc::new(MemoryApi::new());
        api.set_upload_failure(UploadFailure::Always(500));
        let uploader = Uploader::new(api.clone(), policy(3));
        let err = uploader
            .upload_blob("s-1", b"data", true, None)
            .unwrap_err();
        match err {
            UploadError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(last.contains("500"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(api.upload_attempts().len(), 3);
    }

    #[test]
    fn transient_failures_recover() {
        let api = Arc::new(MemoryApi::new());
        api.set_upload_failure(UploadFailure::Next(2));
        let uploader = Uploader::new(api.clone(), policy(3));
        let done = uploader
            .upload_blob("s-1", b"data", false, None)
            .unwrap();
        assert_eq!(done.parts, 1);
        assert_eq!(done.sha256.len(), 64);
        let attempts = api.upload_attempts();
        assert_eq!(attempts.len(), 3);
        assert!(attempts.iter().all(|a| a.chunk_index == 0));
    }

    #[test]
    fn large_blob_with_progress_goes_in_parts() {
        let api = Arc::new(MemoryApi::new());
        let uploader = Uploader::new(api.clone(), policy(1));
        let sink = Percentages::default();
        let done = uploader
            .upload_blob("s-1", b"0123456789", true, Some(&sink))
            .unwrap();
        assert_eq!(done.parts, 3);
        let uploads = api.accepted_uploads();
        let indexes: Vec<(u32, bool, usize)> = uploads
            .iter()
            .map(|u| (u.chunk_index, u.is_final, u.bytes))
            .collect();
        assert_eq!(indexes, vec![(0, false, 4), (1, false, 4), (2, true, 2)]);
        let seen = sink.0.lock().unwrap().clone();
        assert_eq!(seen.first(), Some(&0));
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn large_blob_without_progress_is_one_request() {
        let api = Arc::new(MemoryApi::new());
        let uploader = Uploader::new(api.clone(), policy(1));
        uploader
            .upload_blob("s-1", b"0123456789", true, None)
            .unwrap();
        assert_eq!(api.accepted_uploads().len(), 1);
    }

    #[test]
    fn cancel_stops_retry_loop() {
        let api = Arc::new(MemoryApi::new());
        api.set_upload_failure(UploadFailure::Always(500));
        let uploader = Arc::new(Uploader::new(
            api.clone(),
            UploadPolicy {
                base_delay: Duration::from_secs(30),
                ..policy(5)
            },
        ));
        let worker = {
            let uploader = uploader.clone();
            std::thread::spawn(move || uploader.upload_blob("s-1", b"data", true, None))
        };
        while api.upload_attempts().is_empty() {
            std::thread::sleep(Duration::from_millis(1));
        }
        uploader.cancel();
        assert_eq!(worker.join().unwrap().unwrap_err(), UploadError::Cancelled);
        assert_eq!(api.upload_attempts().len(), 1);

        api.set_upload_failure(UploadFailure::None);
        assert!(uploader.upload_blob("s-1", b"data", true, None).is_ok());
    }
}
