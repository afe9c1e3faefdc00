//! Durable marker for a final upload that never made it to the server.
//!
//! There is a single process-wide slot; the last writer wins.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::clock::Clock;
use crate::notify::{NoticeLevel, Notifier};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureMarker {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
}

impl FailureMarker {
    pub fn age(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.timestamp_ms))
    }
}

pub trait FailureMarkerStore: Send + Sync {
    fn load(&self) -> Result<Option<FailureMarker>>;
    fn save(&self, marker: &FailureMarker) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// JSON file store. Writes go through a temp file and a rename.
#[derive(Debug)]
pub struct FileMarkerStore {
    path: PathBuf,
}

impl FileMarkerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FailureMarkerStore for FileMarkerStore {
    fn load(&self) -> Result<Option<FailureMarker>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.path.display()))
            }
        };
        let marker = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid failure marker {}: {}", self.path.display(), e))?;
        Ok(Some(marker))
    }

    fn save(&self, marker: &FailureMarker) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        let body = serde_json::to_vec(marker)?;
        std::fs::write(&tmp, body).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove {}", self.path.display())),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryMarkerStore {
    slot: Mutex<Option<FailureMarker>>,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<FailureMarker> {
        self.slot.lock().ok().and_then(|s| s.clone())
    }
}

impl FailureMarkerStore for MemoryMarkerStore {
    fn load(&self) -> Result<Option<FailureMarker>> {
        Ok(self.current())
    }

    fn save(&self, marker: &FailureMarker) -> Result<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| anyhow!("marker slot poisoned"))?;
        *slot = Some(marker.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| anyhow!("marker slot poisoned"))?;
        *slot = None;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecoveryCheck {
    NoMarker,
    /// A different session failed recently; the user was warned.
    PreviousSessionFailed(FailureMarker),
    /// Marker kept without a warning (same session, or past the recovery window).
    Retained(FailureMarker),
    /// Marker was past the cleanup window and has been deleted.
    Expired(FailureMarker),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoveryWindows {
    pub recovery: Duration,
    pub cleanup: Duration,
}

/// Inspects the marker slot when a new session identity is established.
pub fn check_on_session(
    store: &dyn FailureMarkerStore,
    session_id: &str,
    windows: RecoveryWindows,
    clock: &dyn Clock,
    notifier: &dyn Notifier,
) -> RecoveryCheck {
    let marker = match store.load() {
        Ok(Some(marker)) => marker,
        Ok(None) => return RecoveryCheck::NoMarker,
        Err(err) => {
            log::warn!("failed to read upload failure marker: {:#}", err);
            return RecoveryCheck::NoMarker;
        }
    };
    let age = marker.age(clock.now_ms());
    if age > windows.cleanup {
        if let Err(err) = store.clear() {
            log::warn!("failed to delete stale failure marker: {:#}", err);
        }
        log::info!(
            "deleted failure marker for session {} ({:?} old)",
            marker.session_id,
            age
        );
        return RecoveryCheck::Expired(marker);
    }
    if marker.session_id != session_id && age < windows.recovery {
        log::warn!(
            "previous session {} has an unresolved recording upload failure",
            marker.session_id
        );
        notifier.notify(
            NoticeLevel::Info,
            "The screen recording from a previous test may not have been uploaded completely.",
        );
        return RecoveryCheck::PreviousSessionFailed(marker);
    }
    RecoveryCheck::Retained(marker)
}

/// After a successful final upload, drops the marker if it belongs to this session or is
/// older than the recovery window. Returns true when it was cleared.
pub fn clear_after_success(
    store: &dyn FailureMarkerStore,
    session_id: &str,
    recovery_window: Duration,
    clock: &dyn Clock,
) -> bool {
    let marker = match store.load() {
        Ok(Some(marker)) => marker,
        Ok(None) => return false,
        Err(err) => {
            log::warn!("failed to read upload failure marker: {:#}", err);
            return false;
        }
    };
    if marker.session_id != session_id && marker.age(clock.now_ms()) <= recovery_window {
        return false;
    }
    match store.clear() {
        Ok(()) => true,
        Err(err) => {
            log::warn!("failed to clear upload failure marker: {:#}", err);
            false
        }
    }
}
