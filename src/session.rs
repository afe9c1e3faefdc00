//! Exam session identity.
//!
//! The current session id changes as the exam moves from the preliminary phase to the main
//! phase, but a recording is attributed to the session it started under. The first
//! preliminary id is therefore pinned and wins over every later id until a new test.

use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionIdentity {
    pub current_session_id: Option<String>,
    pub is_current_preliminary: bool,
    pub original_preliminary_session_id: Option<String>,
}

impl SessionIdentity {
    pub fn recording_session_id(&self) -> Option<&str> {
        self.original_preliminary_session_id
            .as_deref()
            .or(self.current_session_id.as_deref())
    }
}

/// Shared handle on the session identity. Cloning shares the same slot.
#[derive(Clone, Debug, Default)]
pub struct SessionContext {
    inner: Arc<Mutex<SessionIdentity>>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SessionIdentity> {
        // Identity writes are plain field stores; a poisoned guard still holds a usable value.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_current(&self, session_id: &str, is_preliminary: bool) {
        let mut identity = self.lock();
        identity.current_session_id = Some(session_id.to_string());
        identity.is_current_preliminary = is_preliminary;
        if is_preliminary && identity.original_preliminary_session_id.is_none() {
            identity.original_preliminary_session_id = Some(session_id.to_string());
            log::info!("original preliminary session pinned: {}", session_id);
        }
        log::info!(
            "session id set: {} (preliminary={})",
            session_id,
            is_preliminary
        );
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.lock().current_session_id.clone()
    }

    pub fn is_current_preliminary(&self) -> bool {
        self.lock().is_current_preliminary
    }

    /// Durable attribution id for recordings.
    pub fn recording_session_id(&self) -> Option<String> {
        self.lock().recording_session_id().map(str::to_string)
    }

    pub fn snapshot(&self) -> SessionIdentity {
        self.lock().clone()
    }

    pub fn reset_for_new_test(&self) {
        *self.lock() = SessionIdentity::default();
        log::info!("session identity reset for new test");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_id_stays_on_first_preliminary() {
        let ctx = SessionContext::new();
        ctx.set_current("P", true);
        ctx.set_current("M", false);
        assert_eq!(ctx.current_session_id().as_deref(), Some("M"));
        assert_eq!(ctx.recording_session_id().as_deref(), Some("P"));
    }

    #[test]
    fn later_preliminary_does_not_overwrite_pin() {
        let ctx = SessionContext::new();
        ctx.set_current("P1", true);
        ctx.set_current("P2", true);
        assert_eq!(ctx.recording_session_id().as_deref(), Some("P1"));
    }

    #[test]
    fn main_only_session_is_its_own_attribution() {
        let ctx = SessionContext::new();
        ctx.set_current("M", false);
        assert_eq!(ctx.recording_session_id().as_deref(), Some("M"));
        assert!(!ctx.is_current_preliminary());
    }

    #[test]
    fn reset_clears_everything() {
        let ctx = SessionContext::new();
        ctx.set_current("P", true);
        ctx.reset_for_new_test();
        assert_eq!(ctx.snapshot(), SessionIdentity::default());
        assert!(ctx.recording_session_id().is_none());
    }
}
