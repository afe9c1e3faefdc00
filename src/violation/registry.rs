use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::audit::{AuditSink, ViolationRecord};
use super::kinds::{Metadata, Severity, ViolationType};
use crate::clock::Clock;
use crate::config::ViolationSettings;
use crate::notify::{NoticeLevel, Notifier};
use crate::perception::FaceState;
use crate::session::SessionContext;

const CRITICAL_TERMINATION_MESSAGE: &str = "The exam was terminated due to a critical violation.";
const THRESHOLD_TERMINATION_MESSAGE: &str =
    "The exam was terminated because too many violations were recorded.";

/// Snapshot shared with the UI.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ViolationState {
    pub violation_count: u32,
    pub is_terminated: bool,
    pub face: FaceState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationReason {
    /// A fatal violation type (or a permission denial) ended the attempt.
    Critical(ViolationType),
    /// The running count reached the configured maximum.
    TooManyViolations,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Termination {
    pub reason: TerminationReason,
    pub violation_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogOutcome {
    /// No active session; nothing happened.
    Dropped,
    /// Forwarded to the audit trail only.
    LoggedOnly,
    Counted { violation_count: u32 },
    Terminated(Termination),
    /// The attempt was already over; audited, not counted.
    AlreadyTerminated,
}

type StateListener = Arc<dyn Fn(&ViolationState) + Send + Sync>;
type TerminationListener = Arc<dyn Fn(&Termination) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Listeners {
    next_id: u64,
    state: Vec<(ListenerId, StateListener)>,
    termination: Vec<(ListenerId, TerminationListener)>,
}

/// Violation state machine: `Active` until a fatal type or the count threshold moves it
/// to `Terminated`, where it stays until `reset`.
///
/// Every mutation happens under one lock, so "read count, compare, mark terminated" is a
/// single step even when detectors report from different threads. Listeners run after
/// the lock is released.
pub struct ViolationRegistry {
    session: SessionContext,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    settings: ViolationSettings,
    state: Mutex<ViolationState>,
    last_notice_ms: Mutex<HashMap<ViolationType, u64>>,
    listeners: Mutex<Listeners>,
}

impl ViolationRegistry {
    pub fn new(
        settings: ViolationSettings,
        session: SessionContext,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            session,
            audit,
            notifier,
            clock,
            settings,
            state: Mutex::new(ViolationState::default()),
            last_notice_ms: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Listeners::default()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ViolationState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ViolationState {
        *self.lock_state()
    }

    pub fn is_terminated(&self) -> bool {
        self.lock_state().is_terminated
    }

    pub fn on_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ViolationState) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let id = ListenerId(listeners.next_id);
        listeners.next_id += 1;
        listeners.state.push((id, Arc::new(listener)));
        id
    }

    pub fn on_terminated<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Termination) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let id = ListenerId(listeners.next_id);
        listeners.next_id += 1;
        listeners.termination.push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.state.retain(|(lid, _)| *lid != id);
        listeners.termination.retain(|(lid, _)| *lid != id);
    }

    /// Registers a violation. Never fails; see `LogOutcome` for what happened.
    pub fn log(&self, kind: ViolationType, metadata: Metadata) -> LogOutcome {
        let Some(session_id) = self.session.current_session_id() else {
            log::warn!("cannot log violation {}: no active session", kind);
            return LogOutcome::Dropped;
        };
        log::warn!("[violation] {} {:?}", kind, metadata);
        let severity = kind.severity();

        if severity == Severity::LogOnly {
            self.audit.submit(ViolationRecord {
                session_id,
                violation_type: kind,
                severity,
                description: format!("Logged event: {}", kind),
                violation_metadata: metadata,
            });
            return LogOutcome::LoggedOnly;
        }

        let (outcome, snapshot) = {
            let mut state = self.lock_state();
            if state.is_terminated {
                (LogOutcome::AlreadyTerminated, None)
            } else {
                state.violation_count += 1;
                let fatal = kind.is_fatal();
                if fatal || state.violation_count >= self.settings.max_violations_allowed {
                    state.is_terminated = true;
                    let reason = if fatal {
                        TerminationReason::Critical(kind)
                    } else {
                        TerminationReason::TooManyViolations
                    };
                    (
                        LogOutcome::Terminated(Termination {
                            reason,
                            violation_count: state.violation_count,
                        }),
                        Some(*state),
                    )
                } else {
                    (
                        LogOutcome::Counted {
                            violation_count: state.violation_count,
                        },
                        Some(*state),
                    )
                }
            }
        };

        self.audit.submit(ViolationRecord {
            session_id,
            violation_type: kind,
            severity,
            description: format!("Violation: {}", kind),
            violation_metadata: metadata,
        });

        if let Some(snapshot) = snapshot {
            self.publish_state(&snapshot);
            self.maybe_notify(kind);
        }
        if let LogOutcome::Terminated(termination) = outcome {
            self.announce(&termination);
        }
        outcome
    }

    /// Terminates the attempt without counting (permission denials with no session yet).
    /// Returns `None` when the attempt was already terminated.
    pub fn force_terminate(&self, kind: ViolationType) -> Option<Termination> {
        let (termination, snapshot) = {
            let mut state = self.lock_state();
            if state.is_terminated {
                return None;
            }
            state.is_terminated = true;
            (
                Termination {
                    reason: TerminationReason::Critical(kind),
                    violation_count: state.violation_count,
                },
                *state,
            )
        };
        self.publish_state(&snapshot);
        self.announce(&termination);
        Some(termination)
    }

    /// Overwrites the latest face-observation booleans.
    pub fn update_face_state(&self, face: FaceState) {
        let snapshot = {
            let mut state = self.lock_state();
            if state.is_terminated || state.face == face {
                return;
            }
            state.face = face;
            *state
        };
        self.publish_state(&snapshot);
    }

    /// Back to `Active` with a zero count. Only the orchestrator's new-test path calls this.
    pub fn reset(&self) {
        let snapshot = {
            let mut state = self.lock_state();
            *state = ViolationState::default();
            *state
        };
        if let Ok(mut last) = self.last_notice_ms.lock() {
            last.clear();
        }
        self.publish_state(&snapshot);
        log::info!("violation state reset");
    }

    fn maybe_notify(&self, kind: ViolationType) {
        let Some((level, message)) = kind.notice() else {
            return;
        };
        let now = self.clock.now_ms();
        let cooldown = self.settings.toast_cooldown.as_millis() as u64;
        {
            let Ok(mut last) = self.last_notice_ms.lock() else {
                return;
            };
            if let Some(shown_at) = last.get(&kind) {
                if now.saturating_sub(*shown_at) <= cooldown {
                    return;
                }
            }
            last.insert(kind, now);
        }
        self.notifier.notify(level, message);
    }

    fn announce(&self, termination: &Termination) {
        let message = match termination.reason {
            TerminationReason::Critical(_) => CRITICAL_TERMINATION_MESSAGE,
            TerminationReason::TooManyViolations => THRESHOLD_TERMINATION_MESSAGE,
        };
        log::error!(
            "exam terminated: {:?} after {} violations",
            termination.reason,
            termination.violation_count
        );
        self.notifier.notify(NoticeLevel::Error, message);
        let listeners: Vec<TerminationListener> = {
            let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners.termination.iter().map(|(_, l)| l.clone()).collect()
        };
        for listener in listeners {
            listener(termination);
        }
    }

    fn publish_state(&self, snapshot: &ViolationState) {
        let listeners: Vec<StateListener> = {
            let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners.state.iter().map(|(_, l)| l.clone()).collect()
        };
        for listener in listeners {
            listener(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notify::CollectingNotifier;
    use crate::violation::audit::MemoryAuditSink;
    use crate::violation::kinds::metadata;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Fixture {
        registry: ViolationRegistry,
        session: SessionContext,
        audit: Arc<MemoryAuditSink>,
        notifier: Arc<CollectingNotifier>,
        clock: ManualClock,
    }

    fn fixture(max: u32) -> Fixture {
        let session = SessionContext::new();
        session.set_current("sess-1", true);
        let audit = Arc::new(MemoryAuditSink::new());
        let notifier = Arc::new(CollectingNotifier::new());
        let clock = ManualClock::new(1_000_000);
        let settings = ViolationSettings {
            max_violations_allowed: max,
            toast_cooldown: Duration::from_secs(5),
        };
        let registry = ViolationRegistry::new(
            settings,
            session.clone(),
            audit.clone(),
            notifier.clone(),
            Arc::new(clock.clone()),
        );
        Fixture {
            registry,
            session,
            audit,
            notifier,
            clock,
        }
    }

    #[test]
    fn counts_non_log_only_until_threshold() {
        let fx = fixture(3);
        assert_eq!(
            fx.registry.log(ViolationType::HeadTurned, Metadata::new()),
            LogOutcome::Counted { violation_count: 1 }
        );
        assert_eq!(
            fx.registry.log(ViolationType::TextCopied, Metadata::new()),
            LogOutcome::LoggedOnly
        );
        assert_eq!(
            fx.registry.log(ViolationType::NoFace, Metadata::new()),
            LogOutcome::Counted { violation_count: 2 }
        );
        assert!(!fx.registry.is_terminated());
        match fx.registry.log(ViolationType::EyesClosed, Metadata::new()) {
            LogOutcome::Terminated(t) => {
                assert_eq!(t.reason, TerminationReason::TooManyViolations);
                assert_eq!(t.violation_count, 3);
            }
            other => panic!("expected termination, got {:?}", other),
        }
        assert!(fx.registry.is_terminated());
        assert_eq!(fx.audit.records().len(), 4);
    }

    #[test]
    fn fatal_type_terminates_on_first_call() {
        let fx = fixture(10);
        let outcome = fx
            .registry
            .log(ViolationType::ScreenShareStopped, Metadata::new());
        assert!(matches!(
            outcome,
            LogOutcome::Terminated(Termination {
                reason: TerminationReason::Critical(ViolationType::ScreenShareStopped),
                violation_count: 1
            })
        ));
        let notices = fx.notifier.notices();
        assert!(notices
            .iter()
            .any(|(lvl, msg)| *lvl == NoticeLevel::Error && msg == CRITICAL_TERMINATION_MESSAGE));
    }

    #[test]
    fn terminated_registry_still_audits_but_never_counts() {
        let fx = fixture(2);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        fx.registry.on_terminated(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        fx.registry.log(ViolationType::HeadTurned, Metadata::new());
        fx.registry.log(ViolationType::HeadTurned, Metadata::new());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        for _ in 0..3 {
            assert_eq!(
                fx.registry.log(ViolationType::TabSwitched, Metadata::new()),
                LogOutcome::AlreadyTerminated
            );
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(fx.registry.state().violation_count, 2);
        assert_eq!(fx.audit.records().len(), 5);
    }

    #[test]
    fn missing_session_drops_without_side_effects() {
        let fx = fixture(3);
        fx.session.reset_for_new_test();
        assert_eq!(
            fx.registry.log(ViolationType::NoFace, Metadata::new()),
            LogOutcome::Dropped
        );
        assert!(fx.audit.records().is_empty());
        assert_eq!(fx.registry.state().violation_count, 0);
    }

    #[test]
    fn notices_are_throttled_per_type_but_counting_is_not() {
        let fx = fixture(10);
        fx.registry.log(ViolationType::HeadTurned, Metadata::new());
        fx.registry.log(ViolationType::HeadTurned, Metadata::new());
        fx.registry.log(ViolationType::LookingAway, Metadata::new());
        assert_eq!(fx.registry.state().violation_count, 3);
        assert_eq!(fx.notifier.count(NoticeLevel::Warning), 2);

        fx.clock.advance(Duration::from_secs(6));
        fx.registry.log(ViolationType::HeadTurned, Metadata::new());
        assert_eq!(fx.notifier.count(NoticeLevel::Warning), 3);
    }

    #[test]
    fn uncurated_types_produce_no_notice() {
        let fx = fixture(10);
        fx.registry.log(
            ViolationType::SuspiciousHotkey,
            metadata([("key", serde_json::json!("F12"))]),
        );
        assert!(fx.notifier.notices().is_empty());
        assert_eq!(fx.audit.records()[0].violation_metadata["key"], "F12");
    }

    #[test]
    fn force_terminate_is_one_shot() {
        let fx = fixture(10);
        assert!(fx
            .registry
            .force_terminate(ViolationType::CameraAccessDenied)
            .is_some());
        assert!(fx
            .registry
            .force_terminate(ViolationType::CameraAccessDenied)
            .is_none());
        assert_eq!(fx.registry.state().violation_count, 0);
    }

    #[test]
    fn reset_rearms_and_face_state_freezes_after_termination() {
        let fx = fixture(1);
        fx.registry.log(ViolationType::NoFace, Metadata::new());
        let face = FaceState {
            face_detected: true,
            ..FaceState::default()
        };
        fx.registry.update_face_state(face);
        assert!(!fx.registry.state().face.face_detected);

        fx.registry.reset();
        assert_eq!(fx.registry.state(), ViolationState::default());
        fx.registry.update_face_state(face);
        assert!(fx.registry.state().face.face_detected);
    }

    #[test]
    fn concurrent_loggers_terminate_exactly_once() {
        let fx = Arc::new(fixture(50));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        fx.registry.on_terminated(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fx = fx.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        fx.registry.log(ViolationType::HeadTurned, Metadata::new());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(fx.registry.state().violation_count, 50);
    }
}
