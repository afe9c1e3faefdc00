//! Exam Proctor
//!
//! Client-side supervision core for a remotely proctored exam: it watches the
//! candidate's camera and browsing environment, turns suspicious behaviour into
//! auditable violations, ends the attempt when policy says so, and keeps a screen
//! recording flowing to the server despite flaky networks.
//!
//! # Architecture
//!
//! The core holds a few rules fixed in code:
//!
//! 1. **Monotonic count**: the violation count never decreases during an attempt.
//! 2. **Sticky termination**: once terminated, an attempt stays terminated until reset.
//! 3. **Immutable chunks**: recorded chunks are never dropped or reordered before a
//!    successful final upload.
//! 4. **Durable attribution**: every upload of one recording goes to the session id
//!    that was current when the first preliminary session started.
//!
//! # Module Structure
//!
//! - `perception`: face detection, head pose, eye closure, debounced into violations
//! - `environment`: page-level signals (visibility, focus, hotkeys, clipboard, devtools)
//! - `violation`: severity table, counting policy, termination, audit trail
//! - `recording`: capture buffer, chunked retried uploads, failure markers
//! - `orchestrator`: lifecycle wiring between all of the above
//! - `transport`: the proctoring server API (HTTP or in-memory)
//! - `sim`: simulated browser collaborators for demos and tests

pub mod clock;
pub mod config;
pub mod environment;
pub mod media;
pub mod notify;
pub mod orchestrator;
pub mod perception;
pub mod recording;
pub mod schedule;
pub mod session;
pub mod sim;
pub mod transport;
pub mod violation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ProctorConfig;
pub use media::{DisplaySurface, MediaStream, MediaTrack};
pub use notify::{LogNotifier, NoticeLevel, Notifier};
pub use orchestrator::{
    Diagnostics, ExamCallback, Lifecycle, ProctoringDeps, ProctoringOrchestrator,
    ProctoringSnapshot,
};
pub use recording::{RecordingPipeline, SaveOutcome};
pub use session::{SessionContext, SessionIdentity};
pub use violation::{
    LogOutcome, Severity, Termination, TerminationReason, ViolationRegistry, ViolationState,
    ViolationType,
};
