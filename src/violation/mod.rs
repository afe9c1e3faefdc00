//! Violation classification, counting and termination policy.

mod audit;
mod kinds;
mod registry;

pub use audit::{AuditDispatcher, AuditSink, MemoryAuditSink, ViolationRecord};
pub use kinds::{metadata, Metadata, Severity, ViolationType};
pub use registry::{
    ListenerId, LogOutcome, Termination, TerminationReason, ViolationRegistry, ViolationState,
};
