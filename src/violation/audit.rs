use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use super::kinds::{Metadata, Severity, ViolationType};
use crate::transport::ProctoringApi;

/// Body of `POST /proctoring/log-violation`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub session_id: String,
    pub violation_type: ViolationType,
    pub severity: Severity,
    pub description: String,
    pub violation_metadata: Metadata,
}

/// Best-effort audit trail. `submit` never blocks on the network and never fails.
pub trait AuditSink: Send + Sync {
    fn submit(&self, record: ViolationRecord);
}

/// Forwards records to the backend on a dedicated worker thread.
///
/// Failures are logged and dropped; nothing is retried.
pub struct AuditDispatcher {
    tx: Mutex<Option<Sender<ViolationRecord>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl AuditDispatcher {
    pub fn spawn(api: Arc<dyn ProctoringApi>) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::channel::<ViolationRecord>();
        let join = std::thread::Builder::new()
            .name("audit-dispatch".to_string())
            .spawn(move || {
                for record in rx {
                    if let Err(err) = api.log_violation(&record) {
                        log::error!(
                            "failed to log {} for session {}: {:#}",
                            record.violation_type,
                            record.session_id,
                            err
                        );
                    }
                }
            })?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            join: Mutex::new(Some(join)),
        })
    }

    /// Drains queued records and stops the worker.
    pub fn shutdown(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let join = self.join.lock().ok().and_then(|mut j| j.take());
        if let Some(join) = join {
            if join.join().is_err() {
                log::error!("audit dispatcher panicked");
            }
        }
    }
}

impl AuditSink for AuditDispatcher {
    fn submit(&self, record: ViolationRecord) {
        let Ok(guard) = self.tx.lock() else {
            return;
        };
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(record).is_err() {
                    log::error!("audit dispatcher is gone; record dropped");
                }
            }
            None => log::warn!("audit dispatcher shut down; record dropped"),
        }
    }
}

impl Drop for AuditDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Keeps submitted records in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<ViolationRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ViolationRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn submit(&self, record: ViolationRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryApi;

    fn record(kind: ViolationType) -> ViolationRecord {
        ViolationRecord {
            session_id: "s-1".to_string(),
            violation_type: kind,
            severity: kind.severity(),
            description: format!("Violation: {}", kind),
            violation_metadata: Metadata::new(),
        }
    }

    #[test]
    fn record_serializes_with_wire_names() {
        let json = serde_json::to_value(record(ViolationType::NoFace)).unwrap();
        assert_eq!(json["violation_type"], "no_face");
        assert_eq!(json["severity"], "critical");
        assert_eq!(json["session_id"], "s-1");
    }

    #[test]
    fn dispatcher_delivers_and_survives_failures() {
        let api = Arc::new(MemoryApi::new());
        api.fail_violation_logs(true);
        let dispatcher = AuditDispatcher::spawn(api.clone()).unwrap();
        dispatcher.submit(record(ViolationType::HeadTurned));
        dispatcher.shutdown();
        assert_eq!(api.violation_log_attempts(), 1);
        assert!(api.logged_violations().is_empty());

        api.fail_violation_logs(false);
        let dispatcher = AuditDispatcher::spawn(api.clone()).unwrap();
        dispatcher.submit(record(ViolationType::EyesClosed));
        dispatcher.shutdown();
        assert_eq!(api.logged_violations().len(), 1);
    }
}
