//! Pluggable audit-event sink.
//!
//! Every decision boundary (JWT validation, session lifecycle, token
//! exchange, delegation call) emits one [`sysevent::Entry`] — built from the
//! fixed event-code catalogue in `sysevent-codes` rather than a free-form
//! string — through an `Arc<dyn AuditSink>` threaded through application
//! state, the same way the teacher threads its own system-event logger.
//! Durable persistence is out of scope here: [`TracingAuditSink`] bridges
//! entries onto `tracing` (no syslog/ETW backend is wired up), and
//! [`NullAuditSink`] is provided for tests.

use async_trait::async_trait;
use sysevent::{Entry, Severity, SysEventError, SystemEventSink};

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, entry: Entry);
}

/// Bridges [`sysevent::Entry`] onto `tracing`, picking the macro by severity.
pub struct TracingAuditSink;

impl SystemEventSink for TracingAuditSink {
    fn emit(&self, entry: Entry) -> Result<(), SysEventError> {
        let fields = entry.fields.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(" ");

        match entry.severity {
            Severity::Critical | Severity::Error => error!(code = entry.event_code, "{} {fields}", entry.message),
            Severity::Warning => warn!(code = entry.event_code, "{} {fields}", entry.message),
            Severity::Notice | Severity::Info => info!(code = entry.event_code, "{} {fields}", entry.message),
            Severity::Debug => debug!(code = entry.event_code, "{} {fields}", entry.message),
        }

        Ok(())
    }

    fn flush(&self) -> Result<(), SysEventError> {
        Ok(())
    }
}

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn emit(&self, entry: Entry) {
        // `SystemEventSink::emit` is synchronous by contract (a syslog/ETW
        // write is a blocking syscall, not a future); the bridge never fails,
        // so there's nothing to propagate here.
        let _ = SystemEventSink::emit(self, entry);
    }
}

pub struct NullAuditSink;

#[async_trait]
impl AuditSink for NullAuditSink {
    async fn emit(&self, _entry: Entry) {}
}
