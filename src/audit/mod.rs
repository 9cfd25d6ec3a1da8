//! Audit trail for every mutation attempt and skip.
//!
//! Events are newline-delimited JSON. Sinks are fire-and-forget: an audit
//! write failure is logged and never fails the operation that produced the
//! event.

use crate::resources::ResourceSpec;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error};

/// Category of an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    /// A resource mutation attempt
    ResourceChange,
    /// A policy rule decided the outcome
    PolicyApplication,
    /// The admission pipeline decided the outcome
    ResourceValidation,
    /// Operator lifecycle signals
    OperatorEvent,
}

/// Outcome carried by an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditStatus {
    /// The operation succeeded
    Success,
    /// The operation failed
    Failure,
    /// The operation was skipped
    Skipped,
    /// Dry-run, no mutation issued
    DryRun,
}

/// Pod context attached to every event
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditMetadata {
    /// UID of the pod
    #[serde(rename = "podUID")]
    pub pod_uid: String,
    /// QoS class at event time
    #[serde(rename = "qosClass")]
    pub qos_class: String,
    /// Node the pod runs on
    #[serde(rename = "nodeName")]
    pub node_name: Option<String>,
}

/// One audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// When the event was emitted
    pub timestamp: DateTime<Utc>,
    /// Unique event id
    pub event_id: String,
    /// Event category
    pub event_type: AuditEventType,
    /// Operation label, e.g. `resize` or `reconcile`
    pub operation: String,
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub pod_name: String,
    /// Container the event refers to
    pub container_name: String,
    /// Why the outcome happened
    pub reason: String,
    /// Outcome
    pub status: AuditStatus,
    /// Allocation before the operation
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub old_resources: Option<ResourceSpec>,
    /// Allocation after the operation
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub new_resources: Option<ResourceSpec>,
    /// Operation duration in milliseconds
    #[serde(rename = "duration")]
    pub duration_ms: u64,
    /// Error text for failures
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    /// Pod context
    pub metadata: AuditMetadata,
}

impl AuditEvent {
    /// New event with the given category, operation and status
    pub fn new(
        event_type: AuditEventType,
        operation: impl Into<String>,
        status: AuditStatus,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type,
            operation: operation.into(),
            namespace: String::new(),
            pod_name: String::new(),
            container_name: String::new(),
            reason: String::new(),
            status,
            old_resources: None,
            new_resources: None,
            duration_ms: 0,
            error: None,
            metadata: AuditMetadata::default(),
        }
    }

    /// Attach pod identity
    pub fn with_pod(mut self, namespace: &str, pod_name: &str, container: &str) -> Self {
        self.namespace = namespace.to_string();
        self.pod_name = pod_name.to_string();
        self.container_name = container.to_string();
        self
    }

    /// Attach a reason
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Attach old and new resource specs
    pub fn with_resources(mut self, old: ResourceSpec, new: ResourceSpec) -> Self {
        self.old_resources = Some(old);
        self.new_resources = Some(new);
        self
    }

    /// Attach an error message
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attach the operation duration
    pub fn with_duration(mut self, duration: std::time::Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    /// Attach pod context metadata
    pub fn with_metadata(mut self, metadata: AuditMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Destination for audit events
pub trait AuditSink: Send + Sync {
    /// Record one event. Must not panic; failures are the sink's problem.
    fn record(&self, event: &AuditEvent);
}

/// Appends events to a newline-delimited JSON file
pub struct NdjsonFileSink {
    path: PathBuf,
    writer: Mutex<LineWriter<File>>,
}

impl NdjsonFileSink {
    /// Open (or create) the audit log for appending
    pub fn open(path: impl AsRef<Path>) -> crate::error::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, writer: Mutex::new(LineWriter::new(file)) })
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for NdjsonFileSink {
    fn record(&self, event: &AuditEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(err) => {
                error!(%err, "failed to serialize audit event");
                return;
            }
        };
        let mut writer = self.writer.lock();
        if let Err(err) = writeln!(writer, "{}", line) {
            error!(%err, path = %self.path.display(), "failed to write audit event");
        }
    }
}

/// Keeps events in memory; used by tests
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    /// New empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Events of one category
    pub fn events_of_type(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Number of events with the given status
    pub fn count_with_status(&self, status: AuditStatus) -> usize {
        self.events.lock().iter().filter(|e| e.status == status).count()
    }
}

impl AuditSink for MemorySink {
    fn record(&self, event: &AuditEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Fan-out over the configured sinks
#[derive(Default)]
pub struct AuditLog {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl AuditLog {
    /// New log with no sinks
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink
    pub fn add_sink(&mut self, sink: Arc<dyn AuditSink>) {
        self.sinks.push(sink);
    }

    /// Emit an event to every sink
    pub fn emit(&self, event: AuditEvent) {
        debug!(
            event_type = ?event.event_type,
            status = ?event.status,
            pod = %format!("{}/{}", event.namespace, event.pod_name),
            container = %event.container_name,
            reason = %event.reason,
            "audit"
        );
        for sink in &self.sinks {
            sink.record(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceSpec;

    fn event(status: AuditStatus) -> AuditEvent {
        AuditEvent::new(AuditEventType::ResourceChange, "resize", status)
            .with_pod("default", "web-1", "app")
            .with_reason("test")
            .with_resources(
                ResourceSpec::new(500, 1000, 1 << 28, 1 << 29),
                ResourceSpec::new(250, 375, 1 << 28, 1 << 29),
            )
    }

    #[test]
    fn ndjson_lines_parse_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.ndjson");
        let sink = NdjsonFileSink::open(&path).unwrap();
        sink.record(&event(AuditStatus::Success));
        sink.record(&event(AuditStatus::DryRun));
        drop(sink);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: AuditEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.status, AuditStatus::Success);
        assert_eq!(parsed.pod_name, "web-1");
        assert!(lines[1].contains("\"dry-run\""));
    }

    #[test]
    fn serialized_field_names_are_stable() {
        let json = serde_json::to_value(event(AuditStatus::Failure)).unwrap();
        assert!(json.get("eventId").is_some());
        assert!(json.get("eventType").is_some());
        assert!(json.get("podName").is_some());
        assert!(json.get("duration").is_some());
        assert!(json["metadata"].get("podUID").is_some());
        assert_eq!(json["oldResources"]["cpuRequest"], 500);
    }

    #[test]
    fn memory_sink_counts() {
        let sink = MemorySink::new();
        sink.record(&event(AuditStatus::Success));
        sink.record(&event(AuditStatus::Skipped));
        assert_eq!(sink.count_with_status(AuditStatus::Success), 1);
        assert_eq!(sink.events_of_type(AuditEventType::ResourceChange).len(), 2);
    }
}
