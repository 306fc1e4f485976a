#![warn(missing_docs)]

//! Audit event types for hookgate observability.
//!
//! Every sandbox violation, circuit breaker transition, block-list change and
//! swallowed callback failure is emitted as an [`AuditEvent`]. This crate only
//! produces the structured records; persistence belongs to whichever
//! [`AuditSink`] the host installs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hookgate_error::{HookError, SandboxViolation};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditEventKind {
    /// A sandbox limit was crossed.
    Violation,
    /// A circuit tripped from closed (or half-open) to open.
    CircuitOpened,
    /// An open circuit admitted a trial call.
    CircuitHalfOpen,
    /// A half-open circuit recovered.
    CircuitClosed,
    /// A circuit was administratively reset.
    CircuitReset,
    /// A plugin was placed on the block list.
    PluginBlocked,
    /// A plugin was removed from the block list.
    PluginUnblocked,
    /// A plugin callback failed and its failure was swallowed.
    CallbackFailed,
}

/// A structured audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Unique event identifier.
    pub event_id: String,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// The type of event.
    pub kind: AuditEventKind,
    /// Plugin the event concerns, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    /// Hook the event concerns, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook: Option<String>,
    /// Kind-specific payload.
    pub payload: Value,
}

impl AuditEvent {
    /// Create a new audit event with the current timestamp.
    pub fn new(kind: AuditEventKind, payload: Value) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            plugin: None,
            hook: None,
            payload,
        }
    }

    /// Attach the plugin slug.
    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }

    /// Attach the hook name.
    pub fn with_hook(mut self, hook: impl Into<String>) -> Self {
        self.hook = Some(hook.into());
        self
    }

    /// A sandbox violation, optionally observed while dispatching `hook`.
    pub fn violation(violation: &SandboxViolation, hook: Option<&str>) -> Self {
        let event = Self::new(AuditEventKind::Violation, violation.to_structured())
            .with_plugin(violation.plugin());
        match hook {
            Some(hook) => event.with_hook(hook),
            None => event,
        }
    }

    /// A circuit state change for `key` (`plugin:hook`).
    pub fn circuit(kind: AuditEventKind, key: &str, from: &str, to: &str) -> Self {
        let mut event = Self::new(
            kind,
            serde_json::json!({ "key": key, "from": from, "to": to }),
        );
        if let Some((owner, hook)) = key.split_once(':') {
            event.hook = Some(hook.to_string());
            if owner != "core" {
                event.plugin = Some(owner.to_string());
            }
        }
        event
    }

    /// A swallowed callback failure.
    pub fn callback_failed(plugin: Option<&str>, hook: &str, error: &HookError) -> Self {
        let mut event = Self::new(
            AuditEventKind::CallbackFailed,
            serde_json::json!({ "code": error.code(), "message": error.to_string() }),
        )
        .with_hook(hook);
        event.plugin = plugin.map(str::to_string);
        event
    }
}

/// Trait for audit backends.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    /// Record an audit event. Sinks never fail the caller.
    async fn record(&self, event: &AuditEvent);
}

/// A no-op sink for when auditing is not needed.
pub struct NoopAuditSink;

#[async_trait::async_trait]
impl AuditSink for NoopAuditSink {
    async fn record(&self, _event: &AuditEvent) {}
}

/// A sink that emits events via the [`tracing`] framework.
///
/// Events are logged at `INFO` level with `audit = true` for easy filtering.
pub struct TracingAuditSink;

#[async_trait::async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &AuditEvent) {
        tracing::info!(
            audit = true,
            event_id = %event.event_id,
            kind = ?event.kind,
            plugin = event.plugin.as_deref().unwrap_or("core"),
            hook = event.hook.as_deref().unwrap_or(""),
            payload = %event.payload,
            "audit"
        );
    }
}

/// Writes events as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesAuditSink<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditSink<W> {
    /// Create a new JSON lines sink writing to `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Consume the sink and return the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditSink for JsonLinesAuditSink<W> {
    async fn record(&self, event: &AuditEvent) {
        let mut line = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit event");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit event");
        }
        let _ = writer.flush().await;
    }
}

/// Collects events in memory. Useful for embedding hosts that forward
/// events in batches, and for tests.
#[derive(Default, Clone)]
pub struct MemoryAuditSink {
    events: Arc<parking_lot::Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every event recorded so far.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Events of a single kind.
    pub fn events_of(&self, kind: AuditEventKind) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Drain all recorded events.
    pub fn take(&self) -> Vec<AuditEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

#[async_trait::async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: &AuditEvent) {
        self.events.lock().push(event.clone());
    }
}
