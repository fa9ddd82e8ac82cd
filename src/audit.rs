//! Audit events for penalties, rate-limit violations and breaker trips.
//!
//! Components never wait on the audit sink: [`AuditDispatcher::emit`] hands
//! the event to a spawned task and returns immediately. Sink failures are
//! logged and dropped.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{Error, Result};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// A bucket denied a request.
    RateLimitExceeded,
    /// The abuse detector matched one or more patterns.
    AbuseDetected,
    /// A penalty was applied (automatic or manual).
    PenaltyApplied,
    /// A penalty was cleared by an administrator.
    PenaltyCleared,
    /// A circuit breaker tripped open.
    CircuitOpened,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ViolationKind::RateLimitExceeded => "rate_limit_exceeded",
            ViolationKind::AbuseDetected => "abuse_detected",
            ViolationKind::PenaltyApplied => "penalty_applied",
            ViolationKind::PenaltyCleared => "penalty_cleared",
            ViolationKind::CircuitOpened => "circuit_opened",
        };
        f.write_str(s)
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationEvent {
    pub id: Uuid,
    pub kind: ViolationKind,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    pub detail: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ViolationEvent {
    /// Event concerning a caller.
    pub fn for_caller(
        kind: ViolationKind,
        at: DateTime<Utc>,
        user_id: &str,
        workspace_id: &str,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            at,
            user_id: Some(user_id.to_string()),
            workspace_id: Some(workspace_id.to_string()),
            service_id: None,
            detail: detail.into(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Event concerning a downstream service.
    pub fn for_service(
        kind: ViolationKind,
        at: DateTime<Utc>,
        service_id: &str,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            at,
            user_id: None,
            workspace_id: None,
            service_id: Some(service_id.to_string()),
            detail: detail.into(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Attach structured metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Destination for audit events.
#[async_trait]
pub trait AuditSink: Send + Sync + fmt::Debug {
    /// Persist or forward one event.
    async fn log_violation(&self, event: ViolationEvent) -> Result<()>;
}

/// Writes events to the `bulwark::audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn log_violation(&self, event: ViolationEvent) -> Result<()> {
        let metadata = serde_json::to_string(&event.metadata)?;
        warn!(
            target: "bulwark::audit",
            id = %event.id,
            kind = %event.kind,
            user_id = event.user_id.as_deref().unwrap_or(""),
            workspace_id = event.workspace_id.as_deref().unwrap_or(""),
            service = event.service_id.as_deref().unwrap_or(""),
            metadata = %metadata,
            "{}",
            event.detail
        );
        Ok(())
    }
}

/// Forwards events over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::UnboundedSender<ViolationEvent>,
}

impl ChannelAuditSink {
    /// Create a sink and the receiving half.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ViolationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AuditSink for ChannelAuditSink {
    async fn log_violation(&self, event: ViolationEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| Error::internal("audit receiver dropped"))
    }
}

/// Fire-and-forget front end to an [`AuditSink`].
#[derive(Debug, Clone)]
pub struct AuditDispatcher {
    sink: Arc<dyn AuditSink>,
}

impl AuditDispatcher {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Send `event` to the sink without waiting for it.
    ///
    /// Outside a tokio runtime the event is dropped with a debug log.
    pub fn emit(&self, event: ViolationEvent) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(kind = %event.kind, "no runtime, dropping audit event");
            return;
        };
        let sink = Arc::clone(&self.sink);
        handle.spawn(async move {
            let kind = event.kind;
            if let Err(e) = sink.log_violation(event).await {
                warn!(kind = %kind, "audit sink failed: {}", e);
            }
        });
    }
}

impl Default for AuditDispatcher {
    fn default() -> Self {
        Self::new(Arc::new(TracingAuditSink))
    }
}
