//! After-the-fact audit trail of committed operations.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

use crate::model::UserId;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit sink is closed")]
    Closed,

    #[error("failed to encode audit event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where a request came from; only carried into the audit trail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Origin {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl Origin {
    pub fn new(ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip: Some(ip.into()),
            user_agent: Some(user_agent.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub user_id: UserId,
    pub action: &'static str,
    pub entity: &'static str,
    pub entity_id: String,
    pub details: Value,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        user_id: UserId,
        action: &'static str,
        entity: &'static str,
        entity_id: impl ToString,
    ) -> Self {
        Self {
            user_id,
            action,
            entity,
            entity_id: entity_id.to_string(),
            details: Value::Null,
            ip: None,
            user_agent: None,
            at: Utc::now(),
        }
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn origin(mut self, origin: &Origin) -> Self {
        self.ip = origin.ip.clone();
        self.user_agent = origin.user_agent.clone();
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }
}

/// Fire-and-forget sink. Called only after a commit; its failure never
/// undoes the operation.
pub trait AuditRecorder: Send + Sync {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// Writes each event as one JSON line under the `audit_log` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditRecorder;

impl AuditRecorder for TracingAuditRecorder {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let line = serde_json::to_string(&json!({
            "timestamp": event.at.to_rfc3339(),
            "user_id": event.user_id,
            "action": event.action,
            "entity": event.entity,
            "entity_id": event.entity_id,
            "details": event.details,
            "ip": event.ip,
            "user_agent": event.user_agent,
        }))?;
        info!(target: "audit_log", "{line}");
        Ok(())
    }
}

/// Hands events to an async consumer.
#[derive(Debug, Clone)]
pub struct ChannelAuditRecorder {
    sender: mpsc::UnboundedSender<AuditEvent>,
}

impl ChannelAuditRecorder {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AuditEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl AuditRecorder for ChannelAuditRecorder {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.sender.send(event).map_err(|_| AuditError::Closed)
    }
}
