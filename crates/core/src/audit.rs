use crate::repos::AuditRepository;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    ApiKeyUsage,
    ApiKeyCreated,
    ApiKeyRevoked,
    MessageSent,
    WebhookDelivery,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::ApiKeyUsage => "api_key_usage",
            AuditKind::ApiKeyCreated => "api_key_created",
            AuditKind::ApiKeyRevoked => "api_key_revoked",
            AuditKind::MessageSent => "message_sent",
            AuditKind::WebhookDelivery => "webhook_delivery",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "api_key_usage" => Some(AuditKind::ApiKeyUsage),
            "api_key_created" => Some(AuditKind::ApiKeyCreated),
            "api_key_revoked" => Some(AuditKind::ApiKeyRevoked),
            "message_sent" => Some(AuditKind::MessageSent),
            "webhook_delivery" => Some(AuditKind::WebhookDelivery),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub kind: AuditKind,
    /// Who acted: an API-key id, "system", or an internal component name.
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub success: bool,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new<T: Serialize>(kind: AuditKind, actor: &str, details: &T) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            actor: actor.to_string(),
            session_id: None,
            success: true,
            details: serde_json::to_value(details).unwrap_or(Value::Null),
            timestamp: Utc::now(),
        }
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyUsageEvent {
    pub api_key_id: String,
    pub endpoint: String,
    pub method: String,
    pub ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSentEvent {
    pub session_id: String,
    pub recipient: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDeliveryEvent {
    pub session_id: String,
    pub url: String,
    pub event_type: String,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Audit emission is best effort everywhere: a failing sink must never fail
/// the operation being audited.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord);
}

/// Emits audit records as JSON lines under `target: "audit"` so a subscriber
/// can route them to a separate appender.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) {
        if let Ok(json) = serde_json::to_string(&record) {
            info!(target: "audit", "{}", json);
        }
    }
}

/// Persists records through the audit repository and mirrors them to the
/// audit log target. Persistence failures are logged and swallowed.
pub struct RepoAuditSink {
    repo: Arc<dyn AuditRepository>,
}

impl RepoAuditSink {
    pub fn new(repo: Arc<dyn AuditRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl AuditSink for RepoAuditSink {
    async fn record(&self, record: AuditRecord) {
        if let Ok(json) = serde_json::to_string(&record) {
            info!(target: "audit", "{}", json);
        }
        if let Err(e) = self.repo.create(&record).await {
            warn!(kind = record.kind.as_str(), error = %e, "audit record not persisted");
        }
    }
}

/// Sink that drops everything, for tests.
pub struct NullAuditSink;

#[async_trait]
impl AuditSink for NullAuditSink {
    async fn record(&self, _record: AuditRecord) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_carries_payload() {
        let record = AuditRecord::new(
            AuditKind::ApiKeyUsage,
            "key-1",
            &ApiKeyUsageEvent {
                api_key_id: "key-1".into(),
                endpoint: "/api/messages".into(),
                method: "POST".into(),
                ip: "10.0.0.1".into(),
            },
        )
        .with_session("s1");
        assert!(record.success);
        assert_eq!(record.session_id.as_deref(), Some("s1"));
        assert_eq!(record.details["endpoint"], "/api/messages");
    }

    #[test]
    fn kind_round_trip() {
        for kind in [
            AuditKind::ApiKeyUsage,
            AuditKind::ApiKeyCreated,
            AuditKind::ApiKeyRevoked,
            AuditKind::MessageSent,
            AuditKind::WebhookDelivery,
        ] {
            assert_eq!(AuditKind::parse(kind.as_str()), Some(kind));
        }
    }
}
