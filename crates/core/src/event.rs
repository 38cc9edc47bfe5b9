use crate::error::{Error, ErrorKind, Result};
use crate::types::{MessageStatus, SessionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "message.sent")]
    MessageSent,
    #[serde(rename = "message.received")]
    MessageReceived,
    #[serde(rename = "message.delivered")]
    MessageDelivered,
    #[serde(rename = "message.read")]
    MessageRead,
    #[serde(rename = "message.failed")]
    MessageFailed,
    #[serde(rename = "message.reaction")]
    MessageReaction,
    #[serde(rename = "connection.connected")]
    ConnectionConnected,
    #[serde(rename = "connection.connecting")]
    ConnectionConnecting,
    #[serde(rename = "connection.disconnected")]
    ConnectionDisconnected,
    #[serde(rename = "connection.failed")]
    ConnectionFailed,
    #[serde(rename = "connection.logged_out")]
    ConnectionLoggedOut,
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.removed")]
    SessionRemoved,
    #[serde(rename = "qr.code")]
    QrCode,
    #[serde(rename = "sync.progress")]
    SyncProgress,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::MessageSent => "message.sent",
            EventType::MessageReceived => "message.received",
            EventType::MessageDelivered => "message.delivered",
            EventType::MessageRead => "message.read",
            EventType::MessageFailed => "message.failed",
            EventType::MessageReaction => "message.reaction",
            EventType::ConnectionConnected => "connection.connected",
            EventType::ConnectionConnecting => "connection.connecting",
            EventType::ConnectionDisconnected => "connection.disconnected",
            EventType::ConnectionFailed => "connection.failed",
            EventType::ConnectionLoggedOut => "connection.logged_out",
            EventType::SessionCreated => "session.created",
            EventType::SessionRemoved => "session.removed",
            EventType::QrCode => "qr.code",
            EventType::SyncProgress => "sync.progress",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::all().iter().copied().find(|t| t.as_str() == raw)
    }

    pub fn all() -> &'static [EventType] {
        &[
            EventType::MessageSent,
            EventType::MessageReceived,
            EventType::MessageDelivered,
            EventType::MessageRead,
            EventType::MessageFailed,
            EventType::MessageReaction,
            EventType::ConnectionConnected,
            EventType::ConnectionConnecting,
            EventType::ConnectionDisconnected,
            EventType::ConnectionFailed,
            EventType::ConnectionLoggedOut,
            EventType::SessionCreated,
            EventType::SessionRemoved,
            EventType::QrCode,
            EventType::SyncProgress,
        ]
    }

    /// Status events that may cross the fan-out boundary. `pending` has no
    /// event type on purpose.
    pub fn for_message_status(status: MessageStatus) -> Option<Self> {
        match status {
            MessageStatus::Pending => None,
            MessageStatus::Sent => Some(EventType::MessageSent),
            MessageStatus::Delivered => Some(EventType::MessageDelivered),
            MessageStatus::Read => Some(EventType::MessageRead),
            MessageStatus::Failed => Some(EventType::MessageFailed),
        }
    }

    pub fn for_session_status(status: SessionStatus) -> Option<Self> {
        match status {
            SessionStatus::Pending => None,
            SessionStatus::Connecting => Some(EventType::ConnectionConnecting),
            SessionStatus::Connected => Some(EventType::ConnectionConnected),
            SessionStatus::Disconnected => Some(EventType::ConnectionDisconnected),
            SessionStatus::LoggedOut => Some(EventType::ConnectionLoggedOut),
        }
    }
}

/// Domain event envelope. The payload is opaque JSON to the substrate;
/// consumers that need it deserialize through [`Event::payload`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub session_id: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new<T: Serialize>(kind: EventType, session_id: &str, payload: &T) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            session_id: session_id.to_string(),
            data: serde_json::to_value(payload).unwrap_or(Value::Null),
            timestamp: Utc::now(),
        }
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| Error::new(ErrorKind::InvalidJson, "event payload mismatch").with_source(e))
    }
}

/// Fan-out seam. Publishing is best effort by contract: implementations must
/// never fail or block the caller's primary operation.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: Event);
}

/// Sink that drops everything. Useful as a default collaborator in tests.
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn publish(&self, _event: Event) {}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPayload {
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionFailedPayload {
    pub error_code: String,
    pub error_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStatusPayload {
    pub message_id: String,
    pub status: MessageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionPayload {
    pub message_id: String,
    pub chat_jid: String,
    pub emoji: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QrCodePayload {
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncProgressPayload {
    pub progress: u32,
    pub total: u32,
}

/// Query over the event log. `limit` is clamped to 1..=1000 (default 100).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
}

pub const MAX_EVENT_QUERY_LIMIT: i64 = 1000;
pub const DEFAULT_EVENT_QUERY_LIMIT: i64 = 100;

/// Validated form of [`EventFilter`] that repositories execute.
#[derive(Debug, Clone)]
pub struct EventQuery {
    pub session_id: Option<String>,
    pub kind: Option<EventType>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl EventFilter {
    pub fn validate(&self) -> Result<EventQuery> {
        let kind = match self.event_type.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(
                EventType::parse(raw)
                    .ok_or_else(|| Error::validation(format!("unknown event type: {}", raw)))?,
            ),
        };
        if let Some(limit) = self.limit {
            if limit < 1 {
                return Err(Error::validation("limit must be at least 1"));
            }
        }
        if let Some(offset) = self.offset {
            if offset < 0 {
                return Err(Error::validation("offset must not be negative"));
            }
        }
        Ok(EventQuery {
            session_id: self.session_id.clone().filter(|s| !s.is_empty()),
            kind,
            since: self.since,
            until: self.until,
            limit: self
                .limit
                .unwrap_or(DEFAULT_EVENT_QUERY_LIMIT)
                .min(MAX_EVENT_QUERY_LIMIT),
            offset: self.offset.unwrap_or(0),
        })
    }

    /// Replay refuses an unscoped filter to prevent accidental full-replay.
    pub fn has_scope(&self) -> bool {
        self.session_id.as_deref().is_some_and(|s| !s.is_empty())
            || self.event_type.as_deref().is_some_and(|s| !s.is_empty())
            || self.since.is_some()
            || self.until.is_some()
    }
}

impl EventQuery {
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(session_id) = &self.session_id {
            if &event.session_id != session_id {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if event.kind != kind {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.timestamp > until {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_round_trips_dotted_names() {
        for kind in EventType::all() {
            assert_eq!(EventType::parse(kind.as_str()), Some(*kind));
            let json = serde_json::to_string(kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        assert_eq!(EventType::parse("message.unknown"), None);
    }

    #[test]
    fn pending_has_no_event() {
        assert_eq!(EventType::for_message_status(MessageStatus::Pending), None);
        assert_eq!(
            EventType::for_message_status(MessageStatus::Sent),
            Some(EventType::MessageSent)
        );
    }

    #[test]
    fn payload_round_trip() {
        let event = Event::new(
            EventType::ConnectionFailed,
            "s1",
            &ConnectionFailedPayload {
                error_code: "TIMEOUT".into(),
                error_message: "deadline exceeded".into(),
            },
        );
        let payload: ConnectionFailedPayload = event.payload().unwrap();
        assert_eq!(payload.error_code, "TIMEOUT");
    }

    #[test]
    fn filter_validation() {
        let ok = EventFilter {
            event_type: Some("message.sent".into()),
            limit: Some(5000),
            ..Default::default()
        };
        let query = ok.validate().unwrap();
        assert_eq!(query.kind, Some(EventType::MessageSent));
        assert_eq!(query.limit, MAX_EVENT_QUERY_LIMIT);

        let bad_type = EventFilter {
            event_type: Some("nope".into()),
            ..Default::default()
        };
        assert!(bad_type.validate().is_err());

        let bad_limit = EventFilter {
            limit: Some(0),
            ..Default::default()
        };
        assert!(bad_limit.validate().is_err());

        let defaulted = EventFilter::default().validate().unwrap();
        assert_eq!(defaulted.limit, DEFAULT_EVENT_QUERY_LIMIT);
        assert_eq!(defaulted.offset, 0);
    }

    #[test]
    fn replay_scope() {
        assert!(!EventFilter::default().has_scope());
        assert!(EventFilter {
            session_id: Some("s".into()),
            ..Default::default()
        }
        .has_scope());
        assert!(!EventFilter {
            session_id: Some(String::new()),
            ..Default::default()
        }
        .has_scope());
        assert!(EventFilter {
            since: Some(Utc::now()),
            ..Default::default()
        }
        .has_scope());
    }
}
