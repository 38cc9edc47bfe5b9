use crate::error::{Error, ErrorKind, Result};
use crate::jid::{Jid, MAX_CAPTION_LEN, MAX_FILENAME_LEN, MAX_TEXT_LEN};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Connecting,
    Connected,
    Disconnected,
    LoggedOut,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::LoggedOut => "logged_out",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(SessionStatus::Pending),
            "connecting" => Some(SessionStatus::Connecting),
            "connected" => Some(SessionStatus::Connected),
            "disconnected" => Some(SessionStatus::Disconnected),
            "logged_out" => Some(SessionStatus::LoggedOut),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistorySyncConfig {
    pub enabled: bool,
    pub full: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
}

/// A logical WhatsApp account bound to the gateway, one-to-one with a JID
/// once paired. Mutated only through the session manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jid: Option<Jid>,
    pub name: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub history_sync: HistorySyncConfig,
}

impl Session {
    pub fn new(id: &str, name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            jid: None,
            name: name.to_string(),
            status: SessionStatus::Pending,
            created_at: now,
            updated_at: now,
            history_sync: HistorySyncConfig::default(),
        }
    }

    /// Invariant check: a connected session must carry a JID.
    pub fn is_consistent(&self) -> bool {
        self.status != SessionStatus::Connected || self.jid.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Document,
    Audio,
    Video,
    Sticker,
}

impl MessageType {
    pub fn is_media(&self) -> bool {
        !matches!(self, MessageType::Text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Read | MessageStatus::Failed)
    }

    /// Monotonic along pending → sent → delivered → read; `Failed` is
    /// reachable from any non-terminal state and absorbing.
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        match (self, next) {
            (MessageStatus::Failed, _) => false,
            (MessageStatus::Read, _) => false,
            (_, MessageStatus::Failed) => true,
            (cur, next) => next.rank() > cur.rank(),
        }
    }
}

/// Tagged content record: text for text messages, at most one media URL plus
/// optional caption/filename for media types.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            text: Some(body.into()),
            ..Self::default()
        }
    }

    pub fn media(url: impl Into<String>) -> Self {
        Self {
            media_url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Per-type required fields and length caps.
    pub fn validate_for(&self, kind: MessageType) -> Result<()> {
        match kind {
            MessageType::Text => {
                let text = self.text.as_deref().unwrap_or("");
                if text.is_empty() {
                    return Err(Error::new(ErrorKind::EmptyContent, "text body is required"));
                }
                if text.len() > MAX_TEXT_LEN {
                    return Err(Error::validation(format!(
                        "text exceeds {} bytes",
                        MAX_TEXT_LEN
                    )));
                }
            }
            _ => {
                if self.media_url.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::new(
                        ErrorKind::EmptyContent,
                        "media URL is required for media messages",
                    ));
                }
            }
        }
        if let Some(caption) = &self.caption {
            if caption.len() > MAX_CAPTION_LEN {
                return Err(Error::validation(format!(
                    "caption exceeds {} bytes",
                    MAX_CAPTION_LEN
                )));
            }
        }
        if let Some(filename) = &self.filename {
            if filename.len() > MAX_FILENAME_LEN {
                return Err(Error::validation(format!(
                    "filename exceeds {} bytes",
                    MAX_FILENAME_LEN
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub from: String,
    pub to: String,
    pub content: MessageContent,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn outbound(session_id: &str, to: &str, kind: MessageType, content: MessageContent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            from: String::new(),
            to: to.to_string(),
            content,
            kind,
            status: MessageStatus::Pending,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptKind {
    Delivery,
    Read,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub id: String,
    pub session_id: String,
    pub chat_jid: Jid,
    pub message_ids: Vec<String>,
    pub kind: ReceiptKind,
    pub timestamp: DateTime<Utc>,
}

impl Receipt {
    pub fn read(session_id: &str, chat_jid: Jid, message_ids: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            chat_jid,
            message_ids,
            kind: ReceiptKind::Read,
            timestamp: Utc::now(),
        }
    }
}

/// An empty emoji encodes removal of a previous reaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub id: String,
    pub session_id: String,
    pub chat_jid: Jid,
    pub message_id: String,
    pub emoji: String,
    pub timestamp: DateTime<Utc>,
}

impl Reaction {
    pub fn new(session_id: &str, chat_jid: Jid, message_id: &str, emoji: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            chat_jid,
            message_id: message_id.to_string(),
            emoji: emoji.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_removal(&self) -> bool {
        self.emoji.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Typing,
    Paused,
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presence {
    pub id: String,
    pub session_id: String,
    pub chat_jid: Jid,
    pub state: PresenceState,
    pub timestamp: DateTime<Utc>,
}

impl Presence {
    pub fn new(session_id: &str, chat_jid: Jid, state: PresenceState) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            chat_jid,
            state,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_monotonic() {
        use MessageStatus::*;
        assert!(Pending.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Delivered.can_transition_to(Read));
        assert!(Pending.can_transition_to(Failed));
        assert!(Delivered.can_transition_to(Failed));
        assert!(!Sent.can_transition_to(Pending));
        assert!(!Delivered.can_transition_to(Sent));
        assert!(!Failed.can_transition_to(Sent));
        assert!(!Failed.can_transition_to(Read));
        assert!(!Read.can_transition_to(Failed));
    }

    #[test]
    fn text_content_rules() {
        assert!(MessageContent::text("hi").validate_for(MessageType::Text).is_ok());
        let empty = MessageContent::default().validate_for(MessageType::Text);
        assert_eq!(empty.unwrap_err().kind(), ErrorKind::EmptyContent);
        let long = MessageContent::text("x".repeat(MAX_TEXT_LEN + 1));
        assert_eq!(
            long.validate_for(MessageType::Text).unwrap_err().kind(),
            ErrorKind::ValidationFailed
        );
    }

    #[test]
    fn media_content_rules() {
        let ok = MessageContent::media("https://cdn.example/file.jpg");
        assert!(ok.validate_for(MessageType::Image).is_ok());
        let missing = MessageContent::text("caption only");
        assert_eq!(
            missing.validate_for(MessageType::Image).unwrap_err().kind(),
            ErrorKind::EmptyContent
        );
        let mut capped = MessageContent::media("https://cdn.example/doc.pdf");
        capped.filename = Some("f".repeat(MAX_FILENAME_LEN + 1));
        assert!(capped.validate_for(MessageType::Document).is_err());
    }

    #[test]
    fn session_invariant() {
        let mut s = Session::new("s1", "primary");
        assert!(s.is_consistent());
        s.status = SessionStatus::Connected;
        assert!(!s.is_consistent());
        s.jid = Some(crate::jid::Jid::parse("1@s.whatsapp.net").unwrap());
        assert!(s.is_consistent());
    }

    #[test]
    fn session_status_serializes_snake_case() {
        let json = serde_json::to_string(&SessionStatus::LoggedOut).unwrap();
        assert_eq!(json, "\"logged_out\"");
    }
}
