use crate::error::{Error, ErrorKind, Result};
use crate::jid::{Jid, PhoneNumber};
use crate::types::{Message, MessageStatus, MessageType, PresenceState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QrEventKind {
    Qr,
    Authenticated,
    Error,
    Timeout,
}

/// One frame of the pairing stream: zero or more `qr` frames followed by
/// exactly one terminal frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QrEvent {
    #[serde(rename = "type")]
    pub kind: QrEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl QrEvent {
    pub fn code(data: impl Into<String>) -> Self {
        Self {
            kind: QrEventKind::Qr,
            data: Some(data.into()),
            message: None,
        }
    }

    pub fn authenticated() -> Self {
        Self {
            kind: QrEventKind::Authenticated,
            data: None,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: QrEventKind::Error,
            data: None,
            message: Some(message.into()),
        }
    }

    pub fn timeout() -> Self {
        Self {
            kind: QrEventKind::Timeout,
            data: None,
            message: Some("QR authentication timed out".into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.kind, QrEventKind::Qr)
    }
}

/// Events the protocol client pushes into the gateway.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Message {
        session_id: String,
        message: Message,
    },
    StatusUpdate {
        session_id: String,
        message_id: String,
        status: MessageStatus,
    },
    Connected {
        session_id: String,
        jid: Jid,
    },
    Disconnected {
        session_id: String,
    },
    LoggedOut {
        session_id: String,
    },
    SyncProgress {
        session_id: String,
        progress: u32,
        total: u32,
    },
}

#[async_trait]
pub trait ClientEventHandler: Send + Sync {
    async fn handle(&self, event: ClientEvent);
}

/// Seam between the client-event side and the dispatch pipeline.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_incoming(&self, message: Message);
    async fn handle_status_update(&self, session_id: &str, message_id: &str, status: MessageStatus);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoneCheckResult {
    pub phone: String,
    pub on_whatsapp: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jid: Option<Jid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub jid: Jid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatInfo {
    pub jid: Jid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub jid: Jid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// The protocol client the gateway consumes. Wire framing, encryption and
/// low-level pairing live behind this trait; the gateway never implements it.
#[async_trait]
pub trait WhatsAppClient: Send + Sync {
    async fn connect(&self, session_id: &str) -> Result<()>;
    async fn disconnect(&self, session_id: &str) -> Result<()>;
    async fn send_message(&self, message: &Message) -> Result<()>;
    async fn send_reaction(
        &self,
        session_id: &str,
        chat_jid: &Jid,
        message_id: &str,
        emoji: &str,
    ) -> Result<()>;
    async fn send_read_receipt(
        &self,
        session_id: &str,
        chat_jid: &Jid,
        message_ids: &[String],
    ) -> Result<()>;
    async fn send_presence(
        &self,
        session_id: &str,
        chat_jid: &Jid,
        state: PresenceState,
    ) -> Result<()>;
    /// Finite stream of QR events for pairing; ends after a terminal event.
    async fn qr_channel(&self, session_id: &str) -> Result<mpsc::Receiver<QrEvent>>;
    fn register_event_handler(&self, handler: Arc<dyn ClientEventHandler>);
    fn is_connected(&self, session_id: &str) -> bool;
    fn session_jid(&self, session_id: &str) -> Option<Jid>;
    fn set_session_jid(&self, session_id: &str, jid: Jid);
    async fn check_phone_number(
        &self,
        session_id: &str,
        phones: &[PhoneNumber],
    ) -> Result<Vec<PhoneCheckResult>>;
    async fn user_profile(&self, session_id: &str, jid: &Jid) -> Result<UserProfile>;
    async fn list_contacts(&self, session_id: &str) -> Result<Vec<Contact>>;
    async fn list_chats(&self, session_id: &str) -> Result<Vec<ChatInfo>>;
}

/// Media transport seam. The dispatch pipeline requires an uploader for
/// media messages but never moves bytes itself.
#[async_trait]
pub trait MediaUploader: Send + Sync {
    /// Upload the media behind `media_url` and return the uploaded handle
    /// the protocol client expects in the outbound message.
    async fn upload(&self, session_id: &str, media_url: &str, kind: MessageType) -> Result<String>;
}

fn unavailable() -> Error {
    Error::new(
        ErrorKind::ClientUnavailable,
        "no WhatsApp client is configured",
    )
}

/// Placeholder used until a protocol client implementation is wired in.
/// Every operation fails with `CLIENT_UNAVAILABLE`; nothing panics.
pub struct UnconfiguredClient;

#[async_trait]
impl WhatsAppClient for UnconfiguredClient {
    async fn connect(&self, _session_id: &str) -> Result<()> {
        Err(unavailable())
    }

    async fn disconnect(&self, _session_id: &str) -> Result<()> {
        Err(unavailable())
    }

    async fn send_message(&self, _message: &Message) -> Result<()> {
        Err(unavailable())
    }

    async fn send_reaction(
        &self,
        _session_id: &str,
        _chat_jid: &Jid,
        _message_id: &str,
        _emoji: &str,
    ) -> Result<()> {
        Err(unavailable())
    }

    async fn send_read_receipt(
        &self,
        _session_id: &str,
        _chat_jid: &Jid,
        _message_ids: &[String],
    ) -> Result<()> {
        Err(unavailable())
    }

    async fn send_presence(
        &self,
        _session_id: &str,
        _chat_jid: &Jid,
        _state: PresenceState,
    ) -> Result<()> {
        Err(unavailable())
    }

    async fn qr_channel(&self, _session_id: &str) -> Result<mpsc::Receiver<QrEvent>> {
        Err(Error::new(
            ErrorKind::QrGenerationFailed,
            "no WhatsApp client is configured",
        ))
    }

    fn register_event_handler(&self, _handler: Arc<dyn ClientEventHandler>) {}

    fn is_connected(&self, _session_id: &str) -> bool {
        false
    }

    fn session_jid(&self, _session_id: &str) -> Option<Jid> {
        None
    }

    fn set_session_jid(&self, _session_id: &str, _jid: Jid) {}

    async fn check_phone_number(
        &self,
        _session_id: &str,
        _phones: &[PhoneNumber],
    ) -> Result<Vec<PhoneCheckResult>> {
        Err(unavailable())
    }

    async fn user_profile(&self, _session_id: &str, _jid: &Jid) -> Result<UserProfile> {
        Err(unavailable())
    }

    async fn list_contacts(&self, _session_id: &str) -> Result<Vec<Contact>> {
        Err(unavailable())
    }

    async fn list_chats(&self, _session_id: &str) -> Result<Vec<ChatInfo>> {
        Err(unavailable())
    }
}
