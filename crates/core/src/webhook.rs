use crate::event::EventType;
use crate::jid::Jid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outbound webhook endpoint for one session. At most one config per
/// session; the repository enforces `session_id` uniqueness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub id: String,
    pub session_id: String,
    pub enabled: bool,
    pub url: String,
    #[serde(skip_serializing)]
    pub secret: String,
    /// Empty means "all event types".
    #[serde(default)]
    pub events: Vec<EventType>,
    #[serde(default)]
    pub ignore_groups: bool,
    #[serde(default)]
    pub ignore_broadcasts: bool,
    #[serde(default)]
    pub ignore_channels: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookConfig {
    pub fn new(session_id: &str, url: &str, secret: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            enabled: true,
            url: url.to_string(),
            secret,
            events: Vec::new(),
            ignore_groups: false,
            ignore_broadcasts: false,
            ignore_channels: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn should_deliver(&self, kind: EventType) -> bool {
        self.enabled && (self.events.is_empty() || self.events.contains(&kind))
    }

    /// Chat-level filtering against the ignore flags. `None` (no chat JID in
    /// the payload) always passes.
    pub fn allows_chat(&self, chat: Option<&Jid>) -> bool {
        let Some(jid) = chat else { return true };
        if self.ignore_groups && jid.is_group() {
            return false;
        }
        if self.ignore_broadcasts && jid.is_broadcast() {
            return false;
        }
        if self.ignore_channels && jid.is_newsletter() {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WebhookConfig {
        WebhookConfig::new("s1", "https://hooks.example/wa", "ab".repeat(32))
    }

    #[test]
    fn empty_events_means_all() {
        let cfg = config();
        assert!(cfg.should_deliver(EventType::MessageReceived));
        assert!(cfg.should_deliver(EventType::QrCode));
    }

    #[test]
    fn event_allowlist_filters() {
        let mut cfg = config();
        cfg.events = vec![EventType::MessageReceived];
        assert!(cfg.should_deliver(EventType::MessageReceived));
        assert!(!cfg.should_deliver(EventType::MessageSent));
    }

    #[test]
    fn disabled_never_delivers() {
        let mut cfg = config();
        cfg.enabled = false;
        assert!(!cfg.should_deliver(EventType::MessageReceived));
    }

    #[test]
    fn chat_filters() {
        let mut cfg = config();
        cfg.ignore_groups = true;
        cfg.ignore_broadcasts = true;
        let group = Jid::parse("team@g.us").unwrap();
        let user = Jid::parse("1234@s.whatsapp.net").unwrap();
        let bcast = Jid::parse("status@broadcast").unwrap();
        assert!(!cfg.allows_chat(Some(&group)));
        assert!(!cfg.allows_chat(Some(&bcast)));
        assert!(cfg.allows_chat(Some(&user)));
        assert!(cfg.allows_chat(None));
    }

    #[test]
    fn secret_never_serialized() {
        let cfg = config();
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains(&cfg.secret));
    }
}
