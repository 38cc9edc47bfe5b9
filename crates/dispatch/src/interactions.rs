use std::sync::Arc;
use tracing::warn;
use wagate_core::client::WhatsAppClient;
use wagate_core::error::{Error, ErrorKind, Result};
use wagate_core::event::{Event, EventSink, EventType, ReactionPayload};
use wagate_core::jid::Jid;
use wagate_core::repos::{PresenceRepository, ReactionRepository, ReceiptRepository};
use wagate_core::types::{Presence, PresenceState, Reaction, Receipt};

/// Reactions, read receipts and presence. These are thin call-throughs to
/// the protocol client: no queueing, no retries. Records are persisted best
/// effort after the client accepts the operation.
pub struct InteractionService {
    client: Arc<dyn WhatsAppClient>,
    sink: Arc<dyn EventSink>,
    receipts: Arc<dyn ReceiptRepository>,
    reactions: Arc<dyn ReactionRepository>,
    presence: Arc<dyn PresenceRepository>,
}

impl InteractionService {
    pub fn new(
        client: Arc<dyn WhatsAppClient>,
        sink: Arc<dyn EventSink>,
        receipts: Arc<dyn ReceiptRepository>,
        reactions: Arc<dyn ReactionRepository>,
        presence: Arc<dyn PresenceRepository>,
    ) -> Self {
        Self {
            client,
            sink,
            receipts,
            reactions,
            presence,
        }
    }

    fn require_connected(&self, session_id: &str) -> Result<()> {
        if self.client.is_connected(session_id) {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::Disconnected,
                format!("session {} is not connected", session_id),
            ))
        }
    }

    /// An empty emoji removes the previous reaction.
    pub async fn send_reaction(
        &self,
        session_id: &str,
        chat_jid: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<Reaction> {
        if message_id.is_empty() {
            return Err(Error::validation("message id is required"));
        }
        let chat = Jid::parse(chat_jid)?;
        self.require_connected(session_id)?;

        self.client
            .send_reaction(session_id, &chat, message_id, emoji)
            .await?;

        let reaction = Reaction::new(session_id, chat.clone(), message_id, emoji);
        if let Err(e) = self.reactions.create(&reaction).await {
            warn!(session_id, message_id, error = %e, "reaction not persisted");
        }

        self.sink
            .publish(Event::new(
                EventType::MessageReaction,
                session_id,
                &ReactionPayload {
                    message_id: message_id.to_string(),
                    chat_jid: chat.as_str().to_string(),
                    emoji: emoji.to_string(),
                },
            ))
            .await;

        Ok(reaction)
    }

    /// One client call carries every message id, so the receipt is atomic
    /// for the whole batch.
    pub async fn send_read_receipts(
        &self,
        session_id: &str,
        chat_jid: &str,
        message_ids: &[String],
    ) -> Result<Receipt> {
        if message_ids.is_empty() {
            return Err(Error::validation("at least one message id is required"));
        }
        let chat = Jid::parse(chat_jid)?;
        self.require_connected(session_id)?;

        self.client
            .send_read_receipt(session_id, &chat, message_ids)
            .await?;

        let receipt = Receipt::read(session_id, chat, message_ids.to_vec());
        if let Err(e) = self.receipts.create(&receipt).await {
            warn!(session_id, error = %e, "receipt not persisted");
        }
        Ok(receipt)
    }

    pub async fn send_presence(
        &self,
        session_id: &str,
        chat_jid: &str,
        state: PresenceState,
    ) -> Result<Presence> {
        let chat = Jid::parse(chat_jid)?;
        self.require_connected(session_id)?;

        self.client.send_presence(session_id, &chat, state).await?;

        let presence = Presence::new(session_id, chat, state);
        if let Err(e) = self.presence.create(&presence).await {
            warn!(session_id, error = %e, "presence not persisted");
        }
        Ok(presence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{CollectingSink, MockClient};
    use wagate_persistence::memory::{
        MemoryPresenceRepository, MemoryReactionRepository, MemoryReceiptRepository,
    };

    fn service(client: Arc<MockClient>, sink: Arc<CollectingSink>) -> InteractionService {
        InteractionService::new(
            client,
            sink,
            Arc::new(MemoryReceiptRepository::new()),
            Arc::new(MemoryReactionRepository::new()),
            Arc::new(MemoryPresenceRepository::new()),
        )
    }

    #[tokio::test]
    async fn reaction_is_sent_persisted_and_published() {
        let sink = CollectingSink::new();
        let svc = service(Arc::new(MockClient::ok()), sink.clone());
        let reaction = svc
            .send_reaction("s1", "1234@s.whatsapp.net", "m1", "🔥")
            .await
            .unwrap();
        assert_eq!(reaction.emoji, "🔥");
        assert!(!reaction.is_removal());
        assert_eq!(sink.kinds().await, vec![EventType::MessageReaction]);
    }

    #[tokio::test]
    async fn empty_emoji_is_removal() {
        let svc = service(Arc::new(MockClient::ok()), CollectingSink::new());
        let reaction = svc
            .send_reaction("s1", "1234@s.whatsapp.net", "m1", "")
            .await
            .unwrap();
        assert!(reaction.is_removal());
    }

    #[tokio::test]
    async fn receipts_require_message_ids() {
        let svc = service(Arc::new(MockClient::ok()), CollectingSink::new());
        let err = svc
            .send_read_receipts("s1", "1234@s.whatsapp.net", &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);

        let receipt = svc
            .send_read_receipts("s1", "1234@s.whatsapp.net", &["m1".into(), "m2".into()])
            .await
            .unwrap();
        assert_eq!(receipt.message_ids.len(), 2);
    }

    #[tokio::test]
    async fn presence_round_trip() {
        let svc = service(Arc::new(MockClient::ok()), CollectingSink::new());
        let presence = svc
            .send_presence("s1", "1234@s.whatsapp.net", PresenceState::Typing)
            .await
            .unwrap();
        assert_eq!(presence.state, PresenceState::Typing);
    }

    #[tokio::test]
    async fn disconnected_session_is_rejected() {
        let mut client = MockClient::ok();
        client.set_connected(false);
        let svc = service(Arc::new(client), CollectingSink::new());
        let err = svc
            .send_presence("s1", "1234@s.whatsapp.net", PresenceState::Online)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Disconnected);
    }
}
