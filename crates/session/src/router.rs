use crate::manager::SessionManager;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;
use wagate_core::client::{ClientEvent, ClientEventHandler, InboundHandler};
use wagate_core::event::{Event, EventSink, EventType, SyncProgressPayload};
use wagate_core::types::SessionStatus;

/// Receives everything the protocol client pushes and routes it: messages
/// to the dispatch pipeline, connection changes to the session manager,
/// sync progress straight to the event substrate.
pub struct ClientEventRouter {
    manager: Arc<SessionManager>,
    inbound: Arc<dyn InboundHandler>,
    sink: Arc<dyn EventSink>,
}

impl ClientEventRouter {
    pub fn new(
        manager: Arc<SessionManager>,
        inbound: Arc<dyn InboundHandler>,
        sink: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            inbound,
            sink,
        })
    }
}

#[async_trait]
impl ClientEventHandler for ClientEventRouter {
    async fn handle(&self, event: ClientEvent) {
        match event {
            ClientEvent::Message { message, .. } => {
                self.inbound.handle_incoming(message).await;
            }
            ClientEvent::StatusUpdate {
                session_id,
                message_id,
                status,
            } => {
                self.inbound
                    .handle_status_update(&session_id, &message_id, status)
                    .await;
            }
            ClientEvent::Connected { session_id, jid } => {
                if let Err(e) = self
                    .manager
                    .update_status(&session_id, SessionStatus::Connected, Some(jid))
                    .await
                {
                    warn!(session_id = %session_id, error = %e, "connected event not applied");
                }
            }
            ClientEvent::Disconnected { session_id } => {
                if let Err(e) = self
                    .manager
                    .update_status(&session_id, SessionStatus::Disconnected, None)
                    .await
                {
                    warn!(session_id = %session_id, error = %e, "disconnected event not applied");
                }
            }
            ClientEvent::LoggedOut { session_id } => {
                if let Err(e) = self
                    .manager
                    .update_status(&session_id, SessionStatus::LoggedOut, None)
                    .await
                {
                    warn!(session_id = %session_id, error = %e, "logged-out event not applied");
                }
            }
            ClientEvent::SyncProgress {
                session_id,
                progress,
                total,
            } => {
                self.sink
                    .publish(Event::new(
                        EventType::SyncProgress,
                        &session_id,
                        &SyncProgressPayload { progress, total },
                    ))
                    .await;
            }
        }
    }
}
