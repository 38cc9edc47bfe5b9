use crate::apikey::ApiKey;
use crate::audit::AuditRecord;
use crate::error::Result;
use crate::event::{Event, EventQuery};
use crate::types::{Presence, Reaction, Receipt, Session};
use crate::webhook::WebhookConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Repository contracts, one per entity. Implementations return domain
/// errors (`NOT_FOUND`, `ALREADY_EXISTS`, `DATABASE`) and nothing else.

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create(&self, session: &Session) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Session>;
    async fn update(&self, session: &Session) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<Session>>;
}

#[async_trait]
pub trait ApiKeyRepository: Send + Sync {
    async fn create(&self, key: &ApiKey) -> Result<()>;
    async fn get(&self, id: &str) -> Result<ApiKey>;
    async fn get_by_hash(&self, key_hash: &str) -> Result<ApiKey>;
    async fn update(&self, key: &ApiKey) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<ApiKey>>;
    async fn count(&self) -> Result<i64>;
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn create(&self, event: &Event) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Event>;
    /// Newest first.
    async fn list(&self, query: &EventQuery) -> Result<Vec<Event>>;
    async fn count(&self, query: &EventQuery) -> Result<i64>;
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait ReceiptRepository: Send + Sync {
    async fn create(&self, receipt: &Receipt) -> Result<()>;
    async fn list_by_session(&self, session_id: &str, limit: i64) -> Result<Vec<Receipt>>;
}

#[async_trait]
pub trait ReactionRepository: Send + Sync {
    async fn create(&self, reaction: &Reaction) -> Result<()>;
    async fn list_by_message(&self, message_id: &str) -> Result<Vec<Reaction>>;
}

#[async_trait]
pub trait PresenceRepository: Send + Sync {
    async fn create(&self, presence: &Presence) -> Result<()>;
    async fn list_by_session(&self, session_id: &str, limit: i64) -> Result<Vec<Presence>>;
}

#[async_trait]
pub trait WebhookConfigRepository: Send + Sync {
    /// Fails with `ALREADY_EXISTS` when the session already has a config.
    async fn create(&self, config: &WebhookConfig) -> Result<()>;
    async fn get_by_session(&self, session_id: &str) -> Result<WebhookConfig>;
    async fn update(&self, config: &WebhookConfig) -> Result<()>;
    async fn delete_by_session(&self, session_id: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<WebhookConfig>>;
}

#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn create(&self, record: &AuditRecord) -> Result<()>;
    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<AuditRecord>>;
}
