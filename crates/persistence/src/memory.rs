use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use wagate_core::apikey::ApiKey;
use wagate_core::audit::AuditRecord;
use wagate_core::error::{Error, Result};
use wagate_core::event::{Event, EventQuery};
use wagate_core::repos::{
    ApiKeyRepository, AuditRepository, EventRepository, PresenceRepository, ReactionRepository,
    ReceiptRepository, SessionRepository, WebhookConfigRepository,
};
use wagate_core::types::{Presence, Reaction, Receipt, Session};
use wagate_core::webhook::WebhookConfig;

/// In-memory repositories. Primary backend for tests; also usable for
/// ephemeral deployments that do not need durability.
#[derive(Default)]
pub struct MemorySessionRepository {
    inner: RwLock<HashMap<String, Session>>,
}

impl MemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn create(&self, session: &Session) -> Result<()> {
        let mut map = self.inner.write().await;
        if map.contains_key(&session.id) {
            return Err(Error::already_exists("session", &session.id));
        }
        map.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Session> {
        self.inner
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("session", id))
    }

    async fn update(&self, session: &Session) -> Result<()> {
        let mut map = self.inner.write().await;
        if !map.contains_key(&session.id) {
            return Err(Error::not_found("session", &session.id));
        }
        map.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.inner
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("session", id))
    }

    async fn list(&self) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self.inner.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }
}

#[derive(Default)]
pub struct MemoryApiKeyRepository {
    inner: RwLock<HashMap<String, ApiKey>>,
}

impl MemoryApiKeyRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApiKeyRepository for MemoryApiKeyRepository {
    async fn create(&self, key: &ApiKey) -> Result<()> {
        let mut map = self.inner.write().await;
        if map.contains_key(&key.id) {
            return Err(Error::already_exists("api key", &key.id));
        }
        if map.values().any(|k| k.key_hash == key.key_hash) {
            return Err(Error::already_exists("api key hash", &key.id));
        }
        map.insert(key.id.clone(), key.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<ApiKey> {
        self.inner
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("api key", id))
    }

    async fn get_by_hash(&self, key_hash: &str) -> Result<ApiKey> {
        self.inner
            .read()
            .await
            .values()
            .find(|k| k.key_hash == key_hash)
            .cloned()
            .ok_or_else(|| Error::not_found("api key", "<hash>"))
    }

    async fn update(&self, key: &ApiKey) -> Result<()> {
        let mut map = self.inner.write().await;
        if !map.contains_key(&key.id) {
            return Err(Error::not_found("api key", &key.id));
        }
        map.insert(key.id.clone(), key.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.inner
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("api key", id))
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<ApiKey>> {
        let mut keys: Vec<ApiKey> = self.inner.read().await.values().cloned().collect();
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count(&self) -> Result<i64> {
        Ok(self.inner.read().await.len() as i64)
    }
}

#[derive(Default)]
pub struct MemoryEventRepository {
    inner: RwLock<Vec<Event>>,
}

impl MemoryEventRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventRepository for MemoryEventRepository {
    async fn create(&self, event: &Event) -> Result<()> {
        self.inner.write().await.push(event.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Event> {
        self.inner
            .read()
            .await
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found("event", id))
    }

    async fn list(&self, query: &EventQuery) -> Result<Vec<Event>> {
        let events = self.inner.read().await;
        let mut matched: Vec<Event> = events.iter().filter(|e| query.matches(e)).cloned().collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(matched
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .collect())
    }

    async fn count(&self, query: &EventQuery) -> Result<i64> {
        Ok(self
            .inner
            .read()
            .await
            .iter()
            .filter(|e| query.matches(e))
            .count() as i64)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut events = self.inner.write().await;
        let before = events.len();
        events.retain(|e| e.timestamp >= cutoff);
        Ok((before - events.len()) as u64)
    }
}

#[derive(Default)]
pub struct MemoryReceiptRepository {
    inner: RwLock<Vec<Receipt>>,
}

impl MemoryReceiptRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReceiptRepository for MemoryReceiptRepository {
    async fn create(&self, receipt: &Receipt) -> Result<()> {
        self.inner.write().await.push(receipt.clone());
        Ok(())
    }

    async fn list_by_session(&self, session_id: &str, limit: i64) -> Result<Vec<Receipt>> {
        let receipts = self.inner.read().await;
        let mut matched: Vec<Receipt> = receipts
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matched.truncate(limit.max(0) as usize);
        Ok(matched)
    }
}

#[derive(Default)]
pub struct MemoryReactionRepository {
    inner: RwLock<Vec<Reaction>>,
}

impl MemoryReactionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReactionRepository for MemoryReactionRepository {
    async fn create(&self, reaction: &Reaction) -> Result<()> {
        self.inner.write().await.push(reaction.clone());
        Ok(())
    }

    async fn list_by_message(&self, message_id: &str) -> Result<Vec<Reaction>> {
        Ok(self
            .inner
            .read()
            .await
            .iter()
            .filter(|r| r.message_id == message_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryPresenceRepository {
    inner: RwLock<Vec<Presence>>,
}

impl MemoryPresenceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceRepository for MemoryPresenceRepository {
    async fn create(&self, presence: &Presence) -> Result<()> {
        self.inner.write().await.push(presence.clone());
        Ok(())
    }

    async fn list_by_session(&self, session_id: &str, limit: i64) -> Result<Vec<Presence>> {
        let rows = self.inner.read().await;
        let mut matched: Vec<Presence> = rows
            .iter()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matched.truncate(limit.max(0) as usize);
        Ok(matched)
    }
}

#[derive(Default)]
pub struct MemoryWebhookConfigRepository {
    inner: RwLock<HashMap<String, WebhookConfig>>,
}

impl MemoryWebhookConfigRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookConfigRepository for MemoryWebhookConfigRepository {
    async fn create(&self, config: &WebhookConfig) -> Result<()> {
        let mut map = self.inner.write().await;
        if map.contains_key(&config.session_id) {
            return Err(Error::already_exists("webhook config", &config.session_id));
        }
        map.insert(config.session_id.clone(), config.clone());
        Ok(())
    }

    async fn get_by_session(&self, session_id: &str) -> Result<WebhookConfig> {
        self.inner
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::not_found("webhook config", session_id))
    }

    async fn update(&self, config: &WebhookConfig) -> Result<()> {
        let mut map = self.inner.write().await;
        if !map.contains_key(&config.session_id) {
            return Err(Error::not_found("webhook config", &config.session_id));
        }
        map.insert(config.session_id.clone(), config.clone());
        Ok(())
    }

    async fn delete_by_session(&self, session_id: &str) -> Result<()> {
        self.inner
            .write()
            .await
            .remove(session_id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("webhook config", session_id))
    }

    async fn list(&self) -> Result<Vec<WebhookConfig>> {
        Ok(self.inner.read().await.values().cloned().collect())
    }
}

#[derive(Default)]
pub struct MemoryAuditRepository {
    inner: RwLock<Vec<AuditRecord>>,
}

impl MemoryAuditRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditRepository for MemoryAuditRepository {
    async fn create(&self, record: &AuditRecord) -> Result<()> {
        self.inner.write().await.push(record.clone());
        Ok(())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<AuditRecord>> {
        let rows = self.inner.read().await;
        let mut all: Vec<AuditRecord> = rows.iter().cloned().collect();
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(all
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}

/// Bundle of every in-memory repository, for wiring tests and the
/// `database.url = ":memory:"` deployment mode in one call.
pub struct MemoryStores {
    pub sessions: Arc<MemorySessionRepository>,
    pub api_keys: Arc<MemoryApiKeyRepository>,
    pub events: Arc<MemoryEventRepository>,
    pub receipts: Arc<MemoryReceiptRepository>,
    pub reactions: Arc<MemoryReactionRepository>,
    pub presence: Arc<MemoryPresenceRepository>,
    pub webhooks: Arc<MemoryWebhookConfigRepository>,
    pub audit: Arc<MemoryAuditRepository>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(MemorySessionRepository::new()),
            api_keys: Arc::new(MemoryApiKeyRepository::new()),
            events: Arc::new(MemoryEventRepository::new()),
            receipts: Arc::new(MemoryReceiptRepository::new()),
            reactions: Arc::new(MemoryReactionRepository::new()),
            presence: Arc::new(MemoryPresenceRepository::new()),
            webhooks: Arc::new(MemoryWebhookConfigRepository::new()),
            audit: Arc::new(MemoryAuditRepository::new()),
        }
    }
}

impl Default for MemoryStores {
    fn default() -> Self {
        Self::new()
    }
}
