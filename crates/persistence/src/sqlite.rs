use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::sync::Arc;
use tracing::info;
use wagate_core::apikey::{ApiKey, ApiKeyRole};
use wagate_core::audit::{AuditKind, AuditRecord};
use wagate_core::error::{Error, ErrorKind, Result};
use wagate_core::event::{Event, EventQuery, EventType};
use wagate_core::jid::Jid;
use wagate_core::repos::{
    ApiKeyRepository, AuditRepository, EventRepository, PresenceRepository, ReactionRepository,
    ReceiptRepository, SessionRepository, WebhookConfigRepository,
};
use wagate_core::types::{
    HistorySyncConfig, Presence, PresenceState, Reaction, Receipt, ReceiptKind, Session,
    SessionStatus,
};
use wagate_core::webhook::WebhookConfig;

fn db_err(e: sqlx::Error) -> Error {
    let unique = matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation());
    if unique {
        Error::new(ErrorKind::AlreadyExists, "unique constraint violated").with_source(e)
    } else {
        Error::database("database operation failed").with_source(e)
    }
}

fn corrupt_row(what: &str, value: &str) -> Error {
    Error::database(format!("corrupt {} value in row: {}", what, value))
}

fn session_status_from(raw: &str) -> Result<SessionStatus> {
    SessionStatus::parse(raw).ok_or_else(|| corrupt_row("session status", raw))
}

fn receipt_kind_from(raw: &str) -> Result<ReceiptKind> {
    match raw {
        "delivery" => Ok(ReceiptKind::Delivery),
        "read" => Ok(ReceiptKind::Read),
        other => Err(corrupt_row("receipt kind", other)),
    }
}

fn receipt_kind_str(kind: ReceiptKind) -> &'static str {
    match kind {
        ReceiptKind::Delivery => "delivery",
        ReceiptKind::Read => "read",
    }
}

fn presence_state_from(raw: &str) -> Result<PresenceState> {
    match raw {
        "typing" => Ok(PresenceState::Typing),
        "paused" => Ok(PresenceState::Paused),
        "online" => Ok(PresenceState::Online),
        "offline" => Ok(PresenceState::Offline),
        other => Err(corrupt_row("presence state", other)),
    }
}

fn presence_state_str(state: PresenceState) -> &'static str {
    match state {
        PresenceState::Typing => "typing",
        PresenceState::Paused => "paused",
        PresenceState::Online => "online",
        PresenceState::Offline => "offline",
    }
}

/// SQLite-backed repositories sharing one pool. Construction runs the
/// bundled migrations.
#[derive(Clone)]
pub struct SqliteStores {
    pool: SqlitePool,
}

impl SqliteStores {
    pub async fn connect(database_url: &str) -> Result<Self> {
        // An in-memory SQLite database exists per connection; more than one
        // connection would each see an empty schema.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(db_err)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| Error::database("failed to run migrations").with_source(e))?;

        info!("SqliteStores initialized");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Connectivity probe for readiness checks.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub fn sessions(&self) -> Arc<SqliteSessionRepository> {
        Arc::new(SqliteSessionRepository {
            pool: self.pool.clone(),
        })
    }

    pub fn api_keys(&self) -> Arc<SqliteApiKeyRepository> {
        Arc::new(SqliteApiKeyRepository {
            pool: self.pool.clone(),
        })
    }

    pub fn events(&self) -> Arc<SqliteEventRepository> {
        Arc::new(SqliteEventRepository {
            pool: self.pool.clone(),
        })
    }

    pub fn receipts(&self) -> Arc<SqliteReceiptRepository> {
        Arc::new(SqliteReceiptRepository {
            pool: self.pool.clone(),
        })
    }

    pub fn reactions(&self) -> Arc<SqliteReactionRepository> {
        Arc::new(SqliteReactionRepository {
            pool: self.pool.clone(),
        })
    }

    pub fn presence(&self) -> Arc<SqlitePresenceRepository> {
        Arc::new(SqlitePresenceRepository {
            pool: self.pool.clone(),
        })
    }

    pub fn webhooks(&self) -> Arc<SqliteWebhookConfigRepository> {
        Arc::new(SqliteWebhookConfigRepository {
            pool: self.pool.clone(),
        })
    }

    pub fn audit(&self) -> Arc<SqliteAuditRepository> {
        Arc::new(SqliteAuditRepository {
            pool: self.pool.clone(),
        })
    }
}

#[derive(Clone)]
pub struct SqliteSessionRepository {
    pool: SqlitePool,
}

type SessionRow = (
    String,
    Option<String>,
    String,
    String,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
);

fn session_from_row(row: SessionRow) -> Result<Session> {
    let (id, jid, name, status, history_sync, created_at, updated_at) = row;
    let jid = match jid {
        Some(raw) => Some(Jid::parse(&raw).map_err(|_| corrupt_row("jid", &raw))?),
        None => None,
    };
    let history_sync: HistorySyncConfig =
        serde_json::from_str(&history_sync).unwrap_or_default();
    Ok(Session {
        id,
        jid,
        name,
        status: session_status_from(&status)?,
        created_at,
        updated_at,
        history_sync,
    })
}

#[async_trait]
impl SessionRepository for SqliteSessionRepository {
    async fn create(&self, session: &Session) -> Result<()> {
        let history = serde_json::to_string(&session.history_sync)
            .map_err(|e| Error::database("history_sync encode failed").with_source(e))?;
        sqlx::query(
            r#"
            INSERT INTO sessions (id, jid, name, status, history_sync, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(session.jid.as_ref().map(|j| j.as_str().to_string()))
        .bind(&session.name)
        .bind(session.status.as_str())
        .bind(history)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Session> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT id, jid, name, status, history_sync, created_at, updated_at FROM sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(row) => session_from_row(row),
            None => Err(Error::not_found("session", id)),
        }
    }

    async fn update(&self, session: &Session) -> Result<()> {
        let history = serde_json::to_string(&session.history_sync)
            .map_err(|e| Error::database("history_sync encode failed").with_source(e))?;
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET jid = ?, name = ?, status = ?, history_sync = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(session.jid.as_ref().map(|j| j.as_str().to_string()))
        .bind(&session.name)
        .bind(session.status.as_str())
        .bind(history)
        .bind(session.updated_at)
        .bind(&session.id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("session", &session.id));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("session", id));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            "SELECT id, jid, name, status, history_sync, created_at, updated_at FROM sessions ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(session_from_row).collect()
    }
}

#[derive(Clone)]
pub struct SqliteApiKeyRepository {
    pool: SqlitePool,
}

type ApiKeyRow = (
    String,
    String,
    String,
    Option<String>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    bool,
    Option<DateTime<Utc>>,
    Option<String>,
    Option<String>,
);

fn api_key_from_row(row: ApiKeyRow) -> Result<ApiKey> {
    let (
        id,
        key_hash,
        role,
        description,
        created_at,
        last_used_at,
        is_active,
        revoked_at,
        revoked_by,
        revocation_reason,
    ) = row;
    Ok(ApiKey {
        id,
        key_hash,
        role: ApiKeyRole::parse(&role).ok_or_else(|| corrupt_row("api key role", &role))?,
        description,
        created_at,
        last_used_at,
        is_active,
        revoked_at,
        revoked_by,
        revocation_reason,
    })
}

const API_KEY_COLUMNS: &str = "id, key_hash, role, description, created_at, last_used_at, is_active, revoked_at, revoked_by, revocation_reason";

#[async_trait]
impl ApiKeyRepository for SqliteApiKeyRepository {
    async fn create(&self, key: &ApiKey) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO api_keys
            (id, key_hash, role, description, created_at, last_used_at, is_active, revoked_at, revoked_by, revocation_reason)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&key.id)
        .bind(&key.key_hash)
        .bind(key.role.as_str())
        .bind(&key.description)
        .bind(key.created_at)
        .bind(key.last_used_at)
        .bind(key.is_active)
        .bind(key.revoked_at)
        .bind(&key.revoked_by)
        .bind(&key.revocation_reason)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<ApiKey> {
        let row: Option<ApiKeyRow> = sqlx::query_as(&format!(
            "SELECT {} FROM api_keys WHERE id = ?",
            API_KEY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(row) => api_key_from_row(row),
            None => Err(Error::not_found("api key", id)),
        }
    }

    async fn get_by_hash(&self, key_hash: &str) -> Result<ApiKey> {
        let row: Option<ApiKeyRow> = sqlx::query_as(&format!(
            "SELECT {} FROM api_keys WHERE key_hash = ?",
            API_KEY_COLUMNS
        ))
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(row) => api_key_from_row(row),
            None => Err(Error::not_found("api key", "<hash>")),
        }
    }

    async fn update(&self, key: &ApiKey) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE api_keys
            SET role = ?, description = ?, last_used_at = ?, is_active = ?,
                revoked_at = ?, revoked_by = ?, revocation_reason = ?
            WHERE id = ?
            "#,
        )
        .bind(key.role.as_str())
        .bind(&key.description)
        .bind(key.last_used_at)
        .bind(key.is_active)
        .bind(key.revoked_at)
        .bind(&key.revoked_by)
        .bind(&key.revocation_reason)
        .bind(&key.id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("api key", &key.id));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM api_keys WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("api key", id));
        }
        Ok(())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<ApiKey>> {
        let rows: Vec<ApiKeyRow> = sqlx::query_as(&format!(
            "SELECT {} FROM api_keys ORDER BY created_at DESC LIMIT ? OFFSET ?",
            API_KEY_COLUMNS
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(api_key_from_row).collect()
    }

    async fn count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM api_keys")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.0)
    }
}

#[derive(Clone)]
pub struct SqliteEventRepository {
    pool: SqlitePool,
}

type EventRow = (String, String, String, String, DateTime<Utc>);

fn event_from_row(row: EventRow) -> Result<Event> {
    let (id, kind, session_id, data, timestamp) = row;
    Ok(Event {
        id,
        kind: EventType::parse(&kind).ok_or_else(|| corrupt_row("event type", &kind))?,
        session_id,
        data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
        timestamp,
    })
}

fn event_where_clause(query: &EventQuery) -> String {
    let mut sql = String::from(" WHERE 1=1");
    if query.session_id.is_some() {
        sql.push_str(" AND session_id = ?");
    }
    if query.kind.is_some() {
        sql.push_str(" AND type = ?");
    }
    if query.since.is_some() {
        sql.push_str(" AND timestamp >= ?");
    }
    if query.until.is_some() {
        sql.push_str(" AND timestamp <= ?");
    }
    sql
}

macro_rules! bind_event_filters {
    ($q:expr, $query:expr) => {{
        let mut q = $q;
        if let Some(session_id) = &$query.session_id {
            q = q.bind(session_id);
        }
        if let Some(kind) = $query.kind {
            q = q.bind(kind.as_str());
        }
        if let Some(since) = $query.since {
            q = q.bind(since);
        }
        if let Some(until) = $query.until {
            q = q.bind(until);
        }
        q
    }};
}

#[async_trait]
impl EventRepository for SqliteEventRepository {
    async fn create(&self, event: &Event) -> Result<()> {
        let data = serde_json::to_string(&event.data)
            .map_err(|e| Error::database("event payload encode failed").with_source(e))?;
        sqlx::query(
            "INSERT INTO events (id, type, session_id, data, timestamp) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&event.id)
        .bind(event.kind.as_str())
        .bind(&event.session_id)
        .bind(data)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Event> {
        let row: Option<EventRow> = sqlx::query_as(
            "SELECT id, type, session_id, data, timestamp FROM events WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(row) => event_from_row(row),
            None => Err(Error::not_found("event", id)),
        }
    }

    async fn list(&self, query: &EventQuery) -> Result<Vec<Event>> {
        let sql = format!(
            "SELECT id, type, session_id, data, timestamp FROM events{} ORDER BY timestamp DESC LIMIT ? OFFSET ?",
            event_where_clause(query)
        );
        let q = bind_event_filters!(sqlx::query_as::<_, EventRow>(&sql), query)
            .bind(query.limit)
            .bind(query.offset);
        let rows = q.fetch_all(&self.pool).await.map_err(db_err)?;
        rows.into_iter().map(event_from_row).collect()
    }

    async fn count(&self, query: &EventQuery) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM events{}",
            event_where_clause(query)
        );
        let q = bind_event_filters!(sqlx::query_as::<_, (i64,)>(&sql), query);
        let row = q.fetch_one(&self.pool).await.map_err(db_err)?;
        Ok(row.0)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM events WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

#[derive(Clone)]
pub struct SqliteReceiptRepository {
    pool: SqlitePool,
}

type ReceiptRow = (String, String, String, String, String, DateTime<Utc>);

fn receipt_from_row(row: ReceiptRow) -> Result<Receipt> {
    let (id, session_id, chat_jid, message_ids, kind, timestamp) = row;
    Ok(Receipt {
        id,
        session_id,
        chat_jid: Jid::parse(&chat_jid).map_err(|_| corrupt_row("jid", &chat_jid))?,
        message_ids: serde_json::from_str(&message_ids).unwrap_or_default(),
        kind: receipt_kind_from(&kind)?,
        timestamp,
    })
}

#[async_trait]
impl ReceiptRepository for SqliteReceiptRepository {
    async fn create(&self, receipt: &Receipt) -> Result<()> {
        let message_ids = serde_json::to_string(&receipt.message_ids)
            .map_err(|e| Error::database("message_ids encode failed").with_source(e))?;
        sqlx::query(
            "INSERT INTO receipts (id, session_id, chat_jid, message_ids, kind, timestamp) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&receipt.id)
        .bind(&receipt.session_id)
        .bind(receipt.chat_jid.as_str())
        .bind(message_ids)
        .bind(receipt_kind_str(receipt.kind))
        .bind(receipt.timestamp)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_by_session(&self, session_id: &str, limit: i64) -> Result<Vec<Receipt>> {
        let rows: Vec<ReceiptRow> = sqlx::query_as(
            "SELECT id, session_id, chat_jid, message_ids, kind, timestamp FROM receipts WHERE session_id = ? ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(receipt_from_row).collect()
    }
}

#[derive(Clone)]
pub struct SqliteReactionRepository {
    pool: SqlitePool,
}

type ReactionRow = (String, String, String, String, String, DateTime<Utc>);

fn reaction_from_row(row: ReactionRow) -> Result<Reaction> {
    let (id, session_id, chat_jid, message_id, emoji, timestamp) = row;
    Ok(Reaction {
        id,
        session_id,
        chat_jid: Jid::parse(&chat_jid).map_err(|_| corrupt_row("jid", &chat_jid))?,
        message_id,
        emoji,
        timestamp,
    })
}

#[async_trait]
impl ReactionRepository for SqliteReactionRepository {
    async fn create(&self, reaction: &Reaction) -> Result<()> {
        sqlx::query(
            "INSERT INTO reactions (id, session_id, chat_jid, message_id, emoji, timestamp) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&reaction.id)
        .bind(&reaction.session_id)
        .bind(reaction.chat_jid.as_str())
        .bind(&reaction.message_id)
        .bind(&reaction.emoji)
        .bind(reaction.timestamp)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_by_message(&self, message_id: &str) -> Result<Vec<Reaction>> {
        let rows: Vec<ReactionRow> = sqlx::query_as(
            "SELECT id, session_id, chat_jid, message_id, emoji, timestamp FROM reactions WHERE message_id = ? ORDER BY timestamp ASC",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(reaction_from_row).collect()
    }
}

#[derive(Clone)]
pub struct SqlitePresenceRepository {
    pool: SqlitePool,
}

type PresenceRow = (String, String, String, String, DateTime<Utc>);

fn presence_from_row(row: PresenceRow) -> Result<Presence> {
    let (id, session_id, chat_jid, state, timestamp) = row;
    Ok(Presence {
        id,
        session_id,
        chat_jid: Jid::parse(&chat_jid).map_err(|_| corrupt_row("jid", &chat_jid))?,
        state: presence_state_from(&state)?,
        timestamp,
    })
}

#[async_trait]
impl PresenceRepository for SqlitePresenceRepository {
    async fn create(&self, presence: &Presence) -> Result<()> {
        sqlx::query(
            "INSERT INTO presence (id, session_id, chat_jid, state, timestamp) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&presence.id)
        .bind(&presence.session_id)
        .bind(presence.chat_jid.as_str())
        .bind(presence_state_str(presence.state))
        .bind(presence.timestamp)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_by_session(&self, session_id: &str, limit: i64) -> Result<Vec<Presence>> {
        let rows: Vec<PresenceRow> = sqlx::query_as(
            "SELECT id, session_id, chat_jid, state, timestamp FROM presence WHERE session_id = ? ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(presence_from_row).collect()
    }
}

#[derive(Clone)]
pub struct SqliteWebhookConfigRepository {
    pool: SqlitePool,
}

type WebhookRow = (
    String,
    String,
    bool,
    String,
    String,
    String,
    bool,
    bool,
    bool,
    DateTime<Utc>,
    DateTime<Utc>,
);

fn webhook_from_row(row: WebhookRow) -> Result<WebhookConfig> {
    let (
        id,
        session_id,
        enabled,
        url,
        secret,
        events,
        ignore_groups,
        ignore_broadcasts,
        ignore_channels,
        created_at,
        updated_at,
    ) = row;
    let event_names: Vec<String> = serde_json::from_str(&events).unwrap_or_default();
    let events = event_names
        .iter()
        .map(|name| EventType::parse(name).ok_or_else(|| corrupt_row("event type", name)))
        .collect::<Result<Vec<_>>>()?;
    Ok(WebhookConfig {
        id,
        session_id,
        enabled,
        url,
        secret,
        events,
        ignore_groups,
        ignore_broadcasts,
        ignore_channels,
        created_at,
        updated_at,
    })
}

fn webhook_events_json(config: &WebhookConfig) -> Result<String> {
    let names: Vec<&str> = config.events.iter().map(|e| e.as_str()).collect();
    serde_json::to_string(&names)
        .map_err(|e| Error::database("webhook events encode failed").with_source(e))
}

const WEBHOOK_COLUMNS: &str = "id, session_id, enabled, url, secret, events, ignore_groups, ignore_broadcasts, ignore_channels, created_at, updated_at";

#[async_trait]
impl WebhookConfigRepository for SqliteWebhookConfigRepository {
    async fn create(&self, config: &WebhookConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_configs
            (id, session_id, enabled, url, secret, events, ignore_groups, ignore_broadcasts, ignore_channels, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&config.id)
        .bind(&config.session_id)
        .bind(config.enabled)
        .bind(&config.url)
        .bind(&config.secret)
        .bind(webhook_events_json(config)?)
        .bind(config.ignore_groups)
        .bind(config.ignore_broadcasts)
        .bind(config.ignore_channels)
        .bind(config.created_at)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_by_session(&self, session_id: &str) -> Result<WebhookConfig> {
        let row: Option<WebhookRow> = sqlx::query_as(&format!(
            "SELECT {} FROM webhook_configs WHERE session_id = ?",
            WEBHOOK_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(row) => webhook_from_row(row),
            None => Err(Error::not_found("webhook config", session_id)),
        }
    }

    async fn update(&self, config: &WebhookConfig) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_configs
            SET enabled = ?, url = ?, secret = ?, events = ?, ignore_groups = ?,
                ignore_broadcasts = ?, ignore_channels = ?, updated_at = ?
            WHERE session_id = ?
            "#,
        )
        .bind(config.enabled)
        .bind(&config.url)
        .bind(&config.secret)
        .bind(webhook_events_json(config)?)
        .bind(config.ignore_groups)
        .bind(config.ignore_broadcasts)
        .bind(config.ignore_channels)
        .bind(config.updated_at)
        .bind(&config.session_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("webhook config", &config.session_id));
        }
        Ok(())
    }

    async fn delete_by_session(&self, session_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM webhook_configs WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("webhook config", session_id));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<WebhookConfig>> {
        let rows: Vec<WebhookRow> = sqlx::query_as(&format!(
            "SELECT {} FROM webhook_configs ORDER BY created_at ASC",
            WEBHOOK_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(webhook_from_row).collect()
    }
}

#[derive(Clone)]
pub struct SqliteAuditRepository {
    pool: SqlitePool,
}

type AuditRow = (
    String,
    String,
    String,
    Option<String>,
    bool,
    String,
    DateTime<Utc>,
);

fn audit_from_row(row: AuditRow) -> Result<AuditRecord> {
    let (id, kind, actor, session_id, success, details, timestamp) = row;
    Ok(AuditRecord {
        id,
        kind: AuditKind::parse(&kind).ok_or_else(|| corrupt_row("audit kind", &kind))?,
        actor,
        session_id,
        success,
        details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
        timestamp,
    })
}

#[async_trait]
impl AuditRepository for SqliteAuditRepository {
    async fn create(&self, record: &AuditRecord) -> Result<()> {
        let details = serde_json::to_string(&record.details)
            .map_err(|e| Error::database("audit details encode failed").with_source(e))?;
        sqlx::query(
            "INSERT INTO audit_log (id, kind, actor, session_id, success, details, timestamp) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(record.kind.as_str())
        .bind(&record.actor)
        .bind(&record.session_id)
        .bind(record.success)
        .bind(details)
        .bind(record.timestamp)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<AuditRecord>> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            "SELECT id, kind, actor, session_id, success, details, timestamp FROM audit_log ORDER BY timestamp DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(audit_from_row).collect()
    }
}
