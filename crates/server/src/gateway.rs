use crate::health::HealthRegistry;
use crate::ratelimit::RequestRateLimiter;
use crate::ws;
use async_trait::async_trait;
use axum::extract::{ConnectInfo, FromRequest, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use wagate_auth::{generate_secret, AuthService, AuthenticatedKey};
use wagate_core::apikey::{mask_key, ApiKey, ApiKeyRole};
use wagate_core::client::WhatsAppClient;
use wagate_core::context::RequestContext;
use wagate_core::error::{Error, ErrorKind};
use wagate_core::event::{EventFilter, EventType};
use wagate_core::jid::{Jid, PhoneNumber};
use wagate_core::metrics::MetricsStore;
use wagate_core::repos::WebhookConfigRepository;
use wagate_core::types::{PresenceState, SessionStatus};
use wagate_core::webhook::WebhookConfig;
use wagate_dispatch::{Dispatcher, InteractionService, SendMessageRequest, SendMode};
use wagate_events::{EventHub, EventLogService, EventPublisher};
use wagate_session::SessionManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub interactions: Arc<InteractionService>,
    pub auth: Arc<AuthService>,
    pub event_log: Arc<EventLogService>,
    pub publisher: Arc<EventPublisher>,
    pub hub: Arc<EventHub>,
    pub client: Arc<dyn WhatsAppClient>,
    pub webhooks: Arc<dyn WebhookConfigRepository>,
    pub metrics: Arc<MetricsStore>,
    pub health: Arc<HealthRegistry>,
    pub limiter: Arc<RequestRateLimiter>,
    /// Header name carrying the API key (besides `Authorization: Bearer`).
    pub api_key_header: String,
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data: Some(data),
        error: None,
    })
}

/// Handler-facing error: kind mapped to status + the wire envelope. The
/// cause chain stays in the logs.
pub struct ApiError {
    status: StatusCode,
    code: String,
    message: String,
    headers: Vec<(&'static str, String)>,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
            headers: Vec::new(),
        }
    }

    fn with_header(mut self, name: &'static str, value: String) -> Self {
        self.headers.push((name, value));
        self
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status =
            StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(code = e.code(), error = %e, "request failed");
        }
        Self::new(status, e.code(), e.message().to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: self.code,
                message: self.message,
            }),
        });
        let mut response = (self.status, body).into_response();
        for (name, value) in self.headers {
            if let Ok(value) = value.parse() {
                response.headers_mut().insert(name, value);
            }
        }
        response
    }
}

/// `Json` with the rejection mapped into the error envelope: an
/// unparseable body is `INVALID_JSON`, not a bare axum error page.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                ErrorKind::InvalidJson.as_str(),
                rejection.body_text(),
            )),
        }
    }
}

fn client_ip(headers: &HeaderMap, addr: Option<&SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| addr.map(|a| a.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn extract_api_key(state: &AppState, headers: &HeaderMap) -> Option<String> {
    headers
        .get(state.api_key_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|v| v.to_string())
        })
}

/// Authenticate + authorize one protected call; emits the usage audit entry.
async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    addr: Option<&SocketAddr>,
    endpoint: &str,
    method: &str,
    required: ApiKeyRole,
) -> Result<AuthenticatedKey, ApiError> {
    let presented = extract_api_key(state, headers);
    let ctx = RequestContext::new();
    let key = state
        .auth
        .authenticate(
            presented.as_deref(),
            &ctx,
            endpoint,
            method,
            &client_ip(headers, addr),
        )
        .await
        .map_err(|e| {
            state.metrics.inc_auth_failures();
            ApiError::from(e)
        })?;
    state.auth.authorize(&key, required)?;
    Ok(key)
}

/// HTTP-level rate limiting ahead of every `/api` handler. 429 carries
/// `Retry-After` and `X-RateLimit-*` headers.
async fn ratelimit_middleware(
    State(state): State<AppState>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if !state.limiter.enabled() {
        return next.run(request).await;
    }
    let addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let ip = client_ip(request.headers(), addr.as_ref());
    let api_key = extract_api_key(&state, request.headers());

    let decision = state.limiter.check(Some(&ip), api_key.as_deref()).await;
    if decision.allowed {
        return next.run(request).await;
    }

    ApiError::new(
        StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::RateLimitExceeded.as_str(),
        "too many requests",
    )
    .with_header("Retry-After", decision.retry_after_secs.to_string())
    .with_header("X-RateLimit-Limit", decision.limit.to_string())
    .with_header("X-RateLimit-Remaining", decision.remaining.to_string())
    .with_header("X-RateLimit-Reset", decision.retry_after_secs.to_string())
    .into_response()
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/messages", post(send_message))
        .route("/api/messages/:id/reactions", post(send_reaction))
        .route("/api/messages/receipts", post(send_receipts))
        .route("/api/presence", post(send_presence))
        .route("/api/contacts/check", get(check_contacts))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", get(get_session))
        .route("/api/sessions/:id/contacts", get(list_contacts))
        .route(
            "/api/sessions/:id/webhook",
            get(get_webhook).put(put_webhook),
        )
        .route("/api/sessions/:id/webhook/secret", post(rotate_webhook_secret))
        .route("/api/events", get(list_events))
        .route("/api/events/replay", post(replay_events))
        .route("/api/events/:id", get(get_event))
        .route("/api/apikeys", post(create_api_key).get(list_api_keys))
        .route("/api/apikeys/:id", get(get_api_key))
        .route("/api/apikeys/:id/revoke", post(revoke_api_key))
        .route("/api/internal/sessions/register", post(register_session))
        .route("/api/internal/sessions/:id", delete(unregister_session))
        .route("/api/internal/sessions/:id/status", post(update_session_status))
        .route("/api/internal/sessions/:id/reconnect", post(reconnect_session))
        .route(
            "/api/internal/sessions/:id/history-sync",
            post(configure_history_sync),
        )
        .route("/api/metrics", get(get_metrics))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            ratelimit_middleware,
        ));

    Router::new()
        .merge(api)
        .route("/health", get(health_check))
        .route("/ready", get(readiness))
        .route("/ws/events", get(ws::ws_events))
        .route("/ws/qr/:session_id", get(ws::ws_qr))
        .with_state(state)
}

/// Binds and serves the REST + WS surface until the shutdown future
/// resolves.
pub struct Gateway {
    state: AppState,
    host: String,
    port: u16,
}

impl Gateway {
    pub fn new(state: AppState, host: &str, port: u16) -> Self {
        Self {
            state,
            host: host.to_string(),
            port,
        }
    }

    pub async fn serve<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = router(self.state.clone());
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Gateway listening on {}", addr);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct SendQuery {
    #[serde(default)]
    sync: bool,
}

/// POST /api/messages: async by default (202 + pending), `?sync=true`
/// waits for the terminal status.
async fn send_message(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<SendQuery>,
    ApiJson(req): ApiJson<SendMessageRequest>,
) -> Result<Response, ApiError> {
    authenticate(
        &state,
        &headers,
        Some(&addr),
        "/api/messages",
        "POST",
        ApiKeyRole::Write,
    )
    .await?;

    let mode = if query.sync {
        SendMode::Sync
    } else {
        SendMode::Async
    };
    let out = state.dispatcher.send_message(req, mode).await?;
    let status = match mode {
        SendMode::Async => StatusCode::ACCEPTED,
        SendMode::Sync => StatusCode::OK,
    };
    Ok((status, ok(out)).into_response())
}

#[derive(Deserialize)]
struct ReactionRequest {
    session_id: String,
    chat_jid: String,
    #[serde(default)]
    emoji: String,
}

/// POST /api/messages/:id/reactions. An empty emoji removes the reaction.
async fn send_reaction(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(message_id): Path<String>,
    ApiJson(req): ApiJson<ReactionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(
        &state,
        &headers,
        Some(&addr),
        "/api/messages/:id/reactions",
        "POST",
        ApiKeyRole::Write,
    )
    .await?;
    let reaction = state
        .interactions
        .send_reaction(&req.session_id, &req.chat_jid, &message_id, &req.emoji)
        .await?;
    Ok(ok(reaction))
}

#[derive(Deserialize)]
struct ReceiptsRequest {
    session_id: String,
    chat_jid: String,
    message_ids: Vec<String>,
}

/// POST /api/messages/receipts. One atomic read receipt for all ids.
async fn send_receipts(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<ReceiptsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(
        &state,
        &headers,
        Some(&addr),
        "/api/messages/receipts",
        "POST",
        ApiKeyRole::Write,
    )
    .await?;
    let receipt = state
        .interactions
        .send_read_receipts(&req.session_id, &req.chat_jid, &req.message_ids)
        .await?;
    Ok(ok(receipt))
}

#[derive(Deserialize)]
struct PresenceRequest {
    session_id: String,
    chat_jid: String,
    state: PresenceState,
}

async fn send_presence(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<PresenceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(
        &state,
        &headers,
        Some(&addr),
        "/api/presence",
        "POST",
        ApiKeyRole::Write,
    )
    .await?;
    let presence = state
        .interactions
        .send_presence(&req.session_id, &req.chat_jid, req.state)
        .await?;
    Ok(ok(presence))
}

#[derive(Deserialize)]
struct ContactsCheckQuery {
    session_id: String,
    /// Comma-separated E.164 numbers.
    phones: String,
}

async fn check_contacts(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<ContactsCheckQuery>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(
        &state,
        &headers,
        Some(&addr),
        "/api/contacts/check",
        "GET",
        ApiKeyRole::Read,
    )
    .await?;

    if !state.client.is_connected(&query.session_id) {
        return Err(Error::new(
            ErrorKind::Disconnected,
            "session is not connected",
        )
        .into());
    }
    let phones = query
        .phones
        .split(',')
        .map(|p| PhoneNumber::new(p.trim()))
        .collect::<Result<Vec<_>, _>>()?;
    if phones.is_empty() {
        return Err(Error::validation("at least one phone number is required").into());
    }
    let results = state
        .client
        .check_phone_number(&query.session_id, &phones)
        .await?;
    Ok(ok(json!({ "results": results })))
}

async fn list_sessions(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(
        &state,
        &headers,
        Some(&addr),
        "/api/sessions",
        "GET",
        ApiKeyRole::Read,
    )
    .await?;
    let sessions = state.manager.list().await?;
    Ok(ok(json!({ "sessions": sessions })))
}

async fn get_session(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(
        &state,
        &headers,
        Some(&addr),
        "/api/sessions/:id",
        "GET",
        ApiKeyRole::Read,
    )
    .await?;
    Ok(ok(state.manager.get(&id).await?))
}

async fn list_contacts(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(
        &state,
        &headers,
        Some(&addr),
        "/api/sessions/:id/contacts",
        "GET",
        ApiKeyRole::Read,
    )
    .await?;
    if !state.client.is_connected(&id) {
        return Err(Error::new(ErrorKind::Disconnected, "session is not connected").into());
    }
    let contacts = state.client.list_contacts(&id).await?;
    Ok(ok(json!({ "contacts": contacts })))
}

async fn list_events(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(filter): Query<EventFilter>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(
        &state,
        &headers,
        Some(&addr),
        "/api/events",
        "GET",
        ApiKeyRole::Read,
    )
    .await?;
    let events = state.event_log.list(&filter).await?;
    let total = state.event_log.count(&filter).await?;
    Ok(ok(json!({ "events": events, "total": total })))
}

async fn get_event(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(
        &state,
        &headers,
        Some(&addr),
        "/api/events/:id",
        "GET",
        ApiKeyRole::Read,
    )
    .await?;
    Ok(ok(state.event_log.get(&id).await?))
}

#[derive(Deserialize)]
struct ReplayRequest {
    #[serde(flatten)]
    filter: EventFilter,
    #[serde(default)]
    dry_run: bool,
}

async fn replay_events(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<ReplayRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(
        &state,
        &headers,
        Some(&addr),
        "/api/events/replay",
        "POST",
        ApiKeyRole::Admin,
    )
    .await?;
    let outcome = state
        .event_log
        .replay(&req.filter, req.dry_run, &state.publisher)
        .await?;
    Ok(ok(outcome))
}

#[derive(Deserialize)]
struct CreateApiKeyRequest {
    role: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Serialize)]
struct CreatedApiKeyResponse {
    id: String,
    /// Plaintext, returned exactly once.
    api_key: String,
    masked: String,
    role: ApiKeyRole,
}

async fn create_api_key(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<CreateApiKeyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = authenticate(
        &state,
        &headers,
        Some(&addr),
        "/api/apikeys",
        "POST",
        ApiKeyRole::Admin,
    )
    .await?;
    let role = ApiKeyRole::parse(&req.role)
        .ok_or_else(|| Error::validation(format!("unknown role: {}", req.role)))?;
    let created = state
        .auth
        .create_key(role, req.description, &caller.id)
        .await?;
    Ok((
        StatusCode::CREATED,
        ok(CreatedApiKeyResponse {
            id: created.key.id.clone(),
            masked: mask_key(&created.plaintext),
            api_key: created.plaintext,
            role: created.key.role,
        }),
    ))
}

#[derive(Deserialize)]
struct ListApiKeysQuery {
    #[serde(default)]
    page: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn list_api_keys(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<ListApiKeysQuery>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(
        &state,
        &headers,
        Some(&addr),
        "/api/apikeys",
        "GET",
        ApiKeyRole::Admin,
    )
    .await?;
    let keys: Vec<ApiKey> = state
        .auth
        .list(query.page.unwrap_or(1), query.limit.unwrap_or(50))
        .await?;
    Ok(ok(json!({ "api_keys": keys })))
}

async fn get_api_key(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(
        &state,
        &headers,
        Some(&addr),
        "/api/apikeys/:id",
        "GET",
        ApiKeyRole::Admin,
    )
    .await?;
    Ok(ok(state.auth.details(&id).await?))
}

#[derive(Deserialize, Default)]
struct RevokeRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn revoke_api_key(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<ApiJson<RevokeRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = authenticate(
        &state,
        &headers,
        Some(&addr),
        "/api/apikeys/:id/revoke",
        "POST",
        ApiKeyRole::Admin,
    )
    .await?;
    let reason = body.and_then(|ApiJson(b)| b.reason);
    let key = state.auth.revoke_key(&id, &caller.id, reason).await?;
    Ok(ok(key))
}

#[derive(Deserialize)]
struct RegisterSessionRequest {
    session_id: String,
    #[serde(default)]
    name: String,
}

async fn register_session(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<RegisterSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(
        &state,
        &headers,
        Some(&addr),
        "/api/internal/sessions/register",
        "POST",
        ApiKeyRole::Admin,
    )
    .await?;
    let session = state.manager.register(&req.session_id, &req.name).await?;
    Ok((StatusCode::CREATED, ok(session)))
}

async fn unregister_session(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(
        &state,
        &headers,
        Some(&addr),
        "/api/internal/sessions/:id",
        "DELETE",
        ApiKeyRole::Admin,
    )
    .await?;
    state.manager.unregister(&id).await?;
    Ok(ok(json!({ "removed": id })))
}

#[derive(Deserialize)]
struct UpdateStatusRequest {
    status: String,
    #[serde(default)]
    jid: Option<String>,
}

async fn update_session_status(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<UpdateStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(
        &state,
        &headers,
        Some(&addr),
        "/api/internal/sessions/:id/status",
        "POST",
        ApiKeyRole::Admin,
    )
    .await?;
    let status = SessionStatus::parse(&req.status)
        .ok_or_else(|| Error::validation(format!("unknown status: {}", req.status)))?;
    let jid = match req.jid.as_deref() {
        Some(raw) if !raw.is_empty() => Some(Jid::parse(raw)?),
        _ => None,
    };
    let session = state.manager.update_status(&id, status, jid).await?;
    Ok(ok(session))
}

#[derive(Deserialize, Default)]
struct ReconnectRequest {
    #[serde(default)]
    jid: Option<String>,
}

async fn reconnect_session(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<ApiJson<ReconnectRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(
        &state,
        &headers,
        Some(&addr),
        "/api/internal/sessions/:id/reconnect",
        "POST",
        ApiKeyRole::Admin,
    )
    .await?;
    let jid = match body.and_then(|ApiJson(b)| b.jid) {
        Some(raw) if !raw.is_empty() => Some(Jid::parse(&raw)?),
        _ => None,
    };
    let session = state.manager.reconnect(&id, jid).await?;
    Ok(ok(session))
}

#[derive(Deserialize)]
struct HistorySyncRequest {
    enabled: bool,
    #[serde(default)]
    full: bool,
    #[serde(default)]
    since: Option<chrono::DateTime<chrono::Utc>>,
}

async fn configure_history_sync(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<HistorySyncRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(
        &state,
        &headers,
        Some(&addr),
        "/api/internal/sessions/:id/history-sync",
        "POST",
        ApiKeyRole::Admin,
    )
    .await?;
    let session = state
        .manager
        .configure_history_sync(&id, req.enabled, req.full, req.since)
        .await?;
    Ok(ok(session))
}

async fn get_webhook(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(
        &state,
        &headers,
        Some(&addr),
        "/api/sessions/:id/webhook",
        "GET",
        ApiKeyRole::Admin,
    )
    .await?;
    Ok(ok(state.webhooks.get_by_session(&id).await?))
}

#[derive(Deserialize)]
struct WebhookUpdateRequest {
    url: String,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    events: Vec<String>,
    #[serde(default)]
    ignore_groups: bool,
    #[serde(default)]
    ignore_broadcasts: bool,
    #[serde(default)]
    ignore_channels: bool,
}

fn default_true() -> bool {
    true
}

fn parse_event_names(names: &[String]) -> Result<Vec<EventType>, Error> {
    names
        .iter()
        .map(|name| {
            EventType::parse(name)
                .ok_or_else(|| Error::validation(format!("unknown event type: {}", name)))
        })
        .collect()
}

/// PUT /api/sessions/:id/webhook, upsert semantics. The secret is generated on
/// first create and returned once in that response.
async fn put_webhook(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<WebhookUpdateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(
        &state,
        &headers,
        Some(&addr),
        "/api/sessions/:id/webhook",
        "PUT",
        ApiKeyRole::Admin,
    )
    .await?;
    if req.url.is_empty() {
        return Err(Error::validation("webhook url is required").into());
    }
    let events = parse_event_names(&req.events)?;

    match state.webhooks.get_by_session(&id).await {
        Ok(mut config) => {
            config.url = req.url;
            config.enabled = req.enabled;
            config.events = events;
            config.ignore_groups = req.ignore_groups;
            config.ignore_broadcasts = req.ignore_broadcasts;
            config.ignore_channels = req.ignore_channels;
            config.updated_at = chrono::Utc::now();
            state.webhooks.update(&config).await?;
            Ok(ok(json!({ "config": config })).into_response())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let mut config = WebhookConfig::new(&id, &req.url, generate_secret());
            config.enabled = req.enabled;
            config.events = events;
            config.ignore_groups = req.ignore_groups;
            config.ignore_broadcasts = req.ignore_broadcasts;
            config.ignore_channels = req.ignore_channels;
            state.webhooks.create(&config).await?;
            let secret = config.secret.clone();
            Ok((
                StatusCode::CREATED,
                ok(json!({ "config": config, "secret": secret })),
            )
                .into_response())
        }
        Err(e) => Err(e.into()),
    }
}

/// POST /api/sessions/:id/webhook/secret: regenerate, returned once.
async fn rotate_webhook_secret(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(
        &state,
        &headers,
        Some(&addr),
        "/api/sessions/:id/webhook/secret",
        "POST",
        ApiKeyRole::Admin,
    )
    .await?;
    let mut config = state.webhooks.get_by_session(&id).await?;
    config.secret = generate_secret();
    config.updated_at = chrono::Utc::now();
    state.webhooks.update(&config).await?;
    Ok(ok(json!({ "secret": config.secret })))
}

async fn get_metrics(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(
        &state,
        &headers,
        Some(&addr),
        "/api/metrics",
        "GET",
        ApiKeyRole::Admin,
    )
    .await?;
    Ok(ok(state.metrics.snapshot()))
}

async fn health_check() -> impl IntoResponse {
    ok(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

/// 503 when any registered component reports unhealthy.
async fn readiness(State(state): State<AppState>) -> Response {
    let (healthy, components) = state.health.status().await;
    if healthy {
        ok(json!({ "status": "ready", "components": components })).into_response()
    } else {
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            "one or more components are unhealthy",
        )
        .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;
    use tower::ServiceExt;
    use wagate_core::audit::RepoAuditSink;
    use wagate_core::client::{
        ChatInfo, ClientEventHandler, Contact, PhoneCheckResult, QrEvent, UserProfile,
    };
    use wagate_core::config::{CircuitBreakerConfig, RateLimitConfig};
    use wagate_core::error::Result as CoreResult;
    use wagate_core::event::Event;
    use wagate_core::repos::EventRepository;
    use wagate_core::types::Message;
    use wagate_dispatch::DispatchConfig;
    use wagate_events::{HubConfig, WebhookPublisher};
    use wagate_persistence::MemoryStores;
    use crate::health::NamedCheck;

    struct StubClient {
        connected: AtomicBool,
        fail_sends: bool,
    }

    impl StubClient {
        fn new() -> Self {
            Self {
                connected: AtomicBool::new(true),
                fail_sends: false,
            }
        }

        fn failing() -> Self {
            Self {
                connected: AtomicBool::new(true),
                fail_sends: true,
            }
        }

        fn disconnected() -> Self {
            Self {
                connected: AtomicBool::new(false),
                fail_sends: false,
            }
        }
    }

    #[async_trait]
    impl WhatsAppClient for StubClient {
        async fn connect(&self, _session_id: &str) -> CoreResult<()> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self, _session_id: &str) -> CoreResult<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn send_message(&self, _message: &Message) -> CoreResult<()> {
            if self.fail_sends {
                Err(Error::new(ErrorKind::ConnectionFailed, "peer unreachable"))
            } else {
                Ok(())
            }
        }

        async fn send_reaction(
            &self,
            _session_id: &str,
            _chat_jid: &Jid,
            _message_id: &str,
            _emoji: &str,
        ) -> CoreResult<()> {
            Ok(())
        }

        async fn send_read_receipt(
            &self,
            _session_id: &str,
            _chat_jid: &Jid,
            _message_ids: &[String],
        ) -> CoreResult<()> {
            Ok(())
        }

        async fn send_presence(
            &self,
            _session_id: &str,
            _chat_jid: &Jid,
            _state: PresenceState,
        ) -> CoreResult<()> {
            Ok(())
        }

        async fn qr_channel(&self, _session_id: &str) -> CoreResult<mpsc::Receiver<QrEvent>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        fn register_event_handler(&self, _handler: Arc<dyn ClientEventHandler>) {}

        fn is_connected(&self, _session_id: &str) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn session_jid(&self, _session_id: &str) -> Option<Jid> {
            Some(Jid::parse("gw@s.whatsapp.net").unwrap())
        }

        fn set_session_jid(&self, _session_id: &str, _jid: Jid) {}

        async fn check_phone_number(
            &self,
            _session_id: &str,
            phones: &[PhoneNumber],
        ) -> CoreResult<Vec<PhoneCheckResult>> {
            Ok(phones
                .iter()
                .map(|p| PhoneCheckResult {
                    phone: p.as_str().to_string(),
                    on_whatsapp: true,
                    jid: Some(Jid::from_phone(p)),
                })
                .collect())
        }

        async fn user_profile(&self, _session_id: &str, _jid: &Jid) -> CoreResult<UserProfile> {
            Err(Error::not_found("profile", "x"))
        }

        async fn list_contacts(&self, _session_id: &str) -> CoreResult<Vec<Contact>> {
            Ok(vec![Contact {
                jid: Jid::parse("42@s.whatsapp.net").unwrap(),
                name: "Answer".into(),
                notify: None,
            }])
        }

        async fn list_chats(&self, _session_id: &str) -> CoreResult<Vec<ChatInfo>> {
            Ok(Vec::new())
        }
    }

    struct TestCtx {
        app: Router,
        stores: MemoryStores,
        admin_key: String,
        write_key: String,
        read_key: String,
        auth: Arc<AuthService>,
    }

    async fn build_ctx_with(client: Arc<dyn WhatsAppClient>, ratelimit: RateLimitConfig) -> TestCtx {
        let stores = MemoryStores::new();
        let metrics = MetricsStore::new();
        let audit: Arc<dyn wagate_core::audit::AuditSink> =
            Arc::new(RepoAuditSink::new(stores.audit.clone()));

        let auth = Arc::new(AuthService::new(stores.api_keys.clone(), audit.clone()));
        let hub = EventHub::new(
            HubConfig {
                api_key: "hub-key".into(),
                ..Default::default()
            },
            metrics.clone(),
        );
        let webhooks_pub =
            WebhookPublisher::new(stores.webhooks.clone(), audit.clone(), metrics.clone());
        let publisher = EventPublisher::new(
            stores.events.clone(),
            hub.clone(),
            webhooks_pub,
            metrics.clone(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            client.clone(),
            publisher.clone(),
            audit.clone(),
            metrics.clone(),
            DispatchConfig::default(),
            CircuitBreakerConfig {
                enabled: false,
                ..Default::default()
            },
        ));
        let interactions = Arc::new(InteractionService::new(
            client.clone(),
            publisher.clone(),
            stores.receipts.clone(),
            stores.reactions.clone(),
            stores.presence.clone(),
        ));
        let manager = SessionManager::new(
            stores.sessions.clone(),
            client.clone(),
            publisher.clone(),
            std::time::Duration::from_secs(5),
        );
        let health = Arc::new(
            HealthRegistry::new().register(NamedCheck::new("self", || Box::pin(async { true }))),
        );
        let state = AppState {
            manager,
            dispatcher,
            interactions,
            auth: auth.clone(),
            event_log: Arc::new(EventLogService::new(stores.events.clone())),
            publisher,
            hub,
            client,
            webhooks: stores.webhooks.clone(),
            metrics,
            health,
            limiter: RequestRateLimiter::new(ratelimit),
            api_key_header: "X-API-Key".into(),
        };

        let admin_key = auth
            .create_key(ApiKeyRole::Admin, None, "bootstrap")
            .await
            .unwrap()
            .plaintext;
        let write_key = auth
            .create_key(ApiKeyRole::Write, None, "bootstrap")
            .await
            .unwrap()
            .plaintext;
        let read_key = auth
            .create_key(ApiKeyRole::Read, None, "bootstrap")
            .await
            .unwrap()
            .plaintext;

        TestCtx {
            app: router(state),
            stores,
            admin_key,
            write_key,
            read_key,
            auth,
        }
    }

    async fn build_ctx() -> TestCtx {
        build_ctx_with(
            Arc::new(StubClient::new()),
            RateLimitConfig {
                enabled: false,
                ..Default::default()
            },
        )
        .await
    }

    async fn call(
        app: &Router,
        method: &str,
        path: &str,
        key: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value, HeaderMap) {
        let mut builder = HttpRequest::builder().method(method).uri(path);
        if let Some(key) = key {
            builder = builder.header("X-API-Key", key);
        }
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let mut request = builder.body(body).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value, headers)
    }

    fn send_body() -> Value {
        json!({
            "session_id": "550e8400-e29b-41d4-a716-446655440000",
            "to": "+1234567890",
            "type": "text",
            "content": { "text": "hi" }
        })
    }

    #[tokio::test]
    async fn health_and_ready_need_no_auth() {
        let ctx = build_ctx().await;
        let (status, body, _) = call(&ctx.app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "ok");

        let (status, body, _) = call(&ctx.app, "GET", "/ready", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "ready");
    }

    #[tokio::test]
    async fn readiness_reports_503_when_unhealthy() {
        let mut ctx = build_ctx().await;
        // Rebuild with a failing component.
        let stores = MemoryStores::new();
        let metrics = MetricsStore::new();
        let audit: Arc<dyn wagate_core::audit::AuditSink> =
            Arc::new(RepoAuditSink::new(stores.audit.clone()));
        let client: Arc<dyn WhatsAppClient> = Arc::new(StubClient::new());
        let auth = Arc::new(AuthService::new(stores.api_keys.clone(), audit.clone()));
        let hub = EventHub::new(HubConfig::default(), metrics.clone());
        let webhooks_pub =
            WebhookPublisher::new(stores.webhooks.clone(), audit.clone(), metrics.clone());
        let publisher = EventPublisher::new(
            stores.events.clone(),
            hub.clone(),
            webhooks_pub,
            metrics.clone(),
        );
        let state = AppState {
            manager: SessionManager::new(
                stores.sessions.clone(),
                client.clone(),
                publisher.clone(),
                std::time::Duration::from_secs(5),
            ),
            dispatcher: Arc::new(Dispatcher::new(
                client.clone(),
                publisher.clone(),
                audit.clone(),
                metrics.clone(),
                DispatchConfig::default(),
                CircuitBreakerConfig::default(),
            )),
            interactions: Arc::new(InteractionService::new(
                client.clone(),
                publisher.clone(),
                stores.receipts.clone(),
                stores.reactions.clone(),
                stores.presence.clone(),
            )),
            auth,
            event_log: Arc::new(EventLogService::new(stores.events.clone())),
            publisher,
            hub,
            client,
            webhooks: stores.webhooks.clone(),
            metrics,
            health: Arc::new(HealthRegistry::new().register(NamedCheck::new(
                "database",
                || Box::pin(async { false }),
            ))),
            limiter: RequestRateLimiter::new(RateLimitConfig {
                enabled: false,
                ..Default::default()
            }),
            api_key_header: "X-API-Key".into(),
        };
        ctx.app = router(state);

        let (status, body, _) = call(&ctx.app, "GET", "/ready", None, None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn missing_and_invalid_keys_are_401() {
        let ctx = build_ctx().await;
        let (status, body, _) = call(&ctx.app, "GET", "/api/sessions", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "MISSING_API_KEY");
        assert_eq!(body["success"], false);

        let (status, body, _) =
            call(&ctx.app, "GET", "/api/sessions", Some("garbage"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "INVALID_API_KEY");
    }

    #[tokio::test]
    async fn revoked_key_is_rejected_on_every_protected_route() {
        let ctx = build_ctx().await;
        let created = ctx
            .auth
            .create_key(ApiKeyRole::Admin, None, "bootstrap")
            .await
            .unwrap();
        ctx.auth
            .revoke_key(&created.key.id, "bootstrap", Some("test".into()))
            .await
            .unwrap();

        // Bodies are well-formed so the auth check, not body parsing, is
        // what each route exercises.
        let matrix = [
            ("GET", "/api/sessions", None),
            ("GET", "/api/events", None),
            ("GET", "/api/apikeys", None),
            ("GET", "/api/metrics", None),
            ("POST", "/api/messages", Some(send_body())),
            (
                "POST",
                "/api/events/replay",
                Some(json!({ "session_id": "s1" })),
            ),
        ];
        for (method, path, body) in matrix {
            let (status, response, _) =
                call(&ctx.app, method, path, Some(&created.plaintext), body).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{} {}", method, path);
            assert_eq!(
                response["error"]["code"], "REVOKED_API_KEY",
                "{} {}",
                method, path
            );
        }
    }

    #[tokio::test]
    async fn bearer_token_works_too() {
        let ctx = build_ctx().await;
        let mut builder = HttpRequest::builder().method("GET").uri("/api/sessions");
        builder = builder.header("authorization", format!("Bearer {}", ctx.read_key));
        let mut request = builder.body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));
        let response = ctx.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn role_gates_are_strict() {
        let ctx = build_ctx().await;
        let (status, body, _) = call(
            &ctx.app,
            "POST",
            "/api/messages",
            Some(&ctx.read_key),
            Some(send_body()),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "FORBIDDEN");

        let (status, body, _) = call(
            &ctx.app,
            "POST",
            "/api/events/replay",
            Some(&ctx.write_key),
            Some(json!({ "session_id": "s1" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "FORBIDDEN");
    }

    #[tokio::test]
    async fn async_send_returns_202_pending() {
        let ctx = build_ctx().await;
        let (status, body, _) = call(
            &ctx.app,
            "POST",
            "/api/messages",
            Some(&ctx.write_key),
            Some(send_body()),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["status"], "pending");
        assert!(body["data"]["message_id"].as_str().is_some());
    }

    #[tokio::test]
    async fn sync_send_returns_terminal_sent() {
        let ctx = build_ctx().await;
        let (status, body, _) = call(
            &ctx.app,
            "POST",
            "/api/messages?sync=true",
            Some(&ctx.write_key),
            Some(send_body()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "sent");
    }

    #[tokio::test(start_paused = true)]
    async fn sync_send_with_broken_client_returns_failed() {
        let ctx = build_ctx_with(
            Arc::new(StubClient::failing()),
            RateLimitConfig {
                enabled: false,
                ..Default::default()
            },
        )
        .await;
        let (status, body, _) = call(
            &ctx.app,
            "POST",
            "/api/messages?sync=true",
            Some(&ctx.write_key),
            Some(send_body()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "failed");
        assert!(body["data"]["error"].as_str().is_some());
    }

    #[tokio::test]
    async fn invalid_phone_maps_to_400() {
        let ctx = build_ctx().await;
        let mut body = send_body();
        body["to"] = json!("12345");
        let (status, response, _) = call(
            &ctx.app,
            "POST",
            "/api/messages",
            Some(&ctx.write_key),
            Some(body),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response["error"]["code"], "INVALID_PHONE_NUMBER");
    }

    #[tokio::test]
    async fn unparseable_body_maps_to_invalid_json() {
        let ctx = build_ctx().await;
        let builder = HttpRequest::builder()
            .method("POST")
            .uri("/api/messages")
            .header("X-API-Key", &ctx.write_key)
            .header("content-type", "application/json");
        let mut request = builder.body(Body::from("{not json")).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));
        let response = ctx.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["error"]["code"], "INVALID_JSON");
    }

    #[tokio::test]
    async fn session_lifecycle_via_internal_api() {
        let ctx = build_ctx().await;
        let (status, body, _) = call(
            &ctx.app,
            "POST",
            "/api/internal/sessions/register",
            Some(&ctx.admin_key),
            Some(json!({ "session_id": "s1", "name": "primary" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["status"], "pending");

        // duplicate registration conflicts
        let (status, body, _) = call(
            &ctx.app,
            "POST",
            "/api/internal/sessions/register",
            Some(&ctx.admin_key),
            Some(json!({ "session_id": "s1", "name": "primary" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "ALREADY_EXISTS");

        let (status, body, _) = call(
            &ctx.app,
            "POST",
            "/api/internal/sessions/s1/status",
            Some(&ctx.admin_key),
            Some(json!({ "status": "connected", "jid": "111:9@s.whatsapp.net" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "connected");
        // device suffix was normalized away
        assert_eq!(body["data"]["jid"], "111@s.whatsapp.net");

        let (status, body, _) = call(
            &ctx.app,
            "POST",
            "/api/internal/sessions/s1/reconnect",
            Some(&ctx.admin_key),
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "connected");

        let (status, body, _) =
            call(&ctx.app, "GET", "/api/sessions", Some(&ctx.read_key), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["sessions"].as_array().unwrap().len(), 1);

        let (status, _, _) = call(
            &ctx.app,
            "DELETE",
            "/api/internal/sessions/s1",
            Some(&ctx.admin_key),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body, _) = call(
            &ctx.app,
            "GET",
            "/api/sessions/s1",
            Some(&ctx.read_key),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn events_listing_and_bounded_replay() {
        let ctx = build_ctx().await;
        for i in 0..150 {
            ctx.stores
                .events
                .create(&Event::new(
                    EventType::MessageReceived,
                    "s1",
                    &json!({ "n": i }),
                ))
                .await
                .unwrap();
        }

        let (status, body, _) = call(
            &ctx.app,
            "GET",
            "/api/events?session_id=s1&limit=10",
            Some(&ctx.read_key),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["events"].as_array().unwrap().len(), 10);
        assert_eq!(body["data"]["total"], 150);

        let (status, body, _) = call(
            &ctx.app,
            "POST",
            "/api/events/replay",
            Some(&ctx.admin_key),
            Some(json!({ "session_id": "s1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["found"], 150);
        assert_eq!(body["data"]["replayed"], 150);
        assert_eq!(body["data"]["failed"], 0);

        // replayed events were not fed back into the log
        let (_, body, _) = call(
            &ctx.app,
            "GET",
            "/api/events?session_id=s1&limit=1",
            Some(&ctx.read_key),
            None,
        )
        .await;
        assert_eq!(body["data"]["total"], 150);

        // unscoped replay is refused
        let (status, body, _) = call(
            &ctx.app,
            "POST",
            "/api/events/replay",
            Some(&ctx.admin_key),
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn api_key_lifecycle_over_http() {
        let ctx = build_ctx().await;
        let (status, body, _) = call(
            &ctx.app,
            "POST",
            "/api/apikeys",
            Some(&ctx.admin_key),
            Some(json!({ "role": "write", "description": "ci" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let plaintext = body["data"]["api_key"].as_str().unwrap().to_string();
        let id = body["data"]["id"].as_str().unwrap().to_string();
        assert_eq!(plaintext.len(), 43);
        assert_eq!(
            body["data"]["masked"].as_str().unwrap(),
            mask_key(&plaintext)
        );

        // the new key authenticates
        let (status, _, _) =
            call(&ctx.app, "GET", "/api/sessions", Some(&plaintext), None).await;
        assert_eq!(status, StatusCode::OK);

        // list never exposes hashes or plaintext
        let (_, body, _) = call(&ctx.app, "GET", "/api/apikeys", Some(&ctx.admin_key), None).await;
        let listed = body["data"]["api_keys"].to_string();
        assert!(!listed.contains(&plaintext));
        assert!(!listed.contains("key_hash"));

        let (status, _, _) = call(
            &ctx.app,
            "POST",
            &format!("/api/apikeys/{}/revoke", id),
            Some(&ctx.admin_key),
            Some(json!({ "reason": "rotation" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body, _) =
            call(&ctx.app, "GET", "/api/sessions", Some(&plaintext), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "REVOKED_API_KEY");

        // unknown role is a validation error
        let (status, body, _) = call(
            &ctx.app,
            "POST",
            "/api/apikeys",
            Some(&ctx.admin_key),
            Some(json!({ "role": "root" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn webhook_config_endpoints() {
        let ctx = build_ctx().await;
        let (status, body, _) = call(
            &ctx.app,
            "PUT",
            "/api/sessions/s1/webhook",
            Some(&ctx.admin_key),
            Some(json!({ "url": "https://hooks.example/wa", "events": ["message.received"] })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let secret = body["data"]["secret"].as_str().unwrap();
        assert_eq!(secret.len(), 64);

        // reads never leak the secret
        let (status, body, _) = call(
            &ctx.app,
            "GET",
            "/api/sessions/s1/webhook",
            Some(&ctx.admin_key),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body.to_string().contains(secret));
        assert_eq!(body["data"]["events"][0], "message.received");

        // rotation returns a fresh secret
        let (status, body, _) = call(
            &ctx.app,
            "POST",
            "/api/sessions/s1/webhook/secret",
            Some(&ctx.admin_key),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_ne!(body["data"]["secret"].as_str().unwrap(), secret);

        // unknown event type names are rejected
        let (status, body, _) = call(
            &ctx.app,
            "PUT",
            "/api/sessions/s1/webhook",
            Some(&ctx.admin_key),
            Some(json!({ "url": "https://hooks.example/wa", "events": ["nope"] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn interactions_and_contacts() {
        let ctx = build_ctx().await;
        let (status, body, _) = call(
            &ctx.app,
            "POST",
            "/api/messages/m1/reactions",
            Some(&ctx.write_key),
            Some(json!({ "session_id": "s1", "chat_jid": "77@s.whatsapp.net", "emoji": "👍" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["emoji"], "👍");

        let (status, _, _) = call(
            &ctx.app,
            "POST",
            "/api/messages/receipts",
            Some(&ctx.write_key),
            Some(json!({ "session_id": "s1", "chat_jid": "77@s.whatsapp.net", "message_ids": ["m1", "m2"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body, _) = call(
            &ctx.app,
            "POST",
            "/api/presence",
            Some(&ctx.write_key),
            Some(json!({ "session_id": "s1", "chat_jid": "77@s.whatsapp.net", "state": "typing" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["state"], "typing");

        let (status, body, _) = call(
            &ctx.app,
            "GET",
            "/api/contacts/check?session_id=s1&phones=%2B1234567890",
            Some(&ctx.read_key),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["results"][0]["on_whatsapp"], true);

        let (status, body, _) = call(
            &ctx.app,
            "GET",
            "/api/sessions/s1/contacts",
            Some(&ctx.read_key),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["contacts"][0]["name"], "Answer");
    }

    #[tokio::test]
    async fn disconnected_session_fails_contact_check() {
        let ctx = build_ctx_with(
            Arc::new(StubClient::disconnected()),
            RateLimitConfig {
                enabled: false,
                ..Default::default()
            },
        )
        .await;
        let (status, body, _) = call(
            &ctx.app,
            "GET",
            "/api/contacts/check?session_id=s1&phones=%2B1234567890",
            Some(&ctx.read_key),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "DISCONNECTED");
    }

    #[tokio::test]
    async fn rate_limited_requests_get_429_with_headers() {
        let ctx = build_ctx_with(
            Arc::new(StubClient::new()),
            RateLimitConfig {
                enabled: true,
                requests_per_second: 1.0,
                burst_size: 2,
                by_ip: true,
                by_api_key: false,
                cleanup_interval_secs: 60,
                max_age_secs: 3600,
            },
        )
        .await;

        for _ in 0..2 {
            let (status, _, _) =
                call(&ctx.app, "GET", "/api/sessions", Some(&ctx.read_key), None).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body, headers) =
            call(&ctx.app, "GET", "/api/sessions", Some(&ctx.read_key), None).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");
        assert!(headers.contains_key("Retry-After"));
        assert!(headers.contains_key("X-RateLimit-Limit"));
        assert!(headers.contains_key("X-RateLimit-Remaining"));

        // health stays exempt
        let (status, _, _) = call(&ctx.app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_require_admin() {
        let ctx = build_ctx().await;
        let (status, _, _) = call(&ctx.app, "GET", "/api/metrics", Some(&ctx.read_key), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body, _) =
            call(&ctx.app, "GET", "/api/metrics", Some(&ctx.admin_key), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["uptime_secs"].is_number());
    }
}
