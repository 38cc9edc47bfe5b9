pub mod breaker;
pub mod interactions;
pub mod ratelimit;

use async_trait::async_trait;
use breaker::CircuitBreaker;
use ratelimit::RateLimiter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use wagate_core::audit::{AuditKind, AuditRecord, AuditSink, MessageSentEvent};
use wagate_core::client::{InboundHandler, MediaUploader, WhatsAppClient};
use wagate_core::config::CircuitBreakerConfig;
use wagate_core::error::{Error, ErrorKind, Result};
use wagate_core::event::{Event, EventSink, EventType, MessageStatusPayload};
use wagate_core::jid::PhoneNumber;
use wagate_core::metrics::MetricsStore;
use wagate_core::types::{Message, MessageContent, MessageStatus, MessageType};

pub use interactions::InteractionService;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_retries: u32,
    pub rate_limit_per_second: u32,
    pub queue_size: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            rate_limit_per_second: 10,
            queue_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendMode {
    #[default]
    Async,
    Sync,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageRequest {
    pub session_id: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub content: MessageContent,
}

/// What the caller gets back: the message id plus the status the pipeline
/// reached before returning (pending for async, terminal for sync).
#[derive(Debug, Clone, Serialize)]
pub struct MessageRef {
    pub message_id: String,
    pub status: MessageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Serializes status mutations on one in-flight message so a read during
/// JSON serialization never observes a torn update.
struct StatusCell(StdMutex<MessageStatus>);

impl StatusCell {
    fn new() -> Arc<Self> {
        Arc::new(Self(StdMutex::new(MessageStatus::Pending)))
    }

    fn get(&self) -> MessageStatus {
        *self.0.lock().unwrap()
    }

    /// Applies the transition only if it is monotonic. Returns whether the
    /// status changed.
    fn advance(&self, next: MessageStatus) -> bool {
        let mut status = self.0.lock().unwrap();
        if status.can_transition_to(next) {
            *status = next;
            true
        } else {
            false
        }
    }
}

struct QueuedSend {
    message: Message,
    cell: Arc<StatusCell>,
}

struct Inner {
    client: Arc<dyn WhatsAppClient>,
    uploader: Option<Arc<dyn MediaUploader>>,
    sink: Arc<dyn EventSink>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<MetricsStore>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    inflight: StdMutex<HashMap<String, Arc<StatusCell>>>,
    queue_depth: AtomicUsize,
    max_retries: u32,
}

/// The outbound pipeline: validate → construct → enqueue (or inline for
/// sync) → rate limit → send with retry. One background worker drains the
/// queue; the queue bound is the only backpressure surface.
pub struct Dispatcher {
    inner: Arc<Inner>,
    queue_tx: StdMutex<Option<mpsc::Sender<QueuedSend>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        client: Arc<dyn WhatsAppClient>,
        sink: Arc<dyn EventSink>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<MetricsStore>,
        config: DispatchConfig,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        Self::with_uploader(client, None, sink, audit, metrics, config, breaker_config)
    }

    pub fn with_uploader(
        client: Arc<dyn WhatsAppClient>,
        uploader: Option<Arc<dyn MediaUploader>>,
        sink: Arc<dyn EventSink>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<MetricsStore>,
        config: DispatchConfig,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<QueuedSend>(config.queue_size.max(1));
        let inner = Arc::new(Inner {
            client,
            uploader,
            sink,
            audit,
            metrics,
            limiter: RateLimiter::new(config.rate_limit_per_second),
            breaker: CircuitBreaker::new(breaker_config),
            inflight: StdMutex::new(HashMap::new()),
            queue_depth: AtomicUsize::new(0),
            max_retries: config.max_retries.max(1),
        });

        let worker_inner = inner.clone();
        let worker = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                worker_inner.queue_depth.fetch_sub(1, Ordering::Relaxed);
                worker_inner.limiter.acquire().await;
                let (status, error) = worker_inner.send_with_retry(item.message, &item.cell).await;
                if status == MessageStatus::Failed {
                    debug!(error = error.as_deref().unwrap_or(""), "async send failed");
                }
            }
            info!("dispatch worker drained and stopped");
        });

        Self {
            inner,
            queue_tx: StdMutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Entry point for both response modes.
    pub async fn send_message(&self, req: SendMessageRequest, mode: SendMode) -> Result<MessageRef> {
        let phone = PhoneNumber::new(&req.to)?;
        req.content.validate_for(req.kind)?;
        if req.kind.is_media() && self.inner.uploader.is_none() {
            return Err(Error::validation(
                "no media uploader configured for media messages",
            ));
        }

        let mut message = Message::outbound(&req.session_id, phone.as_str(), req.kind, req.content);
        if let Some(jid) = self.inner.client.session_jid(&req.session_id) {
            message.from = jid.as_str().to_string();
        }

        let cell = StatusCell::new();
        self.inner
            .inflight
            .lock()
            .unwrap()
            .insert(message.id.clone(), cell.clone());

        match mode {
            SendMode::Async => {
                let message_id = message.id.clone();
                let tx = self.queue_tx.lock().unwrap().clone();
                let Some(tx) = tx else {
                    self.inner.forget(&message_id);
                    return Err(Error::new(ErrorKind::QueueFull, "dispatch is shut down"));
                };
                match tx.try_send(QueuedSend { message, cell }) {
                    Ok(()) => {
                        self.inner.queue_depth.fetch_add(1, Ordering::Relaxed);
                        Ok(MessageRef {
                            message_id,
                            status: MessageStatus::Pending,
                            error: None,
                        })
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Dropped before reaching in-flight state: no
                        // message.failed event is published for this id.
                        self.inner.forget(&message_id);
                        Err(Error::new(ErrorKind::QueueFull, "message queue is full"))
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        self.inner.forget(&message_id);
                        Err(Error::new(ErrorKind::QueueFull, "dispatch is shut down"))
                    }
                }
            }
            SendMode::Sync => {
                let message_id = message.id.clone();
                self.inner.limiter.acquire().await;
                let (status, error) = self.inner.send_with_retry(message, &cell).await;
                Ok(MessageRef {
                    message_id,
                    status,
                    error,
                })
            }
        }
    }

    pub fn queue_size(&self) -> usize {
        self.inner.queue_depth.load(Ordering::Relaxed)
    }

    /// Observed status of an in-flight message, if the pipeline still owns it.
    pub fn status_of(&self, message_id: &str) -> Option<MessageStatus> {
        self.inner
            .inflight
            .lock()
            .unwrap()
            .get(message_id)
            .map(|cell| cell.get())
    }

    /// Stop accepting sends and drain what is already queued, up to the
    /// deadline. The worker is aborted if the drain overruns.
    pub async fn close(&self, deadline: Duration) {
        let tx = self.queue_tx.lock().unwrap().take();
        drop(tx);
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if timeout(deadline, handle).await.is_err() {
                warn!("dispatch drain exceeded shutdown deadline, aborting worker");
                abort.abort();
            }
        }
    }
}

impl Inner {
    fn forget(&self, message_id: &str) {
        self.inflight.lock().unwrap().remove(message_id);
    }

    async fn send_with_retry(
        &self,
        mut message: Message,
        cell: &Arc<StatusCell>,
    ) -> (MessageStatus, Option<String>) {
        if message.kind.is_media() {
            match &self.uploader {
                Some(uploader) => {
                    let url = message.content.media_url.clone().unwrap_or_default();
                    match uploader.upload(&message.session_id, &url, message.kind).await {
                        Ok(handle) => message.content.media_url = Some(handle),
                        Err(e) => {
                            let reason = format!("media upload failed: {}", e.message());
                            self.mark_failed(&message, cell, &reason).await;
                            return (MessageStatus::Failed, Some(reason));
                        }
                    }
                }
                None => {
                    let reason = "no media uploader configured".to_string();
                    self.mark_failed(&message, cell, &reason).await;
                    return (MessageStatus::Failed, Some(reason));
                }
            }
        }

        let mut delay = Duration::from_secs(1);
        let mut last_error = String::new();
        for attempt in 1..=self.max_retries {
            if !self.breaker.allow() {
                last_error = "circuit breaker open".to_string();
                break;
            }
            match self.client.send_message(&message).await {
                Ok(()) => {
                    self.breaker.on_success();
                    self.mark_sent(&message, cell, attempt).await;
                    return (MessageStatus::Sent, None);
                }
                Err(e) => {
                    self.breaker.on_failure();
                    warn!(
                        message_id = %message.id,
                        session_id = %message.session_id,
                        attempt,
                        error = %e,
                        "send attempt failed"
                    );
                    last_error = e.message().to_string();
                }
            }
            if attempt < self.max_retries {
                sleep(delay).await;
                delay *= 2;
            }
        }

        self.mark_failed(&message, cell, &last_error).await;
        (MessageStatus::Failed, Some(last_error))
    }

    async fn mark_sent(&self, message: &Message, cell: &Arc<StatusCell>, attempt: u32) {
        cell.advance(MessageStatus::Sent);
        self.metrics.inc_messages_sent();
        info!(
            message_id = %message.id,
            session_id = %message.session_id,
            attempt,
            "message sent"
        );
        self.sink
            .publish(Event::new(
                EventType::MessageSent,
                &message.session_id,
                &MessageStatusPayload {
                    message_id: message.id.clone(),
                    status: MessageStatus::Sent,
                    to: Some(message.to.clone()),
                    error: None,
                },
            ))
            .await;
        self.audit
            .record(
                AuditRecord::new(
                    AuditKind::MessageSent,
                    "dispatch",
                    &MessageSentEvent {
                        session_id: message.session_id.clone(),
                        recipient: message.to.clone(),
                        kind: format!("{:?}", message.kind).to_lowercase(),
                    },
                )
                .with_session(&message.session_id),
            )
            .await;
    }

    async fn mark_failed(&self, message: &Message, cell: &Arc<StatusCell>, reason: &str) {
        cell.advance(MessageStatus::Failed);
        self.forget(&message.id);
        self.metrics.inc_messages_failed();
        self.sink
            .publish(Event::new(
                EventType::MessageFailed,
                &message.session_id,
                &MessageStatusPayload {
                    message_id: message.id.clone(),
                    status: MessageStatus::Failed,
                    to: Some(message.to.clone()),
                    error: Some(reason.to_string()),
                },
            ))
            .await;
    }
}

#[async_trait]
impl InboundHandler for Dispatcher {
    /// Inbound messages are treated as delivered; no retry logic applies.
    async fn handle_incoming(&self, mut message: Message) {
        message.status = MessageStatus::Delivered;
        self.inner.metrics.inc_messages_received();
        self.inner
            .sink
            .publish(Event::new(
                EventType::MessageReceived,
                &message.session_id.clone(),
                &message,
            ))
            .await;
    }

    async fn handle_status_update(
        &self,
        session_id: &str,
        message_id: &str,
        status: MessageStatus,
    ) {
        let cell = self
            .inner
            .inflight
            .lock()
            .unwrap()
            .get(message_id)
            .cloned();
        if let Some(cell) = cell {
            if !cell.advance(status) {
                debug!(message_id, status = status.as_str(), "ignored non-monotonic status update");
                return;
            }
            if status.is_terminal() {
                self.inner.forget(message_id);
            }
        }
        // `pending` never crosses the fan-out boundary.
        if let Some(kind) = EventType::for_message_status(status) {
            self.inner
                .sink
                .publish(Event::new(
                    kind,
                    session_id,
                    &MessageStatusPayload {
                        message_id: message_id.to_string(),
                        status,
                        to: None,
                        error: None,
                    },
                ))
                .await;
        }
    }
}
