use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::{debug, warn};
use wagate_core::audit::{AuditKind, AuditRecord, AuditSink, WebhookDeliveryEvent};
use wagate_core::error::ErrorKind;
use wagate_core::event::Event;
use wagate_core::jid::Jid;
use wagate_core::metrics::MetricsStore;
use wagate_core::repos::WebhookConfigRepository;

const MAX_ATTEMPTS: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Chat-level JID carried in the event payload, used for the ignore-group /
/// ignore-broadcast / ignore-channel filters. Events without one pass.
pub fn chat_jid_of(event: &Event) -> Option<Jid> {
    for key in ["chat_jid", "from", "to"] {
        if let Some(raw) = event.data.get(key).and_then(|v| v.as_str()) {
            if let Ok(jid) = Jid::parse(raw) {
                return Some(jid);
            }
        }
    }
    None
}

fn sign_body(secret: &str, body: &[u8]) -> Option<String> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(
        mac.finalize()
            .into_bytes()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect(),
    )
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

enum AttemptOutcome {
    Success(u16),
    /// 4xx: the consumer rejected the payload; retrying cannot help.
    Terminal(u16),
    /// 5xx, network error, timeout.
    Retryable(Option<u16>, String),
}

/// Delivers events to per-session webhook endpoints: signed POST, at-least
/// once, bounded retries with 1s/2s backoff. Every attempt leaves an audit
/// record.
pub struct WebhookPublisher {
    configs: Arc<dyn WebhookConfigRepository>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<MetricsStore>,
    http: reqwest::Client,
    backoff_base: Duration,
}

impl WebhookPublisher {
    pub fn new(
        configs: Arc<dyn WebhookConfigRepository>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<MetricsStore>,
    ) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            configs,
            audit,
            metrics,
            http,
            backoff_base: Duration::from_secs(1),
        })
    }

    /// Shrinks the retry backoff; used by tests that exercise the retry
    /// policy against stub endpoints.
    pub fn with_backoff_base(mut self: Arc<Self>, base: Duration) -> Arc<Self> {
        if let Some(publisher) = Arc::get_mut(&mut self) {
            publisher.backoff_base = base;
        }
        self
    }

    /// Fire-and-forget: delivery runs in its own task so a slow endpoint
    /// never stalls the publishing caller.
    pub fn dispatch(self: &Arc<Self>, event: &Event) {
        let publisher = self.clone();
        let event = event.clone();
        tokio::spawn(async move {
            publisher.deliver(event).await;
        });
    }

    pub async fn deliver(&self, event: Event) {
        let config = match self.configs.get_by_session(&event.session_id).await {
            Ok(config) => config,
            Err(e) if e.kind() == ErrorKind::NotFound => return,
            Err(e) => {
                warn!(session_id = %event.session_id, error = %e, "webhook config lookup failed");
                return;
            }
        };

        if !config.should_deliver(event.kind) {
            return;
        }
        if !config.allows_chat(chat_jid_of(&event).as_ref()) {
            debug!(session_id = %event.session_id, "event filtered by chat ignore rules");
            return;
        }

        let body = match serde_json::to_vec(&event) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "event did not serialize for webhook delivery");
                return;
            }
        };
        let signature = if config.secret.is_empty() {
            None
        } else {
            sign_body(&config.secret, &body)
        };

        let mut delay = self.backoff_base;
        for attempt in 1..=MAX_ATTEMPTS {
            let outcome = self.attempt(&config.url, &body, signature.as_deref()).await;
            let (success, status_code, error) = match &outcome {
                AttemptOutcome::Success(code) => (true, Some(*code), None),
                AttemptOutcome::Terminal(code) => (false, Some(*code), None),
                AttemptOutcome::Retryable(code, message) => {
                    (false, *code, Some(message.clone()))
                }
            };

            let record = AuditRecord::new(
                AuditKind::WebhookDelivery,
                "webhook",
                &WebhookDeliveryEvent {
                    session_id: event.session_id.clone(),
                    url: config.url.clone(),
                    event_type: event.kind.as_str().to_string(),
                    attempt,
                    status_code,
                    success,
                    error,
                },
            )
            .with_session(&event.session_id);
            self.audit
                .record(if success { record } else { record.failed() })
                .await;

            match outcome {
                AttemptOutcome::Success(_) => {
                    self.metrics.inc_webhook_deliveries();
                    return;
                }
                AttemptOutcome::Terminal(code) => {
                    self.metrics.inc_webhook_failures();
                    warn!(
                        session_id = %event.session_id,
                        status = code,
                        "webhook rejected event, not retrying"
                    );
                    return;
                }
                AttemptOutcome::Retryable(_, message) => {
                    warn!(
                        session_id = %event.session_id,
                        attempt,
                        error = %message,
                        "webhook delivery attempt failed"
                    );
                    if attempt < MAX_ATTEMPTS {
                        sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        self.metrics.inc_webhook_failures();
    }

    async fn attempt(&self, url: &str, body: &[u8], signature: Option<&str>) -> AttemptOutcome {
        let mut request = self
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Timestamp", unix_now().to_string())
            .body(body.to_vec());
        if let Some(signature) = signature {
            request = request.header("X-Webhook-Signature", signature);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    AttemptOutcome::Success(status.as_u16())
                } else if status.is_client_error() {
                    AttemptOutcome::Terminal(status.as_u16())
                } else {
                    AttemptOutcome::Retryable(
                        Some(status.as_u16()),
                        format!("server responded {}", status),
                    )
                }
            }
            Err(e) => AttemptOutcome::Retryable(None, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use wagate_core::event::EventType;
    use wagate_core::repos::AuditRepository;
    use wagate_core::webhook::WebhookConfig;
    use wagate_persistence::memory::{MemoryAuditRepository, MemoryWebhookConfigRepository};
    use wagate_core::audit::RepoAuditSink;

    /// Minimal HTTP stub: answers each connection with the next scripted
    /// status code and counts hits.
    async fn stub_server(statuses: Vec<u16>) -> (String, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            let mut remaining = statuses.into_iter();
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let status = remaining.next().unwrap_or(200);
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let reason = match status {
                    200 => "OK",
                    400 => "Bad Request",
                    500 => "Internal Server Error",
                    _ => "Status",
                };
                let response = format!(
                    "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status, reason
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        (format!("http://{}", addr), hits)
    }

    async fn configured_publisher(
        url: &str,
        secret: &str,
    ) -> (Arc<WebhookPublisher>, Arc<MemoryAuditRepository>) {
        let configs = Arc::new(MemoryWebhookConfigRepository::new());
        configs
            .create(&WebhookConfig::new("s1", url, secret.to_string()))
            .await
            .unwrap();
        let audit_repo = Arc::new(MemoryAuditRepository::new());
        let publisher = WebhookPublisher::new(
            configs,
            Arc::new(RepoAuditSink::new(audit_repo.clone())),
            MetricsStore::new(),
        )
        .with_backoff_base(Duration::from_millis(10));
        (publisher, audit_repo)
    }

    fn received_event() -> Event {
        Event::new(
            EventType::MessageReceived,
            "s1",
            &serde_json::json!({ "from": "1234@s.whatsapp.net", "text": "hi" }),
        )
    }

    #[test]
    fn signature_matches_known_vector() {
        // HMAC-SHA256("secret", "body"), verifiable with any HMAC tool.
        assert_eq!(
            sign_body("secret", b"body").unwrap(),
            "dc46983557fea127b43af721467eb9b3fde2338fe3e14f51952aa8478c13d355"
        );
    }

    #[test]
    fn chat_jid_extraction() {
        let event = received_event();
        assert_eq!(
            chat_jid_of(&event).unwrap().as_str(),
            "1234@s.whatsapp.net"
        );
        let bare = Event::new(EventType::QrCode, "s1", &serde_json::json!({ "code": "x" }));
        assert!(chat_jid_of(&bare).is_none());
    }

    #[tokio::test]
    async fn delivers_once_on_success() {
        let (url, hits) = stub_server(vec![200]).await;
        let (publisher, audit) = configured_publisher(&url, "s3cret").await;
        publisher.deliver(received_event()).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let records = audit.list(10, 0).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].details["status_code"], 200);
    }

    #[tokio::test]
    async fn four_xx_is_terminal_one_post_only() {
        let (url, hits) = stub_server(vec![400, 200, 200]).await;
        let (publisher, audit) = configured_publisher(&url, "s3cret").await;
        publisher.deliver(received_event()).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let records = audit.list(10, 0).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert_eq!(records[0].details["status_code"], 400);
    }

    #[tokio::test]
    async fn five_xx_retries_up_to_three_posts() {
        let (url, hits) = stub_server(vec![500, 500, 500]).await;
        let (publisher, audit) = configured_publisher(&url, "s3cret").await;
        publisher.deliver(received_event()).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        let records = audit.list(10, 0).await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| !r.success));
    }

    #[tokio::test]
    async fn five_xx_then_success_stops_retrying() {
        let (url, hits) = stub_server(vec![500, 200]).await;
        let (publisher, _audit) = configured_publisher(&url, "s3cret").await;
        publisher.deliver(received_event()).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disabled_config_and_missing_config_deliver_nothing() {
        let (url, hits) = stub_server(vec![200]).await;

        // No config for the session at all.
        let configs = Arc::new(MemoryWebhookConfigRepository::new());
        let publisher = WebhookPublisher::new(
            configs.clone(),
            Arc::new(wagate_core::audit::NullAuditSink),
            MetricsStore::new(),
        );
        publisher.deliver(received_event()).await;

        // Disabled config.
        let mut config = WebhookConfig::new("s1", &url, String::new());
        config.enabled = false;
        configs.create(&config).await.unwrap();
        publisher.deliver(received_event()).await;

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn group_events_filtered_when_ignored() {
        let (url, hits) = stub_server(vec![200, 200]).await;
        let configs = Arc::new(MemoryWebhookConfigRepository::new());
        let mut config = WebhookConfig::new("s1", &url, String::new());
        config.ignore_groups = true;
        configs.create(&config).await.unwrap();
        let publisher = WebhookPublisher::new(
            configs,
            Arc::new(wagate_core::audit::NullAuditSink),
            MetricsStore::new(),
        );

        let group_event = Event::new(
            EventType::MessageReceived,
            "s1",
            &serde_json::json!({ "from": "team@g.us", "text": "hi" }),
        );
        publisher.deliver(group_event).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        publisher.deliver(received_event()).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
