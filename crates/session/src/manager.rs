use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use wagate_core::client::{QrEvent, QrEventKind, WhatsAppClient};
use wagate_core::error::{Error, ErrorKind, Result};
use wagate_core::event::{
    ConnectionFailedPayload, ConnectionPayload, Event, EventSink, EventType, QrCodePayload,
};
use wagate_core::jid::Jid;
use wagate_core::repos::SessionRepository;
use wagate_core::types::{Session, SessionStatus};

const QR_STREAM_BUFFER: usize = 16;

/// Owns every session's lifecycle. Transitions for one session are
/// serialized by a per-session lock; transitions across sessions run
/// concurrently.
pub struct SessionManager {
    repo: Arc<dyn SessionRepository>,
    client: Arc<dyn WhatsAppClient>,
    sink: Arc<dyn EventSink>,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    qr_active: Arc<StdMutex<HashSet<String>>>,
    qr_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        client: Arc<dyn WhatsAppClient>,
        sink: Arc<dyn EventSink>,
        qr_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo,
            client,
            sink,
            locks: StdMutex::new(HashMap::new()),
            qr_active: Arc::new(StdMutex::new(HashSet::new())),
            qr_timeout,
        })
    }

    fn session_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Not idempotent: a duplicate id fails with ALREADY_EXISTS.
    pub async fn register(&self, id: &str, name: &str) -> Result<Session> {
        if id.is_empty() {
            return Err(Error::validation("session id is required"));
        }
        let name = if name.is_empty() { id } else { name };
        let session = Session::new(id, name);
        self.repo.create(&session).await?;
        info!(session_id = %id, "session registered");
        self.sink
            .publish(Event::new(
                EventType::SessionCreated,
                id,
                &serde_json::json!({ "name": session.name }),
            ))
            .await;
        Ok(session)
    }

    /// Idempotent: absence is success. A connected session is disconnected
    /// first, best effort.
    pub async fn unregister(&self, id: &str) -> Result<()> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        let existing = match self.repo.get(id).await {
            Ok(session) => Some(session),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };

        if let Some(session) = &existing {
            if session.status == SessionStatus::Connected {
                if let Err(e) = self.client.disconnect(id).await {
                    warn!(session_id = %id, error = %e, "disconnect during unregister failed");
                }
            }
        }

        match self.repo.delete(id).await {
            Ok(()) => {
                self.sink
                    .publish(Event::new(
                        EventType::SessionRemoved,
                        id,
                        &serde_json::json!({}),
                    ))
                    .await;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        self.qr_active.lock().unwrap().remove(id);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Session> {
        self.repo.get(id).await
    }

    pub async fn list(&self) -> Result<Vec<Session>> {
        self.repo.list().await
    }

    /// Unknown ids are created lazily with the given status, which is what
    /// lets the control plane report sessions it learned about out-of-band.
    pub async fn update_status(
        &self,
        id: &str,
        status: SessionStatus,
        jid: Option<Jid>,
    ) -> Result<Session> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;
        self.apply_status(id, status, jid).await
    }

    /// Status write plus the corresponding `connection.*` event. Callers
    /// hold the per-session lock.
    async fn apply_status(
        &self,
        id: &str,
        status: SessionStatus,
        jid: Option<Jid>,
    ) -> Result<Session> {
        let (mut session, existed) = match self.repo.get(id).await {
            Ok(session) => (session, true),
            Err(e) if e.kind() == ErrorKind::NotFound => (Session::new(id, id), false),
            Err(e) => return Err(e),
        };

        if let Some(jid) = jid {
            session.jid = Some(jid);
        }
        if status == SessionStatus::Connected && session.jid.is_none() {
            session.jid = self.client.session_jid(id);
        }
        if status == SessionStatus::Connected && session.jid.is_none() {
            return Err(Error::validation(
                "connected status requires a session JID",
            ));
        }

        session.status = status;
        session.updated_at = Utc::now();
        if existed {
            self.repo.update(&session).await?;
        } else {
            self.repo.create(&session).await?;
        }

        if let Some(kind) = EventType::for_session_status(status) {
            self.sink
                .publish(Event::new(
                    kind,
                    id,
                    &ConnectionPayload {
                        status,
                        jid: session.jid.as_ref().map(|j| j.as_str().to_string()),
                    },
                ))
                .await;
        }
        Ok(session)
    }

    /// Reconnect with stored credentials. Calling this on an already
    /// connected session still emits `connection.connected`, so a control
    /// plane can force resynchronization.
    pub async fn reconnect(&self, id: &str, jid: Option<Jid>) -> Result<Session> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        let session = self.repo.get(id).await?;
        if let Some(jid) = &jid {
            self.client.set_session_jid(id, jid.clone());
        }

        if self.client.is_connected(id) {
            return self.apply_status(id, SessionStatus::Connected, jid).await;
        }

        self.apply_status(id, SessionStatus::Connecting, None).await?;

        match self.client.connect(id).await {
            Ok(()) => {
                let jid = jid
                    .or_else(|| self.client.session_jid(id))
                    .or(session.jid);
                match jid {
                    Some(jid) => self.apply_status(id, SessionStatus::Connected, Some(jid)).await,
                    None => {
                        self.fail_connection(id, "CONNECTION_FAILED", "connected without a JID")
                            .await;
                        Err(Error::new(
                            ErrorKind::ConnectionFailed,
                            "client connected but reported no JID",
                        ))
                    }
                }
            }
            Err(e) => {
                self.fail_connection(id, e.code(), e.message()).await;
                Err(Error::new(ErrorKind::ConnectionFailed, "reconnect failed").with_source(e))
            }
        }
    }

    async fn fail_connection(&self, id: &str, error_code: &str, error_message: &str) {
        if let Err(e) = self.apply_status(id, SessionStatus::Disconnected, None).await {
            warn!(session_id = %id, error = %e, "status revert after failure did not persist");
        }
        self.sink
            .publish(Event::new(
                EventType::ConnectionFailed,
                id,
                &ConnectionFailedPayload {
                    error_code: error_code.to_string(),
                    error_message: error_message.to_string(),
                },
            ))
            .await;
    }

    pub async fn disconnect(&self, id: &str) -> Result<Session> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        if let Err(e) = self.client.disconnect(id).await {
            warn!(session_id = %id, error = %e, "client disconnect failed");
        }
        self.apply_status(id, SessionStatus::Disconnected, None).await
    }

    pub async fn configure_history_sync(
        &self,
        id: &str,
        enabled: bool,
        full: bool,
        since: Option<chrono::DateTime<Utc>>,
    ) -> Result<Session> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        let mut session = self.repo.get(id).await?;
        session.history_sync.enabled = enabled;
        session.history_sync.full = full;
        session.history_sync.since = since;
        session.updated_at = Utc::now();
        self.repo.update(&session).await?;
        Ok(session)
    }

    /// Begin QR pairing. The session is created lazily if missing, moves to
    /// `connecting`, and the returned stream yields zero or more `qr` frames
    /// followed by exactly one terminal frame. One active stream per session;
    /// a concurrent second attempt fails with ALREADY_IN_PROGRESS.
    pub async fn start_qr_auth(self: &Arc<Self>, id: &str) -> Result<mpsc::Receiver<QrEvent>> {
        {
            let mut active = self.qr_active.lock().unwrap();
            if !active.insert(id.to_string()) {
                return Err(Error::new(
                    ErrorKind::AlreadyInProgress,
                    "QR authentication already in progress",
                ));
            }
        }

        let result = self.start_qr_auth_inner(id).await;
        if result.is_err() {
            self.qr_active.lock().unwrap().remove(id);
        }
        result
    }

    async fn start_qr_auth_inner(self: &Arc<Self>, id: &str) -> Result<mpsc::Receiver<QrEvent>> {
        if let Err(e) = self.repo.get(id).await {
            if e.kind() == ErrorKind::NotFound {
                self.register(id, id).await?;
            } else {
                return Err(e);
            }
        }

        self.update_status(id, SessionStatus::Connecting, None).await?;

        let mut upstream = match self.client.qr_channel(id).await {
            Ok(rx) => rx,
            Err(e) => {
                let _ = self
                    .update_status(id, SessionStatus::Disconnected, None)
                    .await;
                return Err(
                    Error::new(ErrorKind::QrGenerationFailed, "QR stream unavailable")
                        .with_source(e),
                );
            }
        };

        let (tx, rx) = mpsc::channel(QR_STREAM_BUFFER);
        let manager = self.clone();
        let session_id = id.to_string();
        let qr_timeout = self.qr_timeout;

        tokio::spawn(async move {
            loop {
                let event = match timeout(qr_timeout, upstream.recv()).await {
                    Ok(Some(event)) => event,
                    Ok(None) => QrEvent::error("QR stream closed unexpectedly"),
                    Err(_) => QrEvent::timeout(),
                };
                let terminal = event.is_terminal();

                match event.kind {
                    QrEventKind::Qr => {
                        if let Some(code) = &event.data {
                            manager
                                .sink
                                .publish(Event::new(
                                    EventType::QrCode,
                                    &session_id,
                                    &QrCodePayload { code: code.clone() },
                                ))
                                .await;
                        }
                    }
                    QrEventKind::Authenticated => {
                        let jid = manager.client.session_jid(&session_id);
                        if let Err(e) = manager
                            .update_status(&session_id, SessionStatus::Connected, jid)
                            .await
                        {
                            warn!(session_id = %session_id, error = %e, "post-auth status update failed");
                        }
                    }
                    QrEventKind::Error | QrEventKind::Timeout => {
                        if let Err(e) = manager
                            .update_status(&session_id, SessionStatus::Disconnected, None)
                            .await
                        {
                            warn!(session_id = %session_id, error = %e, "post-QR status update failed");
                        }
                    }
                }

                if tx.send(event).await.is_err() {
                    debug!(session_id = %session_id, "QR stream consumer went away");
                    break;
                }
                if terminal {
                    break;
                }
            }
            manager.qr_active.lock().unwrap().remove(&session_id);
        });

        Ok(rx)
    }

    /// Whether a QR pairing stream is currently active for the session.
    pub fn qr_in_progress(&self, id: &str) -> bool {
        self.qr_active.lock().unwrap().contains(id)
    }
}
