use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wagate_core::event::Event;
use wagate_core::metrics::MetricsStore;

/// WebSocket close code sent on failed authentication.
pub const CLOSE_POLICY_VIOLATION: u16 = 4001;
/// Going-away close code used during shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;

const CLIENT_BUFFER: usize = 256;
const CONTROL_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Shared key WS clients must present. Empty means the hub accepts no
    /// client as authenticated.
    pub api_key: String,
    pub auth_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    /// Capacity of the broadcast intake; bursts past it are dropped
    /// globally (the event log retains the canonical record).
    pub queue_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            auth_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            queue_size: 256,
        }
    }
}

/// What the per-connection writer task pulls off its buffer.
#[derive(Debug, Clone)]
pub enum HubOutbound {
    Frame(Arc<str>),
    Close(u16, String),
}

enum Control {
    Register {
        reply: oneshot::Sender<(u64, mpsc::Receiver<HubOutbound>)>,
    },
    Authenticate {
        client_id: u64,
        api_key: String,
        reply: oneshot::Sender<bool>,
    },
    Unregister {
        client_id: u64,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
}

struct ClientEntry {
    tx: mpsc::Sender<HubOutbound>,
    authenticated: bool,
}

/// The authenticated broadcast hub. A single coordinator task owns the
/// client set; connection handlers talk to it exclusively over channels, so
/// no client task ever touches shared mutable state.
pub struct EventHub {
    control_tx: mpsc::Sender<Control>,
    broadcast_tx: mpsc::Sender<Arc<str>>,
    client_count: Arc<AtomicUsize>,
    authenticated_count: Arc<AtomicUsize>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<MetricsStore>,
    pub config: HubConfig,
}

impl EventHub {
    pub fn new(config: HubConfig, metrics: Arc<MetricsStore>) -> Arc<Self> {
        let (control_tx, mut control_rx) = mpsc::channel::<Control>(CONTROL_BUFFER);
        let (broadcast_tx, mut broadcast_rx) = mpsc::channel::<Arc<str>>(config.queue_size.max(1));
        let client_count = Arc::new(AtomicUsize::new(0));
        let authenticated_count = Arc::new(AtomicUsize::new(0));

        let hub_key = config.api_key.clone();
        let counts = (client_count.clone(), authenticated_count.clone());
        let drop_metrics = metrics.clone();
        let coordinator = tokio::spawn(async move {
            let mut clients: HashMap<u64, ClientEntry> = HashMap::new();
            let mut next_id: u64 = 0;
            let (client_count, authenticated_count) = counts;

            loop {
                tokio::select! {
                    command = control_rx.recv() => {
                        match command {
                            Some(Control::Register { reply }) => {
                                next_id += 1;
                                let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
                                if reply.send((next_id, rx)).is_ok() {
                                    clients.insert(next_id, ClientEntry { tx, authenticated: false });
                                    client_count.store(clients.len(), Ordering::Relaxed);
                                    debug!(client_id = next_id, "ws client registered");
                                }
                            }
                            Some(Control::Authenticate { client_id, api_key, reply }) => {
                                let Some(entry) = clients.get_mut(&client_id) else {
                                    let _ = reply.send(false);
                                    continue;
                                };
                                let success = !hub_key.is_empty() && api_key == hub_key;
                                let response = json!({ "type": "auth_response", "success": success });
                                let frame: Arc<str> = Arc::from(response.to_string());
                                let _ = entry.tx.try_send(HubOutbound::Frame(frame));
                                if success {
                                    entry.authenticated = true;
                                    authenticated_count.fetch_add(1, Ordering::Relaxed);
                                } else {
                                    let _ = entry.tx.try_send(HubOutbound::Close(
                                        CLOSE_POLICY_VIOLATION,
                                        "authentication failed".into(),
                                    ));
                                }
                                let _ = reply.send(success);
                            }
                            Some(Control::Unregister { client_id }) => {
                                if let Some(entry) = clients.remove(&client_id) {
                                    if entry.authenticated {
                                        authenticated_count.fetch_sub(1, Ordering::Relaxed);
                                    }
                                    client_count.store(clients.len(), Ordering::Relaxed);
                                    debug!(client_id, "ws client unregistered");
                                }
                            }
                            Some(Control::Stop { done }) => {
                                for (_, entry) in clients.drain() {
                                    let _ = entry.tx.try_send(HubOutbound::Close(
                                        CLOSE_GOING_AWAY,
                                        "server shutting down".into(),
                                    ));
                                }
                                client_count.store(0, Ordering::Relaxed);
                                authenticated_count.store(0, Ordering::Relaxed);
                                let _ = done.send(());
                                break;
                            }
                            None => break,
                        }
                    }
                    frame = broadcast_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let mut dead = Vec::new();
                        for (id, entry) in clients.iter() {
                            if !entry.authenticated {
                                continue;
                            }
                            match entry.tx.try_send(HubOutbound::Frame(frame.clone())) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    // Slow consumer: drop for this client only,
                                    // no head-of-line blocking.
                                    drop_metrics.inc_events_dropped();
                                    debug!(client_id = id, "ws client buffer full, frame dropped");
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => {
                                    dead.push(*id);
                                }
                            }
                        }
                        for id in dead {
                            if let Some(entry) = clients.remove(&id) {
                                if entry.authenticated {
                                    authenticated_count.fetch_sub(1, Ordering::Relaxed);
                                }
                            }
                        }
                        client_count.store(clients.len(), Ordering::Relaxed);
                    }
                }
            }
            info!("event hub coordinator stopped");
        });

        Arc::new(Self {
            control_tx,
            broadcast_tx,
            client_count,
            authenticated_count,
            coordinator: Mutex::new(Some(coordinator)),
            metrics,
            config,
        })
    }

    /// Add a connection; returns its id and the buffer the writer task
    /// drains into the socket.
    pub async fn register(&self) -> Option<(u64, mpsc::Receiver<HubOutbound>)> {
        let (reply, rx) = oneshot::channel();
        self.control_tx
            .send(Control::Register { reply })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Run the auth handshake for one client. The auth_response frame (and
    /// the close frame on failure) is pushed through the client's buffer.
    pub async fn authenticate(&self, client_id: u64, api_key: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .control_tx
            .send(Control::Authenticate {
                client_id,
                api_key: api_key.to_string(),
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn unregister(&self, client_id: u64) {
        let _ = self
            .control_tx
            .send(Control::Unregister { client_id })
            .await;
    }

    /// Marshal once, fan out to every authenticated client. A full intake
    /// queue drops the event globally; the event log keeps the record.
    pub fn broadcast(&self, event: &Event) -> bool {
        let frame: Arc<str> = match serde_json::to_string(event) {
            Ok(json) => Arc::from(json),
            Err(e) => {
                warn!(error = %e, "event did not serialize for broadcast");
                return false;
            }
        };
        match self.broadcast_tx.try_send(frame) {
            Ok(()) => true,
            Err(_) => {
                self.metrics.inc_events_dropped();
                warn!("hub broadcast queue full, event dropped");
                false
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::Relaxed)
    }

    pub fn authenticated_client_count(&self) -> usize {
        self.authenticated_count.load(Ordering::Relaxed)
    }

    /// Close every client (close frame included) and stop the coordinator.
    pub async fn stop(&self) {
        let (done, rx) = oneshot::channel();
        if self.control_tx.send(Control::Stop { done }).await.is_ok() {
            let _ = rx.await;
        }
        if let Some(handle) = self.coordinator.lock().await.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wagate_core::event::EventType;

    fn hub_with_key(key: &str) -> Arc<EventHub> {
        EventHub::new(
            HubConfig {
                api_key: key.into(),
                ..Default::default()
            },
            MetricsStore::new(),
        )
    }

    fn event() -> Event {
        Event::new(
            EventType::MessageReceived,
            "s1",
            &serde_json::json!({ "text": "hi" }),
        )
    }

    async fn drain_one(rx: &mut mpsc::Receiver<HubOutbound>) -> HubOutbound {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame within deadline")
            .expect("channel open")
    }

    #[tokio::test]
    async fn authenticated_client_receives_broadcasts() {
        let hub = hub_with_key("hub-secret");
        let (id, mut rx) = hub.register().await.unwrap();
        assert_eq!(hub.client_count(), 1);

        assert!(hub.authenticate(id, "hub-secret").await);
        let frame = drain_one(&mut rx).await;
        match frame {
            HubOutbound::Frame(json) => assert!(json.contains("\"success\":true")),
            other => panic!("expected auth_response, got {:?}", other),
        }
        assert_eq!(hub.authenticated_client_count(), 1);

        assert!(hub.broadcast(&event()));
        let frame = drain_one(&mut rx).await;
        match frame {
            HubOutbound::Frame(json) => assert!(json.contains("message.received")),
            other => panic!("expected event frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn wrong_key_gets_refusal_and_close_4001() {
        let hub = hub_with_key("hub-secret");
        let (id, mut rx) = hub.register().await.unwrap();
        assert!(!hub.authenticate(id, "wrong").await);

        match drain_one(&mut rx).await {
            HubOutbound::Frame(json) => assert!(json.contains("\"success\":false")),
            other => panic!("expected auth_response, got {:?}", other),
        }
        match drain_one(&mut rx).await {
            HubOutbound::Close(code, _) => assert_eq!(code, CLOSE_POLICY_VIOLATION),
            other => panic!("expected close, got {:?}", other),
        }
        assert_eq!(hub.authenticated_client_count(), 0);
    }

    #[tokio::test]
    async fn unauthenticated_clients_receive_nothing() {
        let hub = hub_with_key("hub-secret");
        let (_id, mut rx) = hub.register().await.unwrap();
        hub.broadcast(&event());
        // Allow the coordinator to process the broadcast.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_hub_key_rejects_everyone() {
        let hub = hub_with_key("");
        let (id, _rx) = hub.register().await.unwrap();
        assert!(!hub.authenticate(id, "").await);
    }

    #[tokio::test]
    async fn slow_client_drops_frames_without_blocking_others() {
        let hub = hub_with_key("k");
        let (slow_id, slow_rx) = hub.register().await.unwrap();
        let (fast_id, mut fast_rx) = hub.register().await.unwrap();
        assert!(hub.authenticate(slow_id, "k").await);
        assert!(hub.authenticate(fast_id, "k").await);
        // Never drain the slow client.
        let _parked = slow_rx;

        // Overflow the slow client's buffer (auth_response already used one
        // slot); the fast client must still see every frame it can drain.
        for _ in 0..CLIENT_BUFFER + 50 {
            hub.broadcast(&event());
            // fast consumer keeps draining
            while let Ok(frame) = fast_rx.try_recv() {
                drop(frame);
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hub.client_count(), 2);
    }

    #[tokio::test]
    async fn unregister_and_stop() {
        let hub = hub_with_key("k");
        let (id, mut rx) = hub.register().await.unwrap();
        assert!(hub.authenticate(id, "k").await);
        drain_one(&mut rx).await;
        hub.unregister(id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hub.client_count(), 0);
        assert_eq!(hub.authenticated_client_count(), 0);

        let (_id2, mut rx2) = hub.register().await.unwrap();
        hub.stop().await;
        match drain_one(&mut rx2).await {
            HubOutbound::Close(code, _) => assert_eq!(code, CLOSE_GOING_AWAY),
            other => panic!("expected close on stop, got {:?}", other),
        }
    }
}
