use crate::gateway::AppState;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::time::{interval, timeout};
use tracing::debug;
use wagate_events::HubOutbound;

#[derive(Deserialize)]
struct AuthFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    api_key: String,
}

/// GET /ws/events: authenticated event stream. The first client frame must
/// be `{"type":"auth","api_key":"…"}` within the auth timeout; everything
/// after that is server→client broadcast traffic plus keepalive pings.
pub async fn ws_events(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_events_socket(socket, state))
}

async fn handle_events_socket(socket: WebSocket, state: AppState) {
    let Some((client_id, mut outbound)) = state.hub.register().await else {
        return;
    };
    state.metrics.ws_client_connected();

    let (mut sink, mut stream) = socket.split();
    let ping_interval = state.hub.config.ping_interval;
    let auth_timeout = state.hub.config.auth_timeout;
    let read_deadline = ping_interval + state.hub.config.pong_timeout;

    // Writer task: drains this client's hub buffer and keeps the
    // connection alive with pings. Ends when the hub drops the client.
    let writer = tokio::spawn(async move {
        let mut ticker = interval(ping_interval);
        ticker.tick().await; // first tick fires immediately, skip it
        loop {
            tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(HubOutbound::Frame(text)) => {
                        if sink.send(WsMessage::Text(text.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(HubOutbound::Close(code, reason)) => {
                        let _ = sink
                            .send(WsMessage::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                    None => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Auth phase. The hub pushes auth_response (and the 4001 close on a
    // bad key) through the writer's buffer.
    let authenticated = match timeout(auth_timeout, stream.next()).await {
        Ok(Some(Ok(WsMessage::Text(text)))) => match serde_json::from_str::<AuthFrame>(&text) {
            Ok(frame) if frame.kind == "auth" => {
                state.hub.authenticate(client_id, &frame.api_key).await
            }
            _ => false,
        },
        _ => false,
    };

    if authenticated {
        // Keepalive: any inbound frame (pong included, axum answers pings
        // for us) resets the read deadline. A silent peer gets dropped.
        loop {
            match timeout(read_deadline, stream.next()).await {
                Ok(Some(Ok(WsMessage::Close(_)))) | Ok(Some(Err(_))) | Ok(None) => break,
                Ok(Some(Ok(_))) => {}
                Err(_) => {
                    debug!(client_id, "ws read deadline exceeded, dropping client");
                    break;
                }
            }
        }
    }

    state.hub.unregister(client_id).await;
    state.metrics.ws_client_disconnected();
    let _ = writer.await;
}

/// GET /ws/qr/:session_id: unilateral QR pairing stream. A concurrent
/// second connection for the same session gets a single error frame.
pub async fn ws_qr(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_qr_socket(socket, state, session_id))
}

async fn handle_qr_socket(mut socket: WebSocket, state: AppState, session_id: String) {
    match state.manager.start_qr_auth(&session_id).await {
        Ok(mut events) => {
            while let Some(event) = events.recv().await {
                let terminal = event.is_terminal();
                let Ok(text) = serde_json::to_string(&event) else {
                    break;
                };
                if socket.send(WsMessage::Text(text)).await.is_err() {
                    return;
                }
                if terminal {
                    break;
                }
            }
            let _ = socket.send(WsMessage::Close(None)).await;
        }
        Err(e) => {
            let frame = json!({ "type": "error", "message": e.message() });
            let _ = socket.send(WsMessage::Text(frame.to_string())).await;
            let _ = socket.send(WsMessage::Close(None)).await;
        }
    }
}
