use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, ConnectInfo, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use slotsync_core::decode_frame;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

const OUTBOUND_QUEUE: usize = 256;

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub debug: bool,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub max_frame_bytes: usize,
}

struct Client {
    conn_id: String,
    remote: SocketAddr,
    sender: mpsc::Sender<Message>,
}

impl Client {
    async fn send_text(&self, text: &str) -> bool {
        self.sender.send(Message::Text(text.to_string())).await.is_ok()
    }

    async fn close(&self, reason: &str) {
        let _ = self
            .sender
            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: 1008,
                reason: reason.to_string().into(),
            })))
            .await;
    }
}

/// Connected sockets keyed by connection id. Every valid frame a client sends
/// is relayed to all the others.
pub struct HubState {
    config: HubConfig,
    conn_counter: AtomicU64,
    clients: RwLock<HashMap<String, Arc<Client>>>,
}

impl HubState {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            conn_counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    async fn register_client(&self, client: Arc<Client>) {
        let total = {
            let mut clients = self.clients.write().await;
            clients.insert(client.conn_id.clone(), client.clone());
            clients.len()
        };
        info!(
            event = "client_connected",
            conn_id = %client.conn_id,
            remote = %client.remote,
            clients = total
        );
    }

    async fn remove_client(&self, client: &Client, reason: &str) {
        if self.clients.write().await.remove(&client.conn_id).is_none() {
            return;
        }
        if reason != "disconnect" {
            client.close(reason).await;
        }
        info!(
            event = "client_disconnected",
            conn_id = %client.conn_id,
            remote = %client.remote,
            reason = reason
        );
    }

    async fn snapshot_clients(&self) -> Vec<Arc<Client>> {
        self.clients.read().await.values().cloned().collect()
    }

    /// Sends `text` to every client except `except`; returns how many took it.
    async fn broadcast(&self, text: &str, except: Option<&str>) -> usize {
        let mut delivered = 0;
        for client in self.snapshot_clients().await {
            if except == Some(client.conn_id.as_str()) {
                continue;
            }
            if client.send_text(text).await {
                delivered += 1;
            } else {
                warn!(event = "send_error", conn_id = %client.conn_id);
                self.remove_client(&client, "send_error").await;
            }
        }
        delivered
    }

    fn start_ping(self: Arc<Self>, client: &Arc<Client>) {
        if self.config.ping_interval.is_zero() {
            return;
        }
        let interval = self.config.ping_interval;
        let client: Weak<Client> = Arc::downgrade(client);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(client) = client.upgrade() else {
                    return;
                };
                if client.sender.send(Message::Ping(Vec::new())).await.is_err() {
                    warn!(event = "ping_failed", conn_id = %client.conn_id);
                    self.remove_client(&client, "ping_failed").await;
                    return;
                }
            }
        });
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let send = ws_sender.send(msg);
                match tokio::time::timeout(write_timeout, send).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => return,
                }
            }
        });

        let client = Arc::new(Client {
            conn_id: self.next_conn_id(),
            remote,
            sender: tx,
        });
        self.register_client(client.clone()).await;
        self.clone().start_ping(&client);

        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %client.conn_id, error = %err);
                    break;
                }
            };
            let text = match msg {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!(event = "message_invalid", conn_id = %client.conn_id, error = "binary frame is not utf-8");
                        continue;
                    }
                },
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = %client.conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if self.config.debug {
                debug!(event = "message_received", conn_id = %client.conn_id, raw = %text);
            }
            let frame = match decode_frame(&text, self.config.max_frame_bytes) {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "message_invalid", conn_id = %client.conn_id, size = text.len(), error = %err);
                    continue;
                }
            };
            let delivered = self.broadcast(&text, Some(&client.conn_id)).await;
            debug!(
                event = "frame_relayed",
                conn_id = %client.conn_id,
                event_type = %frame.event_type,
                delivered = delivered
            );
        }

        self.remove_client(&client, "disconnect").await;
        drop(client);
        let _ = write_task.await;
    }
}

pub fn build_router(hub: Arc<HubState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/events", post(publish_handler))
        .route("/health", get(health_handler))
        .with_state(hub)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<HubState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        hub.handle_socket(socket, addr).await;
    })
}

/// Publishes one frame to every connected client.
async fn publish_handler(State(hub): State<Arc<HubState>>, body: String) -> Response {
    match decode_frame(&body, hub.config.max_frame_bytes) {
        Ok(frame) => {
            let delivered = hub.broadcast(&body, None).await;
            info!(event = "event_published", event_type = %frame.event_type, delivered = delivered);
            (StatusCode::ACCEPTED, Json(json!({ "delivered": delivered }))).into_response()
        }
        Err(err) => {
            warn!(event = "publish_invalid", size = body.len(), error = %err);
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn health_handler(State(hub): State<Arc<HubState>>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "clients": hub.client_count().await }))
}
