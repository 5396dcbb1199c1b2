use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use strata_core::{protocol, Action, ClientId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::app::ServerApp;
use crate::session::{Session, Transport};
use crate::store::ServerStore;

/// Store behind the single dispatch mutex, shared between the HTTP runtime
/// and any in-process integrator code.
pub type SharedStore<A> = Arc<Mutex<ServerStore<A>>>;

/// WebSocket server configuration.
pub struct WsServerConfig {
    pub port: u16,
    /// Cadence of the advisory heartbeat sent to every live connection.
    pub heartbeat_interval: Duration,
    /// Connections that have not completed the handshake within this window
    /// are closed. `None` disables the watchdog.
    pub handshake_timeout: Option<Duration>,
    pub max_send_queue: usize,
}

impl Default for WsServerConfig {
    fn default() -> Self {
        Self {
            port: 9300,
            heartbeat_interval: Duration::from_secs(30),
            handshake_timeout: Some(Duration::from_secs(30)),
            max_send_queue: 256,
        }
    }
}

/// Shared application state passed to axum handlers.
pub struct AppState<A: ServerApp> {
    store: SharedStore<A>,
    config: Arc<WsServerConfig>,
}

impl<A: ServerApp> Clone for AppState<A> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
        }
    }
}

/// Connection parameters carried in the upgrade request's query string.
#[derive(Deserialize)]
struct ConnectParams {
    /// Logical client id to resume; omitted for first-time clients.
    client: Option<String>,
    human: Option<bool>,
    batching: Option<bool>,
}

/// Build the axum router with all routes.
pub fn build_router<A: ServerApp>(state: AppState<A>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler::<A>))
        .route("/health", get(health_handler::<A>))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind the listener and start serving. Returns a handle that keeps the
/// background tasks alive and can shut the server down.
pub async fn serve<A: ServerApp>(
    config: WsServerConfig,
    store: SharedStore<A>,
) -> Result<WsServerHandle, std::io::Error> {
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let port = listener.local_addr()?.port();

    let cancel = CancellationToken::new();

    let heartbeat_store = Arc::clone(&store);
    let heartbeat_cancel = cancel.clone();
    let heartbeat_interval = config.heartbeat_interval;
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        ticker.tick().await; // consume the immediate first tick
        loop {
            tokio::select! {
                _ = ticker.tick() => heartbeat_store.lock().sync_connections(),
                _ = heartbeat_cancel.cancelled() => break,
            }
        }
    });

    let state = AppState {
        store: Arc::clone(&store),
        config: Arc::new(config),
    };
    let router = build_router(state);

    tracing::info!(port, "strata server started");

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(server_cancel.cancelled_owned())
            .await
            .ok();
        store.lock().shutdown();
    });

    Ok(WsServerHandle {
        port,
        cancel,
        _server: server,
        _heartbeat: heartbeat,
    })
}

/// Handle returned by [`serve`]. Dropping it does not stop the server; call
/// [`WsServerHandle::shutdown`].
pub struct WsServerHandle {
    pub port: u16,
    cancel: CancellationToken,
    _server: tokio::task::JoinHandle<()>,
    _heartbeat: tokio::task::JoinHandle<()>,
}

impl WsServerHandle {
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Outbound half of a WebSocket connection: a bounded handoff to the writer
/// task, so sends never block the dispatch mutex.
struct WsTransport {
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl Transport for WsTransport {
    fn send(&self, frame: &str) -> bool {
        match self.tx.try_send(frame.to_owned()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                tracing::warn!(frame_len = frame.len(), "send queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// WebSocket upgrade handler.
async fn ws_handler<A: ServerApp>(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState<A>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

/// Drive one WebSocket connection from upgrade to teardown.
async fn handle_socket<A: ServerApp>(socket: WebSocket, params: ConnectParams, state: AppState<A>) {
    let id = match params.client {
        Some(raw) => ClientId::from_raw(raw),
        None => ClientId::generate(),
    };
    let is_human = params.human.unwrap_or(true);
    let supports_batching = params.batching.unwrap_or(true);

    let (tx, mut rx) = mpsc::channel::<String>(state.config.max_send_queue);
    let cancel = CancellationToken::new();
    let transport = WsTransport {
        tx,
        cancel: cancel.clone(),
    };
    let session = Arc::new(Session::new(id, is_human, supports_batching, Box::new(transport)));
    tracing::info!(client_id = %session.id(), conn = %session.key(), "websocket client connected");

    state.store.lock().add_connection(Arc::clone(&session));

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: forward frames from the session's queue to the socket.
    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    match frame {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = writer_cancel.cancelled() => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Handshake watchdog: a connection that never asks for its snapshot is
    // not a protocol participant and gets closed.
    if let Some(timeout) = state.config.handshake_timeout {
        let watchdog_session = Arc::clone(&session);
        let watchdog_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    if !watchdog_session.handshake_complete() {
                        tracing::warn!(
                            client_id = %watchdog_session.id(),
                            "handshake timed out, closing connection"
                        );
                        watchdog_session.close();
                    }
                }
                _ = watchdog_cancel.cancelled() => {}
            }
        });
    }

    // Reader loop: every text frame is an action from this client.
    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<Action>(text.as_str()) {
                            Ok(action) => {
                                let result = state
                                    .store
                                    .lock()
                                    .dispatch_from_client(action, &session);
                                if let Err(e) = result {
                                    tracing::debug!(client_id = %session.id(), error = %e, "client action rejected");
                                }
                            }
                            Err(e) => {
                                tracing::warn!(client_id = %session.id(), error = %e, "unparseable frame");
                                session.send(&protocol::error("unparseable action frame"));
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // axum answers pings itself
                    Some(Err(e)) => {
                        tracing::debug!(client_id = %session.id(), error = %e, "websocket read error");
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => break,
        }
    }

    cancel.cancel();
    let _ = writer.await;
    state.store.lock().remove_connection(&session);
    tracing::info!(client_id = %session.id(), "websocket client disconnected");
}

/// Health check HTTP endpoint.
async fn health_handler<A: ServerApp>(State(state): State<AppState<A>>) -> impl IntoResponse {
    let (connections, version) = {
        let store = state.store.lock();
        (store.connection_count(), store.app().version().to_owned())
    };
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": version,
        "connections": connections,
    }))
}
