//! Reconnecting WebSocket transport built on tokio-tungstenite.
//!
//! One background task owns the socket lifecycle: connect, pump frames both
//! ways, and on any close or error wait out a fixed delay and try again.
//! `open()` calls arriving while a retry timer is pending are debounced to
//! that single pending timer, so repeated rapid opens cannot stack
//! connection attempts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use strata_core::Action;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::app::ClientApp;
use crate::conn::ServerConnection;
use crate::store::ClientHandle;

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1_500);

/// WebSocket-backed [`ServerConnection`].
///
/// The URL carries the connection parameters the server reads from the query
/// string: `client` (logical id to resume), `human`, and `batching`.
pub struct WebSocketConnection {
    url: String,
    reconnect_delay: Duration,
    closed: AtomicBool,
    running: AtomicBool,
    reconnect_pending: AtomicBool,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl WebSocketConnection {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            closed: AtomicBool::new(false),
            running: AtomicBool::new(false),
            reconnect_pending: AtomicBool::new(false),
            writer: Mutex::new(None),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn is_open(&self) -> bool {
        self.writer.lock().is_some()
    }

    async fn run<A: ClientApp>(conn: Arc<Self>, store: ClientHandle<A>) {
        loop {
            match connect_async(conn.url.as_str()).await {
                Ok((ws, _response)) => {
                    let (mut sink, mut stream) = ws.split();
                    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
                    *conn.writer.lock() = Some(tx);

                    let writer = tokio::spawn(async move {
                        while let Some(msg) = rx.recv().await {
                            if sink.send(msg).await.is_err() {
                                break;
                            }
                        }
                        let _ = sink.close().await;
                    });

                    store.connection_opened();

                    while let Some(msg) = stream.next().await {
                        match msg {
                            Ok(Message::Text(text)) => store.receive_frame(text.as_str()),
                            Ok(Message::Close(_)) => break,
                            Ok(_) => {}
                            Err(e) => {
                                tracing::debug!(error = %e, "websocket read error");
                                break;
                            }
                        }
                    }

                    *conn.writer.lock() = None;
                    writer.abort();
                    store.connection_closed();
                }
                Err(e) => {
                    tracing::warn!(error = %e, url = %conn.url, "websocket connect failed");
                }
            }

            if conn.closed.load(Ordering::SeqCst) {
                break;
            }
            conn.reconnect_pending.store(true, Ordering::SeqCst);
            tokio::time::sleep(conn.reconnect_delay).await;
            conn.reconnect_pending.store(false, Ordering::SeqCst);
            if conn.closed.load(Ordering::SeqCst) {
                break;
            }
        }
        conn.running.store(false, Ordering::SeqCst);
    }
}

impl<A: ClientApp> ServerConnection<A> for WebSocketConnection {
    fn open(self: Arc<Self>, store: ClientHandle<A>) {
        self.closed.store(false, Ordering::SeqCst);
        if self.running.swap(true, Ordering::SeqCst) {
            // A connection loop is already live, possibly waiting out the
            // retry delay; its single pending timer covers this request.
            tracing::debug!(
                pending = self.reconnect_pending.load(Ordering::SeqCst),
                "open ignored, connection loop already running"
            );
            return;
        }
        tokio::spawn(Self::run(self, store));
    }

    fn send(&self, action: &Action) -> bool {
        let guard = self.writer.lock();
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        match serde_json::to_string(action) {
            Ok(frame) => tx.send(Message::Text(frame.into())).is_ok(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize action");
                false
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(tx) = self.writer.lock().take() {
            let _ = tx.send(Message::Close(None));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn send_before_open_is_rejected() {
        let conn = WebSocketConnection::new("ws://127.0.0.1:1/ws");
        assert!(!conn.is_open());
        assert!(!ServerConnection::<NullApp>::send(
            &conn,
            &Action::shared("note/add", json!("x"))
        ));
    }

    #[test]
    fn close_is_idempotent() {
        let conn = WebSocketConnection::new("ws://127.0.0.1:1/ws");
        ServerConnection::<NullApp>::close(&conn);
        ServerConnection::<NullApp>::close(&conn);
        assert!(!conn.is_open());
    }

    struct NullApp;

    impl ClientApp for NullApp {
        type BroadcastState = ();
        type TargetedState = ();
        type SharedState = ();
        type LocalState = ();

        fn version(&self) -> &str {
            "v0"
        }

        fn initial_state(&self) -> ((), (), (), ()) {
            ((), (), (), ())
        }

        fn on_version_mismatch(&mut self, _fx: &mut crate::app::Effects, _local: &str, _server: &str) {
        }
    }
}
