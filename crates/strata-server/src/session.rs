use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use strata_core::{protocol, Action, ClientId};
use uuid::Uuid;

/// Transport capability implemented by concrete connection backends.
///
/// `send` hands one serialized frame to the connection and must not block;
/// `false` means the frame was not accepted (connection gone or queue full).
pub trait Transport: Send + Sync {
    fn send(&self, frame: &str) -> bool;
    fn close(&self);
}

/// One physical connection to one logical client.
///
/// Wraps a [`Transport`] with the protocol-level send discipline: nothing
/// goes out before the handshake reply, every outgoing envelope is stamped
/// with the server's send time, and batch messages are unwrapped into
/// sequential sends for consumers that declared `supports_batching = false`.
pub struct Session {
    key: Uuid,
    id: ClientId,
    is_human: bool,
    supports_batching: bool,
    handshake_complete: AtomicBool,
    transport: Box<dyn Transport>,
}

impl Session {
    pub fn new(
        id: ClientId,
        is_human: bool,
        supports_batching: bool,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            key: Uuid::now_v7(),
            id,
            is_human,
            supports_batching,
            handshake_complete: AtomicBool::new(false),
            transport,
        }
    }

    /// Physical connection identity. Distinct per connection even when
    /// several connections share one logical [`ClientId`].
    pub fn key(&self) -> Uuid {
        self.key
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn is_human(&self) -> bool {
        self.is_human
    }

    pub fn supports_batching(&self) -> bool {
        self.supports_batching
    }

    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete.load(Ordering::Acquire)
    }

    /// Send an action to this connection.
    ///
    /// Everything before the handshake reply is dropped: the client is about
    /// to receive a full snapshot, and incremental updates against a mirror
    /// it does not have yet would only corrupt it. Dropping is not a
    /// transport failure, so this still returns `true`.
    pub fn send(&self, action: &Action) -> bool {
        if action.is_protocol(protocol::HANDSHAKE_REPLY) {
            self.handshake_complete.store(true, Ordering::Release);
        }
        if !self.handshake_complete() {
            return true;
        }

        let stamped = action.stamped(Utc::now().timestamp_millis());
        if !self.supports_batching && stamped.is_protocol(protocol::BATCH) {
            match stamped.parse_payload::<protocol::BatchPayload>() {
                Ok(batch) => {
                    let mut ok = true;
                    for inner in &batch.actions {
                        ok &= self.send_frame(inner);
                    }
                    ok
                }
                Err(e) => {
                    tracing::warn!(client_id = %self.id, error = %e, "malformed batch payload");
                    false
                }
            }
        } else {
            self.send_frame(&stamped)
        }
    }

    fn send_frame(&self, action: &Action) -> bool {
        match serde_json::to_string(action) {
            Ok(frame) => self.transport.send(&frame),
            Err(e) => {
                tracing::warn!(client_id = %self.id, error = %e, "failed to serialize action");
                false
            }
        }
    }

    /// Advisory heartbeat; clients use the stamp for clock-offset estimation.
    pub fn sync(&self) -> bool {
        self.send(&protocol::heartbeat())
    }

    pub fn close(&self) {
        self.transport.close();
    }
}

struct LocalShared {
    frames: Mutex<VecDeque<String>>,
    closed: AtomicBool,
}

/// In-memory transport backed by a shared frame queue.
///
/// Used by in-process (non-WebSocket) clients such as bots, and by tests
/// that need deterministic delivery.
pub struct LocalTransport {
    shared: Arc<LocalShared>,
}

/// Receiving end of a [`LocalTransport`].
pub struct LocalReceiver {
    shared: Arc<LocalShared>,
}

impl LocalTransport {
    pub fn channel() -> (Self, LocalReceiver) {
        let shared = Arc::new(LocalShared {
            frames: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            LocalReceiver { shared },
        )
    }
}

impl Transport for LocalTransport {
    fn send(&self, frame: &str) -> bool {
        if self.shared.closed.load(Ordering::Acquire) {
            return false;
        }
        self.shared.frames.lock().push_back(frame.to_owned());
        true
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

impl LocalReceiver {
    pub fn try_recv(&self) -> Option<String> {
        self.shared.frames.lock().pop_front()
    }

    pub fn drain(&self) -> Vec<String> {
        self.shared.frames.lock().drain(..).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}
