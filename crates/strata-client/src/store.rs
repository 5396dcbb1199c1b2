//! The client mirror: local replica of the server's visible state.
//!
//! Locally-originated `Shared`/`Request` actions are applied optimistically
//! and forwarded upstream; server-originated actions are applied as-is. When
//! the link is down (or a send fails), outgoing actions land in a backlog
//! that rides the next handshake request.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use strata_core::protocol;
use strata_core::{Action, ClientId, DispatchError, Scope};

use crate::app::{ClientApp, Effects};
use crate::conn::ServerConnection;

/// Engine-maintained session facts, readable by the application.
#[derive(Clone, Debug, Default)]
pub struct MetaState {
    pub connected: bool,
    /// Logical id assigned (or confirmed) by the server at handshake.
    pub id: Option<ClientId>,
    /// Estimated `server_clock - local_clock`, refreshed by every inbound
    /// message carrying a server timestamp.
    pub clock_offset_ms: i64,
    /// Payload of the most recent `error` protocol message.
    pub last_error: Option<Value>,
}

/// The full client-side state: mirrored slices, local state, and metadata.
pub struct ClientState<A: ClientApp> {
    pub broadcast: A::BroadcastState,
    pub targeted: A::TargetedState,
    pub shared: A::SharedState,
    pub local: A::LocalState,
    pub meta: MetaState,
}

struct ClientStore<A: ClientApp> {
    app: A,
    state: ClientState<A>,
    conn: Option<Arc<dyn ServerConnection<A>>>,
    backlog: Vec<Action>,
    mismatch_reported: bool,
}

/// Cloneable, thread-safe handle to the client store.
///
/// Transports and application code share the store through this handle; each
/// call holds the store's mutex for one full (possibly reentrant) dispatch
/// chain.
pub struct ClientHandle<A: ClientApp>(Arc<Mutex<ClientStore<A>>>);

impl<A: ClientApp> Clone for ClientHandle<A> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<A: ClientApp> ClientHandle<A> {
    pub fn new(app: A) -> Self {
        let (broadcast, targeted, shared, local) = app.initial_state();
        Self(Arc::new(Mutex::new(ClientStore {
            app,
            state: ClientState {
                broadcast,
                targeted,
                shared,
                local,
                meta: MetaState::default(),
            },
            conn: None,
            backlog: Vec::new(),
            mismatch_reported: false,
        })))
    }

    /// Attach a transport and open it. The transport calls back into this
    /// handle as the connection progresses.
    pub fn connect(&self, conn: Arc<dyn ServerConnection<A>>) {
        self.0.lock().conn = Some(Arc::clone(&conn));
        conn.open(self.clone());
    }

    /// Detach and close the current transport, if any.
    pub fn disconnect(&self) {
        let conn = self.0.lock().conn.take();
        if let Some(conn) = conn {
            conn.close();
        }
    }

    /// Dispatch a locally-originated action.
    ///
    /// Clients may author `Shared`, `Local`, and `Request` actions; `Shared`
    /// and `Request` are additionally forwarded to the server (or backlogged
    /// while offline).
    pub fn dispatch(&self, action: Action) -> Result<(), DispatchError> {
        match action.scope {
            Scope::Shared | Scope::Local | Scope::Request => {
                self.0.lock().process(action, false);
                Ok(())
            }
            scope => Err(DispatchError::NotClientDispatchable(scope)),
        }
    }

    /// Feed one raw inbound frame from the transport.
    pub fn receive_frame(&self, raw: &str) {
        match serde_json::from_str::<Action>(raw) {
            Ok(action) => self.0.lock().apply_from_server(action),
            Err(e) => tracing::warn!(error = %e, "unparseable server frame"),
        }
    }

    /// Transport callback: the link came up.
    pub fn connection_opened(&self) {
        self.0.lock().process(protocol::connected(), false);
    }

    /// Transport callback: the link dropped.
    pub fn connection_closed(&self) {
        self.0.lock().process(protocol::disconnected(), false);
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&ClientState<A>) -> R) -> R {
        f(&self.0.lock().state)
    }

    pub fn with_app<R>(&self, f: impl FnOnce(&A) -> R) -> R {
        f(&self.0.lock().app)
    }

    pub fn connected(&self) -> bool {
        self.0.lock().state.meta.connected
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.0.lock().state.meta.id.clone()
    }

    pub fn clock_offset_ms(&self) -> i64 {
        self.0.lock().state.meta.clock_offset_ms
    }

    pub fn last_error(&self) -> Option<Value> {
        self.0.lock().state.meta.last_error.clone()
    }

    /// Actions waiting for the next handshake request.
    pub fn pending_backlog(&self) -> usize {
        self.0.lock().backlog.len()
    }
}

impl<A: ClientApp> ClientStore<A> {
    fn apply_from_server(&mut self, action: Action) {
        match action.scope {
            Scope::Broadcast | Scope::Targeted | Scope::Shared | Scope::Protocol => {
                self.process(action, true);
            }
            scope => tracing::warn!(%scope, "dropped server message with non-mirrorable scope"),
        }
    }

    fn process(&mut self, action: Action, from_server: bool) {
        if from_server {
            if let Some(ts) = action.timestamp {
                self.state.meta.clock_offset_ms = ts - Utc::now().timestamp_millis();
            }
        }
        if action.scope == Scope::Protocol {
            self.handle_protocol(action, from_server);
            return;
        }
        self.reduce(&action);
        self.run_handlers(&action);
        if !from_server && matches!(action.scope, Scope::Shared | Scope::Request) {
            self.forward(action);
        }
    }

    fn handle_protocol(&mut self, action: Action, from_server: bool) {
        match action.name.as_str() {
            protocol::BATCH => match action.parse_payload::<protocol::BatchPayload>() {
                Ok(batch) => {
                    for inner in batch.actions {
                        self.process(inner, from_server);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "malformed batch payload"),
            },
            protocol::CONNECTED => {
                self.state.meta.connected = true;
                self.mismatch_reported = false;
                let mut fx = Effects::default();
                self.app.on_connected(&mut fx);
                self.drain_effects(fx);
                self.send_handshake();
            }
            protocol::DISCONNECTED => {
                self.state.meta.connected = false;
                let mut fx = Effects::default();
                self.app.on_disconnected(&mut fx);
                self.drain_effects(fx);
            }
            protocol::HANDSHAKE_REPLY => self.finish_handshake(&action),
            protocol::ERROR => {
                tracing::warn!(payload = %action.payload, "server reported an error");
                self.state.meta.last_error = Some(action.payload.clone());
            }
            protocol::HEARTBEAT => {} // clock offset already taken above
            other => tracing::debug!(name = other, "ignoring unknown protocol message"),
        }
    }

    /// Flush the backlog as the handshake request. On send failure the
    /// backlog is kept for the next attempt.
    fn send_handshake(&mut self) {
        let backlog = std::mem::take(&mut self.backlog);
        let request = protocol::handshake_request(backlog.clone());
        let sent = self
            .conn
            .as_ref()
            .map(|conn| conn.send(&request))
            .unwrap_or(false);
        if sent {
            tracing::debug!(queued = backlog.len(), "handshake request sent");
        } else {
            tracing::warn!("failed to send handshake request");
            self.backlog = backlog;
        }
    }

    fn finish_handshake(&mut self, action: &Action) {
        let reply: protocol::HandshakeReply = match action.parse_payload() {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(error = %e, "malformed handshake reply");
                return;
            }
        };

        if reply.version != self.app.version() {
            if !self.mismatch_reported {
                self.mismatch_reported = true;
                let local = self.app.version().to_owned();
                tracing::error!(%local, server = %reply.version, "protocol version mismatch");
                let mut fx = Effects::default();
                self.app.on_version_mismatch(&mut fx, &local, &reply.version);
                self.drain_effects(fx);
            }
            return;
        }

        // Decode all three slices before touching the mirror, so a snapshot
        // that does not fit the local types leaves it unchanged.
        let slices = (|| -> Result<_, serde_json::Error> {
            Ok((
                serde_json::from_value(reply.initial_state.broadcast)?,
                serde_json::from_value(reply.initial_state.targeted)?,
                serde_json::from_value(reply.initial_state.shared)?,
            ))
        })();
        match slices {
            Ok((broadcast, targeted, shared)) => {
                self.state.broadcast = broadcast;
                self.state.targeted = targeted;
                self.state.shared = shared;
                self.state.meta.id = Some(reply.id);
                tracing::debug!("handshake snapshot installed");
            }
            Err(e) => tracing::error!(error = %e, "handshake snapshot does not match mirror types"),
        }
    }

    fn reduce(&mut self, action: &Action) {
        let Self { app, state, .. } = self;
        match action.scope {
            Scope::Broadcast => app.reduce_broadcast(&mut state.broadcast, action),
            Scope::Targeted => app.reduce_targeted(&mut state.targeted, action),
            Scope::Shared => app.reduce_shared(&mut state.shared, action),
            Scope::Local => app.reduce_local(&mut state.local, action),
            Scope::Server | Scope::Request | Scope::Protocol => {}
        }
    }

    fn run_handlers(&mut self, action: &Action) {
        let mut fx = Effects::default();
        {
            let Self { app, state, .. } = self;
            match action.scope {
                Scope::Broadcast => app.handle_broadcast(&mut fx, state, action),
                Scope::Targeted => app.handle_targeted(&mut fx, state, action),
                Scope::Shared => app.handle_shared(&mut fx, state, action),
                Scope::Local => app.handle_local(&mut fx, state, action),
                Scope::Request => app.handle_request(&mut fx, state, action),
                Scope::Server | Scope::Protocol => {}
            }
        }
        self.drain_effects(fx);
    }

    fn drain_effects(&mut self, mut fx: Effects) {
        for action in fx.take() {
            match action.scope {
                Scope::Shared | Scope::Local | Scope::Request => self.process(action, false),
                scope => tracing::error!(
                    %scope,
                    "client handlers may only dispatch shared, local, or request actions"
                ),
            }
        }
    }

    fn forward(&mut self, action: Action) {
        let sent = self.state.meta.connected
            && self
                .conn
                .as_ref()
                .map(|conn| conn.send(&action))
                .unwrap_or(false);
        if !sent {
            tracing::debug!(name = %action.name, "queued action for next handshake");
            self.backlog.push(action);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use strata_core::protocol::InitialState;

    #[derive(Default)]
    struct TestApp {
        connects: u32,
        disconnects: u32,
        mismatches: Vec<(String, String)>,
    }

    impl ClientApp for TestApp {
        type BroadcastState = Vec<String>;
        type TargetedState = i64;
        type SharedState = Vec<String>;
        type LocalState = u32;

        fn version(&self) -> &str {
            "v1"
        }

        fn initial_state(&self) -> (Vec<String>, i64, Vec<String>, u32) {
            (Vec::new(), 0, Vec::new(), 0)
        }

        fn reduce_broadcast(&self, state: &mut Vec<String>, action: &Action) {
            if action.name == "log/append" {
                if let Some(line) = action.payload.as_str() {
                    state.push(line.to_owned());
                }
            }
        }

        fn reduce_targeted(&self, state: &mut i64, action: &Action) {
            if action.name == "secret/set" {
                *state = action.payload.as_i64().unwrap_or(0);
            }
        }

        fn reduce_shared(&self, state: &mut Vec<String>, action: &Action) {
            if action.name == "note/add" {
                if let Some(note) = action.payload.as_str() {
                    state.push(note.to_owned());
                }
            }
        }

        fn reduce_local(&self, state: &mut u32, action: &Action) {
            if action.name == "counter/bump" {
                *state += 1;
            }
        }

        fn handle_request(&mut self, fx: &mut Effects, _state: &ClientState<Self>, action: &Action) {
            if action.name == "chain" {
                fx.dispatch(Action::local("counter/bump", Value::Null));
            }
        }

        fn on_connected(&mut self, _fx: &mut Effects) {
            self.connects += 1;
        }

        fn on_disconnected(&mut self, _fx: &mut Effects) {
            self.disconnects += 1;
        }

        fn on_version_mismatch(&mut self, _fx: &mut Effects, local: &str, server: &str) {
            self.mismatches.push((local.to_owned(), server.to_owned()));
        }
    }

    #[derive(Default)]
    struct PipeConnection {
        up: AtomicBool,
        sent: parking_lot::Mutex<Vec<Action>>,
    }

    impl PipeConnection {
        fn sent(&self) -> Vec<Action> {
            self.sent.lock().clone()
        }

        fn drain(&self) -> Vec<Action> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl ServerConnection<TestApp> for PipeConnection {
        fn open(self: Arc<Self>, store: ClientHandle<TestApp>) {
            self.up.store(true, Ordering::SeqCst);
            store.connection_opened();
        }

        fn send(&self, action: &Action) -> bool {
            if !self.up.load(Ordering::SeqCst) {
                return false;
            }
            self.sent.lock().push(action.clone());
            true
        }

        fn close(&self) {
            self.up.store(false, Ordering::SeqCst);
        }
    }

    fn connected_client() -> (ClientHandle<TestApp>, Arc<PipeConnection>) {
        let handle = ClientHandle::new(TestApp::default());
        let conn = Arc::new(PipeConnection::default());
        handle.connect(Arc::clone(&conn) as Arc<dyn ServerConnection<TestApp>>);
        conn.drain(); // discard the handshake request
        (handle, conn)
    }

    fn reply_action(version: &str) -> Action {
        let snapshot = InitialState {
            broadcast: json!(["from server"]),
            targeted: json!(41),
            shared: json!(["their note"]),
        };
        protocol::handshake_reply(snapshot, version, &ClientId::from_raw("alice"))
    }

    #[test]
    fn local_dispatch_stays_local() {
        let (handle, conn) = connected_client();
        handle.dispatch(Action::local("counter/bump", Value::Null)).unwrap();
        handle.dispatch(Action::local("counter/bump", Value::Null)).unwrap();
        assert_eq!(handle.with_state(|s| s.local), 2);
        assert!(conn.sent().is_empty());
    }

    #[test]
    fn shared_dispatch_applies_optimistically_and_forwards() {
        let (handle, conn) = connected_client();
        handle
            .dispatch(Action::shared("note/add", json!("mine")))
            .unwrap();
        assert_eq!(handle.with_state(|s| s.shared.clone()), vec!["mine"]);
        let sent = conn.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].scope, Scope::Shared);
        assert_eq!(sent[0].name, "note/add");
    }

    #[test]
    fn request_forwarded_but_never_stored() {
        let (handle, conn) = connected_client();
        handle
            .dispatch(Action::request("ping", Value::Null))
            .unwrap();
        assert_eq!(conn.sent().len(), 1);
        assert!(handle.with_state(|s| s.shared.is_empty()));
    }

    #[test]
    fn offline_dispatches_ride_the_next_handshake() {
        let handle = ClientHandle::new(TestApp::default());
        handle
            .dispatch(Action::shared("note/add", json!("one")))
            .unwrap();
        handle
            .dispatch(Action::shared("note/add", json!("two")))
            .unwrap();
        assert_eq!(handle.pending_backlog(), 2);
        // Optimistic application happened even while offline.
        assert_eq!(handle.with_state(|s| s.shared.len()), 2);

        let conn = Arc::new(PipeConnection::default());
        handle.connect(Arc::clone(&conn) as Arc<dyn ServerConnection<TestApp>>);

        let sent = conn.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_protocol(protocol::HANDSHAKE_REQUEST));
        let request: protocol::HandshakeRequest = sent[0].parse_payload().unwrap();
        assert_eq!(request.queued_actions.len(), 2);
        assert_eq!(request.queued_actions[0].payload, json!("one"));
        assert_eq!(handle.pending_backlog(), 0);
    }

    #[test]
    fn failed_send_falls_back_to_backlog() {
        let (handle, conn) = connected_client();
        conn.close(); // transport gone, no disconnect event yet
        handle
            .dispatch(Action::shared("note/add", json!("lost")))
            .unwrap();
        assert!(conn.sent().is_empty());
        assert_eq!(handle.pending_backlog(), 1);
    }

    #[test]
    fn handshake_reply_installs_snapshot_and_id() {
        let (handle, _conn) = connected_client();
        handle
            .dispatch(Action::shared("note/add", json!("stale")))
            .unwrap();

        let frame = serde_json::to_string(&reply_action("v1")).unwrap();
        handle.receive_frame(&frame);

        assert_eq!(handle.with_state(|s| s.broadcast.clone()), vec!["from server"]);
        assert_eq!(handle.with_state(|s| s.targeted), 41);
        // Snapshot replaces, never merges.
        assert_eq!(handle.with_state(|s| s.shared.clone()), vec!["their note"]);
        assert_eq!(handle.client_id(), Some(ClientId::from_raw("alice")));
    }

    #[test]
    fn version_mismatch_reported_once_and_snapshot_discarded() {
        let (handle, _conn) = connected_client();
        let frame = serde_json::to_string(&reply_action("v2")).unwrap();
        handle.receive_frame(&frame);
        handle.receive_frame(&frame);

        let mismatches = handle.with_app(|app| app.mismatches.clone());
        assert_eq!(mismatches, vec![("v1".to_owned(), "v2".to_owned())]);
        assert!(handle.with_state(|s| s.broadcast.is_empty()));
        assert_eq!(handle.client_id(), None);
    }

    #[test]
    fn batch_expands_in_order() {
        let (handle, _conn) = connected_client();
        let batch = protocol::batch(vec![
            Action::broadcast("log/append", json!("a")),
            Action::broadcast("log/append", json!("b")),
        ]);
        handle.receive_frame(&serde_json::to_string(&batch).unwrap());
        assert_eq!(handle.with_state(|s| s.broadcast.clone()), vec!["a", "b"]);
    }

    #[test]
    fn inbound_timestamps_refresh_clock_offset() {
        let (handle, _conn) = connected_client();
        let future = Utc::now().timestamp_millis() + 5_000;
        let action = Action::broadcast("log/append", json!("x")).stamped(future);
        handle.receive_frame(&serde_json::to_string(&action).unwrap());
        let offset = handle.clock_offset_ms();
        assert!((4_000..=6_000).contains(&offset), "offset was {offset}");
    }

    #[test]
    fn error_messages_land_in_meta() {
        let (handle, _conn) = connected_client();
        let frame = serde_json::to_string(&protocol::error("not allowed")).unwrap();
        handle.receive_frame(&frame);
        let err = handle.last_error().unwrap();
        assert_eq!(err["message"], "not allowed");
    }

    #[test]
    fn disallowed_scopes_are_rejected() {
        let handle = ClientHandle::new(TestApp::default());
        assert!(matches!(
            handle.dispatch(Action::broadcast("log/append", json!("x"))),
            Err(DispatchError::NotClientDispatchable(Scope::Broadcast))
        ));
        assert!(matches!(
            handle.dispatch(Action::targeted("secret/set", json!(1))),
            Err(DispatchError::NotClientDispatchable(Scope::Targeted))
        ));
        assert_eq!(handle.pending_backlog(), 0);
    }

    #[test]
    fn connection_callbacks_drive_meta() {
        let (handle, _conn) = connected_client();
        assert!(handle.connected());
        assert_eq!(handle.with_app(|app| app.connects), 1);

        handle.connection_closed();
        assert!(!handle.connected());
        assert_eq!(handle.with_app(|app| app.disconnects), 1);
    }

    #[test]
    fn handler_effects_run_through_the_pipeline() {
        let (handle, conn) = connected_client();
        handle.dispatch(Action::request("chain", Value::Null)).unwrap();
        // The request was forwarded and its handler's local effect applied.
        assert_eq!(conn.sent().len(), 1);
        assert_eq!(handle.with_state(|s| s.local), 1);
    }

    #[test]
    fn non_mirrorable_server_scopes_are_dropped() {
        let (handle, _conn) = connected_client();
        let frame = serde_json::to_string(&Action::local("counter/bump", Value::Null)).unwrap();
        handle.receive_frame(&frame);
        assert_eq!(handle.with_state(|s| s.local), 0);
    }
}
