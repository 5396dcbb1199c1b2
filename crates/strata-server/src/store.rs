//! The authoritative store: sequential apply-then-broadcast pipeline.
//!
//! Every mutation enters through one of the `dispatch*` entry points and runs
//! the same pipeline: fan-out queueing, reduction, application handlers,
//! protocol bookkeeping. Dispatch may reenter (handlers and protocol
//! processing trigger further dispatches on the same stack); a depth counter
//! defers the network flush until the outermost call completes, so each
//! connection sees at most one message per top-level dispatch chain.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use strata_core::protocol::{self, InitialState};
use strata_core::{Action, ClientId, DispatchError, Scope};
use uuid::Uuid;

use crate::app::{Effects, ServerApp};
use crate::registry::ClientRegistry;
use crate::session::Session;
use crate::state::ServerState;

/// An action plus its out-of-band routing metadata. The metadata is consumed
/// by the mirroring engine and never serialized.
struct RoutedAction {
    action: Action,
    /// Physical connection the action arrived on, if any. Used for echo
    /// suppression and for addressing protocol replies.
    origin: Option<Arc<Session>>,
    /// Logical client whose scoped slice the action affects, if scoped.
    target: Option<ClientId>,
}

impl RoutedAction {
    fn internal(action: Action) -> Self {
        Self {
            action,
            origin: None,
            target: None,
        }
    }

    fn to_client(action: Action, target: ClientId) -> Self {
        Self {
            action,
            origin: None,
            target: Some(target),
        }
    }

    fn from_connection(action: Action, session: Arc<Session>) -> Self {
        let target = session.id().clone();
        Self {
            action,
            origin: Some(session),
            target: Some(target),
        }
    }
}

/// Per-connection pending mirror queues plus the reentrancy depth counter.
#[derive(Default)]
struct MirrorQueue {
    depth: usize,
    pending: Vec<(Arc<Session>, Vec<Action>)>,
}

impl MirrorQueue {
    fn push(&mut self, session: &Arc<Session>, action: Action) {
        if let Some((_, queue)) = self
            .pending
            .iter_mut()
            .find(|(s, _)| s.key() == session.key())
        {
            queue.push(action);
        } else {
            self.pending.push((Arc::clone(session), vec![action]));
        }
    }

    fn clear_for(&mut self, key: Uuid) {
        self.pending.retain(|(s, _)| s.key() != key);
    }

    fn take(&mut self) -> Vec<(Arc<Session>, Vec<Action>)> {
        std::mem::take(&mut self.pending)
    }
}

/// The server store. All mutation is serialized through `&mut self`; in a
/// multi-threaded host, wrap it in the [`Mutex`] from [`ServerStore::shared`]
/// and hold the lock for each full dispatch call.
pub struct ServerStore<A: ServerApp> {
    app: A,
    state: ServerState<A>,
    registry: ClientRegistry,
    mirror: MirrorQueue,
}

impl<A: ServerApp> ServerStore<A> {
    pub fn new(app: A) -> Self {
        let state = ServerState::new(&app);
        Self {
            app,
            state,
            registry: ClientRegistry::new(),
            mirror: MirrorQueue::default(),
        }
    }

    /// Store behind the single dispatch mutex, ready to share with transport
    /// tasks.
    pub fn shared(app: A) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new(app)))
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    pub fn state(&self) -> &ServerState<A> {
        &self.state
    }

    pub fn server_state(&self) -> &A::ServerState {
        &self.state.server
    }

    pub fn broadcast_state(&self) -> &A::BroadcastState {
        &self.state.broadcast
    }

    pub fn targeted_state(&self, id: &ClientId) -> Option<&A::TargetedState> {
        self.state.targeted.get(id)
    }

    pub fn shared_state(&self, id: &ClientId) -> Option<&A::SharedState> {
        self.state.shared.get(id)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }

    pub fn is_empty(&self, count_non_human: bool) -> bool {
        self.registry.is_empty(count_non_human)
    }

    // ---- dispatch entry points ----------------------------------------

    /// Dispatch a server-authored, non-client-specific action.
    pub fn dispatch(&mut self, action: Action) -> Result<(), DispatchError> {
        match action.scope {
            Scope::Server | Scope::Broadcast => {
                self.process(RoutedAction::internal(action));
                Ok(())
            }
            Scope::Targeted | Scope::Shared | Scope::Request => {
                Err(DispatchError::MissingTarget(action.scope))
            }
            scope => Err(DispatchError::NotServerDispatchable(scope)),
        }
    }

    /// Dispatch a server-authored action against one client's scoped slice.
    pub fn dispatch_to_client(
        &mut self,
        action: Action,
        client: &ClientId,
    ) -> Result<(), DispatchError> {
        match action.scope {
            Scope::Targeted | Scope::Shared | Scope::Request => {
                self.process(RoutedAction::to_client(action, client.clone()));
                Ok(())
            }
            Scope::Server | Scope::Broadcast => {
                self.process(RoutedAction::internal(action));
                Ok(())
            }
            scope => Err(DispatchError::NotServerDispatchable(scope)),
        }
    }

    /// Dispatch an action received from a connection.
    ///
    /// Clients may author `Shared` and `Request` actions plus the handshake
    /// request; anything else is a protocol violation reported back to that
    /// connection as an `error` message. The connection stays open and
    /// authoritative state is untouched.
    pub fn dispatch_from_client(
        &mut self,
        action: Action,
        session: &Arc<Session>,
    ) -> Result<(), DispatchError> {
        let allowed = matches!(action.scope, Scope::Shared | Scope::Request)
            || action.is_protocol(protocol::HANDSHAKE_REQUEST);
        if !allowed {
            let err = DispatchError::DisallowedClientScope(action.scope);
            tracing::warn!(client_id = %session.id(), scope = %action.scope, "rejected client action");
            session.send(&protocol::error(err.to_string()));
            return Err(err);
        }
        self.process(RoutedAction::from_connection(action, Arc::clone(session)));
        Ok(())
    }

    // ---- connection lifecycle -----------------------------------------

    /// Register a live connection. On the id's 0→1 edge this dispatches the
    /// `connected` protocol action, which creates the per-client state slices
    /// if this id has never been seen before.
    pub fn add_connection(&mut self, session: Arc<Session>) {
        tracing::debug!(client_id = %session.id(), conn = %session.key(), "connection added");
        if self.registry.add(Arc::clone(&session)) {
            self.process(RoutedAction::from_connection(protocol::connected(), session));
        }
    }

    /// Close and deregister a connection. On the id's 1→0 edge this
    /// dispatches `disconnected`. Per-client state is left in place for a
    /// later reconnect.
    pub fn remove_connection(&mut self, session: &Arc<Session>) {
        session.close();
        self.mirror.clear_for(session.key());
        if self.registry.remove(session) {
            tracing::debug!(client_id = %session.id(), "last connection for id closed");
            self.process(RoutedAction::from_connection(
                protocol::disconnected(),
                Arc::clone(session),
            ));
        }
    }

    /// Heartbeat every live connection.
    pub fn sync_connections(&self) {
        for conn in self.registry.connections() {
            conn.sync();
        }
    }

    /// Close every connection and drop all connection records. Scoped state
    /// is left intact.
    pub fn shutdown(&mut self) {
        for conn in self.registry.connections() {
            conn.close();
        }
        self.registry.clear();
        self.mirror.take();
    }

    // ---- per-client state lifecycle -----------------------------------

    /// Drop an absent client's scoped slices. Refuses while the id has live
    /// connections. Returns whether anything was removed.
    pub fn purge_client(&mut self, id: &ClientId) -> bool {
        if self.registry.is_connected(id) {
            return false;
        }
        let removed =
            self.state.targeted.remove(id).is_some() | self.state.shared.remove(id).is_some();
        self.registry.forget(id);
        if removed {
            tracing::info!(client_id = %id, "purged per-client state");
        }
        removed
    }

    /// Purge every client that has been fully disconnected for at least
    /// `ttl`. Returns the number of clients purged. The store never calls
    /// this on its own; expiry scheduling belongs to the integrator.
    pub fn purge_idle(&mut self, ttl: Duration) -> usize {
        let Ok(delta) = chrono::Duration::from_std(ttl) else {
            return 0;
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(delta) else {
            return 0;
        };
        let idle = self.registry.idle_since(cutoff);
        let mut purged = 0;
        for id in &idle {
            if self.purge_client(id) {
                purged += 1;
            }
        }
        purged
    }

    // ---- pipeline ------------------------------------------------------

    fn process(&mut self, routed: RoutedAction) {
        self.mirror.depth += 1;
        self.queue_fanout(&routed);
        self.reduce(&routed);
        self.run_handlers(&routed);
        self.handle_protocol(&routed);
        self.mirror.depth -= 1;
        if self.mirror.depth == 0 {
            self.flush();
        }
    }

    fn queue_fanout(&mut self, routed: &RoutedAction) {
        let Self {
            registry, mirror, ..
        } = self;
        match routed.action.scope {
            Scope::Broadcast => {
                for conn in registry.connections() {
                    mirror.push(conn, routed.action.clone());
                }
            }
            Scope::Targeted => {
                if let Some(target) = &routed.target {
                    for conn in registry.connections_for(target) {
                        mirror.push(conn, routed.action.clone());
                    }
                }
            }
            Scope::Shared => {
                // Echo suppression: the authoring connection already applied
                // this action locally and must not be told about it again.
                if let Some(target) = &routed.target {
                    let origin = routed.origin.as_ref().map(|s| s.key());
                    for conn in registry.connections_for(target) {
                        if Some(conn.key()) != origin {
                            mirror.push(conn, routed.action.clone());
                        }
                    }
                }
            }
            Scope::Server | Scope::Local | Scope::Request | Scope::Protocol => {}
        }
    }

    fn reduce(&mut self, routed: &RoutedAction) {
        let Self { app, state, .. } = self;
        let action = &routed.action;
        match action.scope {
            Scope::Server => app.reduce_server(&mut state.server, action),
            Scope::Broadcast => app.reduce_broadcast(&mut state.broadcast, action),
            Scope::Targeted => {
                if let Some(id) = &routed.target {
                    if let Some(slice) = state.targeted.get_mut(id) {
                        app.reduce_targeted(slice, action);
                    }
                }
            }
            Scope::Shared => {
                if let Some(id) = &routed.target {
                    if let Some(slice) = state.shared.get_mut(id) {
                        app.reduce_shared(slice, action);
                    }
                }
            }
            Scope::Protocol if action.name == protocol::CONNECTED => {
                if let Some(id) = &routed.target {
                    // First connection for this id ever: build its slices.
                    // Reconnects must not reset pre-existing state.
                    if !state.has_client(id) {
                        let (targeted, shared) = app.initial_client_state(id, state);
                        state.targeted.insert(id.clone(), targeted);
                        state.shared.insert(id.clone(), shared);
                    }
                }
            }
            Scope::Local | Scope::Request | Scope::Protocol => {}
        }
    }

    fn run_handlers(&mut self, routed: &RoutedAction) {
        let mut fx = Effects::default();
        {
            let Self { app, state, .. } = self;
            let action = &routed.action;
            match action.scope {
                Scope::Server => app.handle_server(&mut fx, state, action),
                Scope::Broadcast => app.handle_broadcast(&mut fx, state, action),
                Scope::Targeted => {
                    if let Some(id) = &routed.target {
                        app.handle_targeted(&mut fx, state, action, id);
                    }
                }
                Scope::Shared => {
                    if let Some(id) = &routed.target {
                        app.handle_shared(&mut fx, state, action, id);
                    }
                }
                Scope::Request => {
                    if let Some(id) = &routed.target {
                        app.handle_request(&mut fx, state, action, id);
                    }
                }
                Scope::Local | Scope::Protocol => {}
            }
        }
        self.drain_effects(fx);
    }

    fn drain_effects(&mut self, mut fx: Effects) {
        for (action, target) in fx.take() {
            match action.scope {
                Scope::Server | Scope::Broadcast => self.process(RoutedAction::internal(action)),
                Scope::Targeted | Scope::Shared | Scope::Request => match target {
                    Some(id) => self.process(RoutedAction::to_client(action, id)),
                    None => tracing::error!(
                        scope = %action.scope,
                        "handler dispatched a client-specific action without a target"
                    ),
                },
                Scope::Local | Scope::Protocol => tracing::error!(
                    scope = %action.scope,
                    "handler dispatched a scope the server store cannot route"
                ),
            }
        }
    }

    fn handle_protocol(&mut self, routed: &RoutedAction) {
        if routed.action.scope != Scope::Protocol {
            return;
        }
        match routed.action.name.as_str() {
            protocol::CONNECTED => {
                if let Some(session) = routed.origin.clone() {
                    let mut fx = Effects::default();
                    self.app.on_client_connected(&mut fx, &session);
                    self.drain_effects(fx);
                }
            }
            protocol::DISCONNECTED => {
                if let Some(session) = routed.origin.clone() {
                    let mut fx = Effects::default();
                    self.app.on_client_disconnected(&mut fx, &session);
                    self.drain_effects(fx);
                }
            }
            protocol::HANDSHAKE_REQUEST => self.finish_handshake(routed),
            _ => {}
        }
    }

    fn finish_handshake(&mut self, routed: &RoutedAction) {
        let Some(session) = routed.origin.clone() else {
            return;
        };
        let request: protocol::HandshakeRequest = match routed.action.parse_payload() {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(client_id = %session.id(), error = %e, "malformed handshake request");
                session.send(&protocol::error("malformed handshake request"));
                return;
            }
        };

        // Replay the backlog the client queued while offline, in order, as if
        // each action had just arrived from this connection.
        for queued in request.queued_actions {
            if let Err(e) = self.dispatch_from_client(queued, &session) {
                tracing::warn!(client_id = %session.id(), error = %e, "dropped invalid queued action");
            }
        }

        // Whatever the replay queued for this connection is covered by the
        // snapshot below and must not echo back as mirrored output.
        self.mirror.clear_for(session.key());

        match self.snapshot_for(session.id()) {
            Ok(initial_state) => {
                let reply =
                    protocol::handshake_reply(initial_state, self.app.version(), session.id());
                session.send(&reply);
                tracing::debug!(client_id = %session.id(), "handshake complete");
            }
            Err(e) => {
                tracing::error!(client_id = %session.id(), error = %e, "failed to snapshot state");
                session.send(&protocol::error("failed to build state snapshot"));
            }
        }
    }

    fn snapshot_for(&self, id: &ClientId) -> Result<InitialState, DispatchError> {
        let snapshot_err = |source| DispatchError::Snapshot {
            action: "serialize",
            source,
        };
        Ok(InitialState {
            broadcast: serde_json::to_value(&self.state.broadcast).map_err(snapshot_err)?,
            targeted: match self.state.targeted.get(id) {
                Some(slice) => serde_json::to_value(slice).map_err(snapshot_err)?,
                None => Value::Null,
            },
            shared: match self.state.shared.get(id) {
                Some(slice) => serde_json::to_value(slice).map_err(snapshot_err)?,
                None => Value::Null,
            },
        })
    }

    fn flush(&mut self) {
        for (session, actions) in self.mirror.take() {
            match actions.len() {
                0 => {}
                1 => {
                    session.send(&actions[0]);
                }
                n => {
                    tracing::trace!(client_id = %session.id(), actions = n, "flushing batch");
                    session.send(&protocol::batch(actions));
                }
            }
        }
    }
}
