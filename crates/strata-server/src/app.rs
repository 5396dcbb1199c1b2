use std::sync::Arc;

use serde::Serialize;
use strata_core::{Action, ClientId};

use crate::session::Session;
use crate::state::ServerState;

/// The application plugged into the server store.
///
/// Reducers must be pure with respect to their inputs: the store calls them
/// sequentially, one action at a time, so the total order of state changes
/// is exactly dispatch order. Reducers that do not recognize an action type
/// leave the state untouched.
///
/// Handlers run after reduction and may trigger follow-up dispatches through
/// [`Effects`]; everything they enqueue is processed within the same dispatch
/// chain and therefore lands in the same outgoing batch.
pub trait ServerApp: Sized + Send + 'static {
    /// Server-internal state, never visible to clients.
    type ServerState: Send;
    /// State mirrored identically to every connected client.
    type BroadcastState: Serialize + Send;
    /// Per-client state only the server may author.
    type TargetedState: Serialize + Send;
    /// Per-client state both the server and that client may author.
    type SharedState: Serialize + Send;

    /// Protocol version, compared exactly against each client's at handshake.
    fn version(&self) -> &str;

    /// Initial `(server, broadcast)` state at store construction.
    fn initial_state(&self) -> (Self::ServerState, Self::BroadcastState);

    /// Initial per-client slices, built when a logical id first connects.
    fn initial_client_state(
        &self,
        id: &ClientId,
        state: &ServerState<Self>,
    ) -> (Self::TargetedState, Self::SharedState);

    fn reduce_server(&self, _state: &mut Self::ServerState, _action: &Action) {}
    fn reduce_broadcast(&self, _state: &mut Self::BroadcastState, _action: &Action) {}
    fn reduce_targeted(&self, _state: &mut Self::TargetedState, _action: &Action) {}
    fn reduce_shared(&self, _state: &mut Self::SharedState, _action: &Action) {}

    fn handle_server(&mut self, _fx: &mut Effects, _state: &ServerState<Self>, _action: &Action) {}
    fn handle_broadcast(&mut self, _fx: &mut Effects, _state: &ServerState<Self>, _action: &Action) {
    }
    fn handle_targeted(
        &mut self,
        _fx: &mut Effects,
        _state: &ServerState<Self>,
        _action: &Action,
        _client: &ClientId,
    ) {
    }
    fn handle_shared(
        &mut self,
        _fx: &mut Effects,
        _state: &ServerState<Self>,
        _action: &Action,
        _client: &ClientId,
    ) {
    }
    /// One-shot requests: never stored, handler side effects only.
    fn handle_request(
        &mut self,
        _fx: &mut Effects,
        _state: &ServerState<Self>,
        _action: &Action,
        _client: &ClientId,
    ) {
    }

    /// A logical id went from zero to one live connections.
    fn on_client_connected(&mut self, _fx: &mut Effects, _session: &Arc<Session>) {}
    /// A logical id went from one to zero live connections. Its per-client
    /// state is still present.
    fn on_client_disconnected(&mut self, _fx: &mut Effects, _session: &Arc<Session>) {}
}

/// Follow-up dispatch queue handed to handlers and observers.
///
/// Actions enqueued here are drained by the store inside the current
/// dispatch chain, preserving the one-message-per-chain batching guarantee.
#[derive(Default)]
pub struct Effects {
    queue: Vec<(Action, Option<ClientId>)>,
}

impl Effects {
    /// Dispatch a `Server` or `Broadcast` action.
    pub fn dispatch(&mut self, action: Action) {
        self.queue.push((action, None));
    }

    /// Dispatch a client-specific (`Targeted`/`Shared`/`Request`) action.
    pub fn dispatch_to_client(&mut self, action: Action, client: &ClientId) {
        self.queue.push((action, Some(client.clone())));
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn take(&mut self) -> Vec<(Action, Option<ClientId>)> {
        std::mem::take(&mut self.queue)
    }
}
