use serde::de::DeserializeOwned;
use strata_core::Action;

use crate::store::ClientState;

/// The application plugged into the client store.
///
/// The mirrored slice types must deserialize from the snapshot the server
/// sends at handshake; the reducers must match the server's for the shared
/// scopes, or the mirror will drift between handshakes.
pub trait ClientApp: Sized + Send + 'static {
    /// Mirror of the server's broadcast slice.
    type BroadcastState: DeserializeOwned + Send;
    /// Mirror of this client's targeted slice.
    type TargetedState: DeserializeOwned + Send;
    /// Mirror of this client's shared slice.
    type SharedState: DeserializeOwned + Send;
    /// Client-only state, never transmitted.
    type LocalState: Send;

    /// Protocol version, compared exactly against the server's at handshake.
    fn version(&self) -> &str;

    /// Initial `(broadcast, targeted, shared, local)` mirror state, used
    /// until the first handshake snapshot arrives.
    fn initial_state(
        &self,
    ) -> (
        Self::BroadcastState,
        Self::TargetedState,
        Self::SharedState,
        Self::LocalState,
    );

    fn reduce_broadcast(&self, _state: &mut Self::BroadcastState, _action: &Action) {}
    fn reduce_targeted(&self, _state: &mut Self::TargetedState, _action: &Action) {}
    fn reduce_shared(&self, _state: &mut Self::SharedState, _action: &Action) {}
    fn reduce_local(&self, _state: &mut Self::LocalState, _action: &Action) {}

    fn handle_broadcast(&mut self, _fx: &mut Effects, _state: &ClientState<Self>, _action: &Action) {
    }
    fn handle_targeted(&mut self, _fx: &mut Effects, _state: &ClientState<Self>, _action: &Action) {}
    fn handle_shared(&mut self, _fx: &mut Effects, _state: &ClientState<Self>, _action: &Action) {}
    fn handle_local(&mut self, _fx: &mut Effects, _state: &ClientState<Self>, _action: &Action) {}
    /// Runs before a locally-dispatched request is forwarded to the server.
    fn handle_request(&mut self, _fx: &mut Effects, _state: &ClientState<Self>, _action: &Action) {}

    /// The connection came up. The handshake request has not been sent yet.
    fn on_connected(&mut self, _fx: &mut Effects) {}
    /// The connection dropped. The transport decides whether to reconnect.
    fn on_disconnected(&mut self, _fx: &mut Effects) {}
    /// The handshake reply carried a different protocol version. The reply's
    /// snapshot was discarded; the mirror still holds its pre-handshake
    /// state. The engine does not close the connection.
    fn on_version_mismatch(&mut self, fx: &mut Effects, local: &str, server: &str);
}

/// Follow-up dispatch queue handed to client handlers and callbacks.
///
/// Enqueued actions run through the normal local dispatch pipeline within
/// the same chain, so `Shared`/`Request` effects are forwarded (or
/// backlogged) like any direct dispatch.
#[derive(Default)]
pub struct Effects {
    queue: Vec<Action>,
}

impl Effects {
    /// Dispatch a `Shared`, `Local`, or `Request` action.
    pub fn dispatch(&mut self, action: Action) {
        self.queue.push(action);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn take(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.queue)
    }
}
