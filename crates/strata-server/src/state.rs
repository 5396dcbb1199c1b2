use std::collections::HashMap;

use strata_core::ClientId;

use crate::app::ServerApp;

/// The authoritative scoped state.
///
/// `server` and `broadcast` are process-wide; `targeted` and `shared` hold
/// one slice per logical client id. Per-client slices are created exactly
/// once, on a client's first connection, and survive disconnects until the
/// integrator explicitly purges them.
pub struct ServerState<A: ServerApp> {
    pub server: A::ServerState,
    pub broadcast: A::BroadcastState,
    pub targeted: HashMap<ClientId, A::TargetedState>,
    pub shared: HashMap<ClientId, A::SharedState>,
}

impl<A: ServerApp> ServerState<A> {
    pub fn new(app: &A) -> Self {
        let (server, broadcast) = app.initial_state();
        Self {
            server,
            broadcast,
            targeted: HashMap::new(),
            shared: HashMap::new(),
        }
    }

    /// Whether per-client slices exist for this id.
    pub fn has_client(&self, id: &ClientId) -> bool {
        self.targeted.contains_key(id) && self.shared.contains_key(id)
    }
}
