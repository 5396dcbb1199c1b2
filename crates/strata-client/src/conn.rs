use std::sync::Arc;

use strata_core::Action;

use crate::app::ClientApp;
use crate::store::ClientHandle;

/// Transport capability implemented by concrete connection backends.
///
/// The transport owns the socket lifecycle and calls back into the handle it
/// was opened with: [`ClientHandle::connection_opened`] when the link comes
/// up, [`ClientHandle::receive_frame`] per inbound frame, and
/// [`ClientHandle::connection_closed`] when the link drops.
pub trait ServerConnection<A: ClientApp>: Send + Sync {
    /// Start (or restart) the connection. Callbacks target `store`.
    fn open(self: Arc<Self>, store: ClientHandle<A>);

    /// Hand one action to the transport. `false` means it was not accepted
    /// (not currently connected); the caller backlogs it.
    fn send(&self, action: &Action) -> bool;

    /// Tear the connection down and stop reconnecting.
    fn close(&self);
}
