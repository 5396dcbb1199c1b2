use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use strata_core::ClientId;

use crate::session::Session;

/// Live connections and the logical ids behind them.
///
/// A logical id may be backed by zero, one, or several simultaneous physical
/// connections (multiple tabs). Connect/disconnect transitions are only
/// reported at the 0→1 and 1→0 boundaries; the store turns those edges into
/// `connected`/`disconnected` protocol actions.
#[derive(Default)]
pub struct ClientRegistry {
    connections: Vec<Arc<Session>>,
    unique: HashSet<ClientId>,
    disconnected_at: HashMap<ClientId, DateTime<Utc>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a live connection. Returns `true` when this is the id's 0→1 edge.
    pub fn add(&mut self, session: Arc<Session>) -> bool {
        let id = session.id().clone();
        self.connections.push(session);
        if self.unique.insert(id.clone()) {
            self.disconnected_at.remove(&id);
            true
        } else {
            false
        }
    }

    /// Remove a connection. Returns `true` when this was the id's 1→0 edge.
    /// Idempotent: removing an unknown connection is a no-op returning false.
    pub fn remove(&mut self, session: &Arc<Session>) -> bool {
        let before = self.connections.len();
        self.connections.retain(|c| c.key() != session.key());
        if self.connections.len() == before {
            return false;
        }
        let id = session.id();
        if self.connections.iter().any(|c| c.id() == id) {
            return false;
        }
        if self.unique.remove(id) {
            self.disconnected_at.insert(id.clone(), Utc::now());
            true
        } else {
            false
        }
    }

    pub fn connections(&self) -> impl Iterator<Item = &Arc<Session>> {
        self.connections.iter()
    }

    pub fn connections_for<'a>(
        &'a self,
        id: &'a ClientId,
    ) -> impl Iterator<Item = &'a Arc<Session>> {
        self.connections.iter().filter(move |c| c.id() == id)
    }

    pub fn is_connected(&self, id: &ClientId) -> bool {
        self.unique.contains(id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// True when nobody that matters is connected. With
    /// `count_non_human = false`, bot connections are ignored.
    pub fn is_empty(&self, count_non_human: bool) -> bool {
        !self
            .connections
            .iter()
            .any(|c| c.is_human() || count_non_human)
    }

    /// When each currently-absent id last dropped to zero connections.
    pub fn disconnected_at(&self, id: &ClientId) -> Option<DateTime<Utc>> {
        self.disconnected_at.get(id).copied()
    }

    /// Absent ids whose last disconnect is older than the given instant.
    pub fn idle_since(&self, cutoff: DateTime<Utc>) -> Vec<ClientId> {
        self.disconnected_at
            .iter()
            .filter(|(_, at)| **at <= cutoff)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Forget an absent id's disconnect record.
    pub fn forget(&mut self, id: &ClientId) {
        self.disconnected_at.remove(id);
    }

    /// Drop every connection record. Does not close transports; the store's
    /// shutdown path does that first.
    pub fn clear(&mut self) {
        self.connections.clear();
        self.unique.clear();
        self.disconnected_at.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::LocalTransport;

    fn session(id: &str, is_human: bool) -> Arc<Session> {
        let (transport, _rx) = LocalTransport::channel();
        Arc::new(Session::new(
            ClientId::from_raw(id),
            is_human,
            true,
            Box::new(transport),
        ))
    }

    #[test]
    fn connect_edge_fires_only_once_per_id() {
        let mut registry = ClientRegistry::new();
        let tab1 = session("alice", true);
        let tab2 = session("alice", true);

        assert!(registry.add(tab1.clone()));
        assert!(!registry.add(tab2.clone()));
        assert_eq!(registry.connection_count(), 2);
        assert!(registry.is_connected(&ClientId::from_raw("alice")));
    }

    #[test]
    fn disconnect_edge_fires_only_on_last_connection() {
        let mut registry = ClientRegistry::new();
        let tab1 = session("alice", true);
        let tab2 = session("alice", true);
        registry.add(tab1.clone());
        registry.add(tab2.clone());

        assert!(!registry.remove(&tab1));
        assert!(registry.is_connected(&ClientId::from_raw("alice")));
        assert!(registry.remove(&tab2));
        assert!(!registry.is_connected(&ClientId::from_raw("alice")));
    }

    #[test]
    fn remove_unknown_connection_is_noop() {
        let mut registry = ClientRegistry::new();
        let known = session("alice", true);
        let unknown = session("bob", true);
        registry.add(known);
        assert!(!registry.remove(&unknown));
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut registry = ClientRegistry::new();
        let conn = session("alice", true);
        registry.add(conn.clone());
        assert!(registry.remove(&conn));
        assert!(!registry.remove(&conn));
    }

    #[test]
    fn is_empty_ignores_bots_by_default() {
        let mut registry = ClientRegistry::new();
        assert!(registry.is_empty(false));
        assert!(registry.is_empty(true));

        registry.add(session("bot", false));
        assert!(registry.is_empty(false));
        assert!(!registry.is_empty(true));

        registry.add(session("alice", true));
        assert!(!registry.is_empty(false));
    }

    #[test]
    fn disconnect_records_idle_timestamp() {
        let mut registry = ClientRegistry::new();
        let conn = session("alice", true);
        registry.add(conn.clone());
        let alice = ClientId::from_raw("alice");
        assert!(registry.disconnected_at(&alice).is_none());

        registry.remove(&conn);
        assert!(registry.disconnected_at(&alice).is_some());
        assert_eq!(registry.idle_since(Utc::now()).len(), 1);

        // Reconnecting clears the idle record.
        registry.add(session("alice", true));
        assert!(registry.disconnected_at(&alice).is_none());
    }

    #[test]
    fn connections_for_filters_by_id() {
        let mut registry = ClientRegistry::new();
        registry.add(session("alice", true));
        registry.add(session("alice", true));
        registry.add(session("bob", true));
        let alice = ClientId::from_raw("alice");
        assert_eq!(registry.connections_for(&alice).count(), 2);
    }
}
