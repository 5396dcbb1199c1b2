//! # strata-server
//!
//! Authoritative side of the strata replication protocol.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `app` | `ServerApp` integrator trait: reducers, handlers, observers |
//! | `state` | Scoped authoritative state container |
//! | `registry` | Live connections, unique logical ids, connect/disconnect edges |
//! | `session` | Transport capability trait + per-connection session wrapper |
//! | `store` | Sequential dispatch pipeline, mirroring engine, handshake |
//! | `server` | axum WebSocket runtime, heartbeat, handshake watchdog |
//!
//! All state mutation flows through [`store::ServerStore::dispatch`] and its
//! siblings, serialized by a single mutex held for the duration of a full
//! (possibly reentrant) dispatch chain. Socket I/O lives outside that
//! critical section: sends are non-blocking handoffs to per-connection
//! writer tasks.

#![deny(unsafe_code)]

pub mod app;
pub mod registry;
pub mod server;
pub mod session;
pub mod state;
pub mod store;

pub use app::{Effects, ServerApp};
pub use registry::ClientRegistry;
pub use server::{serve, SharedStore, WsServerConfig, WsServerHandle};
pub use session::{LocalReceiver, LocalTransport, Session, Transport};
pub use state::ServerState;
pub use store::ServerStore;
