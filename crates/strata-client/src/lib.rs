//! # strata-client
//!
//! Client side of the strata replication protocol: a local mirror of the
//! server's visible state, an offline backlog, and a reconnecting WebSocket
//! transport.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `app` | `ClientApp` integrator trait: reducers, handlers, callbacks |
//! | `store` | Mirror state, dispatch pipeline, backlog, handshake handling |
//! | `conn` | `ServerConnection` transport capability trait |
//! | `websocket` | tokio-tungstenite transport with debounced reconnection |
//!
//! All mirror mutation flows through [`store::ClientHandle::dispatch`] and
//! the inbound-message path, serialized by a single mutex. Transports call
//! back into the handle from their own tasks; the handle is cheap to clone
//! and `Send`.

#![deny(unsafe_code)]

pub mod app;
pub mod conn;
pub mod store;
pub mod websocket;

pub use app::{ClientApp, Effects};
pub use conn::ServerConnection;
pub use store::{ClientHandle, ClientState, MetaState};
pub use websocket::WebSocketConnection;
