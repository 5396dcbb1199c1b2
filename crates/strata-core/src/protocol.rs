//! Protocol (engine-internal) messages.
//!
//! These ride the same envelope as application actions, under
//! [`Scope::Protocol`], but never touch integrator reducers beyond the
//! session bookkeeping the engine performs itself.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::action::{Action, Scope};
use crate::ids::ClientId;

/// Several actions wrapped in one ordered network message.
pub const BATCH: &str = "batch";
/// Connection established (0→1 live connections for a logical id).
pub const CONNECTED: &str = "connected";
/// Connection lost (1→0 live connections for a logical id).
pub const DISCONNECTED: &str = "disconnected";
/// Client-initiated handshake carrying the offline backlog.
pub const HANDSHAKE_REQUEST: &str = "handshakeRequest";
/// Server handshake reply carrying version, assigned id, and a snapshot.
pub const HANDSHAKE_REPLY: &str = "handshakeReply";
/// Error report to one connection.
pub const ERROR: &str = "error";
/// Periodic advisory message, mostly for clock synchronization.
pub const HEARTBEAT: &str = "heartbeat";

/// Payload of a [`BATCH`] message. Contents are applied in order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchPayload {
    pub actions: Vec<Action>,
}

/// Payload of a [`HANDSHAKE_REQUEST`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    #[serde(default)]
    pub queued_actions: Vec<Action>,
}

/// Snapshot slices carried by a [`HANDSHAKE_REPLY`], serialized from the
/// server's authoritative state for one client id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitialState {
    pub broadcast: Value,
    pub targeted: Value,
    pub shared: Value,
}

/// Payload of a [`HANDSHAKE_REPLY`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeReply {
    pub initial_state: InitialState,
    pub version: String,
    pub id: ClientId,
}

/// Payload of an [`ERROR`] message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

pub fn batch(actions: Vec<Action>) -> Action {
    Action::new(Scope::Protocol, BATCH, json!({ "actions": actions }))
}

pub fn connected() -> Action {
    Action::new(Scope::Protocol, CONNECTED, Value::Null)
}

pub fn disconnected() -> Action {
    Action::new(Scope::Protocol, DISCONNECTED, Value::Null)
}

pub fn handshake_request(queued_actions: Vec<Action>) -> Action {
    Action::new(
        Scope::Protocol,
        HANDSHAKE_REQUEST,
        json!({ "queuedActions": queued_actions }),
    )
}

pub fn handshake_reply(initial_state: InitialState, version: &str, id: &ClientId) -> Action {
    Action::new(
        Scope::Protocol,
        HANDSHAKE_REPLY,
        json!({
            "initialState": initial_state,
            "version": version,
            "id": id,
        }),
    )
}

pub fn error(message: impl Into<String>) -> Action {
    Action::new(Scope::Protocol, ERROR, json!({ "message": message.into() }))
}

pub fn heartbeat() -> Action {
    Action::new(Scope::Protocol, HEARTBEAT, Value::Null)
}
