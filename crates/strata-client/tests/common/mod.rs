#![allow(dead_code)]

use std::sync::Arc;

use serde_json::json;
use strata_client::{ClientApp, Effects as ClientEffects};
use strata_core::{Action, ClientId};
use strata_server::{Effects as ServerEffects, ServerApp, ServerState, Session};

/// Server half of the test application: an append-only broadcast log, a
/// targeted number, and a per-client shared note list.
pub struct ServerCounter {
    pub version: String,
    pub connects: u32,
    pub disconnects: u32,
}

impl ServerCounter {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_owned(),
            connects: 0,
            disconnects: 0,
        }
    }
}

impl ServerApp for ServerCounter {
    type ServerState = ();
    type BroadcastState = Vec<String>;
    type TargetedState = i64;
    type SharedState = Vec<String>;

    fn version(&self) -> &str {
        &self.version
    }

    fn initial_state(&self) -> ((), Vec<String>) {
        ((), Vec::new())
    }

    fn initial_client_state(&self, _id: &ClientId, _state: &ServerState<Self>) -> (i64, Vec<String>) {
        (0, Vec::new())
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

    fn handle_request(
        &mut self,
        fx: &mut ServerEffects,
        _state: &ServerState<Self>,
        action: &Action,
        _client: &ClientId,
    ) {
        if action.name == "fanout" {
            let n = action.payload.as_u64().unwrap_or(0);
            for i in 0..n {
                fx.dispatch(Action::broadcast("log/append", json!(format!("line{i}"))));
            }
        }
    }

    fn on_client_connected(&mut self, _fx: &mut ServerEffects, _session: &Arc<Session>) {
        self.connects += 1;
    }

    fn on_client_disconnected(&mut self, _fx: &mut ServerEffects, _session: &Arc<Session>) {
        self.disconnects += 1;
    }
}

/// Client half: same reducers over the mirrored slices.
pub struct ClientCounter {
    pub version: String,
    pub mismatches: Vec<(String, String)>,
}

impl ClientCounter {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_owned(),
            mismatches: Vec::new(),
        }
    }
}

impl ClientApp for ClientCounter {
    type BroadcastState = Vec<String>;
    type TargetedState = i64;
    type SharedState = Vec<String>;
    type LocalState = u32;

    fn version(&self) -> &str {
        &self.version
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

    fn on_version_mismatch(&mut self, _fx: &mut ClientEffects, local: &str, server: &str) {
        self.mismatches.push((local.to_owned(), server.to_owned()));
    }
}
