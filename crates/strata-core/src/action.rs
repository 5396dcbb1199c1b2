use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Visibility/authority class of an action and of the state slice it targets.
///
/// Routing is derived entirely from the scope:
///
/// | Scope       | Authored by      | Mirrored to                          |
/// |-------------|------------------|--------------------------------------|
/// | `Server`    | server           | nobody (server-internal)             |
/// | `Broadcast` | server           | every connected client               |
/// | `Targeted`  | server           | the target client only               |
/// | `Shared`    | server or client | the target client, minus the author  |
/// | `Local`     | client           | nobody (client-internal)             |
/// | `Request`   | server or client | nobody (handler side effect only)    |
/// | `Protocol`  | engine           | engine-defined                       |
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Server,
    Broadcast,
    Targeted,
    Shared,
    Local,
    Request,
    Protocol,
}

impl Scope {
    /// Short lowercase name, matching the wire encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Broadcast => "broadcast",
            Self::Targeted => "targeted",
            Self::Shared => "shared",
            Self::Local => "local",
            Self::Request => "request",
            Self::Protocol => "protocol",
        }
    }

    /// Scopes whose actions affect one specific client's state slice and
    /// therefore require a target client id when dispatched server-side.
    pub fn is_client_specific(&self) -> bool {
        matches!(self, Self::Targeted | Self::Shared | Self::Request)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The wire envelope: `{scope, type, payload}` plus an out-of-band server
/// send-timestamp (`_time`, milliseconds since the epoch) stamped by the
/// server just before serialization and used by clients solely for
/// clock-offset estimation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub scope: Scope,
    #[serde(rename = "type")]
    pub name: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "_time", default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Action {
    pub fn new(scope: Scope, name: impl Into<String>, payload: Value) -> Self {
        Self {
            scope,
            name: name.into(),
            payload,
            timestamp: None,
        }
    }

    pub fn server(name: impl Into<String>, payload: Value) -> Self {
        Self::new(Scope::Server, name, payload)
    }

    pub fn broadcast(name: impl Into<String>, payload: Value) -> Self {
        Self::new(Scope::Broadcast, name, payload)
    }

    pub fn targeted(name: impl Into<String>, payload: Value) -> Self {
        Self::new(Scope::Targeted, name, payload)
    }

    pub fn shared(name: impl Into<String>, payload: Value) -> Self {
        Self::new(Scope::Shared, name, payload)
    }

    pub fn local(name: impl Into<String>, payload: Value) -> Self {
        Self::new(Scope::Local, name, payload)
    }

    pub fn request(name: impl Into<String>, payload: Value) -> Self {
        Self::new(Scope::Request, name, payload)
    }

    /// True when this is a protocol message of the given type.
    pub fn is_protocol(&self, name: &str) -> bool {
        self.scope == Scope::Protocol && self.name == name
    }

    /// Deserialize the payload into a typed structure.
    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Copy of this action stamped with a server send-timestamp.
    pub fn stamped(&self, timestamp_ms: i64) -> Self {
        let mut copy = self.clone();
        copy.timestamp = Some(timestamp_ms);
        copy
    }
}
