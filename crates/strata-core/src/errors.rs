use crate::action::Scope;

/// Dispatch and wire-handling failures.
///
/// Scope violations and malformed messages are local to one connection: the
/// engine reports them back as an `error` protocol message and leaves the
/// connection open. Snapshot failures indicate an integrator state type that
/// does not serialize cleanly and are surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("clients may not dispatch {0} actions")]
    DisallowedClientScope(Scope),

    #[error("{0} actions require a target client id")]
    MissingTarget(Scope),

    #[error("{0} actions cannot be dispatched on the server store")]
    NotServerDispatchable(Scope),

    #[error("{0} actions cannot be dispatched by the client application")]
    NotClientDispatchable(Scope),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("failed to {action} state snapshot: {source}")]
    Snapshot {
        action: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl DispatchError {
    /// Short classification string for logging and error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DisallowedClientScope(_) => "disallowed_client_scope",
            Self::MissingTarget(_) => "missing_target",
            Self::NotServerDispatchable(_) => "not_server_dispatchable",
            Self::NotClientDispatchable(_) => "not_client_dispatchable",
            Self::Malformed(_) => "malformed",
            Self::Snapshot { .. } => "snapshot",
        }
    }

    /// True for violations a remote peer caused, as opposed to local
    /// integrator mistakes.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::DisallowedClientScope(_) | Self::Malformed(_))
    }
}
