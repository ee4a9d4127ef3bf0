use crew_core::errors::SourceError;
use crew_core::ids::GroupId;
use crew_store::StoreError;

/// A turn that did not end with exactly one well-formed terminal action.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("turn ended without a terminal action")]
    NoTerminalAction,

    #[error("turn carried {count} terminal actions, expected exactly one")]
    MultipleTerminalActions { count: usize },

    #[error("tool call {tool} arrived after the terminal action")]
    ToolAfterTerminal { tool: String },

    #[error("malformed {tool} action: {reason}")]
    MalformedTerminal { tool: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("chunk source error: {0}")]
    Source(#[from] SourceError),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("fan-in error: {0}")]
    FanIn(#[from] FanInError),

    #[error("stream failed: {0}")]
    Stream(String),

    #[error("session cancelled")]
    Cancelled,

    #[error("max turns exceeded: {0}")]
    MaxTurnsExceeded(u32),

    #[error("project registry is shut down")]
    RegistryShutDown,

    #[error("invalid project root {path}: {reason}")]
    InvalidProject { path: String, reason: String },

    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FanInError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("group {group_id} has {completed} of {expected} completions")]
    Incomplete {
        group_id: GroupId,
        completed: usize,
        expected: u32,
    },

    #[error("downstream trigger failed: {0}")]
    Trigger(String),
}
