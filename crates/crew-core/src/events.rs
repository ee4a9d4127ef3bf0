use serde::{Deserialize, Serialize};

use crate::ids::{GroupId, SessionId, ToolCallId};

/// Session lifecycle events broadcast to observers while sessions run.
/// The turn log is the durable record; these are for live consumers only.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    TurnStart {
        session_id: SessionId,
        turn: u32,
    },

    TextDelta {
        session_id: SessionId,
        delta: String,
    },

    ThinkingDelta {
        session_id: SessionId,
        delta: String,
    },

    ToolStart {
        session_id: SessionId,
        tool_call_id: ToolCallId,
        tool_name: String,
    },

    ToolEnd {
        session_id: SessionId,
        tool_call_id: ToolCallId,
        success: bool,
        result_preview: String,
        duration_ms: u64,
    },

    TurnComplete {
        session_id: SessionId,
        turn: u32,
        checkpoint: bool,
    },

    TurnFailed {
        session_id: SessionId,
        turn: u32,
        reason: String,
    },

    SessionFinalized {
        session_id: SessionId,
        summary: String,
    },

    FanInTriggered {
        session_id: SessionId,
        group_id: GroupId,
    },
}

impl AgentEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::TurnStart { session_id, .. }
            | Self::TextDelta { session_id, .. }
            | Self::ThinkingDelta { session_id, .. }
            | Self::ToolStart { session_id, .. }
            | Self::ToolEnd { session_id, .. }
            | Self::TurnComplete { session_id, .. }
            | Self::TurnFailed { session_id, .. }
            | Self::SessionFinalized { session_id, .. }
            | Self::FanInTriggered { session_id, .. } => session_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TurnStart { .. } => "turn_start",
            Self::TextDelta { .. } => "text_delta",
            Self::ThinkingDelta { .. } => "thinking_delta",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::TurnComplete { .. } => "turn_complete",
            Self::TurnFailed { .. } => "turn_failed",
            Self::SessionFinalized { .. } => "session_finalized",
            Self::FanInTriggered { .. } => "fan_in_triggered",
        }
    }
}
