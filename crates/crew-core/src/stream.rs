use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;

/// Provider-agnostic events produced by the stream normalizer. Ordering contract
/// within one model response:
///
/// MessageStart → (TextDelta | ThinkingDelta |
///                 ToolUseStart → ToolUseDelta* → ToolUseEnd)* → MessageEnd
///
/// Error can appear at any point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalEvent {
    MessageStart,
    TextDelta {
        delta: String,
    },
    ThinkingDelta {
        delta: String,
    },
    ToolUseStart {
        id: ToolCallId,
        name: String,
    },
    ToolUseDelta {
        id: ToolCallId,
        delta: String,
    },
    ToolUseEnd {
        id: ToolCallId,
        name: String,
        arguments: ToolArguments,
    },
    MessageEnd {
        #[serde(skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output_tokens: Option<u32>,
    },
    Error {
        message: String,
    },
}

impl CanonicalEvent {
    /// Short classification string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageStart => "message_start",
            Self::TextDelta { .. } => "text_delta",
            Self::ThinkingDelta { .. } => "thinking_delta",
            Self::ToolUseStart { .. } => "tool_use_start",
            Self::ToolUseDelta { .. } => "tool_use_delta",
            Self::ToolUseEnd { .. } => "tool_use_end",
            Self::MessageEnd { .. } => "message_end",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::MessageEnd { .. } | Self::Error { .. })
    }
}

/// Arguments of a finished tool call. Malformed argument strings stay visible
/// so the caller can report them back to the agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolArguments {
    Parsed { value: serde_json::Value },
    Malformed { raw: String, error: String },
}

impl ToolArguments {
    /// Parse an accumulated argument buffer. An empty buffer is an empty object.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::Parsed {
                value: serde_json::Value::Object(serde_json::Map::new()),
            };
        }
        match serde_json::from_str(raw) {
            Ok(value) => Self::Parsed { value },
            Err(e) => Self::Malformed {
                raw: raw.to_string(),
                error: e.to_string(),
            },
        }
    }

    pub fn value(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Parsed { value } => Some(value),
            Self::Malformed { .. } => None,
        }
    }

    /// JSON form suitable for persisting as tool input.
    pub fn to_record(&self) -> serde_json::Value {
        match self {
            Self::Parsed { value } => value.clone(),
            Self::Malformed { raw, error } => serde_json::json!({
                "_raw": raw,
                "_parse_error": error,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        let end = CanonicalEvent::MessageEnd {
            stop_reason: Some("end_turn".into()),
            output_tokens: None,
        };
        assert!(end.is_terminal());
        assert!(CanonicalEvent::Error { message: "x".into() }.is_terminal());
        assert!(!CanonicalEvent::TextDelta { delta: "x".into() }.is_terminal());
    }

    #[test]
    fn parse_valid_arguments() {
        let args = ToolArguments::parse(r#"{"file_path":"a.rs"}"#);
        assert_eq!(args.value().unwrap()["file_path"], "a.rs");
    }

    #[test]
    fn empty_arguments_are_empty_object() {
        let args = ToolArguments::parse("  ");
        assert_eq!(args.value(), Some(&serde_json::json!({})));
    }

    #[test]
    fn malformed_arguments_keep_raw_text() {
        let args = ToolArguments::parse(r#"{"file_path": "a.rs""#);
        match &args {
            ToolArguments::Malformed { raw, error } => {
                assert_eq!(raw, r#"{"file_path": "a.rs""#);
                assert!(!error.is_empty());
            }
            other => panic!("expected Malformed, got {other:?}"),
        }
        assert_eq!(args.to_record()["_raw"], r#"{"file_path": "a.rs""#);
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let evt = CanonicalEvent::ToolUseStart {
            id: ToolCallId::from_raw("toolu_1"),
            name: "Read".into(),
        };
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["type"], "tool_use_start");
        assert_eq!(json["name"], "Read");
        assert_eq!(evt.kind(), "tool_use_start");
    }
}
