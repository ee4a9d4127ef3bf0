use serde::Deserialize;

use crew_core::provider::ProviderKind;
use crew_core::stream::CanonicalEvent;

use super::{decode, ProviderAdapter};
use crate::error::StreamParseError;
use crate::normalizer::StreamBuffers;

/// Anthropic Messages API `data:` payloads.
pub struct AnthropicAdapter;

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Payload {
    MessageStart {},
    ContentBlockStart { index: u64, content_block: Block },
    ContentBlockDelta { index: u64, delta: Delta },
    ContentBlockStop { index: u64 },
    MessageDelta {
        #[serde(default)]
        delta: Option<MessageDeltaBody>,
        #[serde(default)]
        usage: Option<Usage>,
    },
    MessageStop {},
    Ping {},
    Error { error: ErrorBody },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Block {
    ToolUse { id: String, name: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn translate(
        &self,
        buffers: &mut StreamBuffers,
        chunk: &str,
    ) -> Result<Vec<CanonicalEvent>, StreamParseError> {
        let payload: Payload = decode(chunk)?;
        let mut events = Vec::new();

        match payload {
            Payload::MessageStart {} => events.extend(buffers.open_message()),
            Payload::ContentBlockStart {
                index,
                content_block: Block::ToolUse { id, name },
            } => events.push(buffers.open_tool(index, Some(&id), &name)),
            Payload::ContentBlockStart { .. } => {}
            Payload::ContentBlockDelta { index, delta } => match delta {
                Delta::TextDelta { text } => events.extend(buffers.push_text(&text)),
                Delta::ThinkingDelta { thinking } => events.extend(buffers.push_thinking(&thinking)),
                Delta::InputJsonDelta { partial_json } => {
                    events.extend(buffers.push_tool_args(index, &partial_json))
                }
                Delta::Other => {}
            },
            Payload::ContentBlockStop { index } => events.extend(buffers.close_tool(index)),
            Payload::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.and_then(|d| d.stop_reason) {
                    buffers.set_stop_reason(reason);
                }
                if let Some(tokens) = usage.and_then(|u| u.output_tokens) {
                    buffers.set_output_tokens(tokens);
                }
            }
            Payload::MessageStop {} => events.extend(buffers.end_message()),
            Payload::Error { error } => events.push(CanonicalEvent::Error {
                message: format!("{}: {}", error.error_type, error.message),
            }),
            Payload::Ping {} | Payload::Unknown => {}
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use crate::normalizer::StreamNormalizer;
    use crew_core::stream::{CanonicalEvent, ToolArguments};

    fn feed(n: &mut StreamNormalizer, chunks: &[&str]) -> Vec<CanonicalEvent> {
        chunks
            .iter()
            .flat_map(|c| n.normalize("anthropic", c))
            .collect()
    }

    #[test]
    fn text_and_thinking_stream() {
        let mut n = StreamNormalizer::new();
        let events = feed(
            &mut n,
            &[
                r#"{"type":"message_start","message":{"id":"msg_1","usage":{"input_tokens":10}}}"#,
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"Let me look"}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"abc"}}"#,
                r#"{"type":"content_block_stop","index":0}"#,
                r#"{"type":"content_block_start","index":1,"content_block":{"type":"text","text":""}}"#,
                r#"{"type":"ping"}"#,
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"Hello"}}"#,
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":" world"}}"#,
                r#"{"type":"content_block_stop","index":1}"#,
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn","stop_sequence":null},"usage":{"output_tokens":42}}"#,
                r#"{"type":"message_stop"}"#,
            ],
        );

        assert_eq!(
            events,
            vec![
                CanonicalEvent::MessageStart,
                CanonicalEvent::ThinkingDelta {
                    delta: "Let me look".into()
                },
                CanonicalEvent::TextDelta {
                    delta: "Hello".into()
                },
                CanonicalEvent::TextDelta {
                    delta: " world".into()
                },
                CanonicalEvent::MessageEnd {
                    stop_reason: Some("end_turn".into()),
                    output_tokens: Some(42),
                },
            ]
        );
        assert_eq!(n.buffers().text(), "Hello world");
        assert_eq!(n.buffers().thinking(), "Let me look");
    }

    #[test]
    fn tool_arguments_accumulate_across_chunks() {
        let mut n = StreamNormalizer::new();
        let events = feed(
            &mut n,
            &[
                r#"{"type":"message_start","message":{}}"#,
                r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_01","name":"Edit","input":{}}}"#,
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":""}}"#,
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"file_path\": \"src/m"}}"#,
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"ain.rs\", \"old_string\": \"a\", \"new_string\": \"b\"}"}}"#,
                r#"{"type":"content_block_stop","index":1}"#,
            ],
        );

        assert_eq!(events.len(), 5);
        assert!(matches!(&events[1], CanonicalEvent::ToolUseStart { name, .. } if name == "Edit"));
        match &events[4] {
            CanonicalEvent::ToolUseEnd { id, name, arguments } => {
                assert_eq!(id.as_str(), "toolu_01");
                assert_eq!(name, "Edit");
                assert_eq!(arguments.value().unwrap()["file_path"], "src/main.rs");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_arguments_still_end_the_call() {
        let mut n = StreamNormalizer::new();
        let events = feed(
            &mut n,
            &[
                r#"{"type":"message_start","message":{}}"#,
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_02","name":"Write","input":{}}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"content\": \"unterminated"}}"#,
                r#"{"type":"content_block_stop","index":0}"#,
            ],
        );
        match events.last() {
            Some(CanonicalEvent::ToolUseEnd {
                arguments: ToolArguments::Malformed { raw, .. },
                ..
            }) => assert_eq!(raw, r#"{"content": "unterminated"#),
            other => panic!("expected malformed end, got {other:?}"),
        }
    }

    #[test]
    fn error_payload_becomes_error_event() {
        let mut n = StreamNormalizer::new();
        let events = n.normalize(
            "anthropic",
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        );
        assert_eq!(
            events,
            vec![CanonicalEvent::Error {
                message: "overloaded_error: Overloaded".into()
            }]
        );
    }

    #[test]
    fn unknown_event_type_is_ignored() {
        let mut n = StreamNormalizer::new();
        assert!(n
            .normalize("anthropic", r#"{"type":"future_event","data":1}"#)
            .is_empty());
    }

    #[test]
    fn missing_type_is_a_shape_error() {
        let mut n = StreamNormalizer::new();
        assert!(n.normalize("anthropic", r#"{"index":0}"#).is_empty());
    }
}
