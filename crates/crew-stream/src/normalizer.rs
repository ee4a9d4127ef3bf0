use std::collections::HashMap;

use crew_core::ids::ToolCallId;
use crew_core::provider::ProviderKind;
use crew_core::stream::{CanonicalEvent, ToolArguments};
use tracing::{debug, warn};

use crate::adapters::adapter_for;

struct PendingCall {
    name: String,
    arguments: String,
}

/// Accumulation state for one session's in-flight model response.
///
/// Adapters address tool calls by a provider-local slot (Anthropic block
/// index, OpenAI tool_calls index, a synthetic counter for Gemini); the
/// buffers map each slot to the call id and its argument string.
#[derive(Default)]
pub struct StreamBuffers {
    text: String,
    thinking: String,
    tool_args: HashMap<ToolCallId, PendingCall>,
    slots: HashMap<u64, ToolCallId>,
    open_order: Vec<u64>,
    next_synthetic_slot: u64,
    message_open: bool,
    stop_reason: Option<String>,
    output_tokens: Option<u32>,
}

impl StreamBuffers {
    /// All text streamed since the last reset.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// All thinking text streamed since the last reset.
    pub fn thinking(&self) -> &str {
        &self.thinking
    }

    pub fn pending_tool_calls(&self) -> usize {
        self.tool_args.len()
    }

    pub fn is_message_open(&self) -> bool {
        self.message_open
    }

    pub(crate) fn open_message(&mut self) -> Option<CanonicalEvent> {
        if self.message_open {
            return None;
        }
        self.message_open = true;
        self.stop_reason = None;
        self.output_tokens = None;
        Some(CanonicalEvent::MessageStart)
    }

    pub(crate) fn push_text(&mut self, delta: &str) -> Option<CanonicalEvent> {
        if delta.is_empty() {
            return None;
        }
        self.text.push_str(delta);
        Some(CanonicalEvent::TextDelta {
            delta: delta.to_string(),
        })
    }

    pub(crate) fn push_thinking(&mut self, delta: &str) -> Option<CanonicalEvent> {
        if delta.is_empty() {
            return None;
        }
        self.thinking.push_str(delta);
        Some(CanonicalEvent::ThinkingDelta {
            delta: delta.to_string(),
        })
    }

    pub(crate) fn has_slot(&self, slot: u64) -> bool {
        self.slots.contains_key(&slot)
    }

    pub(crate) fn synthetic_slot(&mut self) -> u64 {
        // Kept far away from real provider indices.
        let slot = u64::MAX - self.next_synthetic_slot;
        self.next_synthetic_slot += 1;
        slot
    }

    pub(crate) fn open_tool(&mut self, slot: u64, id: Option<&str>, name: &str) -> CanonicalEvent {
        let id = match id {
            Some(raw) if !raw.is_empty() => ToolCallId::from_raw(raw),
            _ => ToolCallId::new(),
        };
        self.tool_args.insert(
            id.clone(),
            PendingCall {
                name: name.to_string(),
                arguments: String::new(),
            },
        );
        self.slots.insert(slot, id.clone());
        self.open_order.push(slot);
        CanonicalEvent::ToolUseStart {
            id,
            name: name.to_string(),
        }
    }

    pub(crate) fn push_tool_args(&mut self, slot: u64, delta: &str) -> Option<CanonicalEvent> {
        if delta.is_empty() {
            return None;
        }
        let id = self.slots.get(&slot)?;
        let pending = self.tool_args.get_mut(id)?;
        pending.arguments.push_str(delta);
        Some(CanonicalEvent::ToolUseDelta {
            id: id.clone(),
            delta: delta.to_string(),
        })
    }

    pub(crate) fn close_tool(&mut self, slot: u64) -> Option<CanonicalEvent> {
        let id = self.slots.remove(&slot)?;
        self.open_order.retain(|s| *s != slot);
        let pending = self.tool_args.remove(&id)?;
        Some(CanonicalEvent::ToolUseEnd {
            id,
            name: pending.name,
            arguments: ToolArguments::parse(&pending.arguments),
        })
    }

    pub(crate) fn close_all_tools(&mut self) -> Vec<CanonicalEvent> {
        let order = std::mem::take(&mut self.open_order);
        order
            .into_iter()
            .filter_map(|slot| self.close_tool(slot))
            .collect()
    }

    pub(crate) fn set_stop_reason(&mut self, reason: impl Into<String>) {
        self.stop_reason = Some(reason.into());
    }

    pub(crate) fn set_output_tokens(&mut self, tokens: u32) {
        self.output_tokens = Some(tokens);
    }

    /// Close any tool call the provider left open, then the message.
    pub(crate) fn end_message(&mut self) -> Vec<CanonicalEvent> {
        let mut events = self.close_all_tools();
        self.message_open = false;
        events.push(CanonicalEvent::MessageEnd {
            stop_reason: self.stop_reason.take(),
            output_tokens: self.output_tokens.take(),
        });
        events
    }

    /// End the message if one is still open.
    pub(crate) fn finish_message(&mut self) -> Vec<CanonicalEvent> {
        if self.message_open {
            self.end_message()
        } else {
            Vec::new()
        }
    }
}

/// Converts raw provider chunks into canonical events. One instance per
/// session; `reset` must be called at the start of every turn.
#[derive(Default)]
pub struct StreamNormalizer {
    buffers: StreamBuffers,
}

impl StreamNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.buffers = StreamBuffers::default();
    }

    pub fn buffers(&self) -> &StreamBuffers {
        &self.buffers
    }

    /// Call once the provider stream is exhausted. Closes a message the
    /// provider never ended, such as one still waiting for trailing usage.
    pub fn finish(&mut self) -> Vec<CanonicalEvent> {
        self.buffers.finish_message()
    }

    /// Normalize one chunk tagged with an opaque provider name. Unknown
    /// providers and malformed chunks yield no events.
    pub fn normalize(&mut self, provider: &str, chunk: &str) -> Vec<CanonicalEvent> {
        match provider.parse::<ProviderKind>() {
            Ok(kind) => self.normalize_kind(kind, chunk),
            Err(_) => {
                warn!(provider, "no stream adapter for provider, chunk dropped");
                Vec::new()
            }
        }
    }

    pub fn normalize_kind(&mut self, kind: ProviderKind, chunk: &str) -> Vec<CanonicalEvent> {
        match adapter_for(kind).translate(&mut self.buffers, chunk) {
            Ok(events) => {
                debug!(provider = %kind, count = events.len(), "chunk normalized");
                events
            }
            Err(e) => {
                warn!(provider = %kind, error = %e, "unparseable stream chunk skipped");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_yields_nothing() {
        let mut n = StreamNormalizer::new();
        let events = n.normalize("mistral", r#"{"type":"message_start"}"#);
        assert!(events.is_empty());
        assert!(!n.buffers().is_message_open());
    }

    #[test]
    fn malformed_chunk_leaves_buffers_untouched() {
        let mut n = StreamNormalizer::new();
        n.normalize("anthropic", r#"{"type":"message_start","message":{}}"#);
        n.normalize(
            "anthropic",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#,
        );
        let events = n.normalize("anthropic", "{not json");
        assert!(events.is_empty());
        assert_eq!(n.buffers().text(), "hi");
        assert!(n.buffers().is_message_open());
    }

    #[test]
    fn reset_clears_every_buffer() {
        let mut n = StreamNormalizer::new();
        n.normalize("anthropic", r#"{"type":"message_start","message":{}}"#);
        n.normalize(
            "anthropic",
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"Read","input":{}}}"#,
        );
        n.normalize(
            "anthropic",
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"file_pa"}}"#,
        );
        assert_eq!(n.buffers().pending_tool_calls(), 1);

        n.reset();
        assert_eq!(n.buffers().pending_tool_calls(), 0);
        assert!(n.buffers().text().is_empty());
        assert!(!n.buffers().is_message_open());

        // A stale delta for the old block no longer resolves to a call.
        let events = n.normalize(
            "anthropic",
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"th\"}"}}"#,
        );
        assert!(events.is_empty());
    }

    #[test]
    fn end_message_closes_dangling_tool_calls() {
        let mut buffers = StreamBuffers::default();
        buffers.open_message();
        buffers.open_tool(0, Some("call_a"), "Glob");
        buffers.push_tool_args(0, r#"{"pattern":"*.rs"}"#);
        buffers.open_tool(1, Some("call_b"), "Grep");

        let events = buffers.end_message();
        assert_eq!(events.len(), 3);
        match &events[0] {
            CanonicalEvent::ToolUseEnd { id, arguments, .. } => {
                assert_eq!(id.as_str(), "call_a");
                assert_eq!(arguments.value().unwrap()["pattern"], "*.rs");
            }
            other => panic!("unexpected {other:?}"),
        }
        match &events[1] {
            CanonicalEvent::ToolUseEnd { id, arguments, .. } => {
                assert_eq!(id.as_str(), "call_b");
                assert_eq!(arguments.value(), Some(&serde_json::json!({})));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(events[2], CanonicalEvent::MessageEnd { .. }));
        assert_eq!(buffers.pending_tool_calls(), 0);
    }

    #[test]
    fn missing_tool_id_gets_generated() {
        let mut buffers = StreamBuffers::default();
        let evt = buffers.open_tool(3, None, "Read");
        match evt {
            CanonicalEvent::ToolUseStart { id, .. } => assert!(id.as_str().starts_with("toolu_")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
