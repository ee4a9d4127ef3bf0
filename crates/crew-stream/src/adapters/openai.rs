use serde::Deserialize;

use crew_core::provider::ProviderKind;
use crew_core::stream::CanonicalEvent;

use super::{decode, ProviderAdapter};
use crate::error::StreamParseError;
use crate::normalizer::StreamBuffers;

/// OpenAI chat-completions streaming chunks.
pub struct OpenAiAdapter;

const DONE_SENTINEL: &str = "[DONE]";

#[derive(Deserialize)]
struct Chunk {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct Choice {
    delta: Option<ChoiceDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    index: u64,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn translate(
        &self,
        buffers: &mut StreamBuffers,
        chunk: &str,
    ) -> Result<Vec<CanonicalEvent>, StreamParseError> {
        if chunk.trim() == DONE_SENTINEL {
            return Ok(buffers.finish_message());
        }
        let chunk: Chunk = decode(chunk)?;
        let mut events = Vec::new();

        if let Some(error) = chunk.error {
            events.push(CanonicalEvent::Error {
                message: error.message,
            });
            return Ok(events);
        }

        let output_tokens = chunk.usage.and_then(|u| u.completion_tokens);

        // Usage-only chunks arrive with an empty choices array, after the
        // finish_reason chunk.
        let Some(choice) = chunk.choices.into_iter().next() else {
            if let Some(tokens) = output_tokens {
                buffers.set_output_tokens(tokens);
                events.extend(buffers.finish_message());
            }
            return Ok(events);
        };

        events.extend(buffers.open_message());
        if let Some(tokens) = output_tokens {
            buffers.set_output_tokens(tokens);
        }

        if let Some(delta) = choice.delta {
            if let Some(reasoning) = delta.reasoning_content.as_deref() {
                events.extend(buffers.push_thinking(reasoning));
            }
            if let Some(content) = delta.content.as_deref() {
                events.extend(buffers.push_text(content));
            }
            for call in delta.tool_calls {
                let (name, arguments) = match call.function {
                    Some(f) => (f.name, f.arguments),
                    None => (None, None),
                };
                if !buffers.has_slot(call.index) {
                    events.push(buffers.open_tool(
                        call.index,
                        call.id.as_deref(),
                        name.as_deref().unwrap_or_default(),
                    ));
                }
                if let Some(arguments) = arguments.as_deref() {
                    events.extend(buffers.push_tool_args(call.index, arguments));
                }
            }
        }

        // The message stays open until usage arrives or the stream says [DONE].
        if let Some(reason) = choice.finish_reason {
            buffers.set_stop_reason(reason);
            events.extend(buffers.close_all_tools());
            if output_tokens.is_some() {
                events.extend(buffers.end_message());
            }
        }

        Ok(events)
    }
}
