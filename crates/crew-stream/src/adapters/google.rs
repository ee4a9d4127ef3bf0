use serde::Deserialize;

use crew_core::provider::ProviderKind;
use crew_core::stream::CanonicalEvent;

use super::{decode, ProviderAdapter};
use crate::error::StreamParseError;
use crate::normalizer::StreamBuffers;

/// Gemini `streamGenerateContent` chunks. Function calls arrive whole, so
/// each one expands to start, a single delta and end.
pub struct GoogleAdapter;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Chunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
    function_call: Option<FunctionCall>,
}

#[derive(Deserialize)]
struct FunctionCall {
    id: Option<String>,
    name: String,
    args: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    candidates_token_count: Option<u32>,
}

#[derive(Deserialize)]
struct ErrorBody {
    status: Option<String>,
    message: String,
}

impl ProviderAdapter for GoogleAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    fn translate(
        &self,
        buffers: &mut StreamBuffers,
        chunk: &str,
    ) -> Result<Vec<CanonicalEvent>, StreamParseError> {
        let chunk: Chunk = decode(chunk)?;
        let mut events = Vec::new();

        if let Some(error) = chunk.error {
            let message = match error.status {
                Some(status) => format!("{status}: {}", error.message),
                None => error.message,
            };
            events.push(CanonicalEvent::Error { message });
            return Ok(events);
        }

        let output_tokens = chunk
            .usage_metadata
            .and_then(|u| u.candidates_token_count);

        let Some(candidate) = chunk.candidates.into_iter().next() else {
            return Ok(events);
        };

        events.extend(buffers.open_message());
        if let Some(tokens) = output_tokens {
            buffers.set_output_tokens(tokens);
        }

        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(call) = part.function_call {
                let slot = buffers.synthetic_slot();
                events.push(buffers.open_tool(slot, call.id.as_deref(), &call.name));
                let args = call
                    .args
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "{}".to_string());
                events.extend(buffers.push_tool_args(slot, &args));
                events.extend(buffers.close_tool(slot));
            } else if let Some(text) = part.text.as_deref() {
                if part.thought {
                    events.extend(buffers.push_thinking(text));
                } else {
                    events.extend(buffers.push_text(text));
                }
            }
        }

        if let Some(reason) = candidate.finish_reason {
            buffers.set_stop_reason(reason);
            events.extend(buffers.end_message());
        }

        Ok(events)
    }
}
