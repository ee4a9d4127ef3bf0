use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};

use crew_core::errors::SourceError;
use crew_core::provider::{ChunkSource, ChunkStream, TurnRequest};

use crate::sse::data_payloads;

/// Pre-programmed output for one turn, for deterministic runs without a provider.
#[derive(Clone, Debug)]
pub enum ScriptedTurn {
    /// Yield these raw chunks in order.
    Chunks(Vec<String>),
    /// Yield chunks with a pause before each one.
    Paced(Duration, Vec<String>),
    /// Fail when the turn is opened.
    Error(SourceError),
}

impl ScriptedTurn {
    /// Anthropic payloads for a text-only reply.
    pub fn anthropic_text(text: &str) -> Self {
        Self::anthropic(Some(text), &[])
    }

    /// Anthropic payloads for an optional text block followed by tool calls.
    /// Arguments are streamed in two fragments to exercise accumulation.
    pub fn anthropic(text: Option<&str>, calls: &[(&str, &str, Value)]) -> Self {
        let mut chunks = vec![json!({"type": "message_start", "message": {"usage": {"input_tokens": 1}}})];
        let mut index = 0u64;
        if let Some(text) = text {
            chunks.push(json!({"type": "content_block_start", "index": index, "content_block": {"type": "text", "text": ""}}));
            chunks.push(json!({"type": "content_block_delta", "index": index, "delta": {"type": "text_delta", "text": text}}));
            chunks.push(json!({"type": "content_block_stop", "index": index}));
            index += 1;
        }
        for (id, name, args) in calls {
            let raw = args.to_string();
            let mut mid = raw.len() / 2;
            while !raw.is_char_boundary(mid) {
                mid -= 1;
            }
            let (head, tail) = raw.split_at(mid);
            chunks.push(json!({"type": "content_block_start", "index": index, "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}}));
            chunks.push(json!({"type": "content_block_delta", "index": index, "delta": {"type": "input_json_delta", "partial_json": head}}));
            chunks.push(json!({"type": "content_block_delta", "index": index, "delta": {"type": "input_json_delta", "partial_json": tail}}));
            chunks.push(json!({"type": "content_block_stop", "index": index}));
            index += 1;
        }
        let stop_reason = if calls.is_empty() { "end_turn" } else { "tool_use" };
        chunks.push(json!({"type": "message_delta", "delta": {"stop_reason": stop_reason}, "usage": {"output_tokens": 10}}));
        chunks.push(json!({"type": "message_stop"}));
        Self::Chunks(chunks.into_iter().map(|c| c.to_string()).collect())
    }

    pub fn paced(self, delay: Duration) -> Self {
        match self {
            Self::Chunks(chunks) | Self::Paced(_, chunks) => Self::Paced(delay, chunks),
            other => other,
        }
    }
}

/// Chunk source that replays scripted turns in sequence.
pub struct ScriptedSource {
    provider: String,
    turns: Vec<ScriptedTurn>,
    call_count: AtomicUsize,
    requests: Mutex<Vec<TurnRequest>>,
}

impl ScriptedSource {
    pub fn new(provider: impl Into<String>, turns: Vec<ScriptedTurn>) -> Self {
        Self {
            provider: provider.into(),
            turns,
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Every request this source was opened with, oldest first.
    pub fn requests(&self) -> Vec<TurnRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ChunkSource for ScriptedSource {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn open(&self, request: &TurnRequest) -> Result<ChunkStream, SourceError> {
        self.requests.lock().push(request.clone());
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);

        let Some(turn) = self.turns.get(idx) else {
            return Err(SourceError::Exhausted(format!(
                "no scripted turn for call {idx}"
            )));
        };

        match turn {
            ScriptedTurn::Chunks(chunks) => Ok(Box::pin(stream::iter(chunks.clone()))),
            ScriptedTurn::Paced(delay, chunks) => {
                let delay = *delay;
                Ok(Box::pin(stream::iter(chunks.clone()).then(move |chunk| async move {
                    tokio::time::sleep(delay).await;
                    chunk
                })))
            }
            ScriptedTurn::Error(e) => Err(e.clone()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    #[error("failed to read recording: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid recording: {0}")]
    Json(#[from] serde_json::Error),
}

/// A captured provider stream, one entry per turn.
///
/// File format: `{"provider": "anthropic", "turns": [...]}` where each turn is
/// either an array of chunks (strings or JSON objects) or one string of raw
/// SSE text.
#[derive(Clone, Debug)]
pub struct Recording {
    pub provider: String,
    pub turns: Vec<Vec<String>>,
}

#[derive(Deserialize)]
struct RecordingFile {
    provider: String,
    turns: Vec<RecordedTurn>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RecordedTurn {
    Sse(String),
    Chunks(Vec<Value>),
}

impl Recording {
    pub fn load(path: &Path) -> Result<Self, RecordingError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, RecordingError> {
        let file: RecordingFile = serde_json::from_str(text)?;
        let turns = file
            .turns
            .into_iter()
            .map(|turn| match turn {
                RecordedTurn::Sse(raw) => data_payloads(&raw),
                RecordedTurn::Chunks(chunks) => chunks
                    .into_iter()
                    .map(|c| match c {
                        Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .collect(),
            })
            .collect();
        Ok(Self {
            provider: file.provider,
            turns,
        })
    }

    pub fn into_source(self) -> ScriptedSource {
        let turns = self.turns.into_iter().map(ScriptedTurn::Chunks).collect();
        ScriptedSource::new(self.provider, turns)
    }
}
