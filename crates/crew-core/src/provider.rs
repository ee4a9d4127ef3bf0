use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::SourceError;
use crate::ids::SessionId;

/// Providers with a stream adapter. Adding a variant forces an adapter to be
/// wired in wherever adapters are selected.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    Google,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [Self::Anthropic, Self::OpenAi, Self::Google];
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anthropic => f.write_str("anthropic"),
            Self::OpenAi => f.write_str("openai"),
            Self::Google => f.write_str("google"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" | "codex" => Ok(Self::OpenAi),
            "google" | "gemini" => Ok(Self::Google),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// Who produced a transcript entry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptRole {
    Assistant,
    Thought,
    ToolCall,
    ToolResult,
}

/// One rehydrated history entry handed back to the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub turn_index: u32,
    pub role: TranscriptRole,
    pub content: String,
}

/// Everything a chunk source needs to produce one turn of model output.
/// Built from durable records only, so it can be rebuilt after the
/// in-memory context has been discarded.
#[derive(Clone, Debug)]
pub struct TurnRequest {
    pub session_id: SessionId,
    pub turn_index: u32,
    pub agent_role: String,
    pub checkpoint: String,
    pub history: Vec<TranscriptEntry>,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Ordered source of raw provider chunks for a turn.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Opaque provider tag passed to the stream normalizer.
    fn provider(&self) -> &str;

    async fn open(&self, request: &TurnRequest) -> Result<ChunkStream, SourceError>;
}
