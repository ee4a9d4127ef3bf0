use serde::{Deserialize, Serialize};

use crate::ids::TodoId;

/// Reserved tool name for "checkpoint and continue in a new turn".
pub const CHECKPOINT_TOOL: &str = "Checkpoint";
/// Reserved tool name for "this session is done".
pub const FINALIZE_TOOL: &str = "Finalize";

pub fn is_terminal_tool(name: &str) -> bool {
    name == CHECKPOINT_TOOL || name == FINALIZE_TOOL
}

/// Shape of a structured question for the human operator.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    SingleSelect,
    MultiSelect,
    Ranked,
    FreeText,
}

impl QuestionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleSelect => "single_select",
            Self::MultiSelect => "multi_select",
            Self::Ranked => "ranked",
            Self::FreeText => "free_text",
        }
    }

    /// Free text questions carry no options; every other kind needs some.
    pub fn needs_options(&self) -> bool {
        !matches!(self, Self::FreeText)
    }
}

impl std::fmt::Display for QuestionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QuestionKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single_select" => Ok(Self::SingleSelect),
            "multi_select" => Ok(Self::MultiSelect),
            "ranked" => Ok(Self::Ranked),
            "free_text" => Ok(Self::FreeText),
            other => Err(format!("unknown question type: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionDraft {
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// Open work persisted when a turn ends with a checkpoint.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointPayload {
    #[serde(default)]
    pub questions: Vec<QuestionDraft>,
    #[serde(default)]
    pub notes: Vec<String>,
    /// New todo items.
    #[serde(default)]
    pub todos: Vec<String>,
    /// Existing todos whose completion flag flips.
    #[serde(default)]
    pub toggle_todos: Vec<TodoId>,
}

/// The single decision that ends a turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TerminalAction {
    Checkpoint(CheckpointPayload),
    Finalize { summary: String },
}

#[derive(Deserialize)]
struct FinalizePayload {
    summary: String,
}

impl TerminalAction {
    /// Parse the arguments of a reserved terminal tool call.
    pub fn from_call(name: &str, args: &serde_json::Value) -> Result<Self, String> {
        match name {
            CHECKPOINT_TOOL => {
                let payload: CheckpointPayload = serde_json::from_value(args.clone())
                    .map_err(|e| format!("invalid {CHECKPOINT_TOOL} payload: {e}"))?;
                for (i, q) in payload.questions.iter().enumerate() {
                    if q.prompt.trim().is_empty() {
                        return Err(format!("question {} has an empty prompt", i + 1));
                    }
                    if q.kind.needs_options() && q.options.is_empty() {
                        return Err(format!(
                            "question {} is {} but has no options",
                            i + 1,
                            q.kind
                        ));
                    }
                }
                Ok(Self::Checkpoint(payload))
            }
            FINALIZE_TOOL => {
                let payload: FinalizePayload = serde_json::from_value(args.clone())
                    .map_err(|e| format!("invalid {FINALIZE_TOOL} payload: {e}"))?;
                Ok(Self::Finalize {
                    summary: payload.summary,
                })
            }
            other => Err(format!("{other} is not a terminal action")),
        }
    }

    pub fn tool_name(&self) -> &'static str {
        match self {
            Self::Checkpoint(_) => CHECKPOINT_TOOL,
            Self::Finalize { .. } => FINALIZE_TOOL,
        }
    }
}
