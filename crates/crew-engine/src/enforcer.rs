use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crew_core::events::AgentEvent;
use crew_core::ids::{SessionId, ToolCallId};
use crew_core::protocol::{is_terminal_tool, TerminalAction, CHECKPOINT_TOOL};
use crew_core::provider::{ChunkSource, TranscriptEntry, TranscriptRole, TurnRequest};
use crew_core::stream::{CanonicalEvent, ToolArguments};
use crew_core::tools::{ToolContext, ToolOutcome};
use crew_store::checkpoints::CheckpointView;
use crew_store::questions::QuestionStatus;
use crew_store::sessions::SessionRow;
use crew_store::turns::{TurnEntry, TurnRow};
use crew_store::{CheckpointRepo, Database, NewInvocation, StoreError, TurnLog, TurnRecord};
use crew_stream::StreamNormalizer;

use crate::dispatcher::{Dispatched, ToolDispatcher};
use crate::error::{EngineError, ProtocolViolation};
use crate::truncate;

const PREVIEW_CHARS: usize = 200;
const AFTER_TERMINAL_OUTPUT: &str = "not dispatched: tool call after the terminal action";

/// Where the enforcer is within the current turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnState {
    AwaitingOutput,
    Streaming,
    ToolDispatch,
    Decided,
}

/// How a decided turn ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnDecision {
    /// Checkpoint persisted; the session continues with a new turn.
    Continue { turn_index: u32 },
    /// The session is complete.
    Finalized { summary: String },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
}

/// What one turn's stream produced, gathered while it is consumed.
#[derive(Default)]
struct TurnAccumulator {
    block: Option<(BlockKind, String)>,
    terminal_calls: usize,
    terminal: Option<Result<TerminalAction, (String, String)>>,
    after_terminal: Option<String>,
    token_count: u32,
}

impl TurnAccumulator {
    fn verdict(&mut self) -> Result<TerminalAction, ProtocolViolation> {
        if self.terminal_calls > 1 {
            return Err(ProtocolViolation::MultipleTerminalActions {
                count: self.terminal_calls,
            });
        }
        if let Some(tool) = self.after_terminal.take() {
            return Err(ProtocolViolation::ToolAfterTerminal { tool });
        }
        match self.terminal.take() {
            None => Err(ProtocolViolation::NoTerminalAction),
            Some(Ok(action)) => Ok(action),
            Some(Err((tool, reason))) => Err(ProtocolViolation::MalformedTerminal { tool, reason }),
        }
    }
}

/// Drives one session's turns and holds each to exactly one terminal action.
pub struct TurnProtocolEnforcer {
    session_id: SessionId,
    role: String,
    normalizer: StreamNormalizer,
    log: TurnLog,
    checkpoints: CheckpointRepo,
    dispatcher: Arc<ToolDispatcher>,
    ctx: ToolContext,
    events: broadcast::Sender<AgentEvent>,
    state: TurnState,
}

impl TurnProtocolEnforcer {
    pub fn new(
        db: &Database,
        session: &SessionRow,
        ctx: ToolContext,
        dispatcher: Arc<ToolDispatcher>,
        events: broadcast::Sender<AgentEvent>,
    ) -> Self {
        Self {
            session_id: session.id.clone(),
            role: session.agent_role.clone(),
            normalizer: StreamNormalizer::new(),
            log: TurnLog::new(db.clone()),
            checkpoints: CheckpointRepo::new(db.clone()),
            dispatcher,
            ctx,
            events,
            state: TurnState::AwaitingOutput,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Stream one turn to its end, dispatching tool calls as they finish.
    /// The returned handle must be decided to seal the turn.
    #[instrument(skip(self, source, cancel), fields(session_id = %self.session_id, provider = source.provider()))]
    pub async fn run_turn(
        &mut self,
        source: &dyn ChunkSource,
        cancel: &CancellationToken,
    ) -> Result<TurnHandle<'_>, EngineError> {
        self.normalizer.reset();
        self.state = TurnState::AwaitingOutput;

        let opened = self.log.begin_turn(&self.session_id, &self.role)?;
        let turn = opened.turn;
        if opened.resumed {
            let interrupted = self.log.interrupt_pending(&turn.id)?;
            warn!(turn_index = turn.turn_index, interrupted, "continuing an interrupted turn");
        }
        self.emit(AgentEvent::TurnStart {
            session_id: self.session_id.clone(),
            turn: turn.turn_index,
        });

        let request = self.build_request(&turn)?;
        let mut stream = match source.open(&request).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(kind = e.error_kind(), retryable = e.is_retryable(), error = %e, "chunk source failed");
                self.abandon(&turn, &format!("chunk source failed: {e}"), 0)?;
                return Err(e.into());
            }
        };

        self.state = TurnState::Streaming;
        let mut acc = TurnAccumulator::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                chunk = stream.next() => Some(chunk),
            };
            let chunk = match next {
                None => return Err(self.cancel_turn(&turn, &mut acc)),
                Some(None) => break,
                Some(Some(chunk)) => chunk,
            };

            for event in self.normalizer.normalize(source.provider(), &chunk) {
                if cancel.is_cancelled() {
                    return Err(self.cancel_turn(&turn, &mut acc));
                }
                self.handle_event(&turn, event, &mut acc).await?;
            }
        }
        for event in self.normalizer.finish() {
            self.handle_event(&turn, event, &mut acc).await?;
        }
        self.flush(&turn, &mut acc)?;

        debug!(
            turn_index = turn.turn_index,
            terminal_calls = acc.terminal_calls,
            tokens = acc.token_count,
            "turn stream finished"
        );
        let verdict = acc.verdict();
        Ok(TurnHandle {
            enforcer: self,
            turn,
            token_count: acc.token_count,
            verdict,
        })
    }

    async fn handle_event(
        &mut self,
        turn: &TurnRow,
        event: CanonicalEvent,
        acc: &mut TurnAccumulator,
    ) -> Result<(), EngineError> {
        match event {
            CanonicalEvent::MessageStart => {}
            CanonicalEvent::TextDelta { delta } => {
                self.push_delta(turn, acc, BlockKind::Text, &delta)?;
                self.emit(AgentEvent::TextDelta {
                    session_id: self.session_id.clone(),
                    delta,
                });
            }
            CanonicalEvent::ThinkingDelta { delta } => {
                self.push_delta(turn, acc, BlockKind::Thinking, &delta)?;
                self.emit(AgentEvent::ThinkingDelta {
                    session_id: self.session_id.clone(),
                    delta,
                });
            }
            CanonicalEvent::ToolUseStart { .. } | CanonicalEvent::ToolUseDelta { .. } => {
                self.flush(turn, acc)?;
            }
            CanonicalEvent::ToolUseEnd {
                id,
                name,
                arguments,
            } => {
                self.flush(turn, acc)?;
                self.handle_call(turn, acc, id, name, arguments).await?;
            }
            CanonicalEvent::MessageEnd { output_tokens, .. } => {
                self.flush(turn, acc)?;
                acc.token_count = acc.token_count.saturating_add(output_tokens.unwrap_or(0));
            }
            CanonicalEvent::Error { message } => {
                self.flush(turn, acc)?;
                self.abandon(turn, &format!("stream error: {message}"), acc.token_count)?;
                return Err(EngineError::Stream(message));
            }
        }
        Ok(())
    }

    async fn handle_call(
        &mut self,
        turn: &TurnRow,
        acc: &mut TurnAccumulator,
        call_id: ToolCallId,
        name: String,
        arguments: ToolArguments,
    ) -> Result<(), EngineError> {
        let new = NewInvocation {
            call_id: call_id.clone(),
            name: name.clone(),
            rationale: arguments
                .value()
                .and_then(|v| v.get("rationale"))
                .and_then(|v| v.as_str())
                .map(String::from),
            input: arguments.to_record(),
        };

        if is_terminal_tool(&name) {
            acc.terminal_calls += 1;
            let parsed = match &arguments {
                ToolArguments::Parsed { value } => TerminalAction::from_call(&name, value),
                ToolArguments::Malformed { error, .. } => {
                    Err(format!("arguments are not valid JSON: {error}"))
                }
            };
            let invocation = self.log.start_tool_invocation(&turn.id, &new)?;
            let (success, output) = match &parsed {
                Ok(_) => (true, "recorded".to_string()),
                Err(reason) => (false, reason.clone()),
            };
            self.log.finish_tool_invocation(&invocation.id, success, &output)?;
            if acc.terminal.is_none() {
                acc.terminal = Some(parsed.map_err(|reason| (name, reason)));
            }
            return Ok(());
        }

        if acc.terminal_calls > 0 {
            warn!(tool = %name, "tool call after the terminal action");
            let invocation = self.log.start_tool_invocation(&turn.id, &new)?;
            self.log
                .finish_tool_invocation(&invocation.id, false, AFTER_TERMINAL_OUTPUT)?;
            acc.after_terminal.get_or_insert(name);
            return Ok(());
        }

        self.state = TurnState::ToolDispatch;
        self.emit(AgentEvent::ToolStart {
            session_id: self.session_id.clone(),
            tool_call_id: call_id.clone(),
            tool_name: name.clone(),
        });
        let invocation = self.log.start_tool_invocation(&turn.id, &new)?;

        let Dispatched { outcome, duration } = match arguments {
            ToolArguments::Parsed { value } => self.dispatcher.execute(&name, value, &self.ctx).await,
            ToolArguments::Malformed { error, .. } => Dispatched {
                outcome: ToolOutcome::failed(format!("invalid arguments for {name}: {error}")),
                duration: Duration::ZERO,
            },
        };

        self.log
            .finish_tool_invocation(&invocation.id, outcome.success, &outcome.output)?;
        self.emit(AgentEvent::ToolEnd {
            session_id: self.session_id.clone(),
            tool_call_id: call_id,
            success: outcome.success,
            result_preview: truncate::preview(&outcome.output, PREVIEW_CHARS),
            duration_ms: duration.as_millis() as u64,
        });
        self.state = TurnState::Streaming;
        Ok(())
    }

    fn push_delta(
        &self,
        turn: &TurnRow,
        acc: &mut TurnAccumulator,
        kind: BlockKind,
        delta: &str,
    ) -> Result<(), EngineError> {
        if let Some((current, buf)) = &mut acc.block {
            if *current == kind {
                buf.push_str(delta);
                return Ok(());
            }
        }
        self.flush(turn, acc)?;
        acc.block = Some((kind, delta.to_string()));
        Ok(())
    }

    /// Persist the coalesced text or thinking block, if any.
    fn flush(&self, turn: &TurnRow, acc: &mut TurnAccumulator) -> Result<(), EngineError> {
        match acc.block.take() {
            Some((_, buf)) if buf.is_empty() => {}
            Some((BlockKind::Text, buf)) => {
                self.log.append_message(&turn.id, &buf)?;
            }
            Some((BlockKind::Thinking, buf)) => {
                self.log.append_thought(&turn.id, &buf)?;
            }
            None => {}
        }
        Ok(())
    }

    fn cancel_turn(&mut self, turn: &TurnRow, acc: &mut TurnAccumulator) -> EngineError {
        let recorded = match self.flush(turn, acc) {
            Ok(()) => self.abandon(turn, "cancelled", acc.token_count),
            Err(e) => Err(e),
        };
        match recorded {
            Ok(()) => EngineError::Cancelled,
            Err(e) => {
                error!(error = %e, turn_index = turn.turn_index, "failed to record cancelled turn");
                e
            }
        }
    }

    fn abandon(&mut self, turn: &TurnRow, reason: &str, token_count: u32) -> Result<(), EngineError> {
        self.state = TurnState::Decided;
        self.log.fail_turn(&turn.id, reason, token_count)?;
        self.emit(AgentEvent::TurnFailed {
            session_id: self.session_id.clone(),
            turn: turn.turn_index,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Rebuild the turn request from durable records only.
    fn build_request(&self, turn: &TurnRow) -> Result<TurnRequest, EngineError> {
        let view = self.checkpoints.view(&self.session_id)?;
        let history = self.log.session_history(&self.session_id)?;
        Ok(TurnRequest {
            session_id: self.session_id.clone(),
            turn_index: turn.turn_index,
            agent_role: self.role.clone(),
            checkpoint: render_checkpoint(&view),
            history: transcript(&history),
        })
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }
}

/// A streamed turn waiting for its single decision.
#[must_use = "a turn stays streaming until it is decided"]
pub struct TurnHandle<'a> {
    enforcer: &'a mut TurnProtocolEnforcer,
    turn: TurnRow,
    token_count: u32,
    verdict: Result<TerminalAction, ProtocolViolation>,
}

impl std::fmt::Debug for TurnHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnHandle")
            .field("turn", &self.turn)
            .field("token_count", &self.token_count)
            .field("verdict", &self.verdict)
            .finish()
    }
}

impl TurnHandle<'_> {
    pub fn turn(&self) -> &TurnRow {
        &self.turn
    }

    /// The terminal action the turn carried, when it was well formed.
    pub fn action(&self) -> Option<&TerminalAction> {
        self.verdict.as_ref().ok()
    }

    /// Seal the turn. Consumes the handle, so a turn is decided once.
    #[instrument(skip(self), fields(session_id = %self.enforcer.session_id, turn_index = self.turn.turn_index))]
    pub fn decide(self) -> Result<TurnDecision, EngineError> {
        let TurnHandle {
            enforcer,
            turn,
            token_count,
            verdict,
        } = self;
        enforcer.state = TurnState::Decided;
        let session_id = enforcer.session_id.clone();

        match verdict {
            Ok(TerminalAction::Checkpoint(payload)) => {
                match enforcer.checkpoints.apply(&session_id, &turn.id, &payload) {
                    Ok(applied) => debug!(
                        questions = applied.questions.len(),
                        notes = applied.notes.len(),
                        "checkpoint persisted"
                    ),
                    Err(e @ (StoreError::NotFound(_) | StoreError::Conflict(_))) => {
                        return Err(reject(
                            enforcer,
                            &turn,
                            token_count,
                            ProtocolViolation::MalformedTerminal {
                                tool: CHECKPOINT_TOOL.to_string(),
                                reason: e.to_string(),
                            },
                        ));
                    }
                    Err(e) => {
                        enforcer.abandon(&turn, &format!("checkpoint not persisted: {e}"), token_count)?;
                        return Err(e.into());
                    }
                }
                enforcer.log.complete_turn(&turn.id, token_count)?;
                enforcer.emit(AgentEvent::TurnComplete {
                    session_id,
                    turn: turn.turn_index,
                    checkpoint: true,
                });
                Ok(TurnDecision::Continue {
                    turn_index: turn.turn_index,
                })
            }
            Ok(TerminalAction::Finalize { summary }) => {
                enforcer.log.complete_turn(&turn.id, token_count)?;
                enforcer.log.complete_session(&session_id)?;
                enforcer.emit(AgentEvent::TurnComplete {
                    session_id: session_id.clone(),
                    turn: turn.turn_index,
                    checkpoint: false,
                });
                enforcer.emit(AgentEvent::SessionFinalized {
                    session_id,
                    summary: summary.clone(),
                });
                Ok(TurnDecision::Finalized { summary })
            }
            Err(v) => Err(reject(enforcer, &turn, token_count, v)),
        }
    }
}

fn reject(
    enforcer: &mut TurnProtocolEnforcer,
    turn: &TurnRow,
    token_count: u32,
    violation: ProtocolViolation,
) -> EngineError {
    error!(
        session_id = %enforcer.session_id,
        turn_index = turn.turn_index,
        violation = %violation,
        "protocol violation, turn failed"
    );
    if let Err(e) = enforcer.abandon(turn, &violation.to_string(), token_count) {
        return e;
    }
    violation.into()
}

/// Text block carried into every turn: notes, open todos and questions.
pub fn render_checkpoint(view: &CheckpointView) -> String {
    let mut out = String::new();
    if !view.notes.is_empty() {
        out.push_str("Notes:\n");
        for note in &view.notes {
            let _ = writeln!(out, "- {}", note.content);
        }
    }
    let open: Vec<_> = view.open_todos().collect();
    if !open.is_empty() {
        out.push_str("Open todos:\n");
        for todo in open {
            let _ = writeln!(out, "- [{}] {}", todo.id, todo.content);
        }
    }
    if !view.questions.is_empty() {
        out.push_str("Questions:\n");
        for q in &view.questions {
            let _ = writeln!(out, "- [{}] ({}) {}", q.id, q.kind, q.prompt);
            if !q.options.is_empty() {
                let _ = writeln!(out, "  options: {}", q.options.join(", "));
            }
            let status = match (&q.status, &q.answer) {
                (QuestionStatus::Answered, Some(answer)) => format!("answered: {answer}"),
                (status, _) => status.to_string(),
            };
            let _ = writeln!(out, "  {status}");
        }
    }
    out
}

/// Flatten recorded turns into the transcript handed back to the model.
pub fn transcript(history: &[TurnRecord]) -> Vec<TranscriptEntry> {
    let mut entries = Vec::new();
    for record in history {
        let turn_index = record.turn.turn_index;
        for entry in record.entries() {
            match entry {
                TurnEntry::Message(m) => entries.push(TranscriptEntry {
                    turn_index,
                    role: TranscriptRole::Assistant,
                    content: m.content.clone(),
                }),
                TurnEntry::Thought(t) => entries.push(TranscriptEntry {
                    turn_index,
                    role: TranscriptRole::Thought,
                    content: t.content.clone(),
                }),
                TurnEntry::Invocation(inv) => {
                    entries.push(TranscriptEntry {
                        turn_index,
                        role: TranscriptRole::ToolCall,
                        content: format!("{} {}", inv.name, inv.input),
                    });
                    if let Some(output) = &inv.output {
                        entries.push(TranscriptEntry {
                            turn_index,
                            role: TranscriptRole::ToolResult,
                            content: output.clone(),
                        });
                    }
                }
            }
        }
    }
    entries
}
