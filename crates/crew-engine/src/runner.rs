use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crew_core::events::AgentEvent;
use crew_core::ids::SessionId;
use crew_core::provider::ChunkSource;
use crew_core::tools::ToolContext;
use crew_store::sessions::SessionRow;
use crew_store::{Database, TurnLog};

use crate::dispatcher::ToolDispatcher;
use crate::enforcer::{TurnDecision, TurnProtocolEnforcer};
use crate::error::EngineError;
use crate::positions::DEFAULT_MERGE_GAP;
use crate::tools::EditFeedback;

/// Configuration for the session runner.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub max_turns: u32,
    /// Lines of context around edited ranges in edit tool feedback.
    pub context_lines: usize,
    pub merge_gap: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_turns: 50,
            context_lines: 3,
            merge_gap: DEFAULT_MERGE_GAP,
        }
    }
}

impl RunnerConfig {
    pub fn edit_feedback(&self) -> EditFeedback {
        EditFeedback {
            context_lines: self.context_lines,
            merge_gap: self.merge_gap,
        }
    }
}

/// A session that reached Finalize.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionOutcome {
    pub session_id: SessionId,
    pub summary: String,
    pub turns: u32,
}

/// Runs a session's turns until it finalizes.
pub struct SessionRunner {
    db: Database,
    dispatcher: Arc<ToolDispatcher>,
    config: RunnerConfig,
    events: broadcast::Sender<AgentEvent>,
}

impl SessionRunner {
    pub fn new(
        db: Database,
        dispatcher: Arc<ToolDispatcher>,
        config: RunnerConfig,
        events: broadcast::Sender<AgentEvent>,
    ) -> Self {
        Self {
            db,
            dispatcher,
            config,
            events,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Loop turns until Finalize. Cancellation and the turn limit fail the
    /// session; protocol violations and stream failures fail only the turn
    /// and leave the session resumable.
    #[instrument(skip(self, session, ignore_patterns, source, cancel), fields(session_id = %session.id, role = %session.agent_role))]
    pub async fn run(
        &self,
        session: &SessionRow,
        ignore_patterns: Vec<String>,
        source: &dyn ChunkSource,
        cancel: &CancellationToken,
    ) -> Result<SessionOutcome, EngineError> {
        let log = TurnLog::new(self.db.clone());
        let ctx = ToolContext {
            session_id: session.id.clone(),
            sandbox_root: PathBuf::from(&session.sandbox_root),
            alternate_root: session.alternate_root.as_ref().map(PathBuf::from),
            ignore_patterns,
            abort_signal: cancel.clone(),
        };
        let mut enforcer = TurnProtocolEnforcer::new(
            &self.db,
            session,
            ctx,
            Arc::clone(&self.dispatcher),
            self.events.clone(),
        );

        loop {
            if cancel.is_cancelled() {
                log.fail_session(&session.id, "cancelled")?;
                return Err(EngineError::Cancelled);
            }

            let started = log.list_turns(&session.id)?.len() as u32;
            if log.streaming_turn(&session.id)?.is_none() && started >= self.config.max_turns {
                warn!(max_turns = self.config.max_turns, "session exceeded max turns");
                log.fail_session(
                    &session.id,
                    &format!("max turns exceeded ({})", self.config.max_turns),
                )?;
                return Err(EngineError::MaxTurnsExceeded(self.config.max_turns));
            }

            let handle = match enforcer.run_turn(source, cancel).await {
                Ok(handle) => handle,
                Err(EngineError::Cancelled) => {
                    log.fail_session(&session.id, "cancelled")?;
                    return Err(EngineError::Cancelled);
                }
                Err(e) => return Err(e),
            };

            match handle.decide()? {
                TurnDecision::Continue { turn_index } => {
                    info!(turn_index, "checkpoint, continuing");
                }
                TurnDecision::Finalized { summary } => {
                    let turns = log.list_turns(&session.id)?.len() as u32;
                    info!(turns, "session finalized");
                    return Ok(SessionOutcome {
                        session_id: session.id.clone(),
                        summary,
                        turns,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherConfig;
    use crate::error::ProtocolViolation;
    use crate::tools::create_default_registry;
    use crew_store::sessions::SessionStatus;
    use crew_store::turns::TurnStatus;
    use crew_store::NewSession;
    use crew_stream::{ScriptedSource, ScriptedTurn};
    use serde_json::json;
    use std::time::Duration;

    fn setup(config: RunnerConfig) -> (SessionRunner, TurnLog, SessionRow, PathBuf) {
        let dir = std::env::temp_dir().join(format!("crew_runner_{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let db = Database::in_memory().unwrap();
        let log = TurnLog::new(db.clone());
        let session = log
            .create_session(&NewSession {
                context_type: "workflow_stage".into(),
                context_id: "stage-1".into(),
                agent_role: "execution".into(),
                sandbox_root: dir.display().to_string(),
                alternate_root: None,
                read_only: false,
                group_id: None,
            })
            .unwrap();
        let dispatcher = Arc::new(ToolDispatcher::new(
            Arc::new(create_default_registry(config.edit_feedback())),
            DispatcherConfig::default(),
        ));
        let (tx, _) = broadcast::channel(64);
        (SessionRunner::new(db, dispatcher, config, tx), log, session, dir)
    }

    fn checkpoint(id: &str) -> ScriptedTurn {
        ScriptedTurn::anthropic(None, &[(id, "Checkpoint", json!({}))])
    }

    #[test]
    fn runner_config_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.max_turns, 50);
        assert_eq!(config.context_lines, 3);
        assert_eq!(config.merge_gap, 10);
    }

    #[tokio::test]
    async fn multi_turn_session_edits_and_finalizes() {
        let (runner, log, session, dir) = setup(RunnerConfig::default());
        std::fs::write(dir.join("lib.rs"), "fn old() {}\n").unwrap();
        let source = ScriptedSource::new(
            "anthropic",
            vec![
                ScriptedTurn::anthropic(
                    Some("renaming"),
                    &[
                        (
                            "toolu_1",
                            "Edit",
                            json!({"file_path": "lib.rs", "old_string": "old", "new_string": "new"}),
                        ),
                        ("toolu_2", "Checkpoint", json!({"notes": ["renamed"]})),
                    ],
                ),
                ScriptedTurn::anthropic(None, &[("toolu_3", "Finalize", json!({"summary": "renamed fn"}))]),
            ],
        );

        let outcome = runner
            .run(&session, Vec::new(), &source, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.summary, "renamed fn");
        assert_eq!(outcome.turns, 2);
        assert_eq!(std::fs::read_to_string(dir.join("lib.rs")).unwrap(), "fn new() {}\n");
        assert_eq!(log.session(&session.id).unwrap().status, SessionStatus::Completed);

        let history = log.session_history(&session.id).unwrap();
        let edit = &history[0].invocations[0];
        assert!(edit.output.as_deref().unwrap().contains("Replaced 1 occurrence"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn max_turns_exceeded_fails_session() {
        let (runner, log, session, dir) = setup(RunnerConfig {
            max_turns: 2,
            ..Default::default()
        });
        let source = ScriptedSource::new(
            "anthropic",
            vec![checkpoint("toolu_1"), checkpoint("toolu_2"), checkpoint("toolu_3")],
        );

        let err = runner
            .run(&session, Vec::new(), &source, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MaxTurnsExceeded(2)));
        assert_eq!(source.call_count(), 2);
        let row = log.session(&session.id).unwrap();
        assert_eq!(row.status, SessionStatus::Failed);
        assert!(row.failure_reason.unwrap().contains("max turns"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn violation_leaves_session_resumable() {
        let (runner, log, session, dir) = setup(RunnerConfig::default());
        let source = ScriptedSource::new("anthropic", vec![ScriptedTurn::anthropic_text("forgot")]);

        let err = runner
            .run(&session, Vec::new(), &source, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Protocol(ProtocolViolation::NoTerminalAction)));
        assert_eq!(log.session(&session.id).unwrap().status, SessionStatus::Active);

        let retry = ScriptedSource::new(
            "anthropic",
            vec![ScriptedTurn::anthropic(None, &[("toolu_1", "Finalize", json!({"summary": "ok"}))])],
        );
        let outcome = runner
            .run(&session, Vec::new(), &retry, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.turns, 2);
        let turns = log.list_turns(&session.id).unwrap();
        assert_eq!(turns[0].status, TurnStatus::Failed);
        assert_eq!(turns[1].status, TurnStatus::Completed);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let (runner, log, session, dir) = setup(RunnerConfig::default());
        let source = ScriptedSource::new("anthropic", vec![checkpoint("toolu_1")]);
        let token = CancellationToken::new();
        token.cancel();

        let err = runner.run(&session, Vec::new(), &source, &token).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(source.call_count(), 0);
        let row = log.session(&session.id).unwrap();
        assert_eq!(row.status, SessionStatus::Failed);
        assert_eq!(row.failure_reason.as_deref(), Some("cancelled"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn cancelled_mid_stream_fails_session() {
        let (runner, log, session, dir) = setup(RunnerConfig::default());
        let source = ScriptedSource::new(
            "anthropic",
            vec![checkpoint("toolu_1").paced(Duration::from_millis(40))],
        );
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let err = runner.run(&session, Vec::new(), &source, &token).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        let row = log.session(&session.id).unwrap();
        assert_eq!(row.status, SessionStatus::Failed);
        assert_eq!(row.failure_reason.as_deref(), Some("cancelled"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
