use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crew_core::events::AgentEvent;
use crew_core::ids::{GroupId, SessionId};
use crew_core::provider::ChunkSource;
use crew_store::sessions::{SessionRow, SessionStatus};
use crew_store::{Database, NewSession, TurnLog};

use crate::dispatcher::ToolDispatcher;
use crate::error::EngineError;
use crate::fan_in::FanInGate;
use crate::project_registry::{ProjectHandle, ProjectRegistry};
use crate::runner::{RunnerConfig, SessionOutcome, SessionRunner};

/// Everything needed to start a session.
#[derive(Clone)]
pub struct SessionSpec {
    pub context_type: String,
    pub context_id: String,
    pub agent_role: String,
    pub sandbox_root: PathBuf,
    pub alternate_root: Option<PathBuf>,
    /// Restrict the session to read-only tools.
    pub read_only: bool,
    pub source: Arc<dyn ChunkSource>,
}

/// How a spawned session ended.
#[derive(Debug)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub result: Result<SessionOutcome, EngineError>,
}

/// A spawned persona group.
pub struct PersonaGroup {
    pub group_id: GroupId,
    pub members: Vec<(SessionId, oneshot::Receiver<SessionReport>)>,
}

struct SessionHandle {
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

/// Runs sessions concurrently, one task per session.
pub struct Orchestrator {
    db: Database,
    projects: Arc<ProjectRegistry>,
    dispatcher: Arc<ToolDispatcher>,
    read_only_dispatcher: Arc<ToolDispatcher>,
    config: RunnerConfig,
    gate: Arc<FanInGate>,
    events: broadcast::Sender<AgentEvent>,
    sessions: DashMap<SessionId, SessionHandle>,
}

impl Orchestrator {
    pub fn new(
        db: Database,
        projects: Arc<ProjectRegistry>,
        dispatcher: Arc<ToolDispatcher>,
        config: RunnerConfig,
        gate: Arc<FanInGate>,
        events: broadcast::Sender<AgentEvent>,
    ) -> Self {
        let read_only_dispatcher = Arc::new(dispatcher.read_only());
        Self {
            db,
            projects,
            dispatcher,
            read_only_dispatcher,
            config,
            gate,
            events,
            sessions: DashMap::new(),
        }
    }

    pub fn gate(&self) -> &FanInGate {
        &self.gate
    }

    /// Create a session and run it in its own task. The receiver resolves
    /// when the session stops.
    #[instrument(skip(self, spec), fields(role = %spec.agent_role, context_id = %spec.context_id))]
    pub fn spawn(
        &self,
        spec: SessionSpec,
    ) -> Result<(SessionId, oneshot::Receiver<SessionReport>), EngineError> {
        let project = self.projects.get_or_load(&spec.sandbox_root)?;
        let session = self.create(&spec, &project, None)?;
        let session_id = session.id.clone();
        let rx = self.start(session, project.ignore_patterns().to_vec(), spec.source);
        Ok((session_id, rx))
    }

    /// Pick an active session back up, continuing any turn left streaming.
    /// Its read-only restriction and fan-in group come from the stored row.
    #[instrument(skip(self, source), fields(session_id = %session_id))]
    pub fn resume(
        &self,
        session_id: &SessionId,
        source: Arc<dyn ChunkSource>,
    ) -> Result<oneshot::Receiver<SessionReport>, EngineError> {
        if self.sessions.contains_key(session_id) {
            return Err(EngineError::Internal(format!("session {session_id} is already running")));
        }
        let session = TurnLog::new(self.db.clone()).session(session_id)?;
        if session.status != SessionStatus::Active {
            return Err(EngineError::Internal(format!(
                "session {session_id} is {}",
                session.status
            )));
        }
        let project = self.projects.get_or_load(&PathBuf::from(&session.sandbox_root))?;
        Ok(self.start(session, project.ignore_patterns().to_vec(), source))
    }

    /// Run one session per spec, all in one fan-in group. Each member's
    /// finalize summary is recorded as its completion. Every project is
    /// loaded and every session created before any member starts, so a bad
    /// spec leaves nothing running.
    #[instrument(skip(self, specs), fields(members = specs.len()))]
    pub fn spawn_persona_group(&self, specs: Vec<SessionSpec>) -> Result<PersonaGroup, EngineError> {
        let projects = specs
            .iter()
            .map(|spec| self.projects.get_or_load(&spec.sandbox_root))
            .collect::<Result<Vec<_>, _>>()?;

        let group = self.gate.create_group(specs.len() as u32)?;
        info!(group_id = %group.id, "persona group created");

        let log = TurnLog::new(self.db.clone());
        let mut created = Vec::with_capacity(specs.len());
        for (spec, project) in specs.iter().zip(&projects) {
            match self.create(spec, project, Some(&group.id)) {
                Ok(session) => created.push(session),
                Err(e) => {
                    for session in &created {
                        if let Err(fail_err) = log.fail_session(&session.id, "persona group aborted") {
                            warn!(session_id = %session.id, error = %fail_err, "could not fail aborted member");
                        }
                    }
                    return Err(e);
                }
            }
        }

        let members = created
            .into_iter()
            .zip(projects)
            .zip(specs)
            .map(|((session, project), spec)| {
                let session_id = session.id.clone();
                let rx = self.start(session, project.ignore_patterns().to_vec(), spec.source);
                (session_id, rx)
            })
            .collect();

        Ok(PersonaGroup {
            group_id: group.id,
            members,
        })
    }

    fn create(
        &self,
        spec: &SessionSpec,
        project: &ProjectHandle,
        group: Option<&GroupId>,
    ) -> Result<SessionRow, EngineError> {
        Ok(TurnLog::new(self.db.clone()).create_session(&NewSession {
            context_type: spec.context_type.clone(),
            context_id: spec.context_id.clone(),
            agent_role: spec.agent_role.clone(),
            sandbox_root: project.root().display().to_string(),
            alternate_root: spec.alternate_root.as_ref().map(|p| p.display().to_string()),
            read_only: spec.read_only,
            group_id: group.cloned(),
        })?)
    }

    fn start(
        &self,
        session: SessionRow,
        ignore_patterns: Vec<String>,
        source: Arc<dyn ChunkSource>,
    ) -> oneshot::Receiver<SessionReport> {
        let (result_tx, result_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let dispatcher = if session.read_only {
            Arc::clone(&self.read_only_dispatcher)
        } else {
            Arc::clone(&self.dispatcher)
        };
        let runner = SessionRunner::new(self.db.clone(), dispatcher, self.config.clone(), self.events.clone());
        let gate = Arc::clone(&self.gate);
        let events = self.events.clone();
        let session_id = session.id.clone();
        let task_cancel = cancel.clone();

        let join = tokio::spawn(async move {
            let result = runner
                .run(&session, ignore_patterns, source.as_ref(), &task_cancel)
                .await;

            match &result {
                Ok(outcome) => {
                    if let Some(group_id) = &session.group_id {
                        let payload = serde_json::json!({
                            "session_id": outcome.session_id,
                            "role": session.agent_role,
                            "summary": outcome.summary,
                        });
                        match gate
                            .record_completion(group_id, session.id.as_str(), &payload)
                            .await
                        {
                            Ok(completion) if completion.is_triggering_caller => {
                                let _ = events.send(AgentEvent::FanInTriggered {
                                    session_id: session.id.clone(),
                                    group_id: group_id.clone(),
                                });
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!(group_id = %group_id, error = %e, "failed to record completion");
                            }
                        }
                    }
                }
                Err(e) => warn!(session_id = %session.id, error = %e, "session stopped"),
            }

            let _ = result_tx.send(SessionReport {
                session_id: session.id.clone(),
                result,
            });
        });

        self.sessions.insert(session_id, SessionHandle { cancel, join });
        result_rx
    }

    /// Cancel a specific session. An in-flight tool call finishes first.
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        if let Some((_, handle)) = self.sessions.remove(session_id) {
            handle.cancel.cancel();
            true
        } else {
            false
        }
    }

    /// Cancel all running sessions.
    pub fn cancel_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().cancel.cancel();
        }
        self.sessions.clear();
    }

    /// Number of tracked sessions.
    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Stop tracking sessions whose task has finished.
    pub fn cleanup_completed(&self) {
        self.sessions.retain(|_, handle| !handle.join.is_finished());
    }

    /// Cancel everything and close the project registry.
    pub fn shutdown(&self) {
        self.cancel_all();
        self.projects.shutdown();
    }
}
