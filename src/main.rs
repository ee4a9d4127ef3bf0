//! # crew
//!
//! Command-line front end: replays recorded provider streams through the
//! session runner, inspects turn history, recovers interrupted sessions and
//! reports on fan-in groups.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{debug, info, warn, Level};

use crew_core::events::AgentEvent;
use crew_core::ids::{GroupId, QuestionId, SessionId};
use crew_core::provider::ChunkSource;
use crew_engine::tools::create_default_registry;
use crew_engine::{
    DispatcherConfig, FanInGate, LoggingTrigger, Orchestrator, ProjectRegistry, RunnerConfig,
    SessionReport, SessionSpec, ToolDispatcher,
};
use crew_store::turns::TurnEntry;
use crew_store::{Database, FanInRepo, QuestionRepo, SessionRepo, SessionStatus, TurnLog};
use crew_stream::Recording;
use crew_telemetry::{crew_home, init_telemetry, LogQuery, TelemetryConfig};

/// Multi-agent session runner.
#[derive(Parser, Debug)]
#[command(name = "crew", about = "Multi-agent session runner")]
struct Cli {
    /// Path to the `SQLite` database.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Default log level (RUST_LOG overrides).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Do not persist warnings to the operator log database.
    #[arg(long, global = true)]
    no_log_db: bool,

    /// Print live session events as JSON lines.
    #[arg(long, global = true)]
    events: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one session against a recorded provider stream.
    Run {
        #[arg(long)]
        recording: PathBuf,
        #[arg(long)]
        root: PathBuf,
        #[arg(long, default_value = "execution")]
        role: String,
        #[arg(long, default_value = "workflow_stage")]
        context_type: String,
        #[arg(long)]
        context_id: String,
        #[arg(long)]
        alternate_root: Option<PathBuf>,
        #[arg(long)]
        read_only: bool,
        #[command(flatten)]
        limits: Limits,
    },
    /// Run a fan-in group of read-only persona sessions, one per `role=recording`.
    Persona {
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        context_id: String,
        #[arg(long = "member", required = true)]
        members: Vec<String>,
        #[command(flatten)]
        limits: Limits,
    },
    /// Print the recorded turns of a session.
    History { session_id: String },
    /// List sessions.
    Sessions {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Resume active sessions left with a streaming turn. Each keeps the
    /// read-only restriction and fan-in group it was created with.
    Recover {
        #[arg(long)]
        recording: PathBuf,
        #[command(flatten)]
        limits: Limits,
    },
    /// Answer or skip a checkpoint question.
    Question {
        #[command(subcommand)]
        action: QuestionAction,
    },
    /// Inspect fan-in groups.
    FanIn {
        #[command(subcommand)]
        action: FanInAction,
    },
    /// Query persisted warnings and errors.
    Logs {
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        group_id: Option<String>,
        #[arg(long)]
        level: Option<String>,
        #[arg(long, default_value = "50")]
        limit: u32,
    },
}

#[derive(Subcommand, Debug)]
enum QuestionAction {
    Answer { question_id: String, answer: String },
    Skip { question_id: String },
    /// Pending questions of a session.
    Pending { session_id: String },
}

#[derive(Subcommand, Debug)]
enum FanInAction {
    /// Every group with its completions.
    Status,
    /// Run the downstream trigger again for a complete group.
    Retry { group_id: String },
}

#[derive(clap::Args, Debug, Clone, Copy)]
struct Limits {
    #[arg(long, default_value = "50")]
    max_turns: u32,
    /// Per-tool timeout in seconds.
    #[arg(long, default_value = "120")]
    tool_timeout: u64,
}

impl Limits {
    fn runner_config(self) -> RunnerConfig {
        RunnerConfig {
            max_turns: self.max_turns,
            ..Default::default()
        }
    }

    fn dispatcher_config(self) -> DispatcherConfig {
        DispatcherConfig {
            tool_timeout: std::time::Duration::from_secs(self.tool_timeout),
            ..Default::default()
        }
    }
}

impl Cli {
    fn default_db_path() -> PathBuf {
        crew_home().join("database").join("crew.db")
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn orchestrator(db: &Database, limits: Limits, print_events: bool) -> Orchestrator {
    let config = limits.runner_config();
    let dispatcher = Arc::new(ToolDispatcher::new(
        Arc::new(create_default_registry(config.edit_feedback())),
        limits.dispatcher_config(),
    ));
    let gate = Arc::new(FanInGate::new(db.clone(), Arc::new(LoggingTrigger)));
    let (events, rx) = broadcast::channel(256);
    tokio::spawn(follow_events(rx, print_events));
    Orchestrator::new(
        db.clone(),
        Arc::new(ProjectRegistry::new()),
        dispatcher,
        config,
        gate,
        events,
    )
}

async fn follow_events(mut rx: broadcast::Receiver<AgentEvent>, print: bool) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                debug!(session_id = %event.session_id(), event = event.event_type(), "agent event");
                if print {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{line}");
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event follower lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn load_source(path: &Path) -> Result<Arc<dyn ChunkSource>> {
    let recording = Recording::load(path)
        .with_context(|| format!("Failed to load recording: {}", path.display()))?;
    Ok(Arc::new(recording.into_source()))
}

fn print_report(report: &SessionReport) {
    match &report.result {
        Ok(outcome) => println!(
            "{} finalized after {} turn(s): {}",
            report.session_id, outcome.turns, outcome.summary
        ),
        Err(e) => println!("{} stopped: {e}", report.session_id),
    }
}

async fn await_report(rx: tokio::sync::oneshot::Receiver<SessionReport>) -> Result<SessionReport> {
    rx.await.context("session task ended without a report")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level: Level = cli
        .log_level
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid log level: {}", cli.log_level))?;
    let db_path = cli.db.clone().unwrap_or_else(Cli::default_db_path);
    ensure_parent_dir(&db_path)?;

    let telemetry_config = TelemetryConfig {
        log_level,
        log_to_sqlite: !cli.no_log_db,
        ..Default::default()
    };
    if telemetry_config.log_to_sqlite {
        ensure_parent_dir(&telemetry_config.log_db_path)?;
    }
    let telemetry = init_telemetry(telemetry_config);

    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
    info!(path = %db_path.display(), "database opened");

    match cli.command {
        Command::Run {
            recording,
            root,
            role,
            context_type,
            context_id,
            alternate_root,
            read_only,
            limits,
        } => {
            let orchestrator = orchestrator(&db, limits, cli.events);
            let (session_id, rx) = orchestrator.spawn(SessionSpec {
                context_type,
                context_id,
                agent_role: role,
                sandbox_root: root,
                alternate_root,
                read_only,
                source: load_source(&recording)?,
            })?;
            info!(session_id = %session_id, "session started");
            let report = await_report(rx).await?;
            print_report(&report);
            orchestrator.shutdown();
            if report.result.is_err() {
                std::process::exit(1);
            }
        }

        Command::Persona {
            root,
            context_id,
            members,
            limits,
        } => {
            let orchestrator = orchestrator(&db, limits, cli.events);
            let mut specs = Vec::with_capacity(members.len());
            for member in &members {
                let Some((role, recording)) = member.split_once('=') else {
                    bail!("member must be role=recording, got {member}");
                };
                specs.push(SessionSpec {
                    context_type: "persona".into(),
                    context_id: context_id.clone(),
                    agent_role: role.to_string(),
                    sandbox_root: root.clone(),
                    alternate_root: None,
                    read_only: true,
                    source: load_source(Path::new(recording))?,
                });
            }
            let group = orchestrator.spawn_persona_group(specs)?;
            println!("group {}", group.group_id);
            for (_, rx) in group.members {
                print_report(&await_report(rx).await?);
            }
            let row = orchestrator.gate().repo().get_group(&group.group_id)?;
            match (&row.triggered_at, &row.last_trigger_error) {
                (Some(at), None) => println!("triggered at {at}"),
                (Some(at), Some(err)) => println!("triggered at {at}, trigger failed: {err}"),
                (None, _) => println!("not triggered"),
            }
            orchestrator.shutdown();
        }

        Command::History { session_id } => {
            let log = TurnLog::new(db.clone());
            let session_id = SessionId::from_raw(session_id);
            let session = log.session(&session_id)?;
            println!(
                "session {} [{}] role={} context={}/{}",
                session.id, session.status, session.agent_role, session.context_type, session.context_id
            );
            if let Some(reason) = &session.failure_reason {
                println!("  failure: {reason}");
            }
            for record in log.session_history(&session_id)? {
                let turn = &record.turn;
                println!(
                    "turn {} [{}] tokens={}",
                    turn.turn_index, turn.status, turn.token_count
                );
                if let Some(reason) = &turn.failure_reason {
                    println!("  failure: {reason}");
                }
                for entry in record.entries() {
                    match entry {
                        TurnEntry::Message(m) => println!("  message: {}", m.content),
                        TurnEntry::Thought(t) => println!("  thought: {}", t.content),
                        TurnEntry::Invocation(i) => {
                            println!("  tool {} [{}] {}", i.name, i.status, i.input);
                            if let Some(output) = &i.output {
                                for line in output.lines() {
                                    println!("    | {line}");
                                }
                            }
                        }
                    }
                }
            }
        }

        Command::Sessions { status, limit } => {
            let status = status
                .map(|s| s.parse::<SessionStatus>().map_err(anyhow::Error::msg))
                .transpose()?;
            for session in SessionRepo::new(db.clone()).list(status, limit, 0)? {
                println!(
                    "{} [{}] {} {}/{} {}",
                    session.id,
                    session.status,
                    session.agent_role,
                    session.context_type,
                    session.context_id,
                    session.created_at
                );
            }
        }

        Command::Recover {
            recording,
            limits,
        } => {
            let log = TurnLog::new(db.clone());
            let orchestrator = orchestrator(&db, limits, cli.events);
            let mut pending = Vec::new();
            for session in SessionRepo::new(db.clone()).list(Some(SessionStatus::Active), u32::MAX, 0)? {
                if log.streaming_turn(&session.id)?.is_none() {
                    continue;
                }
                match orchestrator.resume(&session.id, load_source(&recording)?) {
                    Ok(rx) => pending.push(rx),
                    Err(e) => warn!(session_id = %session.id, error = %e, "could not resume session"),
                }
            }
            if pending.is_empty() {
                println!("No interrupted sessions.");
            }
            for rx in pending {
                print_report(&await_report(rx).await?);
            }
            orchestrator.shutdown();
        }

        Command::Question { action } => {
            let questions = QuestionRepo::new(db.clone());
            match action {
                QuestionAction::Answer {
                    question_id,
                    answer,
                } => {
                    let row = questions.answer(&QuestionId::from_raw(question_id), &answer)?;
                    println!("{} {}", row.id, row.status);
                }
                QuestionAction::Skip { question_id } => {
                    let row = questions.skip(&QuestionId::from_raw(question_id))?;
                    println!("{} {}", row.id, row.status);
                }
                QuestionAction::Pending { session_id } => {
                    for q in questions.pending(&SessionId::from_raw(session_id))? {
                        println!("{} ({}) {}", q.id, q.kind, q.prompt);
                        if !q.options.is_empty() {
                            println!("  options: {}", q.options.join(", "));
                        }
                    }
                }
            }
        }

        Command::FanIn { action } => match action {
            FanInAction::Status => {
                let repo = FanInRepo::new(db.clone());
                for group in repo.list_groups()? {
                    let completions = repo.completions(&group.id)?;
                    println!(
                        "{} {}/{} triggered={}",
                        group.id,
                        completions.len(),
                        group.expected_count,
                        group.triggered_at.as_deref().unwrap_or("-")
                    );
                    if let Some(err) = &group.last_trigger_error {
                        println!("  last trigger error: {err}");
                    }
                    for c in completions {
                        println!("  {} at {}: {}", c.member_id, c.completed_at, c.payload);
                    }
                }
            }
            FanInAction::Retry { group_id } => {
                let gate = FanInGate::new(db.clone(), Arc::new(LoggingTrigger));
                gate.retry_trigger(&GroupId::from_raw(group_id)).await?;
                println!("trigger completed");
            }
        },

        Command::Logs {
            session_id,
            group_id,
            level,
            limit,
        } => {
            let Some(sink) = telemetry.logs() else {
                bail!("operator log database is disabled");
            };
            let records = sink
                .query(&LogQuery {
                    level,
                    session_id,
                    group_id,
                    limit: Some(limit),
                    ..Default::default()
                })
                .context("Failed to query logs")?;
            for r in records {
                println!("{} {} {} {}", r.timestamp, r.level, r.target, r.message);
            }
        }
    }

    Ok(())
}
