pub mod dispatcher;
pub mod enforcer;
pub mod error;
pub mod fan_in;
pub mod orchestrator;
pub mod positions;
pub mod project_registry;
pub mod registry;
pub mod runner;
pub mod sandbox;
pub mod tools;
pub mod truncate;

pub use dispatcher::{DispatcherConfig, ToolDispatcher};
pub use enforcer::{TurnDecision, TurnHandle, TurnProtocolEnforcer, TurnState};
pub use error::{EngineError, FanInError, ProtocolViolation};
pub use fan_in::{DownstreamTrigger, FanInGate, LoggingTrigger};
pub use orchestrator::{Orchestrator, SessionReport, SessionSpec};
pub use project_registry::{ProjectHandle, ProjectRegistry};
pub use registry::ToolRegistry;
pub use runner::{RunnerConfig, SessionOutcome, SessionRunner};
