pub mod checkpoints;
pub mod database;
pub mod error;
pub mod fan_in;
pub mod questions;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod turns;

pub use checkpoints::{CheckpointRepo, CheckpointView};
pub use database::Database;
pub use error::StoreError;
pub use fan_in::{CompletionOutcome, FanInRepo};
pub use questions::QuestionRepo;
pub use sessions::{NewSession, SessionRepo, SessionStatus};
pub use turns::{NewInvocation, TurnLog, TurnRecord};
